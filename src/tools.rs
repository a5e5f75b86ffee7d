//! External tool identities and managed flags.
//!
//! Tool invocations themselves belong to the steps; this module knows which
//! tools exist, how the environment names them, and which of their flags the
//! build must own. Environment variables may carry embedded flags
//! (`FC="gfortran -c"`); these are split into program and flag list.

use std::path::Path;

use anyhow::{Context, Result};

use crate::util::process::ProcessBuilder;

/// An external program plus the flags it was configured with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tool {
    pub exe: String,
    pub flags: Vec<String>,
}

impl Tool {
    pub fn new(exe: impl Into<String>) -> Self {
        Tool {
            exe: exe.into(),
            flags: Vec::new(),
        }
    }

    /// Parse a command string of the `gfortran -c` sort.
    pub fn from_command(command: &str) -> Option<Self> {
        let mut parts = command.split_whitespace();
        let exe = parts.next()?.to_string();
        Some(Tool {
            exe,
            flags: parts.map(str::to_string).collect(),
        })
    }

    /// Resolve a tool from an environment variable, falling back to a
    /// default program name.
    pub fn from_env(var: &str, default_exe: &str) -> Self {
        std::env::var(var)
            .ok()
            .as_deref()
            .and_then(Tool::from_command)
            .unwrap_or_else(|| Tool::new(default_exe))
    }

    /// Append a flag unless an equivalent is already present.
    pub fn ensure_flag(&mut self, flag: &str) {
        if !self.flags.iter().any(|f| f == flag) {
            self.flags.push(flag.to_string());
        }
    }

    /// The program's base name, for registry lookups.
    pub fn base_name(&self) -> String {
        Path::new(&self.exe)
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| self.exe.clone())
    }

    /// Ask the tool for its version. The first version-shaped token of the
    /// first output line.
    pub fn version(&self) -> Result<String> {
        let output = ProcessBuilder::new(&self.exe)
            .arg("--version")
            .exec()
            .with_context(|| format!("could not run `{} --version`", self.exe))?;

        if !output.status.success() {
            anyhow::bail!("`{} --version` returned non-zero", self.exe);
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let first_line = stdout.lines().next().unwrap_or_default();
        let version = first_line
            .split_whitespace()
            .find(|token| {
                token.chars().next().is_some_and(|c| c.is_ascii_digit()) && token.contains('.')
            })
            .unwrap_or(first_line)
            .to_string();

        Ok(version)
    }
}

/// Flag-splitting for env vars like `FFLAGS` and `LFLAGS`.
pub fn env_flags(var: &str) -> Vec<String> {
    std::env::var(var)
        .map(|v| v.split_whitespace().map(str::to_string).collect())
        .unwrap_or_default()
}

/// A compiler whose flags the build manages.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KnownCompiler {
    pub exe: &'static str,
    pub compile_flag: &'static str,
    pub module_folder_flag: &'static str,
}

/// Compilers with managed flags. All modules must land in one flat folder,
/// so the module-output flag is owned by the build, never the user.
pub const COMPILERS: &[KnownCompiler] = &[
    KnownCompiler {
        exe: "gfortran",
        compile_flag: "-c",
        module_folder_flag: "-J",
    },
    KnownCompiler {
        exe: "ifort",
        compile_flag: "-c",
        module_folder_flag: "-module",
    },
];

/// Look up a compiler by program base name.
pub fn known_compiler(exe: &str) -> Option<&'static KnownCompiler> {
    let base = Path::new(exe)
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| exe.to_string());
    COMPILERS.iter().find(|c| c.exe == base)
}

/// Strip flags the build manages itself from a user flag list, with a
/// notification. Handles both `-J path` and `-Jpath` spellings.
pub fn remove_managed_flags(compiler: &KnownCompiler, flags: &[String]) -> Vec<String> {
    let mut result = Vec::new();
    let mut iter = flags.iter().peekable();

    while let Some(flag) = iter.next() {
        if flag == compiler.compile_flag {
            tracing::info!("removing managed flag {} for {}", flag, compiler.exe);
            continue;
        }
        if flag == compiler.module_folder_flag {
            tracing::info!(
                "removing managed flag {} {} for {}",
                flag,
                iter.peek().map(|s| s.as_str()).unwrap_or_default(),
                compiler.exe
            );
            iter.next(); // the folder argument
            continue;
        }
        if let Some(rest) = flag.strip_prefix(compiler.module_folder_flag) {
            if !rest.is_empty() && !rest.starts_with('-') {
                tracing::info!("removing managed flag {} for {}", flag, compiler.exe);
                continue;
            }
        }
        result.push(flag.clone());
    }

    result
}
