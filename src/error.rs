//! Build error taxonomy.
//!
//! Item-level failures inside a step are collected and aggregated so that one
//! bad file does not hide the others; the step then surfaces a single
//! [`BuildError::Aggregate`] naming every offender.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

/// Any error a build run can produce.
#[derive(Debug, Error)]
pub enum BuildError {
    /// Missing mandatory field, unresolvable tool, bad workspace path.
    /// Surfaced before any step runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// Filesystem read/write failure, fatal for the item it occurred on.
    #[error("{}: {detail:#}", path.display())]
    Io { path: PathBuf, detail: anyhow::Error },

    /// An external tool (preprocessor, compiler, linker) returned non-zero.
    #[error("{stage} failed for {}:\n{stderr}", path.display())]
    ToolFailure {
        stage: &'static str,
        path: PathBuf,
        stderr: String,
    },

    /// The analyser could not parse a source file and no workaround covers it.
    #[error("could not parse {}", path.display())]
    Parse { path: PathBuf },

    /// Two files define the same module or externally-visible symbol.
    #[error("duplicate symbol '{name}' defined in {} already found in {}", second.display(), first.display())]
    DuplicateDefinition {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    /// No analysed file defines a requested root symbol.
    #[error("no file defines the root symbol '{0}'")]
    RootNotFound(String),

    /// A strongly connected component of more than one file.
    #[error("dependency cycle between: {}", display_paths(.0))]
    CycleDetected(Vec<PathBuf>),

    /// The compile scheduler could not advance a wave.
    #[error("nothing more can be compiled due to unfulfilled dependencies:\n{}", display_paths(.0))]
    CompileStalled(Vec<PathBuf>),

    /// A file could not be compiled because an upstream dependency failed.
    #[error("{} blocked by failed dependency {}", path.display(), blocked_by.display())]
    BlockedBy { path: PathBuf, blocked_by: PathBuf },

    /// The linker returned non-zero for a build target.
    #[error("linking failed for '{root}':\n{stderr}")]
    LinkFailed { root: String, stderr: String },

    /// A step asked the artefact store for a collection nobody created.
    #[error("missing artefact collection '{0}'")]
    MissingCollection(&'static str),

    /// A step asked the artefact store for a collection of the wrong shape.
    #[error("artefact collection '{0}' holds a different kind of value")]
    WrongCollectionKind(&'static str),

    /// One or more item-level failures, reported together at step end.
    #[error("{}", display_aggregate(.0))]
    Aggregate(Vec<BuildError>),
}

impl BuildError {
    /// Process exit code for this error: 2 for configuration problems,
    /// 1 for everything else.
    pub fn exit_code(&self) -> i32 {
        match self {
            BuildError::Config(_) => 2,
            BuildError::Aggregate(errors) if errors.iter().all(|e| e.exit_code() == 2) => 2,
            _ => 1,
        }
    }

    pub fn io(path: impl Into<PathBuf>, detail: anyhow::Error) -> Self {
        BuildError::Io {
            path: path.into(),
            detail,
        }
    }
}

fn display_paths(paths: &[PathBuf]) -> String {
    paths
        .iter()
        .map(|p| format!("    {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n")
}

fn display_aggregate(errors: &[BuildError]) -> String {
    let mut out = String::new();
    for err in errors {
        out.push_str(&format!("{err}\n\n"));
    }
    out.push_str(&format!("{} error(s) found", errors.len()));
    out
}

/// Convenience alias used throughout the step layer.
pub type BuildResult<T> = Result<T, BuildError>;

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitStatus::Success => write!(f, "success"),
            ExitStatus::BuildFailed => write!(f, "build failed"),
            ExitStatus::ConfigError => write!(f, "configuration error"),
        }
    }
}

/// Outcome of an orchestrating process, for callers that drive the build
/// from their own entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitStatus {
    Success,
    BuildFailed,
    ConfigError,
}

impl ExitStatus {
    pub fn code(self) -> i32 {
        match self {
            ExitStatus::Success => 0,
            ExitStatus::BuildFailed => 1,
            ExitStatus::ConfigError => 2,
        }
    }
}

impl From<&BuildResult<()>> for ExitStatus {
    fn from(result: &BuildResult<()>) -> Self {
        match result {
            Ok(()) => ExitStatus::Success,
            Err(e) if e.exit_code() == 2 => ExitStatus::ConfigError,
            Err(_) => ExitStatus::BuildFailed,
        }
    }
}
