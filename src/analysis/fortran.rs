//! Fortran source analysis.
//!
//! A line scanner over preprocessed free-form source. Continuation lines are
//! joined and comments stripped (after pragma extraction), then each
//! statement is matched against the handful of forms that carry dependency
//! information: `module`, `submodule`, `program`, `subroutine`, `function`,
//! `use`, `call`, `bind(c)` declarations and `! depends on:` comments.
//!
//! A `call` on a one-line `if` statement is not detected; supply
//! `unreferenced_deps` to the analyse step for symbols reached that way.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::util::hash;

/// Analysis result for a single Fortran file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysedFortran {
    pub fpath: PathBuf,
    pub file_hash: u64,
    /// Program names defined here, used for automatic root discovery.
    pub program_defs: BTreeSet<String>,
    pub module_defs: BTreeSet<String>,
    pub symbol_defs: BTreeSet<String>,
    pub module_deps: BTreeSet<String>,
    pub symbol_deps: BTreeSet<String>,
    /// Object files named by `! depends on:` comments, e.g. `f_var.o`.
    /// These attach hand-maintained C objects to a Fortran unit.
    pub object_deps: BTreeSet<String>,
}

impl AnalysedFortran {
    pub fn new(fpath: impl Into<PathBuf>, file_hash: u64) -> Self {
        AnalysedFortran {
            fpath: fpath.into(),
            file_hash,
            program_defs: BTreeSet::new(),
            module_defs: BTreeSet::new(),
            symbol_defs: BTreeSet::new(),
            module_deps: BTreeSet::new(),
            symbol_deps: BTreeSet::new(),
            object_deps: BTreeSet::new(),
        }
    }

    pub fn add_program_def(&mut self, name: &str) {
        self.program_defs.insert(name.to_lowercase());
        self.symbol_defs.insert(name.to_lowercase());
    }

    pub fn add_module_def(&mut self, name: &str) {
        self.module_defs.insert(name.to_lowercase());
    }

    pub fn add_symbol_def(&mut self, name: &str) {
        self.symbol_defs.insert(name.to_lowercase());
    }

    pub fn add_module_dep(&mut self, name: &str) {
        self.module_deps.insert(name.to_lowercase());
    }

    pub fn add_symbol_dep(&mut self, name: &str) {
        self.symbol_deps.insert(name.to_lowercase());
    }

    /// The module files this unit is expected to produce.
    pub fn mod_filenames(&self) -> Vec<String> {
        self.module_defs.iter().map(|m| format!("{m}.mod")).collect()
    }
}

/// Hand-written analysis results for a file the scanner cannot handle.
///
/// The analyse step inserts these verbatim in place of parsing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ParserWorkaround {
    pub fpath: PathBuf,
    pub module_defs: BTreeSet<String>,
    pub symbol_defs: BTreeSet<String>,
    pub module_deps: BTreeSet<String>,
    pub symbol_deps: BTreeSet<String>,
    pub object_deps: BTreeSet<String>,
}

impl ParserWorkaround {
    pub fn new(fpath: impl Into<PathBuf>) -> Self {
        ParserWorkaround {
            fpath: fpath.into(),
            ..Default::default()
        }
    }

    /// Convert into an analysis result, hashing the file on disk.
    pub fn into_analysed(self) -> Result<AnalysedFortran> {
        let file_hash = hash::file_fingerprint(&self.fpath)?;
        let mut af = AnalysedFortran::new(self.fpath, file_hash);
        for m in &self.module_defs {
            af.add_module_def(m);
        }
        for s in &self.symbol_defs {
            af.add_symbol_def(s);
        }
        for m in &self.module_deps {
            af.add_module_dep(m);
        }
        for s in &self.symbol_deps {
            af.add_symbol_dep(s);
        }
        af.object_deps = self.object_deps;
        Ok(af)
    }
}

/// Intrinsic modules which never become dependencies.
pub fn default_intrinsic_modules() -> BTreeSet<String> {
    [
        "iso_c_binding",
        "iso_fortran_env",
        "ieee_arithmetic",
        "ieee_exceptions",
        "ieee_features",
        "omp_lib",
        "omp_lib_kinds",
    ]
    .into_iter()
    .map(str::to_string)
    .collect()
}

static MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^module\s+([a-z][a-z0-9_]*)\s*$").unwrap());
static SUBMODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^submodule\s*\(\s*([a-z][a-z0-9_]*)").unwrap());
static END_MODULE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^end\s*(?:sub)?module\b").unwrap());
static PROGRAM_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^program\s+([a-z][a-z0-9_]*)\s*$").unwrap());
static INTERFACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:abstract\s+)?interface\b").unwrap());
static END_INTERFACE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^end\s*interface\b").unwrap());
static USE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^use\s*(,\s*intrinsic\s*)?(?:::)?\s*([a-z][a-z0-9_]*)").unwrap()
});
static SUBROUTINE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:(?:pure|impure|elemental|recursive|module)\s+)*subroutine\s+([a-z][a-z0-9_]*)")
        .unwrap()
});
static FUNCTION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(?:(?:pure|impure|elemental|recursive|module)\s+|(?:integer|real|logical|complex|character|double\s+precision|type|class)\s*(?:\([^)]*\))?\s+)*function\s+([a-z][a-z0-9_]*)",
    )
    .unwrap()
});
static CALL_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(?:\d+\s+)?call\s+([a-z][a-z0-9_]*)\s*(?:\(|$)").unwrap());
static BIND_C_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"bind\s*\(\s*c\s*(?:,\s*name\s*=\s*["']([^"']*)["']\s*)?\)"#).unwrap()
});
static TYPE_DECL_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(?:integer|real|logical|complex|character|double\s+precision|type\s*\()").unwrap()
});
static DEPENDS_ON_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)depends\s*on\s*:\s*([a-zA-Z0-9_.]+)").unwrap());

/// Identifies symbol definitions and dependencies in a Fortran file.
pub struct FortranAnalyser {
    intrinsic_modules: BTreeSet<String>,
}

impl Default for FortranAnalyser {
    fn default() -> Self {
        FortranAnalyser {
            intrinsic_modules: default_intrinsic_modules(),
        }
    }
}

impl FortranAnalyser {
    pub fn new(intrinsic_modules: BTreeSet<String>) -> Self {
        FortranAnalyser { intrinsic_modules }
    }

    /// Analyse a file on disk, hashing its contents.
    pub fn run(&self, fpath: &Path) -> Result<AnalysedFortran> {
        let source = crate::util::fs::read_to_string(fpath)
            .with_context(|| format!("could not parse {}", fpath.display()))?;
        let file_hash = hash::bytes_fingerprint(source.as_bytes());
        Ok(self.analyse_source(fpath, file_hash, &source))
    }

    /// Analyse already-loaded source.
    pub fn analyse_source(&self, fpath: &Path, file_hash: u64, source: &str) -> AnalysedFortran {
        let mut af = AnalysedFortran::new(fpath, file_hash);

        let mut in_module = false;
        let mut in_interface = false;

        for stmt in logical_lines(source) {
            // pragma comments carry dependencies, ordinary comments don't
            for comment in &stmt.comments {
                if let Some(caps) = DEPENDS_ON_RE.captures(comment) {
                    let dep = caps[1].to_string();
                    if let Some(stem) = dep.strip_suffix(".o") {
                        af.object_deps.insert(format!("{}.o", stem.to_lowercase()));
                    } else {
                        af.add_symbol_dep(&dep);
                    }
                }
            }

            let code = stmt.code.trim().to_lowercase();
            if code.is_empty() {
                continue;
            }

            if END_INTERFACE_RE.is_match(&code) {
                in_interface = false;
            } else if INTERFACE_RE.is_match(&code) {
                in_interface = true;
            } else if END_MODULE_RE.is_match(&code) {
                in_module = false;
            } else if let Some(caps) = MODULE_RE.captures(&code) {
                af.add_module_def(&caps[1]);
                in_module = true;
            } else if let Some(caps) = SUBMODULE_RE.captures(&code) {
                // a submodule depends on its parent's module file
                af.add_module_dep(&caps[1]);
                in_module = true;
            } else if let Some(caps) = PROGRAM_RE.captures(&code) {
                af.add_program_def(&caps[1]);
            } else if let Some(caps) = USE_RE.captures(&code) {
                let name = caps.get(2).map(|m| m.as_str()).unwrap_or_default();
                let declared_intrinsic = caps.get(1).is_some();
                if !declared_intrinsic && !self.intrinsic_modules.contains(name) {
                    af.add_module_dep(name);
                }
            } else if let Some(caps) = SUBROUTINE_RE.captures(&code) {
                self.process_procedure(&mut af, &caps[1], &code, in_module, in_interface);
            } else if let Some(caps) = FUNCTION_RE.captures(&code) {
                self.process_procedure(&mut af, &caps[1], &code, in_module, in_interface);
            } else if let Some(caps) = CALL_RE.captures(&code) {
                af.add_symbol_dep(&caps[1]);
            } else if TYPE_DECL_RE.is_match(&code) && code.contains("::") {
                // variables exported to C via bind(c)
                if let Some(caps) = BIND_C_RE.captures(&code) {
                    match caps.get(1) {
                        Some(name) if !name.as_str().is_empty() => {
                            af.add_symbol_def(name.as_str());
                        }
                        _ => {
                            for entity in declared_entities(&code) {
                                af.add_symbol_def(&entity);
                            }
                        }
                    }
                }
            }
        }

        af
    }

    fn process_procedure(
        &self,
        af: &mut AnalysedFortran,
        fortran_name: &str,
        code: &str,
        in_module: bool,
        in_interface: bool,
    ) {
        if let Some(caps) = BIND_C_RE.captures(code) {
            let bind_name = match caps.get(1) {
                Some(name) if !name.as_str().is_empty() => name.as_str().to_string(),
                _ => fortran_name.to_string(),
            };

            if in_interface {
                // importing a C function into Fortran
                af.add_symbol_dep(&bind_name);
            } else {
                // exporting from Fortran to C
                af.add_symbol_def(&bind_name);
            }
            return;
        }

        // procedures inside a module are reached via the module,
        // interface bodies are declarations not definitions
        if !in_module && !in_interface {
            af.add_symbol_def(fortran_name);
        }
    }
}

/// One logical source line: continuation-joined code plus any comments that
/// were attached to its physical lines.
struct LogicalLine {
    code: String,
    comments: Vec<String>,
}

/// Split source into logical lines, joining `&` continuations and splitting
/// comments off (without losing them, since pragmas live there).
fn logical_lines(source: &str) -> Vec<LogicalLine> {
    let mut lines = Vec::new();
    let mut pending: Option<LogicalLine> = None;

    for raw in source.lines() {
        let (code_part, comment) = split_comment(raw);
        let mut code = code_part.trim();

        let mut current = pending.take().unwrap_or(LogicalLine {
            code: String::new(),
            comments: Vec::new(),
        });

        if let Some(c) = comment {
            current.comments.push(c);
        }

        // a leading '&' continues the previous line's token stream
        if let Some(stripped) = code.strip_prefix('&') {
            code = stripped.trim_start();
        }

        if !current.code.is_empty() {
            current.code.push(' ');
        }
        current.code.push_str(code);

        if current.code.ends_with('&') {
            current.code.pop();
            let end = current.code.trim_end().len();
            current.code.truncate(end);
            pending = Some(current);
        } else {
            lines.push(current);
        }
    }

    if let Some(last) = pending {
        lines.push(last);
    }

    lines
}

/// Split a physical line into code and comment, honouring quoted strings.
fn split_comment(line: &str) -> (&str, Option<String>) {
    let mut in_single = false;
    let mut in_double = false;

    for (i, ch) in line.char_indices() {
        match ch {
            '\'' if !in_double => in_single = !in_single,
            '"' if !in_single => in_double = !in_double,
            '!' if !in_single && !in_double => {
                return (&line[..i], Some(line[i + 1..].trim().to_string()));
            }
            _ => {}
        }
    }

    (line, None)
}

/// Entity names declared after `::` in a type declaration.
fn declared_entities(code: &str) -> Vec<String> {
    let Some(rhs) = code.split("::").nth(1) else {
        return Vec::new();
    };

    rhs.split(',')
        .filter_map(|entity| {
            let name: String = entity
                .trim()
                .chars()
                .take_while(|c| c.is_ascii_alphanumeric() || *c == '_')
                .collect();
            if name.is_empty() {
                None
            } else {
                Some(name)
            }
        })
        .collect()
}
