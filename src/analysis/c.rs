//! C source analysis.
//!
//! Works over the pragma-annotated stream produced by the pragma injector
//! and the C preprocessor: `#pragma fab` markers bracket the regions that
//! came from system and user includes. System regions are skipped entirely;
//! declarations in user-include regions become candidate dependencies;
//! definitions with external linkage in the file's own code become symbol
//! definitions.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use anyhow::{Context, Result};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::util::hash;

/// Analysis result for a single C file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnalysedC {
    pub fpath: PathBuf,
    pub file_hash: u64,
    pub symbol_defs: BTreeSet<String>,
    pub symbol_deps: BTreeSet<String>,
}

impl AnalysedC {
    pub fn new(fpath: impl Into<PathBuf>, file_hash: u64) -> Self {
        AnalysedC {
            fpath: fpath.into(),
            file_hash,
            symbol_defs: BTreeSet::new(),
            symbol_deps: BTreeSet::new(),
        }
    }

    pub fn add_symbol_def(&mut self, name: &str) {
        self.symbol_defs.insert(name.to_string());
    }

    pub fn add_symbol_dep(&mut self, name: &str) {
        self.symbol_deps.insert(name.to_string());
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Region {
    Code,
    UsrInclude,
    SysInclude,
}

static PRAGMA_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\s*#\s*pragma\s+fab\s+(sys|usr)include(start|end)\s*$").unwrap()
});
static SIGNATURE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?:^|[\s\*])([a-zA-Z_][a-zA-Z0-9_]*)\s*\(").unwrap()
});
static IDENT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"[a-zA-Z_][a-zA-Z0-9_]*").unwrap());

const KEYWORDS: &[&str] = &[
    "auto", "break", "case", "char", "const", "continue", "default", "do", "double", "else",
    "enum", "extern", "float", "for", "goto", "if", "inline", "int", "long", "register",
    "restrict", "return", "short", "signed", "sizeof", "static", "struct", "switch", "typedef",
    "union", "unsigned", "void", "volatile", "while",
];

/// Identifies symbol definitions and dependencies in a C file.
#[derive(Default)]
pub struct CAnalyser;

impl CAnalyser {
    /// Analyse a file on disk, hashing its contents.
    pub fn run(&self, fpath: &Path) -> Result<AnalysedC> {
        let source = crate::util::fs::read_to_string(fpath)
            .with_context(|| format!("could not parse {}", fpath.display()))?;
        let file_hash = hash::bytes_fingerprint(source.as_bytes());
        Ok(self.analyse_source(fpath, file_hash, &source))
    }

    /// Analyse already-loaded source.
    pub fn analyse_source(&self, fpath: &Path, file_hash: u64, source: &str) -> AnalysedC {
        let mut ac = AnalysedC::new(fpath, file_hash);

        // symbols declared in user includes or as extern stubs; references to
        // these from the file's own code are project-internal dependencies
        let mut candidates: BTreeSet<String> = BTreeSet::new();
        let mut referenced: BTreeSet<String> = BTreeSet::new();

        let mut region = Region::Code;
        let mut region_stack: Vec<Region> = Vec::new();
        let mut depth: usize = 0;
        // declaration text accumulated since the last `;`, `{` or `}`
        let mut pending = String::new();

        for raw in strip_comments(source).lines() {
            let lowered = raw.to_lowercase();
            if let Some(caps) = PRAGMA_RE.captures(&lowered) {
                match (&caps[1], &caps[2]) {
                    ("sys", "start") => {
                        region_stack.push(region);
                        region = Region::SysInclude;
                    }
                    ("usr", "start") => {
                        region_stack.push(region);
                        region = Region::UsrInclude;
                    }
                    _ => region = region_stack.pop().unwrap_or(Region::Code),
                }
                continue;
            }

            if region == Region::SysInclude {
                continue;
            }

            for ch in raw.chars() {
                match ch {
                    '{' => {
                        if depth == 0 {
                            // a signature followed by a body is a definition
                            if region == Region::Code {
                                if let Some(name) = signature_name(&pending) {
                                    let is_static =
                                        pending.split_whitespace().any(|w| w == "static");
                                    if !is_static {
                                        ac.add_symbol_def(&name);
                                    }
                                }
                            }
                            pending.clear();
                        }
                        depth += 1;
                    }
                    '}' => {
                        depth = depth.saturating_sub(1);
                        pending.clear();
                    }
                    ';' => {
                        if depth == 0 {
                            // prototype or extern stub, not a definition
                            if let Some(name) = signature_name(&pending) {
                                candidates.insert(name);
                            } else if region == Region::UsrInclude || pending.contains("extern") {
                                if let Some(name) = last_identifier(&pending) {
                                    candidates.insert(name);
                                }
                            }
                            pending.clear();
                        } else if region == Region::Code {
                            collect_identifiers(&pending, &mut referenced);
                            pending.clear();
                        }
                    }
                    _ => pending.push(ch),
                }
            }
            pending.push(' ');
        }

        // a reference is a dependency when something else declared it
        for name in referenced {
            if candidates.contains(&name) && !ac.symbol_defs.contains(&name) {
                ac.add_symbol_dep(&name);
            }
        }

        ac
    }
}

/// The function name from a declaration like `int foo(void)`, if it looks
/// like one.
fn signature_name(decl: &str) -> Option<String> {
    let head = decl.split('(').next()?;
    if head.trim().is_empty() {
        return None;
    }
    let caps = SIGNATURE_RE.captures(decl)?;
    let name = caps[1].to_string();
    if KEYWORDS.contains(&name.as_str()) {
        return None;
    }
    // a bare call like `foo(x)` has no declaration specifiers before the name
    let before = &decl[..caps.get(1).unwrap().start()];
    if before.trim().is_empty() {
        return None;
    }
    Some(name)
}

/// The last identifier in a declaration, e.g. the variable in `extern int x`.
fn last_identifier(decl: &str) -> Option<String> {
    IDENT_RE
        .find_iter(decl)
        .map(|m| m.as_str().to_string())
        .filter(|name| !KEYWORDS.contains(&name.as_str()))
        .last()
}

fn collect_identifiers(code: &str, into: &mut BTreeSet<String>) {
    for m in IDENT_RE.find_iter(code) {
        let name = m.as_str();
        if !KEYWORDS.contains(&name) {
            into.insert(name.to_string());
        }
    }
}

/// Remove `//` and `/* */` comments and string literal contents.
fn strip_comments(source: &str) -> String {
    let mut out = String::with_capacity(source.len());
    let mut chars = source.chars().peekable();
    let mut in_string = false;
    let mut in_char = false;

    while let Some(ch) = chars.next() {
        if in_string {
            if ch == '\\' {
                chars.next();
            } else if ch == '"' {
                in_string = false;
                out.push('"');
            }
            continue;
        }
        if in_char {
            if ch == '\\' {
                chars.next();
            } else if ch == '\'' {
                in_char = false;
                out.push('\'');
            }
            continue;
        }

        match ch {
            '"' => {
                in_string = true;
                out.push('"');
            }
            '\'' => {
                in_char = true;
                out.push('\'');
            }
            '/' if chars.peek() == Some(&'/') => {
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            '/' if chars.peek() == Some(&'*') => {
                chars.next();
                let mut prev = ' ';
                for c in chars.by_ref() {
                    if c == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && c == '/' {
                        break;
                    }
                    prev = c;
                }
            }
            _ => out.push(ch),
        }
    }

    out
}
