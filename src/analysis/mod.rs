//! Per-file analysis results.
//!
//! An [`AnalysedFile`] is the record produced by parsing one source file:
//! which modules and symbols it defines, and which it uses. Records are
//! serialised to `.an` files in the prebuild folder, keyed by content hash,
//! so unchanged files are never re-parsed.

pub mod c;
pub mod fortran;

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

pub use c::{AnalysedC, CAnalyser};
pub use fortran::{AnalysedFortran, FortranAnalyser, ParserWorkaround};

/// Analysis result for a single source file, tagged by language.
///
/// Steps downstream of the analyser operate on the shared capability set
/// (path, content hash, defs, deps); only the analyser itself branches on
/// the language.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "language", rename_all = "snake_case")]
pub enum AnalysedFile {
    Fortran(AnalysedFortran),
    C(AnalysedC),
}

impl AnalysedFile {
    pub fn path(&self) -> &Path {
        match self {
            AnalysedFile::Fortran(f) => &f.fpath,
            AnalysedFile::C(c) => &c.fpath,
        }
    }

    pub fn content_hash(&self) -> u64 {
        match self {
            AnalysedFile::Fortran(f) => f.file_hash,
            AnalysedFile::C(c) => c.file_hash,
        }
    }

    /// Modules this file provides. Empty for C.
    pub fn module_defs(&self) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        match self {
            AnalysedFile::Fortran(f) => &f.module_defs,
            AnalysedFile::C(_) => &EMPTY,
        }
    }

    /// Modules this file uses. Empty for C.
    pub fn module_deps(&self) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        match self {
            AnalysedFile::Fortran(f) => &f.module_deps,
            AnalysedFile::C(_) => &EMPTY,
        }
    }

    /// Externally-visible symbols this file provides.
    pub fn symbol_defs(&self) -> &BTreeSet<String> {
        match self {
            AnalysedFile::Fortran(f) => &f.symbol_defs,
            AnalysedFile::C(c) => &c.symbol_defs,
        }
    }

    /// Symbols this file references but does not provide.
    pub fn symbol_deps(&self) -> &BTreeSet<String> {
        match self {
            AnalysedFile::Fortran(f) => &f.symbol_deps,
            AnalysedFile::C(c) => &c.symbol_deps,
        }
    }

    /// Object files named by `! depends on:` pragmas. Empty for C.
    pub fn object_deps(&self) -> &BTreeSet<String> {
        static EMPTY: BTreeSet<String> = BTreeSet::new();
        match self {
            AnalysedFile::Fortran(f) => &f.object_deps,
            AnalysedFile::C(_) => &EMPTY,
        }
    }

    pub fn as_fortran(&self) -> Option<&AnalysedFortran> {
        match self {
            AnalysedFile::Fortran(f) => Some(f),
            AnalysedFile::C(_) => None,
        }
    }

    pub fn as_c(&self) -> Option<&AnalysedC> {
        match self {
            AnalysedFile::C(c) => Some(c),
            AnalysedFile::Fortran(_) => None,
        }
    }

    /// Serialise to the stable `.an` record format.
    ///
    /// All sets are ordered, so serialising the same record always produces
    /// the same bytes.
    pub fn to_record(&self) -> Result<String> {
        serde_json::to_string_pretty(self).context("failed to serialise analysis record")
    }

    /// Deserialise from a `.an` record.
    pub fn from_record(record: &str) -> Result<Self> {
        serde_json::from_str(record).context("failed to deserialise analysis record")
    }

    /// Load an analysis record from disk.
    pub fn load(path: &Path) -> Result<Self> {
        let record = crate::util::fs::read_to_string(path)?;
        Self::from_record(&record)
            .with_context(|| format!("bad analysis record: {}", path.display()))
    }

    /// Save an analysis record to disk.
    pub fn save(&self, path: &Path) -> Result<()> {
        crate::util::fs::write_string(path, &self.to_record()?)
    }
}

/// A path paired with its content fingerprint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HashedFile {
    pub fpath: PathBuf,
    pub file_hash: u64,
}

impl HashedFile {
    pub fn new(fpath: impl Into<PathBuf>, file_hash: u64) -> Self {
        HashedFile {
            fpath: fpath.into(),
            file_hash,
        }
    }
}
