//! The content-addressed prebuild cache.
//!
//! A flat folder of immutable entries named `<stem>.<hex-hash>.<suffix>`.
//! The hash discriminates variants of the same logical artefact, so the
//! filename is the sole index: existence is a cache hit. Entries may have
//! been written by another user's build over the same source; writes go via
//! a temporary sibling plus rename, so concurrent writers cannot corrupt
//! readers and the last writer wins.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, SystemTime};

use anyhow::{Context, Result};

use crate::util::fs::ensure_dir;

/// Name of the cache folder below `build_output`.
pub const PREBUILD_FOLDER: &str = "_prebuild";

/// A parsed prebuild filename.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PrebuildName {
    pub stem: String,
    pub hash: u64,
    pub suffix: String,
}

impl PrebuildName {
    pub fn new(stem: &str, hash: u64, suffix: &str) -> Self {
        PrebuildName {
            stem: stem.to_string(),
            hash,
            suffix: suffix.to_string(),
        }
    }

    /// Parse `STEM '.' HEX-HASH '.' SUFFIX`. The stem may itself contain
    /// dots, so the hash and suffix are taken from the right.
    pub fn parse(file_name: &str) -> Option<Self> {
        let mut parts = file_name.rsplitn(3, '.');
        let suffix = parts.next()?;
        let hex = parts.next()?;
        let stem = parts.next()?;

        if stem.is_empty() || suffix.is_empty() {
            return None;
        }
        // lowercase hex only; `from_str_radix` alone would accept '+' and 'A'
        if hex.is_empty()
            || !hex
                .chars()
                .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase())
        {
            return None;
        }
        let hash = u64::from_str_radix(hex, 16).ok()?;

        Some(PrebuildName::new(stem, hash, suffix))
    }

    pub fn file_name(&self) -> String {
        format!("{}.{:x}.{}", self.stem, self.hash, self.suffix)
    }
}

/// The cache folder, plus a record of every entry this run touched.
///
/// Shared by reference across compile workers; access tracking is the only
/// interior state and sits behind a mutex.
#[derive(Debug)]
pub struct PrebuildCache {
    folder: PathBuf,
    accessed: Mutex<BTreeSet<PathBuf>>,
}

impl PrebuildCache {
    pub fn new(folder: impl Into<PathBuf>) -> Result<Self> {
        let folder = folder.into();
        ensure_dir(&folder)?;
        Ok(PrebuildCache {
            folder,
            accessed: Mutex::new(BTreeSet::new()),
        })
    }

    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// The canonical path for an entry, whether or not it exists. Callers
    /// which produce output directly at this path must follow with
    /// [`PrebuildCache::mark_current`].
    pub fn entry_path(&self, stem: &str, hash: u64, suffix: &str) -> PathBuf {
        self.folder
            .join(PrebuildName::new(stem, hash, suffix).file_name())
    }

    /// Check for a specific variant; a hit records the entry as current.
    pub fn lookup(&self, stem: &str, hash: u64, suffix: &str) -> Option<PathBuf> {
        let path = self.entry_path(stem, hash, suffix);
        if path.exists() {
            self.mark_current(&path);
            Some(path)
        } else {
            None
        }
    }

    /// Copy an already-produced file into the cache under its canonical
    /// name. Atomic: written to a temporary sibling, then renamed.
    pub fn store(&self, source: &Path, stem: &str, hash: u64, suffix: &str) -> Result<PathBuf> {
        let target = self.entry_path(stem, hash, suffix);

        let tmp = tempfile::NamedTempFile::new_in(&self.folder)
            .with_context(|| format!("failed to create temp file in {}", self.folder.display()))?;
        std::fs::copy(source, tmp.path())
            .with_context(|| format!("failed to copy {} into cache", source.display()))?;
        tmp.persist(&target)
            .with_context(|| format!("failed to move cache entry into place: {}", target.display()))?;

        self.mark_current(&target);
        Ok(target)
    }

    /// Copy a cached entry out to a working path.
    pub fn recover(&self, stem: &str, hash: u64, suffix: &str, dest: &Path) -> Result<()> {
        let source = self.entry_path(stem, hash, suffix);
        crate::util::fs::copy_file(&source, dest)
            .with_context(|| format!("failed to recover prebuild {}", source.display()))?;
        self.mark_current(&source);
        Ok(())
    }

    /// Record an entry as used by the current run, protecting it from the
    /// default housekeeping sweep.
    pub fn mark_current(&self, path: &Path) {
        self.accessed.lock().unwrap().insert(path.to_path_buf());
    }

    /// Entries the current run has touched.
    pub fn current(&self) -> BTreeSet<PathBuf> {
        self.accessed.lock().unwrap().clone()
    }

    /// Every file currently in the cache folder, sorted.
    pub fn entries(&self) -> Result<Vec<PathBuf>> {
        let mut entries = Vec::new();
        for entry in std::fs::read_dir(&self.folder)
            .with_context(|| format!("failed to read cache folder {}", self.folder.display()))?
        {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                entries.push(entry.path());
            }
        }
        entries.sort();
        Ok(entries)
    }

    /// Delete every entry the current run did not touch. Returns the number
    /// removed.
    pub fn sweep_unused(&self) -> Result<usize> {
        let current = self.current();
        let mut removed = 0;

        for path in self.entries()? {
            if !current.contains(&path) {
                tracing::info!("removing unused prebuild {}", path.display());
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Delete every entry whose last-modified age exceeds `older_than`,
    /// regardless of whether this run touched it. Returns the number
    /// removed.
    pub fn sweep_older_than(&self, older_than: Duration) -> Result<usize> {
        let now = SystemTime::now();
        let mut removed = 0;

        for path in self.entries()? {
            let modified = path
                .metadata()
                .and_then(|m| m.modified())
                .with_context(|| format!("failed to stat {}", path.display()))?;

            let age = now.duration_since(modified).unwrap_or(Duration::ZERO);
            if age > older_than {
                tracing::info!("removing old prebuild {}", path.display());
                std::fs::remove_file(&path)
                    .with_context(|| format!("failed to remove {}", path.display()))?;
                removed += 1;
            }
        }

        Ok(removed)
    }
}
