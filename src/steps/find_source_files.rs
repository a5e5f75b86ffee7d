//! Source discovery.
//!
//! Walks the source root, applies ordered include/exclude filters, and
//! populates the initial file collections: everything found goes into
//! `INITIAL_SOURCE`, and the language groups are split out by suffix into
//! `FORTRAN_BUILD_FILES`, `C_BUILD_FILES` and `X90_BUILD_FILES`.

use std::path::PathBuf;

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::steps::Step;
use crate::store::{self, ArtefactStore};
use crate::util::fs::file_walk;

/// A path filter deciding inclusion by simple containment match.
/// Order matters: the last filter with an opinion wins.
#[derive(Debug, Clone)]
pub struct PathFilter {
    filter_strings: Vec<String>,
    include: bool,
}

impl PathFilter {
    /// Include paths containing any of the given strings.
    pub fn include(filter_strings: &[&str]) -> Self {
        PathFilter {
            filter_strings: filter_strings.iter().map(|s| s.to_string()).collect(),
            include: true,
        }
    }

    /// Exclude paths containing any of the given strings.
    pub fn exclude(filter_strings: &[&str]) -> Self {
        PathFilter {
            filter_strings: filter_strings.iter().map(|s| s.to_string()).collect(),
            include: false,
        }
    }

    /// This filter's opinion on a path, if it has one.
    fn check(&self, path: &std::path::Path) -> Option<bool> {
        let path_str = path.to_string_lossy();
        if self.filter_strings.iter().any(|f| path_str.contains(f)) {
            Some(self.include)
        } else {
            None
        }
    }
}

/// Find the files in the source folder, with filtering.
///
/// Every file is included by default, unless the filters say otherwise.
pub struct FindSourceFiles {
    source_root: Option<PathBuf>,
    output_collection: &'static str,
    path_filters: Vec<PathFilter>,
}

impl Default for FindSourceFiles {
    fn default() -> Self {
        FindSourceFiles {
            source_root: None,
            output_collection: store::INITIAL_SOURCE,
            path_filters: Vec::new(),
        }
    }
}

impl FindSourceFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Walk a different folder instead of the configured source root.
    pub fn source_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.source_root = Some(root.into());
        self
    }

    /// Write results to a different collection.
    pub fn output_collection(mut self, name: &'static str) -> Self {
        self.output_collection = name;
        self
    }

    pub fn path_filters(mut self, filters: Vec<PathFilter>) -> Self {
        self.path_filters = filters;
        self
    }
}

impl Step for FindSourceFiles {
    fn name(&self) -> &str {
        "find source files"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let source_root = self
            .source_root
            .clone()
            .unwrap_or_else(|| config.source_root().to_path_buf());

        let files = file_walk(&source_root, &[config.prebuild().folder().to_path_buf()])
            .map_err(|e| BuildError::io(&source_root, e))?;

        let mut found = 0usize;
        for fpath in files {
            let mut wanted = true;
            for filter in &self.path_filters {
                if let Some(opinion) = filter.check(&fpath) {
                    wanted = opinion;
                }
            }

            if wanted {
                store.add_path(self.output_collection, fpath)?;
                found += 1;
            } else {
                tracing::debug!("excluding {}", fpath.display());
            }
        }

        if found == 0 {
            return Err(BuildError::Config(format!(
                "no source files found after filtering in {}",
                source_root.display()
            )));
        }
        tracing::info!("found {found} source files");

        // split into the language groups later steps work on
        store.copy_paths(
            self.output_collection,
            store::FORTRAN_BUILD_FILES,
            &[".f90", ".F90"],
        )?;
        store.copy_paths(self.output_collection, store::C_BUILD_FILES, &[".c"])?;
        store.copy_paths(
            self.output_collection,
            store::X90_BUILD_FILES,
            &[".x90", ".X90"],
        )?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tempfile::TempDir;

    fn workspace_with_sources() -> (TempDir, BuildConfig) {
        let tmp = TempDir::new().unwrap();
        let config = BuildConfig::with_workspace("find-test", tmp.path()).unwrap();

        let src = config.source_root().to_path_buf();
        std::fs::create_dir_all(src.join("um")).unwrap();
        std::fs::write(src.join("main.F90"), "").unwrap();
        std::fs::write(src.join("helper.f90"), "").unwrap();
        std::fs::write(src.join("interop.c"), "").unwrap();
        std::fs::write(src.join("kernel.x90"), "").unwrap();
        std::fs::write(src.join("um/legacy.f90"), "").unwrap();
        std::fs::write(src.join("readme.txt"), "").unwrap();

        (tmp, config)
    }

    #[test]
    fn discovers_and_splits_by_language() {
        let (_tmp, config) = workspace_with_sources();
        let mut store_ = ArtefactStore::new();

        FindSourceFiles::new().run(&mut store_, &config).unwrap();

        assert_eq!(store_.paths(store::INITIAL_SOURCE).unwrap().len(), 6);
        assert_eq!(store_.paths(store::FORTRAN_BUILD_FILES).unwrap().len(), 3);
        assert_eq!(store_.paths(store::C_BUILD_FILES).unwrap().len(), 1);
        assert_eq!(store_.paths(store::X90_BUILD_FILES).unwrap().len(), 1);
    }

    #[test]
    fn filters_apply_in_order() {
        let (_tmp, config) = workspace_with_sources();
        let mut store_ = ArtefactStore::new();

        FindSourceFiles::new()
            .path_filters(vec![
                PathFilter::exclude(&["/um/"]),
                PathFilter::include(&["/um/legacy.f90"]),
            ])
            .run(&mut store_, &config)
            .unwrap();

        let fortran = store_.paths(store::FORTRAN_BUILD_FILES).unwrap();
        assert!(fortran.iter().any(|p| p.ends_with("um/legacy.f90")));

        // swapping the order excludes the file
        let mut store_ = ArtefactStore::new();
        FindSourceFiles::new()
            .path_filters(vec![
                PathFilter::include(&["/um/legacy.f90"]),
                PathFilter::exclude(&["/um/"]),
            ])
            .run(&mut store_, &config)
            .unwrap();

        let fortran = store_.paths(store::FORTRAN_BUILD_FILES).unwrap();
        assert!(!fortran.iter().any(|p| p.ends_with("um/legacy.f90")));
    }

    #[test]
    fn empty_result_is_an_error() {
        let tmp = TempDir::new().unwrap();
        let config = BuildConfig::with_workspace("find-test", tmp.path()).unwrap();
        std::fs::create_dir_all(config.source_root()).unwrap();

        let mut store_ = ArtefactStore::new();
        let err = FindSourceFiles::new()
            .run(&mut store_, &config)
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
    }
}
