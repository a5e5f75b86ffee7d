//! The artefact store: named, typed collections shared between steps.
//!
//! The store is created empty at the start of a build scope and discarded at
//! the end; the files its collections point at persist on disk. Steps
//! communicate *only* through the store, reading and writing the closed set
//! of collection names below.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::error::{BuildError, BuildResult};
use crate::graph::SourceGraph;

/// All discovered source paths.
pub const INITIAL_SOURCE: &str = "initial_source";
/// Current canonical Fortran sources to analyse and compile.
pub const FORTRAN_BUILD_FILES: &str = "fortran_build_files";
/// Current canonical C sources to analyse and compile.
pub const C_BUILD_FILES: &str = "c_build_files";
/// Code-generation inputs awaiting expansion.
pub const X90_BUILD_FILES: &str = "x90_build_files";
/// Outputs of the Fortran preprocessor step.
pub const PREPROCESSED_FORTRAN: &str = "preprocessed_fortran";
/// Outputs of the C preprocessor step.
pub const PREPROCESSED_C: &str = "preprocessed_c";
/// Outputs of the C pragma injector step.
pub const PRAGMAD_C: &str = "pragmad_c";
/// Root symbol name to analysed-file subgraph.
pub const BUILD_TREES: &str = "build_trees";
/// Root symbol name to compiled object paths.
pub const OBJECT_FILES: &str = "object_files";
/// Root symbol name to archive path.
pub const OBJECT_ARCHIVES: &str = "object_archives";
/// Final linked executables.
pub const EXECUTABLES: &str = "executables";

/// A value held in the artefact store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Collection {
    /// An unordered set of file paths.
    Paths(BTreeSet<PathBuf>),
    /// Build trees by root symbol name.
    Trees(BTreeMap<String, SourceGraph>),
    /// Object file sets by root symbol name.
    Objects(BTreeMap<String, BTreeSet<PathBuf>>),
    /// Archive paths by root symbol name.
    Archives(BTreeMap<String, PathBuf>),
}

/// Per-run mapping of collection names to collections.
///
/// Not concurrent: steps run sequentially at the top level and merge worker
/// results back into the store on the driving thread.
#[derive(Debug, Default)]
pub struct ArtefactStore {
    collections: BTreeMap<&'static str, Collection>,
}

impl ArtefactStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, name: &'static str, value: Collection) {
        self.collections.insert(name, value);
    }

    pub fn get(&self, name: &'static str) -> BuildResult<&Collection> {
        self.collections
            .get(name)
            .ok_or(BuildError::MissingCollection(name))
    }

    pub fn has(&self, name: &'static str) -> bool {
        self.collections.contains_key(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&&'static str, &Collection)> {
        self.collections.iter()
    }

    /// A path collection, sorted.
    pub fn paths(&self, name: &'static str) -> BuildResult<Vec<PathBuf>> {
        match self.get(name)? {
            Collection::Paths(paths) => Ok(paths.iter().cloned().collect()),
            _ => Err(BuildError::WrongCollectionKind(name)),
        }
    }

    /// A path collection, or empty if absent.
    pub fn paths_or_default(&self, name: &'static str) -> BuildResult<Vec<PathBuf>> {
        if !self.has(name) {
            return Ok(Vec::new());
        }
        self.paths(name)
    }

    /// Create-or-get a mutable path set.
    pub fn paths_mut(&mut self, name: &'static str) -> BuildResult<&mut BTreeSet<PathBuf>> {
        match self
            .collections
            .entry(name)
            .or_insert_with(|| Collection::Paths(BTreeSet::new()))
        {
            Collection::Paths(paths) => Ok(paths),
            _ => Err(BuildError::WrongCollectionKind(name)),
        }
    }

    /// Add a path to a path collection, creating the collection if needed.
    pub fn add_path(&mut self, name: &'static str, path: impl Into<PathBuf>) -> BuildResult<()> {
        self.paths_mut(name)?.insert(path.into());
        Ok(())
    }

    /// Replace one entry of a path collection with another, keeping the
    /// collection in sync when a step rewrites a file (e.g. preprocessing a
    /// `.F90` into a `.f90`).
    pub fn replace_path(
        &mut self,
        name: &'static str,
        old: &Path,
        new: impl Into<PathBuf>,
    ) -> BuildResult<()> {
        let paths = self.paths_mut(name)?;
        paths.remove(old);
        paths.insert(new.into());
        Ok(())
    }

    /// Copy entries with matching suffixes from one path collection into
    /// another, creating the target.
    pub fn copy_paths(
        &mut self,
        from: &'static str,
        to: &'static str,
        suffixes: &[&str],
    ) -> BuildResult<()> {
        let source = self.paths(from)?;
        let filtered = crate::util::fs::suffix_filter(&source, suffixes);
        let target = self.paths_mut(to)?;
        target.extend(filtered);
        Ok(())
    }

    pub fn trees(&self) -> BuildResult<&BTreeMap<String, SourceGraph>> {
        match self.get(BUILD_TREES)? {
            Collection::Trees(trees) => Ok(trees),
            _ => Err(BuildError::WrongCollectionKind(BUILD_TREES)),
        }
    }

    pub fn set_trees(&mut self, trees: BTreeMap<String, SourceGraph>) {
        self.set(BUILD_TREES, Collection::Trees(trees));
    }

    pub fn objects(&self) -> BuildResult<&BTreeMap<String, BTreeSet<PathBuf>>> {
        match self.get(OBJECT_FILES)? {
            Collection::Objects(objects) => Ok(objects),
            _ => Err(BuildError::WrongCollectionKind(OBJECT_FILES)),
        }
    }

    /// Create-or-get the object set for one root.
    pub fn objects_mut(&mut self, root: &str) -> BuildResult<&mut BTreeSet<PathBuf>> {
        match self
            .collections
            .entry(OBJECT_FILES)
            .or_insert_with(|| Collection::Objects(BTreeMap::new()))
        {
            Collection::Objects(objects) => Ok(objects.entry(root.to_string()).or_default()),
            _ => Err(BuildError::WrongCollectionKind(OBJECT_FILES)),
        }
    }

    pub fn archives(&self) -> BuildResult<&BTreeMap<String, PathBuf>> {
        match self.get(OBJECT_ARCHIVES)? {
            Collection::Archives(archives) => Ok(archives),
            _ => Err(BuildError::WrongCollectionKind(OBJECT_ARCHIVES)),
        }
    }

    pub fn set_archive(&mut self, root: &str, path: impl Into<PathBuf>) -> BuildResult<()> {
        match self
            .collections
            .entry(OBJECT_ARCHIVES)
            .or_insert_with(|| Collection::Archives(BTreeMap::new()))
        {
            Collection::Archives(archives) => {
                archives.insert(root.to_string(), path.into());
                Ok(())
            }
            _ => Err(BuildError::WrongCollectionKind(OBJECT_ARCHIVES)),
        }
    }
}
