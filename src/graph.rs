//! The whole-project source graph and build-tree extraction.
//!
//! The graph is an arena of analysis records keyed by path, plus an edge set
//! referencing those keys. Edges are derived by name: every module dep
//! resolves to the unique file defining that module, every remaining symbol
//! dep to the unique file defining that symbol, and every `depends on:`
//! object pragma to the C file of the same stem.

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::path::{Path, PathBuf};

use petgraph::algo::tarjan_scc;
use petgraph::graph::DiGraph;

use crate::analysis::AnalysedFile;
use crate::error::{BuildError, BuildResult};
use crate::util::fs::suffix;

/// Sentinel root name for library builds, where the build tree is the whole
/// source graph.
pub const LIBRARY_ROOT: &str = "library";

/// A mapping from file path to its analysis record, with resolved
/// dependency edges.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceGraph {
    files: BTreeMap<PathBuf, AnalysedFile>,
    edges: BTreeMap<PathBuf, BTreeSet<PathBuf>>,
}

impl SourceGraph {
    /// Assemble the graph from analysis results.
    ///
    /// Files are processed in path-sorted order so diagnostics are
    /// deterministic. Fails on the first duplicate module or symbol
    /// definition; logs and drops unresolvable name dependencies.
    pub fn assemble(analysed: Vec<AnalysedFile>) -> BuildResult<Self> {
        let mut files: BTreeMap<PathBuf, AnalysedFile> = BTreeMap::new();
        for af in analysed {
            files.insert(af.path().to_path_buf(), af);
        }

        let mut modules: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut symbols: BTreeMap<String, PathBuf> = BTreeMap::new();

        for (fpath, af) in &files {
            for module in af.module_defs() {
                if let Some(first) = modules.get(module) {
                    return Err(BuildError::DuplicateDefinition {
                        name: module.clone(),
                        first: first.clone(),
                        second: fpath.clone(),
                    });
                }
                modules.insert(module.clone(), fpath.clone());
            }
            for symbol in af.symbol_defs() {
                if let Some(first) = symbols.get(symbol) {
                    return Err(BuildError::DuplicateDefinition {
                        name: symbol.clone(),
                        first: first.clone(),
                        second: fpath.clone(),
                    });
                }
                symbols.insert(symbol.clone(), fpath.clone());
            }
        }

        // C files by name, for object pragma deps like `f_var.o`
        let c_files_by_name: BTreeMap<String, PathBuf> = files
            .iter()
            .filter(|(p, _)| suffix(p) == ".c")
            .filter_map(|(p, _)| {
                p.file_name()
                    .map(|n| (n.to_string_lossy().to_string(), p.clone()))
            })
            .collect();

        let mut edges: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
        for (fpath, af) in &files {
            let file_edges = edges.entry(fpath.clone()).or_default();

            for module in af.module_deps() {
                match modules.get(module) {
                    Some(dep) if dep != fpath => {
                        file_edges.insert(dep.clone());
                    }
                    Some(_) => {} // intra-file use
                    None => {
                        tracing::warn!(
                            "no file defines module '{}' used by {}",
                            module,
                            fpath.display()
                        );
                    }
                }
            }

            for symbol in af.symbol_deps() {
                match symbols.get(symbol) {
                    Some(dep) if dep != fpath => {
                        file_edges.insert(dep.clone());
                    }
                    Some(_) => {}
                    None => {
                        // often an external library symbol, resolved at link time
                        tracing::debug!(
                            "no file defines symbol '{}' used by {}",
                            symbol,
                            fpath.display()
                        );
                    }
                }
            }

            for object in af.object_deps() {
                let c_name = object.replace(".o", ".c");
                match c_files_by_name.get(&c_name) {
                    Some(dep) => {
                        file_edges.insert(dep.clone());
                    }
                    None => {
                        tracing::warn!(
                            "no C file matches '{}' depended on by {}",
                            object,
                            fpath.display()
                        );
                    }
                }
            }
        }

        Ok(SourceGraph { files, edges })
    }

    /// The file defining a module or symbol name, if any.
    pub fn defining_file(&self, name: &str) -> Option<&Path> {
        let wanted = name.to_lowercase();
        self.files
            .iter()
            .find(|(_, af)| {
                af.symbol_defs().contains(&wanted) || af.module_defs().contains(&wanted)
            })
            .map(|(p, _)| p.as_path())
    }

    /// Every program name defined anywhere in the graph, for automatic root
    /// discovery.
    pub fn program_defs(&self) -> Vec<String> {
        let mut programs: Vec<String> = self
            .files
            .values()
            .filter_map(|af| af.as_fortran())
            .flat_map(|f| f.program_defs.iter().cloned())
            .collect();
        programs.sort();
        programs
    }

    /// Extract the subgraph reachable from the file defining `root_symbol`.
    pub fn extract_build_tree(&self, root_symbol: &str) -> BuildResult<SourceGraph> {
        let root = self
            .defining_file(root_symbol)
            .ok_or_else(|| BuildError::RootNotFound(root_symbol.to_string()))?
            .to_path_buf();

        Ok(self.reachable_from(&root))
    }

    /// The reachable closure of one file, breadth-first.
    pub fn reachable_from(&self, root: &Path) -> SourceGraph {
        let mut tree = SourceGraph::default();
        let mut queue: VecDeque<PathBuf> = VecDeque::new();
        queue.push_back(root.to_path_buf());

        while let Some(fpath) = queue.pop_front() {
            if tree.files.contains_key(&fpath) {
                continue;
            }
            let Some(af) = self.files.get(&fpath) else {
                tracing::warn!("missing dependency: {}", fpath.display());
                continue;
            };
            tree.files.insert(fpath.clone(), af.clone());
            let deps = self.edges.get(&fpath).cloned().unwrap_or_default();
            for dep in &deps {
                queue.push_back(dep.clone());
            }
            tree.edges.insert(fpath, deps);
        }

        tree
    }

    /// Merge another tree into this one.
    pub fn extend(&mut self, other: SourceGraph) {
        self.files.extend(other.files);
        self.edges.extend(other.edges);
    }

    /// Fail on any strongly connected component with more than one file.
    /// Self-edges were never recorded, so a single file cannot cycle.
    pub fn check_cycles(&self) -> BuildResult<()> {
        let mut graph: DiGraph<&Path, ()> = DiGraph::new();
        let mut indices = BTreeMap::new();

        for fpath in self.files.keys() {
            indices.insert(fpath.clone(), graph.add_node(fpath.as_path()));
        }
        for (from, deps) in &self.edges {
            for to in deps {
                if let (Some(&a), Some(&b)) = (indices.get(from), indices.get(to)) {
                    graph.add_edge(a, b, ());
                }
            }
        }

        for scc in tarjan_scc(&graph) {
            if scc.len() > 1 {
                let mut paths: Vec<PathBuf> =
                    scc.iter().map(|&i| graph[i].to_path_buf()).collect();
                paths.sort();
                return Err(BuildError::CycleDetected(paths));
            }
        }

        Ok(())
    }

    /// Analysis records with one of the given suffixes, path-sorted.
    pub fn filter_by_suffix(&self, suffixes: &[&str]) -> Vec<&AnalysedFile> {
        self.files
            .values()
            .filter(|af| suffixes.contains(&suffix(af.path()).as_str()))
            .collect()
    }

    /// The direct dependencies of one file.
    pub fn edges_of(&self, fpath: &Path) -> Option<&BTreeSet<PathBuf>> {
        self.edges.get(fpath)
    }

    pub fn get(&self, fpath: &Path) -> Option<&AnalysedFile> {
        self.files.get(fpath)
    }

    pub fn contains(&self, fpath: &Path) -> bool {
        self.files.contains_key(fpath)
    }

    pub fn files(&self) -> impl Iterator<Item = &AnalysedFile> {
        self.files.values()
    }

    pub fn paths(&self) -> impl Iterator<Item = &PathBuf> {
        self.files.keys()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }
}
