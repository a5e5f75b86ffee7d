//! Whole-project source analysis.
//!
//! Hashes every build file, parses the changed ones (reusing `.an` records
//! from the prebuild cache for the rest), assembles the project source
//! graph, and extracts one build tree per requested root symbol into
//! `BUILD_TREES`. Library builds keep the whole graph under the sentinel
//! root.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::analysis::{AnalysedFile, FortranAnalyser, ParserWorkaround};
use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::graph::{SourceGraph, LIBRARY_ROOT};
use crate::steps::{check_for_errors, run_mp, Step};
use crate::store::{self, ArtefactStore};
use crate::util::fs::suffix;
use crate::util::hash::file_fingerprint;

/// Analyse the current build files and produce build trees.
pub struct Analyse {
    sources: Vec<&'static str>,
    root_symbols: Vec<String>,
    find_programs: bool,
    library: bool,
    unreferenced_deps: Vec<String>,
    workarounds: Vec<ParserWorkaround>,
    fortran_analyser: FortranAnalyser,
}

impl Default for Analyse {
    fn default() -> Self {
        Analyse {
            sources: vec![store::FORTRAN_BUILD_FILES, store::C_BUILD_FILES],
            root_symbols: Vec::new(),
            find_programs: false,
            library: false,
            unreferenced_deps: Vec::new(),
            workarounds: Vec::new(),
            fortran_analyser: FortranAnalyser::default(),
        }
    }
}

impl Analyse {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare an executable target by its Fortran program name, or `main`
    /// for C. May be called repeatedly for multiple targets.
    pub fn root_symbol(mut self, name: &str) -> Self {
        self.root_symbols.push(name.to_lowercase());
        self
    }

    /// Build every Fortran program found in the source.
    pub fn find_programs(mut self) -> Self {
        self.find_programs = true;
        self
    }

    /// Library mode: one build tree containing every analysed file.
    pub fn library(mut self) -> Self {
        self.library = true;
        self
    }

    /// Symbols needed by the build which analysis cannot see, e.g. a
    /// routine called only from a one-line `if` statement. Their files and
    /// transitive dependencies are added to every build tree.
    pub fn unreferenced_deps(mut self, deps: &[&str]) -> Self {
        self.unreferenced_deps
            .extend(deps.iter().map(|s| s.to_lowercase()));
        self
    }

    /// Hand-written analysis results for files the parser cannot process.
    pub fn parser_workaround(mut self, workaround: ParserWorkaround) -> Self {
        self.workarounds.push(workaround);
        self
    }

    /// Replace the default set of intrinsic module names ignored in `use`
    /// statements.
    pub fn intrinsic_modules(mut self, names: &[&str]) -> Self {
        self.fortran_analyser =
            FortranAnalyser::new(names.iter().map(|s| s.to_lowercase()).collect());
        self
    }

    /// Override the input collections.
    pub fn sources(mut self, names: Vec<&'static str>) -> Self {
        self.sources = names;
        self
    }

    fn analyse_artefact(&self, config: &BuildConfig, fpath: &Path) -> BuildResult<AnalysedFile> {
        // user-supplied results take precedence over parsing
        if let Some(workaround) = self.workarounds.iter().find(|w| w.fpath == *fpath) {
            tracing::warn!(
                "using user-supplied analysis results for {}",
                fpath.display()
            );
            let analysed = workaround
                .clone()
                .into_analysed()
                .map_err(|e| BuildError::io(fpath, e))?;
            return Ok(AnalysedFile::Fortran(analysed));
        }

        let file_hash = file_fingerprint(fpath).map_err(|e| BuildError::io(fpath, e))?;
        let stem = fpath
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        // analysis is insensitive to compiler choice, so the content hash
        // alone keys the record
        if let Some(record) = config.prebuild().lookup(&stem, file_hash, "an") {
            if let Ok(analysed) = AnalysedFile::load(&record) {
                return Ok(analysed);
            }
            tracing::warn!("discarding bad analysis record {}", record.display());
        }

        let analysed = match suffix(fpath).as_str() {
            ".c" => {
                let ac = crate::analysis::c::CAnalyser
                    .run(fpath)
                    .map_err(|_| BuildError::Parse {
                        path: fpath.to_path_buf(),
                    })?;
                AnalysedFile::C(ac)
            }
            _ => {
                let af = self
                    .fortran_analyser
                    .run(fpath)
                    .map_err(|_| BuildError::Parse {
                        path: fpath.to_path_buf(),
                    })?;
                AnalysedFile::Fortran(af)
            }
        };

        let record_path = config.prebuild().entry_path(&stem, file_hash, "an");
        analysed
            .save(&record_path)
            .map_err(|e| BuildError::io(&record_path, e))?;
        config.prebuild().mark_current(&record_path);

        Ok(analysed)
    }

    fn roots(&self, graph: &SourceGraph) -> BuildResult<Vec<String>> {
        let mut roots = self.root_symbols.clone();

        if self.find_programs {
            roots.extend(graph.program_defs());
        }

        if roots.is_empty() && !self.library {
            return Err(BuildError::Config(
                "no root symbols: declare root_symbol(s), find_programs or library".into(),
            ));
        }

        roots.sort();
        roots.dedup();
        Ok(roots)
    }
}

impl Step for Analyse {
    fn name(&self) -> &str {
        "analyse"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let mut files: Vec<PathBuf> = Vec::new();
        for collection in &self.sources {
            files.extend(store.paths_or_default(collection)?);
        }
        files.sort();
        tracing::info!("analysing {} files", files.len());

        let results = run_mp(config, &files, |fpath| {
            self.analyse_artefact(config, fpath)
        });
        let (analysed, error) = check_for_errors(results);
        if let Some(err) = error {
            return Err(err);
        }

        let graph = SourceGraph::assemble(analysed)?;
        tracing::info!("source graph size {}", graph.len());

        let mut trees: BTreeMap<String, SourceGraph> = BTreeMap::new();

        if self.library {
            graph.check_cycles()?;
            trees.insert(LIBRARY_ROOT.to_string(), graph.clone());
        }

        for root in self.roots(&graph)? {
            let tree = graph.extract_build_tree(&root)?;
            tree.check_cycles()?;
            tracing::info!("build tree for '{root}' has {} files", tree.len());
            trees.insert(root, tree);
        }

        // pull in symbols reached in ways the parser cannot see
        for symbol in &self.unreferenced_deps {
            let Some(defining) = graph.defining_file(symbol) else {
                tracing::warn!("no file found for unreferenced dependency '{symbol}'");
                continue;
            };
            let closure = graph.reachable_from(defining);
            for tree in trees.values_mut() {
                tree.extend(closure.clone());
            }
        }

        store.set_trees(trees);
        Ok(())
    }
}
