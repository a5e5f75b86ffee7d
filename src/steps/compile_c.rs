//! C compilation.
//!
//! C files carry no module dependencies, so every file in every build tree
//! compiles in a single parallel wave. The prebuild key folds the source
//! content hash with the compiler identity and the flags for the path.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::analysis::AnalysedC;
use crate::config::{AddFlags, BuildConfig, FlagsConfig};
use crate::error::{BuildError, BuildResult};
use crate::steps::{check_for_errors, run_mp, CompiledFile, Step};
use crate::store::ArtefactStore;
use crate::tools::Tool;
use crate::util::hash::Fingerprint;
use crate::util::process::ProcessBuilder;

/// Compile all C files in all build trees.
#[derive(Default)]
pub struct CompileC {
    common_flags: Vec<String>,
    path_flags: Vec<AddFlags>,
}

impl CompileC {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn common_flags(mut self, flags: &[&str]) -> Self {
        self.common_flags = flags.iter().map(|s| s.to_string()).collect();
        self
    }

    pub fn path_flags(mut self, flags: Vec<AddFlags>) -> Self {
        self.path_flags = flags;
        self
    }
}

impl Step for CompileC {
    fn name(&self) -> &str {
        "compile c"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let compiler = config.tools().cc.clone();

        let mut common_flags = compiler.flags.clone();
        common_flags.extend(config.cflags().iter().cloned());
        common_flags.extend(self.common_flags.iter().cloned());
        let flags = FlagsConfig::new(common_flags, self.path_flags.clone());

        let version = compiler
            .version()
            .map_err(|e| BuildError::Config(format!("cannot determine compiler version: {e:#}")))?;
        tracing::info!("c compiler is {} {version}", compiler.exe);

        let trees = store.trees()?.clone();
        let mut build_lists: BTreeMap<String, Vec<AnalysedC>> = BTreeMap::new();
        for (root, tree) in &trees {
            let files: Vec<AnalysedC> = tree
                .filter_by_suffix(&[".c"])
                .into_iter()
                .filter_map(|af| af.as_c().cloned())
                .collect();
            build_lists.insert(root.clone(), files);
        }

        let mut to_compile: BTreeMap<PathBuf, AnalysedC> = BTreeMap::new();
        for ac in build_lists.values().flatten() {
            to_compile.insert(ac.fpath.clone(), ac.clone());
        }
        if to_compile.is_empty() {
            return Ok(());
        }
        tracing::info!("compiling {} c files", to_compile.len());

        let wave: Vec<AnalysedC> = to_compile.into_values().collect();
        let results = run_mp(config, &wave, |ac| {
            compile_artefact(config, &compiler, &version, &flags, ac)
        });
        let (compiled, error) = check_for_errors(results);
        if let Some(err) = error {
            return Err(err);
        }

        let lookup: BTreeMap<PathBuf, CompiledFile> = compiled
            .into_iter()
            .map(|cf| (cf.input_fpath.clone(), cf))
            .collect();

        for (root, files) in &build_lists {
            let objects = store.objects_mut(root)?;
            for ac in files {
                objects.insert(lookup[&ac.fpath].output_fpath.clone());
            }
        }

        Ok(())
    }
}

fn compile_artefact(
    config: &BuildConfig,
    compiler: &Tool,
    version: &str,
    flags: &FlagsConfig,
    ac: &AnalysedC,
) -> BuildResult<CompiledFile> {
    let path_flags = flags.flags_for_path(&ac.fpath, config);

    let obj_hash = {
        let mut fp = Fingerprint::new();
        fp.update_hash(ac.file_hash)
            .update_str(&compiler.exe)
            .update_str(version)
            .update_strs(path_flags.iter().map(String::as_str));
        fp.finish()
    };

    let stem = ac
        .fpath
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let cache = config.prebuild();
    let obj_prebuild = cache.entry_path(&stem, obj_hash, "o");

    if obj_prebuild.exists() {
        tracing::debug!("using prebuild for {}", ac.fpath.display());
        cache.mark_current(&obj_prebuild);
    } else {
        if let Some(parent) = obj_prebuild.parent() {
            crate::util::fs::ensure_dir(parent).map_err(|e| BuildError::io(parent, e))?;
        }

        let cmd = ProcessBuilder::new(&compiler.exe)
            .arg("-c")
            .args(&path_flags)
            .arg(&ac.fpath)
            .arg("-o")
            .arg(&obj_prebuild);

        tracing::debug!("compiling: {}", cmd.display_command());
        let output = cmd.exec().map_err(|e| BuildError::io(&ac.fpath, e))?;

        if !output.status.success() {
            return Err(BuildError::ToolFailure {
                stage: "compile c",
                path: ac.fpath.clone(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }
        cache.mark_current(&obj_prebuild);
    }

    Ok(CompiledFile {
        input_fpath: ac.fpath.clone(),
        output_fpath: obj_prebuild,
    })
}
