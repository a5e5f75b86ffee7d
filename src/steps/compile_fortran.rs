//! Fortran compilation.
//!
//! Compiles every build tree in dependency waves: a wave holds the files
//! whose module dependencies are already satisfied, and each completed wave
//! unlocks the next. Before compiling, each file's object and module
//! prebuild keys are checked against the cache; hits are recovered instead
//! of compiled.
//!
//! Prebuild keys are "combo hashes" of everything that must trigger a
//! recompile. Module files are keyed by source content and compiler
//! identity; object files additionally fold in the flags for the path and
//! the hashes of the module files this unit consumes, which is why keys are
//! computed wave-by-wave, bottom-up along the dependency order.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};

use crate::analysis::AnalysedFortran;
use crate::config::{AddFlags, BuildConfig, FlagsConfig};
use crate::error::{BuildError, BuildResult};
use crate::steps::{check_for_errors, run_mp, CompiledFile, Step};
use crate::store::ArtefactStore;
use crate::tools::{known_compiler, remove_managed_flags, KnownCompiler, Tool};
use crate::util::fs::suffix;
use crate::util::hash::{file_fingerprint, Fingerprint};
use crate::util::process::ProcessBuilder;

/// The gfortran flag suppressing object emission in two-stage pass A.
const SYNTAX_ONLY_FLAG: &str = "-fsyntax-only";

/// Compile all Fortran files in all build trees.
#[derive(Default)]
pub struct CompileFortran {
    common_flags: Vec<String>,
    path_flags: Vec<AddFlags>,
    two_stage: bool,
}

/// Everything a compile worker needs besides the file itself.
struct MpArgs<'a> {
    config: &'a BuildConfig,
    flags: &'a FlagsConfig,
    compiler: &'a Tool,
    compiler_version: &'a str,
    known: Option<&'static KnownCompiler>,
    mod_hashes: &'a BTreeMap<String, u64>,
    syntax_only: bool,
}

impl CompileFortran {
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

    /// Produce all module files first with object emission suppressed, then
    /// compile objects in a single wave.
    pub fn two_stage(mut self, enabled: bool) -> Self {
        self.two_stage = enabled;
        self
    }

    /// Collate user flags with the environment and strip the flags the
    /// build manages itself.
    fn handle_compiler_args(
        &self,
        config: &BuildConfig,
    ) -> BuildResult<(Tool, String, Option<&'static KnownCompiler>, FlagsConfig)> {
        let compiler = config.tools().fc.clone();

        let mut common_flags: Vec<String> = compiler.flags.clone();
        common_flags.extend(config.fflags().iter().cloned());
        common_flags.extend(self.common_flags.iter().cloned());

        let known = known_compiler(&compiler.exe);
        match known {
            Some(known) => {
                common_flags = remove_managed_flags(known, &common_flags);
            }
            None => {
                tracing::warn!(
                    "unknown compiler {}: certain flags cannot be managed; ensure a \
                     compile-only flag is present and the module folder is the build \
                     output folder",
                    compiler.exe
                );
            }
        }

        let version = compiler
            .version()
            .map_err(|e| BuildError::Config(format!("cannot determine compiler version: {e:#}")))?;
        tracing::info!("fortran compiler is {} {version}", compiler.exe);

        let flags = FlagsConfig::new(common_flags, self.path_flags.clone());
        Ok((compiler, version, known, flags))
    }
}

impl Step for CompileFortran {
    fn name(&self) -> &str {
        "compile fortran"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let (compiler, version, known, flags) = self.handle_compiler_args(config)?;

        // one big lump of source across all build trees
        let trees = store.trees()?.clone();
        let mut build_lists: BTreeMap<String, Vec<AnalysedFortran>> = BTreeMap::new();
        for (root, tree) in &trees {
            let files: Vec<AnalysedFortran> = tree
                .filter_by_suffix(&[".f90"])
                .into_iter()
                .filter_map(|af| af.as_fortran().cloned())
                .collect();
            build_lists.insert(root.clone(), files);
        }

        let mut uncompiled: BTreeMap<PathBuf, AnalysedFortran> = BTreeMap::new();
        for af in build_lists.values().flatten() {
            uncompiled.insert(af.fpath.clone(), af.clone());
        }

        // fortran-to-fortran dependency edges, gating the waves
        let mut dep_map: BTreeMap<PathBuf, BTreeSet<PathBuf>> = BTreeMap::new();
        for tree in trees.values() {
            for fpath in tree.paths() {
                let deps = tree
                    .edges_of(fpath)
                    .map(|deps| {
                        deps.iter()
                            .filter(|d| suffix(d) == ".f90")
                            .cloned()
                            .collect::<BTreeSet<_>>()
                    })
                    .unwrap_or_default();
                dep_map.entry(fpath.clone()).or_default().extend(deps);
            }
        }

        tracing::info!("compiling {} fortran files", uncompiled.len());
        let progress = wave_progress(uncompiled.len());

        let mut mod_hashes: BTreeMap<String, u64> = BTreeMap::new();
        let mut compiled: BTreeMap<PathBuf, CompiledFile> = BTreeMap::new();

        if self.two_stage {
            tracing::info!("two-stage compile: module files first, multiple passes");
        }

        // pass A (or the only pass): waves along the dependency order
        let mut remaining = uncompiled.clone();
        while !remaining.is_empty() {
            let wave = get_compile_next(&compiled, &remaining, &dep_map)?;

            tracing::debug!("wave of {} files, {} remaining", wave.len(), remaining.len());
            let args = MpArgs {
                config,
                flags: &flags,
                compiler: &compiler,
                compiler_version: &version,
                known,
                mod_hashes: &mod_hashes,
                syntax_only: self.two_stage,
            };

            let results = run_mp(config, &wave, |af| {
                let result = process_file(af, &args);
                progress.inc(1);
                result
            });
            let (done, error) = check_for_errors(results);

            if let Some(error) = error {
                return Err(blocked_by(error, &wave, &remaining, &dep_map));
            }

            // hash the modules this wave produced, for downstream keys
            for af in &wave {
                for mod_name in &af.module_defs {
                    let mod_path = config.build_output().join(format!("{mod_name}.mod"));
                    let mod_hash =
                        file_fingerprint(&mod_path).map_err(|e| BuildError::io(&mod_path, e))?;
                    mod_hashes.insert(mod_name.clone(), mod_hash);
                }
            }

            for cf in done {
                remaining.remove(&cf.input_fpath);
                compiled.insert(cf.input_fpath.clone(), cf);
            }
        }

        // pass B: all modules exist, objects compile in a single wave
        if self.two_stage {
            tracing::info!("two-stage compile: object files, single pass");
            progress.set_position(0);

            let wave: Vec<AnalysedFortran> = uncompiled.values().cloned().collect();
            let args = MpArgs {
                config,
                flags: &flags,
                compiler: &compiler,
                compiler_version: &version,
                known,
                mod_hashes: &mod_hashes,
                syntax_only: false,
            };

            let results = run_mp(config, &wave, |af| {
                let result = process_file(af, &args);
                progress.inc(1);
                result
            });
            let (done, error) = check_for_errors(results);
            if let Some(error) = error {
                return Err(blocked_by(error, &wave, &uncompiled, &dep_map));
            }

            compiled.clear();
            for cf in done {
                compiled.insert(cf.input_fpath.clone(), cf);
            }
        }

        progress.finish_and_clear();

        // object files for each build target
        for (root, files) in &build_lists {
            let objects = store.objects_mut(root)?;
            for af in files {
                let cf = compiled.get(&af.fpath).ok_or_else(|| {
                    BuildError::CompileStalled(vec![af.fpath.clone()])
                })?;
                objects.insert(cf.output_fpath.clone());
            }
        }

        config.metrics().send_count(
            "compile fortran",
            "files",
            uncompiled.len() as u64,
        );
        Ok(())
    }
}

fn wave_progress(total: usize) -> ProgressBar {
    if total <= 1 {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    pb
}

/// The files whose Fortran dependencies are all satisfied.
///
/// Fails with the residual set if nothing can advance, which means a
/// missed dependency or a cycle the extractor did not catch.
fn get_compile_next(
    compiled: &BTreeMap<PathBuf, CompiledFile>,
    remaining: &BTreeMap<PathBuf, AnalysedFortran>,
    dep_map: &BTreeMap<PathBuf, BTreeSet<PathBuf>>,
) -> BuildResult<Vec<AnalysedFortran>> {
    let mut wave = Vec::new();

    for (fpath, af) in remaining {
        let unfulfilled = dep_map
            .get(fpath)
            .map(|deps| deps.iter().any(|d| !compiled.contains_key(d) && remaining.contains_key(d)))
            .unwrap_or(false);
        if !unfulfilled {
            wave.push(af.clone());
        }
    }

    if wave.is_empty() && !remaining.is_empty() {
        return Err(BuildError::CompileStalled(
            remaining.keys().cloned().collect(),
        ));
    }

    Ok(wave)
}

/// Recompute the wave error, adding a `BlockedBy` report for every file
/// downstream of a failure. Runnable siblings have already finished.
fn blocked_by(
    error: BuildError,
    wave: &[AnalysedFortran],
    remaining: &BTreeMap<PathBuf, AnalysedFortran>,
    dep_map: &BTreeMap<PathBuf, BTreeSet<PathBuf>>,
) -> BuildError {
    let mut errors = match error {
        BuildError::Aggregate(errs) => errs,
        single => vec![single],
    };

    let failed: BTreeSet<PathBuf> = errors
        .iter()
        .filter_map(|e| match e {
            BuildError::ToolFailure { path, .. } => Some(path.clone()),
            _ => None,
        })
        .collect();

    // transitive reverse reachability from the failures
    let mut blocked: BTreeMap<PathBuf, PathBuf> = BTreeMap::new();
    let wave_paths: BTreeSet<&PathBuf> = wave.iter().map(|af| &af.fpath).collect();
    loop {
        let mut grew = false;
        for fpath in remaining.keys() {
            if failed.contains(fpath) || blocked.contains_key(fpath) || wave_paths.contains(fpath) {
                continue;
            }
            let Some(deps) = dep_map.get(fpath) else {
                continue;
            };
            let blocker = deps
                .iter()
                .find(|d| failed.contains(*d) || blocked.contains_key(*d));
            if let Some(blocker) = blocker {
                blocked.insert(fpath.clone(), blocker.clone());
                grew = true;
            }
        }
        if !grew {
            break;
        }
    }

    for (path, blocker) in blocked {
        errors.push(BuildError::BlockedBy {
            path,
            blocked_by: blocker,
        });
    }

    if errors.len() == 1 {
        errors.pop().unwrap()
    } else {
        BuildError::Aggregate(errors)
    }
}

/// Compile one file, or recover its artefacts from the prebuild cache.
///
/// Objects are created directly in the prebuild folder; module files are
/// created in the build output folder and copied into the cache. On a cache
/// hit the module files are copied back out instead.
fn process_file(af: &AnalysedFortran, args: &MpArgs<'_>) -> BuildResult<CompiledFile> {
    let flags = args.flags.flags_for_path(&af.fpath, args.config);
    let mod_hash = mod_combo_hash(af, args);
    let obj_hash = obj_combo_hash(af, args, &flags);

    let stem = af
        .fpath
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let cache = args.config.prebuild();
    let obj_prebuild = cache.entry_path(&stem, obj_hash, "o");

    let have_all_prebuilds = obj_prebuild.exists()
        && af
            .module_defs
            .iter()
            .all(|m| cache.entry_path(m, mod_hash, "mod").exists());

    if have_all_prebuilds {
        tracing::debug!("using prebuild for {}", af.fpath.display());
        cache.mark_current(&obj_prebuild);
        for mod_name in &af.module_defs {
            let dest = args.config.build_output().join(format!("{mod_name}.mod"));
            cache
                .recover(mod_name, mod_hash, "mod", &dest)
                .map_err(|e| BuildError::io(&dest, e))?;
        }
    } else {
        compile_file(af, args, &flags, &obj_prebuild)?;
        cache.mark_current(&obj_prebuild);

        for mod_name in &af.module_defs {
            let built = args.config.build_output().join(format!("{mod_name}.mod"));
            cache
                .store(&built, mod_name, mod_hash, "mod")
                .map_err(|e| BuildError::io(&built, e))?;
        }
    }

    Ok(CompiledFile {
        input_fpath: af.fpath.clone(),
        output_fpath: obj_prebuild,
    })
}

/// Call the compiler.
///
/// The working folder is the source file's folder, stopping the compiler
/// embedding folder names in module files, which would change their
/// checksums between workspaces.
fn compile_file(
    af: &AnalysedFortran,
    args: &MpArgs<'_>,
    flags: &[String],
    output_fpath: &Path,
) -> BuildResult<()> {
    if let Some(parent) = output_fpath.parent() {
        crate::util::fs::ensure_dir(parent).map_err(|e| BuildError::io(parent, e))?;
    }

    let mut cmd = ProcessBuilder::new(&args.compiler.exe);

    if let Some(known) = args.known {
        cmd = cmd.arg(known.compile_flag);
    }
    cmd = cmd.args(flags);
    if args.syntax_only {
        cmd = cmd.arg(SYNTAX_ONLY_FLAG);
    }
    if let Some(known) = args.known {
        cmd = cmd
            .arg(known.module_folder_flag)
            .arg(args.config.build_output());
    }

    let file_name = af
        .fpath
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    cmd = cmd
        .arg(file_name)
        .arg("-o")
        .arg(output_fpath)
        .cwd(af.fpath.parent().unwrap_or(Path::new(".")));

    tracing::debug!("compiling: {}", cmd.display_command());
    let output = cmd.exec().map_err(|e| BuildError::io(&af.fpath, e))?;

    if !output.status.success() {
        return Err(BuildError::ToolFailure {
            stage: "compile fortran",
            path: af.fpath.clone(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    Ok(())
}

/// Key for the module files this unit produces: source content and compiler
/// identity. Flags are excluded so the two-stage passes share module keys.
fn mod_combo_hash(af: &AnalysedFortran, args: &MpArgs<'_>) -> u64 {
    let mut fp = Fingerprint::new();
    fp.update_hash(af.file_hash)
        .update_str(&args.compiler.exe)
        .update_str(args.compiler_version);
    fp.finish()
}

/// Key for the object file: everything in the module key plus the flags for
/// this path and the hashes of the module files we consume.
fn obj_combo_hash(af: &AnalysedFortran, args: &MpArgs<'_>, flags: &[String]) -> u64 {
    let mut fp = Fingerprint::new();
    fp.update_hash(af.file_hash)
        .update_str(&args.compiler.exe)
        .update_str(args.compiler_version)
        .update_strs(flags.iter().map(String::as_str));
    // sorted, since module_deps iterates in order
    for mod_dep in &af.module_deps {
        match args.mod_hashes.get(mod_dep) {
            Some(hash) => {
                fp.update_hash(*hash);
            }
            None => {
                // a module from outside the source roots: its changes are
                // invisible to this key and will not trigger a rebuild
                tracing::debug!(
                    "no hash for module '{mod_dep}' used by {}",
                    af.fpath.display()
                );
                fp.update_hash(0);
            }
        }
    }
    fp.finish()
}
