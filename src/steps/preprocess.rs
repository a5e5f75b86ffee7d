//! Fortran and C preprocessing.
//!
//! Each file's prebuild key combines its content hash with the tool
//! identity and the flags that apply to it; a cache hit recovers the
//! previous output instead of invoking the tool. Outputs land under
//! `build_output` and the input collections are rewritten to point at them,
//! so every downstream path lives in one place.

use std::path::{Path, PathBuf};

use crate::config::{AddFlags, BuildConfig, FlagsConfig};
use crate::error::{BuildError, BuildResult};
use crate::steps::{check_for_errors, run_mp, Step};
use crate::store::{self, ArtefactStore};
use crate::tools::Tool;
use crate::util::fs::{ensure_dir, input_to_output_fpath};
use crate::util::hash::{bytes_fingerprint, Fingerprint};
use crate::util::process::ProcessBuilder;

/// Preprocess one file, consulting the prebuild cache first.
///
/// Returns the output path, which is also recorded in the cache under
/// `<stem>.<key>.<suffix>`.
fn preprocess_artefact(
    config: &BuildConfig,
    tool: &Tool,
    flags: &FlagsConfig,
    stage: &'static str,
    input: &Path,
    output_suffix: &str,
) -> BuildResult<PathBuf> {
    let source = std::fs::read(input).map_err(|e| BuildError::io(input, e.into()))?;
    let content_hash = bytes_fingerprint(&source);

    let path_flags = flags.flags_for_path(input, config);
    let key = {
        let mut fp = Fingerprint::new();
        fp.update_hash(content_hash)
            .update_str(&tool.exe)
            .update_strs(tool.flags.iter().map(String::as_str))
            .update_strs(path_flags.iter().map(String::as_str));
        fp.finish()
    };

    let output_fpath = input_to_output_fpath(config.source_root(), config.build_output(), input)
        .with_extension(output_suffix);
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();

    if config.prebuild().lookup(&stem, key, output_suffix).is_some() {
        tracing::debug!("{stage} using prebuild for {}", input.display());
        config
            .prebuild()
            .recover(&stem, key, output_suffix, &output_fpath)
            .map_err(|e| BuildError::io(&output_fpath, e))?;
        return Ok(output_fpath);
    }

    if let Some(parent) = output_fpath.parent() {
        ensure_dir(parent).map_err(|e| BuildError::io(parent, e))?;
    }

    let cmd = ProcessBuilder::new(&tool.exe)
        .args(&tool.flags)
        .args(&path_flags)
        .arg(input)
        .arg(&output_fpath);

    tracing::debug!("{stage} running: {}", cmd.display_command());
    let output = cmd.exec().map_err(|e| BuildError::io(input, e))?;

    if !output.status.success() {
        return Err(BuildError::ToolFailure {
            stage,
            path: input.to_path_buf(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        });
    }

    config
        .prebuild()
        .store(&output_fpath, &stem, key, output_suffix)
        .map_err(|e| BuildError::io(&output_fpath, e))?;

    Ok(output_fpath)
}

/// Preprocess `.F90` files into lowercase `.f90` under `build_output`.
///
/// Plain `.f90` files are copied unchanged into `build_output` so that the
/// whole compile wave reads from one folder. Rewrites
/// `FORTRAN_BUILD_FILES` and publishes `PREPROCESSED_FORTRAN`.
pub struct PreprocessFortran {
    source: &'static str,
    output_collection: &'static str,
    flags: FlagsConfig,
}

impl Default for PreprocessFortran {
    fn default() -> Self {
        PreprocessFortran {
            source: store::FORTRAN_BUILD_FILES,
            output_collection: store::PREPROCESSED_FORTRAN,
            flags: FlagsConfig::default(),
        }
    }
}

impl PreprocessFortran {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, name: &'static str) -> Self {
        self.source = name;
        self
    }

    pub fn output_collection(mut self, name: &'static str) -> Self {
        self.output_collection = name;
        self
    }

    pub fn common_flags(mut self, flags: &[&str]) -> Self {
        self.flags = FlagsConfig::new(flags.iter().map(|s| s.to_string()).collect(), Vec::new());
        self
    }

    pub fn flags(mut self, common_flags: &[&str], path_flags: Vec<AddFlags>) -> Self {
        self.flags = FlagsConfig::new(
            common_flags.iter().map(|s| s.to_string()).collect(),
            path_flags,
        );
        self
    }
}

impl Step for PreprocessFortran {
    fn name(&self) -> &str {
        "preprocess fortran"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let files = store.paths(self.source)?;

        let to_preprocess: Vec<PathBuf> = crate::util::fs::suffix_filter(&files, &[".F90"]);
        let to_copy: Vec<PathBuf> = crate::util::fs::suffix_filter(&files, &[".f90"]);

        tracing::info!(
            "preprocessing {} files, copying {} already-lowercase files",
            to_preprocess.len(),
            to_copy.len()
        );

        let tool = &config.tools().fpp;
        let results = run_mp(config, &to_preprocess, |input| {
            let output = preprocess_artefact(
                config,
                tool,
                &self.flags,
                "preprocess fortran",
                input,
                "f90",
            )?;
            Ok((input.clone(), output))
        });
        let (preprocessed, error) = check_for_errors(results);

        for (original, output) in &preprocessed {
            store.replace_path(self.source, original, output.clone())?;
            store.add_path(self.output_collection, output.clone())?;
        }

        // lowercase sources just move into the output folder
        for original in &to_copy {
            let output =
                input_to_output_fpath(config.source_root(), config.build_output(), original);
            if output != *original {
                crate::util::fs::copy_file(original, &output)
                    .map_err(|e| BuildError::io(original, e))?;
                store.replace_path(self.source, original, output.clone())?;
            }
            store.add_path(self.output_collection, output)?;
        }

        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Preprocess C sources (typically `.prag` outputs of the pragma injector)
/// into `.c` under `build_output`. Rewrites `C_BUILD_FILES` and publishes
/// `PREPROCESSED_C`.
pub struct PreprocessC {
    source: &'static str,
    output_collection: &'static str,
    flags: FlagsConfig,
}

impl Default for PreprocessC {
    fn default() -> Self {
        PreprocessC {
            source: store::C_BUILD_FILES,
            output_collection: store::PREPROCESSED_C,
            flags: FlagsConfig::default(),
        }
    }
}

impl PreprocessC {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn source(mut self, name: &'static str) -> Self {
        self.source = name;
        self
    }

    pub fn output_collection(mut self, name: &'static str) -> Self {
        self.output_collection = name;
        self
    }

    pub fn common_flags(mut self, flags: &[&str]) -> Self {
        self.flags = FlagsConfig::new(flags.iter().map(|s| s.to_string()).collect(), Vec::new());
        self
    }

    pub fn flags(mut self, common_flags: &[&str], path_flags: Vec<AddFlags>) -> Self {
        self.flags = FlagsConfig::new(
            common_flags.iter().map(|s| s.to_string()).collect(),
            path_flags,
        );
        self
    }
}

impl Step for PreprocessC {
    fn name(&self) -> &str {
        "preprocess c"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let files = store.paths(self.source)?;

        let tool = &config.tools().cpp;
        let results = run_mp(config, &files, |input| {
            let output =
                preprocess_artefact(config, tool, &self.flags, "preprocess c", input, "c")?;
            Ok((input.clone(), output))
        });
        let (preprocessed, error) = check_for_errors(results);

        for (original, output) in &preprocessed {
            store.replace_path(self.source, original, output.clone())?;
            store.add_path(self.output_collection, output.clone())?;
        }

        match error {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ToolBox;
    use tempfile::TempDir;

    /// A stand-in preprocessor: copies input to output, recording the call.
    fn stub_tool(tmp: &TempDir) -> Tool {
        let script = tmp.path().join("stub-cpp");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo \"$@\" >> \"$(dirname \"$0\")/calls.log\"\n\
             in=''\n\
             for a in \"$@\"; do\n\
               case \"$a\" in -*) ;; *) [ -z \"$in\" ] && in=\"$a\" ;; esac\n\
             done\n\
             for last; do :; done\n\
             cp \"$in\" \"$last\"\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        Tool::new(script.to_string_lossy())
    }

    fn call_count(tmp: &TempDir) -> usize {
        std::fs::read_to_string(tmp.path().join("calls.log"))
            .map(|s| s.lines().count())
            .unwrap_or(0)
    }

    fn config_with_stub(tmp: &TempDir) -> BuildConfig {
        let mut tools = ToolBox::from_env();
        tools.fpp = stub_tool(tmp);
        BuildConfig::with_workspace("pp-test", tmp.path())
            .unwrap()
            .with_tools(tools)
            .with_n_procs(1)
    }

    #[test]
    fn uppercase_f90_is_preprocessed_and_replaced() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_stub(&tmp);

        let src = config.source_root().join("stay_or_go.F90");
        std::fs::create_dir_all(config.source_root()).unwrap();
        std::fs::write(&src, "program stay_or_go_now\nend\n").unwrap();

        let mut store_ = ArtefactStore::new();
        store_.add_path(store::FORTRAN_BUILD_FILES, &src).unwrap();

        PreprocessFortran::new().run(&mut store_, &config).unwrap();

        let expected = config.build_output().join("stay_or_go.f90");
        assert!(expected.exists());
        assert_eq!(
            store_.paths(store::FORTRAN_BUILD_FILES).unwrap(),
            vec![expected.clone()]
        );
        assert_eq!(
            store_.paths(store::PREPROCESSED_FORTRAN).unwrap(),
            vec![expected]
        );
    }

    #[test]
    fn second_run_hits_the_cache() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_stub(&tmp);

        let src = config.source_root().join("x.F90");
        std::fs::create_dir_all(config.source_root()).unwrap();
        std::fs::write(&src, "program x\nend\n").unwrap();

        for _ in 0..2 {
            let mut store_ = ArtefactStore::new();
            store_.add_path(store::FORTRAN_BUILD_FILES, &src).unwrap();
            PreprocessFortran::new().run(&mut store_, &config).unwrap();
        }

        // the tool ran once; the second run recovered from the cache
        assert_eq!(call_count(&tmp), 1);
    }

    #[test]
    fn changed_flags_miss_the_cache() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_stub(&tmp);

        let src = config.source_root().join("x.F90");
        std::fs::create_dir_all(config.source_root()).unwrap();
        std::fs::write(&src, "program x\nend\n").unwrap();

        let mut store_ = ArtefactStore::new();
        store_.add_path(store::FORTRAN_BUILD_FILES, &src).unwrap();
        PreprocessFortran::new()
            .common_flags(&["-DSHOULD_I_STAY"])
            .run(&mut store_, &config)
            .unwrap();

        let mut store_ = ArtefactStore::new();
        store_.add_path(store::FORTRAN_BUILD_FILES, &src).unwrap();
        PreprocessFortran::new().run(&mut store_, &config).unwrap();

        // both variants now coexist in the cache
        assert_eq!(call_count(&tmp), 2);
        let f90_entries = config
            .prebuild()
            .entries()
            .unwrap()
            .into_iter()
            .filter(|p| p.to_string_lossy().ends_with(".f90"))
            .count();
        assert_eq!(f90_entries, 2);
    }

    #[test]
    fn lowercase_f90_is_copied_unchanged() {
        let tmp = TempDir::new().unwrap();
        let config = config_with_stub(&tmp);

        let src = config.source_root().join("helper.f90");
        std::fs::create_dir_all(config.source_root()).unwrap();
        std::fs::write(&src, "module helper_mod\nend module\n").unwrap();

        let mut store_ = ArtefactStore::new();
        store_.add_path(store::FORTRAN_BUILD_FILES, &src).unwrap();
        PreprocessFortran::new().run(&mut store_, &config).unwrap();

        let expected = config.build_output().join("helper.f90");
        assert!(expected.exists());
        assert_eq!(
            store_.paths(store::FORTRAN_BUILD_FILES).unwrap(),
            vec![expected]
        );
        // the preprocessor itself never ran
        assert_eq!(call_count(&tmp), 0);
    }

    #[test]
    fn tool_failure_is_reported_per_file() {
        let tmp = TempDir::new().unwrap();

        let script = tmp.path().join("failing-cpp");
        std::fs::write(&script, "#!/bin/sh\necho 'bad input' >&2\nexit 1\n").unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }

        let mut tools = ToolBox::from_env();
        tools.fpp = Tool::new(script.to_string_lossy());
        let config = BuildConfig::with_workspace("pp-test", tmp.path())
            .unwrap()
            .with_tools(tools)
            .with_n_procs(1);

        let src = config.source_root().join("x.F90");
        std::fs::create_dir_all(config.source_root()).unwrap();
        std::fs::write(&src, "program x\nend\n").unwrap();

        let mut store_ = ArtefactStore::new();
        store_.add_path(store::FORTRAN_BUILD_FILES, &src).unwrap();

        let err = PreprocessFortran::new()
            .run(&mut store_, &config)
            .unwrap_err();
        match err {
            BuildError::ToolFailure { stage, stderr, .. } => {
                assert_eq!(stage, "preprocess fortran");
                assert!(stderr.contains("bad input"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }
}
