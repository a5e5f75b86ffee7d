//! Build configuration and the run scope.
//!
//! A [`BuildConfig`] is an immutable per-run bundle of workspace paths, tool
//! identities and settings, passed explicitly to every step. [`BuildConfig::run`]
//! owns the build scope: it creates the artefact store, executes the steps in
//! declared order, and on exit runs default housekeeping and flushes metrics.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tracing_subscriber::EnvFilter;

use crate::error::{BuildError, BuildResult};
use crate::metrics::{MetricValue, Metrics, StepTimer};
use crate::prebuild::{PrebuildCache, PREBUILD_FOLDER};
use crate::steps::Step;
use crate::store::ArtefactStore;
use crate::tools::{env_flags, Tool};
use crate::util::process::find_executable;

/// Folder names below the project workspace.
pub const SOURCE_ROOT: &str = "source";
pub const BUILD_OUTPUT: &str = "build_output";
pub const METRICS_FOLDER: &str = "metrics";

/// The environment variable overriding the default workspace location.
pub const FAB_WORKSPACE: &str = "FAB_WORKSPACE";

/// External tools resolved for this run.
///
/// Tool variables may carry embedded flags; the preprocessor is forced to
/// emit without line markers since the analysers scan its output.
#[derive(Debug, Clone)]
pub struct ToolBox {
    /// Fortran preprocessor.
    pub fpp: Tool,
    /// C preprocessor.
    pub cpp: Tool,
    pub fc: Tool,
    pub cc: Tool,
    pub ld: Tool,
    pub ar: Tool,
}

impl ToolBox {
    /// Resolve tools from `FPP`, `FC`, `CC` and `LD`, with common defaults.
    pub fn from_env() -> Self {
        let mut fpp = Tool::from_env("FPP", "cpp");
        fpp.ensure_flag("-P");

        let mut cpp = Tool::new("cpp");
        cpp.ensure_flag("-P");

        ToolBox {
            fpp,
            cpp,
            fc: Tool::from_env("FC", "gfortran"),
            cc: Tool::from_env("CC", "gcc"),
            ld: Tool::from_env("LD", "gcc"),
            ar: Tool::new("ar"),
        }
    }

    /// Check every resolved tool can be found, by path or on `PATH`.
    pub fn validate(&self) -> BuildResult<()> {
        let tools = [
            ("fortran preprocessor", &self.fpp),
            ("c preprocessor", &self.cpp),
            ("fortran compiler", &self.fc),
            ("c compiler", &self.cc),
            ("linker", &self.ld),
            ("archiver", &self.ar),
        ];

        for (label, tool) in tools {
            if find_executable(&tool.exe).is_none() {
                return Err(BuildError::Config(format!(
                    "cannot resolve {label} `{}`",
                    tool.exe
                )));
            }
        }

        Ok(())
    }
}

/// Immutable per-run configuration.
#[derive(Debug)]
pub struct BuildConfig {
    project_label: String,
    project_workspace: PathBuf,
    source_root: PathBuf,
    build_output: PathBuf,
    metrics_folder: PathBuf,
    prebuild: PrebuildCache,
    metrics: Metrics,
    tools: ToolBox,
    fflags: Vec<String>,
    cflags: Vec<String>,
    lflags: Vec<String>,
    n_procs: usize,
}

impl BuildConfig {
    /// Create a configuration for a project label, resolving the workspace
    /// from `FAB_WORKSPACE` or `~/fab-workspace`.
    pub fn new(project_label: &str) -> BuildResult<Self> {
        let workspace = match std::env::var(FAB_WORKSPACE) {
            Ok(ws) => PathBuf::from(ws),
            Err(_) => {
                let home = dirs::home_dir()
                    .ok_or_else(|| BuildError::Config("cannot locate home directory".into()))?;
                let ws = home.join("fab-workspace");
                tracing::info!("FAB_WORKSPACE not set, defaulting to {}", ws.display());
                ws
            }
        };
        Self::with_workspace(project_label, &workspace)
    }

    /// Create a configuration with an explicit workspace root, overriding
    /// the environment.
    pub fn with_workspace(project_label: &str, fab_workspace: &Path) -> BuildResult<Self> {
        if project_label.trim().is_empty() {
            return Err(BuildError::Config("project label must not be empty".into()));
        }

        let project_workspace = fab_workspace.join(project_label.replace(' ', "-"));
        let source_root = project_workspace.join(SOURCE_ROOT);
        let build_output = project_workspace.join(BUILD_OUTPUT);
        let metrics_folder = project_workspace.join(METRICS_FOLDER);

        let prebuild = PrebuildCache::new(build_output.join(PREBUILD_FOLDER))
            .map_err(|e| BuildError::Config(format!("cannot create prebuild folder: {e:#}")))?;

        Ok(BuildConfig {
            project_label: project_label.to_string(),
            project_workspace,
            source_root,
            build_output,
            metrics_folder,
            prebuild,
            metrics: Metrics::new(),
            tools: ToolBox::from_env(),
            fflags: env_flags("FFLAGS"),
            cflags: env_flags("CFLAGS"),
            lflags: env_flags("LFLAGS"),
            n_procs: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1),
        })
    }

    /// Point source discovery at a folder outside the project workspace,
    /// e.g. when a grab script runs less frequently than the build.
    pub fn source_root_override(mut self, source_root: impl Into<PathBuf>) -> Self {
        self.source_root = source_root.into();
        self
    }

    /// Override the resolved tool set.
    pub fn with_tools(mut self, tools: ToolBox) -> Self {
        self.tools = tools;
        self
    }

    /// Limit worker parallelism; 1 disables multiprocessing for debugging.
    pub fn with_n_procs(mut self, n_procs: usize) -> Self {
        self.n_procs = n_procs.max(1);
        self
    }

    pub fn project_label(&self) -> &str {
        &self.project_label
    }

    pub fn project_workspace(&self) -> &Path {
        &self.project_workspace
    }

    pub fn source_root(&self) -> &Path {
        &self.source_root
    }

    pub fn build_output(&self) -> &Path {
        &self.build_output
    }

    pub fn prebuild(&self) -> &PrebuildCache {
        &self.prebuild
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn tools(&self) -> &ToolBox {
        &self.tools
    }

    pub fn fflags(&self) -> &[String] {
        &self.fflags
    }

    pub fn cflags(&self) -> &[String] {
        &self.cflags
    }

    pub fn lflags(&self) -> &[String] {
        &self.lflags
    }

    pub fn n_procs(&self) -> usize {
        self.n_procs
    }

    /// Execute the build steps in declared order.
    ///
    /// The artefact store lives exactly as long as this call. On exit the
    /// default prebuild sweep runs (unless an explicit housekeeping step was
    /// declared) and metrics are flushed; the files the collections pointed
    /// at persist.
    pub fn run(&self, steps: &[Box<dyn Step>]) -> BuildResult<()> {
        crate::util::fs::ensure_dir(&self.build_output)
            .map_err(|e| BuildError::Config(format!("cannot create build output: {e:#}")))?;
        self.init_logging();
        self.tools.validate()?;

        tracing::info!(
            "running {} with {} steps, {} workers",
            self.project_label,
            steps.len(),
            self.n_procs
        );
        self.metrics
            .send("run", "label", MetricValue::Text(self.project_label.clone()));

        let mut store = ArtefactStore::new();
        let run_timer = std::time::Instant::now();

        let mut result = Ok(());
        for step in steps {
            let _timer = StepTimer::start(&self.metrics, "steps", step.name());
            tracing::info!("step: {}", step.name());

            if let Err(err) = step.run(&mut store, self) {
                tracing::error!("step '{}' failed: {err:#}", step.name());
                result = Err(err);
                break;
            }
        }

        // a failed run keeps the cache intact for the retry
        let explicit_housekeeping = steps.iter().any(|s| s.is_housekeeping());
        if result.is_ok() && !explicit_housekeeping {
            match self.prebuild.sweep_unused() {
                Ok(removed) => {
                    self.metrics.send_count("housekeeping", "removed", removed as u64)
                }
                Err(err) => tracing::warn!("default housekeeping failed: {err:#}"),
            }
        }

        self.metrics
            .send_seconds("run", "time taken", run_timer.elapsed().as_secs_f64());
        if let Err(err) = self.metrics.flush(&self.metrics_folder) {
            tracing::warn!("failed to flush metrics: {err:#}");
        }

        result
    }

    fn init_logging(&self) {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

        match std::fs::File::create(self.project_workspace.join("log.txt")) {
            Ok(file) => {
                let file = Arc::new(file);
                let _ = tracing_subscriber::fmt()
                    .with_env_filter(filter)
                    .with_ansi(false)
                    .with_writer(move || TeeWriter { file: file.clone() })
                    .try_init();
            }
            Err(_) => {
                let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
            }
        }
    }
}

/// Copies log output to both stderr and the run's `log.txt`.
struct TeeWriter {
    file: Arc<std::fs::File>,
}

impl Write for TeeWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let _ = std::io::stderr().write(buf);
        (&*self.file).write(buf)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        let _ = std::io::stderr().flush();
        (&*self.file).flush()
    }
}

/// Add command-line flags when a path filter matches.
///
/// Patterns and flags may use `$source`, `$output` and `$relative`
/// placeholders, rendered against the configuration and the file being
/// processed.
#[derive(Debug, Clone)]
pub struct AddFlags {
    pattern: String,
    flags: Vec<String>,
}

impl AddFlags {
    pub fn new(pattern: impl Into<String>, flags: &[&str]) -> Self {
        AddFlags {
            pattern: pattern.into(),
            flags: flags.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn substitute(template: &str, fpath: &Path, config: &BuildConfig) -> String {
        template
            .replace("$source", &config.source_root().to_string_lossy())
            .replace("$output", &config.build_output().to_string_lossy())
            .replace(
                "$relative",
                &fpath.parent().unwrap_or(Path::new("")).to_string_lossy(),
            )
    }

    /// Append this filter's flags if the pattern matches the path.
    pub fn run(&self, fpath: &Path, input_flags: &mut Vec<String>, config: &BuildConfig) {
        let pattern = Self::substitute(&self.pattern, fpath, config);

        let matches = match glob::Pattern::new(&pattern) {
            Ok(p) => p.matches(&fpath.to_string_lossy()),
            Err(err) => {
                tracing::warn!("invalid path flag pattern '{pattern}': {err}");
                false
            }
        };

        if matches {
            input_flags.extend(
                self.flags
                    .iter()
                    .map(|flag| Self::substitute(flag, fpath, config)),
            );
        }
    }
}

/// Command-line flags for a given path: flags common to all files plus any
/// matching path filters, in declaration order.
#[derive(Debug, Clone, Default)]
pub struct FlagsConfig {
    common_flags: Vec<String>,
    path_flags: Vec<AddFlags>,
}

impl FlagsConfig {
    pub fn new(common_flags: Vec<String>, path_flags: Vec<AddFlags>) -> Self {
        FlagsConfig {
            common_flags,
            path_flags,
        }
    }

    pub fn flags_for_path(&self, fpath: &Path, config: &BuildConfig) -> Vec<String> {
        let mut flags: Vec<String> = self
            .common_flags
            .iter()
            .map(|flag| AddFlags::substitute(flag, fpath, config))
            .collect();

        for path_flags in &self.path_flags {
            path_flags.run(fpath, &mut flags, config);
        }

        flags
    }
}
