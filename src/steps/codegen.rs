//! Code-generation pre-pass driver.
//!
//! Feeds each `.x90` input to an opaque configured program which produces a
//! `.f90` kernel, e.g. `tool <input> -o <output>`. The tool itself is an
//! external collaborator; this step only sequences it, skips work via the
//! prebuild cache, and appends the generated sources to
//! `FORTRAN_BUILD_FILES` for analysis and compilation.

use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::steps::{check_for_errors, run_mp, Step};
use crate::store::{self, ArtefactStore};
use crate::tools::Tool;
use crate::util::fs::{ensure_dir, input_to_output_fpath};
use crate::util::hash::{bytes_fingerprint, Fingerprint};
use crate::util::process::ProcessBuilder;

/// Expand `.x90` sources into generated Fortran kernels.
pub struct Codegen {
    tool: Tool,
    source: &'static str,
}

impl Codegen {
    pub fn new(tool: Tool) -> Self {
        Codegen {
            tool,
            source: store::X90_BUILD_FILES,
        }
    }

    pub fn source(mut self, name: &'static str) -> Self {
        self.source = name;
        self
    }

    fn generate(&self, config: &BuildConfig, input: &Path) -> BuildResult<PathBuf> {
        let source = std::fs::read(input).map_err(|e| BuildError::io(input, e.into()))?;
        let content_hash = bytes_fingerprint(&source);

        let key = {
            let mut fp = Fingerprint::new();
            fp.update_hash(content_hash)
                .update_str(&self.tool.exe)
                .update_strs(self.tool.flags.iter().map(String::as_str));
            fp.finish()
        };

        let output_fpath =
            input_to_output_fpath(config.source_root(), config.build_output(), input)
                .with_extension("f90");
        let stem = input
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();

        if config.prebuild().lookup(&stem, key, "f90").is_some() {
            tracing::debug!("codegen using prebuild for {}", input.display());
            config
                .prebuild()
                .recover(&stem, key, "f90", &output_fpath)
                .map_err(|e| BuildError::io(&output_fpath, e))?;
            return Ok(output_fpath);
        }

        if let Some(parent) = output_fpath.parent() {
            ensure_dir(parent).map_err(|e| BuildError::io(parent, e))?;
        }

        let cmd = ProcessBuilder::new(&self.tool.exe)
            .args(&self.tool.flags)
            .arg(input)
            .arg("-o")
            .arg(&output_fpath);

        tracing::debug!("codegen running: {}", cmd.display_command());
        let output = cmd.exec().map_err(|e| BuildError::io(input, e))?;

        if !output.status.success() {
            return Err(BuildError::ToolFailure {
                stage: "codegen",
                path: input.to_path_buf(),
                stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            });
        }

        config
            .prebuild()
            .store(&output_fpath, &stem, key, "f90")
            .map_err(|e| BuildError::io(&output_fpath, e))?;

        Ok(output_fpath)
    }
}

impl Step for Codegen {
    fn name(&self) -> &str {
        "codegen"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let files = store.paths_or_default(self.source)?;
        if files.is_empty() {
            tracing::info!("no codegen inputs");
            return Ok(());
        }

        let results = run_mp(config, &files, |input| self.generate(config, input));
        let (generated, error) = check_for_errors(results);

        for output in generated {
            store.add_path(store::FORTRAN_BUILD_FILES, output)?;
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
    use tempfile::TempDir;

    fn stub_generator(tmp: &TempDir) -> Tool {
        let script = tmp.path().join("stub-gen");
        std::fs::write(
            &script,
            "#!/bin/sh\n\
             echo run >> \"$(dirname \"$0\")/gen.log\"\n\
             printf 'module generated_mod\\nend module\\n' > \"$3\"\n",
        )
        .unwrap();
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        }
        Tool::new(script.to_string_lossy())
    }

    #[test]
    fn generates_and_caches() {
        let tmp = TempDir::new().unwrap();
        let tool = stub_generator(&tmp);
        let config = BuildConfig::with_workspace("gen-test", tmp.path())
            .unwrap()
            .with_n_procs(1);

        let x90 = config.source_root().join("kernel.x90");
        std::fs::create_dir_all(config.source_root()).unwrap();
        std::fs::write(&x90, "invoke(things)\n").unwrap();

        for _ in 0..2 {
            let mut store_ = ArtefactStore::new();
            store_.add_path(store::X90_BUILD_FILES, &x90).unwrap();
            Codegen::new(tool.clone()).run(&mut store_, &config).unwrap();

            let fortran = store_.paths(store::FORTRAN_BUILD_FILES).unwrap();
            assert_eq!(fortran, vec![config.build_output().join("kernel.f90")]);
        }

        // second run was served from the cache
        let log = std::fs::read_to_string(tmp.path().join("gen.log")).unwrap();
        assert_eq!(log.lines().count(), 1);
    }

    #[test]
    fn no_inputs_is_a_no_op() {
        let tmp = TempDir::new().unwrap();
        let config = BuildConfig::with_workspace("gen-test", tmp.path()).unwrap();
        let mut store_ = ArtefactStore::new();

        Codegen::new(Tool::new("unused"))
            .run(&mut store_, &config)
            .unwrap();
    }
}
