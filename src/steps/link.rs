//! Executable linking.
//!
//! Consumes the archive for each build target when an archive step ran,
//! falling back to the raw object sets, and emits one executable per root
//! into the project workspace.

use std::path::PathBuf;

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::steps::Step;
use crate::store::{self, ArtefactStore};
use crate::tools::Tool;
use crate::util::process::ProcessBuilder;

/// Link an executable for every build target.
#[derive(Default)]
pub struct LinkExe {
    flags: Vec<String>,
    linker: Option<Tool>,
}

impl LinkExe {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flags(mut self, flags: &[&str]) -> Self {
        self.flags = flags.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Use a specific linker instead of the configured `LD`.
    pub fn linker(mut self, linker: Tool) -> Self {
        self.linker = Some(linker);
        self
    }

    /// Archives when the archive step ran, else raw objects, per root.
    fn link_inputs(&self, store: &ArtefactStore) -> BuildResult<Vec<(String, Vec<PathBuf>)>> {
        if store.has(store::OBJECT_ARCHIVES) {
            let archives = store.archives()?;
            if !archives.is_empty() {
                return Ok(archives
                    .iter()
                    .map(|(root, path)| (root.clone(), vec![path.clone()]))
                    .collect());
            }
        }

        Ok(store
            .objects()?
            .iter()
            .map(|(root, objects)| (root.clone(), objects.iter().cloned().collect()))
            .collect())
    }
}

impl Step for LinkExe {
    fn name(&self) -> &str {
        "link exe"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let linker = self
            .linker
            .clone()
            .unwrap_or_else(|| config.tools().ld.clone());
        tracing::info!("linker is {}", linker.exe);

        for (root, inputs) in self.link_inputs(store)? {
            let exe_path = config.project_workspace().join(&root);

            let cmd = ProcessBuilder::new(&linker.exe)
                .args(&linker.flags)
                .args(inputs.iter())
                .args(config.lflags())
                .args(&self.flags)
                .arg("-o")
                .arg(&exe_path);

            tracing::info!("linking '{root}'");
            tracing::debug!("running: {}", cmd.display_command());

            let output = cmd.exec().map_err(|e| BuildError::io(&exe_path, e))?;
            if !output.status.success() {
                return Err(BuildError::LinkFailed {
                    root: root.clone(),
                    stderr: String::from_utf8_lossy(&output.stderr).to_string(),
                });
            }

            store.add_path(store::EXECUTABLES, exe_path)?;
        }

        Ok(())
    }
}
