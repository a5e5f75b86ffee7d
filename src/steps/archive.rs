//! Object archive creation.
//!
//! Gathers the object set of each build target into one static archive,
//! `<root>.a`, under the build output folder. Member order is path-sorted
//! so archives are reproducible.

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::steps::Step;
use crate::store::ArtefactStore;
use crate::util::process::ProcessBuilder;

/// Create one object archive per build target.
#[derive(Default)]
pub struct ArchiveObjects;

impl ArchiveObjects {
    pub fn new() -> Self {
        Self
    }
}

impl Step for ArchiveObjects {
    fn name(&self) -> &str {
        "archive objects"
    }

    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let archiver = config.tools().ar.clone();
        let object_sets = store.objects()?.clone();

        for (root, objects) in &object_sets {
            let output = config.build_output().join(format!("{root}.a"));

            let cmd = ProcessBuilder::new(&archiver.exe)
                .arg("cr")
                .arg(&output)
                .args(objects.iter());

            tracing::info!("archiving {} objects for '{root}'", objects.len());
            tracing::debug!("running: {}", cmd.display_command());

            let result = cmd.exec().map_err(|e| BuildError::io(&output, e))?;
            if !result.status.success() {
                return Err(BuildError::ToolFailure {
                    stage: "archive objects",
                    path: output,
                    stderr: String::from_utf8_lossy(&result.stderr).to_string(),
                });
            }

            store.set_archive(root, output)?;
        }

        Ok(())
    }
}
