//! Source acquisition by filesystem copy.
//!
//! Copies an external folder into the project's `source/` area so later
//! steps only ever see paths inside the workspace. Version-control exports
//! are external collaborators with the same contract: files appear under
//! `source/<dst_label>`.

use std::path::PathBuf;

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::steps::Step;
use crate::store::ArtefactStore;
use crate::util::fs::copy_dir_all;

/// Copy a local folder into the project source area.
pub struct GrabFolder {
    src: PathBuf,
    dst_label: String,
}

impl GrabFolder {
    pub fn new(src: impl Into<PathBuf>, dst_label: impl Into<String>) -> Self {
        GrabFolder {
            src: src.into(),
            dst_label: dst_label.into(),
        }
    }
}

impl Step for GrabFolder {
    fn name(&self) -> &str {
        "grab folder"
    }

    fn run(&self, _store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        if !self.src.is_dir() {
            return Err(BuildError::Config(format!(
                "grab source is not a folder: {}",
                self.src.display()
            )));
        }

        let dst = config.source_root().join(&self.dst_label);
        tracing::info!("grabbing {} into {}", self.src.display(), dst.display());

        copy_dir_all(&self.src, &dst).map_err(|e| BuildError::io(&self.src, e))
    }
}
