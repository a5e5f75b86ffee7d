//! Prebuild housekeeping.
//!
//! Without this step, the run scope deletes every cache entry the current
//! run did not touch. Declaring the step replaces that default: with an
//! `older_than` duration only entries of at least that last-modified age
//! are deleted, regardless of what the run touched.

use std::time::Duration;

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::steps::Step;
use crate::store::ArtefactStore;

/// Retention policy over the prebuild folder.
#[derive(Default)]
pub struct CleanupPrebuilds {
    older_than: Option<Duration>,
}

impl CleanupPrebuilds {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep entries younger than this, delete the rest.
    pub fn older_than(mut self, age: Duration) -> Self {
        self.older_than = Some(age);
        self
    }
}

impl Step for CleanupPrebuilds {
    fn name(&self) -> &str {
        "cleanup prebuilds"
    }

    fn is_housekeeping(&self) -> bool {
        true
    }

    fn run(&self, _store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()> {
        let cache = config.prebuild();

        let removed = match self.older_than {
            Some(age) => cache
                .sweep_older_than(age)
                .map_err(|e| BuildError::io(cache.folder(), e))?,
            None => cache
                .sweep_unused()
                .map_err(|e| BuildError::io(cache.folder(), e))?,
        };

        tracing::info!("removed {removed} prebuild files");
        config
            .metrics()
            .send_count("housekeeping", "removed", removed as u64);
        Ok(())
    }
}
