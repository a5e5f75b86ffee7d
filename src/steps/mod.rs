//! Build steps and the parallel fan-out helper.
//!
//! A step reads and writes artefact collections; the runtime executes steps
//! strictly in declared order. Inside a step, [`run_mp`] evaluates a
//! function over a batch of items on a worker pool, preserving input order
//! in the results so downstream consumption is deterministic.

pub mod analyse;
pub mod archive;
pub mod c_pragmas;
pub mod cleanup;
pub mod codegen;
pub mod compile_c;
pub mod compile_fortran;
pub mod find_source_files;
pub mod grab;
pub mod link;
pub mod preprocess;

use std::path::PathBuf;

use rayon::prelude::*;

use crate::config::BuildConfig;
use crate::error::{BuildError, BuildResult};
use crate::store::ArtefactStore;

/// A source file which has been compiled, and the object it produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledFile {
    pub input_fpath: PathBuf,
    pub output_fpath: PathBuf,
}

/// One build step. Data flows between steps only via the artefact store.
pub trait Step: Send + Sync {
    /// Human-friendly name for logs and metrics.
    fn name(&self) -> &str;

    /// Read and/or write collections; item-level work goes through
    /// [`run_mp`].
    fn run(&self, store: &mut ArtefactStore, config: &BuildConfig) -> BuildResult<()>;

    /// Whether this step performs prebuild housekeeping, suppressing the
    /// default sweep at scope exit.
    fn is_housekeeping(&self) -> bool {
        false
    }
}

/// Evaluate `func` over `items` concurrently, collecting all results in
/// input order. Workers are always drained; failures are reported alongside
/// successes so the caller can aggregate.
pub fn run_mp<T, R, F>(config: &BuildConfig, items: &[T], func: F) -> Vec<BuildResult<R>>
where
    T: Sync,
    R: Send,
    F: Fn(&T) -> BuildResult<R> + Send + Sync,
{
    if config.n_procs() <= 1 || items.len() <= 1 {
        return items.iter().map(&func).collect();
    }

    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(config.n_procs())
        .build();

    match pool {
        Ok(pool) => pool.install(|| items.par_iter().map(&func).collect()),
        Err(err) => {
            tracing::warn!("worker pool unavailable ({err}), running sequentially");
            items.iter().map(&func).collect()
        }
    }
}

/// Split a batch of results into successes and an aggregated error.
///
/// All successes are returned even when some items failed, so opportunistic
/// work (e.g. cache writes) survives a partial failure.
pub fn check_for_errors<R>(results: Vec<BuildResult<R>>) -> (Vec<R>, Option<BuildError>) {
    let mut values = Vec::new();
    let mut errors = Vec::new();

    for result in results {
        match result {
            Ok(value) => values.push(value),
            Err(err) => errors.push(err),
        }
    }

    let error = match errors.len() {
        0 => None,
        1 => Some(errors.pop().unwrap()),
        _ => Some(BuildError::Aggregate(errors)),
    };

    (values, error)
}
