//! Fab - a build orchestrator for scientific Fortran and C projects.
//!
//! Given a source tree and one or more target programs, fab discovers
//! source files, resolves cross-file module and symbol dependencies,
//! computes a minimal compile order and drives parallel preprocessing,
//! compilation, archiving and linking. Every intermediate artefact is
//! content-addressed in a prebuild cache, so steps whose outputs already
//! exist are skipped, even when the cache was populated by another user.
//!
//! A build is a [`config::BuildConfig`] plus a list of [`steps::Step`]s:
//!
//! ```no_run
//! use fab::config::BuildConfig;
//! use fab::steps::{
//!     analyse::Analyse, compile_fortran::CompileFortran, find_source_files::FindSourceFiles,
//!     link::LinkExe, preprocess::PreprocessFortran, Step,
//! };
//!
//! # fn main() -> Result<(), fab::error::BuildError> {
//! let config = BuildConfig::new("example project")?;
//! let steps: Vec<Box<dyn Step>> = vec![
//!     Box::new(FindSourceFiles::new()),
//!     Box::new(PreprocessFortran::new()),
//!     Box::new(Analyse::new().root_symbol("example")),
//!     Box::new(CompileFortran::new()),
//!     Box::new(LinkExe::new().flags(&["-lgfortran"])),
//! ];
//! config.run(&steps)
//! # }
//! ```

pub mod analysis;
pub mod config;
pub mod error;
pub mod graph;
pub mod metrics;
pub mod prebuild;
pub mod steps;
pub mod store;
pub mod tools;
pub mod util;

pub use analysis::{AnalysedC, AnalysedFile, AnalysedFortran, ParserWorkaround};
pub use config::{AddFlags, BuildConfig, ToolBox};
pub use error::{BuildError, BuildResult, ExitStatus};
pub use graph::SourceGraph;
pub use prebuild::{PrebuildCache, PrebuildName};
pub use store::ArtefactStore;
pub use tools::Tool;
