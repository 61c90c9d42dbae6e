//! Strata solver
//!
//! Executes definitions produced by `strata-pipeline`:
//! - [`load`]: validate a definition and turn it into shared [`Vertex`]es
//! - [`Solver`]: run vertices in dependency order on a [`Worker`], bounded
//!   by a concurrency limit, deduplicating concurrent requests for the same
//!   vertex and consulting a [`ResultCache`]
//! - [`SolveNotifier`]: observe progress as [`SolveEvent`]s

mod cache;
mod error;
mod events;
mod job;
mod loader;
mod solver;
mod vertex;
mod worker;

pub use cache::{CacheError, CacheKey, FsCache, MemoryCache, ResultCache};
pub use error::{LoadError, SolveError};
pub use events::{ChannelNotifier, NoopNotifier, SolveEvent, SolveNotifier};
pub use job::{SolveReport, VertexStatus};
pub use loader::{LoadOverrides, load};
pub use solver::{Solver, SolverConfig};
pub use vertex::{Edge, Vertex, render, walk};
pub use worker::{DryRunWorker, ResultHandle, Worker, WorkerError};
