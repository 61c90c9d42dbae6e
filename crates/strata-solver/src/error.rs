//! Solver errors.

use strata_op::{CapError, Digest, OpError, OutputIndex, RewriteError};

use crate::worker::WorkerError;

/// Errors that can occur while loading a definition into vertices.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
  /// The definition failed validation.
  #[error("invalid definition")]
  Invalid(#[from] OpError),

  /// An op requires a capability the solver doesn't support.
  #[error("op {digest} requires an unsupported capability")]
  Unsupported {
    digest: Digest,
    #[source]
    source: CapError,
  },

  /// The graph could not be ordered.
  #[error("definition could not be ordered")]
  Order(#[from] RewriteError),

  /// An edge refers to a vertex that was never built.
  #[error("op {digest} is referenced but was not loaded")]
  Dangling { digest: Digest },

  /// No mount or file action of the vertex targets the path.
  #[error("no mount at '{dest}' on {digest}")]
  MountNotFound { digest: Digest, dest: String },

  /// The mount exists but lacks the requested side.
  #[error("mount at '{dest}' on {digest} has no {side}")]
  MountUnresolved {
    digest: Digest,
    dest: String,
    side: &'static str,
  },
}

/// Errors that can occur while solving a vertex.
///
/// Cloneable so every waiter on a shared execution sees the same error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SolveError {
  /// The worker failed to execute the vertex.
  #[error("vertex {digest} ({name}) failed")]
  Failed {
    digest: Digest,
    name: String,
    #[source]
    source: WorkerError,
  },

  /// A transitive input failed, so the vertex was never dispatched.
  #[error("vertex {digest} blocked by failed dependency {origin}")]
  Blocked { digest: Digest, origin: Digest },

  /// The vertex produced fewer outputs than an edge refers to.
  #[error("vertex {digest} has no output {index}, it produced {available}")]
  MissingOutput {
    digest: Digest,
    index: OutputIndex,
    available: usize,
  },

  /// The definition of a nested build could not be loaded.
  #[error("nested build {digest} could not be loaded: {message}")]
  NestedLoad { digest: Digest, message: String },

  /// Execution was cancelled.
  #[error("solve cancelled")]
  Cancelled,

  /// Scheduling failed, e.g. a worker task panicked.
  #[error("internal solver error: {message}")]
  Internal { message: String },
}

impl SolveError {
  /// The error and every source under it, joined with `: `.
  pub fn describe(&self) -> String {
    let mut message = self.to_string();
    let mut source = std::error::Error::source(self);
    while let Some(cause) = source {
      message.push_str(": ");
      message.push_str(&cause.to_string());
      source = cause.source();
    }
    message
  }

  /// The vertex whose own execution caused this error.
  pub fn origin(&self) -> Option<&Digest> {
    match self {
      SolveError::Failed { digest, .. }
      | SolveError::MissingOutput { digest, .. }
      | SolveError::NestedLoad { digest, .. } => Some(digest),
      SolveError::Blocked { origin, .. } => Some(origin),
      SolveError::Cancelled | SolveError::Internal { .. } => None,
    }
  }
}
