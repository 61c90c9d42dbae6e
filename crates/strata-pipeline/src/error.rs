//! Builder errors.

use strata_op::OpError;

/// Errors raised while assembling or marshaling a pipeline.
#[derive(Debug, thiserror::Error)]
pub enum BuildError {
  /// Two mounts of one exec target the same path.
  #[error("mount destination '{dest}' is already in use")]
  MountCollision { dest: String },

  /// No mount of the exec targets the path.
  #[error("no mount at '{dest}'")]
  MountNotFound { dest: String },

  /// The mount is read-only or not a bind mount, so it produces no output.
  #[error("mount at '{dest}' has no output")]
  MountHasNoOutput { dest: String },

  /// A source was created without a reference.
  #[error("source '{identifier}' has an empty reference")]
  EmptyIdentifier { identifier: String },

  /// An exec was created without a command.
  #[error("exec has no arguments")]
  EmptyArgs,

  /// A path is empty or otherwise unusable.
  #[error("invalid path {path:?}: {message}")]
  InvalidPath { path: String, message: String },

  /// Every head passed to marshal is scratch.
  #[error("nothing to marshal, all heads are scratch")]
  NoHeads,

  /// Encoding or digesting failed.
  #[error(transparent)]
  Op(#[from] OpError),
}
