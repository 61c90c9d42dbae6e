use thiserror::Error;

use crate::digest::Digest;

#[derive(Debug, Error)]
pub enum OpError {
  #[error("failed to encode op: {0}")]
  Encode(#[from] serde_json::Error),

  #[error("invalid digest {value:?}: {message}")]
  InvalidDigest { value: String, message: String },

  #[error("op {digest} not found in definition")]
  OpNotFound { digest: Digest },

  #[error("op {digest} references missing input {input}")]
  MissingInput { digest: Digest, input: Digest },

  #[error("op stored under {expected} hashes to {actual}")]
  DigestMismatch { expected: Digest, actual: Digest },

  #[error("op {digest} is malformed: {message}")]
  Malformed { digest: Digest, message: String },

  #[error("definition has no heads")]
  NoHeads,
}
