//! The seam between the solver and whatever actually runs ops.

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::vertex::Vertex;

/// Opaque reference to one output of an executed vertex.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ResultHandle(String);

impl ResultHandle {
  pub fn new(id: impl Into<String>) -> Self {
    Self(id.into())
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }
}

impl fmt::Display for ResultHandle {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum WorkerError {
  /// The op ran and failed.
  #[error("{message}")]
  Failed { message: String },

  /// The worker can't run this kind of op.
  #[error("unsupported op '{kind}'")]
  Unsupported { kind: &'static str },

  /// The worker observed cancellation.
  #[error("cancelled")]
  Cancelled,
}

impl WorkerError {
  pub fn failed(message: impl Into<String>) -> Self {
    Self::Failed {
      message: message.into(),
    }
  }
}

/// Executes a single vertex.
///
/// `inputs` holds one handle per input edge, in edge order. The returned
/// handles are indexed by output index. Implementations should return
/// promptly once `cancel` fires.
#[async_trait]
pub trait Worker: Send + Sync {
  async fn execute(
    &self,
    vertex: &Vertex,
    inputs: &[ResultHandle],
    cancel: CancellationToken,
  ) -> Result<Vec<ResultHandle>, WorkerError>;
}

/// A worker that runs nothing and fabricates one handle per output.
///
/// Useful for checking a graph's shape and scheduling without a backend.
#[derive(Debug, Clone, Default)]
pub struct DryRunWorker;

#[async_trait]
impl Worker for DryRunWorker {
  async fn execute(
    &self,
    vertex: &Vertex,
    inputs: &[ResultHandle],
    cancel: CancellationToken,
  ) -> Result<Vec<ResultHandle>, WorkerError> {
    if cancel.is_cancelled() {
      return Err(WorkerError::Cancelled);
    }
    debug!(
      digest = %vertex.digest(),
      name = %vertex.name(),
      inputs = inputs.len(),
      "dry_run"
    );
    Ok(
      (0..vertex.op().num_outputs())
        .map(|index| ResultHandle::new(format!("{}/{}", vertex.digest().short(), index)))
        .collect(),
    )
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::loader::{LoadOverrides, load};
  use strata_op::Platform;
  use strata_pipeline::{MarshalOptions, MountOptions, RunOptions, image, scratch};

  #[tokio::test]
  async fn test_dry_run_handle_per_output() {
    let exec = image("golang")
      .run(RunOptions::shell("go build -o /out/app"))
      .add_mount("/out", &scratch(), MountOptions::new())
      .unwrap();
    let def = exec
      .mount("/out")
      .unwrap()
      .marshal(&MarshalOptions::new().platform(Platform::linux_amd64()))
      .unwrap();
    let heads = load(&def, &LoadOverrides::default()).unwrap();
    let vertex = &heads[0].vertex;

    let handles = DryRunWorker
      .execute(vertex, &[ResultHandle::new("base")], CancellationToken::new())
      .await
      .unwrap();
    let short = vertex.digest().short();
    assert_eq!(
      handles,
      vec![
        ResultHandle::new(format!("{short}/0")),
        ResultHandle::new(format!("{short}/1")),
      ]
    );
  }

  #[tokio::test]
  async fn test_dry_run_observes_cancellation() {
    let def = image("alpine")
      .marshal(&MarshalOptions::new().platform(Platform::linux_amd64()))
      .unwrap();
    let heads = load(&def, &LoadOverrides::default()).unwrap();
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = DryRunWorker
      .execute(&heads[0].vertex, &[], cancel)
      .await
      .unwrap_err();
    assert!(matches!(err, WorkerError::Cancelled));
  }
}
