//! Solve events and notifiers.
//!
//! Events let callers follow a solve as it happens: render progress, persist
//! results or collect them in tests.

use serde::{Deserialize, Serialize};
use strata_op::Digest;
use tokio::sync::mpsc;

use crate::worker::ResultHandle;

/// Events emitted while solving.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum SolveEvent {
  /// A solve has started.
  SolveStarted { solve_id: String, heads: usize },

  /// A vertex was handed to the worker.
  VertexStarted {
    solve_id: String,
    digest: Digest,
    name: String,
  },

  /// A vertex was satisfied from the result cache.
  VertexCached {
    solve_id: String,
    digest: Digest,
    name: String,
  },

  /// A vertex executed successfully.
  VertexCompleted {
    solve_id: String,
    digest: Digest,
    name: String,
    outputs: Vec<ResultHandle>,
  },

  /// A vertex failed to execute.
  VertexFailed {
    solve_id: String,
    digest: Digest,
    name: String,
    error: String,
  },

  /// A vertex was not dispatched because a dependency failed.
  VertexBlocked {
    solve_id: String,
    digest: Digest,
    name: String,
    origin: Digest,
  },

  /// Every head was solved.
  SolveCompleted { solve_id: String },

  /// At least one head could not be solved.
  SolveFailed { solve_id: String, error: String },
}

/// Receives solve events.
///
/// The solver calls `notify` inline, so implementations should not block.
pub trait SolveNotifier: Send + Sync {
  fn notify(&self, event: SolveEvent);
}

/// Discards all events.
#[derive(Debug, Clone, Default)]
pub struct NoopNotifier;

impl SolveNotifier for NoopNotifier {
  fn notify(&self, _event: SolveEvent) {}
}

/// Sends events to an unbounded channel.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
  sender: mpsc::UnboundedSender<SolveEvent>,
}

impl ChannelNotifier {
  pub fn new(sender: mpsc::UnboundedSender<SolveEvent>) -> Self {
    Self { sender }
  }

  /// A notifier and the receiving end of its channel.
  pub fn channel() -> (Self, mpsc::UnboundedReceiver<SolveEvent>) {
    let (sender, receiver) = mpsc::unbounded_channel();
    (Self::new(sender), receiver)
  }
}

impl SolveNotifier for ChannelNotifier {
  fn notify(&self, event: SolveEvent) {
    // Receiver dropped means nobody is listening.
    let _ = self.sender.send(event);
  }
}
