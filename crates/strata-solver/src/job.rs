//! A single solve.
//!
//! A job memoizes one future per vertex so that a vertex shared by several
//! consumers is awaited, not re-run, within the solve. Each vertex waits for
//! its inputs and either blocks on a failed input or hands itself to the
//! solver for execution.

use std::collections::{BTreeMap, HashMap};
use std::ops::Deref;
use std::sync::{Arc, Mutex, PoisonError};

use futures::FutureExt;
use futures::future::join_all;
use serde::Serialize;
use strata_op::Digest;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::SolveError;
use crate::events::SolveEvent;
use crate::loader::LoadOverrides;
use crate::solver::{Outcome, SharedOutcome, Solved, Solver};
use crate::vertex::{Edge, Vertex};
use crate::worker::ResultHandle;

/// What happened to a vertex during a solve.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum VertexStatus {
  Completed {
    cached: bool,
    outputs: Vec<ResultHandle>,
  },
  Failed {
    error: String,
  },
  /// Never dispatched because `origin` failed.
  Blocked {
    origin: Digest,
  },
  Cancelled,
}

/// Result of a solve.
#[derive(Debug, Clone)]
pub struct SolveReport {
  pub solve_id: String,
  /// One result per requested head, in request order.
  pub heads: Vec<Result<ResultHandle, SolveError>>,
  /// Status of every vertex the solve reached.
  pub vertices: BTreeMap<Digest, VertexStatus>,
}

impl SolveReport {
  pub fn is_success(&self) -> bool {
    self.heads.iter().all(Result::is_ok)
  }

  pub fn first_error(&self) -> Option<&SolveError> {
    self.heads.iter().find_map(|head| head.as_ref().err())
  }

  pub fn status(&self, digest: &Digest) -> Option<&VertexStatus> {
    self.vertices.get(digest)
  }

  /// Every head's handle, or the first error.
  pub fn outputs(&self) -> Result<Vec<ResultHandle>, SolveError> {
    self.heads.iter().cloned().collect()
  }

  /// Vertices whose own execution failed.
  pub fn failures(&self) -> impl Iterator<Item = (&Digest, &str)> {
    self.vertices.iter().filter_map(|(digest, status)| match status {
      VertexStatus::Failed { error } => Some((digest, error.as_str())),
      _ => None,
    })
  }
}

/// What every vertex of a solve shares.
#[derive(Debug, Clone)]
pub(crate) struct JobContext {
  pub solve_id: String,
  pub overrides: Arc<LoadOverrides>,
  pub cancel: CancellationToken,
}

/// Finishes the job when dropped, so a solve that errors out or is abandoned
/// midway still releases its memoized futures.
pub(crate) struct JobGuard(Arc<Job>);

impl JobGuard {
  pub(crate) fn new(job: Arc<Job>) -> Self {
    Self(job)
  }
}

impl Deref for JobGuard {
  type Target = Arc<Job>;

  fn deref(&self) -> &Arc<Job> {
    &self.0
  }
}

impl Drop for JobGuard {
  fn drop(&mut self) {
    self.0.finish();
  }
}

pub(crate) struct Job {
  solver: Solver,
  ctx: JobContext,
  memo: Mutex<HashMap<Digest, SharedOutcome>>,
  statuses: Mutex<BTreeMap<Digest, VertexStatus>>,
}

impl Job {
  pub(crate) fn new(solver: Solver, ctx: JobContext) -> Arc<Self> {
    Arc::new(Self {
      solver,
      ctx,
      memo: Mutex::new(HashMap::new()),
      statuses: Mutex::new(BTreeMap::new()),
    })
  }

  pub(crate) fn solve_id(&self) -> &str {
    &self.ctx.solve_id
  }

  /// Solve the vertex behind `edge` and pick the edge's output.
  pub(crate) async fn solve_edge(self: &Arc<Self>, edge: &Edge) -> Result<ResultHandle, SolveError> {
    let solved = self.vertex_future(&edge.vertex).await?;
    select_output(edge, &solved)
  }

  /// Drop the memoized futures and return the statuses recorded so far.
  pub(crate) fn finish(&self) -> BTreeMap<Digest, VertexStatus> {
    let memo = std::mem::take(&mut *self.memo.lock().unwrap_or_else(PoisonError::into_inner));
    drop(memo);
    std::mem::take(&mut *self.statuses.lock().unwrap_or_else(PoisonError::into_inner))
  }

  fn vertex_future(self: &Arc<Self>, vertex: &Arc<Vertex>) -> SharedOutcome {
    let mut memo = self.memo.lock().unwrap_or_else(PoisonError::into_inner);
    if let Some(existing) = memo.get(vertex.digest()) {
      return existing.clone();
    }
    let job = self.clone();
    let target = vertex.clone();
    let future = async move { job.run(target).await }.boxed().shared();
    memo.insert(vertex.digest().clone(), future.clone());
    future
  }

  async fn run(self: Arc<Self>, vertex: Arc<Vertex>) -> Outcome {
    let inputs = join_all(vertex.inputs().iter().map(|edge| {
      let future = self.vertex_future(&edge.vertex);
      async move { (edge, future.await) }
    }))
    .await;

    let mut handles = Vec::with_capacity(inputs.len());
    for (edge, outcome) in inputs {
      match outcome.and_then(|solved| select_output(edge, &solved)) {
        Ok(handle) => handles.push(handle),
        Err(SolveError::Cancelled) => {
          self.record(&vertex, VertexStatus::Cancelled);
          return Err(SolveError::Cancelled);
        }
        Err(e) => return Err(self.block(&vertex, edge, &e)),
      }
    }

    let outcome = self
      .solver
      .execute_once(&self.ctx, &vertex, handles)
      .await;
    let status = match &outcome {
      Ok(solved) => VertexStatus::Completed {
        cached: solved.cached,
        outputs: solved.outputs.clone(),
      },
      Err(SolveError::Cancelled) => VertexStatus::Cancelled,
      Err(e) => VertexStatus::Failed {
        error: e.describe(),
      },
    };
    self.record(&vertex, status);
    outcome
  }

  fn block(&self, vertex: &Vertex, input: &Edge, cause: &SolveError) -> SolveError {
    let origin = cause
      .origin()
      .cloned()
      .unwrap_or_else(|| input.vertex.digest().clone());
    warn!(
      solve_id = %self.ctx.solve_id,
      digest = %vertex.digest(),
      origin = %origin,
      "vertex_blocked"
    );
    self.solver.notify(SolveEvent::VertexBlocked {
      solve_id: self.ctx.solve_id.clone(),
      digest: vertex.digest().clone(),
      name: vertex.name(),
      origin: origin.clone(),
    });
    self.record(
      vertex,
      VertexStatus::Blocked {
        origin: origin.clone(),
      },
    );
    SolveError::Blocked {
      digest: vertex.digest().clone(),
      origin,
    }
  }

  fn record(&self, vertex: &Vertex, status: VertexStatus) {
    let mut statuses = self.statuses.lock().unwrap_or_else(PoisonError::into_inner);
    statuses.insert(vertex.digest().clone(), status);
  }
}

fn select_output(edge: &Edge, solved: &Solved) -> Result<ResultHandle, SolveError> {
  solved
    .outputs
    .get(edge.index as usize)
    .cloned()
    .ok_or_else(|| SolveError::MissingOutput {
      digest: edge.vertex.digest().clone(),
      index: edge.index,
      available: solved.outputs.len(),
    })
}
