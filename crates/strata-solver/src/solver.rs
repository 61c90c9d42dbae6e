//! Scheduling, deduplication and caching of vertex executions.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use futures::future::{BoxFuture, Shared, join_all};
use strata_op::{Definition, Digest, OpKind};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::cache::{CacheKey, ResultCache};
use crate::error::{LoadError, SolveError};
use crate::events::{NoopNotifier, SolveEvent, SolveNotifier};
use crate::job::{Job, JobContext, JobGuard, SolveReport};
use crate::loader::{LoadOverrides, load};
use crate::vertex::{Edge, Vertex};
use crate::worker::{ResultHandle, Worker, WorkerError};

/// Outputs of one executed or cached vertex.
#[derive(Debug)]
pub(crate) struct Solved {
  pub outputs: Vec<ResultHandle>,
  pub cached: bool,
}

pub(crate) type Outcome = Result<Arc<Solved>, SolveError>;
pub(crate) type SharedOutcome = Shared<BoxFuture<'static, Outcome>>;

/// One execution shared by every job that asked for the same key.
///
/// The execution runs under its own token, cancelled only once every job
/// waiting on it has given up.
struct Flight {
  outcome: SharedOutcome,
  cancel: CancellationToken,
  waiters: usize,
}

/// One job's interest in a flight. Dropping it unreleased withdraws the job,
/// as if it had been cancelled.
struct Waiter<'a> {
  solver: &'a Solver,
  key: CacheKey,
  outcome: SharedOutcome,
  released: bool,
}

impl Waiter<'_> {
  fn release(&mut self, completed: bool) {
    if std::mem::replace(&mut self.released, true) {
      return;
    }
    let mut in_flight = self.solver.flights();
    if let Some(flight) = in_flight
      .get_mut(&self.key)
      .filter(|flight| flight.outcome.ptr_eq(&self.outcome))
    {
      flight.waiters -= 1;
      if completed {
        in_flight.remove(&self.key);
      } else if flight.waiters == 0 {
        flight.cancel.cancel();
        in_flight.remove(&self.key);
      }
    }
  }
}

impl Drop for Waiter<'_> {
  fn drop(&mut self) {
    self.release(false);
  }
}

/// Solver configuration.
#[derive(Debug, Clone)]
pub struct SolverConfig {
  /// Upper bound on vertices executing at once.
  pub max_concurrency: usize,
  /// Mixed into every cache key. Solvers with different salts never share
  /// cached results.
  pub cache_salt: Option<String>,
}

impl Default for SolverConfig {
  fn default() -> Self {
    Self {
      max_concurrency: std::thread::available_parallelism()
        .map(NonZeroUsize::get)
        .unwrap_or(4),
      cache_salt: None,
    }
  }
}

/// Solves vertex graphs against a worker and a result cache.
///
/// Cloning is cheap and clones share in-flight work: a vertex requested by
/// several concurrent solves executes once and every caller observes the
/// same result.
#[derive(Clone)]
pub struct Solver {
  inner: Arc<SolverInner>,
}

struct SolverInner {
  config: SolverConfig,
  worker: Arc<dyn Worker>,
  cache: Arc<dyn ResultCache>,
  notifier: Arc<dyn SolveNotifier>,
  limit: Arc<Semaphore>,
  in_flight: Mutex<HashMap<CacheKey, Flight>>,
}

impl Solver {
  pub fn new(config: SolverConfig, worker: Arc<dyn Worker>, cache: Arc<dyn ResultCache>) -> Self {
    Self::with_notifier(config, worker, cache, Arc::new(NoopNotifier))
  }

  pub fn with_notifier(
    config: SolverConfig,
    worker: Arc<dyn Worker>,
    cache: Arc<dyn ResultCache>,
    notifier: Arc<dyn SolveNotifier>,
  ) -> Self {
    let limit = Arc::new(Semaphore::new(config.max_concurrency.max(1)));
    Self {
      inner: Arc::new(SolverInner {
        config,
        worker,
        cache,
        notifier,
        limit,
        in_flight: Mutex::new(HashMap::new()),
      }),
    }
  }

  pub fn config(&self) -> &SolverConfig {
    &self.inner.config
  }

  /// Load `definition` and solve all of its heads.
  pub async fn solve_definition(
    &self,
    definition: &Definition,
    overrides: &LoadOverrides,
    cancel: CancellationToken,
  ) -> Result<SolveReport, LoadError> {
    let heads = load(definition, overrides)?;
    Ok(self.solve(&heads, overrides, cancel).await)
  }

  /// Solve `heads` in one solve.
  ///
  /// Inputs always complete before the vertices that consume them. A
  /// failure blocks only the failing vertex's dependents; independent parts
  /// of the graph still complete. Cancelling `cancel` stops further
  /// dispatch and signals running workers.
  #[instrument(name = "solve", skip_all, fields(heads = heads.len()))]
  pub async fn solve(
    &self,
    heads: &[Edge],
    overrides: &LoadOverrides,
    cancel: CancellationToken,
  ) -> SolveReport {
    let solve_id = uuid::Uuid::new_v4().to_string();
    let job = JobGuard::new(Job::new(
      self.clone(),
      JobContext {
        solve_id: solve_id.clone(),
        overrides: Arc::new(overrides.clone()),
        cancel,
      },
    ));

    info!(solve_id = %solve_id, heads = heads.len(), "solve_started");
    self.notify(SolveEvent::SolveStarted {
      solve_id: solve_id.clone(),
      heads: heads.len(),
    });

    let results = join_all(heads.iter().map(|head| job.solve_edge(head))).await;
    let report = SolveReport {
      solve_id: job.solve_id().to_string(),
      heads: results,
      vertices: job.finish(),
    };

    match report.first_error() {
      None => {
        info!(solve_id = %solve_id, vertices = report.vertices.len(), "solve_completed");
        self.notify(SolveEvent::SolveCompleted { solve_id });
      }
      Some(e) => {
        error!(solve_id = %solve_id, error = %e.describe(), "solve_failed");
        self.notify(SolveEvent::SolveFailed {
          solve_id,
          error: e.describe(),
        });
      }
    }
    report
  }

  /// Solve a single edge.
  pub async fn solve_edge(
    &self,
    edge: &Edge,
    overrides: &LoadOverrides,
    cancel: CancellationToken,
  ) -> Result<ResultHandle, SolveError> {
    let report = self
      .solve(std::slice::from_ref(edge), overrides, cancel)
      .await;
    report
      .heads
      .into_iter()
      .next()
      .unwrap_or_else(|| {
        Err(SolveError::Internal {
          message: "solve returned no result for its head".to_string(),
        })
      })
  }

  pub(crate) fn notify(&self, event: SolveEvent) {
    self.inner.notifier.notify(event);
  }

  fn flights(&self) -> MutexGuard<'_, HashMap<CacheKey, Flight>> {
    self
      .inner
      .in_flight
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Execute `vertex` unless the same key is already executing, in which
  /// case wait for that execution instead.
  ///
  /// Cancelling `ctx` only withdraws this job from the execution. The
  /// execution itself is cancelled when no job is left waiting on it.
  pub(crate) async fn execute_once(
    &self,
    ctx: &JobContext,
    vertex: &Arc<Vertex>,
    inputs: Vec<ResultHandle>,
  ) -> Outcome {
    if ctx.cancel.is_cancelled() {
      return Err(SolveError::Cancelled);
    }

    let key = CacheKey::new(vertex.digest(), self.inner.config.cache_salt.as_deref());
    let shared = {
      let mut in_flight = self.flights();
      match in_flight.get_mut(&key) {
        Some(flight) => {
          debug!(solve_id = %ctx.solve_id, digest = %vertex.digest(), "vertex_joined");
          flight.waiters += 1;
          flight.outcome.clone()
        }
        None => {
          let cancel = CancellationToken::new();
          let flight_ctx = JobContext {
            cancel: cancel.clone(),
            ..ctx.clone()
          };
          let outcome = self
            .clone()
            .run_vertex(flight_ctx, key.clone(), vertex.clone(), inputs)
            .boxed()
            .shared();
          in_flight.insert(
            key.clone(),
            Flight {
              outcome: outcome.clone(),
              cancel,
              waiters: 1,
            },
          );
          outcome
        }
      }
    };

    let mut waiter = Waiter {
      solver: self,
      key,
      outcome: shared,
      released: false,
    };
    let outcome = tokio::select! {
      outcome = waiter.outcome.clone() => Some(outcome),
      _ = ctx.cancel.cancelled() => None,
    };
    waiter.release(outcome.is_some());

    outcome.unwrap_or_else(|| {
      warn!(solve_id = %ctx.solve_id, digest = %vertex.digest(), "vertex_cancelled");
      Err(SolveError::Cancelled)
    })
  }

  async fn run_vertex(
    self,
    ctx: JobContext,
    key: CacheKey,
    vertex: Arc<Vertex>,
    inputs: Vec<ResultHandle>,
  ) -> Outcome {
    let digest = vertex.digest().clone();
    let name = vertex.name();

    if ctx.cancel.is_cancelled() {
      return Err(SolveError::Cancelled);
    }

    if !vertex.ignore_cache() {
      match self.inner.cache.get(&key).await {
        Ok(Some(outputs)) => {
          info!(solve_id = %ctx.solve_id, digest = %digest, name = %name, "vertex_cached");
          self.notify(SolveEvent::VertexCached {
            solve_id: ctx.solve_id.clone(),
            digest,
            name,
          });
          return Ok(Arc::new(Solved {
            outputs,
            cached: true,
          }));
        }
        Ok(None) => {}
        Err(e) => {
          warn!(solve_id = %ctx.solve_id, digest = %digest, error = %e, "cache_read_failed");
        }
      }
    }

    let result = match &vertex.op().op {
      OpKind::Build(build) => {
        self.started(&ctx, &digest, &name);
        self.solve_nested(&ctx, &digest, &build.definition).await
      }
      _ => self.dispatch(&ctx, &vertex, &name, inputs).await,
    };

    match result {
      Ok(outputs) => {
        if let Err(e) = self.inner.cache.put(&key, &outputs).await {
          warn!(solve_id = %ctx.solve_id, digest = %digest, error = %e, "cache_write_failed");
        }
        info!(
          solve_id = %ctx.solve_id,
          digest = %digest,
          name = %name,
          outputs = outputs.len(),
          "vertex_completed"
        );
        self.notify(SolveEvent::VertexCompleted {
          solve_id: ctx.solve_id.clone(),
          digest,
          name,
          outputs: outputs.clone(),
        });
        Ok(Arc::new(Solved {
          outputs,
          cached: false,
        }))
      }
      Err(SolveError::Cancelled) => {
        warn!(solve_id = %ctx.solve_id, digest = %digest, "vertex_cancelled");
        Err(SolveError::Cancelled)
      }
      Err(e) => {
        error!(
          solve_id = %ctx.solve_id,
          digest = %digest,
          name = %name,
          error = %e.describe(),
          "vertex_failed"
        );
        self.notify(SolveEvent::VertexFailed {
          solve_id: ctx.solve_id.clone(),
          digest,
          name,
          error: e.describe(),
        });
        Err(e)
      }
    }
  }

  fn started(&self, ctx: &JobContext, digest: &Digest, name: &str) {
    info!(solve_id = %ctx.solve_id, digest = %digest, name = %name, "vertex_started");
    self.notify(SolveEvent::VertexStarted {
      solve_id: ctx.solve_id.clone(),
      digest: digest.clone(),
      name: name.to_string(),
    });
  }

  /// Run the vertex on the worker, holding a concurrency permit for the
  /// duration of the execution.
  async fn dispatch(
    &self,
    ctx: &JobContext,
    vertex: &Arc<Vertex>,
    name: &str,
    inputs: Vec<ResultHandle>,
  ) -> Result<Vec<ResultHandle>, SolveError> {
    let permit = tokio::select! {
      permit = self.inner.limit.clone().acquire_owned() => {
        permit.map_err(|e| SolveError::Internal { message: e.to_string() })?
      }
      _ = ctx.cancel.cancelled() => return Err(SolveError::Cancelled),
    };

    self.started(ctx, vertex.digest(), name);

    let worker = self.inner.worker.clone();
    let task_vertex = vertex.clone();
    let token = ctx.cancel.child_token();
    let task_token = token.clone();
    let handle = tokio::spawn(async move {
      let _permit = permit;
      worker.execute(&task_vertex, &inputs, task_token).await
    });

    let joined = tokio::select! {
      joined = handle => joined,
      _ = ctx.cancel.cancelled() => {
        token.cancel();
        return Err(SolveError::Cancelled);
      }
    };

    let result = joined.map_err(|e| SolveError::Internal {
      message: format!("worker task join error: {}", e),
    })?;
    result.map_err(|source| match source {
      WorkerError::Cancelled => SolveError::Cancelled,
      source => SolveError::Failed {
        digest: vertex.digest().clone(),
        name: name.to_string(),
        source,
      },
    })
  }

  /// Solve the first head of a nested definition as this vertex's output.
  fn solve_nested(
    &self,
    ctx: &JobContext,
    digest: &Digest,
    definition: &Definition,
  ) -> BoxFuture<'static, Result<Vec<ResultHandle>, SolveError>> {
    let nested_load_error = |message: String| SolveError::NestedLoad {
      digest: digest.clone(),
      message,
    };
    let head = match load(definition, &ctx.overrides) {
      Ok(heads) => heads.into_iter().next(),
      Err(e) => return futures::future::ready(Err(nested_load_error(e.to_string()))).boxed(),
    };
    let Some(head) = head else {
      return futures::future::ready(Err(nested_load_error("no heads".to_string()))).boxed();
    };

    let job = Job::new(self.clone(), ctx.clone());
    async move {
      let job = JobGuard::new(job);
      let handle = job.solve_edge(&head).await?;
      Ok(vec![handle])
    }
    .boxed()
  }
}

#[cfg(test)]
mod tests {
  use std::sync::atomic::{AtomicUsize, Ordering};
  use std::time::Duration;

  use async_trait::async_trait;
  use strata_op::Platform;
  use strata_pipeline::{MarshalOptions, image};

  use super::*;
  use crate::cache::MemoryCache;

  /// Runs until cancelled.
  #[derive(Default)]
  struct Stalled {
    started: AtomicUsize,
    cancelled: AtomicUsize,
  }

  #[async_trait]
  impl Worker for Stalled {
    async fn execute(
      &self,
      _vertex: &Vertex,
      _inputs: &[ResultHandle],
      cancel: CancellationToken,
    ) -> Result<Vec<ResultHandle>, WorkerError> {
      self.started.fetch_add(1, Ordering::SeqCst);
      cancel.cancelled().await;
      self.cancelled.fetch_add(1, Ordering::SeqCst);
      Err(WorkerError::Cancelled)
    }
  }

  fn alpine() -> Vec<Edge> {
    let def = image("alpine")
      .marshal(&MarshalOptions::new().platform(Platform::linux_amd64()))
      .unwrap();
    load(&def, &LoadOverrides::default()).unwrap()
  }

  fn context() -> JobContext {
    JobContext {
      solve_id: "test".to_string(),
      overrides: Arc::new(LoadOverrides::default()),
      cancel: CancellationToken::new(),
    }
  }

  #[tokio::test]
  async fn test_abandoned_job_releases_its_work() {
    let worker = Arc::new(Stalled::default());
    let solver = Solver::new(
      SolverConfig::default(),
      worker.clone(),
      Arc::new(MemoryCache::new()),
    );
    let heads = alpine();

    let job = Job::new(solver.clone(), context());
    let guard = JobGuard::new(job.clone());
    let pending = tokio::time::timeout(Duration::from_millis(50), guard.solve_edge(&heads[0])).await;
    assert!(pending.is_err());
    assert_eq!(worker.started.load(Ordering::SeqCst), 1);
    assert_eq!(solver.flights().len(), 1);
    assert!(Arc::strong_count(&job) > 2);

    drop(guard);
    assert_eq!(Arc::strong_count(&job), 1);
    assert!(solver.flights().is_empty());

    tokio::time::timeout(Duration::from_secs(1), async {
      while worker.cancelled.load(Ordering::SeqCst) == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
      }
    })
    .await
    .expect("worker observes the withdrawn execution");
  }

  #[tokio::test]
  async fn test_flight_survives_one_waiter_leaving() {
    let worker = Arc::new(Stalled::default());
    let solver = Solver::new(
      SolverConfig::default(),
      worker.clone(),
      Arc::new(MemoryCache::new()),
    );
    let vertex = alpine()[0].vertex.clone();

    let first = context();
    let second = context();
    let leaving = solver.execute_once(&first, &vertex, Vec::new());
    let staying = solver.execute_once(&second, &vertex, Vec::new());
    tokio::pin!(leaving);
    tokio::pin!(staying);

    let wait = Duration::from_millis(20);
    assert!(tokio::time::timeout(wait, &mut leaving).await.is_err());
    assert!(tokio::time::timeout(wait, &mut staying).await.is_err());
    assert_eq!(solver.flights().values().next().map(|f| f.waiters), Some(2));

    first.cancel.cancel();
    assert!(matches!(leaving.await, Err(SolveError::Cancelled)));
    assert_eq!(solver.flights().values().next().map(|f| f.waiters), Some(1));
    assert!(tokio::time::timeout(wait, &mut staying).await.is_err());
    assert_eq!(worker.cancelled.load(Ordering::SeqCst), 0);

    second.cancel.cancel();
    assert!(matches!(staying.await, Err(SolveError::Cancelled)));
    assert!(solver.flights().is_empty());
    assert_eq!(worker.started.load(Ordering::SeqCst), 1);
  }
}
