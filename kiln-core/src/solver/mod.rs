//! The solver / job engine.
//!
//! Executes one or more jobs, each rooted at a terminal vertex of a build
//! definition, sharing work among themselves and with earlier builds via the
//! cache store. Each (vertex, fast-key) pair is owned by at most one task at
//! a time; a job arriving on an in-flight key joins the existing task.
//! Joined jobs share cancellation: a task keeps running while at least one
//! waiter subscribes and is cancelled when the last one leaves.
//!
//! Per-vertex flow: once all predecessors are finalized the task probes the
//! store under the structural fast key; on a miss it computes the content
//! slow key (when the op declares one) and probes again; only then does it
//! execute in the worker, gated by the parallelism cap. Merge and diff
//! vertices never execute; their results are derived from input layer
//! chains.

use crate::cachekey::{CacheKeyEngine, SlowKeyPart};
use crate::config::SolverConfig;
use crate::digest::Digest;
use crate::error::{KilnError, Result, SourceLocation};
use crate::store::{CacheRecord, CacheStore, NormalizedLink, StoredResult};
use crate::types::{Definition, LayerChain, Op, Vertex, WorkerResult};
use crate::worker::{ResultLease, Worker};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::{watch, Semaphore};
use tracing::{debug, info, warn};

pub mod progress;
mod task;

pub use progress::{ProgressBus, ProgressEvent, ProgressSubscriber, VertexState};
pub use task::TaskOutput;

use progress::ProgressBus as Bus;
use task::{SolveTask, TaskResult, TaskWaiter};

/// A validated definition with every fast key computed up front.
struct SolveGraph {
    vertices: Vec<Vertex>,
    fast_keys: Vec<Digest>,
}

/// The result of a completed job.
#[derive(Debug, Clone)]
pub struct SolveOutput {
    /// Lease over the terminal vertex's result; dropping the last clone
    /// releases the worker handle.
    pub lease: ResultLease,
    pub vertex: Digest,
    pub fast_key: Digest,
    pub slow_key: Option<Digest>,
    /// True when the terminal vertex was satisfied from cache.
    pub from_cache: bool,
}

impl SolveOutput {
    pub fn chain(&self) -> &LayerChain {
        self.lease.chain()
    }
}

/// The solver. Construct once with explicit configuration and share via
/// `Arc`; there are no ambient globals.
pub struct Solver {
    config: SolverConfig,
    store: Arc<CacheStore>,
    worker: Arc<dyn Worker>,
    engine: CacheKeyEngine,
    progress: ProgressBus,
    tasks: Mutex<HashMap<Digest, Weak<SolveTask>>>,
    exec_slots: Arc<Semaphore>,
    source_maps: Mutex<HashMap<Digest, Vec<SourceLocation>>>,
}

impl Solver {
    pub fn new(config: SolverConfig, store: Arc<CacheStore>, worker: Arc<dyn Worker>) -> Arc<Self> {
        let progress = ProgressBus::new(config.progress_buffer);
        let exec_slots = Arc::new(Semaphore::new(config.max_parallelism.max(1)));
        Arc::new(Self {
            config,
            store,
            worker,
            engine: CacheKeyEngine::new(),
            progress,
            tasks: Mutex::new(HashMap::new()),
            exec_slots,
            source_maps: Mutex::new(HashMap::new()),
        })
    }

    /// Open the cache store at the configured path and build a solver on it.
    pub async fn open(config: SolverConfig, worker: Arc<dyn Worker>) -> Result<Arc<Self>> {
        let store = Arc::new(CacheStore::new(&config.cache_db_path).await?);
        Ok(Self::new(config, store, worker))
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    /// Drop cache records older than the configured keep duration.
    pub async fn prune_cache(&self) -> Result<u64> {
        self.store.prune(self.config.keep_duration_secs).await
    }

    pub fn store(&self) -> &Arc<CacheStore> {
        &self.store
    }

    pub fn progress(&self) -> &ProgressBus {
        &self.progress
    }

    /// Register a source-map location for a vertex; worker failures on that
    /// vertex carry every registered location.
    pub fn register_source(&self, vertex: &Digest, location: SourceLocation) {
        let mut maps = self.source_maps.lock().unwrap_or_else(|e| e.into_inner());
        maps.entry(vertex.clone()).or_default().push(location);
    }

    /// Join the task owning `index`'s fast key, spawning it if absent.
    fn spawn_or_join(self: Arc<Self>, graph: &Arc<SolveGraph>, index: usize, job: &str) -> TaskWaiter {
        let fast_key = graph.fast_keys[index].clone();
        let mut tasks = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
        tasks.retain(|_, weak| weak.strong_count() > 0);

        if let Some(existing) = tasks.get(&fast_key).and_then(Weak::upgrade) {
            // Cancelled tasks are not joinable; a fresh task replaces them.
            if !existing.is_cancelled() {
                debug!(key = %fast_key.short(), job, "Joining in-flight task");
                return SolveTask::subscribe(&existing);
            }
        }

        let task = SolveTask::new(fast_key.clone(), graph.vertices[index].digest.clone());
        // Subscribe before the runner starts so the new task cannot observe
        // zero waiters.
        let waiter = SolveTask::subscribe(&task);
        tasks.insert(fast_key, Arc::downgrade(&task));
        drop(tasks);

        let graph = graph.clone();
        let job = job.to_string();
        let runner = task.clone();
        tokio::spawn(async move {
            self.run_task(graph, index, runner, job).await;
        });
        waiter
    }

    async fn run_task(self: Arc<Self>, graph: Arc<SolveGraph>, index: usize, task: Arc<SolveTask>, job: String) {
        let name = graph.vertices[index].name.clone();
        if let Err(e) = self.step(&task, &job, &name, VertexState::Requested, false) {
            task.complete(Err(e));
            return;
        }

        let mut cancel_rx = task.cancelled();
        let outcome = tokio::select! {
            outcome = self.clone().evaluate(graph.clone(), index, task.clone(), job.clone()) => outcome,
            // Dropping the evaluation future aborts in-flight worker calls
            // and rolls back any open store transaction.
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => Err(Arc::new(KilnError::Cancelled)),
        };

        match &outcome {
            Ok(output) => {
                let cached = output.from_cache;
                if let Err(e) = self.step(&task, &job, &name, VertexState::Finalized, cached) {
                    task.complete(Err(e));
                    return;
                }
            }
            Err(e) if e.is_cancelled() => {
                let _ = task.transition(VertexState::Cancelled);
                self.progress.publish(Bus::event(&job, &task.vertex, &name, VertexState::Cancelled, false));
            }
            Err(e) => {
                let _ = task.transition(VertexState::Failed);
                self.progress.publish(Bus::event(&job, &task.vertex, &name, VertexState::Failed, false));
                warn!(vertex = %task.vertex.short(), "Vertex failed: {}", e);
            }
        }
        task.complete(outcome);
    }

    async fn evaluate(self: Arc<Self>, graph: Arc<SolveGraph>, index: usize, task: Arc<SolveTask>, job: String) -> TaskResult {
        let vertex = &graph.vertices[index];
        let fast_key = &graph.fast_keys[index];

        // Predecessors first: every input runs as its own task, so driving
        // them is starting them all and awaiting each outcome.
        let waiters: Vec<TaskWaiter> = vertex
            .inputs
            .iter()
            .map(|input| self.clone().spawn_or_join(&graph, input.vertex, &job))
            .collect();
        let mut inputs = Vec::with_capacity(waiters.len());
        for waiter in &waiters {
            inputs.push(waiter.wait().await?);
        }

        self.step(&task, &job, &vertex.name, VertexState::Keying, false)?;

        if !vertex.op.executes() {
            // Merge and diff resolve by chain algebra; no probe, no exec.
            let lease = self.derive(vertex, &inputs, &task, &job).await?;
            self.persist(fast_key, None, vertex, &inputs, &lease).await?;
            return Ok(TaskOutput {
                lease,
                fast_key: fast_key.clone(),
                slow_key: None,
                from_cache: false,
            });
        }

        // Structural probe.
        if let Some(mut output) = self.try_adopt(fast_key, vertex).await {
            self.step(&task, &job, &vertex.name, VertexState::Reused, true)?;
            output.fast_key = fast_key.clone();
            return Ok(output);
        }

        // Content probe, when the op declares slow keying for any input.
        let mut slow_key = None;
        if (0..vertex.inputs.len()).any(|i| vertex.op.content_based(i)) {
            self.step(&task, &job, &vertex.name, VertexState::ContentKeying, false)?;
            slow_key = self.slow_key_for(vertex, &inputs).await;
            if let Some(sk) = &slow_key {
                if let Some(mut output) = self.try_adopt(sk, vertex).await {
                    // Backfill the structural key so the next probe hits
                    // without a content pass.
                    self.persist(fast_key, None, vertex, &inputs, &output.lease).await?;
                    self.step(&task, &job, &vertex.name, VertexState::Reused, true)?;
                    output.fast_key = fast_key.clone();
                    output.slow_key = slow_key.clone();
                    return Ok(output);
                }
            }
        }

        // Miss on every key: execute. The semaphore caps concurrent worker
        // invocations; probes above never wait on it.
        self.step(&task, &job, &vertex.name, VertexState::Executing, false)?;
        let permit = self
            .exec_slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Arc::new(KilnError::Internal("solver shut down".into())))?;
        let input_leases: Vec<ResultLease> = inputs.iter().map(|i| i.lease.clone()).collect();
        let exec = self.worker.exec(&vertex.op, &input_leases).await;
        drop(permit);

        let result = exec.map_err(|e| self.worker_error(vertex, e))?;
        let lease = ResultLease::new(self.worker.clone(), result);
        self.persist(fast_key, slow_key.as_ref(), vertex, &inputs, &lease).await?;

        Ok(TaskOutput { lease, fast_key: fast_key.clone(), slow_key, from_cache: false })
    }

    /// Attempt to adopt a stored result under `key`.
    ///
    /// Read failures degrade to a miss. Adoption is atomic: the handle is
    /// pinned by `materialize` and released again if the record cannot be
    /// verified against it.
    async fn try_adopt(&self, key: &Digest, vertex: &Vertex) -> Option<TaskOutput> {
        let records = match self.store.load(key).await {
            Ok(records) => records,
            Err(e) => {
                warn!(key = %key.short(), "Cache read failed, treating as miss: {}", e);
                return None;
            }
        };

        for record in records {
            for stored in &record.results {
                let candidate = WorkerResult {
                    id: stored.result_id.clone(),
                    chain: stored.chain.clone(),
                    created_at: stored.created_at,
                };
                match self.worker.materialize(&candidate).await {
                    Ok(chain) if chain == stored.chain => {
                        debug!(key = %key.short(), vertex = %vertex.digest.short(), "Adopted cached result");
                        let lease = ResultLease::new(self.worker.clone(), candidate);
                        return Some(TaskOutput {
                            lease,
                            fast_key: key.clone(),
                            slow_key: None,
                            from_cache: true,
                        });
                    }
                    Ok(_) => {
                        // Ref already bumped but the record does not match
                        // what materialized: roll the adoption back.
                        warn!(key = %key.short(), "Unverifiable cache record, rolling back adoption");
                        if let Err(e) = self.worker.release(&candidate).await {
                            warn!("Rollback release failed: {}", e);
                        }
                    }
                    Err(e) => {
                        debug!(key = %key.short(), "Stored result not adoptable: {}", e);
                    }
                }
            }
        }
        None
    }

    /// Compute the content slow key, or `None` when any declared input's
    /// digest is unavailable (skip, not error).
    async fn slow_key_for(&self, vertex: &Vertex, inputs: &[TaskOutput]) -> Option<Digest> {
        let mut parts = Vec::new();
        for (i, input) in vertex.inputs.iter().enumerate() {
            if !vertex.op.content_based(i) {
                continue;
            }
            let result = inputs[i].lease.result();
            let content = match self.engine.cached_content(&result.id, &input.selector) {
                Some(cached) => cached,
                None => {
                    let answer = match self.worker.content_digest(result, &input.selector).await {
                        Ok(answer) => answer,
                        Err(e) => {
                            debug!(vertex = %vertex.digest.short(), input = i, "Content digest failed: {}", e);
                            None
                        }
                    };
                    self.engine.record_content(&result.id, &input.selector, answer.clone());
                    answer
                }
            };
            match content {
                Some(digest) => {
                    parts.push(SlowKeyPart { input: i, selector: input.selector.clone(), content: digest })
                }
                None => return None,
            }
        }
        if parts.is_empty() {
            None
        } else {
            Some(self.engine.slow_key(&parts))
        }
    }

    /// Derive a merge or diff result from input chains.
    async fn derive(
        &self,
        vertex: &Vertex,
        inputs: &[TaskOutput],
        task: &Arc<SolveTask>,
        job: &str,
    ) -> std::result::Result<ResultLease, Arc<KilnError>> {
        match &vertex.op {
            Op::Merge(_) => {
                let mut chain = LayerChain::default();
                for input in inputs {
                    chain = chain.concat(input.lease.chain());
                }
                let result = WorkerResult::new(format!("derived-{}", uuid::Uuid::new_v4()), chain);
                let children = inputs.iter().map(|i| i.lease.clone()).collect();
                Ok(ResultLease::derived(result, children))
            }
            Op::Diff(_) => {
                let lower = inputs[0].lease.chain();
                let upper = inputs[1].lease.chain();
                match upper.strip_prefix(lower) {
                    Some(chain) => {
                        let result =
                            WorkerResult::new(format!("derived-{}", uuid::Uuid::new_v4()), chain);
                        Ok(ResultLease::derived(result, vec![inputs[1].lease.clone()]))
                    }
                    None => {
                        // Chains do not share a prefix; the worker has to
                        // materialize the difference.
                        self.step(task, job, &vertex.name, VertexState::Executing, false)?;
                        let permit = self
                            .exec_slots
                            .clone()
                            .acquire_owned()
                            .await
                            .map_err(|_| Arc::new(KilnError::Internal("solver shut down".into())))?;
                        let leases: Vec<ResultLease> =
                            inputs.iter().map(|i| i.lease.clone()).collect();
                        let exec = self.worker.exec(&vertex.op, &leases).await;
                        drop(permit);
                        let result = exec.map_err(|e| self.worker_error(vertex, e))?;
                        Ok(ResultLease::new(self.worker.clone(), result))
                    }
                }
            }
            _ => Err(Arc::new(KilnError::Internal(format!(
                "derive called on executable op {}",
                vertex.digest
            )))),
        }
    }

    /// Persist the record for a freshly computed result, its input links,
    /// and the slow-key alias when one was computed. Write failures are
    /// fatal to the task; reads elsewhere merely degrade.
    async fn persist(
        &self,
        fast_key: &Digest,
        slow_key: Option<&Digest>,
        vertex: &Vertex,
        inputs: &[TaskOutput],
        lease: &ResultLease,
    ) -> std::result::Result<(), Arc<KilnError>> {
        let record = CacheRecord {
            vertex: vertex.digest.clone(),
            results: vec![StoredResult {
                result_id: lease.result().id.clone(),
                chain: lease.chain().clone(),
                created_at: lease.result().created_at,
            }],
            created_at: Utc::now(),
        };
        self.store.save(fast_key, &record).await.map_err(Arc::new)?;

        for (i, input) in vertex.inputs.iter().enumerate() {
            let link = NormalizedLink {
                vertex: vertex.digest.clone(),
                input: i,
                selector: input.selector.clone(),
            };
            self.store.add_link(&inputs[i].fast_key, &link, fast_key).await.map_err(Arc::new)?;
        }

        if let Some(sk) = slow_key {
            // Alias the same record under the content key.
            self.store.save(sk, &record).await.map_err(Arc::new)?;
        }
        Ok(())
    }

    fn step(
        &self,
        task: &Arc<SolveTask>,
        job: &str,
        name: &str,
        state: VertexState,
        cached: bool,
    ) -> std::result::Result<(), Arc<KilnError>> {
        task.transition(state)?;
        self.progress.publish(Bus::event(job, &task.vertex, name, state, cached));
        Ok(())
    }

    fn worker_error(&self, vertex: &Vertex, err: KilnError) -> Arc<KilnError> {
        if err.is_cancelled() {
            return Arc::new(err);
        }
        let locations = {
            let maps = self.source_maps.lock().unwrap_or_else(|e| e.into_inner());
            maps.get(&vertex.digest).cloned().unwrap_or_default()
        };
        Arc::new(KilnError::Worker {
            vertex: vertex.digest.clone(),
            locations,
            reason: err.to_string(),
        })
    }
}

/// A client-submitted request to compute a terminal vertex.
pub struct Job {
    id: String,
    solver: Arc<Solver>,
    cancel_tx: watch::Sender<bool>,
}

impl Job {
    /// Create a job rooted at `solver`.
    pub fn new(solver: &Arc<Solver>, id: impl Into<String>) -> Job {
        let (cancel_tx, _) = watch::channel(false);
        Job { id: id.into(), solver: solver.clone(), cancel_tx }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Solve the definition's terminal vertex.
    pub async fn build(&self, definition: &Definition) -> Result<SolveOutput> {
        definition.validate()?;
        let vertices = definition.vertices();
        let fast_keys = self.solver.engine.fast_keys(&vertices)?;
        let graph = Arc::new(SolveGraph { vertices, fast_keys });
        let target = definition.target();

        info!(job = %self.id, vertices = graph.vertices.len(), "Starting build");

        let waiter = self.solver.clone().spawn_or_join(&graph, target, &self.id);
        let mut cancel_rx = self.cancel_tx.subscribe();
        let outcome = tokio::select! {
            outcome = waiter.wait() => outcome,
            _ = cancel_rx.wait_for(|cancelled| *cancelled) => return Err(KilnError::Cancelled),
        };

        match outcome {
            Ok(output) => Ok(SolveOutput {
                vertex: graph.vertices[target].digest.clone(),
                fast_key: output.fast_key,
                slow_key: output.slow_key,
                lease: output.lease,
                from_cache: output.from_cache,
            }),
            Err(err) => Err(shared_error(&err)),
        }
    }

    /// Cancel this job. Tasks it subscribes to keep running while any other
    /// job still waits on them.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }
}

/// Clone a shared task error into an owned one for the job boundary.
fn shared_error(err: &Arc<KilnError>) -> KilnError {
    match err.as_ref() {
        KilnError::InvalidGraph { reason } => KilnError::InvalidGraph { reason: reason.clone() },
        KilnError::EmptyInputSlot { digest, input } => {
            KilnError::EmptyInputSlot { digest: digest.clone(), input: *input }
        }
        KilnError::UnknownOp { digest } => KilnError::UnknownOp { digest: digest.clone() },
        KilnError::CycleDetected { digest } => KilnError::CycleDetected { digest: digest.clone() },
        KilnError::InvalidDigest { value } => KilnError::InvalidDigest { value: value.clone() },
        KilnError::Store(reason) => KilnError::Store(reason.clone()),
        KilnError::MigrationFailed { reason } => {
            KilnError::MigrationFailed { reason: reason.clone() }
        }
        KilnError::Worker { vertex, locations, reason } => KilnError::Worker {
            vertex: vertex.clone(),
            locations: locations.clone(),
            reason: reason.clone(),
        },
        KilnError::Cancelled => KilnError::Cancelled,
        KilnError::InvalidConfig { reason } => KilnError::InvalidConfig { reason: reason.clone() },
        KilnError::Internal(reason) => KilnError::Internal(reason.clone()),
        KilnError::Other(e) => KilnError::Internal(e.to_string()),
    }
}
