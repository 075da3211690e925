//! Worker contract and result leases.
//!
//! Workers own execution, blob storage, and materialization; the solver
//! treats them as opaque providers of "execute this op, get me a result".
//! Workers are assumed pure with respect to inputs: two `exec` calls with
//! inputs of equal content must yield results of equal content, though not
//! necessarily equal handle identity.

use crate::digest::Digest;
use crate::error::Result;
use crate::types::{LayerChain, Op, WorkerResult};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::warn;

/// The narrow interface the solver requires from a worker.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Execute an op over materialized inputs.
    ///
    /// The returned handle carries one reference; pair it with `release`.
    async fn exec(&self, op: &Op, inputs: &[ResultLease]) -> Result<WorkerResult>;

    /// Materialize a result into its layer chain.
    ///
    /// A successful call takes a reference on the handle (this is how a
    /// result adopted from cache storage is pinned); pair it with `release`.
    async fn materialize(&self, result: &WorkerResult) -> Result<LayerChain>;

    /// Drop one reference on the handle. The worker frees the underlying
    /// resources when its count reaches zero.
    async fn release(&self, result: &WorkerResult) -> Result<()>;

    /// Content digest of the selected subtree of a materialized result.
    ///
    /// `Ok(None)` means the worker cannot digest this selector; the caller
    /// skips slow keying for the input rather than failing.
    async fn content_digest(&self, result: &WorkerResult, selector: &str)
        -> Result<Option<Digest>>;
}

/// A ref-counted lease over a worker-owned result.
///
/// Cloning a lease is an atomic ref-count bump; when the last clone goes
/// away, exactly one `Worker::release` is issued for the handle. Leases over
/// derived results (merge, diff) hold their constituent input leases alive
/// instead of owing a worker release of their own.
#[derive(Clone)]
pub struct ResultLease {
    inner: Arc<LeaseInner>,
}

struct LeaseInner {
    result: WorkerResult,
    worker: Option<Arc<dyn Worker>>,
    // Input leases kept alive for results derived without execution.
    children: Vec<ResultLease>,
}

impl ResultLease {
    /// Lease a result obtained from `exec` or pinned via `materialize`.
    pub fn new(worker: Arc<dyn Worker>, result: WorkerResult) -> Self {
        Self { inner: Arc::new(LeaseInner { result, worker: Some(worker), children: Vec::new() }) }
    }

    /// Lease a derived result whose layers are owned by `children`.
    pub fn derived(result: WorkerResult, children: Vec<ResultLease>) -> Self {
        Self { inner: Arc::new(LeaseInner { result, worker: None, children }) }
    }

    pub fn result(&self) -> &WorkerResult {
        &self.inner.result
    }

    pub fn chain(&self) -> &LayerChain {
        &self.inner.result.chain
    }

    /// Number of live clones of this lease.
    pub fn ref_count(&self) -> usize {
        Arc::strong_count(&self.inner)
    }

    /// Release this clone, issuing the worker release inline if it was the
    /// last one. Dropping the lease has the same effect but defers the
    /// release to a spawned task.
    pub async fn release(self) -> Result<()> {
        match Arc::try_unwrap(self.inner) {
            Ok(mut inner) => {
                if let Some(worker) = inner.worker.take() {
                    worker.release(&inner.result).await?;
                }
                // Children drop here, cascading their own releases.
                Ok(())
            }
            Err(_still_shared) => Ok(()),
        }
    }
}

impl Drop for LeaseInner {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let result = self.result.clone();
            if let Ok(handle) = tokio::runtime::Handle::try_current() {
                handle.spawn(async move {
                    if let Err(e) = worker.release(&result).await {
                        warn!(result = %result.id, "Failed to release worker result: {}", e);
                    }
                });
            }
        }
    }
}

impl std::fmt::Debug for ResultLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResultLease")
            .field("result", &self.inner.result.id)
            .field("refs", &Arc::strong_count(&self.inner))
            .field("children", &self.inner.children.len())
            .finish()
    }
}
