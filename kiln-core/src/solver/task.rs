//! Shared per-(vertex, fast-key) tasks.
//!
//! Each vertex under evaluation is owned by exactly one task. A job (or a
//! dependent task) arriving on a fast key already in flight joins the
//! existing task instead of starting a new one. Joined waiters share
//! cancellation: the task keeps running while at least one waiter is
//! subscribed and cancels when the count reaches zero.

use crate::digest::Digest;
use crate::error::KilnError;
use crate::solver::progress::VertexState;
use crate::worker::ResultLease;
use std::sync::atomic::{AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::warn;

/// The value a finished task hands to every joined waiter.
#[derive(Debug, Clone)]
pub struct TaskOutput {
    pub lease: ResultLease,
    pub fast_key: Digest,
    pub slow_key: Option<Digest>,
    /// True when the result was adopted from cache storage.
    pub from_cache: bool,
}

/// Shared task results are cloned to every waiter; errors are shared
/// behind an `Arc` because `KilnError` is not `Clone`.
pub type TaskResult = std::result::Result<TaskOutput, Arc<KilnError>>;

/// One logical task per (vertex, fast-key) pair.
pub(crate) struct SolveTask {
    pub fast_key: Digest,
    pub vertex: Digest,
    waiters: AtomicUsize,
    state: AtomicU8,
    cancel_tx: watch::Sender<bool>,
    outcome_tx: watch::Sender<Option<TaskResult>>,
}

impl SolveTask {
    pub fn new(fast_key: Digest, vertex: Digest) -> Arc<Self> {
        let (cancel_tx, _) = watch::channel(false);
        let (outcome_tx, _) = watch::channel(None);
        Arc::new(Self {
            fast_key,
            vertex,
            waiters: AtomicUsize::new(0),
            state: AtomicU8::new(VertexState::Requested.rank()),
            cancel_tx,
            outcome_tx,
        })
    }

    /// Join a task. The returned guard keeps the task alive; dropping it
    /// without an outcome may cancel the task.
    pub fn subscribe(task: &Arc<Self>) -> TaskWaiter {
        task.waiters.fetch_add(1, Ordering::SeqCst);
        TaskWaiter { task: task.clone() }
    }

    /// Watch for cancellation; flips to `true` at most once.
    pub fn cancelled(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_tx.subscribe().borrow()
    }

    /// Record the outcome. The first outcome wins; later errors are logged
    /// and suppressed.
    pub fn complete(&self, result: TaskResult) {
        self.outcome_tx.send_if_modified(|current| {
            if current.is_some() {
                if let Err(err) = &result {
                    if !err.is_cancelled() {
                        warn!(
                            vertex = %self.vertex.short(),
                            key = %self.fast_key.short(),
                            "Suppressed secondary task error: {}", err
                        );
                    }
                }
                return false;
            }
            *current = Some(result.clone());
            true
        });
    }

    pub fn is_complete(&self) -> bool {
        self.outcome_tx.subscribe().borrow().is_some()
    }

    /// Advance the monotone vertex state machine. Going backwards is an
    /// internal invariant violation and fails closed.
    pub fn transition(&self, next: VertexState) -> Result<(), Arc<KilnError>> {
        let mut current = self.state.load(Ordering::SeqCst);
        loop {
            if next.rank() < current {
                return Err(Arc::new(KilnError::Internal(format!(
                    "vertex {} state went backwards: {} -> {}",
                    self.vertex,
                    current,
                    next.rank()
                ))));
            }
            match self.state.compare_exchange(
                current,
                next.rank(),
                Ordering::SeqCst,
                Ordering::SeqCst,
            ) {
                Ok(_) => return Ok(()),
                Err(observed) => current = observed,
            }
        }
    }
}

/// Subscription guard for one waiter of a task.
pub(crate) struct TaskWaiter {
    task: Arc<SolveTask>,
}

impl TaskWaiter {
    /// Wait for the task's outcome.
    pub async fn wait(&self) -> TaskResult {
        let mut rx = self.task.outcome_tx.subscribe();
        let result = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone().unwrap_or(Err(Arc::new(KilnError::Cancelled))),
            // Sender gone without an outcome: the task was torn down.
            Err(_) => Err(Arc::new(KilnError::Cancelled)),
        };
        result
    }
}

impl Drop for TaskWaiter {
    fn drop(&mut self) {
        let remaining = self.task.waiters.fetch_sub(1, Ordering::SeqCst) - 1;
        if remaining == 0 && !self.task.is_complete() {
            // Last waiter left an unfinished task: cancel it.
            let _ = self.task.cancel_tx.send(true);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LayerChain, WorkerResult};

    fn task() -> Arc<SolveTask> {
        SolveTask::new(Digest::from_bytes(b"fk"), Digest::from_bytes(b"v"))
    }

    fn output(task: &SolveTask) -> TaskOutput {
        TaskOutput {
            lease: ResultLease::derived(
                WorkerResult::new("r1", LayerChain::default()),
                vec![],
            ),
            fast_key: task.fast_key.clone(),
            slow_key: None,
            from_cache: false,
        }
    }

    #[tokio::test]
    async fn test_waiters_receive_outcome() {
        let t = task();
        let w1 = SolveTask::subscribe(&t);
        let w2 = SolveTask::subscribe(&t);

        t.complete(Ok(output(&t)));

        assert!(w1.wait().await.is_ok());
        assert!(w2.wait().await.is_ok());
    }

    #[tokio::test]
    async fn test_first_outcome_wins() {
        let t = task();
        let w = SolveTask::subscribe(&t);

        t.complete(Err(Arc::new(KilnError::Internal("first".into()))));
        t.complete(Err(Arc::new(KilnError::Internal("second".into()))));

        match w.wait().await {
            Err(e) => assert!(e.to_string().contains("first")),
            Ok(_) => panic!("expected error"),
        }
    }

    #[tokio::test]
    async fn test_last_waiter_drop_cancels() {
        let t = task();
        let mut cancel = t.cancelled();

        let w1 = SolveTask::subscribe(&t);
        let w2 = SolveTask::subscribe(&t);
        drop(w1);
        assert!(!*cancel.borrow());

        drop(w2);
        cancel.changed().await.unwrap();
        assert!(*cancel.borrow());
        assert!(t.is_cancelled());
    }

    #[tokio::test]
    async fn test_drop_after_completion_does_not_cancel() {
        let t = task();
        let w = SolveTask::subscribe(&t);
        t.complete(Ok(output(&t)));
        drop(w);
        assert!(!t.is_cancelled());
    }

    #[test]
    fn test_transitions_are_monotone() {
        let t = task();
        t.transition(VertexState::Keying).unwrap();
        t.transition(VertexState::Executing).unwrap();
        assert!(t.transition(VertexState::Keying).is_err());
        t.transition(VertexState::Finalized).unwrap();
    }
}
