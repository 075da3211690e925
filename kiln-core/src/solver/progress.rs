//! Progress bus for vertex state transitions.
//!
//! Provides a publish/subscribe channel carrying per-vertex state changes.
//! Events for one vertex are published in transition order; subscribers can
//! filter by job.
//!
//! # Example
//!
//! ```ignore
//! let bus = ProgressBus::new(256);
//!
//! // Subscribe to everything job "j1" does
//! let mut rx = bus.subscribe(vec!["j1.*".to_string()]);
//!
//! while let Some(event) = rx.recv().await {
//!     println!("{} {} -> {}", event.job, event.vertex, event.state.as_str());
//! }
//! ```

use crate::digest::Digest;
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::sync::broadcast;
use tracing::debug;

/// States of the per-vertex state machine.
///
/// Transitions are strictly monotone in `rank`; a vertex never goes back to
/// an earlier state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VertexState {
    Requested,
    Keying,
    ContentKeying,
    Executing,
    Reused,
    Finalized,
    Failed,
    Cancelled,
}

impl VertexState {
    pub fn as_str(&self) -> &'static str {
        match self {
            VertexState::Requested => "requested",
            VertexState::Keying => "keying",
            VertexState::ContentKeying => "content-keying",
            VertexState::Executing => "executing",
            VertexState::Reused => "reused",
            VertexState::Finalized => "finalized",
            VertexState::Failed => "failed",
            VertexState::Cancelled => "cancelled",
        }
    }

    /// Position in the monotone transition order.
    pub fn rank(&self) -> u8 {
        match self {
            VertexState::Requested => 0,
            VertexState::Keying => 1,
            VertexState::ContentKeying => 2,
            VertexState::Executing => 3,
            VertexState::Reused => 4,
            VertexState::Finalized => 5,
            VertexState::Failed => 6,
            VertexState::Cancelled => 7,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, VertexState::Finalized | VertexState::Failed | VertexState::Cancelled)
    }
}

impl std::fmt::Display for VertexState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A vertex state transition.
#[derive(Debug, Clone)]
pub struct ProgressEvent {
    /// Unix timestamp in milliseconds.
    pub timestamp: i64,
    /// Job that initiated the task.
    pub job: String,
    pub vertex: Digest,
    /// Display name of the op.
    pub name: String,
    pub state: VertexState,
    /// True when the vertex was satisfied from cache.
    pub cached: bool,
}

/// Broadcast bus for progress events.
#[derive(Clone)]
pub struct ProgressBus {
    sender: broadcast::Sender<ProgressEvent>,
}

impl ProgressBus {
    pub fn new(buffer: usize) -> Self {
        let (sender, _) = broadcast::channel(buffer.max(1));
        Self { sender }
    }

    /// Publish an event to all subscribers.
    pub fn publish(&self, event: ProgressEvent) {
        debug!(job = %event.job, vertex = %event.vertex.short(), state = %event.state, "Progress");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }

    /// Subscribe to events, optionally filtered.
    ///
    /// # Filter patterns
    ///
    /// - `"j1.*"` - every event of job j1
    /// - `"j1.finalized"` - only finalized events of job j1
    /// - Empty list - all events
    pub fn subscribe(&self, filters: Vec<String>) -> ProgressSubscriber {
        ProgressSubscriber { receiver: self.sender.subscribe(), filters }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub(crate) fn event(
        job: &str,
        vertex: &Digest,
        name: &str,
        state: VertexState,
        cached: bool,
    ) -> ProgressEvent {
        ProgressEvent {
            timestamp: SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .unwrap_or_default()
                .as_millis() as i64,
            job: job.to_string(),
            vertex: vertex.clone(),
            name: name.to_string(),
            state,
            cached,
        }
    }
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new(256)
    }
}

/// Progress subscriber with optional filtering.
pub struct ProgressSubscriber {
    receiver: broadcast::Receiver<ProgressEvent>,
    filters: Vec<String>,
}

impl ProgressSubscriber {
    /// Receive the next matching event; `None` when the bus is gone.
    pub async fn recv(&mut self) -> Option<ProgressEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(event) => {
                    if self.matches(&event) {
                        return Some(event);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Progress subscriber lagged by {} events", n);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return None;
                }
            }
        }
    }

    fn matches(&self, event: &ProgressEvent) -> bool {
        if self.filters.is_empty() {
            return true;
        }

        let key = format!("{}.{}", event.job, event.state.as_str());
        for filter in &self.filters {
            if filter == &key {
                return true;
            }
            if let Some(prefix) = filter.strip_suffix(".*") {
                if event.job == prefix {
                    return true;
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(job: &str, state: VertexState) -> ProgressEvent {
        ProgressBus::event(job, &Digest::from_bytes(b"v"), "test", state, false)
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = ProgressBus::new(16);
        let mut rx = bus.subscribe(vec![]);

        bus.publish(event("j1", VertexState::Requested));

        let received =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(received.job, "j1");
        assert_eq!(received.state, VertexState::Requested);
    }

    #[tokio::test]
    async fn test_filter_by_job() {
        let bus = ProgressBus::new(16);
        let mut rx = bus.subscribe(vec!["j1.*".to_string()]);

        bus.publish(event("j2", VertexState::Requested));
        bus.publish(event("j1", VertexState::Keying));

        let received =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(received.job, "j1");
    }

    #[tokio::test]
    async fn test_filter_exact_state() {
        let bus = ProgressBus::new(16);
        let mut rx = bus.subscribe(vec!["j1.finalized".to_string()]);

        bus.publish(event("j1", VertexState::Requested));
        bus.publish(event("j1", VertexState::Finalized));

        let received =
            tokio::time::timeout(std::time::Duration::from_millis(100), rx.recv())
                .await
                .unwrap()
                .unwrap();
        assert_eq!(received.state, VertexState::Finalized);
    }

    #[test]
    fn test_ranks_are_monotone() {
        let order = [
            VertexState::Requested,
            VertexState::Keying,
            VertexState::ContentKeying,
            VertexState::Executing,
            VertexState::Reused,
            VertexState::Finalized,
        ];
        for pair in order.windows(2) {
            assert!(pair[0].rank() < pair[1].rank());
        }
        assert!(VertexState::Finalized.is_terminal());
        assert!(!VertexState::Executing.is_terminal());
    }
}
