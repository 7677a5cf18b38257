//! Dispatch workers: decode raw events and hand them to the router.
//!
//! A failed event is logged and dropped, never retried. That covers bad
//! payloads, routing errors, timeouts and panics inside the router.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::channels::Update;
use crate::error::RoutingError;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::types::RawEvent;

/// Decides what to do with a decoded update. May submit generation jobs.
///
/// Implementations must be cancel-safe: the dispatch timeout drops the
/// future mid-flight.
#[async_trait]
pub trait Router: Send + Sync {
    async fn route(&self, update: Update) -> Result<(), RoutingError>;
}

/// How a single event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Routed,
    DecodeFailed,
    TimedOut,
    Failed,
    Panicked,
}

/// One long-lived dispatch worker.
pub struct DispatchWorker {
    id: usize,
    queue: Arc<BoundedQueue<RawEvent>>,
    router: Arc<dyn Router>,
    timeout: Duration,
}

impl DispatchWorker {
    pub fn new(
        id: usize,
        queue: Arc<BoundedQueue<RawEvent>>,
        router: Arc<dyn Router>,
        timeout: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            router,
            timeout,
        }
    }

    /// Pull and handle events one at a time until cancelled or the queue closes.
    pub async fn run(self, cancel: CancellationToken) {
        let span = tracing::info_span!("dispatch_worker", worker = self.id);
        async move {
            tracing::info!("Dispatch worker started");
            let mut handled: u64 = 0;
            while let Some(event) = self.queue.next_until(&cancel).await {
                self.handle(event).await;
                handled += 1;
            }
            tracing::info!(handled, "Dispatch worker stopped");
        }
        .instrument(span)
        .await
    }

    /// Decode and route one event under the dispatch timeout.
    pub async fn handle(&self, event: RawEvent) -> DispatchOutcome {
        let sequence = event.sequence;
        let update = match event.decode() {
            Ok(update) => update,
            Err(e) => {
                tracing::warn!(update_id = sequence, error = %e, "Dropping undecodable update");
                return DispatchOutcome::DecodeFailed;
            }
        };

        let routed = AssertUnwindSafe(tokio::time::timeout(
            self.timeout,
            self.router.route(update),
        ))
        .catch_unwind()
        .await;

        match routed {
            Ok(Ok(Ok(()))) => {
                tracing::debug!(update_id = sequence, "Update routed");
                DispatchOutcome::Routed
            }
            Ok(Ok(Err(e))) => {
                tracing::error!(update_id = sequence, error = %e, "Routing failed, update dropped");
                DispatchOutcome::Failed
            }
            Ok(Err(_)) => {
                tracing::error!(
                    update_id = sequence,
                    error = %RoutingError::Timeout(self.timeout),
                    "Routing timed out, update dropped"
                );
                DispatchOutcome::TimedOut
            }
            Err(_) => {
                tracing::error!(update_id = sequence, "Router panicked, update dropped");
                DispatchOutcome::Panicked
            }
        }
    }
}
