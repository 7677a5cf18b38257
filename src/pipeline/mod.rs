//! Event ingestion and dispatch pipeline.
//!
//! Inbound webhook payloads flow through:
//! 1. `Ingress::enqueue_raw_event()`: non-blocking enqueue, drop when full
//! 2. `DispatchWorker`: decode and route under a timeout
//! 3. `JobSubmitter::submit()`: the router defers slow work
//! 4. `GenerationWorker`: generate with retries, deliver the reply
//!
//! `Pipeline` owns both pools and the shutdown sequence.

pub mod dispatch;
pub mod executor;
pub mod generation;
pub mod lifecycle;
pub mod queue;
pub mod types;

pub use dispatch::{DispatchOutcome, DispatchWorker, Router};
pub use executor::{Generation, GenerationExecutor, GenerationService};
pub use generation::{APOLOGY, GenerationOutcome, GenerationWorker, ReplySink};
pub use lifecycle::{
    Ingress, JobSubmitter, LifecycleState, Pipeline, PipelineDeps, Queues, StopReport,
};
pub use queue::{BoundedQueue, Enqueued, QueueClosed};
pub use types::{ChatId, GenerationJob, RawEvent};
