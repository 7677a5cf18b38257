//! Lifecycle controller: owns both worker pools and the shutdown sequence.
//!
//! `start()` reopens the queues and spawns the pools under a fresh
//! cancellation token. `stop(grace)` cancels, closes the queues, gives
//! in-flight items `grace` to finish, aborts whatever is left and discards
//! anything still buffered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, watch};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::conversation::ConversationStore;
use crate::error::LifecycleError;
use crate::pipeline::dispatch::{DispatchWorker, Router};
use crate::pipeline::executor::{GenerationExecutor, GenerationService};
use crate::pipeline::generation::{GenerationWorker, ReplySink};
use crate::pipeline::queue::{BoundedQueue, Enqueued};
use crate::pipeline::types::{GenerationJob, RawEvent};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Stopped => "stopped",
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// The two pipeline queues. Created before the pipeline so collaborators
/// (the router) can hold a submitter.
#[derive(Clone)]
pub struct Queues {
    pub inbound: Arc<BoundedQueue<RawEvent>>,
    pub generation: Arc<BoundedQueue<GenerationJob>>,
}

impl Queues {
    pub fn new(config: &PipelineConfig) -> Self {
        Self {
            inbound: Arc::new(BoundedQueue::new("inbound", config.inbound_capacity)),
            generation: Arc::new(BoundedQueue::new("generation", config.generation_capacity)),
        }
    }

    pub fn ingress(&self) -> Ingress {
        Ingress {
            inbound: Arc::clone(&self.inbound),
        }
    }

    pub fn submitter(&self) -> JobSubmitter {
        JobSubmitter {
            generation: Arc::clone(&self.generation),
        }
    }
}

/// Front-door handle: non-blocking enqueue of raw inbound events.
#[derive(Clone)]
pub struct Ingress {
    inbound: Arc<BoundedQueue<RawEvent>>,
}

impl Ingress {
    /// Never blocks. A full or closed queue drops the event with a log line.
    pub fn enqueue_raw_event(&self, event: RawEvent) -> Enqueued {
        let sequence = event.sequence;
        let outcome = self.inbound.enqueue(event);
        match outcome {
            Enqueued::Accepted => {
                tracing::debug!(update_id = sequence, depth = self.inbound.len(), "Update queued")
            }
            Enqueued::RejectedFull => tracing::warn!(
                update_id = sequence,
                capacity = self.inbound.capacity(),
                "Inbound queue full, dropping update"
            ),
            Enqueued::RejectedClosed => {
                tracing::warn!(update_id = sequence, "Pipeline stopped, dropping update")
            }
        }
        outcome
    }

    pub fn depth(&self) -> usize {
        self.inbound.len()
    }
}

/// Router-side handle for deferring generation work.
#[derive(Clone)]
pub struct JobSubmitter {
    generation: Arc<BoundedQueue<GenerationJob>>,
}

impl JobSubmitter {
    pub fn submit(&self, job: GenerationJob) -> Enqueued {
        let (job_id, chat_id) = (job.id, job.conversation_id);
        let outcome = self.generation.enqueue(job);
        match outcome {
            Enqueued::Accepted => tracing::debug!(%job_id, chat_id, "Generation job queued"),
            Enqueued::RejectedFull => tracing::warn!(
                %job_id,
                chat_id,
                capacity = self.generation.capacity(),
                "Generation queue full, dropping job"
            ),
            Enqueued::RejectedClosed => {
                tracing::warn!(%job_id, chat_id, "Pipeline stopped, dropping job")
            }
        }
        outcome
    }
}

/// Collaborators the worker pools run against.
pub struct PipelineDeps {
    pub router: Arc<dyn Router>,
    pub generator: Arc<dyn GenerationService>,
    pub store: Arc<ConversationStore>,
    pub sink: Arc<dyn ReplySink>,
}

/// What `stop` had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StopReport {
    /// Workers that exited on their own within the grace period.
    pub finished: usize,
    /// Workers aborted when the grace period ran out.
    pub aborted: usize,
    pub discarded_inbound: usize,
    pub discarded_generation: usize,
}

struct Running {
    cancel: CancellationToken,
    tasks: JoinSet<()>,
}

/// Owns the dispatch and generation pools.
pub struct Pipeline {
    config: PipelineConfig,
    queues: Queues,
    deps: PipelineDeps,
    executor: Arc<GenerationExecutor>,
    state: watch::Sender<LifecycleState>,
    running: Mutex<Option<Running>>,
}

impl Pipeline {
    /// Build a stopped pipeline. Queues reject items until `start()`.
    pub fn new(config: PipelineConfig, queues: Queues, deps: PipelineDeps) -> Self {
        let executor = Arc::new(GenerationExecutor::new(
            Arc::clone(&deps.generator),
            config.generation_concurrency,
            config.generation_timeout,
            config.retry.clone(),
        ));
        queues.inbound.close();
        queues.generation.close();
        let (state, _) = watch::channel(LifecycleState::Stopped);
        Self {
            config,
            queues,
            deps,
            executor,
            state,
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> LifecycleState {
        *self.state.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<LifecycleState> {
        self.state.subscribe()
    }

    pub fn ingress(&self) -> Ingress {
        self.queues.ingress()
    }

    pub fn submitter(&self) -> JobSubmitter {
        self.queues.submitter()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Spawn both pools. No-op when already running.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        let mut refused = None;
        let begin = self.state.send_if_modified(|state| match state {
            LifecycleState::Stopped => {
                *state = LifecycleState::Starting;
                true
            }
            LifecycleState::Starting | LifecycleState::Running => false,
            LifecycleState::Stopping => {
                refused = Some(*state);
                false
            }
        });
        if let Some(state) = refused {
            return Err(LifecycleError::InvalidState {
                action: "start",
                state: state.to_string(),
            });
        }
        if !begin {
            tracing::debug!("Pipeline already running");
            return Ok(());
        }

        let mut running = self.running.lock().await;
        self.queues.inbound.reopen();
        self.queues.generation.reopen();

        let cancel = CancellationToken::new();
        let mut tasks = JoinSet::new();

        for id in 1..=self.config.dispatch_workers {
            let worker = DispatchWorker::new(
                id,
                Arc::clone(&self.queues.inbound),
                Arc::clone(&self.deps.router),
                self.config.dispatch_timeout,
            );
            tasks.spawn(worker.run(cancel.clone()));
        }
        for id in 1..=self.config.generation_workers {
            let worker = GenerationWorker::new(
                id,
                Arc::clone(&self.queues.generation),
                Arc::clone(&self.executor),
                Arc::clone(&self.deps.store),
                Arc::clone(&self.deps.sink),
                self.config.reply_delay,
                self.config.delivery_timeout,
            );
            tasks.spawn(worker.run(cancel.clone()));
        }

        *running = Some(Running { cancel, tasks });
        if !self.mark_running() {
            tracing::debug!(state = %self.state(), "Stop requested during start");
            return Ok(());
        }
        tracing::info!(
            dispatch_workers = self.config.dispatch_workers,
            generation_workers = self.config.generation_workers,
            inbound_capacity = self.queues.inbound.capacity(),
            generation_capacity = self.queues.generation.capacity(),
            "Pipeline started"
        );
        Ok(())
    }

    /// `Starting → Running`; leaves any other state alone.
    fn mark_running(&self) -> bool {
        self.state.send_if_modified(|state| {
            if *state == LifecycleState::Starting {
                *state = LifecycleState::Running;
                true
            } else {
                false
            }
        })
    }

    /// Shut both pools down, waiting at most `grace` for in-flight items.
    /// No-op when already stopped or stopping.
    pub async fn stop(&self, grace: Duration) -> StopReport {
        let begin = self.state.send_if_modified(|state| match state {
            LifecycleState::Starting | LifecycleState::Running => {
                *state = LifecycleState::Stopping;
                true
            }
            LifecycleState::Stopped | LifecycleState::Stopping => false,
        });
        if !begin {
            return StopReport::default();
        }

        let mut report = StopReport::default();
        let taken = self.running.lock().await.take();
        tracing::info!(grace_ms = grace.as_millis() as u64, "Stopping pipeline");

        self.queues.inbound.close();
        self.queues.generation.close();

        if let Some(Running { cancel, mut tasks }) = taken {
            cancel.cancel();

            let finished = &mut report.finished;
            let drained = tokio::time::timeout(grace, async {
                while let Some(joined) = tasks.join_next().await {
                    if let Err(e) = joined {
                        tracing::error!(error = %e, "Worker task failed");
                    }
                    *finished += 1;
                }
            })
            .await;

            if drained.is_err() {
                report.aborted = tasks.len();
                tracing::warn!(
                    aborted = report.aborted,
                    "Grace period elapsed, aborting workers"
                );
                tasks.abort_all();
                while tasks.join_next().await.is_some() {}
            }
        }

        report.discarded_inbound = self.queues.inbound.discard_pending().await;
        report.discarded_generation = self.queues.generation.discard_pending().await;
        if report.discarded_inbound + report.discarded_generation > 0 {
            tracing::warn!(
                inbound = report.discarded_inbound,
                generation = report.discarded_generation,
                "Discarded queued items at shutdown"
            );
        }

        self.state.send_replace(LifecycleState::Stopped);
        tracing::info!(
            finished = report.finished,
            aborted = report.aborted,
            "Pipeline stopped"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use async_trait::async_trait;

    use super::*;
    use crate::channels::Update;
    use crate::error::{DeliveryError, RoutingError, ServiceError};
    use crate::pipeline::ChatId;

    /// Counts routed updates; hangs on "hang".
    #[derive(Default)]
    struct CountingRouter {
        routed: AtomicU32,
    }

    #[async_trait]
    impl Router for CountingRouter {
        async fn route(&self, update: Update) -> Result<(), RoutingError> {
            let hang = update
                .message
                .and_then(|m| m.text)
                .is_some_and(|t| t == "hang");
            if hang {
                tokio::time::sleep(Duration::from_secs(3600)).await;
            }
            self.routed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct EchoService;

    #[async_trait]
    impl GenerationService for EchoService {
        async fn generate(&self, _chat: ChatId, text: &str) -> Result<String, ServiceError> {
            Ok(text.to_string())
        }
    }

    struct NullSink;

    #[async_trait]
    impl ReplySink for NullSink {
        async fn deliver(
            &self,
            _chat: ChatId,
            _text: &str,
            _reply_to: Option<i64>,
        ) -> Result<(), DeliveryError> {
            Ok(())
        }
    }

    fn event(id: i64, text: &str) -> RawEvent {
        RawEvent::from_payload(serde_json::json!({
            "update_id": id,
            "message": {"message_id": id, "chat": {"id": 1, "type": "private"}, "text": text}
        }))
    }

    fn pipeline(dispatch_workers: usize) -> (Arc<Pipeline>, Arc<CountingRouter>) {
        let config = PipelineConfig {
            dispatch_workers,
            generation_workers: 1,
            inbound_capacity: 8,
            dispatch_timeout: Duration::from_secs(35),
            reply_delay: Duration::ZERO,
            ..PipelineConfig::default()
        };
        let router = Arc::new(CountingRouter::default());
        let deps = PipelineDeps {
            router: router.clone(),
            generator: Arc::new(EchoService),
            store: Arc::new(ConversationStore::new(20)),
            sink: Arc::new(NullSink),
        };
        let queues = Queues::new(&config);
        (Arc::new(Pipeline::new(config, queues, deps)), router)
    }

    #[tokio::test]
    async fn stopped_pipeline_rejects_ingress() {
        let (pipeline, _) = pipeline(1);
        assert_eq!(pipeline.state(), LifecycleState::Stopped);
        assert_eq!(
            pipeline.ingress().enqueue_raw_event(event(1, "hi")),
            Enqueued::RejectedClosed
        );
    }

    #[tokio::test(start_paused = true)]
    async fn idle_workers_exit_within_grace() {
        let (pipeline, _) = pipeline(2);
        pipeline.start().await.unwrap();
        assert_eq!(pipeline.state(), LifecycleState::Running);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let start = tokio::time::Instant::now();
        let report = pipeline.stop(Duration::from_secs(5)).await;

        assert!(start.elapsed() < Duration::from_secs(5));
        assert_eq!(report.finished, 3);
        assert_eq!(report.aborted, 0);
        assert_eq!(pipeline.state(), LifecycleState::Stopped);
    }

    #[tokio::test(start_paused = true)]
    async fn in_flight_item_aborted_and_backlog_discarded() {
        let (pipeline, router) = pipeline(1);
        pipeline.start().await.unwrap();

        let ingress = pipeline.ingress();
        assert!(ingress.enqueue_raw_event(event(1, "hang")).is_accepted());
        tokio::time::sleep(Duration::from_millis(10)).await;
        for id in 2..=5 {
            assert!(ingress.enqueue_raw_event(event(id, "hi")).is_accepted());
        }

        let report = pipeline.stop(Duration::from_secs(1)).await;

        assert_eq!(report.aborted, 1);
        assert_eq!(report.finished, 1);
        assert_eq!(report.discarded_inbound, 4);
        assert_eq!(router.routed.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn restart_after_stop_processes_again() {
        let (pipeline, router) = pipeline(1);
        pipeline.start().await.unwrap();
        pipeline.stop(Duration::from_secs(1)).await;

        pipeline.start().await.unwrap();
        assert!(pipeline.ingress().enqueue_raw_event(event(1, "hi")).is_accepted());
        while router.routed.load(Ordering::SeqCst) == 0 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        pipeline.stop(Duration::from_secs(1)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_start_and_stop_are_noops() {
        let (pipeline, _) = pipeline(1);
        assert_eq!(pipeline.stop(Duration::from_secs(1)).await, StopReport::default());

        pipeline.start().await.unwrap();
        pipeline.start().await.unwrap();
        let report = pipeline.stop(Duration::from_secs(1)).await;
        assert_eq!(report.finished, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn start_while_stopping_is_refused() {
        let (pipeline, _) = pipeline(1);
        pipeline.start().await.unwrap();
        pipeline.ingress().enqueue_raw_event(event(1, "hang"));
        tokio::time::sleep(Duration::from_millis(10)).await;

        let mut states = pipeline.subscribe();
        let stopping = {
            let pipeline = Arc::clone(&pipeline);
            tokio::spawn(async move { pipeline.stop(Duration::from_secs(10)).await })
        };
        states
            .wait_for(|s| *s == LifecycleState::Stopping)
            .await
            .unwrap();

        let err = pipeline.start().await.unwrap_err();
        assert!(matches!(err, LifecycleError::InvalidState { action: "start", .. }));

        stopping.await.unwrap();
        assert_eq!(pipeline.state(), LifecycleState::Stopped);
    }

    #[tokio::test]
    async fn finishing_start_does_not_override_stop() {
        let (pipeline, _) = pipeline(1);

        pipeline.state.send_replace(LifecycleState::Stopping);
        assert!(!pipeline.mark_running());
        assert_eq!(pipeline.state(), LifecycleState::Stopping);

        pipeline.state.send_replace(LifecycleState::Starting);
        assert!(pipeline.mark_running());
        assert_eq!(pipeline.state(), LifecycleState::Running);
    }
}
