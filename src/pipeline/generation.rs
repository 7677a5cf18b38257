//! Generation workers: claim a job, run the executor, deliver the reply.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::conversation::{ConversationStore, Exchange};
use crate::error::DeliveryError;
use crate::pipeline::ChatId;
use crate::pipeline::executor::GenerationExecutor;
use crate::pipeline::queue::BoundedQueue;
use crate::pipeline::types::GenerationJob;

/// Sent instead of a reply once every generation attempt has failed.
pub const APOLOGY: &str = "Sorry, I couldn't come up with a reply right now. Try again in a bit.";

/// Where replies go.
#[async_trait]
pub trait ReplySink: Send + Sync {
    /// Send `text` to the conversation, threaded under `reply_to` when given.
    async fn deliver(
        &self,
        conversation_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), DeliveryError>;

    /// Show a "typing" indicator. No-op unless the sink supports one.
    async fn typing(&self, _conversation_id: ChatId) -> Result<(), DeliveryError> {
        Ok(())
    }
}

/// How a single job ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationOutcome {
    Replied { attempts: u32 },
    Apologized,
    DeliveryFailed,
    Panicked,
}

/// One long-lived generation worker.
pub struct GenerationWorker {
    id: usize,
    queue: Arc<BoundedQueue<GenerationJob>>,
    executor: Arc<GenerationExecutor>,
    store: Arc<ConversationStore>,
    sink: Arc<dyn ReplySink>,
    reply_delay: Duration,
    delivery_timeout: Duration,
}

impl GenerationWorker {
    pub fn new(
        id: usize,
        queue: Arc<BoundedQueue<GenerationJob>>,
        executor: Arc<GenerationExecutor>,
        store: Arc<ConversationStore>,
        sink: Arc<dyn ReplySink>,
        reply_delay: Duration,
        delivery_timeout: Duration,
    ) -> Self {
        Self {
            id,
            queue,
            executor,
            store,
            sink,
            reply_delay,
            delivery_timeout,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        let span = tracing::info_span!("generation_worker", worker = self.id);
        async move {
            tracing::info!("Generation worker started");
            let mut handled: u64 = 0;
            while let Some(job) = self.queue.next_until(&cancel).await {
                self.handle(job).await;
                handled += 1;
            }
            tracing::info!(handled, "Generation worker stopped");
        }
        .instrument(span)
        .await
    }

    /// Process one job end to end. Never returns an error.
    pub async fn handle(&self, job: GenerationJob) -> GenerationOutcome {
        let job_id = job.id;
        let chat_id = job.conversation_id;
        match AssertUnwindSafe(self.process(job)).catch_unwind().await {
            Ok(outcome) => outcome,
            Err(_) => {
                tracing::error!(%job_id, chat_id, "Generation job panicked");
                GenerationOutcome::Panicked
            }
        }
    }

    async fn process(&self, job: GenerationJob) -> GenerationOutcome {
        let chat_id = job.conversation_id;
        let queued_ms = (chrono::Utc::now() - job.created_at).num_milliseconds();
        tracing::debug!(job_id = %job.id, chat_id, queued_ms, "Generation job claimed");

        self.store
            .append(chat_id, Exchange::user(job.request_text.as_str()))
            .await;

        if let Err(e) = self.typing(chat_id).await {
            tracing::debug!(chat_id, error = %e, "Typing indicator failed");
        }

        match self.executor.execute(chat_id, &job.request_text).await {
            Ok(generation) => {
                self.store
                    .append(chat_id, Exchange::assistant(generation.text.as_str()))
                    .await;
                if !self.reply_delay.is_zero() {
                    tokio::time::sleep(self.reply_delay).await;
                }
                match self
                    .deliver(chat_id, &generation.text, Some(job.reply_to))
                    .await
                {
                    Ok(()) => {
                        tracing::info!(chat_id, attempts = generation.attempts, "Reply sent");
                        GenerationOutcome::Replied {
                            attempts: generation.attempts,
                        }
                    }
                    Err(e) => {
                        tracing::error!(chat_id, error = %e, "Failed to deliver reply");
                        GenerationOutcome::DeliveryFailed
                    }
                }
            }
            Err(e) => {
                tracing::warn!(chat_id, kind = e.kind(), error = %e, "Sending apology");
                match self.deliver(chat_id, APOLOGY, Some(job.reply_to)).await {
                    Ok(()) => GenerationOutcome::Apologized,
                    Err(e) => {
                        tracing::error!(chat_id, error = %e, "Failed to deliver apology");
                        GenerationOutcome::DeliveryFailed
                    }
                }
            }
        }
    }

    async fn deliver(
        &self,
        chat_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), DeliveryError> {
        tokio::time::timeout(
            self.delivery_timeout,
            self.sink.deliver(chat_id, text, reply_to),
        )
        .await
        .map_err(|_| DeliveryError::Timeout {
            call: "deliver",
            after: self.delivery_timeout,
        })?
    }

    async fn typing(&self, chat_id: ChatId) -> Result<(), DeliveryError> {
        tokio::time::timeout(self.delivery_timeout, self.sink.typing(chat_id))
            .await
            .map_err(|_| DeliveryError::Timeout {
                call: "typing",
                after: self.delivery_timeout,
            })?
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    use tokio::sync::Mutex;

    use super::*;
    use crate::config::RetryPolicy;
    use crate::conversation::Role;
    use crate::error::ServiceError;
    use crate::pipeline::executor::GenerationService;

    #[derive(Default)]
    struct RecordingSink {
        sent: Mutex<Vec<(ChatId, String, Option<i64>)>>,
        typing: AtomicU32,
        fail: AtomicBool,
    }
    #[async_trait]
    impl ReplySink for RecordingSink {
        async fn deliver(
            &self,
            conversation_id: ChatId,
            text: &str,
            reply_to: Option<i64>,
        ) -> Result<(), DeliveryError> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(DeliveryError::SendFailed {
                    chat_id: conversation_id,
                    reason: "blocked".into(),
                });
            }
            self.sent
                .lock()
                .await
                .push((conversation_id, text.to_string(), reply_to));
            Ok(())
        }

        async fn typing(&self, _conversation_id: ChatId) -> Result<(), DeliveryError> {
            self.typing.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Answers after `delay` with the request upper-cased.
    struct UpperService {
        delay: Duration,
        calls: AtomicU32,
    }

    #[async_trait]
    impl GenerationService for UpperService {
        async fn generate(&self, _chat: ChatId, text: &str) -> Result<String, ServiceError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            Ok(text.to_uppercase())
        }
    }

    struct Harness {
        worker: GenerationWorker,
        queue: Arc<BoundedQueue<GenerationJob>>,
        store: Arc<ConversationStore>,
        sink: Arc<RecordingSink>,
        service: Arc<UpperService>,
    }

    fn harness(service_delay: Duration, retries: u32) -> Harness {
        let queue = Arc::new(BoundedQueue::new("generation", 8));
        let store = Arc::new(ConversationStore::new(20));
        let sink = Arc::new(RecordingSink::default());
        let service = Arc::new(UpperService {
            delay: service_delay,
            calls: AtomicU32::new(0),
        });
        let executor = Arc::new(GenerationExecutor::new(
            service.clone(),
            2,
            Duration::from_secs(60),
            RetryPolicy::immediate(retries),
        ));
        let worker = GenerationWorker::new(
            1,
            Arc::clone(&queue),
            executor,
            Arc::clone(&store),
            sink.clone(),
            Duration::from_millis(800),
            Duration::from_secs(30),
        );
        Harness {
            worker,
            queue,
            store,
            sink,
            service,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn success_records_both_turns_and_threads_reply() {
        let h = harness(Duration::from_secs(1), 2);

        let outcome = h.worker.handle(GenerationJob::new(5, "hello", 77)).await;

        assert_eq!(outcome, GenerationOutcome::Replied { attempts: 1 });
        assert_eq!(
            *h.sink.sent.lock().await,
            vec![(5, "HELLO".to_string(), Some(77))]
        );
        assert_eq!(h.sink.typing.load(Ordering::SeqCst), 1);

        let history = h.store.snapshot(5).await.history;
        assert_eq!(history, vec![Exchange::user("hello"), Exchange::assistant("HELLO")]);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_send_apology_and_keep_late_result_out() {
        let h = harness(Duration::from_secs(100), 2);

        let outcome = h.worker.handle(GenerationJob::new(9, "slow", 3)).await;

        assert_eq!(outcome, GenerationOutcome::Apologized);
        assert_eq!(h.service.calls.load(Ordering::SeqCst), 3);
        assert_eq!(*h.sink.sent.lock().await, vec![(9, APOLOGY.to_string(), Some(3))]);

        // Well past when the abandoned calls would have finished.
        tokio::time::sleep(Duration::from_secs(300)).await;
        let history = h.store.snapshot(9).await.history;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }

    #[tokio::test(start_paused = true)]
    async fn delivery_failure_is_swallowed() {
        let h = harness(Duration::ZERO, 0);
        h.sink.fail.store(true, Ordering::SeqCst);

        let outcome = h.worker.handle(GenerationJob::new(1, "x", 1)).await;
        assert_eq!(outcome, GenerationOutcome::DeliveryFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn worker_loop_handles_jobs_in_order() {
        let h = harness(Duration::from_millis(10), 0);
        let cancel = CancellationToken::new();

        for (i, text) in ["a", "b", "c"].into_iter().enumerate() {
            assert!(h.queue.enqueue(GenerationJob::new(1, text, i as i64)).is_accepted());
        }
        let handle = tokio::spawn(h.worker.run(cancel.clone()));

        while h.sink.sent.lock().await.len() < 3 {
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        cancel.cancel();
        handle.await.unwrap();

        let replies: Vec<String> = h.sink.sent.lock().await.iter().map(|s| s.1.clone()).collect();
        assert_eq!(replies, vec!["A", "B", "C"]);
        assert_eq!(h.store.snapshot(1).await.history.len(), 6);
    }

    /// Bot API calls that never answer.
    struct StuckSink;

    #[async_trait]
    impl ReplySink for StuckSink {
        async fn deliver(
            &self,
            _conversation_id: ChatId,
            _text: &str,
            _reply_to: Option<i64>,
        ) -> Result<(), DeliveryError> {
            std::future::pending().await
        }

        async fn typing(&self, _conversation_id: ChatId) -> Result<(), DeliveryError> {
            std::future::pending().await
        }
    }

    #[tokio::test(start_paused = true)]
    async fn stuck_sink_cannot_block_the_worker() {
        let queue = Arc::new(BoundedQueue::new("generation", 8));
        let store = Arc::new(ConversationStore::new(20));
        let executor = Arc::new(GenerationExecutor::new(
            Arc::new(UpperService {
                delay: Duration::ZERO,
                calls: AtomicU32::new(0),
            }),
            1,
            Duration::from_secs(60),
            RetryPolicy::immediate(0),
        ));
        let worker = GenerationWorker::new(
            1,
            queue,
            executor,
            Arc::clone(&store),
            Arc::new(StuckSink),
            Duration::ZERO,
            Duration::from_secs(5),
        );

        let outcome = tokio::time::timeout(
            Duration::from_secs(60),
            worker.handle(GenerationJob::new(4, "hi", 1)),
        )
        .await
        .expect("worker stayed blocked on the sink");

        assert_eq!(outcome, GenerationOutcome::DeliveryFailed);
        assert_eq!(store.snapshot(4).await.history.len(), 2);
    }
}
