//! End-to-end tests: webhook → pipeline → router → generation → reply.
//!
//! Each test spins up the real Axum front door on a random port with a real
//! `Pipeline` and `ChatRouter`, stubbing only the generation service and the
//! reply sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use secrecy::SecretString;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio::time::timeout;

use reply_relay::bot::{BotIdentity, ChatRouter, PraisePolicy};
use reply_relay::config::{PipelineConfig, RetryPolicy};
use reply_relay::conversation::{ConversationStore, Exchange, Mode};
use reply_relay::error::{DeliveryError, ServiceError};
use reply_relay::pipeline::{
    APOLOGY, ChatId, GenerationService, LifecycleState, Pipeline, PipelineDeps, Queues, ReplySink,
};
use reply_relay::server::{self, WebhookState};

/// Maximum time any test is allowed to wait for an outcome.
const TEST_TIMEOUT: Duration = Duration::from_secs(5);

const TOKEN: &str = "123:test";

/// Stub generation service: echoes, fails on "fail", stalls on "stall".
struct StubLlm {
    calls: AtomicU32,
}

#[async_trait]
impl GenerationService for StubLlm {
    async fn generate(&self, _chat: ChatId, request_text: &str) -> Result<String, ServiceError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        match request_text {
            "fail" => Err(ServiceError::Status {
                status: 500,
                body: "boom".into(),
            }),
            "stall" => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok("never".into())
            }
            other => Ok(format!("echo: {other}")),
        }
    }
}

#[derive(Default)]
struct RecordingSink {
    sent: Mutex<Vec<(ChatId, String, Option<i64>)>>,
}

#[async_trait]
impl ReplySink for RecordingSink {
    async fn deliver(
        &self,
        conversation_id: ChatId,
        text: &str,
        reply_to: Option<i64>,
    ) -> Result<(), DeliveryError> {
        self.sent
            .lock()
            .await
            .push((conversation_id, text.to_string(), reply_to));
        Ok(())
    }
}

struct Bot {
    base_url: String,
    pipeline: Arc<Pipeline>,
    store: Arc<ConversationStore>,
    sink: Arc<RecordingSink>,
    llm: Arc<StubLlm>,
    http: reqwest::Client,
}

impl Bot {
    async fn start(config: PipelineConfig) -> Self {
        let store = Arc::new(ConversationStore::new(config.max_history));
        let sink = Arc::new(RecordingSink::default());
        let llm = Arc::new(StubLlm {
            calls: AtomicU32::new(0),
        });
        let queues = Queues::new(&config);
        let router = Arc::new(ChatRouter::new(
            BotIdentity {
                id: 1000,
                username: Some("relaybot".into()),
            },
            vec![],
            Arc::clone(&store),
            queues.submitter(),
            sink.clone(),
            PraisePolicy::default(),
        ));
        let pipeline = Arc::new(Pipeline::new(
            config,
            queues,
            PipelineDeps {
                router,
                generator: llm.clone(),
                store: Arc::clone(&store),
                sink: sink.clone(),
            },
        ));
        pipeline.start().await.unwrap();

        let app = server::routes(WebhookState {
            ingress: pipeline.ingress(),
            token: Arc::new(SecretString::from(TOKEN)),
        });
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self {
            base_url: format!("http://127.0.0.1:{port}"),
            pipeline,
            store,
            sink,
            llm,
            http: reqwest::Client::new(),
        }
    }

    async fn post_text(&self, update_id: i64, chat_id: ChatId, text: &str) -> reqwest::StatusCode {
        let body = serde_json::json!({
            "update_id": update_id,
            "message": {
                "message_id": update_id * 10,
                "chat": {"id": chat_id, "type": "private"},
                "from": {"id": 7, "first_name": "Ann"},
                "text": text
            }
        });
        self.http
            .post(format!("{}/webhook/{TOKEN}", self.base_url))
            .json(&body)
            .send()
            .await
            .unwrap()
            .status()
    }

    /// Wait until at least `n` messages have been sent.
    async fn wait_for_sent(&self, n: usize) -> Vec<(ChatId, String, Option<i64>)> {
        timeout(TEST_TIMEOUT, async {
            loop {
                {
                    let sent = self.sink.sent.lock().await;
                    if sent.len() >= n {
                        return sent.clone();
                    }
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("timed out waiting for replies")
    }
}

fn fast_config() -> PipelineConfig {
    PipelineConfig {
        reply_delay: Duration::ZERO,
        retry: RetryPolicy::immediate(2),
        generation_timeout: Duration::from_millis(200),
        ..PipelineConfig::default()
    }
}

#[tokio::test]
async fn text_message_gets_threaded_reply_and_history() {
    let bot = Bot::start(fast_config()).await;

    assert_eq!(bot.post_text(1, 55, "hello").await, reqwest::StatusCode::OK);

    let sent = bot.wait_for_sent(1).await;
    assert_eq!(sent, vec![(55, "echo: hello".to_string(), Some(10))]);
    assert_eq!(
        bot.store.snapshot(55).await.history,
        vec![Exchange::user("hello"), Exchange::assistant("echo: hello")]
    );
}

#[tokio::test]
async fn failing_service_gets_apology_after_all_attempts() {
    let bot = Bot::start(fast_config()).await;

    bot.post_text(1, 56, "fail").await;

    let sent = bot.wait_for_sent(1).await;
    assert_eq!(sent[0].1, APOLOGY);
    assert_eq!(bot.llm.calls.load(Ordering::SeqCst), 3);
    assert_eq!(bot.store.snapshot(56).await.history.len(), 1);
}

#[tokio::test]
async fn stalled_service_times_out_into_apology() {
    let bot = Bot::start(fast_config()).await;

    bot.post_text(1, 57, "stall").await;

    let sent = bot.wait_for_sent(1).await;
    assert_eq!(sent[0].1, APOLOGY);
    assert_eq!(bot.llm.calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn commands_flow_through_webhook() {
    let bot = Bot::start(fast_config()).await;

    bot.post_text(1, 58, "/mode detailed").await;
    bot.wait_for_sent(1).await;
    assert_eq!(bot.store.snapshot(58).await.mode, Mode::Detailed);

    bot.post_text(2, 58, "hi").await;
    bot.wait_for_sent(2).await;
    bot.post_text(3, 58, "/reset").await;

    let sent = bot.wait_for_sent(3).await;
    assert_eq!(sent[2].1, "History cleared.");
    let snapshot = bot.store.snapshot(58).await;
    assert!(snapshot.history.is_empty());
    assert_eq!(snapshot.mode, Mode::Stylish);
}

#[tokio::test]
async fn burst_beyond_capacity_is_acknowledged_and_bounded() {
    let config = PipelineConfig {
        inbound_capacity: 3,
        dispatch_workers: 1,
        ..fast_config()
    };
    let bot = Bot::start(config).await;

    let mut statuses = Vec::new();
    for id in 1..=20 {
        statuses.push(bot.post_text(id, 59, &format!("m{id}")).await);
    }
    assert!(statuses.iter().all(|s| *s == reqwest::StatusCode::OK));

    bot.wait_for_sent(1).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let delivered = bot.sink.sent.lock().await.len();
    assert!((1..=20).contains(&delivered));
}

#[tokio::test]
async fn stop_finishes_within_grace_and_rejects_new_events() {
    let bot = Bot::start(fast_config()).await;
    bot.post_text(1, 60, "hello").await;
    bot.wait_for_sent(1).await;

    let report = timeout(TEST_TIMEOUT, bot.pipeline.stop(Duration::from_secs(2)))
        .await
        .expect("stop exceeded the grace period");
    assert_eq!(report.aborted, 0);
    assert_eq!(bot.pipeline.state(), LifecycleState::Stopped);

    // Still acknowledged, but dropped.
    assert_eq!(bot.post_text(2, 60, "late").await, reqwest::StatusCode::OK);
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(bot.sink.sent.lock().await.len(), 1);
}
