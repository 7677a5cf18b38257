//! Generation executor: one outbound call per attempt, bounded and retried.
//!
//! Each attempt takes a slot from a semaphore sized independently of the
//! worker pools and races the service call against the generation timeout.
//! A timed-out attempt's future is dropped, so a late reply can never leak
//! back into conversation state. Failed attempts are retried with capped
//! exponential backoff until the policy is exhausted.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::Semaphore;

use crate::config::RetryPolicy;
use crate::error::{GenerationError, ServiceError};
use crate::pipeline::ChatId;

/// The external text generation service.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Produce a reply for `request_text` in the given conversation.
    async fn generate(&self, conversation_id: ChatId, request_text: &str)
    -> Result<String, ServiceError>;
}

/// Successful generation and how many attempts it took.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Generation {
    pub text: String,
    pub attempts: u32,
}

/// Runs generation calls with a timeout, a concurrency bound and retries.
pub struct GenerationExecutor {
    service: Arc<dyn GenerationService>,
    slots: Arc<Semaphore>,
    timeout: Duration,
    retry: RetryPolicy,
}

impl GenerationExecutor {
    pub fn new(
        service: Arc<dyn GenerationService>,
        concurrency: usize,
        timeout: Duration,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            service,
            slots: Arc::new(Semaphore::new(concurrency)),
            timeout,
            retry,
        }
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    /// Execution slots not currently in use.
    pub fn available_slots(&self) -> usize {
        self.slots.available_permits()
    }

    /// Generate with retries. Exhausting the policy yields `GenerationError::Failure`.
    pub async fn execute(
        &self,
        conversation_id: ChatId,
        request_text: &str,
    ) -> Result<Generation, GenerationError> {
        let total = self.retry.total_attempts();
        let mut attempt = 1;

        loop {
            match self.attempt(conversation_id, request_text).await {
                Ok(text) => {
                    tracing::debug!(chat_id = conversation_id, attempt, "Generation succeeded");
                    return Ok(Generation {
                        text,
                        attempts: attempt,
                    });
                }
                Err(e) if attempt >= total => {
                    tracing::error!(
                        chat_id = conversation_id,
                        attempts = attempt,
                        kind = e.kind(),
                        error = %e,
                        "Generation failed, retries exhausted"
                    );
                    return Err(GenerationError::Failure {
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    let delay = backoff_delay(&self.retry, attempt - 1);
                    tracing::warn!(
                        chat_id = conversation_id,
                        attempt,
                        max_attempts = total,
                        kind = e.kind(),
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generation attempt failed, retrying"
                    );
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    attempt += 1;
                }
            }
        }
    }

    /// A single attempt: wait for a slot, then call the service under the timeout.
    pub async fn attempt(
        &self,
        conversation_id: ChatId,
        request_text: &str,
    ) -> Result<String, GenerationError> {
        let _permit = self
            .slots
            .acquire()
            .await
            .map_err(|_| ServiceError::RequestFailed("execution pool closed".to_string()))?;

        match tokio::time::timeout(
            self.timeout,
            self.service.generate(conversation_id, request_text),
        )
        .await
        {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(GenerationError::Service(e)),
            Err(_) => Err(GenerationError::Timeout(self.timeout)),
        }
    }
}

/// `base * 2^retry`, capped at `max_delay`, plus up to 25% jitter (still capped).
fn backoff_delay(policy: &RetryPolicy, retry: u32) -> Duration {
    let base_ms = policy.base_delay.as_millis() as u64;
    if base_ms == 0 {
        return Duration::ZERO;
    }
    let max_ms = policy.max_delay.as_millis() as u64;
    let capped_ms = base_ms
        .saturating_mul(2u64.saturating_pow(retry))
        .min(max_ms);

    let jitter_ms = match capped_ms / 4 {
        0 => 0,
        range => rand::thread_rng().gen_range(0..=range),
    };
    Duration::from_millis(capped_ms.saturating_add(jitter_ms).min(max_ms))
}
