//! Keep-alive pinger: periodically GETs our own `/health` so free-tier
//! hosts don't idle the service out.

use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

const PING_TIMEOUT: Duration = Duration::from_secs(10);

/// `tokio::time::interval` panics on a zero period.
const MIN_INTERVAL: Duration = Duration::from_millis(1);

pub struct KeepAlive {
    client: reqwest::Client,
    url: String,
    interval: Duration,
}

impl KeepAlive {
    /// Ping `{public_url}/health` every `interval`.
    pub fn new(public_url: &str, interval: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(PING_TIMEOUT)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self {
            client,
            url: format!("{}/health", public_url.trim_end_matches('/')),
            interval: interval.max(MIN_INTERVAL),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// One ping; returns the HTTP status.
    pub async fn ping(&self) -> Result<reqwest::StatusCode, reqwest::Error> {
        let resp = self.client.get(&self.url).send().await?;
        Ok(resp.status())
    }

    /// Run until `cancel` fires. Failures are logged and never stop the loop.
    pub fn spawn(self, cancel: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            tracing::info!(url = %self.url, interval_secs = self.interval.as_secs_f64(), "Keep-alive started");
            let mut interval = tokio::time::interval(self.interval);
            interval.tick().await; // Skip immediate first tick
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = interval.tick() => {}
                }
                match self.ping().await {
                    Ok(status) => tracing::debug!(%status, "Keep-alive ping"),
                    Err(e) => tracing::warn!(error = %e, "Keep-alive ping failed"),
                }
            }
            tracing::info!("Keep-alive stopped");
        })
    }
}
