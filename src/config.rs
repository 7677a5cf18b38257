//! Configuration types.
//!
//! Everything is read from environment variables (a `.env` file is loaded
//! first by the binary). Every pipeline knob has a default; only the bot
//! credentials are required.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use secrecy::SecretString;

use crate::error::ConfigError;

/// Retry policy for generation attempts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Retries after the first attempt (total attempts = `max_retries + 1`).
    pub max_retries: u32,
    /// Delay before the first retry; doubles on each subsequent retry.
    pub base_delay: Duration,
    /// Upper bound on a single backoff delay.
    pub max_delay: Duration,
}

impl RetryPolicy {
    /// Re-issue immediately, no backoff.
    pub fn immediate(max_retries: u32) -> Self {
        Self {
            max_retries,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    pub fn total_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

/// Pipeline configuration: pool sizes, queue capacities, timeouts.
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// Number of dispatch workers.
    pub dispatch_workers: usize,
    /// Number of generation workers.
    pub generation_workers: usize,
    /// Capacity of the raw inbound event queue.
    pub inbound_capacity: usize,
    /// Capacity of the generation job queue.
    pub generation_capacity: usize,
    /// Wall-clock limit for routing a single update.
    pub dispatch_timeout: Duration,
    /// Wall-clock limit for a single generation attempt.
    pub generation_timeout: Duration,
    /// Wall-clock limit for a single Bot API call made by a generation worker.
    pub delivery_timeout: Duration,
    /// Concurrent generation calls allowed across all workers.
    pub generation_concurrency: usize,
    /// Generation retry policy.
    pub retry: RetryPolicy,
    /// How long `stop` waits for in-flight items before aborting workers.
    pub shutdown_grace: Duration,
    /// Pause between the typing indicator and the reply.
    pub reply_delay: Duration,
    /// Maximum history entries kept per conversation.
    pub max_history: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            dispatch_workers: 2,
            generation_workers: 2,
            inbound_capacity: 200,
            generation_capacity: 100,
            dispatch_timeout: Duration::from_secs(35),
            generation_timeout: Duration::from_secs(60),
            delivery_timeout: Duration::from_secs(30),
            generation_concurrency: 4,
            retry: RetryPolicy::default(),
            shutdown_grace: Duration::from_secs(10),
            reply_delay: Duration::from_millis(800),
            max_history: 20,
        }
    }
}

impl PipelineConfig {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load using an arbitrary key lookup (the environment in production).
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let env = Env(&lookup);

        // WORKER_COUNT / QUEUE_MAXSIZE / WORKER_TIMEOUT predate the split pools.
        let dispatch_workers = env.parse_or(
            &["DISPATCH_WORKERS", "WORKER_COUNT"],
            defaults.dispatch_workers,
        )?;
        let inbound_capacity = env.parse_or(
            &["INBOUND_QUEUE_CAPACITY", "QUEUE_MAXSIZE"],
            defaults.inbound_capacity,
        )?;
        let dispatch_timeout = env.secs_or(
            &["DISPATCH_TIMEOUT_SECS", "WORKER_TIMEOUT"],
            defaults.dispatch_timeout,
        )?;

        let config = Self {
            dispatch_workers,
            generation_workers: env.parse_or(&["GENERATION_WORKERS"], defaults.generation_workers)?,
            inbound_capacity,
            generation_capacity: env
                .parse_or(&["GENERATION_QUEUE_CAPACITY"], defaults.generation_capacity)?,
            dispatch_timeout,
            generation_timeout: env
                .secs_or(&["GENERATION_TIMEOUT_SECS"], defaults.generation_timeout)?,
            delivery_timeout: env
                .secs_or(&["DELIVERY_TIMEOUT_SECS"], defaults.delivery_timeout)?,
            generation_concurrency: env
                .parse_or(&["GENERATION_CONCURRENCY"], defaults.generation_concurrency)?,
            retry: RetryPolicy {
                max_retries: env.parse_or(&["GENERATION_RETRIES"], defaults.retry.max_retries)?,
                base_delay: env.millis_or(&["RETRY_BASE_DELAY_MS"], defaults.retry.base_delay)?,
                max_delay: env.millis_or(&["RETRY_MAX_DELAY_MS"], defaults.retry.max_delay)?,
            },
            shutdown_grace: env.secs_or(&["SHUTDOWN_GRACE_SECS"], defaults.shutdown_grace)?,
            reply_delay: env.millis_or(&["REPLY_DELAY_MS"], defaults.reply_delay)?,
            max_history: env.parse_or(&["MAX_HISTORY"], defaults.max_history)?,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject values the pipeline cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_zero = [
            ("DISPATCH_WORKERS", self.dispatch_workers),
            ("GENERATION_WORKERS", self.generation_workers),
            ("INBOUND_QUEUE_CAPACITY", self.inbound_capacity),
            ("GENERATION_QUEUE_CAPACITY", self.generation_capacity),
            ("GENERATION_CONCURRENCY", self.generation_concurrency),
            ("MAX_HISTORY", self.max_history),
        ];
        for (key, value) in non_zero {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: "must be greater than zero".to_string(),
                });
            }
        }
        if self.dispatch_timeout.is_zero()
            || self.generation_timeout.is_zero()
            || self.delivery_timeout.is_zero()
        {
            return Err(ConfigError::InvalidValue {
                key: "timeout".to_string(),
                message: "timeouts must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Bot-level settings: credentials, public endpoint, collaborator tuning.
#[derive(Debug, Clone)]
pub struct BotConfig {
    pub telegram_token: SecretString,
    pub llm_api_key: SecretString,
    /// Public base URL the webhook is registered under.
    pub public_url: String,
    pub port: u16,
    pub llm_base_url: String,
    pub llm_model: String,
    pub persona_path: PathBuf,
    /// Names the bot answers to when not @-mentioned.
    pub bot_names: Vec<String>,
    /// Praise probability for media without a positive keyword in the caption.
    pub base_chance: f64,
    /// Praise probability when the caption contains a positive keyword.
    pub keyword_chance: f64,
    pub keep_alive: bool,
    pub keep_alive_interval: Duration,
    pub log_dir: Option<PathBuf>,
}

impl BotConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let env = Env(&lookup);

        let telegram_token = env.required("TG_TOKEN")?;
        let llm_api_key = env.required("HF_TOKEN")?;
        let public_url = env.required("PUBLIC_URL")?.trim_end_matches('/').to_string();

        let base_chance = env.parse_or(&["BASE_CHANCE"], 0.2_f64)?;
        let keyword_chance = env.parse_or(&["KEYWORD_CHANCE"], 0.9_f64)?;
        for (key, value) in [("BASE_CHANCE", base_chance), ("KEYWORD_CHANCE", keyword_chance)] {
            if !(0.0..=1.0).contains(&value) {
                return Err(ConfigError::InvalidValue {
                    key: key.to_string(),
                    message: format!("{value} is not a probability"),
                });
            }
        }

        let keep_alive_interval =
            env.secs_or(&["KEEP_ALIVE_INTERVAL_SECS"], Duration::from_secs(60))?;
        if keep_alive_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "KEEP_ALIVE_INTERVAL_SECS".to_string(),
                message: "must be greater than zero".to_string(),
            });
        }

        let bot_names: Vec<String> = lookup("BOT_NAMES")
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Ok(Self {
            telegram_token: SecretString::from(telegram_token),
            llm_api_key: SecretString::from(llm_api_key),
            public_url,
            port: env.parse_or(&["PORT"], 8000_u16)?,
            llm_base_url: lookup("LLM_BASE_URL")
                .unwrap_or_else(|| "https://router.huggingface.co/v1".to_string()),
            llm_model: lookup("LLM_MODEL")
                .unwrap_or_else(|| "deepseek-ai/DeepSeek-R1".to_string()),
            persona_path: lookup("PERSONA_PATH")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("persona.txt")),
            bot_names,
            base_chance,
            keyword_chance,
            keep_alive: env.parse_or(&["KEEP_ALIVE"], true)?,
            keep_alive_interval,
            log_dir: lookup("LOG_DIR").map(PathBuf::from),
        })
    }
}

/// Thin typed view over a key lookup.
struct Env<'a, F: Fn(&str) -> Option<String>>(&'a F);

impl<F: Fn(&str) -> Option<String>> Env<'_, F> {
    /// First non-empty value among `keys`, with the key it came from.
    fn first(&self, keys: &[&str]) -> Option<(String, String)> {
        keys.iter().find_map(|key| {
            (self.0)(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .map(|v| (key.to_string(), v))
        })
    }

    fn required(&self, key: &str) -> Result<String, ConfigError> {
        self.first(&[key])
            .map(|(_, v)| v)
            .ok_or_else(|| ConfigError::MissingEnvVar(key.to_string()))
    }

    fn parse_or<T>(&self, keys: &[&str], default: T) -> Result<T, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        match self.first(keys) {
            Some((key, raw)) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
                key,
                message: format!("{raw:?}: {e}"),
            }),
            None => Ok(default),
        }
    }

    fn secs_or(&self, keys: &[&str], default: Duration) -> Result<Duration, ConfigError> {
        match self.first(keys) {
            Some((key, raw)) => raw
                .parse::<f64>()
                .ok()
                .and_then(|s| Duration::try_from_secs_f64(s).ok())
                .ok_or_else(|| ConfigError::InvalidValue {
                    key,
                    message: format!("{raw:?} is not a number of seconds"),
                }),
            None => Ok(default),
        }
    }

    fn millis_or(&self, keys: &[&str], default: Duration) -> Result<Duration, ConfigError> {
        self.parse_or(keys, default.as_millis() as u64)
            .map(Duration::from_millis)
    }
}
