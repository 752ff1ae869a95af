use serde::Deserialize;
use std::net::SocketAddr;
use std::time::Duration;

/// Largest chunk the store layer will send in one bulk call.
pub const MAX_STORE_BATCH_LIMIT: usize = 1000;

#[derive(Debug, Clone, Deserialize)]
pub struct AppConfig {
    /// Server bind address (e.g., "0.0.0.0:3000"). Optional for worker processes.
    #[serde(default = "default_bind_addr")]
    pub bind_addr: String,

    /// Prometheus scrape listener of the worker process
    #[serde(default = "default_worker_metrics_addr")]
    pub worker_metrics_addr: String,

    /// PostgreSQL connection string
    pub database_url: String,

    /// Redis connection string for the work queue
    pub redis_url: String,

    /// Key prefix for the queue's Redis structures
    #[serde(default = "default_queue_name")]
    pub queue_name: String,

    /// Messages the worker asks for per receive
    #[serde(default = "default_batch_size")]
    pub worker_batch_size: usize,

    /// Broker ceiling on messages per receive
    #[serde(default = "default_batch_size")]
    pub queue_max_batch_size: usize,

    /// How long a receive waits to fill a batch before returning a partial one
    #[serde(default = "default_batch_window_ms")]
    pub batch_window_ms: u64,

    /// Poll interval while a receive is waiting for messages
    #[serde(default = "default_queue_poll_interval_ms")]
    pub queue_poll_interval_ms: u64,

    /// Lease length of a received message
    #[serde(default = "default_visibility_timeout_secs")]
    pub visibility_timeout_secs: u64,

    /// Deliveries after which a message is dead-lettered
    #[serde(default = "default_max_receive_count")]
    pub max_receive_count: u32,

    /// Item ceiling per bulk store call
    #[serde(default = "default_store_batch_limit")]
    pub store_batch_limit: usize,

    /// Upper bound on any single store call
    #[serde(default = "default_store_timeout_ms")]
    pub store_timeout_ms: u64,

    /// Immediate retries for ids that fail to persist
    #[serde(default = "default_persist_retries")]
    pub persist_retries: u32,

    #[serde(default = "default_persist_retry_backoff_ms")]
    pub persist_retry_backoff_ms: u64,

    /// Pause after a systemic worker error
    #[serde(default = "default_error_backoff_ms")]
    pub error_backoff_ms: u64,

    /// Write `InProgress` before predicting
    #[serde(default)]
    pub mark_in_progress: bool,

    /// JSON file with linear model coefficients
    #[serde(default)]
    pub model_path: Option<String>,

    /// Seconds between reconciliation sweeps, 0 disables them
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,

    /// Age after which a `Pending` job is considered orphaned
    #[serde(default = "default_reconcile_after_secs")]
    pub reconcile_after_secs: u64,

    #[serde(default = "default_reconcile_batch_limit")]
    pub reconcile_batch_limit: usize,
}

fn default_bind_addr() -> String {
    "0.0.0.0:3000".to_string()
}

fn default_worker_metrics_addr() -> String {
    "0.0.0.0:9091".to_string()
}

fn default_queue_name() -> String {
    "predict_jobs".to_string()
}

fn default_batch_size() -> usize {
    10
}

fn default_batch_window_ms() -> u64 {
    2000
}

fn default_queue_poll_interval_ms() -> u64 {
    100
}

fn default_visibility_timeout_secs() -> u64 {
    30
}

fn default_max_receive_count() -> u32 {
    5
}

fn default_store_batch_limit() -> usize {
    25
}

fn default_store_timeout_ms() -> u64 {
    5000
}

fn default_persist_retries() -> u32 {
    2
}

fn default_persist_retry_backoff_ms() -> u64 {
    50
}

fn default_error_backoff_ms() -> u64 {
    1000
}

fn default_reconcile_interval_secs() -> u64 {
    60
}

fn default_reconcile_after_secs() -> u64 {
    300
}

fn default_reconcile_batch_limit() -> usize {
    100
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment error: {0}")]
    Env(#[from] envy::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();
        let config: AppConfig = envy::from_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Check the batching and timing knobs against each other.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_max_batch_size == 0 {
            return Err(ConfigError::Invalid(
                "queue_max_batch_size must be at least 1".into(),
            ));
        }
        if self.worker_batch_size == 0 || self.worker_batch_size > self.queue_max_batch_size {
            return Err(ConfigError::Invalid(format!(
                "worker_batch_size {} must be between 1 and queue_max_batch_size {}",
                self.worker_batch_size, self.queue_max_batch_size
            )));
        }
        if self.store_batch_limit == 0 || self.store_batch_limit > MAX_STORE_BATCH_LIMIT {
            return Err(ConfigError::Invalid(format!(
                "store_batch_limit {} must be between 1 and {}",
                self.store_batch_limit, MAX_STORE_BATCH_LIMIT
            )));
        }
        if self.max_receive_count == 0 {
            return Err(ConfigError::Invalid(
                "max_receive_count must be at least 1".into(),
            ));
        }
        if self.worker_metrics_addr.parse::<SocketAddr>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "worker_metrics_addr '{}' is not a socket address",
                self.worker_metrics_addr
            )));
        }
        let budget = self.batch_time_budget();
        if self.visibility_timeout() <= budget {
            return Err(ConfigError::Invalid(format!(
                "visibility_timeout_secs {} must exceed the worst-case batch time of {} ms \
                 (batch window, chunked store calls with retries, retry backoff)",
                self.visibility_timeout_secs,
                budget.as_millis()
            )));
        }
        if self.worker_batch_size > self.store_batch_limit {
            tracing::info!(
                worker_batch_size = self.worker_batch_size,
                store_batch_limit = self.store_batch_limit,
                "Worker batch exceeds store bulk limit, store calls will be chunked"
            );
        }
        Ok(())
    }

    /// Worst-case wall time of one worker batch: the receive window plus
    /// every chunked store call hitting its timeout, including persist
    /// retries, the optional `InProgress` write and the retry backoffs.
    pub fn batch_time_budget(&self) -> Duration {
        let chunks = self.worker_batch_size.div_ceil(self.store_batch_limit.max(1));
        let chunks = u32::try_from(chunks).unwrap_or(u32::MAX);
        let attempts = self.persist_retries.saturating_add(1);
        let write_rounds = if self.mark_in_progress { 2 } else { 1 };

        let store_calls = chunks.saturating_mul(attempts.saturating_mul(write_rounds).saturating_add(1));
        // backoff before retry n is n * persist_retry_backoff
        let backoff_steps = (self.persist_retries.saturating_mul(attempts) / 2).saturating_mul(write_rounds);

        self.batch_window()
            .saturating_add(self.store_timeout().saturating_mul(store_calls))
            .saturating_add(Duration::from_millis(self.persist_retry_backoff_ms).saturating_mul(backoff_steps))
    }

    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }

    pub fn visibility_timeout(&self) -> Duration {
        Duration::from_secs(self.visibility_timeout_secs)
    }

    pub fn store_timeout(&self) -> Duration {
        Duration::from_millis(self.store_timeout_ms)
    }
}
