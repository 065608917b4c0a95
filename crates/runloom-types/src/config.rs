//! Worker configuration types for Runloom.
//!
//! `WorkerConfig` represents the `config.toml` that tunes cache sizes, HTTP
//! body limits, queue retry policy, and persisted-payload budgets. All fields
//! have defaults so an empty file (or no file) yields a working engine.

use std::time::Duration;

use secrecy::SecretString;
use serde::Deserialize;

/// Top-level worker configuration.
///
/// Loaded from `{data_dir}/config.toml`. Deliberately not serializable:
/// `secret_key` must never be written back out.
#[derive(Debug, Clone, Deserialize)]
pub struct WorkerConfig {
    /// AES-256-GCM key for secret decryption, as 64-char hex or base64.
    /// Absent means secrets cannot be decrypted (template `secret.` lookups
    /// will fail).
    #[serde(default)]
    pub secret_key: Option<SecretString>,

    #[serde(default)]
    pub cache: CacheConfig,

    #[serde(default)]
    pub http: HttpConfig,

    #[serde(default)]
    pub queue: QueueConfig,

    #[serde(default)]
    pub output: OutputConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            secret_key: None,
            cache: CacheConfig::default(),
            http: HttpConfig::default(),
            queue: QueueConfig::default(),
            output: OutputConfig::default(),
        }
    }
}

// ---------------------------------------------------------------------------
// Cache
// ---------------------------------------------------------------------------

/// Capacities and TTLs for the worker's read-through caches.
#[derive(Debug, Clone, Deserialize)]
pub struct CacheConfig {
    /// Workflow-version cache entries.
    #[serde(default = "default_version_capacity")]
    pub version_capacity: usize,
    #[serde(default = "default_version_ttl_seconds")]
    pub version_ttl_seconds: u64,

    /// Workflow-run cache entries.
    #[serde(default = "default_run_capacity")]
    pub run_capacity: usize,
    #[serde(default = "default_run_ttl_seconds")]
    pub run_ttl_seconds: u64,

    /// Decrypted-secret cache entries. Short TTL keeps plaintext exposure
    /// bounded.
    #[serde(default = "default_secret_capacity")]
    pub secret_capacity: usize,
    #[serde(default = "default_secret_ttl_seconds")]
    pub secret_ttl_seconds: u64,
}

impl CacheConfig {
    pub fn version_ttl(&self) -> Duration {
        Duration::from_secs(self.version_ttl_seconds)
    }

    pub fn run_ttl(&self) -> Duration {
        Duration::from_secs(self.run_ttl_seconds)
    }

    pub fn secret_ttl(&self) -> Duration {
        Duration::from_secs(self.secret_ttl_seconds)
    }
}

fn default_version_capacity() -> usize {
    500
}

fn default_version_ttl_seconds() -> u64 {
    300
}

fn default_run_capacity() -> usize {
    1000
}

fn default_run_ttl_seconds() -> u64 {
    60
}

fn default_secret_capacity() -> usize {
    500
}

fn default_secret_ttl_seconds() -> u64 {
    60
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            version_capacity: default_version_capacity(),
            version_ttl_seconds: default_version_ttl_seconds(),
            run_capacity: default_run_capacity(),
            run_ttl_seconds: default_run_ttl_seconds(),
            secret_capacity: default_secret_capacity(),
            secret_ttl_seconds: default_secret_ttl_seconds(),
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP executor
// ---------------------------------------------------------------------------

/// Limits for outbound HTTP steps.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpConfig {
    /// Default request timeout when a step does not set `timeoutMs`.
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    /// Response bodies beyond this fail the step with a truncation error.
    #[serde(default = "default_soft_max_body_bytes")]
    pub soft_max_body_bytes: usize,
    /// Response reads are aborted outright beyond this.
    #[serde(default = "default_hard_max_body_bytes")]
    pub hard_max_body_bytes: usize,
}

impl HttpConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

fn default_timeout_ms() -> u64 {
    30_000
}

fn default_soft_max_body_bytes() -> usize {
    256 * 1024
}

fn default_hard_max_body_bytes() -> usize {
    10 * 1024 * 1024
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            timeout_ms: default_timeout_ms(),
            soft_max_body_bytes: default_soft_max_body_bytes(),
            hard_max_body_bytes: default_hard_max_body_bytes(),
        }
    }
}

// ---------------------------------------------------------------------------
// Queue retry policy
// ---------------------------------------------------------------------------

/// Retry policy applied to every enqueued step-run job.
#[derive(Debug, Clone, Deserialize)]
pub struct QueueConfig {
    #[serde(default = "default_attempts")]
    pub attempts: u32,
    /// Base delay for exponential backoff between attempts.
    #[serde(default = "default_backoff_delay_ms")]
    pub backoff_delay_ms: u64,
}

fn default_attempts() -> u32 {
    3
}

fn default_backoff_delay_ms() -> u64 {
    5000
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            attempts: default_attempts(),
            backoff_delay_ms: default_backoff_delay_ms(),
        }
    }
}

// ---------------------------------------------------------------------------
// Persisted-payload budgets
// ---------------------------------------------------------------------------

/// Byte budgets for values persisted on step runs.
#[derive(Debug, Clone, Deserialize)]
pub struct OutputConfig {
    /// Budget for step outputs and resolved-request snapshots. Step-level
    /// `outputPolicy.maxBytes` overrides this for outputs.
    #[serde(default = "default_output_max_bytes")]
    pub max_bytes: usize,
    /// Budget for persisted failure detail.
    #[serde(default = "default_error_max_bytes")]
    pub error_max_bytes: usize,
}

fn default_output_max_bytes() -> usize {
    256 * 1024
}

fn default_error_max_bytes() -> usize {
    64 * 1024
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            max_bytes: default_output_max_bytes(),
            error_max_bytes: default_error_max_bytes(),
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
