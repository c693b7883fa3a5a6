//! Harness tuning knobs, loadable from TOML.
//!
//! Defaults reproduce the fixed constants the harness shipped with: one
//! shared wait deadline for every blocking wait, and three 100 ms retries
//! for the post-handshake operations.

use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

pub const DEFAULT_WAIT_TIMEOUT_MS: u64 = 2_000;
pub const DEFAULT_RETRY_ATTEMPTS: u32 = 3;
pub const DEFAULT_RETRY_BACKOFF_MS: u64 = 100;

/// Bounded-retry schedule for operations that can legitimately fail with
/// `InvalidState` during the post-handshake confirmation window.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Additional attempts after the first call.
    pub attempts: u32,
    /// Sleep between attempts, in milliseconds.
    pub backoff_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: DEFAULT_RETRY_ATTEMPTS,
            backoff_ms: DEFAULT_RETRY_BACKOFF_MS,
        }
    }
}

impl RetryPolicy {
    pub fn backoff(&self) -> Duration {
        Duration::from_millis(self.backoff_ms)
    }
}

/// Per-fixture harness configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct HarnessConfig {
    /// Deadline applied to every blocking wait, in milliseconds.
    pub wait_timeout_ms: u64,
    pub retry: RetryPolicy,
}

impl Default for HarnessConfig {
    fn default() -> Self {
        Self {
            wait_timeout_ms: DEFAULT_WAIT_TIMEOUT_MS,
            retry: RetryPolicy::default(),
        }
    }
}

#[derive(Default, Deserialize)]
struct Document {
    #[serde(default)]
    harness: HarnessConfig,
}

impl HarnessConfig {
    /// Load configuration from the `[harness]` table of a TOML string.
    pub fn from_toml(s: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let doc: Document = toml::from_str(s)?;
        Ok(doc.harness)
    }

    /// Load configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.wait_timeout_ms == 0 {
            return Err("wait_timeout_ms must be non-zero".into());
        }
        if self.retry.attempts > 16 {
            return Err("retry.attempts out of range".into());
        }
        Ok(())
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_millis(self.wait_timeout_ms)
    }
}
