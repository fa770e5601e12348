use std::time::Duration;

use serde::Deserialize;

use crate::error::Error;

/// Engine configuration, read from `TEMPOQ_`-prefixed environment variables.
///
/// Durations are expressed in whole milliseconds or seconds as their field
/// names say, so they can be set from plain environment strings.
/// `TEMPOQ_RETRY_DELAYS_MS` takes a comma separated list.
#[derive(Clone, Debug, Deserialize)]
pub struct Config {
    /// Path of the SQLite database backing the store. In-memory store when absent.
    #[serde(default)]
    pub db_path: Option<String>,

    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_retry_delays_ms")]
    pub retry_delays_ms: Vec<u64>,

    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,

    #[serde(default = "default_dead_letter_ttl_secs")]
    pub dead_letter_ttl_secs: u64,

    #[serde(default = "default_processing_timeout_ms")]
    pub processing_timeout_ms: u64,

    /// Visibility timeout: how long a message may sit in processing before
    /// the reclaimer considers its worker dead.
    #[serde(default = "default_lock_duration_ms")]
    pub lock_duration_ms: u64,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Cap on concurrently executing messages per topic. Defaults to `batch_size`.
    #[serde(default)]
    pub max_in_flight: Option<usize>,

    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,

    #[serde(default = "default_message_ttl_secs")]
    pub message_ttl_secs: u64,
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_owned()
}

fn default_retry_delays_ms() -> Vec<u64> {
    vec![1_000, 5_000, 30_000, 120_000, 600_000]
}

fn default_max_retries() -> u32 {
    3
}

fn default_dead_letter_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

fn default_processing_timeout_ms() -> u64 {
    30_000
}

fn default_lock_duration_ms() -> u64 {
    5 * 60 * 1_000
}

fn default_batch_size() -> usize {
    10
}

fn default_poll_interval_ms() -> u64 {
    1_000
}

fn default_cleanup_interval_ms() -> u64 {
    60 * 60 * 1_000
}

fn default_message_ttl_secs() -> u64 {
    7 * 24 * 60 * 60
}

impl Config {
    /// Loads and validates the configuration from the environment.
    pub fn load() -> Result<Self, Error> {
        let config = envy::prefixed("TEMPOQ_")
            .from_env::<Self>()
            .map_err(|e| Error::invalid_config(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }

    /// Checks every option is usable. A queue running with a bad
    /// configuration can silently lose its delivery guarantees, so callers
    /// should treat an error here as fatal.
    pub fn validate(&self) -> Result<(), Error> {
        if self.retry_delays_ms.is_empty() {
            return Err(Error::invalid_config("retry_delays_ms must not be empty"));
        }

        if self.retry_delays_ms.iter().any(|d| *d == 0) {
            return Err(Error::invalid_config(
                "retry_delays_ms entries must be positive",
            ));
        }

        if self.retry_delays_ms.windows(2).any(|w| w[0] > w[1]) {
            return Err(Error::invalid_config("retry_delays_ms must be ascending"));
        }

        let positive = [
            ("dead_letter_ttl_secs", self.dead_letter_ttl_secs),
            ("processing_timeout_ms", self.processing_timeout_ms),
            ("lock_duration_ms", self.lock_duration_ms),
            ("poll_interval_ms", self.poll_interval_ms),
            ("cleanup_interval_ms", self.cleanup_interval_ms),
            ("message_ttl_secs", self.message_ttl_secs),
        ];

        for (name, value) in positive {
            if value == 0 {
                return Err(Error::invalid_config(format!("{name} must be positive")));
            }
        }

        if self.batch_size == 0 {
            return Err(Error::invalid_config("batch_size must be positive"));
        }

        if self.default_max_retries == 0 {
            return Err(Error::invalid_config("default_max_retries must be positive"));
        }

        if self.max_in_flight == Some(0) {
            return Err(Error::invalid_config("max_in_flight must be positive"));
        }

        // A lock shorter than the handler deadline would reclaim messages
        // whose handlers are still legitimately running.
        if self.lock_duration_ms < self.processing_timeout_ms {
            return Err(Error::invalid_config(
                "lock_duration_ms must be at least processing_timeout_ms",
            ));
        }

        Ok(())
    }

    pub fn retry_delays(&self) -> Vec<Duration> {
        self.retry_delays_ms
            .iter()
            .copied()
            .map(Duration::from_millis)
            .collect()
    }

    pub fn dead_letter_ttl(&self) -> Duration {
        Duration::from_secs(self.dead_letter_ttl_secs)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_millis(self.processing_timeout_ms)
    }

    pub fn lock_duration(&self) -> Duration {
        Duration::from_millis(self.lock_duration_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn message_ttl(&self) -> Duration {
        Duration::from_secs(self.message_ttl_secs)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.unwrap_or(self.batch_size)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: None,
            bind: default_bind(),
            retry_delays_ms: default_retry_delays_ms(),
            default_max_retries: default_max_retries(),
            dead_letter_ttl_secs: default_dead_letter_ttl_secs(),
            processing_timeout_ms: default_processing_timeout_ms(),
            lock_duration_ms: default_lock_duration_ms(),
            batch_size: default_batch_size(),
            max_in_flight: None,
            poll_interval_ms: default_poll_interval_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            message_ttl_secs: default_message_ttl_secs(),
        }
    }
}
