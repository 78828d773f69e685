//! Centralized configuration for the taskwire transport.
//!
//! Constants live on [`TransportConfig`]; per-server settings live on
//! [`ServerConfig`], which can pick up overrides from the environment.

use crate::error::{Result, TransportError};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Host value that binds on every interface.
pub const ANY_HOST: &str = "0.0.0.0";

/// Host used to reach a server running in the same process or machine.
pub const LOCALHOST: &str = "127.0.0.1";

/// Transport-level timing and sizing constants.
pub struct TransportConfig;

impl TransportConfig {
    // These timeouts should be long enough to permit sending and receiving
    // large messages. They also set the period on which idle workers re-poll.
    pub const DEFAULT_SOCKET_TIMEOUT: Duration = Duration::from_millis(60_000);

    pub const LATCH_TIMEOUT: Duration = Duration::from_secs(10);
    pub const SHUTDOWN_ROUND_TIMEOUT: Duration = Duration::from_secs(10);
    pub const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

    // How long closing a bound socket waits for its listener to be released.
    pub const UNBIND_TIMEOUT: Duration = Duration::from_secs(5);

    // How long delivering a stop command to a relay may take.
    pub const CONTROL_TIMEOUT: Duration = Duration::from_secs(1);

    // Time a closed socket keeps trying to deliver queued messages.
    pub const LINGER: Duration = Duration::from_secs(1);

    // Messages queued per peer before sends block.
    pub const HIGH_WATER_MARK: i32 = 1000;

    pub const MAX_MESSAGE_SIZE: usize = 256 * 1024 * 1024; // 256MB

    pub const DEFAULT_SERVER_THREADS: usize = 2;
}

/// Environment variables read by [`ServerConfig::from_env`].
pub struct EnvKeys;

impl EnvKeys {
    pub const SERVER_THREADS: &'static str = "TASKWIRE_SERVER_THREADS";
    pub const SOCKET_TIMEOUT_MS: &'static str = "TASKWIRE_SOCKET_TIMEOUT_MS";
}

/// Settings for one [`MessageEndpointServer`](crate::transport::MessageEndpointServer).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// External port for fire-and-forget traffic (0 = OS-assigned)
    pub async_port: u16,
    /// External port for request/response traffic (0 = OS-assigned)
    pub sync_port: u16,
    /// Prefix for the process-local fan-out addresses
    pub label: String,
    /// Worker threads per delivery mode
    pub thread_count: usize,
    /// Receive timeout for worker sockets
    #[serde(with = "duration_ms")]
    pub timeout: Duration,
    /// How long `stop` waits for each worker to shut down
    #[serde(with = "duration_ms", default = "default_shutdown_timeout")]
    pub shutdown_timeout: Duration,
    /// How long request latch waits last
    #[serde(with = "duration_ms", default = "default_latch_timeout")]
    pub latch_timeout: Duration,
}

fn default_shutdown_timeout() -> Duration {
    TransportConfig::SHUTDOWN_ROUND_TIMEOUT
}

fn default_latch_timeout() -> Duration {
    TransportConfig::LATCH_TIMEOUT
}

impl ServerConfig {
    pub fn new(label: impl Into<String>, async_port: u16, sync_port: u16) -> Self {
        Self {
            async_port,
            sync_port,
            label: label.into(),
            thread_count: TransportConfig::DEFAULT_SERVER_THREADS,
            timeout: TransportConfig::DEFAULT_SOCKET_TIMEOUT,
            shutdown_timeout: TransportConfig::SHUTDOWN_ROUND_TIMEOUT,
            latch_timeout: TransportConfig::LATCH_TIMEOUT,
        }
    }

    pub fn with_threads(mut self, thread_count: usize) -> Self {
        self.thread_count = thread_count;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_latch_timeout(mut self, timeout: Duration) -> Self {
        self.latch_timeout = timeout;
        self
    }

    /// Build a config, overriding thread count and timeout from the environment.
    pub fn from_env(label: impl Into<String>, async_port: u16, sync_port: u16) -> Result<Self> {
        let mut config = Self::new(label, async_port, sync_port);

        if let Some(threads) = read_env_number(EnvKeys::SERVER_THREADS)? {
            config.thread_count = threads as usize;
        }
        if let Some(ms) = read_env_number(EnvKeys::SOCKET_TIMEOUT_MS)? {
            config.timeout = Duration::from_millis(ms);
        }

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the handler cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.thread_count == 0 {
            return Err(TransportError::Config {
                key: "thread_count".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        if self.label.is_empty() {
            return Err(TransportError::Config {
                key: "label".to_string(),
                message: "must not be empty".to_string(),
            });
        }
        for (key, value) in [
            ("timeout", self.timeout),
            ("shutdown_timeout", self.shutdown_timeout),
            ("latch_timeout", self.latch_timeout),
        ] {
            if value.is_zero() {
                return Err(TransportError::Config {
                    key: key.to_string(),
                    message: "must be positive".to_string(),
                });
            }
        }
        Ok(())
    }
}

fn read_env_number(key: &str) -> Result<Option<u64>> {
    match std::env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Some)
            .map_err(|e| TransportError::Config {
                key: key.to_string(),
                message: format!("invalid value {:?}: {}", raw, e),
            }),
        Err(std::env::VarError::NotPresent) => Ok(None),
        Err(e) => Err(TransportError::Config {
            key: key.to_string(),
            message: e.to_string(),
        }),
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
