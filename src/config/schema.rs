use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{AppError, Result};

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AppConfig {
    /// Web server settings
    pub web: WebConfig,
    /// Session relay settings
    pub relay: RelayConfig,
}

impl AppConfig {
    /// Reject values that would stall the relay (zero intervals, zero-sized queues)
    pub fn validate(&self) -> Result<()> {
        if self.web.bind_address.trim().is_empty() {
            return Err(AppError::Config("web.bind_address must not be empty".into()));
        }
        if self.relay.heartbeat_interval_secs == 0 {
            return Err(AppError::Config(
                "relay.heartbeat_interval_secs must be greater than 0".into(),
            ));
        }
        if self.relay.missed_heartbeats == 0 {
            return Err(AppError::Config(
                "relay.missed_heartbeats must be at least 1".into(),
            ));
        }
        if self.relay.send_timeout_ms == 0 {
            return Err(AppError::Config(
                "relay.send_timeout_ms must be greater than 0".into(),
            ));
        }
        if self.relay.outbound_queue_capacity == 0 {
            return Err(AppError::Config(
                "relay.outbound_queue_capacity must be greater than 0".into(),
            ));
        }
        if self.relay.max_frame_bytes == 0 {
            return Err(AppError::Config(
                "relay.max_frame_bytes must be greater than 0".into(),
            ));
        }
        Ok(())
    }
}

/// Web server configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct WebConfig {
    /// Bind address
    pub bind_address: String,
    /// HTTP port
    pub port: u16,
    /// Origins allowed by CORS (empty means any origin)
    pub cors_allowed_origins: Vec<String>,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 10000,
            cors_allowed_origins: Vec::new(),
        }
    }
}

/// Session relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RelayConfig {
    /// Seconds between liveness sweeps
    pub heartbeat_interval_secs: u64,
    /// Probes a peer may leave unanswered before it is terminated
    pub missed_heartbeats: u32,
    /// Upper bound for a single outbound WebSocket write
    pub send_timeout_ms: u64,
    /// Messages buffered per connection before frames are dropped
    pub outbound_queue_capacity: usize,
    /// Largest accepted WebSocket message
    pub max_frame_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 30,
            missed_heartbeats: 1,
            send_timeout_ms: 5000,
            outbound_queue_capacity: 64,
            max_frame_bytes: 16 * 1024 * 1024,
        }
    }
}

impl RelayConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }
}
