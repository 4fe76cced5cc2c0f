//! Recorder configuration types
//!
//! Minimal configuration needed by the library: which adapter to open and how the
//! capture loop behaves. File handling and presentation live in the application layer
//! (can-trace-cli).

use crate::adapter::AdapterKind;
use crate::types::Bitrate;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Capture loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Adapter receive timeout per poll (bounds stop latency)
    #[serde(default = "default_poll_timeout")]
    pub poll_timeout_ms: u64,

    /// Consecutive `Disconnected` results tolerated before faulting
    #[serde(default = "default_disconnect_retry_limit")]
    pub disconnect_retry_limit: u32,

    /// Sink writes slower than this fault the session (0 disables the check)
    #[serde(default = "default_sink_backpressure")]
    pub sink_backpressure_ms: u64,

    /// Longest `stop` waits for queued lines to reach the sink
    #[serde(default = "default_finalize_timeout")]
    pub finalize_timeout_ms: u64,

    /// Generator name written into the trace header
    #[serde(default = "default_generator")]
    pub generator: String,
}

fn default_poll_timeout() -> u64 {
    100
}

fn default_disconnect_retry_limit() -> u32 {
    3
}

fn default_sink_backpressure() -> u64 {
    500
}

fn default_finalize_timeout() -> u64 {
    5_000
}

fn default_generator() -> String {
    format!("can-trace v{}", crate::VERSION)
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            poll_timeout_ms: default_poll_timeout(),
            disconnect_retry_limit: default_disconnect_retry_limit(),
            sink_backpressure_ms: default_sink_backpressure(),
            finalize_timeout_ms: default_finalize_timeout(),
            generator: default_generator(),
        }
    }
}

impl SessionConfig {
    /// Create a session configuration with default settings
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder method: set the adapter poll timeout
    pub fn with_poll_timeout(mut self, timeout: Duration) -> Self {
        self.poll_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set how many consecutive disconnects fault the session
    pub fn with_disconnect_retry_limit(mut self, limit: u32) -> Self {
        self.disconnect_retry_limit = limit;
        self
    }

    /// Builder method: set the sink backpressure threshold
    pub fn with_sink_backpressure(mut self, threshold: Duration) -> Self {
        self.sink_backpressure_ms = threshold.as_millis() as u64;
        self
    }

    /// Builder method: set how long `stop` waits for the trace writer
    pub fn with_finalize_timeout(mut self, timeout: Duration) -> Self {
        self.finalize_timeout_ms = timeout.as_millis() as u64;
        self
    }

    /// Builder method: set the generator name for the trace header
    pub fn with_generator(mut self, generator: impl Into<String>) -> Self {
        self.generator = generator.into();
        self
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms.max(1))
    }

    /// `None` when the check is disabled
    pub fn sink_backpressure(&self) -> Option<Duration> {
        (self.sink_backpressure_ms > 0).then(|| Duration::from_millis(self.sink_backpressure_ms))
    }

    pub fn finalize_timeout(&self) -> Duration {
        Duration::from_millis(self.finalize_timeout_ms)
    }

    /// At least one disconnect always faults
    pub fn disconnect_limit(&self) -> u32 {
        self.disconnect_retry_limit.max(1)
    }
}

/// Adapter selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdapterConfig {
    pub kind: AdapterKind,

    /// Vendor channel identifier (defaults per adapter kind)
    #[serde(default)]
    pub channel: Option<String>,

    #[serde(default)]
    pub bitrate: Bitrate,
}

impl AdapterConfig {
    pub fn new(kind: AdapterKind) -> Self {
        Self {
            kind,
            channel: None,
            bitrate: Bitrate::default(),
        }
    }

    /// Builder method: set the channel
    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = Some(channel.into());
        self
    }

    /// Builder method: set the bitrate
    pub fn with_bitrate(mut self, bitrate: Bitrate) -> Self {
        self.bitrate = bitrate;
        self
    }

    /// Configured channel, or the adapter kind's default
    pub fn channel_or_default(&self) -> String {
        self.channel
            .clone()
            .unwrap_or_else(|| self.kind.default_channel().to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_session_config_builder() {
        let config = SessionConfig::new()
            .with_poll_timeout(Duration::from_millis(20))
            .with_disconnect_retry_limit(5)
            .with_sink_backpressure(Duration::ZERO)
            .with_generator("bench");

        assert_eq!(config.poll_timeout(), Duration::from_millis(20));
        assert_eq!(config.disconnect_limit(), 5);
        assert_eq!(config.sink_backpressure(), None);
        assert_eq!(config.generator, "bench");
    }

    #[test]
    fn test_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.poll_timeout_ms, 100);
        assert_eq!(config.disconnect_retry_limit, 3);
        assert_eq!(config.sink_backpressure(), Some(Duration::from_millis(500)));
        assert_eq!(config.finalize_timeout(), Duration::from_secs(5));
    }

    #[test]
    fn test_adapter_channel_defaults() {
        assert_eq!(
            AdapterConfig::new(AdapterKind::Pcan).channel_or_default(),
            AdapterKind::Pcan.default_channel()
        );
        assert_eq!(
            AdapterConfig::new(AdapterKind::Virtual)
                .with_channel("vcan3")
                .channel_or_default(),
            "vcan3"
        );
    }
}
