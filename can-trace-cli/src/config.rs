//! Configuration loading and parsing

use anyhow::{Context, Result};
use can_trace_core::adapter::AdapterKind;
use can_trace_core::{AdapterConfig, SessionConfig};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Main application configuration (loaded from config.toml)
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    #[serde(default = "default_adapter")]
    pub adapter: AdapterConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub output: OutputConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

fn default_adapter() -> AdapterConfig {
    AdapterConfig::new(AdapterKind::Virtual)
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            adapter: default_adapter(),
            session: SessionConfig::default(),
            output: OutputConfig::default(),
            simulation: SimulationConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OutputConfig {
    #[serde(default = "default_trace_path")]
    pub path: PathBuf,
    #[serde(default)]
    pub summary: SummaryFormat,
}

fn default_trace_path() -> PathBuf {
    PathBuf::from("capture.trc")
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            path: default_trace_path(),
            summary: SummaryFormat::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SummaryFormat {
    #[default]
    Text,
    Json,
}

/// Synthetic traffic for the virtual adapter
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct SimulationConfig {
    #[serde(default)]
    pub messages: Vec<SimulatedMessage>,
}

impl SimulationConfig {
    /// Configured messages, or a small default set when none are configured
    pub fn messages_or_default(&self) -> Vec<SimulatedMessage> {
        if !self.messages.is_empty() {
            return self.messages.clone();
        }
        vec![
            SimulatedMessage::new(0x100, 10, vec![0x00, 0x00, 0x00, 0x00]),
            SimulatedMessage::new(0x200, 20, vec![0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08])
                .with_counter(0),
            SimulatedMessage::new(0x18DA_F110, 100, vec![0x02, 0x3E, 0x00]).extended(),
        ]
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SimulatedMessage {
    pub id: u32,
    #[serde(default)]
    pub extended: bool,
    pub period_ms: u64,
    #[serde(default)]
    pub data: Vec<u8>,
    /// Byte index incremented on every transmission
    #[serde(default)]
    pub counter_byte: Option<usize>,
}

impl SimulatedMessage {
    pub fn new(id: u32, period_ms: u64, data: Vec<u8>) -> Self {
        Self {
            id,
            extended: false,
            period_ms,
            data,
            counter_byte: None,
        }
    }

    pub fn extended(mut self) -> Self {
        self.extended = true;
        self
    }

    pub fn with_counter(mut self, index: usize) -> Self {
        self.counter_byte = Some(index);
        self
    }
}

/// Load configuration from a TOML file
pub fn load_config(path: &Path) -> Result<AppConfig> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {:?}", path))?;

    let config: AppConfig = toml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {:?}", path))?;

    for message in &config.simulation.messages {
        anyhow::ensure!(
            message.data.len() <= 8,
            "Simulated message 0x{:X} has {} data bytes (max 8)",
            message.id,
            message.data.len()
        );
        anyhow::ensure!(
            message.period_ms > 0,
            "Simulated message 0x{:X} needs a non-zero period",
            message.id
        );
    }

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use can_trace_core::Bitrate;

    #[test]
    fn test_config_deserialization() {
        let toml_content = r#"
            [adapter]
            kind = "pcan"
            bitrate = "250k"

            [session]
            poll_timeout_ms = 50

            [output]
            path = "bench.trc"
            summary = "json"

            [[simulation.messages]]
            id = 0x123
            period_ms = 10
            data = [1, 2, 3]
            counter_byte = 2
        "#;

        let config: AppConfig = toml::from_str(toml_content).unwrap();
        assert_eq!(config.adapter.kind, AdapterKind::Pcan);
        assert_eq!(config.adapter.bitrate, Bitrate::Kbps250);
        assert_eq!(
            config.adapter.channel_or_default(),
            AdapterKind::Pcan.default_channel()
        );
        assert_eq!(config.session.poll_timeout_ms, 50);
        assert_eq!(config.session.disconnect_retry_limit, 3);
        assert_eq!(config.output.summary, SummaryFormat::Json);
        assert_eq!(config.simulation.messages[0].counter_byte, Some(2));
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.adapter.kind, AdapterKind::Virtual);
        assert_eq!(config.output.path, PathBuf::from("capture.trc"));
        assert_eq!(config.simulation.messages_or_default().len(), 3);
    }

    #[test]
    fn test_load_rejects_oversized_payload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        fs::write(
            &path,
            "[[simulation.messages]]\nid = 1\nperiod_ms = 5\ndata = [0,0,0,0,0,0,0,0,0]\n",
        )
        .unwrap();

        let err = load_config(&path).unwrap_err();
        assert!(err.to_string().contains("max 8"));
    }
}
