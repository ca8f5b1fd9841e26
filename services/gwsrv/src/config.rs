//! Gateway configuration.

use std::path::Path;

use field_modbus::serial::SerialSettings;
use serde::{Deserialize, Serialize};

use crate::error::{GwSrvError, Result};

/// Top-level gateway configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GwConfig {
    #[serde(default)]
    pub serial: SerialSettings,
    /// Unit addresses probed during the bootstrap discovery pass
    pub candidate_slaves: Vec<u8>,
    /// Per-request reply deadline
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// Deadline for discovery reads
    #[serde(default = "default_discovery_timeout_ms")]
    pub discovery_timeout_ms: u64,
    /// Depth of the client's request queue; also the size of the in-flight
    /// correlation table
    #[serde(default = "default_request_queue_depth")]
    pub request_queue_depth: usize,
    /// Consecutive failures before a slave is evicted
    #[serde(default = "default_eviction_threshold")]
    pub eviction_threshold: u32,
    /// Aggregation window between uplink frames
    #[serde(default = "default_aggregation_window_ms")]
    pub aggregation_window_ms: u64,
    /// Bounded uplink FIFO depth
    #[serde(default = "default_uplink_queue_depth")]
    pub uplink_queue_depth: usize,
    /// Bounded display summary queue depth
    #[serde(default = "default_display_queue_depth")]
    pub display_queue_depth: usize,
    /// Battery sampling period
    #[serde(default = "default_battery_period_ms")]
    pub battery_period_ms: u64,
    /// LoRaWAN application port for uplink frames
    #[serde(default = "default_lora_port")]
    pub lora_port: u8,
}

fn default_request_timeout_ms() -> u64 {
    2000
}
fn default_discovery_timeout_ms() -> u64 {
    2000
}
fn default_request_queue_depth() -> usize {
    16
}
fn default_eviction_threshold() -> u32 {
    3
}
fn default_aggregation_window_ms() -> u64 {
    6100
}
fn default_uplink_queue_depth() -> usize {
    8
}
fn default_display_queue_depth() -> usize {
    4
}
fn default_battery_period_ms() -> u64 {
    60_000
}
fn default_lora_port() -> u8 {
    2
}

impl GwConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| GwSrvError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: GwConfig = serde_yaml::from_str(&text)
            .map_err(|e| GwSrvError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.candidate_slaves.is_empty() {
            return Err(GwSrvError::Config(
                "candidate_slaves must not be empty".to_string(),
            ));
        }
        if self.candidate_slaves.contains(&0) {
            return Err(GwSrvError::Config(
                "slave address 0 is the broadcast address".to_string(),
            ));
        }
        if self.request_queue_depth == 0 || self.uplink_queue_depth == 0 {
            return Err(GwSrvError::Config(
                "queue depths must be non-zero".to_string(),
            ));
        }
        if self.eviction_threshold == 0 {
            return Err(GwSrvError::Config(
                "eviction_threshold must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_fill_in() {
        let config: GwConfig = serde_yaml::from_str("candidate_slaves: [5, 6]").unwrap();
        config.validate().unwrap();
        assert_eq!(config.request_timeout_ms, 2000);
        assert_eq!(config.request_queue_depth, 16);
        assert_eq!(config.eviction_threshold, 3);
        assert_eq!(config.aggregation_window_ms, 6100);
        assert_eq!(config.serial.baud_rate, 19_200);
    }

    #[test]
    fn rejects_broadcast_candidate() {
        let config: GwConfig = serde_yaml::from_str("candidate_slaves: [0, 5]").unwrap();
        assert!(config.validate().is_err());
    }
}
