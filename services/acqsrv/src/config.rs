//! Acquisition unit configuration.
//!
//! One YAML file per unit. The self-description block served at address 0 is
//! assembled from this config at startup; window geometry is derived from the
//! channel list so the two can never disagree.

use std::path::Path;

use field_modbus::serial::SerialSettings;
use field_modbus::{DataType, SensorDescriptor};
use serde::{Deserialize, Serialize};

use crate::error::{AcqSrvError, Result};

/// First register of the RMS publication window.
pub const WINDOW_START: u16 = 10;

/// Per-channel analog front-end settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Analog gain between the transducer and the ADC
    #[serde(default = "default_gain")]
    pub gain: f32,
    /// Calibration scalar applied when the RMS value is written to a register
    #[serde(default = "default_conversion_factor")]
    pub conversion_factor: f32,
}

fn default_gain() -> f32 {
    1.0
}
fn default_conversion_factor() -> f32 {
    1.0
}

/// Identity half of the self-description block; geometry comes from the
/// channel list.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SensorIdentity {
    pub sensor_id: u8,
    #[serde(default = "default_sampling_interval_ms")]
    pub sampling_interval_ms: u16,
    #[serde(default = "default_data_type")]
    pub data_type: u8,
    #[serde(default)]
    pub scale: u8,
    #[serde(default)]
    pub packed_bits: u8,
}

fn default_sampling_interval_ms() -> u16 {
    1000
}
fn default_data_type() -> u8 {
    2
}

/// Top-level acquisition unit configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcqConfig {
    /// Modbus unit address on the multidrop bus
    pub unit_id: u8,
    #[serde(default)]
    pub serial: SerialSettings,
    pub sensor: SensorIdentity,
    pub channels: Vec<ChannelConfig>,
    /// Samples retained per channel for the RMS window (N)
    #[serde(default = "default_ring_capacity")]
    pub ring_capacity: usize,
    /// Published RMS values retained per channel (M)
    #[serde(default = "default_history_depth")]
    pub history_depth: usize,
    /// Register count of the publication window (W); must divide evenly by
    /// the channel count
    pub window_registers: u16,
    #[serde(default = "default_process_period_ms")]
    pub process_period_ms: u64,
    #[serde(default = "default_publish_period_ms")]
    pub publish_period_ms: u64,
    /// ADC sweep rate over all channels
    #[serde(default = "default_sample_rate_sps")]
    pub sample_rate_sps: u32,
    /// ADC full-scale quantum (e.g. 3.3 / 4095 for 12-bit single-ended)
    #[serde(default = "default_volts_per_bit")]
    pub volts_per_bit: f32,
}

fn default_ring_capacity() -> usize {
    256
}
fn default_history_depth() -> usize {
    16
}
fn default_process_period_ms() -> u64 {
    1000
}
fn default_publish_period_ms() -> u64 {
    300
}
fn default_sample_rate_sps() -> u32 {
    4000
}
fn default_volts_per_bit() -> f32 {
    3.3 / 4095.0
}

impl AcqConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| AcqSrvError::Config(format!("cannot read {}: {}", path.display(), e)))?;
        let config: AcqConfig = serde_yaml::from_str(&text)
            .map_err(|e| AcqSrvError::Config(format!("cannot parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.channels.is_empty() {
            return Err(AcqSrvError::Config("no channels configured".to_string()));
        }
        if self.channels.len() > 8 {
            return Err(AcqSrvError::Config(format!(
                "at most 8 channels supported, got {}",
                self.channels.len()
            )));
        }
        if self.window_registers == 0
            || self.window_registers as usize % self.channels.len() != 0
        {
            return Err(AcqSrvError::Config(format!(
                "window_registers ({}) must be a non-zero multiple of the channel count ({})",
                self.window_registers,
                self.channels.len()
            )));
        }
        if self.ring_capacity == 0 || self.history_depth == 0 {
            return Err(AcqSrvError::Config(
                "ring_capacity and history_depth must be non-zero".to_string(),
            ));
        }
        DataType::try_from(self.sensor.data_type)
            .map_err(|e| AcqSrvError::Config(e.to_string()))?;
        Ok(())
    }

    /// Channel count as published in the descriptor.
    pub fn channel_count(&self) -> u8 {
        self.channels.len() as u8
    }

    /// Register slots per channel in the publication window.
    pub fn slots_per_channel(&self) -> usize {
        self.window_registers as usize / self.channels.len()
    }

    /// Assemble the descriptor served at address 0.
    pub fn descriptor(&self) -> SensorDescriptor {
        SensorDescriptor {
            sensor_id: self.sensor.sensor_id,
            channels: self.channel_count(),
            start_address: WINDOW_START,
            max_registers: self.window_registers,
            sampling_interval_ms: self.sensor.sampling_interval_ms,
            // validate() guarantees the code is known
            data_type: DataType::try_from(self.sensor.data_type)
                .unwrap_or(DataType::Uint16),
            scale: self.sensor.scale,
            packed_bits: self.sensor.packed_bits,
        }
    }
}
