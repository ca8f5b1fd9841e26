//! Serial transport over an RS-485 adapter.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_serial::SerialStream;
use tracing::{debug, info};

use crate::error::{LinkError, Result};
use crate::transport::{ConnectionState, Transport, TransportStats};

/// Serial line settings. Defaults match the bus contract: 19 200 8N1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SerialSettings {
    #[serde(default = "default_device")]
    pub device: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    #[serde(default = "default_data_bits")]
    pub data_bits: u8,
    #[serde(default = "default_stop_bits")]
    pub stop_bits: u8,
    #[serde(default = "default_parity")]
    pub parity: String,
}

fn default_device() -> String {
    "/dev/ttyUSB0".to_string()
}
fn default_baud_rate() -> u32 {
    19_200
}
fn default_data_bits() -> u8 {
    8
}
fn default_stop_bits() -> u8 {
    1
}
fn default_parity() -> String {
    "none".to_string()
}

impl Default for SerialSettings {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud_rate: default_baud_rate(),
            data_bits: default_data_bits(),
            stop_bits: default_stop_bits(),
            parity: default_parity(),
        }
    }
}

impl SerialSettings {
    fn data_bits(&self) -> tokio_serial::DataBits {
        match self.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        }
    }

    fn stop_bits(&self) -> tokio_serial::StopBits {
        match self.stop_bits {
            2 => tokio_serial::StopBits::Two,
            _ => tokio_serial::StopBits::One,
        }
    }

    fn parity(&self) -> tokio_serial::Parity {
        match self.parity.as_str() {
            "even" => tokio_serial::Parity::Even,
            "odd" => tokio_serial::Parity::Odd,
            _ => tokio_serial::Parity::None,
        }
    }
}

/// RS-485 byte stream backed by `tokio-serial`.
pub struct SerialTransport {
    settings: SerialSettings,
    stream: Option<SerialStream>,
    stats: TransportStats,
}

impl std::fmt::Debug for SerialTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialTransport")
            .field("settings", &self.settings)
            .field("open", &self.stream.is_some())
            .finish()
    }
}

impl SerialTransport {
    pub fn new(settings: SerialSettings) -> Self {
        Self {
            settings,
            stream: None,
            stats: TransportStats::default(),
        }
    }
}

#[async_trait]
impl Transport for SerialTransport {
    fn name(&self) -> &str {
        &self.settings.device
    }

    async fn connect(&mut self) -> Result<()> {
        let builder = tokio_serial::new(&self.settings.device, self.settings.baud_rate)
            .data_bits(self.settings.data_bits())
            .stop_bits(self.settings.stop_bits())
            .parity(self.settings.parity());

        let stream = SerialStream::open(&builder).map_err(|e| {
            LinkError::Transport(format!(
                "failed to open serial port {}: {}",
                self.settings.device, e
            ))
        })?;

        info!(
            "Serial port {} open at {} baud",
            self.settings.device, self.settings.baud_rate
        );
        self.stream = Some(stream);
        self.stats.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        if self.stream.take().is_some() {
            debug!("Serial port {} closed", self.settings.device);
        }
        self.stats.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LinkError::Transport("serial port not open".to_string()))?;

        stream
            .write_all(data)
            .await
            .map_err(|e| LinkError::Transport(format!("serial write failed: {}", e)))?;
        self.stats.record_sent(data.len());
        Ok(data.len())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        let device = self.settings.device.clone();
        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| LinkError::Transport("serial port not open".to_string()))?;

        let n = match timeout {
            Some(dur) => tokio::time::timeout(dur, stream.read(buf))
                .await
                .map_err(|_| LinkError::Timeout(format!("{}: no data within {:?}", device, dur)))?,
            None => stream.read(buf).await,
        }
        .map_err(|e| LinkError::Transport(format!("serial read failed: {}", e)))?;

        self.stats.record_received(n);
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn settings_defaults_are_19200_8n1() {
        let settings: SerialSettings = serde_yaml::from_str("device: /dev/ttyS1").unwrap();
        assert_eq!(settings.device, "/dev/ttyS1");
        assert_eq!(settings.baud_rate, 19_200);
        assert_eq!(settings.data_bits, 8);
        assert_eq!(settings.stop_bits, 1);
        assert_eq!(settings.parity, "none");
    }

    #[test]
    fn parity_mapping() {
        let mut settings = SerialSettings::default();
        settings.parity = "even".to_string();
        assert_eq!(settings.parity(), tokio_serial::Parity::Even);
        settings.parity = "bogus".to_string();
        assert_eq!(settings.parity(), tokio_serial::Parity::None);
    }
}
