//! Bootstrap discovery.
//!
//! One pass over the configured candidate ids: read the eight-register
//! self-description block at address 0, parse it, and populate the registry.
//! Non-responding candidates are skipped; scheduled traffic and the failure
//! governor take over from there.

use std::sync::Arc;
use std::time::Duration;

use field_modbus::{SensorDescriptor, DESCRIPTOR_REGISTERS};
use tracing::{info, warn};

use crate::client::ModbusClient;
use crate::error::Result;
use crate::registry::Registry;

pub struct Discovery {
    client: Arc<ModbusClient>,
    registry: Arc<Registry>,
    timeout: Duration,
}

impl Discovery {
    pub fn new(client: Arc<ModbusClient>, registry: Arc<Registry>, timeout: Duration) -> Self {
        Self {
            client,
            registry,
            timeout,
        }
    }

    /// Probe one slave and upsert its sensor on success.
    pub async fn probe(&self, slave_id: u8) -> Result<SensorDescriptor> {
        let payload = self
            .client
            .read_registers(slave_id, 3, 0, DESCRIPTOR_REGISTERS, self.timeout)
            .await?;
        let descriptor = SensorDescriptor::from_reply_bytes(&payload)
            .map_err(crate::error::GwSrvError::from)?;

        info!(
            "discovered slave {}: sensor {} with {} channels, window {}+{}",
            slave_id,
            descriptor.sensor_id,
            descriptor.channels,
            descriptor.start_address,
            descriptor.max_registers
        );
        self.registry.upsert_sensor(slave_id, descriptor);
        Ok(descriptor)
    }

    /// One-shot pass over all candidates. Returns how many responded.
    pub async fn run_once(&self, candidates: &[u8]) -> usize {
        let mut found = 0;
        for &slave_id in candidates {
            match self.probe(slave_id).await {
                Ok(_) => found += 1,
                Err(e) => {
                    warn!("candidate {} not discovered: {}", slave_id, e);
                }
            }
        }
        info!(
            "discovery pass complete: {}/{} candidates responded",
            found,
            candidates.len()
        );
        found
    }
}
