//! Battery level feed.
//!
//! A slow task samples the battery divider through a probe trait, encodes
//! the voltage as one byte (tenths of a volt) and feeds the aggregator as
//! sensor 0.

use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

use crate::error::Result;
use crate::formatter::NormalizedPayload;

/// Activate-byte slot of the battery feed.
pub const BATTERY_SENSOR_ID: u8 = 0;

/// Battery ADC front-end contract.
pub trait BatteryProbe: Send + Sync {
    fn read_voltage(&self) -> Result<f32>;
}

/// Probe returning a fixed voltage; stands in for the divider ADC.
pub struct ConstBatteryProbe(pub f32);

impl BatteryProbe for ConstBatteryProbe {
    fn read_voltage(&self) -> Result<f32> {
        Ok(self.0)
    }
}

/// Encode a voltage as `round(voltage x 10)` saturated to one byte.
pub fn encode_level(voltage: f32) -> u8 {
    ((voltage * 10.0).round() as i64).clamp(0, u8::MAX as i64) as u8
}

/// Periodic battery sampling task.
pub async fn run_battery_task(
    probe: Arc<dyn BatteryProbe>,
    payload_tx: mpsc::Sender<NormalizedPayload>,
    period_ms: u64,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut ticker = interval(Duration::from_millis(period_ms));
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let voltage = match probe.read_voltage() {
                    Ok(voltage) => voltage,
                    Err(e) => {
                        warn!("battery read failed: {}", e);
                        continue;
                    }
                };
                let level = encode_level(voltage);
                debug!("battery {:.2} V -> level {}", voltage, level);

                let payload = NormalizedPayload {
                    slave_id: 0,
                    sensor_id: BATTERY_SENSOR_ID,
                    samples_per_channel: 1,
                    packed: false,
                    bytes: Bytes::copy_from_slice(&[level]),
                };
                if payload_tx.try_send(payload).is_err() {
                    warn!("payload queue full, battery sample dropped");
                }
            }
            _ = shutdown.changed() => break,
        }
    }
    debug!("battery task stopped");
}
