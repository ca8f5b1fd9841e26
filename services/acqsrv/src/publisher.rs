//! Register window publication.
//!
//! Every publish period the latest history values are scaled by the
//! per-channel calibration factor and written into the Modbus register
//! window in one atomic swap, so the server never serves a half-updated
//! window.

use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::debug;

use crate::sampling::SensorDriver;

/// Scale a published value to a register: round to nearest, saturate to u16.
pub fn scale_to_register(value: f32) -> u16 {
    (value.round() as i64).clamp(0, u16::MAX as i64) as u16
}

/// Periodic task copying history into the publication window.
pub struct RegisterPublisher {
    driver: Arc<dyn SensorDriver>,
    conversion_factors: Vec<f32>,
    window: Arc<Mutex<Vec<u16>>>,
    slots_per_channel: usize,
    period: Duration,
}

impl RegisterPublisher {
    pub fn new(
        driver: Arc<dyn SensorDriver>,
        conversion_factors: Vec<f32>,
        window: Arc<Mutex<Vec<u16>>>,
        slots_per_channel: usize,
        period_ms: u64,
    ) -> Self {
        Self {
            driver,
            conversion_factors,
            window,
            slots_per_channel,
            period: Duration::from_millis(period_ms),
        }
    }

    /// Compute the full window from current history. Slots beyond the
    /// available history stay 0.
    fn stage(&self) -> Vec<u16> {
        let channels = self.conversion_factors.len();
        let mut staged = vec![0u16; channels * self.slots_per_channel];

        for channel in 0..channels {
            let history = self.driver.history(channel as u8, self.slots_per_channel);
            let factor = self.conversion_factors[channel];
            let base = channel * self.slots_per_channel;
            for (i, value) in history.iter().enumerate() {
                staged[base + i] = scale_to_register(value * factor);
            }
        }
        staged
    }

    /// Refresh the window once.
    pub async fn refresh(&self) {
        let staged = self.stage();
        let mut window = self.window.lock().await;
        window.copy_from_slice(&staged);
    }

    /// Periodic refresh until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => self.refresh().await,
                _ = shutdown.changed() => {
                    debug!("register publisher stopping");
                    break;
                }
            }
        }
    }
}
