//! Sample acquisition.
//!
//! The ADC sweep runs in interrupt-like context: the conversion-complete
//! callback does a single bounded push into a sync channel and nothing else.
//! An ingestion thread drains that channel into the per-channel ring buffers.
//! Hardware ADC drivers live behind [`SampleSource`]; the in-tree
//! implementation synthesizes a deterministic waveform sweep for benches and
//! tests.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::{AcqSrvError, Result};

/// One ADC conversion result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Sample {
    pub channel: u8,
    /// Signed ADC code; differential and near-zero readings go negative
    pub raw: i16,
}

/// Bounded producer handle usable from conversion-complete context.
pub type SampleSender = SyncSender<Sample>;
pub type SampleReceiver = Receiver<Sample>;

/// Depth of the conversion queue between the sweep and the ingestion thread.
pub const SAMPLE_QUEUE_DEPTH: usize = 1024;

/// ADC front-end abstraction.
///
/// `configure` is fatal on hardware failure; after `start` the source visits
/// enabled channels round-robin and pushes one [`Sample`] per conversion.
/// Disabling stops production; re-enabling resumes from an unspecified
/// channel.
pub trait SampleSource: Send {
    fn configure(&mut self, channels: u8, rate_sps: u32, gain: f32) -> Result<()>;
    fn start(&mut self, tx: SampleSender) -> Result<()>;
    fn stop(&mut self);
    fn set_enabled(&self, enabled: bool);
}

/// Polymorphic sensor front-end: the node wiring depends on this, not on a
/// concrete acquisition mode.
pub trait SensorDriver: Send + Sync {
    /// One-time hardware bring-up. Failure is fatal for the node.
    fn begin(&self) -> Result<()>;
    /// Begin conversions and ingestion.
    fn start(&self) -> Result<()>;
    /// Most recent published value for a channel.
    fn latest(&self, channel: u8) -> Option<f32>;
    /// Up to `depth` most recent published values, oldest to newest. The
    /// caller gets a copy.
    fn history(&self, channel: u8, depth: usize) -> Vec<f32>;
}

/// Deterministic synthesized sweep used in place of ADC hardware.
///
/// Each channel produces a sine at a channel-dependent amplitude so RMS
/// results are predictable in tests.
pub struct SimSweepSource {
    channels: u8,
    rate_sps: u32,
    enabled: Arc<AtomicBool>,
    run: Arc<AtomicBool>,
    handle: Option<thread::JoinHandle<()>>,
}

impl SimSweepSource {
    pub fn new() -> Self {
        Self {
            channels: 0,
            rate_sps: 0,
            enabled: Arc::new(AtomicBool::new(true)),
            run: Arc::new(AtomicBool::new(false)),
            handle: None,
        }
    }

    fn amplitude(channel: u8) -> f32 {
        400.0 * (channel as f32 + 1.0)
    }
}

impl Default for SimSweepSource {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSource for SimSweepSource {
    fn configure(&mut self, channels: u8, rate_sps: u32, _gain: f32) -> Result<()> {
        if channels == 0 || rate_sps == 0 {
            return Err(AcqSrvError::Hardware(
                "sweep needs at least one channel and a non-zero rate".to_string(),
            ));
        }
        self.channels = channels;
        self.rate_sps = rate_sps;
        Ok(())
    }

    fn start(&mut self, tx: SampleSender) -> Result<()> {
        if self.channels == 0 {
            return Err(AcqSrvError::Hardware("sweep not configured".to_string()));
        }

        self.run.store(true, Ordering::SeqCst);
        let run = self.run.clone();
        let enabled = self.enabled.clone();
        let channels = self.channels;
        let rate = self.rate_sps;

        // One sweep visits every channel once; pace sweeps so the aggregate
        // conversion rate matches rate_sps.
        let sweep_period = Duration::from_secs_f64(channels as f64 / rate as f64);

        let handle = thread::Builder::new()
            .name("adc-sweep".to_string())
            .spawn(move || {
                let mut tick: u64 = 0;
                while run.load(Ordering::SeqCst) {
                    if !enabled.load(Ordering::SeqCst) {
                        thread::sleep(Duration::from_millis(10));
                        continue;
                    }
                    for channel in 0..channels {
                        let phase = tick as f32 * 0.05;
                        let raw = (Self::amplitude(channel) * phase.sin()) as i16;
                        match tx.try_send(Sample { channel, raw }) {
                            Ok(()) => {}
                            // Queue full: this conversion is lost, the RMS
                            // engine tolerates gaps.
                            Err(TrySendError::Full(_)) => {}
                            Err(TrySendError::Disconnected(_)) => return,
                        }
                    }
                    tick += 1;
                    thread::sleep(sweep_period);
                }
            })
            .map_err(|e| AcqSrvError::Internal(format!("cannot spawn sweep thread: {}", e)))?;

        self.handle = Some(handle);
        debug!(
            "simulated sweep started: {} channels at {} sps",
            channels, rate
        );
        Ok(())
    }

    fn stop(&mut self) {
        self.run.store(false, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("sweep thread panicked during shutdown");
            }
        }
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::SeqCst);
    }
}

impl Drop for SimSweepSource {
    fn drop(&mut self) {
        self.stop();
    }
}
