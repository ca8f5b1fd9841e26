//! Node assembly.
//!
//! All state is owned here and handed to the tasks explicitly; there are no
//! globals. The task split mirrors the acquisition pipeline: ADC sweep ->
//! ingestion thread -> RMS tick -> history -> register publisher -> RTU
//! server.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{sync_channel, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use field_modbus::Transport;
use parking_lot::Mutex as PlMutex;
use tokio::sync::{watch, Mutex};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{error, info, warn};

use crate::config::AcqConfig;
use crate::error::{AcqSrvError, Result};
use crate::history::HistoryBank;
use crate::publisher::RegisterPublisher;
use crate::rms::{ChannelBank, RmsEngine};
use crate::sampling::{SampleSource, SensorDriver, SAMPLE_QUEUE_DEPTH};
use crate::server::AcqServer;

/// RMS acquisition mode behind the [`SensorDriver`] seam.
pub struct RmsSensorDriver {
    bank: Arc<ChannelBank>,
    history: Arc<HistoryBank>,
    source: PlMutex<Box<dyn SampleSource>>,
    channels: u8,
    rate_sps: u32,
    ingest_run: Arc<AtomicBool>,
    ingest_handle: PlMutex<Option<thread::JoinHandle<()>>>,
}

impl RmsSensorDriver {
    pub fn new(
        bank: Arc<ChannelBank>,
        history: Arc<HistoryBank>,
        source: Box<dyn SampleSource>,
        channels: u8,
        rate_sps: u32,
    ) -> Self {
        Self {
            bank,
            history,
            source: PlMutex::new(source),
            channels,
            rate_sps,
            ingest_run: Arc::new(AtomicBool::new(false)),
            ingest_handle: PlMutex::new(None),
        }
    }

    /// Stop the sweep and join the ingestion thread.
    pub fn shutdown(&self) {
        self.ingest_run.store(false, Ordering::SeqCst);
        self.source.lock().stop();
        if let Some(handle) = self.ingest_handle.lock().take() {
            if handle.join().is_err() {
                warn!("ingestion thread panicked during shutdown");
            }
        }
    }
}

impl SensorDriver for RmsSensorDriver {
    fn begin(&self) -> Result<()> {
        self.source
            .lock()
            .configure(self.channels, self.rate_sps, 1.0)
    }

    fn start(&self) -> Result<()> {
        let (tx, rx) = sync_channel(SAMPLE_QUEUE_DEPTH);
        self.source.lock().start(tx)?;

        self.ingest_run.store(true, Ordering::SeqCst);
        let run = self.ingest_run.clone();
        let bank = self.bank.clone();

        let handle = thread::Builder::new()
            .name("sample-ingest".to_string())
            .spawn(move || {
                loop {
                    match rx.recv_timeout(Duration::from_millis(100)) {
                        Ok(sample) => {
                            bank.ingest(sample);
                        }
                        Err(RecvTimeoutError::Timeout) => {
                            if !run.load(Ordering::SeqCst) {
                                break;
                            }
                        }
                        Err(RecvTimeoutError::Disconnected) => break,
                    }
                }
            })
            .map_err(|e| AcqSrvError::Internal(format!("cannot spawn ingest thread: {}", e)))?;

        *self.ingest_handle.lock() = Some(handle);
        Ok(())
    }

    fn latest(&self, channel: u8) -> Option<f32> {
        self.history.last(channel as usize)
    }

    fn history(&self, channel: u8, depth: usize) -> Vec<f32> {
        self.history.recent(channel as usize, depth)
    }
}

/// Build and run an acquisition node over the given transport and sample
/// source until shutdown flips.
pub async fn run_node(
    config: AcqConfig,
    transport: Box<dyn Transport>,
    source: Box<dyn SampleSource>,
    shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let channels = config.channels.len();
    let bank = Arc::new(ChannelBank::new(channels, config.ring_capacity));
    let history = Arc::new(HistoryBank::new(channels, config.history_depth));
    let window = Arc::new(Mutex::new(vec![0u16; config.window_registers as usize]));

    let driver = Arc::new(RmsSensorDriver::new(
        bank.clone(),
        history.clone(),
        source,
        config.channel_count(),
        config.sample_rate_sps,
    ));

    // Hardware init failure is fatal and reported once.
    if let Err(e) = driver.begin() {
        error!("hardware init failed, node halting: {}", e);
        return Err(e);
    }
    driver.start()?;

    let gains = config.channels.iter().map(|c| c.gain).collect::<Vec<_>>();
    let conversion_factors = config
        .channels
        .iter()
        .map(|c| c.conversion_factor)
        .collect::<Vec<_>>();

    let mut engine = RmsEngine::new(bank, gains, config.volts_per_bit);
    let engine_history = history.clone();
    let process_period = Duration::from_millis(config.process_period_ms);
    let mut engine_shutdown = shutdown.clone();
    let rms_task = tokio::spawn(async move {
        let mut ticker = interval(process_period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = ticker.tick() => engine.process_tick(&engine_history),
                _ = engine_shutdown.changed() => break,
            }
        }
    });

    let publisher = RegisterPublisher::new(
        driver.clone(),
        conversion_factors,
        window.clone(),
        config.slots_per_channel(),
        config.publish_period_ms,
    );
    let publisher_task = tokio::spawn(publisher.run(shutdown.clone()));

    let server = AcqServer::new(config.unit_id, config.descriptor(), window, transport);
    let server_task = tokio::spawn(server.run(shutdown));

    info!(
        "acquisition node running: unit {} with {} channels",
        config.unit_id, channels
    );

    let (rms_res, publisher_res, server_res) =
        tokio::join!(rms_task, publisher_task, server_task);
    driver.shutdown();

    for res in [rms_res, publisher_res] {
        if let Err(e) = res {
            return Err(AcqSrvError::Internal(format!("task panicked: {}", e)));
        }
    }
    match server_res {
        Ok(result) => result,
        Err(e) => Err(AcqSrvError::Internal(format!("server task panicked: {}", e))),
    }
}
