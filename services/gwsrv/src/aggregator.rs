//! Time-windowed payload aggregation.
//!
//! Every window tick the pending payload queue is drained without blocking;
//! a non-empty batch becomes one unified frame on the uplink queue plus a
//! summary record for the display. Queue overflow drops the item, never
//! stalls the pipeline.

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, Duration, MissedTickBehavior};
use tracing::{debug, warn};

use crate::formatter::NormalizedPayload;
use crate::frame::build_frame;

/// What the display shows per uplink.
#[derive(Debug, Clone, Copy)]
pub struct UplinkSummary {
    pub id_msg: u8,
    pub timestamp: u32,
    pub sensor_count: usize,
    pub frame_len: usize,
}

/// Collects payloads and emits one frame per aggregation window.
pub struct Aggregator {
    payload_rx: mpsc::Receiver<NormalizedPayload>,
    uplink_tx: mpsc::Sender<Bytes>,
    display_tx: mpsc::Sender<UplinkSummary>,
    window: Duration,
    id_msg: u8,
}

impl Aggregator {
    pub fn new(
        payload_rx: mpsc::Receiver<NormalizedPayload>,
        uplink_tx: mpsc::Sender<Bytes>,
        display_tx: mpsc::Sender<UplinkSummary>,
        window_ms: u64,
    ) -> Self {
        Self {
            payload_rx,
            uplink_tx,
            display_tx,
            window: Duration::from_millis(window_ms),
            id_msg: 0,
        }
    }

    /// Drain whatever has arrived since the last tick.
    fn drain(&mut self) -> Vec<NormalizedPayload> {
        let mut batch = Vec::new();
        while let Ok(payload) = self.payload_rx.try_recv() {
            batch.push(payload);
        }
        batch
    }

    /// Build and enqueue one frame; advances `id_msg`.
    fn emit(&mut self, batch: &[NormalizedPayload], timestamp: u32) {
        let frame = build_frame(self.id_msg, timestamp, batch);
        let summary = UplinkSummary {
            id_msg: self.id_msg,
            timestamp,
            sensor_count: batch.len(),
            frame_len: frame.len(),
        };

        if self.uplink_tx.try_send(frame).is_err() {
            warn!("uplink queue full, frame {} dropped", self.id_msg);
        }
        // The display is best-effort; a full queue just skips the update.
        let _ = self.display_tx.try_send(summary);

        self.id_msg = self.id_msg.wrapping_add(1);
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = interval(self.window);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let batch = self.drain();
                    if batch.is_empty() {
                        continue;
                    }
                    let timestamp = chrono::Utc::now().timestamp() as u32;
                    debug!(
                        "window closed with {} payloads, emitting frame {}",
                        batch.len(),
                        self.id_msg
                    );
                    self.emit(&batch, timestamp);
                }
                _ = shutdown.changed() => break,
            }
        }
        debug!("aggregator stopped");
    }
}
