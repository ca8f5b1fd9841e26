//! Radio uplink consumer.
//!
//! The LoRaWAN stack itself is a collaborator behind [`RadioDriver`]; the
//! core only guarantees the duty-cycle discipline: one transmission at a
//! time, each gated on the completion signal of the previous one.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::error::{GwSrvError, Result};

/// LoRa radio contract. `start_send` initiates a transmission; the driver
/// adds one permit to the completion semaphore when the air time is over
/// (EV_TXCOMPLETE).
pub trait RadioDriver: Send + Sync {
    fn is_busy(&self) -> bool;
    fn start_send(&self, port: u8, payload: Bytes, confirmed: bool) -> Result<()>;
}

/// Blocking consumer of the uplink queue.
pub struct RadioUplink {
    driver: Arc<dyn RadioDriver>,
    tx_complete: Arc<Semaphore>,
    uplink_rx: mpsc::Receiver<Bytes>,
    port: u8,
}

impl RadioUplink {
    pub fn new(
        driver: Arc<dyn RadioDriver>,
        tx_complete: Arc<Semaphore>,
        uplink_rx: mpsc::Receiver<Bytes>,
        port: u8,
    ) -> Self {
        Self {
            driver,
            tx_complete,
            uplink_rx,
            port,
        }
    }

    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        loop {
            let frame = tokio::select! {
                frame = self.uplink_rx.recv() => match frame {
                    Some(frame) => frame,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            // The previous transmission must have completed before the next
            // one starts.
            let permit = tokio::select! {
                permit = self.tx_complete.acquire() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                _ = shutdown.changed() => break,
            };
            permit.forget();

            while self.driver.is_busy() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }

            debug!("transmitting {} byte frame on port {}", frame.len(), self.port);
            if let Err(e) = self.driver.start_send(self.port, frame, false) {
                warn!("radio send failed: {}", e);
                // No completion will arrive for a failed send; restore the
                // permit so the queue does not wedge.
                self.tx_complete.add_permits(1);
            }
        }
        debug!("radio uplink stopped");
    }
}

/// In-process radio stand-in: logs frames and signals completion after a
/// simulated air time.
pub struct MockRadio {
    tx_complete: Arc<Semaphore>,
    busy: AtomicBool,
    air_time: Duration,
    sent: Mutex<Vec<Bytes>>,
}

impl MockRadio {
    /// Returns the driver plus the completion semaphore to hand to
    /// [`RadioUplink`]. One permit is available up front: the bus starts
    /// idle.
    pub fn new(air_time: Duration) -> (Arc<Self>, Arc<Semaphore>) {
        let tx_complete = Arc::new(Semaphore::new(1));
        let radio = Arc::new(Self {
            tx_complete: tx_complete.clone(),
            busy: AtomicBool::new(false),
            air_time,
            sent: Mutex::new(Vec::new()),
        });
        (radio, tx_complete)
    }

    pub fn sent_frames(&self) -> Vec<Bytes> {
        self.sent.lock().clone()
    }
}

impl RadioDriver for Arc<MockRadio> {
    fn is_busy(&self) -> bool {
        self.busy.load(Ordering::SeqCst)
    }

    fn start_send(&self, port: u8, payload: Bytes, _confirmed: bool) -> Result<()> {
        if self.is_busy() {
            return Err(GwSrvError::Internal("radio busy".to_string()));
        }
        info!(
            "uplink on port {}: {} bytes [{}]",
            port,
            payload.len(),
            hex::encode(&payload)
        );
        self.sent.lock().push(payload);
        self.busy.store(true, Ordering::SeqCst);

        let radio = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(radio.air_time).await;
            radio.busy.store(false, Ordering::SeqCst);
            radio.tx_complete.add_permits(1);
            debug!("EV_TXCOMPLETE");
        });
        Ok(())
    }
}
