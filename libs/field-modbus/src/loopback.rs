//! In-memory multidrop bus for tests and the loopback bench.
//!
//! Models RS-485 semantics: everything the master sends is seen by every tap,
//! and every tap's reply lands on the master's receive queue. Each endpoint
//! owns its transport, so no locking is needed on the data path beyond the
//! channel internals.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;

use crate::error::{LinkError, Result};
use crate::transport::{ConnectionState, Transport, TransportStats};

type Chunk = Vec<u8>;

/// Builder for an in-memory bus: one master, any number of taps.
pub struct LoopbackBus {
    to_master_tx: mpsc::UnboundedSender<Chunk>,
    master_rx: Option<mpsc::UnboundedReceiver<Chunk>>,
    taps: Arc<Mutex<Vec<mpsc::UnboundedSender<Chunk>>>>,
}

impl LoopbackBus {
    pub fn new() -> Self {
        let (to_master_tx, master_rx) = mpsc::unbounded_channel();
        Self {
            to_master_tx,
            master_rx: Some(master_rx),
            taps: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Take the master endpoint. Panics if taken twice.
    pub fn master(&mut self) -> LoopbackTransport {
        let rx = self
            .master_rx
            .take()
            .expect("loopback master endpoint already taken");
        LoopbackTransport {
            name: "loopback-master".to_string(),
            rx,
            out: Outbound::Broadcast(self.taps.clone()),
            pending: Vec::new(),
            connected: false,
            stats: TransportStats::default(),
        }
    }

    /// Attach a new tap (one per acquisition unit).
    pub fn tap(&self, name: &str) -> LoopbackTransport {
        let (tx, rx) = mpsc::unbounded_channel();
        self.taps.lock().unwrap().push(tx);
        LoopbackTransport {
            name: format!("loopback-{}", name),
            rx,
            out: Outbound::ToMaster(self.to_master_tx.clone()),
            pending: Vec::new(),
            connected: false,
            stats: TransportStats::default(),
        }
    }
}

impl Default for LoopbackBus {
    fn default() -> Self {
        Self::new()
    }
}

enum Outbound {
    /// Master side: every send reaches all taps
    Broadcast(Arc<Mutex<Vec<mpsc::UnboundedSender<Chunk>>>>),
    /// Tap side: sends go to the master only
    ToMaster(mpsc::UnboundedSender<Chunk>),
}

impl std::fmt::Debug for Outbound {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outbound::Broadcast(_) => write!(f, "Broadcast"),
            Outbound::ToMaster(_) => write!(f, "ToMaster"),
        }
    }
}

/// One endpoint of the in-memory bus.
#[derive(Debug)]
pub struct LoopbackTransport {
    name: String,
    rx: mpsc::UnboundedReceiver<Chunk>,
    out: Outbound,
    /// Remainder of a chunk that did not fit the caller's buffer
    pending: Vec<u8>,
    connected: bool,
    stats: TransportStats,
}

impl LoopbackTransport {
    fn drain_pending(&mut self, buf: &mut [u8]) -> usize {
        let n = self.pending.len().min(buf.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        n
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn connect(&mut self) -> Result<()> {
        self.connected = true;
        self.stats.set_state(ConnectionState::Connected);
        Ok(())
    }

    async fn disconnect(&mut self) -> Result<()> {
        self.connected = false;
        self.stats.set_state(ConnectionState::Disconnected);
        Ok(())
    }

    async fn send(&mut self, data: &[u8]) -> Result<usize> {
        if !self.connected {
            return Err(LinkError::Transport(format!(
                "{} not connected",
                self.name
            )));
        }

        match &self.out {
            Outbound::Broadcast(taps) => {
                let taps = taps.lock().unwrap();
                for tap in taps.iter() {
                    // A dropped tap is a powered-off unit; the bus keeps working.
                    let _ = tap.send(data.to_vec());
                }
            }
            Outbound::ToMaster(tx) => {
                tx.send(data.to_vec())
                    .map_err(|_| LinkError::Transport("master endpoint gone".to_string()))?;
            }
        }

        self.stats.record_sent(data.len());
        Ok(data.len())
    }

    async fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize> {
        if !self.pending.is_empty() {
            let n = self.drain_pending(buf);
            self.stats.record_received(n);
            return Ok(n);
        }

        let chunk = match timeout {
            Some(dur) => match tokio::time::timeout(dur, self.rx.recv()).await {
                Ok(chunk) => chunk,
                Err(_) => {
                    return Err(LinkError::Timeout(format!(
                        "{}: no data within {:?}",
                        self.name, dur
                    )))
                }
            },
            None => self.rx.recv().await,
        };

        let chunk =
            chunk.ok_or_else(|| LinkError::Transport("bus peers disconnected".to_string()))?;
        self.pending = chunk;
        let n = self.drain_pending(buf);
        self.stats.record_received(n);
        Ok(n)
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn stats(&self) -> &TransportStats {
        &self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn master_broadcast_reaches_all_taps() {
        let mut bus = LoopbackBus::new();
        let mut tap_a = bus.tap("a");
        let mut tap_b = bus.tap("b");
        let mut master = bus.master();

        master.connect().await.unwrap();
        tap_a.connect().await.unwrap();
        tap_b.connect().await.unwrap();

        master.send(&[1, 2, 3]).await.unwrap();

        let mut buf = [0u8; 8];
        let n = tap_a
            .receive(&mut buf, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
        let n = tap_b
            .receive(&mut buf, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[1, 2, 3]);
    }

    #[tokio::test]
    async fn tap_reply_reaches_master_only() {
        let mut bus = LoopbackBus::new();
        let mut tap = bus.tap("a");
        let mut master = bus.master();
        master.connect().await.unwrap();
        tap.connect().await.unwrap();

        tap.send(&[9, 9]).await.unwrap();

        let mut buf = [0u8; 8];
        let n = master
            .receive(&mut buf, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[9, 9]);
    }

    #[tokio::test]
    async fn receive_times_out_on_silent_bus() {
        let mut bus = LoopbackBus::new();
        let _tap = bus.tap("a");
        let mut master = bus.master();
        master.connect().await.unwrap();

        let mut buf = [0u8; 8];
        let err = master
            .receive(&mut buf, Some(Duration::from_millis(20)))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Timeout(_)));
    }

    #[tokio::test]
    async fn small_buffer_preserves_remainder() {
        let mut bus = LoopbackBus::new();
        let mut tap = bus.tap("a");
        let mut master = bus.master();
        master.connect().await.unwrap();
        tap.connect().await.unwrap();

        tap.send(&[1, 2, 3, 4, 5]).await.unwrap();

        let mut buf = [0u8; 2];
        let n = master
            .receive(&mut buf, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[1, 2]);
        let n = master
            .receive(&mut buf, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[3, 4]);
        let n = master
            .receive(&mut buf, Some(Duration::from_millis(100)))
            .await
            .unwrap();
        assert_eq!(&buf[..n], &[5]);
    }
}
