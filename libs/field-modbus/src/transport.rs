//! Byte-stream transport abstraction.
//!
//! Both nodes talk RTU over an opaque half-duplex byte stream. The serial
//! implementation drives real hardware; the loopback implementation wires a
//! gateway to in-process acquisition units for tests.

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Connection state of a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConnectionState {
    Disconnected,
    Connected,
    Error,
}

/// Byte counters kept by every transport.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TransportStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub connection_state: Option<ConnectionState>,
}

impl TransportStats {
    pub fn record_sent(&mut self, bytes: usize) {
        self.bytes_sent += bytes as u64;
    }

    pub fn record_received(&mut self, bytes: usize) {
        self.bytes_received += bytes as u64;
    }

    pub fn set_state(&mut self, state: ConnectionState) {
        self.connection_state = Some(state);
    }
}

/// Half-duplex byte stream used by the RTU client and server loops.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Human-readable transport name for logs.
    fn name(&self) -> &str;

    /// Open the underlying stream.
    async fn connect(&mut self) -> Result<()>;

    /// Close the underlying stream.
    async fn disconnect(&mut self) -> Result<()>;

    /// Write a complete frame to the bus.
    async fn send(&mut self, data: &[u8]) -> Result<usize>;

    /// Read whatever bytes are available into `buf`, waiting at most
    /// `timeout` (forever when `None`). Returns the byte count.
    async fn receive(&mut self, buf: &mut [u8], timeout: Option<Duration>) -> Result<usize>;

    fn is_connected(&self) -> bool;

    fn stats(&self) -> &TransportStats;
}
