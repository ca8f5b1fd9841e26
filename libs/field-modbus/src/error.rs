//! Link-layer error type.

use thiserror::Error;

use crate::pdu::ExceptionCode;

/// Errors produced by the RTU link layer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Malformed or incomplete frame
    #[error("Frame error: {0}")]
    Frame(String),

    /// CRC trailer did not match the frame contents
    #[error("CRC mismatch: expected 0x{expected:04X}, got 0x{actual:04X}")]
    Crc { expected: u16, actual: u16 },

    /// PDU-level protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The peer answered with a Modbus exception
    #[error("Modbus exception: {0:?}")]
    Exception(ExceptionCode),

    /// Transport-level failure (serial, loopback)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Receive deadline elapsed
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Invalid configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, LinkError>;
