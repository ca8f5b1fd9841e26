//! Acquisition service error type.

use thiserror::Error;

/// Errors raised by the acquisition unit.
#[derive(Error, Debug)]
pub enum AcqSrvError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Fatal hardware initialization failure; the node halts
    #[error("Hardware init failed: {0}")]
    Hardware(String),

    /// Bus link failure
    #[error("Link error: {0}")]
    Link(#[from] field_modbus::LinkError),

    /// Unexpected internal condition
    #[error("Internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, AcqSrvError>;
