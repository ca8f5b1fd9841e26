//! Gateway service error type.

use field_modbus::{ExceptionCode, LinkError};
use thiserror::Error;

/// Errors raised by the gateway.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum GwSrvError {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// The slave did not answer within the deadline
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The slave answered with a Modbus exception
    #[error("Protocol exception: {0:?}")]
    ProtocolException(ExceptionCode),

    /// A bounded queue refused the item
    #[error("Queue full: {0}")]
    QueueFull(String),

    /// Caller passed parameters outside the contract
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// Requested slave or sensor is not known
    #[error("Not found: {0}")]
    NotFound(String),

    /// Link-layer failure other than timeout/exception
    #[error("Link error: {0}")]
    Link(LinkError),

    /// Unexpected internal condition
    #[error("Internal error: {0}")]
    Internal(String),
}

impl From<LinkError> for GwSrvError {
    fn from(err: LinkError) -> Self {
        match err {
            LinkError::Timeout(msg) => GwSrvError::Timeout(msg),
            LinkError::Exception(code) => GwSrvError::ProtocolException(code),
            other => GwSrvError::Link(other),
        }
    }
}

impl GwSrvError {
    /// Whether this failure counts toward the slave's eviction threshold.
    /// Timeouts and protocol exceptions do; local conditions do not.
    pub fn is_slave_fault(&self) -> bool {
        matches!(
            self,
            GwSrvError::Timeout(_) | GwSrvError::ProtocolException(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, GwSrvError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_timeout_becomes_timeout() {
        let err: GwSrvError = LinkError::Timeout("no reply".to_string()).into();
        assert!(matches!(err, GwSrvError::Timeout(_)));
        assert!(err.is_slave_fault());
    }

    #[test]
    fn exception_counts_as_slave_fault() {
        let err: GwSrvError = LinkError::Exception(ExceptionCode::ServerDeviceBusy).into();
        assert!(err.is_slave_fault());
    }

    #[test]
    fn queue_full_is_local() {
        assert!(!GwSrvError::QueueFull("uplink".to_string()).is_slave_fault());
    }
}
