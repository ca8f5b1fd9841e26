//! Acquisition unit firmware service.
//!
//! Samples analog channels at high rate, maintains per-channel RMS with
//! adaptive smoothing, and publishes the results as Modbus holding registers
//! alongside a self-description block used for discovery.

pub mod config;
pub mod error;
pub mod history;
pub mod node;
pub mod publisher;
pub mod rms;
pub mod sampling;
pub mod server;

pub use config::{AcqConfig, WINDOW_START};
pub use error::{AcqSrvError, Result};
pub use node::run_node;
