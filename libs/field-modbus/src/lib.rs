//! Modbus RTU link layer shared by the acquisition units and the gateway.
//!
//! Covers the wire pieces both sides need: CRC-16 framing, the FC3 PDU codec
//! with exception responses, the eight-register sensor self-description
//! block, and a byte-oriented transport abstraction with serial and in-memory
//! loopback implementations.

pub mod codec;
pub mod descriptor;
pub mod error;
pub mod frame;
pub mod loopback;
pub mod pdu;
pub mod serial;
pub mod transport;

pub use descriptor::{DataType, SensorDescriptor, DESCRIPTOR_REGISTERS};
pub use error::{LinkError, Result};
pub use frame::RtuFrame;
pub use pdu::{ExceptionCode, FunctionCode, ReadRequest};
pub use transport::{ConnectionState, Transport, TransportStats};
