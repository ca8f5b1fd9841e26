//! Sensor self-description block.
//!
//! Every acquisition unit publishes an eight-register block at address 0 that
//! the gateway reads once during discovery. The block describes the sensor
//! behind the unit's register window: identity, channel count, window
//! location, sampling interval, and encoding.

use byteorder::{BigEndian, ByteOrder};
use serde::{Deserialize, Serialize};

use crate::error::{LinkError, Result};

/// Register count of the self-description block.
pub const DESCRIPTOR_REGISTERS: u16 = 8;

/// Value encoding of a sensor's register window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum DataType {
    Uint8 = 1,
    Uint16 = 2,
    BitPacked = 3,
    Float16 = 4,
}

impl From<DataType> for u8 {
    fn from(value: DataType) -> u8 {
        value as u8
    }
}

impl TryFrom<u8> for DataType {
    type Error = LinkError;

    fn try_from(value: u8) -> Result<Self> {
        match value {
            1 => Ok(DataType::Uint8),
            2 => Ok(DataType::Uint16),
            3 => Ok(DataType::BitPacked),
            4 => Ok(DataType::Float16),
            _ => Err(LinkError::Protocol(format!(
                "Invalid sensor data type: {}",
                value
            ))),
        }
    }
}

/// Parsed self-description block.
///
/// `sensor_id`, `channels`, `data_type`, `scale` and `packed_bits` are
/// single-byte fields on the wire; only the low byte of their registers is
/// significant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SensorDescriptor {
    /// Logical sensor identity: battery=0, voltage=1, current=2, external >=3
    pub sensor_id: u8,
    /// Channels aggregated under this sensor
    pub channels: u8,
    /// Register index of the data window
    pub start_address: u16,
    /// Register count of the data window
    pub max_registers: u16,
    /// Base per-register sampling period in ms
    pub sampling_interval_ms: u16,
    /// Value encoding of the window
    pub data_type: DataType,
    /// Decimal exponent applied client-side (value x 10^scale)
    pub scale: u8,
    /// Bit width of each packed value when `data_type` is bit-packed; 0 otherwise
    pub packed_bits: u8,
}

impl SensorDescriptor {
    /// Encode to the eight-register wire order.
    pub fn to_registers(&self) -> [u16; 8] {
        [
            self.sensor_id as u16,
            self.channels as u16,
            self.start_address,
            self.max_registers,
            self.sampling_interval_ms,
            u8::from(self.data_type) as u16,
            self.scale as u16,
            self.packed_bits as u16,
        ]
    }

    /// Decode from the eight-register wire order.
    pub fn from_registers(regs: &[u16]) -> Result<Self> {
        if regs.len() < DESCRIPTOR_REGISTERS as usize {
            return Err(LinkError::Protocol(format!(
                "Descriptor block needs {} registers, got {}",
                DESCRIPTOR_REGISTERS,
                regs.len()
            )));
        }

        Ok(Self {
            sensor_id: regs[0] as u8,
            channels: regs[1] as u8,
            start_address: regs[2],
            max_registers: regs[3],
            sampling_interval_ms: regs[4],
            data_type: DataType::try_from(regs[5] as u8)?,
            scale: regs[6] as u8,
            packed_bits: regs[7] as u8,
        })
    }

    /// Decode from the 16-byte big-endian body of a discovery reply.
    pub fn from_reply_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < DESCRIPTOR_REGISTERS as usize * 2 {
            return Err(LinkError::Protocol(format!(
                "Descriptor reply needs {} bytes, got {}",
                DESCRIPTOR_REGISTERS * 2,
                bytes.len()
            )));
        }

        let mut regs = [0u16; DESCRIPTOR_REGISTERS as usize];
        for (i, reg) in regs.iter_mut().enumerate() {
            *reg = BigEndian::read_u16(&bytes[i * 2..]);
        }
        Self::from_registers(&regs)
    }

    /// Samples per channel in the data window; 0 when the descriptor is
    /// degenerate (no channels or empty window).
    pub fn registers_per_channel(&self) -> u16 {
        if self.channels == 0 {
            return 0;
        }
        self.max_registers / self.channels as u16
    }

    /// Derived sampling interval for the whole window, per the discovery
    /// contract: `samplingInterval x (maxRegisters / numberOfChannels)` when
    /// both are non-zero, the bare interval otherwise.
    pub fn derived_interval_ms(&self) -> u32 {
        if self.channels > 0 && self.max_registers > 0 {
            self.sampling_interval_ms as u32 * (self.max_registers / self.channels as u16) as u32
        } else {
            self.sampling_interval_ms as u32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn current_descriptor() -> SensorDescriptor {
        SensorDescriptor {
            sensor_id: 2,
            channels: 3,
            start_address: 10,
            max_registers: 18,
            sampling_interval_ms: 1000,
            data_type: DataType::Uint8,
            scale: 1,
            packed_bits: 0,
        }
    }

    #[test]
    fn register_round_trip_is_identity() {
        let desc = current_descriptor();
        let regs = desc.to_registers();
        let parsed = SensorDescriptor::from_registers(&regs).unwrap();
        assert_eq!(parsed, desc);
    }

    #[test]
    fn parses_discovery_reply_bytes() {
        // Eight big-endian registers as they arrive in an FC3 reply body.
        let bytes = [
            0x00, 0x02, 0x00, 0x03, 0x00, 0x0A, 0x00, 0x12, 0x03, 0xE8, 0x00, 0x01, 0x00, 0x01,
            0x00, 0x00,
        ];
        let desc = SensorDescriptor::from_reply_bytes(&bytes).unwrap();
        assert_eq!(desc.sensor_id, 2);
        assert_eq!(desc.channels, 3);
        assert_eq!(desc.start_address, 10);
        assert_eq!(desc.max_registers, 18);
        assert_eq!(desc.sampling_interval_ms, 1000);
        assert_eq!(desc.data_type, DataType::Uint8);
        assert_eq!(desc.scale, 1);
        assert_eq!(desc.packed_bits, 0);
    }

    #[test]
    fn low_byte_only_fields_survive_high_byte_noise() {
        let mut regs = current_descriptor().to_registers();
        regs[0] |= 0xAB00;
        regs[1] |= 0x1200;
        regs[6] |= 0x4400;
        let parsed = SensorDescriptor::from_registers(&regs).unwrap();
        assert_eq!(parsed.sensor_id, 2);
        assert_eq!(parsed.channels, 3);
        assert_eq!(parsed.scale, 1);
    }

    #[test]
    fn derived_interval() {
        let desc = current_descriptor();
        // 1000 ms x (18 / 3)
        assert_eq!(desc.derived_interval_ms(), 6000);

        let degenerate = SensorDescriptor {
            channels: 0,
            ..desc
        };
        assert_eq!(degenerate.derived_interval_ms(), 1000);
    }

    #[test]
    fn invalid_data_type_rejected() {
        let mut regs = current_descriptor().to_registers();
        regs[5] = 9;
        assert!(SensorDescriptor::from_registers(&regs).is_err());
    }
}
