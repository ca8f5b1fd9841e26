//! Unified uplink frame.
//!
//! Wire layout:
//!
//! ```text
//! offset  size  field
//!   0      1    id_msg
//!   1      4    timestamp (seconds, big-endian)
//!   5      1    activate byte (bit per sensor kind present)
//!   6      k    k length-descriptor bytes, k = popcount(activate)
//!   6+k    ..   sensor data blocks in ascending bit order
//! ```
//!
//! Length descriptor: `PKD (bit 7) | TWOBIT (bit 6, reserved) | DATA_LENGTH
//! (bits 0..4)` where DATA_LENGTH is samples per channel.

use bytes::{BufMut, Bytes, BytesMut};
use tracing::warn;

use crate::formatter::NormalizedPayload;

/// Regional ceiling the codec must respect.
pub const LORA_PAYLOAD_MAX: usize = 220;

/// Length-descriptor flag bits.
pub const DESCRIPTOR_PKD: u8 = 0x80;
/// Reserved; never set by this builder.
pub const DESCRIPTOR_TWOBIT: u8 = 0x40;
pub const DATA_LENGTH_MASK: u8 = 0x1F;

/// Activate-byte slot for a sensor id: battery=0, voltage=1, current=2,
/// external sensors take bits 3..7. Ids past the last external slot do not
/// fit the frame.
pub fn sensor_bit(sensor_id: u8) -> Option<u8> {
    (sensor_id <= 7).then_some(sensor_id)
}

/// Build one frame from a window's payloads.
///
/// Payloads sharing a `sensor_id` collapse to the most recent one. Output is
/// deterministic for a given `(id_msg, timestamp, payload set)`: blocks are
/// emitted in ascending bit order regardless of input order. Frames that
/// would exceed [`LORA_PAYLOAD_MAX`] are truncated at the byte boundary.
pub fn build_frame(id_msg: u8, timestamp: u32, payloads: &[NormalizedPayload]) -> Bytes {
    let mut by_bit: [Option<&NormalizedPayload>; 8] = [None; 8];
    for payload in payloads {
        match sensor_bit(payload.sensor_id) {
            // Later payloads override earlier ones within a window.
            Some(bit) => by_bit[bit as usize] = Some(payload),
            None => warn!(
                "sensor {} has no activate-byte slot, payload dropped",
                payload.sensor_id
            ),
        }
    }

    let mut activate: u8 = 0;
    for (bit, slot) in by_bit.iter().enumerate() {
        if slot.is_some() {
            activate |= 1 << bit;
        }
    }

    let mut frame = BytesMut::with_capacity(LORA_PAYLOAD_MAX);
    frame.put_u8(id_msg);
    frame.put_u32(timestamp);
    frame.put_u8(activate);

    for slot in by_bit.iter().flatten() {
        let mut descriptor = slot.samples_per_channel & DATA_LENGTH_MASK;
        if slot.packed {
            descriptor |= DESCRIPTOR_PKD;
        }
        frame.put_u8(descriptor);
    }

    for slot in by_bit.iter().flatten() {
        frame.put_slice(&slot.bytes);
    }

    if frame.len() > LORA_PAYLOAD_MAX {
        warn!(
            "frame {} truncated from {} to {} bytes",
            id_msg,
            frame.len(),
            LORA_PAYLOAD_MAX
        );
        frame.truncate(LORA_PAYLOAD_MAX);
    }

    frame.freeze()
}
