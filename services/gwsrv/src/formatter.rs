//! Per-sensor payload normalization.
//!
//! Raw FC3 reply bytes become compact sample bytes according to the sensor's
//! descriptor: plain low-byte or high/low emission by data type, or an
//! arbitrary-width bit-packed stream when the descriptor asks for it.

use byteorder::{BigEndian, ByteOrder};
use bytes::Bytes;
use field_modbus::{DataType, SensorDescriptor};
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

use crate::bitpack::BitPacker;
use crate::error::{GwSrvError, Result};

/// Upper bound on a normalized payload.
pub const PAYLOAD_MAX: usize = 128;

/// One sensor's normalized bytes, ready for aggregation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NormalizedPayload {
    pub slave_id: u8,
    pub sensor_id: u8,
    /// Samples per channel, as encoded in the frame's length descriptor
    pub samples_per_channel: u8,
    /// True when `bytes` is a bit-packed stream
    pub packed: bool,
    pub bytes: Bytes,
}

/// A successful sampling reply waiting for normalization.
#[derive(Debug, Clone)]
pub struct SampleReply {
    pub slave_id: u8,
    pub descriptor: SensorDescriptor,
    pub payload: Bytes,
}

/// Normalize one reply according to its descriptor.
pub fn normalize(reply: &SampleReply) -> Result<NormalizedPayload> {
    let desc = &reply.descriptor;
    let raw = &reply.payload;

    // Registers actually present in the reply; the sampling read asks for
    // max_registers but a short reply truncates the payload, never errors.
    let available = (raw.len() / 2).min(desc.max_registers as usize);

    let mut bytes: Vec<u8>;
    let packed = desc.packed_bits > 0;

    if packed {
        if desc.packed_bits > 16 {
            return Err(GwSrvError::InvalidParams(format!(
                "packed width {} exceeds 16 bits",
                desc.packed_bits
            )));
        }
        let mut packer = BitPacker::new();
        for i in 0..available {
            let value = BigEndian::read_u16(&raw[i * 2..]);
            packer.push(value, desc.packed_bits);
        }
        packer.flush();
        bytes = packer.take();
    } else {
        bytes = match desc.data_type {
            DataType::Uint8 => (0..available).map(|i| raw[i * 2 + 1]).collect(),
            // BitPacked without a width degrades to uint16; float16 is
            // reserved and passes through as [high, low].
            DataType::Uint16 | DataType::BitPacked | DataType::Float16 => {
                raw[..available * 2].to_vec()
            }
        };
    }

    if bytes.len() > PAYLOAD_MAX {
        warn!(
            "payload for slave {} sensor {} truncated from {} to {} bytes",
            reply.slave_id,
            desc.sensor_id,
            bytes.len(),
            PAYLOAD_MAX
        );
        bytes.truncate(PAYLOAD_MAX);
    }

    Ok(NormalizedPayload {
        slave_id: reply.slave_id,
        sensor_id: desc.sensor_id,
        samples_per_channel: desc.registers_per_channel().min(u8::MAX as u16) as u8,
        packed,
        bytes: Bytes::from(bytes),
    })
}

/// Single-threaded consumer of the reply queue; feeds the aggregator.
pub async fn run_formatter(
    mut reply_rx: mpsc::Receiver<SampleReply>,
    payload_tx: mpsc::Sender<NormalizedPayload>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let reply = tokio::select! {
            reply = reply_rx.recv() => match reply {
                Some(reply) => reply,
                None => break,
            },
            _ = shutdown.changed() => break,
        };

        match normalize(&reply) {
            Ok(payload) => {
                debug!(
                    "normalized slave {} sensor {}: {} bytes{}",
                    payload.slave_id,
                    payload.sensor_id,
                    payload.bytes.len(),
                    if payload.packed { " (packed)" } else { "" }
                );
                // The aggregator drains this queue every window; a full queue
                // means the window is backed up and the sample is stale.
                if payload_tx.try_send(payload).is_err() {
                    warn!("payload queue full, dropping sample");
                }
            }
            Err(e) => warn!(
                "cannot normalize reply from slave {}: {}",
                reply.slave_id, e
            ),
        }
    }
    debug!("formatter stopped");
}
