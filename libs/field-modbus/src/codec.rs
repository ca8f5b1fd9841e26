//! Incremental RTU frame decoding.
//!
//! RTU has no length prefix, so the expected frame length is derived from the
//! function code (and byte-count field where one exists). The decoder is fed
//! from a [`bytes::BytesMut`] accumulator that the transport fills in
//! arbitrary chunks.

use bytes::BytesMut;
use tokio_util::codec::Decoder;

use crate::error::LinkError;
use crate::frame::RtuFrame;

/// Which side of the exchange the decoder is parsing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameDirection {
    /// Master-to-slave requests (fixed-length for the read/write-single family)
    Request,
    /// Slave-to-master responses (length carried in the byte-count field)
    Response,
}

/// Streaming decoder for RTU frames.
#[derive(Debug)]
pub struct RtuCodec {
    direction: FrameDirection,
}

impl RtuCodec {
    pub fn new(direction: FrameDirection) -> Self {
        Self { direction }
    }

    /// Expected total frame length once enough header bytes are buffered.
    fn expected_len(&self, buf: &[u8]) -> Option<usize> {
        if buf.len() < 2 {
            return None;
        }
        let function_code = buf[1];

        match self.direction {
            FrameDirection::Request => match function_code {
                // Read and write-single requests: addr + fc + 4 data + CRC
                0x01..=0x06 => Some(8),
                // Write-multiple requests carry a byte count at offset 6
                0x0F | 0x10 => {
                    if buf.len() < 7 {
                        None
                    } else {
                        Some(9 + buf[6] as usize)
                    }
                }
                _ => Some(8),
            },
            FrameDirection::Response => {
                if function_code & 0x80 != 0 {
                    // Exception: addr + fc + code + CRC
                    return Some(5);
                }
                match function_code {
                    // Read responses: addr + fc + byte count + data + CRC
                    0x01..=0x04 => {
                        if buf.len() < 3 {
                            None
                        } else {
                            Some(5 + buf[2] as usize)
                        }
                    }
                    0x05 | 0x06 | 0x0F | 0x10 => Some(8),
                    _ => Some(8),
                }
            }
        }
    }
}

impl Decoder for RtuCodec {
    type Item = RtuFrame;
    type Error = LinkError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RtuFrame>, LinkError> {
        let Some(len) = self.expected_len(src) else {
            return Ok(None);
        };
        if src.len() < len {
            return Ok(None);
        }

        // The frame bytes are consumed even when the CRC check fails, so a
        // corrupted frame cannot wedge the stream.
        let bytes = src.split_to(len);
        RtuFrame::from_bytes(&bytes).map(Some)
    }
}

impl From<std::io::Error> for LinkError {
    fn from(err: std::io::Error) -> Self {
        LinkError::Transport(err.to_string())
    }
}
