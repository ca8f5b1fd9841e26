//! RTU server for the acquisition unit.
//!
//! Serves exactly two things on function code 3: the self-description block
//! at address 0 and the RMS publication window at address 10. The unit never
//! initiates traffic; retries and timeouts are the bus master's business.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use field_modbus::codec::{FrameDirection, RtuCodec};
use field_modbus::pdu::{self, ExceptionCode};
use field_modbus::{LinkError, RtuFrame, SensorDescriptor, Transport, DESCRIPTOR_REGISTERS};
use tokio::sync::{watch, Mutex};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use crate::config::WINDOW_START;
use crate::error::Result;

/// How long a window read may wait on the register lock before the unit
/// answers busy.
const WINDOW_LOCK_TIMEOUT: Duration = Duration::from_millis(100);

/// Poll granularity of the receive loop; bounds shutdown latency.
const RECEIVE_POLL: Duration = Duration::from_millis(200);

/// Modbus RTU server for one acquisition unit.
pub struct AcqServer {
    unit_id: u8,
    descriptor: SensorDescriptor,
    window: Arc<Mutex<Vec<u16>>>,
    transport: Box<dyn Transport>,
}

impl AcqServer {
    pub fn new(
        unit_id: u8,
        descriptor: SensorDescriptor,
        window: Arc<Mutex<Vec<u16>>>,
        transport: Box<dyn Transport>,
    ) -> Self {
        Self {
            unit_id,
            descriptor,
            window,
            transport,
        }
    }

    /// Serve requests until shutdown flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        self.transport.connect().await?;
        info!("acquisition server up as unit {}", self.unit_id);

        let mut codec = RtuCodec::new(FrameDirection::Request);
        let mut accumulator = BytesMut::with_capacity(256);
        let mut chunk = [0u8; 256];

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self
                .transport
                .receive(&mut chunk, Some(RECEIVE_POLL))
                .await
            {
                Ok(0) => continue,
                Ok(n) => accumulator.extend_from_slice(&chunk[..n]),
                Err(LinkError::Timeout(_)) => continue,
                Err(e) => {
                    warn!("receive failed: {}", e);
                    continue;
                }
            }

            loop {
                match codec.decode(&mut accumulator) {
                    Ok(Some(frame)) => {
                        if frame.slave_address != self.unit_id {
                            trace!(
                                "ignoring frame for unit {} (we are {})",
                                frame.slave_address,
                                self.unit_id
                            );
                            continue;
                        }
                        let reply = self.handle_request(&frame.pdu).await;
                        let bytes = RtuFrame::new(self.unit_id, reply).to_bytes();
                        trace!("TX [{}]: {}", self.unit_id, hex::encode(&bytes));
                        if let Err(e) = self.transport.send(&bytes).await {
                            warn!("reply send failed: {}", e);
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        warn!("dropping corrupt frame: {}", e);
                    }
                }
            }
        }

        self.transport.disconnect().await?;
        info!("acquisition server for unit {} stopped", self.unit_id);
        Ok(())
    }

    /// Build the reply PDU for one request PDU.
    async fn handle_request(&self, request_pdu: &[u8]) -> Vec<u8> {
        let function_code = request_pdu.first().copied().unwrap_or(0);
        let request = match pdu::parse_read_request(request_pdu) {
            Ok(request) => request,
            Err(exception) => return pdu::build_exception(function_code, exception),
        };

        trace!(
            "RX read: addr={} qty={}",
            request.start_address,
            request.quantity
        );

        // Exact discovery query.
        if request.start_address == 0 && request.quantity == DESCRIPTOR_REGISTERS {
            let regs = self.descriptor.to_registers();
            return pdu::build_read_response(&pdu::registers_to_bytes(&regs));
        }

        // Reads entirely inside the publication window.
        let window_len = self.descriptor.max_registers;
        let window_end = WINDOW_START + window_len;
        let request_end = request.start_address.saturating_add(request.quantity);
        if request.quantity > 0
            && request.start_address >= WINDOW_START
            && request_end <= window_end
        {
            return match tokio::time::timeout(WINDOW_LOCK_TIMEOUT, self.window.lock()).await {
                Ok(window) => {
                    let offset = (request.start_address - WINDOW_START) as usize;
                    let slice = &window[offset..offset + request.quantity as usize];
                    pdu::build_read_response(&pdu::registers_to_bytes(slice))
                }
                Err(_) => {
                    debug!("window lock busy, answering SERVER_DEVICE_BUSY");
                    pdu::build_exception(function_code, ExceptionCode::ServerDeviceBusy)
                }
            };
        }

        pdu::build_exception(function_code, ExceptionCode::IllegalDataAddress)
    }
}
