//! Asynchronous Modbus RTU master.
//!
//! One I/O task owns the bus transport, which makes the half-duplex
//! constraint structural: requests queue up and go out strictly one at a
//! time. Callers correlate completions by token; a blocking convenience
//! wrapper hides the correlation for sequential flows like discovery.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::{Bytes, BytesMut};
use field_modbus::codec::{FrameDirection, RtuCodec};
use field_modbus::pdu;
use field_modbus::{LinkError, RtuFrame, Transport};
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::codec::Decoder;
use tracing::{debug, info, trace, warn};

use crate::error::{GwSrvError, Result};

/// Opaque correlation id. Zero is reserved to mean "consumed slot".
pub type Token = u32;

/// Standard Modbus ceiling on registers per read.
const MAX_READ_QUANTITY: u16 = 125;

/// Completion notifications for [`ModbusClient::submit`] requests.
#[derive(Debug)]
pub enum ClientEvent {
    /// Raw register payload, big-endian pairs, Modbus framing stripped
    Success {
        token: Token,
        slave_id: u8,
        payload: Bytes,
    },
    Failure {
        token: Token,
        slave_id: u8,
        error: GwSrvError,
    },
}

enum ReplyTo {
    /// Answer a waiting caller directly
    Oneshot(oneshot::Sender<Result<Bytes>>),
    /// Deliver on the shared event channel
    Event,
}

struct Request {
    token: Token,
    slave_id: u8,
    address: u16,
    quantity: u16,
    timeout: Duration,
    reply: ReplyTo,
}

/// Handle side of the Modbus master.
pub struct ModbusClient {
    request_tx: mpsc::Sender<Request>,
    next_token: AtomicU32,
}

impl ModbusClient {
    /// Spawn the I/O task on `transport` and return the shared handle.
    /// Completions of `submit`-style requests arrive on `event_tx`.
    pub fn new(
        transport: Box<dyn Transport>,
        event_tx: mpsc::Sender<ClientEvent>,
        queue_depth: usize,
        shutdown: watch::Receiver<bool>,
    ) -> (Arc<Self>, tokio::task::JoinHandle<()>) {
        let (request_tx, request_rx) = mpsc::channel(queue_depth);
        let io = ClientIo {
            transport,
            codec: RtuCodec::new(FrameDirection::Response),
            accumulator: BytesMut::with_capacity(512),
        };
        let handle = tokio::spawn(io.run(request_rx, event_tx, shutdown));

        (
            Arc::new(Self {
                request_tx,
                next_token: AtomicU32::new(1),
            }),
            handle,
        )
    }

    /// Allocate the next correlation token, skipping the reserved zero.
    pub fn allocate_token(&self) -> Token {
        loop {
            let token = self.next_token.fetch_add(1, Ordering::Relaxed);
            if token != 0 {
                return token;
            }
        }
    }

    fn validate(&self, function_code: u8, quantity: u16) -> Result<()> {
        if function_code != u8::from(pdu::FunctionCode::ReadHoldingRegisters) {
            return Err(GwSrvError::InvalidParams(format!(
                "unsupported function code {}",
                function_code
            )));
        }
        if quantity == 0 || quantity > MAX_READ_QUANTITY {
            return Err(GwSrvError::InvalidParams(format!(
                "quantity {} outside 1..={}",
                quantity, MAX_READ_QUANTITY
            )));
        }
        Ok(())
    }

    /// Fire-and-correlate: queue a read, get the token back immediately.
    /// The outcome arrives as a [`ClientEvent`].
    pub fn submit(
        &self,
        slave_id: u8,
        function_code: u8,
        address: u16,
        quantity: u16,
        timeout: Duration,
    ) -> Result<Token> {
        self.validate(function_code, quantity)?;
        let token = self.allocate_token();
        self.request_tx
            .try_send(Request {
                token,
                slave_id,
                address,
                quantity,
                timeout,
                reply: ReplyTo::Event,
            })
            .map_err(|_| GwSrvError::QueueFull("modbus request queue".to_string()))?;
        Ok(token)
    }

    /// Queue a read under a caller-supplied token and wait for its outcome.
    pub async fn transfer_with_token(
        &self,
        token: Token,
        slave_id: u8,
        function_code: u8,
        address: u16,
        quantity: u16,
        timeout: Duration,
    ) -> Result<Bytes> {
        self.validate(function_code, quantity)?;
        let (tx, rx) = oneshot::channel();
        self.request_tx
            .try_send(Request {
                token,
                slave_id,
                address,
                quantity,
                timeout,
                reply: ReplyTo::Oneshot(tx),
            })
            .map_err(|_| GwSrvError::QueueFull("modbus request queue".to_string()))?;

        rx.await
            .map_err(|_| GwSrvError::Internal("modbus I/O task gone".to_string()))?
    }

    /// Blocking convenience: read registers and wait for payload or error.
    pub async fn read_registers(
        &self,
        slave_id: u8,
        function_code: u8,
        address: u16,
        quantity: u16,
        timeout: Duration,
    ) -> Result<Bytes> {
        let token = self.allocate_token();
        self.transfer_with_token(token, slave_id, function_code, address, quantity, timeout)
            .await
    }
}

/// Bus side: owns the transport and the response decoder.
struct ClientIo {
    transport: Box<dyn Transport>,
    codec: RtuCodec,
    accumulator: BytesMut,
}

impl ClientIo {
    async fn run(
        mut self,
        mut request_rx: mpsc::Receiver<Request>,
        event_tx: mpsc::Sender<ClientEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        if let Err(e) = self.transport.connect().await {
            warn!("initial bus connect failed: {}", e);
        } else {
            info!("modbus master up on {}", self.transport.name());
        }

        loop {
            let request = tokio::select! {
                request = request_rx.recv() => match request {
                    Some(request) => request,
                    None => break,
                },
                _ = shutdown.changed() => break,
            };

            let result = self.perform(&request).await;
            match request.reply {
                ReplyTo::Oneshot(tx) => {
                    // Caller may have given up; nothing to do then.
                    let _ = tx.send(result);
                }
                ReplyTo::Event => {
                    let event = match result {
                        Ok(payload) => ClientEvent::Success {
                            token: request.token,
                            slave_id: request.slave_id,
                            payload,
                        },
                        Err(error) => ClientEvent::Failure {
                            token: request.token,
                            slave_id: request.slave_id,
                            error,
                        },
                    };
                    if event_tx.try_send(event).is_err() {
                        warn!("client event queue full, completion dropped");
                    }
                }
            }
        }

        let _ = self.transport.disconnect().await;
        debug!("modbus I/O task stopped");
    }

    async fn perform(&mut self, request: &Request) -> Result<Bytes> {
        if !self.transport.is_connected() {
            self.transport.connect().await.map_err(GwSrvError::from)?;
        }

        // Half-duplex bus: anything still buffered belongs to a finished or
        // abandoned exchange.
        self.accumulator.clear();

        let request_pdu = pdu::build_read_request(request.address, request.quantity);
        let frame = RtuFrame::new(request.slave_id, request_pdu).to_bytes();
        trace!("TX [{}]: {}", request.slave_id, hex::encode(&frame));
        self.transport.send(&frame).await.map_err(GwSrvError::from)?;

        let deadline = Instant::now() + request.timeout;
        let mut chunk = [0u8; 256];

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or_else(|| {
                    GwSrvError::Timeout(format!("slave {} did not reply", request.slave_id))
                })?;

            let n = self
                .transport
                .receive(&mut chunk, Some(remaining))
                .await
                .map_err(|e| match e {
                    LinkError::Timeout(_) => GwSrvError::Timeout(format!(
                        "slave {} did not reply within {:?}",
                        request.slave_id, request.timeout
                    )),
                    other => GwSrvError::from(other),
                })?;
            self.accumulator.extend_from_slice(&chunk[..n]);

            loop {
                match self.codec.decode(&mut self.accumulator) {
                    Ok(Some(frame)) => {
                        trace!(
                            "RX [{}]: {} pdu bytes",
                            frame.slave_address,
                            frame.pdu.len()
                        );
                        if frame.slave_address != request.slave_id {
                            continue;
                        }
                        let payload = pdu::parse_read_response(&frame.pdu)?;
                        return Ok(Bytes::from(payload));
                    }
                    Ok(None) => break,
                    Err(e) => return Err(GwSrvError::from(e)),
                }
            }
        }
    }
}
