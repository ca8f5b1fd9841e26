//! Acquisition node over the in-memory bus: a raw bus master runs the same
//! exchanges the gateway would.

use std::time::Duration;

use bytes::BytesMut;
use field_modbus::codec::{FrameDirection, RtuCodec};
use field_modbus::loopback::{LoopbackBus, LoopbackTransport};
use field_modbus::pdu;
use field_modbus::{RtuFrame, SensorDescriptor, Transport};
use tokio::sync::watch;
use tokio_util::codec::Decoder;

use acqsrv::config::{AcqConfig, ChannelConfig, SensorIdentity};
use acqsrv::sampling::SimSweepSource;

fn test_config() -> AcqConfig {
    AcqConfig {
        unit_id: 5,
        serial: Default::default(),
        sensor: SensorIdentity {
            sensor_id: 2,
            sampling_interval_ms: 100,
            data_type: 2,
            scale: 0,
            packed_bits: 0,
        },
        channels: vec![
            ChannelConfig {
                gain: 1.0,
                conversion_factor: 1.0,
            };
            3
        ],
        ring_capacity: 64,
        history_depth: 8,
        window_registers: 18,
        process_period_ms: 20,
        publish_period_ms: 20,
        sample_rate_sps: 4000,
        volts_per_bit: 1.0,
    }
}

/// One blocking read as the bus master would issue it.
async fn master_read(
    master: &mut LoopbackTransport,
    unit_id: u8,
    address: u16,
    quantity: u16,
) -> Result<Vec<u8>, field_modbus::LinkError> {
    let request = RtuFrame::new(unit_id, pdu::build_read_request(address, quantity));
    master.send(&request.to_bytes()).await?;

    let mut codec = RtuCodec::new(FrameDirection::Response);
    let mut accumulator = BytesMut::new();
    let mut chunk = [0u8; 256];
    let deadline = std::time::Instant::now() + Duration::from_secs(2);

    loop {
        let remaining = deadline
            .checked_duration_since(std::time::Instant::now())
            .ok_or_else(|| field_modbus::LinkError::Timeout("no reply".to_string()))?;
        let n = master.receive(&mut chunk, Some(remaining)).await?;
        accumulator.extend_from_slice(&chunk[..n]);
        if let Some(frame) = codec.decode(&mut accumulator)? {
            assert_eq!(frame.slave_address, unit_id);
            return pdu::parse_read_response(&frame.pdu);
        }
    }
}

#[tokio::test]
async fn discovery_and_window_over_the_bus() {
    let config = test_config();
    let expected_descriptor = config.descriptor();

    let mut bus = LoopbackBus::new();
    let tap = bus.tap("unit5");
    let mut master = bus.master();
    master.connect().await.unwrap();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = tokio::spawn(acqsrv::run_node(
        config,
        Box::new(tap),
        Box::new(SimSweepSource::new()),
        shutdown_rx,
    ));

    // Discovery: eight registers at address 0.
    let payload = master_read(&mut master, 5, 0, 8).await.unwrap();
    let descriptor = SensorDescriptor::from_reply_bytes(&payload).unwrap();
    assert_eq!(descriptor, expected_descriptor);

    // The sweep feeds a sine; once the RMS pipeline has turned over, the
    // publication window shows non-zero values for every channel.
    let deadline = std::time::Instant::now() + Duration::from_secs(5);
    loop {
        let payload = master_read(&mut master, 5, 10, 18).await.unwrap();
        assert_eq!(payload.len(), 36);
        let first_per_channel: Vec<u16> = (0..3)
            .map(|c| {
                let idx = c * 6 * 2;
                u16::from_be_bytes([payload[idx], payload[idx + 1]])
            })
            .collect();
        if first_per_channel.iter().all(|&v| v > 0) {
            break;
        }
        assert!(
            std::time::Instant::now() < deadline,
            "window never populated: {:?}",
            first_per_channel
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // Unmapped address is rejected on the wire.
    let err = master_read(&mut master, 5, 2, 4).await.unwrap_err();
    assert!(matches!(
        err,
        field_modbus::LinkError::Exception(pdu::ExceptionCode::IllegalDataAddress)
    ));

    // Frames for other units are ignored, not answered.
    let request = RtuFrame::new(9, pdu::build_read_request(0, 8));
    master.send(&request.to_bytes()).await.unwrap();
    let mut chunk = [0u8; 64];
    assert!(master
        .receive(&mut chunk, Some(Duration::from_millis(200)))
        .await
        .is_err());

    let _ = shutdown_tx.send(true);
    let _ = node.await;
}
