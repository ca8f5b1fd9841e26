//! Full pipeline over the in-memory bus: real acquisition nodes behind the
//! taps, the real gateway on the master side, frames landing in the mock
//! radio.

use std::sync::Arc;
use std::time::Duration;

use bytes::BytesMut;
use common::clock::SystemClock;
use field_modbus::codec::{FrameDirection, RtuCodec};
use field_modbus::loopback::LoopbackBus;
use field_modbus::pdu;
use field_modbus::{RtuFrame, Transport};
use tokio::sync::watch;
use tokio_util::codec::Decoder;

use acqsrv::config::{AcqConfig, ChannelConfig, SensorIdentity};
use acqsrv::sampling::SimSweepSource;
use gwsrv::battery::ConstBatteryProbe;
use gwsrv::config::GwConfig;
use gwsrv::gateway::GatewayNode;
use gwsrv::radio::{MockRadio, RadioDriver};

fn acq_config(unit_id: u8, sensor_id: u8, channels: usize, window: u16, packed_bits: u8) -> AcqConfig {
    AcqConfig {
        unit_id,
        serial: Default::default(),
        sensor: SensorIdentity {
            sensor_id,
            sampling_interval_ms: 50,
            data_type: if packed_bits > 0 { 3 } else { 2 },
            scale: 0,
            packed_bits,
        },
        channels: vec![
            ChannelConfig {
                gain: 1.0,
                conversion_factor: 1.0,
            };
            channels
        ],
        ring_capacity: 64,
        history_depth: 8,
        window_registers: window,
        process_period_ms: 20,
        publish_period_ms: 20,
        sample_rate_sps: 4000,
        volts_per_bit: 1.0,
    }
}

fn gw_config(candidates: Vec<u8>) -> GwConfig {
    GwConfig {
        serial: Default::default(),
        candidate_slaves: candidates,
        request_timeout_ms: 200,
        discovery_timeout_ms: 200,
        request_queue_depth: 16,
        eviction_threshold: 3,
        aggregation_window_ms: 300,
        uplink_queue_depth: 8,
        display_queue_depth: 4,
        battery_period_ms: 150,
        lora_port: 2,
    }
}

#[tokio::test]
async fn discover_sample_aggregate_uplink() {
    let mut bus = LoopbackBus::new();

    // Unit 5: three-channel current sensor, 10-bit packed.
    // Unit 6: single-channel voltage sensor, plain uint16.
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node5 = tokio::spawn(acqsrv::run_node(
        acq_config(5, 2, 3, 18, 10),
        Box::new(bus.tap("unit5")),
        Box::new(SimSweepSource::new()),
        shutdown_rx.clone(),
    ));
    let node6 = tokio::spawn(acqsrv::run_node(
        acq_config(6, 1, 1, 4, 0),
        Box::new(bus.tap("unit6")),
        Box::new(SimSweepSource::new()),
        shutdown_rx,
    ));

    // Give the servers a moment to come up before discovery probes them.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (radio, tx_complete) = MockRadio::new(Duration::from_millis(10));
    let radio_driver: Arc<dyn RadioDriver> = Arc::new(radio.clone());
    let gateway = GatewayNode::start(
        gw_config(vec![5, 6, 9]), // 9 never answers
        Box::new(bus.master()),
        radio_driver,
        tx_complete,
        Arc::new(ConstBatteryProbe(12.6)),
        Arc::new(SystemClock::new()),
    )
    .await
    .unwrap();

    assert!(gateway.registry().contains(5));
    assert!(gateway.registry().contains(6));
    assert!(!gateway.registry().contains(9));
    assert_eq!(gateway.scheduler().entry_count(), 2);

    // Let a few aggregation windows pass.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    let frame = loop {
        let frames = radio.sent_frames();
        // Wait for a frame that carries battery, voltage and current at once.
        if let Some(frame) = frames.iter().find(|f| f[5] & 0b111 == 0b111) {
            break frame.clone();
        }
        assert!(
            std::time::Instant::now() < deadline,
            "no complete frame uplinked; got {} frames",
            frames.len()
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    };

    // Layout: id, ts[4], activate, then one descriptor per set bit in
    // ascending order: battery(0), voltage(1), current(2).
    let battery_desc = frame[6];
    let voltage_desc = frame[7];
    let current_desc = frame[8];

    assert_eq!(battery_desc, 0x01); // one sample, unpacked
    assert_eq!(voltage_desc & 0x80, 0); // uint16 stays unpacked
    assert_eq!(voltage_desc & 0x1F, 4); // 4 registers over 1 channel
    assert_eq!(current_desc & 0x80, 0x80); // 10-bit packed
    assert_eq!(current_desc & 0x1F, 6); // 18 registers over 3 channels

    // Battery block is the first data byte: 12.6 V -> 126.
    assert_eq!(frame[9], 126);

    let stats = gateway.stats();
    assert!(stats.successful_polls() > 0);

    gateway.shutdown();
    gateway.join().await;
    let _ = shutdown_tx.send(true);
    let _ = node5.await;
    let _ = node6.await;
}

#[tokio::test]
async fn slave_going_silent_is_evicted() {
    let mut bus = LoopbackBus::new();

    // A hand-rolled unit that answers discovery but never sampling reads.
    let mut tap = bus.tap("mute-after-discovery");
    tokio::spawn(async move {
        tap.connect().await.unwrap();
        let mut codec = RtuCodec::new(FrameDirection::Request);
        let mut accumulator = BytesMut::new();
        let mut chunk = [0u8; 256];
        loop {
            let Ok(n) = tap.receive(&mut chunk, Some(Duration::from_secs(10))).await else {
                return;
            };
            accumulator.extend_from_slice(&chunk[..n]);
            while let Ok(Some(frame)) = codec.decode(&mut accumulator) {
                if frame.slave_address != 5 {
                    continue;
                }
                let request = pdu::parse_read_request(&frame.pdu).unwrap();
                if request.start_address == 0 && request.quantity == 8 {
                    // Voltage sensor, 1 channel, window of 4.
                    let regs = [1u16, 1, 10, 4, 50, 2, 0, 0];
                    let reply = pdu::build_read_response(&pdu::registers_to_bytes(&regs));
                    let bytes = RtuFrame::new(5, reply).to_bytes();
                    tap.send(&bytes).await.unwrap();
                }
                // Sampling reads go unanswered.
            }
        }
    });

    tokio::time::sleep(Duration::from_millis(50)).await;

    let (radio, tx_complete) = MockRadio::new(Duration::from_millis(10));
    let radio_driver: Arc<dyn RadioDriver> = Arc::new(radio.clone());
    let gateway = GatewayNode::start(
        gw_config(vec![5]),
        Box::new(bus.master()),
        radio_driver,
        tx_complete,
        Arc::new(ConstBatteryProbe(12.6)),
        Arc::new(SystemClock::new()),
    )
    .await
    .unwrap();

    assert!(gateway.registry().contains(5));

    // Three timeouts at 200 ms each, plus scheduler slack.
    let deadline = std::time::Instant::now() + Duration::from_secs(10);
    while gateway.registry().contains(5) {
        assert!(
            std::time::Instant::now() < deadline,
            "slave 5 was never evicted"
        );
        tokio::time::sleep(Duration::from_millis(50)).await;
    }

    // After the rebuild nothing references the evicted slave.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(gateway.scheduler().entries_for(5), 0);

    let stats = gateway.stats();
    assert!(stats.slave_stats[&5].failures >= 3);

    gateway.shutdown();
    gateway.join().await;
}

#[tokio::test]
async fn control_surface_pause_register_unregister() {
    let mut bus = LoopbackBus::new();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let node = tokio::spawn(acqsrv::run_node(
        acq_config(7, 1, 1, 4, 0),
        Box::new(bus.tap("unit7")),
        Box::new(SimSweepSource::new()),
        shutdown_rx,
    ));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let (radio, tx_complete) = MockRadio::new(Duration::from_millis(10));
    let radio_driver: Arc<dyn RadioDriver> = Arc::new(radio);
    // Start with an empty bus view: candidate 8 does not exist.
    let gateway = GatewayNode::start(
        gw_config(vec![8]),
        Box::new(bus.master()),
        radio_driver,
        tx_complete,
        Arc::new(ConstBatteryProbe(12.6)),
        Arc::new(SystemClock::new()),
    )
    .await
    .unwrap();

    assert_eq!(gateway.scheduler().entry_count(), 0);

    // Late registration picks the unit up and schedules it atomically.
    gateway.register_slave(7).await.unwrap();
    assert!(gateway.registry().contains(7));
    assert_eq!(gateway.scheduler().entries_for(7), 1);

    // A missing unit reports the failure to the caller.
    assert!(gateway.register_slave(9).await.is_err());

    gateway.pause_scheduler();
    assert!(gateway.scheduler().is_paused());
    gateway.resume_scheduler();
    assert!(!gateway.scheduler().is_paused());

    gateway.unregister_slave(7).unwrap();
    assert!(!gateway.registry().contains(7));
    assert_eq!(gateway.scheduler().entries_for(7), 0);
    assert!(gateway.unregister_slave(7).is_err());

    gateway.shutdown();
    gateway.join().await;
    let _ = shutdown_tx.send(true);
    let _ = node.await;
}
