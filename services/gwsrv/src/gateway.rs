//! Gateway assembly and control surface.
//!
//! All queues, tables and tasks are owned by [`GatewayNode`], built once at
//! startup and passed into the tasks explicitly. The control surface mutates
//! registry and scheduler under their own locks; pausing affects only the
//! dispatch side.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use common::clock::MonotonicClock;
use field_modbus::Transport;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::aggregator::{Aggregator, UplinkSummary};
use crate::battery::{self, BatteryProbe};
use crate::client::{ClientEvent, ModbusClient};
use crate::config::GwConfig;
use crate::discovery::Discovery;
use crate::dispatcher::{FailureGovernor, RequestDispatcher};
use crate::error::{GwSrvError, Result};
use crate::formatter;
use crate::radio::{RadioDriver, RadioUplink};
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::stats::{PollingStats, PollingStatsSnapshot};

/// Queue depth between dispatcher, formatter and aggregator.
const PIPELINE_QUEUE_DEPTH: usize = 32;

/// A running gateway node.
pub struct GatewayNode {
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    stats: Arc<PollingStats>,
    discovery: Arc<Discovery>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
    /// Completions of `submit`-style client requests; taken by embedders
    /// that drive the async client path themselves.
    client_events: Option<mpsc::Receiver<ClientEvent>>,
}

impl GatewayNode {
    /// Bring up the whole pipeline: discovery pass, scheduler, dispatcher,
    /// formatter, aggregator, battery feed, display consumer and radio
    /// uplink.
    pub async fn start(
        config: GwConfig,
        transport: Box<dyn Transport>,
        radio: Arc<dyn RadioDriver>,
        tx_complete: Arc<Semaphore>,
        battery_probe: Arc<dyn BatteryProbe>,
        clock: Arc<dyn MonotonicClock>,
    ) -> Result<Self> {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let (event_tx, event_rx) = mpsc::channel(PIPELINE_QUEUE_DEPTH);
        let (reply_tx, reply_rx) = mpsc::channel(PIPELINE_QUEUE_DEPTH);
        let (payload_tx, payload_rx) = mpsc::channel(PIPELINE_QUEUE_DEPTH);
        let (uplink_tx, uplink_rx) = mpsc::channel::<Bytes>(config.uplink_queue_depth);
        let (display_tx, mut display_rx) =
            mpsc::channel::<UplinkSummary>(config.display_queue_depth);

        let (client, client_task) = ModbusClient::new(
            transport,
            event_tx,
            config.request_queue_depth,
            shutdown_rx.clone(),
        );

        let registry = Arc::new(Registry::new());
        let discovery = Arc::new(Discovery::new(
            client.clone(),
            registry.clone(),
            Duration::from_millis(config.discovery_timeout_ms),
        ));

        // Bootstrap: one pass over the candidates, then build the schedule
        // from whatever answered.
        discovery.run_once(&config.candidate_slaves).await;

        let scheduler = Arc::new(Scheduler::new(clock));
        scheduler.rebuild(&registry);

        let stats = Arc::new(PollingStats::new());
        let dispatcher = Arc::new(RequestDispatcher::new(
            client,
            registry.clone(),
            scheduler.clone(),
            FailureGovernor::new(config.eviction_threshold),
            stats.clone(),
            reply_tx,
            Duration::from_millis(config.request_timeout_ms),
            config.request_queue_depth,
        ));

        let mut tasks = Vec::new();
        tasks.push(client_task);

        let dispatcher_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            if let Err(e) = dispatcher.run(dispatcher_shutdown).await {
                warn!("dispatcher exited with error: {}", e);
            }
        }));

        tasks.push(tokio::spawn(formatter::run_formatter(
            reply_rx,
            payload_tx.clone(),
            shutdown_rx.clone(),
        )));

        let aggregator = Aggregator::new(
            payload_rx,
            uplink_tx,
            display_tx,
            config.aggregation_window_ms,
        );
        tasks.push(tokio::spawn(aggregator.run(shutdown_rx.clone())));

        tasks.push(tokio::spawn(battery::run_battery_task(
            battery_probe,
            payload_tx,
            config.battery_period_ms,
            shutdown_rx.clone(),
        )));

        // Display consumer: the OLED stand-in just logs the summary line.
        let mut display_shutdown = shutdown_rx.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    summary = display_rx.recv() => match summary {
                        Some(s) => info!(
                            "uplink #{} at {}: {} sensors, {} bytes",
                            s.id_msg, s.timestamp, s.sensor_count, s.frame_len
                        ),
                        None => break,
                    },
                    _ = display_shutdown.changed() => break,
                }
            }
        }));

        let uplink = RadioUplink::new(radio, tx_complete, uplink_rx, config.lora_port);
        tasks.push(tokio::spawn(uplink.run(shutdown_rx)));

        info!(
            "gateway up: {} slaves discovered, {} schedule entries",
            registry.slave_ids().len(),
            scheduler.entry_count()
        );

        Ok(Self {
            registry,
            scheduler,
            stats,
            discovery,
            shutdown_tx,
            tasks,
            client_events: Some(event_rx),
        })
    }

    /// One-shot discovery of a new slave; on success its sensors enter the
    /// schedule atomically.
    pub async fn register_slave(&self, slave_id: u8) -> Result<()> {
        self.discovery.probe(slave_id).await?;
        self.scheduler.rebuild(&self.registry);
        Ok(())
    }

    /// Remove a slave and all of its schedule entries.
    pub fn unregister_slave(&self, slave_id: u8) -> Result<()> {
        if !self.registry.remove(slave_id) {
            return Err(GwSrvError::NotFound(format!("slave {}", slave_id)));
        }
        self.scheduler.remove_slave(slave_id);
        self.scheduler.mark_dirty();
        Ok(())
    }

    /// Suspend dispatching; in-flight requests complete or time out
    /// normally.
    pub fn pause_scheduler(&self) {
        self.scheduler.pause();
    }

    pub fn resume_scheduler(&self) {
        self.scheduler.resume();
    }

    pub fn stats(&self) -> PollingStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Take the client completion stream (first caller wins).
    pub fn take_client_events(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.client_events.take()
    }

    /// Signal every task to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Wait for all tasks to finish.
    pub async fn join(self) {
        for task in self.tasks {
            let _ = task.await;
        }
        info!("gateway stopped");
    }
}
