//! Request dispatch, in-flight correlation, and failure accounting.
//!
//! Every scheduled read passes through here: resolve the descriptor, reserve
//! a correlation slot, issue the read, and route the outcome. The failure
//! governor evicts a slave after enough consecutive faults and invalidates
//! its slots, so a late completion from an evicted slave falls on the floor.

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::client::{ModbusClient, Token};
use crate::error::Result;
use crate::formatter::SampleReply;
use crate::registry::Registry;
use crate::scheduler::Scheduler;
use crate::stats::PollingStats;

/// Default capacity of the correlation table.
pub const SLOT_TABLE_CAPACITY: usize = 16;

/// Why a request was issued.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestKind {
    Discovery,
    Sampling,
}

/// One in-flight request. `token == 0` marks a consumed slot.
#[derive(Debug, Clone, Copy)]
pub struct RequestSlot {
    pub token: Token,
    pub slave_id: u8,
    pub sensor_id: u8,
    pub function_code: u8,
    pub kind: RequestKind,
}

/// Fixed-capacity correlation table; new slots overwrite the oldest.
#[derive(Debug)]
pub struct SlotTable {
    slots: Vec<RequestSlot>,
    write_index: usize,
    capacity: usize,
}

impl SlotTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            write_index: 0,
            capacity: capacity.max(1),
        }
    }

    pub fn insert(&mut self, slot: RequestSlot) {
        if self.slots.len() < self.capacity {
            self.slots.push(slot);
        } else {
            self.slots[self.write_index] = slot;
        }
        self.write_index = (self.write_index + 1) % self.capacity;
    }

    /// Consume the slot for `token`. `None` when the token was never
    /// recorded, was overwritten, or has been invalidated.
    pub fn take(&mut self, token: Token) -> Option<RequestSlot> {
        if token == 0 {
            return None;
        }
        for slot in self.slots.iter_mut() {
            if slot.token == token {
                let taken = *slot;
                slot.token = 0;
                return Some(taken);
            }
        }
        None
    }

    /// Invalidate every slot belonging to a slave. In-flight requests stay
    /// alive on the bus; their completions just have nowhere to land.
    pub fn invalidate_slave(&mut self, slave_id: u8) {
        for slot in self.slots.iter_mut() {
            if slot.slave_id == slave_id {
                slot.token = 0;
            }
        }
    }
}

/// Eviction policy: consecutive slave faults against a threshold.
#[derive(Debug, Clone, Copy)]
pub struct FailureGovernor {
    threshold: u32,
}

impl FailureGovernor {
    pub fn new(threshold: u32) -> Self {
        Self { threshold }
    }

    /// Account one slave fault. When the threshold is reached the slave is
    /// removed from the registry and the scheduler is marked for rebuild.
    /// Returns true on eviction.
    pub fn on_failure(
        &self,
        registry: &Registry,
        scheduler: &Scheduler,
        slots: &Mutex<SlotTable>,
        slave_id: u8,
    ) -> bool {
        let fails = registry.record_failure(slave_id);
        if fails < self.threshold {
            debug!("slave {} fault {}/{}", slave_id, fails, self.threshold);
            return false;
        }

        warn!(
            "slave {} evicted after {} consecutive failures",
            slave_id, fails
        );
        registry.remove(slave_id);
        scheduler.remove_slave(slave_id);
        scheduler.mark_dirty();
        slots.lock().invalidate_slave(slave_id);
        true
    }
}

/// Issues scheduled reads and routes outcomes.
pub struct RequestDispatcher {
    client: Arc<ModbusClient>,
    registry: Arc<Registry>,
    scheduler: Arc<Scheduler>,
    slots: Mutex<SlotTable>,
    governor: FailureGovernor,
    stats: Arc<PollingStats>,
    reply_tx: mpsc::Sender<SampleReply>,
    timeout: Duration,
}

impl RequestDispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: Arc<ModbusClient>,
        registry: Arc<Registry>,
        scheduler: Arc<Scheduler>,
        governor: FailureGovernor,
        stats: Arc<PollingStats>,
        reply_tx: mpsc::Sender<SampleReply>,
        timeout: Duration,
        slot_capacity: usize,
    ) -> Self {
        Self {
            client,
            registry,
            scheduler,
            slots: Mutex::new(SlotTable::new(slot_capacity)),
            governor,
            stats,
            reply_tx,
            timeout,
        }
    }

    /// Handle one due `(slave, sensor)` event end to end.
    pub async fn dispatch(&self, slave_id: u8, sensor_id: u8) {
        let Some(descriptor) = self.registry.sensor(slave_id, sensor_id) else {
            warn!(
                "no descriptor for slave {} sensor {}, skipping",
                slave_id, sensor_id
            );
            return;
        };

        let token = self.client.allocate_token();
        self.slots.lock().insert(RequestSlot {
            token,
            slave_id,
            sensor_id,
            function_code: 3,
            kind: RequestKind::Sampling,
        });

        let started = Instant::now();
        let result = self
            .client
            .transfer_with_token(
                token,
                slave_id,
                3,
                descriptor.start_address,
                descriptor.max_registers,
                self.timeout,
            )
            .await;
        let elapsed_ms = started.elapsed().as_secs_f64() * 1000.0;

        // The slot may have been invalidated by an eviction that happened
        // while this request was on the wire.
        let slot = self.slots.lock().take(token);

        match result {
            Ok(payload) => {
                if slot.is_none() {
                    debug!(
                        "late completion from evicted slave {} dropped (token {})",
                        slave_id, token
                    );
                    return;
                }
                self.stats.record(slave_id, true, elapsed_ms, None);
                self.registry.record_success(slave_id);

                let reply = SampleReply {
                    slave_id,
                    descriptor,
                    payload,
                };
                if self.reply_tx.try_send(reply).is_err() {
                    warn!("reply queue full, sample from slave {} dropped", slave_id);
                }
            }
            Err(error) => {
                self.stats
                    .record(slave_id, false, elapsed_ms, Some(error.to_string()));
                info!(
                    "sampling read failed for slave {} sensor {}: {}",
                    slave_id, sensor_id, error
                );
                if slot.is_some() && error.is_slave_fault() {
                    self.governor
                        .on_failure(&self.registry, &self.scheduler, &self.slots, slave_id);
                }
            }
        }
    }

    /// Scheduler loop: rebuild when dirty, fire due entries, sleep until the
    /// next deadline.
    pub async fn run(
        self: Arc<Self>,
        mut shutdown: tokio::sync::watch::Receiver<bool>,
    ) -> Result<()> {
        loop {
            if *shutdown.borrow() {
                break;
            }
            if self.scheduler.is_dirty() {
                self.scheduler.rebuild(&self.registry);
            }

            if self.scheduler.is_paused() {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(100)) => continue,
                    _ = shutdown.changed() => break,
                }
            }

            let (due, sleep) = self.scheduler.collect_due();
            for (slave_id, sensor_id) in due {
                if self.scheduler.is_paused() {
                    break;
                }
                self.dispatch(slave_id, sensor_id).await;
            }

            tokio::select! {
                _ = tokio::time::sleep(sleep) => {}
                _ = shutdown.changed() => break,
            }
        }
        debug!("dispatcher stopped");
        Ok(())
    }
}
