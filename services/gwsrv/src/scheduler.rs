//! Per-sensor sampling scheduler.
//!
//! A flat entry list under one mutex: each tick snapshots the due entries,
//! bumps their deadlines while still holding the lock, then fires them after
//! releasing it. Deadlines are wrapping `u32` milliseconds compared through
//! signed differences, so the 49.7-day wrap is a non-event.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::clock::{ms_is_due, MonotonicClock};
use parking_lot::Mutex;
use tracing::{debug, info};

use crate::registry::Registry;

/// One `(slave, sensor)` sampling cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScheduleEntry {
    pub slave_id: u8,
    pub sensor_id: u8,
    pub interval_ms: u32,
    pub next_due_ms: u32,
}

/// Sleep when the schedule is empty.
const IDLE_SLEEP: Duration = Duration::from_secs(1);
/// Yield when the next deadline is already in the past, so a zero-interval
/// entry cannot starve the executor.
const OVERDUE_YIELD: Duration = Duration::from_millis(10);

pub struct Scheduler {
    entries: Mutex<Vec<ScheduleEntry>>,
    clock: Arc<dyn MonotonicClock>,
    paused: AtomicBool,
    dirty: AtomicBool,
}

impl Scheduler {
    pub fn new(clock: Arc<dyn MonotonicClock>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            clock,
            paused: AtomicBool::new(false),
            dirty: AtomicBool::new(false),
        }
    }

    /// Replace all entries from the registry. New entries are due
    /// immediately.
    pub fn rebuild(&self, registry: &Registry) {
        let now = self.clock.now_ms();
        let mut entries = self.entries.lock();
        entries.clear();
        for (slave_id, descriptor) in registry.schedule_snapshot() {
            entries.push(ScheduleEntry {
                slave_id,
                sensor_id: descriptor.sensor_id,
                interval_ms: descriptor.derived_interval_ms(),
                next_due_ms: now,
            });
        }
        self.dirty.store(false, Ordering::SeqCst);
        info!("scheduler rebuilt with {} entries", entries.len());
    }

    /// Flag that the registry changed; the run loop rebuilds before its next
    /// tick.
    pub fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    /// Drop every entry belonging to a slave.
    pub fn remove_slave(&self, slave_id: u8) {
        let mut entries = self.entries.lock();
        entries.retain(|e| e.slave_id != slave_id);
        debug!(
            "entries for slave {} dropped, {} remain",
            slave_id,
            entries.len()
        );
    }

    pub fn pause(&self) {
        self.paused.store(true, Ordering::SeqCst);
        info!("scheduler paused");
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::SeqCst);
        info!("scheduler resumed");
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn entry_count(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn entries_for(&self, slave_id: u8) -> usize {
        self.entries
            .lock()
            .iter()
            .filter(|e| e.slave_id == slave_id)
            .count()
    }

    /// One tick: under the mutex, collect due entries and push their
    /// deadlines forward; outside it the caller dispatches them. Also
    /// returns how long to sleep before the next tick.
    ///
    /// Simultaneously due entries fire in list order, which is stable within
    /// a tick.
    pub fn collect_due(&self) -> (Vec<(u8, u8)>, Duration) {
        let mut entries = self.entries.lock();
        let now = self.clock.now_ms();

        let mut due = Vec::new();
        for entry in entries.iter_mut() {
            if ms_is_due(now, entry.next_due_ms) {
                due.push((entry.slave_id, entry.sensor_id));
                entry.next_due_ms = now.wrapping_add(entry.interval_ms);
            }
        }

        if entries.is_empty() {
            return (due, IDLE_SLEEP);
        }

        let mut min_delta: i32 = i32::MAX;
        for entry in entries.iter() {
            let delta = entry.next_due_ms.wrapping_sub(now) as i32;
            min_delta = min_delta.min(delta);
        }

        let sleep = if min_delta <= 0 {
            OVERDUE_YIELD
        } else {
            Duration::from_millis(min_delta as u64)
        };
        (due, sleep)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use common::clock::ManualClock;
    use field_modbus::{DataType, SensorDescriptor};

    fn descriptor(sensor_id: u8, channels: u8, max_registers: u16, interval: u16) -> SensorDescriptor {
        SensorDescriptor {
            sensor_id,
            channels,
            start_address: 10,
            max_registers,
            sampling_interval_ms: interval,
            data_type: DataType::Uint16,
            scale: 0,
            packed_bits: 0,
        }
    }

    fn scheduler_at(start_ms: u32) -> (Arc<ManualClock>, Scheduler) {
        let clock = Arc::new(ManualClock::new(start_ms));
        let scheduler = Scheduler::new(clock.clone());
        (clock, scheduler)
    }

    #[test]
    fn rebuild_derives_intervals() {
        let (_, scheduler) = scheduler_at(0);
        let registry = Registry::new();
        // 1000 ms x (18 / 3) = 6000 ms
        registry.upsert_sensor(5, descriptor(2, 3, 18, 1000));
        scheduler.rebuild(&registry);

        assert_eq!(scheduler.entry_count(), 1);
        assert_eq!(scheduler.entries.lock()[0].interval_ms, 6000);
    }

    #[test]
    fn fresh_entries_fire_immediately() {
        let (_, scheduler) = scheduler_at(100);
        let registry = Registry::new();
        registry.upsert_sensor(5, descriptor(2, 3, 18, 1000));
        scheduler.rebuild(&registry);

        let (due, _) = scheduler.collect_due();
        assert_eq!(due, vec![(5, 2)]);

        // Just fired: quiet until the interval elapses.
        let (due, sleep) = scheduler.collect_due();
        assert!(due.is_empty());
        assert_eq!(sleep, Duration::from_millis(6000));
    }

    #[test]
    fn deadline_advances_by_interval() {
        let (clock, scheduler) = scheduler_at(0);
        let registry = Registry::new();
        registry.upsert_sensor(5, descriptor(2, 3, 18, 1000));
        scheduler.rebuild(&registry);
        scheduler.collect_due();

        clock.advance(5999);
        let (due, _) = scheduler.collect_due();
        assert!(due.is_empty());

        clock.advance(1);
        let (due, _) = scheduler.collect_due();
        assert_eq!(due, vec![(5, 2)]);
    }

    #[test]
    fn post_tick_deadlines_are_in_the_future() {
        let (clock, scheduler) = scheduler_at(0);
        let registry = Registry::new();
        registry.upsert_sensor(5, descriptor(2, 3, 18, 1000));
        registry.upsert_sensor(6, descriptor(1, 1, 4, 500));
        scheduler.rebuild(&registry);
        clock.advance(10);
        scheduler.collect_due();

        let now = clock.now_ms();
        for entry in scheduler.entries.lock().iter() {
            assert!(!ms_is_due(now, entry.next_due_ms));
        }
    }

    #[test]
    fn wrap_around_still_identifies_due_entry() {
        // Clock sits just below the wrap; the deadline lands past it.
        let (clock, scheduler) = scheduler_at(u32::MAX - 1);
        let registry = Registry::new();
        registry.upsert_sensor(5, descriptor(2, 1, 4, 1000));
        scheduler.rebuild(&registry);
        scheduler.collect_due(); // next_due = (MAX-1) + 4000, wrapped

        clock.advance(u32::MAX); // one full wrap minus one ms
        clock.advance(2);
        // Advancing 2^32 - 1 and then 2 ms lands past the wrapped deadline.
        clock.advance(4000);
        let (due, _) = scheduler.collect_due();
        assert_eq!(due, vec![(5, 2)]);
    }

    #[test]
    fn empty_schedule_sleeps_one_second() {
        let (_, scheduler) = scheduler_at(0);
        let (due, sleep) = scheduler.collect_due();
        assert!(due.is_empty());
        assert_eq!(sleep, IDLE_SLEEP);
    }

    #[test]
    fn zero_interval_entry_yields_instead_of_spinning() {
        let (_, scheduler) = scheduler_at(0);
        let registry = Registry::new();
        registry.upsert_sensor(5, descriptor(2, 0, 0, 0));
        scheduler.rebuild(&registry);

        let (due, sleep) = scheduler.collect_due();
        assert_eq!(due.len(), 1);
        assert_eq!(sleep, OVERDUE_YIELD);
    }

    #[test]
    fn remove_slave_drops_its_entries() {
        let (_, scheduler) = scheduler_at(0);
        let registry = Registry::new();
        registry.upsert_sensor(5, descriptor(2, 3, 18, 1000));
        registry.upsert_sensor(6, descriptor(1, 1, 4, 500));
        scheduler.rebuild(&registry);

        scheduler.remove_slave(5);
        assert_eq!(scheduler.entries_for(5), 0);
        assert_eq!(scheduler.entry_count(), 1);
    }

    #[test]
    fn dirty_flag_round_trips() {
        let (_, scheduler) = scheduler_at(0);
        assert!(!scheduler.is_dirty());
        scheduler.mark_dirty();
        assert!(scheduler.is_dirty());
        scheduler.rebuild(&Registry::new());
        assert!(!scheduler.is_dirty());
    }
}
