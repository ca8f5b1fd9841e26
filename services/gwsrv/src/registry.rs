//! Discovered slave registry.
//!
//! The registry owns every `SlaveState`. Scheduler entries refer to slaves by
//! numeric id and look descriptors up here, so eviction is a plain removal
//! with no dangling references.

use std::collections::HashMap;

use field_modbus::SensorDescriptor;
use parking_lot::Mutex;
use tracing::{debug, info};

/// One discovered acquisition unit.
#[derive(Debug, Clone)]
pub struct SlaveState {
    pub slave_id: u8,
    pub sensors: Vec<SensorDescriptor>,
    pub consecutive_fails: u32,
}

/// Shared slave table.
#[derive(Debug, Default)]
pub struct Registry {
    slaves: Mutex<HashMap<u8, SlaveState>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or update a sensor under a slave, creating the slave on first
    /// discovery. An existing sensor with the same id is replaced.
    pub fn upsert_sensor(&self, slave_id: u8, descriptor: SensorDescriptor) {
        let mut slaves = self.slaves.lock();
        let state = slaves.entry(slave_id).or_insert_with(|| {
            info!("slave {} joins the registry", slave_id);
            SlaveState {
                slave_id,
                sensors: Vec::new(),
                consecutive_fails: 0,
            }
        });

        match state
            .sensors
            .iter_mut()
            .find(|s| s.sensor_id == descriptor.sensor_id)
        {
            Some(existing) => {
                debug!(
                    "slave {} sensor {} descriptor updated",
                    slave_id, descriptor.sensor_id
                );
                *existing = descriptor;
            }
            None => state.sensors.push(descriptor),
        }
    }

    pub fn contains(&self, slave_id: u8) -> bool {
        self.slaves.lock().contains_key(&slave_id)
    }

    /// Remove a slave entirely. Returns false when it was not present.
    pub fn remove(&self, slave_id: u8) -> bool {
        let removed = self.slaves.lock().remove(&slave_id).is_some();
        if removed {
            info!("slave {} removed from the registry", slave_id);
        }
        removed
    }

    pub fn sensor(&self, slave_id: u8, sensor_id: u8) -> Option<SensorDescriptor> {
        self.slaves
            .lock()
            .get(&slave_id)
            .and_then(|s| s.sensors.iter().find(|d| d.sensor_id == sensor_id))
            .copied()
    }

    /// Reset the failure count after a successful exchange.
    pub fn record_success(&self, slave_id: u8) {
        if let Some(state) = self.slaves.lock().get_mut(&slave_id) {
            state.consecutive_fails = 0;
        }
    }

    /// Bump the failure count; returns the new value, or 0 for unknown slaves.
    pub fn record_failure(&self, slave_id: u8) -> u32 {
        match self.slaves.lock().get_mut(&slave_id) {
            Some(state) => {
                state.consecutive_fails += 1;
                state.consecutive_fails
            }
            None => 0,
        }
    }

    /// Stable snapshot of all `(slave, sensor)` pairs for a scheduler
    /// rebuild, ordered by slave id then discovery order.
    pub fn schedule_snapshot(&self) -> Vec<(u8, SensorDescriptor)> {
        let slaves = self.slaves.lock();
        let mut ids: Vec<u8> = slaves.keys().copied().collect();
        ids.sort_unstable();

        let mut out = Vec::new();
        for id in ids {
            for sensor in &slaves[&id].sensors {
                out.push((id, *sensor));
            }
        }
        out
    }

    pub fn slave_ids(&self) -> Vec<u8> {
        let mut ids: Vec<u8> = self.slaves.lock().keys().copied().collect();
        ids.sort_unstable();
        ids
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use field_modbus::DataType;

    fn descriptor(sensor_id: u8, start_address: u16) -> SensorDescriptor {
        SensorDescriptor {
            sensor_id,
            channels: 1,
            start_address,
            max_registers: 6,
            sampling_interval_ms: 1000,
            data_type: DataType::Uint16,
            scale: 0,
            packed_bits: 0,
        }
    }

    #[test]
    fn upsert_replaces_by_sensor_id() {
        let registry = Registry::new();
        registry.upsert_sensor(5, descriptor(2, 10));
        registry.upsert_sensor(5, descriptor(2, 20));
        registry.upsert_sensor(5, descriptor(1, 30));

        let snapshot = registry.schedule_snapshot();
        assert_eq!(snapshot.len(), 2);
        assert_eq!(registry.sensor(5, 2).unwrap().start_address, 20);
    }

    #[test]
    fn failure_count_resets_on_success() {
        let registry = Registry::new();
        registry.upsert_sensor(5, descriptor(2, 10));

        assert_eq!(registry.record_failure(5), 1);
        assert_eq!(registry.record_failure(5), 2);
        registry.record_success(5);
        assert_eq!(registry.record_failure(5), 1);
    }

    #[test]
    fn remove_unknown_is_false() {
        let registry = Registry::new();
        assert!(!registry.remove(9));
    }

    #[test]
    fn snapshot_is_ordered_by_slave() {
        let registry = Registry::new();
        registry.upsert_sensor(7, descriptor(1, 10));
        registry.upsert_sensor(3, descriptor(2, 10));

        let ids: Vec<u8> = registry.schedule_snapshot().iter().map(|(s, _)| *s).collect();
        assert_eq!(ids, vec![3, 7]);
    }
}
