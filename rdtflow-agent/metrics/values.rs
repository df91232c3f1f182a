use std::collections::HashMap;

use crate::metrics::types::MonEvent;

/// Last raw reading and the calibrated change since the previous poll
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CounterValue {
    pub value: u64,
    pub delta: u64,
}

/// Accumulated values of one monitoring session
#[derive(Debug, Clone, Default)]
pub struct EventValues {
    counters: HashMap<MonEvent, CounterValue>,
    ipc: f64,
}

impl EventValues {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, event: MonEvent) -> Option<CounterValue> {
        self.counters.get(&event).copied()
    }

    pub fn value(&self, event: MonEvent) -> u64 {
        self.get(event).map(|c| c.value).unwrap_or(0)
    }

    pub fn delta(&self, event: MonEvent) -> u64 {
        self.get(event).map(|c| c.delta).unwrap_or(0)
    }

    pub fn set(&mut self, event: MonEvent, value: u64, delta: u64) {
        self.counters.insert(event, CounterValue { value, delta });
    }

    pub fn ipc(&self) -> f64 {
        self.ipc
    }

    pub fn set_ipc(&mut self, ipc: f64) {
        self.ipc = ipc;
    }

    /// Gauge value exported for `event`: deltas for cumulative counters,
    /// the level for occupancy and the ratio for IPC
    pub fn reading(&self, event: MonEvent) -> f64 {
        match event {
            MonEvent::Ipc => self.ipc,
            e if e.is_cumulative() => self.delta(e) as f64,
            e => self.value(e) as f64,
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (MonEvent, CounterValue)> + '_ {
        self.counters.iter().map(|(e, c)| (*e, *c))
    }
}
