//! Monitoring session state
//!
//! A session owns whatever each backend needs to keep counting (bound RMIDs,
//! programmed PMU and CHA counters, external streams) together with the
//! last raw reading of every event. Counter arithmetic happens here so that
//! all backends share one notion of value, delta and first read.

use std::collections::HashMap;

use crate::common::channel::ChannelId;
use crate::counters::cha::UncoreGroup;
use crate::counters::core::PerfCounterGroup;
use crate::counters::rdt::RdtGroup;
use crate::error::{RdtError, Result};
use crate::metrics::calculator::{
    get_delta, ipc, overflowed, remote_delta, remote_value, scale,
};
use crate::metrics::{EventSet, EventValues, MonEvent};
use crate::orchestrator::backend::{Backend, EventStream};

/// What a session monitors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    Cores(Vec<u32>),
    Pids(Vec<u32>),
    Channels(Vec<ChannelId>),
    Sockets(Vec<u32>),
}

impl Target {
    pub fn kind(&self) -> &'static str {
        match self {
            Target::Cores(_) => "cores",
            Target::Pids(_) => "pids",
            Target::Channels(_) => "channels",
            Target::Sockets(_) => "sockets",
        }
    }

    pub fn is_empty(&self) -> bool {
        match self {
            Target::Cores(ids) | Target::Pids(ids) | Target::Sockets(ids) => ids.is_empty(),
            Target::Channels(ids) => ids.is_empty(),
        }
    }
}

/// How a raw reading turns into bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Scaling {
    pub factor: u32,
    pub snc_num: u32,
}

pub struct MonitoringSession {
    pub(crate) target: Target,
    pub(crate) requested: EventSet,
    pub(crate) routes: Vec<(MonEvent, Backend)>,
    pub(crate) rdt: Option<RdtGroup>,
    pub(crate) perf: Option<PerfCounterGroup>,
    pub(crate) uncore: Option<UncoreGroup>,
    pub(crate) external: Vec<(MonEvent, Backend, Box<dyn EventStream>)>,
    raw: HashMap<MonEvent, u64>,
    values: EventValues,
    valid_read: bool,
}

impl MonitoringSession {
    pub(crate) fn new(target: Target, requested: EventSet) -> Self {
        Self {
            target,
            requested,
            routes: Vec::new(),
            rdt: None,
            perf: None,
            uncore: None,
            external: Vec::new(),
            raw: HashMap::new(),
            values: EventValues::new(),
            valid_read: false,
        }
    }

    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Events as requested, virtual ones included
    pub fn events(&self) -> EventSet {
        self.requested
    }

    /// Real events actually counting
    pub fn started(&self) -> EventSet {
        let mut started = EventSet::empty();
        if let Some(rdt) = &self.rdt {
            started = started.union(rdt.events());
        }
        if let Some(perf) = &self.perf {
            started = started.union(perf.events());
        }
        if let Some(uncore) = &self.uncore {
            started = started.union(uncore.events());
        }
        for (event, _, _) in &self.external {
            started.insert(*event);
        }
        started
    }

    pub fn backend(&self, event: MonEvent) -> Option<Backend> {
        self.routes
            .iter()
            .find(|(e, _)| *e == event)
            .map(|(_, backend)| *backend)
    }

    pub fn values(&self) -> &EventValues {
        &self.values
    }

    /// A baseline exists, deltas of the next poll are meaningful
    pub fn valid_read(&self) -> bool {
        self.valid_read
    }

    pub(crate) fn set_valid_read(&mut self, valid: bool) {
        self.valid_read = valid;
    }

    /// Store a raw reading of `event`
    ///
    /// Occupancy is a level: its value is the scaled reading and its delta
    /// stays 0. Every other event keeps the raw reading as value and reports
    /// the (scaled) change since the previous poll, or 0 before a baseline
    /// exists. A 32-bit counter going backwards is reported as overflow and
    /// leaves the stored delta untouched.
    pub(crate) fn record(
        &mut self,
        event: MonEvent,
        raw: u64,
        width: u32,
        scaling: Option<Scaling>,
    ) -> Result<()> {
        let old = self.raw.insert(event, raw);
        let to_bytes = |count: u64| match scaling {
            Some(s) => scale(count, s.factor, s.snc_num),
            None => count,
        };

        if !event.is_cumulative() {
            self.values.set(event, to_bytes(raw), 0);
            return Ok(());
        }

        let Some(old) = old.filter(|_| self.valid_read) else {
            self.values.set(event, raw, 0);
            return Ok(());
        };

        if overflowed(width, old, raw) {
            tracing::warn!("{} counter went from {} to {}", event, old, raw);
            self.values.set(event, raw, self.values.delta(event));
            return Err(RdtError::Overflow(event));
        }

        self.values
            .set(event, raw, to_bytes(get_delta(old, raw, width)));
        Ok(())
    }

    /// Fill in requested virtual events from their polled constituents
    pub(crate) fn derive_virtual(&mut self, total_width: u32) {
        if self.requested.contains(MonEvent::RemoteMemBandwidth) {
            let total = self.values.get(MonEvent::TotalMemBandwidth).unwrap_or_default();
            let local = self.values.get(MonEvent::LocalMemBandwidth).unwrap_or_default();
            self.values.set(
                MonEvent::RemoteMemBandwidth,
                remote_value(total.value, local.value, total_width),
                remote_delta(total.delta, local.delta),
            );
        }

        if self.requested.contains(MonEvent::Ipc) {
            let ratio = ipc(
                self.values.delta(MonEvent::RetiredInstructions),
                self.values.delta(MonEvent::UnhaltedCycles),
            );
            self.values.set_ipc(ratio);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MBM: Scaling = Scaling {
        factor: 64,
        snc_num: 1,
    };

    fn session(events: &[MonEvent]) -> MonitoringSession {
        MonitoringSession::new(Target::Cores(vec![0]), events.iter().copied().collect())
    }

    #[test]
    fn test_first_read_reports_zero_delta() {
        let mut s = session(&[MonEvent::TotalMemBandwidth]);
        s.record(MonEvent::TotalMemBandwidth, 5000, 24, Some(MBM)).unwrap();
        assert_eq!(s.values().delta(MonEvent::TotalMemBandwidth), 0);
        assert_eq!(s.values().value(MonEvent::TotalMemBandwidth), 5000);

        s.set_valid_read(true);
        s.record(MonEvent::TotalMemBandwidth, 5010, 24, Some(MBM)).unwrap();
        assert_eq!(s.values().delta(MonEvent::TotalMemBandwidth), 640);
    }

    #[test]
    fn test_wrap_and_snc_scaling() {
        let mut s = session(&[MonEvent::LocalMemBandwidth]);
        let snc = Scaling {
            factor: 64,
            snc_num: 2,
        };
        s.record(MonEvent::LocalMemBandwidth, 16_777_200, 24, Some(snc)).unwrap();
        s.set_valid_read(true);
        s.record(MonEvent::LocalMemBandwidth, 50, 24, Some(snc)).unwrap();
        assert_eq!(s.values().delta(MonEvent::LocalMemBandwidth), 66 * 64 / 2);
    }

    #[test]
    fn test_occupancy_is_scaled_level() {
        let mut s = session(&[MonEvent::LlcOccupancy]);
        s.record(MonEvent::LlcOccupancy, 100, 24, Some(MBM)).unwrap();
        assert_eq!(s.values().value(MonEvent::LlcOccupancy), 6400);
        assert_eq!(s.values().delta(MonEvent::LlcOccupancy), 0);
    }

    #[test]
    fn test_32bit_overflow() {
        let mut s = session(&[MonEvent::TotalMemBandwidth]);
        s.record(MonEvent::TotalMemBandwidth, 1000, 32, Some(MBM)).unwrap();
        s.set_valid_read(true);
        s.record(MonEvent::TotalMemBandwidth, 1100, 32, Some(MBM)).unwrap();

        let err = s
            .record(MonEvent::TotalMemBandwidth, 10, 32, Some(MBM))
            .unwrap_err();
        assert!(matches!(err, RdtError::Overflow(MonEvent::TotalMemBandwidth)));
        assert_eq!(s.values().delta(MonEvent::TotalMemBandwidth), 6400);
        assert_eq!(s.values().value(MonEvent::TotalMemBandwidth), 10);

        // 24-bit counters wrap normally
        s.record(MonEvent::LocalMemBandwidth, 1000, 24, Some(MBM)).unwrap();
        s.record(MonEvent::LocalMemBandwidth, 10, 24, Some(MBM)).unwrap();
    }

    #[test]
    fn test_virtual_events() {
        let mut s = session(&[MonEvent::RemoteMemBandwidth, MonEvent::Ipc]);
        for (event, first, second) in [
            (MonEvent::TotalMemBandwidth, 100, 150),
            (MonEvent::LocalMemBandwidth, 40, 60),
            (MonEvent::RetiredInstructions, 0, 3000),
            (MonEvent::UnhaltedCycles, 0, 2000),
        ] {
            let scaling = event.is_rdt().then_some(MBM);
            s.record(event, first, 24, scaling).unwrap();
            s.set_valid_read(true);
            s.record(event, second, 24, scaling).unwrap();
            s.set_valid_read(false);
        }
        s.derive_virtual(24);

        let remote = s.values().get(MonEvent::RemoteMemBandwidth).unwrap();
        assert_eq!(remote.value, 90);
        assert_eq!(remote.delta, (50 - 20) * 64);
        assert_eq!(s.values().ipc(), 1.5);
    }

    #[test]
    fn test_target_kind() {
        assert_eq!(Target::Channels(vec![1]).kind(), "channels");
        assert!(Target::Sockets(Vec::new()).is_empty());
        assert!(!Target::Pids(vec![42]).is_empty());
    }
}
