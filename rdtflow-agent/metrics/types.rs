// Monitoring event kinds and event sets
use std::fmt;

use crate::metric_enum;

metric_enum! {
    /// Declaration order is the canonical poll order; virtual events come last
    pub enum MonEvent {
        LlcOccupancy => "CMTLLCOccupancy",
        LocalMemBandwidth => "LocalMemoryBandwidth",
        TotalMemBandwidth => "TotalMemoryBandwidth",
        LlcMisses => "L3CacheMissNum",
        LlcReferences => "L3CacheRef",
        UnhaltedCycles => "cycles",
        RetiredInstructions => "instructions",
        PcieMissRead => "PCIeMissRead",
        PcieMissWrite => "PCIeMissWrite",
        PcieRefRead => "PCIeRefRead",
        PcieRefWrite => "PCIeRefWrite",
        RemoteMemBandwidth => "RemoteMemoryBandwidth",
        Ipc => "IPC",
    }
}

impl MonEvent {
    /// Derived from other events, never backed by a counter of its own
    pub fn is_virtual(&self) -> bool {
        matches!(self, MonEvent::RemoteMemBandwidth | MonEvent::Ipc)
    }

    /// Real events a virtual event is computed from
    pub fn constituents(&self) -> &'static [MonEvent] {
        match self {
            MonEvent::RemoteMemBandwidth => {
                &[MonEvent::LocalMemBandwidth, MonEvent::TotalMemBandwidth]
            }
            MonEvent::Ipc => &[MonEvent::UnhaltedCycles, MonEvent::RetiredInstructions],
            _ => &[],
        }
    }

    /// IA32_QM_EVTSEL event id for RMID-based events
    pub fn rdt_event_id(&self) -> Option<u8> {
        use rdtflow_raw::current_arch::rdt::events;

        match self {
            MonEvent::LlcOccupancy => Some(events::LLC_OCCUPANCY),
            MonEvent::TotalMemBandwidth => Some(events::TOTAL_MEM_BW),
            MonEvent::LocalMemBandwidth => Some(events::LOCAL_MEM_BW),
            _ => None,
        }
    }

    pub fn is_rdt(&self) -> bool {
        self.rdt_event_id().is_some()
    }

    /// Served by core PMU counters (fixed or general purpose)
    pub fn is_perf(&self) -> bool {
        matches!(
            self,
            MonEvent::LlcMisses
                | MonEvent::LlcReferences
                | MonEvent::UnhaltedCycles
                | MonEvent::RetiredInstructions
        )
    }

    /// Served by socket-level uncore counters
    pub fn is_uncore(&self) -> bool {
        matches!(
            self,
            MonEvent::PcieMissRead
                | MonEvent::PcieMissWrite
                | MonEvent::PcieRefRead
                | MonEvent::PcieRefWrite
        )
    }

    /// Bandwidth style counters report deltas; occupancy is a level
    pub fn is_cumulative(&self) -> bool {
        !matches!(self, MonEvent::LlcOccupancy | MonEvent::Ipc)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::all()
            .into_iter()
            .find(|e| e.name().eq_ignore_ascii_case(name))
    }

    fn bit(&self) -> u32 {
        1 << (*self as u32)
    }
}

impl fmt::Display for MonEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Set of monitoring events, iterated in canonical order
#[derive(Clone, Copy, Default, PartialEq, Eq, Hash)]
pub struct EventSet(u32);

impl EventSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    pub fn contains(&self, event: MonEvent) -> bool {
        self.0 & event.bit() != 0
    }

    pub fn insert(&mut self, event: MonEvent) {
        self.0 |= event.bit();
    }

    pub fn remove(&mut self, event: MonEvent) {
        self.0 &= !event.bit();
    }

    pub fn union(&self, other: EventSet) -> EventSet {
        Self(self.0 | other.0)
    }

    pub fn intersection(&self, other: EventSet) -> EventSet {
        Self(self.0 & other.0)
    }

    pub fn difference(&self, other: EventSet) -> EventSet {
        Self(self.0 & !other.0)
    }

    pub fn is_superset(&self, other: EventSet) -> bool {
        other.0 & !self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = MonEvent> + '_ {
        MonEvent::all().into_iter().filter(move |e| self.contains(*e))
    }

    /// Add the real constituents of every virtual event in the set
    pub fn expand(&self) -> EventSet {
        let mut expanded = *self;
        for event in self.iter() {
            for &constituent in event.constituents() {
                expanded.insert(constituent);
            }
        }
        expanded
    }

    /// Add every virtual event whose constituents are all present
    pub fn with_derivable(&self) -> EventSet {
        let mut derived = *self;
        for event in MonEvent::all().into_iter().filter(MonEvent::is_virtual) {
            if event.constituents().iter().all(|c| self.contains(*c)) {
                derived.insert(event);
            }
        }
        derived
    }

    pub fn filter(&self, pred: impl Fn(&MonEvent) -> bool) -> EventSet {
        self.iter().filter(|e| pred(e)).collect()
    }
}

impl FromIterator<MonEvent> for EventSet {
    fn from_iter<I: IntoIterator<Item = MonEvent>>(iter: I) -> Self {
        let mut set = EventSet::empty();
        for event in iter {
            set.insert(event);
        }
        set
    }
}

impl From<MonEvent> for EventSet {
    fn from(event: MonEvent) -> Self {
        Self(event.bit())
    }
}

impl fmt::Debug for EventSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter().map(|e| e.name())).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_virtual_expansion() {
        let ipc = EventSet::from(MonEvent::Ipc).expand();
        assert!(ipc.contains(MonEvent::UnhaltedCycles));
        assert!(ipc.contains(MonEvent::RetiredInstructions));
        assert_eq!(ipc.len(), 3);

        let remote = EventSet::from(MonEvent::RemoteMemBandwidth).expand();
        assert!(remote.contains(MonEvent::LocalMemBandwidth));
        assert!(remote.contains(MonEvent::TotalMemBandwidth));
        assert!(!remote.contains(MonEvent::LlcOccupancy));
    }

    #[test]
    fn test_canonical_iteration_order() {
        let set: EventSet = [
            MonEvent::Ipc,
            MonEvent::PcieRefWrite,
            MonEvent::TotalMemBandwidth,
            MonEvent::LlcOccupancy,
        ]
        .into_iter()
        .collect();

        let order: Vec<_> = set.iter().collect();
        assert_eq!(
            order,
            vec![
                MonEvent::LlcOccupancy,
                MonEvent::TotalMemBandwidth,
                MonEvent::PcieRefWrite,
                MonEvent::Ipc
            ]
        );
    }

    #[test]
    fn test_derivable_virtual_events() {
        let started: EventSet = [MonEvent::LocalMemBandwidth, MonEvent::TotalMemBandwidth]
            .into_iter()
            .collect();
        let covered = started.with_derivable();
        assert!(covered.contains(MonEvent::RemoteMemBandwidth));
        assert!(!covered.contains(MonEvent::Ipc));
        assert!(covered.is_superset(started));
    }

    #[test]
    fn test_event_classification() {
        assert_eq!(MonEvent::LocalMemBandwidth.rdt_event_id(), Some(3));
        assert_eq!(MonEvent::TotalMemBandwidth.rdt_event_id(), Some(2));
        assert!(MonEvent::LlcReferences.is_perf());
        assert!(MonEvent::PcieMissWrite.is_uncore());
        assert!(!MonEvent::RemoteMemBandwidth.is_rdt());
        assert_eq!(MonEvent::from_name("ipc"), Some(MonEvent::Ipc));
        assert_eq!(MonEvent::from_name("bogus"), None);
    }
}
