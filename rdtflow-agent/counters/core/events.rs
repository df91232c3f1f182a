// Core PMU counters backing the perf events (architecture-aware)

use rdtflow_raw::current_arch::core::{events, msr, GlobalCtrl};

use crate::metrics::{EventSet, MonEvent};

/// Where a perf event is counted on a core
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CounterSlot {
    /// Fixed-function counter with its enable bit in IA32_PERF_GLOBAL_CTRL
    Fixed { counter: u64, enable: u8 },
    /// General purpose counter with its event select register
    General {
        counter: u64,
        evtsel: u64,
        event: (u8, u8),
        enable: u8,
    },
}

impl CounterSlot {
    pub fn for_event(event: MonEvent) -> Option<Self> {
        match event {
            MonEvent::RetiredInstructions => Some(CounterSlot::Fixed {
                counter: msr::IA32_FIXED_CTR0,
                enable: 1 << 0,
            }),
            MonEvent::UnhaltedCycles => Some(CounterSlot::Fixed {
                counter: msr::IA32_FIXED_CTR1,
                enable: 1 << 1,
            }),
            MonEvent::LlcMisses => Some(CounterSlot::General {
                counter: msr::IA32_PMC0,
                evtsel: msr::IA32_PERFEVTSEL0,
                event: events::LLC_MISS,
                enable: 1 << 0,
            }),
            MonEvent::LlcReferences => Some(CounterSlot::General {
                counter: msr::IA32_PMC1,
                evtsel: msr::IA32_PERFEVTSEL1,
                event: events::LLC_REFERENCE,
                enable: 1 << 1,
            }),
            _ => None,
        }
    }

    pub fn counter(&self) -> u64 {
        match self {
            CounterSlot::Fixed { counter, .. } | CounterSlot::General { counter, .. } => *counter,
        }
    }
}

/// Global enable mask covering `events`
///
/// Instructions and cycles are only meaningful together, so either one
/// enables both fixed counters.
pub fn enable_mask(events: EventSet) -> GlobalCtrl {
    let mut mask = GlobalCtrl::default();

    if events.contains(MonEvent::RetiredInstructions) || events.contains(MonEvent::UnhaltedCycles) {
        mask.fixed = 0x3;
    }
    for event in events.iter() {
        if let Some(CounterSlot::General { enable, .. }) = CounterSlot::for_event(event) {
            mask.pmc |= enable;
        }
    }

    mask
}
