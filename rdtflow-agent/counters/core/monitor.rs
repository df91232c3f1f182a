use rdtflow_raw::current_arch::core::{
    msr, CorePerfEvtSel, FixedCounterMode, FixedCtrCtrl, GlobalCtrl,
};

use crate::common::platform::{read_reg, write_reg, Platform};
use crate::counters::core::events::{enable_mask, CounterSlot};
use crate::error::{RdtError, Result};
use crate::metrics::calculator::accumulate;
use crate::metrics::{EventSet, MonEvent};

/// Core PMU counters are read as full 64-bit values
pub const PERF_COUNTER_WIDTH: u32 = 64;

/// Core PMU counters of one session, programmed directly through MSRs
#[derive(Debug)]
pub struct PerfCounterGroup {
    cores: Vec<u32>,
    events: EventSet,
    mask: GlobalCtrl,
}

impl PerfCounterGroup {
    pub fn start(platform: &dyn Platform, cores: &[u32], events: EventSet) -> Result<Self> {
        let events = events.filter(MonEvent::is_perf);
        if events.is_empty() || cores.is_empty() {
            return Err(RdtError::InvalidParameter(
                "No core PMU events or cores to program".to_string(),
            ));
        }

        let mask = enable_mask(events);

        // Other users of the PMU are not stopped, only reported
        for &lcore in cores {
            let current: GlobalCtrl = read_reg(platform, lcore, msr::IA32_PERF_GLOBAL_CTRL)?;
            if current.pmc & mask.pmc != 0 || current.fixed & mask.fixed != 0 {
                tracing::warn!(
                    "Core {} PMU counters already enabled ({:?}), hijacking",
                    lcore,
                    current
                );
            }
        }

        let mut group = Self {
            cores: Vec::with_capacity(cores.len()),
            events,
            mask,
        };

        for &lcore in cores {
            group.cores.push(lcore);
            if let Err(e) = group.program_core(platform, lcore) {
                if let Err(unwind) = group.disable_all(platform) {
                    tracing::warn!("Failed to disable PMU after aborted start: {}", unwind);
                }
                return Err(e);
            }
        }

        tracing::info!("Programmed core PMU for {:?} on cores {:?}", events, cores);
        Ok(group)
    }

    fn program_core(&self, platform: &dyn Platform, lcore: u32) -> Result<()> {
        write_reg(platform, lcore, msr::IA32_PERF_GLOBAL_CTRL, &GlobalCtrl::default())?;

        if self.mask.fixed != 0 {
            platform.write_msr(lcore, msr::IA32_FIXED_CTR0, 0)?;
            platform.write_msr(lcore, msr::IA32_FIXED_CTR1, 0)?;
        }
        for event in self.events.iter() {
            if let Some(slot @ CounterSlot::General { .. }) = CounterSlot::for_event(event) {
                platform.write_msr(lcore, slot.counter(), 0)?;
            }
        }

        if self.mask.fixed != 0 {
            let ctrl = FixedCtrCtrl {
                instructions: FixedCounterMode::USR_OS,
                cycles: FixedCounterMode::USR_OS,
            };
            write_reg(platform, lcore, msr::IA32_FIXED_CTR_CTRL, &ctrl)?;
        }
        for event in self.events.iter() {
            if let Some(CounterSlot::General { evtsel, event: code, .. }) = CounterSlot::for_event(event)
            {
                write_reg(platform, lcore, evtsel, &CorePerfEvtSel::counting(code))?;
            }
        }

        write_reg(platform, lcore, msr::IA32_PERF_GLOBAL_CTRL, &self.mask)
    }

    pub fn events(&self) -> EventSet {
        self.events
    }

    /// Counter of `event` summed over the group's cores
    pub fn read(&self, platform: &dyn Platform, event: MonEvent) -> Result<u64> {
        let slot = CounterSlot::for_event(event)
            .filter(|_| self.events.contains(event))
            .ok_or_else(|| {
                RdtError::InvalidParameter(format!("{event} is not counted by this group"))
            })?;

        let mut sum: u64 = 0;
        for &lcore in &self.cores {
            let raw = platform.read_msr(lcore, slot.counter())?;
            sum = accumulate(sum, raw, PERF_COUNTER_WIDTH);
        }
        Ok(sum)
    }

    fn disable_all(&self, platform: &dyn Platform) -> Result<()> {
        let mut first_err = None;
        for &lcore in &self.cores {
            let result = write_reg(
                platform,
                lcore,
                msr::IA32_PERF_GLOBAL_CTRL,
                &GlobalCtrl::default(),
            );
            if let Err(e) = result {
                tracing::error!("Failed to disable PMU on core {}: {}", lcore, e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub fn stop(self, platform: &dyn Platform) -> Result<()> {
        self.disable_all(platform)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::mock::MockPlatform;

    fn ipc() -> EventSet {
        EventSet::from(MonEvent::Ipc).expand()
    }

    #[test]
    fn test_ipc_programming() {
        let platform = MockPlatform::new();
        let group = PerfCounterGroup::start(&platform, &[2], ipc()).unwrap();

        assert_eq!(
            group.events(),
            [MonEvent::UnhaltedCycles, MonEvent::RetiredInstructions]
                .into_iter()
                .collect::<EventSet>()
        );
        assert_eq!(
            platform.writes(),
            vec![
                (2, 0x38F, 0),
                (2, 0x309, 0),
                (2, 0x30A, 0),
                (2, 0x38D, 0x33),
                (2, 0x38F, 0x3 << 32),
            ]
        );
    }

    #[test]
    fn test_llc_programming() {
        let platform = MockPlatform::new();
        let events = [MonEvent::LlcMisses, MonEvent::LlcReferences].into_iter().collect();
        PerfCounterGroup::start(&platform, &[0], events).unwrap();

        assert_eq!(platform.msr(0, 0x186), 0x43_412E);
        assert_eq!(platform.msr(0, 0x187), 0x43_4F2E);
        assert_eq!(platform.msr(0, 0x38F), 0x3);
        assert!(platform.writes_to(0x38D).is_empty());
    }

    #[test]
    fn test_busy_counters_are_taken_over() {
        let platform = MockPlatform::new();
        platform.set_msr(1, 0x38F, 0x3 << 32);

        let group = PerfCounterGroup::start(&platform, &[1], ipc()).unwrap();
        assert_eq!(platform.msr(1, 0x38F), 0x3 << 32);
        group.stop(&platform).unwrap();
        assert_eq!(platform.msr(1, 0x38F), 0);
    }

    #[test]
    fn test_read_sums_cores() {
        let platform = MockPlatform::new();
        let group = PerfCounterGroup::start(&platform, &[0, 1], ipc()).unwrap();

        platform.set_msr(0, 0x309, 300);
        platform.set_msr(1, 0x309, 200);
        platform.set_msr(0, 0x30A, 1000);
        assert_eq!(group.read(&platform, MonEvent::RetiredInstructions).unwrap(), 500);
        assert_eq!(group.read(&platform, MonEvent::UnhaltedCycles).unwrap(), 1000);
        assert!(matches!(
            group.read(&platform, MonEvent::LlcMisses),
            Err(RdtError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_failed_start_disables_programmed_cores() {
        let platform = MockPlatform::new();
        platform.fail_write(1, 0x38D);

        let err = PerfCounterGroup::start(&platform, &[0, 1], ipc()).unwrap_err();
        assert!(matches!(err, RdtError::Msr(_)));
        assert_eq!(platform.msr(0, 0x38F), 0);
        assert_eq!(platform.msr(1, 0x38F), 0);
    }

    #[test]
    fn test_requires_perf_events() {
        let platform = MockPlatform::new();
        assert!(matches!(
            PerfCounterGroup::start(&platform, &[0], MonEvent::LlcOccupancy.into()),
            Err(RdtError::InvalidParameter(_))
        ));
    }
}
