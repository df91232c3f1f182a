// CHA counter programming for socket-wide PCIe traffic
//
// One representative core per socket drives the uncore boxes of its socket.
// Every event owns counter 0 of its own box, so events never share control
// registers and can be started and read independently.

use rdtflow_raw::current_arch::cha::{msr, ChaBoxControl};

use crate::common::platform::{write_reg, Platform};
use crate::common::topology::CpuTopology;
use crate::counters::cha::{UncoreEventDef, UncoreTable};
use crate::error::{RdtError, Result};
use crate::metrics::calculator::accumulate;
use crate::metrics::{EventSet, MonEvent};

/// CHA counters are 48 bits wide
pub const UNCORE_COUNTER_WIDTH: u32 = 48;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Programmed {
    socket: u32,
    lcore: u32,
    def: UncoreEventDef,
}

/// Uncore events of one session
#[derive(Debug, Default)]
pub struct UncoreGroup {
    programmed: Vec<Programmed>,
}

impl UncoreGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> EventSet {
        self.programmed.iter().map(|p| p.def.event).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.programmed.is_empty()
    }

    /// Program `event` on every socket in `sockets`
    ///
    /// A failed write aborts the sequence and leaves the box half
    /// programmed; the unit is still tracked so that [`UncoreGroup::stop`]
    /// returns it to a frozen, reset state.
    pub fn start(
        &mut self,
        platform: &dyn Platform,
        topology: &CpuTopology,
        table: &UncoreTable,
        sockets: &[u32],
        event: MonEvent,
    ) -> Result<()> {
        let def = *table
            .event(event)
            .ok_or_else(|| RdtError::Unsupported(format!("Uncore event {event}")))?;

        for &socket in sockets {
            let lcore = topology.one_by_socket(socket)?;
            self.programmed.push(Programmed { socket, lcore, def });
            program(platform, lcore, &def)?;
            tracing::debug!("Programmed {} on socket {} via core {}", event, socket, lcore);
        }

        Ok(())
    }

    /// Counter 0 of the event's box, summed over sockets
    pub fn read(&self, platform: &dyn Platform, event: MonEvent) -> Result<u64> {
        let mut sum: u64 = 0;
        let mut found = false;

        for p in self.programmed.iter().filter(|p| p.def.event == event) {
            let raw = platform.read_msr(p.lcore, msr::counter0(p.def.unit))?;
            sum = accumulate(sum, raw, UNCORE_COUNTER_WIDTH);
            found = true;
        }

        if !found {
            return Err(RdtError::InvalidParameter(format!(
                "Uncore event {event} was not started"
            )));
        }
        Ok(sum)
    }

    /// Freeze and clear every programmed box, exactly once
    pub fn stop(&mut self, platform: &dyn Platform) -> Result<()> {
        let mut first_err = None;

        for p in self.programmed.drain(..) {
            let result = write_reg(
                platform,
                p.lcore,
                msr::box_ctl(p.def.unit),
                &ChaBoxControl::RESET_CONTROL,
            );
            if let Err(e) = result {
                tracing::error!(
                    "Failed to reset {} unit on socket {}: {}",
                    p.def.event,
                    p.socket,
                    e
                );
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn program(platform: &dyn Platform, lcore: u32, def: &UncoreEventDef) -> Result<()> {
    let box_ctl = msr::box_ctl(def.unit);

    write_reg(platform, lcore, box_ctl, &ChaBoxControl::UNFREEZE)?;
    write_reg(platform, lcore, box_ctl, &ChaBoxControl::FREEZE)?;
    write_reg(platform, lcore, msr::counter_ctl0(def.unit), &def.control)?;
    if def.filter1 != 0 {
        platform.write_msr(lcore, msr::filter1(def.unit), def.filter1)?;
    }
    write_reg(platform, lcore, box_ctl, &ChaBoxControl::RESET_COUNTERS)?;
    write_reg(platform, lcore, box_ctl, &ChaBoxControl::UNFREEZE)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::arch::CpuIdent;
    use crate::common::mock::MockPlatform;
    use crate::common::topology::tests::two_socket;

    fn table() -> UncoreTable {
        UncoreTable::for_model(
            CpuIdent {
                family: 6,
                model: 0x55,
                stepping: 4,
            },
            28,
        )
    }

    #[test]
    fn test_programming_sequence() {
        let platform = MockPlatform::new();
        let mut group = UncoreGroup::new();
        group
            .start(&platform, &two_socket(), &table(), &[1], MonEvent::PcieMissWrite)
            .unwrap();

        assert_eq!(
            platform.writes(),
            vec![
                (4, 0xE10, 0x10000),
                (4, 0xE10, 0x10100),
                (4, 0xE11, 0x402435),
                (4, 0xE16, 0x1004_9033),
                (4, 0xE10, 0x10102),
                (4, 0xE10, 0x10000),
            ]
        );
        assert_eq!(group.events(), MonEvent::PcieMissWrite.into());
    }

    #[test]
    fn test_read_sums_sockets() {
        let platform = MockPlatform::new();
        let mut group = UncoreGroup::new();
        group
            .start(&platform, &two_socket(), &table(), &[0, 1], MonEvent::PcieRefRead)
            .unwrap();

        platform.set_msr(0, 0xE28, 1000);
        platform.set_msr(4, 0xE28, 24);
        assert_eq!(group.read(&platform, MonEvent::PcieRefRead).unwrap(), 1024);

        let half = 1u64 << 47;
        platform.set_msr(0, 0xE28, half + 10);
        platform.set_msr(4, 0xE28, half + 20);
        assert_eq!(group.read(&platform, MonEvent::PcieRefRead).unwrap(), 30);
        assert!(matches!(
            group.read(&platform, MonEvent::PcieMissRead),
            Err(RdtError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_stop_is_idempotent() {
        let platform = MockPlatform::new();
        let topo = two_socket();
        let mut group = UncoreGroup::new();
        group
            .start(&platform, &topo, &table(), &[0, 1], MonEvent::PcieMissRead)
            .unwrap();
        group
            .start(&platform, &topo, &table(), &[0], MonEvent::PcieRefWrite)
            .unwrap();
        platform.clear_writes();

        group.stop(&platform).unwrap();
        assert_eq!(
            platform.writes(),
            vec![(0, 0xE00, 0x10101), (4, 0xE00, 0x10101), (0, 0xE30, 0x10101)]
        );

        platform.clear_writes();
        group.stop(&platform).unwrap();
        assert!(platform.writes().is_empty());
        assert!(group.is_empty());
    }

    #[test]
    fn test_failed_start_is_still_reset_by_stop() {
        let platform = MockPlatform::new();
        platform.fail_write(4, 0xE11);
        let mut group = UncoreGroup::new();

        let err = group
            .start(&platform, &two_socket(), &table(), &[0, 1], MonEvent::PcieMissWrite)
            .unwrap_err();
        assert!(matches!(err, RdtError::Msr(_)));

        platform.clear_writes();
        group.stop(&platform).unwrap();
        assert_eq!(
            platform.writes(),
            vec![(0, 0xE10, 0x10101), (4, 0xE10, 0x10101)]
        );
    }

    #[test]
    fn test_unknown_event_is_unsupported() {
        let platform = MockPlatform::new();
        let mut group = UncoreGroup::new();
        let err = group
            .start(&platform, &two_socket(), &UncoreTable::empty(), &[0], MonEvent::PcieMissRead)
            .unwrap_err();
        assert!(err.is_unsupported());
        assert!(platform.writes().is_empty());
    }
}
