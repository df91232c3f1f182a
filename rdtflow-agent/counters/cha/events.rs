// PCIe traffic events counted by the CHA boxes of Skylake-SP
use std::fs;
use std::path::Path;

use rdtflow_raw::current_arch::cha::{
    events as cha_events, filters, umasks, ChaCounterControl, CPU_MODEL_SKX,
};

use crate::common::arch::CpuIdent;
use crate::common::platform::Platform;
use crate::enum_with_data;
use crate::metrics::{EventSet, MonEvent};

pub const SYSFS_DEVICES_ROOT: &str = "/sys/devices";
const CHA_DEVICE_PREFIX: &str = "uncore_cha_";

// Each PCIe event owns counter 0 of one CHA box
enum_with_data! {
    pub enum PcieUnit: usize {
        MissRead => ("MissRead", 0),
        MissWrite => ("MissWrite", 1),
        RefRead => ("RefRead", 2),
        RefWrite => ("RefWrite", 3),
    }
    impl index -> usize
}

impl PcieUnit {
    pub fn event(&self) -> MonEvent {
        match self {
            PcieUnit::MissRead => MonEvent::PcieMissRead,
            PcieUnit::MissWrite => MonEvent::PcieMissWrite,
            PcieUnit::RefRead => MonEvent::PcieRefRead,
            PcieUnit::RefWrite => MonEvent::PcieRefWrite,
        }
    }

    fn is_miss(&self) -> bool {
        matches!(self, PcieUnit::MissRead | PcieUnit::MissWrite)
    }

    fn filter(&self) -> u64 {
        match self {
            PcieUnit::MissRead | PcieUnit::RefRead => filters::PCIE_READ,
            PcieUnit::MissWrite | PcieUnit::RefWrite => filters::PCIE_WRITE,
        }
    }
}

/// Programming of one uncore event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UncoreEventDef {
    pub event: MonEvent,
    /// CHA box index
    pub unit: usize,
    pub control: ChaCounterControl,
    /// Filter 1 value, written only when non-zero
    pub filter1: u64,
}

impl UncoreEventDef {
    fn pcie(unit: PcieUnit) -> Self {
        let unit_mask = if unit.is_miss() {
            umasks::tor::IO_MISS
        } else {
            umasks::tor::IO_HIT
        };

        Self {
            event: unit.event(),
            unit: unit.index(),
            control: ChaCounterControl {
                event_select: cha_events::TOR_INSERTS,
                unit_mask,
                enable: true,
                ..Default::default()
            },
            filter1: unit.filter(),
        }
    }
}

/// Uncore events the running CPU can count
///
/// Built once at startup and owned by the engine.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UncoreTable {
    defs: Vec<UncoreEventDef>,
    unit_count: usize,
}

impl UncoreTable {
    pub fn empty() -> Self {
        Self::default()
    }

    /// Table for a CPU model with `unit_count` CHA boxes
    ///
    /// Events whose box does not exist are left out.
    pub fn for_model(ident: CpuIdent, unit_count: usize) -> Self {
        if ident.family != 6 || ident.model != CPU_MODEL_SKX {
            tracing::info!(
                "No uncore PCIe events for family {:X} model {:X}",
                ident.family,
                ident.model
            );
            return Self::empty();
        }

        let defs: Vec<_> = PcieUnit::all()
            .into_iter()
            .filter(|unit| unit.index() < unit_count)
            .map(UncoreEventDef::pcie)
            .collect();

        if defs.len() < PcieUnit::all().len() {
            tracing::warn!(
                "Only {} CHA units present, {} PCIe events available",
                unit_count,
                defs.len()
            );
        }

        Self { defs, unit_count }
    }

    pub fn discover(platform: &dyn Platform, sysfs_root: &Path) -> Self {
        let ident = CpuIdent::detect(platform);
        let unit_count = count_cha_units(sysfs_root);
        tracing::debug!("Found {} CHA units under {}", unit_count, sysfs_root.display());
        Self::for_model(ident, unit_count)
    }

    pub fn detect(platform: &dyn Platform) -> Self {
        Self::discover(platform, Path::new(SYSFS_DEVICES_ROOT))
    }

    pub fn events(&self) -> impl Iterator<Item = MonEvent> + '_ {
        self.defs.iter().map(|d| d.event)
    }

    pub fn event_set(&self) -> EventSet {
        self.events().collect()
    }

    pub fn event(&self, event: MonEvent) -> Option<&UncoreEventDef> {
        self.defs.iter().find(|d| d.event == event)
    }

    pub fn supports(&self, event: MonEvent) -> bool {
        self.event(event).is_some()
    }

    pub fn unit_count(&self) -> usize {
        self.unit_count
    }
}

fn count_cha_units(root: &Path) -> usize {
    let Ok(entries) = fs::read_dir(root) else {
        return 0;
    };

    entries
        .filter_map(|entry| entry.ok())
        .filter(|entry| {
            entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.starts_with(CHA_DEVICE_PREFIX))
        })
        .count()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn skx() -> CpuIdent {
        CpuIdent {
            family: 6,
            model: CPU_MODEL_SKX,
            stepping: 4,
        }
    }

    #[test]
    fn test_skx_table() {
        let table = UncoreTable::for_model(skx(), 28);
        assert_eq!(table.unit_count(), 28);
        assert_eq!(
            table.events().collect::<Vec<_>>(),
            vec![
                MonEvent::PcieMissRead,
                MonEvent::PcieMissWrite,
                MonEvent::PcieRefRead,
                MonEvent::PcieRefWrite
            ]
        );

        let miss_write = table.event(MonEvent::PcieMissWrite).unwrap();
        assert_eq!(miss_write.unit, 1);
        assert_eq!(miss_write.control.unit_mask, 0x24);
        assert_eq!(miss_write.filter1, 0x1004_9033);

        let ref_read = table.event(MonEvent::PcieRefRead).unwrap();
        assert_eq!(ref_read.control.unit_mask, 0x14);
        assert_eq!(ref_read.filter1, 0x43C33);
    }

    #[test]
    fn test_missing_units_drop_events() {
        let table = UncoreTable::for_model(skx(), 2);
        assert!(table.supports(MonEvent::PcieMissWrite));
        assert!(!table.supports(MonEvent::PcieRefRead));
        assert_eq!(table.event_set().len(), 2);
    }

    #[test]
    fn test_other_models_have_no_events() {
        let icx = CpuIdent {
            family: 6,
            model: 0x6A,
            stepping: 0,
        };
        assert_eq!(UncoreTable::for_model(icx, 40), UncoreTable::empty());
    }

    #[test]
    fn test_count_cha_units() {
        let root = std::env::temp_dir().join(format!("rdtflow-cha-{}", std::process::id()));
        let _ = fs::remove_dir_all(&root);
        for dir in ["uncore_cha_0", "uncore_cha_1", "uncore_cha_2", "uncore_imc_0", "cpu"] {
            fs::create_dir_all(root.join(dir)).unwrap();
        }

        assert_eq!(count_cha_units(&root), 3);
        assert_eq!(count_cha_units(&root.join("missing")), 0);

        let _ = fs::remove_dir_all(&root);
    }
}
