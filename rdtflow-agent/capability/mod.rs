//! Platform capability discovery
//!
//! Everything the engine knows about the machine's monitoring and allocation
//! features is collected once into a [`CapabilityDescriptor`]. The descriptor
//! is a plain value: reconfiguration (an SNC mode switch, I/O monitoring
//! toggled) builds a new one instead of patching fields.

pub mod allocation;
pub mod mba;
pub mod monitoring;
pub mod strategy;

use std::fmt;
use std::str::FromStr;

use crate::common::platform::Platform;
use crate::common::topology::CpuTopology;
use crate::config::EngineConfig;
use crate::counters::cha::UncoreTable;
use crate::error::{RdtError, Result};
use crate::metrics::calculator::DEFAULT_COUNTER_WIDTH;
use crate::metrics::{EventSet, MonEvent};

pub use allocation::discover_allocation;
pub use mba::discover_mba;
pub use monitoring::discover_monitoring;
pub use strategy::{DetectContext, DetectionStrategy};

/// How RMIDs are shared between the sub-NUMA clusters of a socket
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SncMode {
    /// Each cluster owns a slice of the RMID space
    #[default]
    Local,
    /// Every cluster sees the full RMID space
    Total,
}

impl SncMode {
    pub fn name(&self) -> &'static str {
        match self {
            SncMode::Local => "local",
            SncMode::Total => "total",
        }
    }
}

impl fmt::Display for SncMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for SncMode {
    type Err = RdtError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "local" => Ok(SncMode::Local),
            "total" => Ok(SncMode::Total),
            other => Err(RdtError::InvalidParameter(format!(
                "Unknown SNC mode '{other}' (expected local or total)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SncInfo {
    /// Clusters per socket
    pub num: u32,
    pub mode: SncMode,
}

impl Default for SncInfo {
    fn default() -> Self {
        Self {
            num: 1,
            mode: SncMode::Local,
        }
    }
}

/// Metadata of one monitoring event
///
/// Core PMU and uncore events carry zeroes for the RMID related fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MonitorEventCap {
    pub event: MonEvent,
    pub max_rmid: u32,
    /// Bytes per raw counter unit
    pub scale_factor: u32,
    pub counter_width: u32,
    pub io_tagging: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MonitoringCapability {
    pub max_rmid: u32,
    pub l3_size: u64,
    pub events: Vec<MonitorEventCap>,
    pub snc: SncInfo,
    /// I/O RDT monitoring present
    pub iordt: bool,
    /// I/O RDT monitoring currently enabled
    pub iordt_on: bool,
}

impl MonitoringCapability {
    pub fn event(&self, event: MonEvent) -> Option<&MonitorEventCap> {
        self.events.iter().find(|e| e.event == event)
    }

    pub fn supports(&self, event: MonEvent) -> bool {
        self.event(event).is_some()
    }

    pub fn event_set(&self) -> EventSet {
        self.events.iter().map(|e| e.event).collect()
    }

    pub fn counter_width(&self, event: MonEvent) -> u32 {
        match self.event(event) {
            Some(cap) if cap.counter_width > 0 => cap.counter_width,
            _ => DEFAULT_COUNTER_WIDTH,
        }
    }

    pub fn scale_factor(&self, event: MonEvent) -> u32 {
        self.event(event).map(|e| e.scale_factor).unwrap_or(0)
    }
}

/// Cache allocation (CAT) capability of one cache level
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheAllocCapability {
    /// Classes of service usable by software (halved when CDP is on)
    pub num_classes: u32,
    pub num_ways: u32,
    pub way_size: u64,
    /// Ways shared with other agents
    pub way_contention: u64,
    pub cdp: bool,
    pub cdp_on: bool,
    pub non_contiguous_cbm: bool,
    pub iordt: bool,
    pub iordt_on: bool,
}

/// Memory bandwidth allocation capability
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbaCapability {
    pub num_classes: u32,
    pub throttle_max: u32,
    pub throttle_step: u32,
    pub is_linear: bool,
    /// Protocol version 1 to 4
    pub version: u32,
    pub per_thread: bool,
    pub mba40_on: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationKind {
    L3,
    L2,
}

impl AllocationKind {
    pub fn name(&self) -> &'static str {
        match self {
            AllocationKind::L3 => "L3 CAT",
            AllocationKind::L2 => "L2 CAT",
        }
    }
}

/// Snapshot of all discovered platform features
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CapabilityDescriptor {
    pub monitoring: Option<MonitoringCapability>,
    pub l3ca: Option<CacheAllocCapability>,
    pub l2ca: Option<CacheAllocCapability>,
    pub mba: Option<MbaCapability>,
}

impl CapabilityDescriptor {
    /// Discover every feature independently
    ///
    /// A missing feature leaves its slot empty. Register access failures are
    /// logged and drop only the affected feature, while contradictory
    /// hardware state fails the whole discovery.
    pub fn discover_all(
        platform: &dyn Platform,
        topology: &CpuTopology,
        config: &EngineConfig,
        uncore: &UncoreTable,
    ) -> Result<Self> {
        let monitoring = optional(
            "Monitoring",
            discover_monitoring(platform, topology, uncore),
        )?;
        let l3ca = optional(
            AllocationKind::L3.name(),
            discover_allocation(platform, topology, AllocationKind::L3, config),
        )?;
        let l2ca = optional(
            AllocationKind::L2.name(),
            discover_allocation(platform, topology, AllocationKind::L2, config),
        )?;
        let mba = optional("MBA", discover_mba(platform, topology))?;

        Ok(Self {
            monitoring,
            l3ca,
            l2ca,
            mba,
        })
    }

    pub fn monitoring(&self) -> Result<&MonitoringCapability> {
        self.monitoring
            .as_ref()
            .ok_or_else(|| RdtError::Unsupported("Monitoring not available".to_string()))
    }

    pub fn allocation(&self, kind: AllocationKind) -> Option<&CacheAllocCapability> {
        match kind {
            AllocationKind::L3 => self.l3ca.as_ref(),
            AllocationKind::L2 => self.l2ca.as_ref(),
        }
    }

    /// Human readable summary, one feature per line
    pub fn summary(&self) -> Vec<String> {
        let mut lines = Vec::new();

        match &self.monitoring {
            Some(mon) => {
                lines.push(format!(
                    "Monitoring: max RMID {}, L3 {} bytes, SNC {} ({}), I/O RDT {}{}",
                    mon.max_rmid,
                    mon.l3_size,
                    mon.snc.num,
                    mon.snc.mode,
                    mon.iordt,
                    if mon.iordt_on { " (enabled)" } else { "" }
                ));
                for cap in &mon.events {
                    lines.push(format!(
                        "  {}: max RMID {}, scale {}, width {}",
                        cap.event, cap.max_rmid, cap.scale_factor, cap.counter_width
                    ));
                }
            }
            None => lines.push("Monitoring: not supported".to_string()),
        }

        for kind in [AllocationKind::L3, AllocationKind::L2] {
            match self.allocation(kind) {
                Some(cap) => lines.push(format!(
                    "{}: {} classes, {} ways of {} bytes, CDP {}{}",
                    kind.name(),
                    cap.num_classes,
                    cap.num_ways,
                    cap.way_size,
                    cap.cdp,
                    if cap.cdp_on { " (enabled)" } else { "" }
                )),
                None => lines.push(format!("{}: not supported", kind.name())),
            }
        }

        match &self.mba {
            Some(mba) => lines.push(format!(
                "MBA: {} classes, max {}%, step {}%, version {}",
                mba.num_classes, mba.throttle_max, mba.throttle_step, mba.version
            )),
            None => lines.push("MBA: not supported".to_string()),
        }

        lines
    }
}

fn optional<T>(what: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(cap) => Ok(Some(cap)),
        Err(e) if e.is_unsupported() => {
            tracing::info!("{} not supported: {}", what, e);
            Ok(None)
        }
        Err(e @ RdtError::InconsistentState(_)) => Err(e),
        Err(e) => {
            tracing::error!("{} discovery aborted: {}", what, e);
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::cpuid::CpuidRegs;
    use crate::common::mock::MockPlatform;
    use crate::common::topology::tests::two_socket;
    use rdtflow_raw::current_arch::rdt::msr;

    #[test]
    fn test_snc_mode_parse() {
        assert_eq!("LOCAL".parse::<SncMode>().unwrap(), SncMode::Local);
        assert_eq!(" total".parse::<SncMode>().unwrap(), SncMode::Total);
        assert!(matches!(
            "shared".parse::<SncMode>(),
            Err(RdtError::InvalidParameter(_))
        ));
    }

    #[test]
    fn test_nothing_supported_is_empty_descriptor() {
        let platform = MockPlatform::new();
        let desc = CapabilityDescriptor::discover_all(
            &platform,
            &two_socket(),
            &EngineConfig::default(),
            &UncoreTable::empty(),
        )
        .unwrap();

        assert_eq!(desc, CapabilityDescriptor::default());
        assert!(desc.monitoring().is_err());
    }

    #[test]
    fn test_partial_descriptor_on_register_failure() {
        let platform = MockPlatform::new();
        // L3 CAT with CDP present, CDP register unreadable
        platform.set_cpuid(0x7, 0, CpuidRegs::new(0, 1 << 15, 0, 0));
        platform.set_cpuid(0x10, 0, CpuidRegs::new(0, 1 << 1, 0, 0));
        platform.set_cpuid(0x10, 1, CpuidRegs::new(10, 0, 1 << 2, 15));
        platform.fail_read(0, msr::IA32_L3_QOS_CFG);

        let desc = CapabilityDescriptor::discover_all(
            &platform,
            &two_socket(),
            &EngineConfig::default(),
            &UncoreTable::empty(),
        )
        .unwrap();
        assert!(desc.l3ca.is_none());
        assert!(desc.mba.is_none());
    }

    #[test]
    fn test_inconsistent_state_fails_discovery() {
        let platform = MockPlatform::new();
        platform.set_cpuid(0x7, 0, CpuidRegs::new(0, 1 << 15, 0, 0));
        platform.set_cpuid(0x10, 0, CpuidRegs::new(0, 1 << 1, 0, 0));
        platform.set_cpuid(0x10, 1, CpuidRegs::new(10, 0, 1 << 2, 15));
        platform.set_msr(0, msr::IA32_L3_QOS_CFG, 1);
        platform.set_msr(4, msr::IA32_L3_QOS_CFG, 0);

        let result = CapabilityDescriptor::discover_all(
            &platform,
            &two_socket(),
            &EngineConfig::default(),
            &UncoreTable::empty(),
        );
        assert!(matches!(result, Err(RdtError::InconsistentState(_))));
    }

    #[test]
    fn test_counter_width_defaults() {
        let cap = MonitoringCapability {
            max_rmid: 8,
            l3_size: 1024,
            events: vec![
                MonitorEventCap {
                    event: MonEvent::TotalMemBandwidth,
                    max_rmid: 8,
                    scale_factor: 64,
                    counter_width: 32,
                    io_tagging: false,
                },
                MonitorEventCap {
                    event: MonEvent::LlcMisses,
                    max_rmid: 0,
                    scale_factor: 0,
                    counter_width: 0,
                    io_tagging: false,
                },
            ],
            snc: SncInfo::default(),
            iordt: false,
            iordt_on: false,
        };

        assert_eq!(cap.counter_width(MonEvent::TotalMemBandwidth), 32);
        assert_eq!(cap.counter_width(MonEvent::LlcMisses), DEFAULT_COUNTER_WIDTH);
        assert_eq!(cap.counter_width(MonEvent::Ipc), DEFAULT_COUNTER_WIDTH);
        assert_eq!(cap.scale_factor(MonEvent::TotalMemBandwidth), 64);
        assert!(cap.event_set().contains(MonEvent::LlcMisses));
        assert!(!cap.supports(MonEvent::LlcOccupancy));
    }
}
