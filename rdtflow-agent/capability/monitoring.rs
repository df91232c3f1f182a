// Monitoring capability: CPUID leaves 0x7, 0xF and 0xA plus per-socket state
use rdtflow_raw::current_arch::rdt::{msr, IoQosConfig, SncConfig};

use crate::capability::{MonitorEventCap, MonitoringCapability, SncInfo, SncMode};
use crate::common::platform::{read_reg, Platform};
use crate::common::topology::CpuTopology;
use crate::counters::cha::UncoreTable;
use crate::error::{RdtError, Result};
use crate::metrics::calculator::DEFAULT_COUNTER_WIDTH;
use crate::metrics::MonEvent;

const CPUID_FEATURES: u32 = 0x7;
const CPUID_QOS_MONITORING: u32 = 0xF;
const CPUID_PERF_MONITORING: u32 = 0xA;

const FEATURE_PQM: u32 = 1 << 12;
const L3_MONITORING: u32 = 1 << 1;

const EVENT_OCCUPANCY: u32 = 1 << 0;
const EVENT_TOTAL_BW: u32 = 1 << 1;
const EVENT_LOCAL_BW: u32 = 1 << 2;

const WIDTH_OFFSET_MASK: u32 = 0x7f;
const IO_OCCUPANCY: u32 = 1 << 9;
const IO_BANDWIDTH: u32 = 1 << 10;

pub fn discover_monitoring(
    platform: &dyn Platform,
    topology: &CpuTopology,
    uncore: &UncoreTable,
) -> Result<MonitoringCapability> {
    let features = platform.cpuid(CPUID_FEATURES, 0);
    if features.ebx & FEATURE_PQM == 0 {
        return Err(RdtError::Unsupported(
            "CPUID.0x7.0: monitoring capability not present".to_string(),
        ));
    }

    let leaf = platform.cpuid(CPUID_QOS_MONITORING, 0);
    if leaf.edx & L3_MONITORING == 0 {
        return Err(RdtError::Unsupported(
            "CPUID.0xF.0: L3 monitoring not present".to_string(),
        ));
    }

    let max_rmid = leaf.ebx + 1;
    let l3_size = topology.l3_size()?;

    let mut events = Vec::new();

    let sub = platform.cpuid(CPUID_QOS_MONITORING, 1);
    let rdt_event = |event, io_tagging| MonitorEventCap {
        event,
        max_rmid: sub.ecx + 1,
        scale_factor: sub.ebx,
        counter_width: (sub.eax & WIDTH_OFFSET_MASK) + DEFAULT_COUNTER_WIDTH,
        io_tagging,
    };
    let io_occupancy = sub.eax & IO_OCCUPANCY != 0;
    let io_bandwidth = sub.eax & IO_BANDWIDTH != 0;

    if sub.edx & EVENT_OCCUPANCY != 0 {
        events.push(rdt_event(MonEvent::LlcOccupancy, io_occupancy));
    }
    if sub.edx & EVENT_TOTAL_BW != 0 {
        events.push(rdt_event(MonEvent::TotalMemBandwidth, io_bandwidth));
    }
    if sub.edx & EVENT_LOCAL_BW != 0 {
        events.push(rdt_event(MonEvent::LocalMemBandwidth, io_bandwidth));
    }
    if sub.edx & EVENT_TOTAL_BW != 0 && sub.edx & EVENT_LOCAL_BW != 0 {
        events.push(rdt_event(MonEvent::RemoteMemBandwidth, io_bandwidth));
    }

    for event in uncore.events() {
        events.push(perf_event(event));
    }

    let pmu = platform.cpuid(CPUID_PERF_MONITORING, 0);
    let fixed_counters = pmu.edx & 0x1f;
    let general_counters = (pmu.eax >> 8) & 0xff;
    if pmu.ebx & 0x3 == 0 && fixed_counters > 1 {
        events.push(perf_event(MonEvent::UnhaltedCycles));
        events.push(perf_event(MonEvent::RetiredInstructions));
        events.push(perf_event(MonEvent::Ipc));
    }
    if general_counters > 1 {
        events.push(perf_event(MonEvent::LlcMisses));
        events.push(perf_event(MonEvent::LlcReferences));
    }

    if events.is_empty() {
        return Err(RdtError::Unsupported(
            "No monitoring events discovered".to_string(),
        ));
    }

    let snc = detect_snc(platform, topology)?;

    let iordt = events.iter().any(|e| e.io_tagging);
    let iordt_on = if iordt {
        iordt_enabled(platform, topology)?
    } else {
        false
    };

    tracing::info!(
        "Monitoring: {} events, max RMID {}, SNC {} ({})",
        events.len(),
        max_rmid,
        snc.num,
        snc.mode
    );

    Ok(MonitoringCapability {
        max_rmid,
        l3_size,
        events,
        snc,
        iordt,
        iordt_on,
    })
}

fn perf_event(event: MonEvent) -> MonitorEventCap {
    MonitorEventCap {
        event,
        max_rmid: 0,
        scale_factor: 0,
        counter_width: 0,
        io_tagging: false,
    }
}

/// Sub-NUMA clustering layout and RMID sharing mode
///
/// All sockets must agree on the sharing mode.
pub fn detect_snc(platform: &dyn Platform, topology: &CpuTopology) -> Result<SncInfo> {
    let sockets = topology.sockets().len() as u32;
    let numa = topology.numa_nodes().len() as u32;

    if sockets == 0 || numa <= 1 || numa == sockets {
        return Ok(SncInfo::default());
    }

    let mut mode = None;
    for socket in topology.sockets() {
        let core = topology.one_by_socket(socket)?;
        let config: SncConfig = read_reg(platform, core, msr::MSR_RMID_SNC_CONFIG)?;
        let socket_mode = if config.shared_rmids {
            SncMode::Total
        } else {
            SncMode::Local
        };

        match mode {
            None => mode = Some(socket_mode),
            Some(m) if m != socket_mode => {
                return Err(RdtError::InconsistentState(format!(
                    "SNC mode differs between sockets (socket {} reports {}, expected {}); \
                     reset monitoring to fix",
                    socket, socket_mode, m
                )));
            }
            Some(_) => {}
        }
    }

    Ok(SncInfo {
        num: numa / sockets,
        mode: mode.unwrap_or_default(),
    })
}

/// Whether I/O RDT monitoring is enabled on every socket
pub fn iordt_enabled(platform: &dyn Platform, topology: &CpuTopology) -> Result<bool> {
    let mut enabled = 0;
    let mut disabled = 0;

    for socket in topology.sockets() {
        let core = topology.one_by_socket(socket)?;
        let config: IoQosConfig = read_reg(platform, core, msr::IA32_L3_IO_QOS_CFG)?;
        if config.monitoring_enable {
            enabled += 1;
        } else {
            disabled += 1;
        }
    }

    if enabled > 0 && disabled > 0 {
        return Err(RdtError::InconsistentState(format!(
            "I/O RDT monitoring enabled on {enabled} sockets and disabled on {disabled}"
        )));
    }

    Ok(enabled > 0)
}
