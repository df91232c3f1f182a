// Memory bandwidth allocation discovery and protocol version inference
use rdtflow_raw::current_arch::rdt::{msr, MbaConfig, CORE_CAPABILITIES_MBA4};

use crate::capability::MbaCapability;
use crate::common::platform::{read_reg, Platform};
use crate::common::topology::CpuTopology;
use crate::error::{RdtError, Result};

const CPUID_FEATURES: u32 = 0x7;
const CPUID_ALLOCATION: u32 = 0x10;
const MBA_RESOURCE_ID: u32 = 3;

const FEATURE_PQE: u32 = 1 << 15;
const FEATURE_CORE_CAPABILITIES: u32 = 1 << 30;

const MBA_PER_THREAD: u32 = 1 << 0;
const MBA_LINEAR: u32 = 1 << 2;

pub fn discover_mba(platform: &dyn Platform, topology: &CpuTopology) -> Result<MbaCapability> {
    let features = platform.cpuid(CPUID_FEATURES, 0);
    if features.ebx & FEATURE_PQE == 0 {
        return Err(RdtError::Unsupported(
            "CPUID.0x7.0: allocation not present".to_string(),
        ));
    }

    if platform.cpuid(CPUID_ALLOCATION, 0).ebx & (1 << MBA_RESOURCE_ID) == 0 {
        return Err(RdtError::Unsupported(
            "CPUID.0x10.0: MBA not present".to_string(),
        ));
    }

    let leaf = platform.cpuid(CPUID_ALLOCATION, MBA_RESOURCE_ID);
    let mut cap = MbaCapability {
        num_classes: (leaf.edx & 0xffff) + 1,
        throttle_max: (leaf.eax & 0xfff) + 1,
        is_linear: leaf.ecx & MBA_LINEAR != 0,
        ..Default::default()
    };

    if !cap.is_linear {
        tracing::warn!("MBA non-linear mode not supported");
        return Err(RdtError::Unsupported(
            "MBA non-linear throttling".to_string(),
        ));
    }
    cap.throttle_step = 100u32.saturating_sub(cap.throttle_max);

    let mba4 = features.edx & FEATURE_CORE_CAPABILITIES != 0 && mba4_capable(platform, topology)?;
    (cap.version, cap.per_thread) = if mba4 {
        (4, true)
    } else if leaf.ecx & MBA_PER_THREAD != 0 {
        (3, true)
    } else if cap.num_classes > 8 {
        (2, false)
    } else {
        (1, false)
    };

    tracing::info!(
        "Detected MBA version {}.0, per-{} controls",
        cap.version,
        if cap.per_thread { "thread" } else { "core" }
    );

    if cap.version == 2 || cap.version >= 4 {
        cap.mba40_on = read_mba_config(platform, topology, cap.per_thread)?;
    }

    Ok(cap)
}

/// Any core behind any bandwidth domain advertising MBA 4.0
fn mba4_capable(platform: &dyn Platform, topology: &CpuTopology) -> Result<bool> {
    for mba_id in topology.mba_ids() {
        for core in topology.cores_by_l3(mba_id) {
            let caps = platform.read_msr(core, msr::IA32_CORE_CAPABILITIES)?;
            if caps & CORE_CAPABILITIES_MBA4 != 0 {
                tracing::debug!("Core {} reports MBA 4.0 support", core);
                return Ok(true);
            }
        }
    }
    Ok(false)
}

/// Log legacy and delay settings per domain; returns whether MBA 4.0 is on
fn read_mba_config(platform: &dyn Platform, topology: &CpuTopology, per_thread: bool) -> Result<bool> {
    let mut mba40_on = false;

    for mba_id in topology.mba_ids() {
        let core = topology.one_by_mba(mba_id)?;
        let config: MbaConfig = read_reg(platform, core, msr::IA32_MBA_CFG)?;

        if config.legacy_mode {
            tracing::info!("MBA legacy mode enabled on domain {}", mba_id);
        }
        if !per_thread {
            tracing::info!(
                "{} MBA delay enabled on domain {}",
                if config.min_delay { "Min" } else { "Max" },
                mba_id
            );
        }
        mba40_on |= config.mba4_enable;
    }

    Ok(mba40_on)
}
