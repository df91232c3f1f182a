//! Cache allocation (CAT) discovery for L3 and L2
//!
//! L3 allocation is recognised through a chain of strategies: the CPUID
//! allocation leaf, then a brand string allow-list, then a family/model
//! allow-list and finally (only when explicitly enabled) probing the mask
//! registers directly. L2 allocation is only ever reported through CPUID.

use rdtflow_raw::current_arch::rdt::{msr, IoQosConfig, QosConfig};

use crate::capability::strategy::{run_chain, DetectContext, DetectionStrategy};
use crate::capability::{AllocationKind, CacheAllocCapability};
use crate::common::arch::{brand_string, CpuIdent};
use crate::common::platform::{read_reg, Platform};
use crate::common::topology::CpuTopology;
use crate::config::EngineConfig;
use crate::error::{RdtError, Result};

const CPUID_FEATURES: u32 = 0x7;
const CPUID_ALLOCATION: u32 = 0x10;

const FEATURE_PQE: u32 = 1 << 15;

const CAT_IO_ALLOCATION: u32 = 1 << 1;
const CAT_CDP: u32 = 1 << 2;
const CAT_NON_CONTIGUOUS: u32 = 1 << 3;

/// Class count of the parts that shipped L3 CAT before CPUID enumerated it
const LEGACY_L3_CLASSES: u32 = 4;

const SUPPORTED_BRANDS: &[&str] = &[
    "E5-2658 v3",
    "E5-2648L v3",
    "E5-2628L v3",
    "E5-2618L v3",
    "E5-2608L v3",
    "E5-2658A v3",
    "E3-1258L v4",
    "E3-1278L v4",
];

/// (family, model)
const SUPPORTED_MODELS: &[(u32, u32)] = &[(0x6, 0x3F), (0x6, 0x47)];

impl AllocationKind {
    fn resource_id(&self) -> u32 {
        match self {
            AllocationKind::L3 => 1,
            AllocationKind::L2 => 2,
        }
    }

    fn qos_cfg(&self) -> u64 {
        match self {
            AllocationKind::L3 => msr::IA32_L3_QOS_CFG,
            AllocationKind::L2 => msr::IA32_L2_QOS_CFG,
        }
    }

    /// One representative core per allocation domain
    fn domain_cores(&self, topology: &CpuTopology) -> Result<Vec<(u32, u32)>> {
        match self {
            AllocationKind::L3 => topology
                .l3_ids()
                .into_iter()
                .map(|id| topology.one_by_l3(id).map(|core| (id, core)))
                .collect(),
            AllocationKind::L2 => topology
                .l2_ids()
                .into_iter()
                .map(|id| topology.one_by_l2(id).map(|core| (id, core)))
                .collect(),
        }
    }

    fn cache_size(&self, topology: &CpuTopology) -> Result<u64> {
        match self {
            AllocationKind::L3 => topology.l3_size(),
            AllocationKind::L2 if topology.l2().detected => Ok(topology.l2().total_size),
            AllocationKind::L2 => Err(RdtError::ConfigError(
                "L2 cache information not available".to_string(),
            )),
        }
    }
}

pub fn discover_allocation(
    platform: &dyn Platform,
    topology: &CpuTopology,
    kind: AllocationKind,
    config: &EngineConfig,
) -> Result<CacheAllocCapability> {
    let ctx = DetectContext { platform, topology };

    let mut chain: Vec<Box<dyn DetectionStrategy<CacheAllocCapability>>> =
        vec![Box::new(CpuidAllocation { kind })];

    if kind == AllocationKind::L3 {
        chain.push(Box::new(BrandString));
        chain.push(Box::new(FamilyModel));
        if config.allow_l3ca_probe {
            chain.push(Box::new(RegisterProbe));
        }
    }

    let mut cap = run_chain(kind.name(), &ctx, &chain)?;
    if cap.num_ways > 0 {
        cap.way_size = kind.cache_size(topology)? / cap.num_ways as u64;
    }

    tracing::info!(
        "{}: {} classes, {} ways, CDP {}",
        kind.name(),
        cap.num_classes,
        cap.num_ways,
        if cap.cdp_on { "on" } else { "off" }
    );

    Ok(cap)
}

/// Whether a QoS enable bit is set in every domain
///
/// Domains disagreeing is an error that needs an allocation reset.
fn all_domains(
    what: &str,
    domains: &[(u32, u32)],
    read: impl Fn(u32) -> Result<bool>,
) -> Result<bool> {
    let mut enabled = 0;
    let mut disabled = 0;

    for &(id, core) in domains {
        let on = read(core)?;
        tracing::debug!("{} domain {} (core {}): {}", what, id, core, on);
        if on {
            enabled += 1;
        } else {
            disabled += 1;
        }
    }

    if enabled > 0 && disabled > 0 {
        return Err(RdtError::InconsistentState(format!(
            "{what} enabled in {enabled} domains and disabled in {disabled}; \
             reset allocation to fix"
        )));
    }

    Ok(enabled > 0)
}

fn cdp_enabled(ctx: &DetectContext<'_>, kind: AllocationKind) -> Result<bool> {
    let domains = kind.domain_cores(ctx.topology)?;
    all_domains(&format!("{} CDP", kind.name()), &domains, |core| {
        read_reg::<QosConfig>(ctx.platform, core, kind.qos_cfg()).map(|cfg| cfg.cdp_enable)
    })
}

fn io_allocation_enabled(ctx: &DetectContext<'_>) -> Result<bool> {
    let domains = ctx
        .topology
        .sockets()
        .into_iter()
        .map(|socket| ctx.topology.one_by_socket(socket).map(|core| (socket, core)))
        .collect::<Result<Vec<_>>>()?;

    all_domains("I/O RDT allocation", &domains, |core| {
        read_reg::<IoQosConfig>(ctx.platform, core, msr::IA32_L3_IO_QOS_CFG)
            .map(|cfg| cfg.allocation_enable)
    })
}

/// Ways from the topology, for strategies CPUID says nothing to
fn topology_ways(topology: &CpuTopology) -> Result<u32> {
    if !topology.l3().detected {
        return Err(RdtError::ConfigError(
            "L3 cache information not available".to_string(),
        ));
    }
    Ok(topology.l3().num_ways)
}

fn legacy_cap(num_classes: u32, topology: &CpuTopology) -> Result<CacheAllocCapability> {
    Ok(CacheAllocCapability {
        num_classes,
        num_ways: topology_ways(topology)?,
        ..Default::default()
    })
}

struct CpuidAllocation {
    kind: AllocationKind,
}

impl DetectionStrategy<CacheAllocCapability> for CpuidAllocation {
    fn name(&self) -> &'static str {
        "CPUID"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Result<CacheAllocCapability> {
        if ctx.platform.cpuid(CPUID_FEATURES, 0).ebx & FEATURE_PQE == 0 {
            return Err(RdtError::Unsupported(
                "CPUID.0x7.0: allocation not present".to_string(),
            ));
        }

        let res_id = self.kind.resource_id();
        if ctx.platform.cpuid(CPUID_ALLOCATION, 0).ebx & (1 << res_id) == 0 {
            return Err(RdtError::Unsupported(format!(
                "CPUID.0x10.0: {} not present",
                self.kind.name()
            )));
        }

        let leaf = ctx.platform.cpuid(CPUID_ALLOCATION, res_id);
        let mut cap = CacheAllocCapability {
            num_classes: leaf.edx + 1,
            num_ways: leaf.eax + 1,
            way_contention: leaf.ebx as u64,
            cdp: leaf.ecx & CAT_CDP != 0,
            non_contiguous_cbm: leaf.ecx & CAT_NON_CONTIGUOUS != 0,
            iordt: self.kind == AllocationKind::L3 && leaf.ecx & CAT_IO_ALLOCATION != 0,
            ..Default::default()
        };

        if cap.cdp {
            cap.cdp_on = cdp_enabled(ctx, self.kind)?;
            if cap.cdp_on {
                // Each class takes a code and a data mask
                cap.num_classes /= 2;
            }
        }

        if cap.iordt {
            cap.iordt_on = io_allocation_enabled(ctx)?;
        }

        Ok(cap)
    }
}

struct BrandString;

impl DetectionStrategy<CacheAllocCapability> for BrandString {
    fn name(&self) -> &'static str {
        "brand string"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Result<CacheAllocCapability> {
        let brand = brand_string(ctx.platform).ok_or_else(|| {
            RdtError::Unsupported("Brand string CPUID leaves not implemented".to_string())
        })?;
        tracing::debug!("CPU brand string '{}'", brand);

        if !SUPPORTED_BRANDS.iter().any(|b| brand.contains(b)) {
            return Err(RdtError::Unsupported(format!(
                "No cache allocation for model name '{brand}'"
            )));
        }

        legacy_cap(LEGACY_L3_CLASSES, ctx.topology)
    }
}

struct FamilyModel;

impl DetectionStrategy<CacheAllocCapability> for FamilyModel {
    fn name(&self) -> &'static str {
        "family/model"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Result<CacheAllocCapability> {
        let ident = CpuIdent::detect(ctx.platform);
        if !SUPPORTED_MODELS.contains(&(ident.family, ident.model)) {
            return Err(RdtError::Unsupported(format!(
                "No cache allocation for family {:#x} model {:#x}",
                ident.family, ident.model
            )));
        }

        legacy_cap(LEGACY_L3_CLASSES, ctx.topology)
    }
}

/// Count the L3 mask registers that can be read on the first core
struct RegisterProbe;

impl DetectionStrategy<CacheAllocCapability> for RegisterProbe {
    fn name(&self) -> &'static str {
        "register probe"
    }

    fn detect(&self, ctx: &DetectContext<'_>) -> Result<CacheAllocCapability> {
        let lcore = ctx
            .topology
            .cores()
            .first()
            .map(|c| c.lcore)
            .ok_or_else(|| RdtError::InvalidParameter("Topology has no cores".to_string()))?;

        let classes = (msr::IA32_L3_QOS_MASK_START..=msr::IA32_L3_QOS_MASK_END)
            .take_while(|&reg| ctx.platform.read_msr(lcore, reg).is_ok())
            .count() as u32;

        if classes == 0 {
            tracing::warn!("Error probing COS0 mask on core {}", lcore);
            return Err(RdtError::Unsupported(
                "L3 mask registers not readable".to_string(),
            ));
        }

        legacy_cap(classes, ctx.topology)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::cpuid::CpuidRegs;
    use crate::common::mock::MockPlatform;
    use crate::common::topology::tests::two_socket;

    fn l3_cat(platform: &MockPlatform, ecx: u32) {
        platform.set_cpuid(0x7, 0, CpuidRegs::new(0, FEATURE_PQE, 0, 0));
        platform.set_cpuid(0x10, 0, CpuidRegs::new(0, 1 << 1, 0, 0));
        // 11 ways, contention mask 0x600, 16 classes
        platform.set_cpuid(0x10, 1, CpuidRegs::new(10, 0x600, ecx, 15));
    }

    fn discover(platform: &MockPlatform, kind: AllocationKind) -> Result<CacheAllocCapability> {
        discover_allocation(platform, &two_socket(), kind, &EngineConfig::default())
    }

    #[test]
    fn test_cpuid_l3() {
        let platform = MockPlatform::new();
        l3_cat(&platform, CAT_NON_CONTIGUOUS);

        let cap = discover(&platform, AllocationKind::L3).unwrap();
        assert_eq!(cap.num_classes, 16);
        assert_eq!(cap.num_ways, 11);
        assert_eq!(cap.way_contention, 0x600);
        assert_eq!(cap.way_size, 32 * 1024 * 1024 / 11);
        assert!(cap.non_contiguous_cbm);
        assert!(!cap.cdp);
        assert!(!cap.iordt);
    }

    #[test]
    fn test_cdp_halves_classes() {
        let platform = MockPlatform::new();
        l3_cat(&platform, CAT_CDP);
        platform.set_msr_all([0, 4], msr::IA32_L3_QOS_CFG, 1);

        let cap = discover(&platform, AllocationKind::L3).unwrap();
        assert!(cap.cdp && cap.cdp_on);
        assert_eq!(cap.num_classes, 8);

        // Capable but disabled keeps the full count
        platform.set_msr_all([0, 4], msr::IA32_L3_QOS_CFG, 0);
        let cap = discover(&platform, AllocationKind::L3).unwrap();
        assert!(cap.cdp && !cap.cdp_on);
        assert_eq!(cap.num_classes, 16);
    }

    #[test]
    fn test_inconsistent_cdp() {
        let platform = MockPlatform::new();
        l3_cat(&platform, CAT_CDP);
        platform.set_msr(4, msr::IA32_L3_QOS_CFG, 1);

        assert!(matches!(
            discover(&platform, AllocationKind::L3),
            Err(RdtError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_l2_cdp_checks_every_cluster() {
        let platform = MockPlatform::new();
        platform.set_cpuid(0x7, 0, CpuidRegs::new(0, FEATURE_PQE, 0, 0));
        platform.set_cpuid(0x10, 0, CpuidRegs::new(0, 1 << 2, 0, 0));
        platform.set_cpuid(0x10, 2, CpuidRegs::new(15, 0, CAT_CDP, 7));
        platform.set_msr_all([0, 2, 4, 6], msr::IA32_L2_QOS_CFG, 1);

        let cap = discover(&platform, AllocationKind::L2).unwrap();
        assert_eq!(cap.num_classes, 4);
        assert_eq!(cap.way_size, 1024 * 1024 / 16);

        platform.set_msr(6, msr::IA32_L2_QOS_CFG, 0);
        assert!(matches!(
            discover(&platform, AllocationKind::L2),
            Err(RdtError::InconsistentState(_))
        ));
    }

    #[test]
    fn test_io_allocation_state() {
        let platform = MockPlatform::new();
        l3_cat(&platform, CAT_IO_ALLOCATION);
        platform.set_msr_all([0, 4], msr::IA32_L3_IO_QOS_CFG, 0x1);

        let cap = discover(&platform, AllocationKind::L3).unwrap();
        assert!(cap.iordt && cap.iordt_on);
    }

    #[test]
    fn test_brand_string_fallback() {
        let platform = MockPlatform::new();
        platform.set_brand_string("Intel(R) Xeon(R) CPU E5-2658 v3 @ 2.20GHz");

        let cap = discover(&platform, AllocationKind::L3).unwrap();
        assert_eq!(cap.num_classes, 4);
        assert_eq!(cap.num_ways, 16);
        assert_eq!(cap.way_size, 2 * 1024 * 1024);

        // L2 has no fallbacks
        assert!(discover(&platform, AllocationKind::L2)
            .unwrap_err()
            .is_unsupported());
    }

    #[test]
    fn test_family_model_fallback() {
        let platform = MockPlatform::new();
        platform.set_brand_string("Intel(R) Xeon(R) CPU E5-2699 v3 @ 2.30GHz");
        // family 6 model 0x3F
        platform.set_cpuid(1, 0, CpuidRegs::new(0x0003_06F2, 0, 0, 0));

        let cap = discover(&platform, AllocationKind::L3).unwrap();
        assert_eq!(cap.num_classes, 4);
    }

    #[test]
    fn test_register_probe_is_opt_in() {
        let platform = MockPlatform::new();
        // mask registers beyond COS5 fault
        platform.fail_read(0, msr::IA32_L3_QOS_MASK_START + 6);

        assert!(discover(&platform, AllocationKind::L3)
            .unwrap_err()
            .is_unsupported());

        let config = EngineConfig {
            allow_l3ca_probe: true,
            ..Default::default()
        };
        let cap = discover_allocation(&platform, &two_socket(), AllocationKind::L3, &config)
            .unwrap();
        assert_eq!(cap.num_classes, 6);

        platform.fail_read(0, msr::IA32_L3_QOS_MASK_START);
        assert!(
            discover_allocation(&platform, &two_socket(), AllocationKind::L3, &config)
                .unwrap_err()
                .is_unsupported()
        );
    }
}
