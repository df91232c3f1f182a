//! RDT (Resource Director Technology) register definitions for Skylake-SP
//!
//! RDT provides cache and memory bandwidth monitoring and allocation capabilities.
//!
//! ## References
//!
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 3B
//! - Section 17.18: Intel Resource Director Technology

use crate::register::RegisterLayout;

/// MSR addresses for RDT (CMT/MBM/CAT/MBA)
pub mod msr {
    /// Core capabilities enumeration (present when CPUID.7.0:EDX[30] is set)
    pub const IA32_CORE_CAPABILITIES: u64 = 0xCF;

    /// L3 QoS configuration - CDP enable
    pub const IA32_L3_QOS_CFG: u64 = 0xC81;

    /// L2 QoS configuration - CDP enable
    pub const IA32_L2_QOS_CFG: u64 = 0xC82;

    /// L3 I/O QoS configuration - non-CPU agent allocation/monitoring enable
    pub const IA32_L3_IO_QOS_CFG: u64 = 0xC83;

    /// Memory bandwidth allocation configuration
    pub const IA32_MBA_CFG: u64 = 0xC84;

    /// QM Event Select - Select monitoring event and RMID
    pub const IA32_QM_EVTSEL: u64 = 0xC8D;

    /// QM Counter - Read monitoring counter value
    pub const IA32_QM_CTR: u64 = 0xC8E;

    /// PQR Association - Associate RMID and COS with logical processor
    pub const IA32_PQR_ASSOC: u64 = 0xC8F;

    /// First L3 cache allocation mask (COS0)
    pub const IA32_L3_QOS_MASK_START: u64 = 0xC90;

    /// Last architecturally possible L3 cache allocation mask
    pub const IA32_L3_QOS_MASK_END: u64 = 0xD0F;

    /// First L2 cache allocation mask (COS0)
    pub const IA32_L2_QOS_MASK_START: u64 = 0xD10;

    /// First memory bandwidth throttle register (COS0)
    pub const IA32_MBA_THRTL_START: u64 = 0xD50;

    /// Sub-NUMA cluster RMID sharing configuration
    pub const MSR_RMID_SNC_CONFIG: u64 = 0xCA0;
}

/// RDT monitoring event identifiers (IA32_QM_EVTSEL event field)
pub mod events {
    /// LLC occupancy monitoring event
    pub const LLC_OCCUPANCY: u8 = 0x01;

    /// Total memory bandwidth monitoring event
    pub const TOTAL_MEM_BW: u8 = 0x02;

    /// Local memory bandwidth monitoring event
    pub const LOCAL_MEM_BW: u8 = 0x03;
}

/// Reserved RMID meaning "not monitored"
pub const RMID0: u32 = 0;

/// Width of the RMID field in IA32_PQR_ASSOC and IA32_QM_EVTSEL
pub const RMID_MASK: u64 = (1 << 10) - 1;

/// Data field of IA32_QM_CTR
pub const QM_CTR_DATA_MASK: u64 = (1 << 62) - 1;

/// IA32_QM_CTR: data for the selected RMID/event is not available yet
pub const QM_CTR_UNAVAILABLE: u64 = 1 << 62;

/// IA32_QM_CTR: the event selection was invalid or changed underneath
pub const QM_CTR_ERROR: u64 = 1 << 63;

/// IA32_CORE_CAPABILITIES bit advertising MBA 4.0 support
pub const CORE_CAPABILITIES_MBA4: u64 = 1 << 10;

/// QM Event Select Register layout
///
/// Selects which RMID and event the next IA32_QM_CTR read reports.
///
/// ## Register Format
///
/// | Bits   | Field     | Description                  |
/// |--------|-----------|------------------------------|
/// | 0-7    | event_id  | Event ID to monitor          |
/// | 8-31   | reserved  |                              |
/// | 32-41  | rmid      | Resource Monitoring ID       |
/// | 42-63  | reserved  |                              |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QmEventSelect {
    /// Resource Monitoring ID (RMID)
    pub rmid: u32,

    /// Event ID (LLC_OCCUPANCY, LOCAL_MEM_BW, etc.)
    pub event_id: u8,
}

impl RegisterLayout for QmEventSelect {
    fn to_msr_value(&self) -> u64 {
        ((self.rmid as u64 & RMID_MASK) << 32) | self.event_id as u64
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            rmid: ((value >> 32) & RMID_MASK) as u32,
            event_id: (value & 0xFF) as u8,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.rmid as u64 > RMID_MASK {
            return Err("RMID must fit in 10 bits");
        }
        Ok(())
    }
}

/// QM Counter Register layout
///
/// ## Register Format
///
/// | Bits   | Field       | Description                         |
/// |--------|-------------|-------------------------------------|
/// | 0-61   | data        | Counter value for the selection     |
/// | 62     | unavailable | Data not ready for this RMID/event  |
/// | 63     | error       | Invalid or changed event selection  |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QmCounter {
    pub data: u64,
    pub unavailable: bool,
    pub error: bool,
}

impl RegisterLayout for QmCounter {
    fn to_msr_value(&self) -> u64 {
        (self.data & QM_CTR_DATA_MASK)
            | (if self.unavailable { QM_CTR_UNAVAILABLE } else { 0 })
            | (if self.error { QM_CTR_ERROR } else { 0 })
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            data: value & QM_CTR_DATA_MASK,
            unavailable: (value & QM_CTR_UNAVAILABLE) != 0,
            error: (value & QM_CTR_ERROR) != 0,
        }
    }
}

/// PQR Association Register layout
///
/// Associates an RMID and COS (Class of Service) with a logical processor.
///
/// ## Register Format
///
/// | Bits   | Field     | Description                  |
/// |--------|-----------|------------------------------|
/// | 0-9    | rmid      | Resource Monitoring ID       |
/// | 10-31  | reserved  |                              |
/// | 32-63  | cos       | Class of Service             |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PqrAssoc {
    /// Resource Monitoring ID (RMID) for this logical processor
    pub rmid: u32,

    /// Class of Service (COS) for cache/memory allocation
    pub cos: u32,
}

impl PqrAssoc {
    /// Same association with a different RMID, COS untouched
    pub fn with_rmid(self, rmid: u32) -> Self {
        Self { rmid, ..self }
    }
}

impl RegisterLayout for PqrAssoc {
    fn to_msr_value(&self) -> u64 {
        (self.rmid as u64 & RMID_MASK) | ((self.cos as u64) << 32)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            rmid: (value & RMID_MASK) as u32,
            cos: (value >> 32) as u32,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.rmid as u64 > RMID_MASK {
            return Err("RMID must fit in 10 bits");
        }
        Ok(())
    }
}

/// L3/L2 QoS configuration layout (IA32_L3_QOS_CFG / IA32_L2_QOS_CFG)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QosConfig {
    /// Code and data prioritization enabled (bit 0)
    pub cdp_enable: bool,
}

impl RegisterLayout for QosConfig {
    fn to_msr_value(&self) -> u64 {
        self.cdp_enable as u64
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            cdp_enable: (value & 1) != 0,
        }
    }
}

/// L3 I/O QoS configuration layout (IA32_L3_IO_QOS_CFG)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IoQosConfig {
    /// Non-CPU agent cache allocation enabled (bit 0)
    pub allocation_enable: bool,
    /// Non-CPU agent monitoring enabled (bit 1)
    pub monitoring_enable: bool,
    /// Bits 2..63, written back untouched
    pub reserved: u64,
}

impl RegisterLayout for IoQosConfig {
    fn to_msr_value(&self) -> u64 {
        (self.reserved & !0x3)
            | (self.allocation_enable as u64)
            | ((self.monitoring_enable as u64) << 1)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            allocation_enable: (value & 1) != 0,
            monitoring_enable: (value & 2) != 0,
            reserved: value & !0x3,
        }
    }
}

/// MBA configuration layout (IA32_MBA_CFG)
///
/// | Bits | Field       | Description                              |
/// |------|-------------|------------------------------------------|
/// | 0    | min_delay   | Use minimum (vs maximum) delay per core  |
/// | 1    | legacy_mode | MBA 2.0 legacy throttling                |
/// | 2    | mba4_enable | MBA 4.0 extensions enabled               |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MbaConfig {
    pub min_delay: bool,
    pub legacy_mode: bool,
    pub mba4_enable: bool,
}

impl RegisterLayout for MbaConfig {
    fn to_msr_value(&self) -> u64 {
        (self.min_delay as u64) | ((self.legacy_mode as u64) << 1) | ((self.mba4_enable as u64) << 2)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            min_delay: (value & 1) != 0,
            legacy_mode: (value & 2) != 0,
            mba4_enable: (value & 4) != 0,
        }
    }
}

/// Sub-NUMA cluster RMID configuration layout (MSR_RMID_SNC_CONFIG)
///
/// With bit 0 clear the RMID space is split evenly between the clusters of a
/// socket; with bit 0 set every cluster shares the full RMID space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SncConfig {
    pub shared_rmids: bool,
    /// Bits 1..63, written back untouched
    pub reserved: u64,
}

impl RegisterLayout for SncConfig {
    fn to_msr_value(&self) -> u64 {
        (self.reserved & !1) | self.shared_rmids as u64
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            shared_rmids: (value & 1) != 0,
            reserved: value & !1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_qm_event_select_layout() {
        let evtsel = QmEventSelect {
            rmid: 5,
            event_id: events::LOCAL_MEM_BW,
        };
        assert_eq!(evtsel.to_msr_value(), 0x0000_0005_0000_0003);

        // RMID is truncated to its 10-bit field
        let wide = QmEventSelect {
            rmid: 0x401,
            event_id: events::LLC_OCCUPANCY,
        };
        assert_eq!(wide.to_msr_value(), (1u64 << 32) | 1);
        assert!(wide.validate().is_err());
    }

    #[test]
    fn test_qm_counter_status_bits() {
        let ctr = QmCounter::from_msr_value(QM_CTR_ERROR | 0x1234);
        assert!(ctr.error);
        assert!(!ctr.unavailable);
        assert_eq!(ctr.data, 0x1234);

        let ctr = QmCounter::from_msr_value(QM_CTR_UNAVAILABLE);
        assert!(ctr.unavailable);
        assert_eq!(ctr.data, 0);
    }

    #[test]
    fn test_pqr_assoc_preserves_cos() {
        let raw = (7u64 << 32) | 12;
        let pqr = PqrAssoc::from_msr_value(raw);
        assert_eq!(pqr.rmid, 12);
        assert_eq!(pqr.cos, 7);

        let rebound = pqr.with_rmid(RMID0);
        assert_eq!(rebound.to_msr_value(), 7u64 << 32);
    }

    #[test]
    fn test_config_registers() {
        assert!(QosConfig::from_msr_value(0x1).cdp_enable);
        assert!(!QosConfig::from_msr_value(0x2).cdp_enable);

        let mba = MbaConfig::from_msr_value(0x6);
        assert!(!mba.min_delay);
        assert!(mba.legacy_mode);
        assert!(mba.mba4_enable);

        let io = IoQosConfig {
            allocation_enable: false,
            monitoring_enable: true,
            reserved: 0,
        };
        assert_eq!(io.to_msr_value(), 0x2);

        assert!(SncConfig::from_msr_value(1).shared_rmids);
    }

    #[test]
    fn test_config_writes_keep_other_bits() {
        let io = IoQosConfig {
            monitoring_enable: true,
            ..IoQosConfig::from_msr_value(0x4)
        };
        assert_eq!(io.to_msr_value(), 0x6);

        let snc = SncConfig {
            shared_rmids: true,
            ..SncConfig::from_msr_value(0x6)
        };
        assert_eq!(snc.to_msr_value(), 0x7);

        let snc = SncConfig {
            shared_rmids: false,
            ..SncConfig::from_msr_value(0x7)
        };
        assert_eq!(snc.to_msr_value(), 0x6);
    }
}
