//! CHA (Caching/Home Agent) register definitions for Skylake-SP
//!
//! Each CHA box owns a unit control register, four counter control registers,
//! two filter registers and four counters, spaced by a fixed stride. PCIe
//! traffic accounting programs counter 0 of one box per tracked event.
//!
//! ## References
//!
//! - Intel® Xeon® Processor Scalable Family Uncore Performance Monitoring Reference Manual

use crate::register::RegisterLayout;

/// Skylake-SP (and Cascade Lake-SP) display model
pub const CPU_MODEL_SKX: u32 = 0x55;

/// Stride between CHA box MSR addresses
pub const CHA_BOX_STRIDE: u64 = 0x10;

/// MSR addresses for CHA units
pub mod msr {
    use super::CHA_BOX_STRIDE;

    /// CHA Unit Box Control base address
    pub const CHA_UNIT_BOX_CTL_BASE: u64 = 0xE00;

    /// Offset of counter control 0 from the box control register
    pub const CTL0_OFFSET: u64 = 0x1;

    /// Offset of filter 1 from the box control register
    pub const FILTER1_OFFSET: u64 = 0x6;

    /// Offset of counter 0 from the box control register
    pub const CTR0_OFFSET: u64 = 0x8;

    /// Get box control MSR address for a specific CHA
    pub const fn box_ctl(cha_index: usize) -> u64 {
        CHA_UNIT_BOX_CTL_BASE + (cha_index as u64 * CHA_BOX_STRIDE)
    }

    /// Get counter control 0 MSR address
    pub const fn counter_ctl0(cha_index: usize) -> u64 {
        box_ctl(cha_index) + CTL0_OFFSET
    }

    /// Get filter 1 MSR address
    pub const fn filter1(cha_index: usize) -> u64 {
        box_ctl(cha_index) + FILTER1_OFFSET
    }

    /// Get counter 0 MSR address
    pub const fn counter0(cha_index: usize) -> u64 {
        box_ctl(cha_index) + CTR0_OFFSET
    }
}

/// CHA Unit Box Control Register layout
///
/// ## Register Format
///
/// | Bits | Field           | Description                         |
/// |------|-----------------|-------------------------------------|
/// | 0    | reset_control   | Reset all counter control registers |
/// | 1    | reset_counters  | Reset all counters to 0             |
/// | 8    | freeze          | Freeze all counters in the box      |
/// | 16   | freeze_enable   | Box responds to freeze              |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaBoxControl {
    pub reset_control: bool,
    pub reset_counters: bool,
    pub freeze: bool,
    pub freeze_enable: bool,
}

impl ChaBoxControl {
    /// Counters running
    pub const UNFREEZE: Self = Self {
        reset_control: false,
        reset_counters: false,
        freeze: false,
        freeze_enable: true,
    };

    /// Counters held
    pub const FREEZE: Self = Self {
        freeze: true,
        ..Self::UNFREEZE
    };

    /// Counters held and zeroed
    pub const RESET_COUNTERS: Self = Self {
        reset_counters: true,
        ..Self::FREEZE
    };

    /// Counters held and control registers cleared
    pub const RESET_CONTROL: Self = Self {
        reset_control: true,
        ..Self::FREEZE
    };
}

impl RegisterLayout for ChaBoxControl {
    fn to_msr_value(&self) -> u64 {
        (self.reset_control as u64)
            | ((self.reset_counters as u64) << 1)
            | ((self.freeze as u64) << 8)
            | ((self.freeze_enable as u64) << 16)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            reset_control: (value & (1 << 0)) != 0,
            reset_counters: (value & (1 << 1)) != 0,
            freeze: (value & (1 << 8)) != 0,
            freeze_enable: (value & (1 << 16)) != 0,
        }
    }
}

/// CHA Unit Counter Control Register layout
///
/// ## Register Format
///
/// | Bits   | Field               | Description                          |
/// |--------|---------------------|--------------------------------------|
/// | 0-7    | event_select        | Event code to count                  |
/// | 8-15   | unit_mask           | Event sub-select (umask)             |
/// | 18     | edge_detect         | Count rising edges vs level          |
/// | 22     | enable              | Local counter enable                 |
/// | 23     | invert              | Invert threshold comparison          |
/// | 24-31  | threshold           | Threshold for filtering              |
/// | 32-63  | extra               | Extended unit mask                   |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChaCounterControl {
    pub event_select: u8,
    pub unit_mask: u8,
    pub edge_detect: bool,
    pub enable: bool,
    pub invert: bool,
    pub threshold: u8,
    pub extra: u32,
}

impl RegisterLayout for ChaCounterControl {
    fn to_msr_value(&self) -> u64 {
        ((self.extra as u64) << 32)
            | ((self.threshold as u64) << 24)
            | (if self.invert { 1 << 23 } else { 0 })
            | (if self.enable { 1 << 22 } else { 0 })
            | (if self.edge_detect { 1 << 18 } else { 0 })
            | ((self.unit_mask as u64) << 8)
            | (self.event_select as u64)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            event_select: (value & 0xFF) as u8,
            unit_mask: ((value >> 8) & 0xFF) as u8,
            edge_detect: (value & (1 << 18)) != 0,
            enable: (value & (1 << 22)) != 0,
            invert: (value & (1 << 23)) != 0,
            threshold: ((value >> 24) & 0xFF) as u8,
            extra: (value >> 32) as u32,
        }
    }
}

/// CHA event codes
pub mod events {
    /// TOR (Table of Requests) Inserts
    pub const TOR_INSERTS: u8 = 0x35;
}

/// CHA unit masks (event sub-selectors)
pub mod umasks {
    /// TOR insert umasks
    pub mod tor {
        /// I/O requests that hit the LLC
        pub const IO_HIT: u8 = 0x14;

        /// I/O requests that missed the LLC
        pub const IO_MISS: u8 = 0x24;
    }
}

/// Filter 1 opcode selections for PCIe traffic
pub mod filters {
    /// PCIe read (PCIRdCur) opcode match
    pub const PCIE_READ: u64 = 0x43C33;

    /// PCIe write (ItoM) opcode match
    pub const PCIE_WRITE: u64 = 0x1004_9033;
}
