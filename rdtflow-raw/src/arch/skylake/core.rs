//! Core PMU register definitions for Skylake-SP
//!
//! Fixed and general purpose counters used to derive IPC and LLC miss/reference
//! counts when no kernel perf subsystem is available.
//!
//! ## References
//!
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 3B
//! - Chapter 18: Performance Monitoring

use crate::register::RegisterLayout;

/// MSR addresses for Core PMU
pub mod msr {
    /// Performance Event Select registers (IA32_PERFEVTSELx)
    pub const IA32_PERFEVTSEL0: u64 = 0x186;
    pub const IA32_PERFEVTSEL1: u64 = 0x187;

    /// Performance Counter registers (IA32_PMCx)
    pub const IA32_PMC0: u64 = 0xC1;
    pub const IA32_PMC1: u64 = 0xC2;

    /// Fixed-function Performance Counters
    pub const IA32_FIXED_CTR0: u64 = 0x309; // Instructions Retired
    pub const IA32_FIXED_CTR1: u64 = 0x30A; // Unhalted Core Cycles

    /// Fixed-function Performance Counter Control
    pub const IA32_FIXED_CTR_CTRL: u64 = 0x38D;

    /// Performance Counter Global Control
    pub const IA32_PERF_GLOBAL_CTRL: u64 = 0x38F;
}

/// Architectural LLC events (event select, unit mask)
pub mod events {
    /// LONGEST_LAT_CACHE.MISS
    pub const LLC_MISS: (u8, u8) = (0x2E, 0x41);

    /// LONGEST_LAT_CACHE.REFERENCE
    pub const LLC_REFERENCE: (u8, u8) = (0x2E, 0x4F);
}

/// Core Performance Event Select Register layout
///
/// ## Register Format
///
/// | Bits   | Field       | Description                    |
/// |--------|-------------|--------------------------------|
/// | 0-7    | event_select| Event select                   |
/// | 8-15   | umask       | Unit mask                      |
/// | 16     | usr         | User mode                      |
/// | 17     | os          | OS mode                        |
/// | 18     | edge        | Edge detect                    |
/// | 20     | int         | APIC interrupt enable          |
/// | 22     | enable      | Enable counter                 |
/// | 23     | invert      | Invert counter mask            |
/// | 24-31  | cmask       | Counter mask                   |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CorePerfEvtSel {
    pub event_select: u8,
    pub umask: u8,
    pub usr: bool,
    pub os: bool,
    pub edge: bool,
    pub int: bool,
    pub enable: bool,
    pub invert: bool,
    pub cmask: u8,
}

impl CorePerfEvtSel {
    /// Enabled counter tracking `(event, umask)` in both user and kernel mode
    pub fn counting(event: (u8, u8)) -> Self {
        Self {
            event_select: event.0,
            umask: event.1,
            usr: true,
            os: true,
            enable: true,
            ..Default::default()
        }
    }
}

impl RegisterLayout for CorePerfEvtSel {
    fn to_msr_value(&self) -> u64 {
        (self.event_select as u64)
            | ((self.umask as u64) << 8)
            | (if self.usr { 1 << 16 } else { 0 })
            | (if self.os { 1 << 17 } else { 0 })
            | (if self.edge { 1 << 18 } else { 0 })
            | (if self.int { 1 << 20 } else { 0 })
            | (if self.enable { 1 << 22 } else { 0 })
            | (if self.invert { 1 << 23 } else { 0 })
            | ((self.cmask as u64) << 24)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            event_select: (value & 0xFF) as u8,
            umask: ((value >> 8) & 0xFF) as u8,
            usr: (value & (1 << 16)) != 0,
            os: (value & (1 << 17)) != 0,
            edge: (value & (1 << 18)) != 0,
            int: (value & (1 << 20)) != 0,
            enable: (value & (1 << 22)) != 0,
            invert: (value & (1 << 23)) != 0,
            cmask: ((value >> 24) & 0xFF) as u8,
        }
    }
}

/// Privilege levels a fixed counter counts in
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedCounterMode {
    pub os: bool,
    pub usr: bool,
}

impl FixedCounterMode {
    pub const USR_OS: Self = Self { os: true, usr: true };
}

/// Fixed Counter Control Register layout
///
/// Each fixed counter owns a 4-bit field: [os, usr, any_thread, pmi].
/// Only fixed counters 0 (instructions) and 1 (core cycles) are driven here.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FixedCtrCtrl {
    pub instructions: FixedCounterMode,
    pub cycles: FixedCounterMode,
}

impl RegisterLayout for FixedCtrCtrl {
    fn to_msr_value(&self) -> u64 {
        let field = |mode: FixedCounterMode| (mode.os as u64) | ((mode.usr as u64) << 1);
        field(self.instructions) | (field(self.cycles) << 4)
    }

    fn from_msr_value(value: u64) -> Self {
        let mode = |bits: u64| FixedCounterMode {
            os: (bits & 1) != 0,
            usr: (bits & 2) != 0,
        };
        Self {
            instructions: mode(value & 0xF),
            cycles: mode((value >> 4) & 0xF),
        }
    }
}

/// Performance Counter Global Control Register layout
///
/// | Bits   | Field  | Description                      |
/// |--------|--------|----------------------------------|
/// | 0-3    | pmc    | General purpose counter enables  |
/// | 32-34  | fixed  | Fixed counter enables            |
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GlobalCtrl {
    pub pmc: u8,
    pub fixed: u8,
}

impl RegisterLayout for GlobalCtrl {
    fn to_msr_value(&self) -> u64 {
        (self.pmc as u64 & 0xF) | ((self.fixed as u64 & 0x7) << 32)
    }

    fn from_msr_value(value: u64) -> Self {
        Self {
            pmc: (value & 0xF) as u8,
            fixed: ((value >> 32) & 0x7) as u8,
        }
    }

    fn validate(&self) -> Result<(), &'static str> {
        if self.pmc > 0xF {
            return Err("Only 4 general purpose counters exist");
        }
        if self.fixed > 0x7 {
            return Err("Only 3 fixed counters exist");
        }
        Ok(())
    }
}
