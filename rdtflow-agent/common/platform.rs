//! Register access seam between the engine and the machine
//!
//! Everything above this trait only ever talks to hardware through
//! [`Platform`], so discovery, allocation and counter reads run unchanged
//! against the host or against a scripted register file.

use rdtflow_raw::RegisterLayout;

use crate::common::cpuid::{self, CpuidRegs};
use crate::common::msr;
use crate::error::Result;

pub trait Platform: Send + Sync {
    /// Read a 64-bit model-specific register on a logical core
    fn read_msr(&self, cpu: u32, msr: u64) -> Result<u64>;

    /// Write a 64-bit model-specific register on a logical core
    fn write_msr(&self, cpu: u32, msr: u64, value: u64) -> Result<()>;

    /// Execute CPUID for a leaf/subleaf
    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidRegs;
}

/// Read a register through a trait object and decode it
pub fn read_reg<T: RegisterLayout>(platform: &dyn Platform, cpu: u32, msr: u64) -> Result<T> {
    platform.read_msr(cpu, msr).map(T::from_msr_value)
}

/// Encode a layout and write it through a trait object
pub fn write_reg<T: RegisterLayout>(
    platform: &dyn Platform,
    cpu: u32,
    msr: u64,
    layout: &T,
) -> Result<()> {
    platform.write_msr(cpu, msr, layout.to_msr_value())
}

/// The running machine: pooled `/dev/cpu/N/msr` handles and the CPUID instruction
#[derive(Debug, Default, Clone, Copy)]
pub struct HostPlatform;

impl Platform for HostPlatform {
    fn read_msr(&self, cpu: u32, addr: u64) -> Result<u64> {
        msr::read_msr(cpu, addr)
    }

    fn write_msr(&self, cpu: u32, addr: u64, value: u64) -> Result<()> {
        msr::write_msr(cpu, addr, value)
    }

    fn cpuid(&self, leaf: u32, subleaf: u32) -> CpuidRegs {
        cpuid::cpuid(leaf, subleaf)
    }
}
