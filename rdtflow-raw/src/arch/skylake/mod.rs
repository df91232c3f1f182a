//! Intel Skylake-SP (Skylake Server) register definitions
//!
//! ## Units
//!
//! - **RDT** (Resource Director Technology) - monitoring and allocation MSRs
//! - **Core** - fixed and general purpose performance counters
//! - **CHA** (Caching/Home Agent) - PCIe-originated LLC traffic counters
//!
//! ## References
//!
//! - Intel® 64 and IA-32 Architectures Software Developer's Manual, Volume 3B
//! - Intel® Xeon® Processor Scalable Family Uncore Performance Monitoring Reference Manual

pub mod cha;
pub mod core;
pub mod rdt;
