//! # rdtflow-raw
//!
//! Register definitions for Intel Resource Director Technology (RDT).
//!
//! This crate provides type-safe layouts for the model-specific registers
//! used by cache monitoring (CMT), memory bandwidth monitoring (MBM), cache
//! allocation (CAT/CDP), memory bandwidth allocation (MBA) and the core and
//! uncore performance counters that complement them.
//!
//! ## Features
//!
//! - `skylake` (default) - Skylake-SP register definitions, exported as
//!   `current_arch`
//!
//! ## Usage
//!
//! ```ignore
//! use rdtflow_raw::current_arch::rdt::{self, QmEventSelect};
//! use rdtflow_raw::{MsrDevice, RegisterLayout};
//!
//! let dev = MsrDevice::open(0)?;
//! let evtsel = QmEventSelect {
//!     rmid: 5,
//!     event_id: rdt::events::LOCAL_MEM_BW,
//! };
//! dev.write(rdt::msr::IA32_QM_EVTSEL, evtsel.to_msr_value())?;
//! ```

pub mod arch;
pub mod msr;
pub mod register;

// Re-export for convenience
pub use msr::{MsrDevice, MsrError, Result};
pub use register::RegisterLayout;

// Export current architecture based on feature flag
#[cfg(feature = "skylake")]
pub use arch::skylake as current_arch;
