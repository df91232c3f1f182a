//! Architecture-specific register definitions
//!
//! RDT and PMU register addresses are architectural, but uncore units and
//! their event encodings differ between server generations. Only Skylake-SP
//! uncore encodings are defined.

#[cfg(feature = "skylake")]
pub mod skylake;
