//! Counter backends driven through model-specific registers
//!
//! - [`rdt`]: RMID based cache occupancy and memory bandwidth
//! - [`core`]: fixed and general purpose core PMU counters
//! - [`cha`]: socket-wide PCIe traffic counted by the CHA boxes

pub mod cha;
pub mod core;
pub mod rdt;
