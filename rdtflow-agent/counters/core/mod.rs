pub mod events;
pub mod monitor;

pub use events::{enable_mask, CounterSlot};
pub use monitor::{PerfCounterGroup, PERF_COUNTER_WIDTH};
