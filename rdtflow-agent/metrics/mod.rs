pub mod calculator;
pub mod types;
pub mod values;

pub use types::{EventSet, MonEvent};
pub use values::{CounterValue, EventValues};
