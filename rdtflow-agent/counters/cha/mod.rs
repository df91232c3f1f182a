pub mod events;
pub mod monitor;

pub use events::{PcieUnit, UncoreEventDef, UncoreTable};
pub use monitor::{UncoreGroup, UNCORE_COUNTER_WIDTH};
