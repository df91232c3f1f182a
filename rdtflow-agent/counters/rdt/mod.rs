pub mod monitor;
pub mod read;
pub mod rmid;

pub use monitor::{PollContext, RdtEnv, RdtGroup};
pub use read::{read_counter, MAX_READ_ATTEMPTS};
pub use rmid::{RmidAllocator, RmidRange};
