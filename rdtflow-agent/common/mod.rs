pub mod affinity;
pub mod arch;
pub mod channel;
pub mod cpuid;
pub mod msr;
pub mod platform;
pub mod topology;

#[cfg(test)]
pub(crate) mod mock;

pub use affinity::AffinityGuard;
pub use arch::{CpuArchitecture, CpuIdent};
pub use channel::{ChannelAccess, ChannelId, ChannelInfo};
pub use msr::{Msr, MsrHandle};
pub use platform::{HostPlatform, Platform};
pub use topology::{CacheInfo, CoreInfo, CpuTopology};
