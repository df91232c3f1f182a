//! I/O channel access for non-CPU agent monitoring
//!
//! Channels are PCIe/device traffic streams that can be tagged with an RMID
//! once I/O RDT monitoring is enabled. How a channel's tag is reached (MMIO,
//! firmware tables) is platform specific and lives behind this trait.

use crate::error::Result;

pub type ChannelId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelInfo {
    pub id: ChannelId,
    /// Socket the channel's root port hangs off, when known
    pub socket: Option<u32>,
    /// NUMA node of the channel, when known
    pub numa: Option<u32>,
}

impl ChannelInfo {
    /// Whether the channel can share RMIDs with `domain`
    ///
    /// Channels whose placement cannot be resolved match every domain.
    pub fn in_domain(&self, socket: u32, numa: Option<u32>) -> bool {
        match (self.socket, self.numa, numa) {
            (_, Some(ch_numa), Some(numa)) => ch_numa == numa,
            (Some(ch_socket), _, _) => ch_socket == socket,
            (None, _, _) => true,
        }
    }
}

pub trait ChannelAccess: Send + Sync {
    fn channels(&self) -> Vec<ChannelInfo>;

    fn channel(&self, id: ChannelId) -> Option<ChannelInfo> {
        self.channels().into_iter().find(|c| c.id == id)
    }

    fn read_rmid(&self, channel: ChannelId) -> Result<u32>;

    fn write_rmid(&self, channel: ChannelId, rmid: u32) -> Result<()>;
}
