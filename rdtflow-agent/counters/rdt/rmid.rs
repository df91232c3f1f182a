//! RMID allocation
//!
//! There is no RMID pool. The set of RMIDs in use is re-read from the
//! association registers of every core (and the tags of every I/O channel)
//! in the relevant scope each time an RMID is needed, so allocations made by
//! other processes are seen as well. Scan-then-write is not atomic; a
//! concurrent allocator can still pick the same id.

use std::collections::BTreeSet;

use rdtflow_raw::current_arch::rdt::{msr, PqrAssoc};

use crate::capability::{MonitoringCapability, SncMode};
use crate::common::channel::ChannelAccess;
use crate::common::platform::{read_reg, Platform};
use crate::common::topology::{CoreInfo, CpuTopology};
use crate::error::{RdtError, Result};
use crate::metrics::EventSet;

/// Inclusive range of allocatable RMIDs
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmidRange {
    pub min: u32,
    pub max: u32,
}

impl RmidRange {
    pub fn contains(&self, rmid: u32) -> bool {
        (self.min..=self.max).contains(&rmid)
    }
}

pub struct RmidAllocator<'a> {
    platform: &'a dyn Platform,
    topology: &'a CpuTopology,
    caps: &'a MonitoringCapability,
    channels: Option<&'a dyn ChannelAccess>,
}

impl<'a> RmidAllocator<'a> {
    pub fn new(
        platform: &'a dyn Platform,
        topology: &'a CpuTopology,
        caps: &'a MonitoringCapability,
        channels: Option<&'a dyn ChannelAccess>,
    ) -> Self {
        Self {
            platform,
            topology,
            caps,
            channels,
        }
    }

    /// Number of RMIDs every event in `events` can use at the same time
    pub fn effective_max(&self, events: EventSet) -> Result<u32> {
        let mut max = self.caps.max_rmid;

        for event in events.iter() {
            let cap = self.caps.event(event).ok_or_else(|| {
                RdtError::ConfigError(format!("Event {event} is not supported"))
            })?;
            if cap.max_rmid == 0 {
                return Err(RdtError::ConfigError(format!(
                    "Event {event} is not RMID based"
                )));
            }
            max = max.min(cap.max_rmid);
        }

        Ok(max)
    }

    /// RMIDs in `max / clusters` sized slices, one slice per SNC cluster
    fn rmid_per_cluster(max: u32, clusters: u32) -> u32 {
        max / clusters.max(1)
    }

    /// Allocatable range for a context led by `core`
    ///
    /// RMID 0 is never handed out. With SNC in local mode each cluster owns
    /// its own slice. In total mode only the first slice is searched since
    /// every id is replicated into the other clusters' slices.
    pub fn range(&self, events: EventSet, core: &CoreInfo) -> Result<RmidRange> {
        let max = self.effective_max(events)?;
        if max < 2 {
            return Err(RdtError::ResourceExhausted(format!(
                "No allocatable RMIDs (max {max})"
            )));
        }

        let snc = self.caps.snc;
        let (min, upper) = if snc.num <= 1 {
            (1, max - 1)
        } else {
            let per_cluster = Self::rmid_per_cluster(max, snc.num);
            match snc.mode {
                SncMode::Local => {
                    let domain = self.topology.numa_domain_index(core.lcore)?;
                    (per_cluster * domain + 1, per_cluster * (domain + 1))
                }
                SncMode::Total => {
                    let last_replica = (snc.num - 1) * per_cluster;
                    (1, per_cluster.min((max - 1).saturating_sub(last_replica)))
                }
            }
        };

        let range = RmidRange {
            min: min.max(1),
            max: upper.min(max - 1),
        };
        if range.min > range.max {
            return Err(RdtError::ResourceExhausted(format!(
                "Empty RMID range for core {}",
                core.lcore
            )));
        }
        Ok(range)
    }

    /// Ids `rmid` occupies once replicated into every SNC cluster
    pub fn replicas(&self, events: EventSet, rmid: u32) -> Result<Vec<u32>> {
        let snc = self.caps.snc;
        if snc.num <= 1 || snc.mode == SncMode::Local {
            return Ok(vec![rmid]);
        }

        let per_cluster = Self::rmid_per_cluster(self.effective_max(events)?, snc.num);
        Ok((0..snc.num).map(|k| rmid + k * per_cluster).collect())
    }

    /// RMIDs currently bound in the scope of `core`, read from hardware
    pub fn used(&self, core: &CoreInfo) -> Result<BTreeSet<u32>> {
        let snc = self.caps.snc;
        let local_snc = snc.num > 1 && snc.mode == SncMode::Local;

        let cores = if snc.num <= 1 {
            self.topology.cores_by_l3(core.l3_id)
        } else if local_snc {
            self.topology.cores_by_numa(core.numa)
        } else {
            self.topology.cores_by_socket(core.socket)
        };

        let mut used = BTreeSet::new();
        for lcore in cores {
            let assoc: PqrAssoc = read_reg(self.platform, lcore, msr::IA32_PQR_ASSOC)?;
            used.insert(assoc.rmid);
        }

        if let Some(channels) = self.channels.filter(|_| self.caps.iordt_on) {
            let numa = local_snc.then_some(core.numa);
            for channel in channels
                .channels()
                .into_iter()
                .filter(|c| c.in_domain(core.socket, numa))
            {
                used.insert(channels.read_rmid(channel.id)?);
            }
        }

        tracing::debug!("RMIDs in use around core {}: {:?}", core.lcore, used);
        Ok(used)
    }

    /// Find a free RMID for a context led by `lcore`
    ///
    /// With `desired` set, that id is validated instead of searched for.
    pub fn allocate(&self, events: EventSet, lcore: u32, desired: Option<u32>) -> Result<u32> {
        let core = *self.topology.check_core(lcore)?;
        let range = self.range(events, &core)?;
        let used = self.used(&core)?;

        let is_free = |rmid: u32| -> Result<bool> {
            Ok(self
                .replicas(events, rmid)?
                .iter()
                .all(|r| !used.contains(r)))
        };

        if let Some(rmid) = desired {
            if !range.contains(rmid) {
                return Err(RdtError::InvalidParameter(format!(
                    "RMID {} outside [{}, {}] for core {}",
                    rmid, range.min, range.max, lcore
                )));
            }
            if !is_free(rmid)? {
                return Err(RdtError::ResourceExhausted(format!(
                    "RMID {rmid} already in use near core {lcore}"
                )));
            }
            return Ok(rmid);
        }

        for rmid in range.min..=range.max {
            if is_free(rmid)? {
                tracing::debug!("Allocated RMID {} for core {}", rmid, lcore);
                return Ok(rmid);
            }
        }

        Err(RdtError::ResourceExhausted(format!(
            "No free RMID in [{}, {}] for core {}",
            range.min, range.max, lcore
        )))
    }
}
