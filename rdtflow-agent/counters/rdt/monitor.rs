use std::collections::{BTreeMap, BTreeSet};

use rdtflow_raw::current_arch::rdt::{msr, PqrAssoc, RMID0};

use crate::capability::{MonitoringCapability, SncMode};
use crate::common::channel::{ChannelAccess, ChannelId, ChannelInfo};
use crate::common::platform::{read_reg, write_reg, Platform};
use crate::common::topology::{CoreInfo, CpuTopology};
use crate::config::RmidConfig;
use crate::counters::rdt::read::read_counter;
use crate::counters::rdt::rmid::RmidAllocator;
use crate::error::{RdtError, Result};
use crate::metrics::calculator::accumulate;
use crate::metrics::{EventSet, MonEvent};

/// Hardware and configuration an RDT group works against
#[derive(Clone, Copy)]
pub struct RdtEnv<'a> {
    pub platform: &'a dyn Platform,
    pub topology: &'a CpuTopology,
    pub caps: &'a MonitoringCapability,
    pub channels: Option<&'a dyn ChannelAccess>,
    pub rmid_config: &'a RmidConfig,
}

impl<'a> RdtEnv<'a> {
    fn allocator(&self) -> RmidAllocator<'a> {
        RmidAllocator::new(self.platform, self.topology, self.caps, self.channels)
    }

    fn channel_access(&self) -> Result<&'a dyn ChannelAccess> {
        self.channels
            .ok_or_else(|| RdtError::Unsupported("I/O channel access not available".to_string()))
    }

    fn rebind(&self, lcore: u32, rmid: u32) -> Result<()> {
        let assoc: PqrAssoc = read_reg(self.platform, lcore, msr::IA32_PQR_ASSOC)?;
        write_reg(
            self.platform,
            lcore,
            msr::IA32_PQR_ASSOC,
            &assoc.with_rmid(rmid),
        )
    }
}

/// One (core, RMID) pair read on every poll
///
/// `cores` are the cores bound to `rmid` through this context; auxiliary
/// contexts reading an SNC replica have none and are `quiet`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollContext {
    pub lcore: u32,
    pub rmid: u32,
    pub quiet: bool,
    pub cores: Vec<u32>,
    pub channel: Option<ChannelId>,
}

/// RMID-based events of one session
#[derive(Debug)]
pub struct RdtGroup {
    events: EventSet,
    contexts: Vec<PollContext>,
}

impl RdtGroup {
    /// Cores sharing an RMID scope share one RMID
    fn scope_key(caps: &MonitoringCapability, core: &CoreInfo) -> (u32, u32) {
        match (caps.snc.num > 1, caps.snc.mode) {
            (false, _) => (core.socket, core.l3_id),
            (true, SncMode::Local) => (core.socket, core.numa),
            (true, SncMode::Total) => (core.socket, u32::MAX),
        }
    }

    fn desired_rmid(env: &RdtEnv<'_>, lcore: u32) -> Result<Option<u32>> {
        match env.rmid_config {
            RmidConfig::Default => Ok(None),
            RmidConfig::Map(map) => map.get(&lcore).copied().map(Some).ok_or_else(|| {
                RdtError::InvalidParameter(format!("Core {lcore} missing from the RMID map"))
            }),
        }
    }

    /// Readers of the SNC replicas of `rmid` in the other clusters of a socket
    fn replica_contexts(
        env: &RdtEnv<'_>,
        events: EventSet,
        lead: &CoreInfo,
        rmid: u32,
    ) -> Result<Vec<PollContext>> {
        let snc = env.caps.snc;
        if snc.num <= 1 || snc.mode != SncMode::Total {
            return Ok(Vec::new());
        }

        let nodes: Vec<u32> = env
            .topology
            .cores()
            .iter()
            .filter(|c| c.socket == lead.socket)
            .map(|c| c.numa)
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let replicas = env.allocator().replicas(events, rmid)?;
        Ok(replicas
            .into_iter()
            .enumerate()
            .skip(1)
            .map(|(k, replica)| {
                let lcore = nodes
                    .get(k)
                    .and_then(|&numa| env.topology.cores_by_numa(numa).first().copied())
                    .unwrap_or(lead.lcore);
                PollContext {
                    lcore,
                    rmid: replica,
                    quiet: true,
                    cores: Vec::new(),
                    channel: None,
                }
            })
            .collect())
    }

    /// Allocate and bind RMIDs for `cores`
    ///
    /// On failure every core bound so far is returned to RMID 0.
    pub fn start_cores(env: &RdtEnv<'_>, cores: &[u32], events: EventSet) -> Result<Self> {
        let mut scopes: BTreeMap<(u32, u32), Vec<CoreInfo>> = BTreeMap::new();
        for &lcore in cores {
            let core = *env.topology.check_core(lcore)?;
            scopes
                .entry(Self::scope_key(env.caps, &core))
                .or_default()
                .push(core);
        }

        let mut group = Self {
            events,
            contexts: Vec::new(),
        };

        for members in scopes.values() {
            if let Err(e) = group.bind_scope(env, members) {
                group.unwind(env);
                return Err(e);
            }
        }

        Ok(group)
    }

    fn bind_scope(&mut self, env: &RdtEnv<'_>, members: &[CoreInfo]) -> Result<()> {
        let Some(&lead) = members.first() else {
            return Ok(());
        };
        let desired = Self::desired_rmid(env, lead.lcore)?;
        let rmid = env.allocator().allocate(self.events, lead.lcore, desired)?;

        let mut context = PollContext {
            lcore: lead.lcore,
            rmid,
            quiet: false,
            cores: Vec::with_capacity(members.len()),
            channel: None,
        };

        for core in members {
            if let Err(e) = env.rebind(core.lcore, rmid) {
                self.contexts.push(context);
                return Err(e);
            }
            context.cores.push(core.lcore);
        }

        tracing::info!(
            "Monitoring cores {:?} with RMID{} via core {}",
            context.cores,
            rmid,
            lead.lcore
        );

        let replicas = Self::replica_contexts(env, self.events, &lead, rmid)?;
        self.contexts.push(context);
        self.contexts.extend(replicas);
        Ok(())
    }

    /// Allocate and tag an RMID for each I/O channel
    pub fn start_channels(env: &RdtEnv<'_>, ids: &[ChannelId], events: EventSet) -> Result<Self> {
        let access = env.channel_access()?;
        if !env.caps.iordt_on {
            return Err(RdtError::Unsupported(
                "I/O RDT monitoring is not enabled".to_string(),
            ));
        }

        let mut group = Self {
            events,
            contexts: Vec::new(),
        };

        for &id in ids {
            let result = access
                .channel(id)
                .ok_or_else(|| RdtError::InvalidParameter(format!("Unknown channel {id:#x}")))
                .and_then(|info| group.tag_channel(env, access, info));
            if let Err(e) = result {
                group.unwind(env);
                return Err(e);
            }
        }

        Ok(group)
    }

    fn tag_channel(
        &mut self,
        env: &RdtEnv<'_>,
        access: &dyn ChannelAccess,
        info: ChannelInfo,
    ) -> Result<()> {
        let socket = info.socket.ok_or_else(|| {
            RdtError::InvalidParameter(format!("Channel {:#x} has no known socket", info.id))
        })?;

        let numa_core = info
            .numa
            .and_then(|numa| env.topology.cores_by_numa(numa).first().copied());
        let lcore = match numa_core {
            Some(lcore) => lcore,
            None => env.topology.one_by_socket(socket)?,
        };

        let current = access.read_rmid(info.id)?;
        if current != RMID0 {
            return Err(RdtError::ResourceExhausted(format!(
                "Channel {:#x} already monitored with RMID{}",
                info.id, current
            )));
        }

        let rmid = env.allocator().allocate(self.events, lcore, None)?;
        access.write_rmid(info.id, rmid)?;
        tracing::info!("Monitoring channel {:#x} with RMID{} via core {}", info.id, rmid, lcore);

        self.contexts.push(PollContext {
            lcore,
            rmid,
            quiet: false,
            cores: Vec::new(),
            channel: Some(info.id),
        });
        Ok(())
    }

    pub fn events(&self) -> EventSet {
        self.events
    }

    pub fn contexts(&self) -> &[PollContext] {
        &self.contexts
    }

    /// Raw counter of `event` summed over every poll context
    pub fn read(&self, env: &RdtEnv<'_>, event: MonEvent) -> Result<u64> {
        let event_id = event.rdt_event_id().ok_or_else(|| {
            RdtError::InvalidParameter(format!("{event} is not an RMID based event"))
        })?;
        let width = env.caps.counter_width(event);

        let mut sum = 0;
        for ctx in &self.contexts {
            let raw = read_counter(env.platform, ctx.lcore, ctx.rmid, event_id)?;
            sum = accumulate(sum, raw, width);
        }
        Ok(sum)
    }

    /// Compare hardware bindings with ours; returns the number of mismatches
    pub fn validate(&self, env: &RdtEnv<'_>) -> Result<usize> {
        let mut mismatches = 0;

        for ctx in self.contexts.iter().filter(|c| !c.quiet) {
            for &lcore in &ctx.cores {
                let assoc: PqrAssoc = read_reg(env.platform, lcore, msr::IA32_PQR_ASSOC)?;
                if assoc.rmid != ctx.rmid {
                    tracing::warn!(
                        "Core {} RMID{} hijacked (now RMID{})",
                        lcore,
                        ctx.rmid,
                        assoc.rmid
                    );
                    mismatches += 1;
                }
            }

            if let Some(id) = ctx.channel {
                let current = env.channel_access()?.read_rmid(id)?;
                if current != ctx.rmid {
                    tracing::warn!(
                        "Channel {:#x} RMID{} hijacked (now RMID{})",
                        id,
                        ctx.rmid,
                        current
                    );
                    mismatches += 1;
                }
            }
        }

        Ok(mismatches)
    }

    /// Return every bound core and channel to RMID 0
    ///
    /// All bindings are attempted; the first failure is returned.
    pub fn stop(self, env: &RdtEnv<'_>) -> Result<()> {
        let mut first_err = None;

        for ctx in &self.contexts {
            for &lcore in &ctx.cores {
                if let Err(e) = env.rebind(lcore, RMID0) {
                    tracing::error!("Failed to reset RMID on core {}: {}", lcore, e);
                    first_err.get_or_insert(e);
                }
            }

            if let Some(id) = ctx.channel {
                let result = env
                    .channel_access()
                    .and_then(|access| access.write_rmid(id, RMID0));
                if let Err(e) = result {
                    tracing::error!("Failed to reset RMID on channel {:#x}: {}", id, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Best-effort undo of a partial start; failures are logged only
    fn unwind(&mut self, env: &RdtEnv<'_>) {
        let group = Self {
            events: self.events,
            contexts: std::mem::take(&mut self.contexts),
        };
        if let Err(e) = group.stop(env) {
            tracing::warn!("Rollback of RDT monitoring incomplete: {}", e);
        }
    }
}
