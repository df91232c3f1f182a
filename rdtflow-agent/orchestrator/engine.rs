//! Engine: capability state plus the session lifecycle
//!
//! The engine owns the platform handle, the topology snapshot, the uncore
//! event table and the capability descriptor. Sessions are started, polled
//! and stopped through it; the engine routes each event of a session to one
//! backend and aggregates the results.

use std::collections::BTreeSet;
use std::sync::Arc;

use rdtflow_raw::current_arch::rdt::{msr, IoQosConfig, PqrAssoc, SncConfig, RMID0};

use crate::capability::{
    AllocationKind, CacheAllocCapability, CapabilityDescriptor, MonitoringCapability, SncMode,
};
use crate::common::channel::ChannelAccess;
use crate::common::platform::{read_reg, write_reg, HostPlatform, Platform};
use crate::common::topology::CpuTopology;
use crate::config::{EngineConfig, ResetConfig};
use crate::counters::cha::{UncoreGroup, UncoreTable, UNCORE_COUNTER_WIDTH};
use crate::counters::core::{PerfCounterGroup, PERF_COUNTER_WIDTH};
use crate::counters::rdt::{RdtEnv, RdtGroup};
use crate::error::{RdtError, Result};
use crate::metrics::{EventSet, MonEvent};
use crate::orchestrator::backend::{select_backend, Backend, ExternalBackend};
use crate::orchestrator::session::{MonitoringSession, Scaling, Target};

/// External backends report full 64-bit counts
const EXTERNAL_COUNTER_WIDTH: u32 = 64;

pub struct Engine {
    platform: Arc<dyn Platform>,
    topology: CpuTopology,
    config: EngineConfig,
    uncore: UncoreTable,
    caps: CapabilityDescriptor,
    perf: Option<Box<dyn ExternalBackend>>,
    resctrl: Option<Box<dyn ExternalBackend>>,
    channels: Option<Arc<dyn ChannelAccess>>,
}

impl Engine {
    /// Discover the platform's capabilities
    pub fn discover(
        platform: Arc<dyn Platform>,
        topology: CpuTopology,
        config: EngineConfig,
        uncore: UncoreTable,
    ) -> Result<Self> {
        let caps =
            CapabilityDescriptor::discover_all(platform.as_ref(), &topology, &config, &uncore)?;
        for line in caps.summary() {
            tracing::info!("{}", line);
        }

        Ok(Self {
            platform,
            topology,
            config,
            uncore,
            caps,
            perf: None,
            resctrl: None,
            channels: None,
        })
    }

    /// Engine over the running machine
    pub fn host(config: EngineConfig) -> Result<Self> {
        let platform: Arc<dyn Platform> = Arc::new(HostPlatform);
        let topology = CpuTopology::detect()?;
        let uncore = UncoreTable::detect(platform.as_ref());
        Self::discover(platform, topology, config, uncore)
    }

    fn attach(backend: Box<dyn ExternalBackend>) -> Option<Box<dyn ExternalBackend>> {
        match backend.init() {
            Ok(()) => {
                tracing::info!("Using {} backend", backend.name());
                Some(backend)
            }
            Err(e) => {
                tracing::warn!("{} backend unavailable: {}", backend.name(), e);
                None
            }
        }
    }

    /// Prefer the kernel perf subsystem for the events it supports
    pub fn with_perf_backend(mut self, backend: Box<dyn ExternalBackend>) -> Self {
        self.perf = Self::attach(backend);
        self
    }

    /// Prefer resctrl monitoring groups for the events they support
    pub fn with_resctrl_backend(mut self, backend: Box<dyn ExternalBackend>) -> Self {
        self.resctrl = Self::attach(backend);
        self
    }

    pub fn with_channels(mut self, channels: Arc<dyn ChannelAccess>) -> Self {
        self.channels = Some(channels);
        self
    }

    pub fn capabilities(&self) -> &CapabilityDescriptor {
        &self.caps
    }

    pub fn topology(&self) -> &CpuTopology {
        &self.topology
    }

    pub fn uncore(&self) -> &UncoreTable {
        &self.uncore
    }

    pub fn monitoring_capability(&self) -> Result<&MonitoringCapability> {
        self.caps.monitoring()
    }

    pub fn allocation_capability(&self, kind: AllocationKind) -> Result<&CacheAllocCapability> {
        self.caps
            .allocation(kind)
            .ok_or_else(|| RdtError::Unsupported(format!("{} not available", kind.name())))
    }

    fn rdt_env<'a>(&'a self, caps: &'a MonitoringCapability) -> RdtEnv<'a> {
        RdtEnv {
            platform: self.platform.as_ref(),
            topology: &self.topology,
            caps,
            channels: self.channels.as_deref(),
            rmid_config: &self.config.rmid,
        }
    }

    fn backend_of(&self, backend: Backend) -> Option<&dyn ExternalBackend> {
        match backend {
            Backend::Perf => self.perf.as_deref(),
            Backend::Resctrl => self.resctrl.as_deref(),
            Backend::Register | Backend::Uncore => None,
        }
    }

    /// Reject bad requests before any register is written
    fn check_request(&self, target: &Target, events: EventSet) -> Result<&MonitoringCapability> {
        if events.is_empty() {
            return Err(RdtError::InvalidParameter("No events requested".to_string()));
        }
        if target.is_empty() {
            return Err(RdtError::InvalidParameter(format!(
                "No {} to monitor",
                target.kind()
            )));
        }

        let caps = self.caps.monitoring()?;
        for event in events.iter() {
            if !caps.supports(event) && !self.uncore.supports(event) {
                return Err(RdtError::InvalidParameter(format!(
                    "Event {event} is not supported on this platform"
                )));
            }
        }

        match target {
            Target::Cores(cores) => {
                for &lcore in cores {
                    self.topology.check_core(lcore)?;
                    let assoc: PqrAssoc =
                        read_reg(self.platform.as_ref(), lcore, msr::IA32_PQR_ASSOC)?;
                    if assoc.rmid != RMID0 {
                        return Err(RdtError::ResourceExhausted(format!(
                            "Core {} is already monitored with RMID{}",
                            lcore, assoc.rmid
                        )));
                    }
                }
            }
            Target::Channels(_) => {
                for event in events.expand().iter().filter(MonEvent::is_rdt) {
                    if !caps.event(event).is_some_and(|cap| cap.io_tagging) {
                        return Err(RdtError::InvalidParameter(format!(
                            "Event {event} cannot monitor I/O channels"
                        )));
                    }
                }
            }
            Target::Sockets(sockets) => {
                let known = self.topology.sockets();
                if let Some(socket) = sockets.iter().find(|s| !known.contains(s)) {
                    return Err(RdtError::InvalidParameter(format!(
                        "Socket {socket} is not present"
                    )));
                }
            }
            Target::Pids(_) => {}
        }

        Ok(caps)
    }

    /// Start monitoring `events` on `target`
    ///
    /// Virtual events are expanded into their constituents and each real
    /// event is routed to one backend. The session only starts if the
    /// started events cover the whole request; otherwise everything that did
    /// start is stopped again.
    pub fn start_session(&self, target: Target, events: EventSet) -> Result<MonitoringSession> {
        let caps = self.check_request(&target, events)?;

        let mut session = MonitoringSession::new(target, events);
        let real = events.expand().filter(|e| !e.is_virtual());
        for event in real.iter() {
            match select_backend(
                event,
                self.perf.as_deref(),
                self.resctrl.as_deref(),
                &self.uncore,
            ) {
                Some(backend) => session.routes.push((event, backend)),
                None => tracing::warn!("No backend can count {}", event),
            }
        }

        if let Err(e) = self.start_routes(caps, &mut session) {
            self.rollback(session);
            return Err(e);
        }

        let started = session.started();
        if !started.with_derivable().is_superset(events) {
            let missing = events.difference(started.with_derivable());
            self.rollback(session);
            return Err(RdtError::Unsupported(format!(
                "Could not start {missing:?}"
            )));
        }

        tracing::info!(
            "Started session on {} for {:?} ({})",
            session.target.kind(),
            events,
            session
                .routes
                .iter()
                .map(|(e, b)| format!("{e}: {b}"))
                .collect::<Vec<_>>()
                .join(", ")
        );
        Ok(session)
    }

    fn routed(session: &MonitoringSession, backend: Backend) -> EventSet {
        session
            .routes
            .iter()
            .filter(|(_, b)| *b == backend)
            .map(|(e, _)| *e)
            .collect()
    }

    fn start_routes(&self, caps: &MonitoringCapability, session: &mut MonitoringSession) -> Result<()> {
        let register = Self::routed(session, Backend::Register);
        let rdt_events = register.filter(MonEvent::is_rdt);
        let perf_events = register.filter(MonEvent::is_perf);
        let uncore_events = Self::routed(session, Backend::Uncore);

        if !rdt_events.is_empty() {
            let env = self.rdt_env(caps);
            let group = match &session.target {
                Target::Cores(cores) => RdtGroup::start_cores(&env, cores, rdt_events)?,
                Target::Channels(ids) => RdtGroup::start_channels(&env, ids, rdt_events)?,
                other => {
                    return Err(RdtError::InvalidParameter(format!(
                        "RMID events cannot monitor {} directly",
                        other.kind()
                    )))
                }
            };
            session.rdt = Some(group);
        }

        if !perf_events.is_empty() {
            let Target::Cores(cores) = &session.target else {
                return Err(RdtError::InvalidParameter(format!(
                    "Core PMU events cannot monitor {} directly",
                    session.target.kind()
                )));
            };
            session.perf = Some(PerfCounterGroup::start(
                self.platform.as_ref(),
                cores,
                perf_events,
            )?);
        }

        if !uncore_events.is_empty() {
            let sockets: Vec<u32> = match &session.target {
                Target::Sockets(sockets) => sockets.clone(),
                Target::Cores(cores) => cores
                    .iter()
                    .filter_map(|&lcore| self.topology.core(lcore).map(|c| c.socket))
                    .collect::<BTreeSet<_>>()
                    .into_iter()
                    .collect(),
                other => {
                    return Err(RdtError::InvalidParameter(format!(
                        "Uncore events cannot monitor {}",
                        other.kind()
                    )))
                }
            };

            let group = session.uncore.insert(UncoreGroup::new());
            for event in uncore_events.iter() {
                group.start(
                    self.platform.as_ref(),
                    &self.topology,
                    &self.uncore,
                    &sockets,
                    event,
                )?;
            }
        }

        let external: Vec<_> = session
            .routes
            .iter()
            .filter(|(_, b)| b.is_external())
            .copied()
            .collect();
        for (event, backend) in external {
            let Some(service) = self.backend_of(backend) else {
                continue;
            };
            let stream = service.start(&session.target, event)?;
            session.external.push((event, backend, stream));
        }

        Ok(())
    }

    fn rollback(&self, session: MonitoringSession) {
        if let Err(e) = self.stop_parts(session, true) {
            tracing::warn!("Rollback of failed session start incomplete: {}", e);
        }
    }

    /// Read every started event, then derive the virtual ones
    ///
    /// A read failure aborts the poll and leaves the session running. A
    /// 32-bit overflow does not: the poll completes, the next poll starts
    /// from a fresh baseline and [`RdtError::Overflow`] is returned.
    pub fn poll_session(&self, session: &mut MonitoringSession) -> Result<()> {
        let caps = self.caps.monitoring()?;
        let env = self.rdt_env(caps);

        if let Some(rdt) = &session.rdt {
            rdt.validate(&env)?;
        }

        let mut overflow = None;
        let platform = self.platform.as_ref();
        let started = session.started();

        for event in started.iter().filter(|e| !e.is_virtual()) {
            let Some(backend) = session.backend(event) else {
                continue;
            };

            let (raw, width, scaling) = match backend {
                Backend::Register if event.is_rdt() => {
                    let rdt = session.rdt.as_ref().ok_or_else(|| not_started(event))?;
                    let scaling = Scaling {
                        factor: caps.scale_factor(event),
                        snc_num: caps.snc.num,
                    };
                    (rdt.read(&env, event)?, caps.counter_width(event), Some(scaling))
                }
                Backend::Register => {
                    let perf = session.perf.as_ref().ok_or_else(|| not_started(event))?;
                    (perf.read(platform, event)?, PERF_COUNTER_WIDTH, None)
                }
                Backend::Uncore => {
                    let uncore = session.uncore.as_ref().ok_or_else(|| not_started(event))?;
                    (uncore.read(platform, event)?, UNCORE_COUNTER_WIDTH, None)
                }
                Backend::Perf | Backend::Resctrl => {
                    let stream = session
                        .external
                        .iter_mut()
                        .find(|(e, _, _)| *e == event)
                        .map(|(_, _, stream)| stream)
                        .ok_or_else(|| not_started(event))?;
                    (stream.poll()?, EXTERNAL_COUNTER_WIDTH, None)
                }
            };

            match session.record(event, raw, width, scaling) {
                Ok(()) => {}
                Err(e @ RdtError::Overflow(_)) => {
                    overflow.get_or_insert(e);
                }
                Err(e) => return Err(e),
            }
        }

        session.derive_virtual(caps.counter_width(MonEvent::TotalMemBandwidth));

        match overflow {
            Some(e) => {
                session.set_valid_read(false);
                Err(e)
            }
            None => {
                session.set_valid_read(true);
                Ok(())
            }
        }
    }

    /// Stop every backend of the session
    ///
    /// External streams go first, then uncore counters, then RMID bindings
    /// (every core and channel back to RMID 0), then the core PMU. All
    /// parts are stopped even after a failure; the first failure is
    /// returned.
    pub fn stop_session(&self, session: MonitoringSession) -> Result<()> {
        self.stop_parts(session, false)
    }

    fn stop_parts(&self, session: MonitoringSession, quiet: bool) -> Result<()> {
        let mut first_err = None;
        let mut note = |what: &str, result: Result<()>| {
            if let Err(e) = result {
                tracing::error!("Failed to stop {}: {}", what, e);
                first_err.get_or_insert(e);
            }
        };

        let MonitoringSession {
            rdt,
            perf,
            uncore,
            external,
            ..
        } = session;

        for (event, backend, stream) in external {
            note(&format!("{backend} {event}"), stream.stop());
        }

        if let Some(mut uncore) = uncore {
            note("uncore counters", uncore.stop(self.platform.as_ref()));
        }

        if let Some(rdt) = rdt {
            match self.caps.monitoring() {
                Ok(caps) => {
                    let env = self.rdt_env(caps);
                    if !quiet {
                        note("RMID validation", rdt.validate(&env).map(|_| ()));
                    }
                    note("RMID bindings", rdt.stop(&env));
                }
                Err(e) => note("RMID bindings", Err(e)),
            }
        }

        if let Some(perf) = perf {
            note("core PMU counters", perf.stop(self.platform.as_ref()));
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Return the platform to an unmonitored state
    ///
    /// Every core and I/O channel goes back to RMID 0 with its class of
    /// service kept. The optional configuration switches SNC mode and I/O
    /// monitoring. Capabilities are rediscovered afterwards.
    pub fn reset_all(&mut self, config: Option<ResetConfig>) -> Result<()> {
        let platform = self.platform.as_ref();

        for core in self.topology.cores() {
            let assoc: PqrAssoc = read_reg(platform, core.lcore, msr::IA32_PQR_ASSOC)?;
            if assoc.rmid != RMID0 {
                write_reg(
                    platform,
                    core.lcore,
                    msr::IA32_PQR_ASSOC,
                    &assoc.with_rmid(RMID0),
                )?;
            }
        }

        if let Some(channels) = &self.channels {
            for channel in channels.channels() {
                channels.write_rmid(channel.id, RMID0)?;
            }
        }

        let config = config.unwrap_or_default();
        for socket in self.topology.sockets() {
            let lcore = self.topology.one_by_socket(socket)?;

            if let Some(mode) = config.snc_mode {
                let current: SncConfig = read_reg(platform, lcore, msr::MSR_RMID_SNC_CONFIG)?;
                let snc = SncConfig {
                    shared_rmids: mode == SncMode::Total,
                    ..current
                };
                write_reg(platform, lcore, msr::MSR_RMID_SNC_CONFIG, &snc)?;
                tracing::info!("Socket {} SNC mode set to {}", socket, mode);
            }

            if let Some(enable) = config.io_monitoring {
                let current: IoQosConfig = read_reg(platform, lcore, msr::IA32_L3_IO_QOS_CFG)?;
                let updated = IoQosConfig {
                    monitoring_enable: enable,
                    ..current
                };
                write_reg(platform, lcore, msr::IA32_L3_IO_QOS_CFG, &updated)?;
                tracing::info!(
                    "Socket {} I/O monitoring {}",
                    socket,
                    if enable { "enabled" } else { "disabled" }
                );
            }
        }

        self.caps =
            CapabilityDescriptor::discover_all(platform, &self.topology, &self.config, &self.uncore)?;
        tracing::info!("Monitoring reset complete");
        Ok(())
    }

    /// Release the external backends
    pub fn fini(self) -> Result<()> {
        let mut first_err = None;
        for backend in [self.perf, self.resctrl].into_iter().flatten() {
            if let Err(e) = backend.fini() {
                tracing::error!("Failed to shut down {} backend: {}", backend.name(), e);
                first_err.get_or_insert(e);
            }
        }

        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

fn not_started(event: MonEvent) -> RdtError {
    RdtError::InvalidParameter(format!("{event} has no running counter in this session"))
}
