//! Backend selection
//!
//! Every real event of a session is served by exactly one backend, picked
//! when the session starts. The kernel perf subsystem and the resctrl
//! filesystem are optional collaborators plugged in as [`ExternalBackend`]
//! trait objects; the register and uncore paths are built in.

use std::fmt;

use crate::counters::cha::UncoreTable;
use crate::error::Result;
use crate::metrics::MonEvent;
use crate::orchestrator::session::Target;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// OS performance counter subsystem
    Perf,
    /// resctrl filesystem monitoring groups
    Resctrl,
    /// Direct MSR programming
    Register,
    /// CHA PCIe counters
    Uncore,
}

impl Backend {
    pub fn name(&self) -> &'static str {
        match self {
            Backend::Perf => "perf",
            Backend::Resctrl => "resctrl",
            Backend::Register => "register",
            Backend::Uncore => "uncore",
        }
    }

    pub fn is_external(&self) -> bool {
        matches!(self, Backend::Perf | Backend::Resctrl)
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One started event of an external backend
pub trait EventStream: Send {
    /// Cumulative count since the stream started
    fn poll(&mut self) -> Result<u64>;

    fn stop(self: Box<Self>) -> Result<()>;
}

/// Monitoring service provided outside this crate
pub trait ExternalBackend: Send + Sync {
    fn name(&self) -> &'static str;

    fn init(&self) -> Result<()>;

    fn fini(&self) -> Result<()>;

    fn is_event_supported(&self, event: MonEvent) -> bool;

    fn start(&self, target: &Target, event: MonEvent) -> Result<Box<dyn EventStream>>;
}

/// Backend serving `event`, in preference order
///
/// Virtual events are never served directly; they are derived from their
/// constituents after a poll.
pub fn select_backend(
    event: MonEvent,
    perf: Option<&dyn ExternalBackend>,
    resctrl: Option<&dyn ExternalBackend>,
    uncore: &UncoreTable,
) -> Option<Backend> {
    if event.is_virtual() {
        return None;
    }

    if perf.is_some_and(|b| b.is_event_supported(event)) {
        return Some(Backend::Perf);
    }
    if resctrl.is_some_and(|b| b.is_event_supported(event)) {
        return Some(Backend::Resctrl);
    }
    if event.is_rdt() || event.is_perf() {
        return Some(Backend::Register);
    }
    if event.is_uncore() && uncore.supports(event) {
        return Some(Backend::Uncore);
    }
    None
}
