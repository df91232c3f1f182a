// Macros (must be first for visibility)
#[macro_use]
pub mod macros;

pub mod capability;
pub mod common;
pub mod config;
pub mod counters;
pub mod error;
pub mod metrics;
pub mod orchestrator;
pub mod prom;

pub use capability::{AllocationKind, CapabilityDescriptor, MonitoringCapability, SncMode};
pub use config::{EngineConfig, MonitorConfig, ResetConfig, RmidConfig};
pub use error::{RdtError, Result};
pub use metrics::{EventSet, EventValues, MonEvent};
pub use orchestrator::{
    Backend, Engine, EventStream, ExternalBackend, MonitoringSession, SessionCollector, Target,
};
pub use prom::SessionExporter;
