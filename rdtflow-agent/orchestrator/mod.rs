pub mod backend;
pub mod collector;
pub mod engine;
pub mod session;

pub use backend::{select_backend, Backend, EventStream, ExternalBackend};
pub use collector::SessionCollector;
pub use engine::Engine;
pub use session::{MonitoringSession, Scaling, Target};
