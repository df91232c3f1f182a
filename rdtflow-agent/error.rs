use std::io;
use thiserror::Error;

use rdtflow_raw::MsrError;

use crate::metrics::MonEvent;

#[derive(Error, Debug)]
pub enum RdtError {
    #[error("Not supported: {0}")]
    Unsupported(String),

    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),

    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("Inconsistent hardware state: {0}")]
    InconsistentState(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Failed to read event {event} on core {cpu} (RMID{rmid})")]
    ReadError { cpu: u32, rmid: u32, event: u8 },

    #[error("Register write failed: {0}")]
    WriteError(String),

    #[error("Counter overflow detected for {}", .0.name())]
    Overflow(MonEvent),

    #[error("MSR operation failed: {0}")]
    Msr(#[from] MsrError),

    #[error("Affinity operation failed: {0}")]
    AffinityError(String),

    #[error("IO error: {0}")]
    IoError(#[from] io::Error),

    #[error("Nix error: {0}")]
    NixError(#[from] nix::Error),

    #[error("Prometheus error: {0}")]
    PrometheusError(#[from] prometheus::Error),
}

impl RdtError {
    /// Feature absent: an expected outcome that lets fallback chains advance
    pub fn is_unsupported(&self) -> bool {
        matches!(self, RdtError::Unsupported(_))
    }
}

pub type Result<T> = std::result::Result<T, RdtError>;
