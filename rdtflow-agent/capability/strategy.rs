//! Layered feature detection
//!
//! Some features can be recognised in several ways of decreasing reliability.
//! Each way is a [`DetectionStrategy`]; a chain tries them in order. A strategy
//! returning [`RdtError::Unsupported`] hands over to the next one, any other
//! error ends the chain.

use crate::common::platform::Platform;
use crate::common::topology::CpuTopology;
use crate::error::{RdtError, Result};

/// What a strategy may look at
#[derive(Clone, Copy)]
pub struct DetectContext<'a> {
    pub platform: &'a dyn Platform,
    pub topology: &'a CpuTopology,
}

pub trait DetectionStrategy<T> {
    fn name(&self) -> &'static str;

    fn detect(&self, ctx: &DetectContext<'_>) -> Result<T>;
}

pub fn run_chain<T>(
    what: &str,
    ctx: &DetectContext<'_>,
    strategies: &[Box<dyn DetectionStrategy<T>>],
) -> Result<T> {
    for strategy in strategies {
        match strategy.detect(ctx) {
            Ok(found) => {
                tracing::info!("{} detected via {}", what, strategy.name());
                return Ok(found);
            }
            Err(e) if e.is_unsupported() => {
                tracing::debug!("{}: {} found nothing ({})", what, strategy.name(), e);
            }
            Err(e) => return Err(e),
        }
    }

    Err(RdtError::Unsupported(format!("{what} not detected")))
}
