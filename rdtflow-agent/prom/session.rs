use prometheus::{Gauge, IntCounter, Registry};
use std::collections::HashMap;
use std::sync::Arc;

use crate::error::Result;
use crate::metrics::MonEvent;
use crate::orchestrator::{MonitoringSession, Target};

/// Prometheus view of one monitoring session
///
/// Every requested event gets one gauge labelled with the session target.
/// Cumulative events export the change of the last poll, occupancy its level
/// and IPC the ratio.
pub struct SessionExporter {
    registry: Arc<Registry>,
    gauges: HashMap<MonEvent, Gauge>,
    polls: IntCounter,
    poll_errors: IntCounter,
}

fn target_ids(target: &Target) -> String {
    let ids: Vec<String> = match target {
        Target::Cores(ids) | Target::Pids(ids) | Target::Sockets(ids) => {
            ids.iter().map(|id| id.to_string()).collect()
        }
        Target::Channels(ids) => ids.iter().map(|id| format!("{id:#x}")).collect(),
    };
    ids.join(",")
}

impl SessionExporter {
    pub fn new(session: &MonitoringSession, label: &str) -> Result<Self> {
        let registry = Arc::new(Registry::new());
        let target = session.target();
        let ids = target_ids(target);

        let mut gauges = HashMap::new();
        for event in session.events().iter() {
            let opts = prometheus::Opts::new(event.name(), format!("RDT {} measurement", event))
                .const_label("target", target.kind())
                .const_label("ids", ids.clone())
                .const_label("label", label);
            let gauge = Gauge::with_opts(opts)?;
            registry.register(Box::new(gauge.clone()))?;
            gauges.insert(event, gauge);
        }

        let polls = IntCounter::new("rdtflow_polls_total", "Completed session polls")?;
        registry.register(Box::new(polls.clone()))?;
        let poll_errors = IntCounter::new("rdtflow_poll_errors_total", "Failed session polls")?;
        registry.register(Box::new(poll_errors.clone()))?;

        Ok(Self {
            registry,
            gauges,
            polls,
            poll_errors,
        })
    }

    /// Copy the session's latest values into the gauges
    pub fn update(&self, session: &MonitoringSession) {
        let values = session.values();
        for (event, gauge) in &self.gauges {
            gauge.set(values.reading(*event));
        }
        self.polls.inc();
    }

    pub fn record_error(&self) {
        self.poll_errors.inc();
    }

    pub fn registry(&self) -> Arc<Registry> {
        Arc::clone(&self.registry)
    }
}
