// Session collection loop
// Polls one monitoring session on a fixed interval and feeds the exporter

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RdtError, Result};
use crate::orchestrator::engine::Engine;
use crate::orchestrator::session::MonitoringSession;
use crate::prom::SessionExporter;

pub struct SessionCollector {
    engine: Engine,
    session: MonitoringSession,
    exporter: Arc<SessionExporter>,
    interval: Duration,
}

impl SessionCollector {
    pub fn new(
        engine: Engine,
        session: MonitoringSession,
        exporter: Arc<SessionExporter>,
        interval: Duration,
    ) -> Self {
        Self {
            engine,
            session,
            exporter,
            interval,
        }
    }

    /// Start polling until `cancel_token` fires
    ///
    /// The session is stopped and the engine released when the loop exits;
    /// the task yields the first teardown error.
    pub fn start(self, cancel_token: CancellationToken) -> JoinHandle<Result<()>> {
        tracing::warn!(
            "Starting collection loop every {}ms",
            self.interval.as_millis()
        );

        tokio::spawn(async move { self.collection_loop(cancel_token).await })
    }

    fn poll_once(&mut self) {
        match self.engine.poll_session(&mut self.session) {
            Ok(()) => self.exporter.update(&self.session),
            Err(RdtError::Overflow(event)) => {
                tracing::warn!("{} overflowed, re-establishing baseline", event);
                self.exporter.update(&self.session);
            }
            Err(e) => {
                tracing::error!("Failed to poll session: {}", e);
                self.exporter.record_error();
            }
        }
    }

    async fn collection_loop(mut self, cancel_token: CancellationToken) -> Result<()> {
        let mut interval = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = cancel_token.cancelled() => {
                    tracing::info!("Collection loop cancelled");
                    break;
                }
                _ = interval.tick() => self.poll_once(),
            }
        }

        let stopped = self.engine.stop_session(self.session);
        let released = self.engine.fini();
        stopped.and(released)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MonEvent;
    use crate::orchestrator::engine::tests::{engine, platform};
    use crate::orchestrator::session::Target;

    #[tokio::test]
    async fn test_loop_polls_until_cancelled() {
        let platform = platform();
        let engine = engine(&platform);
        let session = engine
            .start_session(Target::Cores(vec![0]), MonEvent::TotalMemBandwidth.into())
            .unwrap();
        assert_eq!(platform.msr(0, 0xC8F), 1);

        let exporter = Arc::new(SessionExporter::new(&session, "test").unwrap());
        let collector = SessionCollector::new(
            engine,
            session,
            Arc::clone(&exporter),
            Duration::from_millis(5),
        );

        let cancel_token = CancellationToken::new();
        let handle = collector.start(cancel_token.clone());
        tokio::time::sleep(Duration::from_millis(30)).await;
        cancel_token.cancel();
        handle.await.unwrap().unwrap();

        assert_eq!(platform.msr(0, 0xC8F), 0);
        let polls = exporter
            .registry()
            .gather()
            .into_iter()
            .find(|family| family.get_name() == "rdtflow_polls_total")
            .map(|family| family.get_metric()[0].get_counter().get_value())
            .unwrap();
        assert!(polls >= 1.0);
    }
}
