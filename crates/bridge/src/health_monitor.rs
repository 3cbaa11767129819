//! Health monitor: on-demand and periodic server probes.
//!
//! The latest status is readable lock-free through `ArcSwap`; every probe
//! result is also pushed to the view as `ViewEvent::Health`.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use relaydock_connector::{HealthProbe, HealthStatus};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::conversation_command::ViewEvent;

pub struct HealthMonitor {
    probe: HealthProbe,
    interval: Duration,
    status: Arc<ArcSwap<HealthStatus>>,
    view_tx: mpsc::Sender<ViewEvent>,
    periodic: Option<JoinHandle<()>>,
}

impl HealthMonitor {
    pub fn new(probe: HealthProbe, interval: Duration, view_tx: mpsc::Sender<ViewEvent>) -> Self {
        Self {
            probe,
            interval,
            status: Arc::new(ArcSwap::from_pointee(HealthStatus::Unknown)),
            view_tx,
            periodic: None,
        }
    }

    pub fn status(&self) -> HealthStatus {
        self.status.load().as_ref().clone()
    }

    /// Probe now, record the result and publish it.
    pub async fn check_now(&self) -> HealthStatus {
        let status = probe_and_publish(&self.probe, &self.status, &self.view_tx).await;
        status.unwrap_or_else(|| self.status())
    }

    /// Start periodic probing; the first probe runs immediately.
    pub fn start(&mut self) {
        if self.periodic.is_some() || self.interval.is_zero() {
            return;
        }
        let probe = self.probe.clone();
        let status = self.status.clone();
        let view_tx = self.view_tx.clone();
        let period = self.interval;

        info!(
            component = "health",
            event = "health.monitor.started",
            interval_secs = period.as_secs(),
            "Periodic health checks started"
        );

        self.periodic = Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                if probe_and_publish(&probe, &status, &view_tx).await.is_none() {
                    debug!(
                        component = "health",
                        event = "health.monitor.view_closed",
                        "View gone, stopping periodic health checks"
                    );
                    break;
                }
            }
        }));
    }

    pub fn stop(&mut self) {
        if let Some(task) = self.periodic.take() {
            task.abort();
        }
    }

    #[cfg(test)]
    pub fn is_running(&self) -> bool {
        self.periodic.as_ref().is_some_and(|t| !t.is_finished())
    }
}

impl Drop for HealthMonitor {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Returns `None` when the view channel is closed.
async fn probe_and_publish(
    probe: &HealthProbe,
    status: &ArcSwap<HealthStatus>,
    view_tx: &mpsc::Sender<ViewEvent>,
) -> Option<HealthStatus> {
    let result = probe.check().await;
    status.store(Arc::new(result.clone()));
    view_tx.send(ViewEvent::Health(result.clone())).await.ok()?;
    Some(result)
}

#[cfg(test)]
mod tests {
    use super::*;
    use relaydock_connector::mock_server::{HealthBehavior, MockBackend};

    fn monitor(url: &str, interval: Duration) -> (HealthMonitor, mpsc::Receiver<ViewEvent>) {
        let (tx, rx) = mpsc::channel(16);
        let probe = HealthProbe::new(url, Duration::from_millis(300)).unwrap();
        (HealthMonitor::new(probe, interval, tx), rx)
    }

    #[tokio::test]
    async fn starts_unknown_then_records_probe() {
        let server = MockBackend::start().await;
        let (monitor, mut rx) = monitor(&server.url(), Duration::from_secs(60));
        assert_eq!(monitor.status(), HealthStatus::Unknown);

        assert_eq!(monitor.check_now().await, HealthStatus::Healthy);
        assert_eq!(monitor.status(), HealthStatus::Healthy);
        assert_eq!(rx.recv().await, Some(ViewEvent::Health(HealthStatus::Healthy)));
    }

    #[tokio::test]
    async fn timeout_reports_specific_reason() {
        let server = MockBackend::start().await;
        server.set_health(HealthBehavior::Delay(Duration::from_secs(2)));
        let (monitor, _rx) = monitor(&server.url(), Duration::from_secs(60));

        assert_eq!(
            monitor.check_now().await,
            HealthStatus::Unhealthy {
                reason: "Server health check timed out".into()
            }
        );
    }

    #[tokio::test]
    async fn periodic_probes_publish_until_stopped() {
        let server = MockBackend::start().await;
        let (mut monitor, mut rx) = monitor(&server.url(), Duration::from_millis(50));
        monitor.start();
        assert!(monitor.is_running());

        for _ in 0..2 {
            let event = tokio::time::timeout(Duration::from_secs(2), rx.recv())
                .await
                .unwrap();
            assert_eq!(event, Some(ViewEvent::Health(HealthStatus::Healthy)));
        }

        monitor.stop();
        assert!(!monitor.is_running());
        tokio::time::sleep(Duration::from_millis(150)).await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn periodic_task_ends_when_view_closes() {
        let server = MockBackend::start().await;
        let (mut monitor, rx) = monitor(&server.url(), Duration::from_millis(20));
        drop(rx);
        monitor.start();

        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(!monitor.is_running());
    }
}
