use super::DeviceHub;
use tokio::sync::watch;
use tokio::time::{Instant, MissedTickBehavior};

impl DeviceHub {
    /// Evicts every session once the device has been silent for longer than
    /// the liveness timeout. The baseline is the last state report, or the
    /// latest connect when that is more recent. Returns whether a reset
    /// happened.
    pub fn check_liveness(&self) -> bool {
        let timeout = self.timing().liveness_timeout;
        let (evicted, silent_for) = {
            let mut shared = self.lock();
            let baseline = [
                shared.state.last_state_update_at,
                shared.registry.latest_connected_at(),
            ]
            .into_iter()
            .flatten()
            .max();
            let Some(baseline) = baseline else {
                return false;
            };
            let silent_for = Instant::now().saturating_duration_since(baseline);
            if shared.registry.is_empty() || silent_for <= timeout {
                return false;
            }
            (shared.reset_disconnected(), silent_for)
        };
        self.notify_update();
        tracing::warn!(
            evicted,
            silent_ms = silent_for.as_millis() as u64,
            "no device updates within liveness timeout, connection reset"
        );
        true
    }
}

/// Periodic liveness check until `shutdown` fires.
pub async fn run(hub: DeviceHub, mut shutdown: watch::Receiver<bool>) {
    let mut ticker = tokio::time::interval(hub.timing().liveness_tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                hub.check_liveness();
            }
            _ = shutdown.changed() => break,
        }
    }
    tracing::debug!("liveness monitor stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::testing::*;
    use crate::model::ReportedState;
    use std::time::Duration;

    #[tokio::test]
    async fn silent_device_is_evicted() {
        let hub = test_hub();
        let (mut device, task) = connect(&hub, 45000);
        assert!(!hub.check_liveness());

        tokio::time::sleep(hub.timing().liveness_timeout + Duration::from_millis(50)).await;
        assert!(hub.check_liveness());

        assert!(!hub.is_connected());
        assert_eq!(hub.device_state().reported_state, ReportedState::Disconnected);
        assert_eq!(hub.snapshot().current_state, "DISCONNECTED");
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(device.try_read_line(Duration::from_millis(50)).await, None);
    }

    #[tokio::test]
    async fn reporting_device_stays_until_silent() {
        let hub = test_hub();
        let (mut device, _task) = connect(&hub, 45001);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let monitor = tokio::spawn(run(hub.clone(), shutdown_rx));

        for _ in 0..6 {
            device.send("STATUS_INFO:Current State: COLLECTING, Processing: NO").await;
            assert_eq!(device.read_line().await, "OK: Status received");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert!(hub.is_connected());

        tokio::time::sleep(hub.timing().liveness_timeout * 2).await;
        assert!(!hub.is_connected());
        let state = hub.device_state();
        assert!(!state.is_collecting_device);
        assert!(!state.is_collecting_server);
        assert!(state.last_data.is_none());

        shutdown_tx.send(true).unwrap();
        monitor.await.unwrap();
    }

    #[test]
    fn empty_registry_is_never_reset() {
        let hub = test_hub();
        assert!(!hub.check_liveness());
    }
}
