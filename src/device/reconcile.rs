use super::{DeviceHub, Shared};
use crate::model::ReportedState;
use crate::protocol::parse_current_state;
use tokio::time::Instant;

impl Shared {
    /// Folds a parsed device state into the tracked state. The device is the
    /// source of truth: the server flag follows it and a START/STOP waiting
    /// for this outcome is completed. Returns the new state if the device
    /// just left a collecting state.
    pub(super) fn apply_reported_state(&mut self, reported: ReportedState) -> Option<ReportedState> {
        let was_collecting = self.state.is_collecting_device;
        let collecting = reported.is_collecting();
        self.state.reported_state = reported;
        self.state.is_collecting_device = collecting;
        self.state.last_state_update_at = Some(Instant::now());

        if self.state.is_collecting_server != collecting {
            tracing::info!(
                server = self.state.is_collecting_server,
                device = collecting,
                "syncing server collecting flag with device"
            );
            self.state.is_collecting_server = collecting;
        }

        if self.command_in_progress {
            if let Some(pending) = self.pending.as_mut() {
                if pending.command.target_collecting() == Some(collecting) {
                    tracing::info!(command = %pending.command, "command confirmed by device status");
                    pending.completed = true;
                    self.command_in_progress = false;
                }
            }
        }

        (was_collecting && !collecting).then(|| self.state.reported_state.clone())
    }

    /// Handles the body of a `STATUS_INFO:` push. Text without a parsable
    /// state still becomes the raw status; the reconciled state is kept.
    pub(super) fn apply_status_info(&mut self, text: &str) -> Option<ReportedState> {
        self.state.raw_status_text = Some(text.to_string());
        match parse_current_state(text) {
            Ok(state) => self.apply_reported_state(state),
            Err(err) => {
                tracing::warn!(error = %err, status = %text, "unparsable device status, keeping previous state");
                None
            }
        }
    }
}

impl DeviceHub {
    /// Publishes a state change made under the lock. Must be called after
    /// the lock is released.
    pub(super) fn after_state_change(&self, finished: Option<ReportedState>) {
        self.notify_update();
        if let Some(state) = finished {
            self.inner.sink.collection_finished(&state);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{DeviceCommand, PendingCommand};
    use rand::seq::SliceRandom;

    #[test]
    fn server_flag_converges_for_any_status_sequence() {
        let names = ["IDLE", "COLLECTING", "PROCESSING", "ERROR", "UNKNOWN"];
        let mut rng = rand::thread_rng();
        let mut shared = Shared::new();
        for _ in 0..200 {
            if let Some(name) = names.choose(&mut rng) {
                shared.state.is_collecting_server = rand::random();
                shared.apply_status_info(&format!("Current State: {name}, Processing: NO"));
                assert_eq!(
                    shared.state.is_collecting_server,
                    shared.state.is_collecting_device
                );
            }
        }
    }

    #[test]
    fn malformed_status_keeps_previous_state() {
        let mut shared = Shared::new();
        shared.apply_status_info("Current State: COLLECTING");
        let stamped = shared.state.last_state_update_at;

        shared.apply_status_info("ACTIVE");

        assert_eq!(shared.state.raw_status_text.as_deref(), Some("ACTIVE"));
        assert_eq!(shared.state.reported_state, ReportedState::Collecting);
        assert!(shared.state.is_collecting_device);
        assert_eq!(shared.state.last_state_update_at, stamped);
    }

    #[test]
    fn matching_status_completes_in_flight_start() {
        let mut shared = Shared::new();
        shared.pending = Some(PendingCommand::new(DeviceCommand::Start));
        shared.command_in_progress = true;

        shared.apply_status_info("Current State: IDLE");
        assert!(shared.command_in_progress);

        shared.apply_status_info("Current State: PROCESSING");
        assert!(!shared.command_in_progress);
        assert!(shared.pending.as_ref().is_some_and(|p| p.completed));
    }

    #[test]
    fn leaving_collection_is_reported_once() {
        let mut shared = Shared::new();
        assert_eq!(shared.apply_reported_state(ReportedState::Collecting), None);
        assert_eq!(shared.apply_reported_state(ReportedState::Processing), None);
        assert_eq!(
            shared.apply_reported_state(ReportedState::Idle),
            Some(ReportedState::Idle)
        );
        assert_eq!(shared.apply_reported_state(ReportedState::Idle), None);
    }
}
