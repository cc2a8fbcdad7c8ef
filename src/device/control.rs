//! Two-phase start/stop: send the command, then wait for the device's own
//! status to confirm it. The device is the only authority on whether it is
//! collecting, so an acknowledged command is not yet a successful one.

use super::{DeviceError, DeviceHub};
use crate::model::{DeviceCommand, ReportedState};
use tokio::time::Instant;
use uuid::Uuid;

pub const MSG_ALREADY_COLLECTING: &str = "Already collecting";
pub const MSG_ALREADY_STOPPED: &str = "Already stopped";
pub const MSG_AWAITING_CONFIRMATION: &str = "Command sent but waiting for device confirmation";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlOutcome {
    Success { message: Option<String> },
    /// Sent, but the device did not confirm within the window. The caller
    /// should re-check the status later.
    Pending { message: String },
}

/// Result of a forced STATUS round-trip.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusCheck {
    pub device_status: Option<String>,
    pub is_collecting: bool,
    pub is_processing: bool,
    pub current_state: String,
    pub server_thinks_collecting: bool,
}

impl DeviceHub {
    pub async fn start_collection(&self) -> Result<ControlOutcome, DeviceError> {
        self.drive_collection(true).await
    }

    pub async fn stop_collection(&self) -> Result<ControlOutcome, DeviceError> {
        self.drive_collection(false).await
    }

    async fn drive_collection(&self, target: bool) -> Result<ControlOutcome, DeviceError> {
        let command = if target {
            DeviceCommand::Start
        } else {
            DeviceCommand::Stop
        };

        // Subscribe before sending so a confirmation racing the reply is seen.
        let mut updates = self.subscribe_updates();
        let prepared = {
            let mut shared = self.lock();
            shared.registry.primary()?;
            if shared.state.is_collecting_device == target {
                shared.state.is_collecting_server = target;
                let message = if target {
                    MSG_ALREADY_COLLECTING
                } else {
                    MSG_ALREADY_STOPPED
                };
                tracing::info!(command = %command, "device already in requested state");
                return Ok(ControlOutcome::Success {
                    message: Some(message.to_string()),
                });
            }
            // The idempotence check and the claim on the line happen under
            // one lock, so a racing caller either sees the claim or the
            // confirmed state.
            shared.prepare_command(command)?
        };
        let dispatched = self.run_prepared(command, prepared).await?;

        let timing = self.timing().clone();
        let deadline = Instant::now() + timing.confirm_timeout;
        loop {
            if self.confirm(dispatched.id, dispatched.issued_at, target) {
                tracing::info!(command = %command, "device confirmed command");
                return Ok(ControlOutcome::Success { message: None });
            }
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let wait = timing.confirm_poll.min(deadline - now);
            let _ = tokio::time::timeout(wait, updates.changed()).await;
        }

        self.lock().release_command(dispatched.id);
        tracing::warn!(
            command = %command,
            waited_ms = timing.confirm_timeout.as_millis() as u64,
            "device did not confirm command, probing status"
        );
        let hub = self.clone();
        tokio::spawn(async move {
            if let Err(err) = hub.send_command(DeviceCommand::Status).await {
                tracing::debug!(error = %err, "follow-up status probe failed");
            }
        });
        Ok(ControlOutcome::Pending {
            message: MSG_AWAITING_CONFIRMATION.to_string(),
        })
    }

    /// True once the device reported the target state after the command was
    /// issued. Takes over the server flag and releases the command.
    fn confirm(&self, id: Uuid, issued_at: Instant, target: bool) -> bool {
        let mut shared = self.lock();
        let fresh = shared
            .state
            .last_state_update_at
            .is_some_and(|at| at > issued_at);
        if !fresh || shared.state.is_collecting_device != target {
            return false;
        }
        shared.state.is_collecting_server = target;
        if let Some(pending) = shared.pending_mut(id) {
            pending.completed = true;
        }
        shared.release_command(id);
        true
    }

    /// Forces a STATUS round-trip. `Ok(None)` means the device did not answer
    /// in time.
    pub async fn check_status(&self) -> Result<Option<StatusCheck>, DeviceError> {
        if !self.send_command(DeviceCommand::Status).await? {
            return Ok(None);
        }
        let shared = self.lock();
        let state = &shared.state;
        let is_processing = state
            .raw_status_text
            .as_deref()
            .is_some_and(|text| text.contains("Processing: YES"));
        let current_state = match &state.reported_state {
            ReportedState::Unknown => "Unknown".to_string(),
            other => other.name().to_string(),
        };
        Ok(Some(StatusCheck {
            device_status: state.raw_status_text.clone(),
            is_collecting: state.is_collecting_device,
            is_processing,
            current_state,
            server_thinks_collecting: state.is_collecting_server,
        }))
    }

    /// Forces a STATES round-trip and returns the device's raw answer.
    pub async fn list_states(&self) -> Result<Option<String>, DeviceError> {
        if !self.send_command(DeviceCommand::States).await? {
            return Ok(None);
        }
        Ok(self.lock().state.raw_status_text.clone())
    }
}
