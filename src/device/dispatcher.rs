use super::session::write_line;
use super::{DeviceError, DeviceHub, ReplyWaiter, SessionWriter, Shared};
use crate::model::{DeviceCommand, PendingCommand};
use crate::protocol::{encode_command, parse_current_state, CURRENT_STATE_MARKER};
use std::io;
use std::net::SocketAddr;
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

/// Outcome of one command round-trip.
#[derive(Debug, Clone, Copy)]
pub struct Dispatched {
    pub id: Uuid,
    pub issued_at: Instant,
    pub completed: bool,
}

/// A command registered under the lock and ready to be written.
pub(super) struct Prepared {
    id: Uuid,
    issued_at: Instant,
    session_id: Uuid,
    addr: SocketAddr,
    writer: SessionWriter,
    reply: oneshot::Receiver<String>,
}

impl DeviceHub {
    /// Sends `command` to the primary device and waits a bounded time for
    /// its reply. Returns whether the command counts as completed; a missing
    /// reply is not an error, a later status push may still complete it.
    pub async fn send_command(&self, command: DeviceCommand) -> Result<bool, DeviceError> {
        self.dispatch(command).await.map(|d| d.completed)
    }

    pub(super) async fn dispatch(&self, command: DeviceCommand) -> Result<Dispatched, DeviceError> {
        let prepared = self.lock().prepare_command(command)?;
        self.run_prepared(command, prepared).await
    }

    pub(super) async fn run_prepared(
        &self,
        command: DeviceCommand,
        prepared: Prepared,
    ) -> Result<Dispatched, DeviceError> {
        let Prepared {
            id,
            issued_at,
            session_id,
            addr,
            writer,
            reply,
        } = prepared;

        tracing::info!(command = %command, addr = %addr, "sending device command");
        let write_limit = self.timing().reply_timeout;
        if let Err(err) = write_line(&writer, &encode_command(command), write_limit).await {
            return Err(self.write_failed(id, session_id, addr, &writer, err).await);
        }

        let completed = match tokio::time::timeout(self.timing().reply_timeout, reply).await {
            Ok(Ok(text)) => {
                tracing::info!(command = %command, addr = %addr, reply = %text, "device reply");
                self.apply_reply(id, &text)
            }
            Ok(Err(_)) => {
                let mut shared = self.lock();
                if let Some(pending) = shared.pending_mut(id) {
                    pending.error = Some("connection closed while awaiting reply".to_string());
                }
                shared.release_command(id);
                drop(shared);
                tracing::warn!(command = %command, addr = %addr, "device went away before replying");
                return Err(DeviceError::DeviceDisconnected);
            }
            Err(_) => {
                tracing::warn!(command = %command, addr = %addr, "timed out waiting for device reply");
                let mut shared = self.lock();
                if shared
                    .reply_waiter
                    .as_ref()
                    .is_some_and(|w| w.command_id == id)
                {
                    shared.reply_waiter = None;
                }
                shared.pending_completed(id)
            }
        };

        Ok(Dispatched {
            id,
            issued_at,
            completed,
        })
    }

    /// Records the raw reply and folds any reported state into the tracked
    /// state. Returns whether the command is completed.
    fn apply_reply(&self, id: Uuid, text: &str) -> bool {
        let (completed, finished) = {
            let mut shared = self.lock();
            shared.state.raw_status_text = Some(text.to_string());
            let acked = text.contains("OK:");
            if acked {
                if let Some(pending) = shared.pending_mut(id) {
                    pending.completed = true;
                }
            }
            let finished = if text.contains(CURRENT_STATE_MARKER) {
                match parse_current_state(text) {
                    Ok(state) => shared.apply_reported_state(state),
                    Err(err) => {
                        tracing::warn!(error = %err, reply = %text, "unparsable state in device reply");
                        None
                    }
                }
            } else {
                None
            };
            (acked || shared.pending_completed(id), finished)
        };
        self.after_state_change(finished);
        completed
    }

    /// A failed or stalled write may be a dead peer or a transient error. A
    /// newline probe tells them apart; a dead session is evicted.
    async fn write_failed(
        &self,
        id: Uuid,
        session_id: Uuid,
        addr: SocketAddr,
        writer: &SessionWriter,
        err: io::Error,
    ) -> DeviceError {
        tracing::error!(addr = %addr, error = %err, "device command write failed");
        {
            let mut shared = self.lock();
            if let Some(pending) = shared.pending_mut(id) {
                pending.error = Some(err.to_string());
            }
            shared.release_command(id);
            if shared
                .reply_waiter
                .as_ref()
                .is_some_and(|w| w.command_id == id)
            {
                shared.reply_waiter = None;
            }
        }

        if write_line(writer, "\n", self.timing().reply_timeout).await.is_ok() {
            return DeviceError::Transport(err.to_string());
        }

        tracing::warn!(addr = %addr, "device appears disconnected, removing session");
        let evicted = self.lock().registry.unregister_session(session_id);
        if let Some(session) = evicted {
            session.close();
        }
        self.notify_update();
        DeviceError::DeviceDisconnected
    }
}

impl Shared {
    pub(super) fn prepare_command(&mut self, command: DeviceCommand) -> Result<Prepared, DeviceError> {
        let session = self.registry.primary()?;
        let (session_id, addr, writer) = (session.id, session.remote_addr, session.writer());

        // Replies carry no correlation id, so only one command may be
        // waiting on the line at a time.
        if self.reply_waiter.is_some() {
            return Err(DeviceError::CommandInProgress);
        }
        if command.changes_state() && self.command_in_progress {
            return Err(DeviceError::CommandInProgress);
        }

        let pending = PendingCommand::new(command);
        let (id, issued_at) = (pending.id, pending.issued_at);
        let (tx, reply) = oneshot::channel();
        self.reply_waiter = Some(ReplyWaiter {
            command_id: id,
            session_id,
            tx,
        });
        // A probe never replaces the record of an unconfirmed START/STOP.
        if command.changes_state() || !self.command_in_progress {
            if let Some(prev) = self.pending.as_ref() {
                if let Some(err) = prev.error.as_deref() {
                    tracing::debug!(command = %prev.command, error = %err, "superseding failed command record");
                }
            }
            self.pending = Some(pending);
        }
        if command.changes_state() {
            self.command_in_progress = true;
        }

        Ok(Prepared {
            id,
            issued_at,
            session_id,
            addr,
            writer,
            reply,
        })
    }
}
