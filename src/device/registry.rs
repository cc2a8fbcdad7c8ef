use super::{DeviceError, SessionWriter};
use crate::model::TelemetryInfo;
use std::net::SocketAddr;
use tokio::sync::watch;
use tokio::time::Instant;
use uuid::Uuid;

/// One live TCP connection to a device.
pub struct DeviceSession {
    pub id: Uuid,
    pub remote_addr: SocketAddr,
    pub connected_at: Instant,
    pub last_data: Option<TelemetryInfo>,
    writer: SessionWriter,
    closer: watch::Sender<bool>,
}

impl DeviceSession {
    pub fn new(remote_addr: SocketAddr, writer: SessionWriter, closer: watch::Sender<bool>) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr,
            connected_at: Instant::now(),
            last_data: None,
            writer,
            closer,
        }
    }

    pub fn writer(&self) -> SessionWriter {
        self.writer.clone()
    }

    /// Asks the session's read loop to stop; the loop owns the socket and
    /// shuts it down on exit. Safe to call more than once.
    pub fn close(&self) {
        let _ = self.closer.send(true);
    }
}

/// Connected devices in insertion order. Only the first entry receives
/// commands: several simultaneous devices are not supported, a second
/// connection is tracked but stays passive.
#[derive(Default)]
pub struct Registry {
    sessions: Vec<DeviceSession>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts `session`. An existing entry for the same address is
    /// replaced in place and returned (already closed).
    pub fn register(&mut self, session: DeviceSession) -> Option<DeviceSession> {
        match self
            .sessions
            .iter_mut()
            .find(|s| s.remote_addr == session.remote_addr)
        {
            Some(slot) => {
                let old = std::mem::replace(slot, session);
                old.close();
                Some(old)
            }
            None => {
                self.sessions.push(session);
                None
            }
        }
    }

    pub fn unregister(&mut self, addr: SocketAddr) -> Option<DeviceSession> {
        let idx = self.sessions.iter().position(|s| s.remote_addr == addr)?;
        Some(self.sessions.remove(idx))
    }

    /// Removes the entry only if it still belongs to session `id`; a
    /// reconnect from the same address may have replaced it.
    pub fn unregister_session(&mut self, id: Uuid) -> Option<DeviceSession> {
        let addr = self.sessions.iter().find(|s| s.id == id)?.remote_addr;
        self.unregister(addr)
    }

    pub fn primary(&self) -> Result<&DeviceSession, DeviceError> {
        self.sessions.first().ok_or(DeviceError::NoDeviceConnected)
    }

    pub fn primary_mut(&mut self) -> Option<&mut DeviceSession> {
        self.sessions.first_mut()
    }

    /// Most recent connect time across all sessions.
    pub fn latest_connected_at(&self) -> Option<Instant> {
        self.sessions.iter().map(|s| s.connected_at).max()
    }

    pub fn clear(&mut self) -> usize {
        for session in &self.sessions {
            session.close();
        }
        let count = self.sessions.len();
        self.sessions.clear();
        count
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}
