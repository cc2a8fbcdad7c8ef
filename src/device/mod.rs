//! Device connection lifecycle and collection-state reconciliation.
//!
//! [`DeviceHub`] is the single context object shared by the TCP session
//! handlers, the HTTP layer and the liveness monitor. The connection
//! registry, the device state and the in-flight command record sit behind
//! one mutex so that decisions such as "is a command already in progress"
//! always see a consistent snapshot. The mutex is never held across I/O.

pub mod control;
pub mod dispatcher;
pub mod liveness;
mod reconcile;
pub mod registry;
pub mod session;

use crate::config::TimingConfig;
use crate::model::{
    DeviceState, PendingCommand, ReportedState, StatusSnapshot, TelemetryInfo, TelemetryReport,
};
use registry::Registry;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::io::AsyncWrite;
use tokio::sync::{oneshot, watch};
use uuid::Uuid;

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type SessionWriter = Arc<tokio::sync::Mutex<BoxedWriter>>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceError {
    NoDeviceConnected,
    CommandInProgress,
    DeviceDisconnected,
    /// The write failed but the connection still answered a probe.
    Transport(String),
}

impl fmt::Display for DeviceError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoDeviceConnected => write!(f, "No device connected"),
            Self::CommandInProgress => write!(f, "Another command is already in progress"),
            Self::DeviceDisconnected => write!(f, "Device disconnected"),
            Self::Transport(err) => write!(f, "Failed to send command: {err}"),
        }
    }
}

impl std::error::Error for DeviceError {}

#[derive(Debug, Clone)]
pub struct Timing {
    pub reply_timeout: Duration,
    pub confirm_timeout: Duration,
    pub confirm_poll: Duration,
    pub liveness_tick: Duration,
    pub liveness_timeout: Duration,
}

impl Default for Timing {
    fn default() -> Self {
        Self::from(&TimingConfig::default())
    }
}

impl From<&TimingConfig> for Timing {
    fn from(cfg: &TimingConfig) -> Self {
        Self {
            reply_timeout: Duration::from_millis(cfg.reply_timeout_ms),
            confirm_timeout: Duration::from_millis(cfg.confirm_timeout_ms),
            confirm_poll: Duration::from_millis(cfg.confirm_poll_ms),
            liveness_tick: Duration::from_millis(cfg.liveness_tick_ms),
            liveness_timeout: Duration::from_millis(cfg.liveness_timeout_ms),
        }
    }
}

/// Downstream consumer of accepted telemetry (CSV writers, analysis jobs).
pub trait TelemetrySink: Send + Sync {
    fn record(&self, info: &TelemetryInfo);

    /// Called once the device reports it left a collecting state; the
    /// trigger for persisting the finished measurement.
    fn collection_finished(&self, final_state: &ReportedState);
}

pub struct LogSink;

impl TelemetrySink for LogSink {
    fn record(&self, info: &TelemetryInfo) {
        tracing::debug!(
            heart_rate = info.heart_rate,
            oxygen_level = info.oxygen_level,
            activity = %info.activity_name,
            "telemetry recorded"
        );
    }

    fn collection_finished(&self, final_state: &ReportedState) {
        tracing::info!(state = %final_state, "collection finished");
    }
}

/// Routes the next command reply from one session to the waiting dispatcher.
struct ReplyWaiter {
    command_id: Uuid,
    session_id: Uuid,
    tx: oneshot::Sender<String>,
}

struct Shared {
    registry: Registry,
    state: DeviceState,
    pending: Option<PendingCommand>,
    /// Single-flight guard for START/STOP, held until the device confirms or
    /// the confirmation window closes.
    command_in_progress: bool,
    reply_waiter: Option<ReplyWaiter>,
}

impl Shared {
    fn new() -> Self {
        Self {
            registry: Registry::new(),
            state: DeviceState::default(),
            pending: None,
            command_in_progress: false,
            reply_waiter: None,
        }
    }

    fn pending_mut(&mut self, id: Uuid) -> Option<&mut PendingCommand> {
        self.pending.as_mut().filter(|p| p.id == id)
    }

    fn pending_completed(&self, id: Uuid) -> bool {
        self.pending
            .as_ref()
            .is_some_and(|p| p.id == id && p.completed)
    }

    /// Drops the single-flight guard if `id` still owns it.
    fn release_command(&mut self, id: Uuid) {
        if self.pending.as_ref().is_some_and(|p| p.id == id) {
            self.command_in_progress = false;
        }
    }

    /// Closes every session and forgets everything learned from the device.
    fn reset_disconnected(&mut self) -> usize {
        let closed = self.registry.clear();
        self.state = DeviceState::disconnected();
        self.pending = None;
        self.command_in_progress = false;
        self.reply_waiter = None;
        closed
    }
}

struct HubInner {
    shared: Mutex<Shared>,
    updates: watch::Sender<u64>,
    timing: Timing,
    sink: Arc<dyn TelemetrySink>,
}

#[derive(Clone)]
pub struct DeviceHub {
    inner: Arc<HubInner>,
}

impl DeviceHub {
    pub fn new(timing: Timing, sink: Arc<dyn TelemetrySink>) -> Self {
        let (updates, _) = watch::channel(0);
        Self {
            inner: Arc::new(HubInner {
                shared: Mutex::new(Shared::new()),
                updates,
                timing,
                sink,
            }),
        }
    }

    pub fn timing(&self) -> &Timing {
        &self.inner.timing
    }

    fn lock(&self) -> MutexGuard<'_, Shared> {
        self.inner
            .shared
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Wakes everything waiting on [`DeviceHub::subscribe_updates`].
    fn notify_update(&self) {
        self.inner.updates.send_modify(|v| *v = v.wrapping_add(1));
    }

    pub fn subscribe_updates(&self) -> watch::Receiver<u64> {
        self.inner.updates.subscribe()
    }

    pub fn snapshot(&self) -> StatusSnapshot {
        let shared = self.lock();
        let state = &shared.state;
        if shared.registry.is_empty() {
            return StatusSnapshot {
                connected: false,
                collecting: false,
                last_data: None,
                device_status: None,
                current_state: ReportedState::Disconnected.name().to_string(),
                time_since_update: -1.0,
                command_in_progress: false,
                server_tracking_state: state.is_collecting_server,
            };
        }
        let current_state = match &state.reported_state {
            ReportedState::Unknown => "Unknown".to_string(),
            other => other.name().to_string(),
        };
        let last_data = shared
            .registry
            .primary()
            .ok()
            .and_then(|session| session.last_data.clone())
            .or_else(|| state.last_data.clone());
        StatusSnapshot {
            connected: true,
            collecting: state.is_collecting_device,
            last_data,
            device_status: state.raw_status_text.clone(),
            current_state,
            time_since_update: state
                .last_state_update_at
                .map(|at| at.elapsed().as_secs_f64())
                .unwrap_or(-1.0),
            command_in_progress: shared.command_in_progress,
            server_tracking_state: state.is_collecting_server,
        }
    }

    /// Accepts a telemetry record from the data channel. A payload-provided
    /// `isCollecting` only moves the server flag; the next device status
    /// report overrides it.
    pub fn record_telemetry(&self, report: &TelemetryReport) -> TelemetryInfo {
        let timestamp = chrono::Local::now().format("%Y-%m-%d %H:%M:%S").to_string();
        let info = TelemetryInfo::from_report(report, timestamp);
        {
            let mut shared = self.lock();
            shared.state.last_data = Some(info.clone());
            if let Some(flag) = report.is_collecting {
                if shared.state.is_collecting_server != flag {
                    tracing::info!(
                        is_collecting = flag,
                        "server collecting flag updated from data payload"
                    );
                }
                shared.state.is_collecting_server = flag;
            }
            if let Some(session) = shared.registry.primary_mut() {
                session.last_data = Some(info.clone());
            }
        }
        self.inner.sink.record(&info);
        info
    }

    /// Administrative recovery: closes every device connection and resets
    /// all tracked state.
    pub fn clear_connections(&self) -> usize {
        let closed = self.lock().reset_disconnected();
        self.notify_update();
        tracing::info!(closed, "cleared all device connections");
        closed
    }
}
