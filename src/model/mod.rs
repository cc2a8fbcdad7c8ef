use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DeviceCommand {
    Start,
    Stop,
    Status,
    States,
}

impl DeviceCommand {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Start => "START",
            Self::Stop => "STOP",
            Self::Status => "STATUS",
            Self::States => "STATES",
        }
    }

    /// START and STOP move the device between collecting and idle; they are
    /// single-flight. STATUS and STATES are read-only probes.
    pub fn changes_state(self) -> bool {
        matches!(self, Self::Start | Self::Stop)
    }

    /// The collecting flag the device should report once this command took effect.
    pub fn target_collecting(self) -> Option<bool> {
        match self {
            Self::Start => Some(true),
            Self::Stop => Some(false),
            Self::Status | Self::States => None,
        }
    }
}

impl fmt::Display for DeviceCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ReportedState {
    #[default]
    Unknown,
    Idle,
    Collecting,
    Processing,
    Disconnected,
    /// Any other state name the firmware reports (ERROR, INITIALIZING, ...).
    Other(String),
}

impl ReportedState {
    pub fn from_name(name: &str) -> Self {
        match name {
            "UNKNOWN" => Self::Unknown,
            "IDLE" => Self::Idle,
            "COLLECTING" => Self::Collecting,
            "PROCESSING" => Self::Processing,
            "DISCONNECTED" => Self::Disconnected,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn name(&self) -> &str {
        match self {
            Self::Unknown => "UNKNOWN",
            Self::Idle => "IDLE",
            Self::Collecting => "COLLECTING",
            Self::Processing => "PROCESSING",
            Self::Disconnected => "DISCONNECTED",
            Self::Other(name) => name,
        }
    }

    /// PROCESSING counts as collecting: the device is still busy with a
    /// measurement and will not accept a fresh START.
    pub fn is_collecting(&self) -> bool {
        matches!(self, Self::Collecting | Self::Processing)
    }
}

impl fmt::Display for ReportedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Default)]
pub struct DeviceState {
    pub raw_status_text: Option<String>,
    pub reported_state: ReportedState,
    pub is_collecting_device: bool,
    pub is_collecting_server: bool,
    /// `None` until the first parsed status arrives.
    pub last_state_update_at: Option<Instant>,
    pub last_data: Option<TelemetryInfo>,
}

impl DeviceState {
    pub fn disconnected() -> Self {
        Self {
            reported_state: ReportedState::Disconnected,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone)]
pub struct PendingCommand {
    pub id: Uuid,
    pub command: DeviceCommand,
    pub issued_at: Instant,
    pub completed: bool,
    pub error: Option<String>,
}

impl PendingCommand {
    pub fn new(command: DeviceCommand) -> Self {
        Self {
            id: Uuid::new_v4(),
            command,
            issued_at: Instant::now(),
            completed: false,
            error: None,
        }
    }
}

/// Decoded telemetry as pushed by the sensor to `/data`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct TelemetryReport {
    pub heart_rate: f64,
    pub oxygen_level: f64,
    pub action_class: Option<i64>,
    pub confidence: f64,
    pub device_state: Option<String>,
    pub is_collecting: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryInfo {
    pub timestamp: String,
    pub heart_rate: f64,
    pub oxygen_level: f64,
    pub action_class: i64,
    pub activity_name: String,
    pub confidence: f64,
    pub device_state: String,
}

impl TelemetryInfo {
    pub fn from_report(report: &TelemetryReport, timestamp: String) -> Self {
        let action_class = report.action_class.unwrap_or(-1);
        Self {
            timestamp,
            heart_rate: report.heart_rate,
            oxygen_level: report.oxygen_level,
            action_class,
            activity_name: activity_name(action_class).to_string(),
            confidence: report.confidence,
            device_state: report
                .device_state
                .clone()
                .unwrap_or_else(|| "Unknown".to_string()),
        }
    }
}

pub fn activity_name(action_class: i64) -> &'static str {
    match action_class {
        0 => "Resting after exercise",
        1 => "Sitting",
        2 => "Walking",
        _ => "Unknown",
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub connected: bool,
    pub collecting: bool,
    pub last_data: Option<TelemetryInfo>,
    pub device_status: Option<String>,
    pub current_state: String,
    pub time_since_update: f64,
    pub command_in_progress: bool,
    pub server_tracking_state: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn processing_counts_as_collecting() {
        assert!(ReportedState::from_name("COLLECTING").is_collecting());
        assert!(ReportedState::from_name("PROCESSING").is_collecting());
        assert!(!ReportedState::from_name("IDLE").is_collecting());
        assert!(!ReportedState::from_name("ERROR").is_collecting());
    }

    #[test]
    fn unknown_state_names_are_preserved() {
        let state = ReportedState::from_name("CALIBRATING");
        assert_eq!(state, ReportedState::Other("CALIBRATING".to_string()));
        assert_eq!(state.name(), "CALIBRATING");
    }

    #[test]
    fn telemetry_report_maps_activity_and_defaults() {
        let report: TelemetryReport = serde_json::from_str(
            r#"{"heartRate": 72, "oxygenLevel": 98.5, "actionClass": 2, "isCollecting": true}"#,
        )
        .unwrap();
        assert_eq!(report.is_collecting, Some(true));

        let info = TelemetryInfo::from_report(&report, "2024-01-01 10:00:00".to_string());
        assert_eq!(info.activity_name, "Walking");
        assert_eq!(info.device_state, "Unknown");
        assert_eq!(info.confidence, 0.0);

        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["heartRate"], 72.0);
        assert_eq!(json["activityName"], "Walking");
    }

    #[test]
    fn missing_action_class_is_unknown_activity() {
        let info = TelemetryInfo::from_report(&TelemetryReport::default(), String::new());
        assert_eq!(info.action_class, -1);
        assert_eq!(info.activity_name, "Unknown");
    }

    #[test]
    fn commands_know_their_intent() {
        assert_eq!(DeviceCommand::Start.target_collecting(), Some(true));
        assert_eq!(DeviceCommand::Stop.target_collecting(), Some(false));
        assert!(!DeviceCommand::Status.changes_state());
        assert_eq!(DeviceCommand::States.to_string(), "STATES");
    }
}
