use crate::model::{DeviceCommand, ReportedState};
use std::fmt;

pub const STATUS_INFO_PREFIX: &str = "STATUS_INFO:";
pub const CURRENT_STATE_MARKER: &str = "Current State:";
pub const MAX_LINE_LEN: usize = 4 * 1024;

pub const REPLY_WELCOME: &str = "WELCOME\n";
pub const REPLY_STATUS_RECEIVED: &str = "OK: Status received\n";

/// One line received from the device, classified before any state logic runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceMessage {
    Hello,
    /// `OK:...`, acknowledgment of an earlier command.
    Ack(String),
    /// Any line carrying `ERROR:`.
    Error(String),
    /// Text after the `STATUS_INFO:` prefix, trimmed.
    StatusInfo(String),
    Other(String),
}

impl DeviceMessage {
    /// Returns `None` for blank lines.
    pub fn parse(line: &str) -> Option<Self> {
        let line = line.trim();
        if line.is_empty() {
            return None;
        }
        let msg = if line == "HELLO" {
            Self::Hello
        } else if line.starts_with("OK:") {
            Self::Ack(line.to_string())
        } else if line.contains("ERROR:") {
            Self::Error(line.to_string())
        } else if let Some(rest) = line.strip_prefix(STATUS_INFO_PREFIX) {
            Self::StatusInfo(rest.trim().to_string())
        } else {
            Self::Other(line.to_string())
        };
        Some(msg)
    }
}

pub fn echo_reply(message: &str) -> String {
    format!("OK: {message} received\n")
}

pub fn encode_command(command: DeviceCommand) -> String {
    format!("{command}\n")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    MissingStateMarker,
    EmptyStateName,
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingStateMarker => write!(f, "missing '{CURRENT_STATE_MARKER}' marker"),
            Self::EmptyStateName => write!(f, "empty state name after '{CURRENT_STATE_MARKER}'"),
        }
    }
}

impl std::error::Error for ProtocolError {}

/// Extracts `<NAME>` from `... Current State: <NAME>, ...`. The name runs up
/// to the next comma, or to the end of the text when there is none.
pub fn parse_current_state(text: &str) -> Result<ReportedState, ProtocolError> {
    let (_, rest) = text
        .split_once(CURRENT_STATE_MARKER)
        .ok_or(ProtocolError::MissingStateMarker)?;
    let name = rest.split(',').next().unwrap_or_default().trim();
    if name.is_empty() {
        return Err(ProtocolError::EmptyStateName);
    }
    Ok(ReportedState::from_name(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classifies_device_lines() {
        assert_eq!(DeviceMessage::parse("HELLO\n"), Some(DeviceMessage::Hello));
        assert_eq!(
            DeviceMessage::parse("OK: Collection started"),
            Some(DeviceMessage::Ack("OK: Collection started".to_string()))
        );
        assert_eq!(
            DeviceMessage::parse("Sensor ERROR: I2C timeout"),
            Some(DeviceMessage::Error("Sensor ERROR: I2C timeout".to_string()))
        );
        assert_eq!(
            DeviceMessage::parse("STATUS_INFO: Current State: IDLE, Processing: NO\r\n"),
            Some(DeviceMessage::StatusInfo(
                "Current State: IDLE, Processing: NO".to_string()
            ))
        );
        assert_eq!(
            DeviceMessage::parse("battery=87"),
            Some(DeviceMessage::Other("battery=87".to_string()))
        );
    }

    #[test]
    fn blank_lines_are_skipped() {
        assert_eq!(DeviceMessage::parse(""), None);
        assert_eq!(DeviceMessage::parse(" \r\n\t"), None);
    }

    #[test]
    fn ok_prefix_wins_over_embedded_error() {
        assert!(matches!(
            DeviceMessage::parse("OK: cleared ERROR: flag"),
            Some(DeviceMessage::Ack(_))
        ));
    }

    #[test]
    fn parses_current_state_with_and_without_trailing_fields() {
        assert_eq!(
            parse_current_state("OK: Current State: COLLECTING, Processing: NO"),
            Ok(ReportedState::Collecting)
        );
        assert_eq!(
            parse_current_state("Current State: PROCESSING"),
            Ok(ReportedState::Processing)
        );
    }

    #[test]
    fn malformed_status_is_reported() {
        assert_eq!(
            parse_current_state("ACTIVE"),
            Err(ProtocolError::MissingStateMarker)
        );
        assert_eq!(
            parse_current_state("Current State: , Processing: NO"),
            Err(ProtocolError::EmptyStateName)
        );
    }

    #[test]
    fn replies_are_newline_terminated() {
        assert_eq!(echo_reply("ping"), "OK: ping received\n");
        assert_eq!(encode_command(DeviceCommand::Start), "START\n");
    }
}
