//! Pure parser over lines received from a GRBL device (§4.3). Nothing here
//! touches I/O; it only classifies already-decoded `&str` lines.

use grbl_core::{machine_state, MachineState, Position};

/// A decoded status report: `<STATE|MPos:x,y,z|...>` (§4.3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StatusReport {
    /// Decoded leading state word.
    pub state: MachineState,
    /// `MPos` triple, if present.
    pub machine_position: Option<Position>,
    /// `WPos` triple, if present.
    pub work_position: Option<Position>,
    /// `F` feed rate, from either a bare `|F:f` tail or the `f` half of
    /// `|FS:f,s`.
    pub feed_rate: Option<f64>,
    /// Spindle speed, from the `s` half of `|FS:f,s`, if present.
    pub spindle_speed: Option<f64>,
}

/// A decoded probe report: `[PRB:x,y,z:contact]` (§4.3).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProbeReport {
    /// Reported probe-contact position.
    pub position: Position,
    /// Whether the probe made contact (`contact == 1`).
    pub contact: bool,
}

/// A decoded `ALARM:<n>` line (§4.3).
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmEvent {
    /// The numeric alarm code, `1..=9` per the documented table.
    pub code: u8,
    /// Human-readable message looked up from `code`.
    pub message: String,
}

/// A decoded `error:<n>` line — supplements §4.3's status/alarm/probe
/// classification with the numeric GRBL error table.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorEvent {
    /// The numeric error code.
    pub code: u16,
    /// Human-readable message looked up from `code`.
    pub message: String,
}

/// The result of classifying one line from the device.
#[derive(Debug, Clone, PartialEq)]
pub enum LineKind {
    /// `<...>` status report.
    Status(StatusReport),
    /// `[PRB:...]` probe report.
    Probe(ProbeReport),
    /// `ALARM:<n>`.
    Alarm(AlarmEvent),
    /// `error:<n>`.
    Error(ErrorEvent),
    /// A bare `ok` (or a line containing it per §4.2's matching rule).
    Ok,
    /// Anything else: opaque, never fatal.
    Other(String),
}

fn parse_position(fields: &str) -> Option<Position> {
    let mut parts = fields.splitn(3, ',');
    let x: f64 = parts.next()?.trim().parse().ok()?;
    let y: f64 = parts.next()?.trim().parse().ok()?;
    let z: f64 = parts.next()?.trim().parse().ok()?;
    Some(Position::new(x, y, z))
}

/// A stateless GRBL line classifier/parser. Carries no fields; exists only
/// to group the related parsing functions under one name, matching the
/// `ProtocolCodec` the controller holds a reference to.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProtocolCodec;

impl ProtocolCodec {
    /// Classify and fully decode one line from the device.
    pub fn classify(&self, line: &str) -> LineKind {
        let trimmed = line.trim();
        if let Some(status) = Self::parse_status(trimmed) {
            return LineKind::Status(status);
        }
        if let Some(probe) = Self::parse_probe(trimmed) {
            return LineKind::Probe(probe);
        }
        if let Some(alarm) = Self::parse_alarm(trimmed) {
            return LineKind::Alarm(alarm);
        }
        if let Some(error) = Self::parse_error(trimmed) {
            return LineKind::Error(error);
        }
        if trimmed == "ok" || trimmed.contains("ok") {
            return LineKind::Ok;
        }
        LineKind::Other(trimmed.to_string())
    }

    /// Parse a status report: `<STATE|MPos:x,y,z|...>`. Walks the
    /// `|`-separated fields rather than asserting one fixed tail shape, so
    /// `|WPos:...`, `|FS:f,s`, `|F:f`, or nothing further are all accepted.
    pub fn parse_status(line: &str) -> Option<StatusReport> {
        let inner = line.strip_prefix('<')?.strip_suffix('>')?;
        let mut fields = inner.split('|');
        let state = MachineState::parse(fields.next()?)?;

        let mut machine_position = None;
        let mut work_position = None;
        let mut feed_rate = None;
        let mut spindle_speed = None;

        for field in fields {
            if let Some(rest) = field.strip_prefix("MPos:") {
                machine_position = parse_position(rest);
            } else if let Some(rest) = field.strip_prefix("WPos:") {
                work_position = parse_position(rest);
            } else if let Some(rest) = field.strip_prefix("FS:") {
                let mut parts = rest.splitn(2, ',');
                feed_rate = parts.next().and_then(|s| s.trim().parse().ok());
                spindle_speed = parts.next().and_then(|s| s.trim().parse().ok());
            } else if let Some(rest) = field.strip_prefix("F:") {
                feed_rate = rest.trim().parse().ok();
            }
        }

        Some(StatusReport {
            state,
            machine_position,
            work_position,
            feed_rate,
            spindle_speed,
        })
    }

    /// Parse a probe report: `[PRB:x,y,z:contact]`.
    pub fn parse_probe(line: &str) -> Option<ProbeReport> {
        let inner = line.strip_prefix("[PRB:")?.strip_suffix(']')?;
        let (coords, contact) = inner.rsplit_once(':')?;
        let position = parse_position(coords)?;
        let contact = contact.trim() == "1";
        Some(ProbeReport { position, contact })
    }

    /// Parse an alarm line: `ALARM:<n>`.
    pub fn parse_alarm(line: &str) -> Option<AlarmEvent> {
        let code: u8 = line.strip_prefix("ALARM:")?.trim().parse().ok()?;
        Some(AlarmEvent {
            code,
            message: machine_state::alarm_message(code).to_string(),
        })
    }

    /// Parse an error line: `error:<n>`.
    pub fn parse_error(line: &str) -> Option<ErrorEvent> {
        let code: u16 = line.strip_prefix("error:")?.trim().parse().ok()?;
        Some(ErrorEvent {
            code,
            message: machine_state::grbl_error_message(code).to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_status_report_with_mpos_and_feed() {
        let status = ProtocolCodec::parse_status("<Idle|MPos:1.5,-2.0,3.25|F:0>").unwrap();
        assert_eq!(status.state, MachineState::Idle);
        assert_eq!(status.machine_position, Some(Position::new(1.5, -2.0, 3.25)));
        assert_eq!(status.feed_rate, Some(0.0));
    }

    #[test]
    fn decodes_status_report_with_fs_tail() {
        let status = ProtocolCodec::parse_status("<Run|MPos:0,0,0|FS:500,12000>").unwrap();
        assert_eq!(status.feed_rate, Some(500.0));
        assert_eq!(status.spindle_speed, Some(12000.0));
    }

    #[test]
    fn decodes_probe_report() {
        let probe = ProtocolCodec::parse_probe("[PRB:0.000,0.000,-1.234:1]").unwrap();
        assert!(probe.contact);
        assert_eq!(probe.position, Position::new(0.0, 0.0, -1.234));
    }

    #[test]
    fn decodes_alarm_and_error_lines() {
        let alarm = ProtocolCodec::parse_alarm("ALARM:1").unwrap();
        assert_eq!(alarm.code, 1);
        assert!(alarm.message.contains("Hard limit"));

        let error = ProtocolCodec::parse_error("error:9").unwrap();
        assert_eq!(error.code, 9);
        assert!(error.message.contains("alarm or jog"));
    }

    #[test]
    fn classify_falls_back_to_opaque() {
        let codec = ProtocolCodec;
        assert_eq!(codec.classify("ok"), LineKind::Ok);
        assert_eq!(
            codec.classify("[G54:0.000,0.000,0.000]"),
            LineKind::Other("[G54:0.000,0.000,0.000]".to_string())
        );
    }
}
