use serde::{Deserialize, Serialize};

/// A GRBL alarm code, `1..=9`. Codes outside that range are still carried
/// (GRBL has occasionally added new ones) but render as "unknown alarm".
pub type AlarmCode = u8;

/// The machine's current state, as reported by the most recent status line.
///
/// Transitions are driven solely by status reports; nothing in the host
/// mutates this directly (§3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "code")]
pub enum MachineState {
    /// No motion queued or executing.
    Idle,
    /// Executing a program or jog.
    Run,
    /// Feed-held; motion paused, resumable with cycle start.
    Hold,
    /// In an alarm condition; the carried code identifies the cause.
    Alarm(AlarmCode),
    /// Running the homing cycle.
    Home,
    /// In G-code check mode (no motion, syntax-only).
    Check,
    /// Safety door open.
    Door,
    /// Sleeping after an `M1`/idle timeout (GRBL 1.1+).
    Sleep,
    /// No status has been observed since connecting, or the link is down.
    Disconnected,
}

impl MachineState {
    /// Parse the leading state word of a status report (e.g. `"Idle"`,
    /// `"Hold:0"`, `"Door:1"`). The numeric suffix on `Hold`/`Door` is GRBL's
    /// own sub-state and is not modelled separately here — both sub-states
    /// collapse to the same variant, matching §3's tagged-variant model.
    pub fn parse(word: &str) -> Option<MachineState> {
        let base = word.split(':').next().unwrap_or(word);
        match base {
            "Idle" => Some(MachineState::Idle),
            "Run" => Some(MachineState::Run),
            "Hold" => Some(MachineState::Hold),
            "Home" => Some(MachineState::Home),
            "Check" => Some(MachineState::Check),
            "Door" => Some(MachineState::Door),
            "Sleep" => Some(MachineState::Sleep),
            "Alarm" => Some(MachineState::Alarm(0)),
            _ => None,
        }
    }

    /// Whether the machine is in any alarm condition.
    pub fn is_alarm(&self) -> bool {
        matches!(self, MachineState::Alarm(_))
    }

    /// Whether the machine is free to accept a new jog or homing request.
    pub fn is_idle(&self) -> bool {
        matches!(self, MachineState::Idle)
    }
}

/// The fixed GRBL alarm table (§4.3): codes `1..=9` map to a human message.
pub fn alarm_message(code: AlarmCode) -> &'static str {
    match code {
        1 => "Hard limit triggered. Machine position is likely lost.",
        2 => "G-code motion target exceeds machine travel.",
        3 => "Reset while in motion. Grbl cannot guarantee position.",
        4 => "Probe fail. The probe is not in the expected initial state before starting probe cycle.",
        5 => "Probe fail. Probe did not contact the workpiece within the programmed travel.",
        6 => "Homing fail. Reset during active homing cycle.",
        7 => "Homing fail. Safety door was opened during active homing cycle.",
        8 => "Homing fail. Cycle failed to clear limit switch. Try increasing pull-off setting or check wiring.",
        9 => "Homing fail. Could not find limit switch within search distance.",
        _ => "Unknown alarm code",
    }
}

/// The fixed GRBL error-code table referenced by the wire protocol (§6):
/// `error:<n>` lines returned in response to a rejected command.
pub fn grbl_error_message(code: u16) -> &'static str {
    match code {
        1 => "G-code words consist of a letter and a value. Letter was not found.",
        2 => "Numeric value format is not valid or missing an expected value.",
        3 => "Grbl '$' system command was not recognized or supported.",
        4 => "Negative value received for an expected positive value.",
        5 => "Homing cycle is not enabled via settings.",
        6 => "Minimum step pulse time must be greater than 3usec.",
        7 => "EEPROM read failed. Reset and restored to default values.",
        8 => "Grbl '$' command cannot be used unless Grbl is IDLE.",
        9 => "G-code locked out during alarm or jog state.",
        10 => "Soft limits cannot be enabled without homing also enabled.",
        11 => "Max characters per line exceeded. Line was not processed and executed.",
        12 => "Grbl '$' setting value exceeds the maximum step rate supported.",
        13 => "Safety door detected as opened and door state initiated.",
        14 => "Build info or startup line exceeded EEPROM line length limit.",
        15 => "Jog target exceeds machine travel. Command ignored.",
        16 => "Jog command with no '=' or contains prohibited g-code.",
        17 => "Laser mode requires PWM output.",
        20 => "Unsupported or invalid g-code command found in block.",
        21 => "More than one g-code command from same modal group found in block.",
        22 => "Feed rate has not yet been set or is undefined.",
        23 => "G-code command in block requires an integer value.",
        24 => "Two G-code commands that both require the use of the XYZ axis words were detected.",
        25 => "A G-code word was repeated in the block.",
        26 => "A G-code command implicitly or explicitly requires XYZ axis words but none were detected.",
        27 => "N line number value is not within the valid range of 1 - 9,999,999.",
        28 => "A G-code command was sent, but is missing required P or L value words.",
        29 => "Grbl supports six work coordinate systems G54-G59. G59.1, G59.2, and G59.3 are not supported.",
        30 => "The G53 G-code command requires either a G0 seek or G1 feed motion mode.",
        31 => "There are unused axis words in the block and G80 motion mode cancel is active.",
        32 => "A G2 or G3 arc was commanded but there are no XYZ axis words.",
        33 => "The motion command has an invalid target. G2, G3, and G38.2 generates this error.",
        34 => "Arc radius value is invalid.",
        35 => "G2 and G3 arcs require at least one in-plane axis word.",
        36 => "Multiple axis words found in the same command block.",
        37 => "Line number is missing. Coordinate offsets must be specified with a line number.",
        38 => "A G59.x work coordinate system is not supported.",
        _ => "Unknown error code",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_and_substated_words() {
        assert_eq!(MachineState::parse("Idle"), Some(MachineState::Idle));
        assert_eq!(MachineState::parse("Hold:0"), Some(MachineState::Hold));
        assert_eq!(MachineState::parse("Door:1"), Some(MachineState::Door));
        assert_eq!(MachineState::parse("Bogus"), None);
    }

    #[test]
    fn alarm_table_covers_documented_range() {
        for code in 1..=9 {
            assert_ne!(alarm_message(code), "Unknown alarm code");
        }
        assert_eq!(alarm_message(200), "Unknown alarm code");
    }
}
