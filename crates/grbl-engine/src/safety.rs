//! Static, pure-function validation of one outgoing line against the
//! machine's configured limits and modal state (§4.4).

use std::collections::HashMap;

use grbl_core::{Position, SoftLimits, SpeedLimits};

/// Prefixes that are legal but potentially dangerous: accepted with a
/// warning rather than rejected (§4.4 rule 2, §9's warn-and-proceed policy).
const UNSAFE_BUT_LEGAL_PREFIXES: &[&str] = &[
    "M3", "M4", "M5", "M7", "M8", "M9", "G38.2", "G38.3", "G38.4", "G38.5",
];

/// Outcome of validating one line.
#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    /// Accepted outright.
    Valid,
    /// Accepted, but the caller should surface this message out-of-band.
    Warn(String),
    /// Rejected; the command must not be sent.
    Invalid(String),
}

impl ValidationOutcome {
    /// Whether the command may proceed (`Valid` or `Warn`).
    pub fn is_accepted(&self) -> bool {
        !matches!(self, ValidationOutcome::Invalid(_))
    }
}

fn extract_words(line: &str) -> HashMap<char, f64> {
    let mut words = HashMap::new();
    for token in line.split_whitespace() {
        let mut chars = token.chars();
        let Some(letter) = chars.next() else { continue };
        if !letter.is_ascii_alphabetic() {
            continue;
        }
        let rest: String = chars.collect();
        if let Ok(value) = rest.parse::<f64>() {
            words.insert(letter.to_ascii_uppercase(), value);
        }
    }
    words
}

fn first_word(line: &str) -> &str {
    line.split_whitespace().next().unwrap_or("")
}

/// Pure validator: given the current soft/speed limits and position, decide
/// whether a line may be sent.
#[derive(Debug, Default, Clone, Copy)]
pub struct SafetyValidator;

impl SafetyValidator {
    /// Run the ordered rules of §4.4 against `line`.
    pub fn validate(
        line: &str,
        limits: &SoftLimits,
        speed: &SpeedLimits,
        current_position: Position,
    ) -> ValidationOutcome {
        let trimmed = line.trim();

        // Rule 1: non-empty after trim.
        if trimmed.is_empty() {
            return ValidationOutcome::Invalid("empty command".to_string());
        }

        // Rule 2: unsafe-but-legal prefixes warn and accept immediately.
        let command = first_word(trimmed);
        if UNSAFE_BUT_LEGAL_PREFIXES
            .iter()
            .any(|prefix| command.eq_ignore_ascii_case(prefix))
        {
            return ValidationOutcome::Warn(format!("{command} is accepted but unsafe-but-legal"));
        }

        let words = extract_words(trimmed);

        // Rule 3: direct motion commands.
        if matches!(command, "G0" | "G1" | "G2" | "G3") {
            if let Some(outcome) = Self::check_travel_and_feed(&words, limits, speed.max_feed_rate)
            {
                return outcome;
            }
            return ValidationOutcome::Valid;
        }

        // Rule 4: jog commands, always incremental.
        if let Some(rest) = trimmed.strip_prefix("$J=") {
            let jog_words = extract_words(rest);
            if let Some(feed) = jog_words.get(&'F') {
                if *feed > speed.max_jog_rate {
                    return ValidationOutcome::Invalid(format!(
                        "jog feed {feed} exceeds max_jog_rate {}",
                        speed.max_jog_rate
                    ));
                }
            }
            let projected = Position::new(
                current_position.x + jog_words.get(&'X').copied().unwrap_or(0.0),
                current_position.y + jog_words.get(&'Y').copied().unwrap_or(0.0),
                current_position.z + jog_words.get(&'Z').copied().unwrap_or(0.0),
            );
            if !limits.contains(projected) {
                return ValidationOutcome::Invalid(format!(
                    "projected jog position {projected:?} exceeds soft limits"
                ));
            }
            return ValidationOutcome::Valid;
        }

        // Rule 5: everything else is accepted.
        ValidationOutcome::Valid
    }

    fn check_travel_and_feed(
        words: &HashMap<char, f64>,
        limits: &SoftLimits,
        max_feed_rate: f64,
    ) -> Option<ValidationOutcome> {
        for axis in ['X', 'Y', 'Z'] {
            if let Some(&value) = words.get(&axis) {
                let point = match axis {
                    'X' => Position::new(value, 0.0, 0.0),
                    'Y' => Position::new(0.0, value, 0.0),
                    _ => Position::new(0.0, 0.0, value),
                };
                let in_range = match axis {
                    'X' => limits.x.contains(point.x),
                    'Y' => limits.y.contains(point.y),
                    _ => limits.z.contains(point.z),
                };
                if !in_range {
                    return Some(ValidationOutcome::Invalid(format!(
                        "{axis}{value} exceeds soft limits"
                    )));
                }
            }
        }
        if let Some(&feed) = words.get(&'F') {
            if feed > max_feed_rate {
                return Some(ValidationOutcome::Invalid(format!(
                    "feed {feed} exceeds max_feed_rate {max_feed_rate}"
                )));
            }
        }
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn origin() -> Position {
        Position::ORIGIN
    }

    #[test]
    fn rejects_travel_outside_soft_limits() {
        let outcome = SafetyValidator::validate(
            "G0 X1000 Y1000",
            &SoftLimits::default(),
            &SpeedLimits::default(),
            origin(),
        );
        assert!(matches!(outcome, ValidationOutcome::Invalid(_)));
    }

    #[test]
    fn rejects_feed_above_cap() {
        let outcome = SafetyValidator::validate(
            "G1 X10 F5000",
            &SoftLimits::default(),
            &SpeedLimits::default(),
            origin(),
        );
        assert!(matches!(outcome, ValidationOutcome::Invalid(_)));
    }

    #[test]
    fn accepts_coordinate_exactly_at_limit_edge() {
        let outcome = SafetyValidator::validate(
            "G0 X300",
            &SoftLimits::default(),
            &SpeedLimits::default(),
            origin(),
        );
        assert_eq!(outcome, ValidationOutcome::Valid);
    }

    #[test]
    fn warns_on_unsafe_but_legal_prefix() {
        let outcome = SafetyValidator::validate(
            "M3 S1000",
            &SoftLimits::default(),
            &SpeedLimits::default(),
            origin(),
        );
        assert!(matches!(outcome, ValidationOutcome::Warn(_)));
    }

    #[test]
    fn jog_rejected_when_feed_exceeds_max_jog_rate() {
        let outcome = SafetyValidator::validate(
            "$J=G91 X10 F9000",
            &SoftLimits::default(),
            &SpeedLimits::default(),
            origin(),
        );
        assert!(matches!(outcome, ValidationOutcome::Invalid(_)));
    }

    #[test]
    fn jog_accepted_within_envelope() {
        let outcome = SafetyValidator::validate(
            "$J=G91 X10 Y-5 F1000",
            &SoftLimits::default(),
            &SpeedLimits::default(),
            origin(),
        );
        assert_eq!(outcome, ValidationOutcome::Valid);
    }
}
