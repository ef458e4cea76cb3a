//! Line-oriented, single-pass G-code parser (§4.5): tokenizing, modal-group
//! bookkeeping, block validation, bounding-box and time estimation, the
//! safety scan, and block coalescing.

use std::collections::BTreeMap;
use std::f64::consts::FRAC_PI_2;

use grbl_core::gcode::modal_group_of;
use grbl_core::{
    Block, BoundingBox, Coordinates, ParseIssue, ParseResult, Position, SafetyCheck, SoftLimits,
    SpeedLimits,
};

/// Fixed per-block overhead folded into `estimated_seconds`, matching the
/// "tens of milliseconds of cooperative scheduling" the host itself runs
/// under — not a kinematic claim about GRBL's own block processing time.
const PER_BLOCK_OVERHEAD_SECONDS: f64 = 0.05;
const SPINDLE_START_SECONDS: f64 = 2.0;
const SPINDLE_STOP_SECONDS: f64 = 1.0;
const TOOL_CHANGE_SECONDS: f64 = 10.0;
/// No max-spindle field exists in [`SpeedLimits`]; this is a descriptive
/// constant purely for the safety scan's "spindle exceeded" check.
const DEFAULT_MAX_SPINDLE_SPEED: f64 = 24_000.0;
/// Feed assumed for a motion block with no `F` word yet in effect, purely to
/// keep the time estimate finite rather than dividing by zero.
const DEFAULT_FEED_RATE_MM_PER_MIN: f64 = 1_000.0;

fn strip_comments(line: &str) -> String {
    let mut out = String::with_capacity(line.len());
    let mut in_paren = false;
    for ch in line.chars() {
        match ch {
            ';' if !in_paren => break,
            '(' => in_paren = true,
            ')' => in_paren = false,
            _ if in_paren => {}
            _ => out.push(ch),
        }
    }
    out
}

fn parse_words(line: &str) -> (Option<f64>, Option<f64>, Coordinates, Option<f64>, Option<f64>, Option<u32>, BTreeMap<char, f64>, BTreeMap<grbl_core::gcode::ModalGroup, String>) {
    let mut g_code = None;
    let mut m_code = None;
    let mut coordinates = Coordinates::default();
    let mut feed_rate = None;
    let mut spindle_speed = None;
    let mut tool_number = None;
    let mut parameters = BTreeMap::new();
    let mut modal_groups = BTreeMap::new();

    for token in line.split_whitespace() {
        let mut chars = token.chars();
        let Some(letter) = chars.next() else { continue };
        if !letter.is_ascii_alphabetic() {
            continue;
        }
        let rest: String = chars.collect();
        let Ok(value) = rest.parse::<f64>() else {
            continue;
        };
        let letter = letter.to_ascii_uppercase();
        match letter {
            'G' => {
                g_code = Some(value);
                let word = format!("G{}", format_code(value));
                if let Some(group) = modal_group_of(&word) {
                    modal_groups.insert(group, word);
                }
            }
            'M' => m_code = Some(value),
            'X' => coordinates.x = Some(value),
            'Y' => coordinates.y = Some(value),
            'Z' => coordinates.z = Some(value),
            'A' => coordinates.a = Some(value),
            'B' => coordinates.b = Some(value),
            'C' => coordinates.c = Some(value),
            'F' => feed_rate = Some(value),
            'S' => spindle_speed = Some(value),
            'T' => tool_number = Some(value as u32),
            other => {
                parameters.insert(other, value);
            }
        }
    }

    (
        g_code,
        m_code,
        coordinates,
        feed_rate,
        spindle_speed,
        tool_number,
        parameters,
        modal_groups,
    )
}

/// Render a G-code numeric value the way GRBL words appear on the wire:
/// `0` -> `"0"`, `90.1` -> `"90.1"`, `38.2` -> `"38.2"`.
fn format_code(value: f64) -> String {
    if (value - value.trunc()).abs() < f64::EPSILON {
        format!("{}", value as i64)
    } else {
        format!("{value}")
    }
}

fn validate_block(g_code: Option<f64>, coordinates: &Coordinates, feed_rate: Option<f64>, parameters: &BTreeMap<char, f64>) -> Option<String> {
    match g_code {
        Some(code) if code == 0.0 || code == 1.0 => {
            if coordinates.is_empty() {
                return Some("G0/G1 requires at least one coordinate word".to_string());
            }
            if code == 1.0 && feed_rate == Some(0.0) {
                return Some("G1 feed rate is zero".to_string());
            }
        }
        Some(code) if code == 2.0 || code == 3.0 => {
            if coordinates.is_empty() {
                return Some("G2/G3 requires endpoint coordinates".to_string());
            }
            if !parameters.contains_key(&'I') && !parameters.contains_key(&'J') && !parameters.contains_key(&'R') {
                return Some("G2/G3 requires I, J, or R".to_string());
            }
        }
        Some(code) if code == 38.2 => {
            if coordinates.z.is_none() {
                return Some("G38.2 requires a Z word".to_string());
            }
            if feed_rate.is_none() {
                return Some("G38.2 requires an F word".to_string());
            }
        }
        _ => {}
    }
    None
}

fn apply_motion(cursor: &mut Position, absolute: bool, coordinates: &Coordinates) {
    if absolute {
        if let Some(x) = coordinates.x {
            cursor.x = x;
        }
        if let Some(y) = coordinates.y {
            cursor.y = y;
        }
        if let Some(z) = coordinates.z {
            cursor.z = z;
        }
    } else {
        cursor.x += coordinates.x.unwrap_or(0.0);
        cursor.y += coordinates.y.unwrap_or(0.0);
        cursor.z += coordinates.z.unwrap_or(0.0);
    }
}

/// The line-oriented G-code parser. Carries no state between calls; every
/// method takes the program (and, for the safety scan, the limits) fresh.
#[derive(Debug, Default, Clone, Copy)]
pub struct GCodeParser;

impl GCodeParser {
    /// Parse `source` into blocks plus the derived bounding box and time
    /// estimate (§4.5).
    pub fn parse(source: &str) -> ParseResult {
        let mut blocks = Vec::new();
        let mut errors = Vec::new();
        let mut warnings = Vec::new();
        let mut bounding_box: Option<BoundingBox> = None;
        let mut estimated_seconds = 0.0;

        let mut cursor = Position::ORIGIN;
        let mut absolute = true;
        let mut current_feed = DEFAULT_FEED_RATE_MM_PER_MIN;
        let mut saw_inches = false;
        let mut saw_incremental = false;
        let mut saw_spindle_on = false;
        let mut saw_tool_change = false;
        let mut saw_motion = false;

        for (line_number, raw_line) in source.lines().enumerate() {
            let line_number = line_number + 1;
            let stripped = strip_comments(raw_line);
            let trimmed = stripped.trim();
            if trimmed.is_empty() {
                continue;
            }

            let (g_code, m_code, coordinates, feed_rate, spindle_speed, tool_number, parameters, modal_groups) =
                parse_words(trimmed);

            if g_code == Some(20.0) {
                saw_inches = true;
            }
            if g_code == Some(91.0) {
                saw_incremental = true;
            }
            if g_code == Some(90.0) {
                absolute = true;
            } else if g_code == Some(91.0) {
                absolute = false;
            }
            if matches!(m_code, Some(code) if code == 3.0 || code == 4.0) {
                saw_spindle_on = true;
            }
            if m_code == Some(6.0) {
                saw_tool_change = true;
            }
            if let Some(feed) = feed_rate {
                current_feed = feed;
            }

            let validation_error = validate_block(g_code, &coordinates, feed_rate, &parameters);
            let valid = validation_error.is_none();
            if let Some(message) = validation_error {
                errors.push(ParseIssue { line_number, message });
            }

            let is_motion = matches!(g_code, Some(code) if (0.0..=3.0).contains(&code));
            if is_motion && !coordinates.is_empty() {
                saw_motion = true;
                let cursor_before = cursor;
                apply_motion(&mut cursor, absolute, &coordinates);
                match &mut bounding_box {
                    Some(bbox) => bbox.expand(cursor),
                    None => bounding_box = Some(BoundingBox::at_point(cursor)),
                }

                estimated_seconds += match g_code {
                    Some(code) if code == 2.0 || code == 3.0 => {
                        let radius = parameters
                            .get(&'R')
                            .copied()
                            .or_else(|| {
                                let i = parameters.get(&'I').copied().unwrap_or(0.0);
                                let j = parameters.get(&'J').copied().unwrap_or(0.0);
                                Some((i * i + j * j).sqrt())
                            })
                            .unwrap_or(0.0);
                        let arc_length = FRAC_PI_2 * radius;
                        arc_length / current_feed.max(1.0) * 60.0
                    }
                    _ => {
                        let dx = cursor.x - cursor_before.x;
                        let dy = cursor.y - cursor_before.y;
                        let dz = cursor.z - cursor_before.z;
                        let distance = (dx * dx + dy * dy + dz * dz).sqrt();
                        distance / current_feed.max(1.0) * 60.0
                    }
                };
            }

            estimated_seconds += PER_BLOCK_OVERHEAD_SECONDS;
            if m_code == Some(3.0) || m_code == Some(4.0) {
                estimated_seconds += SPINDLE_START_SECONDS;
            }
            if m_code == Some(5.0) {
                estimated_seconds += SPINDLE_STOP_SECONDS;
            }
            if m_code == Some(6.0) {
                estimated_seconds += TOOL_CHANGE_SECONDS;
            }

            blocks.push(Block {
                line_number,
                raw: raw_line.to_string(),
                g_code,
                m_code,
                modal_groups,
                coordinates: if coordinates.is_empty() { None } else { Some(coordinates) },
                feed_rate,
                spindle_speed,
                tool_number,
                parameters,
                valid,
            });
        }

        if saw_inches {
            warnings.push(ParseIssue { line_number: 0, message: "program uses inches (G20)".to_string() });
        }
        if saw_incremental {
            warnings.push(ParseIssue { line_number: 0, message: "program uses incremental distance mode (G91)".to_string() });
        }
        if saw_motion && !saw_spindle_on {
            warnings.push(ParseIssue { line_number: 0, message: "motion present with no spindle command".to_string() });
        }
        if saw_tool_change {
            warnings.push(ParseIssue { line_number: 0, message: "program contains a tool change (M6)".to_string() });
        }

        ParseResult {
            blocks,
            errors,
            warnings,
            bounding_box,
            estimated_seconds,
        }
    }

    /// Scan `blocks` against `limits`/`speed` without mutating them (§4.5).
    pub fn check_safety(blocks: &[Block], limits: &SoftLimits, speed: &SpeedLimits) -> SafetyCheck {
        let mut issues = Vec::new();
        let mut warnings = Vec::new();
        let mut cursor = Position::ORIGIN;
        let mut absolute = true;

        for block in blocks {
            if block.g_code == Some(90.0) {
                absolute = true;
            } else if block.g_code == Some(91.0) {
                absolute = false;
            }

            if let Some(feed) = block.feed_rate {
                if feed > speed.max_feed_rate {
                    issues.push(ParseIssue {
                        line_number: block.line_number,
                        message: format!("feed {feed} exceeds max_feed_rate {}", speed.max_feed_rate),
                    });
                }
            }
            if let Some(spindle) = block.spindle_speed {
                if spindle > DEFAULT_MAX_SPINDLE_SPEED {
                    issues.push(ParseIssue {
                        line_number: block.line_number,
                        message: format!("spindle speed {spindle} exceeds {DEFAULT_MAX_SPINDLE_SPEED}"),
                    });
                }
            }

            let is_motion = matches!(block.g_code, Some(code) if (0.0..=3.0).contains(&code));
            if is_motion {
                if let Some(coordinates) = &block.coordinates {
                    let previous = cursor;
                    apply_motion(&mut cursor, absolute, coordinates);
                    if !limits.contains(cursor) {
                        issues.push(ParseIssue {
                            line_number: block.line_number,
                            message: format!("travel to {cursor:?} exceeds soft limits"),
                        });
                    }
                    if block.g_code == Some(0.0) && cursor.z < previous.z {
                        warnings.push(ParseIssue {
                            line_number: block.line_number,
                            message: "rapid descent (G0 with decreasing Z)".to_string(),
                        });
                    }
                }
            }

            if matches!(block.m_code, Some(code) if code == 3.0 || code == 4.0) {
                warnings.push(ParseIssue {
                    line_number: block.line_number,
                    message: "spindle turned on".to_string(),
                });
            }
        }

        SafetyCheck { issues, warnings }
    }

    /// Coalesce consecutive G0/G1 blocks that share feed, spindle, and modal
    /// groups by merging their coordinate overrides in order (§4.5). Never
    /// changes the final absolute position a run of blocks resolves to.
    pub fn optimize(blocks: &[Block]) -> Vec<Block> {
        let mut result: Vec<Block> = Vec::new();
        for block in blocks {
            if let Some(last) = result.last_mut() {
                if can_merge(last, block) {
                    merge_into(last, block);
                    continue;
                }
            }
            result.push(block.clone());
        }
        result
    }
}

fn can_merge(a: &Block, b: &Block) -> bool {
    matches!(b.g_code, Some(code) if code == 0.0 || code == 1.0)
        && a.g_code == b.g_code
        && a.feed_rate == b.feed_rate
        && a.spindle_speed == b.spindle_speed
        && a.modal_groups == b.modal_groups
        && a.valid
        && b.valid
}

fn merge_into(a: &mut Block, b: &Block) {
    if let Some(b_coords) = b.coordinates {
        let mut coords = a.coordinates.unwrap_or_default();
        if b_coords.x.is_some() {
            coords.x = b_coords.x;
        }
        if b_coords.y.is_some() {
            coords.y = b_coords.y;
        }
        if b_coords.z.is_some() {
            coords.z = b_coords.z;
        }
        if b_coords.a.is_some() {
            coords.a = b_coords.a;
        }
        if b_coords.b.is_some() {
            coords.b = b_coords.b;
        }
        if b_coords.c.is_some() {
            coords.c = b_coords.c;
        }
        a.coordinates = Some(coords);
    }
    a.raw = format!("{}; {}", a.raw, b.raw);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strips_eol_and_inline_comments() {
        assert_eq!(strip_comments("G1 X1 ; go right"), "G1 X1 ");
        assert_eq!(strip_comments("G1 (move) X1"), "G1  X1");
    }

    #[test]
    fn parses_simple_program_and_bounds_box() {
        let result = GCodeParser::parse("G90\nG0 X10 Y0\nG1 Z-5 F100\nG0 X0 Y0");
        assert!(result.is_clean());
        let bbox = result.bounding_box.unwrap();
        assert_eq!(bbox.min, Position::new(0.0, 0.0, -5.0));
        assert_eq!(bbox.max, Position::new(10.0, 0.0, 0.0));
    }

    #[test]
    fn rejects_g1_with_zero_feed() {
        let result = GCodeParser::parse("G1 X10 F0");
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn rejects_arc_without_radius_or_offsets() {
        let result = GCodeParser::parse("G2 X10 Y10");
        assert!(!result.errors.is_empty());
    }

    #[test]
    fn check_safety_flags_travel_outside_limits() {
        let result = GCodeParser::parse("G0 X1000");
        let safety = GCodeParser::check_safety(&result.blocks, &SoftLimits::default(), &SpeedLimits::default());
        assert!(!safety.passed());
    }

    #[test]
    fn check_safety_is_optimisation_invariant_for_absolute_moves() {
        let result = GCodeParser::parse("G90\nG1 X10 F200\nG1 Y10 F200\nG1 X20 Y20 F200");
        let limits = SoftLimits::default();
        let speed = SpeedLimits::default();
        let before = GCodeParser::check_safety(&result.blocks, &limits, &speed);
        let optimized = GCodeParser::optimize(&result.blocks);
        let after = GCodeParser::check_safety(&optimized, &limits, &speed);
        assert_eq!(before.passed(), after.passed());
    }

    #[test]
    fn optimize_merges_consecutive_compatible_moves() {
        let result = GCodeParser::parse("G90\nG1 X10 F200\nG1 Y20 F200");
        let optimized = GCodeParser::optimize(&result.blocks);
        assert_eq!(optimized.len(), 1);
        let coords = optimized[0].coordinates.unwrap();
        assert_eq!(coords.x, Some(10.0));
        assert_eq!(coords.y, Some(20.0));
    }
}
