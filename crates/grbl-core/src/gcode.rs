use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::position::Position;

/// The axis components explicitly present on a single G-code word.
///
/// Unlike [`Position`], every field is optional: a block that only moves Z
/// leaves `x`/`y` as `None` rather than implying zero.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Coordinates {
    /// X word, if present.
    pub x: Option<f64>,
    /// Y word, if present.
    pub y: Option<f64>,
    /// Z word, if present.
    pub z: Option<f64>,
    /// A word, if present (rotary axis, rarely used outside 4/5-axis jobs).
    pub a: Option<f64>,
    /// B word, if present.
    pub b: Option<f64>,
    /// C word, if present.
    pub c: Option<f64>,
}

impl Coordinates {
    /// Whether no axis word is present at all.
    pub fn is_empty(&self) -> bool {
        self.x.is_none()
            && self.y.is_none()
            && self.z.is_none()
            && self.a.is_none()
            && self.b.is_none()
            && self.c.is_none()
    }
}

/// GRBL modal groups relevant to this host (§4.5). Each group admits at most
/// one active member at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ModalGroup {
    /// Motion: G0, G1, G2, G3, G38.x.
    Motion,
    /// Plane selection: G17, G18, G19.
    Plane,
    /// Units: G20 (inch), G21 (mm).
    Units,
    /// Distance mode: G90 (absolute), G91 (incremental).
    Distance,
    /// Arc distance mode: G90.1, G91.1.
    ArcDistance,
    /// Feed-rate mode: G93 (inverse time), G94 (units/min).
    FeedMode,
}

/// Classify a G-code word (e.g. `"G1"`, `"G90.1"`) into its modal group, if
/// any. Returns `None` for words this host does not track modally
/// (spindle/coolant M-codes participate in their own one-shot groups that
/// don't need conflict tracking here).
pub fn modal_group_of(word: &str) -> Option<ModalGroup> {
    match word {
        "G0" | "G1" | "G2" | "G3" | "G38.2" | "G38.3" | "G38.4" | "G38.5" => {
            Some(ModalGroup::Motion)
        }
        "G17" | "G18" | "G19" => Some(ModalGroup::Plane),
        "G20" | "G21" => Some(ModalGroup::Units),
        "G90" | "G91" => Some(ModalGroup::Distance),
        "G90.1" | "G91.1" => Some(ModalGroup::ArcDistance),
        "G93" | "G94" => Some(ModalGroup::FeedMode),
        _ => None,
    }
}

/// A single parsed G-code line, immutable once produced by the parser (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Block {
    /// 1-based position of this block within its source program.
    pub line_number: usize,
    /// The original line, comment included, exactly as read.
    pub raw: String,
    /// The G-code number in effect for this block, if any (e.g. `1.0` for
    /// `G1`, `38.2` for `G38.2`).
    pub g_code: Option<f64>,
    /// The M-code number in effect for this block, if any.
    pub m_code: Option<f64>,
    /// Which modal group each word on this line belongs to, and the word
    /// itself (e.g. `Motion -> "G1"`).
    pub modal_groups: BTreeMap<ModalGroup, String>,
    /// Axis words present on this line.
    pub coordinates: Option<Coordinates>,
    /// `F` word, mm/min.
    pub feed_rate: Option<f64>,
    /// `S` word, spindle speed (RPM or PWM duty, firmware-dependent).
    pub spindle_speed: Option<f64>,
    /// `T` word, tool number.
    pub tool_number: Option<u32>,
    /// Remaining letter/value pairs not otherwise modelled (`I`, `J`, `K`,
    /// `P`, `Q`, `R`, ...).
    pub parameters: BTreeMap<char, f64>,
    /// Whether this block passed parser-level validation (§4.5). Invalid
    /// blocks are still retained (with their line number and raw text) so
    /// diagnostics can point at them.
    pub valid: bool,
}

/// The axis-aligned hull of every position the parser's cursor visited while
/// walking motion blocks in order (§3).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    /// Per-axis minimum.
    pub min: Position,
    /// Per-axis maximum.
    pub max: Position,
}

impl BoundingBox {
    /// A degenerate box at a single point — the identity element for
    /// [`BoundingBox::expand`].
    pub fn at_point(p: Position) -> Self {
        Self { min: p, max: p }
    }

    /// Grow the hull to include `p`.
    pub fn expand(&mut self, p: Position) {
        self.min.x = self.min.x.min(p.x);
        self.min.y = self.min.y.min(p.y);
        self.min.z = self.min.z.min(p.z);
        self.max.x = self.max.x.max(p.x);
        self.max.y = self.max.y.max(p.y);
        self.max.z = self.max.z.max(p.z);
    }

    /// `max - min` on every axis. Always non-negative by construction.
    pub fn size(&self) -> Position {
        Position::new(
            self.max.x - self.min.x,
            self.max.y - self.min.y,
            self.max.z - self.min.z,
        )
    }
}

/// Severity-tagged issue raised by [`crate`]'s safety scan (engine-side
/// `check_safety`); kept here since it rides along with `ParseResult`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseIssue {
    /// 1-based line number the issue refers to.
    pub line_number: usize,
    /// Human-readable description.
    pub message: String,
}

/// Everything the parser produces from one G-code program (§3).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ParseResult {
    /// Every block produced, valid or not, in source order.
    pub blocks: Vec<Block>,
    /// Hard errors (e.g. a motion block with no axis words).
    pub errors: Vec<ParseIssue>,
    /// Soft warnings (e.g. program uses inches).
    pub warnings: Vec<ParseIssue>,
    /// Hull over modelled positions; `None` if the program has no motion.
    pub bounding_box: Option<BoundingBox>,
    /// Rough upper-bound runtime estimate, seconds.
    pub estimated_seconds: f64,
}

impl ParseResult {
    /// Whether every block parsed is valid and there are no hard errors.
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty() && self.blocks.iter().all(|b| b.valid)
    }
}

/// Result of running the parser's `check_safety` pass over a set of blocks
/// against a machine's configured limits (§4.5). Distinct from
/// [`ParseResult`] because it depends on machine configuration, not just the
/// program text, and is re-run whenever limits change.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SafetyCheck {
    /// Hard issues: feed/spindle/travel limits exceeded.
    pub issues: Vec<ParseIssue>,
    /// Soft issues: rapid descent, spindle left running, etc.
    pub warnings: Vec<ParseIssue>,
}

impl SafetyCheck {
    /// Whether no hard issues were found. Warnings do not affect this.
    pub fn passed(&self) -> bool {
        self.issues.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bounding_box_respects_min_le_max() {
        let mut bbox = BoundingBox::at_point(Position::new(1.0, 1.0, 1.0));
        bbox.expand(Position::new(-1.0, 5.0, 0.0));
        assert!(bbox.min.x <= bbox.max.x);
        assert!(bbox.min.y <= bbox.max.y);
        assert!(bbox.min.z <= bbox.max.z);
        let size = bbox.size();
        assert!(size.x >= 0.0 && size.y >= 0.0 && size.z >= 0.0);
    }

    #[test]
    fn modal_group_classification() {
        assert_eq!(modal_group_of("G1"), Some(ModalGroup::Motion));
        assert_eq!(modal_group_of("G91.1"), Some(ModalGroup::ArcDistance));
        assert_eq!(modal_group_of("M3"), None);
    }
}
