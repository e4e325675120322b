//! G-code commands produced by the console.
//!
//! These strings go to the firmware verbatim, so spelling and spacing
//! must stay exactly as the firmware expects them.

// ============================================================================
// Card (SD) Commands
// ============================================================================

/// List card contents.
pub const LIST_CARD: &str = "M20";

/// Start or resume the selected card print.
pub const START_CARD_PRINT: &str = "M24";

/// Pause the running card print.
pub const PAUSE_CARD_PRINT: &str = "M25";

/// Request card print progress ("SD printing byte N/M").
pub const REPORT_CARD_PROGRESS: &str = "M27";

/// Request a temperature report.
pub const REPORT_TEMPERATURE: &str = "M105";

/// Select a card file for printing.
pub fn select_card_file(name: &str) -> String {
    format!("M23 {}", name)
}

/// Open a card file for writing.
pub fn open_card_file(name: &str) -> String {
    format!("M28 {}", name)
}

/// Close a card file opened with [`open_card_file`].
pub fn close_card_file(name: &str) -> String {
    format!("M29 {}", name)
}

// ============================================================================
// Heater Commands
// ============================================================================

/// Set hotend target temperature.
pub fn set_hotend_temperature(celsius: f64) -> String {
    format!("M104 S{}", celsius)
}

/// Set bed target temperature.
pub fn set_bed_temperature(celsius: f64) -> String {
    format!("M140 S{}", celsius)
}

// ============================================================================
// Motion Commands
// ============================================================================

pub const RELATIVE_POSITIONING: &str = "G91";
pub const ABSOLUTE_POSITIONING: &str = "G90";

/// Default extrusion length in mm.
pub const DEFAULT_EXTRUDE_MM: f64 = 5.0;
/// Default extrusion feed rate in mm/min.
pub const DEFAULT_EXTRUDE_FEED: u32 = 300;

/// Machine axis for manual moves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Axis {
    X,
    Y,
    Z,
    E,
}

impl Axis {
    /// Parse an axis letter (case-insensitive).
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "x" => Some(Axis::X),
            "y" => Some(Axis::Y),
            "z" => Some(Axis::Z),
            "e" => Some(Axis::E),
            _ => None,
        }
    }

    /// Feed rate used for manual moves on this axis (mm/min).
    pub fn default_feed(&self) -> u32 {
        match self {
            Axis::X | Axis::Y => 3000,
            Axis::Z => 200,
            Axis::E => DEFAULT_EXTRUDE_FEED,
        }
    }

    fn letter(&self) -> char {
        match self {
            Axis::X => 'X',
            Axis::Y => 'Y',
            Axis::Z => 'Z',
            Axis::E => 'E',
        }
    }
}

/// Relative move sequence for one axis.
pub fn relative_move(axis: Axis, distance: f64, feed: u32) -> [String; 3] {
    [
        RELATIVE_POSITIONING.to_string(),
        format!("G1 {}{} F{}", axis.letter(), distance, feed),
        ABSOLUTE_POSITIONING.to_string(),
    ]
}

/// Normalise operator-typed G-code for passthrough.
///
/// Returns `None` when the line is not a G or M command.
pub fn passthrough(line: &str) -> Option<String> {
    let line = line.trim();
    match line.chars().next() {
        Some('G' | 'M' | 'g' | 'm') => Some(line.to_uppercase()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_card_commands() {
        assert_eq!(select_card_file("part.g"), "M23 part.g");
        assert_eq!(open_card_file("part.g"), "M28 part.g");
        assert_eq!(close_card_file("part.g"), "M29 part.g");
    }

    #[test]
    fn test_relative_move() {
        let cmds = relative_move(Axis::Z, -1.0, Axis::Z.default_feed());
        assert_eq!(cmds[0], "G91");
        assert_eq!(cmds[1], "G1 Z-1 F200");
        assert_eq!(cmds[2], "G90");
    }

    #[test]
    fn test_passthrough() {
        assert_eq!(passthrough("g28 x").as_deref(), Some("G28 X"));
        assert_eq!(passthrough("M114").as_deref(), Some("M114"));
        assert_eq!(passthrough("help"), None);
        assert_eq!(passthrough(""), None);
    }

    #[test]
    fn test_heater_commands() {
        assert_eq!(set_hotend_temperature(210.0), "M104 S210");
        assert_eq!(set_bed_temperature(62.5), "M140 S62.5");
    }
}
