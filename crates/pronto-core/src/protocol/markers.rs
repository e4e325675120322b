//! Inbound line markers and parsers.
//!
//! All markers are matched as case-sensitive substrings.

use std::fmt;

pub const BEGIN_FILE_LIST: &str = "Begin file list";
pub const END_FILE_LIST: &str = "End file list";
pub const OPEN_FAILED: &str = "open failed";
pub const FILE_OPENED: &str = "File opened";
pub const FILE_SELECTED: &str = "File selected";
pub const DONE_PRINTING: &str = "Done printing file";
pub const CARD_PROGRESS: &str = "SD printing byte";
pub const TEMPERATURE: &str = "T:";
/// Reply to an explicit M105.
pub const TEMPERATURE_REPLY: &str = "ok T:";
pub const ACK: &str = "ok";

/// Whether a line carries a temperature readout.
pub fn is_temperature(line: &str) -> bool {
    line.contains(TEMPERATURE)
}

/// Byte position of a card print, from "SD printing byte N/M".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CardProgress {
    pub position: u64,
    pub size: u64,
}

impl CardProgress {
    pub fn percent(&self) -> f64 {
        100.0 * self.position as f64 / self.size as f64
    }
}

impl fmt::Display for CardProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.position, self.size)
    }
}

/// Parse the trailing `N/M` pair of a card progress line.
///
/// Returns `None` for lines without the marker, a non-numeric pair,
/// or a zero size.
pub fn parse_card_progress(line: &str) -> Option<CardProgress> {
    if !line.contains(CARD_PROGRESS) {
        return None;
    }
    let pair = line.split_whitespace().last()?;
    let (n, m) = pair.split_once('/')?;
    let position = n.parse().ok()?;
    let size = m.parse().ok()?;
    if size == 0 {
        return None;
    }
    Some(CardProgress { position, size })
}

/// Turn one listing line into a card file name.
///
/// Some firmwares append the file size after the name; only the first
/// token is kept. Blank lines and bare acknowledgements yield `None`.
pub fn normalize_file_entry(line: &str) -> Option<String> {
    let name = line.split_whitespace().next()?;
    if name == ACK {
        return None;
    }
    Some(name.to_lowercase())
}

/// Render a temperature line for the operator ("T:" → "Hotend:", "B:" → "Bed:").
pub fn format_temperature(line: &str) -> String {
    line.trim()
        .trim_start_matches("ok ")
        .replace('T', "Hotend")
        .replace('B', "Bed")
}
