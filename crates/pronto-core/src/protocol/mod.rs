//! Protocol module - printer command vocabulary and inbound line markers.

pub mod commands;
pub mod markers;

pub use commands::*;
pub use markers::{CardProgress, normalize_file_entry, parse_card_progress};
