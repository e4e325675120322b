//! Console configuration, read from TOML.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::ConsoleError;
use crate::session::upload::UploadSettings;

/// Which heater a temperature argument is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Heater {
    Hotend,
    Bed,
}

/// Configuration for a printer console.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ConsoleConfig {
    /// Printer device node, e.g. `/dev/ttyUSB0`.
    pub port: Option<String>,
    pub baud: u32,
    /// Bound on a card listing.
    pub listing_timeout_ms: u64,
    /// Bound on the request phase of a card print (M23 until M24 is sent).
    pub session_timeout_ms: u64,
    /// How often an upload samples the queue cursor.
    pub poll_interval_ms: u64,
    pub monitor_interval_secs: u64,
    pub hotend_presets: BTreeMap<String, f64>,
    pub bed_presets: BTreeMap<String, f64>,
    /// Alias name to command template.
    pub aliases: BTreeMap<String, String>,
    /// Console commands run before the prompt appears.
    pub startup_commands: Vec<String>,
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            port: None,
            baud: 115_200,
            listing_timeout_ms: 2000,
            session_timeout_ms: 5000,
            poll_interval_ms: 100,
            monitor_interval_secs: 5,
            hotend_presets: presets(&[("pla", 210.0), ("abs", 230.0), ("off", 0.0)]),
            bed_presets: presets(&[("pla", 60.0), ("abs", 110.0), ("off", 0.0)]),
            aliases: BTreeMap::new(),
            startup_commands: Vec::new(),
        }
    }
}

fn presets(entries: &[(&str, f64)]) -> BTreeMap<String, f64> {
    entries
        .iter()
        .map(|(name, value)| (name.to_string(), *value))
        .collect()
}

impl ConsoleConfig {
    /// Load configuration from a TOML file
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: ConsoleConfig = toml::from_str(&content)?;
        Ok(config)
    }

    pub fn listing_timeout(&self) -> Duration {
        Duration::from_millis(self.listing_timeout_ms)
    }

    pub fn session_timeout(&self) -> Duration {
        Duration::from_millis(self.session_timeout_ms)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn upload_settings(&self) -> UploadSettings {
        UploadSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            listing_timeout: self.listing_timeout(),
        }
    }

    /// Resolve a preset name or a number of degrees.
    ///
    /// Negative temperatures are rejected.
    pub fn resolve_temperature(&self, heater: Heater, arg: &str) -> Result<f64, ConsoleError> {
        let arg = arg.trim();
        let table = match heater {
            Heater::Hotend => &self.hotend_presets,
            Heater::Bed => &self.bed_presets,
        };
        let value = match table.get(&arg.to_lowercase()) {
            Some(preset) => *preset,
            None => arg.parse::<f64>().map_err(|_| {
                ConsoleError::InvalidArgument(format!(
                    "'{}' is neither a temperature nor a preset ({})",
                    arg,
                    table.keys().cloned().collect::<Vec<_>>().join(", ")
                ))
            })?,
        };
        if value < 0.0 || !value.is_finite() {
            return Err(ConsoleError::InvalidArgument(format!(
                "temperature must not be negative, got {}",
                arg
            )));
        }
        Ok(value)
    }
}
