use crate::error::SettingsError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::time::Duration;

macro_rules! serialize_yaml {
    ($file:expr, $static_resource:expr) => {
        serde_yaml::from_str(
            &fs::read_to_string($file)
                .unwrap_or(String::from_utf8_lossy(include_bytes!($static_resource)).to_string()),
        )
    };
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct BruteForce {
    pub max_sfi: u8,
    pub max_record: u8,
}

impl Default for BruteForce {
    fn default() -> Self {
        BruteForce {
            max_sfi: 11,
            max_record: 5,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct ReaderSettings {
    pub poll_interval_ms: u64,
    pub reconnect_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for ReaderSettings {
    fn default() -> Self {
        ReaderSettings {
            poll_interval_ms: 250,
            reconnect_backoff_ms: 500,
            max_backoff_ms: 8000,
        }
    }
}

/// Values used to fill processing options data objects requested by the card.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Terminal {
    pub use_random: bool,
    pub default_tags: BTreeMap<String, String>,
}

impl Default for Terminal {
    fn default() -> Self {
        let default_tags = [
            ("9F66", "36004000"),
            ("9F1A", "0276"),
            ("5F2A", "0978"),
            ("9C", "00"),
            ("9F02", "000000000000"),
        ]
        .iter()
        .map(|(tag, value)| (tag.to_string(), value.to_string()))
        .collect();

        Terminal {
            use_random: true,
            default_tags,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct Settings {
    pub censor_sensitive_fields: bool,
    pub contactless: bool,
    pub apdu_timeout_ms: u64,
    pub max_consecutive_timeouts: u32,
    pub max_response_chain: u32,
    pub pse_max_records: u8,
    pub brute_force: BruteForce,
    pub dedup_window_ms: u64,
    pub hint_cache_size: usize,
    pub reader: ReaderSettings,
    pub terminal: Terminal,
}

impl Default for Settings {
    fn default() -> Self {
        Settings {
            censor_sensitive_fields: true,
            contactless: true,
            apdu_timeout_ms: 2000,
            max_consecutive_timeouts: 3,
            max_response_chain: 8,
            pse_max_records: 10,
            brute_force: BruteForce::default(),
            dedup_window_ms: 3000,
            hint_cache_size: 100,
            reader: ReaderSettings::default(),
            terminal: Terminal::default(),
        }
    }
}

impl Settings {
    /// Loads `settings_file`, falling back to the bundled defaults when the
    /// file cannot be read.
    pub fn load(settings_file: &str) -> Result<Settings, SettingsError> {
        let settings: Settings = serialize_yaml!(settings_file, "../config/settings.yaml")?;
        Ok(settings)
    }

    pub fn apdu_timeout(&self) -> Duration {
        Duration::from_millis(self.apdu_timeout_ms)
    }

    pub fn dedup_window(&self) -> Duration {
        Duration::from_millis(self.dedup_window_ms)
    }
}
