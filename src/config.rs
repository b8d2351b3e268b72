//! Engine configuration (spec.md §6): loaded via the `config` crate (TOML),
//! saved back with `toml_edit` for round-trip-preserving writes — the same
//! two-crate split the teacher uses for its `AppConfig`.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use toml_edit::{value, DocumentMut};

use crate::handlers::control::Resolution;
use crate::handlers::sensors::SensorType;

#[derive(Debug, Clone, Serialize)]
pub struct UsbId {
    pub vid: u16,
    pub pid: u16,
}

impl FromStr for UsbId {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = s.split(':').collect();
        if parts.len() != 2 {
            return Err("Expected format VID:PID".to_string());
        }
        let vid = u16::from_str_radix(parts[0], 16).map_err(|e| e.to_string())?;
        let pid = u16::from_str_radix(parts[1], 16).map_err(|e| e.to_string())?;
        Ok(UsbId { vid, pid })
    }
}

impl fmt::Display for UsbId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:x}:{:x}", self.vid, self.pid)
    }
}

impl<'de> Deserialize<'de> for UsbId {
    fn deserialize<D>(deserializer: D) -> Result<UsbId, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        UsbId::from_str(&s).map_err(serde::de::Error::custom)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind")]
pub enum TransportConfig {
    Usb { fd: i32 },
    Socket { host: String, port: u16 },
}

impl Default for TransportConfig {
    fn default() -> Self {
        TransportConfig::Socket {
            host: "127.0.0.1".into(),
            port: 5288,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq)]
pub struct UserMargins {
    pub top: u32,
    pub bottom: u32,
    pub left: u32,
    pub right: u32,
}

#[derive(Debug, Clone, Copy, Default, Deserialize, Serialize, PartialEq, Eq, clap::ValueEnum)]
pub enum NightMode {
    #[default]
    Auto,
    Day,
    Night,
    AutoWaitGps,
    None,
}

fn default_resolution() -> String {
    "1280x720".to_string()
}

fn default_mic_sample_rate() -> u32 {
    16000
}

fn default_stabilisation_delay_ms() -> u64 {
    500
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub transport: TransportConfig,

    #[serde(default)]
    pub pinned_certificate_chain_path: PathBuf,
    #[serde(default)]
    pub pinned_private_key_path: PathBuf,

    #[serde(default = "default_resolution")]
    pub resolution: String,
    #[serde(default)]
    pub preserve_aspect_ratio: bool,
    #[serde(default)]
    pub user_margins: UserMargins,
    /// 0 means auto (spec.md §6).
    #[serde(default)]
    pub manual_dpi: u32,

    #[serde(default = "default_mic_sample_rate")]
    pub mic_sample_rate: u32,

    #[serde(default)]
    pub sensors_enabled: Vec<String>,

    #[serde(default)]
    pub bluetooth_mac: String,

    #[serde(default)]
    pub key_map: HashMap<i32, i32>,

    #[serde(default = "default_stabilisation_delay_ms")]
    pub stabilisation_delay_ms: u64,

    #[serde(default)]
    pub night_mode: NightMode,

    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub log_path: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            transport: TransportConfig::default(),
            pinned_certificate_chain_path: PathBuf::new(),
            pinned_private_key_path: PathBuf::new(),
            resolution: default_resolution(),
            preserve_aspect_ratio: false,
            user_margins: UserMargins::default(),
            manual_dpi: 0,
            mic_sample_rate: default_mic_sample_rate(),
            sensors_enabled: Vec::new(),
            bluetooth_mac: String::new(),
            key_map: HashMap::new(),
            stabilisation_delay_ms: default_stabilisation_delay_ms(),
            night_mode: NightMode::default(),
            debug: false,
            log_path: PathBuf::from("/var/log/aa-headunit-rs/aa-headunit-rs.log"),
        }
    }
}

impl EngineConfig {
    /// Loads from a TOML file, falling back to defaults for any missing
    /// key (mirrors the teacher's `config::Config` builder usage).
    pub fn load(path: &Path) -> Result<EngineConfig, crate::error::EngineError> {
        let builder = config::Config::builder()
            .add_source(config::File::from(path).required(false))
            .build()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;
        builder
            .try_deserialize()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))
    }

    /// Round-trip-preserving save: only touches the keys this struct owns,
    /// leaving unrelated comments/formatting in the file intact (same
    /// approach as the teacher's `toml_edit` usage in `src/config.rs`).
    pub fn save(&self, path: &Path) -> Result<(), crate::error::EngineError> {
        let existing = std::fs::read_to_string(path).unwrap_or_default();
        let mut doc = existing
            .parse::<DocumentMut>()
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;
        doc["resolution"] = value(self.resolution.clone());
        doc["preserve_aspect_ratio"] = value(self.preserve_aspect_ratio);
        doc["manual_dpi"] = value(self.manual_dpi as i64);
        doc["mic_sample_rate"] = value(self.mic_sample_rate as i64);
        doc["bluetooth_mac"] = value(self.bluetooth_mac.clone());
        doc["stabilisation_delay_ms"] = value(self.stabilisation_delay_ms as i64);
        std::fs::write(path, doc.to_string())
            .map_err(|e| crate::error::EngineError::Config(e.to_string()))?;
        Ok(())
    }

    pub fn resolution(&self) -> Resolution {
        match self.resolution.as_str() {
            "800x480" => Resolution::W800H480,
            "1280x720" => Resolution::W1280H720,
            "1920x1080" => Resolution::W1920H1080,
            "2560x1440" => Resolution::W2560H1440,
            "3840x2160" => Resolution::W3840H2160,
            other => {
                log::warn!("config: unrecognized resolution '{}', defaulting to 1280x720", other);
                Resolution::W1280H720
            }
        }
    }

    pub fn enabled_sensors(&self) -> Vec<SensorType> {
        self.sensors_enabled
            .iter()
            .filter_map(|name| match name.as_str() {
                "DRIVING_STATUS" => Some(SensorType::DrivingStatus),
                "LOCATION" => Some(SensorType::Location),
                "NIGHT" => Some(SensorType::Night),
                "VEHICLE_SPEED" => Some(SensorType::VehicleSpeed),
                other => {
                    log::warn!("config: unrecognized sensor type '{}'", other);
                    None
                }
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_sane_transport() {
        let config = EngineConfig::default();
        assert!(matches!(config.transport, TransportConfig::Socket { .. }));
        assert_eq!(config.resolution(), Resolution::W1280H720);
    }

    #[test]
    fn load_missing_file_falls_back_to_defaults() {
        let config = EngineConfig::load(Path::new("/nonexistent/path.toml")).unwrap();
        assert_eq!(config.mic_sample_rate, 16000);
    }

    #[test]
    fn usb_id_roundtrips_through_display() {
        let id = UsbId::from_str("18d1:4ee7").unwrap();
        assert_eq!(id.to_string(), "18d1:4ee7");
    }

    #[test]
    fn save_preserves_unrelated_document_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "# a comment\nresolution = \"800x480\"\n").unwrap();
        let mut config = EngineConfig::load(&path).unwrap();
        config.resolution = "1920x1080".to_string();
        config.save(&path).unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("# a comment"));
        assert!(saved.contains("1920x1080"));
    }
}
