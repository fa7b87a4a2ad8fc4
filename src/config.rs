use hdmi_hal_engine::caps::StaticCaps;
use hdmi_hal_engine::hw::config::{BACKEND_ENV, CAPTURE_DIR_ENV, LOG_ENV, env_value};
use hdmi_hal_engine::hw::options::HalOptions;
use serde::Deserialize;
use std::io;
use std::path::{Path, PathBuf};

pub const DEFAULT_CONFIG_PATH: &str = "/etc/hdmi-hal.toml";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    Alsa,
    Null,
}

impl Backend {
    fn parse(s: &str) -> Option<Self> {
        match s.to_ascii_lowercase().as_str() {
            "alsa" => Some(Self::Alsa),
            "null" => Some(Self::Null),
            _ => None,
        }
    }
}

impl Default for Backend {
    fn default() -> Self {
        if cfg!(target_os = "linux") {
            Self::Alsa
        } else {
            Self::Null
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub log_level: String,
    pub backend: Backend,
    pub hal: HalOptions,
    /// Sink capabilities reported by the null backend.
    pub caps: StaticCaps,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log_level: "info".to_string(),
            backend: Backend::default(),
            hal: HalOptions::default(),
            caps: StaticCaps::stereo_only(),
        }
    }
}

impl Config {
    /// Reads `path`, or the default location if it exists, then applies
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> io::Result<Self> {
        let path = match path {
            Some(p) => Some(p.to_path_buf()),
            None => Some(PathBuf::from(DEFAULT_CONFIG_PATH)).filter(|p| p.exists()),
        };
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(&path).map_err(|e| {
                    io::Error::other(format!("Failed to read '{}': {e}", path.display()))
                })?;
                Self::parse(&text).map_err(|e| {
                    io::Error::other(format!("Failed to parse '{}': {e}", path.display()))
                })?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    pub fn parse(text: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(text)
    }

    fn apply_env(&mut self) {
        if let Some(level) = env_value(LOG_ENV) {
            self.log_level = level;
        }
        if let Some(backend) = env_value(BACKEND_ENV).as_deref().and_then(Backend::parse) {
            self.backend = backend;
        }
        if let Some(dir) = env_value(CAPTURE_DIR_ENV) {
            self.hal.capture_device_dir = PathBuf::from(dir);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").expect("parse");
        assert_eq!(config.log_level, "info");
        assert_eq!(config.hal.hdmi_card_name, "IntelHDMI");
        assert!(config.caps.basic_audio);
    }

    #[test]
    fn tables_override_defaults() {
        let config = Config::parse(
            r#"
log_level = "debug"
backend = "null"

[hal]
hdmi_card_name = "HDMI"
open_retries = 1

[hal.settings.hdmi]
delay_comp_usec = 20000

[caps]
basic_audio = true
speaker_allocation = 1
"#,
        )
        .expect("parse");
        assert_eq!(config.backend, Backend::Null);
        assert_eq!(config.hal.hdmi_card_name, "HDMI");
        assert_eq!(config.hal.open_retries, 1);
        assert_eq!(config.hal.capture_device_dir, PathBuf::from("/dev/snd"));
        assert_eq!(config.hal.settings.hdmi.delay_comp_usec, 20_000);
        assert!(config.hal.settings.hdmi.allowed);
        assert!(config.caps.modes.is_empty());
    }

    #[test]
    fn backend_names() {
        assert_eq!(Backend::parse("ALSA"), Some(Backend::Alsa));
        assert_eq!(Backend::parse("null"), Some(Backend::Null));
        assert_eq!(Backend::parse("jack"), None);
    }
}
