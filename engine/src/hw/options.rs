use crate::manager::Settings;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HalOptions {
    pub hdmi_card_name: String,
    pub hdmi_pcm_device: u32,
    pub voice_recognition_card_name: String,
    pub capture_device_dir: PathBuf,
    pub proc_asound_dir: PathBuf,
    pub open_retries: u32,
    pub open_retry_delay_ms: u64,
    pub settings: Settings,
}

impl HalOptions {
    pub fn open_retry_delay(&self) -> Duration {
        Duration::from_millis(self.open_retry_delay_ms)
    }
}

impl Default for HalOptions {
    fn default() -> Self {
        Self {
            hdmi_card_name: "IntelHDMI".to_string(),
            hdmi_pcm_device: 0,
            voice_recognition_card_name: "ATVRAudio".to_string(),
            capture_device_dir: PathBuf::from("/dev/snd"),
            proc_asound_dir: PathBuf::from(super::cards::PROC_ASOUND),
            open_retries: 3,
            open_retry_delay_ms: 1000,
            settings: Settings::default(),
        }
    }
}
