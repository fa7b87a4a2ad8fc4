use serde::{Deserialize, Serialize};

pub const CHANNEL_OUT_FRONT_LEFT: u32 = 0x1;
pub const CHANNEL_OUT_FRONT_RIGHT: u32 = 0x2;
pub const CHANNEL_OUT_FRONT_CENTER: u32 = 0x4;
pub const CHANNEL_OUT_LOW_FREQUENCY: u32 = 0x8;
pub const CHANNEL_OUT_BACK_LEFT: u32 = 0x10;
pub const CHANNEL_OUT_BACK_RIGHT: u32 = 0x20;
pub const CHANNEL_OUT_SIDE_LEFT: u32 = 0x200;
pub const CHANNEL_OUT_SIDE_RIGHT: u32 = 0x400;

pub const CHANNEL_OUT_MONO: u32 = CHANNEL_OUT_FRONT_LEFT;
pub const CHANNEL_OUT_STEREO: u32 = CHANNEL_OUT_FRONT_LEFT | CHANNEL_OUT_FRONT_RIGHT;
pub const CHANNEL_OUT_5POINT1: u32 = CHANNEL_OUT_STEREO
    | CHANNEL_OUT_FRONT_CENTER
    | CHANNEL_OUT_LOW_FREQUENCY
    | CHANNEL_OUT_BACK_LEFT
    | CHANNEL_OUT_BACK_RIGHT;
pub const CHANNEL_OUT_7POINT1: u32 =
    CHANNEL_OUT_5POINT1 | CHANNEL_OUT_SIDE_LEFT | CHANNEL_OUT_SIDE_RIGHT;

pub const CHANNEL_IN_LEFT: u32 = 0x4;
pub const CHANNEL_IN_RIGHT: u32 = 0x8;
pub const CHANNEL_IN_FRONT: u32 = 0x10;
pub const CHANNEL_IN_MONO: u32 = CHANNEL_IN_FRONT;
pub const CHANNEL_IN_STEREO: u32 = CHANNEL_IN_LEFT | CHANNEL_IN_RIGHT;

pub fn channel_count(mask: u32) -> u32 {
    mask.count_ones()
}

pub fn out_mask_name(mask: u32) -> Option<&'static str> {
    match mask {
        CHANNEL_OUT_MONO => Some("AUDIO_CHANNEL_OUT_MONO"),
        CHANNEL_OUT_STEREO => Some("AUDIO_CHANNEL_OUT_STEREO"),
        CHANNEL_OUT_5POINT1 => Some("AUDIO_CHANNEL_OUT_5POINT1"),
        CHANNEL_OUT_7POINT1 => Some("AUDIO_CHANNEL_OUT_7POINT1"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum AudioFormat {
    #[default]
    Default,
    Pcm16,
    Pcm8_24,
    Pcm32,
    PcmFloat,
    Ac3,
    EAc3,
}

impl AudioFormat {
    pub fn is_linear_pcm(self) -> bool {
        matches!(
            self,
            Self::Pcm16 | Self::Pcm8_24 | Self::Pcm32 | Self::PcmFloat
        )
    }

    pub fn bits_per_sample(self) -> Option<u32> {
        match self {
            Self::Pcm16 => Some(16),
            Self::Pcm8_24 => Some(24),
            Self::Pcm32 | Self::PcmFloat => Some(32),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Default => "AUDIO_FORMAT_DEFAULT",
            Self::Pcm16 => "AUDIO_FORMAT_PCM_16_BIT",
            Self::Pcm8_24 => "AUDIO_FORMAT_PCM_8_24_BIT",
            Self::Pcm32 => "AUDIO_FORMAT_PCM_32_BIT",
            Self::PcmFloat => "AUDIO_FORMAT_PCM_FLOAT",
            Self::Ac3 => "AUDIO_FORMAT_AC3",
            Self::EAc3 => "AUDIO_FORMAT_E_AC3",
        }
    }
}

pub const DEVICE_OUT_AUX_DIGITAL: u32 = 0x400;

/// Physical sink categories. One physical output exists per class at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceClass {
    Hdmi,
}

impl DeviceClass {
    pub const ALL: [DeviceClass; 1] = [DeviceClass::Hdmi];

    pub fn mask(self) -> u32 {
        match self {
            Self::Hdmi => DEVICE_OUT_AUX_DIGITAL,
        }
    }

    /// Only single-bit masks name a class.
    pub fn from_mask(mask: u32) -> Option<Self> {
        if mask.count_ones() != 1 {
            return None;
        }
        Self::ALL.into_iter().find(|c| c.mask() == mask)
    }
}
