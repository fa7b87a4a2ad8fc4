use crate::error::lock;
use crate::format::{
    AudioFormat, CHANNEL_OUT_5POINT1, CHANNEL_OUT_7POINT1, CHANNEL_OUT_STEREO, out_mask_name,
};
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::sync::Mutex;
use tracing::{debug, info, warn};

pub const SR_32000: u32 = 0x01;
pub const SR_44100: u32 = 0x02;
pub const SR_48000: u32 = 0x04;
pub const SR_88200: u32 = 0x08;
pub const SR_96000: u32 = 0x10;
pub const SR_176400: u32 = 0x20;
pub const SR_192000: u32 = 0x40;
const SR_ALL: u32 = 0x7F;

pub const BPS_16: u32 = 0x1;
pub const BPS_20: u32 = 0x2;
pub const BPS_24: u32 = 0x4;
const BPS_ALL: u32 = BPS_16 | BPS_20 | BPS_24;

pub const SA_FLFR: u32 = 0x001;
pub const SA_LFE: u32 = 0x002;
pub const SA_FC: u32 = 0x004;
pub const SA_RLRR: u32 = 0x008;
pub const SA_RC: u32 = 0x010;
pub const SA_FLCFRC: u32 = 0x020;
pub const SA_RLCRRC: u32 = 0x040;
pub const SA_FLWFRW: u32 = 0x080;
pub const SA_FLHFRH: u32 = 0x100;
pub const SA_TC: u32 = 0x200;
pub const SA_FCH: u32 = 0x400;

const MAX_MODE_CHANNELS: u32 = 8;

const RATE_TABLE: [(u32, u32); 7] = [
    (SR_32000, 32_000),
    (SR_44100, 44_100),
    (SR_48000, 48_000),
    (SR_88200, 88_200),
    (SR_96000, 96_000),
    (SR_176400, 176_400),
    (SR_192000, 192_000),
];

pub fn rate_to_mask(rate: u32) -> Option<u32> {
    RATE_TABLE.iter().find(|(_, r)| *r == rate).map(|(m, _)| *m)
}

/// Mixer controls of the HDMI codec, read in this order by `load_caps`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapsControl {
    BasicAudio,
    SpeakerAllocation,
    ModeCount,
    ModeToQuery,
    Format,
    MaxChannels,
    SampleRateMask,
    BitsPerSampleMask,
    MaxCompressedBitrate,
}

impl CapsControl {
    pub fn name(self) -> &'static str {
        match self {
            Self::BasicAudio => "Basic Audio Supported",
            Self::SpeakerAllocation => "Speaker Allocation",
            Self::ModeCount => "Audio Mode Count",
            Self::ModeToQuery => "Audio Mode To Query",
            Self::Format => "Query Mode : Format",
            Self::MaxChannels => "Query Mode : Max Ch Count",
            Self::SampleRateMask => "Query Mode : Sample Rate Mask",
            Self::BitsPerSampleMask => "Query Mode : PCM Bits/Sample Mask",
            Self::MaxCompressedBitrate => "Query Mode : Max Compressed Bitrate",
        }
    }
}

/// An open view of a sink's capability controls.
pub trait CapsQuery {
    fn read(&mut self, ctl: CapsControl) -> Result<i32, String>;
    fn write(&mut self, ctl: CapsControl, value: i32) -> Result<(), String>;
}

pub trait CapsSource: Send + Sync + Debug {
    fn open(&self, card: u32) -> Result<Box<dyn CapsQuery>, String>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CapsFormat {
    Lpcm = 1,
    Ac3 = 2,
    Mpeg1 = 3,
    Mp3 = 4,
    Mpeg2 = 5,
    AacLc = 6,
    Dts = 7,
    Atrac = 8,
    Dsd = 9,
    EAc3 = 10,
    DtsHd = 11,
    Mlp = 12,
    Dst = 13,
    WmaPro = 14,
    Extended = 15,
}

impl CapsFormat {
    pub fn from_tag(tag: i32) -> Option<Self> {
        Some(match tag {
            1 => Self::Lpcm,
            2 => Self::Ac3,
            3 => Self::Mpeg1,
            4 => Self::Mp3,
            5 => Self::Mpeg2,
            6 => Self::AacLc,
            7 => Self::Dts,
            8 => Self::Atrac,
            9 => Self::Dsd,
            10 => Self::EAc3,
            11 => Self::DtsHd,
            12 => Self::Mlp,
            13 => Self::Dst,
            14 => Self::WmaPro,
            15 => Self::Extended,
            _ => return None,
        })
    }

    pub fn tag(self) -> i32 {
        self as i32
    }

    /// Formats whose mode carries a maximum compressed bitrate.
    pub fn has_bitrate(self) -> bool {
        (Self::Ac3.tag()..=Self::Atrac.tag()).contains(&self.tag())
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Lpcm => "LPCM",
            Self::Ac3 => "AC-3",
            Self::Mpeg1 => "MPEG-1",
            Self::Mp3 => "MPEG-1 Layer 3",
            Self::Mpeg2 => "MPEG-2",
            Self::AacLc => "AAC-LC",
            Self::Dts => "DTS",
            Self::Atrac => "ATRAC",
            Self::Dsd => "DSD",
            Self::EAc3 => "E-AC3",
            Self::DtsHd => "DTS-HD",
            Self::Mlp => "MLP",
            Self::Dst => "DST",
            Self::WmaPro => "WMA Pro",
            Self::Extended => "Extended",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CapsMode {
    pub format: CapsFormat,
    pub max_channels: u32,
    pub sample_rates: u32,
    #[serde(default)]
    pub bits_per_sample: u32,
    #[serde(default)]
    pub max_compressed_bitrate: u32,
}

impl CapsMode {
    fn is_sane(&self) -> bool {
        self.max_channels <= MAX_MODE_CHANNELS
            && self.sample_rates & !SR_ALL == 0
            && self.bits_per_sample & !BPS_ALL == 0
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapsSet {
    pub basic_audio: bool,
    pub speaker_allocation: u32,
    pub modes: Vec<CapsMode>,
}

impl CapsSet {
    fn max_channel_mode(&self) -> Option<&CapsMode> {
        let mut best: Option<&CapsMode> = None;
        for mode in &self.modes {
            if best.is_none_or(|b| b.max_channels < mode.max_channels) {
                best = Some(mode);
            }
        }
        best
    }
}

/// Audio capabilities advertised by the connected HDMI sink.
#[derive(Debug, Default)]
pub struct HdmiAudioCaps {
    inner: Mutex<CapsSet>,
}

impl HdmiAudioCaps {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replaces the capability set with what the sink on `card` reports.
    /// Any failure leaves the set empty.
    pub fn load_caps(&self, source: &dyn CapsSource, card: u32) -> bool {
        let loaded = source
            .open(card)
            .and_then(|mut query| read_caps(query.as_mut()));
        let mut inner = lock(&self.inner);
        match loaded {
            Ok(set) => {
                info!(
                    "HDMI sink caps: speaker allocation 0x{:03x}, {} modes",
                    set.speaker_allocation,
                    set.modes.len()
                );
                *inner = set;
                true
            }
            Err(e) => {
                warn!("Failed to load HDMI caps on card {card}: {e}");
                *inner = CapsSet::default();
                false
            }
        }
    }

    pub fn reset(&self) {
        *lock(&self.inner) = CapsSet::default();
    }

    pub fn snapshot(&self) -> CapsSet {
        lock(&self.inner).clone()
    }

    pub fn basic_audio_supported(&self) -> bool {
        lock(&self.inner).basic_audio
    }

    pub fn supports_format(&self, format: AudioFormat, sample_rate: u32, channel_count: u32) -> bool {
        let caps = lock(&self.inner);
        if !caps.basic_audio {
            return false;
        }
        let caps_format = match format {
            AudioFormat::Pcm16 => CapsFormat::Lpcm,
            AudioFormat::Ac3 => CapsFormat::Ac3,
            AudioFormat::EAc3 => CapsFormat::EAc3,
            _ => return false,
        };
        let Some(sr_mask) = rate_to_mask(sample_rate) else {
            return false;
        };

        if caps_format == CapsFormat::Lpcm {
            if channel_count == 2 && sample_rate <= 48_000 {
                return true;
            }
            return caps.modes.iter().any(|m| {
                m.format == CapsFormat::Lpcm
                    && m.max_channels >= channel_count
                    && m.sample_rates & sr_mask != 0
                    && m.bits_per_sample & BPS_16 != 0
            });
        }
        caps.modes.iter().any(|m| {
            m.format == caps_format
                && m.max_channels >= channel_count
                && m.sample_rates & sr_mask != 0
        })
    }

    /// `|`-separated sample rates: basic audio rates plus those of the mode
    /// with the most channels.
    pub fn rates_for_framework(&self) -> String {
        let caps = lock(&self.inner);
        if !caps.basic_audio {
            return String::new();
        }
        let mut mask = SR_32000 | SR_44100 | SR_48000;
        if let Some(mode) = caps.max_channel_mode() {
            mask |= mode.sample_rates;
        }
        RATE_TABLE
            .iter()
            .filter(|(m, _)| mask & m != 0)
            .map(|(_, r)| r.to_string())
            .collect::<Vec<_>>()
            .join("|")
    }

    pub fn formats_for_framework(&self) -> String {
        let caps = lock(&self.inner);
        if !caps.basic_audio {
            return String::new();
        }
        let mut fmts = vec![AudioFormat::Pcm16.name()];
        for mode in &caps.modes {
            let name = match mode.format {
                CapsFormat::Ac3 => AudioFormat::Ac3.name(),
                CapsFormat::EAc3 => AudioFormat::EAc3.name(),
                _ => continue,
            };
            if !fmts.contains(&name) {
                fmts.push(name);
            }
        }
        fmts.join("|")
    }

    pub fn channel_masks_for_framework(&self) -> String {
        let caps = lock(&self.inner);
        if !caps.basic_audio {
            return String::new();
        }
        let mut masks = vec![CHANNEL_OUT_STEREO];
        if let Some(mode) = caps.max_channel_mode() {
            if mode.max_channels >= 6 {
                masks.push(CHANNEL_OUT_5POINT1);
            }
            if mode.max_channels >= 8 {
                masks.push(CHANNEL_OUT_7POINT1);
            }
        }
        masks
            .into_iter()
            .filter_map(out_mask_name)
            .collect::<Vec<_>>()
            .join("|")
    }
}

fn read_caps(query: &mut dyn CapsQuery) -> Result<CapsSet, String> {
    if query.read(CapsControl::BasicAudio)? == 0 {
        return Err("sink does not support basic audio".to_string());
    }
    let speaker_allocation = query.read(CapsControl::SpeakerAllocation)? as u32;
    let count = query.read(CapsControl::ModeCount)?;
    let mut modes = Vec::with_capacity(count.max(0) as usize);
    for idx in 0..count {
        query.write(CapsControl::ModeToQuery, idx)?;
        let tag = query.read(CapsControl::Format)?;
        let max_channels = query.read(CapsControl::MaxChannels)? as u32;
        let sample_rates = query.read(CapsControl::SampleRateMask)? as u32;
        let format = CapsFormat::from_tag(tag);
        let bits_per_sample = if format == Some(CapsFormat::Lpcm) {
            query.read(CapsControl::BitsPerSampleMask)? as u32
        } else {
            0
        };
        let max_compressed_bitrate = if format.is_some_and(CapsFormat::has_bitrate) {
            query.read(CapsControl::MaxCompressedBitrate)? as u32
        } else {
            0
        };
        let Some(format) = format else {
            debug!("Dropping HDMI mode {idx}: format tag {tag} out of range");
            continue;
        };
        let mode = CapsMode {
            format,
            max_channels,
            sample_rates,
            bits_per_sample,
            max_compressed_bitrate,
        };
        if mode.is_sane() {
            debug!(
                "HDMI mode {idx}: {} {} ch, rates 0x{:02x}, bps 0x{:x}, bitrate {}",
                format.name(),
                max_channels,
                sample_rates,
                bits_per_sample,
                max_compressed_bitrate
            );
            modes.push(mode);
        } else {
            debug!("Dropping HDMI mode {idx}: {mode:?}");
        }
    }
    Ok(CapsSet {
        basic_audio: true,
        speaker_allocation,
        modes,
    })
}

/// Capability source backed by a fixed table.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StaticCaps {
    pub basic_audio: bool,
    pub speaker_allocation: u32,
    pub modes: Vec<CapsMode>,
}

impl StaticCaps {
    pub fn stereo_only() -> Self {
        Self {
            basic_audio: true,
            speaker_allocation: SA_FLFR,
            modes: Vec::new(),
        }
    }
}

impl CapsSource for StaticCaps {
    fn open(&self, _card: u32) -> Result<Box<dyn CapsQuery>, String> {
        Ok(Box::new(StaticQuery {
            caps: self.clone(),
            selected: 0,
        }))
    }
}

struct StaticQuery {
    caps: StaticCaps,
    selected: usize,
}

impl CapsQuery for StaticQuery {
    fn read(&mut self, ctl: CapsControl) -> Result<i32, String> {
        let mode = || {
            self.caps
                .modes
                .get(self.selected)
                .ok_or_else(|| format!("no mode {}", self.selected))
        };
        Ok(match ctl {
            CapsControl::BasicAudio => self.caps.basic_audio as i32,
            CapsControl::SpeakerAllocation => self.caps.speaker_allocation as i32,
            CapsControl::ModeCount => self.caps.modes.len() as i32,
            CapsControl::ModeToQuery => self.selected as i32,
            CapsControl::Format => mode()?.format.tag(),
            CapsControl::MaxChannels => mode()?.max_channels as i32,
            CapsControl::SampleRateMask => mode()?.sample_rates as i32,
            CapsControl::BitsPerSampleMask => mode()?.bits_per_sample as i32,
            CapsControl::MaxCompressedBitrate => mode()?.max_compressed_bitrate as i32,
        })
    }

    fn write(&mut self, ctl: CapsControl, value: i32) -> Result<(), String> {
        if ctl != CapsControl::ModeToQuery || value < 0 {
            return Err(format!("control '{}' is read-only", ctl.name()));
        }
        self.selected = value as usize;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn six_channel_caps() -> StaticCaps {
        StaticCaps {
            basic_audio: true,
            speaker_allocation: SA_FLFR | SA_LFE | SA_FC | SA_RLRR,
            modes: vec![CapsMode {
                format: CapsFormat::Lpcm,
                max_channels: 6,
                sample_rates: SR_48000 | SR_44100,
                bits_per_sample: BPS_16,
                max_compressed_bitrate: 0,
            }],
        }
    }

    #[test]
    fn lpcm_capability_round_trip() {
        let caps = HdmiAudioCaps::new();
        assert!(caps.load_caps(&six_channel_caps(), 0));
        assert!(caps.supports_format(AudioFormat::Pcm16, 48_000, 2));
        assert!(caps.supports_format(AudioFormat::Pcm16, 48_000, 6));
        assert!(!caps.supports_format(AudioFormat::Pcm16, 96_000, 2));

        caps.reset();
        assert!(!caps.supports_format(AudioFormat::Pcm16, 48_000, 2));
        assert!(!caps.supports_format(AudioFormat::Pcm16, 48_000, 6));
        assert!(!caps.supports_format(AudioFormat::Pcm16, 96_000, 2));
    }

    #[test]
    fn unknown_rates_and_formats_are_rejected() {
        let caps = HdmiAudioCaps::new();
        assert!(caps.load_caps(&six_channel_caps(), 0));
        assert!(!caps.supports_format(AudioFormat::Pcm16, 22_050, 2));
        assert!(!caps.supports_format(AudioFormat::Pcm8_24, 48_000, 2));
        assert!(!caps.supports_format(AudioFormat::Ac3, 48_000, 2));
        assert!(!caps.supports_format(AudioFormat::Pcm16, 48_000, 8));
    }

    #[test]
    fn compressed_modes_ignore_bits_per_sample() {
        let mut table = six_channel_caps();
        table.modes.push(CapsMode {
            format: CapsFormat::Ac3,
            max_channels: 6,
            sample_rates: SR_48000,
            bits_per_sample: 0,
            max_compressed_bitrate: 640,
        });
        table.modes.push(CapsMode {
            format: CapsFormat::EAc3,
            max_channels: 8,
            sample_rates: SR_48000,
            bits_per_sample: 0,
            max_compressed_bitrate: 0,
        });
        let caps = HdmiAudioCaps::new();
        assert!(caps.load_caps(&table, 0));
        assert!(caps.supports_format(AudioFormat::Ac3, 48_000, 6));
        assert!(caps.supports_format(AudioFormat::EAc3, 48_000, 2));
        assert!(!caps.supports_format(AudioFormat::Ac3, 44_100, 2));
        assert_eq!(
            caps.formats_for_framework(),
            "AUDIO_FORMAT_PCM_16_BIT|AUDIO_FORMAT_AC3|AUDIO_FORMAT_E_AC3"
        );
        assert_eq!(
            caps.channel_masks_for_framework(),
            "AUDIO_CHANNEL_OUT_STEREO|AUDIO_CHANNEL_OUT_5POINT1|AUDIO_CHANNEL_OUT_7POINT1"
        );
        assert_eq!(caps.rates_for_framework(), "32000|44100|48000");
    }

    #[test]
    fn insane_modes_are_dropped() {
        let mut table = six_channel_caps();
        table.modes.push(CapsMode {
            format: CapsFormat::Lpcm,
            max_channels: 12,
            sample_rates: SR_96000,
            bits_per_sample: BPS_16,
            max_compressed_bitrate: 0,
        });
        table.modes.push(CapsMode {
            format: CapsFormat::Lpcm,
            max_channels: 8,
            sample_rates: 0x80,
            bits_per_sample: BPS_16,
            max_compressed_bitrate: 0,
        });
        let caps = HdmiAudioCaps::new();
        assert!(caps.load_caps(&table, 0));
        assert_eq!(caps.snapshot().modes.len(), 1);
        assert!(!caps.supports_format(AudioFormat::Pcm16, 96_000, 6));
    }

    #[test]
    fn no_basic_audio_means_nothing() {
        let mut table = six_channel_caps();
        table.basic_audio = false;
        let caps = HdmiAudioCaps::new();
        assert!(!caps.load_caps(&table, 0));
        assert!(!caps.supports_format(AudioFormat::Pcm16, 48_000, 2));
        assert_eq!(caps.rates_for_framework(), "");
        assert_eq!(caps.formats_for_framework(), "");
    }

    #[derive(Debug)]
    struct FailingSource;

    struct FailAfterCount(StaticQuery);

    impl CapsQuery for FailAfterCount {
        fn read(&mut self, ctl: CapsControl) -> Result<i32, String> {
            if ctl == CapsControl::SampleRateMask {
                return Err("mixer read failed".to_string());
            }
            self.0.read(ctl)
        }

        fn write(&mut self, ctl: CapsControl, value: i32) -> Result<(), String> {
            self.0.write(ctl, value)
        }
    }

    impl CapsSource for FailingSource {
        fn open(&self, _card: u32) -> Result<Box<dyn CapsQuery>, String> {
            Ok(Box::new(FailAfterCount(StaticQuery {
                caps: six_channel_caps(),
                selected: 0,
            })))
        }
    }

    #[test]
    fn mid_enumeration_failure_discards_everything() {
        let caps = HdmiAudioCaps::new();
        assert!(caps.load_caps(&six_channel_caps(), 0));
        assert!(!caps.load_caps(&FailingSource, 0));
        assert_eq!(caps.snapshot(), CapsSet::default());
        assert!(!caps.supports_format(AudioFormat::Pcm16, 48_000, 2));
    }
}
