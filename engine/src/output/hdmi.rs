use super::{StreamFormat, VolumeParams};
use crate::hw::convert::SampleTransform;
use crate::hw::pcm::{PcmConfig, PcmFormat};

pub const OUTPUT_NAME: &str = "HDMI";
pub const ALSA_CARD_NAME: &str = "IntelHDMI";

/// The HDMI codec only runs 24-bit samples in 32-bit containers.
pub const DEVICE_FORMAT: PcmFormat = PcmFormat::S24Le;

pub fn pcm_config(fmt: &StreamFormat) -> PcmConfig {
    PcmConfig {
        channels: fmt.channel_count,
        rate: fmt.sample_rate,
        period_size: fmt.frames_per_chunk,
        period_count: fmt.buffer_chunks,
        format: DEVICE_FORMAT,
        start_threshold: 1,
    }
}

pub fn sample_transform(fmt: &StreamFormat) -> SampleTransform {
    match (fmt.bytes_per_sample, DEVICE_FORMAT) {
        (2, PcmFormat::S24Le) => SampleTransform::S16ToS24In32,
        _ => SampleTransform::Passthrough,
    }
}

/// Linear gain for the current volume state. Compressed bursts are never
/// scaled.
pub fn gain(params: &VolumeParams, encoded: bool) -> f32 {
    if encoded {
        return 1.0;
    }
    if params.mute {
        return 0.0;
    }
    if params.fixed {
        return 10f32.powf(params.fixed_level_db.min(0.0) / 20.0);
    }
    params.volume.clamp(0.0, 1.0)
}
