use crate::error::{HalError, HalResult};
use rubato::{
    Resampler, SincFixedIn, SincInterpolationParameters, SincInterpolationType, WindowFunction,
};
use std::collections::VecDeque;
use tracing::error;

/// Mono 16-bit rate conversion over fixed device periods.
pub struct CaptureResampler {
    inner: SincFixedIn<f32>,
    chunk_frames: usize,
    input: Vec<f32>,
}

impl std::fmt::Debug for CaptureResampler {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaptureResampler")
            .field("chunk_frames", &self.chunk_frames)
            .finish()
    }
}

impl CaptureResampler {
    pub fn new(from_rate: u32, to_rate: u32, chunk_frames: usize) -> HalResult<Self> {
        if from_rate == 0 || to_rate == 0 || chunk_frames == 0 {
            return Err(HalError::BadValue);
        }
        let params = SincInterpolationParameters {
            sinc_len: 64,
            f_cutoff: 0.95,
            interpolation: SincInterpolationType::Linear,
            oversampling_factor: 128,
            window: WindowFunction::BlackmanHarris2,
        };
        let inner = SincFixedIn::<f32>::new(
            to_rate as f64 / from_rate as f64,
            1.0,
            params,
            chunk_frames,
            1,
        )
        .map_err(|e| {
            error!("Failed to create resampler {from_rate} -> {to_rate}: {e}");
            HalError::NoMemory
        })?;
        Ok(Self {
            inner,
            chunk_frames,
            input: Vec::with_capacity(chunk_frames),
        })
    }

    /// Converts exactly one chunk of samples and appends the result to `out`.
    pub fn process(&mut self, samples: &[i16], out: &mut VecDeque<i16>) -> HalResult<()> {
        if samples.len() != self.chunk_frames {
            return Err(HalError::BadValue);
        }
        self.input.clear();
        self.input
            .extend(samples.iter().map(|&s| s as f32 / i16::MAX as f32));
        let converted = self
            .inner
            .process(&[self.input.as_slice()], None)
            .map_err(|e| HalError::Device(format!("resampling failed: {e}")))?;
        if let Some(channel) = converted.first() {
            out.extend(
                channel
                    .iter()
                    .map(|&s| (s * i16::MAX as f32).clamp(i16::MIN as f32, i16::MAX as f32) as i16),
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn downsampling_yields_a_third_of_the_frames() {
        let mut rs = CaptureResampler::new(48_000, 16_000, 480).expect("resampler");
        let mut out = VecDeque::new();
        let chunk = vec![1000i16; 480];
        for _ in 0..20 {
            rs.process(&chunk, &mut out).expect("process");
        }
        let expected = 20 * 160;
        assert!(out.len().abs_diff(expected) <= 160, "got {}", out.len());
    }

    #[test]
    fn wrong_chunk_length_is_rejected() {
        let mut rs = CaptureResampler::new(44_100, 16_000, 441).expect("resampler");
        let mut out = VecDeque::new();
        assert_eq!(rs.process(&[0; 10], &mut out), Err(HalError::BadValue));
        assert!(CaptureResampler::new(0, 16_000, 441).is_err());
    }
}
