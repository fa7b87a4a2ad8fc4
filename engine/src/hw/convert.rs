use byteorder::{ByteOrder, LittleEndian};

/// Conversion applied to every chunk between the stream's 16-bit samples and
/// the format the sink's PCM device was opened with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTransform {
    Passthrough,
    /// Sign-extended 24-bit value in the low three bytes of a 32-bit word.
    S16ToS24In32,
}

impl SampleTransform {
    pub fn output_len(self, input_len: usize) -> usize {
        match self {
            Self::Passthrough => input_len,
            Self::S16ToS24In32 => (input_len / 2) * 4,
        }
    }

    /// Writes the converted samples of `src` into `dst`, replacing its
    /// contents. A gain of exactly 1.0 leaves sample values untouched.
    pub fn apply(self, src: &[u8], gain: f32, dst: &mut Vec<u8>) {
        dst.clear();
        dst.resize(self.output_len(src.len()), 0);
        let unity = gain == 1.0;
        match self {
            Self::Passthrough => {
                if unity {
                    dst.copy_from_slice(src);
                    return;
                }
                let samples = src.len() / 2;
                for i in 0..samples {
                    let s = LittleEndian::read_i16(&src[i * 2..]);
                    LittleEndian::write_i16(&mut dst[i * 2..], scale(s, gain));
                }
                if src.len() % 2 == 1 {
                    dst[src.len() - 1] = src[src.len() - 1];
                }
            }
            Self::S16ToS24In32 => {
                let samples = src.len() / 2;
                for i in 0..samples {
                    let mut s = LittleEndian::read_i16(&src[i * 2..]);
                    if !unity {
                        s = scale(s, gain);
                    }
                    LittleEndian::write_i32(&mut dst[i * 4..], (s as i32) << 8);
                }
            }
        }
    }
}

fn scale(sample: i16, gain: f32) -> i16 {
    (sample as f32 * gain)
        .round()
        .clamp(i16::MIN as f32, i16::MAX as f32) as i16
}

#[cfg(test)]
mod tests {
    use super::*;

    fn le16(samples: &[i16]) -> Vec<u8> {
        let mut out = vec![0u8; samples.len() * 2];
        LittleEndian::write_i16_into(samples, &mut out);
        out
    }

    #[test]
    fn widens_to_24_in_32() {
        let src = le16(&[1, -1, i16::MAX, i16::MIN]);
        let mut dst = Vec::new();
        SampleTransform::S16ToS24In32.apply(&src, 1.0, &mut dst);
        assert_eq!(dst.len(), 16);
        let mut words = [0i32; 4];
        LittleEndian::read_i32_into(&dst, &mut words);
        assert_eq!(words, [0x100, -0x100, 0x7FFF00, -0x800000]);
    }

    #[test]
    fn gain_scales_and_mutes() {
        let src = le16(&[1000, -1000]);
        let mut dst = Vec::new();
        SampleTransform::Passthrough.apply(&src, 0.5, &mut dst);
        assert_eq!(dst, le16(&[500, -500]));
        SampleTransform::S16ToS24In32.apply(&src, 0.0, &mut dst);
        assert!(dst.iter().all(|b| *b == 0));
    }
}
