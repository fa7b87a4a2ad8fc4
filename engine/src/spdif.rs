use crate::format::AudioFormat;
use byteorder::{BigEndian, ByteOrder, LittleEndian};
use tracing::{debug, warn};

const SYNC_WORD: u16 = 0x0B77;
const PREAMBLE_PA: u16 = 0xF872;
const PREAMBLE_PB: u16 = 0x4E1F;
const PREAMBLE_BYTES: usize = 8;
const HEADER_BYTES: usize = 6;
const BLOCKS_PER_BURST: u32 = 6;

/// Stereo 16-bit transport frames.
pub const BURST_FRAME_BYTES: usize = 4;

const AC3_BITRATES_KBPS: [u32; 19] = [
    32, 40, 48, 56, 64, 80, 96, 112, 128, 160, 192, 224, 256, 320, 384, 448, 512, 576, 640,
];
const EAC3_BLOCKS: [u32; 4] = [1, 2, 3, 6];

/// Packs a compressed bitstream into PCM-shaped bursts.
pub trait BurstEncoder: Send {
    /// Device rate over the stream's nominal rate.
    fn rate_multiplier(&self) -> u32;

    /// Accepts any amount of bitstream and returns every burst completed by
    /// it. Each burst is a whole number of stereo 16-bit frames.
    fn encode(&mut self, data: &[u8]) -> Vec<Vec<u8>>;

    /// Drops partial frames, e.g. after standby.
    fn reset(&mut self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Codec {
    Ac3,
    EAc3,
}

impl Codec {
    fn data_type(self) -> u16 {
        match self {
            Self::Ac3 => 1,
            Self::EAc3 => 21,
        }
    }

    /// Repetition period in transport frames.
    fn period(self) -> usize {
        match self {
            Self::Ac3 => 1536,
            Self::EAc3 => 6144,
        }
    }

    fn rate_multiplier(self) -> u32 {
        match self {
            Self::Ac3 => 1,
            Self::EAc3 => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FrameInfo {
    size: usize,
    blocks: u32,
}

fn ac3_frame_words(fscod: u8, frmsizecod: u8) -> Option<usize> {
    let kbps = *AC3_BITRATES_KBPS.get((frmsizecod >> 1) as usize)? as usize;
    match fscod {
        0 => Some(kbps * 2),
        1 => Some(kbps * 1_536_000 / 44_100 / 16 + (frmsizecod & 1) as usize),
        2 => Some(kbps * 3),
        _ => None,
    }
}

/// Parses the sync frame header at the start of `hdr`.
fn parse_header(hdr: &[u8]) -> Option<(Codec, FrameInfo)> {
    if hdr.len() < HEADER_BYTES || BigEndian::read_u16(hdr) != SYNC_WORD {
        return None;
    }
    let bsid = hdr[5] >> 3;
    if bsid <= 10 {
        let fscod = hdr[4] >> 6;
        let frmsizecod = hdr[4] & 0x3F;
        let words = ac3_frame_words(fscod, frmsizecod)?;
        return Some((
            Codec::Ac3,
            FrameInfo {
                size: words * 2,
                blocks: BLOCKS_PER_BURST,
            },
        ));
    }
    if bsid <= 16 {
        let frmsiz = (BigEndian::read_u16(&hdr[2..]) & 0x07FF) as usize;
        let fscod = hdr[4] >> 6;
        let blocks = if fscod == 3 {
            BLOCKS_PER_BURST
        } else {
            EAC3_BLOCKS[((hdr[4] >> 4) & 0x3) as usize]
        };
        // Dependent substreams ride along with their independent frame.
        let strmtyp = hdr[2] >> 6;
        let blocks = if strmtyp == 1 { 0 } else { blocks };
        return Some((
            Codec::EAc3,
            FrameInfo {
                size: (frmsiz + 1) * 2,
                blocks,
            },
        ));
    }
    None
}

/// IEC 61937 framing of AC-3 and E-AC-3 sync frames.
#[derive(Debug)]
pub struct Iec61937Encoder {
    codec: Codec,
    pending: Vec<u8>,
    payload: Vec<u8>,
    blocks: u32,
}

impl Iec61937Encoder {
    pub fn new(format: AudioFormat) -> Option<Self> {
        let codec = match format {
            AudioFormat::Ac3 => Codec::Ac3,
            AudioFormat::EAc3 => Codec::EAc3,
            _ => return None,
        };
        Some(Self {
            codec,
            pending: Vec::new(),
            payload: Vec::new(),
            blocks: 0,
        })
    }

    pub fn burst_bytes(&self) -> usize {
        self.codec.period() * BURST_FRAME_BYTES
    }

    fn finish_burst(&mut self) -> Option<Vec<u8>> {
        let payload = std::mem::take(&mut self.payload);
        self.blocks = 0;
        let size = self.burst_bytes();
        if payload.len() + PREAMBLE_BYTES > size {
            warn!(
                "Dropping {} byte payload, larger than a {size} byte burst",
                payload.len()
            );
            return None;
        }

        let length = match self.codec {
            Codec::Ac3 => payload.len() * 8,
            Codec::EAc3 => payload.len(),
        };
        let mut burst = vec![0u8; size];
        LittleEndian::write_u16(&mut burst[0..], PREAMBLE_PA);
        LittleEndian::write_u16(&mut burst[2..], PREAMBLE_PB);
        LittleEndian::write_u16(&mut burst[4..], self.codec.data_type());
        LittleEndian::write_u16(&mut burst[6..], length as u16);
        // Big-endian bitstream words go out as little-endian samples.
        for (i, pair) in payload.chunks(2).enumerate() {
            let at = PREAMBLE_BYTES + i * 2;
            burst[at] = pair.get(1).copied().unwrap_or(0);
            burst[at + 1] = pair[0];
        }
        Some(burst)
    }
}

impl BurstEncoder for Iec61937Encoder {
    fn rate_multiplier(&self) -> u32 {
        self.codec.rate_multiplier()
    }

    fn encode(&mut self, data: &[u8]) -> Vec<Vec<u8>> {
        self.pending.extend_from_slice(data);
        let mut bursts = Vec::new();

        loop {
            let sync = self
                .pending
                .windows(2)
                .position(|w| BigEndian::read_u16(w) == SYNC_WORD);
            let Some(sync) = sync else {
                let keep = usize::from(self.pending.last() == Some(&0x0B));
                let drop = self.pending.len() - keep;
                self.pending.drain(..drop);
                break;
            };
            if sync > 0 {
                debug!("Skipping {sync} bytes before sync word");
                self.pending.drain(..sync);
            }
            if self.pending.len() < HEADER_BYTES {
                break;
            }
            let Some((codec, info)) = parse_header(&self.pending) else {
                self.pending.drain(..1);
                continue;
            };
            if codec != self.codec {
                warn!("Unexpected {codec:?} frame in {:?} stream", self.codec);
                self.pending.drain(..1);
                continue;
            }
            if self.pending.len() < info.size {
                break;
            }
            self.payload.extend(self.pending.drain(..info.size));
            self.blocks += info.blocks;
            if self.blocks >= BLOCKS_PER_BURST {
                bursts.extend(self.finish_burst());
            }
        }
        bursts
    }

    fn reset(&mut self) {
        self.pending.clear();
        self.payload.clear();
        self.blocks = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ac3_frame(frmsizecod: u8) -> Vec<u8> {
        let words = ac3_frame_words(0, frmsizecod).expect("size");
        let mut frame = vec![0u8; words * 2];
        frame[0] = 0x0B;
        frame[1] = 0x77;
        frame[4] = frmsizecod;
        frame[5] = 8 << 3;
        frame[6] = 0xAB;
        frame[7] = 0xCD;
        frame
    }

    fn eac3_frame(numblkscod: u8, bytes: usize) -> Vec<u8> {
        let frmsiz = (bytes / 2 - 1) as u16;
        let mut frame = vec![0u8; bytes];
        frame[0] = 0x0B;
        frame[1] = 0x77;
        frame[2] = (frmsiz >> 8) as u8 & 0x07;
        frame[3] = frmsiz as u8;
        frame[4] = numblkscod << 4;
        frame[5] = 16 << 3;
        frame
    }

    #[test]
    fn ac3_frame_sizes() {
        assert_eq!(ac3_frame_words(0, 0), Some(64));
        assert_eq!(ac3_frame_words(0, 37), Some(1280));
        assert_eq!(ac3_frame_words(2, 2), Some(120));
        assert_eq!(ac3_frame_words(1, 0), Some(69));
        assert_eq!(ac3_frame_words(1, 1), Some(70));
        assert_eq!(ac3_frame_words(0, 38), None);
        assert_eq!(ac3_frame_words(3, 0), None);
    }

    #[test]
    fn one_ac3_frame_makes_one_burst() {
        let mut enc = Iec61937Encoder::new(AudioFormat::Ac3).expect("encoder");
        assert_eq!(enc.rate_multiplier(), 1);
        let frame = ac3_frame(8);
        let (head, tail) = frame.split_at(100);
        assert!(enc.encode(head).is_empty());
        let bursts = enc.encode(tail);
        assert_eq!(bursts.len(), 1);

        let burst = &bursts[0];
        assert_eq!(burst.len(), 1536 * 4);
        assert_eq!(LittleEndian::read_u16(&burst[0..]), PREAMBLE_PA);
        assert_eq!(LittleEndian::read_u16(&burst[2..]), PREAMBLE_PB);
        assert_eq!(LittleEndian::read_u16(&burst[4..]), 1);
        assert_eq!(LittleEndian::read_u16(&burst[6..]) as usize, frame.len() * 8);
        assert_eq!(&burst[8..10], &[0x77, 0x0B]);
        assert_eq!(&burst[14..16], &[0xCD, 0xAB]);
    }

    #[test]
    fn garbage_before_sync_is_skipped() {
        let mut enc = Iec61937Encoder::new(AudioFormat::Ac3).expect("encoder");
        let mut data = vec![0x12, 0x34, 0x0B];
        data.extend(ac3_frame(0));
        data.extend(ac3_frame(0));
        assert_eq!(enc.encode(&data).len(), 2);
    }

    #[test]
    fn eac3_collects_six_blocks() {
        let mut enc = Iec61937Encoder::new(AudioFormat::EAc3).expect("encoder");
        assert_eq!(enc.rate_multiplier(), 4);
        let frame = eac3_frame(1, 256);
        assert!(enc.encode(&frame).is_empty());
        assert!(enc.encode(&frame).is_empty());
        let bursts = enc.encode(&frame);
        assert_eq!(bursts.len(), 1);
        assert_eq!(bursts[0].len(), 6144 * 4);
        assert_eq!(LittleEndian::read_u16(&bursts[0][4..]), 21);
        assert_eq!(LittleEndian::read_u16(&bursts[0][6..]), 768);

        let full = eac3_frame(3, 512);
        assert_eq!(enc.encode(&full).len(), 1);
    }

    #[test]
    fn pcm_has_no_encoder() {
        assert!(Iec61937Encoder::new(AudioFormat::Pcm16).is_none());
    }
}
