use super::probe::DeviceInfo;
use super::registry::{INPUT_PERIOD_MSEC, InputManager, InputSource};
use super::resample::CaptureResampler;
use crate::error::{HalError, HalResult, lock};
use crate::format::{AudioFormat, CHANNEL_IN_MONO};
use crate::hw::pcm::{Direction, PcmConfig, PcmDevice, PcmFormat};
use crate::params::{KEY_INPUT_SOURCE, Parameters};
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::{Mutex, Weak};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const INPUT_FORMAT: AudioFormat = AudioFormat::Pcm16;
pub const INPUT_CHANNEL_MASK: u32 = CHANNEL_IN_MONO;
const INPUT_FRAME_BYTES: usize = 2;
const INPUT_PERIOD_COUNT: u32 = 4;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputStreamSnapshot {
    pub sample_rate: u32,
    pub input_source: InputSource,
    pub standby: bool,
    pub disabled: bool,
    pub device: Option<(u32, u32)>,
    pub device_rate: Option<u32>,
    pub device_channels: Option<u32>,
}

/// A mono 16-bit capture stream fed by whichever capture device best
/// matches its input source.
#[derive(Debug)]
pub struct InputStream {
    owner: Weak<InputManager>,
    sample_rate: u32,
    capture: Mutex<Capture>,
}

#[derive(Debug)]
struct Capture {
    input_source: InputSource,
    standby: bool,
    /// No usable device: reads return paced silence until the next standby.
    disabled: bool,
    device: Option<DeviceInfo>,
    pcm: Option<Box<dyn PcmDevice>>,
    resampler: Option<CaptureResampler>,
    period: Vec<u8>,
    mono: Vec<i16>,
    fifo: VecDeque<i16>,
}

impl Capture {
    fn close(&mut self) {
        if self.pcm.take().is_some() {
            debug!("Closing capture PCM");
        }
        self.resampler = None;
        self.device = None;
        self.fifo.clear();
        self.standby = true;
        self.disabled = false;
    }

    /// Reads one device period and appends its first channel, converted to
    /// the stream rate, to the fifo.
    fn fill_period(&mut self) -> HalResult<()> {
        let Some(pcm) = self.pcm.as_mut() else {
            return Err(HalError::NoInit);
        };
        let config = *pcm.config();
        let frame_bytes = config.frame_bytes();
        self.period.resize(config.period_size as usize * frame_bytes, 0);
        let read = pcm.read(&mut self.period).map_err(|e| {
            error!("Capture read failed: {e}");
            HalError::Device(e.to_string())
        })?;
        let frames = read / frame_bytes;
        if frames == 0 {
            warn!("Capture read returned no frames");
            return Err(HalError::Device("empty capture read".to_string()));
        }
        let period_frames = config.period_size as usize;
        if frames < period_frames {
            debug!("Short capture read of {frames} frames, padding with silence");
            self.period[frames * frame_bytes..].fill(0);
        }
        self.mono.clear();
        self.mono.extend(
            self.period
                .chunks_exact(frame_bytes)
                .map(|frame| i16::from_le_bytes([frame[0], frame[1]])),
        );

        let before = self.fifo.len();
        match self.resampler.as_mut() {
            Some(rs) => rs.process(&self.mono, &mut self.fifo)?,
            None => self.fifo.extend(self.mono.iter().copied()),
        }
        if self.fifo.len() == before {
            return Err(HalError::Device("capture period produced no frames".to_string()));
        }
        Ok(())
    }
}

fn clip(requested: u32, min: u32, max: u32) -> u32 {
    if requested < min {
        min
    } else if requested > max {
        max
    } else {
        requested
    }
}

impl InputStream {
    pub(crate) fn new(
        owner: Weak<InputManager>,
        format: AudioFormat,
        channel_mask: u32,
        sample_rate: u32,
    ) -> HalResult<Self> {
        if format != INPUT_FORMAT || channel_mask != INPUT_CHANNEL_MASK || sample_rate == 0 {
            warn!(
                "Rejecting input stream {} mask {channel_mask:#x} at {sample_rate}",
                format.name()
            );
            return Err(HalError::BadValue);
        }
        Ok(Self {
            owner,
            sample_rate,
            capture: Mutex::new(Capture {
                input_source: InputSource::Default,
                standby: true,
                disabled: false,
                device: None,
                pcm: None,
                resampler: None,
                period: Vec::new(),
                mono: Vec::new(),
                fifo: VecDeque::new(),
            }),
        })
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn format(&self) -> AudioFormat {
        INPUT_FORMAT
    }

    pub fn channel_mask(&self) -> u32 {
        INPUT_CHANNEL_MASK
    }

    pub fn frame_size(&self) -> usize {
        INPUT_FRAME_BYTES
    }

    pub fn buffer_size(&self) -> usize {
        super::registry::input_buffer_size(self.sample_rate, INPUT_FORMAT, 1)
    }

    pub fn set_format(&self, _format: AudioFormat) -> HalResult<()> {
        Err(HalError::InvalidOperation)
    }

    pub fn input_source(&self) -> InputSource {
        lock(&self.capture).input_source
    }

    pub fn is_in_standby(&self) -> bool {
        lock(&self.capture).standby
    }

    pub fn is_disabled(&self) -> bool {
        lock(&self.capture).disabled
    }

    /// Card and device currently captured from.
    pub fn device(&self) -> Option<(u32, u32)> {
        lock(&self.capture).device.map(|d| (d.card, d.device))
    }

    pub fn standby(&self) {
        lock(&self.capture).close();
    }

    /// Always fills `buffer`. Without a usable device the data is silence
    /// delivered at the stream's real-time rate.
    pub fn read(&self, buffer: &mut [u8]) -> usize {
        let frames = buffer.len() / INPUT_FRAME_BYTES;
        let bytes = frames * INPUT_FRAME_BYTES;
        let mut cap = lock(&self.capture);

        let mut result = Ok(());
        if cap.standby {
            cap.standby = false;
            result = self.start(&mut cap);
            if result.is_err() {
                cap.disabled = true;
            }
        }
        if result.is_ok() && !cap.disabled {
            result = self.read_frames(&mut cap, &mut buffer[..bytes]);
        }

        if result.is_err() || cap.disabled {
            drop(cap);
            buffer[..bytes].fill(0);
            let usec = frames as u64 * 1_000_000 / self.sample_rate as u64;
            std::thread::sleep(Duration::from_micros(usec));
        } else if self.owner.upgrade().is_some_and(|m| m.mic_mute()) {
            buffer[..bytes].fill(0);
        }
        bytes
    }

    fn read_frames(&self, cap: &mut Capture, out: &mut [u8]) -> HalResult<()> {
        let frames = out.len() / INPUT_FRAME_BYTES;
        while cap.fifo.len() < frames {
            cap.fill_period()?;
        }
        for (slot, sample) in out
            .chunks_exact_mut(INPUT_FRAME_BYTES)
            .zip(cap.fifo.drain(..frames))
        {
            slot.copy_from_slice(&sample.to_le_bytes());
        }
        Ok(())
    }

    fn start(&self, cap: &mut Capture) -> HalResult<()> {
        let Some(owner) = self.owner.upgrade() else {
            return Err(HalError::NoInit);
        };
        let Some(device) = owner.get_best_device(cap.input_source) else {
            warn!("No capture device for {:?}, reading silence", cap.input_source);
            return Err(HalError::InvalidOperation);
        };

        let channels = clip(1, device.min_channels, device.max_channels).max(1);
        let rate = clip(
            self.sample_rate,
            device.min_sample_rate,
            device.max_sample_rate,
        )
        .max(1);
        let period_size = (rate * INPUT_PERIOD_MSEC / 1000).max(1);
        let config = PcmConfig {
            channels,
            rate,
            period_size,
            period_count: INPUT_PERIOD_COUNT,
            format: PcmFormat::S16Le,
            start_threshold: 0,
        };
        info!(
            "Opening capture {}:{} with {channels} ch at {rate} for a {} stream",
            device.card, device.device, self.sample_rate
        );
        let pcm = owner
            .backend()
            .open(device.card, device.device, Direction::Capture, &config)
            .map_err(|e| {
                error!("Capture open of {}:{} failed: {e}", device.card, device.device);
                HalError::NoMemory
            })?;

        cap.resampler = None;
        if rate != self.sample_rate {
            match CaptureResampler::new(rate, self.sample_rate, period_size as usize) {
                Ok(rs) => cap.resampler = Some(rs),
                Err(e) => warn!("Unable to create capture resampler: {e}"),
            }
        }
        cap.pcm = Some(pcm);
        cap.device = Some(device);
        cap.fifo.clear();
        Ok(())
    }

    pub fn set_parameters(&self, kv_pairs: &str) -> HalResult<()> {
        let params = Parameters::parse(kv_pairs);
        if let Some(raw) = params.get_int(KEY_INPUT_SOURCE) {
            match InputSource::from_raw(raw) {
                Some(source) => {
                    info!("Input source set to {source:?}");
                    lock(&self.capture).input_source = source;
                }
                None => warn!("Ignoring unknown input source {raw}"),
            }
        }
        Ok(())
    }

    pub fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    pub fn snapshot(&self) -> InputStreamSnapshot {
        let cap = lock(&self.capture);
        let config = cap.pcm.as_ref().map(|p| *p.config());
        InputStreamSnapshot {
            sample_rate: self.sample_rate,
            input_source: cap.input_source,
            standby: cap.standby,
            disabled: cap.disabled,
            device: cap.device.map(|d| (d.card, d.device)),
            device_rate: config.map(|c| c.rate),
            device_channels: config.map(|c| c.channels),
        }
    }
}

impl Drop for InputStream {
    fn drop(&mut self) {
        lock(&self.capture).close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clipping_to_the_device_envelope() {
        assert_eq!(clip(1, 2, 2), 2);
        assert_eq!(clip(48_000, 8_000, 16_000), 16_000);
        assert_eq!(clip(16_000, 8_000, 48_000), 16_000);
        assert_eq!(clip(8_000, 16_000, 48_000), 16_000);
    }

    #[test]
    fn only_mono_pcm16_is_accepted() {
        let ok = InputStream::new(Weak::new(), AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000);
        assert!(ok.is_ok());
        let stereo = InputStream::new(
            Weak::new(),
            AudioFormat::Pcm16,
            crate::format::CHANNEL_IN_STEREO,
            16_000,
        );
        assert_eq!(stereo.err(), Some(HalError::BadValue));
        let float = InputStream::new(Weak::new(), AudioFormat::PcmFloat, CHANNEL_IN_MONO, 16_000);
        assert_eq!(float.err(), Some(HalError::BadValue));
    }

    #[test]
    fn orphaned_stream_reads_paced_silence() {
        let stream =
            InputStream::new(Weak::new(), AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000).unwrap();
        let mut buf = vec![0x55u8; 320];
        let started = std::time::Instant::now();
        assert_eq!(stream.read(&mut buf), 320);
        assert!(started.elapsed() >= Duration::from_millis(10));
        assert!(buf.iter().all(|&b| b == 0));
        assert!(stream.is_disabled());
        stream.standby();
        assert!(!stream.is_disabled());
        assert_eq!(stream.set_format(AudioFormat::Pcm16), Err(HalError::InvalidOperation));
    }
}
