use super::cards;
use super::pcm::{Direction, HwTimestamp, PcmBackend, PcmConfig, PcmDevice, PcmError, PcmFormat};
use crate::clock::{LocalClock, NSEC_PER_SEC};
use alsa::pcm::{Access, Format, Frames, HwParams, PCM, State, TstampType};
use alsa::ValueOr;
use nix::libc;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, error};

#[derive(Debug)]
pub struct AlsaBackend {
    proc_root: PathBuf,
    clock: Arc<dyn LocalClock>,
}

impl AlsaBackend {
    pub fn new(proc_root: PathBuf, clock: Arc<dyn LocalClock>) -> Self {
        Self { proc_root, clock }
    }
}

impl PcmBackend for AlsaBackend {
    fn find_card(&self, name: &str) -> Option<u32> {
        cards::find_card_by_name(&self.proc_root, name)
    }

    fn open(
        &self,
        card: u32,
        device: u32,
        direction: Direction,
        config: &PcmConfig,
    ) -> Result<Box<dyn PcmDevice>, PcmError> {
        let pcm = AlsaPcm::open(card, device, direction, config, self.clock.clone())?;
        Ok(Box::new(pcm))
    }
}

pub struct AlsaPcm {
    pcm: PCM,
    name: String,
    config: PcmConfig,
    clock: Arc<dyn LocalClock>,
    frames_written: u64,
    dma_start: Option<i64>,
}

impl fmt::Debug for AlsaPcm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AlsaPcm")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("frames_written", &self.frames_written)
            .field("dma_start", &self.dma_start)
            .finish()
    }
}

fn alsa_format(format: PcmFormat) -> Format {
    match format {
        PcmFormat::S16Le => Format::S16LE,
        PcmFormat::S24Le => Format::S24LE,
        PcmFormat::S32Le => Format::S32LE,
    }
}

fn map_err(context: &str, name: &str, e: alsa::Error) -> PcmError {
    if e.errno() == libc::EBADFD || e.errno() == libc::ENODEV {
        return PcmError::Disconnected;
    }
    PcmError::Io(format!("{context} '{name}': {e}"))
}

/// The driver leaves the timestamp zeroed until the stream has run.
fn htstamp_ns(sec: i64, nsec: i64) -> Option<i64> {
    if sec == 0 && nsec == 0 {
        return None;
    }
    sec.checked_mul(NSEC_PER_SEC as i64)?.checked_add(nsec)
}

impl AlsaPcm {
    pub fn open(
        card: u32,
        device: u32,
        direction: Direction,
        config: &PcmConfig,
        clock: Arc<dyn LocalClock>,
    ) -> Result<Self, PcmError> {
        let name = format!("hw:{card},{device}");
        let dir = match direction {
            Direction::Playback => alsa::Direction::Playback,
            Direction::Capture => alsa::Direction::Capture,
        };
        let pcm = PCM::new(&name, dir, false)
            .map_err(|e| PcmError::Unavailable(format!("Failed to open ALSA PCM '{name}': {e}")))?;
        configure_pcm(&pcm, config).map_err(|e| map_err("Failed to configure", &name, e))?;
        debug!(
            "Opened {name}: {} ch, {} Hz, {:?}, {}x{} frames",
            config.channels, config.rate, config.format, config.period_count, config.period_size
        );
        Ok(Self {
            pcm,
            name,
            config: *config,
            clock,
            frames_written: 0,
            dma_start: None,
        })
    }

    fn frames_to_ticks(&self, frames: u64) -> i64 {
        (frames as u128 * self.clock.local_freq() as u128 / self.config.rate.max(1) as u128) as i64
    }

    fn recover_xrun(&mut self) {
        if self.pcm.state() == State::XRun {
            self.dma_start = None;
            self.frames_written = 0;
            if let Err(e) = self.pcm.prepare() {
                error!("ALSA prepare after xrun failed on {}: {e}", self.name);
            }
        }
    }
}

fn configure_pcm(pcm: &PCM, config: &PcmConfig) -> Result<(), alsa::Error> {
    {
        let hwp = HwParams::any(pcm)?;
        hwp.set_access(Access::RWInterleaved)?;
        hwp.set_format(alsa_format(config.format))?;
        hwp.set_channels(config.channels)?;
        hwp.set_rate(config.rate, ValueOr::Nearest)?;
        hwp.set_period_size_near(config.period_size as Frames, ValueOr::Nearest)?;
        hwp.set_periods(config.period_count, ValueOr::Nearest)?;
        pcm.hw_params(&hwp)?;
    }
    {
        let swp = pcm.sw_params_current()?;
        swp.set_start_threshold(config.start_threshold as Frames)?;
        swp.set_tstamp_mode(true)?;
        swp.set_tstamp_type(TstampType::Monotonic)?;
        pcm.sw_params(&swp)?;
    }
    pcm.prepare()
}

impl PcmDevice for AlsaPcm {
    fn config(&self) -> &PcmConfig {
        &self.config
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, PcmError> {
        let frame_bytes = self.config.frame_bytes();
        let mut offset = 0;
        while data.len() - offset >= frame_bytes {
            let result = self.pcm.io_bytes().writei(&data[offset..]);
            match result {
                Ok(0) => break,
                Ok(frames) => {
                    offset += frames * frame_bytes;
                    self.frames_written += frames as u64;
                }
                Err(e) => {
                    let err = map_err("ALSA write failed on", &self.name, e);
                    if !err.is_disconnected() {
                        self.recover_xrun();
                    }
                    return Err(err);
                }
            }
        }
        Ok(offset)
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, PcmError> {
        let frame_bytes = self.config.frame_bytes();
        let mut offset = 0;
        while data.len() - offset >= frame_bytes {
            let result = self.pcm.io_bytes().readi(&mut data[offset..]);
            match result {
                Ok(0) => break,
                Ok(frames) => offset += frames * frame_bytes,
                Err(e) => {
                    let err = map_err("ALSA read failed on", &self.name, e);
                    if !err.is_disconnected() {
                        self.recover_xrun();
                    }
                    return Err(err);
                }
            }
        }
        Ok(offset)
    }

    /// Available frames and the driver's monotonic timestamp, taken from
    /// the same status snapshot.
    fn htimestamp(&mut self) -> Result<HwTimestamp, PcmError> {
        let status = self
            .pcm
            .status()
            .map_err(|e| map_err("ALSA status failed on", &self.name, e))?;
        if status.get_state() == State::Disconnected {
            return Err(PcmError::Disconnected);
        }
        let ts = status.get_htstamp();
        let timestamp_ns =
            htstamp_ns(ts.tv_sec as i64, ts.tv_nsec as i64).ok_or(PcmError::NotRunning)?;
        Ok(HwTimestamp {
            avail: status.get_avail().max(0) as u32,
            timestamp_ns,
        })
    }

    fn dma_start_time(&mut self) -> Result<i64, PcmError> {
        match self.pcm.state() {
            State::Running => {}
            State::Disconnected => return Err(PcmError::Disconnected),
            _ => {
                self.dma_start = None;
                return Err(PcmError::NotRunning);
            }
        }
        if let Some(start) = self.dma_start {
            return Ok(start);
        }
        let delay = self
            .pcm
            .delay()
            .map_err(|e| map_err("ALSA delay failed on", &self.name, e))?;
        let now = self.clock.local_time();
        let played = self.frames_written.saturating_sub(delay.max(0) as u64);
        let start = now - self.frames_to_ticks(played);
        self.dma_start = Some(start);
        Ok(start)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn driver_timestamps_convert_to_nanoseconds() {
        assert_eq!(htstamp_ns(0, 0), None);
        assert_eq!(htstamp_ns(2, 500), Some(2_000_000_500));
        assert_eq!(htstamp_ns(0, 1), Some(1));
        assert_eq!(htstamp_ns(i64::MAX, 0), None);
    }
}
