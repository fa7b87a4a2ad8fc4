use super::pcm::{Direction, HwTimestamp, PcmBackend, PcmConfig, PcmDevice, PcmError};
use crate::clock::LocalClock;
use std::sync::Arc;
use std::time::Duration;

/// Virtual sink and source driven by the local clock. Lets the HAL run on
/// hosts that have no HDMI hardware.
#[derive(Debug)]
pub struct NullBackend {
    clock: Arc<dyn LocalClock>,
    realtime: bool,
}

impl NullBackend {
    /// With `realtime` set, writes block once the virtual buffer is full and
    /// reads block for the duration of the captured audio.
    pub fn new(clock: Arc<dyn LocalClock>, realtime: bool) -> Self {
        Self { clock, realtime }
    }
}

impl PcmBackend for NullBackend {
    fn find_card(&self, _name: &str) -> Option<u32> {
        Some(0)
    }

    fn open(
        &self,
        _card: u32,
        _device: u32,
        _direction: Direction,
        config: &PcmConfig,
    ) -> Result<Box<dyn PcmDevice>, PcmError> {
        if config.channels == 0 || config.rate == 0 {
            return Err(PcmError::Unavailable("empty config".to_string()));
        }
        Ok(Box::new(NullPcm {
            clock: self.clock.clone(),
            config: *config,
            realtime: self.realtime,
            frames_written: 0,
            start: None,
        }))
    }
}

#[derive(Debug)]
pub struct NullPcm {
    clock: Arc<dyn LocalClock>,
    config: PcmConfig,
    realtime: bool,
    frames_written: u64,
    start: Option<i64>,
}

impl NullPcm {
    fn frames_played(&self, now: i64) -> u64 {
        let Some(start) = self.start else {
            return 0;
        };
        let elapsed = (now - start).max(0) as u128;
        (elapsed * self.config.rate as u128 / self.clock.local_freq().max(1) as u128) as u64
    }

    fn frames_duration(&self, frames: u64) -> Duration {
        Duration::from_micros(frames * 1_000_000 / self.config.rate.max(1) as u64)
    }

    /// Restarts the virtual DMA when playback ran dry.
    fn check_underrun(&mut self, now: i64) {
        if self.start.is_some() && self.frames_played(now) > self.frames_written {
            self.start = None;
            self.frames_written = 0;
        }
    }
}

impl PcmDevice for NullPcm {
    fn config(&self) -> &PcmConfig {
        &self.config
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, PcmError> {
        let frames = (data.len() / self.config.frame_bytes().max(1)) as u64;
        let now = self.clock.local_time();
        self.check_underrun(now);
        if self.start.is_none() && frames > 0 {
            self.start = Some(now);
        }
        if self.realtime {
            let pending = self.frames_written - self.frames_played(now).min(self.frames_written);
            let buffer = self.config.buffer_frames() as u64;
            if pending + frames > buffer {
                std::thread::sleep(self.frames_duration(pending + frames - buffer));
            }
        }
        self.frames_written += frames;
        Ok(frames as usize * self.config.frame_bytes())
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, PcmError> {
        data.fill(0);
        let frames = (data.len() / self.config.frame_bytes().max(1)) as u64;
        if self.realtime {
            std::thread::sleep(self.frames_duration(frames));
        }
        Ok(frames as usize * self.config.frame_bytes())
    }

    fn htimestamp(&mut self) -> Result<HwTimestamp, PcmError> {
        let now = self.clock.local_time();
        self.check_underrun(now);
        let pending = self.frames_written - self.frames_played(now).min(self.frames_written);
        let buffer = self.config.buffer_frames() as u64;
        Ok(HwTimestamp {
            avail: buffer.saturating_sub(pending) as u32,
            timestamp_ns: now,
        })
    }

    fn dma_start_time(&mut self) -> Result<i64, PcmError> {
        let now = self.clock.local_time();
        self.check_underrun(now);
        self.start.ok_or(PcmError::NotRunning)
    }
}
