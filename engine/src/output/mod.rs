pub mod hdmi;

use crate::clock::{LinearTransform, LocalClock};
use crate::error::{HalError, HalResult};
use crate::format::DeviceClass;
use crate::hw::convert::SampleTransform;
use crate::hw::pcm::{Direction, HwTimestamp, PcmBackend, PcmConfig, PcmDevice, PcmError};
use crate::hw::prefill;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const MAX_DELAY_COMPENSATION_MSEC: u32 = 300;
pub const PRIME_TIMEOUT_CHUNKS: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub enum OutputState {
    OutOfSync,
    Primed,
    DmaStart,
    Active,
    Fatal,
}

/// What a logical stream feeds an output with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channel_count: u32,
    pub bytes_per_sample: u32,
    pub frames_per_chunk: u32,
    pub buffer_chunks: u32,
    pub encoded: bool,
}

impl StreamFormat {
    pub fn frame_bytes(&self) -> usize {
        (self.channel_count * self.bytes_per_sample) as usize
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VolumeParams {
    pub volume: f32,
    pub mute: bool,
    pub fixed: bool,
    pub fixed_level_db: f32,
}

impl Default for VolumeParams {
    fn default() -> Self {
        Self {
            volume: 1.0,
            mute: false,
            fixed: false,
            fixed_level_db: 0.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimestampError {
    /// No valid timestamp yet; ask again after the next write.
    NotReady,
    /// A previously valid timeline broke.
    Discontinuity,
}

/// The closed set of physical sink types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum SinkKind {
    Hdmi,
}

impl SinkKind {
    pub fn for_class(class: DeviceClass) -> Self {
        match class {
            DeviceClass::Hdmi => Self::Hdmi,
        }
    }

    pub fn class(self) -> DeviceClass {
        match self {
            Self::Hdmi => DeviceClass::Hdmi,
        }
    }

    pub fn dev_mask(self) -> u32 {
        self.class().mask()
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Hdmi => hdmi::OUTPUT_NAME,
        }
    }

    fn pcm_config(self, fmt: &StreamFormat) -> PcmConfig {
        match self {
            Self::Hdmi => hdmi::pcm_config(fmt),
        }
    }

    fn sample_transform(self, fmt: &StreamFormat) -> SampleTransform {
        match self {
            Self::Hdmi => hdmi::sample_transform(fmt),
        }
    }

    fn gain(self, params: &VolumeParams, encoded: bool) -> f32 {
        match self {
            Self::Hdmi => hdmi::gain(params, encoded),
        }
    }
}

/// Where and how to open the sink's PCM device.
#[derive(Debug, Clone)]
pub struct SinkTarget {
    pub card_name: String,
    pub device: u32,
    pub open_retries: u32,
    pub open_retry_delay: Duration,
}

pub struct PhysicalOutput {
    sink: SinkKind,
    id: u64,
    target: SinkTarget,
    backend: Arc<dyn PcmBackend>,
    clock: Arc<dyn LocalClock>,
    device: Option<Box<dyn PcmDevice>>,
    state: OutputState,

    format: Option<StreamFormat>,
    pcm_config: Option<PcmConfig>,
    transform: SampleTransform,
    staging: Vec<u8>,
    silence: Vec<u8>,

    frames_to_local_time: LinearTransform,
    last_dma_start_time: Option<i64>,
    last_next_write_time: Option<i64>,
    frames_queued_to_driver: u64,
    prime_timeout_chunks: u32,
    max_delay_comp_frames: u32,
    external_delay_usec: u32,

    volume: VolumeParams,
    vol_params_dirty: bool,
    gain: f32,
}

impl fmt::Debug for PhysicalOutput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalOutput")
            .field("sink", &self.sink)
            .field("id", &self.id)
            .field("state", &self.state)
            .field("format", &self.format)
            .field("frames_queued_to_driver", &self.frames_queued_to_driver)
            .field("external_delay_usec", &self.external_delay_usec)
            .field("volume", &self.volume)
            .finish()
    }
}

impl PhysicalOutput {
    pub fn new(
        sink: SinkKind,
        id: u64,
        target: SinkTarget,
        backend: Arc<dyn PcmBackend>,
        clock: Arc<dyn LocalClock>,
    ) -> Self {
        Self {
            sink,
            id,
            target,
            backend,
            clock,
            device: None,
            state: OutputState::OutOfSync,
            format: None,
            pcm_config: None,
            transform: SampleTransform::Passthrough,
            staging: Vec::new(),
            silence: Vec::new(),
            frames_to_local_time: LinearTransform::default(),
            last_dma_start_time: None,
            last_next_write_time: None,
            frames_queued_to_driver: 0,
            prime_timeout_chunks: 0,
            max_delay_comp_frames: 0,
            external_delay_usec: 0,
            volume: VolumeParams::default(),
            vol_params_dirty: true,
            gain: 1.0,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn sink(&self) -> SinkKind {
        self.sink
    }

    pub fn name(&self) -> &'static str {
        self.sink.name()
    }

    pub fn dev_mask(&self) -> u32 {
        self.sink.dev_mask()
    }

    pub fn state(&self) -> OutputState {
        self.state
    }

    pub fn has_fatal_error(&self) -> bool {
        self.state == OutputState::Fatal
    }

    pub fn format(&self) -> Option<&StreamFormat> {
        self.format.as_ref()
    }

    pub fn frames_queued_to_driver(&self) -> u64 {
        self.frames_queued_to_driver
    }

    pub fn last_next_write_ts(&self) -> Option<i64> {
        self.last_next_write_time
    }

    pub fn max_delay_comp_frames(&self) -> u32 {
        self.max_delay_comp_frames
    }

    pub fn external_delay_usec(&self) -> u32 {
        self.external_delay_usec
    }

    pub fn set_external_delay_usec(&mut self, usec: u32) {
        self.external_delay_usec = usec.min(MAX_DELAY_COMPENSATION_MSEC * 1000);
    }

    pub fn volume_params(&self) -> VolumeParams {
        self.volume
    }

    pub fn set_volume(&mut self, volume: f32) {
        if self.volume.volume != volume {
            self.volume.volume = volume;
            self.vol_params_dirty = true;
        }
    }

    pub fn set_mute(&mut self, mute: bool) {
        if self.volume.mute != mute {
            self.volume.mute = mute;
            self.vol_params_dirty = true;
        }
    }

    pub fn set_output_is_fixed(&mut self, fixed: bool) {
        if self.volume.fixed != fixed {
            self.volume.fixed = fixed;
            self.vol_params_dirty = true;
        }
    }

    pub fn set_fixed_output_level(&mut self, level_db: f32) {
        if self.volume.fixed_level_db != level_db {
            self.volume.fixed_level_db = level_db;
            self.vol_params_dirty = true;
        }
    }

    /// Size of the driver ring buffer, in frames.
    pub fn kernel_buffer_size(&self) -> u32 {
        self.pcm_config.map(|c| c.buffer_frames()).unwrap_or(0)
    }

    pub fn setup_for_stream(&mut self, fmt: &StreamFormat) -> HalResult<()> {
        if fmt.sample_rate == 0 || fmt.channel_count == 0 || fmt.frames_per_chunk == 0 {
            return Err(HalError::BadValue);
        }
        let config = self.sink.pcm_config(fmt);
        self.transform = self.sink.sample_transform(fmt);
        self.silence = vec![0u8; fmt.frames_per_chunk as usize * fmt.frame_bytes()];
        self.max_delay_comp_frames =
            prefill::max_delay_comp_frames(MAX_DELAY_COMPENSATION_MSEC, fmt.sample_rate);
        self.frames_to_local_time =
            LinearTransform::new(self.clock.local_freq(), fmt.sample_rate as u64);
        self.format = Some(*fmt);
        self.pcm_config = Some(config);
        self.vol_params_dirty = true;

        debug!(
            "{} setup: {} Hz, {} ch, chunk {} frames x {}",
            self.name(),
            fmt.sample_rate,
            fmt.channel_count,
            fmt.frames_per_chunk,
            fmt.buffer_chunks
        );
        self.open_pcm_device();
        self.init_check()
    }

    pub fn init_check(&self) -> HalResult<()> {
        if self.device.is_some() && !self.has_fatal_error() {
            Ok(())
        } else {
            Err(HalError::NoInit)
        }
    }

    fn open_pcm_device(&mut self) {
        let Some(config) = self.pcm_config else {
            return;
        };
        let Some(card) = self.backend.find_card(&self.target.card_name) else {
            error!("No ALSA card named '{}' for {}", self.target.card_name, self.name());
            return;
        };
        let attempts = self.target.open_retries.max(1);
        for attempt in 1..=attempts {
            match self
                .backend
                .open(card, self.target.device, Direction::Playback, &config)
            {
                Ok(device) => {
                    self.device = Some(device);
                    return;
                }
                Err(e) => {
                    warn!(
                        "Failed to open {} (card {card} device {}), attempt {attempt}/{attempts}: {e}",
                        self.name(),
                        self.target.device
                    );
                    if attempt < attempts && !self.target.open_retry_delay.is_zero() {
                        std::thread::sleep(self.target.open_retry_delay);
                    }
                }
            }
        }
    }

    /// Closes the PCM device. Safe to call repeatedly.
    pub fn cleanup_resources(&mut self) {
        if self.device.take().is_some() {
            debug!("Closed {} PCM device", self.name());
        }
    }

    fn enter_fatal(&mut self, reason: &str) {
        info!("{} {reason}; going into zombie state to await cleanup", self.name());
        self.cleanup_resources();
        self.state = OutputState::Fatal;
    }

    /// Closes and reopens the device, returning to OUT_OF_SYNC, or FATAL if
    /// the device cannot be reopened.
    pub fn reset(&mut self) {
        if self.has_fatal_error() {
            return;
        }
        self.cleanup_resources();
        self.open_pcm_device();
        self.frames_queued_to_driver = 0;
        self.last_next_write_time = None;
        self.last_dma_start_time = None;
        self.prime_timeout_chunks = 0;

        if self.device.is_some() {
            info!("Reset {}", self.name());
            self.state = OutputState::OutOfSync;
        } else {
            error!("Reset for {} failed, device is a zombie pending cleanup", self.name());
            self.state = OutputState::Fatal;
        }
    }

    pub fn prime_output(&mut self, has_active_outputs: bool) {
        if self.has_fatal_error() {
            return;
        }
        let Some(fmt) = self.format else {
            return;
        };
        let mut prime_amt =
            prefill::prime_frames(fmt.frames_per_chunk, fmt.buffer_chunks, has_active_outputs);
        let delay_frames = (self.external_delay_usec as u64 * fmt.sample_rate as u64 / 1_000_000)
            .min(self.max_delay_comp_frames as u64) as u32;
        prime_amt += delay_frames;
        info!("Priming {} with {prime_amt} frames", self.name());
        self.push_silence(prime_amt);
        self.prime_timeout_chunks = 0;
        if !self.has_fatal_error() {
            self.state = OutputState::Primed;
        }
    }

    /// Pads with `frames` of silence to line up with a peer output. Negative
    /// amounts would mean dropping queued audio and are ignored.
    pub fn adjust_delay(&mut self, frames: i32) {
        if self.has_fatal_error() {
            return;
        }
        if frames >= 0 {
            info!("Padding {} by {frames} frames", self.name());
            self.push_silence(frames as u32);
            if !self.has_fatal_error() {
                self.state = OutputState::Active;
            }
        } else {
            warn!("Ignoring negative delay adjustment of {frames} frames on {}", self.name());
        }
    }

    pub fn push_silence(&mut self, frames: u32) {
        let Some(fmt) = self.format else {
            return;
        };
        let frame_bytes = fmt.frame_bytes();
        let mut remaining = frames as usize * frame_bytes;
        let silence = std::mem::take(&mut self.silence);
        while remaining > 0 && !self.has_fatal_error() && !silence.is_empty() {
            let amt = remaining.min(silence.len());
            self.do_pcm_write(&silence[..amt]);
            remaining -= amt;
        }
        self.silence = silence;
        self.frames_queued_to_driver += frames as u64;
    }

    /// Drives the state machine one step with one chunk of stream data.
    pub fn process_one_chunk(&mut self, data: &[u8], has_active_outputs: bool) {
        match self.state {
            OutputState::OutOfSync => self.prime_output(has_active_outputs),
            OutputState::Primed => {
                if self.prime_timeout_chunks < PRIME_TIMEOUT_CHUNKS {
                    self.prime_timeout_chunks += 1;
                } else {
                    warn!("DMA never started on {}, resetting", self.name());
                    self.reset();
                }
            }
            // Withheld until the stream aligns this output with its peers.
            OutputState::DmaStart => {}
            OutputState::Active => {
                self.do_pcm_write(data);
                if let Some(fmt) = self.format {
                    self.frames_queued_to_driver += (data.len() / fmt.frame_bytes()) as u64;
                }
            }
            OutputState::Fatal => {}
        }
    }

    fn apply_pending_vol_params(&mut self) {
        if !self.vol_params_dirty {
            return;
        }
        let encoded = self.format.is_some_and(|f| f.encoded);
        self.gain = self.sink.gain(&self.volume, encoded);
        self.vol_params_dirty = false;
        debug!("{} gain now {:.4}", self.name(), self.gain);
    }

    fn do_pcm_write(&mut self, data: &[u8]) {
        if self.has_fatal_error() {
            return;
        }
        self.apply_pending_vol_params();
        let mut staging = std::mem::take(&mut self.staging);
        self.transform.apply(data, self.gain, &mut staging);
        let result = match self.device.as_mut() {
            Some(device) => device.write(&staging),
            None => Err(PcmError::NotRunning),
        };
        self.staging = staging;
        match result {
            Ok(_) => {}
            Err(PcmError::Disconnected) => {
                self.enter_fatal("write returned EBADFD, output is probably disconnected");
            }
            Err(e) => {
                debug!("Write error on {}: {e}", self.name());
            }
        }
    }

    fn dma_start_data(&mut self) -> Result<(i64, u64), PcmError> {
        let result = match self.device.as_mut() {
            Some(device) => device.dma_start_time(),
            None => Err(PcmError::NotRunning),
        };
        match result {
            Ok(start) => Ok((start, self.frames_queued_to_driver)),
            Err(PcmError::Disconnected) => {
                self.enter_fatal("DMA start query returned EBADFD, output is probably disconnected");
                Err(PcmError::Disconnected)
            }
            Err(e) => Err(e),
        }
    }

    /// Local time at which the next frame written will be presented.
    pub fn next_write_timestamp(&mut self) -> Result<i64, TimestampError> {
        if self.has_fatal_error() {
            return Err(TimestampError::NotReady);
        }
        let mut discontinuity = false;
        let computed = match self.dma_start_data() {
            Ok((dma_start, queued)) => {
                if self
                    .last_dma_start_time
                    .is_some_and(|last| last != dma_start && self.last_next_write_time.is_some())
                {
                    warn!("DMA start time on {} moved, discontinuous output", self.name());
                    discontinuity = true;
                    None
                } else {
                    self.last_dma_start_time = Some(dma_start);
                    let transform = self.frames_to_local_time.with_origin(0, dma_start);
                    let ts = transform.forward(queued as i64);
                    if ts.is_none() {
                        error!("Timestamp overflow on {}", self.name());
                    }
                    ts
                }
            }
            Err(_) => {
                if self.last_next_write_time.is_some() {
                    warn!("Underflow detected on {}", self.name());
                    discontinuity = true;
                }
                None
            }
        };

        match computed {
            Some(ts) => {
                self.last_next_write_time = Some(ts);
                if self.state == OutputState::Primed {
                    self.state = OutputState::DmaStart;
                }
                Ok(ts)
            }
            None => {
                self.last_next_write_time = None;
                if self.state > OutputState::Primed && !self.has_fatal_error() {
                    self.reset();
                }
                if discontinuity {
                    Err(TimestampError::Discontinuity)
                } else {
                    Err(TimestampError::NotReady)
                }
            }
        }
    }

    pub fn hardware_timestamp(&mut self) -> HalResult<HwTimestamp> {
        let device = self.device.as_mut().ok_or(HalError::NoInit)?;
        device.htimestamp().map_err(|e| HalError::Device(e.to_string()))
    }

    pub fn snapshot(&self) -> OutputSnapshot {
        OutputSnapshot {
            name: self.name(),
            id: self.id,
            state: self.state,
            sample_rate: self.format.map(|f| f.sample_rate).unwrap_or(0),
            channels: self.format.map(|f| f.channel_count).unwrap_or(0),
            frames_queued: self.frames_queued_to_driver,
            external_delay_usec: self.external_delay_usec,
            volume: self.volume,
        }
    }
}

impl Drop for PhysicalOutput {
    fn drop(&mut self) {
        self.cleanup_resources();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OutputSnapshot {
    pub name: &'static str,
    pub id: u64,
    pub state: OutputState,
    pub sample_rate: u32,
    pub channels: u32,
    pub frames_queued: u64,
    pub external_delay_usec: u32,
    pub volume: VolumeParams,
}

/// Pads every output waiting in DMA_START so its next write lands at
/// `max_time`. Returns how many outputs were adjusted.
pub fn align_outputs<'a>(
    outputs: impl IntoIterator<Item = &'a mut PhysicalOutput>,
    max_time: i64,
) -> usize {
    let mut adjusted = 0;
    for out in outputs {
        if out.state() != OutputState::DmaStart {
            continue;
        }
        let Some(fmt) = out.format else {
            continue;
        };
        let Some(last) = out.last_next_write_ts() else {
            continue;
        };
        let local_to_frames = LinearTransform::new(fmt.sample_rate as u64, out.clock.local_freq())
            .with_origin(last, 0);
        let pad = local_to_frames
            .forward(max_time)
            .map(|f| f.clamp(i32::MIN as i64, i32::MAX as i64) as i32)
            .unwrap_or(0);
        out.adjust_delay(pad);
        adjusted += 1;
    }
    adjusted
}
