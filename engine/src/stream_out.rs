use crate::clock::{LinearTransform, USEC_PER_SEC};
use crate::error::{HalError, HalResult, lock};
use crate::format::{AudioFormat, CHANNEL_OUT_STEREO, channel_count, out_mask_name};
use crate::hw::latency;
use crate::manager::{OutputHandle, OutputManager};
use crate::output::{self, OutputState, StreamFormat};
use crate::params::{
    KEY_ROUTING, KEY_SUPPORTED_CHANNEL_MASKS, KEY_SUPPORTED_FORMATS, KEY_SUPPORTED_SAMPLE_RATES,
    Parameters,
};
use crate::spdif::{BURST_FRAME_BYTES, BurstEncoder, Iec61937Encoder};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, error, info, warn};

pub const NOMINAL_CHUNKS_IN_FLIGHT: u32 = 4;
pub const DEFAULT_SAMPLE_RATE: u32 = 48_000;
pub const DEFAULT_CHANNEL_MASK: u32 = CHANNEL_OUT_STEREO;
pub const DEFAULT_FORMAT: AudioFormat = AudioFormat::Pcm16;

/// Hidden buffering in the HDMI path beyond the driver ring.
const PRESENTATION_FUDGE_MSEC: u64 = 50;
const INSANE_AVAIL_FRAMES: u32 = 10 * 48_000;
const MAX_THROTTLE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentationPosition {
    Playing { frames: u64, timestamp_ns: i64 },
    /// Everything queued so far is still priming silence.
    Preroll,
}

#[derive(Debug, Clone, Serialize)]
pub struct StreamSnapshot {
    pub name: &'static str,
    pub format: &'static str,
    pub sample_rate: u32,
    pub channels: u32,
    pub target_mask: u32,
    pub attached_mask: u32,
    pub in_standby: bool,
    pub frames_presented: u64,
    pub latency_msec: u32,
}

#[derive(Debug)]
struct StreamState {
    format: AudioFormat,
    channel_mask: u32,
    sample_rate: u32,
    channel_count: u32,
    encoded: bool,
    rate_multiplier: u32,

    chunk_frames: u32,
    buffer_size: usize,
    nominal_latency_usec: u32,
    local_time_to_frames: LinearTransform,

    frames_presented: u64,
    frames_rendered: u64,
    frames_written: u64,
    frames_written_remainder: u64,
    throttle_valid: bool,
    write_start: i64,
}

impl StreamState {
    fn new() -> Self {
        Self {
            format: DEFAULT_FORMAT,
            channel_mask: DEFAULT_CHANNEL_MASK,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channel_count: channel_count(DEFAULT_CHANNEL_MASK),
            encoded: false,
            rate_multiplier: 1,
            chunk_frames: 0,
            buffer_size: 0,
            nominal_latency_usec: 0,
            local_time_to_frames: LinearTransform::default(),
            frames_presented: 0,
            frames_rendered: 0,
            frames_written: 0,
            frames_written_remainder: 0,
            throttle_valid: false,
            write_start: 0,
        }
    }

    fn output_rate(&self) -> u32 {
        self.sample_rate * self.rate_multiplier
    }

    fn bytes_per_output_frame(&self) -> usize {
        if self.encoded {
            BURST_FRAME_BYTES
        } else {
            self.channel_count as usize * 2
        }
    }

    fn stream_format(&self) -> StreamFormat {
        StreamFormat {
            sample_rate: self.output_rate(),
            channel_count: if self.encoded { 2 } else { self.channel_count },
            bytes_per_sample: 2,
            frames_per_chunk: self.chunk_frames,
            buffer_chunks: NOMINAL_CHUNKS_IN_FLIGHT,
            encoded: self.encoded,
        }
    }

    fn update_input_nums(&mut self, local_freq: u64) {
        self.chunk_frames = latency::chunk_frames(self.output_rate());
        self.buffer_size = self.chunk_frames as usize * self.bytes_per_output_frame();
        self.nominal_latency_usec = latency::nominal_latency_usec(
            self.chunk_frames,
            NOMINAL_CHUNKS_IN_FLIGHT,
            self.sample_rate,
        );
        self.local_time_to_frames = LinearTransform::new(self.sample_rate as u64, local_freq);
        debug!(
            "Chunk size {} frames from output rate {}",
            self.chunk_frames,
            self.output_rate()
        );
    }

    /// Books `frames` written at the device rate and returns how long the
    /// caller should sleep when there was nowhere to write them.
    fn finished_write_op(
        &mut self,
        frames: u64,
        need_throttle: bool,
        now: i64,
        local_freq: u64,
    ) -> Option<Duration> {
        if !self.throttle_valid || !need_throttle {
            self.throttle_valid = true;
            self.write_start = now;
            self.frames_written = 0;
        }

        let app_frames = if self.rate_multiplier != 1 {
            let total = frames + self.frames_written_remainder;
            let app = total / self.rate_multiplier as u64;
            self.frames_written_remainder = total - app * self.rate_multiplier as u64;
            app
        } else {
            frames
        };
        self.frames_written += app_frames;
        self.frames_presented += app_frames;
        self.frames_rendered += app_frames;

        if !need_throttle {
            return None;
        }
        let due = self
            .local_time_to_frames
            .reverse(self.frames_written as i64)?
            .saturating_add(self.write_start);
        let ahead = due.saturating_sub(now);
        if ahead <= 0 {
            return None;
        }
        let usec = ahead as u128 * USEC_PER_SEC as u128 / local_freq.max(1) as u128;
        let sleep = Duration::from_micros(usec.min(u64::MAX as u128) as u64);
        if sleep > MAX_THROTTLE {
            warn!("Throttle time clipped, {sleep:?} ahead of schedule");
            return Some(MAX_THROTTLE);
        }
        Some(sleep)
    }
}

#[derive(Debug, Default)]
struct Routing {
    target_mask: u32,
    outputs: Vec<OutputHandle>,
}

impl Routing {
    fn attached_mask(&self) -> u32 {
        self.outputs.iter().fold(0, |m, o| m | o.dev_mask())
    }
}

/// A logical output stream as the upper audio layer sees it. Fans each
/// chunk out to whichever physical outputs the manager routes to it.
pub struct OutputStream {
    owner: Arc<OutputManager>,
    is_mc: bool,
    state: Mutex<StreamState>,
    encoder: Mutex<Option<Box<dyn BurstEncoder>>>,
    routing: Mutex<Routing>,
    framework_routing: AtomicU32,
    in_standby: AtomicBool,
}

impl std::fmt::Debug for OutputStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputStream")
            .field("name", &self.name())
            .field("state", &*lock(&self.state))
            .finish()
    }
}

impl OutputStream {
    pub(crate) fn new(owner: Arc<OutputManager>, is_mc: bool) -> Self {
        let mut state = StreamState::new();
        state.update_input_nums(owner.clock().local_freq());
        Self {
            owner,
            is_mc,
            state: Mutex::new(state),
            encoder: Mutex::new(None),
            routing: Mutex::new(Routing::default()),
            framework_routing: AtomicU32::new(0),
            in_standby: AtomicBool::new(true),
        }
    }

    pub fn name(&self) -> &'static str {
        if self.is_mc { "MC" } else { "Main" }
    }

    pub fn is_mc(&self) -> bool {
        self.is_mc
    }

    /// Validates and adopts a stream configuration. `Default`/0 arguments
    /// keep the current value.
    pub fn set(&self, format: AudioFormat, channel_mask: u32, sample_rate: u32) -> HalResult<()> {
        let mut st = lock(&self.state);
        let format = if format == AudioFormat::Default {
            st.format
        } else {
            format
        };
        let channel_mask = if channel_mask == 0 {
            st.channel_mask
        } else {
            channel_mask
        };
        let sample_rate = if sample_rate == 0 {
            st.sample_rate
        } else {
            sample_rate
        };
        let encoded = !format.is_linear_pcm();

        if !self.is_mc && !encoded {
            if format != DEFAULT_FORMAT
                || channel_mask != DEFAULT_CHANNEL_MASK
                || sample_rate != DEFAULT_SAMPLE_RATE
            {
                return Err(HalError::BadValue);
            }
        } else if !self.owner.hdmi_caps().supports_format(
            format,
            sample_rate,
            channel_count(channel_mask),
        ) {
            return Err(HalError::BadValue);
        }

        let encoder: Option<Box<dyn BurstEncoder>> = if encoded {
            let enc = Iec61937Encoder::new(format).ok_or(HalError::BadValue)?;
            Some(Box::new(enc))
        } else {
            None
        };
        st.rate_multiplier = encoder.as_ref().map_or(1, |e| e.rate_multiplier());
        *lock(&self.encoder) = encoder;

        st.format = format;
        st.channel_mask = channel_mask;
        st.sample_rate = sample_rate;
        st.channel_count = channel_count(channel_mask);
        st.encoded = encoded;
        info!(
            "{} stream set: {} {} Hz mask 0x{channel_mask:x}",
            self.name(),
            format.name(),
            sample_rate
        );
        st.update_input_nums(self.owner.clock().local_freq());
        Ok(())
    }

    pub fn format(&self) -> AudioFormat {
        lock(&self.state).format
    }

    pub fn sample_rate(&self) -> u32 {
        lock(&self.state).sample_rate
    }

    pub fn channel_mask(&self) -> u32 {
        lock(&self.state).channel_mask
    }

    /// Bytes the upper layer should hand to each `write`.
    pub fn buffer_size(&self) -> usize {
        lock(&self.state).buffer_size
    }

    pub fn chunk_frames(&self) -> u32 {
        lock(&self.state).chunk_frames
    }

    pub fn frame_size(&self) -> usize {
        lock(&self.state).bytes_per_output_frame()
    }

    pub fn is_in_standby(&self) -> bool {
        self.in_standby.load(Ordering::Acquire)
    }

    pub fn target_devices(&self) -> u32 {
        lock(&self.routing).target_mask
    }

    pub fn attached_devices(&self) -> u32 {
        lock(&self.routing).attached_mask()
    }

    pub fn set_target_devices(&self, mask: u32) {
        let mut routing = lock(&self.routing);
        if routing.target_mask != mask {
            debug!("{} target devices 0x{:x} -> 0x{mask:x}", self.name(), routing.target_mask);
            routing.target_mask = mask;
        }
    }

    pub fn write(&self, data: &[u8]) -> HalResult<usize> {
        let bursts = {
            let mut encoder = lock(&self.encoder);
            encoder.as_mut().map(|enc| enc.encode(data))
        };
        match bursts {
            Some(bursts) => {
                for burst in bursts {
                    self.write_internal(&burst);
                }
                Ok(data.len())
            }
            None => Ok(self.write_internal(data)),
        }
    }

    fn write_internal(&self, data: &[u8]) -> usize {
        if self.in_standby.swap(false, Ordering::AcqRel) {
            self.owner.standby_status_update(false, self.is_mc);
        }

        let (fmt, frame_bytes) = {
            let st = lock(&self.state);
            (st.stream_format(), st.bytes_per_output_frame())
        };
        let outputs = self.update_target_outputs(&fmt);

        let mut check_dma_start = false;
        let mut has_active = false;
        for out in &outputs {
            match out.with(|o| o.state()) {
                Some(OutputState::Primed) => check_dma_start = true,
                Some(OutputState::Active) => has_active = true,
                _ => {}
            }
        }
        if check_dma_start {
            let _ = Self::next_write_timestamp_of(&outputs);
        }

        for out in &outputs {
            out.with(|o| o.process_one_chunk(data, has_active));
        }

        let throttle = {
            let mut st = lock(&self.state);
            let clock = self.owner.clock();
            st.finished_write_op(
                (data.len() / frame_bytes.max(1)) as u64,
                outputs.is_empty(),
                clock.local_time(),
                clock.local_freq(),
            )
        };
        if let Some(sleep) = throttle {
            std::thread::sleep(sleep);
        }
        data.len()
    }

    /// Reconciles attached outputs with the target mask and returns the
    /// outputs to feed this cycle.
    fn update_target_outputs(&self, fmt: &StreamFormat) -> Vec<OutputHandle> {
        let mut routing = lock(&self.routing);
        let current = routing.attached_mask();
        if current == routing.target_mask {
            return routing.outputs.clone();
        }
        let to_obtain = routing.target_mask & !current;
        let to_release = current & !routing.target_mask;

        if to_release != 0 {
            let (released, kept): (Vec<_>, Vec<_>) = routing
                .outputs
                .drain(..)
                .partition(|o| o.dev_mask() & to_release != 0);
            routing.outputs = kept;
            for out in &released {
                self.owner.release_output(self.name(), out);
            }
        }

        let mut remaining = to_obtain;
        while remaining != 0 {
            let mask = 1 << remaining.trailing_zeros();
            remaining &= !mask;
            match self.owner.obtain_output(self.name(), fmt, mask) {
                Ok(Some(out)) => {
                    info!("{}: attached output 0x{mask:x}", self.name());
                    routing.outputs.push(out);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(
                        "Failed to obtain output 0x{mask:x} for {} stream: {e}",
                        self.name()
                    );
                    routing.target_mask &= !mask;
                }
            }
        }
        routing.outputs.clone()
    }

    fn release_all_outputs(&self) {
        let outputs = std::mem::take(&mut lock(&self.routing).outputs);
        if !outputs.is_empty() {
            info!("{}: releasing {} outputs", self.name(), outputs.len());
        }
        for out in &outputs {
            self.owner.release_output(self.name(), out);
        }
    }

    /// Local time at which the next frame written will be heard. `NotReady`
    /// means nothing can answer yet.
    pub fn next_write_timestamp(&self) -> HalResult<i64> {
        let outputs = lock(&self.routing).outputs.clone();
        Self::next_write_timestamp_of(&outputs)
    }

    fn next_write_timestamp_of(outputs: &[OutputHandle]) -> HalResult<i64> {
        let mut max_time: Option<i64> = None;
        for out in outputs {
            if let Some(Ok(ts)) = out.with(|o| o.next_write_timestamp()) {
                max_time = Some(max_time.map_or(ts, |m| m.max(ts)));
            }
        }
        let max_time = max_time.ok_or(HalError::NotReady)?;

        let need_adjust = outputs
            .iter()
            .any(|o| o.with(|o| o.state()) == Some(OutputState::DmaStart));
        if need_adjust {
            let live: Vec<_> = outputs.iter().filter_map(|o| o.upgrade()).collect();
            let mut guards: Vec<_> = live.iter().map(|o| lock(o)).collect();
            output::align_outputs(guards.iter_mut().map(|g| &mut **g), max_time);
        }
        Ok(max_time)
    }

    pub fn standby(&self) {
        lock(&self.state).frames_rendered = 0;
        if let Some(enc) = lock(&self.encoder).as_mut() {
            enc.reset();
        }
        self.release_all_outputs();
        self.owner.standby_status_update(true, self.is_mc);
        self.in_standby.store(true, Ordering::Release);
    }

    /// Milliseconds of latency after video delay compensation.
    pub fn latency(&self) -> u32 {
        let nominal = lock(&self.state).nominal_latency_usec;
        latency::reported_latency_msec(nominal, self.owner.video_delay_comp_usec())
    }

    pub fn presentation_position(&self) -> HalResult<PresentationPosition> {
        let first = lock(&self.routing)
            .outputs
            .first()
            .cloned()
            .ok_or(HalError::NoDevice)?;
        let (hw, kernel_buffer) = first
            .with(|o| o.hardware_timestamp().map(|ts| (ts, o.kernel_buffer_size())))
            .ok_or(HalError::NoDevice)??;

        if hw.avail >= INSANE_AVAIL_FRAMES {
            error!("presentation position: avail too large = {}", hw.avail);
            return Err(HalError::Device(format!("avail {} out of range", hw.avail)));
        }

        let st = lock(&self.state);
        let fudge = PRESENTATION_FUDGE_MSEC * st.sample_rate as u64 / 1000;
        let in_driver = (kernel_buffer as i64 - hw.avail as i64) / st.rate_multiplier as i64;
        let pending = in_driver + fudge as i64;
        if pending < 0 {
            error!("presentation position: negative pending frames {pending}");
            return Err(HalError::Device("negative pending frames".to_string()));
        }
        let frames = st.frames_presented as i64 - pending;
        if frames < 0 {
            debug!(
                "Playing silent preroll, presented {}, pending {pending}",
                st.frames_presented
            );
            return Ok(PresentationPosition::Preroll);
        }
        Ok(PresentationPosition::Playing {
            frames: frames as u64,
            timestamp_ns: hw.timestamp_ns,
        })
    }

    /// Frames rendered since the last standby.
    pub fn render_position(&self) -> HalResult<u32> {
        if lock(&self.routing).outputs.is_empty() {
            return Err(HalError::NoDevice);
        }
        Ok((lock(&self.state).frames_rendered & 0xFFFF_FFFF) as u32)
    }

    pub fn frames_presented(&self) -> u64 {
        lock(&self.state).frames_presented
    }

    pub fn set_parameters(&self, kv_pairs: &str) -> HalResult<()> {
        let params = Parameters::parse(kv_pairs);
        if let Some(routing) = params.get_int(KEY_ROUTING) {
            self.framework_routing.store(routing as u32, Ordering::Release);
        }
        Ok(())
    }

    pub fn get_parameters(&self, keys: &str) -> String {
        let request = Parameters::parse(keys);
        let caps = self.owner.hdmi_caps();
        let mut reply = Parameters::default();

        if request.contains(KEY_ROUTING) {
            reply.add(KEY_ROUTING, self.framework_routing.load(Ordering::Acquire));
        }
        if request.contains(KEY_SUPPORTED_SAMPLE_RATES) {
            let value = if self.is_mc {
                caps.rates_for_framework()
            } else {
                DEFAULT_SAMPLE_RATE.to_string()
            };
            reply.add(KEY_SUPPORTED_SAMPLE_RATES, value);
        }
        if request.contains(KEY_SUPPORTED_FORMATS) {
            let value = if self.is_mc {
                caps.formats_for_framework()
            } else {
                DEFAULT_FORMAT.name().to_string()
            };
            reply.add(KEY_SUPPORTED_FORMATS, value);
        }
        if request.contains(KEY_SUPPORTED_CHANNEL_MASKS) {
            let value = if self.is_mc {
                caps.channel_masks_for_framework()
            } else {
                out_mask_name(DEFAULT_CHANNEL_MASK).unwrap_or_default().to_string()
            };
            reply.add(KEY_SUPPORTED_CHANNEL_MASKS, value);
        }
        reply.to_string()
    }

    pub fn snapshot(&self) -> StreamSnapshot {
        let (format, sample_rate, channels, frames_presented) = {
            let st = lock(&self.state);
            (st.format.name(), st.sample_rate, st.channel_count, st.frames_presented)
        };
        let (target_mask, attached_mask) = {
            let routing = lock(&self.routing);
            (routing.target_mask, routing.attached_mask())
        };
        StreamSnapshot {
            name: self.name(),
            format,
            sample_rate,
            channels,
            target_mask,
            attached_mask,
            in_standby: self.is_in_standby(),
            frames_presented,
            latency_msec: self.latency(),
        }
    }
}

impl Drop for OutputStream {
    fn drop(&mut self) {
        self.release_all_outputs();
    }
}
