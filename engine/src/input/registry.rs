use super::hotplug::{HotplugCallback, HotplugWatcher};
use super::probe::{CaptureProber, DeviceInfo};
use super::stream_in::{InputStream, InputStreamSnapshot};
use crate::error::{HalError, HalResult, lock};
use crate::format::{AudioFormat, channel_count};
use crate::hw::latency::round_up_16;
use crate::hw::options::HalOptions;
use crate::hw::pcm::PcmBackend;
use crate::params::{KEY_ADDRESS, KEY_FORCE, Parameters};
use serde::Serialize;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, error, info, warn};

pub const MAX_DEVICES: usize = 8;
pub const INPUT_PERIOD_MSEC: u32 = 10;
/// Device address under which the remote submix input is configured.
pub const REMOTE_SUBMIX_ADDRESS: &str = "0";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum InputSource {
    Default,
    Mic,
    VoiceUplink,
    VoiceDownlink,
    VoiceCall,
    Camcorder,
    VoiceRecognition,
    VoiceCommunication,
    RemoteSubmix,
    Unprocessed,
}

impl InputSource {
    pub fn from_raw(raw: i64) -> Option<Self> {
        Some(match raw {
            0 => Self::Default,
            1 => Self::Mic,
            2 => Self::VoiceUplink,
            3 => Self::VoiceDownlink,
            4 => Self::VoiceCall,
            5 => Self::Camcorder,
            6 => Self::VoiceRecognition,
            7 => Self::VoiceCommunication,
            8 => Self::RemoteSubmix,
            9 => Self::Unprocessed,
            _ => return None,
        })
    }
}

/// Bytes of one capture period (10ms, rounded up to 16 frames).
pub fn input_buffer_size(sample_rate: u32, format: AudioFormat, channel_count: u32) -> usize {
    let frames = round_up_16(INPUT_PERIOD_MSEC * sample_rate / 1000) as usize;
    let bytes = format.bits_per_sample().unwrap_or(16) as usize / 8;
    frames * channel_count as usize * bytes
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct InputSnapshot {
    pub mic_mute: bool,
    pub force_virtual: bool,
    pub hotplug_running: bool,
    pub devices: Vec<DeviceInfo>,
    pub streams: Vec<InputStreamSnapshot>,
}

/// Capture device table plus the open input streams.
#[derive(Debug)]
pub struct InputManager {
    backend: Arc<dyn PcmBackend>,
    prober: Arc<dyn CaptureProber>,
    options: HalOptions,
    devices: Mutex<[DeviceInfo; MAX_DEVICES]>,
    streams: Mutex<Vec<Arc<InputStream>>>,
    mic_mute: AtomicBool,
    force_virtual: AtomicBool,
    hotplug: Mutex<Option<HotplugWatcher>>,
}

/// Forwards hotplug events without keeping the registry alive.
struct RegistryEvents(Weak<InputManager>);

impl HotplugCallback for RegistryEvents {
    fn on_device_found(&self, info: DeviceInfo) {
        if let Some(registry) = self.0.upgrade() {
            registry.on_device_found(info);
        }
    }

    fn on_device_removed(&self, card: u32, device: u32) {
        if let Some(registry) = self.0.upgrade() {
            registry.on_device_removed(card, device);
        }
    }
}

impl InputManager {
    pub fn new(
        backend: Arc<dyn PcmBackend>,
        prober: Arc<dyn CaptureProber>,
        options: HalOptions,
    ) -> Arc<Self> {
        Arc::new(Self {
            backend,
            prober,
            options,
            devices: Mutex::new([DeviceInfo::default(); MAX_DEVICES]),
            streams: Mutex::new(Vec::new()),
            mic_mute: AtomicBool::new(false),
            force_virtual: AtomicBool::new(false),
            hotplug: Mutex::new(None),
        })
    }

    pub(crate) fn backend(&self) -> &Arc<dyn PcmBackend> {
        &self.backend
    }

    pub fn start_hotplug(self: &Arc<Self>) -> io::Result<()> {
        let mut hotplug = lock(&self.hotplug);
        if hotplug.is_some() {
            return Ok(());
        }
        let events: Arc<dyn HotplugCallback> = Arc::new(RegistryEvents(Arc::downgrade(self)));
        let watcher = HotplugWatcher::start(
            self.options.capture_device_dir.clone(),
            self.prober.clone(),
            events,
        )
        .inspect_err(|e| {
            error!(
                "Unable to watch {}: {e}",
                self.options.capture_device_dir.display()
            )
        })?;
        *hotplug = Some(watcher);
        Ok(())
    }

    pub fn stop_hotplug(&self) {
        let watcher = lock(&self.hotplug).take();
        if let Some(mut watcher) = watcher {
            watcher.shutdown();
        }
    }

    pub fn hotplug_running(&self) -> bool {
        lock(&self.hotplug)
            .as_ref()
            .is_some_and(HotplugWatcher::is_running)
    }

    pub fn set_mic_mute(&self, mute: bool) {
        self.mic_mute.store(mute, Ordering::Relaxed);
    }

    pub fn mic_mute(&self) -> bool {
        self.mic_mute.load(Ordering::Relaxed)
    }

    pub fn input_buffer_size(&self, sample_rate: u32, format: AudioFormat, channel_mask: u32) -> usize {
        input_buffer_size(sample_rate, format, channel_count(channel_mask))
    }

    pub fn open_input_stream(
        self: &Arc<Self>,
        format: AudioFormat,
        channel_mask: u32,
        sample_rate: u32,
    ) -> HalResult<Arc<InputStream>> {
        let stream = Arc::new(InputStream::new(
            Arc::downgrade(self),
            format,
            channel_mask,
            sample_rate,
        )?);
        lock(&self.streams).push(stream.clone());
        info!("Opened input stream at {sample_rate}");
        Ok(stream)
    }

    pub fn close_input_stream(&self, stream: &Arc<InputStream>) {
        let removed = {
            let mut streams = lock(&self.streams);
            let before = streams.len();
            streams.retain(|s| !Arc::ptr_eq(s, stream));
            before != streams.len()
        };
        if removed {
            stream.standby();
            info!("Closed input stream");
        }
    }

    pub fn close_all_input_streams(&self) {
        let streams = std::mem::take(&mut *lock(&self.streams));
        for stream in streams {
            stream.standby();
        }
    }

    pub fn input_stream_count(&self) -> usize {
        lock(&self.streams).len()
    }

    /// Puts streams in standby so their next read reselects a device. With
    /// `device` set only streams reading from it are affected.
    fn standby_streams(&self, device: Option<(u32, u32)>) {
        let streams: Vec<_> = lock(&self.streams).clone();
        for stream in streams {
            if device.is_none() || stream.device() == device {
                stream.standby();
            }
        }
    }

    pub fn on_device_found(&self, info: DeviceInfo) {
        debug!("Capture device found on card {}", info.card);
        let stored = {
            let mut devices = lock(&self.devices);
            if devices
                .iter()
                .any(|d| d.valid && d.card == info.card && d.device == info.device)
            {
                warn!(
                    "Capture device {}:{} already known",
                    info.card, info.device
                );
                return;
            }
            match devices.iter_mut().enumerate().find(|(_, d)| !d.valid) {
                Some((slot, entry)) => {
                    debug!("Saving capture device as #{slot}");
                    *entry = DeviceInfo { valid: true, ..info };
                    true
                }
                None => false,
            }
        };
        if stored {
            self.standby_streams(None);
        } else {
            warn!(
                "More capture devices than expected, {}:{} dropped",
                info.card, info.device
            );
        }
    }

    pub fn on_device_removed(&self, card: u32, device: u32) {
        debug!("Capture device removed from card {card}");
        let removed = {
            let mut devices = lock(&self.devices);
            let mut removed = false;
            for (slot, entry) in devices.iter_mut().enumerate() {
                if entry.valid && entry.card == card && entry.device == device {
                    debug!("Removed capture device #{slot}");
                    entry.valid = false;
                    removed = true;
                }
            }
            removed
        };
        if removed {
            self.standby_streams(Some((card, device)));
        }
    }

    /// First known device whose voice recognition flag matches the source.
    pub fn get_best_device(&self, source: InputSource) -> Option<DeviceInfo> {
        if self.force_virtual.load(Ordering::Relaxed) {
            debug!("Virtual input forced, no physical capture device");
            return None;
        }
        let want_voice = source == InputSource::VoiceRecognition;
        let devices = lock(&self.devices);
        let chosen = devices
            .iter()
            .enumerate()
            .find(|(_, d)| d.valid && d.for_voice_recognition == want_voice);
        match chosen {
            Some((slot, info)) => {
                debug!("Best device for {source:?} is #{slot}");
                Some(*info)
            }
            None => {
                error!("No capture device for {source:?}");
                None
            }
        }
    }

    pub fn devices(&self) -> Vec<DeviceInfo> {
        lock(&self.devices)
            .iter()
            .filter(|d| d.valid)
            .copied()
            .collect()
    }

    /// Accepts `force` scoped to the remote submix `address`.
    pub fn set_parameters(&self, kv_pairs: &str) -> HalResult<()> {
        let mut params = Parameters::parse(kv_pairs);
        let address = params.remove(KEY_ADDRESS);
        if let Some(force) = params.get_int(KEY_FORCE) {
            if address.as_deref() == Some(REMOTE_SUBMIX_ADDRESS) {
                params.remove(KEY_FORCE);
                let force = force != 0;
                if self.force_virtual.swap(force, Ordering::Relaxed) != force {
                    info!("Virtual input {}", if force { "forced" } else { "released" });
                    self.standby_streams(None);
                }
            }
        }
        if params.is_empty() {
            Ok(())
        } else {
            warn!("Unhandled input parameters: {params}");
            Err(HalError::BadValue)
        }
    }

    pub fn get_parameters(&self, _keys: &str) -> String {
        String::new()
    }

    pub fn snapshot(&self) -> InputSnapshot {
        let streams: Vec<_> = lock(&self.streams).clone();
        InputSnapshot {
            mic_mute: self.mic_mute(),
            force_virtual: self.force_virtual.load(Ordering::Relaxed),
            hotplug_running: self.hotplug_running(),
            devices: self.devices(),
            streams: streams.iter().map(|s| s.snapshot()).collect(),
        }
    }
}

impl Drop for InputManager {
    fn drop(&mut self) {
        self.stop_hotplug();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{LocalClock, ManualClock};
    use crate::format::CHANNEL_IN_MONO;
    use crate::input::probe::StaticProber;
    use crate::testutil::FakeBackend;

    fn device(card: u32, voice: bool) -> DeviceInfo {
        DeviceInfo {
            card,
            device: 0,
            min_sample_bits: 16,
            max_sample_bits: 16,
            min_channels: 1,
            max_channels: 2,
            min_sample_rate: 16_000,
            max_sample_rate: 48_000,
            for_voice_recognition: voice,
            valid: true,
        }
    }

    fn registry() -> (Arc<InputManager>, FakeBackend) {
        let clock: Arc<dyn LocalClock> = Arc::new(ManualClock::new(0));
        let backend = FakeBackend::new(clock);
        let registry = InputManager::new(
            Arc::new(backend.clone()),
            Arc::new(StaticProber::default()),
            HalOptions::default(),
        );
        (registry, backend)
    }

    #[test]
    fn best_device_matches_voice_recognition_flag() {
        let (reg, _) = registry();
        assert_eq!(reg.get_best_device(InputSource::VoiceRecognition), None);
        assert_eq!(reg.get_best_device(InputSource::Mic), None);

        reg.on_device_found(device(2, false));
        reg.on_device_found(device(3, true));
        assert_eq!(
            reg.get_best_device(InputSource::VoiceRecognition).map(|d| d.card),
            Some(3)
        );
        assert_eq!(reg.get_best_device(InputSource::Mic).map(|d| d.card), Some(2));
        assert_eq!(reg.get_best_device(InputSource::Default).map(|d| d.card), Some(2));

        reg.on_device_removed(3, 0);
        assert_eq!(reg.get_best_device(InputSource::VoiceRecognition), None);
    }

    #[test]
    fn table_dedupes_and_drops_overflow() {
        let (reg, _) = registry();
        reg.on_device_found(device(1, false));
        reg.on_device_found(device(1, false));
        assert_eq!(reg.devices().len(), 1);
        for card in 2..20 {
            reg.on_device_found(device(card, false));
        }
        assert_eq!(reg.devices().len(), MAX_DEVICES);
        reg.on_device_removed(4, 0);
        reg.on_device_found(device(30, false));
        assert!(reg.devices().iter().any(|d| d.card == 30));
    }

    #[test]
    fn buffer_size_is_ten_msec_rounded_to_16_frames() {
        assert_eq!(input_buffer_size(16_000, AudioFormat::Pcm16, 1), 160 * 2);
        assert_eq!(input_buffer_size(44_100, AudioFormat::Pcm16, 1), 448 * 2);
        assert_eq!(input_buffer_size(48_000, AudioFormat::Pcm16, 2), 480 * 4);
    }

    #[test]
    fn stream_captures_left_channel_at_device_rate() {
        let (reg, backend) = registry();
        reg.on_device_found(DeviceInfo {
            min_channels: 2,
            min_sample_rate: 16_000,
            max_sample_rate: 16_000,
            ..device(2, false)
        });
        let stream = reg
            .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
            .expect("open");
        let mut buf = vec![0u8; stream.buffer_size()];
        assert_eq!(stream.read(&mut buf), buf.len());
        assert!(!stream.is_in_standby());
        assert_eq!(stream.device(), Some((2, 0)));
        let config = backend.with(|st| st.last_config).expect("opened");
        assert_eq!(config.channels, 2);
        assert_eq!(config.rate, 16_000);
        assert_eq!(config.period_size, 160);

        // A new device sends every stream back through device selection.
        reg.on_device_found(device(5, false));
        assert!(stream.is_in_standby());

        reg.close_input_stream(&stream);
        assert_eq!(reg.input_stream_count(), 0);
    }

    #[test]
    fn removal_only_stops_streams_on_that_device() {
        let (reg, _) = registry();
        reg.on_device_found(device(2, false));
        reg.on_device_found(device(3, true));
        let mic = reg
            .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
            .unwrap();
        let voice = reg
            .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
            .unwrap();
        voice.set_parameters("input-source=6").unwrap();
        let mut buf = vec![0u8; 320];
        mic.read(&mut buf);
        voice.read(&mut buf);
        assert_eq!(voice.device(), Some((3, 0)));

        reg.on_device_removed(3, 0);
        assert!(voice.is_in_standby());
        assert!(!mic.is_in_standby());
    }

    #[test]
    fn mic_mute_zeroes_captured_data() {
        let (reg, _) = registry();
        reg.on_device_found(device(2, false));
        reg.set_mic_mute(true);
        assert!(reg.mic_mute());
        let stream = reg
            .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
            .unwrap();
        let mut buf = vec![0xAAu8; 320];
        assert_eq!(stream.read(&mut buf), 320);
        assert!(buf.iter().all(|&b| b == 0));
        assert!(!stream.is_disabled());
    }

    #[test]
    fn short_reads_are_padded_with_silence() {
        let (reg, backend) = registry();
        reg.on_device_found(device(2, false));
        backend.with(|st| st.read_limit = Some(40));
        let stream = reg
            .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
            .unwrap();
        let mut buf = vec![0xAAu8; 320];
        assert_eq!(stream.read(&mut buf), 320);
        assert!(buf[..40].iter().all(|&b| b == 0x11));
        assert!(buf[40..].iter().all(|&b| b == 0));
        assert_eq!(backend.with(|st| st.reads), 1);
    }

    #[test]
    fn short_reads_still_feed_the_resampler() {
        let (reg, backend) = registry();
        reg.on_device_found(DeviceInfo {
            min_channels: 2,
            min_sample_rate: 48_000,
            ..device(2, false)
        });
        backend.with(|st| st.read_limit = Some(400));
        let stream = reg
            .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
            .unwrap();
        let mut buf = vec![0u8; 320];
        for _ in 0..3 {
            assert_eq!(stream.read(&mut buf), 320);
        }
        assert_eq!(stream.snapshot().device_rate, Some(48_000));
        assert!(!stream.is_disabled());
        assert!(backend.with(|st| st.reads) >= 3);
    }

    #[test]
    fn empty_reads_return_silence() {
        let (reg, backend) = registry();
        reg.on_device_found(device(2, false));
        backend.with(|st| st.read_limit = Some(0));
        let stream = reg
            .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
            .unwrap();
        let mut buf = vec![0xAAu8; 320];
        assert_eq!(stream.read(&mut buf), 320);
        assert!(buf.iter().all(|&b| b == 0));
        assert_eq!(backend.with(|st| st.reads), 1);
        assert_eq!(stream.device(), Some((2, 0)));

        backend.with(|st| st.read_limit = None);
        assert_eq!(stream.read(&mut buf), 320);
        assert!(buf.iter().all(|&b| b == 0x11));
    }

    #[test]
    fn failed_open_disables_until_standby() {
        let (reg, backend) = registry();
        reg.on_device_found(device(2, false));
        backend.with(|st| st.fail_opens = 1);
        let stream = reg
            .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
            .unwrap();
        let mut buf = vec![0u8; 320];
        stream.read(&mut buf);
        assert!(stream.is_disabled());
        stream.standby();
        stream.read(&mut buf);
        assert!(!stream.is_disabled());
        assert_eq!(stream.device(), Some((2, 0)));
    }

    #[test]
    fn force_applies_only_to_the_submix_address() {
        let (reg, _) = registry();
        reg.on_device_found(device(2, false));
        assert_eq!(reg.set_parameters("force=1"), Err(HalError::BadValue));
        assert!(reg.get_best_device(InputSource::Mic).is_some());

        reg.set_parameters("address=0;force=1").unwrap();
        assert!(reg.get_best_device(InputSource::Mic).is_none());
        reg.set_parameters("address=0;force=0").unwrap();
        assert!(reg.get_best_device(InputSource::Mic).is_some());
        assert_eq!(reg.get_parameters("force"), "");
    }

    #[test]
    fn bad_stream_config_is_not_registered() {
        let (reg, _) = registry();
        let result = reg.open_input_stream(AudioFormat::Pcm32, CHANNEL_IN_MONO, 16_000);
        assert_eq!(result.err(), Some(HalError::BadValue));
        assert_eq!(reg.input_stream_count(), 0);
    }
}
