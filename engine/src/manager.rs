use crate::caps::{CapsSet, CapsSource, HdmiAudioCaps};
use crate::clock::LocalClock;
use crate::error::{HalError, HalResult, lock};
use crate::format::{AudioFormat, DeviceClass};
use crate::hw::options::HalOptions;
use crate::hw::pcm::PcmBackend;
use crate::output::{
    MAX_DELAY_COMPENSATION_MSEC, OutputSnapshot, PhysicalOutput, SinkKind, SinkTarget,
    StreamFormat,
};
use crate::params::{
    KEY_HDMI_ALLOWED, KEY_HDMI_DELAY_COMP, KEY_HDMI_FIXED_LEVEL, KEY_HDMI_OUTPUT_FIXED,
    KEY_VIDEO_DELAY_COMP, Parameters,
};
use crate::stream_out::{OutputStream, StreamSnapshot};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use tracing::{debug, info, warn};

const DEFAULT_MASTER_VOLUME: f32 = 0.60;
const DEFAULT_VIDEO_DELAY_COMP_USEC: u32 = 12_000;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputSettings {
    pub allowed: bool,
    pub delay_comp_usec: u32,
    pub is_fixed: bool,
    pub fixed_level_db: f32,
}

impl Default for OutputSettings {
    fn default() -> Self {
        Self {
            allowed: true,
            delay_comp_usec: 0,
            is_fixed: false,
            fixed_level_db: 0.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub hdmi: OutputSettings,
    pub master_volume: f32,
    pub master_mute: bool,
    pub video_delay_comp_usec: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            hdmi: OutputSettings::default(),
            master_volume: DEFAULT_MASTER_VOLUME,
            master_mute: false,
            video_delay_comp_usec: DEFAULT_VIDEO_DELAY_COMP_USEC,
        }
    }
}

impl Settings {
    pub fn class(&self, class: DeviceClass) -> &OutputSettings {
        match class {
            DeviceClass::Hdmi => &self.hdmi,
        }
    }

    pub fn class_mut(&mut self, class: DeviceClass) -> &mut OutputSettings {
        match class {
            DeviceClass::Hdmi => &mut self.hdmi,
        }
    }
}

struct ClassKeys {
    allowed: &'static str,
    delay_comp: &'static str,
    fixed: &'static str,
    fixed_level: &'static str,
}

fn class_keys(class: DeviceClass) -> ClassKeys {
    match class {
        DeviceClass::Hdmi => ClassKeys {
            allowed: KEY_HDMI_ALLOWED,
            delay_comp: KEY_HDMI_DELAY_COMP,
            fixed: KEY_HDMI_OUTPUT_FIXED,
            fixed_level: KEY_HDMI_FIXED_LEVEL,
        },
    }
}

fn msec_to_usec_clamped(msec: f32) -> u32 {
    let max = MAX_DELAY_COMPENSATION_MSEC as f32;
    (msec.clamp(0.0, max) * 1000.0).round() as u32
}

/// Non-owning reference to a physical output held by a stream. The manager
/// owns the output; a handle goes dead once the output is released.
#[derive(Debug, Clone)]
pub struct OutputHandle {
    class: DeviceClass,
    id: u64,
    output: Weak<Mutex<PhysicalOutput>>,
}

impl OutputHandle {
    pub(crate) fn new(class: DeviceClass, id: u64, output: &Arc<Mutex<PhysicalOutput>>) -> Self {
        Self {
            class,
            id,
            output: Arc::downgrade(output),
        }
    }

    pub fn class(&self) -> DeviceClass {
        self.class
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn dev_mask(&self) -> u32 {
        self.class.mask()
    }

    pub fn is_alive(&self) -> bool {
        self.output.strong_count() > 0
    }

    pub(crate) fn upgrade(&self) -> Option<Arc<Mutex<PhysicalOutput>>> {
        self.output.upgrade()
    }

    /// Runs `f` against the output if it is still registered.
    pub fn with<R>(&self, f: impl FnOnce(&mut PhysicalOutput) -> R) -> Option<R> {
        let output = self.output.upgrade()?;
        let mut guard = lock(&output);
        Some(f(&mut guard))
    }
}

/// What the upper layer asks for when opening an output stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamRequest {
    pub direct: bool,
    pub format: AudioFormat,
    pub channel_mask: u32,
    pub sample_rate: u32,
}

#[derive(Default)]
struct StreamSlots {
    main: Weak<OutputStream>,
    mc: Weak<OutputStream>,
}

struct OutputEntry {
    class: DeviceClass,
    id: u64,
    output: Arc<Mutex<PhysicalOutput>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ManagerSnapshot {
    pub settings: Settings,
    pub connected_mask: u32,
    pub max_delay_comp_usec: u32,
    pub caps: CapsSet,
    pub outputs: Vec<OutputSnapshot>,
    pub streams: Vec<StreamSnapshot>,
}

/// Owns every physical output and arbitrates which logical stream feeds it.
pub struct OutputManager {
    backend: Arc<dyn PcmBackend>,
    caps_source: Arc<dyn CapsSource>,
    clock: Arc<dyn LocalClock>,
    options: HalOptions,
    hdmi_caps: HdmiAudioCaps,

    streams: Mutex<StreamSlots>,
    connected_mask: AtomicU32,
    outputs: Mutex<Vec<OutputEntry>>,
    settings: Mutex<Settings>,
    max_delay_comp_usec: AtomicU32,
    next_output_id: AtomicU64,
}

impl std::fmt::Debug for OutputManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OutputManager")
            .field("connected_mask", &self.connected_mask())
            .field("outputs", &self.physical_output_count())
            .finish()
    }
}

impl OutputManager {
    pub fn new(
        backend: Arc<dyn PcmBackend>,
        caps_source: Arc<dyn CapsSource>,
        clock: Arc<dyn LocalClock>,
        options: HalOptions,
    ) -> Arc<Self> {
        let settings = options.settings.clone();
        let manager = Arc::new(Self {
            backend,
            caps_source,
            clock,
            options,
            hdmi_caps: HdmiAudioCaps::new(),
            streams: Mutex::new(StreamSlots::default()),
            connected_mask: AtomicU32::new(0),
            outputs: Mutex::new(Vec::new()),
            settings: Mutex::new(settings),
            max_delay_comp_usec: AtomicU32::new(0),
            next_output_id: AtomicU64::new(1),
        });
        manager.update_max_delay_comp();
        manager
    }

    pub fn clock(&self) -> &Arc<dyn LocalClock> {
        &self.clock
    }

    pub fn hdmi_caps(&self) -> &HdmiAudioCaps {
        &self.hdmi_caps
    }

    pub fn connected_mask(&self) -> u32 {
        self.connected_mask.load(Ordering::Acquire)
    }

    pub fn video_delay_comp_usec(&self) -> u32 {
        lock(&self.settings).video_delay_comp_usec
    }

    pub fn max_delay_comp_usec(&self) -> u32 {
        self.max_delay_comp_usec.load(Ordering::Acquire)
    }

    pub fn settings(&self) -> Settings {
        lock(&self.settings).clone()
    }

    pub fn physical_output_count(&self) -> usize {
        lock(&self.outputs).len()
    }

    pub fn open_output_stream(self: &Arc<Self>, req: StreamRequest) -> HalResult<Arc<OutputStream>> {
        let mut slots = lock(&self.streams);
        let slot = if req.direct { &slots.mc } else { &slots.main };
        if slot.upgrade().is_some() {
            warn!(
                "{} output stream is already open",
                if req.direct { "MC" } else { "Main" }
            );
            return Err(HalError::InvalidOperation);
        }

        let stream = Arc::new(OutputStream::new(self.clone(), req.direct));
        if let Err(e) = stream.set(req.format, req.channel_mask, req.sample_rate) {
            warn!(
                "Rejected output stream {} {} Hz mask 0x{:x}: {e}",
                req.format.name(),
                req.sample_rate,
                req.channel_mask
            );
            return Err(e);
        }

        if req.direct {
            slots.mc = Arc::downgrade(&stream);
        } else {
            slots.main = Arc::downgrade(&stream);
        }
        info!("Opened {} output stream", stream.name());
        self.update_tgt_devices(&slots);
        Ok(stream)
    }

    pub fn close_output_stream(&self, stream: &Arc<OutputStream>) {
        stream.standby();
        let mut slots = lock(&self.streams);
        let target = Arc::downgrade(stream);
        if Weak::ptr_eq(&slots.main, &target) {
            slots.main = Weak::new();
        } else if Weak::ptr_eq(&slots.mc, &target) {
            slots.mc = Weak::new();
        } else {
            return;
        }
        info!("Closed {} output stream", stream.name());
        self.update_tgt_devices(&slots);
    }

    pub fn set_device_connection_state(&self, class: DeviceClass, connected: bool) {
        let current = self.connected_mask();
        let mask = if connected {
            current | class.mask()
        } else {
            current & !class.mask()
        };
        self.update_routing(mask);
    }

    /// Applies a new set of connected device classes. Nothing happens unless
    /// the mask actually changed.
    pub fn update_routing(&self, dev_mask: u32) {
        let slots = lock(&self.streams);
        let old = self.connected_mask();
        if old == dev_mask {
            return;
        }

        let hdmi = DeviceClass::Hdmi.mask();
        if (old ^ dev_mask) & hdmi != 0 {
            if dev_mask & hdmi != 0 {
                match self.backend.find_card(&self.options.hdmi_card_name) {
                    Some(card) => {
                        self.hdmi_caps.load_caps(self.caps_source.as_ref(), card);
                    }
                    None => {
                        warn!("HDMI connected but card '{}' not found", self.options.hdmi_card_name);
                        self.hdmi_caps.reset();
                    }
                }
            } else {
                self.hdmi_caps.reset();
            }
        }

        info!("Connected devices 0x{old:x} -> 0x{dev_mask:x}");
        self.connected_mask.store(dev_mask, Ordering::Release);
        self.update_max_delay_comp();
        self.update_tgt_devices(&slots);
    }

    fn update_tgt_devices(&self, slots: &StreamSlots) {
        let main = slots.main.upgrade();
        let mc = slots.mc.upgrade();
        let connected = self.connected_mask();

        let mut main_mask = 0;
        let mut mc_mask = 0;
        {
            let settings = lock(&self.settings);
            for class in DeviceClass::ALL {
                if !settings.class(class).allowed || connected & class.mask() == 0 {
                    continue;
                }
                if mc.is_some() {
                    mc_mask |= class.mask();
                } else {
                    main_mask |= class.mask();
                }
            }
        }

        debug!("Target devices: main 0x{main_mask:x}, mc 0x{mc_mask:x}");
        if let Some(main) = main {
            main.set_target_devices(main_mask);
        }
        if let Some(mc) = mc {
            mc.set_target_devices(mc_mask);
        }
    }

    /// Moves HDMI between the MC and main streams as the MC stream enters or
    /// leaves standby.
    pub fn standby_status_update(&self, in_standby: bool, is_mc: bool) {
        let slots = lock(&self.streams);
        if !is_mc {
            return;
        }
        let hdmi = DeviceClass::Hdmi.mask();
        let available = {
            let settings = lock(&self.settings);
            settings.hdmi.allowed && self.connected_mask() & hdmi != 0
        };
        if !available {
            return;
        }
        let (main_mask, mc_mask) = if in_standby { (hdmi, 0) } else { (0, hdmi) };
        if let Some(main) = slots.main.upgrade() {
            main.set_target_devices(main_mask);
        }
        if let Some(mc) = slots.mc.upgrade() {
            mc.set_target_devices(mc_mask);
        }
    }

    pub fn set_master_volume(&self, volume: f32) -> HalResult<()> {
        if !(0.0..=1.0).contains(&volume) {
            return Err(HalError::BadValue);
        }
        let outputs = lock(&self.outputs);
        let mut settings = lock(&self.settings);
        settings.master_volume = volume;
        for entry in outputs.iter() {
            lock(&entry.output).set_volume(volume);
        }
        Ok(())
    }

    pub fn master_volume(&self) -> f32 {
        lock(&self.settings).master_volume
    }

    pub fn set_master_mute(&self, mute: bool) {
        let outputs = lock(&self.outputs);
        let mut settings = lock(&self.settings);
        settings.master_mute = mute;
        for entry in outputs.iter() {
            lock(&entry.output).set_mute(mute);
        }
    }

    pub fn master_mute(&self) -> bool {
        lock(&self.settings).master_mute
    }

    /// Applies every recognized key. Keys left over afterwards make the call
    /// fail with `BadValue`, but what was recognized stays applied.
    pub fn set_parameters(&self, kv_pairs: &str) -> HalResult<()> {
        let mut params = Parameters::parse(kv_pairs);
        let current = self.settings();
        let mut next = current.clone();

        for class in DeviceClass::ALL {
            let keys = class_keys(class);
            let s = next.class_mut(class);
            if let Some(v) = params.get_int(keys.allowed) {
                s.allowed = v != 0;
                params.remove(keys.allowed);
            }
            if let Some(ms) = params.get_float(keys.delay_comp) {
                s.delay_comp_usec = msec_to_usec_clamped(ms);
                params.remove(keys.delay_comp);
            }
            if let Some(v) = params.get_int(keys.fixed) {
                s.is_fixed = v != 0;
                params.remove(keys.fixed);
            }
            if let Some(db) = params.get_float(keys.fixed_level) {
                if db <= 0.0 {
                    s.fixed_level_db = db;
                    params.remove(keys.fixed_level);
                } else {
                    warn!("Ignoring positive fixed level {db} dB for {}", keys.fixed_level);
                }
            }
        }
        if let Some(ms) = params.get_float(KEY_VIDEO_DELAY_COMP) {
            next.video_delay_comp_usec = msec_to_usec_clamped(ms);
            params.remove(KEY_VIDEO_DELAY_COMP);
        }

        if next != current {
            let allowed_changed = {
                let outputs = lock(&self.outputs);
                let mut settings = lock(&self.settings);
                let mut changed = false;
                for class in DeviceClass::ALL {
                    let old = *settings.class(class);
                    let new = *next.class(class);
                    changed |= old.allowed != new.allowed;
                    for entry in outputs.iter().filter(|e| e.class == class) {
                        let mut out = lock(&entry.output);
                        out.set_external_delay_usec(new.delay_comp_usec);
                        out.set_output_is_fixed(new.is_fixed);
                        out.set_fixed_output_level(new.fixed_level_db);
                    }
                }
                *settings = next;
                changed
            };
            self.update_max_delay_comp();

            if allowed_changed {
                let slots = lock(&self.streams);
                self.update_tgt_devices(&slots);
            }
        }

        if params.is_empty() {
            Ok(())
        } else {
            warn!("Unrecognized parameters '{params}'");
            Err(HalError::BadValue)
        }
    }

    pub fn get_parameters(&self, keys: &str) -> String {
        let request = Parameters::parse(keys);
        let settings = self.settings();
        let mut reply = Parameters::default();

        for class in DeviceClass::ALL {
            let k = class_keys(class);
            let s = settings.class(class);
            if request.contains(k.allowed) {
                reply.add(k.allowed, s.allowed as i32);
            }
            if request.contains(k.delay_comp) {
                reply.add(k.delay_comp, s.delay_comp_usec as f32 / 1000.0);
            }
            if request.contains(k.fixed) {
                reply.add(k.fixed, s.is_fixed as i32);
            }
            if request.contains(k.fixed_level) {
                reply.add(k.fixed_level, s.fixed_level_db);
            }
        }
        if request.contains(KEY_VIDEO_DELAY_COMP) {
            reply.add(
                KEY_VIDEO_DELAY_COMP,
                settings.video_delay_comp_usec as f32 / 1000.0,
            );
        }
        reply.to_string()
    }

    fn update_max_delay_comp(&self) {
        let connected = self.connected_mask();
        let settings = lock(&self.settings);
        let max = DeviceClass::ALL
            .into_iter()
            .filter(|c| connected & c.mask() != 0)
            .map(|c| settings.class(c))
            .filter(|s| s.allowed)
            .map(|s| s.delay_comp_usec)
            .max()
            .unwrap_or(0);
        self.max_delay_comp_usec.store(max, Ordering::Release);
    }

    fn sink_target(&self, sink: SinkKind) -> SinkTarget {
        let (card_name, device) = match sink {
            SinkKind::Hdmi => (
                self.options.hdmi_card_name.clone(),
                self.options.hdmi_pcm_device,
            ),
        };
        SinkTarget {
            card_name,
            device,
            open_retries: self.options.open_retries,
            open_retry_delay: self.options.open_retry_delay(),
        }
    }

    /// Hands out the physical output for the single class named by
    /// `dev_mask`. `Ok(None)` means the class is already in use; try again
    /// later.
    pub fn obtain_output(
        &self,
        stream_name: &str,
        fmt: &StreamFormat,
        dev_mask: u32,
    ) -> HalResult<Option<OutputHandle>> {
        if dev_mask.count_ones() != 1 {
            warn!("Cannot obtain an output for device mask 0x{dev_mask:x}");
            return Err(HalError::InvalidOperation);
        }

        let mut outputs = lock(&self.outputs);
        if outputs.iter().any(|e| e.class.mask() == dev_mask) {
            debug!("Output 0x{dev_mask:x} is busy");
            return Ok(None);
        }

        let Some(class) = DeviceClass::from_mask(dev_mask) else {
            warn!("Unknown device mask 0x{dev_mask:x}");
            return Err(HalError::BadValue);
        };

        let id = self.next_output_id.fetch_add(1, Ordering::Relaxed);
        let sink = SinkKind::for_class(class);
        let mut output = PhysicalOutput::new(
            sink,
            id,
            self.sink_target(sink),
            self.backend.clone(),
            self.clock.clone(),
        );
        if let Err(e) = output.setup_for_stream(fmt) {
            warn!("Failed to set up {} for {stream_name}: {e}", sink.name());
            return Err(e);
        }

        {
            let settings = lock(&self.settings);
            let class_settings = settings.class(class);
            output.set_volume(settings.master_volume);
            output.set_mute(settings.master_mute);
            output.set_external_delay_usec(class_settings.delay_comp_usec);
            output.set_output_is_fixed(class_settings.is_fixed);
            output.set_fixed_output_level(class_settings.fixed_level_db);
        }

        let output = Arc::new(Mutex::new(output));
        let handle = OutputHandle::new(class, id, &output);
        outputs.push(OutputEntry { class, id, output });
        info!("{} output {id} given to {stream_name}", sink.name());
        Ok(Some(handle))
    }

    /// Closes the output's device right away, then forgets it.
    pub fn release_output(&self, stream_name: &str, handle: &OutputHandle) {
        let mut outputs = lock(&self.outputs);
        let Some(pos) = outputs.iter().position(|e| e.id == handle.id) else {
            return;
        };
        let entry = outputs.remove(pos);
        lock(&entry.output).cleanup_resources();
        info!(
            "Output {} released by {stream_name}",
            entry.id
        );
    }

    pub fn snapshot(&self) -> ManagerSnapshot {
        let streams = {
            let slots = lock(&self.streams);
            [slots.main.upgrade(), slots.mc.upgrade()]
        };
        let outputs = lock(&self.outputs)
            .iter()
            .map(|e| lock(&e.output).snapshot())
            .collect();
        ManagerSnapshot {
            settings: self.settings(),
            connected_mask: self.connected_mask(),
            max_delay_comp_usec: self.max_delay_comp_usec(),
            caps: self.hdmi_caps.snapshot(),
            outputs,
            streams: streams.into_iter().flatten().map(|s| s.snapshot()).collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::caps::StaticCaps;
    use crate::clock::ManualClock;
    use crate::format::DEVICE_OUT_AUX_DIGITAL;
    use crate::testutil::FakeBackend;
    use std::time::Duration;

    fn options() -> HalOptions {
        HalOptions {
            open_retry_delay_ms: 0,
            ..HalOptions::default()
        }
    }

    fn manager() -> (Arc<OutputManager>, FakeBackend) {
        let clock = Arc::new(ManualClock::new(0));
        let backend = FakeBackend::new(clock.clone());
        let mgr = OutputManager::new(
            Arc::new(backend.clone()),
            Arc::new(StaticCaps::stereo_only()),
            clock,
            options(),
        );
        (mgr, backend)
    }

    fn fmt() -> StreamFormat {
        StreamFormat {
            sample_rate: 48_000,
            channel_count: 2,
            bytes_per_sample: 2,
            frames_per_chunk: 480,
            buffer_chunks: 4,
            encoded: false,
        }
    }

    #[test]
    fn one_output_per_class() {
        let (mgr, backend) = manager();
        let a = mgr
            .obtain_output("Main", &fmt(), DEVICE_OUT_AUX_DIGITAL)
            .expect("obtain")
            .expect("output");
        assert!(
            mgr.obtain_output("MC", &fmt(), DEVICE_OUT_AUX_DIGITAL)
                .expect("obtain")
                .is_none()
        );
        assert_eq!(mgr.physical_output_count(), 1);

        mgr.release_output("Main", &a);
        assert!(!a.is_alive());
        assert_eq!(backend.with(|s| s.closes), 1);

        let b = mgr
            .obtain_output("MC", &fmt(), DEVICE_OUT_AUX_DIGITAL)
            .expect("obtain")
            .expect("output");
        assert_ne!(a.id(), b.id());
        assert_eq!(mgr.physical_output_count(), 1);
    }

    #[test]
    fn bad_masks_are_rejected() {
        let (mgr, _backend) = manager();
        assert_eq!(
            mgr.obtain_output("Main", &fmt(), 0).err(),
            Some(HalError::InvalidOperation)
        );
        assert_eq!(
            mgr.obtain_output("Main", &fmt(), DEVICE_OUT_AUX_DIGITAL | 0x1)
                .err(),
            Some(HalError::InvalidOperation)
        );
        assert_eq!(
            mgr.obtain_output("Main", &fmt(), 0x2).err(),
            Some(HalError::BadValue)
        );
    }

    #[test]
    fn failed_setup_registers_nothing() {
        let (mgr, backend) = manager();
        backend.with(|s| s.fail_opens = 3);
        assert_eq!(
            mgr.obtain_output("Main", &fmt(), DEVICE_OUT_AUX_DIGITAL)
                .err(),
            Some(HalError::NoInit)
        );
        assert_eq!(mgr.physical_output_count(), 0);
    }

    #[test]
    fn recognized_keys_apply_despite_bogus_ones() {
        let (mgr, _backend) = manager();
        mgr.set_parameters("hdmi-allowed=0").expect("set");
        assert_eq!(
            mgr.set_parameters("hdmi-allowed=1;bogus-key=5"),
            Err(HalError::BadValue)
        );
        assert_eq!(mgr.get_parameters("hdmi-allowed"), "hdmi-allowed=1");
    }

    #[test]
    fn delays_are_clamped_and_levels_checked() {
        let (mgr, _backend) = manager();
        mgr.set_parameters("hdmi-delay-compensation=500;video-delay-compensation=-4")
            .expect("set");
        let s = mgr.settings();
        assert_eq!(s.hdmi.delay_comp_usec, 300_000);
        assert_eq!(s.video_delay_comp_usec, 0);

        assert_eq!(
            mgr.set_parameters("hdmi-fixed-level=3"),
            Err(HalError::BadValue)
        );
        mgr.set_parameters("hdmi-output-fixed=1;hdmi-fixed-level=-6")
            .expect("set");
        assert_eq!(
            mgr.get_parameters("hdmi-output-fixed;hdmi-fixed-level;hdmi-delay-compensation"),
            "hdmi-output-fixed=1;hdmi-fixed-level=-6;hdmi-delay-compensation=300"
        );
    }

    #[test]
    fn settings_reach_registered_outputs() {
        let (mgr, _backend) = manager();
        let out = mgr
            .obtain_output("Main", &fmt(), DEVICE_OUT_AUX_DIGITAL)
            .expect("obtain")
            .expect("output");
        assert_eq!(out.with(|o| o.volume_params().volume), Some(0.60));

        mgr.set_master_volume(0.25).expect("volume");
        mgr.set_master_mute(true);
        mgr.set_parameters("hdmi-delay-compensation=20").expect("set");
        let (vol, ext) = out
            .with(|o| (o.volume_params(), o.external_delay_usec()))
            .expect("alive");
        assert_eq!(vol.volume, 0.25);
        assert!(vol.mute);
        assert_eq!(ext, 20_000);
        assert_eq!(mgr.set_master_volume(1.5), Err(HalError::BadValue));
    }

    #[test]
    fn max_delay_comp_tracks_connected_allowed_classes() {
        let (mgr, _backend) = manager();
        mgr.set_parameters("hdmi-delay-compensation=40").expect("set");
        assert_eq!(mgr.max_delay_comp_usec(), 0);

        mgr.set_device_connection_state(DeviceClass::Hdmi, true);
        assert_eq!(mgr.max_delay_comp_usec(), 40_000);
        assert!(mgr.hdmi_caps().basic_audio_supported());

        mgr.set_parameters("hdmi-allowed=0").expect("set");
        assert_eq!(mgr.max_delay_comp_usec(), 0);

        mgr.set_parameters("hdmi-allowed=1").expect("set");
        mgr.set_device_connection_state(DeviceClass::Hdmi, false);
        assert_eq!(mgr.max_delay_comp_usec(), 0);
        assert!(!mgr.hdmi_caps().basic_audio_supported());
    }

    fn main_stream(mgr: &Arc<OutputManager>) -> Arc<OutputStream> {
        mgr.open_output_stream(StreamRequest {
            direct: false,
            format: AudioFormat::Default,
            channel_mask: 0,
            sample_rate: 0,
        })
        .expect("open")
    }

    #[test]
    fn unchanged_mask_leaves_bindings_alone() {
        let (mgr, backend) = manager();
        let stream = main_stream(&mgr);
        mgr.set_device_connection_state(DeviceClass::Hdmi, true);
        let chunk = vec![0u8; stream.buffer_size()];
        stream.write(&chunk).expect("write");
        let id = mgr.snapshot().outputs[0].id;

        // A recomputation would restore the HDMI bit.
        stream.set_target_devices(0);
        mgr.update_routing(DeviceClass::Hdmi.mask());
        mgr.set_device_connection_state(DeviceClass::Hdmi, true);
        assert_eq!(stream.target_devices(), 0);
        assert_eq!(stream.attached_devices(), DeviceClass::Hdmi.mask());

        stream.set_target_devices(DeviceClass::Hdmi.mask());
        stream.write(&chunk).expect("write");
        assert_eq!(mgr.physical_output_count(), 1);
        assert_eq!(mgr.snapshot().outputs[0].id, id);
        assert_eq!(backend.with(|s| (s.opens, s.closes)), (1, 0));
    }

    #[test]
    fn hdmi_allowed_toggles_detach_and_reattach() {
        let (mgr, backend) = manager();
        mgr.set_parameters("hdmi-delay-compensation=40").expect("set");
        let stream = main_stream(&mgr);
        mgr.set_device_connection_state(DeviceClass::Hdmi, true);
        let chunk = vec![0u8; stream.buffer_size()];
        stream.write(&chunk).expect("write");
        assert_eq!(stream.attached_devices(), DeviceClass::Hdmi.mask());
        assert_eq!(mgr.max_delay_comp_usec(), 40_000);

        mgr.set_parameters("hdmi-allowed=0").expect("set");
        assert_eq!(stream.target_devices(), 0);
        assert_eq!(mgr.max_delay_comp_usec(), 0);
        stream.write(&chunk).expect("write");
        assert_eq!(stream.attached_devices(), 0);
        assert_eq!(mgr.physical_output_count(), 0);
        assert_eq!(backend.with(|s| s.closes), 1);

        mgr.set_parameters("hdmi-allowed=1").expect("set");
        assert_eq!(stream.target_devices(), DeviceClass::Hdmi.mask());
        assert_eq!(mgr.max_delay_comp_usec(), 40_000);
        stream.write(&chunk).expect("write");
        assert_eq!(stream.attached_devices(), DeviceClass::Hdmi.mask());
        assert_eq!(mgr.physical_output_count(), 1);
        assert_eq!(backend.with(|s| s.opens), 2);
    }

    #[test]
    fn default_settings() {
        let s = Settings::default();
        assert_eq!(s.master_volume, 0.60);
        assert!(!s.master_mute);
        assert_eq!(s.video_delay_comp_usec, 12_000);
        assert!(s.hdmi.allowed);
        assert_eq!(options().open_retry_delay(), Duration::ZERO);
    }
}
