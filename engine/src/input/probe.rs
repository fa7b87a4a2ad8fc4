use crate::hw::cards;
use serde::Serialize;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use tracing::{debug, error};

/// Node name suffix of capture PCMs under the device directory.
const CAPTURE_SUFFIX: char = 'c';

/// Envelope of what a capture PCM can be opened with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DeviceInfo {
    pub card: u32,
    pub device: u32,
    pub min_sample_bits: u32,
    pub max_sample_bits: u32,
    pub min_channels: u32,
    pub max_channels: u32,
    pub min_sample_rate: u32,
    pub max_sample_rate: u32,
    pub for_voice_recognition: bool,
    pub valid: bool,
}

/// Parses `pcmC<card>D<device>c`. Playback nodes and anything else yield
/// `None`.
pub fn parse_capture_device_name(name: &str) -> Option<(u32, u32)> {
    let rest = name.strip_prefix("pcmC")?;
    let (card, rest) = rest.split_once('D')?;
    let device = rest.strip_suffix(CAPTURE_SUFFIX)?;
    if card.is_empty() || device.is_empty() {
        return None;
    }
    Some((card.parse().ok()?, device.parse().ok()?))
}

pub fn capture_device_path(dir: &Path, card: u32, device: u32) -> PathBuf {
    dir.join(format!("pcmC{card}D{device}{CAPTURE_SUFFIX}"))
}

/// Asks a capture device what it supports.
pub trait CaptureProber: Send + Sync + Debug {
    fn device_info(&self, card: u32, device: u32) -> Option<DeviceInfo>;
}

/// Probes device nodes with `SNDRV_PCM_IOCTL_HW_REFINE` and recognizes the
/// voice remote by its card id.
#[derive(Debug, Clone)]
pub struct AlsaCaptureProber {
    device_dir: PathBuf,
    proc_root: PathBuf,
    voice_card_name: String,
}

impl AlsaCaptureProber {
    pub fn new(device_dir: PathBuf, proc_root: PathBuf, voice_card_name: String) -> Self {
        Self {
            device_dir,
            proc_root,
            voice_card_name,
        }
    }

    fn is_voice_card(&self, card: u32) -> bool {
        match cards::card_id(&self.proc_root, card) {
            Some(id) => {
                debug!("Capture card {card} is '{id}'");
                id == self.voice_card_name
            }
            None => false,
        }
    }
}

impl CaptureProber for AlsaCaptureProber {
    fn device_info(&self, card: u32, device: u32) -> Option<DeviceInfo> {
        let path = capture_device_path(&self.device_dir, card, device);
        debug!("Probing {}", path.display());
        let refined = match refine::query(&path) {
            Ok(r) => r,
            Err(e) => {
                error!("Capture probe of {} failed: {e}", path.display());
                return None;
            }
        };
        let for_voice_recognition = self.is_voice_card(card);
        if for_voice_recognition {
            debug!("Found voice remote mic on card {card}");
        }
        Some(DeviceInfo {
            card,
            device,
            min_sample_bits: refined.sample_bits.0,
            max_sample_bits: refined.sample_bits.1,
            min_channels: refined.channels.0,
            max_channels: refined.channels.1,
            min_sample_rate: refined.rate.0,
            max_sample_rate: refined.rate.1,
            for_voice_recognition,
            valid: true,
        })
    }
}

/// Fixed table of devices, used when there is no ALSA capture hardware.
#[derive(Debug, Clone, Default)]
pub struct StaticProber {
    pub devices: Vec<DeviceInfo>,
}

impl CaptureProber for StaticProber {
    fn device_info(&self, card: u32, device: u32) -> Option<DeviceInfo> {
        self.devices
            .iter()
            .find(|d| d.card == card && d.device == device)
            .copied()
    }
}

mod refine {
    use std::ffi::c_ulong;
    use std::fs::File;
    use std::os::fd::AsRawFd;
    use std::path::Path;

    const SNDRV_PCM_IOCTL_MAGIC: u8 = b'A';
    const SNDRV_PCM_IOCTL_HW_REFINE: u8 = 0x10;

    const MASK_COUNT: usize = 3;
    const MASK_RESERVED: usize = 5;
    const INTERVAL_COUNT: usize = 12;
    const INTERVAL_RESERVED: usize = 9;

    const SAMPLE_BITS: usize = 0;
    const CHANNELS: usize = 2;
    const RATE: usize = 3;

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct SndMask {
        bits: [u32; 8],
    }

    #[repr(C)]
    #[derive(Clone, Copy)]
    struct SndInterval {
        min: u32,
        max: u32,
        flags: u32,
    }

    #[repr(C)]
    #[allow(dead_code)]
    pub struct SndPcmHwParams {
        flags: u32,
        masks: [SndMask; MASK_COUNT],
        mres: [SndMask; MASK_RESERVED],
        intervals: [SndInterval; INTERVAL_COUNT],
        ires: [SndInterval; INTERVAL_RESERVED],
        rmask: u32,
        cmask: u32,
        info: u32,
        msbits: u32,
        rate_num: u32,
        rate_den: u32,
        fifo_size: c_ulong,
        reserved: [u8; 64],
    }

    impl SndPcmHwParams {
        /// The whole configuration space: every mask bit set, every
        /// interval unbounded.
        fn any() -> Self {
            let mask = SndMask { bits: [u32::MAX; 8] };
            let interval = SndInterval {
                min: 0,
                max: u32::MAX,
                flags: 0,
            };
            Self {
                flags: 0,
                masks: [mask; MASK_COUNT],
                mres: [SndMask { bits: [0; 8] }; MASK_RESERVED],
                intervals: [interval; INTERVAL_COUNT],
                ires: [SndInterval {
                    min: 0,
                    max: 0,
                    flags: 0,
                }; INTERVAL_RESERVED],
                rmask: u32::MAX,
                cmask: 0,
                info: 0,
                msbits: 0,
                rate_num: 0,
                rate_den: 0,
                fifo_size: 0,
                reserved: [0; 64],
            }
        }

        fn interval(&self, idx: usize) -> (u32, u32) {
            let i = &self.intervals[idx];
            (i.min, i.max)
        }
    }

    nix::ioctl_readwrite!(
        pcm_hw_refine,
        SNDRV_PCM_IOCTL_MAGIC,
        SNDRV_PCM_IOCTL_HW_REFINE,
        SndPcmHwParams
    );

    pub(super) struct Refined {
        pub sample_bits: (u32, u32),
        pub channels: (u32, u32),
        pub rate: (u32, u32),
    }

    pub(super) fn query(path: &Path) -> std::io::Result<Refined> {
        let file = File::open(path)?;
        let mut params = SndPcmHwParams::any();
        unsafe { pcm_hw_refine(file.as_raw_fd(), &mut params) }?;
        Ok(Refined {
            sample_bits: params.interval(SAMPLE_BITS),
            channels: params.interval(CHANNELS),
            rate: params.interval(RATE),
        })
    }
}
