#![cfg(target_os = "linux")]

use hdmi_hal_engine::clock::{LocalClock, MonotonicClock};
use hdmi_hal_engine::format::{AudioFormat, CHANNEL_IN_MONO};
use hdmi_hal_engine::hw::null::NullBackend;
use hdmi_hal_engine::hw::options::HalOptions;
use hdmi_hal_engine::input::{DeviceInfo, InputManager, InputSource, StaticProber};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn wait_for(cond: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    false
}

fn remote_mic(card: u32) -> DeviceInfo {
    DeviceInfo {
        card,
        device: 0,
        min_sample_bits: 16,
        max_sample_bits: 16,
        min_channels: 1,
        max_channels: 1,
        min_sample_rate: 8_000,
        max_sample_rate: 16_000,
        for_voice_recognition: true,
        valid: true,
    }
}

fn scratch_dir() -> PathBuf {
    let dir = std::env::temp_dir().join(format!("hdmi-hal-capture-{}", std::process::id()));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("scratch dir");
    dir
}

#[test]
fn plugged_remote_feeds_voice_recognition_stream() {
    init_logging();
    let dir = scratch_dir();
    let clock: Arc<dyn LocalClock> = Arc::new(MonotonicClock);
    let registry = InputManager::new(
        Arc::new(NullBackend::new(clock, false)),
        Arc::new(StaticProber {
            devices: vec![remote_mic(4)],
        }),
        HalOptions {
            capture_device_dir: dir.clone(),
            ..HalOptions::default()
        },
    );
    registry.start_hotplug().expect("hotplug");
    assert!(registry.hotplug_running());
    assert!(registry.get_best_device(InputSource::VoiceRecognition).is_none());

    let node = dir.join("pcmC4D0c");
    std::fs::write(&node, b"").expect("create node");
    assert!(wait_for(|| registry
        .get_best_device(InputSource::VoiceRecognition)
        .is_some()));
    assert!(registry.get_best_device(InputSource::Mic).is_none());

    let stream = registry
        .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
        .expect("open");
    stream.set_parameters("input-source=6").expect("source");
    let mut buf = vec![0u8; stream.buffer_size()];
    assert_eq!(stream.read(&mut buf), buf.len());
    assert_eq!(stream.device(), Some((4, 0)));

    std::fs::remove_file(&node).expect("remove node");
    assert!(wait_for(|| stream.is_in_standby()));
    assert!(registry.devices().is_empty());

    registry.stop_hotplug();
    assert!(!registry.hotplug_running());
    registry.close_input_stream(&stream);
    let _ = std::fs::remove_dir_all(&dir);
}

#[test]
fn wide_band_device_is_resampled_down() {
    init_logging();
    let clock: Arc<dyn LocalClock> = Arc::new(MonotonicClock);
    let registry = InputManager::new(
        Arc::new(NullBackend::new(clock, false)),
        Arc::new(StaticProber::default()),
        HalOptions::default(),
    );
    registry.on_device_found(DeviceInfo {
        min_channels: 2,
        max_channels: 2,
        min_sample_rate: 48_000,
        max_sample_rate: 48_000,
        for_voice_recognition: false,
        ..remote_mic(1)
    });
    let stream = registry
        .open_input_stream(AudioFormat::Pcm16, CHANNEL_IN_MONO, 16_000)
        .expect("open");
    let mut buf = vec![0xFFu8; 640];
    for _ in 0..5 {
        assert_eq!(stream.read(&mut buf), 640);
    }
    let snapshot = stream.snapshot();
    assert_eq!(snapshot.device_rate, Some(48_000));
    assert_eq!(snapshot.device_channels, Some(2));
    assert!(!snapshot.disabled);
    assert!(buf.iter().all(|&b| b == 0));
}
