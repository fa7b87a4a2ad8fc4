use hdmi_hal_engine::caps::StaticCaps;
use hdmi_hal_engine::clock::{LocalClock, MonotonicClock};
use hdmi_hal_engine::error::HalError;
use hdmi_hal_engine::format::{AudioFormat, CHANNEL_OUT_STEREO, DeviceClass};
use hdmi_hal_engine::hw::null::NullBackend;
use hdmi_hal_engine::hw::options::HalOptions;
use hdmi_hal_engine::manager::{OutputManager, StreamRequest};
use std::sync::Arc;
use std::time::{Duration, Instant};

fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

fn manager(realtime: bool) -> Arc<OutputManager> {
    init_logging();
    let clock: Arc<dyn LocalClock> = Arc::new(MonotonicClock);
    OutputManager::new(
        Arc::new(NullBackend::new(clock.clone(), realtime)),
        Arc::new(StaticCaps::stereo_only()),
        clock,
        HalOptions {
            open_retry_delay_ms: 0,
            ..HalOptions::default()
        },
    )
}

fn main_request() -> StreamRequest {
    StreamRequest {
        direct: false,
        format: AudioFormat::Pcm16,
        channel_mask: CHANNEL_OUT_STEREO,
        sample_rate: 48_000,
    }
}

#[test]
fn write_without_outputs_is_throttled() {
    let mgr = manager(true);
    let stream = mgr.open_output_stream(main_request()).expect("open");
    assert_eq!(stream.attached_devices(), 0);

    // 100ms of stereo 16-bit audio.
    let data = vec![0u8; 4800 * stream.frame_size()];
    let started = Instant::now();
    assert_eq!(stream.write(&data), Ok(data.len()));
    assert!(started.elapsed() >= Duration::from_millis(99));
    assert_eq!(stream.frames_presented(), 4800);

    let started = Instant::now();
    stream.write(&data).expect("write");
    assert!(started.elapsed() >= Duration::from_millis(90));
    assert_eq!(stream.frames_presented(), 9600);
    assert_eq!(stream.render_position(), Err(HalError::NoDevice));
}

#[test]
fn hdmi_attaches_and_detaches_with_connection_state() {
    let mgr = manager(false);
    let stream = mgr.open_output_stream(main_request()).expect("open");
    mgr.set_device_connection_state(DeviceClass::Hdmi, true);
    assert_eq!(stream.target_devices(), DeviceClass::Hdmi.mask());

    let chunk = vec![0u8; stream.buffer_size()];
    for _ in 0..4 {
        stream.write(&chunk).expect("write");
    }
    assert_eq!(stream.attached_devices(), DeviceClass::Hdmi.mask());
    assert_eq!(mgr.physical_output_count(), 1);
    assert!(stream.render_position().is_ok());

    let snapshot = mgr.snapshot();
    assert_eq!(snapshot.outputs.len(), 1);
    assert_eq!(snapshot.connected_mask, DeviceClass::Hdmi.mask());

    mgr.set_device_connection_state(DeviceClass::Hdmi, false);
    assert_eq!(stream.target_devices(), 0);
    stream.write(&chunk).expect("write");
    assert_eq!(stream.attached_devices(), 0);
    assert_eq!(mgr.physical_output_count(), 0);

    mgr.close_output_stream(&stream);
    assert!(mgr.snapshot().streams.is_empty());
}
