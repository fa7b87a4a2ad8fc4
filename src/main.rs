mod config;
mod logging;
mod play;

use config::{Backend, Config};
use hdmi_hal_engine::caps::CapsSource;
use hdmi_hal_engine::client::Client;
use hdmi_hal_engine::clock::{LocalClock, MonotonicClock};
use hdmi_hal_engine::format::DeviceClass;
use hdmi_hal_engine::hw::config::{HOTPLUG_DISABLE_ENV, env_flag};
use hdmi_hal_engine::hw::null::NullBackend;
use hdmi_hal_engine::hw::pcm::PcmBackend;
use hdmi_hal_engine::input::{CaptureProber, StaticProber};
use hdmi_hal_engine::{Hal, init};
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{error, info, warn};

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    play: Option<PathBuf>,
    status: bool,
}

const USAGE: &str = "usage: hdmi-hal [--config FILE] [--play FILE.wav] [--status]";

fn parse_args() -> io::Result<Args> {
    let mut args = Args::default();
    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        match arg.as_str() {
            "--config" | "-c" => args.config = it.next().map(PathBuf::from),
            "--play" | "-p" => args.play = it.next().map(PathBuf::from),
            "--status" | "-s" => args.status = true,
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => {
                return Err(io::Error::other(format!("unknown argument '{other}'\n{USAGE}")));
            }
        }
    }
    Ok(args)
}

type Collaborators = (
    Arc<dyn PcmBackend>,
    Arc<dyn CapsSource>,
    Arc<dyn CaptureProber>,
);

fn collaborators(config: &Config, clock: Arc<dyn LocalClock>) -> Collaborators {
    match config.backend {
        #[cfg(target_os = "linux")]
        Backend::Alsa => {
            use hdmi_hal_engine::hw::alsa::AlsaBackend;
            use hdmi_hal_engine::hw::mixer::AlsaCapsSource;
            use hdmi_hal_engine::input::AlsaCaptureProber;
            let hal = &config.hal;
            (
                Arc::new(AlsaBackend::new(hal.proc_asound_dir.clone(), clock)),
                Arc::new(AlsaCapsSource),
                Arc::new(AlsaCaptureProber::new(
                    hal.capture_device_dir.clone(),
                    hal.proc_asound_dir.clone(),
                    hal.voice_recognition_card_name.clone(),
                )),
            )
        }
        #[cfg(not(target_os = "linux"))]
        Backend::Alsa => {
            warn!("ALSA is not available here, using the null backend");
            null_collaborators(config, clock)
        }
        Backend::Null => null_collaborators(config, clock),
    }
}

fn null_collaborators(config: &Config, clock: Arc<dyn LocalClock>) -> Collaborators {
    (
        Arc::new(NullBackend::new(clock, true)),
        Arc::new(config.caps.clone()),
        Arc::new(StaticProber::default()),
    )
}

#[tokio::main]
async fn main() -> io::Result<()> {
    let args = parse_args()?;
    let config = Config::load(args.config.as_deref())?;
    logging::init(&config.log_level);
    info!("Starting with the {:?} backend", config.backend);

    let clock: Arc<dyn LocalClock> = Arc::new(MonotonicClock);
    let (backend, caps_source, prober) = collaborators(&config, clock.clone());
    let hdmi_present = backend.find_card(&config.hal.hdmi_card_name).is_some();
    let hal = Hal::new(backend, caps_source, prober, clock, config.hal.clone());

    if !env_flag(HOTPLUG_DISABLE_ENV) {
        if let Err(e) = hal.input.start_hotplug() {
            warn!("Capture hotplug disabled: {e}");
        }
    }

    let (tx, handle) = init(hal.clone());
    let mut client = Client::new(tx).await;
    if hdmi_present {
        if let Err(e) = client.connect(DeviceClass::Hdmi, true).await {
            error!("Failed to connect HDMI: {e}");
        }
    } else {
        warn!("HDMI card '{}' not found", config.hal.hdmi_card_name);
    }

    let mut result = Ok(());
    if let Some(path) = args.play {
        let player = hal.clone();
        result = tokio::task::spawn_blocking(move || play::play_wav(&player, &path))
            .await
            .map_err(io::Error::other)
            .and_then(|r| r);
    } else if !args.status {
        info!("Running, press Ctrl-C to stop");
        tokio::signal::ctrl_c().await?;
    }

    if args.status {
        match client.status().await {
            Ok(snapshot) => {
                let json = serde_json::to_string_pretty(&snapshot).map_err(io::Error::other)?;
                println!("{json}");
            }
            Err(e) => error!("Status request failed: {e}"),
        }
    }

    client.quit().await;
    if let Err(e) = handle.await {
        error!("Control engine failed: {e}");
    }
    result
}
