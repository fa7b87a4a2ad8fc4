pub mod caps;
pub mod client;
pub mod clock;
mod engine;
pub mod error;
pub mod format;
pub mod hw;
pub mod input;
pub mod manager;
pub mod message;
pub mod output;
pub mod params;
pub mod spdif;
pub mod stream_out;
#[cfg(test)]
mod testutil;

use caps::CapsSource;
use clock::LocalClock;
use hw::options::HalOptions;
use hw::pcm::PcmBackend;
use input::{CaptureProber, InputManager, InputSnapshot};
use manager::{ManagerSnapshot, OutputManager};
use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc::{Sender, channel};
use tokio::task::JoinHandle;

/// Process-wide HAL state: the output side and the capture side.
#[derive(Debug, Clone)]
pub struct Hal {
    pub output: Arc<OutputManager>,
    pub input: Arc<InputManager>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HalSnapshot {
    pub output: ManagerSnapshot,
    pub input: InputSnapshot,
}

impl Hal {
    pub fn new(
        backend: Arc<dyn PcmBackend>,
        caps_source: Arc<dyn CapsSource>,
        prober: Arc<dyn CaptureProber>,
        clock: Arc<dyn LocalClock>,
        options: HalOptions,
    ) -> Self {
        let output = OutputManager::new(backend.clone(), caps_source, clock, options.clone());
        let input = InputManager::new(backend, prober, options);
        Self { output, input }
    }

    pub fn snapshot(&self) -> HalSnapshot {
        HalSnapshot {
            output: self.output.snapshot(),
            input: self.input.snapshot(),
        }
    }

    pub fn shutdown(&self) {
        self.input.stop_hotplug();
        self.input.close_all_input_streams();
    }
}

pub fn init(hal: Hal) -> (Sender<message::Message>, JoinHandle<()>) {
    let (tx, rx) = channel::<message::Message>(32);
    let mut engine = engine::Engine::new(rx, hal);
    let handle = tokio::spawn(async move {
        engine.init().await;
        engine.work().await;
    });
    (tx, handle)
}
