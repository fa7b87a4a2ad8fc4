use super::probe::{CaptureProber, DeviceInfo, parse_capture_device_name};
use nix::errno::Errno;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use std::io::{self, Write};
use std::os::fd::AsFd;
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use tracing::{debug, error, info, warn};

/// Device nodes are not always openable the moment they appear.
const SETTLE_MS: u16 = 50;
const THREAD_NAME: &str = "capture-hotplug";

pub trait HotplugCallback: Send + Sync {
    fn on_device_found(&self, info: DeviceInfo);
    fn on_device_removed(&self, card: u32, device: u32);
}

/// Watches the capture device directory on a background thread.
pub struct HotplugWatcher {
    shutdown_tx: Option<UnixStream>,
    thread: Option<JoinHandle<()>>,
}

impl std::fmt::Debug for HotplugWatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HotplugWatcher")
            .field("running", &self.thread.is_some())
            .finish()
    }
}

impl HotplugWatcher {
    /// Sets up the directory watch, reports devices already present, then
    /// keeps reporting changes until `shutdown`.
    pub fn start(
        dir: PathBuf,
        prober: Arc<dyn CaptureProber>,
        callback: Arc<dyn HotplugCallback>,
    ) -> io::Result<Self> {
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        inotify.add_watch(&dir, AddWatchFlags::IN_CREATE | AddWatchFlags::IN_DELETE)?;
        let (shutdown_tx, shutdown_rx) = UnixStream::pair()?;

        let thread = std::thread::Builder::new()
            .name(THREAD_NAME.to_string())
            .spawn(move || {
                let watch = Watch {
                    dir,
                    inotify,
                    shutdown: shutdown_rx,
                    prober,
                    callback,
                };
                watch.run();
            })?;
        info!("Capture hotplug watcher started");
        Ok(Self {
            shutdown_tx: Some(shutdown_tx),
            thread: Some(thread),
        })
    }

    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|t| !t.is_finished())
    }

    /// Signals the watcher and waits for its thread to exit.
    pub fn shutdown(&mut self) {
        if let Some(mut tx) = self.shutdown_tx.take() {
            if let Err(e) = tx.write_all(&[1]) {
                warn!("Failed to signal hotplug watcher: {e}");
            }
        }
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                error!("Hotplug watcher thread panicked");
            }
            info!("Capture hotplug watcher stopped");
        }
    }
}

impl Drop for HotplugWatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}

struct Watch {
    dir: PathBuf,
    inotify: Inotify,
    shutdown: UnixStream,
    prober: Arc<dyn CaptureProber>,
    callback: Arc<dyn HotplugCallback>,
}

enum Wake {
    Changed,
    Shutdown,
    Idle,
}

impl Watch {
    fn run(&self) {
        self.scan(&self.dir);
        loop {
            match self.wait() {
                Ok(Wake::Shutdown) => break,
                Ok(Wake::Idle) => continue,
                Ok(Wake::Changed) => {
                    if !self.drain_events() {
                        break;
                    }
                }
                Err(e) => {
                    error!("Hotplug poll failed: {e}");
                    break;
                }
            }
        }
    }

    fn scan(&self, dir: &Path) {
        let entries = match std::fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!("Cannot scan {}: {e}", dir.display());
                return;
            }
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some((card, device)) = name.to_str().and_then(parse_capture_device_name) else {
                continue;
            };
            if let Some(info) = self.prober.device_info(card, device) {
                self.callback.on_device_found(info);
            }
        }
    }

    fn wait(&self) -> nix::Result<Wake> {
        let mut fds = [
            PollFd::new(self.inotify.as_fd(), PollFlags::POLLIN),
            PollFd::new(self.shutdown.as_fd(), PollFlags::POLLIN),
        ];
        match poll(&mut fds, PollTimeout::NONE) {
            Ok(_) => {}
            Err(Errno::EINTR) => return Ok(Wake::Idle),
            Err(e) => return Err(e),
        }
        let readable = |fd: &PollFd| fd.revents().is_some_and(|r| r.contains(PollFlags::POLLIN));
        if readable(&fds[1]) {
            return Ok(Wake::Shutdown);
        }
        if readable(&fds[0]) {
            Ok(Wake::Changed)
        } else {
            Ok(Wake::Idle)
        }
    }

    /// Waits out the settle delay. Returns false if shutdown came first.
    fn settle(&self) -> bool {
        let mut fds = [PollFd::new(self.shutdown.as_fd(), PollFlags::POLLIN)];
        match poll(&mut fds, PollTimeout::from(SETTLE_MS)) {
            Ok(0) => true,
            Ok(_) => false,
            Err(e) => {
                error!("Hotplug settle poll failed: {e}");
                false
            }
        }
    }

    /// Returns false when the watcher should stop.
    fn drain_events(&self) -> bool {
        let events = match self.inotify.read_events() {
            Ok(events) => events,
            Err(Errno::EAGAIN) => return true,
            Err(e) => {
                error!("Hotplug read failed: {e}");
                return false;
            }
        };
        for event in events {
            let Some((card, device)) = event
                .name
                .as_ref()
                .and_then(|n| n.to_str())
                .and_then(parse_capture_device_name)
            else {
                continue;
            };
            if event.mask.contains(AddWatchFlags::IN_CREATE) {
                if !self.settle() {
                    return false;
                }
                debug!("Capture device {card}:{device} appeared");
                if let Some(info) = self.prober.device_info(card, device) {
                    self.callback.on_device_found(info);
                }
            } else if event.mask.contains(AddWatchFlags::IN_DELETE) {
                debug!("Capture device {card}:{device} went away");
                self.callback.on_device_removed(card, device);
            }
        }
        true
    }
}
