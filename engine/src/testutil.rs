use crate::clock::LocalClock;
use crate::hw::pcm::{Direction, HwTimestamp, PcmBackend, PcmConfig, PcmDevice, PcmError};
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
pub struct FakeState {
    pub opens: u32,
    pub closes: u32,
    pub fail_opens: u32,
    pub dma_running: bool,
    pub disconnect_on_dma: bool,
    pub disconnect_on_write: bool,
    pub writes: Vec<Vec<u8>>,
    pub frames_written: u64,
    pub start: Option<i64>,
    pub avail: u32,
    pub last_config: Option<PcmConfig>,
    /// Caps every capture read at this many bytes.
    pub read_limit: Option<usize>,
    pub reads: u32,
}

impl FakeState {
    pub fn bytes_written(&self) -> usize {
        self.writes.iter().map(Vec::len).sum()
    }
}

#[derive(Debug, Clone)]
pub struct FakeBackend {
    pub state: Arc<Mutex<FakeState>>,
    clock: Arc<dyn LocalClock>,
}

impl FakeBackend {
    pub fn new(clock: Arc<dyn LocalClock>) -> Self {
        let state = FakeState {
            dma_running: true,
            ..FakeState::default()
        };
        Self {
            state: Arc::new(Mutex::new(state)),
            clock,
        }
    }

    pub fn with<R>(&self, f: impl FnOnce(&mut FakeState) -> R) -> R {
        f(&mut self.state.lock().unwrap())
    }
}

impl PcmBackend for FakeBackend {
    fn find_card(&self, _name: &str) -> Option<u32> {
        Some(1)
    }

    fn open(
        &self,
        _card: u32,
        _device: u32,
        _direction: Direction,
        config: &PcmConfig,
    ) -> Result<Box<dyn PcmDevice>, PcmError> {
        let mut st = self.state.lock().unwrap();
        if st.fail_opens > 0 {
            st.fail_opens -= 1;
            return Err(PcmError::Unavailable("scripted open failure".to_string()));
        }
        st.opens += 1;
        st.start = None;
        st.frames_written = 0;
        st.last_config = Some(*config);
        Ok(Box::new(FakePcm {
            state: self.state.clone(),
            clock: self.clock.clone(),
            config: *config,
        }))
    }
}

#[derive(Debug)]
pub struct FakePcm {
    state: Arc<Mutex<FakeState>>,
    clock: Arc<dyn LocalClock>,
    config: PcmConfig,
}

impl Drop for FakePcm {
    fn drop(&mut self) {
        self.state.lock().unwrap().closes += 1;
    }
}

impl PcmDevice for FakePcm {
    fn config(&self) -> &PcmConfig {
        &self.config
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, PcmError> {
        let mut st = self.state.lock().unwrap();
        if st.disconnect_on_write {
            return Err(PcmError::Disconnected);
        }
        if st.start.is_none() {
            st.start = Some(self.clock.local_time());
        }
        st.frames_written += (data.len() / self.config.frame_bytes()) as u64;
        st.writes.push(data.to_vec());
        Ok(data.len())
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, PcmError> {
        let mut st = self.state.lock().unwrap();
        st.reads += 1;
        let len = st.read_limit.map_or(data.len(), |limit| limit.min(data.len()));
        data[..len].fill(0x11);
        Ok(len)
    }

    fn htimestamp(&mut self) -> Result<HwTimestamp, PcmError> {
        let st = self.state.lock().unwrap();
        Ok(HwTimestamp {
            avail: st.avail,
            timestamp_ns: self.clock.local_time(),
        })
    }

    fn dma_start_time(&mut self) -> Result<i64, PcmError> {
        let st = self.state.lock().unwrap();
        if st.disconnect_on_dma {
            return Err(PcmError::Disconnected);
        }
        if !st.dma_running {
            return Err(PcmError::NotRunning);
        }
        st.start.ok_or(PcmError::NotRunning)
    }
}
