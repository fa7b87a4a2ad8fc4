use std::fmt::Debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Playback,
    Capture,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PcmFormat {
    S16Le,
    /// 24-bit samples in the low bits of a 32-bit container.
    S24Le,
    S32Le,
}

impl PcmFormat {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::S16Le => 2,
            Self::S24Le | Self::S32Le => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PcmConfig {
    pub channels: u32,
    pub rate: u32,
    pub period_size: u32,
    pub period_count: u32,
    pub format: PcmFormat,
    pub start_threshold: u32,
}

impl PcmConfig {
    pub fn frame_bytes(&self) -> usize {
        self.channels as usize * self.format.bytes_per_sample()
    }

    pub fn buffer_frames(&self) -> u32 {
        self.period_size.saturating_mul(self.period_count)
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PcmError {
    /// The driver returned EBADFD: the device is gone.
    #[error("device disconnected")]
    Disconnected,
    #[error("stream is not running")]
    NotRunning,
    #[error("device unavailable: {0}")]
    Unavailable(String),
    #[error("{0}")]
    Io(String),
}

impl PcmError {
    pub fn is_disconnected(&self) -> bool {
        matches!(self, Self::Disconnected)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HwTimestamp {
    /// Frames the driver can accept right now.
    pub avail: u32,
    pub timestamp_ns: i64,
}

/// An open blocking PCM handle. Dropping it closes the device.
pub trait PcmDevice: Send + Debug {
    fn config(&self) -> &PcmConfig;
    fn write(&mut self, data: &[u8]) -> Result<usize, PcmError>;
    fn read(&mut self, data: &mut [u8]) -> Result<usize, PcmError>;
    fn htimestamp(&mut self) -> Result<HwTimestamp, PcmError>;
    /// Local time at which the DMA engine started consuming the first frame
    /// written since open.
    fn dma_start_time(&mut self) -> Result<i64, PcmError>;

    fn buffer_frames(&self) -> u32 {
        self.config().buffer_frames()
    }
}

pub trait PcmBackend: Send + Sync + Debug {
    fn find_card(&self, name: &str) -> Option<u32>;
    fn open(
        &self,
        card: u32,
        device: u32,
        direction: Direction,
        config: &PcmConfig,
    ) -> Result<Box<dyn PcmDevice>, PcmError>;
}
