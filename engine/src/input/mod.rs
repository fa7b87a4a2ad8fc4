pub mod hotplug;
pub mod probe;
pub mod registry;
pub mod resample;
pub mod stream_in;

pub use probe::{AlsaCaptureProber, CaptureProber, DeviceInfo, StaticProber};
pub use registry::{InputManager, InputSnapshot, InputSource};
pub use stream_in::InputStream;
