#[cfg(target_os = "linux")]
pub mod alsa;
pub mod cards;
pub mod config;
pub mod convert;
pub mod latency;
#[cfg(target_os = "linux")]
pub mod mixer;
pub mod null;
pub mod options;
pub mod pcm;
pub mod prefill;
