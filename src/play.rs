use hdmi_hal_engine::Hal;
use hdmi_hal_engine::format::{AudioFormat, CHANNEL_OUT_STEREO};
use hdmi_hal_engine::manager::StreamRequest;
use hdmi_hal_engine::stream_out::{DEFAULT_SAMPLE_RATE, PresentationPosition};
use std::io;
use std::path::Path;
use tracing::{info, warn};
use wavers::Wav;

/// Interleaved stereo 16-bit samples at the main stream rate.
fn load(path: &Path) -> io::Result<Vec<i16>> {
    let mut wav = Wav::<i16>::from_path(path)
        .map_err(|e| io::Error::other(format!("Failed to open WAV '{}': {e}", path.display())))?;
    let channels = wav.n_channels().max(1) as usize;
    let rate = wav.sample_rate();
    if rate != DEFAULT_SAMPLE_RATE as i32 {
        return Err(io::Error::other(format!(
            "'{}' is {rate} Hz, the main stream plays {DEFAULT_SAMPLE_RATE} Hz",
            path.display()
        )));
    }
    let samples: wavers::Samples<i16> = wav
        .read()
        .map_err(|e| io::Error::other(format!("WAV read error '{}': {e}", path.display())))?;
    let stereo = match channels {
        1 => samples.iter().flat_map(|&s| [s, s]).collect(),
        2 => samples.to_vec(),
        n => samples
            .chunks_exact(n)
            .flat_map(|frame| [frame[0], frame[1]])
            .collect(),
    };
    Ok(stereo)
}

/// Plays `path` through the main output stream. Blocks until the last
/// chunk is written.
pub fn play_wav(hal: &Hal, path: &Path) -> io::Result<()> {
    let samples = load(path)?;
    let stream = hal
        .output
        .open_output_stream(StreamRequest {
            direct: false,
            format: AudioFormat::Pcm16,
            channel_mask: CHANNEL_OUT_STEREO,
            sample_rate: DEFAULT_SAMPLE_RATE,
        })
        .map_err(|e| io::Error::other(format!("Failed to open output stream: {e}")))?;

    let bytes: Vec<u8> = samples.iter().flat_map(|s| s.to_le_bytes()).collect();
    let chunk = stream.buffer_size().max(stream.frame_size());
    info!(
        "Playing {} ({} frames)",
        path.display(),
        bytes.len() / stream.frame_size()
    );
    let mut result = Ok(());
    for data in bytes.chunks(chunk) {
        if let Err(e) = stream.write(data) {
            result = Err(io::Error::other(format!("Write failed: {e}")));
            break;
        }
    }
    match stream.presentation_position() {
        Ok(PresentationPosition::Playing { frames, .. }) => info!("Presented {frames} frames"),
        Ok(PresentationPosition::Preroll) => info!("Playback ended during preroll"),
        Err(e) => warn!("No presentation position: {e}"),
    }
    stream.standby();
    hal.output.close_output_stream(&stream);
    result
}
