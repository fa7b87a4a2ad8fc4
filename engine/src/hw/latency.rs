use crate::clock::USEC_PER_SEC;

/// Round `frames` up to the next multiple of 16.
pub fn round_up_16(frames: u32) -> u32 {
    frames.div_ceil(16) * 16
}

/// Chunk of roughly 10ms, padded so buffer sizes stay multiples of 16 frames.
pub fn chunk_frames(output_rate: u32) -> u32 {
    round_up_16(output_rate.div_ceil(100))
}

pub fn nominal_latency_usec(chunk_frames: u32, chunks_in_flight: u32, input_rate: u32) -> u32 {
    if input_rate == 0 {
        return 0;
    }
    let usec = chunk_frames as u64 * USEC_PER_SEC * chunks_in_flight as u64 / input_rate as u64;
    usec.min(u32::MAX as u64) as u32
}

/// Latency reported upward: nominal latency less the video delay
/// compensation, never negative, in milliseconds.
pub fn reported_latency_msec(nominal_usec: u32, video_delay_comp_usec: u32) -> u32 {
    nominal_usec.saturating_sub(video_delay_comp_usec) / 1000
}
