/// Frames of silence pushed before real audio. A sink joining outputs that
/// are already playing only gets half the nominal depth.
pub fn prime_frames(frames_per_chunk: u32, buffer_chunks: u32, others_active: bool) -> u32 {
    let full = frames_per_chunk.saturating_mul(buffer_chunks.max(1));
    if others_active { full / 2 } else { full }
}

/// Largest external delay an output can absorb, in frames at `rate`.
pub fn max_delay_comp_frames(max_delay_comp_msec: u32, rate: u32) -> u32 {
    let msec = max_delay_comp_msec.min(crate::output::MAX_DELAY_COMPENSATION_MSEC);
    ((msec as u64 * rate as u64) / 1000) as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priming_depth() {
        assert_eq!(prime_frames(480, 4, false), 1920);
        assert_eq!(prime_frames(480, 4, true), 960);
        assert_eq!(prime_frames(480, 0, false), 480);
    }

    #[test]
    fn delay_comp_is_capped() {
        assert_eq!(max_delay_comp_frames(300, 48_000), 14_400);
        assert_eq!(max_delay_comp_frames(1_000, 48_000), 14_400);
        assert_eq!(max_delay_comp_frames(100, 44_100), 4_410);
    }
}
