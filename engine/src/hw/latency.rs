use crate::port::LatencyRange;

/// Capture and playback latency of a device running `nperiods` periods of
/// `period` frames, plus the configured systemic latencies.
pub fn latency_ranges(
    period: usize,
    nperiods: usize,
    input_latency_frames: usize,
    output_latency_frames: usize,
) -> (LatencyRange, LatencyRange) {
    let input = period + input_latency_frames;
    let output = nperiods.max(1) * period + output_latency_frames;
    (
        LatencyRange::fixed(input as u32),
        LatencyRange::fixed(output as u32),
    )
}

/// MIDI goes through one period of queueing in each direction.
pub fn midi_latency(period: usize) -> LatencyRange {
    LatencyRange::fixed(period as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn output_includes_every_period() {
        let (cap, play) = latency_ranges(256, 3, 10, 20);
        assert_eq!(cap, LatencyRange::fixed(266));
        assert_eq!(play, LatencyRange::fixed(788));
        let (_, play) = latency_ranges(64, 0, 0, 0);
        assert_eq!(play, LatencyRange::fixed(64));
    }
}
