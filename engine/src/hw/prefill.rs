/// Frames of silence written before playback starts so the device never
/// begins empty.
pub fn playback_prefill_frames(period: usize, nperiods: usize) -> usize {
    nperiods.max(1).saturating_mul(period)
}
