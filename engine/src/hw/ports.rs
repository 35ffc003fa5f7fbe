//! Conversion between interleaved integer device buffers and per-channel
//! float buffers.

pub fn deinterleave<T: Copy>(
    src: &[T],
    channels: usize,
    channel: usize,
    dst: &mut [f32],
    to_f32: impl Fn(T) -> f32,
) {
    if channels == 0 {
        return;
    }
    for (frame, sample) in dst.iter_mut().enumerate() {
        *sample = src
            .get(frame * channels + channel)
            .copied()
            .map(&to_f32)
            .unwrap_or(0.0);
    }
}

pub fn interleave<T: Copy>(
    src: &[f32],
    channels: usize,
    channel: usize,
    dst: &mut [T],
    from_f32: impl Fn(f32) -> T,
) {
    for (frame, &sample) in src.iter().enumerate() {
        if let Some(slot) = dst.get_mut(frame * channels + channel) {
            *slot = from_f32(sample);
        }
    }
}

pub fn i16_to_f32(sample: i16) -> f32 {
    (sample as f32) / 32768.0
}

pub fn i32_to_f32(sample: i32) -> f32 {
    (sample as f32) / 2147483648.0
}

pub fn f32_to_i16(sample: f32) -> i16 {
    (sample.clamp(-1.0, 1.0) * 32767.0) as i16
}

pub fn f32_to_i32(sample: f32) -> i32 {
    (sample.clamp(-1.0, 1.0) as f64 * 2147483647.0) as i32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_and_joins_channels() {
        let interleaved: [i16; 6] = [16384, -16384, 0, 8192, -32768, 32767];
        let mut right = [0.0_f32; 3];
        deinterleave(&interleaved, 2, 1, &mut right, i16_to_f32);
        assert_eq!(right, [-0.5, 0.25, 32767.0 / 32768.0]);

        let mut out = [0_i16; 6];
        interleave(&[1.0, 0.5, -2.0], 2, 0, &mut out, f32_to_i16);
        assert_eq!(out, [32767, 0, 16383, 0, -32767, 0]);
    }

    #[test]
    fn short_source_reads_as_silence() {
        let mut dst = [1.0_f32; 4];
        deinterleave(&[i32::MAX, 0], 2, 0, &mut dst, i32_to_f32);
        assert!(dst[0] > 0.99);
        assert_eq!(&dst[1..], &[0.0, 0.0, 0.0]);
    }
}
