use std::time::{Duration, Instant};

/// Microsecond clock shared by every thread of one backend instance.
#[derive(Debug, Clone, Copy)]
pub struct MonotonicClock {
    epoch: Instant,
}

impl Default for MonotonicClock {
    fn default() -> Self {
        Self::new()
    }
}

impl MonotonicClock {
    pub fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub fn now_us(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    pub fn instant_at(&self, us: u64) -> Instant {
        self.epoch + Duration::from_micros(us)
    }
}

pub fn frames_to_us(frames: usize, sample_rate: u32) -> u64 {
    if sample_rate == 0 {
        return 0;
    }
    (frames as u64 * 1_000_000) / sample_rate as u64
}

pub fn us_to_frames(us: u64, sample_rate: u32) -> u64 {
    us * sample_rate as u64 / 1_000_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversions_round_down() {
        assert_eq!(frames_to_us(48_000, 48_000), 1_000_000);
        assert_eq!(frames_to_us(256, 48_000), 5_333);
        assert_eq!(us_to_frames(5_333, 48_000), 255);
        assert_eq!(frames_to_us(1, 0), 0);
    }

    #[test]
    fn clock_is_monotonic() {
        let clock = MonotonicClock::new();
        let a = clock.now_us();
        let b = clock.now_us();
        assert!(b >= a);
    }
}
