//! Second-order delay-locked loop over period wakeup times.

use std::f64::consts::{PI, SQRT_2};

#[derive(Debug, Clone)]
pub struct Dll {
    b: f64,
    c: f64,
    nominal_us: f64,
    period_frames: usize,
    t0: f64,
    t1: f64,
    e2: f64,
    locked: bool,
}

impl Dll {
    /// `bandwidth_hz` sets the loop corner frequency; the loop is critically
    /// damped.
    pub fn new(period_frames: usize, sample_rate: u32, bandwidth_hz: f64) -> Self {
        let rate = sample_rate.max(1) as f64;
        let omega = 2.0 * PI * bandwidth_hz * period_frames as f64 / rate;
        let nominal_us = period_frames as f64 * 1_000_000.0 / rate;
        Self {
            b: SQRT_2 * omega,
            c: omega * omega,
            nominal_us,
            period_frames,
            t0: 0.0,
            t1: nominal_us,
            e2: nominal_us,
            locked: false,
        }
    }

    /// Restarts the loop at `now_us` with the nominal period.
    pub fn reset(&mut self, now_us: f64) {
        self.e2 = self.nominal_us;
        self.t0 = now_us;
        self.t1 = now_us + self.nominal_us;
        self.locked = true;
    }

    pub fn update(&mut self, now_us: f64) {
        if !self.locked {
            self.reset(now_us);
            return;
        }
        let e = now_us - self.t1;
        self.t0 = self.t1;
        self.t1 += self.b * e + self.e2;
        self.e2 += self.c * e;
    }

    /// Feeds one device wakeup. A wakeup that found more than one whole period
    /// waiting is a scheduling hiccup, so the loop restarts instead of
    /// learning from it.
    pub fn observe(&mut self, now_us: u64, available_frames: usize) -> bool {
        let hiccup = available_frames / self.period_frames.max(1) > 1;
        if hiccup || !self.locked {
            self.reset(now_us as f64);
        } else {
            self.update(now_us as f64);
        }
        hiccup
    }

    /// Measured rate relative to nominal; above 1 when periods arrive early.
    pub fn speed(&self) -> f64 {
        if self.e2 <= 0.0 {
            return 1.0;
        }
        self.nominal_us / self.e2
    }

    /// Filtered period length in microseconds.
    pub fn period_us(&self) -> f64 {
        self.e2
    }

    /// Predicted time of the next wakeup.
    pub fn next_wakeup_us(&self) -> f64 {
        self.t1
    }

    /// Time of the current wakeup as smoothed by the loop.
    pub fn current_wakeup_us(&self) -> f64 {
        self.t0
    }

    pub fn is_locked(&self) -> bool {
        self.locked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn run(dll: &mut Dll, period_us: f64, cycles: usize, jitter_us: f64) {
        let mut seed = 0x2545_f491_u32;
        for i in 0..cycles {
            seed ^= seed << 13;
            seed ^= seed >> 17;
            seed ^= seed << 5;
            let noise = (seed as f64 / u32::MAX as f64 - 0.5) * 2.0 * jitter_us;
            let now = 1_000.0 + i as f64 * period_us + noise;
            dll.observe(now.max(0.0) as u64, 256);
        }
    }

    #[test]
    fn converges_to_a_slow_device() {
        let mut dll = Dll::new(256, 48_000, 1.0);
        let nominal = 256.0 * 1_000_000.0 / 48_000.0;
        run(&mut dll, nominal * 1.0001, 600, 0.0);
        assert_relative_eq!(dll.speed(), 1.0 / 1.0001, epsilon = 2e-6);
    }

    #[test]
    fn narrow_loop_rejects_jitter() {
        let mut dll = Dll::new(256, 48_000, 0.1);
        let nominal = 256.0 * 1_000_000.0 / 48_000.0;
        run(&mut dll, nominal / 1.0005, 20_000, 80.0);
        assert_relative_eq!(dll.speed(), 1.0005, epsilon = 2e-5);
    }

    #[test]
    fn backlog_restarts_the_loop() {
        let mut dll = Dll::new(256, 48_000, 1.0);
        let nominal = 256.0 * 1_000_000.0 / 48_000.0;
        run(&mut dll, nominal * 1.01, 400, 0.0);
        assert!((dll.speed() - 1.0).abs() > 1e-3);
        assert!(!dll.observe(10_000_000, 511));
        assert!(dll.observe(20_000_000, 512));
        assert_relative_eq!(dll.speed(), 1.0);
        assert_relative_eq!(dll.next_wakeup_us(), 20_000_000.0 + nominal);
    }
}
