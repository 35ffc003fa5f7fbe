use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};

pub const SAMPLE_RATE_RANGE: std::ops::RangeInclusive<u32> = 8_000..=384_000;
pub const PERIOD_RANGE: std::ops::RangeInclusive<usize> = 16..=8192;
pub const PERIODS_RANGE: std::ops::RangeInclusive<usize> = 2..=16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverKind {
    #[default]
    Dummy,
    Alsa,
}

/// Test signal produced on every dummy capture channel.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Generator {
    #[default]
    Silence,
    Sine { frequency: f64, amplitude: f32 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DummyOptions {
    /// Pace cycles with the wall clock. Off runs cycles back to back.
    pub realtime: bool,
    /// Clock speed relative to nominal, for simulating an independent device.
    pub speed: f64,
    pub generator: Generator,
    /// Number of looped-back MIDI capture/playback port pairs.
    pub midi_ports: usize,
}

impl Default for DummyOptions {
    fn default() -> Self {
        Self {
            realtime: true,
            speed: 1.0,
            generator: Generator::Silence,
            midi_ports: 0,
        }
    }
}

/// Device settings shared by the master device and slave devices.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DriverOptions {
    pub kind: DriverKind,
    pub device: String,
    pub sample_rate: u32,
    pub period_frames: usize,
    pub periods: usize,
    /// 0 selects the device maximum (two channels for the dummy device).
    pub input_channels: usize,
    pub output_channels: usize,
    pub input_latency_frames: usize,
    pub output_latency_frames: usize,
    pub dummy: DummyOptions,
}

impl Default for DriverOptions {
    fn default() -> Self {
        Self {
            kind: DriverKind::Dummy,
            device: "default".to_string(),
            sample_rate: 48_000,
            period_frames: 256,
            periods: 2,
            input_channels: 0,
            output_channels: 0,
            input_latency_frames: 0,
            output_latency_frames: 0,
            dummy: DummyOptions::default(),
        }
    }
}

impl DriverOptions {
    pub fn validate(&self) -> Result<()> {
        if !SAMPLE_RATE_RANGE.contains(&self.sample_rate) {
            return Err(Error::Config(format!(
                "sample rate {} outside {}..={}",
                self.sample_rate,
                SAMPLE_RATE_RANGE.start(),
                SAMPLE_RATE_RANGE.end()
            )));
        }
        if !PERIOD_RANGE.contains(&self.period_frames) {
            return Err(Error::Config(format!(
                "period of {} frames outside {}..={}",
                self.period_frames,
                PERIOD_RANGE.start(),
                PERIOD_RANGE.end()
            )));
        }
        if !PERIODS_RANGE.contains(&self.periods) {
            return Err(Error::Config(format!(
                "{} periods outside {}..={}",
                self.periods,
                PERIODS_RANGE.start(),
                PERIODS_RANGE.end()
            )));
        }
        if self.kind == DriverKind::Dummy {
            let speed = self.dummy.speed;
            if !speed.is_finite() || !(0.5..=2.0).contains(&speed) {
                return Err(Error::Config(format!(
                    "dummy clock speed {speed} outside 0.5..=2.0"
                )));
            }
            if let Generator::Sine { frequency, amplitude } = self.dummy.generator
                && (frequency <= 0.0
                    || frequency >= self.sample_rate as f64 / 2.0
                    || !(0.0..=1.0).contains(&amplitude))
            {
                return Err(Error::Config(format!(
                    "sine generator {frequency} Hz at {amplitude} is not representable at {} Hz",
                    self.sample_rate
                )));
            }
        }
        if self.kind == DriverKind::Alsa && self.device.trim().is_empty() {
            return Err(Error::Config("ALSA device name is empty".to_string()));
        }
        Ok(())
    }

    /// Period length in microseconds.
    pub fn period_us(&self) -> u64 {
        crate::clock::frames_to_us(self.period_frames, self.sample_rate)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_valid() {
        assert!(DriverOptions::default().validate().is_ok());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let bad = [
            DriverOptions {
                sample_rate: 4_000,
                ..Default::default()
            },
            DriverOptions {
                period_frames: 10_000,
                ..Default::default()
            },
            DriverOptions {
                periods: 1,
                ..Default::default()
            },
            DriverOptions {
                dummy: DummyOptions {
                    speed: 3.0,
                    ..Default::default()
                },
                ..Default::default()
            },
            DriverOptions {
                dummy: DummyOptions {
                    generator: Generator::Sine {
                        frequency: 30_000.0,
                        amplitude: 0.5,
                    },
                    ..Default::default()
                },
                ..Default::default()
            },
        ];
        for opts in bad {
            assert!(matches!(opts.validate(), Err(Error::Config(_))), "{opts:?}");
        }
    }
}
