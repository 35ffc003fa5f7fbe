use crate::error::{Error, Result};
use crate::hw::latency::latency_ranges;
use crate::hw::options::{DriverOptions, Generator};
use crate::hw::traits::{HwDriver, WaitStatus};
use crate::port::LatencyRange;
use crate::ringbuffer::{Consumer, Producer, ring_buffer};
use std::time::{Duration, Instant};

const DEFAULT_CHANNELS: usize = 2;

impl Generator {
    /// Writes the signal for absolute frames `start..start + out.len()`.
    ///
    /// The output depends only on the frame index, so two renders of the same
    /// range are bit-identical.
    pub fn fill(&self, sample_rate: u32, start: u64, out: &mut [f32]) {
        match *self {
            Generator::Silence => out.fill(0.0),
            Generator::Sine {
                frequency,
                amplitude,
            } => {
                let step = frequency / sample_rate.max(1) as f64;
                for (i, sample) in out.iter_mut().enumerate() {
                    let phase = ((start + i as u64) as f64 * step).fract();
                    *sample = amplitude * (std::f64::consts::TAU * phase).sin() as f32;
                }
            }
        }
    }
}

/// Software device used for tests and for running without hardware.
///
/// Paced mode follows the monotonic clock scaled by `speed`; unpaced mode
/// hands out one period per wait immediately.
pub struct DummyDriver {
    name: String,
    sample_rate: u32,
    period: usize,
    periods: usize,
    realtime: bool,
    speed: f64,
    generator: Generator,
    latency: (LatencyRange, LatencyRange),
    capture: Vec<Vec<f32>>,
    playback: Vec<Vec<f32>>,
    taps: Vec<Producer<f32>>,
    position: u64,
    started: Option<Instant>,
}

impl std::fmt::Debug for DummyDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DummyDriver")
            .field("name", &self.name)
            .field("sample_rate", &self.sample_rate)
            .field("period", &self.period)
            .field("periods", &self.periods)
            .field("realtime", &self.realtime)
            .field("speed", &self.speed)
            .field("generator", &self.generator)
            .field("channels_in", &self.capture.len())
            .field("channels_out", &self.playback.len())
            .field("position", &self.position)
            .finish()
    }
}

impl DummyDriver {
    pub fn new(options: &DriverOptions) -> Result<Self> {
        options.validate()?;
        let ins = match options.input_channels {
            0 => DEFAULT_CHANNELS,
            n => n,
        };
        let outs = match options.output_channels {
            0 => DEFAULT_CHANNELS,
            n => n,
        };
        let period = options.period_frames;
        Ok(Self {
            name: format!("Dummy ({})", options.device),
            sample_rate: options.sample_rate,
            period,
            periods: options.periods,
            realtime: options.dummy.realtime,
            speed: options.dummy.speed,
            generator: options.dummy.generator,
            latency: latency_ranges(
                period,
                options.periods,
                options.input_latency_frames,
                options.output_latency_frames,
            ),
            capture: vec![vec![0.0; period]; ins],
            playback: vec![vec![0.0; period]; outs],
            taps: Vec::new(),
            position: 0,
            started: None,
        })
    }

    /// Copies everything written to playback into per-channel rings of
    /// `capacity` samples. Samples that do not fit are dropped.
    pub fn playback_tap(&mut self, capacity: usize) -> Vec<Consumer<f32>> {
        let (producers, consumers): (Vec<_>, Vec<_>) = (0..self.playback.len())
            .map(|_| ring_buffer::<f32>(capacity))
            .unzip();
        self.taps = producers;
        consumers
    }

    /// Frames captured since start.
    pub fn position(&self) -> u64 {
        self.position
    }

    fn clock_frames(&self, now: Instant) -> u64 {
        let Some(started) = self.started else {
            return 0;
        };
        let elapsed = now.saturating_duration_since(started).as_secs_f64();
        (elapsed * self.sample_rate as f64 * self.speed) as u64
    }

    fn frames_to_duration(&self, frames: u64) -> Duration {
        Duration::from_secs_f64(frames as f64 / (self.sample_rate as f64 * self.speed))
    }
}

impl HwDriver for DummyDriver {
    fn name(&self) -> &str {
        &self.name
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn period_frames(&self) -> usize {
        self.period
    }

    fn periods(&self) -> usize {
        self.periods
    }

    fn input_channels(&self) -> usize {
        self.capture.len()
    }

    fn output_channels(&self) -> usize {
        self.playback.len()
    }

    fn latency_ranges(&self) -> (LatencyRange, LatencyRange) {
        self.latency
    }

    fn start(&mut self) -> Result<()> {
        self.position = 0;
        self.started = Some(Instant::now());
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        self.started = None;
        Ok(())
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus> {
        if self.started.is_none() {
            return Err(Error::Device(format!("{} is not running", self.name)));
        }
        if !self.realtime {
            return Ok(WaitStatus {
                available: self.period,
                xrun: false,
            });
        }
        let deadline = Instant::now() + timeout;
        let period = self.period as u64;
        let buffer = period * self.periods as u64;
        loop {
            let now = Instant::now();
            let available = self.clock_frames(now).saturating_sub(self.position);
            if available > buffer {
                // The reader fell more than a whole buffer behind; the backlog
                // is lost like on a real device.
                self.position = self.clock_frames(now) - period;
                return Ok(WaitStatus {
                    available: self.period,
                    xrun: true,
                });
            }
            if available >= period {
                return Ok(WaitStatus {
                    available: available as usize,
                    xrun: false,
                });
            }
            if now >= deadline {
                return Err(Error::Device(format!("{} wait timed out", self.name)));
            }
            let pause = self
                .frames_to_duration(period - available)
                .min(deadline.saturating_duration_since(now));
            std::thread::sleep(pause);
        }
    }

    fn read_capture(&mut self, frames: usize) -> Result<()> {
        let frames = frames.min(self.period);
        for channel in &mut self.capture {
            self.generator
                .fill(self.sample_rate, self.position, &mut channel[..frames]);
        }
        self.position += frames as u64;
        Ok(())
    }

    fn capture_channel(&self, channel: usize) -> &[f32] {
        self.capture.get(channel).map_or(&[], |c| c.as_slice())
    }

    fn playback_channel(&mut self, channel: usize) -> &mut [f32] {
        self.playback
            .get_mut(channel)
            .map_or(&mut [], |c| c.as_mut_slice())
    }

    fn write_playback(&mut self, frames: usize) -> Result<()> {
        let frames = frames.min(self.period);
        for (tap, channel) in self.taps.iter_mut().zip(self.playback.iter()) {
            tap.write(&channel[..frames]);
        }
        Ok(())
    }
}
