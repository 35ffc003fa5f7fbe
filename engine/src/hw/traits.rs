use crate::error::Result;
use crate::port::LatencyRange;
use std::time::Duration;

/// What a driver wait observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct WaitStatus {
    /// Frames that can be read and written without blocking.
    pub available: usize,
    /// The device over- or underran since the previous wait.
    pub xrun: bool,
}

/// One full-duplex audio device driven by a single thread.
///
/// The owning thread calls `wait`, then for each whole period available
/// `read_capture`, fills the playback channels and `write_playback`.
pub trait HwDriver: Send {
    fn name(&self) -> &str;
    fn sample_rate(&self) -> u32;
    fn period_frames(&self) -> usize;
    fn periods(&self) -> usize;
    fn input_channels(&self) -> usize;
    fn output_channels(&self) -> usize;
    /// Capture and playback latency in frames.
    fn latency_ranges(&self) -> (LatencyRange, LatencyRange);

    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;

    /// Blocks until at least one period is available or `timeout` expires.
    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus>;

    /// Pulls `frames` frames of capture data into the per-channel buffers.
    fn read_capture(&mut self, frames: usize) -> Result<()>;
    fn capture_channel(&self, channel: usize) -> &[f32];
    fn playback_channel(&mut self, channel: usize) -> &mut [f32];
    /// Pushes `frames` frames from the per-channel playback buffers.
    fn write_playback(&mut self, frames: usize) -> Result<()>;
}

#[macro_export]
macro_rules! dispatch_hw_driver {
    ($enum:ident { $($variant:ident),+ $(,)? }) => {
        impl $crate::hw::traits::HwDriver for $enum {
            fn name(&self) -> &str {
                match self { $($enum::$variant(d) => d.name(),)+ }
            }

            fn sample_rate(&self) -> u32 {
                match self { $($enum::$variant(d) => d.sample_rate(),)+ }
            }

            fn period_frames(&self) -> usize {
                match self { $($enum::$variant(d) => d.period_frames(),)+ }
            }

            fn periods(&self) -> usize {
                match self { $($enum::$variant(d) => d.periods(),)+ }
            }

            fn input_channels(&self) -> usize {
                match self { $($enum::$variant(d) => d.input_channels(),)+ }
            }

            fn output_channels(&self) -> usize {
                match self { $($enum::$variant(d) => d.output_channels(),)+ }
            }

            fn latency_ranges(&self) -> ($crate::port::LatencyRange, $crate::port::LatencyRange) {
                match self { $($enum::$variant(d) => d.latency_ranges(),)+ }
            }

            fn start(&mut self) -> $crate::error::Result<()> {
                match self { $($enum::$variant(d) => d.start(),)+ }
            }

            fn stop(&mut self) -> $crate::error::Result<()> {
                match self { $($enum::$variant(d) => d.stop(),)+ }
            }

            fn wait(&mut self, timeout: std::time::Duration) -> $crate::error::Result<$crate::hw::traits::WaitStatus> {
                match self { $($enum::$variant(d) => d.wait(timeout),)+ }
            }

            fn read_capture(&mut self, frames: usize) -> $crate::error::Result<()> {
                match self { $($enum::$variant(d) => d.read_capture(frames),)+ }
            }

            fn capture_channel(&self, channel: usize) -> &[f32] {
                match self { $($enum::$variant(d) => d.capture_channel(channel),)+ }
            }

            fn playback_channel(&mut self, channel: usize) -> &mut [f32] {
                match self { $($enum::$variant(d) => d.playback_channel(channel),)+ }
            }

            fn write_playback(&mut self, frames: usize) -> $crate::error::Result<()> {
                match self { $($enum::$variant(d) => d.write_playback(frames),)+ }
            }
        }
    };
}
