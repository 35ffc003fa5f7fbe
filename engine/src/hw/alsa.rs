use crate::error::{Error, Result};
use crate::hw::error_fmt::{backend_io_error, backend_open_error, backend_rw_error};
use crate::hw::latency::latency_ranges;
use crate::hw::options::DriverOptions;
use crate::hw::ports::{deinterleave, f32_to_i16, f32_to_i32, i16_to_f32, i32_to_f32, interleave};
use crate::hw::prefill::playback_prefill_frames;
use crate::hw::traits::{HwDriver, WaitStatus};
use crate::port::LatencyRange;
use alsa::pcm::{Access, Format, HwParams, PCM, State};
use alsa::{Direction, ValueOr};
use std::time::Duration;
use tracing::{debug, warn};

const BACKEND: &str = "ALSA";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SampleFormat {
    S16,
    S32,
}

/// Interleaved buffer in whichever integer format the device accepted.
enum Interleaved {
    S16(Vec<i16>),
    S32(Vec<i32>),
}

impl Interleaved {
    fn new(format: SampleFormat, len: usize) -> Self {
        match format {
            SampleFormat::S16 => Interleaved::S16(vec![0; len]),
            SampleFormat::S32 => Interleaved::S32(vec![0; len]),
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        match self {
            Interleaved::S16(b) => b.len(),
            Interleaved::S32(b) => b.len(),
        }
    }

    fn silence(&mut self) {
        match self {
            Interleaved::S16(b) => b.fill(0),
            Interleaved::S32(b) => b.fill(0),
        }
    }
}

/// Full-duplex PCM device opened through alsa-lib.
pub struct AlsaDriver {
    name: String,
    capture: PCM,
    playback: PCM,
    sample_rate: u32,
    period: usize,
    periods: usize,
    capture_buf: Interleaved,
    playback_buf: Interleaved,
    /// Silence written ahead of the first period and after an xrun.
    prefill_buf: Interleaved,
    capture_channels: Vec<Vec<f32>>,
    playback_channels: Vec<Vec<f32>>,
    latency: (LatencyRange, LatencyRange),
}

impl std::fmt::Debug for AlsaDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AlsaDriver")
            .field("name", &self.name)
            .field("sample_rate", &self.sample_rate)
            .field("period", &self.period)
            .field("periods", &self.periods)
            .field("channels_in", &self.capture_channels.len())
            .field("channels_out", &self.playback_channels.len())
            .finish()
    }
}

impl AlsaDriver {
    pub fn open(options: &DriverOptions) -> Result<Self> {
        options.validate()?;
        let device = options.device.as_str();
        let capture = PCM::new(device, Direction::Capture, false)
            .map_err(|e| Error::Device(backend_open_error(BACKEND, "capture", device, e)))?;
        let playback = PCM::new(device, Direction::Playback, false)
            .map_err(|e| Error::Device(backend_open_error(BACKEND, "playback", device, e)))?;

        let period = options.period_frames;
        let buffer_frames = period.saturating_mul(options.periods);
        let capture_target = match options.input_channels {
            0 => max_channels(&capture),
            n => n,
        };
        let playback_target = match options.output_channels {
            0 => max_channels(&playback),
            n => n,
        };

        let (channels_in, capture_format) = configure_pcm(
            &capture,
            options.sample_rate,
            capture_target,
            period,
            buffer_frames,
        )
        .map_err(|e| Error::Device(backend_io_error(BACKEND, "capture", e)))?;
        let (channels_out, playback_format) = configure_pcm(
            &playback,
            options.sample_rate,
            playback_target,
            period,
            buffer_frames,
        )
        .map_err(|e| Error::Device(backend_io_error(BACKEND, "playback", e)))?;

        let actual_rate = capture
            .hw_params_current()
            .and_then(|p| p.get_rate())
            .map_err(|e| Error::Device(backend_io_error(BACKEND, "capture", e)))?;
        if actual_rate != options.sample_rate {
            return Err(Error::Config(format!(
                "{device} runs at {actual_rate} Hz, {} Hz requested",
                options.sample_rate
            )));
        }
        if let Err(e) = capture.link(&playback) {
            debug!("{device}: capture and playback not linked: {e}");
        }

        Ok(Self {
            name: format!("{BACKEND} ({device})"),
            capture,
            playback,
            sample_rate: actual_rate,
            period,
            periods: options.periods,
            capture_buf: Interleaved::new(capture_format, period * channels_in),
            playback_buf: Interleaved::new(playback_format, period * channels_out),
            prefill_buf: prefill_silence(playback_format, period, options.periods, channels_out),
            capture_channels: vec![vec![0.0; period]; channels_in],
            playback_channels: vec![vec![0.0; period]; channels_out],
            latency: latency_ranges(
                period,
                options.periods,
                options.input_latency_frames,
                options.output_latency_frames,
            ),
        })
    }

    fn recover(&self) -> Result<()> {
        if self.capture.state() == State::XRun {
            self.capture
                .prepare()
                .and_then(|()| self.capture.start())
                .map_err(|e| Error::Device(backend_rw_error(BACKEND, "capture", "recover", e)))?;
        }
        if self.playback.state() == State::XRun {
            self.playback
                .prepare()
                .map_err(|e| Error::Device(backend_rw_error(BACKEND, "playback", "recover", e)))?;
            self.prefill()?;
        }
        Ok(())
    }

    fn prefill(&self) -> Result<()> {
        let result = match &self.prefill_buf {
            Interleaved::S16(buf) => self.playback.io_i16().and_then(|io| io.writei(buf)),
            Interleaved::S32(buf) => self.playback.io_i32().and_then(|io| io.writei(buf)),
        };
        result.map_err(|e| Error::Device(backend_rw_error(BACKEND, "playback", "prefill", e)))?;
        if self.playback.state() != State::Running {
            self.playback
                .start()
                .map_err(|e| Error::Device(backend_rw_error(BACKEND, "playback", "start", e)))?;
        }
        Ok(())
    }
}

impl HwDriver for AlsaDriver {
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
        self.capture_channels.len()
    }

    fn output_channels(&self) -> usize {
        self.playback_channels.len()
    }

    fn latency_ranges(&self) -> (LatencyRange, LatencyRange) {
        self.latency
    }

    fn start(&mut self) -> Result<()> {
        self.capture
            .prepare()
            .map_err(|e| Error::Device(backend_rw_error(BACKEND, "capture", "prepare", e)))?;
        self.playback
            .prepare()
            .map_err(|e| Error::Device(backend_rw_error(BACKEND, "playback", "prepare", e)))?;
        self.prefill()?;
        if self.capture.state() != State::Running {
            self.capture
                .start()
                .map_err(|e| Error::Device(backend_rw_error(BACKEND, "capture", "start", e)))?;
        }
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        if let Err(e) = self.capture.drop() {
            warn!("{}", backend_rw_error(BACKEND, "capture", "stop", e));
        }
        self.playback
            .drop()
            .map_err(|e| Error::Device(backend_rw_error(BACKEND, "playback", "stop", e)))
    }

    fn wait(&mut self, timeout: Duration) -> Result<WaitStatus> {
        let timeout_ms = timeout.as_millis().min(u32::MAX as u128) as u32;
        let ready = match self.capture.wait(Some(timeout_ms)) {
            Ok(ready) => ready,
            Err(_) if self.capture.state() == State::XRun => {
                self.recover()?;
                return Ok(WaitStatus {
                    available: 0,
                    xrun: true,
                });
            }
            Err(e) => {
                return Err(Error::Device(backend_rw_error(BACKEND, "capture", "wait", e)));
            }
        };
        if !ready {
            return Err(Error::Device(format!("{} wait timed out", self.name)));
        }
        let capture_avail = self.capture.avail_update();
        let playback_avail = self.playback.avail_update();
        match (capture_avail, playback_avail) {
            (Ok(c), Ok(p)) => Ok(WaitStatus {
                available: c.min(p).max(0) as usize,
                xrun: false,
            }),
            _ => {
                self.recover()?;
                Ok(WaitStatus {
                    available: 0,
                    xrun: true,
                })
            }
        }
    }

    fn read_capture(&mut self, frames: usize) -> Result<()> {
        let frames = frames.min(self.period);
        let channels = self.capture_channels.len();
        let result = match &mut self.capture_buf {
            Interleaved::S16(buf) => self
                .capture
                .io_i16()
                .and_then(|io| io.readi(&mut buf[..frames * channels])),
            Interleaved::S32(buf) => self
                .capture
                .io_i32()
                .and_then(|io| io.readi(&mut buf[..frames * channels])),
        };
        if let Err(e) = result {
            if self.capture.state() == State::XRun
                && let Err(re) = self.capture.prepare().and_then(|()| self.capture.start())
            {
                warn!("{}", backend_rw_error(BACKEND, "capture", "recover", re));
            }
            self.capture_buf.silence();
            return Err(Error::Device(backend_rw_error(BACKEND, "capture", "read", e)));
        }
        for (ch, dst) in self.capture_channels.iter_mut().enumerate() {
            let dst = &mut dst[..frames];
            match &self.capture_buf {
                Interleaved::S16(buf) => deinterleave(buf, channels, ch, dst, i16_to_f32),
                Interleaved::S32(buf) => deinterleave(buf, channels, ch, dst, i32_to_f32),
            }
        }
        Ok(())
    }

    fn capture_channel(&self, channel: usize) -> &[f32] {
        self.capture_channels.get(channel).map_or(&[], |c| c.as_slice())
    }

    fn playback_channel(&mut self, channel: usize) -> &mut [f32] {
        self.playback_channels
            .get_mut(channel)
            .map_or(&mut [], |c| c.as_mut_slice())
    }

    fn write_playback(&mut self, frames: usize) -> Result<()> {
        let frames = frames.min(self.period);
        let channels = self.playback_channels.len();
        for (ch, src) in self.playback_channels.iter().enumerate() {
            let src = &src[..frames];
            match &mut self.playback_buf {
                Interleaved::S16(buf) => interleave(src, channels, ch, buf, f32_to_i16),
                Interleaved::S32(buf) => interleave(src, channels, ch, buf, f32_to_i32),
            }
        }
        let result = match &self.playback_buf {
            Interleaved::S16(buf) => self
                .playback
                .io_i16()
                .and_then(|io| io.writei(&buf[..frames * channels])),
            Interleaved::S32(buf) => self
                .playback
                .io_i32()
                .and_then(|io| io.writei(&buf[..frames * channels])),
        };
        if let Err(e) = result {
            if self.playback.state() == State::XRun
                && let Err(re) = self.playback.prepare()
            {
                warn!("{}", backend_rw_error(BACKEND, "playback", "recover", re));
            }
            return Err(Error::Device(backend_rw_error(BACKEND, "playback", "write", e)));
        }
        Ok(())
    }
}

fn prefill_silence(format: SampleFormat, period: usize, periods: usize, channels: usize) -> Interleaved {
    Interleaved::new(format, playback_prefill_frames(period, periods) * channels.max(1))
}

fn max_channels(pcm: &PCM) -> usize {
    let Ok(hwp) = HwParams::any(pcm) else {
        return 2;
    };
    if hwp.set_access(Access::RWInterleaved).is_err() {
        return 2;
    }
    hwp.get_channels_max().map(|v| v as usize).unwrap_or(2).max(1)
}

fn configure_pcm(
    pcm: &PCM,
    rate: u32,
    channels: usize,
    period_frames: usize,
    buffer_frames: usize,
) -> std::result::Result<(usize, SampleFormat), String> {
    let hwp = HwParams::any(pcm).map_err(|e| e.to_string())?;
    hwp.set_access(Access::RWInterleaved)
        .map_err(|e| e.to_string())?;
    let format = choose_best_format(&hwp)?;
    hwp.set_channels_near(channels.max(1) as u32)
        .map_err(|e| e.to_string())?;
    hwp.set_rate(rate, ValueOr::Nearest)
        .map_err(|e| e.to_string())?;
    hwp.set_period_size_near(period_frames as i64, ValueOr::Nearest)
        .map_err(|e| e.to_string())?;
    hwp.set_buffer_size_near(buffer_frames as i64)
        .map_err(|e| e.to_string())?;
    pcm.hw_params(&hwp).map_err(|e| e.to_string())?;

    let cur = pcm.hw_params_current().map_err(|e| e.to_string())?;
    let actual_period = cur.get_period_size().map_err(|e| e.to_string())?;
    if actual_period as usize != period_frames {
        return Err(format!(
            "period of {period_frames} frames not supported (device offers {actual_period})"
        ));
    }
    let actual_buffer = cur.get_buffer_size().map_err(|e| e.to_string())?;
    let swp = pcm.sw_params_current().map_err(|e| e.to_string())?;
    swp.set_start_threshold(actual_buffer.saturating_sub(actual_period))
        .map_err(|e| e.to_string())?;
    swp.set_avail_min(actual_period)
        .map_err(|e| e.to_string())?;
    pcm.sw_params(&swp).map_err(|e| e.to_string())?;

    let actual_channels = cur.get_channels().map_err(|e| e.to_string())? as usize;
    Ok((actual_channels.max(1), format))
}

fn choose_best_format(hwp: &HwParams<'_>) -> std::result::Result<SampleFormat, String> {
    match hwp.set_format(Format::s32()) {
        Ok(()) => Ok(SampleFormat::S32),
        Err(e32) => match hwp.set_format(Format::s16()) {
            Ok(()) => Ok(SampleFormat::S16),
            Err(e16) => Err(format!(
                "no supported integer PCM format (s32: {e32}; s16: {e16})"
            )),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefill_covers_every_period_of_every_channel() {
        let buf = prefill_silence(SampleFormat::S32, 256, 3, 2);
        assert_eq!(buf.len(), 256 * 3 * 2);
        let Interleaved::S32(samples) = &buf else {
            panic!("wrong format");
        };
        assert!(samples.iter().all(|&s| s == 0));
        assert_eq!(prefill_silence(SampleFormat::S16, 64, 2, 0).len(), 128);
    }
}
