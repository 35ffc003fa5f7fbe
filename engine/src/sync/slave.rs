//! A second audio device resampled onto the master device's clock.
//!
//! The slave device runs its own thread ([`SlaveWorker`]) that moves audio
//! between the device and two sets of per-channel rings, and tracks the
//! device's real rate with a DLL. The master's process thread owns the other
//! half ([`SlaveLink`]) and resamples across the clock domains once per
//! master cycle.
//!
//! Both sides share a phase:
//!
//! * `Running`: audio flows both ways.
//! * `Draining`: entered by whichever side hits an underrun or overflow.
//!   Each side empties the rings it reads from and outputs silence. After a
//!   number of quiet slave cycles the slave moves to `Priming`.
//! * `Priming`: the slave captures again. Once the capture rings hold enough
//!   audio the master queues silence for playback and moves to `Running`.

use super::dll::Dll;
use crate::clock::MonotonicClock;
use crate::config::SlaveConfig;
use crate::diag::{Diagnostic, DiagnosticSink};
use crate::error::{Error, Result};
use crate::hw::rt::spawn_rt_thread;
use crate::hw::traits::{HwDriver, WaitStatus};
use crate::port::{DataType, LatencyRange, PortFlags, PortId};
use crate::registry::{PortRegistry, Snapshot};
use crate::ringbuffer::{Consumer, Producer, ring_buffer};
use atomic_float::AtomicF64;
use rubato::{
    Resampler, SincFixedIn, SincFixedOut, SincInterpolationParameters, SincInterpolationType,
    WindowFunction,
};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;
use tracing::{debug, warn};

const WAIT_TIMEOUT: Duration = Duration::from_secs(1);
/// Proportional gain pulling ring fill back to its target.
const FILL_GAIN: f64 = 0.01;
/// Keeps requested ratios strictly inside the resampler's accepted range.
const RATIO_MARGIN: f64 = 0.999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SyncPhase {
    Running = 0,
    Draining = 1,
    Priming = 2,
}

impl SyncPhase {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => SyncPhase::Running,
            1 => SyncPhase::Draining,
            _ => SyncPhase::Priming,
        }
    }
}

#[derive(Debug)]
struct SlaveShared {
    name: String,
    phase: AtomicU8,
    slave_speed: AtomicF64,
    failed: AtomicBool,
    running: AtomicBool,
}

impl SlaveShared {
    fn phase(&self) -> SyncPhase {
        SyncPhase::from_u8(self.phase.load(Ordering::Acquire))
    }

    fn transition(&self, from: SyncPhase, to: SyncPhase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }
}

fn sinc_parameters() -> SincInterpolationParameters {
    SincInterpolationParameters {
        sinc_len: 256,
        f_cutoff: 0.95,
        interpolation: SincInterpolationType::Linear,
        oversampling_factor: 256,
        window: WindowFunction::BlackmanHarris2,
    }
}

fn clamp_ratio(ratio: f64, nominal: f64, max_relative: f64) -> f64 {
    let lo = nominal / max_relative / RATIO_MARGIN;
    let hi = nominal * max_relative * RATIO_MARGIN;
    if ratio.is_finite() {
        ratio.clamp(lo, hi)
    } else {
        nominal
    }
}

/// Master-side half, driven from the process thread.
pub struct SlaveLink {
    shared: Arc<SlaveShared>,
    capture_rx: Vec<Consumer<f32>>,
    playback_tx: Vec<Producer<f32>>,
    capture_resampler: Option<SincFixedOut<f32>>,
    playback_resampler: Option<SincFixedIn<f32>>,
    capture_in: Vec<Vec<f32>>,
    capture_out: Vec<Vec<f32>>,
    playback_in: Vec<Vec<f32>>,
    playback_out: Vec<Vec<f32>>,
    capture_ports: Vec<PortId>,
    playback_ports: Vec<PortId>,
    master_rate: u32,
    master_period: usize,
    slave_rate: u32,
    slave_period: usize,
    slave_latency: (LatencyRange, LatencyRange),
    prime_frames: usize,
    ring_frames: usize,
    max_ratio: f64,
    failure_reported: bool,
}

impl std::fmt::Debug for SlaveLink {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SlaveLink")
            .field("name", &self.shared.name)
            .field("phase", &self.shared.phase())
            .field("capture_channels", &self.capture_rx.len())
            .field("playback_channels", &self.playback_tx.len())
            .field("master_rate", &self.master_rate)
            .field("slave_rate", &self.slave_rate)
            .field("slave_period", &self.slave_period)
            .finish()
    }
}

/// Slave-side half, owning the slave device.
pub struct SlaveWorker<D: HwDriver> {
    shared: Arc<SlaveShared>,
    driver: D,
    dll: Dll,
    capture_tx: Vec<Producer<f32>>,
    playback_rx: Vec<Consumer<f32>>,
    period: usize,
    last_phase: SyncPhase,
    quiet: usize,
    quiet_periods: usize,
    bailout: u32,
    diag: DiagnosticSink,
}

/// Builds both halves for `driver`, which must already be open.
pub fn slave_pair<D: HwDriver>(
    config: &SlaveConfig,
    driver: D,
    master_rate: u32,
    master_period: usize,
    diag: DiagnosticSink,
) -> Result<(SlaveLink, SlaveWorker<D>)> {
    config.validate()?;
    let slave_rate = driver.sample_rate();
    let slave_period = driver.period_frames();
    if slave_rate == 0 || slave_period == 0 || master_rate == 0 || master_period == 0 {
        return Err(Error::Config(format!(
            "slave '{}': zero rate or period",
            config.name
        )));
    }
    let ring_frames = config.ring_periods * slave_period;
    let prime_frames = config.prime_periods * slave_period;
    let (capture_tx, capture_rx): (Vec<_>, Vec<_>) = (0..driver.input_channels())
        .map(|_| ring_buffer::<f32>(ring_frames))
        .unzip();
    let (playback_tx, playback_rx): (Vec<_>, Vec<_>) = (0..driver.output_channels())
        .map(|_| ring_buffer::<f32>(ring_frames))
        .unzip();

    let capture_ratio = master_rate as f64 / slave_rate as f64;
    let capture_resampler = if capture_rx.is_empty() {
        None
    } else {
        Some(SincFixedOut::<f32>::new(
            capture_ratio,
            config.max_ratio_relative,
            sinc_parameters(),
            master_period,
            capture_rx.len(),
        )?)
    };
    let playback_resampler = if playback_tx.is_empty() {
        None
    } else {
        Some(SincFixedIn::<f32>::new(
            1.0 / capture_ratio,
            config.max_ratio_relative,
            sinc_parameters(),
            master_period,
            playback_tx.len(),
        )?)
    };
    let capture_in_len = capture_resampler
        .as_ref()
        .map_or(0, |r| r.input_frames_max());
    let playback_out_len = playback_resampler
        .as_ref()
        .map_or(0, |r| r.output_frames_max());
    let per_cycle = capture_in_len.max(playback_out_len);
    if prime_frames + per_cycle > ring_frames {
        return Err(Error::Config(format!(
            "slave '{}': ring of {ring_frames} frames cannot prime {prime_frames} frames and carry a \
             {master_period}-frame master period",
            config.name
        )));
    }

    let shared = Arc::new(SlaveShared {
        name: config.name.clone(),
        phase: AtomicU8::new(SyncPhase::Priming as u8),
        slave_speed: AtomicF64::new(1.0),
        failed: AtomicBool::new(false),
        running: AtomicBool::new(true),
    });
    let link = SlaveLink {
        shared: shared.clone(),
        capture_in: vec![vec![0.0; capture_in_len]; capture_rx.len()],
        capture_out: vec![vec![0.0; master_period]; capture_rx.len()],
        playback_in: vec![vec![0.0; master_period]; playback_tx.len()],
        playback_out: vec![vec![0.0; playback_out_len]; playback_tx.len()],
        capture_rx,
        playback_tx,
        capture_resampler,
        playback_resampler,
        capture_ports: Vec::new(),
        playback_ports: Vec::new(),
        master_rate,
        master_period,
        slave_rate,
        slave_period,
        slave_latency: driver.latency_ranges(),
        prime_frames,
        ring_frames,
        max_ratio: config.max_ratio_relative,
        failure_reported: false,
    };
    let worker = SlaveWorker {
        shared,
        dll: Dll::new(slave_period, slave_rate, config.dll_bandwidth),
        capture_tx,
        playback_rx,
        period: slave_period,
        last_phase: SyncPhase::Priming,
        quiet: 0,
        quiet_periods: config.quiet_periods,
        bailout: (2 * slave_rate as usize / slave_period).max(1) as u32,
        diag,
        driver,
    };
    Ok((link, worker))
}

impl SlaveLink {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn phase(&self) -> SyncPhase {
        self.shared.phase()
    }

    /// Latest rate estimate published by the slave thread.
    pub fn slave_speed(&self) -> f64 {
        self.shared.slave_speed.load(Ordering::Relaxed)
    }

    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    /// True exactly once after the slave thread gave up.
    pub(crate) fn take_failure(&mut self) -> bool {
        if self.failure_reported || !self.has_failed() {
            return false;
        }
        self.failure_reported = true;
        true
    }

    pub fn capture_ports(&self) -> &[PortId] {
        &self.capture_ports
    }

    pub fn playback_ports(&self) -> &[PortId] {
        &self.playback_ports
    }

    /// Resampled capture audio of the current master cycle.
    pub fn capture_channel(&self, channel: usize) -> &[f32] {
        self.capture_out
            .get(channel)
            .map_or(&[], |c| &c[..self.master_period])
    }

    /// Staging buffer for the master's playback audio of this cycle.
    pub fn playback_channel(&mut self, channel: usize) -> &mut [f32] {
        let period = self.master_period;
        self.playback_in
            .get_mut(channel)
            .map_or(&mut [], |c| &mut c[..period])
    }

    /// Adds `system:capture_N` / `system:playback_N` ports numbered after the
    /// ones already present.
    pub fn register_ports(&mut self, registry: &PortRegistry) -> Result<()> {
        let to_master = |frames: usize| -> u32 {
            (frames as u64 * self.master_rate as u64 / self.slave_rate as u64) as u32
        };
        let ring_delay = to_master(self.prime_frames);
        let capture_latency =
            LatencyRange::fixed(to_master(self.slave_latency.0.max as usize) + ring_delay);
        let playback_latency =
            LatencyRange::fixed(to_master(self.slave_latency.1.max as usize) + ring_delay);
        let mut next = 1;
        for ch in 0..self.capture_rx.len() {
            while registry.port_by_name(&format!("capture_{next}")).is_some() {
                next += 1;
            }
            let id = registry.add_system_port(
                &format!("capture_{next}"),
                DataType::Audio,
                PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
                Some(format!("{} capture {}", self.shared.name, ch + 1)),
                Some(format!("{}:{}", self.shared.name, ch)),
                capture_latency,
            )?;
            self.capture_ports.push(id);
        }
        let mut next = 1;
        for ch in 0..self.playback_tx.len() {
            while registry.port_by_name(&format!("playback_{next}")).is_some() {
                next += 1;
            }
            let id = registry.add_system_port(
                &format!("playback_{next}"),
                DataType::Audio,
                PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
                Some(format!("{} playback {}", self.shared.name, ch + 1)),
                Some(format!("{}:{}", self.shared.name, ch)),
                playback_latency,
            )?;
            self.playback_ports.push(id);
        }
        Ok(())
    }

    pub fn unregister_ports(&mut self, registry: &PortRegistry) {
        for id in self.capture_ports.drain(..).chain(self.playback_ports.drain(..)) {
            if let Err(e) = registry.unregister_port(id) {
                warn!("slave {}: {e}", self.shared.name);
            }
        }
    }

    fn silence_capture(&mut self) {
        for buf in &mut self.capture_out {
            buf.fill(0.0);
        }
    }

    fn capture_fill(&self) -> usize {
        self.capture_rx
            .iter()
            .map(|rx| rx.read_space())
            .min()
            .unwrap_or(self.prime_frames)
    }

    fn playback_fill(&self) -> usize {
        self.playback_tx
            .iter()
            .map(|tx| tx.read_space())
            .max()
            .unwrap_or(self.prime_frames)
    }

    /// Relative deviation of a ring from its target fill.
    fn fill_error(&self, fill: usize) -> f64 {
        (fill as f64 - self.prime_frames as f64) / self.ring_frames.max(1) as f64
    }

    /// Output/input ratio for the capture direction.
    fn capture_ratio(&self, master_speed: f64) -> f64 {
        let slave_speed = self.slave_speed();
        let base = (self.master_rate as f64 * master_speed) / (self.slave_rate as f64 * slave_speed);
        base * (1.0 - FILL_GAIN * self.fill_error(self.capture_fill()))
    }

    fn playback_ratio(&self, master_speed: f64) -> f64 {
        let slave_speed = self.slave_speed();
        let base = (self.slave_rate as f64 * slave_speed) / (self.master_rate as f64 * master_speed);
        base * (1.0 - FILL_GAIN * self.fill_error(self.playback_fill()))
    }

    fn capture_ready(&self) -> bool {
        let lead = self
            .capture_resampler
            .as_ref()
            .map_or(0, |r| r.input_frames_max());
        self.capture_rx
            .iter()
            .all(|rx| rx.read_space() >= self.prime_frames + lead)
    }

    fn resume(&mut self, diag: &mut DiagnosticSink) {
        if let Some(r) = self.capture_resampler.as_mut() {
            r.reset();
        }
        if let Some(r) = self.playback_resampler.as_mut() {
            r.reset();
        }
        for tx in &mut self.playback_tx {
            tx.fill(0.0, self.prime_frames);
        }
        if self.shared.transition(SyncPhase::Priming, SyncPhase::Running) {
            diag.push(Diagnostic::SlaveResumed);
        }
    }

    /// Pulls one master period of capture audio. Returns whether real audio
    /// was produced; otherwise the capture channels hold silence.
    pub fn pull_capture(&mut self, master_speed: f64, diag: &mut DiagnosticSink) -> bool {
        if self.has_failed() {
            self.silence_capture();
            return false;
        }
        match self.shared.phase() {
            SyncPhase::Draining => {
                for rx in &mut self.capture_rx {
                    rx.discard();
                }
                self.silence_capture();
                false
            }
            SyncPhase::Priming => {
                self.silence_capture();
                if self.capture_ready() {
                    self.resume(diag);
                }
                false
            }
            SyncPhase::Running => {
                let nominal = self.master_rate as f64 / self.slave_rate as f64;
                let ratio = clamp_ratio(self.capture_ratio(master_speed), nominal, self.max_ratio);
                let Some(resampler) = self.capture_resampler.as_mut() else {
                    return true;
                };
                if resampler.set_resample_ratio(ratio, true).is_err() {
                    diag.push(Diagnostic::ResamplerError);
                }
                let needed = resampler.input_frames_next();
                if self.capture_rx.iter().any(|rx| rx.read_space() < needed) {
                    if self.shared.transition(SyncPhase::Running, SyncPhase::Draining) {
                        diag.push(Diagnostic::SlaveUnderrun);
                    }
                    self.silence_capture();
                    return false;
                }
                for (rx, buf) in self.capture_rx.iter_mut().zip(self.capture_in.iter_mut()) {
                    rx.read(&mut buf[..needed]);
                }
                match resampler.process_into_buffer(&self.capture_in, &mut self.capture_out, None) {
                    Ok((_, written)) if written == self.master_period => true,
                    _ => {
                        diag.push(Diagnostic::ResamplerError);
                        self.shared.transition(SyncPhase::Running, SyncPhase::Draining);
                        self.silence_capture();
                        false
                    }
                }
            }
        }
    }

    /// Resamples this cycle's playback staging buffers into the slave's rings.
    pub fn push_playback(&mut self, master_speed: f64, diag: &mut DiagnosticSink) -> bool {
        if self.has_failed() || self.shared.phase() != SyncPhase::Running {
            return false;
        }
        let nominal = self.slave_rate as f64 / self.master_rate as f64;
        let ratio = clamp_ratio(self.playback_ratio(master_speed), nominal, self.max_ratio);
        let Some(resampler) = self.playback_resampler.as_mut() else {
            return true;
        };
        if resampler.set_resample_ratio(ratio, true).is_err() {
            diag.push(Diagnostic::ResamplerError);
        }
        let produced = resampler.output_frames_next();
        if self.playback_tx.iter().any(|tx| tx.write_space() < produced) {
            if self.shared.transition(SyncPhase::Running, SyncPhase::Draining) {
                diag.push(Diagnostic::SlaveOverflow);
            }
            return false;
        }
        match resampler.process_into_buffer(&self.playback_in, &mut self.playback_out, None) {
            Ok((_, written)) => {
                for (tx, buf) in self.playback_tx.iter_mut().zip(self.playback_out.iter()) {
                    tx.write(&buf[..written]);
                }
                true
            }
            Err(_) => {
                diag.push(Diagnostic::ResamplerError);
                self.shared.transition(SyncPhase::Running, SyncPhase::Draining);
                false
            }
        }
    }

    /// Start of a master cycle: fills the slave's capture ports.
    pub(crate) fn cycle_start(
        &mut self,
        snapshot: &Snapshot,
        master_speed: f64,
        diag: &mut DiagnosticSink,
    ) {
        self.pull_capture(master_speed, diag);
        let n = self.master_period;
        for (id, buf) in self.capture_ports.iter().zip(self.capture_out.iter()) {
            if let Some(dst) = snapshot.audio_output(*id, n) {
                dst.copy_from_slice(&buf[..n]);
            }
        }
    }

    /// Freewheel cycle: the slave is not pulled, so its capture ports are
    /// silenced instead of repeating the last period it delivered.
    pub(crate) fn silence_ports(&mut self, snapshot: &Snapshot) {
        self.silence_capture();
        let n = self.master_period;
        for id in &self.capture_ports {
            if let Some(dst) = snapshot.audio_output(*id, n) {
                dst.fill(0.0);
            }
        }
    }

    /// End of a master cycle: sends the slave's playback ports.
    pub(crate) fn cycle_end(
        &mut self,
        snapshot: &Snapshot,
        master_speed: f64,
        diag: &mut DiagnosticSink,
    ) {
        let n = self.master_period;
        for (id, buf) in self.playback_ports.iter().zip(self.playback_in.iter_mut()) {
            match snapshot.audio_input(*id, n) {
                Some(src) => buf[..n].copy_from_slice(src),
                None => buf.fill(0.0),
            }
        }
        self.push_playback(master_speed, diag);
    }
}

impl<D: HwDriver> SlaveWorker<D> {
    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut D {
        &mut self.driver
    }

    pub fn speed(&self) -> f64 {
        self.dll.speed()
    }

    /// Handles one device wakeup at `now_us`: updates the rate estimate and
    /// transfers every whole period available. Returns `false` when the
    /// device reported an xrun.
    pub fn on_period(&mut self, now_us: u64, status: WaitStatus) -> Result<bool> {
        if status.xrun {
            self.diag.push(Diagnostic::Xrun);
        }
        self.dll.observe(now_us, status.available);
        self.shared
            .slave_speed
            .store(self.dll.speed(), Ordering::Relaxed);
        let mut available = status.available;
        while available >= self.period {
            self.cycle()?;
            available -= self.period;
        }
        Ok(!status.xrun)
    }

    fn silence_playback(&mut self) {
        for ch in 0..self.driver.output_channels() {
            self.driver.playback_channel(ch).fill(0.0);
        }
    }

    fn cycle(&mut self) -> Result<()> {
        let period = self.period;
        self.driver.read_capture(period)?;

        let phase = self.shared.phase();
        if phase != self.last_phase {
            self.quiet = 0;
            self.last_phase = phase;
            if phase == SyncPhase::Draining {
                self.diag.push(Diagnostic::SlaveDraining);
            }
        }

        if phase != SyncPhase::Draining {
            if self.capture_tx.iter().any(|tx| tx.write_space() < period) {
                if self.shared.transition(phase, SyncPhase::Draining) {
                    self.diag.push(Diagnostic::SlaveOverflow);
                }
            } else {
                for (ch, tx) in self.capture_tx.iter_mut().enumerate() {
                    let src = self.driver.capture_channel(ch);
                    tx.write(&src[..period.min(src.len())]);
                }
            }
        }

        match phase {
            SyncPhase::Running => {
                if self.playback_rx.iter().any(|rx| rx.read_space() < period) {
                    if self.shared.transition(SyncPhase::Running, SyncPhase::Draining) {
                        self.diag.push(Diagnostic::SlaveUnderrun);
                    }
                    self.silence_playback();
                } else {
                    for ch in 0..self.playback_rx.len() {
                        let dst = self.driver.playback_channel(ch);
                        let n = period.min(dst.len());
                        self.playback_rx[ch].read(&mut dst[..n]);
                    }
                }
            }
            SyncPhase::Priming => self.silence_playback(),
            SyncPhase::Draining => {
                for rx in &mut self.playback_rx {
                    rx.discard();
                }
                self.silence_playback();
                self.quiet += 1;
                if self.quiet >= self.quiet_periods {
                    self.shared
                        .transition(SyncPhase::Draining, SyncPhase::Priming);
                }
            }
        }

        self.driver.write_playback(period)
    }

    /// Runs the device loop until stopped or until more than two seconds'
    /// worth of consecutive periods failed.
    pub fn run(mut self, clock: MonotonicClock) {
        if let Err(e) = self.driver.start() {
            warn!("slave {}: {e}", self.shared.name);
            self.shared.failed.store(true, Ordering::Release);
            return;
        }
        let mut errors = 0_u32;
        while self.shared.running.load(Ordering::Acquire) {
            let clean = match self.driver.wait(WAIT_TIMEOUT) {
                Ok(status) => self.on_period(clock.now_us(), status).unwrap_or(false),
                Err(_) => false,
            };
            if clean {
                errors = 0;
                continue;
            }
            errors += 1;
            if errors > 1 {
                self.diag.push(Diagnostic::DriverError {
                    consecutive: errors,
                });
            }
            if errors > self.bailout {
                self.shared.failed.store(true, Ordering::Release);
                break;
            }
        }
        if let Err(e) = self.driver.stop() {
            debug!("slave {}: stop: {e}", self.shared.name);
        }
    }
}

impl<D: HwDriver + 'static> SlaveWorker<D> {
    pub fn spawn(self, clock: MonotonicClock, priority: Option<i32>) -> Result<SlaveThread> {
        let shared = self.shared.clone();
        let handle = spawn_rt_thread("rtport-slave", priority, move || self.run(clock))?;
        Ok(SlaveThread {
            shared,
            handle: Some(handle),
        })
    }
}

/// Control-side handle of a slave thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct SlaveThread {
    shared: Arc<SlaveShared>,
    handle: Option<JoinHandle<()>>,
}

impl SlaveThread {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    pub fn has_failed(&self) -> bool {
        self.shared.failed.load(Ordering::Acquire)
    }

    pub fn phase(&self) -> SyncPhase {
        self.shared.phase()
    }

    pub fn slave_speed(&self) -> f64 {
        self.shared.slave_speed.load(Ordering::Relaxed)
    }

    pub fn stop(&mut self) {
        self.shared.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for SlaveThread {
    fn drop(&mut self) {
        self.stop();
    }
}
