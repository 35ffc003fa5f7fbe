use super::callbacks::{Control, NotificationHandler, ProcessHandler};
use super::{BackendShared, EngineState};
use crate::clock::MonotonicClock;
use crate::diag::{Diagnostic, DiagnosticSink};
use crate::hw::traits::HwDriver;
use crate::hw::{AnyDriver, config};
use crate::midi::buffer::MidiBuffer;
use crate::midi::io::{CycleTiming, MidiInputQueue, MidiOutputQueue};
use crate::port::{DataType, PortId};
use crate::registry::{ConnectionChange, PortRegistry, Snapshot};
use crate::sync::{Dll, SlaveExchange, SlaveLink};
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::{Duration, Instant};
use tracing::warn;

const WAIT_TIMEOUT: Duration = Duration::from_secs(1);
const FREEWHEEL_PAUSE: Duration = Duration::from_micros(100);
const PROFILE_INTERVAL: Duration = Duration::from_secs(1);
/// Loop bandwidth of the master clock estimate.
const MASTER_DLL_BANDWIDTH: f64 = 0.1;
const LOAD_SMOOTHING: f32 = 0.05;
const MAX_SLAVES: usize = 16;

/// The process handler's view of one cycle.
///
/// Port buffers are reached through `&mut self`, so a handler holds at most
/// one of them at a time:
///
/// ```compile_fail
/// # use rtport_engine::{PortId, ProcessScope};
/// fn alias(scope: &mut ProcessScope<'_>, port: PortId) {
///     let first = scope.audio_output(port).unwrap();
///     let second = scope.audio_output(port).unwrap();
///     first[0] = second[0];
/// }
/// ```
pub struct ProcessScope<'a> {
    snapshot: &'a Snapshot,
    n_frames: usize,
    cycle_start_us: u64,
    sample_time: u64,
    sample_rate: u32,
}

impl<'a> ProcessScope<'a> {
    pub(crate) fn new(
        snapshot: &'a Snapshot,
        n_frames: usize,
        cycle_start_us: u64,
        sample_time: u64,
        sample_rate: u32,
    ) -> Self {
        Self {
            snapshot,
            n_frames,
            cycle_start_us,
            sample_time,
            sample_rate,
        }
    }

    pub fn n_frames(&self) -> usize {
        self.n_frames
    }

    /// Monotonic time at which this cycle began, in microseconds.
    pub fn cycle_start_us(&self) -> u64 {
        self.cycle_start_us
    }

    /// Frames processed before this cycle.
    pub fn sample_time(&self) -> u64 {
        self.sample_time
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn snapshot(&self) -> &Snapshot {
        self.snapshot
    }

    /// Mix of every output connected to `port`. Mixing writes the port's own
    /// buffer, hence the exclusive borrow.
    pub fn audio_input(&mut self, port: PortId) -> Option<&[f32]> {
        self.snapshot.audio_input(port, self.n_frames)
    }

    pub fn audio_output(&mut self, port: PortId) -> Option<&mut [f32]> {
        self.snapshot.audio_output(port, self.n_frames)
    }

    pub fn midi_input(&mut self, port: PortId) -> Option<&MidiBuffer> {
        self.snapshot.midi_input(port)
    }

    pub fn midi_output(&mut self, port: PortId) -> Option<&mut MidiBuffer> {
        self.snapshot.midi_output(port)
    }
}

#[derive(Debug)]
struct Profiler {
    report_at: Instant,
    cycles: u32,
    total: Duration,
    max: Duration,
}

impl Profiler {
    fn new() -> Self {
        Self {
            report_at: Instant::now() + PROFILE_INTERVAL,
            cycles: 0,
            total: Duration::ZERO,
            max: Duration::ZERO,
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.cycles += 1;
        self.total += elapsed;
        self.max = self.max.max(elapsed);
    }

    fn maybe_report(&mut self, period: usize, sample_rate: u32, dsp_load: f32, diag: &mut DiagnosticSink) {
        let now = Instant::now();
        if now < self.report_at {
            return;
        }
        let avg_us = if self.cycles > 0 {
            self.total.as_secs_f32() * 1e6 / self.cycles as f32
        } else {
            0.0
        };
        diag.push(Diagnostic::Profile {
            expected_cps: sample_rate as f32 / period.max(1) as f32,
            cycles: self.cycles,
            avg_us,
            max_us: self.max.as_secs_f32() * 1e6,
            dsp_load,
        });
        self.report_at = now + PROFILE_INTERVAL;
        self.cycles = 0;
        self.total = Duration::ZERO;
        self.max = Duration::ZERO;
    }
}

/// Everything the process thread hands back when it exits.
pub(crate) struct RunnerExit {
    pub driver: AnyDriver,
    pub process: Box<dyn ProcessHandler>,
    pub notify: Box<dyn NotificationHandler>,
}

pub(crate) struct CycleRunner {
    pub driver: AnyDriver,
    pub registry: Arc<PortRegistry>,
    pub shared: Arc<BackendShared>,
    pub process: Box<dyn ProcessHandler>,
    pub notify: Box<dyn NotificationHandler>,
    pub audio_capture: Vec<PortId>,
    pub audio_playback: Vec<PortId>,
    pub midi_inputs: Vec<(PortId, MidiInputQueue)>,
    pub midi_outputs: Vec<(PortId, MidiOutputQueue)>,
    pub exchange: Arc<SlaveExchange>,
    pub clock: MonotonicClock,
    pub diag: DiagnosticSink,
}

struct Cycle {
    period: usize,
    period_us: u64,
    sample_rate: u32,
}

impl CycleRunner {
    pub fn run(mut self) -> RunnerExit {
        let period = self.driver.period_frames();
        let sample_rate = self.driver.sample_rate();
        let geometry = Cycle {
            period,
            period_us: crate::clock::frames_to_us(period, sample_rate),
            sample_rate,
        };
        let bailout = (2 * sample_rate as usize / period.max(1)).max(1) as u32;
        let mut dll = Dll::new(period, sample_rate, MASTER_DLL_BANDWIDTH);
        let mut profiler = config::profile_enabled().then(Profiler::new);
        let mut slaves: Vec<SlaveLink> = Vec::with_capacity(MAX_SLAVES);
        let mut changes: Vec<ConnectionChange> = Vec::with_capacity(64);
        let mut freewheeling = false;
        let mut errors = 0_u32;

        let started = self.driver.start();
        self.shared.mark_started(started.is_ok());
        if let Err(e) = started {
            self.halt(&format!("failed to start {}: {e}", self.driver.name()));
            return self.exit(&mut slaves);
        }

        while self.shared.run.load(Ordering::Acquire) {
            let want_freewheel = self.shared.freewheel.load(Ordering::Acquire);
            if want_freewheel != freewheeling {
                if let Err(e) = self.toggle_freewheel(want_freewheel) {
                    self.halt(&format!("freewheel switch failed: {e}"));
                    break;
                }
                freewheeling = want_freewheel;
                dll = Dll::new(period, sample_rate, MASTER_DLL_BANDWIDTH);
            }

            if freewheeling {
                if self.freewheel_cycle(&geometry, &mut slaves) == Control::Quit {
                    self.halt("process handler asked to stop");
                    break;
                }
                self.shared.dsp_load.store(1.0, Ordering::Relaxed);
                self.maintenance(&mut changes, &mut slaves);
                std::thread::sleep(FREEWHEEL_PAUSE);
                continue;
            }

            let mut quit = false;
            let mut trouble = false;
            match self.driver.wait(WAIT_TIMEOUT) {
                Ok(status) => {
                    if status.xrun {
                        self.shared.xruns.fetch_add(1, Ordering::Relaxed);
                        self.diag.push(Diagnostic::Xrun);
                        self.notify.xrun();
                        trouble = true;
                    }
                    let now = self.clock.now_us();
                    dll.observe(now, status.available);
                    let master_speed = dll.speed();
                    let mut available = status.available;
                    while available >= period {
                        let began = Instant::now();
                        match self.cycle(&geometry, master_speed, &mut slaves) {
                            Ok(Control::Continue) => {}
                            Ok(Control::Quit) => quit = true,
                            Err(_) => {
                                trouble = true;
                                self.diag.push(Diagnostic::DriverError {
                                    consecutive: errors + 1,
                                });
                            }
                        }
                        let elapsed = began.elapsed();
                        self.update_load(elapsed, geometry.period_us);
                        if let Some(p) = profiler.as_mut() {
                            p.record(elapsed);
                        }
                        available -= period;
                        if quit {
                            break;
                        }
                    }
                }
                Err(_) => {
                    trouble = true;
                    self.diag.push(Diagnostic::DriverError {
                        consecutive: errors + 1,
                    });
                }
            }
            errors = if trouble { errors + 1 } else { 0 };
            if quit {
                self.halt("process handler asked to stop");
                break;
            }
            if errors > bailout {
                self.halt(&format!(
                    "{} failed {errors} times in a row",
                    self.driver.name()
                ));
                break;
            }
            self.maintenance(&mut changes, &mut slaves);
            if let Some(p) = profiler.as_mut() {
                let load = self.shared.dsp_load.load(Ordering::Relaxed);
                p.maybe_report(period, sample_rate, load, &mut self.diag);
            }
        }

        if !freewheeling && let Err(e) = self.driver.stop() {
            warn!("{}: stop failed: {e}", self.driver.name());
        }
        self.exit(&mut slaves)
    }

    fn exit(self, slaves: &mut Vec<SlaveLink>) -> RunnerExit {
        self.exchange.retire_all(slaves);
        RunnerExit {
            driver: self.driver,
            process: self.process,
            notify: self.notify,
        }
    }

    fn halt(&mut self, reason: &str) {
        self.shared.set_state(EngineState::Stopping);
        self.shared.halted.store(true, Ordering::Release);
        self.notify.halted(reason);
    }

    fn toggle_freewheel(&mut self, enable: bool) -> crate::error::Result<()> {
        if enable {
            self.driver.stop()?;
            self.shared.set_state(EngineState::Freewheeling);
        } else {
            self.driver.start()?;
            self.shared.set_state(EngineState::Running);
        }
        self.notify.freewheel(enable);
        Ok(())
    }

    fn update_load(&self, elapsed: Duration, period_us: u64) {
        if period_us == 0 {
            return;
        }
        let load = (elapsed.as_secs_f32() * 1e6 / period_us as f32).min(1.0);
        let previous = self.shared.dsp_load.load(Ordering::Relaxed);
        let next = if load > previous {
            load
        } else {
            previous + LOAD_SMOOTHING * (load - previous)
        };
        self.shared.dsp_load.store(next, Ordering::Relaxed);
    }

    /// Clears the buffers of every client MIDI output so the handler starts
    /// each cycle empty.
    fn clear_midi_outputs(snapshot: &Snapshot) {
        for port in snapshot.iter() {
            if port.data_type() == DataType::Midi
                && port.is_output()
                && !port.is_physical()
                && let Some(buf) = snapshot.midi_output(port.id())
            {
                buf.clear();
            }
        }
    }

    fn cycle(
        &mut self,
        geometry: &Cycle,
        master_speed: f64,
        slaves: &mut [SlaveLink],
    ) -> crate::error::Result<Control> {
        let n = geometry.period;
        let cycle_start = self.clock.now_us();
        self.driver.read_capture(n)?;

        let snapshot = self.registry.snapshot();
        for (ch, id) in self.audio_capture.iter().enumerate() {
            if let Some(dst) = snapshot.audio_output(*id, n) {
                let src = self.driver.capture_channel(ch);
                let len = dst.len().min(src.len());
                dst[..len].copy_from_slice(&src[..len]);
            }
        }
        for link in slaves.iter_mut() {
            link.cycle_start(&snapshot, master_speed, &mut self.diag);
        }

        let timing = CycleTiming {
            start_us: cycle_start,
            period_us: geometry.period_us,
            frames: n,
            sample_rate: geometry.sample_rate,
        };
        for (id, queue) in self.midi_inputs.iter_mut() {
            if let Some(buf) = snapshot.midi_output(*id) {
                buf.clear();
                queue.recv_events(buf, &timing, &mut self.diag);
            }
        }
        Self::clear_midi_outputs(&snapshot);

        let sample_time = self.shared.sample_time.load(Ordering::Relaxed);
        let mut scope = ProcessScope::new(&snapshot, n, cycle_start, sample_time, geometry.sample_rate);
        let control = self.process.process(&mut scope);

        for (id, queue) in self.midi_outputs.iter_mut() {
            if let Some(buf) = snapshot.midi_input(*id) {
                queue.send_buffer(buf, &timing, &mut self.diag);
            }
        }
        for (ch, id) in self.audio_playback.iter().enumerate() {
            let dst = self.driver.playback_channel(ch);
            match snapshot.audio_input(*id, n) {
                Some(src) => {
                    let len = dst.len().min(src.len());
                    dst[..len].copy_from_slice(&src[..len]);
                }
                None => dst.fill(0.0),
            }
        }
        for link in slaves.iter_mut() {
            link.cycle_end(&snapshot, master_speed, &mut self.diag);
        }
        self.driver.write_playback(n)?;
        self.shared
            .sample_time
            .fetch_add(n as u64, Ordering::Relaxed);
        Ok(control)
    }

    fn freewheel_cycle(&mut self, geometry: &Cycle, slaves: &mut [SlaveLink]) -> Control {
        let n = geometry.period;
        let snapshot = self.registry.snapshot();
        for id in &self.audio_capture {
            if let Some(dst) = snapshot.audio_output(*id, n) {
                dst.fill(0.0);
            }
        }
        for link in slaves.iter_mut() {
            link.silence_ports(&snapshot);
        }
        for (id, queue) in self.midi_inputs.iter_mut() {
            queue.clear();
            if let Some(buf) = snapshot.midi_output(*id) {
                buf.clear();
            }
        }
        Self::clear_midi_outputs(&snapshot);
        let sample_time = self.shared.sample_time.load(Ordering::Relaxed);
        let mut scope = ProcessScope::new(
            &snapshot,
            n,
            self.clock.now_us(),
            sample_time,
            geometry.sample_rate,
        );
        let control = self.process.process(&mut scope);
        self.shared
            .sample_time
            .fetch_add(n as u64, Ordering::Relaxed);
        control
    }

    /// Work done between wakeups: deliver queued notifications and adopt or
    /// release slaves.
    fn maintenance(&mut self, changes: &mut Vec<ConnectionChange>, slaves: &mut Vec<SlaveLink>) {
        if let Some(flags) = self.registry.take_changes(changes) {
            let graph_changed = flags.registrations || !changes.is_empty();
            for change in changes.drain(..) {
                self.notify.port_connection_changed(
                    &change.source,
                    &change.destination,
                    change.connected,
                );
            }
            if flags.registrations {
                self.notify.port_registration_changed();
            }
            if graph_changed {
                self.notify.graph_order_changed();
            }
            if flags.latency {
                self.notify.latency_changed();
            }
        }
        if self.shared.device_list_changed.swap(false, Ordering::AcqRel) {
            self.notify.device_list_changed();
        }
        self.exchange.poll(slaves);
        for link in slaves.iter_mut() {
            if link.take_failure() {
                self.notify.slave_failed(link.name());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::port::PortFlags;

    #[test]
    fn scope_hands_out_one_buffer_at_a_time() {
        let reg = PortRegistry::new("system");
        let out = reg
            .register_port("out", DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap();
        let inp = reg
            .register_port("in", DataType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        reg.connect(out, inp).unwrap();
        let snapshot = reg.snapshot();
        let mut scope = ProcessScope::new(&snapshot, 16, 0, 0, 48_000);

        scope.audio_output(out).unwrap().fill(0.5);
        let mixed: f32 = scope.audio_input(inp).unwrap().iter().sum();
        assert_eq!(mixed, 8.0);
        scope.audio_output(out).unwrap()[0] = 1.0;
        assert_eq!(scope.audio_input(inp).unwrap()[0], 1.0);
        assert!(scope.audio_output(inp).is_none());
        assert!(scope.midi_input(inp).is_none());
    }
}
