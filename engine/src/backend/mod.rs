//! The backend façade: owns the port registry, the device threads and the
//! process thread, and drives the engine lifecycle.

pub mod callbacks;
pub mod process;

pub use callbacks::{Control, NotificationHandler, ProcessHandler};
pub use process::ProcessScope;

use crate::clock::MonotonicClock;
use crate::config::{BackendConfig, MidiDeviceConfig, SlaveConfig};
use crate::diag::DiagnosticHub;
use crate::error::{Error, Result};
use crate::hw::latency::midi_latency;
use crate::hw::options::DriverKind;
use crate::hw::rt::{
    RT_PRIORITY_MIDI, RT_PRIORITY_PROCESS, RT_PRIORITY_SLAVE, lock_memory_pages, spawn_rt_thread,
};
use crate::hw::{AnyDriver, HwDriver, config as hw_config};
use crate::midi::io::{
    DEFAULT_MIDI_RING_BYTES, MemoryMidiPort, MidiInputQueue, MidiOutputQueue, MidiThread,
    RawMidiDevice, spawn_midi_input, spawn_midi_output,
};
use crate::port::{DataType, LatencyRange, PortFlags, PortId};
use crate::registry::{PortRegistry, SYSTEM_INSTANCE};
use crate::sync::{SlaveExchange, SlaveThread, SyncPhase, slave_pair};
use atomic_float::AtomicF32;
use parking_lot::{Condvar, Mutex};
use process::{CycleRunner, RunnerExit};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const START_TIMEOUT: Duration = Duration::from_secs(5);
const RETIRE_TIMEOUT: Duration = Duration::from_secs(2);
const LOOPBACK_BYTES: usize = 4096;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EngineState {
    Stopped,
    Starting,
    Running,
    Freewheeling,
    Stopping,
}

impl EngineState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            3 => Self::Freewheeling,
            4 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

#[derive(Debug)]
enum StartOutcome {
    Pending,
    Active,
    Failed,
}

/// State shared between the façade and the process thread.
#[derive(Debug)]
pub(crate) struct BackendShared {
    state: AtomicU8,
    pub run: AtomicBool,
    pub freewheel: AtomicBool,
    pub halted: AtomicBool,
    pub dsp_load: AtomicF32,
    pub sample_time: AtomicU64,
    pub xruns: AtomicU64,
    pub device_list_changed: AtomicBool,
    start: Mutex<StartOutcome>,
    start_cond: Condvar,
}

impl BackendShared {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(EngineState::Stopped as u8),
            run: AtomicBool::new(false),
            freewheel: AtomicBool::new(false),
            halted: AtomicBool::new(false),
            dsp_load: AtomicF32::new(0.0),
            sample_time: AtomicU64::new(0),
            xruns: AtomicU64::new(0),
            device_list_changed: AtomicBool::new(false),
            start: Mutex::new(StartOutcome::Pending),
            start_cond: Condvar::new(),
        }
    }

    pub fn state(&self) -> EngineState {
        EngineState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn set_state(&self, state: EngineState) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Called once by the process thread after its driver started, or failed to.
    pub fn mark_started(&self, ok: bool) {
        if ok {
            self.set_state(EngineState::Running);
        }
        *self.start.lock() = if ok {
            StartOutcome::Active
        } else {
            StartOutcome::Failed
        };
        self.start_cond.notify_all();
    }

    fn reset_start(&self) {
        *self.start.lock() = StartOutcome::Pending;
    }

    /// `None` on timeout.
    fn wait_started(&self, timeout: Duration) -> Option<bool> {
        let deadline = Instant::now() + timeout;
        let mut outcome = self.start.lock();
        loop {
            match *outcome {
                StartOutcome::Active => return Some(true),
                StartOutcome::Failed => return Some(false),
                StartOutcome::Pending => {
                    if self.start_cond.wait_until(&mut outcome, deadline).timed_out() {
                        return match *outcome {
                            StartOutcome::Active => Some(true),
                            StartOutcome::Failed => Some(false),
                            StartOutcome::Pending => None,
                        };
                    }
                }
            }
        }
    }
}

/// Reports device arrival or removal from any thread. The engine calls
/// `NotificationHandler::device_list_changed` at its next safe point.
#[derive(Debug, Clone)]
pub struct DeviceListNotifier {
    shared: Arc<BackendShared>,
}

impl DeviceListNotifier {
    pub fn notify(&self) {
        self.shared.device_list_changed.store(true, Ordering::Release);
    }
}

struct Session {
    process: JoinHandle<RunnerExit>,
    midi_threads: Vec<MidiThread>,
    slave_threads: Vec<SlaveThread>,
    exchange: Arc<SlaveExchange>,
    system_ports: Vec<PortId>,
    sample_rate: u32,
    period: usize,
}

/// Everything started alongside the process thread, torn down in one place
/// when startup fails part way.
#[derive(Default)]
struct Devices {
    midi_threads: Vec<MidiThread>,
    midi_inputs: Vec<(PortId, MidiInputQueue)>,
    midi_outputs: Vec<(PortId, MidiOutputQueue)>,
    slave_threads: Vec<SlaveThread>,
    ports: Vec<PortId>,
}

pub struct Backend {
    config: BackendConfig,
    registry: Arc<PortRegistry>,
    shared: Arc<BackendShared>,
    hub: Arc<DiagnosticHub>,
    clock: MonotonicClock,
    process: Option<Box<dyn ProcessHandler>>,
    notify: Option<Box<dyn NotificationHandler>>,
    session: Option<Session>,
}

impl std::fmt::Debug for Backend {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Backend")
            .field("state", &self.state())
            .field("config", &self.config)
            .field("ports", &self.registry.snapshot().len())
            .finish()
    }
}

impl Backend {
    pub fn new(config: BackendConfig) -> Self {
        Self {
            config,
            registry: Arc::new(PortRegistry::new(SYSTEM_INSTANCE)),
            shared: Arc::new(BackendShared::new()),
            hub: Arc::new(DiagnosticHub::new()),
            clock: MonotonicClock::new(),
            process: Some(Box::new(callbacks::Silence)),
            notify: Some(Box::new(())),
            session: None,
        }
    }

    pub fn config(&self) -> &BackendConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<PortRegistry> {
        &self.registry
    }

    pub fn set_process_handler(&mut self, handler: impl ProcessHandler) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.process = Some(Box::new(handler));
        Ok(())
    }

    pub fn set_notification_handler(&mut self, handler: impl NotificationHandler) -> Result<()> {
        if self.session.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.notify = Some(Box::new(handler));
        Ok(())
    }

    /// Takes the process handler back, leaving silence in its place. Only
    /// possible while stopped.
    pub fn take_process_handler(&mut self) -> Option<Box<dyn ProcessHandler>> {
        if self.session.is_some() {
            return None;
        }
        self.process.replace(Box::new(callbacks::Silence))
    }

    pub fn take_notification_handler(&mut self) -> Option<Box<dyn NotificationHandler>> {
        if self.session.is_some() {
            return None;
        }
        self.notify.replace(Box::new(()))
    }

    pub fn state(&self) -> EngineState {
        self.shared.state()
    }

    pub fn is_running(&self) -> bool {
        self.session.is_some() && !self.shared.halted.load(Ordering::Acquire)
    }

    /// Smoothed share of each period spent processing, 0.0..=1.0.
    pub fn dsp_load(&self) -> f32 {
        self.shared.dsp_load.load(Ordering::Relaxed)
    }

    pub fn sample_time(&self) -> u64 {
        self.shared.sample_time.load(Ordering::Relaxed)
    }

    pub fn xrun_count(&self) -> u64 {
        self.shared.xruns.load(Ordering::Relaxed)
    }

    pub fn sample_rate(&self) -> u32 {
        self.session
            .as_ref()
            .map_or(self.config.driver.sample_rate, |s| s.sample_rate)
    }

    pub fn buffer_size(&self) -> usize {
        self.session
            .as_ref()
            .map_or(self.config.driver.period_frames, |s| s.period)
    }

    /// Audio and MIDI ports registered for the master device.
    pub fn system_ports(&self) -> Vec<PortId> {
        self.session
            .as_ref()
            .map(|s| s.system_ports.clone())
            .unwrap_or_default()
    }

    pub fn device_list_notifier(&self) -> DeviceListNotifier {
        DeviceListNotifier {
            shared: self.shared.clone(),
        }
    }

    pub fn diagnostics(&self) -> Arc<DiagnosticHub> {
        self.hub.clone()
    }

    /// Logs everything the realtime threads reported since the last call.
    pub fn drain_diagnostics(&self) -> usize {
        self.hub.drain()
    }

    /// Opens the configured device and starts the engine.
    pub fn start(&mut self) -> Result<()> {
        self.reap_halted()?;
        if self.session.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.config.validate()?;
        let driver = AnyDriver::open(&self.config.driver)?;
        self.start_with_driver(driver)
    }

    /// Starts the engine on an already opened device. Its rate and period
    /// win over the configured ones.
    pub fn start_with_driver(&mut self, driver: impl Into<AnyDriver>) -> Result<()> {
        self.reap_halted()?;
        if self.session.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.config.validate()?;
        let driver = driver.into();
        self.shared.set_state(EngineState::Starting);
        match self.launch(driver) {
            Ok(session) => {
                info!(
                    "{} running at {} Hz, {} frames x {} periods",
                    SYSTEM_INSTANCE, session.sample_rate, session.period, self.config.driver.periods
                );
                self.session = Some(session);
                Ok(())
            }
            Err(e) => {
                self.shared.set_state(EngineState::Stopped);
                error!("failed to start: {e}");
                Err(e)
            }
        }
    }

    fn launch(&mut self, driver: AnyDriver) -> Result<Session> {
        let leftovers = self.registry.unregister_system_ports();
        if leftovers > 0 {
            warn!("removed {leftovers} system ports left over from a previous run");
        }
        if self.config.lock_memory && !hw_config::realtime_disabled() {
            if let Err(e) = lock_memory_pages() {
                warn!("could not lock memory: {e}");
            }
        }

        let sample_rate = driver.sample_rate();
        let period = driver.period_frames();
        let mut devices = Devices::default();
        let exchange = Arc::new(SlaveExchange::new());
        if let Err(e) = self.open_devices(&driver, &exchange, &mut devices) {
            self.teardown(devices, &exchange);
            return Err(e);
        }
        let system_ports = devices.ports.clone();

        self.shared.run.store(true, Ordering::Release);
        self.shared.halted.store(false, Ordering::Release);
        self.shared.freewheel.store(false, Ordering::Release);
        self.shared.dsp_load.store(0.0, Ordering::Relaxed);
        self.shared.reset_start();

        let runner = CycleRunner {
            driver,
            registry: self.registry.clone(),
            shared: self.shared.clone(),
            process: self
                .process
                .take()
                .unwrap_or_else(|| Box::new(callbacks::Silence)),
            notify: self.notify.take().unwrap_or_else(|| Box::new(())),
            audio_capture: self.ports_named("capture_", &devices.ports),
            audio_playback: self.ports_named("playback_", &devices.ports),
            midi_inputs: std::mem::take(&mut devices.midi_inputs),
            midi_outputs: std::mem::take(&mut devices.midi_outputs),
            exchange: exchange.clone(),
            clock: self.clock,
            diag: self.hub.register("process"),
        };
        let handle = match spawn_rt_thread("rtport-process", self.config.rt_priority, move || {
            runner.run()
        }) {
            Ok(handle) => handle,
            Err(e) => {
                self.shared.run.store(false, Ordering::Release);
                self.teardown(devices, &exchange);
                return Err(e);
            }
        };

        match self.shared.wait_started(START_TIMEOUT) {
            Some(true) => Ok(Session {
                process: handle,
                midi_threads: devices.midi_threads,
                slave_threads: devices.slave_threads,
                exchange,
                system_ports,
                sample_rate,
                period,
            }),
            outcome => {
                self.shared.run.store(false, Ordering::Release);
                self.join_process(handle);
                self.teardown(devices, &exchange);
                match outcome {
                    None => Err(Error::StartTimeout(START_TIMEOUT)),
                    _ => Err(Error::Device(format!(
                        "{} failed to start",
                        self.config.driver.device
                    ))),
                }
            }
        }
    }

    /// Keeps device threads the same distance below the process thread as
    /// their default priorities are.
    fn thread_priority(&self, nominal: i32) -> Option<i32> {
        self.config
            .rt_priority
            .map(|p| (p - (RT_PRIORITY_PROCESS - nominal)).max(1))
    }

    /// Master capture or playback ports, in channel order.
    fn ports_named(&self, prefix: &str, ports: &[PortId]) -> Vec<PortId> {
        let snapshot = self.registry.snapshot();
        ports
            .iter()
            .copied()
            .filter(|id| {
                snapshot.port(*id).is_some_and(|p| {
                    p.data_type() == DataType::Audio
                        && p.name()
                            .strip_prefix(&format!("{SYSTEM_INSTANCE}:"))
                            .is_some_and(|n| n.starts_with(prefix))
                })
            })
            .collect()
    }

    fn open_devices(
        &mut self,
        driver: &AnyDriver,
        exchange: &Arc<SlaveExchange>,
        devices: &mut Devices,
    ) -> Result<()> {
        let period = driver.period_frames();
        let (capture_latency, playback_latency) = driver.latency_ranges();
        for ch in 0..driver.input_channels() {
            let id = self.registry.add_system_port(
                &format!("capture_{}", ch + 1),
                DataType::Audio,
                PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
                None,
                Some(format!("{}:{ch}", driver.name())),
                capture_latency,
            )?;
            devices.ports.push(id);
        }
        for ch in 0..driver.output_channels() {
            let id = self.registry.add_system_port(
                &format!("playback_{}", ch + 1),
                DataType::Audio,
                PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
                None,
                Some(format!("{}:{ch}", driver.name())),
                playback_latency,
            )?;
            devices.ports.push(id);
        }

        let midi_priority = self.thread_priority(RT_PRIORITY_MIDI);
        let latency = midi_latency(period);
        if driver.kind() == DriverKind::Dummy {
            for i in 1..=self.config.driver.dummy.midi_ports {
                let pipe = MemoryMidiPort::new(format!("dummy_{i}"), LOOPBACK_BYTES);
                let suffix = format!("dummy_{i}");
                self.open_midi_input(
                    Box::new(pipe.clone()),
                    &suffix,
                    None,
                    latency,
                    midi_priority,
                    devices,
                )?;
                self.open_midi_output(Box::new(pipe), &suffix, None, latency, midi_priority, devices)?;
            }
        }
        let midi_devices = self.config.midi_devices.clone();
        for device in &midi_devices {
            self.open_midi_device(device, latency, midi_priority, devices)?;
        }

        let slave_priority = self.thread_priority(RT_PRIORITY_SLAVE);
        let slaves = self.config.slaves.clone();
        for slave in &slaves {
            let thread = self.open_slave(
                slave,
                driver.sample_rate(),
                period,
                exchange,
                slave_priority,
            )?;
            devices.slave_threads.push(thread);
        }
        Ok(())
    }

    #[cfg(unix)]
    fn open_midi_device(
        &mut self,
        device: &MidiDeviceConfig,
        latency: LatencyRange,
        priority: Option<i32>,
        devices: &mut Devices,
    ) -> Result<()> {
        use crate::midi::io::RawMidiFile;
        let suffix = device.port_suffix();
        if device.input {
            let input = RawMidiFile::open_input(&device.path)?;
            self.open_midi_input(
                Box::new(input),
                &suffix,
                Some(device.path.clone()),
                latency,
                priority,
                devices,
            )?;
        }
        if device.output {
            let output = RawMidiFile::open_output(&device.path)?;
            self.open_midi_output(
                Box::new(output),
                &suffix,
                Some(device.path.clone()),
                latency,
                priority,
                devices,
            )?;
        }
        Ok(())
    }

    #[cfg(not(unix))]
    fn open_midi_device(
        &mut self,
        device: &MidiDeviceConfig,
        _latency: LatencyRange,
        _priority: Option<i32>,
        _devices: &mut Devices,
    ) -> Result<()> {
        Err(Error::Config(format!(
            "raw MIDI device {} is not supported on this platform",
            device.path
        )))
    }

    fn open_midi_input(
        &mut self,
        device: Box<dyn RawMidiDevice>,
        suffix: &str,
        hw_name: Option<String>,
        latency: LatencyRange,
        priority: Option<i32>,
        devices: &mut Devices,
    ) -> Result<()> {
        let id = self.registry.add_system_port(
            &format!("midi_capture_{suffix}"),
            DataType::Midi,
            PortFlags::IS_OUTPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
            Some(suffix.to_string()),
            hw_name,
            latency,
        )?;
        devices.ports.push(id);
        let diag = self.hub.register(&format!("midi-in {suffix}"));
        let (thread, queue) =
            spawn_midi_input(device, self.clock, DEFAULT_MIDI_RING_BYTES, diag, priority)?;
        devices.midi_threads.push(thread);
        devices.midi_inputs.push((id, queue));
        Ok(())
    }

    fn open_midi_output(
        &mut self,
        device: Box<dyn RawMidiDevice>,
        suffix: &str,
        hw_name: Option<String>,
        latency: LatencyRange,
        priority: Option<i32>,
        devices: &mut Devices,
    ) -> Result<()> {
        let id = self.registry.add_system_port(
            &format!("midi_playback_{suffix}"),
            DataType::Midi,
            PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL,
            Some(suffix.to_string()),
            hw_name,
            latency,
        )?;
        devices.ports.push(id);
        let diag = self.hub.register(&format!("midi-out {suffix}"));
        let (thread, queue) =
            spawn_midi_output(device, self.clock, DEFAULT_MIDI_RING_BYTES, diag, priority)?;
        devices.midi_threads.push(thread);
        devices.midi_outputs.push((id, queue));
        Ok(())
    }

    fn open_slave(
        &self,
        config: &SlaveConfig,
        master_rate: u32,
        master_period: usize,
        exchange: &SlaveExchange,
        priority: Option<i32>,
    ) -> Result<SlaveThread> {
        let driver = AnyDriver::open(&config.driver)?;
        let diag = self.hub.register(&format!("slave {}", config.name));
        let (mut link, worker) = slave_pair(config, driver, master_rate, master_period, diag)?;
        link.register_ports(&self.registry)?;
        let thread = match worker.spawn(self.clock, priority) {
            Ok(thread) => thread,
            Err(e) => {
                link.unregister_ports(&self.registry);
                return Err(e);
            }
        };
        info!(
            "slave {}: {} capture, {} playback ports",
            config.name,
            link.capture_ports().len(),
            link.playback_ports().len()
        );
        exchange.add(link);
        Ok(thread)
    }

    fn teardown(&mut self, mut devices: Devices, exchange: &SlaveExchange) {
        for mut link in exchange.reclaim_all() {
            link.unregister_ports(&self.registry);
        }
        for thread in devices.slave_threads.iter_mut() {
            thread.stop();
        }
        for thread in devices.midi_threads.iter_mut() {
            thread.stop();
        }
        for id in devices.ports.drain(..) {
            if let Err(e) = self.registry.unregister_port(id) {
                debug!("cleanup: {e}");
            }
        }
        self.hub.drain();
    }

    fn join_process(&mut self, handle: JoinHandle<RunnerExit>) {
        match handle.join() {
            Ok(exit) => {
                self.process = Some(exit.process);
                self.notify = Some(exit.notify);
                drop(exit.driver);
            }
            Err(_) => {
                error!("process thread panicked; handlers were lost");
                self.process = Some(Box::new(callbacks::Silence));
                self.notify = Some(Box::new(()));
            }
        }
    }

    /// An engine that halted on its own still holds its threads; release
    /// them before anything else touches the devices.
    fn reap_halted(&mut self) -> Result<()> {
        if self.session.is_some() && self.shared.halted.load(Ordering::Acquire) {
            info!("reaping halted engine");
            self.stop()?;
        }
        Ok(())
    }

    /// Stops every thread and removes the system ports. Blocks for at most
    /// about one driver wait timeout.
    pub fn stop(&mut self) -> Result<()> {
        let Some(session) = self.session.take() else {
            return Err(Error::NotRunning);
        };
        self.shared.set_state(EngineState::Stopping);
        self.shared.run.store(false, Ordering::Release);
        self.join_process(session.process);
        let devices = Devices {
            midi_threads: session.midi_threads,
            slave_threads: session.slave_threads,
            ports: session.system_ports,
            ..Default::default()
        };
        self.teardown(devices, &session.exchange);
        self.shared.freewheel.store(false, Ordering::Release);
        self.shared.set_state(EngineState::Stopped);
        info!("stopped");
        Ok(())
    }

    /// Switches between hardware-paced and as-fast-as-possible processing.
    pub fn freewheel(&mut self, enable: bool) -> Result<()> {
        if !self.is_running() {
            return Err(Error::NotRunning);
        }
        self.shared.freewheel.store(enable, Ordering::Release);
        Ok(())
    }

    pub fn set_buffer_size(&mut self, frames: usize) -> Result<()> {
        self.reconfigure(|config| config.driver.period_frames = frames, |notify, config| {
            notify.buffer_size_changed(config.driver.period_frames)
        })
    }

    pub fn set_sample_rate(&mut self, sample_rate: u32) -> Result<()> {
        self.reconfigure(|config| config.driver.sample_rate = sample_rate, |notify, config| {
            notify.sample_rate_changed(config.driver.sample_rate)
        })
    }

    /// Applies `change`, restarting a running engine. On failure the previous
    /// configuration is restored and, if it was running, restarted.
    fn reconfigure(
        &mut self,
        change: impl FnOnce(&mut BackendConfig),
        announce: impl Fn(&mut dyn NotificationHandler, &BackendConfig),
    ) -> Result<()> {
        self.reap_halted()?;
        let previous = self.config.clone();
        let mut next = previous.clone();
        change(&mut next);
        next.validate()?;
        if next == previous {
            return Ok(());
        }
        let was_running = self.session.is_some();
        if was_running {
            self.stop()?;
        }
        self.config = next;
        if let Some(notify) = self.notify.as_deref_mut() {
            announce(notify, &self.config);
        }
        if !was_running {
            return Ok(());
        }
        match self.start() {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!("restoring previous configuration after: {e}");
                self.config = previous;
                if let Some(notify) = self.notify.as_deref_mut() {
                    announce(notify, &self.config);
                }
                if let Err(again) = self.start() {
                    error!("previous configuration failed to restart: {again}");
                }
                Err(e)
            }
        }
    }

    /// Phase and rate estimate of a running slave.
    pub fn slave_status(&self, name: &str) -> Option<(SyncPhase, f64)> {
        let session = self.session.as_ref()?;
        let thread = session.slave_threads.iter().find(|t| t.name() == name)?;
        Some((thread.phase(), thread.slave_speed()))
    }

    pub fn slave_failed(&self, name: &str) -> bool {
        self.session.as_ref().is_some_and(|s| {
            s.slave_threads
                .iter()
                .any(|t| t.name() == name && t.has_failed())
        })
    }

    /// Adds a slave device, starting it right away when the engine runs.
    pub fn add_slave(&mut self, config: SlaveConfig) -> Result<()> {
        config.validate()?;
        if self.config.slaves.iter().any(|s| s.name == config.name) {
            return Err(Error::Config(format!(
                "slave name '{}' used twice",
                config.name
            )));
        }
        if let Some(session) = self.session.as_ref() {
            let priority = self.thread_priority(RT_PRIORITY_SLAVE);
            let thread = self.open_slave(
                &config,
                session.sample_rate,
                session.period,
                &session.exchange,
                priority,
            )?;
            if let Some(session) = self.session.as_mut() {
                session.slave_threads.push(thread);
            }
        }
        self.config.slaves.push(config);
        Ok(())
    }

    pub fn remove_slave(&mut self, name: &str) -> Result<()> {
        let Some(index) = self.config.slaves.iter().position(|s| s.name == name) else {
            return Err(Error::Config(format!("no slave named '{name}'")));
        };
        self.config.slaves.remove(index);
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        session.exchange.request_removal(name);
        let deadline = Instant::now() + RETIRE_TIMEOUT;
        let link = loop {
            if let Some(link) = session.exchange.take_retired(name) {
                break Some(link);
            }
            if Instant::now() >= deadline {
                break None;
            }
            std::thread::sleep(Duration::from_millis(5));
        };
        if let Some(index) = session.slave_threads.iter().position(|t| t.name() == name) {
            session.slave_threads.swap_remove(index).stop();
        }
        match link {
            Some(mut link) => link.unregister_ports(&self.registry),
            None => warn!("slave {name}: process thread did not release it; ports stay until stop"),
        }
        Ok(())
    }
}

impl Drop for Backend {
    fn drop(&mut self) {
        if self.session.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hw::DummyDriver;
    use crate::hw::options::{DriverOptions, DummyOptions, Generator};
    use std::sync::atomic::AtomicU32;
    use std::sync::mpsc;

    fn config() -> BackendConfig {
        BackendConfig {
            driver: DriverOptions {
                period_frames: 64,
                input_channels: 2,
                output_channels: 2,
                dummy: DummyOptions {
                    realtime: true,
                    midi_ports: 1,
                    ..Default::default()
                },
                ..Default::default()
            },
            rt_priority: None,
            ..Default::default()
        }
    }

    #[test]
    fn start_registers_system_ports_and_stop_removes_them() {
        let mut backend = Backend::new(config());
        backend.start().unwrap();
        assert_eq!(backend.state(), EngineState::Running);
        let reg = backend.registry().clone();
        for name in [
            "system:capture_1",
            "system:capture_2",
            "system:playback_1",
            "system:playback_2",
            "system:midi_capture_dummy_1",
            "system:midi_playback_dummy_1",
        ] {
            assert!(reg.port_by_name(name).is_some(), "{name}");
        }
        assert_eq!(backend.system_ports().len(), 6);
        assert!(matches!(backend.start(), Err(Error::AlreadyRunning)));
        backend.stop().unwrap();
        assert_eq!(backend.state(), EngineState::Stopped);
        assert!(reg.port_by_name("system:capture_1").is_none());
        assert!(matches!(backend.stop(), Err(Error::NotRunning)));
    }

    #[test]
    fn invalid_config_fails_before_any_thread_starts() {
        let mut bad = config();
        bad.driver.sample_rate = 1_000;
        let mut backend = Backend::new(bad);
        assert!(matches!(backend.start(), Err(Error::Config(_))));
        assert_eq!(backend.state(), EngineState::Stopped);
        assert!(backend.registry().snapshot().is_empty());
    }

    #[test]
    fn process_handler_quitting_halts_the_engine() {
        struct Halted(mpsc::Sender<String>);
        impl NotificationHandler for Halted {
            fn halted(&mut self, reason: &str) {
                let _ = self.0.send(reason.to_string());
            }
        }
        let (tx, rx) = mpsc::channel();
        let mut backend = Backend::new(config());
        let mut cycles = 0;
        backend
            .set_process_handler(move |_: &mut ProcessScope<'_>| {
                cycles += 1;
                if cycles == 3 { Control::Quit } else { Control::Continue }
            })
            .unwrap();
        backend.set_notification_handler(Halted(tx)).unwrap();
        backend.start().unwrap();
        let reason = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert!(reason.contains("process handler"));
        assert_eq!(backend.state(), EngineState::Stopping);
        assert!(!backend.is_running());
        // A halted engine is reaped by the next start.
        backend.start().unwrap();
        backend.stop().unwrap();
    }

    #[test]
    fn buffer_size_change_restarts_or_restores() {
        struct Sizes(mpsc::Sender<usize>);
        impl NotificationHandler for Sizes {
            fn buffer_size_changed(&mut self, frames: usize) {
                let _ = self.0.send(frames);
            }
        }
        let (tx, rx) = mpsc::channel();
        let mut backend = Backend::new(config());
        backend.set_notification_handler(Sizes(tx)).unwrap();
        backend.start().unwrap();
        backend.set_buffer_size(128).unwrap();
        assert_eq!(rx.try_recv().unwrap(), 128);
        assert_eq!(backend.buffer_size(), 128);
        assert!(backend.is_running());

        assert!(matches!(backend.set_buffer_size(3), Err(Error::Config(_))));
        assert_eq!(backend.buffer_size(), 128);
        assert!(backend.is_running());
        backend.stop().unwrap();
    }

    #[test]
    fn failed_restart_restores_the_previous_buffer_size() {
        struct Sizes(mpsc::Sender<usize>);
        impl NotificationHandler for Sizes {
            fn buffer_size_changed(&mut self, frames: usize) {
                let _ = self.0.send(frames);
            }
        }
        let (tx, rx) = mpsc::channel();
        let mut backend = Backend::new(config());
        // A 512-frame slave ring cannot carry a 1024-frame master period,
        // which only shows once the slave is opened against the new size.
        backend
            .add_slave(SlaveConfig {
                name: "usb".to_string(),
                driver: DriverOptions {
                    period_frames: 64,
                    input_channels: 1,
                    output_channels: 1,
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        backend.set_notification_handler(Sizes(tx)).unwrap();
        backend.start().unwrap();
        let previous = backend.config().clone();

        let err = backend.set_buffer_size(1024).unwrap_err();
        assert!(matches!(err, Error::Config(_)), "{err}");
        assert_eq!(backend.config(), &previous);
        assert_eq!(backend.buffer_size(), 64);
        assert_eq!(backend.state(), EngineState::Running);
        assert!(backend.slave_status("usb").is_some());
        assert_eq!(rx.try_iter().collect::<Vec<_>>(), vec![1024, 64]);
        backend.stop().unwrap();
    }

    #[test]
    fn freewheel_runs_without_the_device() {
        let mut backend = Backend::new(config());
        backend.start().unwrap();
        backend.freewheel(true).unwrap();
        let deadline = Instant::now() + Duration::from_secs(2);
        while backend.state() != EngineState::Freewheeling && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(backend.state(), EngineState::Freewheeling);
        let before = backend.sample_time();
        std::thread::sleep(Duration::from_millis(20));
        assert!(backend.sample_time() > before + 64 * 10);
        backend.freewheel(false).unwrap();
        backend.stop().unwrap();
    }

    #[test]
    fn freewheel_silences_slave_capture() {
        let mut backend = Backend::new(config());
        backend
            .add_slave(SlaveConfig {
                name: "usb".to_string(),
                driver: DriverOptions {
                    period_frames: 128,
                    input_channels: 1,
                    output_channels: 1,
                    dummy: DummyOptions {
                        generator: Generator::Sine {
                            frequency: 1_000.0,
                            amplitude: 0.5,
                        },
                        ..Default::default()
                    },
                    ..Default::default()
                },
                ..Default::default()
            })
            .unwrap();
        let reg = backend.registry().clone();
        let monitor = reg
            .register_port("monitor", DataType::Audio, PortFlags::IS_INPUT)
            .unwrap();
        let peak = Arc::new(AtomicU32::new(0));
        let seen = peak.clone();
        backend
            .set_process_handler(move |scope: &mut ProcessScope<'_>| {
                if let Some(input) = scope.audio_input(monitor) {
                    let level = input.iter().fold(0.0_f32, |m, s| m.max(s.abs()));
                    seen.fetch_max(level.to_bits(), Ordering::Relaxed);
                }
                Control::Continue
            })
            .unwrap();
        backend.start().unwrap();
        reg.connect_by_name("system:capture_3", "system:monitor")
            .unwrap();

        let wait_for = |done: &dyn Fn() -> bool| {
            let deadline = Instant::now() + Duration::from_secs(3);
            while !done() && Instant::now() < deadline {
                std::thread::sleep(Duration::from_millis(1));
            }
            done()
        };
        assert!(wait_for(&|| f32::from_bits(peak.load(Ordering::Relaxed)) > 0.1));

        backend.freewheel(true).unwrap();
        assert!(wait_for(&|| backend.state() == EngineState::Freewheeling));
        peak.store(0, Ordering::Relaxed);
        let before = backend.sample_time();
        std::thread::sleep(Duration::from_millis(20));
        assert!(backend.sample_time() > before);
        assert_eq!(f32::from_bits(peak.load(Ordering::Relaxed)), 0.0);

        backend.freewheel(false).unwrap();
        backend.stop().unwrap();
    }

    #[test]
    fn slaves_can_be_added_and_removed_while_running() {
        let mut backend = Backend::new(config());
        backend.start().unwrap();
        let slave = SlaveConfig {
            name: "usb".to_string(),
            driver: DriverOptions {
                sample_rate: 44_100,
                period_frames: 128,
                input_channels: 1,
                output_channels: 1,
                ..Default::default()
            },
            ..Default::default()
        };
        backend.add_slave(slave.clone()).unwrap();
        assert!(matches!(backend.add_slave(slave), Err(Error::Config(_))));
        let reg = backend.registry().clone();
        assert!(reg.port_by_name("system:capture_3").is_some());
        assert!(reg.port_by_name("system:playback_3").is_some());
        backend.remove_slave("usb").unwrap();
        assert!(reg.port_by_name("system:capture_3").is_none());
        backend.stop().unwrap();
    }

    #[test]
    fn driver_given_to_start_sets_the_geometry() {
        let options = DriverOptions {
            period_frames: 32,
            dummy: DummyOptions {
                realtime: false,
                ..Default::default()
            },
            ..Default::default()
        };
        let driver = DummyDriver::new(&options).unwrap();
        let mut backend = Backend::new(config());
        backend.start_with_driver(driver).unwrap();
        assert_eq!(backend.buffer_size(), 32);
        backend.stop().unwrap();
    }
}
