use crate::error::{Error, Result};
use crate::hw::options::DriverOptions;
use crate::hw::rt::RT_PRIORITY_PROCESS;
use serde::{Deserialize, Serialize};

/// A raw MIDI device to open when the backend starts.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MidiDeviceConfig {
    /// Device node, for example `/dev/snd/midiC1D0`.
    pub path: String,
    /// Name used in the `system:midi_capture_<name>` port names.
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default = "enabled")]
    pub input: bool,
    #[serde(default = "enabled")]
    pub output: bool,
}

fn enabled() -> bool {
    true
}

impl MidiDeviceConfig {
    pub fn port_suffix(&self) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => self
                .path
                .rsplit('/')
                .next()
                .unwrap_or(self.path.as_str())
                .to_string(),
        }
    }
}

/// A second audio device resampled onto the master clock.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SlaveConfig {
    pub name: String,
    pub driver: DriverOptions,
    /// Length of each transfer ring in slave periods.
    pub ring_periods: usize,
    /// Slave periods of silence queued before audio flows again.
    pub prime_periods: usize,
    /// Quiet slave cycles required before re-priming after a drain.
    pub quiet_periods: usize,
    /// DLL loop bandwidth in Hz.
    pub dll_bandwidth: f64,
    /// Largest resampling ratio deviation the resamplers accept.
    pub max_ratio_relative: f64,
}

impl Default for SlaveConfig {
    fn default() -> Self {
        Self {
            name: "slave".to_string(),
            driver: DriverOptions::default(),
            ring_periods: 8,
            prime_periods: 2,
            quiet_periods: 4,
            dll_bandwidth: 0.1,
            max_ratio_relative: 1.1,
        }
    }
}

impl SlaveConfig {
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains(':') {
            return Err(Error::Config(format!(
                "slave name '{}' must be non-empty and contain no ':'",
                self.name
            )));
        }
        self.driver.validate()?;
        if self.ring_periods < 4 {
            return Err(Error::Config(format!(
                "slave '{}': ring of {} periods is too short (min 4)",
                self.name, self.ring_periods
            )));
        }
        if self.prime_periods == 0 || self.prime_periods * 2 > self.ring_periods {
            return Err(Error::Config(format!(
                "slave '{}': {} priming periods do not fit a ring of {}",
                self.name, self.prime_periods, self.ring_periods
            )));
        }
        if !(self.dll_bandwidth > 0.0 && self.dll_bandwidth <= 10.0) {
            return Err(Error::Config(format!(
                "slave '{}': DLL bandwidth {} Hz outside (0, 10]",
                self.name, self.dll_bandwidth
            )));
        }
        if !(self.max_ratio_relative > 1.0 && self.max_ratio_relative <= 2.0) {
            return Err(Error::Config(format!(
                "slave '{}': maximum ratio {} outside (1, 2]",
                self.name, self.max_ratio_relative
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    pub driver: DriverOptions,
    pub midi_devices: Vec<MidiDeviceConfig>,
    /// SCHED_FIFO priority of the process thread; `None` keeps normal
    /// scheduling.
    pub rt_priority: Option<i32>,
    pub lock_memory: bool,
    pub slaves: Vec<SlaveConfig>,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            driver: DriverOptions::default(),
            midi_devices: Vec::new(),
            rt_priority: Some(RT_PRIORITY_PROCESS),
            lock_memory: false,
            slaves: Vec::new(),
        }
    }
}

impl BackendConfig {
    pub fn validate(&self) -> Result<()> {
        self.driver.validate()?;
        if let Some(priority) = self.rt_priority
            && !(1..=99).contains(&priority)
        {
            return Err(Error::Config(format!(
                "realtime priority {priority} outside 1..=99"
            )));
        }
        for (i, slave) in self.slaves.iter().enumerate() {
            slave.validate()?;
            if self.slaves[..i].iter().any(|s| s.name == slave.name) {
                return Err(Error::Config(format!(
                    "slave name '{}' used twice",
                    slave.name
                )));
            }
        }
        for device in &self.midi_devices {
            if device.path.is_empty() {
                return Err(Error::Config("MIDI device path is empty".to_string()));
            }
        }
        Ok(())
    }
}
