use rtport_engine::BackendConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HostConfig {
    /// `tracing` filter used when `RUST_LOG` is unset.
    pub log: Option<String>,
    pub monitor: MonitorConfig,
    pub backend: BackendConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    /// Wire `capture_N` to `playback_N` for every channel pair.
    pub passthrough: bool,
    /// Record every master capture channel into this WAV file.
    pub record: Option<PathBuf>,
    /// Longest recording kept in memory, in seconds.
    pub record_seconds: u32,
}

impl Default for MonitorConfig {
    fn default() -> Self {
        Self {
            passthrough: true,
            record: None,
            record_seconds: 600,
        }
    }
}

impl HostConfig {
    /// Reads `path`; a missing file yields the defaults.
    pub fn load(path: Option<&Path>) -> io::Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(e) => return Err(e),
        };
        toml::from_str(&text).map_err(|e| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: {e}", path.display()),
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rtport_engine::{DriverKind, Generator};

    #[test]
    fn parses_a_full_file() {
        let text = r#"
            log = "debug"

            [monitor]
            passthrough = false
            record = "take.wav"

            [backend]
            rt_priority = 40

            [backend.driver]
            kind = "dummy"
            sample_rate = 44100
            period_frames = 128

            [backend.driver.dummy]
            realtime = true
            generator = { type = "sine", frequency = 440.0, amplitude = 0.5 }

            [[backend.midi_devices]]
            path = "/dev/snd/midiC1D0"
            name = "keys"
            output = false

            [[backend.slaves]]
            name = "usb"
            dll_bandwidth = 0.5

            [backend.slaves.driver]
            kind = "alsa"
            device = "hw:2"
        "#;
        let config: HostConfig = toml::from_str(text).unwrap();
        assert_eq!(config.log.as_deref(), Some("debug"));
        assert!(!config.monitor.passthrough);
        assert_eq!(config.monitor.record, Some(PathBuf::from("take.wav")));
        assert_eq!(config.backend.rt_priority, Some(40));
        assert_eq!(config.backend.driver.kind, DriverKind::Dummy);
        assert_eq!(config.backend.driver.sample_rate, 44_100);
        assert_eq!(config.backend.driver.periods, 2);
        assert_eq!(
            config.backend.driver.dummy.generator,
            Generator::Sine {
                frequency: 440.0,
                amplitude: 0.5
            }
        );
        assert!(!config.backend.midi_devices[0].output);
        assert_eq!(config.backend.slaves[0].driver.kind, DriverKind::Alsa);
        assert_eq!(config.backend.slaves[0].ring_periods, 8);
        assert!(config.backend.validate().is_ok());
    }

    #[test]
    fn missing_file_means_defaults() {
        let config = HostConfig::load(Some(Path::new("/nonexistent/rtport.toml"))).unwrap();
        assert_eq!(config, HostConfig::default());
        assert_eq!(config.backend.driver.sample_rate, 48_000);
    }
}
