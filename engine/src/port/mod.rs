pub mod buffer;
pub mod flags;
pub mod natural;

pub use buffer::{MAX_BUFFER_FRAMES, PortBuffer};
pub use flags::PortFlags;
pub use natural::natural_cmp;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

/// Opaque handle to a registered port. Ids are never reused within one
/// registry, so a stale handle resolves to nothing instead of another port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PortId(pub(crate) u32);

impl PortId {
    pub fn raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for PortId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Audio,
    Midi,
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::Audio => write!(f, "audio"),
            DataType::Midi => write!(f, "midi"),
        }
    }
}

/// Latency in frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LatencyRange {
    pub min: u32,
    pub max: u32,
}

impl LatencyRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    pub const fn fixed(frames: u32) -> Self {
        Self {
            min: frames,
            max: frames,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Port {
    pub(crate) id: PortId,
    pub(crate) name: String,
    pub(crate) data_type: DataType,
    pub(crate) flags: PortFlags,
    pub(crate) pretty_name: Option<String>,
    pub(crate) hw_name: Option<String>,
    pub(crate) capture_latency: LatencyRange,
    pub(crate) playback_latency: LatencyRange,
    pub(crate) connections: BTreeSet<PortId>,
    pub(crate) buffer: Arc<PortBuffer>,
}

impl Port {
    pub(crate) fn new(id: PortId, name: String, data_type: DataType, flags: PortFlags) -> Self {
        let buffer = match data_type {
            DataType::Audio => PortBuffer::audio(),
            DataType::Midi => PortBuffer::midi(),
        };
        Self {
            id,
            name,
            data_type,
            flags,
            pretty_name: None,
            hw_name: None,
            capture_latency: LatencyRange::default(),
            playback_latency: LatencyRange::default(),
            connections: BTreeSet::new(),
            buffer: Arc::new(buffer),
        }
    }

    pub fn id(&self) -> PortId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    pub fn flags(&self) -> PortFlags {
        self.flags
    }

    pub fn is_input(&self) -> bool {
        self.flags.is_input()
    }

    pub fn is_output(&self) -> bool {
        self.flags.is_output()
    }

    pub fn is_physical(&self) -> bool {
        self.flags.is_physical()
    }

    pub fn is_terminal(&self) -> bool {
        self.flags.is_terminal()
    }

    pub fn pretty_name(&self) -> Option<&str> {
        self.pretty_name.as_deref()
    }

    pub fn hw_name(&self) -> Option<&str> {
        self.hw_name.as_deref()
    }

    pub fn latency_range(&self, playback: bool) -> LatencyRange {
        if playback {
            self.playback_latency
        } else {
            self.capture_latency
        }
    }

    pub fn connections(&self) -> &BTreeSet<PortId> {
        &self.connections
    }

    pub fn is_connected(&self) -> bool {
        !self.connections.is_empty()
    }

    pub(crate) fn buffer(&self) -> &PortBuffer {
        &self.buffer
    }

    /// Checks whether `self` may feed or be fed by `other`.
    pub(crate) fn compatibility(&self, other: &Port) -> Result<(), &'static str> {
        if self.id == other.id {
            return Err("a port cannot connect to itself");
        }
        if self.data_type != other.data_type {
            return Err("data types differ");
        }
        if self.is_input() == other.is_input() {
            return Err(if self.is_input() {
                "both ports are inputs"
            } else {
                "both ports are outputs"
            });
        }
        Ok(())
    }
}

/// Buffers are runtime state, not topology; two snapshots are equal when
/// their ports agree on everything else.
impl PartialEq for Port {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
            && self.name == other.name
            && self.data_type == other.data_type
            && self.flags == other.flags
            && self.pretty_name == other.pretty_name
            && self.hw_name == other.hw_name
            && self.capture_latency == other.capture_latency
            && self.playback_latency == other.playback_latency
            && self.connections == other.connections
    }
}

impl Eq for Port {}

#[cfg(test)]
mod tests {
    use super::*;

    fn port(id: u32, data_type: DataType, flags: PortFlags) -> Port {
        Port::new(PortId(id), format!("system:p{id}"), data_type, flags)
    }

    #[test]
    fn compatible_ports_need_opposite_directions() {
        let out = port(1, DataType::Audio, PortFlags::IS_OUTPUT);
        let inp = port(2, DataType::Audio, PortFlags::IS_INPUT);
        let inp2 = port(3, DataType::Audio, PortFlags::IS_INPUT);
        let midi_in = port(4, DataType::Midi, PortFlags::IS_INPUT);

        assert!(out.compatibility(&inp).is_ok());
        assert!(inp.compatibility(&out).is_ok());
        assert_eq!(inp.compatibility(&inp2), Err("both ports are inputs"));
        assert_eq!(out.compatibility(&midi_in), Err("data types differ"));
        assert_eq!(out.compatibility(&out), Err("a port cannot connect to itself"));
    }

    #[test]
    fn buffer_kind_follows_data_type() {
        let audio = port(1, DataType::Audio, PortFlags::IS_OUTPUT);
        let midi = port(2, DataType::Midi, PortFlags::IS_OUTPUT);
        assert_eq!(audio.buffer().audio_frames(64).map(|b| b.len()), Some(64));
        assert!(audio.buffer().midi_events().is_none());
        assert!(midi.buffer().midi_events().is_some());
        assert!(midi.buffer().audio_frames(64).is_none());
    }

    #[test]
    fn equality_ignores_buffers() {
        let a = port(7, DataType::Audio, PortFlags::IS_INPUT);
        let mut b = a.clone();
        b.buffer = Arc::new(PortBuffer::audio());
        assert_eq!(a, b);
        b.pretty_name = Some("Mic".into());
        assert_ne!(a, b);
    }
}
