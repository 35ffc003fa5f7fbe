use std::fmt;

/// Largest message carried inline by an event record.
pub const MAX_EVENT_SIZE: usize = 256;

/// A MIDI message stamped with its frame offset inside the current cycle.
///
/// The payload lives inline so queuing an event never allocates.
#[derive(Clone, Copy)]
pub struct MidiEvent {
    time: u32,
    size: u16,
    data: [u8; MAX_EVENT_SIZE],
}

impl MidiEvent {
    /// Returns `None` for empty messages or messages over [`MAX_EVENT_SIZE`].
    pub fn new(time: u32, bytes: &[u8]) -> Option<Self> {
        if bytes.is_empty() || bytes.len() > MAX_EVENT_SIZE {
            return None;
        }
        let mut data = [0_u8; MAX_EVENT_SIZE];
        data[..bytes.len()].copy_from_slice(bytes);
        Some(Self {
            time,
            size: bytes.len() as u16,
            data,
        })
    }

    pub fn time(&self) -> u32 {
        self.time
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.size as usize]
    }

    pub fn len(&self) -> usize {
        self.size as usize
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

impl PartialEq for MidiEvent {
    fn eq(&self, other: &Self) -> bool {
        self.time == other.time && self.bytes() == other.bytes()
    }
}

impl Eq for MidiEvent {}

impl fmt::Debug for MidiEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MidiEvent")
            .field("time", &self.time)
            .field("bytes", &self.bytes())
            .finish()
    }
}

/// Total length of a message that starts with `status`, including the status
/// byte. `None` for sysex, whose length is only known at 0xF7.
pub fn message_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF | 0xE0..=0xEF => Some(3),
        0xC0..=0xDF => Some(2),
        0xF0 => None,
        0xF1 | 0xF3 => Some(2),
        0xF2 => Some(3),
        _ => Some(1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_empty_and_oversized() {
        assert!(MidiEvent::new(0, &[]).is_none());
        assert!(MidiEvent::new(0, &[0xF0; MAX_EVENT_SIZE + 1]).is_none());
        let ev = MidiEvent::new(12, &[0x90, 0x40, 0x7F]).unwrap();
        assert_eq!(ev.time(), 12);
        assert_eq!(ev.bytes(), &[0x90, 0x40, 0x7F]);
    }

    #[test]
    fn message_lengths_follow_status_class() {
        assert_eq!(message_len(0x93), Some(3));
        assert_eq!(message_len(0xB0), Some(3));
        assert_eq!(message_len(0xC5), Some(2));
        assert_eq!(message_len(0xD0), Some(2));
        assert_eq!(message_len(0xE1), Some(3));
        assert_eq!(message_len(0xF2), Some(3));
        assert_eq!(message_len(0xF1), Some(2));
        assert_eq!(message_len(0xF3), Some(2));
        assert_eq!(message_len(0xF6), Some(1));
        assert_eq!(message_len(0xF8), Some(1));
        assert_eq!(message_len(0xF0), None);
    }
}
