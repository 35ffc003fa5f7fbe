use super::event::{MAX_EVENT_SIZE, MidiEvent};
use thiserror::Error;

pub const DEFAULT_MIDI_BUFFER_EVENTS: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum PutError {
    #[error("event at frame {time} is earlier than the last queued event at {last}")]
    TooLate { time: u32, last: u32 },
    #[error("MIDI buffer is full")]
    Full,
    #[error("MIDI message is empty or exceeds {MAX_EVENT_SIZE} bytes")]
    BadSize,
}

/// Per-cycle event list of a MIDI port, kept in ascending time order.
#[derive(Debug, Clone)]
pub struct MidiBuffer {
    events: Vec<MidiEvent>,
    capacity: usize,
}

impl Default for MidiBuffer {
    fn default() -> Self {
        Self::new(DEFAULT_MIDI_BUFFER_EVENTS)
    }
}

impl MidiBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
            capacity,
        }
    }

    pub fn put(&mut self, time: u32, bytes: &[u8]) -> Result<(), PutError> {
        if let Some(last) = self.events.last()
            && time < last.time()
        {
            return Err(PutError::TooLate {
                time,
                last: last.time(),
            });
        }
        if self.events.len() >= self.capacity {
            return Err(PutError::Full);
        }
        let event = MidiEvent::new(time, bytes).ok_or(PutError::BadSize)?;
        self.events.push(event);
        Ok(())
    }

    /// Like `put` but without the ordering check; pair with `sort_stable`.
    pub(crate) fn put_unordered(&mut self, time: u32, bytes: &[u8]) -> Result<(), PutError> {
        if self.events.len() >= self.capacity {
            return Err(PutError::Full);
        }
        let event = MidiEvent::new(time, bytes).ok_or(PutError::BadSize)?;
        self.events.push(event);
        Ok(())
    }

    pub fn clear(&mut self) {
        self.events.clear();
    }

    pub fn len(&self) -> usize {
        self.events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn events(&self) -> &[MidiEvent] {
        &self.events
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MidiEvent> {
        self.events.iter()
    }

    /// Appends `other` without regard to order; returns how many events did
    /// not fit.
    pub(crate) fn append_unordered(&mut self, other: &MidiBuffer) -> usize {
        let room = self.capacity - self.events.len();
        let taken = other.events.len().min(room);
        self.events.extend_from_slice(&other.events[..taken]);
        other.events.len() - taken
    }

    /// Stable insertion sort by time. Merged inputs are nearly sorted and
    /// this never allocates.
    pub(crate) fn sort_stable(&mut self) {
        for i in 1..self.events.len() {
            let mut j = i;
            while j > 0 && self.events[j - 1].time() > self.events[j].time() {
                self.events.swap(j - 1, j);
                j -= 1;
            }
        }
    }
}

impl<'a> IntoIterator for &'a MidiBuffer {
    type Item = &'a MidiEvent;
    type IntoIter = std::slice::Iter<'a, MidiEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.events.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_late_events() {
        let mut buf = MidiBuffer::new(8);
        buf.put(10, &[0x90, 60, 100]).unwrap();
        buf.put(10, &[0x80, 60, 0]).unwrap();
        assert_eq!(
            buf.put(4, &[0x90, 61, 100]),
            Err(PutError::TooLate { time: 4, last: 10 })
        );
        assert_eq!(buf.len(), 2);
    }

    #[test]
    fn rejects_when_full() {
        let mut buf = MidiBuffer::new(2);
        buf.put(0, &[0xF8]).unwrap();
        buf.put(1, &[0xF8]).unwrap();
        assert_eq!(buf.put(2, &[0xF8]), Err(PutError::Full));
    }

    #[test]
    fn merge_then_sort_keeps_equal_times_in_source_order() {
        let mut a = MidiBuffer::new(8);
        a.put(0, &[0x90, 1, 1]).unwrap();
        a.put(5, &[0x90, 2, 1]).unwrap();
        let mut b = MidiBuffer::new(8);
        b.put(0, &[0x90, 3, 1]).unwrap();
        b.put(3, &[0x90, 4, 1]).unwrap();

        let mut out = MidiBuffer::new(8);
        assert_eq!(out.append_unordered(&a), 0);
        assert_eq!(out.append_unordered(&b), 0);
        out.sort_stable();
        let notes: Vec<u8> = out.iter().map(|e| e.bytes()[1]).collect();
        assert_eq!(notes, vec![1, 3, 4, 2]);
    }

    #[test]
    fn append_reports_overflow() {
        let mut a = MidiBuffer::new(4);
        for t in 0..4 {
            a.put(t, &[0xF8]).unwrap();
        }
        let mut out = MidiBuffer::new(3);
        assert_eq!(out.append_unordered(&a), 1);
        assert_eq!(out.len(), 3);
    }
}
