//! Timestamped MIDI records carried over a byte ring.
//!
//! Record layout: little-endian `u64` timestamp in microseconds, little-endian
//! `u16` payload length, then the payload bytes.

use super::event::MAX_EVENT_SIZE;
use crate::ringbuffer::{Consumer, Producer, ring_buffer};
use byteorder::{ByteOrder, LittleEndian};

pub const RECORD_HEADER_SIZE: usize = 10;

pub fn midi_event_ring(capacity_bytes: usize) -> (MidiEventWriter, MidiEventReader) {
    let (tx, rx) = ring_buffer::<u8>(capacity_bytes);
    (MidiEventWriter { tx }, MidiEventReader { rx })
}

#[derive(Debug)]
pub struct MidiEventWriter {
    tx: Producer<u8>,
}

#[derive(Debug)]
pub struct MidiEventReader {
    rx: Consumer<u8>,
}

impl MidiEventWriter {
    /// Queues one record. Returns `false` when the ring has no room for the
    /// whole record, in which case nothing is written.
    pub fn push(&mut self, timestamp: u64, bytes: &[u8]) -> bool {
        if bytes.is_empty() || bytes.len() > MAX_EVENT_SIZE {
            return false;
        }
        let total = RECORD_HEADER_SIZE + bytes.len();
        if self.tx.write_space() < total {
            return false;
        }
        let mut record = [0_u8; RECORD_HEADER_SIZE + MAX_EVENT_SIZE];
        LittleEndian::write_u64(&mut record[..8], timestamp);
        LittleEndian::write_u16(&mut record[8..RECORD_HEADER_SIZE], bytes.len() as u16);
        record[RECORD_HEADER_SIZE..total].copy_from_slice(bytes);
        self.tx.write(&record[..total]) == total
    }

    pub fn write_space(&self) -> usize {
        self.tx.write_space()
    }
}

impl MidiEventReader {
    fn header(&self) -> Option<(u64, usize)> {
        let mut header = [0_u8; RECORD_HEADER_SIZE];
        if self.rx.peek(&mut header) < RECORD_HEADER_SIZE {
            return None;
        }
        let timestamp = LittleEndian::read_u64(&header[..8]);
        let len = LittleEndian::read_u16(&header[8..]) as usize;
        Some((timestamp, len))
    }

    /// Timestamp of the oldest complete record.
    pub fn peek_timestamp(&self) -> Option<u64> {
        let (timestamp, len) = self.header()?;
        if self.rx.read_space() < RECORD_HEADER_SIZE + len {
            return None;
        }
        Some(timestamp)
    }

    /// Removes the oldest record, copying its payload into `out`.
    ///
    /// Returns the timestamp and payload length. A payload larger than `out`
    /// is truncated.
    pub fn pop(&mut self, out: &mut [u8]) -> Option<(u64, usize)> {
        let (timestamp, len) = self.header()?;
        if self.rx.read_space() < RECORD_HEADER_SIZE + len {
            return None;
        }
        self.rx.advance_read(RECORD_HEADER_SIZE);
        let copied = len.min(out.len());
        self.rx.read(&mut out[..copied]);
        self.rx.advance_read(len - copied);
        Some((timestamp, copied))
    }

    pub fn is_empty(&self) -> bool {
        self.rx.read_space() == 0
    }

    pub fn clear(&mut self) {
        self.rx.discard();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_come_back_in_order() {
        let (mut tx, mut rx) = midi_event_ring(64);
        assert!(tx.push(1_000, &[0x90, 0x40, 0x7F]));
        assert!(tx.push(1_500, &[0xF8]));

        assert_eq!(rx.peek_timestamp(), Some(1_000));
        let mut out = [0_u8; MAX_EVENT_SIZE];
        assert_eq!(rx.pop(&mut out), Some((1_000, 3)));
        assert_eq!(&out[..3], &[0x90, 0x40, 0x7F]);
        assert_eq!(rx.pop(&mut out), Some((1_500, 1)));
        assert_eq!(out[0], 0xF8);
        assert_eq!(rx.pop(&mut out), None);
        assert!(rx.is_empty());
    }

    #[test]
    fn full_ring_rejects_whole_record() {
        let (mut tx, mut rx) = midi_event_ring(RECORD_HEADER_SIZE + 4);
        assert!(tx.push(1, &[0x90, 0x40, 0x7F]));
        assert!(!tx.push(2, &[0x80, 0x40, 0x00]));
        let mut out = [0_u8; 8];
        assert_eq!(rx.pop(&mut out), Some((1, 3)));
        assert_eq!(rx.pop(&mut out), None);
    }

    #[test]
    fn records_survive_wraparound() {
        let (mut tx, mut rx) = midi_event_ring(40);
        let mut out = [0_u8; MAX_EVENT_SIZE];
        for i in 0..50_u64 {
            assert!(tx.push(i, &[0xB0, (i % 128) as u8, 0x10]));
            assert_eq!(rx.pop(&mut out), Some((i, 3)));
            assert_eq!(out[1], (i % 128) as u8);
        }
    }
}
