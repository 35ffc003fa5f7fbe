//! Raw MIDI 1.0 byte-stream reassembly.
//!
//! Hardware serial ports deliver bytes without framing. The parser rebuilds
//! complete messages, applies running status, passes realtime bytes through
//! out of band and collects sysex up to its fixed buffer size.

use super::event::{MAX_EVENT_SIZE, message_len};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Idle,
    Accumulating { needed: usize },
    Sysex,
}

/// Outcome of feeding one byte.
#[derive(Debug, PartialEq, Eq)]
pub enum Parsed<'a> {
    /// A complete message, stamped with the arrival time of its first byte.
    Message { timestamp: u64, bytes: &'a [u8] },
    /// A message outgrew the buffer and was discarded.
    Dropped { timestamp: u64, len: usize },
}

#[derive(Debug, Clone)]
pub struct MidiParser<const N: usize = MAX_EVENT_SIZE> {
    state: State,
    running_status: Option<u8>,
    buf: [u8; N],
    len: usize,
    timestamp: u64,
    realtime: [u8; 1],
    dropped: u64,
}

impl<const N: usize> Default for MidiParser<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> MidiParser<N> {
    pub fn new() -> Self {
        Self {
            state: State::Idle,
            running_status: None,
            buf: [0; N],
            len: 0,
            timestamp: 0,
            realtime: [0],
            dropped: 0,
        }
    }

    /// Forgets any partial message and the running status.
    pub fn reset(&mut self) {
        self.state = State::Idle;
        self.running_status = None;
        self.len = 0;
    }

    pub fn is_idle(&self) -> bool {
        self.state == State::Idle
    }

    /// Messages discarded for exceeding the buffer since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn feed(&mut self, byte: u8, now: u64) -> Option<Parsed<'_>> {
        if byte >= 0xF8 {
            self.realtime[0] = byte;
            return Some(Parsed::Message {
                timestamp: now,
                bytes: &self.realtime,
            });
        }
        if byte & 0x80 != 0 {
            return self.status_byte(byte, now);
        }
        self.data_byte(byte, now)
    }

    fn status_byte(&mut self, byte: u8, now: u64) -> Option<Parsed<'_>> {
        if self.state == State::Sysex && byte == 0xF7 {
            self.state = State::Idle;
            return match self.push(byte) {
                Ok(()) => Some(Parsed::Message {
                    timestamp: self.timestamp,
                    bytes: &self.buf[..self.len],
                }),
                Err(len) => Some(Parsed::Dropped {
                    timestamp: self.timestamp,
                    len,
                }),
            };
        }

        // Any other status byte abandons whatever was in progress, including an
        // unterminated sysex.
        self.state = State::Idle;
        self.len = 0;
        match byte {
            0xF0 => {
                self.running_status = None;
                self.timestamp = now;
                self.state = State::Sysex;
                self.buf[0] = byte;
                self.len = 1;
                None
            }
            0xF7 | 0xF4 | 0xF5 => {
                self.running_status = None;
                None
            }
            0xF6 => {
                self.running_status = None;
                self.buf[0] = byte;
                self.len = 1;
                Some(Parsed::Message {
                    timestamp: now,
                    bytes: &self.buf[..1],
                })
            }
            _ => {
                // System common messages cancel running status; channel
                // messages establish it.
                self.running_status = if byte < 0xF0 { Some(byte) } else { None };
                self.timestamp = now;
                self.buf[0] = byte;
                self.len = 1;
                let needed = message_len(byte).unwrap_or(1);
                self.state = State::Accumulating { needed };
                None
            }
        }
    }

    fn data_byte(&mut self, byte: u8, now: u64) -> Option<Parsed<'_>> {
        match self.state {
            State::Sysex => match self.push(byte) {
                Ok(()) => None,
                Err(len) => {
                    self.state = State::Idle;
                    Some(Parsed::Dropped {
                        timestamp: self.timestamp,
                        len,
                    })
                }
            },
            State::Accumulating { needed } => {
                // Only a parser narrower than three bytes can overflow here.
                if let Err(len) = self.push(byte) {
                    self.state = State::Idle;
                    return Some(Parsed::Dropped {
                        timestamp: self.timestamp,
                        len,
                    });
                }
                if self.len < needed {
                    return None;
                }
                self.state = State::Idle;
                Some(Parsed::Message {
                    timestamp: self.timestamp,
                    bytes: &self.buf[..self.len],
                })
            }
            State::Idle => {
                let status = self.running_status?;
                self.timestamp = now;
                self.buf[0] = status;
                self.len = 1;
                let needed = message_len(status).unwrap_or(1);
                self.state = State::Accumulating { needed };
                self.data_byte(byte, now)
            }
        }
    }

    fn push(&mut self, byte: u8) -> Result<(), usize> {
        if self.len >= N {
            let len = self.len + 1;
            self.len = 0;
            self.running_status = None;
            self.dropped += 1;
            return Err(len);
        }
        self.buf[self.len] = byte;
        self.len += 1;
        Ok(())
    }
}
