pub mod buffer;
pub mod event;
pub mod io;
pub mod parser;
pub mod ring;

pub use buffer::{DEFAULT_MIDI_BUFFER_EVENTS, MidiBuffer, PutError};
pub use event::{MAX_EVENT_SIZE, MidiEvent, message_len};
pub use io::{
    CycleTiming, MemoryMidiPort, MidiInputQueue, MidiOutputQueue, MidiThread, RawMidiDevice,
    spawn_midi_input, spawn_midi_output,
};
#[cfg(unix)]
pub use io::RawMidiFile;
pub use parser::{MidiParser, Parsed};
pub use ring::{MidiEventReader, MidiEventWriter, midi_event_ring};
