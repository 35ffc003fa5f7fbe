use crate::midi::buffer::MidiBuffer;
use crate::mutex::UnsafeMutex;

/// Largest period any port buffer has to hold. Buffers are sized once at
/// registration so a period change never reallocates on the process thread.
pub const MAX_BUFFER_FRAMES: usize = 8192;

/// Storage behind a port. Only the process thread reads or writes it.
#[derive(Debug)]
pub enum PortBuffer {
    Audio(UnsafeMutex<Vec<f32>>),
    Midi(UnsafeMutex<MidiBuffer>),
}

impl PortBuffer {
    pub fn audio() -> Self {
        PortBuffer::Audio(UnsafeMutex::new(vec![0.0; MAX_BUFFER_FRAMES]))
    }

    pub fn midi() -> Self {
        PortBuffer::Midi(UnsafeMutex::new(MidiBuffer::default()))
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn audio_frames(&self, nframes: usize) -> Option<&mut [f32]> {
        match self {
            PortBuffer::Audio(buf) => {
                let buf = buf.lock();
                let n = nframes.min(buf.len());
                Some(&mut buf[..n])
            }
            PortBuffer::Midi(_) => None,
        }
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn midi_events(&self) -> Option<&mut MidiBuffer> {
        match self {
            PortBuffer::Midi(buf) => Some(buf.lock()),
            PortBuffer::Audio(_) => None,
        }
    }
}
