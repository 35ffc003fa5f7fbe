//! Non-blocking diagnostics for realtime threads.
//!
//! Realtime threads never log directly. Each one owns a [`DiagnosticSink`]
//! feeding a small lock-free ring; the control thread drains every ring
//! through [`DiagnosticHub::drain`] and turns the records into `tracing`
//! events.

use crate::ringbuffer::{Consumer, Producer, ring_buffer};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

const SINK_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum Diagnostic {
    #[default]
    Xrun,
    DriverError {
        consecutive: u32,
    },
    MidiInputOverflow,
    MidiDropped {
        len: usize,
    },
    MidiLate {
        late_us: u64,
    },
    MidiBufferFull,
    MidiDeviceLost {
        errno: i32,
    },
    SlaveUnderrun,
    SlaveOverflow,
    SlaveDraining,
    SlaveResumed,
    ResamplerError,
    Profile {
        expected_cps: f32,
        cycles: u32,
        avg_us: f32,
        max_us: f32,
        dsp_load: f32,
    },
}

/// Producer half owned by one realtime thread.
#[derive(Debug)]
pub struct DiagnosticSink {
    tx: Producer<Diagnostic>,
    lost: u64,
}

impl DiagnosticSink {
    /// Records a diagnostic. A full ring drops it; the drop is counted.
    pub fn push(&mut self, diagnostic: Diagnostic) {
        if self.tx.write(&[diagnostic]) == 0 {
            self.lost += 1;
        }
    }

    pub fn lost(&self) -> u64 {
        self.lost
    }
}

#[derive(Debug)]
struct Source {
    name: String,
    rx: Consumer<Diagnostic>,
}

#[derive(Debug, Default)]
pub struct DiagnosticHub {
    sources: Mutex<Vec<Source>>,
}

impl DiagnosticHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: &str) -> DiagnosticSink {
        let (tx, rx) = ring_buffer(SINK_CAPACITY);
        self.sources.lock().push(Source {
            name: name.to_string(),
            rx,
        });
        DiagnosticSink { tx, lost: 0 }
    }

    /// Hands every pending record to `f`. Sources whose sink is gone and whose
    /// ring is empty are forgotten.
    pub fn drain_with(&self, mut f: impl FnMut(&str, Diagnostic)) -> usize {
        let mut sources = self.sources.lock();
        let mut count = 0;
        let mut slot = [Diagnostic::default()];
        for source in sources.iter_mut() {
            while source.rx.read(&mut slot) == 1 {
                f(&source.name, slot[0]);
                count += 1;
            }
        }
        sources.retain(|source| !source.rx.is_abandoned() || source.rx.read_space() > 0);
        count
    }

    /// Logs every pending record through `tracing`.
    pub fn drain(&self) -> usize {
        self.drain_with(log_diagnostic)
    }
}

pub fn log_diagnostic(source: &str, diagnostic: Diagnostic) {
    match diagnostic {
        Diagnostic::Xrun => warn!("{source}: xrun"),
        Diagnostic::DriverError { consecutive } => {
            error!("{source}: driver error ({consecutive} in a row)")
        }
        Diagnostic::MidiInputOverflow => warn!("{source}: MIDI input ring overflow, event lost"),
        Diagnostic::MidiDropped { len } => {
            warn!("{source}: dropped oversized MIDI message ({len} bytes)")
        }
        Diagnostic::MidiLate { late_us } => debug!("{source}: MIDI event sent {late_us}us late"),
        Diagnostic::MidiBufferFull => warn!("{source}: MIDI port buffer full, event lost"),
        Diagnostic::MidiDeviceLost { errno } => {
            error!(
                "{source}: MIDI device failed: {}",
                std::io::Error::from_raw_os_error(errno)
            )
        }
        Diagnostic::SlaveUnderrun => warn!("{source}: slave ring underrun"),
        Diagnostic::SlaveOverflow => warn!("{source}: slave ring overflow"),
        Diagnostic::SlaveDraining => info!("{source}: slave draining"),
        Diagnostic::SlaveResumed => info!("{source}: slave resumed"),
        Diagnostic::ResamplerError => error!("{source}: resampler failed"),
        Diagnostic::Profile {
            expected_cps,
            cycles,
            avg_us,
            max_us,
            dsp_load,
        } => info!(
            "{source} profile: expected_cps={expected_cps:.1} cycles={cycles} cycle_avg_us={avg_us:.1} cycle_max_us={max_us:.1} dsp_load={dsp_load:.3}"
        ),
    }
}
