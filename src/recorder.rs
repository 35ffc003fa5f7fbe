use rtport_engine::ringbuffer::{Consumer, Producer, ring_buffer};
use rtport_engine::{Control, DataType, PortFlags, PortId, PortRegistry, ProcessHandler, ProcessScope};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Seconds of audio the ring between the process thread and the writer holds.
const RING_SECONDS: usize = 2;

/// Process handler copying client input ports into an interleaved ring.
pub struct Recorder {
    ports: Vec<PortId>,
    scratch: Vec<f32>,
    tx: Producer<f32>,
    dropped: Arc<AtomicU64>,
}

/// Control-thread end of a [`Recorder`].
pub struct Recording {
    rx: Consumer<f32>,
    samples: Vec<f32>,
    limit: usize,
    channels: usize,
    dropped: Arc<AtomicU64>,
}

/// Registers `record_1..=channels` on `registry` and returns both halves.
pub fn recorder(
    registry: &PortRegistry,
    channels: usize,
    sample_rate: u32,
    max_seconds: u32,
) -> rtport_engine::Result<(Recorder, Recording)> {
    let mut ports = Vec::with_capacity(channels);
    for ch in 1..=channels {
        ports.push(registry.register_port(
            &format!("record_{ch}"),
            DataType::Audio,
            PortFlags::IS_INPUT,
        )?);
    }
    let (tx, rx) = ring_buffer(sample_rate as usize * channels * RING_SECONDS);
    let dropped = Arc::new(AtomicU64::new(0));
    Ok((
        Recorder {
            ports,
            scratch: Vec::with_capacity(8192 * channels),
            tx,
            dropped: dropped.clone(),
        },
        Recording {
            rx,
            samples: Vec::new(),
            limit: sample_rate as usize * channels * max_seconds as usize,
            channels,
            dropped,
        },
    ))
}

impl ProcessHandler for Recorder {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Control {
        let n = scope.n_frames();
        let channels = self.ports.len();
        self.scratch.resize(n * channels, 0.0);
        for (ch, id) in self.ports.iter().enumerate() {
            match scope.audio_input(*id) {
                Some(input) => {
                    for (frame, sample) in input.iter().enumerate() {
                        self.scratch[frame * channels + ch] = *sample;
                    }
                }
                None => {
                    for frame in 0..n {
                        self.scratch[frame * channels + ch] = 0.0;
                    }
                }
            }
        }
        if self.tx.write_space() < self.scratch.len() {
            self.dropped.fetch_add(n as u64, Ordering::Relaxed);
        } else {
            self.tx.write(&self.scratch);
        }
        Control::Continue
    }
}

impl Recording {
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Moves everything recorded so far out of the ring. Past the length
    /// limit the audio is discarded.
    pub fn collect(&mut self) {
        let available = self.rx.read_space();
        let keep = available.min(self.limit.saturating_sub(self.samples.len()));
        let start = self.samples.len();
        self.samples.resize(start + keep, 0.0);
        self.rx.read(&mut self.samples[start..]);
        self.rx.discard();
    }

    pub fn dropped_frames(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_registered_ports_interleaved() {
        let registry = PortRegistry::default();
        let (_recorder, recording) = recorder(&registry, 2, 48_000, 1).unwrap();
        assert!(registry.port_by_name("system:record_1").is_some());
        assert!(registry.port_by_name("record_2").is_some());
        assert_eq!(recording.channels(), 2);
        assert!(recording.samples().is_empty());
    }
}
