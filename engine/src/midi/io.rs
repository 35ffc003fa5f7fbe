//! Raw MIDI devices and the threads that move their bytes to and from the
//! process thread.

use super::buffer::{MidiBuffer, PutError};
use super::event::MAX_EVENT_SIZE;
use super::parser::{MidiParser, Parsed};
use super::ring::{MidiEventReader, MidiEventWriter, midi_event_ring};
use crate::clock::{MonotonicClock, frames_to_us};
use crate::diag::{Diagnostic, DiagnosticSink};
use crate::error::Result;
use crate::hw::rt::spawn_rt_thread;
use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::io::{self, ErrorKind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

/// Upper bound on any blocking wait, so threads notice a stop request.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(500);
/// Longest single sleep of the output thread while an event is pending.
const MAX_SLEEP_US: u64 = 1_000;
/// Output events later than this are reported.
const LATE_REPORT_US: u64 = 1_000;
pub const DEFAULT_MIDI_RING_BYTES: usize = 32 * 1024;

/// A byte-oriented MIDI port. `read` and `write` never block; the waits are
/// bounded by their timeout.
pub trait RawMidiDevice: Send {
    fn name(&self) -> &str;
    /// Returns 0 when nothing is pending.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
    /// Returns how many bytes the device accepted, possibly 0.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;
    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool>;
    fn wait_writable(&mut self, timeout: Duration) -> io::Result<bool>;
}

#[derive(Debug, Default)]
struct Pipe {
    bytes: Mutex<VecDeque<u8>>,
    readable: Condvar,
}

/// In-process MIDI cable. Every clone shares one byte queue, so bytes written
/// through any clone can be read through any other.
#[derive(Debug, Clone)]
pub struct MemoryMidiPort {
    name: String,
    pipe: Arc<Pipe>,
    capacity: usize,
}

impl MemoryMidiPort {
    pub fn new(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            pipe: Arc::new(Pipe::default()),
            capacity: capacity.max(1),
        }
    }

    pub fn pending(&self) -> usize {
        self.pipe.bytes.lock().len()
    }
}

impl RawMidiDevice for MemoryMidiPort {
    fn name(&self) -> &str {
        &self.name
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut bytes = self.pipe.bytes.lock();
        let n = buf.len().min(bytes.len());
        for (dst, src) in buf.iter_mut().zip(bytes.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut bytes = self.pipe.bytes.lock();
        let n = buf.len().min(self.capacity.saturating_sub(bytes.len()));
        bytes.extend(&buf[..n]);
        if n > 0 {
            self.pipe.readable.notify_all();
        }
        Ok(n)
    }

    fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
        let mut bytes = self.pipe.bytes.lock();
        if bytes.is_empty() {
            self.pipe.readable.wait_for(&mut bytes, timeout);
        }
        Ok(!bytes.is_empty())
    }

    fn wait_writable(&mut self, timeout: Duration) -> io::Result<bool> {
        if self.pipe.bytes.lock().len() < self.capacity {
            return Ok(true);
        }
        std::thread::sleep(timeout.min(Duration::from_millis(1)));
        Ok(self.pipe.bytes.lock().len() < self.capacity)
    }
}

#[cfg(unix)]
mod file {
    use super::RawMidiDevice;
    use crate::error::{Error, Result};
    use crate::hw::error_fmt::backend_open_error;
    use nix::libc;
    use std::fs::File;
    use std::io::{self, ErrorKind, Read, Write};
    use std::os::fd::AsRawFd;
    use std::os::unix::fs::OpenOptionsExt;
    use std::time::Duration;

    /// A raw MIDI character device such as `/dev/snd/midiC1D0`.
    #[derive(Debug)]
    pub struct RawMidiFile {
        path: String,
        file: File,
    }

    impl RawMidiFile {
        pub fn open_input(path: &str) -> Result<Self> {
            let file = File::options()
                .read(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
                .map_err(|e| Error::Device(backend_open_error("raw MIDI", "input", path, e)))?;
            Ok(Self {
                path: path.to_string(),
                file,
            })
        }

        pub fn open_output(path: &str) -> Result<Self> {
            let file = File::options()
                .write(true)
                .custom_flags(libc::O_NONBLOCK)
                .open(path)
                .map_err(|e| Error::Device(backend_open_error("raw MIDI", "output", path, e)))?;
            Ok(Self {
                path: path.to_string(),
                file,
            })
        }

        fn poll(&self, events: libc::c_short, timeout: Duration) -> io::Result<bool> {
            let mut pfd = libc::pollfd {
                fd: self.file.as_raw_fd(),
                events,
                revents: 0,
            };
            let ms = timeout.as_millis().min(i32::MAX as u128) as libc::c_int;
            let rc = unsafe { libc::poll(&mut pfd, 1, ms) };
            if rc < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == ErrorKind::Interrupted {
                    return Ok(false);
                }
                return Err(err);
            }
            if rc == 0 {
                return Ok(false);
            }
            if pfd.revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                return Err(io::Error::from_raw_os_error(libc::ENODEV));
            }
            Ok(pfd.revents & events != 0)
        }
    }

    impl RawMidiDevice for RawMidiFile {
        fn name(&self) -> &str {
            &self.path
        }

        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            match self.file.read(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                other => other,
            }
        }

        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.file.write(buf) {
                Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(0),
                other => other,
            }
        }

        fn wait_readable(&mut self, timeout: Duration) -> io::Result<bool> {
            self.poll(libc::POLLIN, timeout)
        }

        fn wait_writable(&mut self, timeout: Duration) -> io::Result<bool> {
            self.poll(libc::POLLOUT, timeout)
        }
    }
}

#[cfg(unix)]
pub use file::RawMidiFile;

/// Where a process cycle sits on the monotonic clock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CycleTiming {
    pub start_us: u64,
    pub period_us: u64,
    pub frames: usize,
    pub sample_rate: u32,
}

impl CycleTiming {
    /// Frame offset of an input event, measured from the previous cycle start
    /// and clamped to the period.
    pub fn input_frame(&self, timestamp: u64) -> u32 {
        if self.frames == 0 || self.period_us == 0 {
            return 0;
        }
        let origin = self.start_us.saturating_sub(self.period_us);
        let offset = timestamp.saturating_sub(origin);
        let frame = offset * self.frames as u64 / self.period_us;
        frame.min(self.frames as u64 - 1) as u32
    }

    /// Due time of an output event at `frame`: one period after this cycle
    /// started, plus the frame offset.
    pub fn output_due(&self, frame: u32) -> u64 {
        self.start_us + self.period_us + frames_to_us(frame as usize, self.sample_rate)
    }
}

fn device_errno(err: &io::Error) -> i32 {
    err.raw_os_error().unwrap_or(0)
}

/// Handle of a running MIDI I/O thread. Dropping it stops the thread.
#[derive(Debug)]
pub struct MidiThread {
    name: String,
    running: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

impl MidiThread {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// False once the thread has exited, for example after the device failed.
    pub fn is_alive(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    pub fn stop(&mut self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MidiThread {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Process-thread end of a MIDI input thread.
#[derive(Debug)]
pub struct MidiInputQueue {
    reader: MidiEventReader,
    scratch: [u8; MAX_EVENT_SIZE],
}

impl MidiInputQueue {
    /// Moves every event stamped before `timing.start_us` into `out`. Newer
    /// events stay queued for the next cycle.
    ///
    /// A realtime byte arriving inside another message is queued ahead of it
    /// with a later timestamp, so the cycle's events are sorted once at the
    /// end rather than rejected for being out of order.
    pub fn recv_events(
        &mut self,
        out: &mut MidiBuffer,
        timing: &CycleTiming,
        diag: &mut DiagnosticSink,
    ) -> usize {
        let mut moved = 0;
        while let Some(timestamp) = self.reader.peek_timestamp() {
            if timestamp >= timing.start_us {
                break;
            }
            let Some((_, len)) = self.reader.pop(&mut self.scratch) else {
                break;
            };
            match out.put_unordered(timing.input_frame(timestamp), &self.scratch[..len]) {
                Ok(()) => moved += 1,
                Err(PutError::Full) => diag.push(Diagnostic::MidiBufferFull),
                Err(PutError::TooLate { .. }) | Err(PutError::BadSize) => {
                    diag.push(Diagnostic::MidiDropped { len })
                }
            }
        }
        if moved > 0 {
            out.sort_stable();
        }
        moved
    }

    /// Throws away everything queued, used while freewheeling.
    pub fn clear(&mut self) {
        self.reader.clear();
    }
}

/// Process-thread end of a MIDI output thread.
#[derive(Debug)]
pub struct MidiOutputQueue {
    writer: MidiEventWriter,
}

impl MidiOutputQueue {
    pub fn send_event(&mut self, due_us: u64, bytes: &[u8]) -> bool {
        self.writer.push(due_us, bytes)
    }

    /// Schedules every event of one cycle's output buffer.
    pub fn send_buffer(
        &mut self,
        events: &MidiBuffer,
        timing: &CycleTiming,
        diag: &mut DiagnosticSink,
    ) -> usize {
        let mut sent = 0;
        for event in events {
            if self.send_event(timing.output_due(event.time()), event.bytes()) {
                sent += 1;
            } else {
                diag.push(Diagnostic::MidiBufferFull);
            }
        }
        sent
    }
}

pub fn spawn_midi_input(
    mut device: Box<dyn RawMidiDevice>,
    clock: MonotonicClock,
    ring_bytes: usize,
    mut diag: DiagnosticSink,
    priority: Option<i32>,
) -> Result<(MidiThread, MidiInputQueue)> {
    let (mut writer, reader) = midi_event_ring(ring_bytes);
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let name = device.name().to_string();
    let handle = spawn_rt_thread("rtport-midi-in", priority, move || {
        let mut parser = MidiParser::<MAX_EVENT_SIZE>::new();
        let mut buf = [0_u8; 256];
        while flag.load(Ordering::Acquire) {
            match device.wait_readable(POLL_TIMEOUT) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    diag.push(Diagnostic::MidiDeviceLost {
                        errno: device_errno(&e),
                    });
                    return;
                }
            }
            let now = clock.now_us();
            loop {
                let read = match device.read(&mut buf) {
                    Ok(0) => break,
                    Ok(n) => n,
                    Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                    Err(e) => {
                        diag.push(Diagnostic::MidiDeviceLost {
                            errno: device_errno(&e),
                        });
                        return;
                    }
                };
                for &byte in &buf[..read] {
                    match parser.feed(byte, now) {
                        Some(Parsed::Message { timestamp, bytes }) => {
                            if !writer.push(timestamp, bytes) {
                                diag.push(Diagnostic::MidiInputOverflow);
                            }
                        }
                        Some(Parsed::Dropped { len, .. }) => {
                            diag.push(Diagnostic::MidiDropped { len })
                        }
                        None => {}
                    }
                }
            }
        }
    })?;
    Ok((
        MidiThread {
            name,
            running,
            handle: Some(handle),
        },
        MidiInputQueue {
            reader,
            scratch: [0; MAX_EVENT_SIZE],
        },
    ))
}

pub fn spawn_midi_output(
    mut device: Box<dyn RawMidiDevice>,
    clock: MonotonicClock,
    ring_bytes: usize,
    mut diag: DiagnosticSink,
    priority: Option<i32>,
) -> Result<(MidiThread, MidiOutputQueue)> {
    let (writer, mut reader) = midi_event_ring(ring_bytes);
    let running = Arc::new(AtomicBool::new(true));
    let flag = running.clone();
    let name = device.name().to_string();
    let handle = spawn_rt_thread("rtport-midi-out", priority, move || {
        let mut payload = [0_u8; MAX_EVENT_SIZE];
        // (due, len, written) of the event being sent.
        let mut pending: Option<(u64, usize, usize)> = None;
        while flag.load(Ordering::Acquire) {
            let (due, len, written) = match pending {
                Some(p) => p,
                None => match reader.pop(&mut payload) {
                    Some((due, len)) => (due, len, 0),
                    None => {
                        std::thread::sleep(Duration::from_micros(MAX_SLEEP_US));
                        continue;
                    }
                },
            };
            pending = Some((due, len, written));
            let now = clock.now_us();
            if due > now {
                std::thread::sleep(Duration::from_micros((due - now).min(MAX_SLEEP_US)));
                continue;
            }
            if written == 0 && now - due > LATE_REPORT_US {
                diag.push(Diagnostic::MidiLate {
                    late_us: now - due,
                });
            }
            match device.write(&payload[written..len]) {
                Ok(n) if written + n >= len => pending = None,
                Ok(0) => {
                    if let Err(e) = device.wait_writable(POLL_TIMEOUT) {
                        diag.push(Diagnostic::MidiDeviceLost {
                            errno: device_errno(&e),
                        });
                        return;
                    }
                }
                Ok(n) => pending = Some((due, len, written + n)),
                Err(e) if e.kind() == ErrorKind::Interrupted => {}
                Err(e) => {
                    diag.push(Diagnostic::MidiDeviceLost {
                        errno: device_errno(&e),
                    });
                    return;
                }
            }
        }
    })?;
    Ok((
        MidiThread {
            name,
            running,
            handle: Some(handle),
        },
        MidiOutputQueue { writer },
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diag::DiagnosticHub;
    use std::time::Instant;

    fn wait_until(mut f: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if f() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        false
    }

    #[test]
    fn memory_port_is_shared_between_clones() {
        let mut a = MemoryMidiPort::new("cable", 4);
        let mut b = a.clone();
        assert_eq!(a.write(&[1, 2, 3, 4, 5]).unwrap(), 4);
        assert!(b.wait_readable(Duration::from_millis(1)).unwrap());
        let mut buf = [0; 8];
        assert_eq!(b.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);
        assert!(!b.wait_readable(Duration::from_millis(1)).unwrap());
    }

    #[test]
    fn input_frames_are_relative_to_previous_cycle() {
        let timing = CycleTiming {
            start_us: 10_000,
            period_us: 1_000,
            frames: 48,
            sample_rate: 48_000,
        };
        assert_eq!(timing.input_frame(9_000), 0);
        assert_eq!(timing.input_frame(8_000), 0);
        assert_eq!(timing.input_frame(9_500), 24);
        assert_eq!(timing.input_frame(10_500), 47);
        assert_eq!(timing.output_due(48), 12_000);
    }

    #[test]
    fn interrupted_message_keeps_its_earlier_frame() {
        let hub = DiagnosticHub::new();
        let mut diag = hub.register("process");
        let (mut writer, reader) = midi_event_ring(1024);
        let mut queue = MidiInputQueue {
            reader,
            scratch: [0; MAX_EVENT_SIZE],
        };
        // The clock byte completes while the note is still being received.
        assert!(writer.push(2_640, &[0xF8]));
        assert!(writer.push(2_300, &[0x90, 0x40, 0x7F]));
        let timing = CycleTiming {
            start_us: 3_000,
            period_us: 1_000,
            frames: 48,
            sample_rate: 48_000,
        };
        let mut out = MidiBuffer::new(16);
        assert_eq!(queue.recv_events(&mut out, &timing, &mut diag), 2);
        let got: Vec<(u32, &[u8])> = out.iter().map(|e| (e.time(), e.bytes())).collect();
        assert_eq!(
            got,
            vec![
                (timing.input_frame(2_300), &[0x90, 0x40, 0x7F][..]),
                (timing.input_frame(2_640), &[0xF8][..]),
            ]
        );
        assert!(got[0].0 < got[1].0);
        assert_eq!(hub.drain(), 0);
    }

    #[test]
    fn input_thread_parses_and_queues() {
        let hub = DiagnosticHub::new();
        let clock = MonotonicClock::new();
        let mut cable = MemoryMidiPort::new("in", 1024);
        let (mut thread, mut queue) = spawn_midi_input(
            Box::new(cable.clone()),
            clock,
            4096,
            hub.register("midi-in"),
            None,
        )
        .unwrap();
        cable.write(&[0x90, 0x40, 0x7F, 0x40, 0x00, 0xF8]).unwrap();
        assert!(wait_until(|| cable.pending() == 0));

        let mut diag = hub.register("process");
        let mut out = MidiBuffer::new(16);
        let mut moved = 0;
        assert!(wait_until(|| {
            let timing = CycleTiming {
                start_us: clock.now_us() + 1,
                period_us: 1_000,
                frames: 48,
                sample_rate: 48_000,
            };
            moved += queue.recv_events(&mut out, &timing, &mut diag);
            moved == 3
        }));
        let got: Vec<&[u8]> = out.iter().map(|e| e.bytes()).collect();
        assert_eq!(got, vec![&[0x90, 0x40, 0x7F][..], &[0x90, 0x40, 0x00], &[0xF8]]);
        thread.stop();
        assert!(!thread.is_alive());
    }

    #[test]
    fn events_from_the_current_cycle_stay_queued() {
        let hub = DiagnosticHub::new();
        let clock = MonotonicClock::new();
        let mut cable = MemoryMidiPort::new("in", 64);
        let (_thread, mut queue) =
            spawn_midi_input(Box::new(cable.clone()), clock, 4096, hub.register("in"), None)
                .unwrap();
        let before = clock.now_us();
        cable.write(&[0xC0, 0x05]).unwrap();
        assert!(wait_until(|| cable.pending() == 0));
        std::thread::sleep(Duration::from_millis(5));

        let mut diag = hub.register("process");
        let mut out = MidiBuffer::new(4);
        let early = CycleTiming {
            start_us: before,
            period_us: 1_000,
            frames: 64,
            sample_rate: 48_000,
        };
        assert_eq!(queue.recv_events(&mut out, &early, &mut diag), 0);
        let later = CycleTiming {
            start_us: clock.now_us() + 1,
            ..early
        };
        assert_eq!(queue.recv_events(&mut out, &later, &mut diag), 1);
        assert_eq!(out.events()[0].bytes(), &[0xC0, 0x05]);
    }

    #[test]
    fn output_thread_writes_when_due() {
        let hub = DiagnosticHub::new();
        let clock = MonotonicClock::new();
        let mut cable = MemoryMidiPort::new("out", 1024);
        let (_thread, mut queue) = spawn_midi_output(
            Box::new(cable.clone()),
            clock,
            4096,
            hub.register("midi-out"),
            None,
        )
        .unwrap();
        let due = clock.now_us() + 20_000;
        assert!(queue.send_event(due, &[0xB0, 0x07, 0x64]));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cable.pending(), 0);
        assert!(wait_until(|| cable.pending() == 3));
        assert!(clock.now_us() >= due);
        let mut buf = [0; 3];
        cable.read(&mut buf).unwrap();
        assert_eq!(buf, [0xB0, 0x07, 0x64]);
    }
}
