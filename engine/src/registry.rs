//! Port registry with copy-on-write snapshots.
//!
//! Readers (including the process thread) load the current [`Snapshot`]
//! through `ArcSwap` and never wait. Writers are serialized by a mutex, clone
//! the snapshot, mutate the copy and publish it with a single pointer swap.
//! Ports that a mutation does not touch stay shared between snapshots.

use crate::error::{Error, Result};
use crate::midi::buffer::MidiBuffer;
use crate::port::{DataType, LatencyRange, Port, PortFlags, PortId, natural_cmp};
use arc_swap::{ArcSwap, Guard};
use parking_lot::Mutex;
use regex::Regex;
use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, error};

pub const SYSTEM_INSTANCE: &str = "system";

/// A connect or disconnect waiting to be reported, source first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionChange {
    pub source: String,
    pub destination: String,
    pub connected: bool,
}

/// What else changed since the last drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PendingFlags {
    pub registrations: bool,
    pub latency: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PortCounts {
    pub audio: usize,
    pub midi: usize,
}

/// One consistent view of every port and its connections.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    ports: HashMap<PortId, Arc<Port>>,
    by_name: HashMap<String, PortId>,
    order: Vec<PortId>,
}

impl Snapshot {
    pub fn port(&self, id: PortId) -> Option<&Port> {
        self.ports.get(&id).map(|p| p.as_ref())
    }

    pub fn port_by_name(&self, name: &str) -> Option<&Port> {
        self.by_name.get(name).and_then(|id| self.port(*id))
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Ports in natural name order.
    pub fn iter(&self) -> impl Iterator<Item = &Port> {
        self.order.iter().filter_map(|id| self.port(*id))
    }

    fn position(&self, name: &str) -> std::result::Result<usize, usize> {
        self.order.binary_search_by(|slot| {
            self.ports
                .get(slot)
                .map_or(CmpOrdering::Less, |p| natural_cmp(&p.name, name))
        })
    }

    fn insert(&mut self, port: Port) {
        let pos = match self.position(&port.name) {
            Ok(pos) | Err(pos) => pos,
        };
        self.order.insert(pos, port.id);
        self.by_name.insert(port.name.clone(), port.id);
        self.ports.insert(port.id, Arc::new(port));
    }

    fn remove(&mut self, id: PortId) -> Option<Arc<Port>> {
        let port = self.ports.remove(&id)?;
        self.by_name.remove(&port.name);
        self.order.retain(|other| *other != id);
        Some(port)
    }

    fn port_mut(&mut self, id: PortId) -> Option<&mut Port> {
        self.ports.get_mut(&id).map(Arc::make_mut)
    }

    fn require(&self, id: PortId) -> Result<&Port> {
        self.port(id)
            .ok_or_else(|| Error::InvalidPort(id.to_string()))
    }

    fn unlink(&mut self, a: PortId, b: PortId) -> Option<ConnectionChange> {
        let pa = self.port(a)?;
        let pb = self.port(b)?;
        let change = if pa.is_output() {
            ConnectionChange {
                source: pa.name.clone(),
                destination: pb.name.clone(),
                connected: false,
            }
        } else {
            ConnectionChange {
                source: pb.name.clone(),
                destination: pa.name.clone(),
                connected: false,
            }
        };
        if let Some(p) = self.port_mut(a) {
            p.connections.remove(&b);
        }
        if let Some(p) = self.port_mut(b) {
            p.connections.remove(&a);
        }
        Some(change)
    }

    fn unlink_all(&mut self, id: PortId, changes: &mut Vec<ConnectionChange>) {
        let peers: Vec<PortId> = self
            .port(id)
            .map(|p| p.connections.iter().copied().collect())
            .unwrap_or_default();
        for peer in peers {
            changes.extend(self.unlink(id, peer));
        }
    }

    /// Output buffer of `id` for this cycle.
    #[allow(clippy::mut_from_ref)]
    pub(crate) fn audio_output(&self, id: PortId, nframes: usize) -> Option<&mut [f32]> {
        let port = self.port(id)?;
        if !port.is_output() {
            return None;
        }
        port.buffer().audio_frames(nframes)
    }

    /// Input buffer of `id`: the sum of every connected output, silence when
    /// nothing is connected.
    pub(crate) fn audio_input(&self, id: PortId, nframes: usize) -> Option<&[f32]> {
        let port = self.port(id)?;
        if !port.is_input() {
            return None;
        }
        let dst = port.buffer().audio_frames(nframes)?;
        let mut first = true;
        for src in port.connections.iter().filter_map(|c| self.port(*c)) {
            let Some(src) = src.buffer().audio_frames(nframes) else {
                continue;
            };
            if first {
                dst.copy_from_slice(src);
                first = false;
            } else {
                for (d, s) in dst.iter_mut().zip(src.iter()) {
                    *d += *s;
                }
            }
        }
        if first {
            dst.fill(0.0);
        }
        Some(&*dst)
    }

    #[allow(clippy::mut_from_ref)]
    pub(crate) fn midi_output(&self, id: PortId) -> Option<&mut MidiBuffer> {
        let port = self.port(id)?;
        if !port.is_output() {
            return None;
        }
        port.buffer().midi_events()
    }

    /// Input events of `id`: every connected output merged, then stably
    /// sorted by time.
    pub(crate) fn midi_input(&self, id: PortId) -> Option<&MidiBuffer> {
        let port = self.port(id)?;
        if !port.is_input() {
            return None;
        }
        let dst = port.buffer().midi_events()?;
        dst.clear();
        for src in port.connections.iter().filter_map(|c| self.port(*c)) {
            if let Some(src) = src.buffer().midi_events() {
                dst.append_unordered(src);
            }
        }
        dst.sort_stable();
        Some(&*dst)
    }
}

#[derive(Debug)]
pub struct PortRegistry {
    instance: String,
    snapshot: ArcSwap<Snapshot>,
    writer: Mutex<()>,
    next_id: AtomicU32,
    changes: Mutex<Vec<ConnectionChange>>,
    registrations_changed: AtomicBool,
    latency_changed: AtomicBool,
}

impl Default for PortRegistry {
    fn default() -> Self {
        Self::new(SYSTEM_INSTANCE)
    }
}

impl PortRegistry {
    pub fn new(instance: &str) -> Self {
        Self {
            instance: instance.to_string(),
            snapshot: ArcSwap::from_pointee(Snapshot::default()),
            writer: Mutex::new(()),
            next_id: AtomicU32::new(1),
            changes: Mutex::new(Vec::new()),
            registrations_changed: AtomicBool::new(false),
            latency_changed: AtomicBool::new(false),
        }
    }

    pub fn instance_name(&self) -> &str {
        &self.instance
    }

    /// Current snapshot without touching a lock. Safe on the process thread.
    pub fn snapshot(&self) -> Guard<Arc<Snapshot>> {
        self.snapshot.load()
    }

    /// Current snapshot as an owned handle, for holding across calls.
    pub fn load_full(&self) -> Arc<Snapshot> {
        self.snapshot.load_full()
    }

    fn full_name(&self, name: &str) -> String {
        let prefix = format!("{}:", self.instance);
        if name.starts_with(&prefix) {
            name.to_string()
        } else {
            format!("{prefix}{name}")
        }
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Snapshot) -> Result<R>) -> Result<R> {
        let _guard = self.writer.lock();
        let mut next = Snapshot::clone(&self.snapshot.load());
        let result = f(&mut next)?;
        self.snapshot.store(Arc::new(next));
        Ok(result)
    }

    fn queue(&self, changes: Vec<ConnectionChange>) {
        if changes.is_empty() {
            return;
        }
        for change in &changes {
            debug!(
                "{} {} -> {}",
                if change.connected { "connect" } else { "disconnect" },
                change.source,
                change.destination
            );
        }
        self.changes.lock().extend(changes);
    }

    /// Registers a client port. The instance prefix is added when missing.
    pub fn register_port(&self, name: &str, data_type: DataType, flags: PortFlags) -> Result<PortId> {
        let short = name
            .strip_prefix(&format!("{}:", self.instance))
            .unwrap_or(name);
        if short.is_empty() {
            return Err(Error::InvalidName(name.to_string()));
        }
        if flags.is_physical() {
            return Err(Error::InvalidName(format!(
                "{name}: physical ports are reserved to the backend"
            )));
        }
        self.add_port(self.full_name(short), data_type, flags, |_| {})
    }

    /// Registers a hardware-facing port. `flags` should carry the physical
    /// and terminal bits.
    pub(crate) fn add_system_port(
        &self,
        name: &str,
        data_type: DataType,
        flags: PortFlags,
        pretty_name: Option<String>,
        hw_name: Option<String>,
        latency: LatencyRange,
    ) -> Result<PortId> {
        self.add_port(self.full_name(name), data_type, flags, move |port| {
            port.pretty_name = pretty_name;
            port.hw_name = hw_name;
            if flags.is_output() {
                port.capture_latency = latency;
            } else {
                port.playback_latency = latency;
            }
        })
    }

    fn add_port(
        &self,
        name: String,
        data_type: DataType,
        flags: PortFlags,
        init: impl FnOnce(&mut Port),
    ) -> Result<PortId> {
        if !flags.has_direction() {
            return Err(Error::InvalidName(format!(
                "{name}: a port must be exactly one of input or output"
            )));
        }
        let id = self.mutate(|snap| {
            if snap.by_name.contains_key(&name) {
                return Err(Error::DuplicateName(name));
            }
            let id = PortId(self.next_id.fetch_add(1, Ordering::Relaxed));
            let mut port = Port::new(id, name, data_type, flags);
            init(&mut port);
            snap.insert(port);
            Ok(id)
        })?;
        self.registrations_changed.store(true, Ordering::Release);
        Ok(id)
    }

    /// Disconnects every connection of `id`, then removes it.
    pub fn unregister_port(&self, id: PortId) -> Result<()> {
        let result = self.mutate(|snap| {
            snap.require(id)?;
            let mut changes = Vec::new();
            snap.unlink_all(id, &mut changes);
            snap.remove(id);
            Ok(changes)
        });
        match result {
            Ok(changes) => {
                self.queue(changes);
                self.registrations_changed.store(true, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                error!("unregister_port: {e}");
                Err(e)
            }
        }
    }

    /// Removes every physical terminal port, disconnecting it first.
    pub fn unregister_system_ports(&self) -> usize {
        let result = self.mutate(|snap| {
            let ids: Vec<PortId> = snap
                .iter()
                .filter(|p| p.is_physical() && p.is_terminal())
                .map(|p| p.id)
                .collect();
            let mut changes = Vec::new();
            for id in &ids {
                snap.unlink_all(*id, &mut changes);
                snap.remove(*id);
            }
            Ok((ids.len(), changes))
        });
        match result {
            Ok((count, changes)) => {
                self.queue(changes);
                if count > 0 {
                    self.registrations_changed.store(true, Ordering::Release);
                }
                count
            }
            Err(e) => {
                error!("unregister_system_ports: {e}");
                0
            }
        }
    }

    pub fn rename_port(&self, id: PortId, new_name: &str) -> Result<()> {
        let short = new_name
            .strip_prefix(&format!("{}:", self.instance))
            .unwrap_or(new_name);
        if short.is_empty() {
            return Err(Error::InvalidName(new_name.to_string()));
        }
        let full = self.full_name(short);
        self.mutate(|snap| {
            snap.require(id)?;
            if let Some(existing) = snap.by_name.get(&full) {
                if *existing == id {
                    return Ok(());
                }
                return Err(Error::DuplicateName(full));
            }
            let Some(mut port) = snap.remove(id).map(|p| Port::clone(&p)) else {
                return Err(Error::InvalidPort(id.to_string()));
            };
            port.name = full;
            snap.insert(port);
            Ok(())
        })?;
        self.registrations_changed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn set_pretty_name(&self, id: PortId, pretty: Option<&str>) -> Result<()> {
        self.mutate(|snap| {
            let port = snap
                .port_mut(id)
                .ok_or_else(|| Error::InvalidPort(id.to_string()))?;
            port.pretty_name = pretty.map(str::to_string);
            Ok(())
        })
    }

    pub fn set_latency_range(&self, id: PortId, playback: bool, range: LatencyRange) -> Result<()> {
        self.mutate(|snap| {
            let port = snap
                .port_mut(id)
                .ok_or_else(|| Error::InvalidPort(id.to_string()))?;
            if playback {
                port.playback_latency = range;
            } else {
                port.capture_latency = range;
            }
            Ok(())
        })?;
        self.latency_changed.store(true, Ordering::Release);
        Ok(())
    }

    pub fn connect(&self, a: PortId, b: PortId) -> Result<()> {
        let change = self.mutate(|snap| {
            let pa = snap.require(a)?;
            let pb = snap.require(b)?;
            pa.compatibility(pb)
                .map_err(|reason| Error::IncompatiblePorts {
                    from: pa.name.clone(),
                    to: pb.name.clone(),
                    reason,
                })?;
            let (source, destination) = if pa.is_output() {
                (pa.name.clone(), pb.name.clone())
            } else {
                (pb.name.clone(), pa.name.clone())
            };
            if pa.connections.contains(&b) {
                return Err(Error::AlreadyConnected(source, destination));
            }
            if let Some(p) = snap.port_mut(a) {
                p.connections.insert(b);
            }
            if let Some(p) = snap.port_mut(b) {
                p.connections.insert(a);
            }
            Ok(ConnectionChange {
                source,
                destination,
                connected: true,
            })
        })?;
        self.queue(vec![change]);
        Ok(())
    }

    pub fn connect_by_name(&self, a: &str, b: &str) -> Result<()> {
        let (a, b) = self.resolve_pair(a, b)?;
        self.connect(a, b)
    }

    pub fn disconnect(&self, a: PortId, b: PortId) -> Result<()> {
        let change = self.mutate(|snap| {
            let pa = snap.require(a)?;
            let pb = snap.require(b)?;
            if !pa.connections.contains(&b) {
                return Err(Error::NotConnected(pa.name.clone(), pb.name.clone()));
            }
            snap.unlink(a, b)
                .ok_or_else(|| Error::InvalidPort(b.to_string()))
        })?;
        self.queue(vec![change]);
        Ok(())
    }

    pub fn disconnect_by_name(&self, a: &str, b: &str) -> Result<()> {
        let (a, b) = self.resolve_pair(a, b)?;
        self.disconnect(a, b)
    }

    pub fn disconnect_all(&self, id: PortId) -> Result<()> {
        let changes = self.mutate(|snap| {
            snap.require(id)?;
            let mut changes = Vec::new();
            snap.unlink_all(id, &mut changes);
            Ok(changes)
        })?;
        self.queue(changes);
        Ok(())
    }

    fn resolve_pair(&self, a: &str, b: &str) -> Result<(PortId, PortId)> {
        let ia = self
            .port_by_name(a)
            .ok_or_else(|| Error::InvalidPort(a.to_string()))?;
        let ib = self
            .port_by_name(b)
            .ok_or_else(|| Error::InvalidPort(b.to_string()))?;
        Ok((ia, ib))
    }

    /// Names of matching ports in natural order. An empty pattern matches
    /// everything; every bit of `flags` must be set on a match.
    pub fn get_ports(
        &self,
        pattern: &str,
        data_type: Option<DataType>,
        flags: PortFlags,
    ) -> Result<Vec<String>> {
        let regex = if pattern.is_empty() {
            None
        } else {
            Some(Regex::new(pattern).map_err(|e| Error::InvalidPattern {
                pattern: pattern.to_string(),
                message: e.to_string(),
            })?)
        };
        let snap = self.snapshot();
        Ok(snap
            .iter()
            .filter(|p| data_type.is_none_or(|t| p.data_type == t))
            .filter(|p| p.flags.contains(flags))
            .filter(|p| regex.as_ref().is_none_or(|r| r.is_match(&p.name)))
            .map(|p| p.name.clone())
            .collect())
    }

    /// Names of the ports connected to `id`, in natural order.
    pub fn get_connections(&self, id: PortId) -> Result<Vec<String>> {
        let snap = self.snapshot();
        let port = snap.require(id)?;
        let mut names: Vec<String> = port
            .connections
            .iter()
            .filter_map(|c| snap.port(*c))
            .map(|p| p.name.clone())
            .collect();
        names.sort_by(|a, b| natural_cmp(a, b));
        Ok(names)
    }

    /// Accepts both `system:capture_1` and `capture_1`.
    pub fn port_by_name(&self, name: &str) -> Option<PortId> {
        let snap = self.snapshot();
        snap.by_name
            .get(name)
            .or_else(|| snap.by_name.get(&self.full_name(name)))
            .copied()
    }

    pub fn port_name(&self, id: PortId) -> Option<String> {
        self.snapshot().port(id).map(|p| p.name.clone())
    }

    pub fn port_data_type(&self, id: PortId) -> Option<DataType> {
        self.snapshot().port(id).map(|p| p.data_type)
    }

    pub fn port_flags(&self, id: PortId) -> Option<PortFlags> {
        self.snapshot().port(id).map(|p| p.flags)
    }

    pub fn pretty_name(&self, id: PortId) -> Option<String> {
        self.snapshot().port(id).and_then(|p| p.pretty_name.clone())
    }

    pub fn latency_range(&self, id: PortId, playback: bool) -> Option<LatencyRange> {
        self.snapshot().port(id).map(|p| p.latency_range(playback))
    }

    pub fn connected(&self, id: PortId) -> Result<bool> {
        Ok(self.snapshot().require(id)?.is_connected())
    }

    pub fn connected_to(&self, id: PortId, other: &str) -> Result<bool> {
        let snap = self.snapshot();
        let port = snap.require(id)?;
        let Some(other) = snap
            .port_by_name(other)
            .or_else(|| snap.port_by_name(&self.full_name(other)))
        else {
            return Ok(false);
        };
        Ok(port.connections.contains(&other.id))
    }

    /// Connected to at least one hardware-facing port.
    pub fn physically_connected(&self, id: PortId) -> Result<bool> {
        let snap = self.snapshot();
        let port = snap.require(id)?;
        Ok(port
            .connections
            .iter()
            .filter_map(|c| snap.port(*c))
            .any(|p| p.is_physical()))
    }

    pub fn get_physical_inputs(&self, data_type: DataType) -> Vec<String> {
        self.physical(data_type, PortFlags::IS_INPUT)
    }

    pub fn get_physical_outputs(&self, data_type: DataType) -> Vec<String> {
        self.physical(data_type, PortFlags::IS_OUTPUT)
    }

    fn physical(&self, data_type: DataType, direction: PortFlags) -> Vec<String> {
        self.snapshot()
            .iter()
            .filter(|p| p.data_type == data_type)
            .filter(|p| p.flags.contains(direction | PortFlags::IS_PHYSICAL))
            .map(|p| p.name.clone())
            .collect()
    }

    pub fn n_physical_inputs(&self) -> PortCounts {
        self.count_physical(PortFlags::IS_INPUT)
    }

    pub fn n_physical_outputs(&self) -> PortCounts {
        self.count_physical(PortFlags::IS_OUTPUT)
    }

    fn count_physical(&self, direction: PortFlags) -> PortCounts {
        let mut counts = PortCounts::default();
        for port in self.snapshot().iter() {
            if !port.flags.contains(direction | PortFlags::IS_PHYSICAL) {
                continue;
            }
            match port.data_type {
                DataType::Audio => counts.audio += 1,
                DataType::Midi => counts.midi += 1,
            }
        }
        counts
    }

    /// Swaps the queued connection changes into `out` and clears the pending
    /// flags. Returns `None` without waiting when a writer holds the queue.
    ///
    /// `out` should be empty; its allocation is reused for the next batch.
    pub fn take_changes(&self, out: &mut Vec<ConnectionChange>) -> Option<PendingFlags> {
        let mut queue = self.changes.try_lock()?;
        std::mem::swap(&mut *queue, out);
        Some(PendingFlags {
            registrations: self.registrations_changed.swap(false, Ordering::AcqRel),
            latency: self.latency_changed.swap(false, Ordering::AcqRel),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> PortRegistry {
        PortRegistry::new(SYSTEM_INSTANCE)
    }

    fn out(reg: &PortRegistry, name: &str) -> PortId {
        reg.register_port(name, DataType::Audio, PortFlags::IS_OUTPUT)
            .unwrap()
    }

    fn inp(reg: &PortRegistry, name: &str) -> PortId {
        reg.register_port(name, DataType::Audio, PortFlags::IS_INPUT)
            .unwrap()
    }

    #[test]
    fn duplicate_name_leaves_snapshot_unchanged() {
        let reg = registry();
        out(&reg, "synth_out");
        let before = reg.load_full();
        let err = reg
            .register_port("synth_out", DataType::Midi, PortFlags::IS_INPUT)
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateName(ref n) if n == "system:synth_out"));
        assert_eq!(*before, *reg.load_full());
    }

    #[test]
    fn invalid_names_are_rejected() {
        let reg = registry();
        assert!(matches!(
            reg.register_port("", DataType::Audio, PortFlags::IS_INPUT),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            reg.register_port(
                "hw",
                DataType::Audio,
                PortFlags::IS_INPUT | PortFlags::IS_PHYSICAL
            ),
            Err(Error::InvalidName(_))
        ));
        assert!(matches!(
            reg.register_port("both", DataType::Audio, PortFlags::IS_INPUT | PortFlags::IS_OUTPUT),
            Err(Error::InvalidName(_))
        ));
    }

    #[test]
    fn connections_are_symmetric() {
        let reg = registry();
        let a = out(&reg, "a_out");
        let b = inp(&reg, "b_in");
        reg.connect(b, a).unwrap();
        let snap = reg.snapshot();
        assert!(snap.port(a).unwrap().connections().contains(&b));
        assert!(snap.port(b).unwrap().connections().contains(&a));
        drop(snap);

        reg.disconnect(a, b).unwrap();
        let snap = reg.snapshot();
        assert!(snap.port(a).unwrap().connections().is_empty());
        assert!(snap.port(b).unwrap().connections().is_empty());
    }

    #[test]
    fn incompatible_connections_create_no_edge() {
        let reg = registry();
        let o1 = out(&reg, "o1");
        let o2 = out(&reg, "o2");
        let i1 = inp(&reg, "i1");
        let i2 = inp(&reg, "i2");
        let m = reg
            .register_port("m_in", DataType::Midi, PortFlags::IS_INPUT)
            .unwrap();

        assert!(matches!(reg.connect(o1, o2), Err(Error::IncompatiblePorts { .. })));
        assert!(matches!(reg.connect(i1, i2), Err(Error::IncompatiblePorts { .. })));
        assert!(matches!(reg.connect(o1, m), Err(Error::IncompatiblePorts { .. })));
        assert!(matches!(reg.connect(o1, o1), Err(Error::IncompatiblePorts { .. })));
        assert!(matches!(reg.connect(o1, PortId(999)), Err(Error::InvalidPort(_))));

        reg.connect(o1, i1).unwrap();
        assert!(matches!(reg.connect(o1, i1), Err(Error::AlreadyConnected(_, _))));
        assert!(matches!(reg.disconnect(o2, i2), Err(Error::NotConnected(_, _))));

        let snap = reg.snapshot();
        let edges: usize = snap.iter().map(|p| p.connections().len()).sum();
        assert_eq!(edges, 2);
    }

    #[test]
    fn get_ports_filters_and_orders_naturally() {
        let reg = registry();
        for i in [10, 2, 1] {
            inp(&reg, &format!("track{i}"));
        }
        out(&reg, "track3_out");
        reg.register_port("midi_in", DataType::Midi, PortFlags::IS_INPUT)
            .unwrap();

        let names = reg
            .get_ports("track[0-9]+$", Some(DataType::Audio), PortFlags::IS_INPUT)
            .unwrap();
        assert_eq!(names, vec!["system:track1", "system:track2", "system:track10"]);

        let all = reg.get_ports("", None, PortFlags::NONE).unwrap();
        assert_eq!(all.len(), 5);

        let midi = reg.get_ports("", Some(DataType::Midi), PortFlags::NONE).unwrap();
        assert_eq!(midi, vec!["system:midi_in"]);

        assert!(matches!(
            reg.get_ports("(", None, PortFlags::NONE),
            Err(Error::InvalidPattern { .. })
        ));
    }

    #[test]
    fn unregister_disconnects_and_queues_notifications() {
        let reg = registry();
        let a = out(&reg, "a");
        let b = inp(&reg, "b");
        let c = inp(&reg, "c");
        reg.connect(a, b).unwrap();
        reg.connect(a, c).unwrap();

        let mut changes = Vec::new();
        let flags = reg.take_changes(&mut changes).unwrap();
        assert!(flags.registrations);
        assert_eq!(changes.len(), 2);
        changes.clear();

        reg.unregister_port(a).unwrap();
        let flags = reg.take_changes(&mut changes).unwrap();
        assert!(flags.registrations);
        assert_eq!(
            changes,
            vec![
                ConnectionChange {
                    source: "system:a".into(),
                    destination: "system:b".into(),
                    connected: false,
                },
                ConnectionChange {
                    source: "system:a".into(),
                    destination: "system:c".into(),
                    connected: false,
                },
            ]
        );
        assert!(!reg.connected(b).unwrap());
        assert!(matches!(reg.unregister_port(a), Err(Error::InvalidPort(_))));

        changes.clear();
        let flags = reg.take_changes(&mut changes).unwrap();
        assert_eq!(flags, PendingFlags::default());
        assert!(changes.is_empty());
    }

    #[test]
    fn old_snapshots_are_unaffected_by_writes() {
        let reg = registry();
        let a = out(&reg, "a");
        let b = inp(&reg, "b");
        let before = reg.load_full();
        reg.connect(a, b).unwrap();
        reg.rename_port(b, "renamed").unwrap();

        assert!(before.port(a).unwrap().connections().is_empty());
        assert!(before.port_by_name("system:b").is_some());
        let now = reg.snapshot();
        assert!(now.port_by_name("system:b").is_none());
        assert_eq!(now.port_by_name("system:renamed").map(|p| p.id()), Some(b));
    }

    #[test]
    fn rename_keeps_connections_and_rejects_duplicates() {
        let reg = registry();
        let a = out(&reg, "a");
        let b = inp(&reg, "b");
        reg.connect(a, b).unwrap();
        assert!(matches!(reg.rename_port(a, "b"), Err(Error::DuplicateName(_))));
        reg.rename_port(a, "z10").unwrap();
        assert_eq!(reg.get_connections(b).unwrap(), vec!["system:z10"]);
        assert!(reg.connected_to(b, "z10").unwrap());
        assert_eq!(reg.port_by_name("system:z10"), Some(a));
        assert_eq!(reg.port_by_name("z10"), Some(a));
    }

    #[test]
    fn physical_queries_and_system_teardown() {
        let reg = registry();
        let phys = PortFlags::IS_PHYSICAL | PortFlags::IS_TERMINAL;
        let cap = reg
            .add_system_port(
                "capture_1",
                DataType::Audio,
                PortFlags::IS_OUTPUT | phys,
                None,
                Some("hw:0,0".into()),
                LatencyRange::fixed(128),
            )
            .unwrap();
        reg.add_system_port(
            "midi_playback_dummy_1",
            DataType::Midi,
            PortFlags::IS_INPUT | phys,
            None,
            None,
            LatencyRange::default(),
        )
        .unwrap();
        let client = inp(&reg, "mixer_in");
        reg.connect(cap, client).unwrap();

        assert_eq!(reg.get_physical_outputs(DataType::Audio), vec!["system:capture_1"]);
        assert_eq!(
            reg.get_physical_inputs(DataType::Midi),
            vec!["system:midi_playback_dummy_1"]
        );
        assert_eq!(reg.n_physical_outputs(), PortCounts { audio: 1, midi: 0 });
        assert_eq!(reg.n_physical_inputs(), PortCounts { audio: 0, midi: 1 });
        assert_eq!(reg.latency_range(cap, false), Some(LatencyRange::fixed(128)));
        assert!(reg.physically_connected(client).unwrap());

        assert_eq!(reg.unregister_system_ports(), 2);
        assert_eq!(reg.snapshot().len(), 1);
        assert!(!reg.connected(client).unwrap());
    }

    #[test]
    fn audio_inputs_sum_connected_outputs() {
        let reg = registry();
        let a = out(&reg, "a");
        let b = out(&reg, "b");
        let sum = inp(&reg, "sum");
        let idle = inp(&reg, "idle");
        reg.connect(a, sum).unwrap();
        reg.connect(b, sum).unwrap();

        let snap = reg.snapshot();
        snap.audio_output(a, 4).unwrap().copy_from_slice(&[1.0, 2.0, 3.0, 4.0]);
        snap.audio_output(b, 4).unwrap().copy_from_slice(&[0.5, 0.5, 0.5, 0.5]);
        assert_eq!(snap.audio_input(sum, 4).unwrap(), &[1.5, 2.5, 3.5, 4.5]);
        assert_eq!(snap.audio_input(idle, 4).unwrap(), &[0.0; 4]);
        assert!(snap.audio_input(a, 4).is_none());
        assert!(snap.audio_output(sum, 4).is_none());
    }

    #[test]
    fn midi_inputs_merge_in_time_order() {
        let reg = registry();
        let a = reg
            .register_port("ma", DataType::Midi, PortFlags::IS_OUTPUT)
            .unwrap();
        let b = reg
            .register_port("mb", DataType::Midi, PortFlags::IS_OUTPUT)
            .unwrap();
        let dst = reg
            .register_port("mdst", DataType::Midi, PortFlags::IS_INPUT)
            .unwrap();
        reg.connect(a, dst).unwrap();
        reg.connect(b, dst).unwrap();

        let snap = reg.snapshot();
        let buf = snap.midi_output(a).unwrap();
        buf.put(2, &[0x90, 1, 1]).unwrap();
        buf.put(9, &[0x90, 2, 1]).unwrap();
        let buf = snap.midi_output(b).unwrap();
        buf.put(5, &[0x90, 3, 1]).unwrap();

        let times: Vec<u32> = snap.midi_input(dst).unwrap().iter().map(|e| e.time()).collect();
        assert_eq!(times, vec![2, 5, 9]);
    }

    #[test]
    fn readers_never_see_partial_updates() {
        let reg = Arc::new(registry());
        let writer = {
            let reg = reg.clone();
            std::thread::spawn(move || {
                for i in 0..300 {
                    let id = reg
                        .register_port(&format!("p{i}"), DataType::Audio, PortFlags::IS_OUTPUT)
                        .unwrap();
                    if i % 3 == 0 {
                        reg.unregister_port(id).unwrap();
                    }
                }
            })
        };
        for _ in 0..2_000 {
            let snap = reg.snapshot();
            assert_eq!(snap.by_name.len(), snap.order.len());
            assert_eq!(snap.ports.len(), snap.order.len());
            for port in snap.iter() {
                assert_eq!(snap.by_name.get(port.name()), Some(&port.id()));
            }
        }
        writer.join().unwrap();
        assert_eq!(reg.snapshot().len(), 200);
    }
}
