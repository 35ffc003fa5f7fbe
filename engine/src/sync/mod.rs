pub mod dll;
pub mod slave;

pub use dll::Dll;
pub use slave::{SlaveLink, SlaveThread, SlaveWorker, SyncPhase, slave_pair};

use parking_lot::Mutex;

/// Hands slave links between the control thread and the process thread.
///
/// The process thread only ever `try_lock`s, so a busy control thread delays
/// a hand-over by a cycle instead of blocking audio.
#[derive(Debug, Default)]
pub struct SlaveExchange {
    incoming: Mutex<Vec<SlaveLink>>,
    removals: Mutex<Vec<String>>,
    retired: Mutex<Vec<SlaveLink>>,
}

impl SlaveExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&self, link: SlaveLink) {
        self.incoming.lock().push(link);
    }

    pub fn request_removal(&self, name: &str) {
        self.removals.lock().push(name.to_string());
    }

    /// Takes back a link the process thread has let go of.
    pub fn take_retired(&self, name: &str) -> Option<SlaveLink> {
        let mut retired = self.retired.lock();
        let index = retired.iter().position(|l| l.name() == name)?;
        Some(retired.swap_remove(index))
    }

    /// Takes back every link and forgets pending removals. Only valid once
    /// the process thread has exited.
    pub fn reclaim_all(&self) -> Vec<SlaveLink> {
        self.removals.lock().clear();
        let mut links = std::mem::take(&mut *self.retired.lock());
        links.append(&mut self.incoming.lock());
        links
    }

    /// Process-thread side: adopts new links and retires removed ones.
    pub(crate) fn poll(&self, active: &mut Vec<SlaveLink>) {
        if let Some(mut incoming) = self.incoming.try_lock()
            && !incoming.is_empty()
        {
            active.append(&mut incoming);
        }
        let Some(mut removals) = self.removals.try_lock() else {
            return;
        };
        if removals.is_empty() {
            return;
        }
        let Some(mut retired) = self.retired.try_lock() else {
            return;
        };
        removals.retain(|name| {
            let Some(index) = active.iter().position(|l| l.name() == name) else {
                // Not adopted yet; keep the request until it is.
                return true;
            };
            retired.push(active.swap_remove(index));
            false
        });
    }

    /// Returns every active link to the retired list when the process thread
    /// stops.
    pub(crate) fn retire_all(&self, active: &mut Vec<SlaveLink>) {
        self.retired.lock().append(active);
    }
}
