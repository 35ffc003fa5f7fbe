use super::process::ProcessScope;

/// What the process thread should do after a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Control {
    #[default]
    Continue,
    /// Stop the engine; reported through `NotificationHandler::halted`.
    Quit,
}

/// Called once per period on the process thread. Must not block.
pub trait ProcessHandler: Send + 'static {
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Control;
}

impl<F> ProcessHandler for F
where
    F: FnMut(&mut ProcessScope<'_>) -> Control + Send + 'static,
{
    fn process(&mut self, scope: &mut ProcessScope<'_>) -> Control {
        self(scope)
    }
}

/// Engine events. Most methods run on the process thread between cycles and
/// must not block. Buffer size and sample rate changes are reported from the
/// thread that requested them.
#[allow(unused_variables)]
pub trait NotificationHandler: Send + 'static {
    fn buffer_size_changed(&mut self, frames: usize) {}
    fn sample_rate_changed(&mut self, sample_rate: u32) {}
    fn xrun(&mut self) {}
    fn freewheel(&mut self, enabled: bool) {}
    fn port_registration_changed(&mut self) {}
    fn port_connection_changed(&mut self, source: &str, destination: &str, connected: bool) {}
    fn graph_order_changed(&mut self) {}
    fn latency_changed(&mut self) {}
    /// The set of available devices changed; deferred from whichever thread
    /// noticed it.
    fn device_list_changed(&mut self) {}
    fn slave_failed(&mut self, name: &str) {}
    /// The engine stopped on its own. It stays halted until `stop()` or
    /// `start()` is called.
    fn halted(&mut self, reason: &str) {}
}

impl NotificationHandler for () {}

pub(crate) struct Silence;

impl ProcessHandler for Silence {
    fn process(&mut self, _scope: &mut ProcessScope<'_>) -> Control {
        Control::Continue
    }
}
