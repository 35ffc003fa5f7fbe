pub mod backend;
pub mod clock;
pub mod config;
pub mod diag;
pub mod error;
pub mod hw;
pub mod midi;
pub mod mutex;
pub mod port;
pub mod registry;
pub mod ringbuffer;
pub mod sync;

pub use backend::{
    Backend, Control, DeviceListNotifier, EngineState, NotificationHandler, ProcessHandler,
    ProcessScope,
};
pub use config::{BackendConfig, MidiDeviceConfig, SlaveConfig};
pub use error::{Error, Result};
pub use hw::options::{DriverKind, DriverOptions, DummyOptions, Generator};
pub use midi::buffer::MidiBuffer;
pub use port::{DataType, LatencyRange, PortFlags, PortId};
pub use registry::{PortRegistry, Snapshot};
