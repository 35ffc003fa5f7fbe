#[cfg(target_os = "linux")]
pub mod alsa;
pub mod config;
pub mod dummy;
pub mod error_fmt;
pub mod latency;
pub mod options;
pub mod ports;
pub mod prefill;
pub mod rt;
pub mod traits;

#[cfg(not(target_os = "linux"))]
use crate::error::Error;
use crate::error::Result;
use options::{DriverKind, DriverOptions};

pub use dummy::DummyDriver;
pub use traits::{HwDriver, WaitStatus};

#[cfg(target_os = "linux")]
pub use self::alsa::AlsaDriver;

/// Every device driver the backend can run.
#[derive(Debug)]
pub enum AnyDriver {
    Dummy(DummyDriver),
    #[cfg(target_os = "linux")]
    Alsa(AlsaDriver),
}

#[cfg(target_os = "linux")]
crate::dispatch_hw_driver!(AnyDriver { Dummy, Alsa });
#[cfg(not(target_os = "linux"))]
crate::dispatch_hw_driver!(AnyDriver { Dummy });

impl AnyDriver {
    pub fn open(options: &DriverOptions) -> Result<Self> {
        match options.kind {
            DriverKind::Dummy => Ok(AnyDriver::Dummy(DummyDriver::new(options)?)),
            #[cfg(target_os = "linux")]
            DriverKind::Alsa => Ok(AnyDriver::Alsa(AlsaDriver::open(options)?)),
            #[cfg(not(target_os = "linux"))]
            DriverKind::Alsa => Err(Error::Config(
                "the ALSA driver is only available on Linux".to_string(),
            )),
        }
    }

    pub fn kind(&self) -> DriverKind {
        match self {
            AnyDriver::Dummy(_) => DriverKind::Dummy,
            #[cfg(target_os = "linux")]
            AnyDriver::Alsa(_) => DriverKind::Alsa,
        }
    }
}

impl From<DummyDriver> for AnyDriver {
    fn from(driver: DummyDriver) -> Self {
        AnyDriver::Dummy(driver)
    }
}
