use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("port already exists: {0}")]
    DuplicateName(String),

    #[error("invalid port: {0}")]
    InvalidPort(String),

    #[error("invalid port name: {0}")]
    InvalidName(String),

    #[error("cannot connect {from} -> {to}: {reason}")]
    IncompatiblePorts {
        from: String,
        to: String,
        reason: &'static str,
    },

    #[error("ports are already connected: {0} -> {1}")]
    AlreadyConnected(String, String),

    #[error("ports are not connected: {0} -> {1}")]
    NotConnected(String, String),

    #[error("invalid port name pattern '{pattern}': {message}")]
    InvalidPattern { pattern: String, message: String },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("device error: {0}")]
    Device(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("backend is already running")]
    AlreadyRunning,

    #[error("backend is not running")]
    NotRunning,

    #[error("failed to create {0} thread")]
    ThreadSpawn(&'static str),

    #[error("process thread did not become active within {0:?}")]
    StartTimeout(std::time::Duration),

    #[error("resampler error: {0}")]
    Resampler(String),
}

impl From<rubato::ResamplerConstructionError> for Error {
    fn from(e: rubato::ResamplerConstructionError) -> Self {
        Error::Resampler(e.to_string())
    }
}

impl From<rubato::ResampleError> for Error {
    fn from(e: rubato::ResampleError) -> Self {
        Error::Resampler(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
