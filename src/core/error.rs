use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("payload of {len} bytes exceeds region capacity of {capacity} bytes")]
    CapacityExceeded { len: usize, capacity: usize },
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),
    #[error("resource unavailable: {name}: {source}")]
    ResourceUnavailable {
        name: String,
        #[source]
        source: std::io::Error,
    },
    #[error("corrupt data: {0}")]
    Corrupt(&'static str),
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("timed out waiting for {0}")]
    Timeout(&'static str),
    #[error("peer closed the channel")]
    PeerClosed,
    #[error("simulation failed: {0}")]
    Simulation(#[source] Box<dyn std::error::Error + Send + Sync + 'static>),
}

impl Error {
    pub(crate) fn unavailable(name: impl Into<String>, source: std::io::Error) -> Self {
        Error::ResourceUnavailable {
            name: name.into(),
            source,
        }
    }

    pub(crate) fn violation(msg: impl Into<String>) -> Self {
        Error::ProtocolViolation(msg.into())
    }

    /// Errors that leave the shared state untouched and can be retried by the caller.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Error::CapacityExceeded { .. } | Error::ResourceUnavailable { .. }
        )
    }
}

impl From<anyhow::Error> for Error {
    fn from(value: anyhow::Error) -> Self {
        Error::Simulation(value.into())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
