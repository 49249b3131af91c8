//! Error types for the pipeline runtime.
//!
//! Every fatal condition a pipeline can hit maps onto one of a small set of
//! categories: configuration problems caught before or during start,
//! discovery failures while peers are being located, transport failures on
//! an established link, script failures inside user code, and cancellation
//! (which is a clean stop, not a failure — see [`Error::is_cancelled`]).

use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    /// Invalid pipeline configuration, caught before any step runs.
    #[error("configuration error: {0}")]
    Config(String),

    /// The driver worker failed to come up in time.
    #[error("startup error: {0}")]
    Startup(String),

    /// Beacon or finder could not complete peer discovery.
    #[error("discovery error: {0}")]
    Discovery(String),

    /// Send/receive failure on an established connection.
    #[error("transport error: {0}")]
    Transport(String),

    /// Script hosting or user-code failure.
    #[error("script error: {0}")]
    Script(String),

    /// The shared cancellation signal fired while an operation was blocked.
    #[error("operation cancelled")]
    Cancelled,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Cancellation is a clean stop; callers use this to tell it apart from
    /// genuine failures when deciding the exit status.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Error::Cancelled)
    }
}
