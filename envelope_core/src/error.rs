//thiserror-based error taxonomy for one secure exchange
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Everything that can end an exchange (or, for `KeyLoad`, the process start).
#[derive(Error, Debug)]
pub enum ExchangeError {
    /// Missing or malformed key material. Fatal at startup.
    #[error("key load: {0}")]
    KeyLoad(String),

    /// Wrong field count, bad base64 or bad IV length in an envelope.
    #[error("envelope format: {0}")]
    EnvelopeFormat(String),

    /// Unwrap or decrypt failure: wrong key, tampering, bad padding.
    #[error("crypto: {0}")]
    Crypto(String),

    #[error("network: {0}")]
    Network(#[from] NetworkError),

    /// The registered message handler declined to produce a reply.
    #[error("handler: {0}")]
    Handler(String),
}

#[derive(Error, Debug)]
pub enum NetworkError {
    #[error("no response within {0:?}")]
    Timeout(Duration),

    #[error("connection reset by peer")]
    Reset,

    #[error("connection refused")]
    Refused,

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("payload contains the frame terminator")]
    TerminatorInPayload,

    #[error("connection pool closed")]
    PoolClosed,

    #[error("IO: {0}")]
    Io(io::Error),
}

impl From<io::Error> for NetworkError {
    fn from(e: io::Error) -> Self {
        match e.kind() {
            io::ErrorKind::ConnectionRefused => NetworkError::Refused,
            io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof => NetworkError::Reset,
            _ => NetworkError::Io(e),
        }
    }
}

impl From<io::Error> for ExchangeError {
    fn from(e: io::Error) -> Self {
        ExchangeError::Network(e.into())
    }
}

pub type ExchangeResult<T> = Result<T, ExchangeError>;
