// Crate-wide error type

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("invalid URI: {0}")]
    InvalidUri(String),

    #[error("invalid header: {0}")]
    InvalidHeader(String),

    #[error("transaction timeout")]
    TransactionTimeout,

    #[error("dialog not found")]
    DialogNotFound,

    #[error("authentication failed")]
    AuthenticationFailed,

    #[error("account locked")]
    AccountLocked,

    #[error("invalid frame size: expected {expected} samples, got {got}")]
    InvalidFrameSize { expected: usize, got: usize },

    #[error("no compatible codec in offer")]
    NoCommonCodec,

    #[error("no ports available")]
    NoPortsAvailable,

    #[error("capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("media error: {0}")]
    Media(String),

    #[error("bridge error: {0}")]
    Bridge(String),

    #[error("policy violation: {0}")]
    Policy(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("call rejected with status {0}")]
    CallRejected(u16),

    #[error("I/O error: {0}")]
    Io(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Error::Io(e.to_string())
    }
}

impl Error {
    /// The SIP status code a request-scoped failure maps to.
    pub fn sip_status(&self) -> u16 {
        match self {
            Error::Parse(_) | Error::InvalidHeader(_) | Error::InvalidUri(_) => 400,
            Error::AuthenticationFailed => 401,
            Error::AccountLocked | Error::Policy(_) => 403,
            Error::NoCommonCodec => 488,
            Error::NoPortsAvailable | Error::CapacityExceeded(_) => 503,
            Error::TransactionTimeout => 408,
            Error::DialogNotFound => 481,
            Error::CallRejected(status) => *status,
            _ => 500,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
