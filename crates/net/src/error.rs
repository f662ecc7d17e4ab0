//! Error kinds surfaced by the client stack.

use diode_core::bert::CodecError;
use diode_core::blockquick::WindowError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("malformed frame")]
    MalformedFrame,
    #[error("rpc client was closed")]
    ClientClosed,
    #[error("call cancelled by {0}")]
    Cancelled(String),
    #[error("call queue is full")]
    BackpressureFull,
    #[error("rpc {method} failed: {message}")]
    Rpc { method: String, message: String },
    #[error("portopen timeout")]
    PortOpenTimeout,
    #[error("server returned false")]
    SendTransactionFailed,
    #[error("couldn't resolve name (null)")]
    EmptyBnsResult,
    #[error("wrong merkle proof")]
    BadMerkleProof,
    #[error("reference block does not match")]
    AnchorLost,
    #[error("couldn't validate any new blocks")]
    NoProgress,
    #[error("signature invalid")]
    SignatureInvalid,
    #[error("header validation failed: {0}")]
    Validation(String),
    #[error("transport: {0}")]
    Transport(#[from] std::io::Error),
}

impl Error {
    pub fn rpc(method: &str, message: impl Into<String>) -> Error {
        Error::Rpc {
            method: method.to_string(),
            message: message.into(),
        }
    }
}

impl From<CodecError> for Error {
    fn from(_: CodecError) -> Self {
        Error::MalformedFrame
    }
}

impl From<WindowError> for Error {
    fn from(err: WindowError) -> Self {
        match err {
            WindowError::SignatureInvalid { .. } => Error::SignatureInvalid,
            other => Error::Validation(other.to_string()),
        }
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::Transport(std::io::Error::new(std::io::ErrorKind::InvalidData, err))
    }
}
