//! Crate-wide error type.

use crate::appstate::SyncError;
use crate::binary::{DecodeError, EncodeError};
use crate::config::ConfigError;
use crate::crypto::CryptoError;
use crate::protocol::{MessageError, RequestError};
use crate::signal::SessionError;
use crate::socket::{HandshakeError, TransportError};
use crate::store::StoreError;

/// Any failure the engine can report.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error(transparent)]
    Request(#[from] RequestError),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Message(#[from] MessageError),
    #[error(transparent)]
    Sync(#[from] SyncError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl Error {
    /// Whether retrying the operation may succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Handshake(e) => e.is_retryable(),
            Error::Transport(e) => !matches!(e, TransportError::Encode(_) | TransportError::FrameTooLarge(_)),
            Error::Request(e) => matches!(e, RequestError::Timeout | RequestError::ConnectionClosed),
            _ => false,
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
