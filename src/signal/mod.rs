//! End-to-end encryption sessions.
//!
//! [`SessionManager`] owns pairwise double-ratchet sessions (bootstrapped
//! from pre-key bundles) and group sender-key chains. All state lives in
//! the key store passed to it; operations on one address are serialized.

mod bundle;
mod group;
mod manager;
mod ratchet;
mod session;

use rand::Rng;

use crate::crypto::CryptoError;
use crate::store::StoreError;
use crate::types::DeviceAddress;

pub use bundle::{MemoryDirectory, PreKeyBundle, PreKeyDirectory};
pub use group::{SenderKeyRecord, SenderKeyState};
pub use manager::{Ciphertext, GroupEncryption, SessionManager};
pub(crate) use manager::KeyedLocks;
pub use ratchet::{ChainKey, MessageKeys, RootKey};
pub use session::{PendingPreKey, SessionLimits, SessionRecord, SessionState};

/// Protocol version 3 in both nibbles.
pub const VERSION_BYTE: u8 = 0x33;

const CURRENT_VERSION: u8 = 3;

/// Errors raised by session and sender-key operations. None of them leaves
/// a stored session modified.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SessionError {
    #[error("no session with {0}")]
    NoSession(DeviceAddress),
    #[error("invalid message: {0}")]
    InvalidMessage(String),
    #[error("unsupported message version {0}")]
    InvalidVersion(u8),
    #[error("message with counter {counter} was already received")]
    DuplicateMessage { counter: u32 },
    #[error("message counter {counter} is too far ahead of the chain")]
    TooFarInFuture { counter: u32 },
    #[error("signed pre-key signature does not verify")]
    InvalidSignedPreKey,
    #[error("identity key of {0} changed and is not trusted")]
    UntrustedIdentity(DeviceAddress),
    #[error("pre-key {0} not found")]
    MissingPreKey(u32),
    #[error("signed pre-key {0} not found")]
    MissingSignedPreKey(u32),
    #[error("no sender key for {sender} in {group}")]
    NoSenderKey { group: String, sender: DeviceAddress },
    #[error("invalid padding")]
    InvalidPadding,
    #[error("pre-key directory: {0}")]
    Directory(String),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Body of a versioned message after checking its version byte.
pub(crate) fn strip_version(serialized: &[u8]) -> Result<&[u8], SessionError> {
    let (&version, body) = serialized
        .split_first()
        .ok_or_else(|| SessionError::InvalidMessage("empty message".into()))?;
    if version >> 4 != CURRENT_VERSION {
        return Err(SessionError::InvalidVersion(version >> 4));
    }
    Ok(body)
}

/// Append 1..=16 bytes, each holding the pad length.
pub fn pad_message(plaintext: &[u8]) -> Vec<u8> {
    let pad = rand::thread_rng().gen_range(1..=16u8);
    let mut out = Vec::with_capacity(plaintext.len() + pad as usize);
    out.extend_from_slice(plaintext);
    out.resize(plaintext.len() + pad as usize, pad);
    out
}

/// Strip padding added by [`pad_message`].
pub fn unpad_message(padded: &[u8]) -> Result<&[u8], SessionError> {
    let &pad = padded.last().ok_or(SessionError::InvalidPadding)?;
    let pad = pad as usize;
    if pad == 0 || pad > 16 || pad > padded.len() {
        return Err(SessionError::InvalidPadding);
    }
    let (body, padding) = padded.split_at(padded.len() - pad);
    if padding.iter().any(|&b| b as usize != pad) {
        return Err(SessionError::InvalidPadding);
    }
    Ok(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_padding_roundtrip() {
        for _ in 0..32 {
            let padded = pad_message(b"hello");
            assert!(padded.len() > 5 && padded.len() <= 21);
            assert_eq!(unpad_message(&padded).unwrap(), b"hello");
        }
    }

    #[test]
    fn test_unpad_rejects_malformed() {
        assert_eq!(unpad_message(&[]), Err(SessionError::InvalidPadding));
        assert_eq!(unpad_message(b"abc\x00"), Err(SessionError::InvalidPadding));
        assert_eq!(unpad_message(b"ab\x01\x02"), Err(SessionError::InvalidPadding));
        assert_eq!(unpad_message(b"\x05\x05"), Err(SessionError::InvalidPadding));
        assert_eq!(unpad_message(b"ab\x02\x02").unwrap(), b"ab");
    }

    #[test]
    fn test_version_check() {
        assert_eq!(strip_version(&[0x33, 1, 2]).unwrap(), &[1, 2]);
        assert_eq!(strip_version(&[0x23, 1]), Err(SessionError::InvalidVersion(2)));
        assert!(matches!(strip_version(&[]), Err(SessionError::InvalidMessage(_))));
    }
}
