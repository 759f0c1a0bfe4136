//! AES-256-GCM helpers.
//!
//! [`Cipher`] is the counter-nonce AEAD used by the handshake and by each
//! direction of the frame transport. The free functions take explicit nonces
//! and serve message and app-state payloads.

use aes_gcm::{
    aead::{Aead, KeyInit, Payload},
    Aes256Gcm, Nonce,
};

/// Errors from symmetric and signature primitives.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CryptoError {
    #[error("invalid key")]
    InvalidKey,
    #[error("encryption failed")]
    EncryptionFailed,
    #[error("authentication failed")]
    AuthenticationFailed,
    #[error("invalid signature")]
    InvalidSignature,
    #[error("MAC mismatch")]
    MacMismatch,
    #[error("nonce counter exhausted")]
    CounterExhausted,
}

/// Build the 96-bit nonce: 4 zero bytes then the big-endian counter.
pub fn counter_nonce(counter: u64) -> [u8; 12] {
    let mut nonce = [0u8; 12];
    nonce[4..].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// AES-256-GCM with a single incrementing nonce counter.
///
/// The counter advances only after a successful operation, so a failed
/// decrypt leaves the cipher ready to retry the same position.
pub struct Cipher {
    aead: Aes256Gcm,
    counter: u64,
}

impl Cipher {
    /// Create a new cipher with the given key.
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            aead: Aes256Gcm::new(aes_gcm::Key::<Aes256Gcm>::from_slice(key)),
            counter: 0,
        }
    }

    pub fn counter(&self) -> u64 {
        self.counter
    }

    fn next_nonce(&self) -> Result<[u8; 12], CryptoError> {
        let nonce = counter_nonce(self.counter);
        if self.counter == u64::MAX {
            return Err(CryptoError::CounterExhausted);
        }
        Ok(nonce)
    }

    /// Encrypt with the next counter nonce.
    pub fn encrypt(&mut self, plaintext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        let out = self
            .aead
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad: ad })
            .map_err(|_| CryptoError::EncryptionFailed)?;
        self.counter += 1;
        Ok(out)
    }

    /// Decrypt with the next counter nonce.
    pub fn decrypt(&mut self, ciphertext: &[u8], ad: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let nonce = self.next_nonce()?;
        let out = self
            .aead
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad: ad })
            .map_err(|_| CryptoError::AuthenticationFailed)?;
        self.counter += 1;
        Ok(out)
    }
}

/// One-shot AES-256-GCM encryption with an explicit nonce.
pub fn aes_gcm_encrypt(
    key: &[u8],
    nonce: &[u8],
    plaintext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != 12 {
        return Err(CryptoError::InvalidKey);
    }
    let aead = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    aead.encrypt(Nonce::from_slice(nonce), Payload { msg: plaintext, aad: ad })
        .map_err(|_| CryptoError::EncryptionFailed)
}

/// One-shot AES-256-GCM decryption with an explicit nonce.
pub fn aes_gcm_decrypt(
    key: &[u8],
    nonce: &[u8],
    ciphertext: &[u8],
    ad: &[u8],
) -> Result<Vec<u8>, CryptoError> {
    if nonce.len() != 12 {
        return Err(CryptoError::InvalidKey);
    }
    let aead = Aes256Gcm::new_from_slice(key).map_err(|_| CryptoError::InvalidKey)?;
    aead.decrypt(Nonce::from_slice(nonce), Payload { msg: ciphertext, aad: ad })
        .map_err(|_| CryptoError::AuthenticationFailed)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let key = [0xab; 32];
        let mut sender = Cipher::new(&key);
        let mut receiver = Cipher::new(&key);

        let ciphertext = sender.encrypt(b"Hello, WhatsApp!", b"additional data").unwrap();
        let decrypted = receiver.decrypt(&ciphertext, b"additional data").unwrap();

        assert_eq!(decrypted, b"Hello, WhatsApp!");
        assert_eq!(sender.counter(), 1);
        assert_eq!(receiver.counter(), 1);
    }

    #[test]
    fn test_decrypt_wrong_ad_fails_without_advancing() {
        let key = [0xab; 32];
        let mut sender = Cipher::new(&key);
        let mut receiver = Cipher::new(&key);

        let ciphertext = sender.encrypt(b"payload", b"correct ad").unwrap();
        assert_eq!(
            receiver.decrypt(&ciphertext, b"wrong ad"),
            Err(CryptoError::AuthenticationFailed)
        );
        assert_eq!(receiver.counter(), 0);
        assert_eq!(receiver.decrypt(&ciphertext, b"correct ad").unwrap(), b"payload");
    }

    #[test]
    fn test_counter_nonce_layout() {
        let nonce = counter_nonce(0x0102);
        assert_eq!(nonce, [0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 1, 2]);
    }

    #[test]
    fn test_one_shot_helpers() {
        let key = [7u8; 32];
        let nonce = [9u8; 12];
        let ct = aes_gcm_encrypt(&key, &nonce, b"value", b"ad").unwrap();
        assert_eq!(aes_gcm_decrypt(&key, &nonce, &ct, b"ad").unwrap(), b"value");
        assert!(aes_gcm_decrypt(&key, &[0u8; 12], &ct, b"ad").is_err());
        assert_eq!(aes_gcm_encrypt(&[0u8; 16], &nonce, b"", b""), Err(CryptoError::InvalidKey));
    }
}
