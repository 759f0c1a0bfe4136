//! Length-prefixed frames and their per-direction encryption.
//!
//! Every frame is `length (3 bytes, big-endian) || body`. Before the
//! handshake completes the body is a plain handshake message; afterwards it
//! is AES-256-GCM ciphertext under a per-direction counter nonce.

use crate::crypto::{Cipher, CryptoError};

use super::TransportError;

/// Largest body a 3-byte length prefix can describe.
pub const MAX_FRAME_SIZE: usize = (1 << 24) - 1;

/// Prefix `body` with its 3-byte length.
pub fn encode_frame(body: &[u8]) -> Result<Vec<u8>, TransportError> {
    let len = body.len();
    if len > MAX_FRAME_SIZE {
        return Err(TransportError::FrameTooLarge(len));
    }
    let mut frame = Vec::with_capacity(len + 3);
    frame.extend_from_slice(&(len as u32).to_be_bytes()[1..]);
    frame.extend_from_slice(body);
    Ok(frame)
}

/// Reassembles frames from transport chunks of arbitrary size.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) {
        self.buf.extend_from_slice(chunk);
    }

    /// Take the first `n` buffered bytes unframed, once they have arrived.
    pub fn take_prefix(&mut self, n: usize) -> Option<Vec<u8>> {
        if self.buf.len() < n {
            return None;
        }
        Some(self.buf.drain(..n).collect())
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Next complete frame body, if one has fully arrived.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if self.buf.len() < 3 {
            return None;
        }
        let len = (self.buf[0] as usize) << 16 | (self.buf[1] as usize) << 8 | self.buf[2] as usize;
        if self.buf.len() < len + 3 {
            return None;
        }
        let body = self.buf[3..len + 3].to_vec();
        self.buf.drain(..len + 3);
        Some(body)
    }
}

/// Outbound half of an established transport.
pub struct FrameEncrypter {
    cipher: Cipher,
}

impl FrameEncrypter {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Cipher::new(key),
        }
    }

    /// Encrypt a payload and frame it; each call consumes one nonce.
    pub fn seal(&mut self, payload: &[u8]) -> Result<Vec<u8>, TransportError> {
        if payload.len() + 16 > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        let ciphertext = self.cipher.encrypt(payload, &[])?;
        encode_frame(&ciphertext)
    }

    pub fn counter(&self) -> u64 {
        self.cipher.counter()
    }
}

/// Inbound half of an established transport.
pub struct FrameDecrypter {
    cipher: Cipher,
}

impl FrameDecrypter {
    pub fn new(key: &[u8; 32]) -> Self {
        Self {
            cipher: Cipher::new(key),
        }
    }

    /// Decrypt one frame body. A failure leaves the counter where it was.
    pub fn open(&mut self, body: &[u8]) -> Result<Vec<u8>, CryptoError> {
        self.cipher.decrypt(body, &[])
    }

    pub fn counter(&self) -> u64 {
        self.cipher.counter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decoder_handles_split_and_merged_chunks() {
        let a = encode_frame(b"first").unwrap();
        let b = encode_frame(b"second frame").unwrap();
        let mut stream = a.clone();
        stream.extend_from_slice(&b);

        let mut decoder = FrameDecoder::new();
        decoder.push(&stream[..2]);
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&stream[2..a.len() + 4]);
        assert_eq!(decoder.next_frame().as_deref(), Some(&b"first"[..]));
        assert_eq!(decoder.next_frame(), None);
        decoder.push(&stream[a.len() + 4..]);
        assert_eq!(decoder.next_frame().as_deref(), Some(&b"second frame"[..]));
        assert_eq!(decoder.buffered(), 0);
    }

    #[test]
    fn test_frame_size_limit() {
        assert!(encode_frame(&vec![0u8; MAX_FRAME_SIZE]).is_ok());
        assert!(matches!(
            encode_frame(&vec![0u8; MAX_FRAME_SIZE + 1]),
            Err(TransportError::FrameTooLarge(_))
        ));
    }

    #[test]
    fn test_n_frames_roundtrip_in_order() {
        let key = [3u8; 32];
        let mut tx = FrameEncrypter::new(&key);
        let mut rx = FrameDecrypter::new(&key);
        let mut decoder = FrameDecoder::new();

        for i in 0..20u8 {
            decoder.push(&tx.seal(&[i; 10]).unwrap());
        }
        for i in 0..20u8 {
            let body = decoder.next_frame().unwrap();
            assert_eq!(rx.open(&body).unwrap(), vec![i; 10]);
        }
        assert_eq!(tx.counter(), 20);
        assert_eq!(rx.counter(), 20);
    }

    #[test]
    fn test_tampered_frame_fails_and_keeps_counter() {
        let key = [4u8; 32];
        let mut tx = FrameEncrypter::new(&key);
        let mut rx = FrameDecrypter::new(&key);

        let frame = tx.seal(b"hello").unwrap();
        let mut body = frame[3..].to_vec();
        body[0] ^= 0x80;
        assert_eq!(rx.open(&body), Err(CryptoError::AuthenticationFailed));
        assert_eq!(rx.counter(), 0);

        body[0] ^= 0x80;
        assert_eq!(rx.open(&body).unwrap(), b"hello");
        assert_eq!(rx.counter(), 1);
    }
}
