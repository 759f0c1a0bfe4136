//! Noise_XX_25519_AESGCM_SHA256 handshake, initiator side.
//!
//! The engine is sans-io: it turns inbound handshake messages into outbound
//! ones and leaves framing and transport to the connector.

use std::fmt;

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use prost::Message;
use sha2::{Digest, Sha256};

use crate::crypto::{counter_nonce, derive_key_pair, aes_gcm_decrypt, aes_gcm_encrypt, KeyPair};
use crate::proto::{CertChain, CertDetails, ClientFinish, ClientHello, HandshakeMessage, NoiseCertificate};

/// Noise protocol pattern name (exactly 32 bytes)
pub const NOISE_PATTERN: &[u8; 32] = b"Noise_XX_25519_AESGCM_SHA256\x00\x00\x00\x00";

/// WhatsApp connection header: 'W', 'A', magic value 6, dictionary version 3
pub const WA_HEADER: [u8; 4] = [b'W', b'A', 6, crate::binary::DICT_VERSION];

/// Handshake errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum HandshakeError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("handshake timed out")]
    Timeout,
    #[error("a handshake is already in progress")]
    AlreadyInProgress,
    #[error("invalid handshake message: {0}")]
    InvalidMessage(String),
    #[error("failed to decrypt {0}")]
    Decryption(&'static str),
    #[error("certificate rejected: {0}")]
    Certificate(String),
    #[error("operation not allowed in state {0}")]
    InvalidState(HandshakeState),
}

impl HandshakeError {
    /// Only transport faults are worth retrying; identity and crypto
    /// failures will fail the same way again.
    pub fn is_retryable(&self) -> bool {
        matches!(self, HandshakeError::ConnectionFailed(_) | HandshakeError::Timeout)
    }
}

/// Handshake progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Init,
    HelloSent,
    ServerHelloReceived,
    Finished,
    Established,
    Failed,
    Closed,
}

impl fmt::Display for HandshakeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Directional keys produced by a completed handshake.
#[derive(Clone, PartialEq, Eq)]
pub struct TransportKeys {
    pub write: [u8; 32],
    pub read: [u8; 32],
}

impl fmt::Debug for TransportKeys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("TransportKeys([REDACTED])")
    }
}

/// Symmetric half of the Noise state shared by both roles.
pub(crate) struct NoiseState {
    hash: [u8; 32],
    salt: [u8; 32],
    key: [u8; 32],
    counter: u64,
}

impl NoiseState {
    /// Start the handshake with pattern and header
    pub(crate) fn new(header: &[u8]) -> Self {
        let mut state = Self {
            hash: *NOISE_PATTERN,
            salt: *NOISE_PATTERN,
            key: *NOISE_PATTERN,
            counter: 0,
        };
        state.authenticate(header);
        state
    }

    /// Mix data into the hash (authenticate)
    pub(crate) fn authenticate(&mut self, data: &[u8]) {
        let mut hasher = Sha256::new();
        hasher.update(self.hash);
        hasher.update(data);
        self.hash = hasher.finalize().into();
    }

    /// Encrypt with the current key; the running hash is the AAD.
    pub(crate) fn encrypt(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        let ciphertext = aes_gcm_encrypt(&self.key, &counter_nonce(self.counter), plaintext, &self.hash)
            .map_err(|e| HandshakeError::InvalidMessage(e.to_string()))?;
        self.counter += 1;
        self.authenticate(&ciphertext);
        Ok(ciphertext)
    }

    pub(crate) fn decrypt(&mut self, ciphertext: &[u8], what: &'static str) -> Result<Vec<u8>, HandshakeError> {
        let plaintext = aes_gcm_decrypt(&self.key, &counter_nonce(self.counter), ciphertext, &self.hash)
            .map_err(|_| HandshakeError::Decryption(what))?;
        self.counter += 1;
        self.authenticate(ciphertext);
        Ok(plaintext)
    }

    /// Mix a DH result into the chaining salt and take a fresh key.
    pub(crate) fn mix_shared_secret(&mut self, ours: &KeyPair, theirs: &[u8; 32]) {
        let (salt, key) = derive_key_pair(Some(&self.salt), &ours.dh(theirs), b"");
        self.salt = salt;
        self.key = key;
        self.counter = 0;
    }

    /// Split into the initiator's (write, read) keys.
    pub(crate) fn split(&self) -> ([u8; 32], [u8; 32]) {
        derive_key_pair(Some(&self.salt), &[], b"")
    }
}

pub(crate) fn to_key(bytes: &[u8], what: &'static str) -> Result<[u8; 32], HandshakeError> {
    bytes
        .try_into()
        .map_err(|_| HandshakeError::InvalidMessage(format!("{what} must be 32 bytes, got {}", bytes.len())))
}

/// Client side of the handshake.
pub struct ClientHandshake {
    state: HandshakeState,
    noise: NoiseState,
    ephemeral: KeyPair,
    static_key: KeyPair,
    root_key: [u8; 32],
    server_ephemeral: Option<[u8; 32]>,
    server_static: Option<[u8; 32]>,
}

impl ClientHandshake {
    pub fn new(static_key: KeyPair, root_key: [u8; 32]) -> Self {
        Self {
            state: HandshakeState::Init,
            noise: NoiseState::new(&WA_HEADER),
            ephemeral: KeyPair::generate(),
            static_key,
            root_key,
            server_ephemeral: None,
            server_static: None,
        }
    }

    pub fn state(&self) -> HandshakeState {
        self.state
    }

    /// Server static key, known once the server hello has been accepted.
    pub fn server_static(&self) -> Option<&[u8; 32]> {
        self.server_static.as_ref()
    }

    fn expect_state(&self, expected: HandshakeState) -> Result<(), HandshakeError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(HandshakeError::InvalidState(self.state))
        }
    }

    /// Run `step`; any error moves the engine to `Failed`.
    fn guarded<T>(
        &mut self,
        step: impl FnOnce(&mut Self) -> Result<T, HandshakeError>,
    ) -> Result<T, HandshakeError> {
        let result = step(self);
        if result.is_err() {
            self.state = HandshakeState::Failed;
        }
        result
    }

    /// Serialized client hello carrying the ephemeral key.
    pub fn client_hello(&mut self) -> Result<Vec<u8>, HandshakeError> {
        self.expect_state(HandshakeState::Init)?;
        self.noise.authenticate(&self.ephemeral.public);
        let hello = HandshakeMessage {
            client_hello: Some(ClientHello {
                ephemeral: Some(self.ephemeral.public.to_vec()),
                ..Default::default()
            }),
            ..Default::default()
        };
        self.state = HandshakeState::HelloSent;
        Ok(hello.encode_to_vec())
    }

    /// Process the server hello; `now` is unix seconds for the validity check.
    pub fn handle_server_hello(&mut self, message: &[u8], now: u64) -> Result<(), HandshakeError> {
        self.expect_state(HandshakeState::HelloSent)?;
        self.guarded(|hs| hs.process_server_hello(message, now))
    }

    fn process_server_hello(&mut self, message: &[u8], now: u64) -> Result<(), HandshakeError> {
        let message = HandshakeMessage::decode(message)
            .map_err(|e| HandshakeError::InvalidMessage(e.to_string()))?;
        let hello = message
            .server_hello
            .ok_or_else(|| HandshakeError::InvalidMessage("missing server hello".into()))?;
        let (Some(ephemeral), Some(static_ct), Some(payload_ct)) = (hello.ephemeral, hello.r#static, hello.payload)
        else {
            return Err(HandshakeError::InvalidMessage("incomplete server hello".into()));
        };

        let server_ephemeral = to_key(&ephemeral, "server ephemeral")?;
        self.noise.authenticate(&server_ephemeral);
        self.noise.mix_shared_secret(&self.ephemeral, &server_ephemeral);

        let server_static = to_key(&self.noise.decrypt(&static_ct, "server static key")?, "server static")?;
        self.noise.mix_shared_secret(&self.ephemeral, &server_static);

        let cert = self.noise.decrypt(&payload_ct, "certificate chain")?;
        verify_cert_chain(&cert, &self.root_key, &server_static, now)?;

        self.server_ephemeral = Some(server_ephemeral);
        self.server_static = Some(server_static);
        self.state = HandshakeState::ServerHelloReceived;
        Ok(())
    }

    /// Serialized client finish and the transport keys.
    pub fn client_finish(&mut self, payload: &[u8]) -> Result<(Vec<u8>, TransportKeys), HandshakeError> {
        self.expect_state(HandshakeState::ServerHelloReceived)?;
        self.guarded(|hs| {
            let server_ephemeral = hs
                .server_ephemeral
                .ok_or(HandshakeError::InvalidState(HandshakeState::ServerHelloReceived))?;
            let static_ct = hs.noise.encrypt(&hs.static_key.public)?;
            hs.noise.mix_shared_secret(&hs.static_key, &server_ephemeral);
            let payload_ct = hs.noise.encrypt(payload)?;

            let finish = HandshakeMessage {
                client_finish: Some(ClientFinish {
                    r#static: Some(static_ct),
                    payload: Some(payload_ct),
                }),
                ..Default::default()
            };
            let (write, read) = hs.noise.split();
            hs.state = HandshakeState::Finished;
            Ok((finish.encode_to_vec(), TransportKeys { write, read }))
        })
    }

    /// The finish frame was written; the transport is live.
    pub fn mark_established(&mut self) -> Result<(), HandshakeError> {
        self.expect_state(HandshakeState::Finished)?;
        self.state = HandshakeState::Established;
        Ok(())
    }

    /// Abort from any state.
    pub fn fail(&mut self) {
        self.state = HandshakeState::Failed;
    }

    pub fn close(&mut self) {
        self.state = HandshakeState::Closed;
    }
}

fn verify_signed(cert: &NoiseCertificate, issuer: &[u8; 32], which: &str) -> Result<CertDetails, HandshakeError> {
    let details = cert
        .details
        .as_deref()
        .ok_or_else(|| HandshakeError::Certificate(format!("{which} has no details")))?;
    let signature = cert
        .signature
        .as_deref()
        .and_then(|s| Signature::from_slice(s).ok())
        .ok_or_else(|| HandshakeError::Certificate(format!("{which} has no valid signature")))?;
    let key = VerifyingKey::from_bytes(issuer)
        .map_err(|_| HandshakeError::Certificate(format!("issuer key of {which} is invalid")))?;
    key.verify(details, &signature)
        .map_err(|_| HandshakeError::Certificate(format!("{which} signature does not verify")))?;
    CertDetails::decode(details).map_err(|e| HandshakeError::Certificate(format!("{which} details: {e}")))
}

fn check_validity(details: &CertDetails, now: u64, which: &str) -> Result<(), HandshakeError> {
    let not_before = details.not_before.unwrap_or(0);
    let not_after = details.not_after.unwrap_or(0);
    if not_before != 0 && now < not_before {
        return Err(HandshakeError::Certificate(format!("{which} not yet valid")));
    }
    if not_after != 0 && now > not_after {
        return Err(HandshakeError::Certificate(format!("{which} expired")));
    }
    Ok(())
}

/// Check that the chain is rooted at `root` and that its leaf names `server_static`.
pub fn verify_cert_chain(
    chain: &[u8],
    root: &[u8; 32],
    server_static: &[u8; 32],
    now: u64,
) -> Result<(), HandshakeError> {
    let chain = CertChain::decode(chain).map_err(|e| HandshakeError::Certificate(e.to_string()))?;
    let (Some(intermediate), Some(leaf)) = (chain.intermediate, chain.leaf) else {
        return Err(HandshakeError::Certificate("incomplete chain".into()));
    };

    let intermediate = verify_signed(&intermediate, root, "intermediate")?;
    check_validity(&intermediate, now, "intermediate")?;
    let intermediate_key = intermediate
        .key
        .as_deref()
        .and_then(|k| <[u8; 32]>::try_from(k).ok())
        .ok_or_else(|| HandshakeError::Certificate("intermediate key missing".into()))?;

    let leaf = verify_signed(&leaf, &intermediate_key, "leaf")?;
    check_validity(&leaf, now, "leaf")?;
    if leaf.issuer_serial != intermediate.serial {
        return Err(HandshakeError::Certificate("leaf issuer does not match intermediate".into()));
    }
    if leaf.key.as_deref() != Some(&server_static[..]) {
        return Err(HandshakeError::Certificate("leaf key does not match server static key".into()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::responder::{CertIssuer, ServerHandshake};

    fn run(issuer: &CertIssuer, root: [u8; 32]) -> (ClientHandshake, Result<(), HandshakeError>, ServerHandshake) {
        let server_static = KeyPair::generate();
        let mut server = ServerHandshake::new(server_static.clone(), issuer.issue(&server_static.public));
        let mut client = ClientHandshake::new(KeyPair::generate(), root);

        let hello = client.client_hello().unwrap();
        let server_hello = server.handle_client_hello(&hello).unwrap();
        let result = client.handle_server_hello(&server_hello, 1_700_000_000);
        (client, result, server)
    }

    #[test]
    fn test_keys_agree() {
        let issuer = CertIssuer::generate();
        let (mut client, result, mut server) = run(&issuer, issuer.root_public());
        result.unwrap();
        assert_eq!(client.state(), HandshakeState::ServerHelloReceived);

        let (finish, client_keys) = client.client_finish(b"login payload").unwrap();
        let accepted = server.handle_client_finish(&finish).unwrap();
        assert_eq!(accepted.payload, b"login payload");
        assert_eq!(client_keys.write, accepted.keys.read);
        assert_eq!(client_keys.read, accepted.keys.write);
        assert_ne!(client_keys.write, client_keys.read);

        client.mark_established().unwrap();
        assert_eq!(client.state(), HandshakeState::Established);
    }

    #[test]
    fn test_foreign_root_fails() {
        let issuer = CertIssuer::generate();
        let other = CertIssuer::generate();
        let (client, result, _) = run(&issuer, other.root_public());
        let err = result.unwrap_err();
        assert!(matches!(err, HandshakeError::Certificate(_)));
        assert!(!err.is_retryable());
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_leaf_for_other_key_fails() {
        let issuer = CertIssuer::generate();
        let server_static = KeyPair::generate();
        let wrong_leaf = issuer.issue(&KeyPair::generate().public);
        let mut server = ServerHandshake::new(server_static, wrong_leaf);
        let mut client = ClientHandshake::new(KeyPair::generate(), issuer.root_public());

        let hello = client.client_hello().unwrap();
        let server_hello = server.handle_client_hello(&hello).unwrap();
        assert!(client.handle_server_hello(&server_hello, 0).is_err());
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_out_of_order_calls_rejected() {
        let mut client = ClientHandshake::new(KeyPair::generate(), [0u8; 32]);
        assert_eq!(
            client.client_finish(b"").unwrap_err(),
            HandshakeError::InvalidState(HandshakeState::Init)
        );
        client.client_hello().unwrap();
        assert!(client.client_hello().is_err());
        assert!(client.handle_server_hello(b"\x01garbage", 0).is_err());
        assert_eq!(client.state(), HandshakeState::Failed);
    }

    #[test]
    fn test_expired_certificate_fails() {
        let issuer = CertIssuer::generate().with_validity(100, 200);
        let (_, result, _) = run(&issuer, issuer.root_public());
        assert!(matches!(result, Err(HandshakeError::Certificate(msg)) if msg.contains("expired")));
    }
}
