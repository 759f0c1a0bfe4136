//! Responder side of the handshake and a throwaway certificate issuer.
//!
//! Used by the loopback command and by tests that need a server to talk to.

use ed25519_dalek::{Signer, SigningKey};
use prost::Message;
use rand::rngs::OsRng;

use crate::crypto::KeyPair;
use crate::proto::{CertChain, CertDetails, HandshakeMessage, NoiseCertificate, ServerHello};

use super::handshake::{to_key, HandshakeError, NoiseState, TransportKeys, WA_HEADER};

/// Issues certificate chains from a freshly generated root.
pub struct CertIssuer {
    root: SigningKey,
    intermediate: SigningKey,
    not_before: u64,
    not_after: u64,
}

impl CertIssuer {
    pub fn generate() -> Self {
        Self {
            root: SigningKey::generate(&mut OsRng),
            intermediate: SigningKey::generate(&mut OsRng),
            not_before: 0,
            not_after: 0,
        }
    }

    /// Restrict both certificates to a unix-seconds window.
    pub fn with_validity(mut self, not_before: u64, not_after: u64) -> Self {
        self.not_before = not_before;
        self.not_after = not_after;
        self
    }

    pub fn root_public(&self) -> [u8; 32] {
        self.root.verifying_key().to_bytes()
    }

    fn certificate(&self, signer: &SigningKey, details: CertDetails) -> NoiseCertificate {
        let details = details.encode_to_vec();
        NoiseCertificate {
            signature: Some(signer.sign(&details).to_bytes().to_vec()),
            details: Some(details),
        }
    }

    /// Serialized chain whose leaf certifies `server_static`.
    pub fn issue(&self, server_static: &[u8; 32]) -> Vec<u8> {
        let intermediate = self.certificate(
            &self.root,
            CertDetails {
                serial: Some(1),
                issuer_serial: Some(0),
                key: Some(self.intermediate.verifying_key().to_bytes().to_vec()),
                not_before: Some(self.not_before),
                not_after: Some(self.not_after),
            },
        );
        let leaf = self.certificate(
            &self.intermediate,
            CertDetails {
                serial: Some(2),
                issuer_serial: Some(1),
                key: Some(server_static.to_vec()),
                not_before: Some(self.not_before),
                not_after: Some(self.not_after),
            },
        );
        CertChain {
            leaf: Some(leaf),
            intermediate: Some(intermediate),
        }
        .encode_to_vec()
    }
}

/// What the responder learns from a completed handshake.
#[derive(Debug)]
pub struct AcceptedClient {
    pub client_static: [u8; 32],
    pub payload: Vec<u8>,
    pub keys: TransportKeys,
}

/// Server side of the handshake.
pub struct ServerHandshake {
    noise: NoiseState,
    ephemeral: KeyPair,
    static_key: KeyPair,
    cert_chain: Vec<u8>,
    client_ephemeral: Option<[u8; 32]>,
}

impl ServerHandshake {
    pub fn new(static_key: KeyPair, cert_chain: Vec<u8>) -> Self {
        Self {
            noise: NoiseState::new(&WA_HEADER),
            ephemeral: KeyPair::generate(),
            static_key,
            cert_chain,
            client_ephemeral: None,
        }
    }

    /// Answer a client hello with ephemeral, encrypted static, encrypted chain.
    pub fn handle_client_hello(&mut self, message: &[u8]) -> Result<Vec<u8>, HandshakeError> {
        if self.client_ephemeral.is_some() {
            return Err(HandshakeError::InvalidMessage("duplicate client hello".into()));
        }
        let message = HandshakeMessage::decode(message)
            .map_err(|e| HandshakeError::InvalidMessage(e.to_string()))?;
        let client_ephemeral = message
            .client_hello
            .and_then(|h| h.ephemeral)
            .ok_or_else(|| HandshakeError::InvalidMessage("missing client ephemeral".into()))?;
        let client_ephemeral = to_key(&client_ephemeral, "client ephemeral")?;

        self.noise.authenticate(&client_ephemeral);
        self.noise.authenticate(&self.ephemeral.public);
        self.noise.mix_shared_secret(&self.ephemeral, &client_ephemeral);
        let static_ct = self.noise.encrypt(&self.static_key.public)?;
        self.noise.mix_shared_secret(&self.static_key, &client_ephemeral);
        let payload_ct = self.noise.encrypt(&self.cert_chain)?;

        self.client_ephemeral = Some(client_ephemeral);
        Ok(HandshakeMessage {
            server_hello: Some(ServerHello {
                ephemeral: Some(self.ephemeral.public.to_vec()),
                r#static: Some(static_ct),
                payload: Some(payload_ct),
            }),
            ..Default::default()
        }
        .encode_to_vec())
    }

    /// Accept the client finish and derive the responder's transport keys.
    pub fn handle_client_finish(&mut self, message: &[u8]) -> Result<AcceptedClient, HandshakeError> {
        if self.client_ephemeral.is_none() {
            return Err(HandshakeError::InvalidMessage("client finish before hello".into()));
        }
        let message = HandshakeMessage::decode(message)
            .map_err(|e| HandshakeError::InvalidMessage(e.to_string()))?;
        let finish = message
            .client_finish
            .ok_or_else(|| HandshakeError::InvalidMessage("missing client finish".into()))?;
        let (Some(static_ct), Some(payload_ct)) = (finish.r#static, finish.payload) else {
            return Err(HandshakeError::InvalidMessage("incomplete client finish".into()));
        };

        let client_static = to_key(&self.noise.decrypt(&static_ct, "client static key")?, "client static")?;
        self.noise.mix_shared_secret(&self.ephemeral, &client_static);
        let payload = self.noise.decrypt(&payload_ct, "client payload")?;

        let (client_write, client_read) = self.noise.split();
        Ok(AcceptedClient {
            client_static,
            payload,
            keys: TransportKeys {
                write: client_read,
                read: client_write,
            },
        })
    }
}
