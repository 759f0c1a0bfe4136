//! Drives the handshake over a transport and starts the connection.

use std::sync::atomic::{AtomicBool, Ordering};

use chrono::Utc;
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};

use crate::config::EngineConfig;
use crate::crypto::KeyPair;
use crate::types::EventHandlers;

use super::connection::Connection;
use super::frame::{encode_frame, FrameDecoder};
use super::handshake::{ClientHandshake, HandshakeError, TransportKeys, WA_HEADER};
use super::responder::{AcceptedClient, ServerHandshake};
use super::{read_frame, Transport};

/// Opens connections for one device identity. Only one handshake runs at a time.
pub struct Connector {
    config: EngineConfig,
    static_key: KeyPair,
    handlers: EventHandlers,
    in_progress: AtomicBool,
    connected_before: AtomicBool,
}

impl Connector {
    pub fn new(config: EngineConfig, static_key: KeyPair, handlers: EventHandlers) -> Self {
        Self {
            config,
            static_key,
            handlers,
            in_progress: AtomicBool::new(false),
            connected_before: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Handshake over `transport`, sending `payload` in the client finish.
    pub async fn connect(&self, transport: Transport, payload: &[u8]) -> Result<Connection, HandshakeError> {
        let _attempt = AttemptGuard::acquire(&self.in_progress)?;
        self.handshake(transport, payload).await
    }

    /// Open a websocket to the configured endpoint and handshake over it.
    pub async fn connect_websocket(&self, payload: &[u8]) -> Result<Connection, HandshakeError> {
        let _attempt = AttemptGuard::acquire(&self.in_progress)?;
        let transport = Transport::websocket(&self.config.endpoint).await?;
        self.handshake(transport, payload).await
    }

    async fn handshake(&self, mut transport: Transport, payload: &[u8]) -> Result<Connection, HandshakeError> {
        let root = self
            .config
            .cert_root()
            .map_err(|e| HandshakeError::Certificate(e.to_string()))?;
        let mut hs = ClientHandshake::new(self.static_key.clone(), root);
        let mut decoder = FrameDecoder::new();

        let outcome = tokio::time::timeout(
            self.config.handshake_timeout(),
            run_handshake(&mut hs, &mut transport, &mut decoder, payload),
        )
        .await;
        let keys = match outcome {
            Ok(Ok(keys)) => keys,
            Ok(Err(e)) => {
                hs.fail();
                warn!("handshake failed: {e}");
                return Err(e);
            }
            Err(_) => {
                hs.fail();
                warn!("handshake timed out after {:?}", self.config.handshake_timeout());
                return Err(HandshakeError::Timeout);
            }
        };
        hs.mark_established()?;

        let is_reconnect = self.connected_before.swap(true, Ordering::SeqCst);
        info!("transport established (reconnect: {is_reconnect})");
        Ok(Connection::start(
            transport,
            decoder,
            &keys,
            &self.config,
            self.handlers.clone(),
            is_reconnect,
        ))
    }
}

/// Holds the single-flight flag; released on drop, so an abandoned
/// attempt does not block the next one.
struct AttemptGuard<'a>(&'a AtomicBool);

impl<'a> AttemptGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, HandshakeError> {
        if flag.swap(true, Ordering::SeqCst) {
            return Err(HandshakeError::AlreadyInProgress);
        }
        Ok(Self(flag))
    }
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn run_handshake(
    hs: &mut ClientHandshake,
    transport: &mut Transport,
    decoder: &mut FrameDecoder,
    payload: &[u8],
) -> Result<TransportKeys, HandshakeError> {
    let mut opening = WA_HEADER.to_vec();
    opening.extend_from_slice(&encode_frame(&hs.client_hello()?)?);
    transport.sink.send(opening).await?;
    debug!("client hello sent");

    let server_hello = read_frame(&mut transport.stream, decoder).await?;
    let now = u64::try_from(Utc::now().timestamp()).unwrap_or(0);
    hs.handle_server_hello(&server_hello, now)?;
    debug!("server hello accepted");

    let (finish, keys) = hs.client_finish(payload)?;
    transport.sink.send(encode_frame(&finish)?).await?;
    Ok(keys)
}

/// Responder side: read the header and hello, answer, and start a connection
/// once the client finish checks out.
pub async fn accept(
    mut transport: Transport,
    mut handshake: ServerHandshake,
    config: &EngineConfig,
    handlers: EventHandlers,
) -> Result<(Connection, AcceptedClient), HandshakeError> {
    let mut decoder = FrameDecoder::new();
    let outcome = tokio::time::timeout(config.handshake_timeout(), async {
        let header = loop {
            if let Some(header) = decoder.take_prefix(WA_HEADER.len()) {
                break header;
            }
            match transport.stream.next().await {
                Some(Ok(chunk)) => decoder.push(&chunk),
                Some(Err(e)) => return Err(HandshakeError::from(e)),
                None => return Err(HandshakeError::ConnectionFailed("closed before header".into())),
            }
        };
        if header != WA_HEADER {
            return Err(HandshakeError::InvalidMessage(format!(
                "unexpected header {}",
                hex::encode(&header)
            )));
        }

        let hello = read_frame(&mut transport.stream, &mut decoder).await?;
        let reply = handshake.handle_client_hello(&hello)?;
        transport.sink.send(encode_frame(&reply)?).await?;

        let finish = read_frame(&mut transport.stream, &mut decoder).await?;
        handshake.handle_client_finish(&finish)
    })
    .await;

    let accepted = match outcome {
        Ok(result) => result?,
        Err(_) => return Err(HandshakeError::Timeout),
    };
    debug!("accepted client {}", hex::encode(accepted.client_static));
    let connection = Connection::start(transport, decoder, &accepted.keys, config, handlers, false);
    Ok((connection, accepted))
}
