//! Encrypted frame transport for WhatsApp protocol.
//!
//! A [`Transport`] is any duplex stream of byte chunks: a websocket in
//! production, an in-memory pipe in tests. The [`Connector`] runs the Noise
//! handshake over it and hands back a [`Connection`] with its read loop and
//! serialized writer running.

mod connection;
mod connector;
mod frame;
pub mod handshake;
pub mod responder;

use std::pin::Pin;

use futures::channel::mpsc;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;

use crate::binary::{DecodeError, EncodeError};
use crate::crypto::CryptoError;

pub use connection::Connection;
pub use connector::{accept, Connector};
pub use frame::{encode_frame, FrameDecoder, FrameDecrypter, FrameEncrypter, MAX_FRAME_SIZE};
pub use handshake::{ClientHandshake, HandshakeError, HandshakeState, TransportKeys, WA_HEADER};
pub use responder::{AcceptedClient, CertIssuer, ServerHandshake};

/// Origin header expected by the service.
pub const WA_ORIGIN: &str = "https://web.whatsapp.com";

/// Transport-level failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    #[error("transport I/O error: {0}")]
    Io(String),
    #[error("connection closed")]
    Closed,
    #[error("frame of {0} bytes exceeds the 3-byte length prefix")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error(transparent)]
    Decode(#[from] DecodeError),
    #[error(transparent)]
    Encode(#[from] EncodeError),
}

impl From<TransportError> for HandshakeError {
    fn from(e: TransportError) -> Self {
        HandshakeError::ConnectionFailed(e.to_string())
    }
}

pub type ChunkSink = Pin<Box<dyn Sink<Vec<u8>, Error = TransportError> + Send>>;
pub type ChunkStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, TransportError>> + Send>>;

/// Duplex byte-chunk channel; chunk boundaries carry no meaning.
pub struct Transport {
    pub sink: ChunkSink,
    pub stream: ChunkStream,
}

impl Transport {
    pub fn new<S, R>(sink: S, stream: R) -> Self
    where
        S: Sink<Vec<u8>, Error = TransportError> + Send + 'static,
        R: Stream<Item = Result<Vec<u8>, TransportError>> + Send + 'static,
    {
        Self {
            sink: Box::pin(sink),
            stream: Box::pin(stream),
        }
    }

    /// Open a websocket to `url`; binary messages become chunks.
    pub async fn websocket(url: &str) -> Result<Self, TransportError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        request
            .headers_mut()
            .insert("Origin", HeaderValue::from_static(WA_ORIGIN));

        let (ws, _response) = connect_async(request)
            .await
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;
        log::debug!("websocket connected to {url}");

        let (sink, stream) = ws.split();
        let sink = sink
            .sink_map_err(|e| TransportError::Io(e.to_string()))
            .with(|chunk: Vec<u8>| future::ready(Ok::<_, TransportError>(Message::Binary(chunk))));
        let stream = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Binary(data)) => Some(Ok(data)),
                Ok(_) => None,
                Err(e) => Some(Err(TransportError::Io(e.to_string()))),
            })
        });
        Ok(Self::new(sink, stream))
    }

    /// Two transports wired back to back.
    pub fn memory_pair(capacity: usize) -> (Self, Self) {
        let (a_tx, a_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let (b_tx, b_rx) = mpsc::channel::<Vec<u8>>(capacity);
        let left = Self::new(a_tx.sink_map_err(|_| TransportError::Closed), b_rx.map(Ok));
        let right = Self::new(b_tx.sink_map_err(|_| TransportError::Closed), a_rx.map(Ok));
        (left, right)
    }
}

/// Read until `decoder` yields a whole frame.
pub(crate) async fn read_frame(stream: &mut ChunkStream, decoder: &mut FrameDecoder) -> Result<Vec<u8>, TransportError> {
    loop {
        if let Some(frame) = decoder.next_frame() {
            return Ok(frame);
        }
        match stream.next().await {
            Some(Ok(chunk)) => decoder.push(&chunk),
            Some(Err(e)) => return Err(e),
            None => return Err(TransportError::Closed),
        }
    }
}
