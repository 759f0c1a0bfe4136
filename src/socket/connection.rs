//! An established connection: one read task, one writer task.
//!
//! The writer task owns the outbound cipher and drains a single queue, so
//! frames leave in nonce order. The read task owns the inbound cipher,
//! resolves pending requests and hands every other node to the handlers.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::sync::{mpsc, watch};

use crate::binary::{marshal, unmarshal, Node};
use crate::config::EngineConfig;
use crate::protocol::{RequestError, RequestTracker};
use crate::types::{Connected, DisconnectReason, Disconnected, Event, EventHandlers};

use super::frame::{FrameDecoder, FrameDecrypter, FrameEncrypter, MAX_FRAME_SIZE};
use super::handshake::TransportKeys;
use super::{ChunkSink, ChunkStream, Transport, TransportError};

struct Inner {
    outbound: mpsc::Sender<Vec<u8>>,
    requests: RequestTracker,
    handlers: EventHandlers,
    closed: AtomicBool,
    state: watch::Sender<Option<DisconnectReason>>,
    request_timeout: Duration,
}

impl Inner {
    fn deliver(&self, node: Node) {
        if self.requests.resolve(&node) {
            return;
        }
        self.handlers.dispatch(&Event::Node(node));
    }

    fn shutdown(&self, reason: DisconnectReason) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        match &reason {
            DisconnectReason::Closed => info!("connection closed"),
            other => warn!("connection lost: {other}"),
        }
        self.requests.fail_all();
        self.state.send_replace(Some(reason.clone()));
        self.handlers.dispatch(&Event::Disconnected(Disconnected { reason }));
    }
}

/// Handle to an established connection. Clones share the same connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl Connection {
    /// Start the read and write tasks over a transport that finished its handshake.
    /// `decoder` carries any bytes that arrived behind the last handshake frame.
    pub(crate) fn start(
        transport: Transport,
        decoder: FrameDecoder,
        keys: &TransportKeys,
        config: &EngineConfig,
        handlers: EventHandlers,
        is_reconnect: bool,
    ) -> Self {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue_depth.max(1));
        let (state, _) = watch::channel(None);
        let inner = Arc::new(Inner {
            outbound,
            requests: RequestTracker::new(),
            handlers,
            closed: AtomicBool::new(false),
            state,
            request_timeout: config.request_timeout(),
        });

        tokio::spawn(write_loop(
            transport.sink,
            outbound_rx,
            FrameEncrypter::new(&keys.write),
            Arc::downgrade(&inner),
            inner.state.subscribe(),
        ));
        tokio::spawn(read_loop(
            transport.stream,
            decoder,
            FrameDecrypter::new(&keys.read),
            Arc::downgrade(&inner),
            inner.state.subscribe(),
        ));

        inner.handlers.dispatch(&Event::Connected(Connected { is_reconnect }));
        Self { inner }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Queue a node for sending.
    pub async fn send_node(&self, node: &Node) -> Result<(), TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        let payload = marshal(node)?;
        if payload.len() + 16 > MAX_FRAME_SIZE {
            return Err(TransportError::FrameTooLarge(payload.len()));
        }
        self.inner
            .outbound
            .send(payload)
            .await
            .map_err(|_| TransportError::Closed)
    }

    /// Send an iq and wait for its `result` or `error`. An `id` is assigned
    /// when the node has none.
    pub async fn send_request(&self, mut node: Node) -> Result<Node, RequestError> {
        let id = match node.get_attr_str("id") {
            Some(id) => id.to_string(),
            None => {
                let id = self.inner.requests.next_id();
                node.attrs.insert("id", id.as_str());
                id
            }
        };
        // Dropping `pending` on any exit, cancellation included, forgets the id.
        let pending = self.inner.requests.register(&id);
        self.send_node(&node).await?;
        pending.wait(self.inner.request_timeout).await
    }

    pub fn pending_requests(&self) -> usize {
        self.inner.requests.pending_count()
    }

    /// Close the connection. Calling it again has no effect.
    pub fn close(&self) {
        self.inner.shutdown(DisconnectReason::Closed);
    }

    /// Wait until the connection has stopped and return why.
    pub async fn closed(&self) -> DisconnectReason {
        let mut rx = self.inner.state.subscribe();
        let reason = match rx.wait_for(Option::is_some).await {
            Ok(reason) => reason.clone(),
            Err(_) => None,
        };
        reason.unwrap_or(DisconnectReason::Closed)
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("closed", &self.is_closed())
            .field("pending_requests", &self.pending_requests())
            .finish_non_exhaustive()
    }
}

async fn write_loop(
    mut sink: ChunkSink,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    mut encrypter: FrameEncrypter,
    inner: Weak<Inner>,
    mut state: watch::Receiver<Option<DisconnectReason>>,
) {
    loop {
        let payload = tokio::select! {
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
            _ = state.changed() => break,
        };
        let result = match encrypter.seal(&payload) {
            Ok(frame) => sink.send(frame).await,
            Err(e) => Err(e),
        };
        if let Err(e) = result {
            if let Some(inner) = inner.upgrade() {
                inner.shutdown(DisconnectReason::Transport(e.to_string()));
            }
            break;
        }
    }
    if let Err(e) = sink.close().await {
        debug!("closing transport sink: {e}");
    }
}

async fn read_loop(
    mut stream: ChunkStream,
    mut decoder: FrameDecoder,
    mut decrypter: FrameDecrypter,
    inner: Weak<Inner>,
    mut state: watch::Receiver<Option<DisconnectReason>>,
) {
    let reason = 'read: loop {
        while let Some(body) = decoder.next_frame() {
            let Some(inner) = inner.upgrade() else {
                return;
            };
            let plaintext = match decrypter.open(&body) {
                Ok(plaintext) => plaintext,
                Err(e) => {
                    warn!("frame {} failed authentication: {e}", decrypter.counter());
                    break 'read DisconnectReason::CryptoFailure;
                }
            };
            match unmarshal(&plaintext) {
                Ok(node) => inner.deliver(node),
                Err(e) => {
                    warn!("dropping undecodable frame: {e}");
                    break 'read DisconnectReason::Desynchronized(e.to_string());
                }
            }
        }

        let chunk = tokio::select! {
            chunk = stream.next() => chunk,
            _ = state.changed() => return,
        };
        match chunk {
            Some(Ok(chunk)) => decoder.push(&chunk),
            Some(Err(e)) => break DisconnectReason::Transport(e.to_string()),
            None => break DisconnectReason::RemoteClosed,
        }
    };
    if let Some(inner) = inner.upgrade() {
        inner.shutdown(reason);
    }
}
