//! Event types and typed handler registration.
//!
//! Handlers are registered once, at construction time, on an
//! [`EventHandlers`] value that the connection and engines share.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::binary::Node;
use crate::types::{DeviceAddress, Jid};

/// The transport finished its handshake and is ready for traffic.
#[derive(Debug, Clone)]
pub struct Connected {
    /// Whether this is an initial connection or a reconnection
    pub is_reconnect: bool,
}

/// The transport stopped; reconnection is the owner's decision.
#[derive(Debug, Clone)]
pub struct Disconnected {
    pub reason: DisconnectReason,
}

/// Reason for disconnection
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `close()` was called locally
    Closed,
    /// The remote end closed the stream
    RemoteClosed,
    /// A frame failed authentication
    CryptoFailure,
    /// A frame could not be decoded; the stream is out of sync
    Desynchronized(String),
    /// Transport I/O error
    Transport(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::Closed => write!(f, "closed locally"),
            DisconnectReason::RemoteClosed => write!(f, "closed by remote"),
            DisconnectReason::CryptoFailure => write!(f, "frame authentication failed"),
            DisconnectReason::Desynchronized(e) => write!(f, "desynchronized: {e}"),
            DisconnectReason::Transport(e) => write!(f, "transport error: {e}"),
        }
    }
}

/// A message body recovered by the session manager.
#[derive(Debug, Clone)]
pub struct DecryptedMessage {
    /// Unique message ID
    pub id: String,
    /// Chat JID (same as sender for 1:1, group JID for groups)
    pub chat: Jid,
    /// Device that encrypted the message
    pub sender: DeviceAddress,
    pub plaintext: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// A collection failed validation and was rebuilt from a snapshot.
#[derive(Debug, Clone)]
pub struct SyncConflict {
    pub collection: String,
    pub reason: String,
}

/// All events that can be dispatched.
#[derive(Debug, Clone)]
pub enum Event {
    Connected(Connected),
    Disconnected(Disconnected),
    Node(Node),
    Message(DecryptedMessage),
    SyncConflict(SyncConflict),
}

type Handler<T> = Arc<dyn Fn(&T) + Send + Sync>;

/// Typed handler lists, one per event kind.
#[derive(Clone, Default)]
pub struct EventHandlers {
    connected: Vec<Handler<Connected>>,
    disconnected: Vec<Handler<Disconnected>>,
    node: Vec<Handler<Node>>,
    message: Vec<Handler<DecryptedMessage>>,
    sync_conflict: Vec<Handler<SyncConflict>>,
}

impl EventHandlers {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on_connected(mut self, f: impl Fn(&Connected) + Send + Sync + 'static) -> Self {
        self.connected.push(Arc::new(f));
        self
    }

    pub fn on_disconnected(mut self, f: impl Fn(&Disconnected) + Send + Sync + 'static) -> Self {
        self.disconnected.push(Arc::new(f));
        self
    }

    /// Called for every inbound node that is not a response to a pending request.
    pub fn on_node(mut self, f: impl Fn(&Node) + Send + Sync + 'static) -> Self {
        self.node.push(Arc::new(f));
        self
    }

    pub fn on_message(mut self, f: impl Fn(&DecryptedMessage) + Send + Sync + 'static) -> Self {
        self.message.push(Arc::new(f));
        self
    }

    pub fn on_sync_conflict(mut self, f: impl Fn(&SyncConflict) + Send + Sync + 'static) -> Self {
        self.sync_conflict.push(Arc::new(f));
        self
    }

    pub fn dispatch(&self, event: &Event) {
        match event {
            Event::Connected(e) => self.connected.iter().for_each(|h| h(e)),
            Event::Disconnected(e) => self.disconnected.iter().for_each(|h| h(e)),
            Event::Node(e) => self.node.iter().for_each(|h| h(e)),
            Event::Message(e) => self.message.iter().for_each(|h| h(e)),
            Event::SyncConflict(e) => self.sync_conflict.iter().for_each(|h| h(e)),
        }
    }
}

impl fmt::Debug for EventHandlers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHandlers")
            .field("connected", &self.connected.len())
            .field("disconnected", &self.disconnected.len())
            .field("node", &self.node.len())
            .field("message", &self.message.len())
            .field("sync_conflict", &self.sync_conflict.len())
            .finish()
    }
}
