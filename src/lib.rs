//! Protocol core of a WhatsApp multi-device web client.
//!
//! ## Modules
//!
//! - `binary` - the binary node format every frame carries
//! - `socket` - Noise handshake, encrypted frames, and the connection
//! - `signal` - pairwise double-ratchet sessions and group sender keys
//! - `appstate` - app-state patch sync over an LTHash
//! - `protocol` - iq requests and encrypted message nodes
//! - `store` - key-store traits and an in-memory store
//! - `types` - JIDs, device addresses, and events

pub mod appstate;
pub mod binary;
pub mod config;
pub mod crypto;
pub mod error;
pub mod proto;
pub mod protocol;
pub mod signal;
pub mod socket;
pub mod store;
pub mod types;

pub use appstate::{AppStateSync, Collection, SyncError};
pub use binary::{marshal, unmarshal, Node};
pub use config::{EngineConfig, TrustMode};
pub use error::{Error, Result};
pub use protocol::MessageRouter;
pub use signal::SessionManager;
pub use socket::{Connection, Connector};
pub use types::{DeviceAddress, Event, EventHandlers, Jid};
