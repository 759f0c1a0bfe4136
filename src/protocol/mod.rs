//! Protocol-level node handling above the transport.
//!
//! `request` correlates iq queries with their responses; `message` turns
//! plaintexts into encrypted `message` nodes and back.

mod message;
mod request;

pub use message::{deliver_as_server, generate_message_id, EncPayload, MessageError, MessageRouter, ENC_VERSION};
pub use request::{
    build_iq, build_iq_result, is_iq_error, is_iq_result, parse_iq_error, PendingRequest, RequestError,
    RequestTracker,
};
