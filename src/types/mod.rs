//! Types module for WhatsApp protocol types.
//!
//! JIDs and device addresses, and the events the engine reports.

mod events;
mod jid;

pub use events::*;
pub use jid::*;
