//! Protocol buffer definitions.
//!
//! Hand-written prost messages; only the fields the engine reads or writes
//! are declared, unknown fields are skipped on decode.

mod signal;
mod syncd;
mod wa;

pub use signal::*;
pub use syncd::*;
pub use wa::*;
