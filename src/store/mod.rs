//! Storage for protocol key material.
//!
//! The engine reads and writes sessions, pre-keys, sender keys and
//! app-state data only through these traits.

mod device;
mod memory;
mod traits;

pub use device::*;
pub use memory::*;
pub use traits::*;
