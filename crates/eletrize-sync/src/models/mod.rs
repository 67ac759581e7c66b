//! Sync Data Models
//!
//! Device identifiers, state vocabulary and the canonical poll snapshot.

mod device;
mod poll;
pub mod state;

pub use device::*;
pub use poll::*;
