//! kf-core: shared error type, IDs, keying parameters, configuration, and
//! the event bus.
//!
//! This crate is the foundational dependency for all other kf-* crates and
//! for the `keyforge` executor itself.

pub mod config;
pub mod error;
pub mod events;
pub mod ids;
pub mod keying;
pub mod serde_util;

// Re-export the most commonly used items at the crate root.
pub use error::{Error, Result};
pub use ids::RunId;
pub use keying::{KeyColor, KeyingParams};
