//! Core sluice primitives shared across crates.
//!
//! Includes wrapping packet sequence numbers, fixed-width identifiers,
//! memory keys, and base errors.

pub mod error;
pub mod psn;
pub mod types;

pub use psn::Psn;
pub use types::{
    AmId, EndpointId, MemoryKey, QpNumber, AM_ID_MAX, ENDPOINT_ID_MAX, QP_NUMBER_MAX,
};
