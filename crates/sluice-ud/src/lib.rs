//! Reliable, ordered active messages over an unreliable datagram device.
//!
//! An [`Interface`] owns one device queue pair, a pool of send buffers, a
//! posted receive pool and any number of endpoints. Sends are stamped with a
//! per-endpoint sequence number, submitted through a completion moderator,
//! and retired once the peer acknowledges them and the device reports the
//! submission complete. Progress is either polled ([`Interface::progress`])
//! or driven by device events ([`Interface::handle_async_event`]).

pub mod config;
pub mod endpoint;
pub mod error;
pub mod iface;
pub mod moderator;
pub mod stats;
pub mod types;

mod pending;
mod poll;
mod pool;
mod progress;
mod rx;
mod send;
mod state;
mod timer;

#[cfg(test)]
mod test_support;

pub use config::{UdIfaceConfig, DEFAULT_OVERHEAD, MAX_IOV, RX_BATCH_MIN, TX_MODERATION};
pub use endpoint::{EndpointState, EndpointTx, PeerAddress, PEER_ADDRESS_LEN};
pub use error::{ArmError, IfaceError, PendingError, SendError};
pub use iface::Interface;
pub use moderator::{Submission, TxModerator};
pub use state::{IfaceAttr, PerfEstimate};
pub use stats::{IfaceStats, OpCounter};
pub use types::{
    AmDelivery, AmHandler, AmHandlerFlags, Completion, CompletionCallback, EventCallback,
    EventFlags, Iov, OpStatus, PendingRequest,
};
