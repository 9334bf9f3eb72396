use std::fmt;

use sluice_codec::CodecError;
use sluice_core::EndpointId;
use sluice_transport::DeviceError;
use thiserror::Error;
use tracing::error;

/// Errors returned by the send path.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No send credit, send buffer, or window space; queue as pending.
    #[error("no resource")]
    NoResource,
    /// Payload does not fit the limit of the chosen operation.
    #[error("message too long: {len} > {max}")]
    MessageTooLong { len: usize, max: usize },
    #[error("too many iov entries: {count} > {max}")]
    IovCount { count: usize, max: usize },
    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),
    #[error("endpoint {0} failed")]
    EndpointFailed(EndpointId),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
}

/// Errors returned by interface and endpoint management.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IfaceError {
    #[error("invalid config: {0}")]
    InvalidConfig(&'static str),
    #[error("unsupported device: {0}")]
    Unsupported(&'static str),
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("endpoint {0} is already connected")]
    AlreadyConnected(EndpointId),
    #[error("endpoint ids exhausted")]
    EndpointIdsExhausted,
    /// Send-side resources are exhausted; retry after progress.
    #[error("no resource")]
    NoResource,
}

/// Errors returned when arming completion events.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArmError {
    /// Deferred work is queued; progress before arming.
    #[error("busy: deferred work pending")]
    Busy,
    #[error("device error: {0}")]
    Device(#[from] DeviceError),
}

/// Errors returned when queueing a pending request.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PendingError {
    /// Resources are available; send directly instead.
    #[error("busy: send can proceed now")]
    Busy,
    #[error("unknown endpoint {0}")]
    UnknownEndpoint(EndpointId),
    #[error("endpoint {0} is not connected")]
    NotConnected(EndpointId),
}

/// Logs the diagnostic and aborts the current operation by panicking.
///
/// Used for conditions that indicate corrupted device state or a broken
/// local invariant, which are never retried.
#[track_caller]
pub(crate) fn fatal(what: fmt::Arguments<'_>) -> ! {
    error!("fatal: {what}");
    panic!("fatal: {what}");
}
