use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use sluice_core::{AmId, EndpointId, MemoryKey};

use crate::endpoint::EndpointTx;
use crate::error::SendError;

/// Outcome of an operation that may finish later.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpStatus {
    Done,
    InProgress,
}

/// Status delivered to a completion callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Ok,
    /// The endpoint failed or was invalidated before the operation finished.
    Canceled,
}

/// Fired once when a zero-copy send or flush finishes.
pub type CompletionCallback = Box<dyn FnOnce(Completion) + Send>;

/// One caller-owned segment of a zero-copy send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Iov {
    pub buffer: Bytes,
    /// Key of the registration covering `buffer`.
    pub lkey: MemoryKey,
}

/// Active message handed to a receive handler.
#[derive(Debug)]
pub struct AmDelivery<'a> {
    /// Local endpoint the message arrived on.
    pub ep: EndpointId,
    pub am_id: AmId,
    /// Message bytes following the network header.
    pub data: &'a [u8],
    /// Invoked from the event-driven path.
    pub is_async: bool,
}

/// Receive handler. Runs inside the interface critical section and must not
/// call back into the interface.
pub type AmHandler = Box<dyn FnMut(AmDelivery<'_>) + Send>;

/// Handler registration options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AmHandlerFlags {
    /// Handler may only run from `progress`; async arrivals are deferred.
    pub sync_only: bool,
}

/// Asynchronous event notifier, invoked with a fixed argument of 0.
pub type EventCallback = Arc<dyn Fn(u32) + Send + Sync>;

/// Events requested by `event_arm`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EventFlags {
    pub send_comp: bool,
    pub recv: bool,
    /// Only receives of packets sent as solicited.
    pub recv_sig: bool,
}

/// Deferred send, replayed in FIFO order when resources return.
/// Returning `Err(SendError::NoResource)` keeps it queued.
pub type PendingRequest = Box<dyn FnMut(&mut EndpointTx<'_>) -> Result<(), SendError> + Send>;

pub(crate) struct ZcopyDesc {
    pub(crate) iov: Vec<Iov>,
    pub(crate) comp: Option<CompletionCallback>,
}

impl fmt::Debug for ZcopyDesc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZcopyDesc")
            .field("iov", &self.iov.len())
            .field("comp", &self.comp.is_some())
            .finish()
    }
}
