use sluice_codec::{DeviceAddress, Gid};
use sluice_core::{MemoryKey, QpNumber};

use crate::error::DeviceError;

/// Completion-queue direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Tx,
    Rx,
}

/// Work completion status.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WcStatus {
    Success,
    LocalLengthError,
    LocalProtectionError,
    WorkRequestFlushed,
    GeneralError,
}

impl WcStatus {
    pub fn is_success(self) -> bool {
        self == WcStatus::Success
    }
}

/// Static device capabilities, read once at interface construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceCaps {
    /// Send completions are reported in submission order.
    pub ordered_send_completions: bool,
    /// Completion queues support event notification.
    pub req_notify_cq: bool,
    pub max_inline: usize,
    pub max_send_sge: usize,
    /// Largest datagram payload (excluding the routing-header area).
    pub mtu: usize,
}

/// Opaque handle naming a resolved route to a remote port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressHandle(pub u64);

/// Attributes used to create an address handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AhAttr {
    pub dest: DeviceAddress,
    /// Local gid index used as the source when the route is global.
    pub sgid_index: u8,
}

/// One scatter/gather element of a send.
#[derive(Debug, Clone, Copy)]
pub struct Sge<'a> {
    pub data: &'a [u8],
    pub lkey: MemoryKey,
}

/// A datagram send work request.
#[derive(Debug)]
pub struct SendRequest<'a> {
    pub ah: AddressHandle,
    pub dest_qpn: QpNumber,
    pub sges: &'a [Sge<'a>],
    /// Payload is copied into the descriptor; keys are not consulted.
    pub inline: bool,
    /// Generate a send completion for this request.
    pub signaled: bool,
    /// Raise a solicited event at the receiver.
    pub solicited: bool,
    /// Returned unchanged in the matching completion.
    pub token: u64,
}

impl SendRequest<'_> {
    pub fn total_len(&self) -> usize {
        self.sges.iter().map(|sge| sge.data.len()).sum()
    }
}

/// Receive buffer posted to the device and handed back on completion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecvBuffer {
    pub id: usize,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxCompletion {
    pub token: u64,
    pub status: WcStatus,
    pub byte_len: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RxCompletion {
    pub buffer: RecvBuffer,
    pub status: WcStatus,
    /// Bytes written, including the routing-header area.
    pub byte_len: usize,
    /// Device reports a routing header in front of the payload.
    pub grh_present: bool,
}

/// Coarse per-device counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceHealthSnapshot {
    pub sends_posted: u64,
    pub send_completions: u64,
    pub recvs_posted: u64,
    pub recv_completions: u64,
    pub dropped_no_recv_buffer: u64,
    pub events_raised: u64,
}

/// Packet submission/poll device consumed by the transport engine.
pub trait DatagramDevice: Send {
    fn caps(&self) -> DeviceCaps;
    /// Routing information other ports use to reach this one.
    fn local_address(&self) -> DeviceAddress;
    /// Gid table of the local port.
    fn local_gids(&self) -> Vec<Gid>;
    fn qp_num(&self) -> QpNumber;

    fn create_ah(&mut self, attr: &AhAttr) -> Result<AddressHandle, DeviceError>;
    fn destroy_ah(&mut self, ah: AddressHandle) -> Result<(), DeviceError>;

    fn post_send(&mut self, wr: &SendRequest<'_>) -> Result<(), DeviceError>;
    fn post_recv(&mut self, buffers: Vec<RecvBuffer>) -> Result<(), DeviceError>;

    /// Appends at most `max` send completions to `out`, returning the count.
    fn poll_tx(&mut self, max: usize, out: &mut Vec<TxCompletion>) -> Result<usize, DeviceError>;
    /// Appends at most `max` receive completions to `out`, returning the count.
    fn poll_rx(&mut self, max: usize, out: &mut Vec<RxCompletion>) -> Result<usize, DeviceError>;

    /// Requests one event for the next completion on `dir`.
    fn arm(&mut self, dir: Direction, solicited_only: bool) -> Result<(), DeviceError>;

    /// Consumes one raised completion event, if any.
    fn take_event(&mut self) -> Option<Direction> {
        None
    }

    fn health_snapshot(&self) -> DeviceHealthSnapshot {
        DeviceHealthSnapshot::default()
    }
}
