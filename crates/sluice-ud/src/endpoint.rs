use std::collections::VecDeque;
use std::fmt;
use std::time::Instant;

use sluice_codec::{pack_uint24, DeviceAddress};
use sluice_core::{AmId, EndpointId, MemoryKey, Psn, QpNumber};
use sluice_transport::AddressHandle;

use crate::error::SendError;
use crate::pool::SkbId;
use crate::state::IfaceState;
use crate::types::{CompletionCallback, Iov, OpStatus, PendingRequest};

/// Serialized peer address length: address handle plus 24-bit QP number.
pub const PEER_ADDRESS_LEN: usize = 8 + 3;

/// Endpoint lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    /// Created, no peer yet.
    Created,
    Connected,
    /// Waiting for outstanding sends to be acknowledged.
    Flushing,
    Disconnected,
    /// Peer stopped acknowledging.
    Failed,
}

/// Resolved reachability of one remote endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    pub ah: AddressHandle,
    pub dest_qpn: QpNumber,
    /// Device address the handle was resolved from.
    pub route: DeviceAddress,
}

impl PeerAddress {
    pub fn encode(&self) -> [u8; PEER_ADDRESS_LEN] {
        let mut out = [0u8; PEER_ADDRESS_LEN];
        out[..8].copy_from_slice(&self.ah.0.to_be_bytes());
        out[8..].copy_from_slice(&pack_uint24(self.dest_qpn.0));
        out
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ah={} dest_qpn={}", self.ah.0, self.dest_qpn)
    }
}

#[derive(Debug)]
pub(crate) struct EpTx {
    /// Next sequence number to assign.
    pub(crate) psn: Psn,
    /// Highest sequence number acknowledged by the peer.
    pub(crate) acked_psn: Psn,
    /// Data packets not yet retired, in sequence order.
    pub(crate) window: VecDeque<SkbId>,
    pub(crate) last_ack: Instant,
    pub(crate) last_send: Instant,
    /// The timer asked for an ack and has seen no ack progress since.
    pub(crate) ack_requested: bool,
}

#[derive(Debug)]
pub(crate) struct EpRx {
    /// Highest contiguous sequence number received.
    pub(crate) acked_psn: Psn,
    pub(crate) ack_pending: bool,
}

pub(crate) struct Endpoint {
    pub(crate) id: EndpointId,
    pub(crate) state: EndpointState,
    pub(crate) peer: Option<PeerAddress>,
    pub(crate) dest_ep_id: EndpointId,
    pub(crate) tx: EpTx,
    pub(crate) rx: EpRx,
    pub(crate) pending: VecDeque<PendingRequest>,
    pub(crate) flush_comps: Vec<CompletionCallback>,
    pub(crate) destroy_requested: bool,
    pub(crate) in_arbiter: bool,
    pub(crate) in_ack_queue: bool,
}

impl fmt::Debug for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Endpoint")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("peer", &self.peer)
            .field("tx", &self.tx)
            .field("rx", &self.rx)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl Endpoint {
    pub(crate) fn new(id: EndpointId, now: Instant) -> Self {
        Self {
            id,
            state: EndpointState::Created,
            peer: None,
            dest_ep_id: EndpointId(0),
            tx: EpTx {
                psn: Psn::INITIAL,
                acked_psn: Psn(0),
                window: VecDeque::new(),
                last_ack: now,
                last_send: now,
                ack_requested: false,
            },
            rx: EpRx {
                acked_psn: Psn(0),
                ack_pending: false,
            },
            pending: VecDeque::new(),
            flush_comps: Vec::new(),
            destroy_requested: false,
            in_arbiter: false,
            in_ack_queue: false,
        }
    }

    /// Data packets sent and not yet acknowledged.
    pub(crate) fn unacked(&self) -> u16 {
        self.tx.psn.prev().distance_from(self.tx.acked_psn)
    }

    pub(crate) fn window_full(&self, max_window: u16) -> bool {
        self.unacked() >= max_window
    }

    pub(crate) fn can_send(&self) -> bool {
        matches!(
            self.state,
            EndpointState::Connected | EndpointState::Flushing
        ) && !self.destroy_requested
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.tx.window.is_empty() && self.pending.is_empty()
    }

    pub(crate) fn send_error(&self) -> SendError {
        match self.state {
            EndpointState::Failed => SendError::EndpointFailed(self.id),
            _ => SendError::NotConnected(self.id),
        }
    }
}

/// Send context handed to pending requests during replay.
pub struct EndpointTx<'a> {
    pub(crate) state: &'a mut IfaceState,
    pub(crate) ep: EndpointId,
}

impl EndpointTx<'_> {
    pub fn endpoint(&self) -> EndpointId {
        self.ep
    }

    pub fn am_short(&mut self, id: AmId, header: u64, payload: &[u8]) -> Result<(), SendError> {
        self.state.am_short(self.ep, id, header, payload, true)
    }

    pub fn am_short_iov(&mut self, id: AmId, iov: &[&[u8]]) -> Result<(), SendError> {
        self.state.am_short_iov(self.ep, id, iov, true)
    }

    pub fn am_bcopy(
        &mut self,
        id: AmId,
        pack: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<usize, SendError> {
        self.state.am_bcopy(self.ep, id, pack, true)
    }

    pub fn am_zcopy(
        &mut self,
        id: AmId,
        header: &[u8],
        iov: Vec<Iov>,
        comp: Option<CompletionCallback>,
    ) -> Result<OpStatus, SendError> {
        self.state.am_zcopy(self.ep, id, header, iov, comp, true)
    }

    pub fn put_short(
        &mut self,
        payload: &[u8],
        remote_addr: u64,
        rkey: MemoryKey,
    ) -> Result<(), SendError> {
        self.state.put_short(self.ep, payload, remote_addr, rkey, true)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use sluice_codec::DeviceAddress;
    use sluice_core::{EndpointId, Psn, QpNumber};
    use sluice_transport::AddressHandle;

    use super::{Endpoint, EndpointState, PeerAddress};

    #[test]
    fn fresh_endpoint_has_empty_window() {
        let ep = Endpoint::new(EndpointId(1), Instant::now());
        assert_eq!(ep.state, EndpointState::Created);
        assert_eq!(ep.unacked(), 0);
        assert!(!ep.can_send());
        assert!(ep.is_idle());
    }

    #[test]
    fn window_counts_across_wrap() {
        let mut ep = Endpoint::new(EndpointId(1), Instant::now());
        ep.tx.acked_psn = Psn(u16::MAX - 1);
        ep.tx.psn = Psn(3);
        assert_eq!(ep.unacked(), 4);
        assert!(ep.window_full(4));
        assert!(!ep.window_full(5));
    }

    #[test]
    fn peer_address_renders_handle_and_qpn() {
        let peer = PeerAddress {
            ah: AddressHandle(7),
            dest_qpn: QpNumber(0x101),
            route: DeviceAddress { lid: 1, gid: None },
        };
        assert_eq!(peer.to_string(), "ah=7 dest_qpn=257");
        assert_eq!(&peer.encode()[8..], &[0x00, 0x01, 0x01]);
    }
}
