use std::collections::{BTreeMap, VecDeque};
use std::num::NonZeroUsize;
use std::time::Instant;

use lru::LruCache;
use sluice_codec::{
    DeviceAddress, EndpointAddress, Gid, IfaceAddress, AM_SHORT_HDR_LEN, DEVICE_ADDRESS_LEN,
    ENDPOINT_ADDRESS_LEN, GRH_LEN, IFACE_ADDRESS_LEN, NETH_LEN, PUT_HDR_LEN,
};
use sluice_core::{AmId, EndpointId, ENDPOINT_ID_MAX};
use sluice_transport::{
    AhAttr, DatagramDevice, Direction, MemoryDomain, RecvBuffer, RxCompletion, TxCompletion,
};
use tracing::{debug, warn};

use crate::config::{UdIfaceConfig, MAX_IOV, RX_BATCH_MIN};
use crate::endpoint::{Endpoint, EndpointState, PeerAddress, PEER_ADDRESS_LEN};
use crate::error::{fatal, IfaceError};
use crate::moderator::TxModerator;
use crate::pool::{RecvPool, SkbId, SkbPool};
use crate::stats::IfaceStats;
use crate::types::{AmHandler, AmHandlerFlags, Completion, CompletionCallback, EventCallback};

/// Low bits of an endpoint id pick the slot; the top byte is a generation
/// bumped on every reuse.
const EP_SLOT_BITS: u32 = 16;
const EP_SLOT_MAX: u32 = (1 << EP_SLOT_BITS) - 1;
const EP_GENERATION_MASK: u32 = ENDPOINT_ID_MAX >> EP_SLOT_BITS;

/// Limits derived from the config clamped to device capabilities.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Limits {
    pub(crate) max_inline: usize,
    pub(crate) seg_size: usize,
    /// Payload iov entries of a zero-copy send; one sge carries the header.
    pub(crate) max_iov: usize,
    pub(crate) req_notify: bool,
}

pub(crate) struct TxState {
    pub(crate) moderator: TxModerator,
    /// Send credits.
    pub(crate) available: usize,
    /// Data submissions awaiting completion, in submission order.
    pub(crate) inflight: VecDeque<(u64, EndpointId)>,
    /// Buffers of discarded endpoints still owned by the device.
    pub(crate) orphans: Vec<(u64, SkbId)>,
    /// Completions produced in async context, dispatched by `progress`.
    pub(crate) async_comps: VecDeque<(CompletionCallback, Completion)>,
    pub(crate) wcs: Vec<TxCompletion>,
}

/// Receive whose handler may not run in async context.
#[derive(Debug)]
pub(crate) struct DeferredRx {
    pub(crate) ep: EndpointId,
    pub(crate) am_id: AmId,
    pub(crate) buffer: RecvBuffer,
    pub(crate) start: usize,
    pub(crate) end: usize,
}

pub(crate) struct RxState {
    pub(crate) pool: RecvPool,
    pub(crate) pending: VecDeque<DeferredRx>,
    pub(crate) wcs: Vec<RxCompletion>,
    /// Last destination gid that matched the local table.
    pub(crate) gid_hit: Option<(usize, [u8; 16])>,
}

pub(crate) struct HandlerSlot {
    pub(crate) handler: AmHandler,
    pub(crate) flags: AmHandlerFlags,
}

/// Reported interface attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct IfaceAttr {
    /// Largest `am_short` payload after the 8-byte header.
    pub max_short: usize,
    pub max_bcopy: usize,
    pub max_zcopy: usize,
    pub max_iov: usize,
    /// Largest zero-copy user header.
    pub max_hdr: usize,
    pub max_put_short: usize,
    pub device_addr_len: usize,
    pub iface_addr_len: usize,
    pub ep_addr_len: usize,
    pub peer_addr_len: usize,
    pub overhead: f64,
    pub bandwidth: f64,
    pub max_window: u16,
    pub tx_queue_len: usize,
    pub ordered_send_completions: bool,
    /// `event_arm` is available.
    pub events: bool,
}

/// Performance estimate used by upper layers to rank transports.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PerfEstimate {
    pub send_pre_overhead: f64,
    pub send_post_overhead: f64,
    pub recv_overhead: f64,
    pub bandwidth: f64,
    pub max_inflight_eps: usize,
}

/// Everything guarded by the interface critical section.
pub(crate) struct IfaceState {
    pub(crate) config: UdIfaceConfig,
    pub(crate) limits: Limits,
    pub(crate) device: Box<dyn DatagramDevice>,
    pub(crate) domain: Box<dyn MemoryDomain>,
    pub(crate) local_gids: Vec<Gid>,
    pub(crate) skbs: SkbPool,
    pub(crate) tx: TxState,
    pub(crate) rx: RxState,
    pub(crate) eps: BTreeMap<EndpointId, Endpoint>,
    pub(crate) next_ep_slot: u32,
    /// Ids of destroyed endpoints, reused oldest first.
    pub(crate) free_ep_ids: VecDeque<EndpointId>,
    /// Endpoints with queued pending requests, in arrival order.
    pub(crate) arbiter: VecDeque<EndpointId>,
    /// Endpoints owing the peer a standalone ack.
    pub(crate) ack_queue: VecDeque<EndpointId>,
    pub(crate) handlers: Vec<Option<HandlerSlot>>,
    pub(crate) routes: LruCache<DeviceAddress, AhAttr>,
    pub(crate) event_cb: Option<EventCallback>,
    /// Completions to run once the critical section is left.
    pub(crate) ready: Vec<(CompletionCallback, Completion)>,
    pub(crate) stats: IfaceStats,
}

impl IfaceState {
    pub(crate) fn new(
        config: UdIfaceConfig,
        mut device: Box<dyn DatagramDevice>,
        mut domain: Box<dyn MemoryDomain>,
        event_cb: Option<EventCallback>,
    ) -> Result<Self, IfaceError> {
        config.validate()?;
        let caps = device.caps();
        if caps.max_send_sge < 2 {
            return Err(IfaceError::Unsupported("need at least two send sges"));
        }
        let seg_size = config.seg_size.min(caps.mtu);
        if seg_size <= NETH_LEN + AM_SHORT_HDR_LEN {
            return Err(IfaceError::Unsupported("mtu too small"));
        }
        let max_inline = config.max_inline.min(caps.max_inline).min(seg_size);
        if max_inline < NETH_LEN {
            return Err(IfaceError::Unsupported("inline limit below network header"));
        }
        if max_inline < config.max_inline {
            debug!(
                requested = config.max_inline,
                max_inline, "max_inline clamped to device limit"
            );
        }
        if config.rx_max_batch < RX_BATCH_MIN {
            warn!(
                "rx max batch is too low ({} < {}), performance may be impacted",
                config.rx_max_batch, RX_BATCH_MIN
            );
        }
        let limits = Limits {
            max_inline,
            seg_size,
            max_iov: (caps.max_send_sge - 1).min(MAX_IOV),
            req_notify: caps.req_notify_cq,
        };

        let lkey = domain.register(seg_size)?;
        let cache_size = NonZeroUsize::new(config.route_cache_size)
            .ok_or(IfaceError::InvalidConfig("route_cache_size must be > 0"))?;
        let local_gids = device.local_gids();
        let arm_rx = event_cb.is_some() && limits.req_notify;
        if arm_rx {
            device.arm(Direction::Rx, true)?;
        }

        let mut state = Self {
            skbs: SkbPool::new(config.tx_skbs, seg_size, lkey),
            tx: TxState {
                moderator: TxModerator::new(caps.ordered_send_completions, config.tx_moderation),
                available: config.tx_queue_len,
                inflight: VecDeque::new(),
                orphans: Vec::new(),
                async_comps: VecDeque::new(),
                wcs: Vec::with_capacity(config.tx_max_poll),
            },
            rx: RxState {
                pool: RecvPool::new(config.rx_queue_len, GRH_LEN + seg_size),
                pending: VecDeque::new(),
                wcs: Vec::with_capacity(config.rx_max_poll),
                gid_hit: None,
            },
            eps: BTreeMap::new(),
            next_ep_slot: 0,
            free_ep_ids: VecDeque::new(),
            arbiter: VecDeque::new(),
            ack_queue: VecDeque::new(),
            handlers: (0..sluice_core::AM_ID_MAX).map(|_| None).collect(),
            routes: LruCache::new(cache_size),
            event_cb,
            ready: Vec::new(),
            stats: IfaceStats::default(),
            limits,
            local_gids,
            device,
            domain,
            config,
        };
        while state.rx.pool.available() >= state.config.rx_max_batch {
            state.post_recv();
        }
        debug!(
            qpn = state.device.qp_num().0,
            max_inline = state.limits.max_inline,
            seg_size = state.limits.seg_size,
            ordered = state.tx.moderator.is_ordered(),
            "interface created"
        );
        Ok(state)
    }

    /// Posts one batch of receive buffers once a full batch is free.
    pub(crate) fn post_recv(&mut self) {
        if self.rx.pool.available() < self.config.rx_max_batch {
            return;
        }
        let batch = self.rx.pool.take_batch(self.config.rx_max_batch);
        if let Err(err) = self.device.post_recv(batch) {
            fatal(format_args!("post_recv failed: {err}"));
        }
    }

    pub(crate) fn has_tx_resources(&self) -> bool {
        self.tx.available > 0 && self.skbs.free_count() > 0
    }

    pub(crate) fn query(&self) -> IfaceAttr {
        let limits = &self.limits;
        IfaceAttr {
            max_short: limits
                .max_inline
                .saturating_sub(NETH_LEN + AM_SHORT_HDR_LEN),
            max_bcopy: limits.seg_size - NETH_LEN,
            max_zcopy: limits.seg_size - NETH_LEN,
            max_iov: limits.max_iov,
            max_hdr: limits.seg_size - NETH_LEN,
            max_put_short: limits
                .max_inline
                .saturating_sub(NETH_LEN + PUT_HDR_LEN),
            device_addr_len: DEVICE_ADDRESS_LEN,
            iface_addr_len: IFACE_ADDRESS_LEN,
            ep_addr_len: ENDPOINT_ADDRESS_LEN,
            peer_addr_len: PEER_ADDRESS_LEN,
            overhead: self.config.overhead,
            bandwidth: self.config.bandwidth,
            max_window: self.config.max_window,
            tx_queue_len: self.config.tx_queue_len,
            ordered_send_completions: self.tx.moderator.is_ordered(),
            events: limits.req_notify,
        }
    }

    pub(crate) fn estimate_perf(&self) -> PerfEstimate {
        PerfEstimate {
            send_pre_overhead: self.config.overhead,
            send_post_overhead: 0.0,
            recv_overhead: self.config.overhead,
            bandwidth: self.config.bandwidth,
            max_inflight_eps: usize::MAX,
        }
    }

    pub(crate) fn iface_address(&self) -> IfaceAddress {
        IfaceAddress {
            qpn: self.device.qp_num(),
        }
    }

    pub(crate) fn set_am_handler(
        &mut self,
        id: AmId,
        handler: Option<AmHandler>,
        flags: AmHandlerFlags,
    ) {
        self.handlers[id.get() as usize] = handler.map(|handler| HandlerSlot { handler, flags });
    }

    pub(crate) fn endpoint(&self, id: EndpointId) -> Result<&Endpoint, IfaceError> {
        self.eps.get(&id).ok_or(IfaceError::UnknownEndpoint(id))
    }

    pub(crate) fn endpoint_mut(&mut self, id: EndpointId) -> Result<&mut Endpoint, IfaceError> {
        self.eps.get_mut(&id).ok_or(IfaceError::UnknownEndpoint(id))
    }

    pub(crate) fn ep_create(&mut self) -> Result<EndpointId, IfaceError> {
        let id = match self.free_ep_ids.pop_front() {
            // A reused slot gets the next generation so stale packets miss it.
            Some(old) => {
                let generation = ((old.0 >> EP_SLOT_BITS) + 1) & EP_GENERATION_MASK;
                EndpointId((generation << EP_SLOT_BITS) | (old.0 & EP_SLOT_MAX))
            }
            None => {
                if self.next_ep_slot > EP_SLOT_MAX {
                    return Err(IfaceError::EndpointIdsExhausted);
                }
                let id = EndpointId(self.next_ep_slot);
                self.next_ep_slot += 1;
                id
            }
        };
        self.eps.insert(id, Endpoint::new(id, Instant::now()));
        debug!(ep = id.0, "endpoint created");
        Ok(id)
    }

    pub(crate) fn ep_get_address(&self, id: EndpointId) -> Result<EndpointAddress, IfaceError> {
        self.endpoint(id)?;
        Ok(EndpointAddress {
            iface: self.iface_address(),
            ep_id: id,
        })
    }

    /// Resolves a remote interface into a fresh, independently destroyable
    /// peer address. Route attributes come from the route cache.
    pub(crate) fn unpack_peer_address(
        &mut self,
        device_addr: &DeviceAddress,
        iface_addr: &IfaceAddress,
    ) -> Result<PeerAddress, IfaceError> {
        let attr = match self.routes.get(device_addr) {
            Some(attr) => *attr,
            None => {
                let attr = self.route_attr(device_addr);
                self.routes.put(*device_addr, attr);
                attr
            }
        };
        let ah = self.device.create_ah(&attr)?;
        Ok(PeerAddress {
            ah,
            dest_qpn: iface_addr.qpn,
            route: *device_addr,
        })
    }

    /// Picks the local gid of the same family as the destination.
    fn route_attr(&self, device_addr: &DeviceAddress) -> AhAttr {
        let sgid_index = device_addr
            .gid
            .and_then(|dgid| {
                self.local_gids
                    .iter()
                    .position(|gid| gid.is_ipv4_mapped() == dgid.is_ipv4_mapped())
            })
            .unwrap_or(0);
        AhAttr {
            dest: *device_addr,
            sgid_index: u8::try_from(sgid_index).unwrap_or(0),
        }
    }

    pub(crate) fn destroy_peer_address(&mut self, peer: &PeerAddress) {
        if let Err(err) = self.device.destroy_ah(peer.ah) {
            warn!(ah = peer.ah.0, "failed to destroy address handle: {err}");
        }
    }

    pub(crate) fn ep_connect_to_ep(
        &mut self,
        id: EndpointId,
        device_addr: &DeviceAddress,
        ep_addr: &EndpointAddress,
    ) -> Result<(), IfaceError> {
        let ep = self.endpoint(id)?;
        if ep.state != EndpointState::Created {
            return Err(IfaceError::AlreadyConnected(id));
        }
        let peer = self.unpack_peer_address(device_addr, &ep_addr.iface)?;
        let now = Instant::now();
        let ep = self.endpoint_mut(id)?;
        ep.peer = Some(peer);
        ep.dest_ep_id = ep_addr.ep_id;
        ep.state = EndpointState::Connected;
        ep.tx.last_ack = now;
        ep.tx.last_send = now;
        debug!(ep = id.0, dest_ep = ep_addr.ep_id.0, peer = %peer, "endpoint connected");
        Ok(())
    }

    pub(crate) fn ep_is_connected(
        &self,
        id: EndpointId,
        device_addr: &DeviceAddress,
        ep_addr: &EndpointAddress,
    ) -> bool {
        let Ok(ep) = self.endpoint(id) else {
            return false;
        };
        match (&ep.peer, ep.state) {
            (Some(peer), EndpointState::Connected | EndpointState::Flushing) => {
                peer.dest_qpn == ep_addr.iface.qpn
                    && peer.route == *device_addr
                    && ep.dest_ep_id == ep_addr.ep_id
            }
            _ => false,
        }
    }

    /// Returns a completion to the caller: queued for `progress` when
    /// produced in async context, otherwise run after the critical section.
    pub(crate) fn complete(&mut self, comp: CompletionCallback, status: Completion, is_async: bool) {
        if is_async {
            self.tx.async_comps.push_back((comp, status));
        } else {
            self.ready.push((comp, status));
        }
    }

    /// Retires acknowledged and completed packets from the head of the
    /// window, then finishes flush/destroy once the endpoint drains.
    pub(crate) fn try_retire(&mut self, id: EndpointId, is_async: bool) {
        let comp_sn = self.tx.moderator.comp_sn();
        let Some(ep) = self.eps.get_mut(&id) else {
            return;
        };
        let mut retired = Vec::new();
        while let Some(&skb_id) = ep.tx.window.front() {
            let skb = self.skbs.get_mut(skb_id);
            if !(skb.psn.precedes_or_eq(ep.tx.acked_psn) && skb.sn < comp_sn) {
                break;
            }
            ep.tx.window.pop_front();
            if let Some(comp) = skb.zcopy.take().and_then(|desc| desc.comp) {
                retired.push(comp);
            }
            self.skbs.release(skb_id);
        }
        let idle = ep.is_idle();
        let flush_comps = if idle {
            if ep.state == EndpointState::Flushing {
                ep.state = EndpointState::Connected;
            }
            std::mem::take(&mut ep.flush_comps)
        } else {
            Vec::new()
        };
        let free = idle && ep.destroy_requested;
        for comp in retired.into_iter().chain(flush_comps) {
            self.complete(comp, Completion::Ok, is_async);
        }
        if free {
            self.free_endpoint(id);
        }
    }

    /// Releases buffers of discarded endpoints whose submissions completed.
    pub(crate) fn release_orphans(&mut self) {
        let comp_sn = self.tx.moderator.comp_sn();
        let skbs = &mut self.skbs;
        self.tx.orphans.retain(|&(sn, skb_id)| {
            if sn < comp_sn {
                skbs.release(skb_id);
                false
            } else {
                true
            }
        });
    }

    /// Drops all outstanding work of an endpoint; zero-copy and flush
    /// completions fire with `Canceled`.
    pub(crate) fn discard_endpoint_work(&mut self, id: EndpointId, is_async: bool) {
        let comp_sn = self.tx.moderator.comp_sn();
        let Some(ep) = self.eps.get_mut(&id) else {
            return;
        };
        let mut canceled = Vec::new();
        while let Some(skb_id) = ep.tx.window.pop_front() {
            let skb = self.skbs.get_mut(skb_id);
            if let Some(comp) = skb.zcopy.take().and_then(|desc| desc.comp) {
                canceled.push(comp);
            }
            if skb.sn < comp_sn {
                self.skbs.release(skb_id);
            } else {
                self.tx.orphans.push((skb.sn, skb_id));
            }
        }
        let dropped = ep.pending.len();
        ep.pending.clear();
        ep.rx.ack_pending = false;
        canceled.append(&mut ep.flush_comps);
        if dropped > 0 {
            debug!(ep = id.0, dropped, "pending requests discarded");
        }
        for comp in canceled {
            self.complete(comp, Completion::Canceled, is_async);
        }
    }

    pub(crate) fn fail_endpoint(&mut self, id: EndpointId, is_async: bool) {
        self.discard_endpoint_work(id, is_async);
        if let Some(ep) = self.eps.get_mut(&id) {
            ep.state = EndpointState::Failed;
            self.stats.endpoints_failed += 1;
            warn!(ep = id.0, "endpoint failed: peer timeout");
            if ep.destroy_requested {
                self.free_endpoint(id);
            }
        }
    }

    pub(crate) fn ep_invalidate(&mut self, id: EndpointId) -> Result<(), IfaceError> {
        self.endpoint(id)?;
        self.discard_endpoint_work(id, false);
        let ep = self.endpoint_mut(id)?;
        ep.state = EndpointState::Disconnected;
        debug!(ep = id.0, "endpoint invalidated");
        if ep.destroy_requested {
            self.free_endpoint(id);
        }
        Ok(())
    }

    /// Destroys the endpoint now if drained, else once its window drains.
    pub(crate) fn ep_destroy(&mut self, id: EndpointId) -> Result<(), IfaceError> {
        let ep = self.endpoint_mut(id)?;
        ep.destroy_requested = true;
        let dropped = ep.pending.len();
        ep.pending.clear();
        if dropped > 0 {
            debug!(ep = id.0, dropped, "pending requests dropped on destroy");
        }
        let live = matches!(
            ep.state,
            EndpointState::Connected | EndpointState::Flushing
        );
        if ep.tx.window.is_empty() || !live {
            self.discard_endpoint_work(id, false);
            self.free_endpoint(id);
        } else {
            ep.state = EndpointState::Flushing;
            debug!(ep = id.0, unacked = ep.unacked(), "endpoint destroy deferred");
            if let Err(err) = self.send_ack_request(id) {
                debug!(ep = id.0, "destroy flush request not sent: {err}");
            }
        }
        Ok(())
    }

    pub(crate) fn free_endpoint(&mut self, id: EndpointId) {
        let Some(ep) = self.eps.remove(&id) else {
            return;
        };
        if let Some(peer) = ep.peer {
            self.destroy_peer_address(&peer);
        }
        self.arbiter.retain(|queued| *queued != id);
        self.ack_queue.retain(|queued| *queued != id);
        self.rx.pending.retain(|deferred| deferred.ep != id);
        self.free_ep_ids.push_back(id);
        debug!(ep = id.0, "endpoint destroyed");
    }
}
