use std::sync::Mutex;
use std::time::Instant;

use sluice_codec::{DeviceAddress, EndpointAddress, IfaceAddress};
use sluice_core::{AmId, EndpointId, MemoryKey};
use sluice_transport::{DatagramDevice, DeviceError, MemoryDomain, RemoteRegion};

use crate::config::UdIfaceConfig;
use crate::endpoint::{EndpointState, PeerAddress, PEER_ADDRESS_LEN};
use crate::error::{fatal, ArmError, IfaceError, PendingError, SendError};
use crate::state::{IfaceAttr, IfaceState, PerfEstimate};
use crate::stats::IfaceStats;
use crate::types::{
    AmHandler, AmHandlerFlags, CompletionCallback, EventCallback, EventFlags, Iov, OpStatus,
    PendingRequest,
};

/// A reliable datagram interface over one device queue pair.
///
/// Every operation runs inside a single critical section, including the
/// event-driven path. Completion callbacks and the event notifier run after
/// the section is left, so they may call back into the interface. Receive
/// handlers run inside it and must not.
///
/// A panic inside the section, such as a fatal device error, leaves the
/// interface unusable and every later call panics as well.
pub struct Interface {
    state: Mutex<IfaceState>,
}

impl std::fmt::Debug for Interface {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interface").finish_non_exhaustive()
    }
}

impl Interface {
    pub fn new(
        config: UdIfaceConfig,
        device: Box<dyn DatagramDevice>,
        domain: Box<dyn MemoryDomain>,
        event_cb: Option<EventCallback>,
    ) -> Result<Self, IfaceError> {
        Ok(Self {
            state: Mutex::new(IfaceState::new(config, device, domain, event_cb)?),
        })
    }

    /// Runs `f` in the critical section, then fires completions it produced.
    pub(crate) fn with_state<R>(&self, f: impl FnOnce(&mut IfaceState) -> R) -> R {
        let (out, ready) = {
            let mut state = match self.state.lock() {
                Ok(state) => state,
                Err(_) => fatal(format_args!("interface used after a fatal error")),
            };
            let out = f(&mut *state);
            (out, std::mem::take(&mut state.ready))
        };
        for (comp, status) in ready {
            comp(status);
        }
        out
    }

    pub fn query(&self) -> IfaceAttr {
        self.with_state(|state| state.query())
    }

    pub fn estimate_perf(&self) -> PerfEstimate {
        self.with_state(|state| state.estimate_perf())
    }

    pub fn iface_address(&self) -> IfaceAddress {
        self.with_state(|state| state.iface_address())
    }

    pub fn device_address(&self) -> DeviceAddress {
        self.with_state(|state| state.device.local_address())
    }

    /// Installs or clears the receive handler for `id`.
    pub fn set_am_handler(&self, id: AmId, handler: Option<AmHandler>, flags: AmHandlerFlags) {
        self.with_state(|state| state.set_am_handler(id, handler, flags));
    }

    /// Registers `len` bytes for zero-copy sends.
    pub fn mem_register(&self, len: usize) -> Result<MemoryKey, DeviceError> {
        self.with_state(|state| state.domain.register(len))
    }

    pub fn mem_deregister(&self, key: MemoryKey) -> Result<(), DeviceError> {
        self.with_state(|state| state.domain.deregister(key))
    }

    /// Allocates a region peers may target with `put_short`.
    pub fn alloc_region(&self, len: usize) -> Result<RemoteRegion, DeviceError> {
        self.with_state(|state| state.domain.alloc_region(len))
    }

    pub fn read_region(&self, region: &RemoteRegion) -> Result<Vec<u8>, DeviceError> {
        self.with_state(|state| state.domain.read(region.rkey, region.addr, region.len))
    }

    pub fn ep_create(&self) -> Result<EndpointId, IfaceError> {
        self.with_state(|state| state.ep_create())
    }

    /// Creates an endpoint and connects it to a remote one in one step.
    pub fn create_connected_ep(
        &self,
        device_addr: &DeviceAddress,
        ep_addr: &EndpointAddress,
    ) -> Result<EndpointId, IfaceError> {
        self.with_state(|state| {
            let id = state.ep_create()?;
            if let Err(err) = state.ep_connect_to_ep(id, device_addr, ep_addr) {
                state.free_endpoint(id);
                return Err(err);
            }
            Ok(id)
        })
    }

    pub fn ep_get_address(&self, id: EndpointId) -> Result<EndpointAddress, IfaceError> {
        self.with_state(|state| state.ep_get_address(id))
    }

    pub fn ep_connect_to_ep(
        &self,
        id: EndpointId,
        device_addr: &DeviceAddress,
        ep_addr: &EndpointAddress,
    ) -> Result<(), IfaceError> {
        self.with_state(|state| state.ep_connect_to_ep(id, device_addr, ep_addr))
    }

    pub fn ep_is_connected(
        &self,
        id: EndpointId,
        device_addr: &DeviceAddress,
        ep_addr: &EndpointAddress,
    ) -> bool {
        self.with_state(|state| state.ep_is_connected(id, device_addr, ep_addr))
    }

    /// `None` once the endpoint has been freed.
    pub fn ep_state(&self, id: EndpointId) -> Option<EndpointState> {
        self.with_state(|state| state.eps.get(&id).map(|ep| ep.state))
    }

    pub fn ep_peer_address(&self, id: EndpointId) -> Option<PeerAddress> {
        self.with_state(|state| state.eps.get(&id).and_then(|ep| ep.peer))
    }

    /// Completes once everything sent on the endpoint is acknowledged.
    pub fn ep_flush(
        &self,
        id: EndpointId,
        comp: Option<CompletionCallback>,
    ) -> Result<OpStatus, SendError> {
        self.with_state(|state| state.ep_flush(id, comp))
    }

    pub fn ep_destroy(&self, id: EndpointId) -> Result<(), IfaceError> {
        self.with_state(|state| state.ep_destroy(id))
    }

    /// Drops all outstanding work and disconnects without waiting.
    pub fn ep_invalidate(&self, id: EndpointId) -> Result<(), IfaceError> {
        self.with_state(|state| state.ep_invalidate(id))
    }

    pub fn iface_flush(&self) -> Result<OpStatus, SendError> {
        self.with_state(|state| state.iface_flush())
    }

    /// Packets of one endpoint are delivered in order; nothing to fence.
    pub fn fence(&self) -> Result<(), IfaceError> {
        Ok(())
    }

    pub fn am_short(
        &self,
        id: EndpointId,
        am_id: AmId,
        header: u64,
        payload: &[u8],
    ) -> Result<(), SendError> {
        self.with_state(|state| state.am_short(id, am_id, header, payload, false))
    }

    pub fn am_short_iov(&self, id: EndpointId, am_id: AmId, iov: &[&[u8]]) -> Result<(), SendError> {
        self.with_state(|state| state.am_short_iov(id, am_id, iov, false))
    }

    /// Packs the payload into a send buffer. Returns the packed length.
    pub fn am_bcopy(
        &self,
        id: EndpointId,
        am_id: AmId,
        pack: impl FnOnce(&mut [u8]) -> usize,
    ) -> Result<usize, SendError> {
        self.with_state(|state| state.am_bcopy(id, am_id, pack, false))
    }

    /// Sends caller memory without copying. `comp` fires once the packet is
    /// acknowledged and its submission completed.
    pub fn am_zcopy(
        &self,
        id: EndpointId,
        am_id: AmId,
        header: &[u8],
        iov: Vec<Iov>,
        comp: Option<CompletionCallback>,
    ) -> Result<OpStatus, SendError> {
        self.with_state(|state| state.am_zcopy(id, am_id, header, iov, comp, false))
    }

    pub fn put_short(
        &self,
        id: EndpointId,
        payload: &[u8],
        remote_addr: u64,
        rkey: MemoryKey,
    ) -> Result<(), SendError> {
        self.with_state(|state| state.put_short(id, payload, remote_addr, rkey, false))
    }

    pub fn pending_add(&self, id: EndpointId, request: PendingRequest) -> Result<(), PendingError> {
        self.with_state(|state| state.pending_add(id, request))
    }

    pub fn pending_purge(
        &self,
        id: EndpointId,
        cb: impl FnMut(PendingRequest),
    ) -> Result<(), PendingError> {
        self.with_state(|state| state.pending_purge(id, cb))
    }

    /// Polled progress. Returns the amount of work done.
    pub fn progress(&self) -> usize {
        self.with_state(|state| state.progress())
    }

    pub fn event_arm(&self, events: EventFlags) -> Result<(), ArmError> {
        self.with_state(|state| state.event_arm(events))
    }

    /// Takes one raised device event, if any.
    pub fn check_async_event(&self) -> bool {
        self.with_state(|state| state.device.take_event().is_some())
    }

    /// Event-driven progress for one device event. The notifier runs once,
    /// after the critical section is left.
    pub fn handle_async_event(&self) {
        let notify = self.with_state(|state| {
            if state.handle_async_event() {
                state.event_cb.clone()
            } else {
                None
            }
        });
        if let Some(cb) = notify {
            cb(0);
        }
    }

    /// Retransmits stalled windows and fails silent peers.
    pub fn timer_tick(&self, now: Instant) -> usize {
        self.with_state(|state| state.timer_tick(now))
    }

    /// Resolves a remote interface into a new, independently destroyable
    /// peer address.
    pub fn unpack_peer_address(
        &self,
        device_addr: &DeviceAddress,
        iface_addr: &IfaceAddress,
    ) -> Result<PeerAddress, IfaceError> {
        self.with_state(|state| state.unpack_peer_address(device_addr, iface_addr))
    }

    pub fn peer_address_len(&self) -> usize {
        PEER_ADDRESS_LEN
    }

    pub fn peer_address_str(&self, peer: &PeerAddress) -> String {
        peer.to_string()
    }

    pub fn destroy_peer_address(&self, peer: &PeerAddress) {
        self.with_state(|state| state.destroy_peer_address(peer));
    }

    pub fn stats(&self) -> IfaceStats {
        self.with_state(|state| state.stats.clone())
    }

    /// Send credits currently available.
    pub fn tx_available(&self) -> usize {
        self.with_state(|state| state.tx.available)
    }

    /// Receive slots not currently posted to the device.
    pub fn rx_available(&self) -> usize {
        self.with_state(|state| state.rx.pool.available())
    }

    pub fn free_skbs(&self) -> usize {
        self.with_state(|state| state.skbs.free_count())
    }

    pub fn pending_len(&self, id: EndpointId) -> usize {
        self.with_state(|state| state.eps.get(&id).map_or(0, |ep| ep.pending.len()))
    }

    /// Data packets on the endpoint not yet retired.
    pub fn window_len(&self, id: EndpointId) -> usize {
        self.with_state(|state| state.eps.get(&id).map_or(0, |ep| ep.tx.window.len()))
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{self, AssertUnwindSafe};
    use std::sync::{Arc, Mutex};

    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use sluice_codec::{NetHeader, PacketFlags};
    use sluice_core::{MemoryKey, Psn};
    use sluice_transport::{DatagramDevice, DeviceOptions, LoopbackFabric};

    use super::Interface;
    use crate::endpoint::EndpointState;
    use crate::error::{IfaceError, SendError};
    use crate::test_support::{am, pair, pair_with, small_config};
    use crate::types::{Completion, CompletionCallback, Iov, OpStatus};
    use crate::UdIfaceConfig;

    fn recorder() -> (Arc<Mutex<Vec<(usize, Completion)>>>, impl Fn(usize) -> CompletionCallback) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&log);
        let make = move |tag: usize| -> CompletionCallback {
            let sink = Arc::clone(&sink);
            Box::new(move |comp: Completion| sink.lock().expect("log").push((tag, comp)))
        };
        (log, make)
    }

    #[test]
    fn flush_completes_once_peer_acknowledges() {
        let pair = pair();
        for i in 0..3u8 {
            pair.a
                .iface
                .am_short(pair.a.ep, am(), 0, &[i])
                .expect("send");
        }
        let (log, make) = recorder();
        let status = pair
            .a
            .iface
            .ep_flush(pair.a.ep, Some(make(0)))
            .expect("flush");
        assert_eq!(status, OpStatus::InProgress);
        assert_eq!(pair.a.iface.ep_state(pair.a.ep), Some(EndpointState::Flushing));

        pair.settle();
        assert_eq!(*log.lock().expect("log"), vec![(0, Completion::Ok)]);
        assert_eq!(pair.a.iface.window_len(pair.a.ep), 0);
        assert_eq!(pair.a.iface.ep_state(pair.a.ep), Some(EndpointState::Connected));
        assert_eq!(pair.a.iface.ep_flush(pair.a.ep, None), Ok(OpStatus::Done));
    }

    #[test]
    fn interface_is_unusable_after_fatal_error() {
        let pair = pair();
        let iov = vec![Iov {
            buffer: Bytes::from_static(b"payload"),
            lkey: MemoryKey(999),
        }];
        pair.a
            .iface
            .am_zcopy(pair.a.ep, am(), b"", iov, None)
            .expect("submitted");
        let first = panic::catch_unwind(AssertUnwindSafe(|| pair.a.iface.progress()));
        assert!(first.is_err());

        let after = panic::catch_unwind(AssertUnwindSafe(|| {
            pair.a.iface.am_short(pair.a.ep, am(), 0, b"after-fatal")
        }));
        assert!(after.is_err());
        let polled = panic::catch_unwind(AssertUnwindSafe(|| pair.a.iface.progress()));
        assert!(polled.is_err());
    }

    #[test]
    fn iface_flush_waits_for_every_endpoint() {
        let pair = pair();
        assert_eq!(pair.a.iface.iface_flush(), Ok(OpStatus::Done));
        pair.a.iface.fence().expect("fence");

        pair.a
            .iface
            .am_short(pair.a.ep, am(), 0, b"x")
            .expect("send");
        assert_eq!(pair.a.iface.iface_flush(), Ok(OpStatus::InProgress));
        pair.settle();
        assert_eq!(pair.a.iface.iface_flush(), Ok(OpStatus::Done));
        assert_eq!(pair.b.received().len(), 1);
    }

    #[test]
    fn zcopy_completions_fire_in_sequence_order() {
        let options = DeviceOptions {
            ordered_send_completions: false,
            ..DeviceOptions::default()
        };
        let pair = pair_with(small_config(), options);
        let key = pair.a.iface.mem_register(256).expect("register");
        let (log, make) = recorder();
        pair.fabric.hold_tx_completions(pair.a.qpn, true);
        for tag in 1..=3 {
            let status = pair
                .a
                .iface
                .am_zcopy(
                    pair.a.ep,
                    am(),
                    &[tag as u8],
                    vec![Iov {
                        buffer: Bytes::from(vec![tag as u8; 16]),
                        lkey: key,
                    }],
                    Some(make(tag)),
                )
                .expect("zcopy");
            assert_eq!(status, OpStatus::InProgress);
        }
        pair.settle();
        assert!(log.lock().expect("log").is_empty());

        assert_eq!(pair.fabric.release_tx_completions(pair.a.qpn, true), 3);
        pair.fabric.hold_tx_completions(pair.a.qpn, false);
        pair.settle();
        assert_eq!(
            *log.lock().expect("log"),
            vec![
                (1, Completion::Ok),
                (2, Completion::Ok),
                (3, Completion::Ok)
            ]
        );
        assert_eq!(pair.a.iface.stats().am_zcopy.count, 3);
        assert_eq!(pair.b.received().len(), 3);
    }

    #[test]
    fn destroy_waits_for_outstanding_sends() {
        let pair = pair();
        pair.a
            .iface
            .am_short(pair.a.ep, am(), 0, b"bye")
            .expect("send");
        pair.a.iface.ep_destroy(pair.a.ep).expect("destroy");
        assert_eq!(pair.a.iface.ep_state(pair.a.ep), Some(EndpointState::Flushing));
        assert_eq!(
            pair.a.iface.am_short(pair.a.ep, am(), 0, b"more"),
            Err(SendError::NotConnected(pair.a.ep))
        );

        pair.settle();
        assert_eq!(pair.a.iface.ep_state(pair.a.ep), None);
        assert_eq!(pair.b.received().len(), 1);
        assert_eq!(pair.a.iface.free_skbs(), 64);
    }

    #[test]
    fn idle_endpoint_is_destroyed_immediately() {
        let pair = pair();
        let ep = pair.a.iface.ep_create().expect("ep");
        pair.a.iface.ep_destroy(ep).expect("destroy");
        assert_eq!(pair.a.iface.ep_state(ep), None);
        assert_eq!(
            pair.a.iface.ep_destroy(ep),
            Err(IfaceError::UnknownEndpoint(ep))
        );
    }

    #[test]
    fn destroy_without_credit_finishes_on_timer() {
        let config = UdIfaceConfig {
            tx_queue_len: 4,
            tx_moderation: 4,
            ..small_config()
        };
        let pair = pair_with(config, DeviceOptions::default());
        for i in 0..4u8 {
            pair.a
                .iface
                .am_short(pair.a.ep, am(), 0, &[i])
                .expect("send");
        }
        assert_eq!(pair.a.iface.tx_available(), 0);
        pair.a.iface.ep_destroy(pair.a.ep).expect("destroy");
        assert_eq!(pair.a.iface.stats().ack_requests_sent, 0);

        pair.settle();
        assert_eq!(pair.a.iface.ep_state(pair.a.ep), Some(EndpointState::Flushing));
        pair.a
            .iface
            .timer_tick(Instant::now() + Duration::from_secs(1));
        pair.settle();
        assert_eq!(pair.a.iface.ep_state(pair.a.ep), None);
        assert_eq!(pair.a.iface.stats().resends, 0);
        assert_eq!(pair.b.received().len(), 4);
    }

    #[test]
    fn reused_endpoint_id_ignores_stale_packets() {
        let pair = pair();
        let old = pair.b.iface.ep_create().expect("ep");
        pair.b.iface.ep_destroy(old).expect("destroy");
        let reused = pair.b.iface.ep_create().expect("ep");
        assert_ne!(reused, old);
        assert_eq!(reused.0 & 0xffff, old.0 & 0xffff);
        let a_addr = pair.a.iface.ep_get_address(pair.a.ep).expect("addr");
        pair.b
            .iface
            .ep_connect_to_ep(reused, &pair.a.iface.device_address(), &a_addr)
            .expect("connect");

        let mut packet = NetHeader {
            dest_ep_id: old,
            flags: PacketFlags::AM,
            am_id: am().get(),
            psn: Psn(1),
            ack_psn: Psn(0),
        }
        .encode()
        .to_vec();
        packet.extend_from_slice(b"stale");
        assert!(pair.fabric.inject_raw(pair.b.qpn, None, &packet));
        pair.b.iface.progress();
        assert!(pair.b.received().is_empty());
        assert_eq!(pair.b.iface.stats().rx_dropped_no_endpoint, 1);
    }

    #[test]
    fn endpoint_churn_never_exhausts_ids() {
        let pair = pair();
        for _ in 0..(1 << 17) {
            let ep = pair.a.iface.ep_create().expect("ep");
            pair.a.iface.ep_destroy(ep).expect("destroy");
        }
        assert!(pair.a.iface.ep_create().is_ok());
    }

    #[test]
    fn invalidate_cancels_outstanding_zcopy() {
        let pair = pair();
        let key = pair.a.iface.mem_register(64).expect("register");
        let (log, make) = recorder();
        pair.a
            .iface
            .am_zcopy(
                pair.a.ep,
                am(),
                b"",
                vec![Iov {
                    buffer: Bytes::from_static(b"abandon"),
                    lkey: key,
                }],
                Some(make(7)),
            )
            .expect("zcopy");
        pair.a.iface.ep_invalidate(pair.a.ep).expect("invalidate");
        assert_eq!(*log.lock().expect("log"), vec![(7, Completion::Canceled)]);
        assert_eq!(
            pair.a.iface.ep_state(pair.a.ep),
            Some(EndpointState::Disconnected)
        );
        assert_eq!(
            pair.a.iface.am_short(pair.a.ep, am(), 0, b"x"),
            Err(SendError::NotConnected(pair.a.ep))
        );
        pair.settle();
        assert_eq!(pair.a.iface.free_skbs(), 64);
    }

    #[test]
    fn query_reports_clamped_limits() {
        let options = DeviceOptions {
            max_inline: 64,
            ..DeviceOptions::default()
        };
        let pair = pair_with(small_config(), options);
        let attr = pair.a.iface.query();
        assert_eq!(attr.max_short, 64 - 10 - 8);
        assert_eq!(attr.max_put_short, 64 - 10 - 12);
        assert_eq!(attr.max_bcopy, 512 - 10);
        assert_eq!(attr.max_iov, 3);
        assert_eq!(attr.iface_addr_len, 3);
        assert_eq!(attr.ep_addr_len, 6);
        assert_eq!(attr.peer_addr_len, pair.a.iface.peer_address_len());
        assert!(attr.ordered_send_completions);
        assert_eq!(pair.a.iface.estimate_perf().send_pre_overhead, 105e-9);
    }

    #[test]
    fn connection_is_checked_against_peer_address() {
        let pair = pair();
        let b_addr = pair.b.iface.ep_get_address(pair.b.ep).expect("addr");
        let b_dev = pair.b.iface.device_address();
        assert!(pair.a.iface.ep_is_connected(pair.a.ep, &b_dev, &b_addr));

        let mut other = b_addr;
        other.ep_id.0 += 1;
        assert!(!pair.a.iface.ep_is_connected(pair.a.ep, &b_dev, &other));
        assert_eq!(
            pair.a.iface.ep_connect_to_ep(pair.a.ep, &b_dev, &b_addr),
            Err(IfaceError::AlreadyConnected(pair.a.ep))
        );
    }

    #[test]
    fn unpacked_peer_addresses_are_independent() {
        let pair = pair();
        let b_dev = pair.b.iface.device_address();
        let b_iface = pair.b.iface.iface_address();
        let first = pair
            .a
            .iface
            .unpack_peer_address(&b_dev, &b_iface)
            .expect("unpack");
        let second = pair
            .a
            .iface
            .unpack_peer_address(&b_dev, &b_iface)
            .expect("unpack");
        assert_ne!(first.ah, second.ah);
        assert_eq!(first.dest_qpn, second.dest_qpn);
        assert_eq!(
            pair.a.iface.peer_address_str(&first),
            format!("ah={} dest_qpn={}", first.ah.0, b_iface.qpn)
        );
        pair.a.iface.destroy_peer_address(&first);
        pair.a.iface.destroy_peer_address(&second);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let fabric = LoopbackFabric::new();
        let device = fabric.open_device(DeviceOptions::default());
        let domain = Box::new(device.memory_domain());
        let config = UdIfaceConfig {
            tx_queue_len: 0,
            ..small_config()
        };
        let err = Interface::new(config, Box::new(device), domain, None).expect_err("invalid");
        assert!(matches!(err, IfaceError::InvalidConfig(_)));
    }

    #[test]
    fn single_sge_device_is_unsupported() {
        let fabric = LoopbackFabric::new();
        let device = fabric.open_device(DeviceOptions {
            max_send_sge: 1,
            ..DeviceOptions::default()
        });
        assert_eq!(device.caps().max_send_sge, 1);
        let domain = Box::new(device.memory_domain());
        let err = Interface::new(small_config(), Box::new(device), domain, None)
            .expect_err("unsupported");
        assert_eq!(err, IfaceError::Unsupported("need at least two send sges"));
    }
}
