use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::{Deserialize, Serialize};
use sluice_codec::{write_ipv4_grh, write_ipv6_grh, DeviceAddress, Gid, GRH_LEN};
use sluice_core::QpNumber;
use tracing::trace;

use crate::device::{
    AddressHandle, AhAttr, DatagramDevice, DeviceCaps, DeviceHealthSnapshot, Direction,
    RecvBuffer, RxCompletion, SendRequest, TxCompletion, WcStatus,
};
use crate::error::DeviceError;
use crate::memory::{HeapDomain, MemoryDomain};

const FIRST_QPN: u32 = 0x100;

/// Routing-header form synthesized for global routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GidFormat {
    #[default]
    Ipv6,
    Ipv4,
}

/// Per-device limits and addressing for the loopback fabric.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceOptions {
    pub ordered_send_completions: bool,
    pub req_notify_cq: bool,
    pub max_inline: usize,
    pub max_send_sge: usize,
    pub mtu: usize,
    pub max_recv_wr: usize,
    /// Local id; 0 assigns the next free one.
    pub lid: u16,
    /// Gid table. Empty means the port is reachable by lid only.
    pub gids: Vec<Gid>,
    pub gid_format: GidFormat,
}

impl Default for DeviceOptions {
    fn default() -> Self {
        Self {
            ordered_send_completions: true,
            req_notify_cq: true,
            max_inline: 128,
            max_send_sge: 4,
            mtu: 4096,
            max_recv_wr: 4096,
            lid: 0,
            gids: Vec::new(),
            gid_format: GidFormat::Ipv6,
        }
    }
}

/// Fabric-wide delivery counters.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FabricStats {
    pub delivered: u64,
    pub dropped_by_filter: u64,
    pub dropped_no_recv_buffer: u64,
    pub unroutable: u64,
    pub injected: u64,
}

type DropFilter = Box<dyn FnMut(&[u8]) -> bool + Send>;

#[derive(Debug)]
struct Port {
    options: DeviceOptions,
    lid: u16,
    domain: HeapDomain,
    posted: VecDeque<RecvBuffer>,
    rx_cq: VecDeque<RxCompletion>,
    tx_cq: VecDeque<TxCompletion>,
    held_tx: Vec<TxCompletion>,
    hold_tx: bool,
    armed_tx: Option<bool>,
    armed_rx: Option<bool>,
    events: VecDeque<Direction>,
    health: DeviceHealthSnapshot,
}

impl Port {
    fn raise(&mut self, dir: Direction, solicited: bool) {
        let armed = match dir {
            Direction::Tx => &mut self.armed_tx,
            Direction::Rx => &mut self.armed_rx,
        };
        if let Some(solicited_only) = *armed {
            if !solicited_only || solicited {
                *armed = None;
                self.events.push_back(dir);
                self.health.events_raised += 1;
            }
        }
    }

    fn complete_tx(&mut self, completion: TxCompletion) {
        if self.hold_tx {
            self.held_tx.push(completion);
        } else {
            self.tx_cq.push_back(completion);
            self.raise(Direction::Tx, false);
        }
    }
}

struct FabricState {
    ports: HashMap<u32, Port>,
    ahs: HashMap<u64, (u32, AhAttr)>,
    next_qpn: u32,
    next_lid: u16,
    next_ah: u64,
    drop_filter: Option<DropFilter>,
    stats: FabricStats,
}

impl FabricState {
    fn deliver(
        &mut self,
        dest_qpn: u32,
        grh: Option<(Gid, Gid)>,
        packet: &[u8],
        solicited: bool,
    ) -> bool {
        let Some(port) = self.ports.get_mut(&dest_qpn) else {
            self.stats.unroutable += 1;
            return false;
        };
        let Some(mut buffer) = port.posted.pop_front() else {
            self.stats.dropped_no_recv_buffer += 1;
            port.health.dropped_no_recv_buffer += 1;
            return false;
        };
        let byte_len = GRH_LEN + packet.len();
        if byte_len > buffer.data.len() {
            port.rx_cq.push_back(RxCompletion {
                buffer,
                status: WcStatus::LocalLengthError,
                byte_len: 0,
                grh_present: false,
            });
            port.raise(Direction::Rx, solicited);
            return false;
        }
        let grh_present = grh.is_some();
        if let Some((sgid, dgid)) = grh {
            let payload_len = u16::try_from(packet.len()).unwrap_or(u16::MAX);
            match port.options.gid_format {
                GidFormat::Ipv6 => write_ipv6_grh(&mut buffer.data, &sgid, &dgid, payload_len),
                GidFormat::Ipv4 => write_ipv4_grh(&mut buffer.data, &sgid, &dgid, payload_len),
            }
        }
        buffer.data[GRH_LEN..byte_len].copy_from_slice(packet);
        port.rx_cq.push_back(RxCompletion {
            buffer,
            status: WcStatus::Success,
            byte_len,
            grh_present,
        });
        port.raise(Direction::Rx, solicited);
        self.stats.delivered += 1;
        true
    }

    fn port(&self, qpn: u32) -> Result<&Port, DeviceError> {
        self.ports
            .get(&qpn)
            .ok_or(DeviceError::InvalidRequest("device closed"))
    }

    fn port_mut(&mut self, qpn: u32) -> Result<&mut Port, DeviceError> {
        self.ports
            .get_mut(&qpn)
            .ok_or(DeviceError::InvalidRequest("device closed"))
    }
}

/// In-memory datagram fabric connecting any number of loopback devices.
#[derive(Clone)]
pub struct LoopbackFabric {
    state: Arc<Mutex<FabricState>>,
}

impl fmt::Debug for LoopbackFabric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.lock();
        f.debug_struct("LoopbackFabric")
            .field("ports", &state.ports.len())
            .field("stats", &state.stats)
            .finish()
    }
}

impl Default for LoopbackFabric {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackFabric {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(FabricState {
                ports: HashMap::new(),
                ahs: HashMap::new(),
                next_qpn: FIRST_QPN,
                next_lid: 1,
                next_ah: 1,
                drop_filter: None,
                stats: FabricStats::default(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Attaches a new port with its own QP number and memory domain.
    pub fn open_device(&self, options: DeviceOptions) -> LoopbackDevice {
        let mut state = self.lock();
        let qpn = state.next_qpn;
        state.next_qpn += 1;
        let lid = if options.lid == 0 {
            let lid = state.next_lid;
            state.next_lid = state.next_lid.wrapping_add(1).max(1);
            lid
        } else {
            options.lid
        };
        let domain = HeapDomain::new();
        state.ports.insert(
            qpn,
            Port {
                options,
                lid,
                domain: domain.clone(),
                posted: VecDeque::new(),
                rx_cq: VecDeque::new(),
                tx_cq: VecDeque::new(),
                held_tx: Vec::new(),
                hold_tx: false,
                armed_tx: None,
                armed_rx: None,
                events: VecDeque::new(),
                health: DeviceHealthSnapshot::default(),
            },
        );
        LoopbackDevice {
            fabric: self.clone(),
            qpn: QpNumber(qpn),
            domain,
        }
    }

    /// Installs a filter that drops every datagram for which it returns true.
    /// The filter sees the datagram from its network header onwards.
    pub fn set_drop_filter(&self, filter: impl FnMut(&[u8]) -> bool + Send + 'static) {
        self.lock().drop_filter = Some(Box::new(filter));
    }

    pub fn clear_drop_filter(&self) {
        self.lock().drop_filter = None;
    }

    /// Delivers raw bytes to `qpn` as if received from the wire, with an
    /// optional `(sgid, dgid)` routing header.
    pub fn inject_raw(&self, qpn: QpNumber, grh: Option<(Gid, Gid)>, packet: &[u8]) -> bool {
        let mut state = self.lock();
        state.stats.injected += 1;
        state.deliver(qpn.0, grh, packet, true)
    }

    /// While held, send completions of `qpn` are parked instead of queued.
    pub fn hold_tx_completions(&self, qpn: QpNumber, hold: bool) {
        if let Some(port) = self.lock().ports.get_mut(&qpn.0) {
            port.hold_tx = hold;
        }
    }

    /// Moves parked send completions to the completion queue, optionally in
    /// reverse submission order.
    pub fn release_tx_completions(&self, qpn: QpNumber, reverse: bool) -> usize {
        let mut state = self.lock();
        let Some(port) = state.ports.get_mut(&qpn.0) else {
            return 0;
        };
        let mut held = std::mem::take(&mut port.held_tx);
        if reverse {
            held.reverse();
        }
        let released = held.len();
        port.tx_cq.extend(held);
        if released > 0 {
            port.raise(Direction::Tx, false);
        }
        released
    }

    pub fn posted_recv_count(&self, qpn: QpNumber) -> usize {
        self.lock()
            .ports
            .get(&qpn.0)
            .map_or(0, |port| port.posted.len())
    }

    /// First byte of every buffer currently posted on `qpn`.
    pub fn posted_first_bytes(&self, qpn: QpNumber) -> Vec<u8> {
        self.lock().ports.get(&qpn.0).map_or_else(Vec::new, |port| {
            port.posted
                .iter()
                .filter_map(|buffer| buffer.data.first().copied())
                .collect()
        })
    }

    pub fn stats(&self) -> FabricStats {
        self.lock().stats.clone()
    }
}

/// One port of a `LoopbackFabric`.
#[derive(Debug)]
pub struct LoopbackDevice {
    fabric: LoopbackFabric,
    qpn: QpNumber,
    domain: HeapDomain,
}

impl LoopbackDevice {
    /// Handle to the memory domain whose keys this device accepts.
    pub fn memory_domain(&self) -> HeapDomain {
        self.domain.clone()
    }

    pub fn fabric(&self) -> &LoopbackFabric {
        &self.fabric
    }
}

impl Drop for LoopbackDevice {
    fn drop(&mut self) {
        let mut state = self.fabric.lock();
        state.ports.remove(&self.qpn.0);
        state.ahs.retain(|_, (owner, _)| *owner != self.qpn.0);
    }
}

impl DatagramDevice for LoopbackDevice {
    fn caps(&self) -> DeviceCaps {
        let state = self.fabric.lock();
        match state.port(self.qpn.0) {
            Ok(port) => DeviceCaps {
                ordered_send_completions: port.options.ordered_send_completions,
                req_notify_cq: port.options.req_notify_cq,
                max_inline: port.options.max_inline,
                max_send_sge: port.options.max_send_sge,
                mtu: port.options.mtu,
            },
            Err(_) => DeviceCaps {
                ordered_send_completions: true,
                req_notify_cq: false,
                max_inline: 0,
                max_send_sge: 0,
                mtu: 0,
            },
        }
    }

    fn local_address(&self) -> DeviceAddress {
        let state = self.fabric.lock();
        match state.port(self.qpn.0) {
            Ok(port) => DeviceAddress {
                lid: port.lid,
                gid: port.options.gids.first().copied(),
            },
            Err(_) => DeviceAddress { lid: 0, gid: None },
        }
    }

    fn local_gids(&self) -> Vec<Gid> {
        let state = self.fabric.lock();
        state
            .port(self.qpn.0)
            .map(|port| port.options.gids.clone())
            .unwrap_or_default()
    }

    fn qp_num(&self) -> QpNumber {
        self.qpn
    }

    fn create_ah(&mut self, attr: &AhAttr) -> Result<AddressHandle, DeviceError> {
        let mut state = self.fabric.lock();
        let id = state.next_ah;
        state.next_ah += 1;
        state.ahs.insert(id, (self.qpn.0, *attr));
        Ok(AddressHandle(id))
    }

    fn destroy_ah(&mut self, ah: AddressHandle) -> Result<(), DeviceError> {
        let mut state = self.fabric.lock();
        match state.ahs.get(&ah.0) {
            Some((owner, _)) if *owner == self.qpn.0 => {
                state.ahs.remove(&ah.0);
                Ok(())
            }
            _ => Err(DeviceError::UnknownAddressHandle(ah.0)),
        }
    }

    fn post_send(&mut self, wr: &SendRequest<'_>) -> Result<(), DeviceError> {
        let mut guard = self.fabric.lock();
        let state = &mut *guard;
        let total = wr.total_len();
        let (sgid, status) = {
            let port = state.port(self.qpn.0)?;
            if wr.sges.len() > port.options.max_send_sge {
                return Err(DeviceError::InvalidRequest("too many scatter/gather entries"));
            }
            if wr.inline && total > port.options.max_inline {
                return Err(DeviceError::InvalidRequest("inline data exceeds max_inline"));
            }
            if total > port.options.mtu {
                return Err(DeviceError::InvalidRequest("message exceeds mtu"));
            }
            let keys_ok = wr.inline
                || wr
                    .sges
                    .iter()
                    .all(|sge| port.domain.is_registered(sge.lkey, sge.data.len()));
            let status = if keys_ok {
                WcStatus::Success
            } else {
                WcStatus::LocalProtectionError
            };
            (port.options.gids.first().copied(), status)
        };
        let (owner, attr) = *state
            .ahs
            .get(&wr.ah.0)
            .ok_or(DeviceError::UnknownAddressHandle(wr.ah.0))?;
        if owner != self.qpn.0 {
            return Err(DeviceError::UnknownAddressHandle(wr.ah.0));
        }

        if status.is_success() {
            let mut packet = Vec::with_capacity(total);
            for sge in wr.sges {
                packet.extend_from_slice(sge.data);
            }
            let dropped = state
                .drop_filter
                .as_mut()
                .is_some_and(|filter| filter(packet.as_slice()));
            if dropped {
                state.stats.dropped_by_filter += 1;
                trace!(src = self.qpn.0, dest = wr.dest_qpn.0, "loopback dropped datagram");
            } else {
                let grh = attr
                    .dest
                    .gid
                    .map(|dgid| (sgid.unwrap_or_default(), dgid));
                state.deliver(wr.dest_qpn.0, grh, &packet, wr.solicited);
            }
        }

        let port = state.port_mut(self.qpn.0)?;
        port.health.sends_posted += 1;
        if wr.signaled || !status.is_success() {
            port.complete_tx(TxCompletion {
                token: wr.token,
                status,
                byte_len: total,
            });
        }
        Ok(())
    }

    fn post_recv(&mut self, buffers: Vec<RecvBuffer>) -> Result<(), DeviceError> {
        let mut state = self.fabric.lock();
        let port = state.port_mut(self.qpn.0)?;
        if port.posted.len() + buffers.len() > port.options.max_recv_wr {
            return Err(DeviceError::QueueFull);
        }
        port.health.recvs_posted += buffers.len() as u64;
        port.posted.extend(buffers);
        Ok(())
    }

    fn poll_tx(&mut self, max: usize, out: &mut Vec<TxCompletion>) -> Result<usize, DeviceError> {
        let mut state = self.fabric.lock();
        let port = state.port_mut(self.qpn.0)?;
        let n = max.min(port.tx_cq.len());
        out.extend(port.tx_cq.drain(..n));
        port.health.send_completions += n as u64;
        Ok(n)
    }

    fn poll_rx(&mut self, max: usize, out: &mut Vec<RxCompletion>) -> Result<usize, DeviceError> {
        let mut state = self.fabric.lock();
        let port = state.port_mut(self.qpn.0)?;
        let n = max.min(port.rx_cq.len());
        out.extend(port.rx_cq.drain(..n));
        port.health.recv_completions += n as u64;
        Ok(n)
    }

    fn arm(&mut self, dir: Direction, solicited_only: bool) -> Result<(), DeviceError> {
        let mut state = self.fabric.lock();
        let port = state.port_mut(self.qpn.0)?;
        if !port.options.req_notify_cq {
            return Err(DeviceError::Unsupported("completion notification"));
        }
        match dir {
            Direction::Tx => port.armed_tx = Some(solicited_only),
            Direction::Rx => port.armed_rx = Some(solicited_only),
        }
        Ok(())
    }

    fn take_event(&mut self) -> Option<Direction> {
        let mut state = self.fabric.lock();
        state.ports.get_mut(&self.qpn.0)?.events.pop_front()
    }

    fn health_snapshot(&self) -> DeviceHealthSnapshot {
        let state = self.fabric.lock();
        state
            .port(self.qpn.0)
            .map(|port| port.health.clone())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use sluice_codec::{gid_len, DeviceAddress, Gid, GRH_LEN, IPV4_GID_LEN, RX_SENTINEL};
    use sluice_core::MemoryKey;

    use super::{DeviceOptions, GidFormat, LoopbackFabric};
    use crate::device::{
        AhAttr, DatagramDevice, Direction, RecvBuffer, SendRequest, Sge, WcStatus,
    };
    use crate::error::DeviceError;
    use crate::memory::MemoryDomain;

    fn recv_buffers(n: usize) -> Vec<RecvBuffer> {
        (0..n)
            .map(|id| {
                let mut data = vec![0u8; GRH_LEN + 256];
                data[0] = RX_SENTINEL;
                RecvBuffer { id, data }
            })
            .collect()
    }

    fn ah_to(
        dev: &mut impl DatagramDevice,
        dest: DeviceAddress,
    ) -> crate::device::AddressHandle {
        dev.create_ah(&AhAttr {
            dest,
            sgid_index: 0,
        })
        .expect("create ah")
    }

    #[test]
    fn inline_send_reaches_peer_and_signals_once() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.open_device(DeviceOptions::default());
        let mut b = fabric.open_device(DeviceOptions::default());
        b.post_recv(recv_buffers(2)).expect("post recv");
        let ah = ah_to(&mut a, b.local_address());

        let payload = [Sge {
            data: b"hello",
            lkey: MemoryKey::UNREGISTERED,
        }];
        for (token, signaled) in [(1u64, false), (2u64, true)] {
            a.post_send(&SendRequest {
                ah,
                dest_qpn: b.qp_num(),
                sges: &payload,
                inline: true,
                signaled,
                solicited: false,
                token,
            })
            .expect("post send");
        }

        let mut tx = Vec::new();
        assert_eq!(a.poll_tx(16, &mut tx).expect("poll tx"), 1);
        assert_eq!(tx[0].token, 2);
        assert_eq!(tx[0].status, WcStatus::Success);

        let mut rx = Vec::new();
        assert_eq!(b.poll_rx(16, &mut rx).expect("poll rx"), 2);
        assert!(!rx[0].grh_present);
        assert_eq!(rx[0].byte_len, GRH_LEN + 5);
        assert_eq!(&rx[0].buffer.data[GRH_LEN..GRH_LEN + 5], b"hello");
        assert_eq!(rx[0].buffer.data[0], RX_SENTINEL);
    }

    #[test]
    fn limits_are_enforced_at_submit() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.open_device(DeviceOptions {
            max_inline: 4,
            max_send_sge: 1,
            ..DeviceOptions::default()
        });
        let b = fabric.open_device(DeviceOptions::default());
        let ah = ah_to(&mut a, b.local_address());
        let sge = Sge {
            data: b"12345",
            lkey: MemoryKey::UNREGISTERED,
        };
        let err = a
            .post_send(&SendRequest {
                ah,
                dest_qpn: b.qp_num(),
                sges: &[sge],
                inline: true,
                signaled: true,
                solicited: false,
                token: 0,
            })
            .expect_err("inline over limit");
        assert_eq!(
            err,
            DeviceError::InvalidRequest("inline data exceeds max_inline")
        );
        assert!(a
            .post_send(&SendRequest {
                ah,
                dest_qpn: b.qp_num(),
                sges: &[sge, sge],
                inline: false,
                signaled: true,
                solicited: false,
                token: 0,
            })
            .is_err());
    }

    #[test]
    fn unregistered_key_completes_with_protection_error() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.open_device(DeviceOptions::default());
        let mut b = fabric.open_device(DeviceOptions::default());
        b.post_recv(recv_buffers(1)).expect("post recv");
        let ah = ah_to(&mut a, b.local_address());
        let mut domain = a.memory_domain();
        let key = domain.register(8).expect("register");

        for (token, lkey) in [(7u64, MemoryKey(4242)), (8u64, key)] {
            a.post_send(&SendRequest {
                ah,
                dest_qpn: b.qp_num(),
                sges: &[Sge {
                    data: b"zcopy",
                    lkey,
                }],
                inline: false,
                signaled: false,
                solicited: false,
                token,
            })
            .expect("post send");
        }
        let mut tx = Vec::new();
        a.poll_tx(8, &mut tx).expect("poll tx");
        assert_eq!(tx.len(), 1);
        assert_eq!(tx[0].token, 7);
        assert_eq!(tx[0].status, WcStatus::LocalProtectionError);
        assert_eq!(fabric.stats().delivered, 1);
    }

    #[test]
    fn ipv4_routing_header_preserves_sentinel() {
        let fabric = LoopbackFabric::new();
        let a_gid = Gid::from_ipv4([10, 0, 0, 1]);
        let b_gid = Gid::from_ipv4([10, 0, 0, 2]);
        let mut a = fabric.open_device(DeviceOptions {
            gids: vec![a_gid],
            ..DeviceOptions::default()
        });
        let mut b = fabric.open_device(DeviceOptions {
            gids: vec![b_gid],
            gid_format: GidFormat::Ipv4,
            ..DeviceOptions::default()
        });
        b.post_recv(recv_buffers(1)).expect("post recv");
        let ah = ah_to(&mut a, b.local_address());
        a.post_send(&SendRequest {
            ah,
            dest_qpn: b.qp_num(),
            sges: &[Sge {
                data: b"x",
                lkey: MemoryKey::UNREGISTERED,
            }],
            inline: true,
            signaled: false,
            solicited: false,
            token: 0,
        })
        .expect("post send");
        let mut rx = Vec::new();
        b.poll_rx(1, &mut rx).expect("poll rx");
        assert!(rx[0].grh_present);
        assert_eq!(gid_len(&rx[0].buffer.data), IPV4_GID_LEN);
        assert_eq!(&rx[0].buffer.data[36..40], &[10, 0, 0, 2]);
    }

    #[test]
    fn solicited_arm_ignores_unsolicited_traffic() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.open_device(DeviceOptions::default());
        let mut b = fabric.open_device(DeviceOptions::default());
        b.post_recv(recv_buffers(4)).expect("post recv");
        b.arm(Direction::Rx, true).expect("arm");
        let ah = ah_to(&mut a, b.local_address());
        for solicited in [false, true, true] {
            a.post_send(&SendRequest {
                ah,
                dest_qpn: b.qp_num(),
                sges: &[],
                inline: true,
                signaled: false,
                solicited,
                token: 0,
            })
            .expect("post send");
        }
        assert_eq!(b.take_event(), Some(Direction::Rx));
        assert_eq!(b.take_event(), None);
        assert_eq!(b.health_snapshot().events_raised, 1);
    }

    #[test]
    fn held_completions_release_in_reverse() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.open_device(DeviceOptions {
            ordered_send_completions: false,
            ..DeviceOptions::default()
        });
        let mut b = fabric.open_device(DeviceOptions::default());
        b.post_recv(recv_buffers(3)).expect("post recv");
        let ah = ah_to(&mut a, b.local_address());
        fabric.hold_tx_completions(a.qp_num(), true);
        for token in 0..3u64 {
            a.post_send(&SendRequest {
                ah,
                dest_qpn: b.qp_num(),
                sges: &[],
                inline: true,
                signaled: true,
                solicited: false,
                token,
            })
            .expect("post send");
        }
        let mut tx = Vec::new();
        assert_eq!(a.poll_tx(8, &mut tx).expect("poll"), 0);
        assert_eq!(fabric.release_tx_completions(a.qp_num(), true), 3);
        a.poll_tx(8, &mut tx).expect("poll");
        let tokens: Vec<u64> = tx.iter().map(|wc| wc.token).collect();
        assert_eq!(tokens, vec![2, 1, 0]);
    }

    #[test]
    fn drop_filter_and_missing_buffers_are_counted() {
        let fabric = LoopbackFabric::new();
        let mut a = fabric.open_device(DeviceOptions::default());
        let b = fabric.open_device(DeviceOptions::default());
        let ah = ah_to(&mut a, b.local_address());
        let send = |a: &mut super::LoopbackDevice| {
            a.post_send(&SendRequest {
                ah,
                dest_qpn: b.qp_num(),
                sges: &[],
                inline: true,
                signaled: false,
                solicited: false,
                token: 0,
            })
            .expect("post send");
        };
        send(&mut a);
        fabric.set_drop_filter(|_| true);
        send(&mut a);
        fabric.clear_drop_filter();
        let stats = fabric.stats();
        assert_eq!(stats.dropped_no_recv_buffer, 1);
        assert_eq!(stats.dropped_by_filter, 1);
    }

    #[test]
    fn dropping_device_detaches_port() {
        let fabric = LoopbackFabric::new();
        let a = fabric.open_device(DeviceOptions::default());
        let qpn = a.qp_num();
        drop(a);
        assert!(!fabric.inject_raw(qpn, None, b"late"));
        assert_eq!(fabric.stats().unroutable, 1);
    }
}
