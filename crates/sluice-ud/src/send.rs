use std::time::Instant;

use sluice_codec::{
    dump_packet, AmShortHeader, NetHeader, PacketFlags, PutHeader, AM_SHORT_HDR_LEN, NETH_LEN,
    PUT_HDR_LEN,
};
use sluice_core::{AmId, EndpointId, MemoryKey, Psn};
use sluice_transport::{DatagramDevice, SendRequest, Sge};
use tracing::{enabled, trace, Level};

use crate::endpoint::{EndpointState, PeerAddress};
use crate::error::{fatal, SendError};
use crate::pool::SkbId;
use crate::state::{IfaceState, TxState};
use crate::types::{CompletionCallback, Iov, OpStatus, ZcopyDesc};

/// Submits one work request through the moderator and takes one credit.
///
/// Callers check `tx.available > 0` first; a device rejection here means a
/// malformed request and is fatal.
pub(crate) fn post(
    device: &mut dyn DatagramDevice,
    tx: &mut TxState,
    peer: &PeerAddress,
    sges: &[Sge<'_>],
    inline: bool,
    force_signal: bool,
    solicited: bool,
) -> u64 {
    if tx.available == 0 {
        fatal(format_args!("send submitted without credit"));
    }
    // The last credit always asks for a completion so credits return.
    let sub = tx.moderator.stamp(force_signal || tx.available == 1);
    let wr = SendRequest {
        ah: peer.ah,
        dest_qpn: peer.dest_qpn,
        sges,
        inline,
        signaled: sub.signaled,
        solicited,
        token: sub.token,
    };
    if let Err(err) = device.post_send(&wr) {
        fatal(format_args!("post_send to {peer} failed: {err}"));
    }
    tx.available -= 1;
    if enabled!(Level::TRACE) {
        if let Some(first) = sges.first() {
            trace!(
                sn = sub.sn,
                signaled = sub.signaled,
                "tx {}",
                dump_packet(first.data)
            );
        }
    }
    sub.sn
}

impl IfaceState {
    /// Checks endpoint state and resources, then checks out a send buffer.
    fn prepare_data(&mut self, id: EndpointId, from_pending: bool) -> Result<SkbId, SendError> {
        let ep = self.eps.get(&id).ok_or(SendError::UnknownEndpoint(id))?;
        if !ep.can_send() {
            return Err(ep.send_error());
        }
        let blocked = (!from_pending && !ep.pending.is_empty())
            || ep.window_full(self.config.max_window)
            || !self.has_tx_resources();
        if blocked {
            self.stats.no_resource += 1;
            return Err(SendError::NoResource);
        }
        self.skbs.acquire().ok_or(SendError::NoResource)
    }

    /// Stamps the network header, appends the packet to the endpoint window
    /// and submits it.
    fn finish_data(
        &mut self,
        id: EndpointId,
        skb_id: SkbId,
        mut flags: PacketFlags,
        am_id: u8,
        force_ack_req: bool,
    ) -> Psn {
        let now = Instant::now();
        let ack_req_thresh = self.config.ack_req_thresh;
        let max_window = self.config.max_window;
        let Some(ep) = self.eps.get_mut(&id) else {
            fatal(format_args!("endpoint {id} vanished during send"));
        };
        let Some(peer) = ep.peer else {
            fatal(format_args!("connected endpoint {id} has no peer"));
        };
        let psn = ep.tx.psn;
        ep.tx.psn = psn.next();
        let unacked = ep.unacked();
        if force_ack_req || unacked % ack_req_thresh == 0 || unacked >= max_window {
            flags.insert(PacketFlags::ACK_REQ);
        }
        let neth = NetHeader {
            dest_ep_id: ep.dest_ep_id,
            flags,
            am_id,
            psn,
            ack_psn: ep.rx.acked_psn,
        };
        ep.rx.ack_pending = false;
        if ep.tx.window.is_empty() {
            ep.tx.last_ack = now;
            ep.tx.ack_requested = false;
        }
        ep.tx.last_send = now;
        ep.tx.window.push_back(skb_id);

        let skb = self.skbs.get_mut(skb_id);
        skb.psn = psn;
        if let Err(err) = neth.write_to(&mut skb.data) {
            fatal(format_args!("send buffer too small for header: {err}"));
        }
        let ack_req = flags.contains(PacketFlags::ACK_REQ);
        let sn = self.post_skb(skb_id, &peer, ack_req, ack_req);
        self.skbs.get_mut(skb_id).sn = sn;
        self.tx.inflight.push_back((sn, id));
        psn
    }

    /// Posts the packet held by `skb_id`, gathering zero-copy segments.
    pub(crate) fn post_skb(
        &mut self,
        skb_id: SkbId,
        peer: &PeerAddress,
        force_signal: bool,
        solicited: bool,
    ) -> u64 {
        let lkey = self.skbs.lkey();
        let skb = self.skbs.get(skb_id);
        let mut sges = Vec::with_capacity(1 + skb.zcopy.as_ref().map_or(0, |desc| desc.iov.len()));
        sges.push(Sge {
            data: skb.packet(),
            lkey: if skb.inline {
                MemoryKey::UNREGISTERED
            } else {
                lkey
            },
        });
        if let Some(desc) = &skb.zcopy {
            sges.extend(desc.iov.iter().map(|iov| Sge {
                data: &iov.buffer,
                lkey: iov.lkey,
            }));
        }
        post(
            self.device.as_mut(),
            &mut self.tx,
            peer,
            &sges,
            skb.inline,
            force_signal,
            solicited,
        )
    }

    pub(crate) fn am_short(
        &mut self,
        id: EndpointId,
        am_id: AmId,
        header: u64,
        payload: &[u8],
        from_pending: bool,
    ) -> Result<(), SendError> {
        let len = NETH_LEN + AM_SHORT_HDR_LEN + payload.len();
        if len > self.limits.max_inline {
            return Err(SendError::MessageTooLong {
                len: payload.len(),
                max: self
                    .limits
                    .max_inline
                    .saturating_sub(NETH_LEN + AM_SHORT_HDR_LEN),
            });
        }
        let skb_id = self.prepare_data(id, from_pending)?;
        let skb = self.skbs.get_mut(skb_id);
        let body = &mut skb.data[NETH_LEN..len];
        body[..AM_SHORT_HDR_LEN].copy_from_slice(&AmShortHeader(header).encode());
        body[AM_SHORT_HDR_LEN..].copy_from_slice(payload);
        skb.len = len;
        skb.inline = true;
        self.finish_data(id, skb_id, PacketFlags::AM, am_id.get(), false);
        self.stats.am_short.record(AM_SHORT_HDR_LEN + payload.len());
        Ok(())
    }

    pub(crate) fn am_short_iov(
        &mut self,
        id: EndpointId,
        am_id: AmId,
        iov: &[&[u8]],
        from_pending: bool,
    ) -> Result<(), SendError> {
        if iov.len() > self.limits.max_iov {
            return Err(SendError::IovCount {
                count: iov.len(),
                max: self.limits.max_iov,
            });
        }
        let payload: usize = iov.iter().map(|segment| segment.len()).sum();
        let len = NETH_LEN + payload;
        if len > self.limits.max_inline {
            return Err(SendError::MessageTooLong {
                len: payload,
                max: self.limits.max_inline - NETH_LEN,
            });
        }
        let skb_id = self.prepare_data(id, from_pending)?;
        let skb = self.skbs.get_mut(skb_id);
        let mut offset = NETH_LEN;
        for segment in iov {
            skb.data[offset..offset + segment.len()].copy_from_slice(segment);
            offset += segment.len();
        }
        skb.len = len;
        skb.inline = true;
        self.finish_data(id, skb_id, PacketFlags::AM, am_id.get(), false);
        self.stats.am_short.record(payload);
        Ok(())
    }

    pub(crate) fn am_bcopy(
        &mut self,
        id: EndpointId,
        am_id: AmId,
        pack: impl FnOnce(&mut [u8]) -> usize,
        from_pending: bool,
    ) -> Result<usize, SendError> {
        let seg_size = self.limits.seg_size;
        let skb_id = self.prepare_data(id, from_pending)?;
        let skb = self.skbs.get_mut(skb_id);
        let packed = pack(&mut skb.data[NETH_LEN..seg_size]).min(seg_size - NETH_LEN);
        skb.len = NETH_LEN + packed;
        self.finish_data(id, skb_id, PacketFlags::AM, am_id.get(), false);
        self.stats.am_bcopy.record(packed);
        Ok(packed)
    }

    pub(crate) fn am_zcopy(
        &mut self,
        id: EndpointId,
        am_id: AmId,
        header: &[u8],
        iov: Vec<Iov>,
        comp: Option<CompletionCallback>,
        from_pending: bool,
    ) -> Result<OpStatus, SendError> {
        if iov.len() > self.limits.max_iov {
            return Err(SendError::IovCount {
                count: iov.len(),
                max: self.limits.max_iov,
            });
        }
        let max = self.limits.seg_size - NETH_LEN;
        let payload = header.len() + iov.iter().map(|entry| entry.buffer.len()).sum::<usize>();
        if payload > max {
            return Err(SendError::MessageTooLong { len: payload, max });
        }
        let skb_id = self.prepare_data(id, from_pending)?;
        let skb = self.skbs.get_mut(skb_id);
        skb.data[NETH_LEN..NETH_LEN + header.len()].copy_from_slice(header);
        skb.len = NETH_LEN + header.len();
        skb.zcopy = Some(ZcopyDesc { iov, comp });
        self.finish_data(id, skb_id, PacketFlags::AM, am_id.get(), true);
        self.stats.am_zcopy.record(payload);
        Ok(OpStatus::InProgress)
    }

    pub(crate) fn put_short(
        &mut self,
        id: EndpointId,
        payload: &[u8],
        remote_addr: u64,
        rkey: MemoryKey,
        from_pending: bool,
    ) -> Result<(), SendError> {
        let len = NETH_LEN + PUT_HDR_LEN + payload.len();
        if len > self.limits.max_inline {
            return Err(SendError::MessageTooLong {
                len: payload.len(),
                max: self.limits.max_inline.saturating_sub(NETH_LEN + PUT_HDR_LEN),
            });
        }
        let skb_id = self.prepare_data(id, from_pending)?;
        let skb = self.skbs.get_mut(skb_id);
        let put = PutHeader {
            remote_addr,
            rkey: rkey.0,
        };
        skb.data[NETH_LEN..NETH_LEN + PUT_HDR_LEN].copy_from_slice(&put.encode());
        skb.data[NETH_LEN + PUT_HDR_LEN..len].copy_from_slice(payload);
        skb.len = len;
        skb.inline = true;
        self.finish_data(id, skb_id, PacketFlags::PUT, 0, true);
        self.stats.put_short.record(payload.len());
        Ok(())
    }

    /// Sends a control packet carrying only the network header. Control
    /// packets take a credit but no sequence number.
    fn send_ctl(&mut self, id: EndpointId, flags: PacketFlags, signaled: bool) -> Result<(), SendError> {
        if self.tx.available == 0 {
            return Err(SendError::NoResource);
        }
        let ep = self.eps.get_mut(&id).ok_or(SendError::UnknownEndpoint(id))?;
        let peer = match (ep.peer, ep.state) {
            (Some(peer), EndpointState::Connected | EndpointState::Flushing) => peer,
            _ => return Err(ep.send_error()),
        };
        let neth = NetHeader {
            dest_ep_id: ep.dest_ep_id,
            flags,
            am_id: 0,
            psn: ep.tx.psn,
            ack_psn: ep.rx.acked_psn,
        };
        ep.rx.ack_pending = false;
        let bytes = neth.encode();
        let sges = [Sge {
            data: &bytes,
            lkey: MemoryKey::UNREGISTERED,
        }];
        let solicited = flags.contains(PacketFlags::ACK_REQ);
        post(
            self.device.as_mut(),
            &mut self.tx,
            &peer,
            &sges,
            true,
            signaled,
            solicited,
        );
        Ok(())
    }

    pub(crate) fn send_ack(&mut self, id: EndpointId) -> Result<(), SendError> {
        self.send_ctl(id, PacketFlags::NONE, false)?;
        self.stats.acks_sent += 1;
        Ok(())
    }

    /// Signaled ack request: drives both the peer ack and local completion
    /// of everything submitted before it.
    pub(crate) fn send_ack_request(&mut self, id: EndpointId) -> Result<(), SendError> {
        self.send_ctl(id, PacketFlags::ACK_REQ, true)?;
        self.stats.ack_requests_sent += 1;
        Ok(())
    }

    pub(crate) fn ep_flush(
        &mut self,
        id: EndpointId,
        comp: Option<CompletionCallback>,
    ) -> Result<OpStatus, SendError> {
        let ep = self.eps.get(&id).ok_or(SendError::UnknownEndpoint(id))?;
        match ep.state {
            EndpointState::Failed => return Err(SendError::EndpointFailed(id)),
            EndpointState::Created | EndpointState::Disconnected => return Ok(OpStatus::Done),
            EndpointState::Connected | EndpointState::Flushing => {}
        }
        if !ep.pending.is_empty() {
            self.stats.no_resource += 1;
            return Err(SendError::NoResource);
        }
        if ep.tx.window.is_empty() {
            return Ok(OpStatus::Done);
        }
        self.send_ack_request(id)?;
        let ep = self.eps.get_mut(&id).ok_or(SendError::UnknownEndpoint(id))?;
        ep.state = EndpointState::Flushing;
        if let Some(comp) = comp {
            ep.flush_comps.push(comp);
        }
        Ok(OpStatus::InProgress)
    }

    pub(crate) fn iface_flush(&mut self) -> Result<OpStatus, SendError> {
        let ids: Vec<EndpointId> = self
            .eps
            .values()
            .filter(|ep| ep.can_send() || ep.destroy_requested)
            .map(|ep| ep.id)
            .collect();
        let mut status = OpStatus::Done;
        for id in ids {
            match self.ep_flush(id, None) {
                Ok(OpStatus::InProgress) => status = OpStatus::InProgress,
                Ok(OpStatus::Done) | Err(SendError::EndpointFailed(_)) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(status)
    }
}
