use std::time::Instant;

use sluice_codec::{dump_packet, NetHeader, PacketFlags, PutHeader, GRH_LEN, NETH_LEN, PUT_HDR_LEN};
use sluice_core::{AmId, EndpointId, MemoryKey};
use sluice_transport::RecvBuffer;
use tracing::{debug, enabled, trace, warn, Level};

use crate::endpoint::EndpointState;
use crate::state::{DeferredRx, IfaceState};
use crate::types::AmDelivery;

impl IfaceState {
    /// Handles one received packet. `byte_len` counts the routing header
    /// area in front of the packet.
    pub(crate) fn process_rx(&mut self, buffer: RecvBuffer, byte_len: usize, is_async: bool) {
        if byte_len < GRH_LEN + NETH_LEN || byte_len > buffer.data.len() {
            self.stats.rx_dropped_malformed += 1;
            self.rx.pool.recycle(buffer);
            return;
        }
        let packet = &buffer.data[GRH_LEN..byte_len];
        if enabled!(Level::TRACE) {
            trace!("rx {}", dump_packet(packet));
        }
        let neth = match NetHeader::decode(packet) {
            Ok(neth) => neth,
            Err(err) => {
                debug!("dropping malformed packet: {err}");
                self.stats.rx_dropped_malformed += 1;
                self.rx.pool.recycle(buffer);
                return;
            }
        };
        let id = neth.dest_ep_id;
        let live = self.eps.get(&id).is_some_and(|ep| {
            matches!(ep.state, EndpointState::Connected | EndpointState::Flushing)
        });
        if !live {
            trace!(ep = id.0, "dropping packet for unknown or closed endpoint");
            self.stats.rx_dropped_no_endpoint += 1;
            self.rx.pool.recycle(buffer);
            return;
        }

        self.process_ack(id, &neth, is_async);
        if neth.flags.contains(PacketFlags::ACK_REQ) {
            self.schedule_ack(id);
        }
        if !neth.flags.is_data() {
            self.rx.pool.recycle(buffer);
            return;
        }

        let Some(ep) = self.eps.get_mut(&id) else {
            self.rx.pool.recycle(buffer);
            return;
        };
        let expected = ep.rx.acked_psn.next();
        if neth.psn != expected {
            if neth.psn.precedes_or_eq(ep.rx.acked_psn) {
                self.stats.rx_dropped_duplicate += 1;
            } else {
                self.stats.rx_dropped_out_of_order += 1;
            }
            trace!(ep = id.0, psn = %neth.psn, expected = %expected, "dropping out of sequence packet");
            self.schedule_ack(id);
            self.rx.pool.recycle(buffer);
            return;
        }
        ep.rx.acked_psn = neth.psn;
        ep.rx.ack_pending = true;

        let start = GRH_LEN + NETH_LEN;
        if neth.flags.contains(PacketFlags::PUT) {
            self.deliver_put(id, &buffer.data[start..byte_len]);
            self.rx.pool.recycle(buffer);
            return;
        }
        let Ok(am_id) = AmId::new(neth.am_id) else {
            warn!(ep = id.0, am_id = neth.am_id, "active message id out of range");
            self.stats.rx_dropped_malformed += 1;
            self.rx.pool.recycle(buffer);
            return;
        };
        let sync_only = self.handlers[am_id.get() as usize]
            .as_ref()
            .is_some_and(|slot| slot.flags.sync_only);
        if is_async && sync_only {
            trace!(ep = id.0, am_id = am_id.get(), "deferring receive to progress");
            self.rx.pending.push_back(DeferredRx {
                ep: id,
                am_id,
                buffer,
                start,
                end: byte_len,
            });
            return;
        }
        self.invoke_handler(id, am_id, &buffer.data[start..byte_len], is_async);
        self.rx.pool.recycle(buffer);
    }

    /// Advances the send-side acknowledgement from a piggybacked ack.
    fn process_ack(&mut self, id: EndpointId, neth: &NetHeader, is_async: bool) {
        let Some(ep) = self.eps.get_mut(&id) else {
            return;
        };
        // Only acks inside (acked_psn, psn) move the window.
        if neth.ack_psn.follows(ep.tx.acked_psn) && neth.ack_psn.precedes(ep.tx.psn) {
            ep.tx.acked_psn = neth.ack_psn;
            ep.tx.last_ack = Instant::now();
            ep.tx.ack_requested = false;
            self.try_retire(id, is_async);
        }
    }

    fn deliver_put(&mut self, id: EndpointId, body: &[u8]) {
        let (put, data) = match PutHeader::decode(body) {
            Ok(put) => (put, &body[PUT_HDR_LEN..]),
            Err(err) => {
                warn!(ep = id.0, "malformed put: {err}");
                self.stats.rx_put_errors += 1;
                return;
            }
        };
        match self.domain.write(MemoryKey(put.rkey), put.remote_addr, data) {
            Ok(()) => self.stats.rx_delivered += 1,
            Err(err) => {
                warn!(
                    ep = id.0,
                    addr = put.remote_addr,
                    rkey = put.rkey,
                    "put rejected: {err}"
                );
                self.stats.rx_put_errors += 1;
            }
        }
    }

    fn invoke_handler(&mut self, id: EndpointId, am_id: AmId, data: &[u8], is_async: bool) {
        match self.handlers[am_id.get() as usize].as_mut() {
            Some(slot) => {
                (slot.handler)(AmDelivery {
                    ep: id,
                    am_id,
                    data,
                    is_async,
                });
                self.stats.rx_delivered += 1;
            }
            None => {
                warn!(ep = id.0, am_id = am_id.get(), "no handler for active message");
            }
        }
    }

    /// Queues a standalone ack for the endpoint, at most once.
    pub(crate) fn schedule_ack(&mut self, id: EndpointId) {
        let Some(ep) = self.eps.get_mut(&id) else {
            return;
        };
        ep.rx.ack_pending = true;
        if !ep.in_ack_queue {
            ep.in_ack_queue = true;
            self.ack_queue.push_back(id);
        }
    }

    /// Sends queued acks while credits last. Acks made redundant by a
    /// piggybacked one are skipped.
    pub(crate) fn send_pending_acks(&mut self) {
        while let Some(&id) = self.ack_queue.front() {
            let Some(ep) = self.eps.get_mut(&id) else {
                self.ack_queue.pop_front();
                continue;
            };
            if !ep.rx.ack_pending {
                ep.in_ack_queue = false;
                self.ack_queue.pop_front();
                continue;
            }
            if self.tx.available == 0 {
                break;
            }
            ep.in_ack_queue = false;
            self.ack_queue.pop_front();
            if let Err(err) = self.send_ack(id) {
                debug!(ep = id.0, "ack not sent: {err}");
            }
        }
    }

    /// Runs receives deferred from async context. Returns how many ran.
    pub(crate) fn dispatch_pending_rx(&mut self) -> usize {
        let mut count = 0;
        while let Some(deferred) = self.rx.pending.pop_front() {
            let DeferredRx {
                ep,
                am_id,
                buffer,
                start,
                end,
            } = deferred;
            self.invoke_handler(ep, am_id, &buffer.data[start..end], false);
            self.rx.pool.recycle(buffer);
            count += 1;
        }
        count
    }
}
