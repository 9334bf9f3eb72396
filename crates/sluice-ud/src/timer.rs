use std::time::Instant;

use sluice_codec::PacketFlags;
use sluice_core::EndpointId;
use tracing::{debug, trace};

use crate::endpoint::EndpointState;
use crate::error::fatal;
use crate::pool::SkbId;
use crate::state::IfaceState;

/// Offset of the flags byte inside the network header.
const FLAGS_OFFSET: usize = 0;
/// Offset of the piggybacked ack inside the network header.
const ACK_PSN_OFFSET: usize = 8;

impl IfaceState {
    /// Drives retransmission and peer liveness. Returns the number of
    /// packets resent.
    pub(crate) fn timer_tick(&mut self, now: Instant) -> usize {
        let peer_timeout = self.config.peer_timeout;
        let resend_timeout = self.config.resend_timeout;
        let mut expired = Vec::new();
        let mut due = Vec::new();
        for ep in self.eps.values() {
            if ep.tx.window.is_empty()
                || !matches!(ep.state, EndpointState::Connected | EndpointState::Flushing)
            {
                continue;
            }
            if now.saturating_duration_since(ep.tx.last_ack) >= peer_timeout {
                expired.push(ep.id);
            } else if now.saturating_duration_since(ep.tx.last_send) >= resend_timeout {
                due.push(ep.id);
            }
        }
        for id in expired {
            self.fail_endpoint(id, false);
        }
        let mut resent = 0;
        for id in due {
            resent += self.resend_window(id, now);
        }
        resent
    }

    /// Requests an ack from a quiet peer; if a previous request went
    /// unanswered, resubmits unacknowledged packets head-first while credit
    /// lasts. The last one resent requests an ack.
    fn resend_window(&mut self, id: EndpointId, now: Instant) -> usize {
        let Some(ep) = self.eps.get(&id) else {
            return 0;
        };
        let Some(peer) = ep.peer else {
            return 0;
        };
        let acked = ep.tx.acked_psn;
        let rx_acked = ep.rx.acked_psn;
        let requested = ep.tx.ack_requested;
        let targets: Vec<SkbId> = ep
            .tx
            .window
            .iter()
            .copied()
            .filter(|&skb_id| self.skbs.get(skb_id).psn.follows(acked))
            .take(self.tx.available)
            .collect();
        // A quiet window is asked for an ack before anything is resent. A
        // fully acked one only lacks a signaled completion.
        if targets.is_empty() || !requested {
            let sent = match self.send_ack_request(id) {
                Ok(()) => true,
                Err(err) => {
                    debug!(ep = id.0, "ack request not sent: {err}");
                    false
                }
            };
            if let Some(ep) = self.eps.get_mut(&id) {
                ep.tx.last_send = now;
                ep.tx.ack_requested = sent && !targets.is_empty();
            }
            return 0;
        }
        let last = targets.len() - 1;
        for (i, skb_id) in targets.into_iter().enumerate() {
            let ack_req = i == last;
            let skb = self.skbs.get_mut(skb_id);
            let len = skb.len;
            let packet = &mut skb.data[..len];
            packet[ACK_PSN_OFFSET..ACK_PSN_OFFSET + 2].copy_from_slice(&rx_acked.0.to_be_bytes());
            if ack_req {
                packet[FLAGS_OFFSET] |= PacketFlags::ACK_REQ.bits();
            }
            let sn = self.post_skb(skb_id, &peer, ack_req, ack_req);
            self.skbs.get_mut(skb_id).sn = sn;
            self.tx.inflight.push_back((sn, id));
            self.stats.resends += 1;
            trace!(ep = id.0, psn = %self.skbs.get(skb_id).psn, sn, "resent");
        }
        let Some(ep) = self.eps.get_mut(&id) else {
            fatal(format_args!("endpoint {id} vanished during resend"));
        };
        ep.tx.last_send = now;
        ep.rx.ack_pending = false;
        let resent = last + 1;
        debug!(ep = id.0, resent, acked = %acked, "window resent");
        resent
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::{Duration, Instant};

    use bytes::Bytes;
    use sluice_codec::PacketFlags;

    use crate::endpoint::EndpointState;
    use crate::error::SendError;
    use crate::test_support::{am, pair};
    use crate::types::{Completion, Iov};

    fn is_data(packet: &[u8]) -> bool {
        packet[0] & (PacketFlags::AM.bits() | PacketFlags::PUT.bits()) != 0
    }

    #[test]
    fn lost_packet_is_resent_after_timeout() {
        let pair = pair();
        let mut dropped = false;
        pair.fabric.set_drop_filter(move |packet| {
            if !dropped && is_data(packet) {
                dropped = true;
                return true;
            }
            false
        });
        pair.a
            .iface
            .am_short(pair.a.ep, am(), 0, b"x")
            .expect("send");
        pair.settle();
        assert!(pair.b.received().is_empty());

        // The first tick only asks for an ack; the answer shows no progress.
        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(pair.a.iface.timer_tick(later), 0);
        pair.settle();
        assert!(pair.b.received().is_empty());
        assert_eq!(pair.a.iface.timer_tick(later + Duration::from_secs(1)), 1);
        pair.settle();

        assert_eq!(pair.b.received().len(), 1);
        assert_eq!(pair.a.iface.window_len(pair.a.ep), 0);
        assert_eq!(pair.a.iface.stats().resends, 1);
    }

    #[test]
    fn quiet_window_is_acked_without_resend() {
        let pair = pair();
        pair.a
            .iface
            .am_short(pair.a.ep, am(), 0, b"once")
            .expect("send");
        pair.settle();
        assert_eq!(pair.b.received().len(), 1);
        assert_eq!(pair.a.iface.window_len(pair.a.ep), 1);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(pair.a.iface.timer_tick(later), 0);
        pair.settle();

        assert_eq!(pair.a.iface.window_len(pair.a.ep), 0);
        assert_eq!(pair.a.iface.stats().resends, 0);
        assert_eq!(pair.a.iface.stats().ack_requests_sent, 1);
        assert_eq!(pair.b.iface.stats().rx_dropped_duplicate, 0);
        assert_eq!(pair.b.received().len(), 1);
    }

    #[test]
    fn resend_keeps_sequence_order() {
        let pair = pair();
        let mut seen = 0;
        pair.fabric.set_drop_filter(move |packet| {
            if is_data(packet) {
                seen += 1;
                return seen == 2;
            }
            false
        });
        for payload in [b"1", b"2", b"3"] {
            pair.a
                .iface
                .am_short(pair.a.ep, am(), 0, payload)
                .expect("send");
        }
        pair.settle();
        assert_eq!(pair.b.received().len(), 1);

        let later = Instant::now() + Duration::from_secs(1);
        assert_eq!(pair.a.iface.timer_tick(later), 0);
        pair.settle();
        // The acked head is never resent.
        assert_eq!(pair.a.iface.timer_tick(later + Duration::from_secs(1)), 2);
        pair.settle();
        let payloads: Vec<Vec<u8>> = pair
            .b
            .received()
            .into_iter()
            .map(|msg| msg[8..].to_vec())
            .collect();
        assert_eq!(payloads, vec![b"1".to_vec(), b"2".to_vec(), b"3".to_vec()]);
        assert_eq!(pair.b.iface.stats().rx_dropped_out_of_order, 1);
        assert_eq!(pair.a.iface.window_len(pair.a.ep), 0);
    }

    #[test]
    fn silent_peer_fails_endpoint_and_cancels_zcopy() {
        let pair = pair();
        pair.fabric.set_drop_filter(|_| true);
        let key = pair.a.iface.mem_register(64).expect("register");
        let status = Arc::new(Mutex::new(None));
        let slot = Arc::clone(&status);
        pair.a
            .iface
            .am_zcopy(
                pair.a.ep,
                am(),
                b"",
                vec![Iov {
                    buffer: Bytes::from_static(b"payload"),
                    lkey: key,
                }],
                Some(Box::new(move |comp: Completion| {
                    *slot.lock().expect("slot") = Some(comp);
                })),
            )
            .expect("zcopy");

        let much_later = Instant::now() + Duration::from_secs(301);
        pair.a.iface.timer_tick(much_later);
        assert_eq!(*status.lock().expect("status"), Some(Completion::Canceled));
        assert_eq!(pair.a.iface.ep_state(pair.a.ep), Some(EndpointState::Failed));
        assert_eq!(
            pair.a.iface.am_short(pair.a.ep, am(), 0, b"x"),
            Err(SendError::EndpointFailed(pair.a.ep))
        );
        assert_eq!(pair.a.iface.stats().endpoints_failed, 1);

        pair.a.iface.progress();
        assert_eq!(pair.a.iface.free_skbs(), 64);
    }
}
