use sluice_codec::{destination_gid, gid_len, GRH_LEN, IPV6_GID_LEN};
use sluice_core::EndpointId;
use tracing::{debug, warn};

use crate::error::fatal;
use crate::state::IfaceState;

impl IfaceState {
    /// Drains send completions, returns credits, and retires packets whose
    /// submissions are now complete. Returns the number of completions.
    pub(crate) fn poll_tx(&mut self, is_async: bool) -> usize {
        let mut wcs = std::mem::take(&mut self.tx.wcs);
        wcs.clear();
        let polled = match self.device.poll_tx(self.config.tx_max_poll, &mut wcs) {
            Ok(n) => n,
            Err(err) => fatal(format_args!("send completion poll failed: {err}")),
        };
        for wc in &wcs {
            if !wc.status.is_success() {
                fatal(format_args!(
                    "send completion with error: {:?} (token {}, {} bytes)",
                    wc.status, wc.token, wc.byte_len
                ));
            }
            let Some(retired) = self.tx.moderator.complete(wc.token) else {
                fatal(format_args!("send completion with unknown token {}", wc.token));
            };
            self.tx.available += retired;
            self.stats.tx_credits_returned += retired as u64;
            if self.tx.available > self.config.tx_queue_len {
                fatal(format_args!(
                    "send credits overflow: {} > {}",
                    self.tx.available, self.config.tx_queue_len
                ));
            }
        }
        self.tx.wcs = wcs;
        self.stats.tx_completions += polled as u64;
        if polled > 0 {
            self.send_completion(is_async);
        }
        polled
    }

    /// Retires window heads of every endpoint with a newly completed
    /// submission and releases orphaned buffers.
    pub(crate) fn send_completion(&mut self, is_async: bool) {
        let comp_sn = self.tx.moderator.comp_sn();
        let mut touched: Vec<EndpointId> = Vec::new();
        while let Some(&(sn, ep)) = self.tx.inflight.front() {
            if sn >= comp_sn {
                break;
            }
            self.tx.inflight.pop_front();
            if !touched.contains(&ep) {
                touched.push(ep);
            }
        }
        for ep in touched {
            self.try_retire(ep, is_async);
        }
        self.release_orphans();
    }

    /// Drains receive completions, dispatches valid packets, and refills
    /// the receive queue. Returns the number of completions.
    pub(crate) fn poll_rx(&mut self, is_async: bool) -> usize {
        let mut wcs = std::mem::take(&mut self.rx.wcs);
        wcs.clear();
        let polled = match self.device.poll_rx(self.config.rx_max_poll, &mut wcs) {
            Ok(n) => n,
            Err(err) => fatal(format_args!("receive completion poll failed: {err}")),
        };
        self.stats.rx_completions += polled as u64;
        for wc in wcs.drain(..) {
            if !wc.status.is_success() {
                warn!(status = ?wc.status, "receive completion with error");
                self.stats.rx_dropped_malformed += 1;
                self.rx.pool.recycle(wc.buffer);
                continue;
            }
            if !self.check_grh(&wc.buffer.data, wc.grh_present) {
                self.stats.rx_dropped_grh += 1;
                self.rx.pool.recycle(wc.buffer);
                continue;
            }
            self.process_rx(wc.buffer, wc.byte_len, is_async);
        }
        self.rx.wcs = wcs;
        self.rx.pool.add_available(polled);
        self.post_recv();
        polled
    }

    /// Accepts a packet whose routing header targets one of the local gids.
    fn check_grh(&mut self, packet: &[u8], grh_present: bool) -> bool {
        if !self.config.check_grh || !grh_present {
            return true;
        }
        let len = gid_len(packet);
        let dgid = match destination_gid(packet, len) {
            Ok(dgid) => dgid,
            Err(_) => return false,
        };
        if let Some((hit_len, hit)) = &self.rx.gid_hit {
            if *hit_len == len && hit[..len] == *dgid {
                return true;
            }
        }
        if self.local_gids.iter().any(|gid| gid.matches(dgid)) {
            let mut hit = [0u8; IPV6_GID_LEN];
            hit[..len].copy_from_slice(dgid);
            self.rx.gid_hit = Some((len, hit));
            return true;
        }
        debug!(
            gid_len = len,
            dgid = ?&packet[GRH_LEN - len..GRH_LEN],
            "dropping packet for foreign gid"
        );
        false
    }
}
