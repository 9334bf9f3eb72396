use sluice_core::EndpointId;
use tracing::{trace, warn};

use crate::endpoint::EndpointTx;
use crate::error::{PendingError, SendError};
use crate::state::IfaceState;
use crate::types::PendingRequest;

impl IfaceState {
    /// Queues a deferred send. Refused with `Busy` while a direct send on
    /// the endpoint could still proceed.
    pub(crate) fn pending_add(
        &mut self,
        id: EndpointId,
        request: PendingRequest,
    ) -> Result<(), PendingError> {
        let has_resources = self.has_tx_resources();
        let max_window = self.config.max_window;
        let ep = self
            .eps
            .get_mut(&id)
            .ok_or(PendingError::UnknownEndpoint(id))?;
        if !ep.can_send() {
            return Err(PendingError::NotConnected(id));
        }
        if ep.pending.is_empty() && has_resources && !ep.window_full(max_window) {
            return Err(PendingError::Busy);
        }
        ep.pending.push_back(request);
        if !ep.in_arbiter {
            ep.in_arbiter = true;
            self.arbiter.push_back(id);
        }
        trace!(ep = id.0, queued = ep.pending.len(), "pending request added");
        Ok(())
    }

    /// Removes every pending request of the endpoint, handing each to `cb`.
    pub(crate) fn pending_purge(
        &mut self,
        id: EndpointId,
        mut cb: impl FnMut(PendingRequest),
    ) -> Result<(), PendingError> {
        let ep = self
            .eps
            .get_mut(&id)
            .ok_or(PendingError::UnknownEndpoint(id))?;
        ep.in_arbiter = false;
        for request in ep.pending.drain(..) {
            cb(request);
        }
        self.arbiter.retain(|queued| *queued != id);
        Ok(())
    }

    /// Sends queued acks, then (outside async context) replays pending
    /// requests round-robin across endpoints while resources last.
    pub(crate) fn progress_pending(&mut self, is_async: bool) -> usize {
        self.send_pending_acks();
        if is_async {
            return 0;
        }
        let mut replayed = 0;
        // Each endpoint in the arbiter gets one turn per stalled round.
        let mut stalled = 0;
        while stalled < self.arbiter.len() {
            if !self.has_tx_resources() {
                break;
            }
            let Some(id) = self.arbiter.pop_front() else {
                break;
            };
            let max_window = self.config.max_window;
            let Some(ep) = self.eps.get_mut(&id) else {
                continue;
            };
            if !ep.can_send() || ep.pending.is_empty() {
                ep.in_arbiter = false;
                continue;
            }
            if ep.window_full(max_window) {
                self.arbiter.push_back(id);
                stalled += 1;
                continue;
            }
            let Some(mut request) = ep.pending.pop_front() else {
                continue;
            };
            let result = request(&mut EndpointTx { state: self, ep: id });
            let Some(ep) = self.eps.get_mut(&id) else {
                continue;
            };
            match result {
                Ok(()) => {
                    replayed += 1;
                    stalled = 0;
                    self.stats.pending_replays += 1;
                }
                Err(SendError::NoResource) => {
                    ep.pending.push_front(request);
                    stalled += 1;
                }
                Err(err) => {
                    warn!(ep = id.0, "pending request dropped: {err}");
                    stalled = 0;
                }
            }
            if ep.pending.is_empty() {
                ep.in_arbiter = false;
            } else {
                self.arbiter.push_back(id);
            }
        }
        replayed
    }
}
