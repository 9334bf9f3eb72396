use sluice_transport::{DeviceError, Direction};
use tracing::{trace, warn};

use crate::error::ArmError;
use crate::state::IfaceState;
use crate::types::EventFlags;

impl IfaceState {
    /// One polled progress step. Work left behind by the async path is
    /// handled first; the device is polled only when there was none.
    pub(crate) fn progress(&mut self) -> usize {
        let mut count = self.dispatch_async_comps();
        count += self.dispatch_pending_rx();
        if count == 0 {
            count = self.poll_rx(false);
            if count == 0 {
                count = self.poll_tx(false);
            }
        }
        count += self.progress_pending(false);
        count
    }

    /// Hands completions queued in async context to the caller.
    pub(crate) fn dispatch_async_comps(&mut self) -> usize {
        let count = self.tx.async_comps.len();
        self.ready.extend(self.tx.async_comps.drain(..));
        count
    }

    /// Progress from the event path: receives first, bounded per event,
    /// then one send poll and pending acks.
    pub(crate) fn async_progress(&mut self) -> usize {
        let mut count = 0;
        let mut polls = 0;
        while polls < self.config.async_max_poll {
            let polled = self.poll_rx(true);
            if polled == 0 {
                break;
            }
            count += polled;
            polls += polled;
        }
        count += self.poll_tx(true);
        self.progress_pending(true);
        count
    }

    /// Handles one device event: progress, rearm for solicited receives,
    /// then report whether the caller's notifier should run.
    pub(crate) fn handle_async_event(&mut self) -> bool {
        let count = self.async_progress();
        if self.limits.req_notify {
            if let Err(err) = self.device.arm(Direction::Rx, true) {
                warn!("failed to rearm receive events: {err}");
            }
        }
        self.stats.async_events += 1;
        trace!(count, "async event handled");
        self.event_cb.is_some()
    }

    /// Requests the next notification. Refused while deferred async work
    /// waits for `progress`.
    pub(crate) fn event_arm(&mut self, events: EventFlags) -> Result<(), ArmError> {
        if !self.limits.req_notify {
            return Err(DeviceError::Unsupported("completion notification").into());
        }
        let recv = events.recv || events.recv_sig;
        if recv && !self.rx.pending.is_empty() {
            return Err(ArmError::Busy);
        }
        if events.send_comp && !self.tx.async_comps.is_empty() {
            return Err(ArmError::Busy);
        }
        if events.send_comp {
            // Acks arrive on the receive side.
            self.device.arm(Direction::Tx, false)?;
            self.device.arm(Direction::Rx, false)?;
        } else if events.recv {
            self.device.arm(Direction::Rx, false)?;
        } else if events.recv_sig {
            self.device.arm(Direction::Rx, true)?;
        }
        Ok(())
    }
}
