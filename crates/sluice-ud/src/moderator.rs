use std::collections::BTreeSet;

/// Signal/token decision for one submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submission {
    /// Interface-wide submission sequence number.
    pub sn: u64,
    pub signaled: bool,
    /// Value carried in the work request and returned by its completion.
    pub token: u64,
}

/// Decides completion signaling and reconciles completion tokens.
///
/// In unordered mode every submission is signaled and carries its own
/// `send_sn`. In ordered mode signals are coalesced: a signaled submission
/// carries the number of unsignaled ones before it, so one completion
/// retires `token + 1` packets.
#[derive(Debug, Clone)]
pub struct TxModerator {
    ordered: bool,
    moderation: usize,
    send_sn: u64,
    comp_sn: u64,
    unsignaled: usize,
    completed_ahead: BTreeSet<u64>,
}

impl TxModerator {
    pub fn new(ordered: bool, moderation: usize) -> Self {
        Self {
            ordered,
            moderation: moderation.max(1),
            send_sn: 0,
            comp_sn: 0,
            unsignaled: 0,
            completed_ahead: BTreeSet::new(),
        }
    }

    pub fn is_ordered(&self) -> bool {
        self.ordered
    }

    /// Next submission sequence number.
    pub fn send_sn(&self) -> u64 {
        self.send_sn
    }

    /// Every submission with `sn < comp_sn` has completed.
    pub fn comp_sn(&self) -> u64 {
        self.comp_sn
    }

    pub fn unsignaled(&self) -> usize {
        self.unsignaled
    }

    pub fn stamp(&mut self, force_signal: bool) -> Submission {
        let sn = self.send_sn;
        self.send_sn += 1;
        if !self.ordered {
            return Submission {
                sn,
                signaled: true,
                token: sn,
            };
        }
        if force_signal || self.unsignaled >= self.moderation - 1 {
            let token = self.unsignaled as u64;
            self.unsignaled = 0;
            Submission {
                sn,
                signaled: true,
                token,
            }
        } else {
            self.unsignaled += 1;
            Submission {
                sn,
                signaled: false,
                token: u64::MAX,
            }
        }
    }

    /// Applies one completion and returns the number of packets it retires.
    /// Returns `None` for a token that does not match any outstanding
    /// submission.
    pub fn complete(&mut self, token: u64) -> Option<usize> {
        if self.ordered {
            let retired = token.checked_add(1)?;
            let comp_sn = self.comp_sn.checked_add(retired)?;
            if comp_sn > self.send_sn {
                return None;
            }
            self.comp_sn = comp_sn;
            return Some(retired as usize);
        }
        if token < self.comp_sn || token >= self.send_sn || !self.completed_ahead.insert(token) {
            return None;
        }
        while self.completed_ahead.remove(&self.comp_sn) {
            self.comp_sn += 1;
        }
        Some(1)
    }
}
