/// Count and byte total for one operation kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpCounter {
    pub count: u64,
    pub bytes: u64,
}

impl OpCounter {
    pub(crate) fn record(&mut self, bytes: usize) {
        self.count += 1;
        self.bytes += bytes as u64;
    }
}

/// Interface counters, returned as a snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IfaceStats {
    pub am_short: OpCounter,
    pub am_bcopy: OpCounter,
    pub am_zcopy: OpCounter,
    pub put_short: OpCounter,
    /// Send attempts rejected for lack of credit, buffers, or window.
    pub no_resource: u64,
    pub tx_completions: u64,
    /// Send credits handed back by completions; one per packet retired.
    pub tx_credits_returned: u64,
    pub rx_completions: u64,
    pub rx_delivered: u64,
    pub rx_dropped_grh: u64,
    pub rx_dropped_malformed: u64,
    pub rx_dropped_no_endpoint: u64,
    pub rx_dropped_duplicate: u64,
    pub rx_dropped_out_of_order: u64,
    pub rx_put_errors: u64,
    pub acks_sent: u64,
    pub ack_requests_sent: u64,
    pub resends: u64,
    pub pending_replays: u64,
    pub async_events: u64,
    pub endpoints_failed: u64,
}

impl IfaceStats {
    /// Flat `(name, value)` view of every counter, operation counters
    /// split into `<op>` and `<op>_bytes`.
    pub fn counters(&self) -> Vec<(&'static str, u64)> {
        vec![
            ("am_short", self.am_short.count),
            ("am_short_bytes", self.am_short.bytes),
            ("am_bcopy", self.am_bcopy.count),
            ("am_bcopy_bytes", self.am_bcopy.bytes),
            ("am_zcopy", self.am_zcopy.count),
            ("am_zcopy_bytes", self.am_zcopy.bytes),
            ("put_short", self.put_short.count),
            ("put_short_bytes", self.put_short.bytes),
            ("no_resource", self.no_resource),
            ("tx_completions", self.tx_completions),
            ("tx_credits_returned", self.tx_credits_returned),
            ("rx_completions", self.rx_completions),
            ("rx_delivered", self.rx_delivered),
            ("rx_dropped_grh", self.rx_dropped_grh),
            ("rx_dropped_malformed", self.rx_dropped_malformed),
            ("rx_dropped_no_endpoint", self.rx_dropped_no_endpoint),
            ("rx_dropped_duplicate", self.rx_dropped_duplicate),
            ("rx_dropped_out_of_order", self.rx_dropped_out_of_order),
            ("rx_put_errors", self.rx_put_errors),
            ("acks_sent", self.acks_sent),
            ("ack_requests_sent", self.ack_requests_sent),
            ("resends", self.resends),
            ("pending_replays", self.pending_replays),
            ("async_events", self.async_events),
            ("endpoints_failed", self.endpoints_failed),
        ]
    }
}
