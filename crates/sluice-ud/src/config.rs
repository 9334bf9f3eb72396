use std::time::Duration;

use sluice_codec::{AM_SHORT_HDR_LEN, NETH_LEN};
use sluice_core::Psn;

use crate::error::IfaceError;

/// Packets submitted between forced completion signals in ordered mode.
pub const TX_MODERATION: usize = 64;
/// Receive batch below which refill cost is no longer amortized.
pub const RX_BATCH_MIN: usize = 8;
/// Upper bound on payload iov entries of a zero-copy send.
pub const MAX_IOV: usize = 8;
/// Default per-operation software overhead in seconds.
pub const DEFAULT_OVERHEAD: f64 = 105e-9;

/// Interface tunables consumed by the engine.
#[derive(Debug, Clone, PartialEq)]
pub struct UdIfaceConfig {
    /// Send credits, i.e. submissions allowed before completions return.
    pub tx_queue_len: usize,
    /// Receive buffers kept posted.
    pub rx_queue_len: usize,
    /// Send buffer descriptors shared by all endpoints.
    pub tx_skbs: usize,
    /// Inline threshold; clamped to the device limit.
    pub max_inline: usize,
    /// Datagram size including the network header; clamped to the device mtu.
    pub seg_size: usize,
    /// Receive buffers posted per refill.
    pub rx_max_batch: usize,
    pub rx_max_poll: usize,
    pub tx_max_poll: usize,
    /// Receive completions drained per async event.
    pub async_max_poll: usize,
    /// Ordered-mode signal interval.
    pub tx_moderation: usize,
    /// Unacknowledged packets allowed per endpoint.
    pub max_window: u16,
    /// Request an ack every this many in-flight packets.
    pub ack_req_thresh: u16,
    /// Validate destination gid of routed packets.
    pub check_grh: bool,
    /// Idle time after which the unacknowledged window is resent.
    pub resend_timeout: Duration,
    /// Time without ack progress after which an endpoint fails.
    pub peer_timeout: Duration,
    /// Software overhead reported by query, in seconds.
    pub overhead: f64,
    /// Link bandwidth reported by query, in bytes per second.
    pub bandwidth: f64,
    /// Route cache entries used by peer address resolution.
    pub route_cache_size: usize,
}

impl Default for UdIfaceConfig {
    fn default() -> Self {
        Self {
            tx_queue_len: 256,
            rx_queue_len: 1024,
            tx_skbs: 1024,
            max_inline: 128,
            seg_size: 4096,
            rx_max_batch: 16,
            rx_max_poll: 16,
            tx_max_poll: 16,
            async_max_poll: 64,
            tx_moderation: TX_MODERATION,
            max_window: 1024,
            ack_req_thresh: 64,
            check_grh: true,
            resend_timeout: Duration::from_millis(20),
            peer_timeout: Duration::from_secs(300),
            overhead: DEFAULT_OVERHEAD,
            bandwidth: 12.5e9,
            route_cache_size: 64,
        }
    }
}

impl UdIfaceConfig {
    /// Rejects combinations the engine cannot run with.
    pub fn validate(&self) -> Result<(), IfaceError> {
        if self.tx_queue_len == 0 {
            return Err(IfaceError::InvalidConfig("tx_queue_len must be > 0"));
        }
        if self.tx_skbs == 0 {
            return Err(IfaceError::InvalidConfig("tx_skbs must be > 0"));
        }
        if self.rx_max_batch == 0 || self.rx_queue_len < self.rx_max_batch {
            return Err(IfaceError::InvalidConfig(
                "rx_queue_len must be >= rx_max_batch > 0",
            ));
        }
        if self.rx_max_poll == 0 || self.tx_max_poll == 0 || self.async_max_poll == 0 {
            return Err(IfaceError::InvalidConfig("poll limits must be > 0"));
        }
        if self.tx_moderation == 0 || self.tx_moderation > self.tx_queue_len {
            return Err(IfaceError::InvalidConfig(
                "tx_moderation must be in 1..=tx_queue_len",
            ));
        }
        if self.max_window == 0 || self.max_window > Psn::MAX_WINDOW {
            return Err(IfaceError::InvalidConfig("max_window must be in 1..32768"));
        }
        if self.ack_req_thresh == 0 {
            return Err(IfaceError::InvalidConfig("ack_req_thresh must be > 0"));
        }
        if self.seg_size <= NETH_LEN + AM_SHORT_HDR_LEN {
            return Err(IfaceError::InvalidConfig("seg_size too small"));
        }
        if self.max_inline < NETH_LEN {
            return Err(IfaceError::InvalidConfig("max_inline smaller than neth"));
        }
        if self.route_cache_size == 0 {
            return Err(IfaceError::InvalidConfig("route_cache_size must be > 0"));
        }
        if !(self.overhead >= 0.0 && self.bandwidth > 0.0) {
            return Err(IfaceError::InvalidConfig("overhead/bandwidth out of range"));
        }
        Ok(())
    }
}
