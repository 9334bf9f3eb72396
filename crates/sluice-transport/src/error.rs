use thiserror::Error;

/// Errors reported synchronously by a datagram device or memory domain.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DeviceError {
    /// Work request violates a device limit.
    #[error("invalid work request: {0}")]
    InvalidRequest(&'static str),
    /// Address handle was never created or already destroyed.
    #[error("unknown address handle {0}")]
    UnknownAddressHandle(u64),
    /// Memory key is not registered with the domain.
    #[error("invalid memory key {0}")]
    InvalidKey(u32),
    /// Access falls outside a registered region.
    #[error("access out of bounds: addr 0x{addr:x} len {len}")]
    OutOfBounds { addr: u64, len: usize },
    /// Receive queue cannot take more posted buffers.
    #[error("receive queue full")]
    QueueFull,
    /// Capability the device does not provide.
    #[error("unsupported: {0}")]
    Unsupported(&'static str),
}
