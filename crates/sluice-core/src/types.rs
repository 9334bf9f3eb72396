use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Number of active-message handler slots.
pub const AM_ID_MAX: u8 = 32;
/// Largest endpoint id representable in the 24-bit wire field.
pub const ENDPOINT_ID_MAX: u32 = 0x00ff_ffff;
/// Largest queue-pair number representable in a 24-bit address field.
pub const QP_NUMBER_MAX: u32 = 0x00ff_ffff;

/// Active-message handler id in `[0, AM_ID_MAX)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AmId(u8);

impl AmId {
    pub fn new(id: u8) -> Result<Self, CoreError> {
        if id >= AM_ID_MAX {
            return Err(CoreError::InvalidInput("am id out of range"));
        }
        Ok(Self(id))
    }

    pub fn get(self) -> u8 {
        self.0
    }
}

/// Endpoint identifier local to one interface (24-bit on the wire).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndpointId(pub u32);

impl EndpointId {
    pub fn new(id: u32) -> Result<Self, CoreError> {
        if id > ENDPOINT_ID_MAX {
            return Err(CoreError::InvalidInput("endpoint id exceeds 24 bits"));
        }
        Ok(Self(id))
    }

    pub fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ep{}", self.0)
    }
}

/// Datagram queue-pair number of a remote interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QpNumber(pub u32);

impl QpNumber {
    pub fn new(qpn: u32) -> Result<Self, CoreError> {
        if qpn > QP_NUMBER_MAX {
            return Err(CoreError::InvalidInput("qp number exceeds 24 bits"));
        }
        Ok(Self(qpn))
    }
}

impl fmt::Display for QpNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Local or remote key of a registered memory region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct MemoryKey(pub u32);

impl MemoryKey {
    /// Key carried by inline segments, which the device copies directly.
    pub const UNREGISTERED: MemoryKey = MemoryKey(0);

    pub fn is_registered(self) -> bool {
        self != Self::UNREGISTERED
    }
}
