use std::fmt;

use serde::{Deserialize, Serialize};

/// 16-bit wrapping packet sequence number.
///
/// Ordering is only meaningful between values less than half the sequence
/// space apart, so windows must stay below `Psn::MAX_WINDOW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Psn(pub u16);

impl Psn {
    /// First sequence number assigned on a fresh endpoint.
    pub const INITIAL: Psn = Psn(1);
    /// Largest window for which wrap-aware comparison stays unambiguous.
    pub const MAX_WINDOW: u16 = 0x7fff;

    /// Returns the following sequence number.
    pub fn next(self) -> Psn {
        Psn(self.0.wrapping_add(1))
    }

    /// Returns the preceding sequence number.
    pub fn prev(self) -> Psn {
        Psn(self.0.wrapping_sub(1))
    }

    /// Number of steps from `earlier` to `self`.
    pub fn distance_from(self, earlier: Psn) -> u16 {
        self.0.wrapping_sub(earlier.0)
    }

    /// True when `self` comes strictly before `other`.
    pub fn precedes(self, other: Psn) -> bool {
        (self.0.wrapping_sub(other.0) as i16) < 0
    }

    /// True when `self` comes strictly after `other`.
    pub fn follows(self, other: Psn) -> bool {
        other.precedes(self)
    }

    /// True when `self` is at or before `other`.
    pub fn precedes_or_eq(self, other: Psn) -> bool {
        !self.follows(other)
    }
}

impl fmt::Display for Psn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
