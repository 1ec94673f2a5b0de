//! Transaction identifiers with deliberate modular wraparound.
//!
//! Ids live in a 32-bit space that wraps. Two normal ids are comparable only
//! when they are less than half the modulus apart, which is why versions
//! older than the freeze horizon must be rewritten to [`FROZEN_XID`] before
//! the counter laps them.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Never a valid transaction id; used by non-transactional WAL records.
pub const INVALID_XID: TxnId = TxnId(0);
/// Permanent sentinel meaning "committed before every possible snapshot".
pub const FROZEN_XID: TxnId = TxnId(2);
/// First id handed out to a normal transaction.
pub const FIRST_NORMAL_XID: TxnId = TxnId(3);

/// A transaction id in the wrapping 32-bit counter space.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TxnId(pub u32);

impl TxnId {
    /// True for ids outside the normal (wrapping) range.
    pub fn is_special(self) -> bool {
        self.0 < FIRST_NORMAL_XID.0
    }

    /// True for the frozen sentinel.
    pub fn is_frozen(self) -> bool {
        self == FROZEN_XID
    }

    /// True for the invalid id (e.g. an unset xmax).
    pub fn is_invalid(self) -> bool {
        self == INVALID_XID
    }

    /// Modular "comes before": true when `self` precedes `other` in the
    /// wrapping counter space. Special ids precede every normal id.
    pub fn precedes(self, other: TxnId) -> bool {
        if self.is_special() || other.is_special() {
            return self.0 < other.0;
        }
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    /// Modular "comes before or is".
    pub fn precedes_eq(self, other: TxnId) -> bool {
        self == other || self.precedes(other)
    }

    /// The successor id, skipping the special range on wraparound.
    pub fn advance(self) -> TxnId {
        let next = self.0.wrapping_add(1);
        if next < FIRST_NORMAL_XID.0 {
            FIRST_NORMAL_XID
        } else {
            TxnId(next)
        }
    }

    /// Number of ids between `older` and `self`, measured forward through
    /// the wrapping space. Meaningful only while the distance is below half
    /// the modulus, which the freeze rule guarantees.
    pub fn age_from(self, older: TxnId) -> u32 {
        if older.is_special() {
            return 0;
        }
        self.0.wrapping_sub(older.0)
    }
}

impl fmt::Display for TxnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "xid {}", self.0)
    }
}
