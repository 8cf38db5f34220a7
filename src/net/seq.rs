//! Small utility for safe and checked storage of sequence numbers, as used on network.

use std::cmp::Ordering;
use std::fmt;
use std::ops::{Add, AddAssign, Sub};

use rand::rngs::OsRng;
use rand::RngCore;


/// A sequence number is a special wrapper around an `i32` interpreted modulo
/// 2^32, with wrapping addition which avoids overflowing the sequence number
/// while still allowing comparison between two values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Seq(i32);

impl Seq {

    /// Zero constant for this number.
    pub const ZERO: Self = Self(0);

    /// Create a new sequence number from its raw 32-bit representation.
    #[inline]
    pub const fn new(num: i32) -> Self {
        Self(num)
    }

    /// Get the underlying raw value of this sequence number.
    #[inline]
    pub const fn get(self) -> i32 {
        self.0
    }

    /// Pick a random sequence number origin, uniformly in `[0, 2^31)` so that
    /// half of the sequence space lies ahead before the first wraparound and
    /// origins are not predictable.
    pub fn random() -> Self {
        Self((OsRng.next_u32() & 0x7FFF_FFFF) as i32)
    }

    /// Compare this sequence number with another one, this comparison isn't
    /// implemented as standard partial or total ordering because it isn't
    /// transitive, because it allows comparison of wrapping values, and so the
    /// comparison is based on the signed difference between the two values,
    /// and not their absolute value.
    ///
    /// You must be really careful when using this ordering to sort an array,
    /// prefer to use the underlying `i32` value for comparison.
    #[inline]
    pub const fn wrapping_cmp(self, other: Self) -> Ordering {
        let diff = self.0.wrapping_sub(other.0);
        if diff == 0 {
            Ordering::Equal
        } else if diff < 0 {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Return true if this sequence number comes strictly before the other
    /// one, under [`Self::wrapping_cmp`] ordering.
    #[inline]
    pub fn is_before(self, other: Self) -> bool {
        self.wrapping_cmp(other).is_lt()
    }

}

impl fmt::Display for Seq {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

impl Default for Seq {
    #[inline]
    fn default() -> Self {
        Self::ZERO
    }
}

impl Add<u32> for Seq {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u32) -> Self::Output {
        Self(self.0.wrapping_add(rhs as i32))
    }
}

impl AddAssign<u32> for Seq {
    #[inline]
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs as i32);
    }
}

/// Delta between two sequence numbers.
impl Sub for Seq {
    type Output = u32;
    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0.wrapping_sub(rhs.0) as u32
    }
}
