use std::fmt::{Display, Formatter};
use std::ops::{Add, AddAssign, Sub};

/// A PGM data sequence number.
///
/// Sequence numbers wrap around at 2^32, so they are ordered by the sign of their (wrapping)
///  difference rather than numerically. This is only meaningful for numbers less than 2^31
///  apart, which the receive window guarantees by bounding its capacity.
///
/// NB: There is intentionally no `Ord` implementation - a plain `<` would silently break at
///      the wraparound point
#[derive(Copy, Clone, Eq, PartialEq, Hash, Debug, Default)]
pub struct SequenceNumber(u32);

impl Display for SequenceNumber {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl SequenceNumber {
    pub const ZERO: SequenceNumber = SequenceNumber(0);

    pub const fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub const fn to_raw(&self) -> u32 {
        self.0
    }

    pub fn next(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_add(1))
    }

    pub fn prev(&self) -> SequenceNumber {
        SequenceNumber(self.0.wrapping_sub(1))
    }

    pub fn before(&self, other: SequenceNumber) -> bool {
        (self.0.wrapping_sub(other.0) as i32) < 0
    }

    pub fn after(&self, other: SequenceNumber) -> bool {
        other.before(*self)
    }

    pub fn before_or_eq(&self, other: SequenceNumber) -> bool {
        !self.after(other)
    }

    pub fn after_or_eq(&self, other: SequenceNumber) -> bool {
        !self.before(other)
    }

    /// The signed number of steps from `self` to `to`, i.e. positive if `to` is after `self`
    pub fn distance(&self, to: SequenceNumber) -> i32 {
        to.0.wrapping_sub(self.0) as i32
    }

    /// Iterates from `self` (incl) to `end` (excl). The iterator is empty if `end` is not after
    ///  `self`.
    pub fn to(&self, end: SequenceNumber) -> SequenceRange {
        SequenceRange {
            next: *self,
            end,
        }
    }
}

impl Add<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn add(self, rhs: u32) -> Self::Output {
        SequenceNumber(self.0.wrapping_add(rhs))
    }
}

impl AddAssign<u32> for SequenceNumber {
    fn add_assign(&mut self, rhs: u32) {
        self.0 = self.0.wrapping_add(rhs);
    }
}

impl Sub<u32> for SequenceNumber {
    type Output = SequenceNumber;

    fn sub(self, rhs: u32) -> Self::Output {
        SequenceNumber(self.0.wrapping_sub(rhs))
    }
}

pub fn before(a: SequenceNumber, b: SequenceNumber) -> bool {
    a.before(b)
}

pub fn after(a: SequenceNumber, b: SequenceNumber) -> bool {
    a.after(b)
}

pub fn distance(a: SequenceNumber, b: SequenceNumber) -> i32 {
    a.distance(b)
}

pub struct SequenceRange {
    next: SequenceNumber,
    end: SequenceNumber,
}

impl Iterator for SequenceRange {
    type Item = SequenceNumber;

    fn next(&mut self) -> Option<Self::Item> {
        if self.next.before(self.end) {
            let result = self.next;
            self.next = self.next.next();
            Some(result)
        }
        else {
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::equal(5, 5, false, false, 0)]
    #[case::simple(1, 2, true, false, 1)]
    #[case::simple_reverse(9, 2, false, true, -7)]
    #[case::wrap(u32::MAX, 0, true, false, 1)]
    #[case::wrap_far(u32::MAX - 10, 20, true, false, 31)]
    #[case::wrap_reverse(3, u32::MAX - 2, false, true, -6)]
    #[case::half_below(0, 0x7fff_ffff, true, false, i32::MAX)]
    fn test_ordering(#[case] a: u32, #[case] b: u32, #[case] a_before_b: bool, #[case] a_after_b: bool, #[case] expected_distance: i32) {
        let a = SequenceNumber::from_raw(a);
        let b = SequenceNumber::from_raw(b);

        assert_eq!(before(a, b), a_before_b);
        assert_eq!(after(a, b), a_after_b);
        assert_eq!(after(a, b), before(b, a));
        assert_eq!(distance(a, b), expected_distance);
        if expected_distance != i32::MIN {
            assert_eq!(distance(b, a), -expected_distance);
        }
    }

    #[rstest]
    #[case::empty(4, 4, vec![])]
    #[case::reversed(4, 2, vec![])]
    #[case::simple(1, 4, vec![1, 2, 3])]
    #[case::wrap(u32::MAX - 1, 2, vec![u32::MAX - 1, u32::MAX, 0, 1])]
    fn test_to(#[case] from: u32, #[case] to: u32, #[case] expected: Vec<u32>) {
        let actual = SequenceNumber::from_raw(from).to(SequenceNumber::from_raw(to))
            .map(|s| s.to_raw())
            .collect::<Vec<_>>();
        assert_eq!(actual, expected);
    }

    #[test]
    fn test_arithmetic_wraps() {
        assert_eq!(SequenceNumber::from_raw(u32::MAX) + 2, SequenceNumber::from_raw(1));
        assert_eq!(SequenceNumber::ZERO - 1, SequenceNumber::from_raw(u32::MAX));
        assert_eq!(SequenceNumber::ZERO.prev().next(), SequenceNumber::ZERO);

        let mut s = SequenceNumber::from_raw(u32::MAX);
        s += 1;
        assert_eq!(s, SequenceNumber::ZERO);
    }
}
