use std::{
    fmt::{Debug, Display},
    ops::{Add, Sub},
};

use crate::idx::ToIdxUsize;
use bytemuck::{Pod, Zeroable};

/// A _run time_ address: either an RVA relative to the image base, or,
/// before `AddressAssigner` has run, a file-relative placeholder.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Zeroable, Pod)]
#[repr(transparent)]
pub struct Addr {
    value: u64,
}

#[allow(non_snake_case)]
pub const fn Addr(value: u64) -> Addr {
    Addr { value }
}

impl Addr {
    pub const fn u64(self) -> u64 {
        self.value
    }

    pub const fn usize(self) -> usize {
        self.value as usize
    }

    pub fn align_up(self, align: u64) -> Self {
        Addr(align_up(self.value, align))
    }

    pub fn align_down(self, align: u64) -> Self {
        Addr(align_down(self.value, align))
    }
}

impl Debug for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.value)
    }
}

impl Display for Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.value)
    }
}

impl Add<Self> for Addr {
    type Output = Self;

    fn add(self, rhs: Self) -> Self::Output {
        self + rhs.value
    }
}

impl Add<u64> for Addr {
    type Output = Self;

    fn add(self, rhs: u64) -> Self::Output {
        Addr(self.value + rhs)
    }
}

impl Sub<Self> for Addr {
    type Output = i64;

    fn sub(self, rhs: Self) -> Self::Output {
        self.value as i64 - rhs.value as i64
    }
}

impl Sub<u64> for Addr {
    type Output = Self;

    fn sub(self, rhs: u64) -> Self::Output {
        Addr(self.value - rhs)
    }
}

/// An offset into an object file. Either absolute or relative to a particular section.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Zeroable, Pod)]
#[repr(transparent)]
pub struct Offset(pub u64);

impl Offset {
    pub const fn usize(self) -> usize {
        self.0 as usize
    }
}

impl ToIdxUsize for Offset {
    fn to_idx_usize(self) -> usize {
        self.0.to_idx_usize()
    }
}

impl Display for Offset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:x}", self.0)
    }
}

impl Add<u64> for Offset {
    type Output = Self;
    fn add(self, rhs: u64) -> Self::Output {
        Offset(self.0 + rhs)
    }
}

/// Align `n` up to `align`, which must be a power of two.
pub fn align_up(n: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (n + align - 1) & !(align - 1)
}

/// Align `n` down to `align`, which must be a power of two.
pub fn align_down(n: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    n & !(align - 1)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_up_matches_reference_cases() {
        assert_eq!(align_up(0b0101, 0b0010), 0b0110);
        assert_eq!(align_up(16, 8), 16);
        assert_eq!(align_up(15, 8), 16);
        assert_eq!(align_up(0, 1), 0);
    }

    #[test]
    fn addr_sub_is_signed() {
        assert_eq!(Addr(10) - Addr(20), -10);
        assert_eq!(Addr(20) - Addr(10), 10);
    }
}
