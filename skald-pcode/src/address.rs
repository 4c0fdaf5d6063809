//! Addresses as (space, offset) pairs.

use core::cmp::Ordering;
use core::fmt;
use std::sync::Arc;

use crate::AddrSpace;

/// A location in one address space.
///
/// Ordering compares the space index first and the byte offset second,
/// so sorted address sequences group by space.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Address {
    space: Arc<AddrSpace>,
    offset: u64,
}

impl Address {
    /// Create an address, wrapping `offset` into the space's range.
    pub fn new(space: Arc<AddrSpace>, offset: u64) -> Self {
        let offset = space.wrap_offset(offset);
        Self { space, offset }
    }

    /// The containing space.
    pub fn space(&self) -> &Arc<AddrSpace> {
        &self.space
    }

    /// Byte offset within the space.
    pub const fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether both addresses live in the same space.
    pub fn same_space(&self, other: &Self) -> bool {
        self.space.index() == other.space.index()
    }

    /// The address `amount` bytes forward, wrapping modulo space size.
    pub fn wrap_add(&self, amount: u64) -> Self {
        Self::new(Arc::clone(&self.space), self.offset.wrapping_add(amount))
    }

    /// Forward distance from `self` to `other` in bytes.
    ///
    /// Meaningful only when both addresses share a space; wraps modulo
    /// the space size like all offset arithmetic.
    pub fn distance_to(&self, other: &Self) -> u64 {
        other.offset.wrapping_sub(self.offset) & self.space.highest_offset()
    }

    /// Whether `self` lies in `[start, start + size)` of the same space.
    pub fn contained_by(&self, start: &Self, size: u64) -> bool {
        self.same_space(start)
            && self.offset >= start.offset
            && self.offset - start.offset < size
    }
}

impl PartialEq for Address {
    fn eq(&self, other: &Self) -> bool {
        self.space.index() == other.space.index() && self.offset == other.offset
    }
}

impl Eq for Address {}

impl PartialOrd for Address {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Address {
    fn cmp(&self, other: &Self) -> Ordering {
        self.space
            .index()
            .cmp(&other.space.index())
            .then(self.offset.cmp(&other.offset))
    }
}

impl core::hash::Hash for Address {
    fn hash<H: core::hash::Hasher>(&self, state: &mut H) {
        self.space.index().hash(state);
        self.offset.hash(state);
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{:#x}", self.space.name(), self.offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SpaceFlags, SpaceKind, SpaceManager};

    fn spaces() -> (Arc<AddrSpace>, Arc<AddrSpace>) {
        let mut manager = SpaceManager::new();
        let ram = manager
            .insert(AddrSpace::new(
                "ram",
                SpaceKind::Processor,
                1,
                4,
                1,
                SpaceFlags::HAS_PHYSICAL,
                0,
            ))
            .unwrap();
        let register = manager
            .insert(AddrSpace::new(
                "register",
                SpaceKind::Processor,
                2,
                4,
                1,
                SpaceFlags::empty(),
                0,
            ))
            .unwrap();
        (ram, register)
    }

    #[test]
    fn ordering_groups_by_space() {
        let (ram, register) = spaces();
        let a = Address::new(Arc::clone(&ram), 0x2000);
        let b = Address::new(Arc::clone(&register), 0x10);
        assert!(a < b);
        assert!(a < Address::new(ram, 0x2001));
    }

    #[test]
    fn arithmetic_wraps() {
        let (ram, _) = spaces();
        let near_end = Address::new(Arc::clone(&ram), 0xffff_fffe);
        assert_eq!(near_end.wrap_add(4).offset(), 0x2);
        assert_eq!(near_end.distance_to(&near_end.wrap_add(4)), 4);
    }

    #[test]
    fn containment_is_space_aware() {
        let (ram, register) = spaces();
        let start = Address::new(Arc::clone(&ram), 0x100);
        assert!(Address::new(Arc::clone(&ram), 0x102).contained_by(&start, 4));
        assert!(!Address::new(Arc::clone(&ram), 0x104).contained_by(&start, 4));
        assert!(!Address::new(register, 0x102).contained_by(&start, 4));
    }
}
