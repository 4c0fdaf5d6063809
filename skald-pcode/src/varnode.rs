//! Varnodes: the storage slots of p-code operands.

use core::cmp::Ordering;
use core::fmt;
use std::sync::Arc;

use crate::{calc_mask, AddrSpace, Address};

/// One storage slot: a byte range inside an address space.
///
/// Constant operands are modeled as varnodes in the constant space
/// whose offset is the value itself.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct VarnodeData {
    /// Containing space.
    pub space: Arc<AddrSpace>,
    /// Byte offset of the first byte.
    pub offset: u64,
    /// Size in bytes; zero only for placeholder slots.
    pub size: u32,
}

impl VarnodeData {
    /// Create a varnode over `[offset, offset + size)` of `space`.
    pub fn new(space: Arc<AddrSpace>, offset: u64, size: u32) -> Self {
        Self {
            space,
            offset,
            size,
        }
    }

    /// A constant-space varnode carrying `value`.
    pub fn constant(space: Arc<AddrSpace>, value: u64, size: u32) -> Self {
        Self {
            space,
            offset: value & calc_mask(size),
            size,
        }
    }

    /// Starting address of the slot.
    pub fn addr(&self) -> Address {
        Address::new(Arc::clone(&self.space), self.offset)
    }

    /// Whether the varnode is a constant operand.
    pub fn is_constant(&self) -> bool {
        self.space.is_constant()
    }

    /// Whether the varnode lives in decoder-internal temporary storage.
    pub fn is_unique(&self) -> bool {
        self.space.is_internal()
    }

    /// Whether `self` is fully inside `other`.
    pub fn contained_by(&self, other: &Self) -> bool {
        self.space.index() == other.space.index()
            && self.offset >= other.offset
            && self.offset - other.offset + u64::from(self.size) <= u64::from(other.size)
    }

    /// Byte distance from the start of `container` to the most
    /// significant end of `self`, honoring the space's endianness.
    ///
    /// Used to shift a wider tracked value down to a narrower read.
    pub fn overlap_offset(&self, container: &Self) -> Option<u64> {
        if !self.contained_by(container) {
            return None;
        }
        let lead = self.offset - container.offset;
        if self.space.is_big_endian() {
            Some(u64::from(container.size) - u64::from(self.size) - lead)
        } else {
            Some(lead)
        }
    }
}

impl PartialEq for VarnodeData {
    fn eq(&self, other: &Self) -> bool {
        self.space.index() == other.space.index()
            && self.offset == other.offset
            && self.size == other.size
    }
}

impl Eq for VarnodeData {}

impl PartialOrd for VarnodeData {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for VarnodeData {
    fn cmp(&self, other: &Self) -> Ordering {
        self.space
            .index()
            .cmp(&other.space.index())
            .then(self.offset.cmp(&other.offset))
            .then(self.size.cmp(&other.size))
    }
}

impl fmt::Display for VarnodeData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "({}, {:#x}, {})",
            self.space.name(),
            self.offset,
            self.size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{SpaceFlags, SpaceKind, SpaceManager};
    use rstest::rstest;

    fn space(big_endian: bool) -> Arc<AddrSpace> {
        let flags = if big_endian {
            SpaceFlags::BIG_ENDIAN
        } else {
            SpaceFlags::empty()
        };
        let mut manager = SpaceManager::new();
        manager
            .insert(AddrSpace::new(
                "register",
                SpaceKind::Processor,
                1,
                4,
                1,
                flags,
                0,
            ))
            .unwrap()
    }

    #[rstest]
    #[case(false, 0, 0)]
    #[case(false, 2, 2)]
    #[case(true, 0, 6)]
    #[case(true, 6, 0)]
    fn overlap_honors_endianness(
        #[case] big_endian: bool,
        #[case] lead: u64,
        #[case] expect: u64,
    ) {
        let space = space(big_endian);
        let container = VarnodeData::new(Arc::clone(&space), 0x100, 8);
        let piece = VarnodeData::new(space, 0x100 + lead, 2);
        assert_eq!(piece.overlap_offset(&container), Some(expect));
    }

    #[test]
    fn disjoint_slots_do_not_overlap() {
        let space = space(false);
        let container = VarnodeData::new(Arc::clone(&space), 0x100, 4);
        let outside = VarnodeData::new(space, 0x103, 2);
        assert_eq!(outside.overlap_offset(&container), None);
    }

    #[test]
    fn constants_mask_to_size() {
        let manager = SpaceManager::new();
        let vn = VarnodeData::constant(manager.constant_space(), 0x1_0002, 2);
        assert_eq!(vn.offset, 0x2);
        assert!(vn.is_constant());
    }
}
