//! Address space definitions and the per-session space registry.

use core::fmt;
use std::sync::Arc;

use crate::calc_mask;

bitflags::bitflags! {
    /// Property bits of an address space.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct SpaceFlags: u32 {
        /// Multi-byte values in this space are stored big endian.
        const BIG_ENDIAN = 0x01;
        /// The space models heap-like storage rather than registers.
        const HEAP = 0x02;
        /// Offsets in this space name physical storage locations.
        const HAS_PHYSICAL = 0x04;
        /// The space is the special `OTHER` overlay used for scratch data.
        const IS_OTHER = 0x08;
        /// The space overlays another space.
        const OVERLAY = 0x10;
    }
}

/// The broad category an address space belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SpaceKind {
    /// Offsets are the values themselves.
    Constant,
    /// Addressable memory or registers of the target processor.
    Processor,
    /// Decoder-internal temporary storage (the *unique* space).
    Internal,
    /// Function prototype bookkeeping slots.
    Fspec,
    /// Indirect-op bookkeeping slots.
    Iop,
    /// Logically joined pieces of other spaces.
    Join,
}

/// A region of addressable storage.
///
/// Spaces are immutable after construction and interned in a
/// [`SpaceManager`]; all addresses and varnodes refer to them through
/// shared handles.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct AddrSpace {
    name: String,
    kind: SpaceKind,
    index: usize,
    addr_size: u32,
    word_size: u32,
    flags: SpaceFlags,
    delay: u32,
    highest: u64,
}

impl AddrSpace {
    /// Construct a new space description.
    pub fn new(
        name: impl Into<String>,
        kind: SpaceKind,
        index: usize,
        addr_size: u32,
        word_size: u32,
        flags: SpaceFlags,
        delay: u32,
    ) -> Self {
        let highest = calc_mask(addr_size.saturating_mul(word_size));
        Self {
            name: name.into(),
            kind,
            index,
            addr_size,
            word_size,
            flags,
            delay,
            highest,
        }
    }

    /// The constant space. Always present at index 0.
    pub fn constant() -> Self {
        Self::new(
            "const",
            SpaceKind::Constant,
            0,
            8,
            1,
            SpaceFlags::empty(),
            0,
        )
    }

    /// Name of the space as it appears in specifications.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Category of the space.
    pub const fn kind(&self) -> SpaceKind {
        self.kind
    }

    /// Position of the space in its registry; unique per session.
    pub const fn index(&self) -> usize {
        self.index
    }

    /// Number of bytes needed to represent an offset.
    pub const fn addr_size(&self) -> u32 {
        self.addr_size
    }

    /// Number of bytes covered by one addressable unit.
    pub const fn word_size(&self) -> u32 {
        self.word_size
    }

    /// Property bits.
    pub const fn flags(&self) -> SpaceFlags {
        self.flags
    }

    /// Delay-slot depth declared for this space.
    pub const fn delay(&self) -> u32 {
        self.delay
    }

    /// Largest valid byte offset.
    pub const fn highest_offset(&self) -> u64 {
        self.highest
    }

    /// Whether multi-byte values are stored big endian.
    pub const fn is_big_endian(&self) -> bool {
        self.flags.contains(SpaceFlags::BIG_ENDIAN)
    }

    /// Whether this is the constant space.
    pub fn is_constant(&self) -> bool {
        self.kind == SpaceKind::Constant
    }

    /// Whether this is decoder-internal temporary storage.
    pub fn is_internal(&self) -> bool {
        self.kind == SpaceKind::Internal
    }

    /// Reduce `offset` into the valid range of the space.
    ///
    /// Offsets wrap modulo the space size and are truncated to word
    /// alignment when the space is word addressable.
    pub fn wrap_offset(&self, offset: u64) -> u64 {
        let wrapped = offset & self.highest;
        if self.word_size > 1 {
            wrapped - wrapped % u64::from(self.word_size)
        } else {
            wrapped
        }
    }
}

impl fmt::Display for AddrSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

/// Registry of the address spaces of one decoding session.
///
/// Spaces are appended during specification load and never removed;
/// the constant space is created eagerly at index 0.
#[derive(Debug, Clone)]
pub struct SpaceManager {
    spaces: Vec<Arc<AddrSpace>>,
    default_space: Option<usize>,
    unique_space: Option<usize>,
}

impl Default for SpaceManager {
    fn default() -> Self {
        Self::new()
    }
}

impl SpaceManager {
    /// Create a registry holding only the constant space.
    pub fn new() -> Self {
        Self {
            spaces: vec![Arc::new(AddrSpace::constant())],
            default_space: None,
            unique_space: None,
        }
    }

    /// Number of registered spaces.
    pub fn len(&self) -> usize {
        self.spaces.len()
    }

    /// Whether only the constant space is registered.
    pub fn is_empty(&self) -> bool {
        self.spaces.len() <= 1
    }

    /// Register `space`, which must carry the next free index.
    pub fn insert(&mut self, space: AddrSpace) -> Result<Arc<AddrSpace>, SpaceError> {
        if space.index() != self.spaces.len() {
            return Err(SpaceError::IndexMismatch {
                name: space.name().into(),
                expected: self.spaces.len(),
                found: space.index(),
            });
        }
        if self.by_name(space.name()).is_some() {
            return Err(SpaceError::Duplicate {
                name: space.name().into(),
            });
        }
        if space.is_internal() {
            self.unique_space = Some(space.index());
        }
        let space = Arc::new(space);
        self.spaces.push(Arc::clone(&space));
        Ok(space)
    }

    /// Mark the space named `name` as the default load/store space.
    pub fn set_default(&mut self, name: &str) -> Result<(), SpaceError> {
        let space = self.by_name(name).ok_or_else(|| SpaceError::Unknown {
            name: name.into(),
        })?;
        self.default_space = Some(space.index());
        Ok(())
    }

    /// The constant space handle.
    pub fn constant_space(&self) -> Arc<AddrSpace> {
        Arc::clone(&self.spaces[0])
    }

    /// The default load/store space, if one has been declared.
    pub fn default_space(&self) -> Option<Arc<AddrSpace>> {
        self.default_space.map(|idx| Arc::clone(&self.spaces[idx]))
    }

    /// The decoder-internal temporary space, if one has been declared.
    pub fn unique_space(&self) -> Option<Arc<AddrSpace>> {
        self.unique_space.map(|idx| Arc::clone(&self.spaces[idx]))
    }

    /// Look up a space by registry index.
    pub fn by_index(&self, index: usize) -> Option<Arc<AddrSpace>> {
        self.spaces.get(index).map(Arc::clone)
    }

    /// Look up a space by name.
    pub fn by_name(&self, name: &str) -> Option<Arc<AddrSpace>> {
        self.spaces
            .iter()
            .find(|space| space.name() == name)
            .map(Arc::clone)
    }

    /// Iterate over all registered spaces in index order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<AddrSpace>> {
        self.spaces.iter()
    }
}

/// Space registry failures; all are configuration errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SpaceError {
    /// A space declared an index other than the next free one.
    #[error("space `{name}` declared index {found}, expected {expected}")]
    IndexMismatch {
        /// Name of the offending space.
        name: String,
        /// Next free index of the registry.
        expected: usize,
        /// Index carried by the space.
        found: usize,
    },
    /// Two spaces share a name.
    #[error("space `{name}` registered twice")]
    Duplicate {
        /// The duplicated name.
        name: String,
    },
    /// A named space is not registered.
    #[error("unknown space `{name}`")]
    Unknown {
        /// The missing name.
        name: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ram(index: usize) -> AddrSpace {
        AddrSpace::new(
            "ram",
            SpaceKind::Processor,
            index,
            4,
            1,
            SpaceFlags::HAS_PHYSICAL,
            0,
        )
    }

    #[test]
    fn constant_space_is_index_zero() {
        let manager = SpaceManager::new();
        assert_eq!(manager.constant_space().index(), 0);
        assert!(manager.constant_space().is_constant());
    }

    #[test]
    fn insert_enforces_sequential_indices() {
        let mut manager = SpaceManager::new();
        assert!(manager.insert(ram(1)).is_ok());
        let err = manager.insert(ram(3)).unwrap_err();
        assert!(matches!(err, SpaceError::IndexMismatch { expected: 2, .. }));
    }

    #[test]
    fn wrap_reduces_modulo_space_size() {
        let space = AddrSpace::new(
            "small",
            SpaceKind::Processor,
            1,
            2,
            1,
            SpaceFlags::empty(),
            0,
        );
        assert_eq!(space.wrap_offset(0x1_0001), 0x1);
        assert_eq!(space.wrap_offset(0xffff), 0xffff);
    }

    #[test]
    fn word_addressable_space_truncates_to_word() {
        let space = AddrSpace::new(
            "word",
            SpaceKind::Processor,
            1,
            2,
            2,
            SpaceFlags::empty(),
            0,
        );
        assert_eq!(space.wrap_offset(0x7), 0x6);
    }
}
