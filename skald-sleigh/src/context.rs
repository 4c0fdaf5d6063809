//! Per-address context database.
//!
//! Named context variables are bit-fields packed into a fixed array of
//! 32-bit words. Values are painted over address ranges through a
//! partition map whose splits are monotonic: once an address becomes a
//! split point it stays one. Alongside the packed words, every blob
//! carries an explicitly-set mask; a paint started at one address
//! propagates forward across split points until it reaches one whose
//! mask claims the same bits.

use std::collections::BTreeMap;
use std::ops::Bound;

use hashbrown::HashMap;

use skald_pcode::{calc_mask, Address, VarnodeData};

/// A named slice of the context blob.
///
/// The slice must lie within a single 32-bit word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContextBitRange {
    word: usize,
    start_bit: u32,
    end_bit: u32,
    shift: u32,
    mask: u32,
}

impl ContextBitRange {
    /// Build a bit range from absolute start/end bit positions
    /// (inclusive, most-significant-bit first within each word).
    pub fn new(sbit: u32, ebit: u32) -> Result<Self, ContextError> {
        if ebit < sbit {
            return Err(ContextError::BadBitRange { sbit, ebit });
        }
        let word = (sbit / 32) as usize;
        if (ebit / 32) as usize != word {
            return Err(ContextError::SpansWords { sbit, ebit });
        }
        let start_bit = sbit % 32;
        let end_bit = ebit % 32;
        let shift = 31 - end_bit;
        let width = end_bit - start_bit + 1;
        let mask = if width == 32 {
            u32::MAX
        } else {
            (1u32 << width) - 1
        };
        Ok(Self {
            word,
            start_bit,
            end_bit,
            shift,
            mask,
        })
    }

    /// Index of the word holding the field.
    pub fn word(&self) -> usize {
        self.word
    }

    /// In-word shift applied when reading the field.
    pub fn shift(&self) -> u32 {
        self.shift
    }

    /// Right-aligned mask of the field.
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Mask of the field in word position.
    pub fn placed_mask(&self) -> u32 {
        self.mask << self.shift
    }

    fn get(&self, words: &[u32]) -> u32 {
        (words[self.word] >> self.shift) & self.mask
    }

    fn set(&self, words: &mut [u32], value: u32) {
        let cleared = words[self.word] & !self.placed_mask();
        words[self.word] = cleared | ((value & self.mask) << self.shift);
    }
}

/// Packed context words plus the explicitly-set mask.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ContextBlob {
    words: Vec<u32>,
    mask: Vec<u32>,
}

impl ContextBlob {
    fn new(size: usize) -> Self {
        Self {
            words: vec![0; size],
            mask: vec![0; size],
        }
    }

    fn from_words(words: Vec<u32>) -> Self {
        let mask = vec![0; words.len()];
        Self { words, mask }
    }

    fn paint(&mut self, word: usize, mask: u32, value: u32) {
        self.words[word] = (self.words[word] & !mask) | (value & mask);
    }
}

/// A register (or other storage) known to hold a constant value over
/// a range of addresses.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedContext {
    /// Storage the value occupies.
    pub loc: VarnodeData,
    /// The constant value, right-aligned.
    pub val: u64,
}

/// Set of tracked registers valid over one partition range.
pub type TrackedSet = Vec<TrackedContext>;

#[derive(Debug, Clone)]
struct BoundedCache {
    first: Address,
    last: Address,
    key: Option<Address>,
}

/// The per-session context database.
#[derive(Debug, Clone, Default)]
pub struct ContextDatabase {
    size: usize,
    variables: HashMap<String, ContextBitRange>,
    default_words: Vec<u32>,
    partition: BTreeMap<Address, ContextBlob>,
    started: bool,
    cache: Option<BoundedCache>,
    tracked: BTreeMap<Address, TrackedSet>,
    tracked_default: TrackedSet,
}

impl ContextDatabase {
    /// Create an empty database with no registered variables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of 32-bit words in each context blob.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Register a named variable over absolute bits `[sbit, ebit]`.
    ///
    /// Must precede every paint; grows the blob when the field lies
    /// past the current word count.
    pub fn register_variable(
        &mut self,
        name: &str,
        sbit: u32,
        ebit: u32,
    ) -> Result<(), ContextError> {
        if self.started {
            return Err(ContextError::RegisterAfterPaint { name: name.into() });
        }
        if self.variables.contains_key(name) {
            return Err(ContextError::DuplicateVariable { name: name.into() });
        }
        let range = ContextBitRange::new(sbit, ebit)?;
        let needed = range.word() + 1;
        if needed > self.size {
            self.size = needed;
            self.default_words.resize(needed, 0);
        }
        self.variables.insert(name.into(), range);
        Ok(())
    }

    /// Look up a registered variable.
    pub fn get_variable(&self, name: &str) -> Result<ContextBitRange, ContextError> {
        self.variables
            .get(name)
            .copied()
            .ok_or_else(|| ContextError::UnknownVariable { name: name.into() })
    }

    /// Write the default value used outside any painted range.
    pub fn set_variable_default(&mut self, name: &str, value: u32) -> Result<(), ContextError> {
        let range = self.get_variable(name)?;
        range.set(&mut self.default_words, value);
        Ok(())
    }

    /// Read the default value of a variable.
    pub fn get_default_value(&self, name: &str) -> Result<u32, ContextError> {
        let range = self.get_variable(name)?;
        Ok(range.get(&self.default_words))
    }

    /// Read the painted (or default) value of a variable at `addr`.
    pub fn get_variable_value(&self, name: &str, addr: &Address) -> Result<u32, ContextError> {
        let range = self.get_variable(name)?;
        Ok(range.get(self.words_at(addr)))
    }

    /// Paint `value` starting at `addr`.
    ///
    /// The partition is split at `addr`; the paint propagates forward
    /// across later splits until one has the same bits explicitly set.
    pub fn set_variable(
        &mut self,
        name: &str,
        addr: &Address,
        value: u32,
    ) -> Result<(), ContextError> {
        let range = self.get_variable(name)?;
        self.set_word(
            addr,
            range.word(),
            range.placed_mask(),
            (value & range.mask()) << range.shift(),
        );
        Ok(())
    }

    /// Paint `value` over `[addr1, addr2)`, forcing splits at both
    /// ends and marking the whole painted range explicitly set.
    pub fn set_variable_region(
        &mut self,
        name: &str,
        addr1: &Address,
        addr2: &Address,
        value: u32,
    ) -> Result<(), ContextError> {
        let range = self.get_variable(name)?;
        self.set_word_region(
            addr1,
            addr2,
            range.word(),
            range.placed_mask(),
            (value & range.mask()) << range.shift(),
        );
        Ok(())
    }

    /// Paint raw bits of one word starting at `addr`, propagating
    /// forward until a split claims any of `mask`.
    ///
    /// This is the primitive used by in-decode context commits, which
    /// address the blob by word and mask rather than by name.
    pub fn set_word(&mut self, addr: &Address, word: usize, mask: u32, value: u32) {
        self.started = true;
        self.invalidate_cache(addr, None);
        self.split(addr);
        let mut painted_start = false;
        let keys: Vec<Address> = self.partition.range(addr.clone()..).map(|(k, _)| k.clone()).collect();
        for key in keys {
            let blob = self.partition.get_mut(&key).expect("key just enumerated");
            if painted_start && (blob.mask[word] & mask) != 0 {
                break;
            }
            blob.paint(word, mask, value);
            if !painted_start {
                blob.mask[word] |= mask;
                painted_start = true;
            }
        }
    }

    /// Paint raw bits of one word over `[addr1, addr2)`.
    ///
    /// The end split keeps the value that covered it but has its mask
    /// bits claimed, so later point paints cannot bleed past the
    /// region boundary.
    pub fn set_word_region(
        &mut self,
        addr1: &Address,
        addr2: &Address,
        word: usize,
        mask: u32,
        value: u32,
    ) {
        if addr2 <= addr1 {
            return;
        }
        self.started = true;
        self.invalidate_cache(addr1, Some(addr2));
        self.split(addr2);
        self.split(addr1);
        let keys: Vec<Address> = self
            .partition
            .range(addr1.clone()..addr2.clone())
            .map(|(k, _)| k.clone())
            .collect();
        for key in keys {
            let blob = self.partition.get_mut(&key).expect("key just enumerated");
            blob.paint(word, mask, value);
            blob.mask[word] |= mask;
        }
        let end = self.partition.get_mut(addr2).expect("split above");
        end.mask[word] |= mask;
    }

    /// The raw word buffer covering `addr` plus the bounds of the
    /// range over which the buffer is valid.
    ///
    /// A single-slot cache holds the last result; any paint that
    /// intersects the cached range or touches its endpoints drops it.
    pub fn get_context_bounded(&mut self, addr: &Address) -> (&[u32], Address, Address) {
        let hit = match &self.cache {
            Some(cache) => {
                cache.first.same_space(addr)
                    && cache.first.offset() <= addr.offset()
                    && addr.offset() <= cache.last.offset()
            }
            None => false,
        };
        if !hit {
            let key = self
                .partition
                .range(..=addr.clone())
                .next_back()
                .map(|(k, _)| k.clone());
            let first = match &key {
                Some(k) if k.same_space(addr) => k.clone(),
                _ => Address::new(addr.space().clone(), 0),
            };
            let last = self
                .partition
                .range((Bound::Excluded(addr.clone()), Bound::Unbounded))
                .next()
                .filter(|(k, _)| k.same_space(addr))
                .map(|(k, _)| Address::new(addr.space().clone(), k.offset() - 1))
                .unwrap_or_else(|| {
                    Address::new(addr.space().clone(), addr.space().highest_offset())
                });
            self.cache = Some(BoundedCache { first, last, key });
        }
        let cache = self.cache.as_ref().expect("filled above");
        let words = match &cache.key {
            Some(key) => &self.partition[key].words,
            None => &self.default_words,
        };
        (words, cache.first.clone(), cache.last.clone())
    }

    /// Raw context words covering `addr`, without bounds bookkeeping.
    pub fn words_at(&self, addr: &Address) -> &[u32] {
        self.partition
            .range(..=addr.clone())
            .next_back()
            .map(|(_, blob)| blob.words.as_slice())
            .unwrap_or(&self.default_words)
    }

    /// Painted split points in address order, with their word buffers.
    pub fn painted(&self) -> impl Iterator<Item = (&Address, &[u32])> {
        self.partition
            .iter()
            .map(|(addr, blob)| (addr, blob.words.as_slice()))
    }

    /// The tracked-register set in effect before any address-specific
    /// set is created.
    pub fn tracked_default(&mut self) -> &mut TrackedSet {
        &mut self.tracked_default
    }

    /// The tracked-register set covering `point`, read-only.
    pub fn get_tracked_set(&self, point: &Address) -> &TrackedSet {
        self.tracked
            .range(..=point.clone())
            .next_back()
            .map(|(_, set)| set)
            .unwrap_or(&self.tracked_default)
    }

    /// Create (or reset) the tracked set valid from `addr1`; the
    /// partition split is forced at `addr1`, the set starts empty.
    pub fn new_tracked_set(&mut self, addr1: &Address, _addr2: &Address) -> &mut TrackedSet {
        self.started = true;
        self.tracked.insert(addr1.clone(), TrackedSet::new());
        self.tracked.get_mut(addr1).expect("just inserted")
    }

    /// Read the constant value tracked for storage `mem` at `point`.
    ///
    /// Returns 0 when no tracked region fully contains `mem`. A wider
    /// tracked value is shifted and masked down to the requested
    /// bytes, honoring the space's endianness.
    pub fn get_tracked_value(&self, mem: &VarnodeData, point: &Address) -> u64 {
        for tracked in self.get_tracked_set(point) {
            if let Some(byte_shift) = mem.overlap_offset(&tracked.loc) {
                let shifted = if byte_shift >= 8 {
                    0
                } else {
                    tracked.val >> (byte_shift * 8)
                };
                return shifted & calc_mask(mem.size);
            }
        }
        0
    }

    fn split(&mut self, addr: &Address) {
        if self.partition.contains_key(addr) {
            return;
        }
        let blob = self
            .partition
            .range(..=addr.clone())
            .next_back()
            .map(|(_, blob)| blob.clone())
            .unwrap_or_else(|| {
                if self.default_words.is_empty() {
                    ContextBlob::new(self.size.max(1))
                } else {
                    ContextBlob::from_words(self.default_words.clone())
                }
            });
        self.partition.insert(addr.clone(), blob);
    }

    fn invalidate_cache(&mut self, addr: &Address, end: Option<&Address>) {
        let Some(cache) = &self.cache else {
            return;
        };
        if !cache.first.same_space(addr) {
            return;
        }
        let start = addr.offset();
        let stop = end.map(|end| end.offset()).unwrap_or(u64::MAX);
        // Inclusive on both cache endpoints: a split exactly at the
        // boundary changes the validity range even when no value in
        // the cached blob moves.
        if stop >= cache.first.offset() && start <= cache.last.offset() {
            self.cache = None;
        }
    }
}

/// Context configuration failures; all are fatal to the session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    /// The named variable has not been registered.
    #[error("unknown context variable `{name}`")]
    UnknownVariable {
        /// The missing name.
        name: String,
    },
    /// Registration attempted after the first paint.
    #[error("context variable `{name}` registered after context was painted")]
    RegisterAfterPaint {
        /// The late name.
        name: String,
    },
    /// Two registrations share a name.
    #[error("context variable `{name}` registered twice")]
    DuplicateVariable {
        /// The duplicated name.
        name: String,
    },
    /// The field's bit positions are reversed.
    #[error("bad context bit range [{sbit}, {ebit}]")]
    BadBitRange {
        /// Start bit.
        sbit: u32,
        /// End bit.
        ebit: u32,
    },
    /// The field crosses a 32-bit word boundary.
    #[error("context field [{sbit}, {ebit}] spans two words")]
    SpansWords {
        /// Start bit.
        sbit: u32,
        /// End bit.
        ebit: u32,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_pcode::{AddrSpace, SpaceFlags, SpaceKind, SpaceManager};
    use std::sync::Arc;

    fn ram() -> Arc<AddrSpace> {
        let mut manager = SpaceManager::new();
        manager
            .insert(AddrSpace::new(
                "ram",
                SpaceKind::Processor,
                1,
                4,
                1,
                SpaceFlags::HAS_PHYSICAL,
                0,
            ))
            .unwrap()
    }

    fn at(space: &Arc<AddrSpace>, offset: u64) -> Address {
        Address::new(Arc::clone(space), offset)
    }

    fn fresh() -> (ContextDatabase, Arc<AddrSpace>) {
        let mut db = ContextDatabase::new();
        db.register_variable("mode", 0, 3).unwrap();
        db.register_variable("counter", 4, 11).unwrap();
        (db, ram())
    }

    #[test]
    fn defaults_apply_outside_paints() {
        let (mut db, space) = fresh();
        db.set_variable_default("mode", 0x5).unwrap();
        assert_eq!(db.get_default_value("mode").unwrap(), 0x5);
        assert_eq!(db.get_variable_value("mode", &at(&space, 0x100)).unwrap(), 0x5);
    }

    #[test]
    fn region_paint_covers_exact_range() {
        let (mut db, space) = fresh();
        db.set_variable_region("mode", &at(&space, 0x10), &at(&space, 0x30), 7)
            .unwrap();
        for offset in 0x10..0x30 {
            assert_eq!(db.get_variable_value("mode", &at(&space, offset)).unwrap(), 7);
        }
        assert_eq!(db.get_variable_value("mode", &at(&space, 0x0f)).unwrap(), 0);
        assert_eq!(db.get_variable_value("mode", &at(&space, 0x30)).unwrap(), 0);
    }

    #[test]
    fn explicit_set_bounds_point_paints() {
        // Paint V1 over [10, 30), then V2 at 20, then V3 at 15.
        let (mut db, space) = fresh();
        db.set_variable_region("mode", &at(&space, 10), &at(&space, 30), 1)
            .unwrap();
        db.set_variable("mode", &at(&space, 20), 2).unwrap();
        db.set_variable("mode", &at(&space, 15), 3).unwrap();

        assert_eq!(db.get_variable_value("mode", &at(&space, 15)).unwrap(), 3);
        assert_eq!(db.get_variable_value("mode", &at(&space, 17)).unwrap(), 3);
        assert_eq!(db.get_variable_value("mode", &at(&space, 22)).unwrap(), 2);
        assert_eq!(db.get_variable_value("mode", &at(&space, 30)).unwrap(), 0);
    }

    #[test]
    fn point_paint_extends_to_infinity_when_unopposed() {
        let (mut db, space) = fresh();
        db.set_variable("counter", &at(&space, 0x100), 0x42).unwrap();
        assert_eq!(
            db.get_variable_value("counter", &at(&space, 0xffff_0000)).unwrap(),
            0x42
        );
        assert_eq!(db.get_variable_value("counter", &at(&space, 0xff)).unwrap(), 0);
    }

    #[test]
    fn disjoint_variables_do_not_interfere() {
        let (mut db, space) = fresh();
        db.set_variable("mode", &at(&space, 0x10), 0xf).unwrap();
        db.set_variable("counter", &at(&space, 0x10), 0xaa).unwrap();
        assert_eq!(db.get_variable_value("mode", &at(&space, 0x10)).unwrap(), 0xf);
        assert_eq!(db.get_variable_value("counter", &at(&space, 0x10)).unwrap(), 0xaa);
    }

    #[test]
    fn registration_is_frozen_by_first_paint() {
        let (mut db, space) = fresh();
        db.set_variable("mode", &at(&space, 0), 1).unwrap();
        let err = db.register_variable("late", 12, 15).unwrap_err();
        assert!(matches!(err, ContextError::RegisterAfterPaint { .. }));
    }

    #[rstest::rstest]
    #[case(30, 33)]
    #[case(0, 32)]
    #[case(63, 64)]
    fn field_may_not_span_words(#[case] sbit: u32, #[case] ebit: u32) {
        let mut db = ContextDatabase::new();
        let err = db.register_variable("wide", sbit, ebit).unwrap_err();
        assert!(matches!(err, ContextError::SpansWords { .. }));
    }

    #[rstest::rstest]
    #[case(0, 31, 0, 0, u32::MAX)]
    #[case(32, 39, 1, 24, 0xff)]
    #[case(4, 11, 0, 20, 0xff)]
    fn bit_ranges_place_within_one_word(
        #[case] sbit: u32,
        #[case] ebit: u32,
        #[case] word: usize,
        #[case] shift: u32,
        #[case] mask: u32,
    ) {
        let range = ContextBitRange::new(sbit, ebit).unwrap();
        assert_eq!(range.word(), word);
        assert_eq!(range.shift(), shift);
        assert_eq!(range.mask(), mask);
    }

    #[test]
    fn bounded_query_reports_validity_range() {
        let (mut db, space) = fresh();
        db.set_variable_region("mode", &at(&space, 0x10), &at(&space, 0x30), 7)
            .unwrap();
        let (words, first, last) = db.get_context_bounded(&at(&space, 0x20));
        assert_eq!(words[0] >> 28, 7);
        assert_eq!(first.offset(), 0x10);
        assert_eq!(last.offset(), 0x2f);
    }

    #[test]
    fn bounded_cache_survives_reads_and_drops_on_paint() {
        let (mut db, space) = fresh();
        db.set_variable_region("mode", &at(&space, 0x10), &at(&space, 0x30), 7)
            .unwrap();
        let _ = db.get_context_bounded(&at(&space, 0x20));
        assert!(db.cache.is_some());
        let _ = db.get_context_bounded(&at(&space, 0x2f));
        assert!(db.cache.is_some());
        db.set_variable("mode", &at(&space, 0x20), 1).unwrap();
        assert!(db.cache.is_none());
        let (words, _, _) = db.get_context_bounded(&at(&space, 0x22));
        assert_eq!(words[0] >> 28, 1);
    }

    #[test]
    fn tracked_values_trim_by_endianness() {
        let (mut db, space) = fresh();
        let reg_le = VarnodeData::new(Arc::clone(&space), 0x1000, 8);
        let start = at(&space, 0);
        let end = at(&space, 0x100);
        db.new_tracked_set(&start, &end).push(TrackedContext {
            loc: reg_le.clone(),
            val: 0x1122_3344_5566_7788,
        });

        let low_half = VarnodeData::new(Arc::clone(&space), 0x1000, 4);
        assert_eq!(db.get_tracked_value(&low_half, &at(&space, 0x50)), 0x5566_7788);
        let second_byte = VarnodeData::new(Arc::clone(&space), 0x1001, 1);
        assert_eq!(db.get_tracked_value(&second_byte, &at(&space, 0x50)), 0x66);
        let miss = VarnodeData::new(Arc::clone(&space), 0x2000, 4);
        assert_eq!(db.get_tracked_value(&miss, &at(&space, 0x50)), 0);
    }

    #[test]
    fn tracked_sets_partition_by_address() {
        let (mut db, space) = fresh();
        let reg = VarnodeData::new(Arc::clone(&space), 0x1000, 4);
        let a = at(&space, 0x0);
        let b = at(&space, 0x100);
        db.new_tracked_set(&a, &b).push(TrackedContext {
            loc: reg.clone(),
            val: 1,
        });
        db.new_tracked_set(&b, &at(&space, 0x200)).push(TrackedContext {
            loc: reg.clone(),
            val: 2,
        });
        assert_eq!(db.get_tracked_value(&reg, &at(&space, 0x50)), 1);
        assert_eq!(db.get_tracked_value(&reg, &at(&space, 0x150)), 2);
        assert!(db.get_tracked_set(&at(&space, 0x150)).len() == 1);
    }
}
