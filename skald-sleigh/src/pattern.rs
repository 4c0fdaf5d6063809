//! Decoding patterns: disjoint mask/value blocks and their algebra.
//!
//! A [`PatternBlock`] compares a run of instruction or context bytes
//! against a mask/value pair. Blocks combine into the four pattern
//! variants a constructor can carry; conjunction and disjunction are
//! closed over the variants, with `Or` distributing over `And`.

use crate::error::Error;
use crate::sla::format::*;
use crate::sla::{PackedDecoder, PackedEncoder};

/// Source of raw bits for pattern matching.
///
/// Implemented by the parser walker; offsets are relative to the
/// walker's current operand position.
pub trait BitSource {
    /// Read up to 4 instruction bytes at `offset` as a left-aligned
    /// big-endian word, zero-padding past the instruction window.
    fn instruction_bits(&self, offset: usize, size: usize) -> Result<u32, Error>;
    /// Read up to 4 context bytes at `offset` as a left-aligned
    /// big-endian word.
    fn context_bits(&self, offset: usize, size: usize) -> u32;
}

/// A mask/value fragment over a byte run.
///
/// Two sentinel states exist: `nonzero_size == 0` matches everything,
/// `nonzero_size == -1` matches nothing. All constructors normalize,
/// so structural equality of normalized blocks is semantic equality.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatternBlock {
    offset: usize,
    nonzero_size: i32,
    mask: Vec<u32>,
    value: Vec<u32>,
}

impl PatternBlock {
    /// The block that matches everything (`true`) or nothing (`false`).
    pub fn always(matches: bool) -> Self {
        Self {
            offset: 0,
            nonzero_size: if matches { 0 } else { -1 },
            mask: Vec::new(),
            value: Vec::new(),
        }
    }

    /// Build a block from word arrays starting at byte `offset`.
    pub fn new(offset: usize, mask: Vec<u32>, value: Vec<u32>) -> Self {
        let len = mask.len().max(value.len());
        let mut block = Self {
            offset,
            nonzero_size: (len * 4) as i32,
            mask,
            value,
        };
        block.mask.resize(len, 0);
        block.value.resize(len, 0);
        block.normalize();
        block
    }

    /// Build a single-word block masking `mask` against `value`.
    pub fn from_word(offset: usize, mask: u32, value: u32) -> Self {
        Self::new(offset, vec![mask], vec![value])
    }

    /// Whether the block matches all byte runs.
    pub fn always_true(&self) -> bool {
        self.nonzero_size == 0
    }

    /// Whether the block matches no byte run.
    pub fn always_false(&self) -> bool {
        self.nonzero_size == -1
    }

    /// Byte offset of the first significant byte.
    pub fn offset(&self) -> usize {
        self.offset
    }

    /// Number of significant bytes; 0 and -1 are the sentinel states.
    pub fn nonzero_size(&self) -> i32 {
        self.nonzero_size
    }

    /// Shift the block `sa` bytes forward in the instruction stream.
    pub fn shift(&mut self, sa: usize) {
        if self.nonzero_size > 0 {
            self.offset += sa;
        }
    }

    /// Put the block in canonical form: strip leading/trailing zero
    /// mask bytes, re-encode the offset, and reduce to a sentinel
    /// when the mask vanishes.
    pub fn normalize(&mut self) {
        if self.nonzero_size <= 0 {
            self.offset = 0;
            self.mask.clear();
            self.value.clear();
            return;
        }
        for (value, mask) in self.value.iter_mut().zip(self.mask.iter()) {
            *value &= *mask;
        }
        // Leading all-zero words move into the offset.
        let lead_words = self.mask.iter().take_while(|&&m| m == 0).count();
        if lead_words > 0 {
            self.offset += lead_words * 4;
            self.mask.drain(..lead_words);
            self.value.drain(..lead_words);
        }
        if self.mask.is_empty() {
            self.offset = 0;
            self.nonzero_size = 0;
            self.value.clear();
            return;
        }
        // Leading zero bytes of the first word shift the whole array.
        let lead_bytes = (self.mask[0].leading_zeros() / 8) as usize;
        if lead_bytes > 0 {
            let sa = (lead_bytes * 8) as u32;
            for i in 0..self.mask.len() {
                let (next_mask, next_value) = if i + 1 < self.mask.len() {
                    (self.mask[i + 1], self.value[i + 1])
                } else {
                    (0, 0)
                };
                self.mask[i] = (self.mask[i] << sa) | (next_mask >> (32 - sa));
                self.value[i] = (self.value[i] << sa) | (next_value >> (32 - sa));
            }
            self.offset += lead_bytes;
        }
        // Trailing zero bytes shrink the significant size.
        while let Some(&last) = self.mask.last() {
            if last == 0 {
                self.mask.pop();
                self.value.pop();
            } else {
                break;
            }
        }
        if self.mask.is_empty() {
            self.offset = 0;
            self.nonzero_size = 0;
            self.value.clear();
            return;
        }
        let last = *self.mask.last().expect("nonempty");
        let tail_bytes = (last.trailing_zeros() / 8) as usize;
        self.nonzero_size = (self.mask.len() * 4 - tail_bytes) as i32;
    }

    /// Bits of the mask over `[startbit, startbit + size)`, counted
    /// from the most significant bit of instruction byte 0.
    pub fn get_mask(&self, startbit: i64, size: u32) -> u32 {
        self.read_bits(&self.mask, startbit, size)
    }

    /// Bits of the value over `[startbit, startbit + size)`.
    pub fn get_value(&self, startbit: i64, size: u32) -> u32 {
        self.read_bits(&self.value, startbit, size)
    }

    fn read_bits(&self, words: &[u32], startbit: i64, size: u32) -> u32 {
        debug_assert!(size <= 32);
        let start = startbit - (self.offset as i64) * 8;
        let mut res: u64 = 0;
        for i in 0..i64::from(size) {
            let bit = start + i;
            let val = if bit < 0 {
                0
            } else {
                let word = (bit / 32) as usize;
                let pos = (bit % 32) as u32;
                words
                    .get(word)
                    .map(|w| (w >> (31 - pos)) & 1)
                    .unwrap_or(0)
            };
            res = (res << 1) | u64::from(val);
        }
        res as u32
    }

    /// Byte-aligned merge of two blocks.
    ///
    /// Fails to the always-false block when overlapping mask bits
    /// disagree on value.
    pub fn intersect(&self, other: &Self) -> Self {
        if self.always_false() || other.always_false() {
            return Self::always(false);
        }
        if self.always_true() {
            return other.clone();
        }
        if other.always_true() {
            return self.clone();
        }
        let offset = self.offset.min(other.offset);
        let end = (self.offset + self.mask.len() * 4).max(other.offset + other.mask.len() * 4);
        let words = (end - offset + 3) / 4;
        let mut mask = vec![0u32; words];
        let mut value = vec![0u32; words];
        for i in 0..words {
            let startbit = ((offset + i * 4) * 8) as i64;
            let m1 = self.get_mask(startbit, 32);
            let v1 = self.get_value(startbit, 32);
            let m2 = other.get_mask(startbit, 32);
            let v2 = other.get_value(startbit, 32);
            let common = m1 & m2;
            if (v1 & common) != (v2 & common) {
                return Self::always(false);
            }
            mask[i] = m1 | m2;
            value[i] = (v1 & m1) | (v2 & m2);
        }
        Self::new(offset, mask, value)
    }

    /// The bit-wise intersection of masks where the values agree.
    pub fn common_subpattern(&self, other: &Self) -> Self {
        if self.always_false() {
            return other.clone();
        }
        if other.always_false() {
            return self.clone();
        }
        if self.always_true() || other.always_true() {
            return Self::always(true);
        }
        let offset = self.offset.min(other.offset);
        let end = (self.offset + self.mask.len() * 4).max(other.offset + other.mask.len() * 4);
        let words = (end - offset + 3) / 4;
        let mut mask = vec![0u32; words];
        let mut value = vec![0u32; words];
        for i in 0..words {
            let startbit = ((offset + i * 4) * 8) as i64;
            let m1 = self.get_mask(startbit, 32);
            let v1 = self.get_value(startbit, 32);
            let m2 = other.get_mask(startbit, 32);
            let v2 = other.get_value(startbit, 32);
            let common = m1 & m2 & !(v1 ^ v2);
            mask[i] = common;
            value[i] = v1 & common;
        }
        Self::new(offset, mask, value)
    }

    /// Whether every mask bit of `other` is fixed identically by `self`.
    pub fn specializes(&self, other: &Self) -> bool {
        if other.always_true() || self.always_false() {
            return true;
        }
        if other.always_false() || self.always_true() {
            return false;
        }
        for i in 0..other.mask.len() {
            let startbit = ((other.offset + i * 4) * 8) as i64;
            let m1 = self.get_mask(startbit, 32);
            let v1 = self.get_value(startbit, 32);
            let m2 = other.mask[i];
            let v2 = other.value[i];
            if (m1 & m2) != m2 {
                return false;
            }
            if (v1 & m2) != v2 {
                return false;
            }
        }
        true
    }

    /// Whether both blocks fix exactly the same bits to the same
    /// values.
    pub fn identical(&self, other: &Self) -> bool {
        if self.nonzero_size <= 0 || other.nonzero_size <= 0 {
            return self.nonzero_size == other.nonzero_size;
        }
        self == other
    }

    /// Compare against instruction bytes at the walker position.
    pub fn is_instruction_match<S: BitSource + ?Sized>(&self, src: &S) -> Result<bool, Error> {
        if self.always_false() {
            return Ok(false);
        }
        let mut off = self.offset;
        for i in 0..self.mask.len() {
            let data = src.instruction_bits(off, 4)?;
            if (self.mask[i] & data) != self.value[i] {
                return Ok(false);
            }
            off += 4;
        }
        Ok(true)
    }

    /// Write the block as a `<pat_block>` element.
    pub fn encode(&self, encoder: &mut PackedEncoder) {
        encoder.open_element(ELEM_PAT_BLOCK);
        encoder.write_uint(ATTRIB_OFF, self.offset as u64);
        encoder.write_int(ATTRIB_NONZERO, i64::from(self.nonzero_size));
        for (mask, value) in self.mask.iter().zip(&self.value) {
            encoder.open_element(ELEM_MASK_WORD);
            encoder.write_uint(ATTRIB_MASK, u64::from(*mask));
            encoder.write_uint(ATTRIB_VAL, u64::from(*value));
            encoder.close_element(ELEM_MASK_WORD);
        }
        encoder.close_element(ELEM_PAT_BLOCK);
    }

    /// Decode a `<pat_block>` element.
    pub(crate) fn decode(decoder: &mut PackedDecoder<'_>) -> Result<Self, Error> {
        decoder.open_element(ELEM_PAT_BLOCK)?;
        let offset = decoder.read_uint(ATTRIB_OFF)? as usize;
        let nonzero = decoder.read_int(ATTRIB_NONZERO)?;
        let mut mask = Vec::new();
        let mut value = Vec::new();
        while decoder.peek_element() == Some(ELEM_MASK_WORD) {
            decoder.open_element(ELEM_MASK_WORD)?;
            mask.push(decoder.read_uint(ATTRIB_MASK)? as u32);
            value.push(decoder.read_uint(ATTRIB_VAL)? as u32);
            decoder.close_element(ELEM_MASK_WORD)?;
        }
        decoder.close_element(ELEM_PAT_BLOCK)?;
        if nonzero < 0 {
            return Ok(Self::always(false));
        }
        if nonzero == 0 {
            return Ok(Self::always(true));
        }
        Ok(Self::new(offset, mask, value))
    }

    /// Compare against context bytes at the walker position.
    pub fn is_context_match<S: BitSource + ?Sized>(&self, src: &S) -> bool {
        if self.always_false() {
            return false;
        }
        let mut off = self.offset;
        for i in 0..self.mask.len() {
            let data = src.context_bits(off, 4);
            if (self.mask[i] & data) != self.value[i] {
                return false;
            }
            off += 4;
        }
        true
    }
}

/// A decoding pattern attached to one constructor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Pattern {
    /// Constraints over instruction bytes only.
    Instruction(PatternBlock),
    /// Constraints over context bytes only.
    Context(PatternBlock),
    /// Paired context and instruction constraints; both must hold.
    Combine {
        /// Context half.
        context: PatternBlock,
        /// Instruction half.
        instruction: PatternBlock,
    },
    /// Non-empty list of disjoint alternatives; any may hold.
    Or(Vec<Pattern>),
}

impl Pattern {
    /// The pattern matching everything or nothing.
    pub fn always(matches: bool) -> Self {
        Self::Instruction(PatternBlock::always(matches))
    }

    /// Whether the pattern matches unconditionally.
    pub fn always_true(&self) -> bool {
        match self {
            Self::Instruction(block) | Self::Context(block) => block.always_true(),
            Self::Combine {
                context,
                instruction,
            } => context.always_true() && instruction.always_true(),
            Self::Or(members) => members.iter().any(Pattern::always_true),
        }
    }

    /// Whether the pattern can never match.
    pub fn always_false(&self) -> bool {
        match self {
            Self::Instruction(block) | Self::Context(block) => block.always_false(),
            Self::Combine {
                context,
                instruction,
            } => context.always_false() || instruction.always_false(),
            Self::Or(members) => members.iter().all(Pattern::always_false),
        }
    }

    /// Whether the pattern puts no constraint on instruction bytes.
    pub fn always_instruction_true(&self) -> bool {
        match self {
            Self::Instruction(block) => block.always_true(),
            Self::Context(_) => true,
            Self::Combine { instruction, .. } => instruction.always_true(),
            Self::Or(members) => members.iter().all(Pattern::always_instruction_true),
        }
    }

    /// Number of disjoint alternatives.
    pub fn num_disjoint(&self) -> usize {
        match self {
            Self::Or(members) => members.len(),
            _ => 1,
        }
    }

    /// Shift all instruction constraints `sa` bytes forward.
    pub fn shift_instruction(&mut self, sa: usize) {
        match self {
            Self::Instruction(block) => block.shift(sa),
            Self::Context(_) => {}
            Self::Combine { instruction, .. } => instruction.shift(sa),
            Self::Or(members) => {
                for member in members {
                    member.shift_instruction(sa);
                }
            }
        }
    }

    /// Collapse sentinel branches into the smallest equivalent form.
    pub fn simplify_clone(&self) -> Self {
        match self {
            Self::Instruction(block) => Self::Instruction(block.clone()),
            Self::Context(block) => {
                if block.always_true() {
                    Self::always(true)
                } else if block.always_false() {
                    Self::always(false)
                } else {
                    Self::Context(block.clone())
                }
            }
            Self::Combine {
                context,
                instruction,
            } => {
                if context.always_false() || instruction.always_false() {
                    Self::always(false)
                } else if context.always_true() {
                    Self::Instruction(instruction.clone())
                } else if instruction.always_true() {
                    Self::Context(context.clone())
                } else {
                    Self::Combine {
                        context: context.clone(),
                        instruction: instruction.clone(),
                    }
                }
            }
            Self::Or(members) => {
                let survivors: Vec<Pattern> = members
                    .iter()
                    .filter(|member| !member.always_false())
                    .map(Pattern::simplify_clone)
                    .collect();
                if survivors.iter().any(Pattern::always_true) {
                    Self::always(true)
                } else if survivors.is_empty() {
                    Self::always(false)
                } else if survivors.len() == 1 {
                    survivors.into_iter().next().expect("len checked")
                } else {
                    Self::Or(survivors)
                }
            }
        }
    }

    /// Conjunction. `sa` shifts the right side forward when positive
    /// and the left side forward when negative, in bytes.
    pub fn do_and(&self, other: &Self, sa: i64) -> Self {
        let (left, right) = Self::align(self, other, sa);
        match (&left, &right) {
            (Self::Or(members), _) => {
                let combined = members.iter().map(|m| m.do_and(&right, 0)).collect();
                Self::Or(combined).simplify_clone()
            }
            (_, Self::Or(members)) => {
                let combined = members.iter().map(|m| left.do_and(m, 0)).collect();
                Self::Or(combined).simplify_clone()
            }
            (Self::Instruction(a), Self::Instruction(b)) => Self::Instruction(a.intersect(b)),
            (Self::Context(a), Self::Context(b)) => Self::Context(a.intersect(b)),
            (Self::Instruction(ins), Self::Context(ctx))
            | (Self::Context(ctx), Self::Instruction(ins)) => Self::Combine {
                context: ctx.clone(),
                instruction: ins.clone(),
            }
            .simplify_clone(),
            (
                Self::Combine {
                    context,
                    instruction,
                },
                Self::Instruction(ins),
            )
            | (
                Self::Instruction(ins),
                Self::Combine {
                    context,
                    instruction,
                },
            ) => Self::Combine {
                context: context.clone(),
                instruction: instruction.intersect(ins),
            }
            .simplify_clone(),
            (
                Self::Combine {
                    context,
                    instruction,
                },
                Self::Context(ctx),
            )
            | (
                Self::Context(ctx),
                Self::Combine {
                    context,
                    instruction,
                },
            ) => Self::Combine {
                context: context.intersect(ctx),
                instruction: instruction.clone(),
            }
            .simplify_clone(),
            (
                Self::Combine {
                    context: c1,
                    instruction: i1,
                },
                Self::Combine {
                    context: c2,
                    instruction: i2,
                },
            ) => Self::Combine {
                context: c1.intersect(c2),
                instruction: i1.intersect(i2),
            }
            .simplify_clone(),
        }
    }

    /// Disjunction with the same shift convention as [`Self::do_and`].
    pub fn do_or(&self, other: &Self, sa: i64) -> Self {
        let (left, right) = Self::align(self, other, sa);
        let mut members = Vec::new();
        match left {
            Self::Or(mut list) => members.append(&mut list),
            single => members.push(single),
        }
        match right {
            Self::Or(mut list) => members.append(&mut list),
            single => members.push(single),
        }
        Self::Or(members).simplify_clone()
    }

    /// The weakest pattern both sides specialize.
    pub fn common_subpattern(&self, other: &Self, sa: i64) -> Self {
        let (left, right) = Self::align(self, other, sa);
        match (&left, &right) {
            (Self::Or(members), _) => {
                let mut res = right.clone();
                for member in members {
                    res = member.common_subpattern(&res, 0);
                }
                res
            }
            (_, Self::Or(members)) => {
                let mut res = left.clone();
                for member in members {
                    res = res.common_subpattern(member, 0);
                }
                res
            }
            (Self::Instruction(a), Self::Instruction(b)) => {
                Self::Instruction(a.common_subpattern(b))
            }
            (Self::Context(a), Self::Context(b)) => Self::Context(a.common_subpattern(b)),
            (Self::Instruction(_), Self::Context(_))
            | (Self::Context(_), Self::Instruction(_)) => Self::always(true),
            (
                Self::Combine { instruction, .. },
                Self::Instruction(ins),
            )
            | (
                Self::Instruction(ins),
                Self::Combine { instruction, .. },
            ) => Self::Instruction(instruction.common_subpattern(ins)),
            (
                Self::Combine { context, .. },
                Self::Context(ctx),
            )
            | (
                Self::Context(ctx),
                Self::Combine { context, .. },
            ) => Self::Context(context.common_subpattern(ctx)),
            (
                Self::Combine {
                    context: c1,
                    instruction: i1,
                },
                Self::Combine {
                    context: c2,
                    instruction: i2,
                },
            ) => Self::Combine {
                context: c1.common_subpattern(c2),
                instruction: i1.common_subpattern(i2),
            }
            .simplify_clone(),
        }
    }

    /// Evaluate against the bits at the walker's current position.
    pub fn is_match<S: BitSource + ?Sized>(&self, src: &S) -> Result<bool, Error> {
        match self {
            Self::Instruction(block) => block.is_instruction_match(src),
            Self::Context(block) => Ok(block.is_context_match(src)),
            Self::Combine {
                context,
                instruction,
            } => Ok(context.is_context_match(src) && instruction.is_instruction_match(src)?),
            Self::Or(members) => {
                for member in members {
                    if member.is_match(src)? {
                        return Ok(true);
                    }
                }
                Ok(false)
            }
        }
    }

    /// Write the pattern as its element form.
    pub fn encode(&self, encoder: &mut PackedEncoder) {
        match self {
            Self::Instruction(block) => {
                encoder.open_element(ELEM_INSTRUCT_PAT);
                block.encode(encoder);
                encoder.close_element(ELEM_INSTRUCT_PAT);
            }
            Self::Context(block) => {
                encoder.open_element(ELEM_CONTEXT_PAT);
                block.encode(encoder);
                encoder.close_element(ELEM_CONTEXT_PAT);
            }
            Self::Combine {
                context,
                instruction,
            } => {
                encoder.open_element(ELEM_COMBINE_PAT);
                encoder.open_element(ELEM_CONTEXT_PAT);
                context.encode(encoder);
                encoder.close_element(ELEM_CONTEXT_PAT);
                encoder.open_element(ELEM_INSTRUCT_PAT);
                instruction.encode(encoder);
                encoder.close_element(ELEM_INSTRUCT_PAT);
                encoder.close_element(ELEM_COMBINE_PAT);
            }
            Self::Or(members) => {
                encoder.open_element(ELEM_OR_PAT);
                for member in members {
                    member.encode(encoder);
                }
                encoder.close_element(ELEM_OR_PAT);
            }
        }
    }

    /// Decode any of the four pattern elements.
    pub(crate) fn decode(decoder: &mut PackedDecoder<'_>) -> Result<Self, Error> {
        let id = decoder
            .peek_element()
            .ok_or_else(|| Error::Format("expected a pattern element".into()))?;
        let res = match id {
            ELEM_INSTRUCT_PAT => {
                decoder.open_element(ELEM_INSTRUCT_PAT)?;
                let block = PatternBlock::decode(decoder)?;
                decoder.close_element(ELEM_INSTRUCT_PAT)?;
                Self::Instruction(block)
            }
            ELEM_CONTEXT_PAT => {
                decoder.open_element(ELEM_CONTEXT_PAT)?;
                let block = PatternBlock::decode(decoder)?;
                decoder.close_element(ELEM_CONTEXT_PAT)?;
                Self::Context(block)
            }
            ELEM_COMBINE_PAT => {
                decoder.open_element(ELEM_COMBINE_PAT)?;
                let context = {
                    decoder.open_element(ELEM_CONTEXT_PAT)?;
                    let block = PatternBlock::decode(decoder)?;
                    decoder.close_element(ELEM_CONTEXT_PAT)?;
                    block
                };
                let instruction = {
                    decoder.open_element(ELEM_INSTRUCT_PAT)?;
                    let block = PatternBlock::decode(decoder)?;
                    decoder.close_element(ELEM_INSTRUCT_PAT)?;
                    block
                };
                decoder.close_element(ELEM_COMBINE_PAT)?;
                Self::Combine {
                    context,
                    instruction,
                }
            }
            ELEM_OR_PAT => {
                decoder.open_element(ELEM_OR_PAT)?;
                let mut members = Vec::new();
                while matches!(
                    decoder.peek_element(),
                    Some(ELEM_INSTRUCT_PAT | ELEM_CONTEXT_PAT | ELEM_COMBINE_PAT)
                ) {
                    members.push(Self::decode(decoder)?);
                }
                decoder.close_element(ELEM_OR_PAT)?;
                if members.is_empty() {
                    return Err(Error::Format("or-pattern with no members".into()));
                }
                Self::Or(members)
            }
            other => {
                return Err(Error::Format(format!(
                    "element {other} is not a pattern"
                )));
            }
        };
        Ok(res)
    }

    fn align(left: &Self, right: &Self, sa: i64) -> (Self, Self) {
        let mut left = left.clone();
        let mut right = right.clone();
        if sa > 0 {
            right.shift_instruction(sa as usize);
        } else if sa < 0 {
            left.shift_instruction((-sa) as usize);
        }
        (left, right)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quickcheck::{Arbitrary, Gen};
    use quickcheck_macros::quickcheck;

    #[derive(Debug, Clone)]
    struct AnyBlock(PatternBlock);

    impl Arbitrary for AnyBlock {
        fn arbitrary(g: &mut Gen) -> Self {
            let words = usize::arbitrary(g) % 3;
            let offset = usize::arbitrary(g) % 8;
            let mut mask = Vec::new();
            let mut value = Vec::new();
            for _ in 0..words {
                let m = u32::arbitrary(g);
                mask.push(m);
                value.push(u32::arbitrary(g) & m);
            }
            AnyBlock(PatternBlock::new(offset, mask, value))
        }
    }

    #[quickcheck]
    fn normalize_is_idempotent(block: AnyBlock) -> bool {
        let mut again = block.0.clone();
        again.normalize();
        again == block.0
    }

    #[quickcheck]
    fn intersect_specializes_both_sides(a: AnyBlock, b: AnyBlock) -> bool {
        let meet = a.0.intersect(&b.0);
        meet.always_false() || (meet.specializes(&a.0) && meet.specializes(&b.0))
    }

    #[quickcheck]
    fn common_subpattern_is_generalization(a: AnyBlock, b: AnyBlock) -> bool {
        let join = a.0.common_subpattern(&b.0);
        if a.0.always_false() || b.0.always_false() {
            return true;
        }
        a.0.specializes(&join) && b.0.specializes(&join)
    }

    #[test]
    fn normalization_strips_zero_bytes() {
        let block = PatternBlock::new(0, vec![0x0000_ff00], vec![0x0000_1200]);
        assert_eq!(block.offset(), 2);
        assert_eq!(block.nonzero_size(), 1);
        assert_eq!(block.get_mask(16, 8), 0xff);
        assert_eq!(block.get_value(16, 8), 0x12);
    }

    #[test]
    fn conflicting_intersection_is_always_false() {
        let a = PatternBlock::from_word(0, 0xff00_0000, 0x1200_0000);
        let b = PatternBlock::from_word(0, 0xff00_0000, 0x3400_0000);
        assert!(a.intersect(&b).always_false());
    }

    #[test]
    fn disjoint_intersection_merges() {
        let a = PatternBlock::from_word(0, 0xff00_0000, 0x1200_0000);
        let b = PatternBlock::from_word(0, 0x00ff_0000, 0x0034_0000);
        let meet = a.intersect(&b);
        assert_eq!(meet.get_value(0, 16), 0x1234);
        assert!(meet.specializes(&a));
        assert!(meet.specializes(&b));
    }

    #[test]
    fn offset_blocks_intersect_across_words() {
        let a = PatternBlock::from_word(2, 0xffff_0000, 0xbeef_0000);
        let b = PatternBlock::from_word(0, 0xffff_0000, 0xdead_0000);
        let meet = a.intersect(&b);
        assert_eq!(meet.offset(), 0);
        assert_eq!(meet.get_value(0, 32), 0xdead_beef);
    }

    struct FixedBits {
        instruction: Vec<u8>,
        context: Vec<u8>,
    }

    impl BitSource for FixedBits {
        fn instruction_bits(&self, offset: usize, size: usize) -> Result<u32, Error> {
            Ok(read_bytes(&self.instruction, offset, size))
        }

        fn context_bits(&self, offset: usize, size: usize) -> u32 {
            read_bytes(&self.context, offset, size)
        }
    }

    fn read_bytes(bytes: &[u8], offset: usize, size: usize) -> u32 {
        let mut res: u32 = 0;
        for i in 0..size {
            let byte = bytes.get(offset + i).copied().unwrap_or(0);
            res = (res << 8) | u32::from(byte);
        }
        res << (8 * (4 - size))
    }

    #[test]
    fn instruction_match_compares_at_offset() {
        let src = FixedBits {
            instruction: vec![0x12, 0x34, 0x56, 0x78, 0x9a],
            context: vec![],
        };
        let hit = PatternBlock::from_word(1, 0xffff_0000, 0x3456_0000);
        let miss = PatternBlock::from_word(1, 0xffff_0000, 0x3457_0000);
        assert!(hit.is_instruction_match(&src).unwrap());
        assert!(!miss.is_instruction_match(&src).unwrap());
    }

    #[test]
    fn combine_requires_both_halves() {
        let src = FixedBits {
            instruction: vec![0xaa, 0x00, 0x00, 0x00],
            context: vec![0x80, 0x00, 0x00, 0x00],
        };
        let pattern = Pattern::Combine {
            context: PatternBlock::from_word(0, 0x8000_0000, 0x8000_0000),
            instruction: PatternBlock::from_word(0, 0xff00_0000, 0xaa00_0000),
        };
        assert!(pattern.is_match(&src).unwrap());
        let wrong_ctx = Pattern::Combine {
            context: PatternBlock::from_word(0, 0x8000_0000, 0x0000_0000),
            instruction: PatternBlock::from_word(0, 0xff00_0000, 0xaa00_0000),
        };
        assert!(!wrong_ctx.is_match(&src).unwrap());
    }

    #[test]
    fn and_distributes_over_or() {
        let a = Pattern::Instruction(PatternBlock::from_word(0, 0xf000_0000, 0x1000_0000));
        let b = Pattern::Instruction(PatternBlock::from_word(0, 0xf000_0000, 0x2000_0000));
        let either = Pattern::Or(vec![a.clone(), b.clone()]);
        let low = Pattern::Instruction(PatternBlock::from_word(0, 0x0f00_0000, 0x0300_0000));
        let combined = either.do_and(&low, 0);
        assert_eq!(combined.num_disjoint(), 2);
        assert!(!combined.always_false());
    }

    #[test]
    fn and_of_context_and_instruction_combines() {
        let ctx = Pattern::Context(PatternBlock::from_word(0, 0xff00_0000, 0x0100_0000));
        let ins = Pattern::Instruction(PatternBlock::from_word(0, 0xff00_0000, 0x0200_0000));
        match ctx.do_and(&ins, 0) {
            Pattern::Combine { .. } => {}
            other => panic!("expected combine, got {other:?}"),
        }
    }

    #[test]
    fn simplify_collapses_sentinels() {
        let or = Pattern::Or(vec![
            Pattern::always(false),
            Pattern::Instruction(PatternBlock::from_word(0, 0xff00_0000, 0x0100_0000)),
        ]);
        assert_eq!(or.simplify_clone().num_disjoint(), 1);

        let combine = Pattern::Combine {
            context: PatternBlock::always(true),
            instruction: PatternBlock::from_word(0, 0xff00_0000, 0x0100_0000),
        };
        assert!(matches!(combine.simplify_clone(), Pattern::Instruction(_)));
    }

    #[test]
    fn wire_form_round_trips() {
        let pattern = Pattern::Combine {
            context: PatternBlock::from_word(0, 0x8000_0000, 0x8000_0000),
            instruction: PatternBlock::from_word(2, 0xff00_0000, 0x1200_0000),
        };
        let mut enc = crate::sla::PackedEncoder::new();
        pattern.encode(&mut enc);
        let bytes = enc.finish();
        let mut dec = crate::sla::PackedDecoder::new(&bytes);
        let back = Pattern::decode(&mut dec).unwrap();
        assert_eq!(back, pattern);
    }

    #[test]
    fn or_shift_applies_to_right_side() {
        let a = Pattern::Instruction(PatternBlock::from_word(0, 0xff00_0000, 0x0100_0000));
        let b = Pattern::Instruction(PatternBlock::from_word(0, 0xff00_0000, 0x0200_0000));
        let or = a.do_or(&b, 2);
        let Pattern::Or(members) = or else {
            panic!("expected or");
        };
        let Pattern::Instruction(shifted) = &members[1] else {
            panic!("expected instruction member");
        };
        assert_eq!(shifted.offset(), 2);
    }
}
