//! Template expansion into concrete p-code.
//!
//! The cacher batches one instruction's ops and relative-branch
//! fixups; the builder walks constructor templates, resolving
//! symbolic constants against the parse tree, splitting dynamic
//! operands into LOAD/STORE pairs, and recursing for delay slots and
//! cross-builds.

use std::sync::Arc;

use smallvec::SmallVec;

use skald_pcode::{calc_mask, AddrSpace, Address, OpCode, PcodeEmit, VarnodeData};

use crate::error::Error;
use crate::parser::{ParserPool, ParserState, ParserWalker};
use crate::symbols::{Constructor, OperandDef, SymbolTable};
use crate::template::{
    ConstTpl, ConstructTpl, FixedHandle, HandleField, HandleTpl, OpTpl, VarnodeTpl,
    DIRECTIVE_BUILD, DIRECTIVE_CROSSBUILD, DIRECTIVE_DELAY_SLOT, DIRECTIVE_LABEL,
};

/// One op being assembled by the cacher.
#[derive(Debug, Clone)]
pub struct PcodeData {
    /// Operation code.
    pub opcode: OpCode,
    /// Output slot.
    pub output: Option<VarnodeData>,
    /// Input slots.
    pub inputs: SmallVec<[VarnodeData; 4]>,
}

#[derive(Debug, Clone, Copy)]
struct RelativeRecord {
    op: usize,
    slot: usize,
}

/// Per-instruction batch of ops plus relative-label bookkeeping.
#[derive(Debug, Default)]
pub struct PcodeCacher {
    ops: Vec<PcodeData>,
    labels: Vec<Option<u64>>,
    label_refs: Vec<RelativeRecord>,
}

impl PcodeCacher {
    /// Create an empty cacher.
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop all batched state.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.labels.clear();
        self.label_refs.clear();
    }

    /// Number of ops batched so far.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the batch is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Append an op and return its index.
    pub fn allocate_instruction(&mut self, op: PcodeData) -> usize {
        self.ops.push(op);
        self.ops.len() - 1
    }

    /// Mutable access to a batched op.
    pub fn op_mut(&mut self, index: usize) -> &mut PcodeData {
        &mut self.ops[index]
    }

    /// Record that label `id` sits before the next op to be appended.
    pub fn add_label(&mut self, id: usize) {
        if self.labels.len() <= id {
            self.labels.resize(id + 1, None);
        }
        self.labels[id] = Some(self.ops.len() as u64);
    }

    /// Record that input `slot` of op `op` holds a label id in its
    /// offset and needs rewriting once all labels are placed.
    pub fn add_label_ref(&mut self, op: usize, slot: usize) {
        self.label_refs.push(RelativeRecord { op, slot });
    }

    /// Rewrite every label reference to a relative op distance,
    /// masked to the varnode's size.
    pub fn resolve_relatives(&mut self) -> Result<(), Error> {
        for record in &self.label_refs {
            let vn = &mut self.ops[record.op].inputs[record.slot];
            let id = vn.offset as usize;
            let target = self
                .labels
                .get(id)
                .copied()
                .flatten()
                .ok_or_else(|| {
                    Error::LowLevel(format!("reference to undefined p-code label {id}"))
                })?;
            vn.offset = target.wrapping_sub(record.op as u64) & calc_mask(vn.size);
        }
        Ok(())
    }

    /// Hand every batched op to `emit` against `base_addr`.
    pub fn emit(&self, base_addr: &Address, emit: &mut dyn PcodeEmit) {
        for op in &self.ops {
            emit.dump(base_addr, op.opcode, op.output.as_ref(), &op.inputs);
        }
    }
}

impl ConstTpl {
    /// Resolve to a concrete value against the parse tree.
    pub(crate) fn fix(&self, walker: &ParserWalker<'_>) -> Result<u64, Error> {
        match self {
            Self::Real(v) => Ok(*v),
            Self::Start => Ok(walker.addr().offset()),
            Self::Next => Ok(walker.naddr().offset()),
            Self::Next2 => walker
                .next2_addr()
                .map(|a| a.offset())
                .ok_or_else(|| Error::LowLevel("next2 address requested but not computed".into())),
            Self::CurSpace => Ok(walker.cur_space().index() as u64),
            Self::CurSpaceSize => Ok(u64::from(walker.cur_space().addr_size())),
            Self::SpaceId(space) => Ok(space.index() as u64),
            Self::Relative(label) => Ok(*label),
            Self::Handle { index, field } => {
                let hand = walker.child_handle(*index)?;
                Ok(match field {
                    HandleField::Space => {
                        let space = if hand.is_dynamic() {
                            hand.temp_space.as_ref().unwrap_or(&hand.space)
                        } else {
                            &hand.space
                        };
                        space.index() as u64
                    }
                    HandleField::Size => u64::from(hand.size),
                    HandleField::Offset => {
                        if hand.is_dynamic() {
                            hand.temp_offset
                        } else {
                            hand.offset_offset
                        }
                    }
                    HandleField::OffsetPlus(plus) => {
                        let base = if hand.is_dynamic() {
                            hand.temp_offset
                        } else {
                            hand.offset_offset
                        };
                        if hand.space.is_constant() {
                            // Constant operands truncate by shifting.
                            base >> (8 * (plus >> 16))
                        } else {
                            base.wrapping_add(plus & 0xffff)
                        }
                    }
                })
            }
            Self::FlowRef | Self::FlowDest => Err(Error::LowLevel(
                "flow reference outside a cross-build".into(),
            )),
        }
    }

    /// Resolve to a concrete space against the parse tree.
    pub(crate) fn fix_space(&self, walker: &ParserWalker<'_>) -> Result<Arc<AddrSpace>, Error> {
        match self {
            Self::SpaceId(space) => Ok(Arc::clone(space)),
            Self::CurSpace => Ok(walker.cur_space()),
            Self::Handle { index, field } => {
                if !matches!(field, HandleField::Space) {
                    return Err(Error::Format("handle constant is not a space".into()));
                }
                let hand = walker.child_handle(*index)?;
                if hand.is_dynamic() {
                    hand.temp_space
                        .clone()
                        .ok_or_else(|| Error::LowLevel("dynamic handle lacks a temporary".into()))
                } else {
                    Ok(Arc::clone(&hand.space))
                }
            }
            other => Err(Error::Format(format!(
                "constant template {other:?} is not a space"
            ))),
        }
    }
}

impl VarnodeTpl {
    /// Whether the slot refers through a dynamic handle.
    pub(crate) fn is_dynamic(&self, walker: &ParserWalker<'_>) -> Result<bool, Error> {
        match &self.offset {
            ConstTpl::Handle { index, field }
                if matches!(field, HandleField::Offset | HandleField::OffsetPlus(_)) =>
            {
                Ok(walker.child_handle(*index)?.is_dynamic())
            }
            _ => Ok(false),
        }
    }
}

impl HandleTpl {
    /// Resolve the exported handle of a constructor.
    pub(crate) fn fix(&self, walker: &ParserWalker<'_>) -> Result<FixedHandle, Error> {
        let space = self.space.fix_space(walker)?;
        let size = self.size.fix(walker)? as u32;
        if matches!(self.ptr_space, ConstTpl::Real(_)) {
            // Static export.
            let offset_offset = self.ptr_offset.fix(walker)?;
            let offset_offset = if space.is_constant() {
                offset_offset & calc_mask(size)
            } else {
                space.wrap_offset(offset_offset)
            };
            Ok(FixedHandle {
                space,
                size,
                offset_space: None,
                offset_offset,
                offset_size: 0,
                temp_space: None,
                temp_offset: 0,
            })
        } else {
            let offset_space = self.ptr_space.fix_space(walker)?;
            if offset_space.is_constant() {
                // The pointer collapsed to a constant: static after all.
                let offset = self.ptr_offset.fix(walker)? * u64::from(space.word_size());
                Ok(FixedHandle {
                    offset_offset: space.wrap_offset(offset),
                    space,
                    size,
                    offset_space: None,
                    offset_size: 0,
                    temp_space: None,
                    temp_offset: 0,
                })
            } else {
                Ok(FixedHandle {
                    space,
                    size,
                    offset_space: Some(offset_space),
                    offset_offset: self.ptr_offset.fix(walker)?,
                    offset_size: self.ptr_size.fix(walker)? as u32,
                    temp_space: Some(self.temp_space.fix_space(walker)?),
                    temp_offset: self.temp_offset.fix(walker)?,
                })
            }
        }
    }
}

/// Walks templates and fills the cacher for one instruction.
pub struct SleighBuilder<'a> {
    pool: &'a mut ParserPool,
    cache: &'a mut PcodeCacher,
    symbols: &'a SymbolTable,
    const_space: Arc<AddrSpace>,
    unique_space: Arc<AddrSpace>,
    unique_mask: u64,
    unique_base: u64,
    unique_offset: u64,
    temp_counter: u64,
    label_base: usize,
    label_count: usize,
}

impl<'a> SleighBuilder<'a> {
    /// Create a builder over the shared decode state.
    pub fn new(
        pool: &'a mut ParserPool,
        cache: &'a mut PcodeCacher,
        symbols: &'a SymbolTable,
        const_space: Arc<AddrSpace>,
        unique_space: Arc<AddrSpace>,
        unique_base: u64,
        unique_mask: u64,
        addr: &Address,
    ) -> Self {
        Self {
            pool,
            cache,
            symbols,
            const_space,
            unique_space,
            unique_mask,
            unique_base,
            unique_offset: salt_unique(addr, unique_mask),
            temp_counter: 0,
            label_base: 0,
            label_count: 0,
        }
    }

    /// Build the main section of the instruction under `walker`.
    pub fn build_main(&mut self, walker: &mut ParserWalker<'_>) -> Result<(), Error> {
        let ct = walker
            .constructor()
            .ok_or_else(|| Error::LowLevel("build on unresolved context".into()))?;
        let tpl = ct.template.clone().ok_or(Error::Unimplemented {
            addr: walker.addr().clone(),
            length: walker.length(),
        })?;
        self.build(walker, &tpl, None)
    }

    fn build(
        &mut self,
        walker: &mut ParserWalker<'_>,
        tpl: &ConstructTpl,
        section: Option<usize>,
    ) -> Result<(), Error> {
        let old_base = self.label_base;
        self.label_base = self.label_count;
        self.label_count += tpl.num_labels;

        for op in &tpl.ops {
            match op.opcode {
                DIRECTIVE_BUILD => self.append_build(walker, op, section)?,
                DIRECTIVE_DELAY_SLOT => self.delay_slot(walker)?,
                DIRECTIVE_LABEL => self.set_label(walker, op)?,
                DIRECTIVE_CROSSBUILD => self.append_cross_build(walker, op, section)?,
                _ => self.dump(walker, op)?,
            }
        }

        self.label_base = old_base;
        Ok(())
    }

    fn set_label(&mut self, walker: &mut ParserWalker<'_>, op: &OpTpl) -> Result<(), Error> {
        let input = op
            .inputs
            .first()
            .ok_or_else(|| Error::Format("label directive without an id".into()))?;
        let id = input.offset.fix(walker)? as usize + self.label_base;
        self.cache.add_label(id);
        Ok(())
    }

    fn append_build(
        &mut self,
        walker: &mut ParserWalker<'_>,
        op: &OpTpl,
        section: Option<usize>,
    ) -> Result<(), Error> {
        let input = op
            .inputs
            .first()
            .ok_or_else(|| Error::Format("build directive without an operand".into()))?;
        let index = input.offset.fix(walker)? as usize;
        let ct = walker
            .constructor()
            .ok_or_else(|| Error::LowLevel("build outside a constructor".into()))?;
        let symbols: &SymbolTable = self.symbols;
        let op_sym = symbols.operand(ct.operands[index])?;
        let sub_id = match &op_sym.def {
            OperandDef::Symbol(id) => *id,
            _ => return Ok(()),
        };
        if symbols.subtable(sub_id).is_err() {
            return Ok(());
        }
        walker.push_operand(index)?;
        let sub_ct = walker
            .constructor()
            .ok_or_else(|| Error::LowLevel("operand missing its constructor".into()))?;
        match section {
            Some(secnum) => match sub_ct.named_template(secnum) {
                Some(tpl) => {
                    let tpl = tpl.clone();
                    self.build(walker, &tpl, section)?;
                }
                None => self.build_empty(walker, &sub_ct, secnum)?,
            },
            None => {
                let tpl = sub_ct.template.clone().ok_or(Error::Unimplemented {
                    addr: walker.addr().clone(),
                    length: 0,
                })?;
                self.build(walker, &tpl, None)?;
            }
        }
        walker.pop_operand();
        Ok(())
    }

    /// Emit the named section of every subtable operand even though
    /// the constructor itself declares no ops for it.
    fn build_empty(
        &mut self,
        walker: &mut ParserWalker<'_>,
        ct: &Arc<Constructor>,
        secnum: usize,
    ) -> Result<(), Error> {
        let symbols: &SymbolTable = self.symbols;
        for index in 0..ct.num_operands() {
            let op_sym = symbols.operand(ct.operands[index])?;
            let sub_id = match &op_sym.def {
                OperandDef::Symbol(id) => *id,
                _ => continue,
            };
            if symbols.subtable(sub_id).is_err() {
                continue;
            }
            walker.push_operand(index)?;
            let sub_ct = walker
                .constructor()
                .ok_or_else(|| Error::LowLevel("operand missing its constructor".into()))?;
            match sub_ct.named_template(secnum) {
                Some(tpl) => {
                    let tpl = tpl.clone();
                    self.build(walker, &tpl, Some(secnum))?;
                }
                None => self.build_empty(walker, &sub_ct, secnum)?,
            }
            walker.pop_operand();
        }
        Ok(())
    }

    fn delay_slot(&mut self, walker: &mut ParserWalker<'_>) -> Result<(), Error> {
        let base_addr = walker.addr().clone();
        let delay_bytes = walker.delay_slot_bytes();
        let mut fall_offset = walker.length();
        let old_offset = self.unique_offset;
        let mut byte_count = 0;
        while byte_count < delay_bytes {
            let addr = base_addr.wrap_add(fall_offset as u64);
            self.unique_offset = salt_unique(&addr, self.unique_mask);
            let mut ctx = self.pool.take(&addr);
            if ctx.state() != ParserState::Pcode {
                self.pool.put_back(ctx);
                self.unique_offset = old_offset;
                return Err(Error::LowLevel(
                    "could not obtain cached delay-slot instruction".into(),
                ));
            }
            let length = ctx.length();
            let res = (|| {
                let mut sub_walker = ParserWalker::new(
                    &mut ctx,
                    self.symbols,
                    Arc::clone(&self.const_space),
                    walker.cur_space(),
                );
                let ct = sub_walker
                    .constructor()
                    .ok_or_else(|| Error::LowLevel("delay-slot context unresolved".into()))?;
                let tpl = ct.template.clone().ok_or(Error::Unimplemented {
                    addr: addr.clone(),
                    length,
                })?;
                self.build(&mut sub_walker, &tpl, None)
            })();
            self.pool.put_back(ctx);
            res?;
            fall_offset += length;
            byte_count += length;
        }
        self.unique_offset = old_offset;
        Ok(())
    }

    fn append_cross_build(
        &mut self,
        walker: &mut ParserWalker<'_>,
        op: &OpTpl,
        section: Option<usize>,
    ) -> Result<(), Error> {
        if section.is_some() {
            return Err(Error::LowLevel("cross-build recursion".into()));
        }
        let addr_vn = op
            .inputs
            .first()
            .ok_or_else(|| Error::Format("cross-build without an address".into()))?;
        let sec_vn = op
            .inputs
            .get(1)
            .ok_or_else(|| Error::Format("cross-build without a section".into()))?;
        let secnum = sec_vn.offset.fix(walker)? as usize;
        let space = addr_vn.space.fix_space(walker)?;
        let offset = space.wrap_offset(addr_vn.offset.fix(walker)?);
        let addr = Address::new(space, offset);

        let old_offset = self.unique_offset;
        self.unique_offset = salt_unique(&addr, self.unique_mask);
        let mut ctx = self.pool.take(&addr);
        if ctx.state() != ParserState::Pcode {
            self.pool.put_back(ctx);
            self.unique_offset = old_offset;
            return Err(Error::LowLevel(
                "could not obtain cached cross-build instruction".into(),
            ));
        }
        let res = (|| {
            let mut sub_walker = ParserWalker::new(
                &mut ctx,
                self.symbols,
                Arc::clone(&self.const_space),
                walker.cur_space(),
            );
            let ct = sub_walker
                .constructor()
                .ok_or_else(|| Error::LowLevel("cross-build context unresolved".into()))?;
            match ct.named_template(secnum) {
                Some(tpl) => {
                    let tpl = tpl.clone();
                    self.build(&mut sub_walker, &tpl, Some(secnum))
                }
                None => self.build_empty(&mut sub_walker, &ct, secnum),
            }
        })();
        self.pool.put_back(ctx);
        self.unique_offset = old_offset;
        res
    }

    fn dump(&mut self, walker: &mut ParserWalker<'_>, op: &OpTpl) -> Result<(), Error> {
        let opcode = op.real_opcode().ok_or_else(|| {
            Error::Format(format!("template op with unknown opcode {}", op.opcode))
        })?;

        let mut inputs: SmallVec<[VarnodeData; 4]> = SmallVec::new();
        for vn_tpl in &op.inputs {
            if vn_tpl.is_dynamic(walker)? {
                let temp = self.generate_location(walker, vn_tpl)?;
                let (pointer, load_space) = self.generate_pointer(walker, vn_tpl)?;
                let pointer = self.maybe_pointer_add(walker, vn_tpl, pointer)?;
                let space_const = self.space_constant(&load_space);
                self.cache.allocate_instruction(PcodeData {
                    opcode: OpCode::Load,
                    output: Some(temp.clone()),
                    inputs: SmallVec::from_vec(vec![space_const, pointer]),
                });
                inputs.push(temp);
            } else {
                inputs.push(self.generate_location(walker, vn_tpl)?);
            }
        }

        let relative_slot = op
            .inputs
            .first()
            .is_some_and(|vn| vn.offset.is_relative())
            .then_some(0usize);
        if relative_slot.is_some() {
            inputs[0].offset += self.label_base as u64;
        }

        let main_index = self.cache.allocate_instruction(PcodeData {
            opcode,
            output: None,
            inputs,
        });
        if let Some(slot) = relative_slot {
            self.cache.add_label_ref(main_index, slot);
        }

        if let Some(out_tpl) = &op.output {
            if out_tpl.is_dynamic(walker)? {
                let temp = self.generate_location(walker, out_tpl)?;
                self.cache.op_mut(main_index).output = Some(temp.clone());
                let (pointer, store_space) = self.generate_pointer(walker, out_tpl)?;
                let pointer = self.maybe_pointer_add(walker, out_tpl, pointer)?;
                let space_const = self.space_constant(&store_space);
                self.cache.allocate_instruction(PcodeData {
                    opcode: OpCode::Store,
                    output: None,
                    inputs: SmallVec::from_vec(vec![space_const, pointer, temp]),
                });
            } else {
                let out = self.generate_location(walker, out_tpl)?;
                self.cache.op_mut(main_index).output = Some(out);
            }
        }
        Ok(())
    }

    /// Concrete storage for a template slot; dynamic handles resolve
    /// to their temporary.
    fn generate_location(
        &mut self,
        walker: &ParserWalker<'_>,
        vn_tpl: &VarnodeTpl,
    ) -> Result<VarnodeData, Error> {
        let space = vn_tpl.space.fix_space(walker)?;
        let size = vn_tpl.size.fix(walker)? as u32;
        let raw = vn_tpl.offset.fix(walker)?;
        let offset = if space.is_constant() {
            raw & calc_mask(size)
        } else if space.is_internal() {
            raw | self.unique_offset
        } else {
            space.wrap_offset(raw)
        };
        Ok(VarnodeData::new(space, offset, size))
    }

    /// The pointer varnode of a dynamic slot, plus the space the
    /// pointer dereferences into.
    fn generate_pointer(
        &mut self,
        walker: &ParserWalker<'_>,
        vn_tpl: &VarnodeTpl,
    ) -> Result<(VarnodeData, Arc<AddrSpace>), Error> {
        let ConstTpl::Handle { index, .. } = &vn_tpl.offset else {
            return Err(Error::LowLevel("dynamic slot without a handle".into()));
        };
        let hand = walker.child_handle(*index)?;
        let space = hand
            .offset_space
            .clone()
            .ok_or_else(|| Error::LowLevel("dynamic handle lost its pointer".into()))?;
        let offset = if space.is_constant() {
            hand.offset_offset & calc_mask(hand.offset_size)
        } else {
            hand.offset_offset
        };
        let pointer = VarnodeData::new(space, offset, hand.offset_size);
        Ok((pointer, Arc::clone(&hand.space)))
    }

    /// Fold an `offset_plus` displacement into the pointer through an
    /// INT_ADD into a fresh temporary.
    fn maybe_pointer_add(
        &mut self,
        walker: &ParserWalker<'_>,
        vn_tpl: &VarnodeTpl,
        pointer: VarnodeData,
    ) -> Result<VarnodeData, Error> {
        let ConstTpl::Handle {
            field: HandleField::OffsetPlus(plus),
            index,
        } = &vn_tpl.offset
        else {
            return Ok(pointer);
        };
        let displacement = plus & 0xffff;
        if displacement == 0 {
            return Ok(pointer);
        }
        if walker.child_handle(*index)?.space.is_constant() {
            // Constant handles truncate inside the fix, not here.
            return Ok(pointer);
        }
        let sum = self.allocate_temp(pointer.size);
        let constant = VarnodeData::constant(
            Arc::clone(&self.const_space),
            displacement,
            pointer.size,
        );
        self.cache.allocate_instruction(PcodeData {
            opcode: OpCode::IntAdd,
            output: Some(sum.clone()),
            inputs: SmallVec::from_vec(vec![pointer, constant]),
        });
        Ok(sum)
    }

    fn allocate_temp(&mut self, size: u32) -> VarnodeData {
        let offset = self.unique_base + self.temp_counter * 16;
        self.temp_counter += 1;
        VarnodeData::new(
            Arc::clone(&self.unique_space),
            offset | self.unique_offset,
            size,
        )
    }

    fn space_constant(&self, space: &Arc<AddrSpace>) -> VarnodeData {
        VarnodeData::new(Arc::clone(&self.const_space), space.index() as u64, 8)
    }
}

/// Salt for unique-space offsets: the low address bits under the
/// specification's mask, shifted clear of the compiler's own offsets.
pub(crate) fn salt_unique(addr: &Address, unique_mask: u64) -> u64 {
    (addr.offset() & unique_mask) << 8
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_pcode::{SpaceKind, SpaceManager};

    fn constant_space() -> Arc<AddrSpace> {
        SpaceManager::new().constant_space()
    }

    fn op(cacher: &mut PcodeCacher, opcode: OpCode, inputs: Vec<VarnodeData>) -> usize {
        cacher.allocate_instruction(PcodeData {
            opcode,
            output: None,
            inputs: SmallVec::from_vec(inputs),
        })
    }

    #[test]
    fn labels_resolve_to_relative_distances() {
        let spc = constant_space();
        let mut cacher = PcodeCacher::new();

        // op0: branch to label 0 (defined before op2)
        let branch = op(
            &mut cacher,
            OpCode::Branch,
            vec![VarnodeData::constant(Arc::clone(&spc), 0, 4)],
        );
        cacher.add_label_ref(branch, 0);
        op(&mut cacher, OpCode::Copy, vec![]);
        cacher.add_label(0);
        op(&mut cacher, OpCode::Copy, vec![]);

        cacher.resolve_relatives().unwrap();
        assert_eq!(cacher.ops[branch].inputs[0].offset, 2);
    }

    #[test]
    fn backward_labels_wrap_by_size() {
        let spc = constant_space();
        let mut cacher = PcodeCacher::new();

        cacher.add_label(0);
        op(&mut cacher, OpCode::Copy, vec![]);
        let branch = op(
            &mut cacher,
            OpCode::Branch,
            vec![VarnodeData::constant(Arc::clone(&spc), 0, 4)],
        );
        cacher.add_label_ref(branch, 0);

        cacher.resolve_relatives().unwrap();
        // Label sits one op behind the branch: -1 masked to 4 bytes.
        assert_eq!(cacher.ops[branch].inputs[0].offset, 0xffff_ffff);
    }

    #[test]
    fn undefined_label_is_an_error() {
        let spc = constant_space();
        let mut cacher = PcodeCacher::new();
        let branch = op(
            &mut cacher,
            OpCode::Branch,
            vec![VarnodeData::constant(Arc::clone(&spc), 7, 4)],
        );
        cacher.add_label_ref(branch, 0);
        assert!(cacher.resolve_relatives().is_err());
    }

    #[test]
    fn unique_salt_follows_address_bits() {
        let mut manager = SpaceManager::new();
        let ram = manager
            .insert(AddrSpace::new(
                "ram",
                SpaceKind::Processor,
                1,
                4,
                1,
                skald_pcode::SpaceFlags::empty(),
                0,
            ))
            .unwrap();
        let a = Address::new(Arc::clone(&ram), 0x1234);
        let b = Address::new(Arc::clone(&ram), 0x1238);
        let mask = 0xff;
        assert_ne!(salt_unique(&a, mask), salt_unique(&b, mask));
        assert_eq!(salt_unique(&a, mask), 0x34 << 8);
    }
}
