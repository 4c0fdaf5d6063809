//! The decoder engine.
//!
//! Owns the loaded specification, the context database, the parser
//! pool and the byte loader; translates `one_instruction(addr)` into
//! a p-code stream or an assembly line.

use std::sync::Arc;

use tracing::debug;

use skald_pcode::{
    AddrSpace, Address, AssemblyEmit, LoadImage, PcodeEmit, SpaceFlags, SpaceKind, SpaceManager,
};

use crate::builder::{PcodeCacher, SleighBuilder};
use crate::context::ContextDatabase;
use crate::error::Error;
use crate::parser::{ParserContext, ParserPool, ParserState, ParserWalker, INSTRUCTION_WINDOW};
use crate::sla;
use crate::sla::format::*;
use crate::sla::PackedDecoder;
use crate::symbols::{
    format_signed, Constructor, ContextChange, OperandDef, PrintPiece, Symbol, SymbolTable,
};
use crate::template::FixedHandle;

/// A loaded specification plus the mutable decode state of one
/// session.
pub struct Sleigh {
    spaces: SpaceManager,
    symbols: SymbolTable,
    context_db: ContextDatabase,
    pool: ParserPool,
    loader: Box<dyn LoadImage>,
    default_space: Arc<AddrSpace>,
    version: u64,
    big_endian: bool,
    alignment: u64,
    unique_base: u64,
    unique_mask: u64,
    max_delay: usize,
    num_sections: usize,
}

impl Sleigh {
    /// Load a compiled specification from raw file bytes.
    pub fn new(file_bytes: &[u8], loader: Box<dyn LoadImage>) -> Result<Self, Error> {
        let payload = sla::open_payload(file_bytes)?;
        let mut decoder = PackedDecoder::new(&payload);

        decoder.open_element(ELEM_SLEIGH)?;
        let version = decoder.read_uint(ATTRIB_VERSION)?;
        if !(MIN_SPEC_VERSION..=MAX_SPEC_VERSION).contains(&version) {
            return Err(Error::Format(format!(
                "specification version {version} outside supported range \
                 {MIN_SPEC_VERSION}..={MAX_SPEC_VERSION}"
            )));
        }
        let big_endian = decoder.read_bool(ATTRIB_BIGENDIAN)?;
        let alignment = decoder.read_uint_or(ATTRIB_ALIGN, 1)?.max(1);
        let unique_base = decoder.read_uint(ATTRIB_UNIQBASE)?;
        let unique_mask = decoder.read_uint_or(ATTRIB_UNIQMASK, 0)?;
        let max_delay = decoder.read_uint_or(ATTRIB_MAXDELAY, 0)? as usize;
        let num_sections = decoder.read_uint_or(ATTRIB_NUMSECTIONS, 0)? as usize;

        if decoder.peek_element() == Some(ELEM_SOURCEFILES) {
            decoder.open_element(ELEM_SOURCEFILES)?;
            while decoder.peek_element() == Some(ELEM_SOURCEFILE) {
                decoder.open_element(ELEM_SOURCEFILE)?;
                decoder.close_element(ELEM_SOURCEFILE)?;
            }
            decoder.close_element(ELEM_SOURCEFILES)?;
        }

        let (spaces, default_space) = decode_spaces(&mut decoder, big_endian)?;
        let symbols = SymbolTable::decode(&mut decoder, &spaces)?;
        decoder.close_element(ELEM_SLEIGH)?;

        let mut context_db = ContextDatabase::new();
        for (name, sym) in symbols.context_fields() {
            if let Symbol::ContextField { low, high, .. } = sym {
                context_db.register_variable(name, *low, *high)?;
            }
        }

        debug!(
            version,
            big_endian,
            alignment,
            num_sections,
            spaces = spaces.len(),
            "specification loaded"
        );

        Ok(Self {
            spaces,
            symbols,
            context_db,
            pool: ParserPool::new(),
            loader,
            default_space,
            version,
            big_endian,
            alignment,
            unique_base,
            unique_mask,
            max_delay,
            num_sections,
        })
    }

    /// Specification version carried in the stream.
    pub fn version(&self) -> u64 {
        self.version
    }

    /// Whether the processor is big endian.
    pub fn is_big_endian(&self) -> bool {
        self.big_endian
    }

    /// Instruction alignment in bytes.
    pub fn alignment(&self) -> u64 {
        self.alignment
    }

    /// Deepest delay slot any constructor declares.
    pub fn max_delay(&self) -> usize {
        self.max_delay
    }

    /// Number of named p-code sections.
    pub fn num_sections(&self) -> usize {
        self.num_sections
    }

    /// The address spaces of the session.
    pub fn spaces(&self) -> &SpaceManager {
        &self.spaces
    }

    /// The default load/store space.
    pub fn default_space(&self) -> Arc<AddrSpace> {
        Arc::clone(&self.default_space)
    }

    /// The loaded symbol tree.
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// The context database of the session.
    pub fn context(&self) -> &ContextDatabase {
        &self.context_db
    }

    /// Mutable access to the context database.
    pub fn context_mut(&mut self) -> &mut ContextDatabase {
        &mut self.context_db
    }

    /// Name of the user op `CALLOTHER` refers to by `index`.
    pub fn userop_name(&self, index: usize) -> Option<&str> {
        self.symbols.userop_name(index)
    }

    /// Set the default value of a named context variable.
    pub fn set_context_default(&mut self, name: &str, value: u32) -> Result<(), Error> {
        self.context_db.set_variable_default(name, value)?;
        Ok(())
    }

    /// Paint a named context variable starting at `addr`.
    pub fn set_context_variable(
        &mut self,
        name: &str,
        addr: &Address,
        value: u32,
    ) -> Result<(), Error> {
        self.context_db.set_variable(name, addr, value)?;
        Ok(())
    }

    /// Drop all cached per-instruction state.
    pub fn reset(&mut self) {
        self.pool.reset();
    }

    /// Decode one instruction, emitting its p-code, and return the
    /// fall-through byte count (instruction plus any delay slots).
    pub fn one_instruction(
        &mut self,
        emit: &mut dyn PcodeEmit,
        addr: &Address,
    ) -> Result<usize, Error> {
        self.check_alignment(addr)?;
        let mut ctx = self.obtain(addr, ParserState::Pcode)?;
        self.apply_commits(&ctx)?;

        let mut fall_offset = ctx.length();
        let delay_bytes = ctx.delay_slot_bytes();
        if delay_bytes > 0 {
            let mut byte_count = 0;
            while byte_count < delay_bytes {
                let delay_addr = addr.wrap_add(fall_offset as u64);
                let delay_ctx = self.obtain(&delay_addr, ParserState::Pcode)?;
                self.apply_commits(&delay_ctx)?;
                let len = delay_ctx.length();
                self.pool.put_back(delay_ctx);
                fall_offset += len;
                byte_count += len;
            }
            ctx.set_naddr(addr.wrap_add(fall_offset as u64));
        }

        let mut cacher = PcodeCacher::new();
        let build_res = {
            let Self {
                pool,
                symbols,
                spaces,
                unique_base,
                unique_mask,
                ..
            } = self;
            let const_space = spaces.constant_space();
            let unique_space = spaces
                .unique_space()
                .ok_or_else(|| Error::Format("specification has no unique space".into()))?;
            let mut walker = ParserWalker::new(
                &mut ctx,
                symbols,
                Arc::clone(&const_space),
                addr.space().clone(),
            );
            let mut builder = SleighBuilder::new(
                pool,
                &mut cacher,
                symbols,
                const_space,
                unique_space,
                *unique_base,
                *unique_mask,
                addr,
            );
            builder.build_main(&mut walker)
        };
        self.pool.put_back(ctx);
        build_res?;
        cacher.resolve_relatives()?;
        cacher.emit(addr, emit);
        Ok(fall_offset)
    }

    /// Disassemble one instruction, emitting its text, and return its
    /// byte length.
    pub fn print_assembly(
        &mut self,
        emit: &mut dyn AssemblyEmit,
        addr: &Address,
    ) -> Result<usize, Error> {
        self.check_alignment(addr)?;
        let mut ctx = self.obtain(addr, ParserState::Disassembly)?;
        let length = ctx.length();
        let print_res = {
            let Self {
                symbols, spaces, ..
            } = self;
            let mut walker = ParserWalker::new(
                &mut ctx,
                symbols,
                spaces.constant_space(),
                addr.space().clone(),
            );
            print_instruction(&mut walker)
        };
        self.pool.put_back(ctx);
        let (mnemonic, body) = print_res?;
        emit.dump(addr, &mnemonic, &body);
        Ok(length)
    }

    /// Byte length of the instruction at `addr` without emitting.
    pub fn instruction_length(&mut self, addr: &Address) -> Result<usize, Error> {
        self.check_alignment(addr)?;
        let ctx = self.obtain(addr, ParserState::Disassembly)?;
        let length = ctx.length();
        self.pool.put_back(ctx);
        Ok(length)
    }

    fn check_alignment(&self, addr: &Address) -> Result<(), Error> {
        if self.alignment > 1 && addr.offset() % self.alignment != 0 {
            return Err(Error::Unimplemented {
                addr: addr.clone(),
                length: 0,
            });
        }
        Ok(())
    }

    /// Take the parser context for `addr` from the pool, resolving it
    /// at least to `target`.
    fn obtain(&mut self, addr: &Address, target: ParserState) -> Result<ParserContext, Error> {
        let mut ctx = self.pool.take(addr);
        if ctx.state() == ParserState::Uninitialized {
            let buf = self.load_window(addr)?;
            let words = self.context_db.words_at(addr).to_vec();
            ctx.initialize(addr.clone(), buf, words);
            let res = self.resolve(&mut ctx, addr);
            if let Err(err) = res {
                self.pool.put_back(ctx);
                return Err(err);
            }
            ctx.set_state(ParserState::Disassembly);
        }
        if target == ParserState::Pcode && ctx.state() == ParserState::Disassembly {
            let res = self.resolve_handles(&mut ctx);
            if let Err(err) = res {
                self.pool.put_back(ctx);
                return Err(err);
            }
            ctx.set_state(ParserState::Pcode);
        }
        Ok(ctx)
    }

    /// Fill the instruction window, shrinking the request when the
    /// image ends inside it; the remainder is zero-filled.
    fn load_window(&self, addr: &Address) -> Result<[u8; INSTRUCTION_WINDOW], Error> {
        let mut size = INSTRUCTION_WINDOW;
        loop {
            let mut buf = [0u8; INSTRUCTION_WINDOW];
            match self.loader.load_fill(&mut buf[..size], addr) {
                Ok(()) => return Ok(buf),
                Err(err) => {
                    if size == 1 {
                        return Err(err.into());
                    }
                    size /= 2;
                }
            }
        }
    }

    /// Walk the constructor tree top-down, selecting a constructor at
    /// every subtable operand and applying context changes.
    fn resolve(&mut self, ctx: &mut ParserContext, addr: &Address) -> Result<(), Error> {
        let Self {
            symbols, spaces, ..
        } = self;
        let mut walker = ParserWalker::new(
            ctx,
            symbols,
            spaces.constant_space(),
            addr.space().clone(),
        );

        let root = symbols.root()?;
        let ct = root.resolve(&walker)?;
        walker.set_constructor(Arc::clone(&ct));
        apply_context(&mut walker, &ct)?;

        let mut delay_bytes = 0usize;
        'outer: while walker.is_state() {
            let ct = walker
                .constructor()
                .ok_or_else(|| Error::LowLevel("resolve lost its constructor".into()))?;
            let num_oper = ct.num_operands();
            let mut oper = walker.operand();
            while oper < num_oper {
                let op_sym = symbols.operand(ct.operands[oper])?;
                let base_off = walker.offset(op_sym.offset_base);
                let off = base_off + op_sym.rel_offset;
                walker.allocate_operand(oper)?;
                walker.set_offset(off)?;
                if let OperandDef::Symbol(def_id) = &op_sym.def {
                    if let Ok(subtable) = symbols.subtable(*def_id) {
                        let sub_ct = subtable.resolve(&walker)?;
                        walker.set_constructor(Arc::clone(&sub_ct));
                        apply_context(&mut walker, &sub_ct)?;
                        continue 'outer;
                    }
                }
                walker.set_current_length(op_sym.min_length);
                walker.pop_operand();
                oper = walker.operand();
            }
            walker.calc_current_length(ct.min_length, num_oper);
            walker.pop_operand();
            if let Some(tpl) = &ct.template {
                if tpl.delay_slot > 0 {
                    delay_bytes = delay_bytes.max(tpl.delay_slot);
                }
            }
        }

        drop(walker);
        ctx.set_delay_slot_bytes(delay_bytes);
        ctx.set_naddr(addr.wrap_add(ctx.length() as u64));
        Ok(())
    }

    /// Walk the resolved tree computing every operand's fixed handle.
    fn resolve_handles(&mut self, ctx: &mut ParserContext) -> Result<(), Error> {
        let Self {
            symbols, spaces, ..
        } = self;
        let addr_space = ctx
            .addr()
            .map(|a| a.space().clone())
            .ok_or_else(|| Error::LowLevel("handle resolution on unbound context".into()))?;
        let const_space = spaces.constant_space();
        let mut walker = ParserWalker::new(ctx, symbols, Arc::clone(&const_space), addr_space);

        'outer: while walker.is_state() {
            let ct = walker
                .constructor()
                .ok_or_else(|| Error::LowLevel("handle resolution lost its constructor".into()))?;
            let num_oper = ct.num_operands();
            let mut oper = walker.operand();
            while oper < num_oper {
                let op_sym = symbols.operand(ct.operands[oper])?;
                walker.push_operand(oper)?;
                match &op_sym.def {
                    OperandDef::Symbol(def_id) => {
                        if symbols.subtable(*def_id).is_ok() {
                            continue 'outer;
                        }
                        let hand = symbols.fixed_handle(*def_id, &mut walker)?;
                        walker.set_handle(hand);
                    }
                    OperandDef::Expr(expr) => {
                        let expr = Arc::clone(expr);
                        let value = expr.value(&mut walker)?;
                        walker.set_handle(FixedHandle::constant(
                            Arc::clone(&const_space),
                            value as u64,
                        ));
                    }
                    OperandDef::None => {
                        walker.set_handle(FixedHandle::constant(Arc::clone(&const_space), 0));
                    }
                }
                walker.pop_operand();
                oper = walker.operand();
            }
            if let Some(result) = ct.template.as_ref().and_then(|tpl| tpl.result.as_ref()) {
                let hand = result.fix(&walker)?;
                walker.set_handle(hand);
            }
            walker.pop_operand();
        }
        Ok(())
    }

    /// Write the context commits registered during resolution through
    /// to the database.
    fn apply_commits(&mut self, ctx: &ParserContext) -> Result<(), Error> {
        if ctx.commits().is_empty() {
            return Ok(());
        }
        let addr = ctx
            .addr()
            .cloned()
            .ok_or_else(|| Error::LowLevel("commits on unbound context".into()))?;
        let naddr = ctx.naddr().cloned().unwrap_or_else(|| addr.wrap_add(1));
        for set in ctx.commits() {
            let target = match self.symbols.get(set.sym)? {
                Symbol::Operand(op_sym) => {
                    let state = ctx
                        .state_at(set.state)
                        .ok_or_else(|| Error::LowLevel("commit names a lost state".into()))?;
                    let child = state
                        .children
                        .get(op_sym.index)
                        .copied()
                        .filter(|&c| c != usize::MAX)
                        .ok_or_else(|| {
                            Error::LowLevel("commit names an unresolved operand".into())
                        })?;
                    let hand = ctx
                        .state_at(child)
                        .and_then(|s| s.handle.as_ref())
                        .ok_or_else(|| {
                            Error::LowLevel("commit names an operand without a handle".into())
                        })?;
                    Address::new(hand.space.clone(), hand.offset_offset)
                }
                Symbol::Start { .. } => addr.clone(),
                Symbol::End { .. } => naddr.clone(),
                other => {
                    return Err(Error::LowLevel(format!(
                        "context commit through symbol `{}`",
                        other.name()
                    )));
                }
            };
            // A constant target means the address was computed
            // relative to the instruction; reinterpret it in the
            // instruction's own space.
            let target = if target.space().is_constant() {
                Address::new(addr.space().clone(), target.offset())
            } else {
                target
            };
            if set.flow {
                self.context_db.set_word(&target, set.word, set.mask, set.value);
            } else {
                let next = target.wrap_add(1);
                self.context_db
                    .set_word_region(&target, &next, set.word, set.mask, set.value);
            }
        }
        Ok(())
    }
}

fn decode_spaces(
    decoder: &mut PackedDecoder<'_>,
    big_endian: bool,
) -> Result<(SpaceManager, Arc<AddrSpace>), Error> {
    decoder.open_element(ELEM_SPACES)?;
    let default_name = decoder.read_string(ATTRIB_DEFAULTSPACE)?;
    let mut spaces = SpaceManager::new();
    loop {
        let (element, kind, extra) = match decoder.peek_element() {
            Some(ELEM_SPACE) => (ELEM_SPACE, SpaceKind::Processor, SpaceFlags::empty()),
            Some(ELEM_SPACE_UNIQUE) => (ELEM_SPACE_UNIQUE, SpaceKind::Internal, SpaceFlags::empty()),
            Some(ELEM_SPACE_OTHER) => (ELEM_SPACE_OTHER, SpaceKind::Processor, SpaceFlags::IS_OTHER),
            _ => break,
        };
        decoder.open_element(element)?;
        let name = decoder.read_string(ATTRIB_NAME)?;
        let index = decoder.read_uint(ATTRIB_INDEX)? as usize;
        let addr_size = decoder.read_uint(ATTRIB_SIZE)? as u32;
        let word_size = decoder.read_uint_or(ATTRIB_WORDSIZE, 1)? as u32;
        let delay = decoder.read_uint_or(ATTRIB_DELAY, 0)? as u32;
        let space_big_endian = if decoder.has_attr(ATTRIB_BIGENDIAN) {
            decoder.read_bool(ATTRIB_BIGENDIAN)?
        } else {
            big_endian
        };
        let physical = decoder.read_bool(ATTRIB_PHYSICAL)?;
        decoder.close_element(element)?;

        let mut flags = extra;
        if space_big_endian {
            flags |= SpaceFlags::BIG_ENDIAN;
        }
        if physical {
            flags |= SpaceFlags::HAS_PHYSICAL;
        }
        spaces.insert(AddrSpace::new(
            name, kind, index, addr_size, word_size, flags, delay,
        ))?;
    }
    decoder.close_element(ELEM_SPACES)?;
    spaces.set_default(&default_name)?;
    let default_space = spaces
        .by_name(&default_name)
        .ok_or_else(|| Error::Format(format!("default space `{default_name}` not declared")))?;
    Ok((spaces, default_space))
}

fn apply_context(walker: &mut ParserWalker<'_>, ct: &Arc<Constructor>) -> Result<(), Error> {
    for change in &ct.context_changes {
        match change {
            ContextChange::Op {
                word,
                shift,
                mask,
                expr,
            } => {
                let value = (expr.value(walker)? as u64 as u32).wrapping_shl(*shift);
                walker.set_context_word(*word, value, *mask);
            }
            ContextChange::Commit {
                sym,
                word,
                mask,
                flow,
            } => {
                walker.add_commit(*sym, *word, *mask, *flow);
            }
        }
    }
    Ok(())
}

/// Assemble the printed mnemonic and body of a resolved instruction.
fn print_instruction(walker: &mut ParserWalker<'_>) -> Result<(String, String), Error> {
    let mut mnemonic = String::new();
    print_mnemonic(walker, &mut mnemonic)?;
    let mut body = String::new();
    print_body(walker, &mut body)?;
    Ok((mnemonic, body))
}

fn print_mnemonic(walker: &mut ParserWalker<'_>, out: &mut String) -> Result<(), Error> {
    let ct = walker
        .constructor()
        .ok_or_else(|| Error::LowLevel("print on unresolved context".into()))?;
    if let Some(index) = ct.flow_through() {
        walker.push_operand(index)?;
        let res = if walker.constructor().is_some() {
            print_mnemonic(walker, out)
        } else {
            print_operand_leaf(walker, &ct, index, out)
        };
        walker.pop_operand();
        return res;
    }
    let end = ct.first_whitespace.unwrap_or(ct.pieces.len());
    for piece in &ct.pieces[..end] {
        print_piece(walker, &ct, piece, out)?;
    }
    Ok(())
}

fn print_body(walker: &mut ParserWalker<'_>, out: &mut String) -> Result<(), Error> {
    let ct = walker
        .constructor()
        .ok_or_else(|| Error::LowLevel("print on unresolved context".into()))?;
    if let Some(index) = ct.flow_through() {
        walker.push_operand(index)?;
        let res = if walker.constructor().is_some() {
            print_body(walker, out)
        } else {
            Ok(())
        };
        walker.pop_operand();
        return res;
    }
    let Some(split) = ct.first_whitespace else {
        return Ok(());
    };
    for piece in &ct.pieces[split + 1..] {
        print_piece(walker, &ct, piece, out)?;
    }
    Ok(())
}

fn print_piece(
    walker: &mut ParserWalker<'_>,
    ct: &Arc<Constructor>,
    piece: &PrintPiece,
    out: &mut String,
) -> Result<(), Error> {
    match piece {
        PrintPiece::Literal(text) => {
            out.push_str(text);
            Ok(())
        }
        PrintPiece::Operand(index) => print_operand(walker, ct, *index, out),
    }
}

fn print_operand(
    walker: &mut ParserWalker<'_>,
    ct: &Arc<Constructor>,
    index: usize,
    out: &mut String,
) -> Result<(), Error> {
    walker.push_operand(index)?;
    let res = match walker.constructor() {
        Some(sub_ct) => {
            // Sub-constructors print all their pieces in order.
            let mut inner = Ok(());
            for piece in &sub_ct.pieces {
                inner = print_piece(walker, &sub_ct, piece, out);
                if inner.is_err() {
                    break;
                }
            }
            inner
        }
        None => print_operand_leaf(walker, ct, index, out),
    };
    walker.pop_operand();
    res
}

/// Print an operand with no sub-constructor: the value of its
/// defining symbol or expression.
fn print_operand_leaf(
    walker: &mut ParserWalker<'_>,
    ct: &Arc<Constructor>,
    index: usize,
    out: &mut String,
) -> Result<(), Error> {
    let symbols = walker.symbols();
    let op_sym = symbols.operand(ct.operands[index])?;
    match &op_sym.def {
        OperandDef::Symbol(def_id) => {
            out.push_str(&symbols.print(*def_id, walker)?);
        }
        OperandDef::Expr(expr) => {
            let expr = Arc::clone(expr);
            out.push_str(&format_signed(expr.value(walker)?));
        }
        OperandDef::None => {}
    }
    Ok(())
}
