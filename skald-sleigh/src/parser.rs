//! Per-instruction parse state and the walker over it.
//!
//! A [`ParserContext`] holds everything one instruction decode needs:
//! the instruction byte window, a copy of the context words, the tree
//! of constructor states, and the list of delayed context commits.
//! Contexts are recycled through a pool keyed by address; the walker
//! is the only way to traverse or mutate a context and there is
//! exactly one live walker at a time.

use std::sync::Arc;

use skald_pcode::{AddrSpace, Address};

use crate::error::Error;
use crate::pattern::BitSource;
use crate::symbols::{Constructor, SymbolId, SymbolTable};
use crate::template::FixedHandle;

/// Size of the instruction byte window.
pub const INSTRUCTION_WINDOW: usize = 16;

/// Maximum operand nesting depth of a single instruction.
const MAX_PARSE_DEPTH: usize = 64;

/// Number of pooled parser contexts; must be a power of two and
/// larger than the instruction window so that an instruction and its
/// delay slot never collide.
const POOL_WINDOW: usize = 32;

/// Lifecycle of a parser context.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ParserState {
    /// Slot not tied to an address.
    Uninitialized,
    /// Constructor tree resolved; print and length available.
    Disassembly,
    /// Handles resolved; ready for p-code emission.
    Pcode,
}

/// One node of the constructor tree.
#[derive(Debug, Clone, Default)]
pub struct ConstructState {
    /// Matched constructor; `None` for unresolved leaf operands.
    pub ct: Option<Arc<Constructor>>,
    /// Parent state index.
    pub parent: Option<usize>,
    /// Child state per operand.
    pub children: Vec<usize>,
    /// Byte offset within the instruction.
    pub offset: usize,
    /// Byte length of this subtree.
    pub length: usize,
    /// Resolved handle of the subtree's export.
    pub handle: Option<FixedHandle>,
}

/// A delayed context write registered during resolution.
#[derive(Debug, Clone)]
pub struct ContextSet {
    /// Symbol naming the target address.
    pub sym: SymbolId,
    /// State index at which the commit was registered.
    pub state: usize,
    /// Context word written.
    pub word: usize,
    /// Bits written.
    pub mask: u32,
    /// Value captured when the commit was registered.
    pub value: u32,
    /// Whether the value flows past the target address.
    pub flow: bool,
}

/// Complete parse state of one instruction.
#[derive(Debug, Clone)]
pub struct ParserContext {
    state: ParserState,
    addr: Option<Address>,
    naddr: Option<Address>,
    next2_addr: Option<Address>,
    buf: [u8; INSTRUCTION_WINDOW],
    context: Vec<u32>,
    commits: Vec<ContextSet>,
    states: Vec<ConstructState>,
    delay_slot_bytes: usize,
}

impl ParserContext {
    fn new() -> Self {
        Self {
            state: ParserState::Uninitialized,
            addr: None,
            naddr: None,
            next2_addr: None,
            buf: [0; INSTRUCTION_WINDOW],
            context: Vec::new(),
            commits: Vec::new(),
            states: Vec::new(),
            delay_slot_bytes: 0,
        }
    }

    /// Bind the context to an address with fresh bytes and context
    /// words, dropping any previous parse.
    pub fn initialize(&mut self, addr: Address, buf: [u8; INSTRUCTION_WINDOW], context: Vec<u32>) {
        self.state = ParserState::Uninitialized;
        self.addr = Some(addr);
        self.naddr = None;
        self.next2_addr = None;
        self.buf = buf;
        self.context = context;
        self.commits.clear();
        self.states.clear();
        self.states.push(ConstructState::default());
        self.delay_slot_bytes = 0;
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ParserState {
        self.state
    }

    pub(crate) fn set_state(&mut self, state: ParserState) {
        self.state = state;
    }

    /// Address the context is bound to.
    pub fn addr(&self) -> Option<&Address> {
        self.addr.as_ref()
    }

    /// Address after the instruction, once resolved.
    pub fn naddr(&self) -> Option<&Address> {
        self.naddr.as_ref()
    }

    pub(crate) fn set_naddr(&mut self, naddr: Address) {
        self.naddr = Some(naddr);
    }

    /// Resolved byte length of the instruction.
    pub fn length(&self) -> usize {
        self.states.first().map(|s| s.length).unwrap_or(0)
    }

    /// Deepest delay-slot byte count demanded by the instruction.
    pub fn delay_slot_bytes(&self) -> usize {
        self.delay_slot_bytes
    }

    pub(crate) fn set_delay_slot_bytes(&mut self, bytes: usize) {
        self.delay_slot_bytes = bytes;
    }

    /// The registered context commits.
    pub fn commits(&self) -> &[ContextSet] {
        &self.commits
    }

    /// The constructor-state arena.
    pub fn states(&self) -> &[ConstructState] {
        &self.states
    }

    /// A specific constructor state.
    pub fn state_at(&self, index: usize) -> Option<&ConstructState> {
        self.states.get(index)
    }
}

/// Recycling pool of parser contexts keyed by address.
#[derive(Debug)]
pub struct ParserPool {
    slots: Vec<Option<ParserContext>>,
}

impl Default for ParserPool {
    fn default() -> Self {
        Self::new()
    }
}

impl ParserPool {
    /// Create an empty pool.
    pub fn new() -> Self {
        let mut slots = Vec::with_capacity(POOL_WINDOW);
        slots.resize_with(POOL_WINDOW, || None);
        Self { slots }
    }

    fn slot_of(addr: &Address) -> usize {
        (addr.offset() as usize) & (POOL_WINDOW - 1)
    }

    /// Take the context for `addr` out of the pool.
    ///
    /// The slot is keyed by the low address bits; a slot holding a
    /// different address is evicted and handed back uninitialized, so
    /// the caller must check [`ParserContext::state`] before reuse.
    pub fn take(&mut self, addr: &Address) -> ParserContext {
        let slot = Self::slot_of(addr);
        let mut ctx = self.slots[slot].take().unwrap_or_else(ParserContext::new);
        if ctx.addr() != Some(addr) {
            ctx.state = ParserState::Uninitialized;
            ctx.addr = None;
        }
        ctx
    }

    /// Return a context to its slot.
    pub fn put_back(&mut self, ctx: ParserContext) {
        if let Some(addr) = ctx.addr() {
            let slot = Self::slot_of(addr);
            self.slots[slot] = Some(ctx);
        }
    }

    /// Drop all pooled state.
    pub fn reset(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
    }
}

/// Walker over one parser context.
///
/// Keeps the current tree position plus a breadcrumb of operand
/// indices, so resolution loops can descend into an operand and later
/// continue with the next sibling.
pub struct ParserWalker<'a> {
    ctx: &'a mut ParserContext,
    symbols: &'a SymbolTable,
    const_space: Arc<AddrSpace>,
    cur_space: Arc<AddrSpace>,
    point: Option<usize>,
    depth: usize,
    breadcrumb: [usize; MAX_PARSE_DEPTH],
}

impl<'a> ParserWalker<'a> {
    /// Create a walker positioned at the base state.
    pub fn new(
        ctx: &'a mut ParserContext,
        symbols: &'a SymbolTable,
        const_space: Arc<AddrSpace>,
        cur_space: Arc<AddrSpace>,
    ) -> Self {
        let mut walker = Self {
            ctx,
            symbols,
            const_space,
            cur_space,
            point: None,
            depth: 0,
            breadcrumb: [0; MAX_PARSE_DEPTH],
        };
        walker.base_state();
        walker
    }

    /// Reposition at the base (root) state.
    pub fn base_state(&mut self) {
        self.point = if self.ctx.states.is_empty() {
            None
        } else {
            Some(0)
        };
        self.depth = 0;
        self.breadcrumb[0] = 0;
    }

    /// Whether the walker is on a state.
    pub fn is_state(&self) -> bool {
        self.point.is_some()
    }

    /// Index of the current state in the arena.
    pub fn point_index(&self) -> Option<usize> {
        self.point
    }

    /// The symbol table the walker resolves against.
    pub fn symbols(&self) -> &'a SymbolTable {
        self.symbols
    }

    /// The constant space of the session.
    pub fn const_space(&self) -> Arc<AddrSpace> {
        Arc::clone(&self.const_space)
    }

    /// The space instructions are decoded in.
    pub fn cur_space(&self) -> Arc<AddrSpace> {
        Arc::clone(&self.cur_space)
    }

    /// Address of the instruction.
    pub fn addr(&self) -> &Address {
        self.ctx.addr.as_ref().expect("walker over unbound context")
    }

    /// Address after the instruction.
    ///
    /// During resolution this is computed on demand from the current
    /// root length; afterwards the stored value is used.
    pub fn naddr(&self) -> Address {
        match &self.ctx.naddr {
            Some(naddr) => naddr.clone(),
            None => self.addr().wrap_add(self.ctx.length() as u64),
        }
    }

    /// Address two instructions ahead, when the engine computed it.
    pub fn next2_addr(&self) -> Option<Address> {
        self.ctx.next2_addr.clone()
    }

    /// Resolved byte length of the instruction itself, excluding any
    /// delay-slot instructions folded into `naddr`.
    pub fn length(&self) -> usize {
        self.ctx.length()
    }

    /// Delay-slot byte count demanded by the instruction.
    pub fn delay_slot_bytes(&self) -> usize {
        self.ctx.delay_slot_bytes()
    }

    /// Record the address two instructions ahead for `next2` symbols;
    /// engines that model it call this before handle resolution.
    pub fn set_next2_addr(&mut self, addr: Address) {
        self.ctx.next2_addr = Some(addr);
    }

    /// Constructor of the current state.
    pub fn constructor(&self) -> Option<Arc<Constructor>> {
        self.point
            .and_then(|p| self.ctx.states[p].ct.clone())
    }

    /// Attach a constructor to the current state.
    pub fn set_constructor(&mut self, ct: Arc<Constructor>) {
        let point = self.point.expect("no current state");
        self.ctx.states[point].ct = Some(ct);
    }

    /// Next operand to process at the current level.
    pub fn operand(&self) -> usize {
        self.breadcrumb[self.depth]
    }

    /// Byte offset of the current state.
    pub fn offset(&self, base: Option<usize>) -> usize {
        let point = self.point.expect("no current state");
        match base {
            None => self.ctx.states[point].offset,
            Some(i) => {
                let child = self.ctx.states[point].children[i];
                self.ctx.states[child].offset + self.ctx.states[child].length
            }
        }
    }

    /// Set the byte offset of the current state.
    pub fn set_offset(&mut self, offset: usize) -> Result<(), Error> {
        if offset >= INSTRUCTION_WINDOW {
            return Err(Error::BadData {
                addr: self.addr().clone(),
            });
        }
        let point = self.point.expect("no current state");
        self.ctx.states[point].offset = offset;
        Ok(())
    }

    /// Record the resolved length of the current state.
    pub fn set_current_length(&mut self, length: usize) {
        let point = self.point.expect("no current state");
        self.ctx.states[point].length = length;
    }

    /// Compute the current state's length from its minimum length and
    /// the extents of its resolved operands.
    pub fn calc_current_length(&mut self, min_length: usize, num_operands: usize) {
        let point = self.point.expect("no current state");
        let offset = self.ctx.states[point].offset;
        let mut length = min_length + offset;
        for i in 0..num_operands {
            let child = self.ctx.states[point].children[i];
            let sub = self.ctx.states[child].offset + self.ctx.states[child].length;
            if sub > length {
                length = sub;
            }
        }
        self.ctx.states[point].length = length - offset;
    }

    /// Allocate the child state for operand `i` and descend into it.
    pub fn allocate_operand(&mut self, i: usize) -> Result<(), Error> {
        let point = self.point.expect("no current state");
        if self.depth + 1 >= MAX_PARSE_DEPTH {
            return Err(Error::LowLevel("operand nesting too deep".into()));
        }
        let child = self.ctx.states.len();
        self.ctx.states.push(ConstructState {
            parent: Some(point),
            ..ConstructState::default()
        });
        let children = &mut self.ctx.states[point].children;
        if children.len() <= i {
            children.resize(i + 1, usize::MAX);
        }
        children[i] = child;
        self.breadcrumb[self.depth] = i + 1;
        self.depth += 1;
        self.breadcrumb[self.depth] = 0;
        self.point = Some(child);
        Ok(())
    }

    /// Descend into the already-allocated child for operand `i`.
    pub fn push_operand(&mut self, i: usize) -> Result<(), Error> {
        let point = self.point.expect("no current state");
        if self.depth + 1 >= MAX_PARSE_DEPTH {
            return Err(Error::LowLevel("operand nesting too deep".into()));
        }
        let child = *self.ctx.states[point]
            .children
            .get(i)
            .filter(|&&c| c != usize::MAX)
            .ok_or_else(|| Error::LowLevel(format!("operand {i} was never allocated")))?;
        self.breadcrumb[self.depth] = i + 1;
        self.depth += 1;
        self.breadcrumb[self.depth] = 0;
        self.point = Some(child);
        Ok(())
    }

    /// Ascend to the parent state.
    pub fn pop_operand(&mut self) {
        let point = self.point.expect("no current state");
        self.point = self.ctx.states[point].parent;
        self.depth = self.depth.saturating_sub(1);
    }

    /// Handle resolved for the current state.
    pub fn handle(&self) -> Option<&FixedHandle> {
        self.point
            .and_then(|p| self.ctx.states[p].handle.as_ref())
    }

    /// Store the handle of the current state.
    pub fn set_handle(&mut self, handle: FixedHandle) {
        let point = self.point.expect("no current state");
        self.ctx.states[point].handle = Some(handle);
    }

    /// Handle of operand `i` of the current state.
    pub fn child_handle(&self, i: usize) -> Result<&FixedHandle, Error> {
        let point = self.point.expect("no current state");
        let child = *self.ctx.states[point]
            .children
            .get(i)
            .filter(|&&c| c != usize::MAX)
            .ok_or_else(|| Error::LowLevel(format!("operand {i} was never allocated")))?;
        self.ctx.states[child]
            .handle
            .as_ref()
            .ok_or_else(|| Error::LowLevel(format!("operand {i} has no resolved handle")))
    }

    /// One instruction byte at `offset` relative to the current state.
    pub fn instruction_byte(&self, offset: usize) -> Result<u8, Error> {
        let point = self.point.expect("no current state");
        let absolute = self.ctx.states[point].offset + offset;
        if absolute >= INSTRUCTION_WINDOW {
            return Err(Error::BadData {
                addr: self.addr().clone(),
            });
        }
        Ok(self.ctx.buf[absolute])
    }

    /// A bit field of the instruction relative to the current state.
    pub fn instruction_bit_range(&self, start_bit: u32, size: u32) -> Result<u32, Error> {
        let mut res: u32 = 0;
        for i in 0..size {
            let bit = start_bit + i;
            let byte = self.instruction_byte((bit / 8) as usize)?;
            res = (res << 1) | u32::from((byte >> (7 - bit % 8)) & 1);
        }
        Ok(res)
    }

    /// A bit field of the context words.
    pub fn context_bit_range(&self, start_bit: u32, size: u32) -> u32 {
        let mut res: u32 = 0;
        for i in 0..size {
            let bit = start_bit + i;
            let byte = self.context_byte((bit / 8) as usize);
            res = (res << 1) | u32::from((byte >> (7 - bit % 8)) & 1);
        }
        res
    }

    /// One byte of the packed context words.
    pub fn context_byte(&self, offset: usize) -> u8 {
        let word = offset / 4;
        let byte = offset % 4;
        self.ctx
            .context
            .get(word)
            .map(|w| (w >> (8 * (3 - byte))) as u8)
            .unwrap_or(0)
    }

    /// Rewrite bits of a local context word.
    pub fn set_context_word(&mut self, word: usize, value: u32, mask: u32) {
        if self.ctx.context.len() <= word {
            self.ctx.context.resize(word + 1, 0);
        }
        let current = self.ctx.context[word];
        self.ctx.context[word] = (current & !mask) | (value & mask);
    }

    /// Register a commit of the current value of context bits to the
    /// address named by `sym`.
    pub fn add_commit(&mut self, sym: SymbolId, word: usize, mask: u32, flow: bool) {
        let point = self.point.expect("no current state");
        let value = self.ctx.context.get(word).copied().unwrap_or(0) & mask;
        self.ctx.commits.push(ContextSet {
            sym,
            state: point,
            word,
            mask,
            value,
            flow,
        });
    }

    /// Evaluate the exported value of operand `index` of constructor
    /// `ct_index` of subtable `table`.
    ///
    /// The referenced constructor must be the current state's or its
    /// parent's; the operand's resolved state is used when it exists,
    /// otherwise a scratch state at the operand's declared offset.
    pub fn operand_value(
        &mut self,
        table: SymbolId,
        ct_index: usize,
        index: usize,
    ) -> Result<i64, Error> {
        let matches = |state: &ConstructState| {
            state
                .ct
                .as_ref()
                .is_some_and(|ct| ct.table == table && ct.index == ct_index)
        };
        let point = self.point.ok_or_else(|| {
            Error::LowLevel("operand value requested outside a parse".into())
        })?;
        let base = if matches(&self.ctx.states[point]) {
            point
        } else {
            self.ctx.states[point]
                .parent
                .filter(|&parent| matches(&self.ctx.states[parent]))
                .ok_or_else(|| Error::LowLevel("bad out of band state".into()))?
        };
        let ct = self.ctx.states[base].ct.clone().expect("matched above");
        let op_sym = self.symbols.operand(ct.operands[index])?;
        let expr = match &op_sym.def {
            crate::symbols::OperandDef::Expr(expr) => Some(Arc::clone(expr)),
            crate::symbols::OperandDef::Symbol(sym_id) => {
                self.symbols.get(*sym_id)?.pattern_value().cloned()
            }
            crate::symbols::OperandDef::None => None,
        };
        let Some(expr) = expr else {
            return Ok(0);
        };

        // Prefer the resolved child; otherwise synthesize the offset
        // from the operand declaration.
        let existing = self.ctx.states[base]
            .children
            .get(index)
            .copied()
            .filter(|&c| c != usize::MAX);
        let offset = match existing {
            Some(child) => self.ctx.states[child].offset,
            None => {
                let rel = match op_sym.offset_base {
                    None => self.ctx.states[base].offset,
                    Some(i) => {
                        let child = *self.ctx.states[base]
                            .children
                            .get(i)
                            .filter(|&&c| c != usize::MAX)
                            .ok_or_else(|| {
                                Error::LowLevel("operand base not yet resolved".into())
                            })?;
                        self.ctx.states[child].offset + self.ctx.states[child].length
                    }
                };
                rel + op_sym.rel_offset
            }
        };

        let scratch = self.ctx.states.len();
        self.ctx.states.push(ConstructState {
            ct: Some(Arc::clone(&ct)),
            parent: Some(base),
            offset,
            ..ConstructState::default()
        });
        let saved_point = self.point;
        let saved_depth = self.depth;
        self.point = Some(scratch);
        if self.depth + 1 < MAX_PARSE_DEPTH {
            self.depth += 1;
            self.breadcrumb[self.depth] = 0;
        }
        let res = expr.value(self);
        self.point = saved_point;
        self.depth = saved_depth;
        self.ctx.states.truncate(scratch);
        res
    }
}

impl BitSource for ParserWalker<'_> {
    fn instruction_bits(&self, offset: usize, size: usize) -> Result<u32, Error> {
        let point = self.point.expect("no current state");
        let absolute = self.ctx.states[point].offset + offset;
        if absolute >= INSTRUCTION_WINDOW {
            return Err(Error::BadData {
                addr: self.addr().clone(),
            });
        }
        let mut res: u32 = 0;
        for i in 0..size.min(4) {
            let byte = self
                .ctx
                .buf
                .get(absolute + i)
                .copied()
                .unwrap_or(0);
            res = (res << 8) | u32::from(byte);
        }
        Ok(res << (8 * (4 - size.min(4))))
    }

    fn context_bits(&self, offset: usize, size: usize) -> u32 {
        let mut res: u32 = 0;
        for i in 0..size.min(4) {
            res = (res << 8) | u32::from(self.context_byte(offset + i));
        }
        res << (8 * (4 - size.min(4)))
    }
}
