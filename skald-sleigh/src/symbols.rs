//! The symbol tree of a loaded specification.
//!
//! Symbols are decoded once and shared immutable across every
//! instruction decode. A subtable owns its constructors and the
//! decision tree that selects among them; operands link constructors
//! to sub-symbols or defining expressions.

use std::sync::Arc;

use hashbrown::HashMap;

use skald_pcode::{SpaceManager, VarnodeData};

use crate::error::Error;
use crate::expression::PatternExpression;
use crate::parser::ParserWalker;
use crate::pattern::Pattern;
use crate::sla::format::*;
use crate::sla::PackedDecoder;
use crate::template::{ConstructTpl, FixedHandle};

/// Identifier of a symbol within one specification.
pub type SymbolId = u32;

/// One piece of a constructor's print template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PrintPiece {
    /// Literal text.
    Literal(String),
    /// The printed form of operand `n`.
    Operand(usize),
}

/// A context mutation embedded in a constructor.
#[derive(Debug, Clone)]
pub enum ContextChange {
    /// Rewrite bits of the local context words during resolution.
    Op {
        /// Target word.
        word: usize,
        /// Left shift applied to the computed value.
        shift: u32,
        /// Bits rewritten.
        mask: u32,
        /// Value producer.
        expr: Arc<PatternExpression>,
    },
    /// Commit bits through to the context database at an address
    /// named by a symbol, after the instruction resolves.
    Commit {
        /// Symbol naming the target address.
        sym: SymbolId,
        /// Target word.
        word: usize,
        /// Bits committed.
        mask: u32,
        /// Whether the committed value flows to later addresses.
        flow: bool,
    },
}

/// A production of the decoding grammar.
#[derive(Debug, Clone)]
pub struct Constructor {
    /// Owning subtable.
    pub table: SymbolId,
    /// Index within the owning subtable.
    pub index: usize,
    /// Operand symbol ids in declaration order.
    pub operands: Vec<SymbolId>,
    /// Smallest number of bytes the constructor can match.
    pub min_length: usize,
    /// Print pieces; the mnemonic ends at `first_whitespace`.
    pub pieces: Vec<PrintPiece>,
    /// Index of the separating literal between mnemonic and body.
    pub first_whitespace: Option<usize>,
    /// Context mutations applied when the constructor matches.
    pub context_changes: Vec<ContextChange>,
    /// Main p-code template; absent means unimplemented semantics.
    pub template: Option<ConstructTpl>,
    /// Named-section templates, indexed by section id.
    pub named_templates: Vec<Option<ConstructTpl>>,
    /// Source line for diagnostics.
    pub line: u32,
}

impl Constructor {
    /// Number of operands.
    pub fn num_operands(&self) -> usize {
        self.operands.len()
    }

    /// The template of a named section, when present.
    pub fn named_template(&self, section: usize) -> Option<&ConstructTpl> {
        self.named_templates.get(section).and_then(Option::as_ref)
    }

    /// Whether printing delegates entirely to a lone operand.
    pub fn flow_through(&self) -> Option<usize> {
        if self.pieces.is_empty() && self.operands.len() == 1 {
            Some(0)
        } else {
            None
        }
    }
}

/// Decision-tree node selecting a constructor within a subtable.
#[derive(Debug, Clone)]
pub struct DecisionNode {
    /// Whether the split examines context bits or instruction bits.
    pub context: bool,
    /// First bit of the split field.
    pub start_bit: u32,
    /// Number of bits examined; 0 marks a leaf.
    pub size: u32,
    /// Leaf alternatives: pattern plus constructor index.
    pub patterns: Vec<(Pattern, usize)>,
    /// Child nodes, one per field value.
    pub children: Vec<DecisionNode>,
}

impl DecisionNode {
    /// Select the constructor matching at the walker position.
    pub fn resolve(&self, walker: &ParserWalker<'_>) -> Result<usize, Error> {
        if self.size == 0 {
            for (pattern, index) in &self.patterns {
                if pattern.is_match(walker)? {
                    return Ok(*index);
                }
            }
            return Err(Error::BadData {
                addr: walker.addr().clone(),
            });
        }
        let value = if self.context {
            walker.context_bit_range(self.start_bit, self.size)
        } else {
            walker.instruction_bit_range(self.start_bit, self.size)?
        } as usize;
        let child = self.children.get(value).ok_or_else(|| Error::BadData {
            addr: walker.addr().clone(),
        })?;
        child.resolve(walker)
    }

    fn decode(decoder: &mut PackedDecoder<'_>) -> Result<Self, Error> {
        decoder.open_element(ELEM_DECISION)?;
        let context = decoder.read_bool(ATTRIB_CONTEXT)?;
        let start_bit = decoder.read_uint_or(ATTRIB_STARTBIT, 0)? as u32;
        let size = decoder.read_uint_or(ATTRIB_SIZE, 0)? as u32;
        let mut patterns = Vec::new();
        let mut children = Vec::new();
        loop {
            match decoder.peek_element() {
                Some(ELEM_PAIR) => {
                    decoder.open_element(ELEM_PAIR)?;
                    let index = decoder.read_uint(ATTRIB_ID)? as usize;
                    let pattern = Pattern::decode(decoder)?;
                    decoder.close_element(ELEM_PAIR)?;
                    patterns.push((pattern, index));
                }
                Some(ELEM_DECISION) => children.push(Self::decode(decoder)?),
                _ => break,
            }
        }
        decoder.close_element(ELEM_DECISION)?;
        if size > 0 && children.len() != 1usize << size {
            return Err(Error::Format(format!(
                "decision on {size} bits needs {} children, found {}",
                1usize << size,
                children.len()
            )));
        }
        Ok(Self {
            context,
            start_bit,
            size,
            patterns,
            children,
        })
    }
}

/// A subtable: constructors plus their decision tree.
#[derive(Debug, Clone)]
pub struct SubtableSymbol {
    /// Symbol name.
    pub name: String,
    /// Constructors in declaration order.
    pub constructors: Vec<Arc<Constructor>>,
    /// Selection tree.
    pub decision: DecisionNode,
}

impl SubtableSymbol {
    /// Select the constructor matching at the walker position.
    pub fn resolve(&self, walker: &ParserWalker<'_>) -> Result<Arc<Constructor>, Error> {
        let index = self.decision.resolve(walker)?;
        self.constructors
            .get(index)
            .cloned()
            .ok_or_else(|| Error::Format(format!("decision tree names constructor {index}")))
    }
}

/// What defines an operand's value.
#[derive(Debug, Clone, Default)]
pub enum OperandDef {
    /// Purely structural; exports nothing.
    #[default]
    None,
    /// Defined by another symbol (subtable, varnode, value, ...).
    Symbol(SymbolId),
    /// Defined by an expression over instruction/context bits.
    Expr(Arc<PatternExpression>),
}

/// An operand position of a constructor.
#[derive(Debug, Clone)]
pub struct OperandSymbol {
    /// Symbol name.
    pub name: String,
    /// Operand index within its constructor.
    pub index: usize,
    /// Byte offset relative to the base operand (or constructor start).
    pub rel_offset: usize,
    /// Operand whose end this operand's offset is measured from.
    pub offset_base: Option<usize>,
    /// Smallest byte length of the operand.
    pub min_length: usize,
    /// Value definition.
    pub def: OperandDef,
}

/// A runtime symbol of the loaded specification.
#[derive(Debug, Clone)]
pub enum Symbol {
    /// User-defined operation referenced by `CALLOTHER`.
    UserOp {
        /// Symbol name.
        name: String,
        /// Index carried in the op's first input.
        index: usize,
    },
    /// The empty pattern; exports constant zero.
    Epsilon {
        /// Symbol name.
        name: String,
    },
    /// Field exporting its numeric value.
    Value {
        /// Symbol name.
        name: String,
        /// Field producer.
        pattern: Arc<PatternExpression>,
    },
    /// Field mapped through a lookup table.
    ValueMap {
        /// Symbol name.
        name: String,
        /// Index producer.
        pattern: Arc<PatternExpression>,
        /// Value table; `i64::MIN` marks holes.
        table: Vec<i64>,
    },
    /// Field printed through a name list.
    NameList {
        /// Symbol name.
        name: String,
        /// Index producer.
        pattern: Arc<PatternExpression>,
        /// Printed names; empty strings mark holes.
        names: Vec<String>,
    },
    /// A fixed register or memory slot.
    Varnode {
        /// Symbol name.
        name: String,
        /// The slot.
        vn: VarnodeData,
    },
    /// Field selecting among varnode symbols.
    VarnodeList {
        /// Symbol name.
        name: String,
        /// Index producer.
        pattern: Arc<PatternExpression>,
        /// Selected varnode symbol ids; `None` marks holes.
        list: Vec<Option<SymbolId>>,
    },
    /// A context-register field.
    ContextField {
        /// Symbol name.
        name: String,
        /// Field producer.
        pattern: Arc<PatternExpression>,
        /// Backing varnode symbol.
        varnode: SymbolId,
        /// Low bit within the context blob.
        low: u32,
        /// High bit within the context blob.
        high: u32,
        /// Whether painted values flow to later addresses.
        flow: bool,
    },
    /// Operand of a constructor.
    Operand(OperandSymbol),
    /// The current instruction's address.
    Start {
        /// Symbol name.
        name: String,
    },
    /// The next instruction's address.
    End {
        /// Symbol name.
        name: String,
    },
    /// The address two instructions ahead.
    Next2 {
        /// Symbol name.
        name: String,
    },
    /// A table of constructors.
    Subtable(SubtableSymbol),
    /// Destination reference of an indirect flow.
    FlowDest {
        /// Symbol name.
        name: String,
    },
    /// Source reference of an indirect flow.
    FlowRef {
        /// Symbol name.
        name: String,
    },
}

impl Symbol {
    /// Name of the symbol.
    pub fn name(&self) -> &str {
        match self {
            Self::UserOp { name, .. }
            | Self::Epsilon { name }
            | Self::Value { name, .. }
            | Self::ValueMap { name, .. }
            | Self::NameList { name, .. }
            | Self::Varnode { name, .. }
            | Self::VarnodeList { name, .. }
            | Self::ContextField { name, .. }
            | Self::Start { name }
            | Self::End { name }
            | Self::Next2 { name }
            | Self::FlowDest { name }
            | Self::FlowRef { name } => name,
            Self::Operand(op) => &op.name,
            Self::Subtable(table) => &table.name,
        }
    }

    /// The expression producing this symbol's numeric value, if any.
    pub fn pattern_value(&self) -> Option<&Arc<PatternExpression>> {
        match self {
            Self::Value { pattern, .. }
            | Self::ValueMap { pattern, .. }
            | Self::NameList { pattern, .. }
            | Self::VarnodeList { pattern, .. }
            | Self::ContextField { pattern, .. } => Some(pattern),
            _ => None,
        }
    }
}

/// The full symbol tree.
#[derive(Debug, Clone, Default)]
pub struct SymbolTable {
    symbols: Vec<Option<Symbol>>,
    by_name: HashMap<String, SymbolId>,
    root: Option<SymbolId>,
    userops: Vec<SymbolId>,
}

impl SymbolTable {
    /// Look up a symbol by id.
    pub fn get(&self, id: SymbolId) -> Result<&Symbol, Error> {
        self.symbols
            .get(id as usize)
            .and_then(Option::as_ref)
            .ok_or_else(|| Error::Format(format!("reference to unknown symbol {id}")))
    }

    /// Look up a symbol by name.
    pub fn find(&self, name: &str) -> Option<&Symbol> {
        self.by_name.get(name).and_then(|id| self.get(*id).ok())
    }

    /// The root instruction subtable.
    pub fn root(&self) -> Result<&SubtableSymbol, Error> {
        let id = self
            .root
            .ok_or_else(|| Error::Format("specification has no instruction table".into()))?;
        self.subtable(id)
    }

    /// Fetch symbol `id`, requiring a subtable.
    pub fn subtable(&self, id: SymbolId) -> Result<&SubtableSymbol, Error> {
        match self.get(id)? {
            Symbol::Subtable(table) => Ok(table),
            other => Err(Error::Format(format!(
                "symbol `{}` is not a subtable",
                other.name()
            ))),
        }
    }

    /// Fetch symbol `id`, requiring an operand.
    pub fn operand(&self, id: SymbolId) -> Result<&OperandSymbol, Error> {
        match self.get(id)? {
            Symbol::Operand(op) => Ok(op),
            other => Err(Error::Format(format!(
                "symbol `{}` is not an operand",
                other.name()
            ))),
        }
    }

    /// Name of user op `index`, as referenced by `CALLOTHER`.
    pub fn userop_name(&self, index: usize) -> Option<&str> {
        let id = *self.userops.get(index)?;
        self.get(id).ok().map(Symbol::name)
    }

    /// Number of registered user ops.
    pub fn num_userops(&self) -> usize {
        self.userops.len()
    }

    /// Iterate over all context-field symbols.
    pub fn context_fields(&self) -> impl Iterator<Item = (&str, &Symbol)> {
        self.symbols
            .iter()
            .flatten()
            .filter(|sym| matches!(sym, Symbol::ContextField { .. }))
            .map(|sym| (sym.name(), sym))
    }

    /// The fixed handle a defining symbol exports for an operand.
    pub fn fixed_handle(
        &self,
        id: SymbolId,
        walker: &mut ParserWalker<'_>,
    ) -> Result<FixedHandle, Error> {
        match self.get(id)? {
            Symbol::Varnode { vn, .. } => {
                Ok(FixedHandle::fixed(vn.space.clone(), vn.offset, vn.size))
            }
            Symbol::Epsilon { .. } => Ok(FixedHandle::constant(walker.const_space(), 0)),
            Symbol::VarnodeList { pattern, list, .. } => {
                let index = pattern.clone().value(walker)?;
                let vn_id = list
                    .get(index as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| Error::BadData {
                        addr: walker.addr().clone(),
                    })?;
                self.fixed_handle(vn_id, walker)
            }
            Symbol::Start { .. } => {
                let offset = walker.addr().offset();
                let mut hand = FixedHandle::constant(walker.const_space(), offset);
                hand.size = walker.cur_space().addr_size();
                Ok(hand)
            }
            Symbol::End { .. } => {
                let offset = walker.naddr().offset();
                let mut hand = FixedHandle::constant(walker.const_space(), offset);
                hand.size = walker.cur_space().addr_size();
                Ok(hand)
            }
            Symbol::Next2 { .. } => {
                let offset = walker
                    .next2_addr()
                    .ok_or_else(|| {
                        Error::LowLevel("next2 address requested but not computed".into())
                    })?
                    .offset();
                let mut hand = FixedHandle::constant(walker.const_space(), offset);
                hand.size = walker.cur_space().addr_size();
                Ok(hand)
            }
            sym => {
                let pattern = sym.pattern_value().cloned().ok_or_else(|| {
                    Error::Format(format!("symbol `{}` exports no value", sym.name()))
                })?;
                let value = self.apply_value_map(id, pattern.value(walker)?, walker)?;
                Ok(FixedHandle::constant(walker.const_space(), value as u64))
            }
        }
    }

    /// The printed form of a defining symbol at the walker position.
    pub fn print(&self, id: SymbolId, walker: &mut ParserWalker<'_>) -> Result<String, Error> {
        match self.get(id)? {
            Symbol::Varnode { name, .. } => Ok(name.clone()),
            Symbol::Epsilon { .. } => Ok("0".into()),
            Symbol::Value { pattern, .. } | Symbol::ContextField { pattern, .. } => {
                Ok(format_signed(pattern.clone().value(walker)?))
            }
            Symbol::ValueMap { pattern, table, .. } => {
                let index = pattern.clone().value(walker)?;
                let value =
                    table
                        .get(index as usize)
                        .copied()
                        .ok_or_else(|| Error::BadData {
                            addr: walker.addr().clone(),
                        })?;
                Ok(format_signed(value))
            }
            Symbol::NameList { pattern, names, .. } => {
                let index = pattern.clone().value(walker)?;
                let name = names.get(index as usize).ok_or_else(|| Error::BadData {
                    addr: walker.addr().clone(),
                })?;
                if name.is_empty() {
                    return Err(Error::BadData {
                        addr: walker.addr().clone(),
                    });
                }
                Ok(name.clone())
            }
            Symbol::VarnodeList { pattern, list, .. } => {
                let index = pattern.clone().value(walker)?;
                let vn_id = list
                    .get(index as usize)
                    .copied()
                    .flatten()
                    .ok_or_else(|| Error::BadData {
                        addr: walker.addr().clone(),
                    })?;
                Ok(self.get(vn_id)?.name().into())
            }
            Symbol::Start { .. } => Ok(format!("{:#x}", walker.addr().offset())),
            Symbol::End { .. } => Ok(format!("{:#x}", walker.naddr().offset())),
            Symbol::Next2 { .. } => walker
                .next2_addr()
                .map(|addr| format!("{:#x}", addr.offset()))
                .ok_or_else(|| {
                    Error::LowLevel("next2 address requested but not computed".into())
                }),
            sym => Err(Error::Format(format!(
                "symbol `{}` has no printed form",
                sym.name()
            ))),
        }
    }

    fn apply_value_map(
        &self,
        id: SymbolId,
        raw: i64,
        walker: &ParserWalker<'_>,
    ) -> Result<i64, Error> {
        match self.get(id)? {
            Symbol::ValueMap { table, .. } => {
                table
                    .get(raw as usize)
                    .copied()
                    .filter(|v| *v != i64::MIN)
                    .ok_or_else(|| Error::BadData {
                        addr: walker.addr().clone(),
                    })
            }
            _ => Ok(raw),
        }
    }

    /// Decode the `<symbol_table>` element.
    pub(crate) fn decode(
        decoder: &mut PackedDecoder<'_>,
        spaces: &SpaceManager,
    ) -> Result<Self, Error> {
        decoder.open_element(ELEM_SYMBOL_TABLE)?;
        let mut table = Self::default();

        while decoder.peek_element() == Some(ELEM_SCOPE) {
            decoder.open_element(ELEM_SCOPE)?;
            decoder.close_element(ELEM_SCOPE)?;
        }

        // Headers announce every symbol before any content appears.
        while let Some(id) = decoder.peek_element() {
            if !is_header_element(id) {
                break;
            }
            table.decode_header(decoder, id)?;
        }

        // Content elements fill in the announced symbols.
        while let Some(id) = decoder.peek_element() {
            table.decode_content(decoder, id, spaces)?;
        }

        decoder.close_element(ELEM_SYMBOL_TABLE)?;

        table.root = match table.by_name.get("instruction") {
            Some(id) => Some(*id),
            None => {
                return Err(Error::Format(
                    "specification has no instruction table".into(),
                ));
            }
        };
        Ok(table)
    }

    fn decode_header(&mut self, decoder: &mut PackedDecoder<'_>, element: u16) -> Result<(), Error> {
        decoder.open_element(element)?;
        let name = decoder.read_string(ATTRIB_NAME)?;
        let id = decoder.read_uint(ATTRIB_ID)? as SymbolId;
        let symbol = match element {
            ELEM_USEROP_HEAD => {
                let index = decoder.read_uint(ATTRIB_INDEX)? as usize;
                if self.userops.len() <= index {
                    self.userops.resize(index + 1, 0);
                }
                self.userops[index] = id;
                Some(Symbol::UserOp {
                    name: name.clone(),
                    index,
                })
            }
            ELEM_EPSILON_SYM_HEAD => Some(Symbol::Epsilon { name: name.clone() }),
            ELEM_START_SYM_HEAD => Some(Symbol::Start { name: name.clone() }),
            ELEM_END_SYM_HEAD => Some(Symbol::End { name: name.clone() }),
            ELEM_NEXT2_SYM_HEAD => Some(Symbol::Next2 { name: name.clone() }),
            ELEM_FLOWDEST_SYM_HEAD => Some(Symbol::FlowDest { name: name.clone() }),
            ELEM_FLOWREF_SYM_HEAD => Some(Symbol::FlowRef { name: name.clone() }),
            // Content-bearing symbols hold their slot until filled.
            ELEM_VALUE_SYM_HEAD
            | ELEM_VALUEMAP_SYM_HEAD
            | ELEM_NAME_SYM_HEAD
            | ELEM_VARNODE_SYM_HEAD
            | ELEM_VARLIST_SYM_HEAD
            | ELEM_CONTEXT_SYM_HEAD
            | ELEM_OPERAND_SYM_HEAD
            | ELEM_SUBTABLE_SYM_HEAD => None,
            other => {
                return Err(Error::Format(format!(
                    "element {other} is not a symbol header"
                )));
            }
        };
        decoder.close_element(element)?;
        let slot = id as usize;
        if self.symbols.len() <= slot {
            self.symbols.resize_with(slot + 1, || None);
        }
        if self.by_name.insert(name.clone(), id).is_some() {
            return Err(Error::Format(format!("symbol `{name}` defined twice")));
        }
        self.symbols[slot] = symbol.or(Some(Symbol::Epsilon { name }));
        Ok(())
    }

    fn decode_content(
        &mut self,
        decoder: &mut PackedDecoder<'_>,
        element: u16,
        spaces: &SpaceManager,
    ) -> Result<(), Error> {
        decoder.open_element(element)?;
        let id = decoder.read_uint(ATTRIB_ID)? as SymbolId;
        let name = self.get(id)?.name().to_string();
        let symbol = match element {
            ELEM_VALUE_SYM => Symbol::Value {
                name,
                pattern: PatternExpression::decode(decoder)?,
            },
            ELEM_VALUEMAP_SYM => {
                let pattern = PatternExpression::decode(decoder)?;
                let mut values = Vec::new();
                while decoder.peek_element() == Some(ELEM_VALUETAB) {
                    decoder.open_element(ELEM_VALUETAB)?;
                    values.push(decoder.read_int(ATTRIB_VAL)?);
                    decoder.close_element(ELEM_VALUETAB)?;
                }
                Symbol::ValueMap {
                    name,
                    pattern,
                    table: values,
                }
            }
            ELEM_NAME_SYM => {
                let pattern = PatternExpression::decode(decoder)?;
                let mut names = Vec::new();
                while decoder.peek_element() == Some(ELEM_NAMETAB) {
                    decoder.open_element(ELEM_NAMETAB)?;
                    names.push(if decoder.has_attr(ATTRIB_NAME) {
                        decoder.read_string(ATTRIB_NAME)?
                    } else {
                        String::new()
                    });
                    decoder.close_element(ELEM_NAMETAB)?;
                }
                Symbol::NameList {
                    name,
                    pattern,
                    names,
                }
            }
            ELEM_VARNODE_SYM => {
                let space_index = decoder.read_uint(ATTRIB_SPACE)? as usize;
                let space = spaces.by_index(space_index).ok_or_else(|| {
                    Error::Format(format!("varnode symbol in unknown space {space_index}"))
                })?;
                let offset = decoder.read_uint(ATTRIB_OFFSET)?;
                let size = decoder.read_uint(ATTRIB_SIZE)? as u32;
                Symbol::Varnode {
                    name,
                    vn: VarnodeData::new(space, offset, size),
                }
            }
            ELEM_VARLIST_SYM => {
                let pattern = PatternExpression::decode(decoder)?;
                let mut list = Vec::new();
                while decoder.peek_element() == Some(ELEM_VAR) {
                    decoder.open_element(ELEM_VAR)?;
                    list.push(if decoder.has_attr(ATTRIB_ID) {
                        Some(decoder.read_uint(ATTRIB_ID)? as SymbolId)
                    } else {
                        None
                    });
                    decoder.close_element(ELEM_VAR)?;
                }
                Symbol::VarnodeList {
                    name,
                    pattern,
                    list,
                }
            }
            ELEM_CONTEXT_SYM => {
                let varnode = decoder.read_uint(ATTRIB_VARNODE)? as SymbolId;
                let low = decoder.read_uint(ATTRIB_LOW)? as u32;
                let high = decoder.read_uint(ATTRIB_HIGH)? as u32;
                let flow = decoder.read_bool(ATTRIB_FLOW)?;
                let pattern = PatternExpression::decode(decoder)?;
                Symbol::ContextField {
                    name,
                    pattern,
                    varnode,
                    low,
                    high,
                    flow,
                }
            }
            ELEM_OPERAND_SYM => {
                let index = decoder.read_uint(ATTRIB_INDEX)? as usize;
                let rel_offset = decoder.read_uint(ATTRIB_OFF)? as usize;
                let offset_base = match decoder.read_int(ATTRIB_BASE)? {
                    -1 => None,
                    base if base >= 0 => Some(base as usize),
                    other => {
                        return Err(Error::Format(format!("bad operand base {other}")));
                    }
                };
                let min_length = decoder.read_uint(ATTRIB_MINLEN)? as usize;
                let def = if decoder.has_attr(ATTRIB_SUBSYM) {
                    OperandDef::Symbol(decoder.read_uint(ATTRIB_SUBSYM)? as SymbolId)
                } else if decoder.peek_element().is_some() {
                    OperandDef::Expr(PatternExpression::decode(decoder)?)
                } else {
                    OperandDef::None
                };
                Symbol::Operand(OperandSymbol {
                    name,
                    index,
                    rel_offset,
                    offset_base,
                    min_length,
                    def,
                })
            }
            ELEM_SUBTABLE_SYM => {
                let numct = decoder.read_uint(ATTRIB_NUMCT)? as usize;
                let mut constructors = Vec::with_capacity(numct);
                while decoder.peek_element() == Some(ELEM_CONSTRUCTOR) {
                    let index = constructors.len();
                    constructors.push(Arc::new(decode_constructor(
                        decoder, id, index, spaces,
                    )?));
                }
                if constructors.len() != numct {
                    return Err(Error::Format(format!(
                        "subtable `{name}` declares {numct} constructors, found {}",
                        constructors.len()
                    )));
                }
                let decision = DecisionNode::decode(decoder)?;
                Symbol::Subtable(SubtableSymbol {
                    name,
                    constructors,
                    decision,
                })
            }
            other => {
                return Err(Error::Format(format!(
                    "element {other} is not symbol content"
                )));
            }
        };
        decoder.close_element(element)?;
        self.symbols[id as usize] = Some(symbol);
        Ok(())
    }
}

fn decode_constructor(
    decoder: &mut PackedDecoder<'_>,
    table: SymbolId,
    index: usize,
    spaces: &SpaceManager,
) -> Result<Constructor, Error> {
    decoder.open_element(ELEM_CONSTRUCTOR)?;
    let min_length = decoder.read_uint(ATTRIB_LENGTH)? as usize;
    let line = decoder.read_uint_or(ATTRIB_LINE, 0)? as u32;
    let mut operands = Vec::new();
    let mut pieces = Vec::new();
    let mut context_changes = Vec::new();
    let mut template = None;
    let mut named_templates: Vec<Option<ConstructTpl>> = Vec::new();
    loop {
        match decoder.peek_element() {
            Some(ELEM_OPER) => {
                decoder.open_element(ELEM_OPER)?;
                operands.push(decoder.read_uint(ATTRIB_ID)? as SymbolId);
                decoder.close_element(ELEM_OPER)?;
            }
            Some(ELEM_PRINT) => {
                decoder.open_element(ELEM_PRINT)?;
                pieces.push(PrintPiece::Literal(decoder.read_string(ATTRIB_PIECE)?));
                decoder.close_element(ELEM_PRINT)?;
            }
            Some(ELEM_OPPRINT) => {
                decoder.open_element(ELEM_OPPRINT)?;
                pieces.push(PrintPiece::Operand(decoder.read_uint(ATTRIB_ID)? as usize));
                decoder.close_element(ELEM_OPPRINT)?;
            }
            Some(ELEM_CONTEXT_OP) => {
                decoder.open_element(ELEM_CONTEXT_OP)?;
                let word = decoder.read_uint(ATTRIB_NUMBER)? as usize;
                let shift = decoder.read_uint(ATTRIB_SHIFT)? as u32;
                let mask = decoder.read_uint(ATTRIB_MASK)? as u32;
                let expr = PatternExpression::decode(decoder)?;
                decoder.close_element(ELEM_CONTEXT_OP)?;
                context_changes.push(ContextChange::Op {
                    word,
                    shift,
                    mask,
                    expr,
                });
            }
            Some(ELEM_COMMIT) => {
                decoder.open_element(ELEM_COMMIT)?;
                context_changes.push(ContextChange::Commit {
                    sym: decoder.read_uint(ATTRIB_ID)? as SymbolId,
                    word: decoder.read_uint(ATTRIB_NUMBER)? as usize,
                    mask: decoder.read_uint(ATTRIB_MASK)? as u32,
                    flow: decoder.read_bool(ATTRIB_FLOW)?,
                });
                decoder.close_element(ELEM_COMMIT)?;
            }
            Some(ELEM_CONSTRUCT_TPL) => {
                let (section, tpl) = ConstructTpl::decode(decoder, spaces)?;
                match section {
                    None => template = Some(tpl),
                    Some(section) => {
                        if named_templates.len() <= section {
                            named_templates.resize_with(section + 1, || None);
                        }
                        named_templates[section] = Some(tpl);
                    }
                }
            }
            _ => break,
        }
    }
    decoder.close_element(ELEM_CONSTRUCTOR)?;
    let first_whitespace = pieces
        .iter()
        .position(|piece| matches!(piece, PrintPiece::Literal(text) if text == " "));
    Ok(Constructor {
        table,
        index,
        operands,
        min_length,
        pieces,
        first_whitespace,
        context_changes,
        template,
        named_templates,
        line,
    })
}

fn is_header_element(id: u16) -> bool {
    (ELEM_USEROP_HEAD..=ELEM_FLOWREF_SYM_HEAD).contains(&id)
}

pub(crate) fn format_signed(value: i64) -> String {
    if value < 0 {
        format!("-{:#x}", value.unsigned_abs())
    } else {
        format!("{value:#x}")
    }
}
