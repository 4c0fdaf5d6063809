//! P-code templates attached to constructors.
//!
//! A template op is a p-code op whose operands are symbolic: constants
//! may refer to operand handles, to the instruction addresses, to a
//! relative label, or to a space. The builder resolves them against a
//! finished parse tree.

use std::sync::Arc;

use skald_pcode::{AddrSpace, OpCode, SpaceManager};

use crate::error::Error;
use crate::sla::format::*;
use crate::sla::PackedDecoder;

/// Template directive ids; these share the opcode number space with
/// real ops, reusing ids that can never appear in a template body.
pub const DIRECTIVE_BUILD: u32 = OpCode::MultiEqual as u32;
/// Delay-slot expansion point.
pub const DIRECTIVE_DELAY_SLOT: u32 = OpCode::Indirect as u32;
/// Label definition.
pub const DIRECTIVE_LABEL: u32 = OpCode::PtrAdd as u32;
/// Cross-build invocation of a named section at another address.
pub const DIRECTIVE_CROSSBUILD: u32 = OpCode::PtrSub as u32;

/// Field of an operand handle a template constant can select.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleField {
    /// The handle's space.
    Space,
    /// The handle's offset (or dynamic temporary location).
    Offset,
    /// The handle's size.
    Size,
    /// The handle's offset plus a fixed byte displacement, used when
    /// a template addresses a piece of a larger operand.
    OffsetPlus(u64),
}

/// A symbolic constant inside a template.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstTpl {
    /// Literal value.
    Real(u64),
    /// Field of the handle of operand `index` of the current
    /// constructor.
    Handle {
        /// Operand index within the constructor.
        index: usize,
        /// Selected field.
        field: HandleField,
    },
    /// Address of the current instruction.
    Start,
    /// Address of the next instruction.
    Next,
    /// Address of the instruction after the next.
    Next2,
    /// The space the instruction was decoded in.
    CurSpace,
    /// Address size of the decoding space.
    CurSpaceSize,
    /// A specific space.
    SpaceId(Arc<AddrSpace>),
    /// Relative label reference, resolved by the cacher.
    Relative(u64),
    /// Reference point of an indirect flow.
    FlowRef,
    /// Destination of an indirect flow.
    FlowDest,
}

impl ConstTpl {
    /// Whether this constant selects the offset field of a handle.
    pub fn is_handle_offset(&self) -> bool {
        matches!(
            self,
            Self::Handle {
                field: HandleField::Offset | HandleField::OffsetPlus(_),
                ..
            }
        )
    }

    /// Whether this is a relative label reference.
    pub fn is_relative(&self) -> bool {
        matches!(self, Self::Relative(_))
    }

    pub(crate) fn decode(
        decoder: &mut PackedDecoder<'_>,
        spaces: &SpaceManager,
    ) -> Result<Self, Error> {
        decoder.open_element(ELEM_CONST_TPL)?;
        let kind = decoder.read_uint(ATTRIB_TYPE)?;
        let res = match kind {
            0 => Self::Real(decoder.read_uint(ATTRIB_VAL)?),
            1 => {
                let index = decoder.read_uint(ATTRIB_VAL)? as usize;
                let select = decoder.read_uint(ATTRIB_SELECT)?;
                let field = match select {
                    0 => HandleField::Space,
                    1 => HandleField::Offset,
                    2 => HandleField::Size,
                    3 => HandleField::OffsetPlus(decoder.read_uint(ATTRIB_PLUS)?),
                    other => {
                        return Err(Error::Format(format!("bad handle selector {other}")));
                    }
                };
                Self::Handle { index, field }
            }
            2 => Self::Start,
            3 => Self::Next,
            4 => Self::Next2,
            5 => Self::CurSpace,
            6 => Self::CurSpaceSize,
            7 => {
                let index = decoder.read_uint(ATTRIB_SPACE)? as usize;
                let space = spaces.by_index(index).ok_or_else(|| {
                    Error::Format(format!("template names unknown space {index}"))
                })?;
                Self::SpaceId(space)
            }
            8 => Self::Relative(decoder.read_uint(ATTRIB_VAL)?),
            9 => Self::FlowRef,
            10 => Self::FlowDest,
            other => return Err(Error::Format(format!("bad const template type {other}"))),
        };
        decoder.close_element(ELEM_CONST_TPL)?;
        Ok(res)
    }
}

/// A template varnode: space, offset and size, each symbolic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VarnodeTpl {
    /// Space of the slot.
    pub space: ConstTpl,
    /// Offset of the slot.
    pub offset: ConstTpl,
    /// Size of the slot in bytes.
    pub size: ConstTpl,
}

impl VarnodeTpl {
    pub(crate) fn decode(
        decoder: &mut PackedDecoder<'_>,
        spaces: &SpaceManager,
    ) -> Result<Self, Error> {
        decoder.open_element(ELEM_VARNODE_TPL)?;
        let space = ConstTpl::decode(decoder, spaces)?;
        let offset = ConstTpl::decode(decoder, spaces)?;
        let size = ConstTpl::decode(decoder, spaces)?;
        decoder.close_element(ELEM_VARNODE_TPL)?;
        Ok(Self {
            space,
            offset,
            size,
        })
    }
}

/// One template operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OpTpl {
    /// Raw opcode; may be one of the directive ids.
    pub opcode: u32,
    /// Output slot.
    pub output: Option<VarnodeTpl>,
    /// Input slots.
    pub inputs: Vec<VarnodeTpl>,
}

impl OpTpl {
    /// The opcode as a real p-code operation, when it is one.
    pub fn real_opcode(&self) -> Option<OpCode> {
        OpCode::from_raw(self.opcode)
    }

    pub(crate) fn decode(
        decoder: &mut PackedDecoder<'_>,
        spaces: &SpaceManager,
    ) -> Result<Self, Error> {
        decoder.open_element(ELEM_OP_TPL)?;
        let opcode = decoder.read_uint(ATTRIB_CODE)? as u32;
        let output = if decoder.peek_element() == Some(ELEM_NULL) {
            decoder.open_element(ELEM_NULL)?;
            decoder.close_element(ELEM_NULL)?;
            None
        } else {
            Some(VarnodeTpl::decode(decoder, spaces)?)
        };
        let mut inputs = Vec::new();
        while decoder.peek_element() == Some(ELEM_VARNODE_TPL) {
            inputs.push(VarnodeTpl::decode(decoder, spaces)?);
        }
        decoder.close_element(ELEM_OP_TPL)?;
        Ok(Self {
            opcode,
            output,
            inputs,
        })
    }
}

/// The exported result of a constructor, assembled from the handles
/// and temporaries of its body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandleTpl {
    /// Space of the exported storage.
    pub space: ConstTpl,
    /// Size of the exported storage.
    pub size: ConstTpl,
    /// Space of the pointer for dynamic exports; `Real(0)` when the
    /// export is static.
    pub ptr_space: ConstTpl,
    /// Offset (or pointer offset) of the export.
    pub ptr_offset: ConstTpl,
    /// Size of the pointer.
    pub ptr_size: ConstTpl,
    /// Temporary space holding a dynamic export's value.
    pub temp_space: ConstTpl,
    /// Temporary offset holding a dynamic export's value.
    pub temp_offset: ConstTpl,
}

impl HandleTpl {
    pub(crate) fn decode(
        decoder: &mut PackedDecoder<'_>,
        spaces: &SpaceManager,
    ) -> Result<Self, Error> {
        decoder.open_element(ELEM_HANDLE_TPL)?;
        let space = ConstTpl::decode(decoder, spaces)?;
        let size = ConstTpl::decode(decoder, spaces)?;
        let ptr_space = ConstTpl::decode(decoder, spaces)?;
        let ptr_offset = ConstTpl::decode(decoder, spaces)?;
        let ptr_size = ConstTpl::decode(decoder, spaces)?;
        let temp_space = ConstTpl::decode(decoder, spaces)?;
        let temp_offset = ConstTpl::decode(decoder, spaces)?;
        decoder.close_element(ELEM_HANDLE_TPL)?;
        Ok(Self {
            space,
            size,
            ptr_space,
            ptr_offset,
            ptr_size,
            temp_space,
            temp_offset,
        })
    }
}

/// The template body of one constructor section.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ConstructTpl {
    /// Number of relative labels used by the body.
    pub num_labels: usize,
    /// Delay-slot byte count demanded by this constructor.
    pub delay_slot: usize,
    /// Exported result handle.
    pub result: Option<HandleTpl>,
    /// Template operations in emission order.
    pub ops: Vec<OpTpl>,
}

impl ConstructTpl {
    /// Decode one `<construct_tpl>` element; returns the section id it
    /// declares (`None` for the main section).
    pub(crate) fn decode(
        decoder: &mut PackedDecoder<'_>,
        spaces: &SpaceManager,
    ) -> Result<(Option<usize>, Self), Error> {
        decoder.open_element(ELEM_CONSTRUCT_TPL)?;
        let section = if decoder.has_attr(ATTRIB_SECTION) {
            Some(decoder.read_uint(ATTRIB_SECTION)? as usize)
        } else {
            None
        };
        let num_labels = decoder.read_uint_or(ATTRIB_LABELS, 0)? as usize;
        let delay_slot = decoder.read_uint_or(ATTRIB_DELAYSLOT, 0)? as usize;
        let result = if decoder.peek_element() == Some(ELEM_HANDLE_TPL) {
            Some(HandleTpl::decode(decoder, spaces)?)
        } else {
            if decoder.peek_element() == Some(ELEM_NULL) {
                decoder.open_element(ELEM_NULL)?;
                decoder.close_element(ELEM_NULL)?;
            }
            None
        };
        let mut ops = Vec::new();
        while decoder.peek_element() == Some(ELEM_OP_TPL) {
            ops.push(OpTpl::decode(decoder, spaces)?);
        }
        decoder.close_element(ELEM_CONSTRUCT_TPL)?;
        Ok((
            section,
            Self {
                num_labels,
                delay_slot,
                result,
                ops,
            },
        ))
    }
}

/// A fully resolved operand handle.
///
/// When `offset_space` is set the handle is dynamic: the value lives
/// at a computed address and must be loaded into (or stored from) the
/// temporary slot described by `temp_space`/`temp_offset`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixedHandle {
    /// Space of the operand's storage.
    pub space: Arc<AddrSpace>,
    /// Size of the operand in bytes.
    pub size: u32,
    /// Space of the pointer when the operand is dynamic.
    pub offset_space: Option<Arc<AddrSpace>>,
    /// Offset of the operand, or of its pointer when dynamic.
    pub offset_offset: u64,
    /// Size of the pointer when dynamic.
    pub offset_size: u32,
    /// Space of the temporary staging slot when dynamic.
    pub temp_space: Option<Arc<AddrSpace>>,
    /// Offset of the temporary staging slot when dynamic.
    pub temp_offset: u64,
}

impl FixedHandle {
    /// A handle naming static storage.
    pub fn fixed(space: Arc<AddrSpace>, offset: u64, size: u32) -> Self {
        Self {
            space,
            size,
            offset_space: None,
            offset_offset: offset,
            offset_size: 0,
            temp_space: None,
            temp_offset: 0,
        }
    }

    /// A handle carrying a constant value.
    pub fn constant(space: Arc<AddrSpace>, value: u64) -> Self {
        Self {
            space,
            size: 0,
            offset_space: None,
            offset_offset: value,
            offset_size: 0,
            temp_space: None,
            temp_offset: 0,
        }
    }

    /// Whether the handle's value must be staged through a temporary.
    pub fn is_dynamic(&self) -> bool {
        self.offset_space.is_some()
    }
}
