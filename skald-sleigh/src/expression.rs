//! Pattern expressions: the value side of the decoding grammar.
//!
//! Every field an operand can print or export is described by an
//! expression over instruction bits, context bits, the instruction
//! addresses, and other operands. Expressions are shared immutable
//! after load.

use std::sync::Arc;

use crate::error::Error;
use crate::parser::ParserWalker;
use crate::sla::format::*;
use crate::sla::PackedDecoder;
use crate::symbols::SymbolId;

/// Binary operators of the expression grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    /// Wrapping addition.
    Plus,
    /// Wrapping subtraction.
    Sub,
    /// Wrapping multiplication.
    Mult,
    /// Left shift; shifts of 64 or more produce 0.
    LeftShift,
    /// Logical right shift.
    RightShift,
    /// Bitwise and.
    And,
    /// Bitwise or.
    Or,
    /// Bitwise xor.
    Xor,
    /// Signed division.
    Div,
}

/// Unary operators of the expression grammar.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Arithmetic negation.
    Minus,
    /// Bitwise complement.
    Not,
}

/// A value computable during instruction resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternExpression {
    /// Literal constant.
    Constant(i64),
    /// Offset of the current instruction.
    StartInstruction,
    /// Offset of the next instruction.
    EndInstruction,
    /// Offset of the instruction after the next.
    Next2Instruction,
    /// A field of the instruction token at the walker position.
    TokenField {
        /// Whether the token is assembled big endian.
        big_endian: bool,
        /// Whether the field sign-extends.
        sign_bit: bool,
        /// Least significant bit of the field within the token.
        bit_start: u32,
        /// Most significant bit of the field within the token.
        bit_end: u32,
        /// First byte of the token relative to the operand position.
        byte_start: usize,
        /// Last byte of the token relative to the operand position.
        byte_end: usize,
        /// Right shift applied after assembly.
        shift: u32,
    },
    /// A field of the context words.
    ContextField {
        /// Whether the field sign-extends.
        sign_bit: bool,
        /// Least significant bit of the field.
        bit_start: u32,
        /// Most significant bit of the field.
        bit_end: u32,
        /// First context byte of the field.
        byte_start: usize,
        /// Last context byte of the field.
        byte_end: usize,
        /// Right shift applied after assembly.
        shift: u32,
    },
    /// The exported value of another operand of a constructor.
    Operand {
        /// Subtable symbol owning the constructor.
        table: SymbolId,
        /// Constructor index within the subtable.
        ct_index: usize,
        /// Operand index within the constructor.
        index: usize,
    },
    /// Binary combination.
    Binary {
        /// The operator.
        op: BinaryOp,
        /// Left side.
        left: Arc<PatternExpression>,
        /// Right side.
        right: Arc<PatternExpression>,
    },
    /// Unary transformation.
    Unary {
        /// The operator.
        op: UnaryOp,
        /// The operand.
        operand: Arc<PatternExpression>,
    },
}

impl PatternExpression {
    /// Evaluate at the walker's current position.
    pub fn value(&self, walker: &mut ParserWalker<'_>) -> Result<i64, Error> {
        match self {
            Self::Constant(v) => Ok(*v),
            Self::StartInstruction => Ok(walker.addr().offset() as i64),
            Self::EndInstruction => Ok(walker.naddr().offset() as i64),
            Self::Next2Instruction => walker
                .next2_addr()
                .map(|addr| addr.offset() as i64)
                .ok_or_else(|| {
                    Error::LowLevel("next2 address requested but not computed".into())
                }),
            Self::TokenField {
                big_endian,
                sign_bit,
                bit_start,
                bit_end,
                byte_start,
                byte_end,
                shift,
            } => {
                let size = byte_end - byte_start + 1;
                let mut res: u64 = 0;
                if *big_endian {
                    for i in 0..size {
                        res = (res << 8) | u64::from(walker.instruction_byte(byte_start + i)?);
                    }
                } else {
                    for i in (0..size).rev() {
                        res = (res << 8) | u64::from(walker.instruction_byte(byte_start + i)?);
                    }
                }
                res >>= shift;
                // The shift has already right-aligned the field; the
                // bit positions only fix its width and sign bit.
                Ok(extract_field(res, 0, bit_end - bit_start, *sign_bit))
            }
            Self::ContextField {
                sign_bit,
                bit_start,
                bit_end,
                byte_start,
                byte_end,
                shift,
            } => {
                let size = byte_end - byte_start + 1;
                let mut res: u64 = 0;
                for i in 0..size {
                    res = (res << 8) | u64::from(walker.context_byte(byte_start + i));
                }
                res >>= shift;
                Ok(extract_field(res, 0, bit_end - bit_start, *sign_bit))
            }
            Self::Operand { table, ct_index, index } => {
                walker.operand_value(*table, *ct_index, *index)
            }
            Self::Binary { op, left, right } => {
                let a = left.value(walker)?;
                let b = right.value(walker)?;
                Ok(match op {
                    BinaryOp::Plus => a.wrapping_add(b),
                    BinaryOp::Sub => a.wrapping_sub(b),
                    BinaryOp::Mult => a.wrapping_mul(b),
                    BinaryOp::LeftShift => {
                        if b >= 64 || b < 0 {
                            0
                        } else {
                            ((a as u64) << b) as i64
                        }
                    }
                    BinaryOp::RightShift => {
                        if b >= 64 || b < 0 {
                            0
                        } else {
                            ((a as u64) >> b) as i64
                        }
                    }
                    BinaryOp::And => a & b,
                    BinaryOp::Or => a | b,
                    BinaryOp::Xor => a ^ b,
                    BinaryOp::Div => {
                        if b == 0 {
                            return Err(Error::LowLevel(
                                "division by zero in pattern expression".into(),
                            ));
                        }
                        a.wrapping_div(b)
                    }
                })
            }
            Self::Unary { op, operand } => {
                let a = operand.value(walker)?;
                Ok(match op {
                    UnaryOp::Minus => a.wrapping_neg(),
                    UnaryOp::Not => !a,
                })
            }
        }
    }

    /// Decode any expression element.
    pub(crate) fn decode(decoder: &mut PackedDecoder<'_>) -> Result<Arc<Self>, Error> {
        let id = decoder.open_any()?;
        let res = match id {
            ELEM_INTB_EXP => Self::Constant(decoder.read_int(ATTRIB_VAL)?),
            ELEM_START_EXP => Self::StartInstruction,
            ELEM_END_EXP => Self::EndInstruction,
            ELEM_NEXT2_EXP => Self::Next2Instruction,
            ELEM_TOKENFIELD_EXP => Self::TokenField {
                big_endian: decoder.read_bool(ATTRIB_BIGENDIAN)?,
                sign_bit: decoder.read_bool(ATTRIB_SIGNBIT)?,
                bit_start: decoder.read_uint(ATTRIB_STARTBIT)? as u32,
                bit_end: decoder.read_uint(ATTRIB_ENDBIT)? as u32,
                byte_start: decoder.read_uint(ATTRIB_STARTBYTE)? as usize,
                byte_end: decoder.read_uint(ATTRIB_ENDBYTE)? as usize,
                shift: decoder.read_uint(ATTRIB_SHIFT)? as u32,
            },
            ELEM_CONTEXTFIELD_EXP => Self::ContextField {
                sign_bit: decoder.read_bool(ATTRIB_SIGNBIT)?,
                bit_start: decoder.read_uint(ATTRIB_STARTBIT)? as u32,
                bit_end: decoder.read_uint(ATTRIB_ENDBIT)? as u32,
                byte_start: decoder.read_uint(ATTRIB_STARTBYTE)? as usize,
                byte_end: decoder.read_uint(ATTRIB_ENDBYTE)? as usize,
                shift: decoder.read_uint(ATTRIB_SHIFT)? as u32,
            },
            ELEM_OPERAND_EXP => Self::Operand {
                table: decoder.read_uint(ATTRIB_SUBSYM)? as SymbolId,
                ct_index: decoder.read_uint(ATTRIB_CT)? as usize,
                index: decoder.read_uint(ATTRIB_INDEX)? as usize,
            },
            ELEM_MINUS_EXP => Self::Unary {
                op: UnaryOp::Minus,
                operand: Self::decode_inner(decoder)?,
            },
            ELEM_NOT_EXP => Self::Unary {
                op: UnaryOp::Not,
                operand: Self::decode_inner(decoder)?,
            },
            ELEM_PLUS_EXP | ELEM_SUB_EXP | ELEM_MULT_EXP | ELEM_LSHIFT_EXP | ELEM_RSHIFT_EXP
            | ELEM_AND_EXP | ELEM_OR_EXP | ELEM_XOR_EXP | ELEM_DIV_EXP => {
                let op = match id {
                    ELEM_PLUS_EXP => BinaryOp::Plus,
                    ELEM_SUB_EXP => BinaryOp::Sub,
                    ELEM_MULT_EXP => BinaryOp::Mult,
                    ELEM_LSHIFT_EXP => BinaryOp::LeftShift,
                    ELEM_RSHIFT_EXP => BinaryOp::RightShift,
                    ELEM_AND_EXP => BinaryOp::And,
                    ELEM_OR_EXP => BinaryOp::Or,
                    ELEM_XOR_EXP => BinaryOp::Xor,
                    _ => BinaryOp::Div,
                };
                let left = Self::decode_inner(decoder)?;
                let right = Self::decode_inner(decoder)?;
                Self::Binary { op, left, right }
            }
            other => {
                return Err(Error::Format(format!(
                    "element {other} is not a pattern expression"
                )));
            }
        };
        decoder.close_element(id)?;
        Ok(Arc::new(res))
    }

    fn decode_inner(decoder: &mut PackedDecoder<'_>) -> Result<Arc<Self>, Error> {
        Self::decode(decoder)
    }
}

/// Extract bits `[bit_start, bit_end]` of `value`, sign- or
/// zero-extending to 64 bits.
fn extract_field(value: u64, bit_start: u32, bit_end: u32, sign_bit: bool) -> i64 {
    let width = bit_end - bit_start + 1;
    let shifted = value >> bit_start;
    let masked = if width >= 64 {
        shifted
    } else {
        shifted & ((1u64 << width) - 1)
    };
    if sign_bit && width < 64 && (masked >> (width - 1)) & 1 == 1 {
        (masked | !((1u64 << width) - 1)) as i64
    } else {
        masked as i64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_extraction_sign_extends() {
        assert_eq!(extract_field(0b1011, 0, 3, false), 0b1011);
        assert_eq!(extract_field(0b1011, 0, 3, true), -5);
        assert_eq!(extract_field(0b1011, 1, 2, false), 0b01);
        assert_eq!(extract_field(0xff, 0, 7, true), -1);
    }
}
