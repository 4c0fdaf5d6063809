//! The closed set of p-code operations.

use core::fmt;

use num_enum::TryFromPrimitive;

/// A p-code operation code.
///
/// The numeric values are the wire ids used by compiled specifications
/// and must not be reordered.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    TryFromPrimitive,
    strum::EnumIter,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[repr(u32)]
#[non_exhaustive]
pub enum OpCode {
    /// Copy one operand to another.
    Copy = 1,
    /// Load from a dynamic pointer into memory.
    Load = 2,
    /// Store at a dynamic pointer into memory.
    Store = 3,
    /// Always branch.
    Branch = 4,
    /// Conditional branch.
    CBranch = 5,
    /// Indirect branch through a computed target.
    BranchInd = 6,
    /// Call to an absolute address.
    Call = 7,
    /// Call through a computed address.
    CallInd = 8,
    /// User-defined operation.
    CallOther = 9,
    /// Return from subroutine.
    Return = 10,
    /// Integer comparison, equality.
    IntEqual = 11,
    /// Integer comparison, inequality.
    IntNotEqual = 12,
    /// Integer comparison, signed less-than.
    IntSLess = 13,
    /// Integer comparison, signed less-than-or-equal.
    IntSLessEqual = 14,
    /// Integer comparison, unsigned less-than.
    IntLess = 15,
    /// Integer comparison, unsigned less-than-or-equal.
    IntLessEqual = 16,
    /// Zero extension.
    IntZExt = 17,
    /// Sign extension.
    IntSExt = 18,
    /// Integer addition.
    IntAdd = 19,
    /// Integer subtraction.
    IntSub = 20,
    /// Carry flag of an addition.
    IntCarry = 21,
    /// Signed overflow flag of an addition.
    IntSCarry = 22,
    /// Signed overflow flag of a subtraction.
    IntSBorrow = 23,
    /// Twos-complement negation.
    Int2Comp = 24,
    /// Bitwise negation.
    IntNegate = 25,
    /// Bitwise exclusive or.
    IntXor = 26,
    /// Bitwise and.
    IntAnd = 27,
    /// Bitwise or.
    IntOr = 28,
    /// Left shift.
    IntLeft = 29,
    /// Unsigned right shift.
    IntRight = 30,
    /// Signed right shift.
    IntSRight = 31,
    /// Integer multiplication.
    IntMult = 32,
    /// Unsigned integer division.
    IntDiv = 33,
    /// Signed integer division.
    IntSDiv = 34,
    /// Unsigned integer remainder.
    IntRem = 35,
    /// Signed integer remainder.
    IntSRem = 36,
    /// Boolean negation.
    BoolNegate = 37,
    /// Boolean exclusive or.
    BoolXor = 38,
    /// Boolean and.
    BoolAnd = 39,
    /// Boolean or.
    BoolOr = 40,
    /// Floating-point comparison, equality.
    FloatEqual = 41,
    /// Floating-point comparison, inequality.
    FloatNotEqual = 42,
    /// Floating-point comparison, less-than.
    FloatLess = 43,
    /// Floating-point comparison, less-than-or-equal.
    FloatLessEqual = 44,
    /// Not-a-number test.
    FloatNan = 46,
    /// Floating-point addition.
    FloatAdd = 47,
    /// Floating-point division.
    FloatDiv = 48,
    /// Floating-point multiplication.
    FloatMult = 49,
    /// Floating-point subtraction.
    FloatSub = 50,
    /// Floating-point negation.
    FloatNeg = 51,
    /// Floating-point absolute value.
    FloatAbs = 52,
    /// Floating-point square root.
    FloatSqrt = 53,
    /// Integer to floating-point conversion.
    FloatInt2Float = 54,
    /// Floating-point precision conversion.
    FloatFloat2Float = 55,
    /// Floating-point to integer truncation.
    FloatTrunc = 56,
    /// Ceiling.
    FloatCeil = 57,
    /// Floor.
    FloatFloor = 58,
    /// Round to nearest.
    FloatRound = 59,
    /// Phi-node placeholder; also the template `build` directive.
    MultiEqual = 60,
    /// Copy with indirect effect; also the template `delay-slot` directive.
    Indirect = 61,
    /// Concatenation of operands.
    Piece = 62,
    /// Truncation of an operand.
    SubPiece = 63,
    /// Type cast without data change.
    Cast = 64,
    /// Indexed pointer arithmetic; also the template `label` directive.
    PtrAdd = 65,
    /// Field-offset pointer arithmetic; also the template `cross-build` directive.
    PtrSub = 66,
    /// Segmented address construction.
    SegmentOp = 67,
    /// Constant-pool reference.
    CPoolRef = 68,
    /// Object allocation.
    New = 69,
    /// Bit-range insertion.
    Insert = 70,
    /// Bit-range extraction.
    Extract = 71,
    /// Population count.
    PopCount = 72,
    /// Leading-zero count.
    LzCount = 73,
}

impl OpCode {
    /// Wire id of the opcode.
    pub const fn raw(self) -> u32 {
        self as u32
    }

    /// Decode a wire id.
    pub fn from_raw(raw: u32) -> Option<Self> {
        Self::try_from(raw).ok()
    }

    /// Canonical mnemonic of the opcode as printed in p-code listings.
    pub const fn mnemonic(self) -> &'static str {
        match self {
            Self::Copy => "COPY",
            Self::Load => "LOAD",
            Self::Store => "STORE",
            Self::Branch => "BRANCH",
            Self::CBranch => "CBRANCH",
            Self::BranchInd => "BRANCHIND",
            Self::Call => "CALL",
            Self::CallInd => "CALLIND",
            Self::CallOther => "CALLOTHER",
            Self::Return => "RETURN",
            Self::IntEqual => "INT_EQUAL",
            Self::IntNotEqual => "INT_NOTEQUAL",
            Self::IntSLess => "INT_SLESS",
            Self::IntSLessEqual => "INT_SLESSEQUAL",
            Self::IntLess => "INT_LESS",
            Self::IntLessEqual => "INT_LESSEQUAL",
            Self::IntZExt => "INT_ZEXT",
            Self::IntSExt => "INT_SEXT",
            Self::IntAdd => "INT_ADD",
            Self::IntSub => "INT_SUB",
            Self::IntCarry => "INT_CARRY",
            Self::IntSCarry => "INT_SCARRY",
            Self::IntSBorrow => "INT_SBORROW",
            Self::Int2Comp => "INT_2COMP",
            Self::IntNegate => "INT_NEGATE",
            Self::IntXor => "INT_XOR",
            Self::IntAnd => "INT_AND",
            Self::IntOr => "INT_OR",
            Self::IntLeft => "INT_LEFT",
            Self::IntRight => "INT_RIGHT",
            Self::IntSRight => "INT_SRIGHT",
            Self::IntMult => "INT_MULT",
            Self::IntDiv => "INT_DIV",
            Self::IntSDiv => "INT_SDIV",
            Self::IntRem => "INT_REM",
            Self::IntSRem => "INT_SREM",
            Self::BoolNegate => "BOOL_NEGATE",
            Self::BoolXor => "BOOL_XOR",
            Self::BoolAnd => "BOOL_AND",
            Self::BoolOr => "BOOL_OR",
            Self::FloatEqual => "FLOAT_EQUAL",
            Self::FloatNotEqual => "FLOAT_NOTEQUAL",
            Self::FloatLess => "FLOAT_LESS",
            Self::FloatLessEqual => "FLOAT_LESSEQUAL",
            Self::FloatNan => "FLOAT_NAN",
            Self::FloatAdd => "FLOAT_ADD",
            Self::FloatDiv => "FLOAT_DIV",
            Self::FloatMult => "FLOAT_MULT",
            Self::FloatSub => "FLOAT_SUB",
            Self::FloatNeg => "FLOAT_NEG",
            Self::FloatAbs => "FLOAT_ABS",
            Self::FloatSqrt => "FLOAT_SQRT",
            Self::FloatInt2Float => "FLOAT_INT2FLOAT",
            Self::FloatFloat2Float => "FLOAT_FLOAT2FLOAT",
            Self::FloatTrunc => "FLOAT_TRUNC",
            Self::FloatCeil => "FLOAT_CEIL",
            Self::FloatFloor => "FLOAT_FLOOR",
            Self::FloatRound => "FLOAT_ROUND",
            Self::MultiEqual => "MULTIEQUAL",
            Self::Indirect => "INDIRECT",
            Self::Piece => "PIECE",
            Self::SubPiece => "SUBPIECE",
            Self::Cast => "CAST",
            Self::PtrAdd => "PTRADD",
            Self::PtrSub => "PTRSUB",
            Self::SegmentOp => "SEGMENTOP",
            Self::CPoolRef => "CPOOLREF",
            Self::New => "NEW",
            Self::Insert => "INSERT",
            Self::Extract => "EXTRACT",
            Self::PopCount => "POPCOUNT",
            Self::LzCount => "LZCOUNT",
        }
    }

    /// Whether the op transfers control without calling.
    pub const fn is_branch(self) -> bool {
        matches!(self, Self::Branch | Self::CBranch | Self::BranchInd)
    }

    /// Whether the op is a subroutine call.
    pub const fn is_call(self) -> bool {
        matches!(self, Self::Call | Self::CallInd)
    }

    /// Whether control continues to the next op after this one.
    ///
    /// `CallOther` falls through unless an injection replaces it; the
    /// flow follower refines this per op.
    pub const fn has_fall_through(self) -> bool {
        !matches!(self, Self::Branch | Self::BranchInd | Self::Return)
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn raw_round_trips() {
        for op in OpCode::iter() {
            assert_eq!(OpCode::from_raw(op.raw()), Some(op));
        }
    }

    #[test]
    fn unassigned_ids_are_rejected() {
        assert_eq!(OpCode::from_raw(0), None);
        assert_eq!(OpCode::from_raw(45), None);
        assert_eq!(OpCode::from_raw(74), None);
    }

    #[test]
    fn display_matches_listing_names() {
        assert_eq!(OpCode::IntAdd.to_string(), "INT_ADD");
        assert_eq!(OpCode::CBranch.to_string(), "CBRANCH");
        assert_eq!(OpCode::IntSLess.to_string(), "INT_SLESS");
    }

    #[test]
    fn control_flow_classification() {
        assert!(OpCode::CBranch.is_branch());
        assert!(OpCode::CallInd.is_call());
        assert!(!OpCode::Branch.has_fall_through());
        assert!(OpCode::CBranch.has_fall_through());
        assert!(!OpCode::Return.has_fall_through());
    }
}
