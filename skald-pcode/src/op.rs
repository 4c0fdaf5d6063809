//! P-code operations and their ordering keys.

use core::cmp::Ordering;
use core::fmt;

use smallvec::SmallVec;

use crate::{Address, OpCode, VarnodeData};

bitflags::bitflags! {
    /// Marker bits attached to an op by the flow follower.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct OpFlags: u16 {
        /// The op begins a basic block.
        const BLOCK_START = 0x0001;
        /// Scratch mark used during edge deduplication.
        const MARK = 0x0002;
        /// The op is an artificial halt, not decoded from bytes.
        const HALT = 0x0004;
        /// Halt kind: flow reached an address that could not be decoded.
        const BAD_INSTRUCTION = 0x0008;
        /// Halt kind: the instruction is declared but not implemented.
        const UNIMPLEMENTED = 0x0010;
        /// Halt kind: flow left the permitted address range.
        const MISSING = 0x0020;
        /// Halt kind: placed after a call that never returns.
        const NO_RETURN = 0x0040;
    }
}

impl OpFlags {
    /// All halt-kind bits.
    pub const HALT_KINDS: Self = Self::BAD_INSTRUCTION
        .union(Self::UNIMPLEMENTED)
        .union(Self::MISSING)
        .union(Self::NO_RETURN);
}

/// Ordering key of one op: the instruction address plus a counter
/// that increases strictly within the instruction.
///
/// Lexicographic order over (address, time) matches program order.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SeqNum {
    addr: Address,
    time: u32,
}

impl SeqNum {
    /// Create a sequence number.
    pub const fn new(addr: Address, time: u32) -> Self {
        Self { addr, time }
    }

    /// Address of the instruction the op was decoded from.
    pub const fn addr(&self) -> &Address {
        &self.addr
    }

    /// Position of the op within its instruction.
    pub const fn time(&self) -> u32 {
        self.time
    }
}

impl PartialOrd for SeqNum {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SeqNum {
    fn cmp(&self, other: &Self) -> Ordering {
        self.addr
            .cmp(&other.addr)
            .then(self.time.cmp(&other.time))
    }
}

impl fmt::Display for SeqNum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.time)
    }
}

/// One p-code operation.
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct PcodeOp {
    /// Ordering key; unique within a function.
    pub seq: SeqNum,
    /// Operation code.
    pub opcode: OpCode,
    /// Output slot, absent for ops without a result.
    pub output: Option<VarnodeData>,
    /// Input slots in operand order.
    pub inputs: SmallVec<[VarnodeData; 4]>,
    /// Marker bits owned by the flow follower.
    pub flags: OpFlags,
}

impl PcodeOp {
    /// Create an op with no marker bits set.
    pub fn new(
        seq: SeqNum,
        opcode: OpCode,
        output: Option<VarnodeData>,
        inputs: impl IntoIterator<Item = VarnodeData>,
    ) -> Self {
        Self {
            seq,
            opcode,
            output,
            inputs: inputs.into_iter().collect(),
            flags: OpFlags::empty(),
        }
    }

    /// Number of input operands.
    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    /// First input operand, if any.
    pub fn input(&self, slot: usize) -> Option<&VarnodeData> {
        self.inputs.get(slot)
    }

    /// Whether the op is an artificial halt.
    pub fn is_halt(&self) -> bool {
        self.flags.contains(OpFlags::HALT)
    }

    /// Whether the op starts a basic block.
    pub fn starts_block(&self) -> bool {
        self.flags.contains(OpFlags::BLOCK_START)
    }
}

impl fmt::Display for PcodeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: ", self.seq)?;
        if let Some(out) = &self.output {
            write!(f, "{out} = ")?;
        }
        write!(f, "{}", self.opcode)?;
        for input in &self.inputs {
            write!(f, " {input}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SpaceManager;

    #[test]
    fn seqnum_order_matches_program_order() {
        let manager = SpaceManager::new();
        let space = manager.constant_space();
        let a = SeqNum::new(Address::new(space.clone(), 0x100), 5);
        let b = SeqNum::new(Address::new(space.clone(), 0x100), 6);
        let c = SeqNum::new(Address::new(space, 0x104), 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn halt_kind_bits_are_covered() {
        let mut flags = OpFlags::HALT | OpFlags::NO_RETURN;
        assert!(flags.intersects(OpFlags::HALT_KINDS));
        flags.remove(OpFlags::NO_RETURN);
        assert!(!flags.intersects(OpFlags::HALT_KINDS));
    }
}
