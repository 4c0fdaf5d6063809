//! Ordered container of a function's p-code ops.
//!
//! Ops are keyed by sequence number; iteration order is program
//! order. The bank is the only owner of ops until block splitting
//! hands them to basic blocks by key.

use std::collections::BTreeMap;
use std::ops::Bound;

use skald_pcode::{Address, OpCode, OpFlags, PcodeOp, SeqNum, VarnodeData};

/// The op container of one function.
#[derive(Debug, Default)]
pub struct OpBank {
    ops: BTreeMap<SeqNum, PcodeOp>,
}

impl OpBank {
    /// Create an empty bank.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the bank holds no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Drop every op.
    pub fn clear(&mut self) {
        self.ops.clear();
    }

    /// Insert a fully formed op.
    pub fn insert(&mut self, op: PcodeOp) {
        self.ops.insert(op.seq.clone(), op);
    }

    /// Remove an op.
    pub fn remove(&mut self, seq: &SeqNum) -> Option<PcodeOp> {
        self.ops.remove(seq)
    }

    /// Look up an op by sequence number.
    pub fn get(&self, seq: &SeqNum) -> Option<&PcodeOp> {
        self.ops.get(seq)
    }

    /// Mutable lookup by sequence number.
    pub fn get_mut(&mut self, seq: &SeqNum) -> Option<&mut PcodeOp> {
        self.ops.get_mut(seq)
    }

    /// The first op decoded at `addr`, if any.
    pub fn first_at(&self, addr: &Address) -> Option<&PcodeOp> {
        self.ops
            .range(SeqNum::new(addr.clone(), 0)..)
            .next()
            .filter(|(seq, _)| seq.addr() == addr)
            .map(|(_, op)| op)
    }

    /// The op following `seq` in program order.
    pub fn next_after(&self, seq: &SeqNum) -> Option<&PcodeOp> {
        self.ops
            .range((Bound::Excluded(seq.clone()), Bound::Unbounded))
            .next()
            .map(|(_, op)| op)
    }

    /// All ops decoded at `addr`, in time order.
    pub fn at_address<'a>(&'a self, addr: &'a Address) -> impl Iterator<Item = &'a PcodeOp> {
        self.ops
            .range(SeqNum::new(addr.clone(), 0)..)
            .take_while(move |(seq, _)| seq.addr() == addr)
            .map(|(_, op)| op)
    }

    /// The next unused time value at `addr`.
    pub fn next_time(&self, addr: &Address) -> u32 {
        self.at_address(addr)
            .last()
            .map(|op| op.seq.time() + 1)
            .unwrap_or(0)
    }

    /// Iterate all ops in program order.
    pub fn iter(&self) -> impl Iterator<Item = &PcodeOp> {
        self.ops.values()
    }

    /// Sequence numbers of all ops in program order.
    pub fn keys(&self) -> impl Iterator<Item = &SeqNum> {
        self.ops.keys()
    }

    /// Set flag bits on an op; no-op for unknown keys.
    pub fn set_flags(&mut self, seq: &SeqNum, flags: OpFlags) {
        if let Some(op) = self.ops.get_mut(seq) {
            op.flags |= flags;
        }
    }

    /// Clear flag bits on an op.
    pub fn clear_flags(&mut self, seq: &SeqNum, flags: OpFlags) {
        if let Some(op) = self.ops.get_mut(seq) {
            op.flags &= !flags;
        }
    }

    /// Rewrite the opcode of an op, keeping operands.
    pub fn set_opcode(&mut self, seq: &SeqNum, opcode: OpCode) {
        if let Some(op) = self.ops.get_mut(seq) {
            op.opcode = opcode;
        }
    }

    /// Replace the inputs of an op.
    pub fn set_inputs(&mut self, seq: &SeqNum, inputs: Vec<VarnodeData>) {
        if let Some(op) = self.ops.get_mut(seq) {
            op.inputs = inputs.into();
        }
    }

    /// Remove every op of `addr` with time strictly greater than
    /// `time`; returns how many were dropped.
    pub fn truncate_after(&mut self, addr: &Address, time: u32) -> usize {
        let doomed: Vec<SeqNum> = self
            .ops
            .range((
                Bound::Excluded(SeqNum::new(addr.clone(), time)),
                Bound::Unbounded,
            ))
            .take_while(|(seq, _)| seq.addr() == addr)
            .map(|(seq, _)| seq.clone())
            .collect();
        let count = doomed.len();
        for seq in doomed {
            self.ops.remove(&seq);
        }
        count
    }
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

    fn op(space: &Arc<AddrSpace>, offset: u64, time: u32) -> PcodeOp {
        PcodeOp::new(
            SeqNum::new(Address::new(Arc::clone(space), offset), time),
            OpCode::Copy,
            None,
            [],
        )
    }

    #[test]
    fn iteration_follows_program_order() {
        let space = ram();
        let mut bank = OpBank::new();
        bank.insert(op(&space, 0x104, 0));
        bank.insert(op(&space, 0x100, 1));
        bank.insert(op(&space, 0x100, 0));
        let keys: Vec<(u64, u32)> = bank
            .keys()
            .map(|seq| (seq.addr().offset(), seq.time()))
            .collect();
        assert_eq!(keys, vec![(0x100, 0), (0x100, 1), (0x104, 0)]);
    }

    #[test]
    fn first_at_skips_other_addresses() {
        let space = ram();
        let mut bank = OpBank::new();
        bank.insert(op(&space, 0x104, 2));
        assert!(bank.first_at(&Address::new(Arc::clone(&space), 0x100)).is_none());
        assert_eq!(
            bank.first_at(&Address::new(Arc::clone(&space), 0x104))
                .unwrap()
                .seq
                .time(),
            2
        );
    }

    #[rstest::rstest]
    #[case(&[], 0)]
    #[case(&[0], 1)]
    #[case(&[0, 1], 2)]
    #[case(&[0, 1, 7], 8)]
    fn next_time_continues_per_address(#[case] times: &[u32], #[case] expect: u32) {
        let space = ram();
        let mut bank = OpBank::new();
        let addr = Address::new(Arc::clone(&space), 0x100);
        for &time in times {
            bank.insert(op(&space, 0x100, time));
        }
        assert_eq!(bank.next_time(&addr), expect);
    }

    #[test]
    fn truncation_drops_only_later_ops_of_instruction() {
        let space = ram();
        let mut bank = OpBank::new();
        for time in 0..4 {
            bank.insert(op(&space, 0x100, time));
        }
        bank.insert(op(&space, 0x104, 0));
        let addr = Address::new(Arc::clone(&space), 0x100);
        assert_eq!(bank.truncate_after(&addr, 1), 2);
        assert_eq!(bank.len(), 3);
        assert!(bank.get(&SeqNum::new(addr, 2)).is_none());
    }
}
