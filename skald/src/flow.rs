//! The flow follower.
//!
//! From an entry address, emits p-code for every reachable
//! instruction, tracking fall-through, branches, indirect jumps,
//! calls, injections and inlining, then partitions the op stream into
//! basic blocks. Recoverable conditions are governed by per-condition
//! policy flags; under the default policy they produce a header
//! warning and an artificial halt op.

use std::collections::BTreeMap;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use itertools::Itertools;
use smallvec::SmallVec;
use tracing::warn;

use skald_pcode::{
    calc_mask, AddrSpace, Address, OpCode, OpFlags, PcodeEmit, PcodeOp, SeqNum, VarnodeData,
};

use crate::block::BlockGraph;
use crate::callspecs::{CallSpecsRegistry, FuncCallSpecs, FunctionOracle};
use crate::error::FlowError;
use crate::inject::{InjectContext, InjectLibrary};
use crate::jumptable::{IndirectFailMode, JumpTable, JumpTableRecovery, TableOutcome};
use crate::lifter::InstructionLifter;
use crate::userop::UserOpRegistry;

/// The collaborators one flow generation runs against.
pub struct FlowEnv<'a> {
    /// Instruction decoder.
    pub lifter: &'a mut dyn InstructionLifter,
    /// Jump-table recovery.
    pub jump_recovery: &'a mut dyn JumpTableRecovery,
    /// User-op lookup for `CALLOTHER`.
    pub user_ops: &'a dyn UserOpRegistry,
    /// Callee knowledge for calls.
    pub oracle: &'a dyn FunctionOracle,
    /// Payload library, when injections are in play.
    pub inject: Option<&'a mut InjectLibrary>,
}

/// User-op index carried by rewritten unrecoverable indirect jumps.
const UNKNOWN_USEROP: u64 = 0xffff_ffff;

bitflags::bitflags! {
    /// Flow options and condition records.
    ///
    /// Each recoverable condition has an ignore bit and an error bit;
    /// with neither set the condition warns, which is the default.
    /// The `*_PRESENT` bits record that the condition occurred.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct FlowFlags: u32 {
        /// Silently tolerate out-of-bounds flow.
        const IGNORE_OUT_OF_BOUNDS = 0x0000_0001;
        /// Escalate out-of-bounds flow to a hard error.
        const ERROR_OUT_OF_BOUNDS = 0x0000_0002;
        /// Out-of-bounds flow occurred.
        const OUT_OF_BOUNDS_PRESENT = 0x0000_0004;
        /// Silently tolerate unimplemented instructions.
        const IGNORE_UNIMPLEMENTED = 0x0000_0008;
        /// Escalate unimplemented instructions to a hard error.
        const ERROR_UNIMPLEMENTED = 0x0000_0010;
        /// An unimplemented instruction was reached.
        const UNIMPLEMENTED_PRESENT = 0x0000_0020;
        /// Silently tolerate reinterpreted bytes.
        const IGNORE_REINTERPRETED = 0x0000_0040;
        /// Escalate reinterpreted bytes to a hard error.
        const ERROR_REINTERPRETED = 0x0000_0080;
        /// Overlapping instruction framing occurred.
        const REINTERPRETED_PRESENT = 0x0000_0100;
        /// Silently tolerate an exhausted instruction budget.
        const IGNORE_TOO_MANY_INSTRUCTIONS = 0x0000_0200;
        /// Escalate an exhausted instruction budget to a hard error.
        const ERROR_TOO_MANY_INSTRUCTIONS = 0x0000_0400;
        /// The instruction budget was exhausted.
        const TOO_MANY_INSTRUCTIONS_PRESENT = 0x0000_0800;
        /// Silently tolerate unreadable or undecodable bytes.
        const IGNORE_UNACCESSIBLE = 0x0000_1000;
        /// Escalate unreadable or undecodable bytes to a hard error.
        const ERROR_UNACCESSIBLE = 0x0000_2000;
        /// Unreadable or undecodable bytes were reached.
        const UNACCESSIBLE_PRESENT = 0x0000_4000;
        /// This flow expands a callee for in-place inlining.
        const FLOW_FOR_INLINE = 0x0001_0000;
        /// Record the table-load locations of recovered jump tables.
        const RECORD_JUMPLOADS = 0x0002_0000;
        /// Advisory: unreachable code is expected and acceptable.
        const POSSIBLE_UNREACHABLE = 0x0004_0000;
    }
}

/// Recoverable per-instruction conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowCondition {
    /// Flow left the permitted range.
    OutOfBounds,
    /// A decoded instruction has no semantics.
    Unimplemented,
    /// Bytes were decoded under conflicting framings.
    Reinterpreted,
    /// The instruction budget was exhausted.
    TooManyInstructions,
    /// Bytes could not be read or decoded.
    Unaccessible,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Policy {
    Ignore,
    Warn,
    Error,
}

/// What the follower knows about one visited address.
#[derive(Debug, Clone)]
pub struct VisitStat {
    /// Sequence number of the instruction's first op; absent when the
    /// instruction produced no ops.
    pub seqnum: Option<SeqNum>,
    /// Byte length of the instruction.
    pub size: usize,
}

/// The flow follower for one function.
pub struct FlowInfo {
    flags: FlowFlags,
    entry: Address,
    baddr: Address,
    eaddr: Address,
    insn_max: usize,
    insn_count: usize,
    const_space: Arc<AddrSpace>,
    bank: crate::opbank::OpBank,
    visited: BTreeMap<Address, VisitStat>,
    addrlist: Vec<Address>,
    unprocessed: Vec<Address>,
    tablelist: Vec<SeqNum>,
    table_retry: HashMap<SeqNum, u32>,
    injectlist: Vec<SeqNum>,
    qlst: CallSpecsRegistry,
    jump_tables: HashMap<SeqNum, JumpTable>,
    graph: BlockGraph,
    warnings: Vec<String>,
    inline_recursion: HashSet<Address>,
    truncated: bool,
}

#[derive(Default)]
struct OpCollector {
    ops: Vec<(OpCode, Option<VarnodeData>, SmallVec<[VarnodeData; 4]>)>,
}

impl PcodeEmit for OpCollector {
    fn dump(
        &mut self,
        _addr: &Address,
        opcode: OpCode,
        output: Option<&VarnodeData>,
        inputs: &[VarnodeData],
    ) {
        self.ops
            .push((opcode, output.cloned(), inputs.iter().cloned().collect()));
    }
}

impl FlowInfo {
    /// Create a follower for the function entered at `entry`,
    /// permitted to roam over `[baddr, eaddr]`.
    pub fn new(
        const_space: Arc<AddrSpace>,
        entry: Address,
        baddr: Address,
        eaddr: Address,
    ) -> Self {
        Self {
            flags: FlowFlags::default(),
            entry,
            baddr,
            eaddr,
            insn_max: u32::MAX as usize,
            insn_count: 0,
            const_space,
            bank: crate::opbank::OpBank::new(),
            visited: BTreeMap::new(),
            addrlist: Vec::new(),
            unprocessed: Vec::new(),
            tablelist: Vec::new(),
            table_retry: HashMap::new(),
            injectlist: Vec::new(),
            qlst: CallSpecsRegistry::new(),
            jump_tables: HashMap::new(),
            graph: BlockGraph::default(),
            warnings: Vec::new(),
            inline_recursion: HashSet::new(),
            truncated: false,
        }
    }

    /// Current option and record flags.
    pub fn flags(&self) -> FlowFlags {
        self.flags
    }

    /// Set option flags before generation.
    pub fn set_flags(&mut self, flags: FlowFlags) {
        self.flags = flags;
    }

    /// Bound the total instruction count.
    pub fn set_insn_max(&mut self, max: usize) {
        self.insn_max = max;
    }

    /// The generated op container.
    pub fn bank(&self) -> &crate::opbank::OpBank {
        &self.bank
    }

    /// The generated basic-block graph.
    pub fn graph(&self) -> &BlockGraph {
        &self.graph
    }

    /// The visited map.
    pub fn visited(&self) -> &BTreeMap<Address, VisitStat> {
        &self.visited
    }

    /// Addresses flow could not follow.
    pub fn unprocessed(&self) -> &[Address] {
        &self.unprocessed
    }

    /// Addresses still waiting on the work list.
    pub fn pending_addresses(&self) -> &[Address] {
        &self.addrlist
    }

    /// Header warnings accumulated under the warn policy.
    pub fn warnings(&self) -> &[String] {
        &self.warnings
    }

    /// The call-site registry.
    pub fn call_specs(&self) -> &CallSpecsRegistry {
        &self.qlst
    }

    /// Recovered jump tables by branch op.
    pub fn jump_tables(&self) -> &HashMap<SeqNum, JumpTable> {
        &self.jump_tables
    }

    /// Whether a condition occurred at least once.
    pub fn condition_present(&self, condition: FlowCondition) -> bool {
        self.flags.contains(present_bit(condition))
    }

    /// Follow all flow from the entry, filling the op bank.
    pub fn generate_ops(&mut self, env: &mut FlowEnv<'_>) -> Result<(), FlowError> {
        if !self.bank.is_empty() {
            return Err(FlowError::BlockGraph(
                "ops were already generated for this flow".into(),
            ));
        }
        self.flags &= !(FlowFlags::OUT_OF_BOUNDS_PRESENT
            | FlowFlags::UNIMPLEMENTED_PRESENT
            | FlowFlags::REINTERPRETED_PRESENT
            | FlowFlags::TOO_MANY_INSTRUCTIONS_PRESENT
            | FlowFlags::UNACCESSIBLE_PRESENT);
        // The function's own entry seeds the cycle guard, so a callee
        // calling back into us is never expanded in place.
        self.inline_recursion.insert(self.entry.clone());
        self.addrlist.push(self.entry.clone());
        while !self.addrlist.is_empty() {
            self.fallthru(env)?;
        }
        if !self.injectlist.is_empty() {
            self.inject_pcode(env)?;
        }
        loop {
            if self.tablelist.is_empty() {
                break;
            }
            let tables = std::mem::take(&mut self.tablelist);
            for seq in tables {
                self.process_jump_table(env, seq)?;
            }
            while !self.addrlist.is_empty() {
                self.fallthru(env)?;
            }
            self.check_contained_call();
            if !self.injectlist.is_empty() {
                self.inject_pcode(env)?;
            }
        }
        Ok(())
    }

    /// Partition the generated ops into basic blocks.
    pub fn generate_blocks(&mut self) -> Result<(), FlowError> {
        if !self.graph.is_empty() {
            return Err(FlowError::BlockGraph(
                "blocks were already generated for this flow".into(),
            ));
        }
        self.fill_in_halts();
        let edges = self.collect_edges()?;
        let entry_seq = self.target_seq(&self.entry);
        self.graph = BlockGraph::build(&self.bank, &edges, entry_seq.as_ref())?;
        Ok(())
    }

    fn in_range(&self, addr: &Address) -> bool {
        addr >= &self.baddr && addr <= &self.eaddr
    }

    /// Whether `addr` lies strictly inside an already-visited
    /// instruction's byte range.
    fn reinterpreted(&self, addr: &Address) -> bool {
        let Some((prev, stat)) = self.visited.range(..=addr.clone()).next_back() else {
            return false;
        };
        prev.same_space(addr) && prev != addr && prev.offset() + stat.size as u64 > addr.offset()
    }

    /// Process the top work-list address, decoding instructions until
    /// flow stops falling through or runs into known code.
    fn fallthru(&mut self, env: &mut FlowEnv<'_>) -> Result<(), FlowError> {
        let Some(mut curaddr) = self.addrlist.pop() else {
            return Ok(());
        };
        if self.truncated {
            self.unprocessed.push(curaddr);
            return Ok(());
        }
        if self.visited.contains_key(&curaddr) {
            self.mark_start_at(&curaddr);
            return Ok(());
        }
        let mut startbasic = true;
        loop {
            if self.reinterpreted(&curaddr) {
                self.record_condition(FlowCondition::Reinterpreted, &curaddr)?;
                self.unprocessed.push(curaddr);
                return Ok(());
            }
            let (fallthru, next_start, size) =
                self.process_instruction(env, &curaddr, startbasic)?;
            if self.truncated || !fallthru {
                return Ok(());
            }
            startbasic = next_start;
            let next = curaddr.wrap_add(size as u64);
            if !self.in_range(&next) {
                self.record_condition(FlowCondition::OutOfBounds, &next)?;
                self.unprocessed.push(next);
                return Ok(());
            }
            if self.visited.contains_key(&next) {
                self.mark_start_at(&next);
                return Ok(());
            }
            curaddr = next;
        }
    }

    /// Decode and xref one instruction. Returns (falls through, next
    /// instruction starts a block, byte size).
    fn process_instruction(
        &mut self,
        env: &mut FlowEnv<'_>,
        curaddr: &Address,
        startbasic: bool,
    ) -> Result<(bool, bool, usize), FlowError> {
        let mut collector = OpCollector::default();
        let step = match env.lifter.one_instruction(&mut collector, curaddr) {
            Ok(step) => step,
            Err(err) => return self.handle_decode_error(curaddr, startbasic, err),
        };

        self.insn_count += 1;
        if self.insn_count > self.insn_max {
            self.record_condition(FlowCondition::TooManyInstructions, curaddr)?;
            let seq = self.artificial_halt(curaddr, OpFlags::MISSING);
            if startbasic {
                self.bank.set_flags(&seq, OpFlags::BLOCK_START);
            }
            self.visited.insert(
                curaddr.clone(),
                VisitStat {
                    seqnum: Some(seq),
                    size: step,
                },
            );
            self.truncated = true;
            return Ok((false, startbasic, step));
        }

        let first_time = self.bank.next_time(curaddr);
        let mut time = first_time;
        let mut first_seq = None;
        for (opcode, output, inputs) in collector.ops {
            let seq = SeqNum::new(curaddr.clone(), time);
            time += 1;
            if first_seq.is_none() {
                first_seq = Some(seq.clone());
            }
            self.bank.insert(PcodeOp::new(seq, opcode, output, inputs));
        }
        self.visited.insert(
            curaddr.clone(),
            VisitStat {
                seqnum: first_seq.clone(),
                size: step,
            },
        );
        if startbasic {
            if let Some(seq) = &first_seq {
                self.bank.set_flags(seq, OpFlags::BLOCK_START);
            }
        }
        let (fallthru, mut next_start) =
            self.xref_control_flow(env, curaddr, first_time..time, step)?;
        if first_seq.is_none() {
            // An op-less instruction carries its pending block-start
            // mark forward to the next decoded op.
            next_start |= startbasic;
        }
        Ok((fallthru, next_start, step))
    }

    fn handle_decode_error(
        &mut self,
        curaddr: &Address,
        startbasic: bool,
        err: skald_sleigh::Error,
    ) -> Result<(bool, bool, usize), FlowError> {
        let (condition, halt_kind, size) = match &err {
            skald_sleigh::Error::Unimplemented { length, .. } => (
                FlowCondition::Unimplemented,
                OpFlags::UNIMPLEMENTED,
                (*length).max(1),
            ),
            skald_sleigh::Error::BadData { .. } | skald_sleigh::Error::DataUnavailable(_) => {
                (FlowCondition::Unaccessible, OpFlags::BAD_INSTRUCTION, 1)
            }
            _ => return Err(FlowError::Decode(err)),
        };
        if self.policy(condition) == Policy::Error {
            return Err(FlowError::Decode(err));
        }
        self.record_condition(condition, curaddr)?;
        let seq = self.artificial_halt(curaddr, halt_kind);
        if startbasic {
            self.bank.set_flags(&seq, OpFlags::BLOCK_START);
        }
        self.visited.insert(
            curaddr.clone(),
            VisitStat {
                seqnum: Some(seq),
                size,
            },
        );
        Ok((false, startbasic, size))
    }

    /// Examine the ops just emitted for one instruction, register
    /// control flow, and compute fall-through.
    fn xref_control_flow(
        &mut self,
        env: &mut FlowEnv<'_>,
        addr: &Address,
        times: std::ops::Range<u32>,
        step: usize,
    ) -> Result<(bool, bool), FlowError> {
        let mut seqs: Vec<SeqNum> = times
            .clone()
            .map(|time| SeqNum::new(addr.clone(), time))
            .collect();
        if seqs.is_empty() {
            // An instruction with no semantics still falls through.
            return Ok((true, false));
        }
        let end_time = times.end;

        // First pass: locate in-instruction relative targets.
        let mut max_internal: Option<u32> = None;
        for seq in &seqs {
            let input = match self.bank.get(seq) {
                Some(op) if matches!(op.opcode, OpCode::Branch | OpCode::CBranch) => {
                    match op.input(0) {
                        Some(vn) if vn.is_constant() => vn.clone(),
                        _ => continue,
                    }
                }
                _ => continue,
            };
            let delta = signed_value(input.offset, input.size);
            let target = seq.time() as i64 + delta;
            if target >= times.start as i64 && target < end_time as i64 {
                let target_seq = SeqNum::new(addr.clone(), target as u32);
                max_internal = Some(max_internal.map_or(target as u32, |m| m.max(target as u32)));
                self.bank.set_flags(&target_seq, OpFlags::BLOCK_START);
            } else if target == end_time as i64 {
                // A relative branch one past the last op is a branch
                // to the fall-through instruction.
                let fall = addr.wrap_add(step as u64);
                let vn = VarnodeData::new(
                    fall.space().clone(),
                    fall.offset(),
                    fall.space().addr_size(),
                );
                if let Some(op) = self.bank.get_mut(seq) {
                    op.inputs[0] = vn;
                }
            } else {
                self.warnings
                    .push(format!("relative branch at {seq} has no target"));
            }
        }

        // Second pass: register control flow per op.
        let mut startbasic = false;
        let mut index = 0;
        while index < seqs.len() {
            let seq = seqs[index].clone();
            let Some(op) = self.bank.get(&seq).cloned() else {
                index += 1;
                continue;
            };
            match op.opcode {
                OpCode::Branch | OpCode::CBranch => {
                    let Some(input) = op.input(0) else {
                        index += 1;
                        continue;
                    };
                    if input.is_constant() {
                        if op.opcode == OpCode::Branch
                            && max_internal.map_or(true, |max| seq.time() >= max)
                        {
                            // Nothing branches past this point; the
                            // remaining ops of the instruction are
                            // unreachable.
                            self.bank.truncate_after(addr, seq.time());
                            seqs.truncate(index + 1);
                            break;
                        }
                    } else {
                        let target =
                            Address::new(input.space.clone(), input.offset);
                        self.new_address(target)?;
                        startbasic = true;
                    }
                    if op.opcode == OpCode::CBranch {
                        // The not-taken side begins a fresh block.
                        match seqs.get(index + 1) {
                            Some(next) => {
                                let next = next.clone();
                                self.bank.set_flags(&next, OpFlags::BLOCK_START);
                            }
                            None => startbasic = true,
                        }
                    }
                }
                OpCode::BranchInd => {
                    self.tablelist.push(seq.clone());
                    startbasic = true;
                }
                OpCode::Call | OpCode::CallInd => {
                    self.setup_call(env, &seq, &op, addr)?;
                }
                OpCode::CallOther => {
                    let index_in = op.input(0).filter(|vn| vn.is_constant());
                    if let Some(vn) = index_in {
                        let has_inject = env
                            .user_ops
                            .get_op(vn.offset as usize)
                            .and_then(|uop| uop.injection)
                            .is_some();
                        if has_inject {
                            self.injectlist.push(seq.clone());
                        }
                    }
                }
                _ => {}
            }
            index += 1;
        }

        // Fall-through is decided by the last op now standing at the
        // address, which includes any artificial halt appended above.
        let fallthru = match self.bank.at_address(addr).last() {
            Some(op) => !matches!(
                op.opcode,
                OpCode::Branch | OpCode::BranchInd | OpCode::Return
            ),
            None => true,
        };
        Ok((fallthru, startbasic))
    }

    fn setup_call(
        &mut self,
        env: &mut FlowEnv<'_>,
        seq: &SeqNum,
        op: &PcodeOp,
        addr: &Address,
    ) -> Result<(), FlowError> {
        let entry = if op.opcode == OpCode::Call {
            op.input(0)
                .filter(|vn| !vn.is_constant())
                .map(|vn| Address::new(vn.space.clone(), vn.offset))
        } else {
            None
        };
        let props = entry
            .as_ref()
            .map(|e| env.oracle.properties(e))
            .unwrap_or_default();
        let specs = FuncCallSpecs {
            op: seq.clone(),
            call_addr: addr.clone(),
            entry,
            is_inline: props.is_inline,
            is_noreturn: props.is_noreturn,
            fixup: props.call_fixup,
        };
        if specs.is_inline || specs.fixup.is_some() {
            self.injectlist.push(seq.clone());
        }
        let noreturn = specs.is_noreturn;
        self.qlst.insert(specs);
        if noreturn {
            self.artificial_halt(addr, OpFlags::NO_RETURN);
        }
        Ok(())
    }

    /// Route a branch target: out-of-bounds targets become
    /// unprocessed, known targets mark a block start, new targets
    /// join the work list.
    fn new_address(&mut self, target: Address) -> Result<(), FlowError> {
        if !self.in_range(&target) {
            self.record_condition(FlowCondition::OutOfBounds, &target)?;
            self.unprocessed.push(target);
            return Ok(());
        }
        if self.visited.contains_key(&target) {
            self.mark_start_at(&target);
            return Ok(());
        }
        self.addrlist.push(target);
        Ok(())
    }

    /// Mark the first op at or after a visited address as a block
    /// start, skipping instructions that produced no ops.
    fn mark_start_at(&mut self, addr: &Address) {
        if let Some(seq) = self.target_seq(addr) {
            self.bank.set_flags(&seq, OpFlags::BLOCK_START);
        }
    }

    /// First op of the instruction at `addr`, falling forward through
    /// op-less instructions.
    fn target_seq(&self, addr: &Address) -> Option<SeqNum> {
        for (_, stat) in self.visited.range(addr.clone()..) {
            if let Some(seq) = &stat.seqnum {
                return Some(seq.clone());
            }
        }
        None
    }

    fn process_jump_table(
        &mut self,
        env: &mut FlowEnv<'_>,
        seq: SeqNum,
    ) -> Result<(), FlowError> {
        let Some(op) = self.bank.get(&seq).cloned() else {
            return Ok(());
        };
        if op.opcode != OpCode::BranchInd {
            return Ok(());
        }
        match env.jump_recovery.find_jump_table(&op) {
            TableOutcome::Table(mut table) => {
                for target in &table.targets {
                    self.new_address(target.clone())?;
                }
                if !self.flags.contains(FlowFlags::RECORD_JUMPLOADS) {
                    table.load_points.clear();
                }
                self.jump_tables.insert(seq, table);
            }
            TableOutcome::Incomplete => {
                let retries = self.table_retry.entry(seq.clone()).or_insert(0);
                if *retries < 1 {
                    *retries += 1;
                    self.tablelist.push(seq);
                } else {
                    self.truncate_indirect_jump(&seq, IndirectFailMode::Default);
                }
            }
            TableOutcome::Fail(mode) => self.truncate_indirect_jump(&seq, mode),
        }
        Ok(())
    }

    /// Rewrite an unrecoverable indirect jump per the fail mode.
    fn truncate_indirect_jump(&mut self, seq: &SeqNum, mode: IndirectFailMode) {
        let addr = seq.addr().clone();
        match mode {
            IndirectFailMode::Return => {
                // The computed target is really a return value.
                self.bank.set_opcode(seq, OpCode::Return);
            }
            IndirectFailMode::Thunk => {
                self.bank.set_opcode(seq, OpCode::CallInd);
                self.qlst.insert(FuncCallSpecs {
                    op: seq.clone(),
                    call_addr: addr.clone(),
                    entry: None,
                    is_inline: false,
                    is_noreturn: true,
                    fixup: None,
                });
                self.artificial_halt(&addr, OpFlags::NO_RETURN);
            }
            IndirectFailMode::CallOther | IndirectFailMode::Default => {
                let target = self
                    .bank
                    .get(seq)
                    .and_then(|op| op.input(0))
                    .cloned();
                self.bank.set_opcode(seq, OpCode::CallOther);
                let mut inputs = vec![VarnodeData::constant(
                    Arc::clone(&self.const_space),
                    UNKNOWN_USEROP,
                    4,
                )];
                inputs.extend(target);
                self.bank.set_inputs(seq, inputs);
                self.artificial_halt(&addr, OpFlags::NO_RETURN);
            }
        }
        self.warnings
            .push(format!("unrecoverable indirect jump at {addr}"));
    }

    /// Convert calls that land inside already-visited instructions of
    /// this same function into plain branches.
    fn check_contained_call(&mut self) {
        let candidates: Vec<(SeqNum, Address)> = self
            .qlst
            .iter()
            .filter_map(|specs| {
                let entry = specs.entry.clone()?;
                let op = self.bank.get(&specs.op)?;
                (op.opcode == OpCode::Call).then_some((specs.op.clone(), entry))
            })
            .collect();
        for (seq, entry) in candidates {
            let Some((prev, stat)) = self.visited.range(..=entry.clone()).next_back() else {
                continue;
            };
            if !prev.same_space(&entry) {
                continue;
            }
            if prev.offset() + stat.size as u64 <= entry.offset() {
                continue;
            }
            self.bank.set_opcode(&seq, OpCode::Branch);
            self.qlst.remove(&seq);
            if self.visited.contains_key(&entry) {
                self.mark_start_at(&entry);
            } else {
                self.unprocessed.push(entry);
            }
            if let Some(next) = self.bank.next_after(&seq).map(|op| op.seq.clone()) {
                self.bank.set_flags(&next, OpFlags::BLOCK_START);
            }
        }
    }

    /// Apply pending injections: call fix-ups, user-op fix-ups and
    /// in-place inlining.
    fn inject_pcode(&mut self, env: &mut FlowEnv<'_>) -> Result<(), FlowError> {
        let list = std::mem::take(&mut self.injectlist);
        for seq in list {
            let Some(op) = self.bank.get(&seq).cloned() else {
                continue;
            };
            let payload_id = match op.opcode {
                OpCode::CallOther => op
                    .input(0)
                    .and_then(|vn| env.user_ops.get_op(vn.offset as usize))
                    .and_then(|uop| uop.injection),
                OpCode::Call | OpCode::CallInd => {
                    let specs = self.qlst.get(&seq).cloned();
                    match specs {
                        Some(specs) if specs.is_inline => {
                            self.inline_call(env, &seq, &specs)?;
                            continue;
                        }
                        Some(specs) => specs.fixup,
                        None => None,
                    }
                }
                _ => None,
            };
            let Some(payload_id) = payload_id else {
                continue;
            };
            self.apply_injection(env, &seq, &op, payload_id)?;
        }
        Ok(())
    }

    fn apply_injection(
        &mut self,
        env: &mut FlowEnv<'_>,
        seq: &SeqNum,
        op: &PcodeOp,
        payload_id: usize,
    ) -> Result<(), FlowError> {
        let Some(library) = env.inject.as_deref_mut() else {
            self.warnings.push(format!(
                "op at {seq} requests injection but no library is attached"
            ));
            return Ok(());
        };
        let addr = seq.addr().clone();
        let entry = self.qlst.get(seq).and_then(|specs| specs.entry.clone());
        let context = InjectContext {
            base_addr: Some(addr.clone()),
            call_addr: entry,
            inputs: op.inputs.iter().skip(1).cloned().collect(),
            output: op.output.clone(),
        };
        let mut collector = OpCollector::default();
        library
            .get_payload(payload_id)?
            .inject(&context, &mut collector)?;

        let had_start = op.starts_block();
        if self.bank.next_after(seq).is_some_and(|next| next.seq.addr() == &addr) {
            self.warnings.push(format!(
                "injection at {seq} is not the last op of its instruction"
            ));
        }
        self.bank.remove(seq);
        self.qlst.remove(seq);

        let first_time = self.bank.next_time(&addr);
        let mut time = first_time;
        for (opcode, output, inputs) in collector.ops {
            let new_seq = SeqNum::new(addr.clone(), time);
            time += 1;
            self.bank
                .insert(PcodeOp::new(new_seq, opcode, output, inputs));
        }
        if had_start && time > first_time {
            self.bank
                .set_flags(&SeqNum::new(addr.clone(), first_time), OpFlags::BLOCK_START);
        }
        if self.visited.get(&addr).is_some_and(|stat| stat.seqnum.is_none())
            || self.visited.get(&addr).and_then(|s| s.seqnum.as_ref()) == Some(seq)
        {
            if let Some(stat) = self.visited.get_mut(&addr) {
                stat.seqnum = Some(SeqNum::new(addr.clone(), first_time));
            }
        }
        // Injected ops may branch or call; run them through the same
        // cross-referencing as decoded ops.
        let step = self.visited.get(&addr).map(|stat| stat.size).unwrap_or(1);
        self.xref_control_flow(env, &addr, first_time..time, step)?;
        while !self.addrlist.is_empty() {
            self.fallthru(env)?;
        }
        Ok(())
    }

    /// Expand an inline call in place, guarding against cycles.
    fn inline_call(
        &mut self,
        env: &mut FlowEnv<'_>,
        seq: &SeqNum,
        specs: &FuncCallSpecs,
    ) -> Result<(), FlowError> {
        let Some(entry) = specs.entry.clone() else {
            return Ok(());
        };
        if self.inline_recursion.contains(&entry) {
            self.warnings
                .push(format!("could not inline here: {seq} re-enters {entry}"));
            if let Some(specs) = self.qlst.get_mut(seq) {
                specs.is_inline = false;
            }
            return Ok(());
        }
        if entry == *seq.addr() {
            self.warnings
                .push(format!("could not inline here: {seq} lands on itself"));
            if let Some(specs) = self.qlst.get_mut(seq) {
                specs.is_inline = false;
            }
            return Ok(());
        }
        self.inline_recursion.insert(entry.clone());

        let mut sub = FlowInfo::new(
            Arc::clone(&self.const_space),
            entry.clone(),
            self.baddr.clone(),
            self.eaddr.clone(),
        );
        sub.set_flags(self.flags | FlowFlags::FLOW_FOR_INLINE);
        sub.set_insn_max(self.insn_max.saturating_sub(self.insn_count));
        sub.inline_recursion = std::mem::take(&mut self.inline_recursion);
        let res = sub.generate_ops(env);
        self.inline_recursion = std::mem::take(&mut sub.inline_recursion);
        self.warnings.append(&mut sub.warnings);

        if res.is_err() {
            self.warnings
                .push(format!("could not inline function at {entry}"));
            if let Some(specs) = self.qlst.get_mut(seq) {
                specs.is_inline = false;
            }
            return Ok(());
        }

        if sub.is_ez_body() {
            self.inline_ez(seq, sub);
        } else {
            self.inline_hard(seq, &entry, sub);
        }
        Ok(())
    }

    /// Whether a sub-flow qualifies for the EZ model: straight-line
    /// leaf code with at most a trailing return.
    fn is_ez_body(&self) -> bool {
        let count = self.bank.len();
        for (index, op) in self.bank.iter().enumerate() {
            let last = index + 1 == count;
            match op.opcode {
                OpCode::Return if last => {}
                OpCode::Branch
                | OpCode::CBranch
                | OpCode::BranchInd
                | OpCode::Call
                | OpCode::CallInd
                | OpCode::CallOther
                | OpCode::Return => return false,
                _ => {}
            }
        }
        true
    }

    /// Splice a straight-line callee directly at the call site under
    /// the caller's own address.
    fn inline_ez(&mut self, seq: &SeqNum, sub: FlowInfo) {
        let addr = seq.addr().clone();
        let had_start = self
            .bank
            .get(seq)
            .is_some_and(|op| op.starts_block());
        self.bank.remove(seq);
        self.qlst.remove(seq);
        let first_time = self.bank.next_time(&addr);
        let mut time = first_time;
        let count = sub.bank.len();
        for (index, op) in sub.bank.iter().enumerate() {
            if index + 1 == count && op.opcode == OpCode::Return {
                break;
            }
            let new_seq = SeqNum::new(addr.clone(), time);
            time += 1;
            self.bank.insert(PcodeOp::new(
                new_seq,
                op.opcode,
                op.output.clone(),
                op.inputs.iter().cloned(),
            ));
        }
        if had_start && time > first_time {
            self.bank
                .set_flags(&SeqNum::new(addr, first_time), OpFlags::BLOCK_START);
        }
    }

    /// Clone a full callee flow into this one, preserving its
    /// addresses; returns replace the original fall-through.
    fn inline_hard(&mut self, seq: &SeqNum, entry: &Address, mut sub: FlowInfo) {
        let call_addr = seq.addr().clone();
        let fall_addr = self
            .visited
            .get(&call_addr)
            .map(|stat| call_addr.wrap_add(stat.size as u64));
        let Some(fall_addr) = fall_addr else {
            self.warnings
                .push(format!("could not inline here: {seq} has no fall-through"));
            if let Some(specs) = self.qlst.get_mut(seq) {
                specs.is_inline = false;
            }
            return;
        };
        for op in sub.bank.iter() {
            if self.bank.get(&op.seq).is_some() {
                self.warnings.push(format!(
                    "could not inline here: {seq} body collides at {}",
                    op.seq
                ));
                if let Some(specs) = self.qlst.get_mut(seq) {
                    specs.is_inline = false;
                }
                return;
            }
        }

        let fall_vn = VarnodeData::new(
            fall_addr.space().clone(),
            fall_addr.offset(),
            fall_addr.space().addr_size(),
        );
        let cloned: Vec<PcodeOp> = sub.bank.iter().cloned().collect();
        for mut op in cloned {
            if op.opcode == OpCode::Return {
                op.opcode = OpCode::Branch;
                op.inputs = [fall_vn.clone()].into_iter().collect();
            }
            self.bank.insert(op);
        }
        self.visited.append(&mut sub.visited);
        self.unprocessed.append(&mut sub.unprocessed);
        for specs in sub.qlst.iter() {
            self.qlst.insert(specs.clone());
        }
        self.jump_tables.extend(sub.jump_tables);
        self.flags |= sub.flags
            & (FlowFlags::OUT_OF_BOUNDS_PRESENT
                | FlowFlags::UNIMPLEMENTED_PRESENT
                | FlowFlags::REINTERPRETED_PRESENT
                | FlowFlags::TOO_MANY_INSTRUCTIONS_PRESENT
                | FlowFlags::UNACCESSIBLE_PRESENT);

        // The call op becomes a branch into the cloned body.
        self.bank.set_opcode(seq, OpCode::Branch);
        let entry_vn = VarnodeData::new(
            entry.space().clone(),
            entry.offset(),
            entry.space().addr_size(),
        );
        self.bank.set_inputs(seq, vec![entry_vn]);
        self.qlst.remove(seq);
        self.mark_start_at(entry);
        self.mark_start_at(&fall_addr);
    }

    /// Append an artificial halt op at `addr` carrying `kind`.
    fn artificial_halt(&mut self, addr: &Address, kind: OpFlags) -> SeqNum {
        let time = self.bank.next_time(addr);
        let seq = SeqNum::new(addr.clone(), time);
        let mut op = PcodeOp::new(
            seq.clone(),
            OpCode::Return,
            None,
            [VarnodeData::constant(Arc::clone(&self.const_space), 0, 4)],
        );
        op.flags |= OpFlags::HALT | kind;
        self.bank.insert(op);
        seq
    }

    /// Give every unprocessed address an artificial halt so branches
    /// into it have a target.
    fn fill_in_halts(&mut self) {
        let pending = std::mem::take(&mut self.unprocessed);
        let mut filled = Vec::with_capacity(pending.len());
        for addr in pending.into_iter().sorted().dedup() {
            if !self.visited.contains_key(&addr) {
                let seq = self.artificial_halt(&addr, OpFlags::MISSING);
                self.bank.set_flags(&seq, OpFlags::BLOCK_START);
                self.visited.insert(
                    addr.clone(),
                    VisitStat {
                        seqnum: Some(seq),
                        size: 1,
                    },
                );
            }
            filled.push(addr);
        }
        self.unprocessed = filled;
    }

    /// Collect op-to-op control-flow edges.
    fn collect_edges(&mut self) -> Result<Vec<(SeqNum, SeqNum)>, FlowError> {
        let seq_list: Vec<SeqNum> = self.bank.keys().cloned().collect();
        let mut edges = Vec::new();
        for (index, seq) in seq_list.iter().enumerate() {
            let Some(op) = self.bank.get(seq).cloned() else {
                continue;
            };
            match op.opcode {
                OpCode::Branch => {
                    if let Some(target) = self.op_target(&op) {
                        edges.push((seq.clone(), target));
                    }
                }
                OpCode::CBranch => {
                    if let Some(next) = seq_list.get(index + 1) {
                        edges.push((seq.clone(), next.clone()));
                    }
                    if let Some(target) = self.op_target(&op) {
                        edges.push((seq.clone(), target));
                    }
                }
                OpCode::BranchInd => {
                    if let Some(table) = self.jump_tables.get(seq) {
                        // Deduplicate repeated table entries through
                        // per-op mark bits.
                        let mut marked = Vec::new();
                        let targets = table.targets.clone();
                        for target_addr in targets {
                            let Some(target) = self.resolve_flow_target(&target_addr) else {
                                continue;
                            };
                            let already = self
                                .bank
                                .get(&target)
                                .is_some_and(|op| op.flags.contains(OpFlags::MARK));
                            if already {
                                continue;
                            }
                            self.bank.set_flags(&target, OpFlags::MARK);
                            marked.push(target.clone());
                            edges.push((seq.clone(), target));
                        }
                        for target in marked {
                            self.bank.clear_flags(&target, OpFlags::MARK);
                        }
                    }
                }
                OpCode::Return => {}
                _ => {
                    // Ordinary fall-through into a following block.
                    if let Some(next) = seq_list.get(index + 1) {
                        let next_starts = self
                            .bank
                            .get(next)
                            .is_some_and(|op| op.starts_block());
                        if next_starts {
                            edges.push((seq.clone(), next.clone()));
                        }
                    }
                }
            }
        }
        Ok(edges)
    }

    /// Resolve a branch op's target to an op.
    fn op_target(&self, op: &PcodeOp) -> Option<SeqNum> {
        let input = op.input(0)?;
        if input.is_constant() {
            let delta = signed_value(input.offset, input.size);
            let target = op.seq.time() as i64 + delta;
            Some(SeqNum::new(op.seq.addr().clone(), target as u32))
        } else {
            self.resolve_flow_target(&Address::new(input.space.clone(), input.offset))
        }
    }

    fn resolve_flow_target(&self, addr: &Address) -> Option<SeqNum> {
        self.target_seq(addr)
    }

    fn policy(&self, condition: FlowCondition) -> Policy {
        let (ignore, error) = match condition {
            FlowCondition::OutOfBounds => (
                FlowFlags::IGNORE_OUT_OF_BOUNDS,
                FlowFlags::ERROR_OUT_OF_BOUNDS,
            ),
            FlowCondition::Unimplemented => (
                FlowFlags::IGNORE_UNIMPLEMENTED,
                FlowFlags::ERROR_UNIMPLEMENTED,
            ),
            FlowCondition::Reinterpreted => (
                FlowFlags::IGNORE_REINTERPRETED,
                FlowFlags::ERROR_REINTERPRETED,
            ),
            FlowCondition::TooManyInstructions => (
                FlowFlags::IGNORE_TOO_MANY_INSTRUCTIONS,
                FlowFlags::ERROR_TOO_MANY_INSTRUCTIONS,
            ),
            FlowCondition::Unaccessible => (
                FlowFlags::IGNORE_UNACCESSIBLE,
                FlowFlags::ERROR_UNACCESSIBLE,
            ),
        };
        if self.flags.contains(ignore) {
            Policy::Ignore
        } else if self.flags.contains(error) {
            Policy::Error
        } else {
            Policy::Warn
        }
    }

    fn record_condition(
        &mut self,
        condition: FlowCondition,
        addr: &Address,
    ) -> Result<(), FlowError> {
        self.flags |= present_bit(condition);
        match self.policy(condition) {
            Policy::Ignore => Ok(()),
            Policy::Warn => {
                let message = condition_message(condition, addr);
                warn!(%addr, ?condition, "flow warning");
                self.warnings.push(message);
                Ok(())
            }
            Policy::Error => Err(match condition {
                FlowCondition::OutOfBounds => FlowError::OutOfBounds { addr: addr.clone() },
                FlowCondition::Reinterpreted => {
                    FlowError::Reinterpreted { addr: addr.clone() }
                }
                FlowCondition::TooManyInstructions => FlowError::TooManyInstructions {
                    max: self.insn_max,
                },
                FlowCondition::Unimplemented | FlowCondition::Unaccessible => {
                    FlowError::Decode(skald_sleigh::Error::BadData { addr: addr.clone() })
                }
            }),
        }
    }
}

fn present_bit(condition: FlowCondition) -> FlowFlags {
    match condition {
        FlowCondition::OutOfBounds => FlowFlags::OUT_OF_BOUNDS_PRESENT,
        FlowCondition::Unimplemented => FlowFlags::UNIMPLEMENTED_PRESENT,
        FlowCondition::Reinterpreted => FlowFlags::REINTERPRETED_PRESENT,
        FlowCondition::TooManyInstructions => FlowFlags::TOO_MANY_INSTRUCTIONS_PRESENT,
        FlowCondition::Unaccessible => FlowFlags::UNACCESSIBLE_PRESENT,
    }
}

fn condition_message(condition: FlowCondition, addr: &Address) -> String {
    match condition {
        FlowCondition::OutOfBounds => format!("flow out of bounds at {addr}"),
        FlowCondition::Unimplemented => {
            format!("unimplemented instruction at {addr}, truncating control flow")
        }
        FlowCondition::Reinterpreted => {
            format!("instruction at {addr} reinterprets already-decoded bytes")
        }
        FlowCondition::TooManyInstructions => {
            format!("flow exceeded the instruction budget at {addr}")
        }
        FlowCondition::Unaccessible => {
            format!("bad or unavailable instruction bytes at {addr}, truncating control flow")
        }
    }
}

fn signed_value(raw: u64, size: u32) -> i64 {
    let mask = calc_mask(size);
    let value = raw & mask;
    let width = u64::from(size) * 8;
    if width >= 64 {
        value as i64
    } else if (value >> (width - 1)) & 1 == 1 {
        (value | !mask) as i64
    } else {
        value as i64
    }
}
