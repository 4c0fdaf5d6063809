//! End-to-end flow-follower scenarios over scripted instruction
//! streams.

use std::sync::Arc;

use hashbrown::HashMap;

use skald::skald_pcode::{
    AddrSpace, Address, OpCode, OpFlags, PcodeEmit, SeqNum, SpaceFlags, SpaceKind, SpaceManager,
    VarnodeData,
};
use skald::{
    FlowCondition, FlowEnv, FlowFlags, FlowInfo, FunctionOracle, FunctionProps, InjectLibrary,
    InjectParameter, InstructionLifter, JumpTable, JumpTableRecovery, NoFunctionInfo,
    NoJumpTables, NoUserOps, TableOutcome, UserOp, UserOpLibrary,
};

/// One scripted op of a scripted instruction.
#[derive(Debug, Clone)]
enum Op {
    /// Plain arithmetic op with no control flow.
    Add,
    /// Return from the function.
    Ret,
    /// Unconditional branch to an absolute byte offset.
    Branch(u64),
    /// Conditional branch to an absolute byte offset.
    CBranch(u64),
    /// Conditional branch by relative op ticks within the
    /// instruction.
    CBranchRel(i64),
    /// Direct call to an absolute byte offset.
    Call(u64),
    /// Indirect branch through a register.
    BranchInd,
    /// User-defined op by index.
    CallOther(usize),
}

struct Machine {
    ram: Arc<AddrSpace>,
    constant: Arc<AddrSpace>,
    unique: Arc<AddrSpace>,
}

impl Machine {
    fn new() -> Self {
        let mut manager = SpaceManager::new();
        let ram = manager
            .insert(AddrSpace::new(
                "ram",
                SpaceKind::Processor,
                1,
                4,
                1,
                SpaceFlags::HAS_PHYSICAL,
                0,
            ))
            .unwrap();
        let unique = manager
            .insert(AddrSpace::new(
                "unique",
                SpaceKind::Internal,
                2,
                4,
                1,
                SpaceFlags::empty(),
                0,
            ))
            .unwrap();
        Self {
            ram,
            constant: manager.constant_space(),
            unique,
        }
    }

    fn at(&self, offset: u64) -> Address {
        Address::new(Arc::clone(&self.ram), offset)
    }

    fn reg(&self, offset: u64) -> VarnodeData {
        VarnodeData::new(Arc::clone(&self.ram), 0x10_0000 + offset, 8)
    }

    fn code(&self, offset: u64) -> VarnodeData {
        VarnodeData::new(Arc::clone(&self.ram), offset, 4)
    }

    fn konst(&self, value: u64, size: u32) -> VarnodeData {
        VarnodeData::constant(Arc::clone(&self.constant), value, size)
    }
}

/// Scripted instruction stream keyed by byte offset.
struct ScriptedLifter {
    machine: Machine,
    instructions: HashMap<u64, (usize, Vec<Op>)>,
}

impl ScriptedLifter {
    fn new(program: &[(u64, usize, Vec<Op>)]) -> Self {
        let machine = Machine::new();
        let instructions = program
            .iter()
            .map(|(offset, size, ops)| (*offset, (*size, ops.clone())))
            .collect();
        Self {
            machine,
            instructions,
        }
    }
}

impl InstructionLifter for ScriptedLifter {
    fn one_instruction(
        &mut self,
        emit: &mut dyn PcodeEmit,
        addr: &Address,
    ) -> Result<usize, skald::skald_sleigh::Error> {
        let Some((size, ops)) = self.instructions.get(&addr.offset()) else {
            return Err(skald::skald_sleigh::Error::BadData { addr: addr.clone() });
        };
        let m = &self.machine;
        for op in ops {
            match op {
                Op::Add => emit.dump(
                    addr,
                    OpCode::IntAdd,
                    Some(&m.reg(0)),
                    &[m.reg(0), m.konst(1, 8)],
                ),
                Op::Ret => emit.dump(addr, OpCode::Return, None, &[m.reg(8)]),
                Op::Branch(target) => {
                    emit.dump(addr, OpCode::Branch, None, &[m.code(*target)])
                }
                Op::CBranch(target) => emit.dump(
                    addr,
                    OpCode::CBranch,
                    None,
                    &[m.code(*target), m.konst(1, 1)],
                ),
                Op::CBranchRel(ticks) => emit.dump(
                    addr,
                    OpCode::CBranch,
                    None,
                    &[m.konst(*ticks as u64, 4), m.konst(1, 1)],
                ),
                Op::Call(target) => emit.dump(addr, OpCode::Call, None, &[m.code(*target)]),
                Op::BranchInd => emit.dump(addr, OpCode::BranchInd, None, &[m.reg(16)]),
                Op::CallOther(index) => emit.dump(
                    addr,
                    OpCode::CallOther,
                    Some(&m.reg(0)),
                    &[m.konst(*index as u64, 4), m.reg(0)],
                ),
            }
        }
        Ok(*size)
    }
}

fn flow_over(lifter: &ScriptedLifter, entry: u64) -> FlowInfo {
    FlowInfo::new(
        Arc::clone(&lifter.machine.constant),
        lifter.machine.at(entry),
        lifter.machine.at(0),
        lifter.machine.at(0xffff),
    )
}

fn run(
    lifter: &mut ScriptedLifter,
    flow: &mut FlowInfo,
    oracle: &dyn FunctionOracle,
) -> Result<(), skald::FlowError> {
    let mut recovery = NoJumpTables;
    let mut env = FlowEnv {
        lifter,
        jump_recovery: &mut recovery,
        user_ops: &NoUserOps,
        oracle,
        inject: None,
    };
    flow.generate_ops(&mut env)
}

fn assert_visited_invariant(flow: &FlowInfo) {
    // Every visited entry's recorded sequence number names an op
    // decoded at that same address.
    for (addr, stat) in flow.visited() {
        if let Some(seq) = &stat.seqnum {
            let op = flow.bank().get(seq).expect("visited op exists");
            assert_eq!(op.seq.addr(), addr);
        }
    }
}

fn assert_fallthru_closure(flow: &FlowInfo) {
    // Every branch to an address lands on a block start or on an
    // artificial halt filled in for an unfollowed address.
    for op in flow.bank().iter() {
        if !matches!(op.opcode, OpCode::Branch | OpCode::CBranch) {
            continue;
        }
        let Some(input) = op.input(0) else { continue };
        if input.is_constant() {
            continue;
        }
        let target = Address::new(input.space.clone(), input.offset);
        let target_op = flow
            .bank()
            .first_at(&target)
            .unwrap_or_else(|| panic!("branch target {target} has no op"));
        assert!(
            target_op.starts_block() || target_op.flags.contains(OpFlags::HALT),
            "branch target {target} neither starts a block nor halts"
        );
    }
}

fn assert_block_invariants(flow: &FlowInfo) {
    assert_visited_invariant(flow);
    assert_fallthru_closure(flow);
    // Every op belongs to exactly one block and block op lists are
    // sorted by sequence number.
    let mut seen = 0usize;
    for block in flow.graph().iter() {
        let mut prev: Option<&SeqNum> = None;
        for seq in &block.ops {
            assert!(flow.bank().get(seq).is_some(), "block op {seq} not in bank");
            if let Some(prev) = prev {
                assert!(prev < seq, "block ops out of order");
            }
            prev = Some(seq);
            seen += 1;
        }
    }
    assert_eq!(seen, flow.bank().len(), "op assigned to no block or to two");

    // Every non-entry block has at least one incoming edge.
    let entry = flow.graph().entry().expect("graph has an entry");
    for block in flow.graph().iter() {
        if block.index != entry {
            assert!(
                !block.in_edges.is_empty(),
                "block {} has no incoming edge",
                block.index
            );
        }
    }
}

#[test]
fn straight_line_decode() {
    let mut lifter = ScriptedLifter::new(&[
        (0x1000, 2, vec![Op::Add]),
        (0x1002, 2, vec![Op::Add]),
        (0x1004, 2, vec![Op::Add]),
        (0x1006, 2, vec![Op::Ret]),
    ]);
    let mut flow = flow_over(&lifter, 0x1000);
    run(&mut lifter, &mut flow, &NoFunctionInfo).unwrap();

    let visited: Vec<u64> = flow.visited().keys().map(Address::offset).collect();
    assert_eq!(visited, vec![0x1000, 0x1002, 0x1004, 0x1006]);
    assert!(flow.pending_addresses().is_empty());
    assert!(flow.unprocessed().is_empty());

    flow.generate_blocks().unwrap();
    assert_eq!(flow.graph().len(), 1);
    let block = flow.graph().block(0).unwrap();
    assert_eq!(block.ops.len(), 4);
    assert_block_invariants(&flow);
}

#[test]
fn single_forward_branch_skips_dead_bytes() {
    let mut lifter = ScriptedLifter::new(&[
        (0x100, 4, vec![Op::Branch(0x108)]),
        (0x104, 4, vec![Op::Add]),
        (0x108, 4, vec![Op::Ret]),
    ]);
    let mut flow = flow_over(&lifter, 0x100);
    run(&mut lifter, &mut flow, &NoFunctionInfo).unwrap();

    assert!(flow.visited().contains_key(&lifter.machine.at(0x100)));
    assert!(flow.visited().contains_key(&lifter.machine.at(0x108)));
    assert!(!flow.visited().contains_key(&lifter.machine.at(0x104)));

    flow.generate_blocks().unwrap();
    assert_eq!(flow.graph().len(), 2);
    assert_block_invariants(&flow);

    // The branch op is the only edge source.
    let sources: Vec<usize> = flow
        .graph()
        .iter()
        .filter(|block| !block.out_edges.is_empty())
        .map(|block| block.index)
        .collect();
    assert_eq!(sources.len(), 1);
    let branch_block = flow.graph().block(sources[0]).unwrap();
    let last = branch_block.ops.last().unwrap();
    assert_eq!(flow.bank().get(last).unwrap().opcode, OpCode::Branch);
}

#[test]
fn relative_internal_branch_splits_instruction() {
    let mut lifter = ScriptedLifter::new(&[
        (0x200, 4, vec![Op::CBranchRel(2), Op::Add, Op::Add]),
        (0x204, 4, vec![Op::Ret]),
    ]);
    let mut flow = flow_over(&lifter, 0x200);
    run(&mut lifter, &mut flow, &NoFunctionInfo).unwrap();

    let at = |time| SeqNum::new(lifter.machine.at(0x200), time);
    let first = flow.bank().get(&at(0)).unwrap();
    let second = flow.bank().get(&at(1)).unwrap();
    let third = flow.bank().get(&at(2)).unwrap();
    assert!(first.starts_block());
    assert!(third.starts_block());
    // The intervening op survives even though the branch skips it.
    assert_eq!(second.opcode, OpCode::IntAdd);

    // Fall-through continued past the instruction.
    assert!(flow.visited().contains_key(&lifter.machine.at(0x204)));

    flow.generate_blocks().unwrap();
    assert_block_invariants(&flow);
}

#[test]
fn reinterpreted_bytes_warn_by_default() {
    let program = [
        (0x300, 4, vec![Op::Add]),
        (0x302, 2, vec![Op::Add]),
        (0x304, 4, vec![Op::Branch(0x302)]),
    ];
    let mut lifter = ScriptedLifter::new(&program);
    let mut flow = flow_over(&lifter, 0x300);
    run(&mut lifter, &mut flow, &NoFunctionInfo).unwrap();

    assert!(flow.condition_present(FlowCondition::Reinterpreted));
    assert_eq!(flow.warnings().len(), 1);
    assert!(flow
        .unprocessed()
        .contains(&lifter.machine.at(0x302)));

    // Escalated policy turns the same condition fatal.
    let mut lifter = ScriptedLifter::new(&program);
    let mut flow = flow_over(&lifter, 0x300);
    flow.set_flags(FlowFlags::ERROR_REINTERPRETED);
    let err = run(&mut lifter, &mut flow, &NoFunctionInfo).unwrap_err();
    assert!(matches!(err, skald::FlowError::Reinterpreted { .. }));
}

struct InlineBoth;

impl FunctionOracle for InlineBoth {
    fn properties(&self, _entry: &Address) -> FunctionProps {
        FunctionProps {
            is_inline: true,
            is_noreturn: false,
            call_fixup: None,
        }
    }
}

#[test]
fn inline_cycle_is_refused_once() {
    // A calls B; B calls A; both are marked inline.
    let mut lifter = ScriptedLifter::new(&[
        (0x400, 4, vec![Op::Call(0x500)]),
        (0x404, 4, vec![Op::Ret]),
        (0x500, 4, vec![Op::Call(0x400)]),
        (0x504, 4, vec![Op::Ret]),
    ]);
    let mut flow = flow_over(&lifter, 0x400);
    run(&mut lifter, &mut flow, &InlineBoth).unwrap();

    // B was inlined: the original call at 0x400 became a branch.
    let call_site = SeqNum::new(lifter.machine.at(0x400), 0);
    assert_eq!(flow.bank().get(&call_site).unwrap().opcode, OpCode::Branch);

    // The recursive call inside B's body was refused and retained.
    let recursive = SeqNum::new(lifter.machine.at(0x500), 0);
    assert_eq!(flow.bank().get(&recursive).unwrap().opcode, OpCode::Call);
    let specs = flow.call_specs().get(&recursive).unwrap();
    assert!(!specs.is_inline);
    assert!(flow
        .warnings()
        .iter()
        .any(|w| w.contains("could not inline")));
}

struct NoReturnAt(u64);

impl FunctionOracle for NoReturnAt {
    fn properties(&self, entry: &Address) -> FunctionProps {
        FunctionProps {
            is_inline: false,
            is_noreturn: entry.offset() == self.0,
            call_fixup: None,
        }
    }
}

#[test]
fn no_return_call_truncates_flow() {
    let mut lifter = ScriptedLifter::new(&[
        (0x600, 4, vec![Op::Call(0x700)]),
        (0x604, 4, vec![Op::Add]),
        (0x700, 4, vec![Op::Ret]),
    ]);
    let mut flow = flow_over(&lifter, 0x600);
    run(&mut lifter, &mut flow, &NoReturnAt(0x700)).unwrap();

    // The call survives, followed immediately by a no-return halt.
    let call = SeqNum::new(lifter.machine.at(0x600), 0);
    assert_eq!(flow.bank().get(&call).unwrap().opcode, OpCode::Call);
    let halt = flow.bank().next_after(&call).unwrap();
    assert!(halt.flags.contains(OpFlags::HALT | OpFlags::NO_RETURN));
    assert_eq!(halt.opcode, OpCode::Return);

    // The address past the call was never reached.
    assert!(!flow.visited().contains_key(&lifter.machine.at(0x604)));
    assert!(flow.pending_addresses().is_empty());
}

type PcodeOpRef = skald::skald_pcode::PcodeOp;

struct TableAt {
    machine_targets: Vec<Address>,
}

impl JumpTableRecovery for TableAt {
    fn find_jump_table(&mut self, _op: &PcodeOpRef) -> TableOutcome {
        TableOutcome::Table(JumpTable {
            targets: self.machine_targets.clone(),
            load_points: Vec::new(),
        })
    }
}

#[test]
fn jump_table_targets_become_blocks() {
    let mut lifter = ScriptedLifter::new(&[
        (0x800, 4, vec![Op::BranchInd]),
        (0x810, 4, vec![Op::Ret]),
        (0x820, 4, vec![Op::Ret]),
    ]);
    let mut flow = flow_over(&lifter, 0x800);
    let mut recovery = TableAt {
        machine_targets: vec![
            lifter.machine.at(0x810),
            lifter.machine.at(0x820),
            // Duplicate entries collapse to one edge.
            lifter.machine.at(0x810),
        ],
    };
    let mut env = FlowEnv {
        lifter: &mut lifter,
        jump_recovery: &mut recovery,
        user_ops: &NoUserOps,
        oracle: &NoFunctionInfo,
        inject: None,
    };
    flow.generate_ops(&mut env).unwrap();

    assert!(flow.visited().contains_key(&lifter.machine.at(0x810)));
    assert!(flow.visited().contains_key(&lifter.machine.at(0x820)));

    flow.generate_blocks().unwrap();
    assert_block_invariants(&flow);
    let branch_seq = SeqNum::new(lifter.machine.at(0x800), 0);
    let branch_block = flow.graph().block_of(&branch_seq).unwrap();
    assert_eq!(
        flow.graph().block(branch_block).unwrap().out_edges.len(),
        2
    );
}

#[test]
fn unrecovered_jump_rewrites_to_return() {
    let mut lifter = ScriptedLifter::new(&[(0x800, 4, vec![Op::BranchInd])]);
    let mut flow = flow_over(&lifter, 0x800);

    struct AlwaysFail;
    impl JumpTableRecovery for AlwaysFail {
        fn find_jump_table(&mut self, _op: &PcodeOpRef) -> TableOutcome {
            TableOutcome::Fail(skald::IndirectFailMode::Return)
        }
    }
    let mut recovery = AlwaysFail;
    let mut env = FlowEnv {
        lifter: &mut lifter,
        jump_recovery: &mut recovery,
        user_ops: &NoUserOps,
        oracle: &NoFunctionInfo,
        inject: None,
    };
    flow.generate_ops(&mut env).unwrap();

    let seq = SeqNum::new(lifter.machine.at(0x800), 0);
    assert_eq!(flow.bank().get(&seq).unwrap().opcode, OpCode::Return);
}

#[test]
fn out_of_bounds_branch_becomes_halt() {
    let mut lifter = ScriptedLifter::new(&[(0x100, 4, vec![Op::Branch(0x5_0000)])]);
    let mut flow = flow_over(&lifter, 0x100);
    run(&mut lifter, &mut flow, &NoFunctionInfo).unwrap();

    assert!(flow.condition_present(FlowCondition::OutOfBounds));
    assert_eq!(flow.unprocessed().len(), 1);

    flow.generate_blocks().unwrap();
    assert_block_invariants(&flow);
    // The dangling target received an artificial halt block.
    let halt_addr = lifter.machine.at(0x5_0000);
    let halt = flow.bank().first_at(&halt_addr).unwrap();
    assert!(halt.flags.contains(OpFlags::HALT | OpFlags::MISSING));
}

#[test]
fn instruction_budget_truncates_with_warning() {
    let mut lifter = ScriptedLifter::new(&[
        (0x100, 2, vec![Op::Add]),
        (0x102, 2, vec![Op::Add]),
        (0x104, 2, vec![Op::Add]),
        (0x106, 2, vec![Op::Ret]),
    ]);
    let mut flow = flow_over(&lifter, 0x100);
    flow.set_insn_max(2);
    run(&mut lifter, &mut flow, &NoFunctionInfo).unwrap();

    assert!(flow.condition_present(FlowCondition::TooManyInstructions));
    assert!(flow.visited().len() <= 3);
    // The truncation point carries an artificial halt.
    let halts = flow
        .bank()
        .iter()
        .filter(|op| op.flags.contains(OpFlags::HALT))
        .count();
    assert_eq!(halts, 1);
}

#[test]
fn callother_injection_replaces_op() {
    let mut lifter = ScriptedLifter::new(&[
        (0x900, 4, vec![Op::CallOther(0)]),
        (0x904, 4, vec![Op::Ret]),
    ]);

    let machine = Machine::new();
    let r0 = machine.reg(0);
    let resolver_reg = r0.clone();
    let mut library = InjectLibrary::new(
        Arc::clone(&machine.constant),
        Arc::clone(&machine.ram),
        Arc::clone(&machine.unique),
        Box::new(move |name| (name == "r0").then(|| resolver_reg.clone())),
    );
    let payload = library
        .manual_call_other_fixup(
            "saturating_probe",
            vec![InjectParameter {
                name: "res".into(),
                size: 8,
            }],
            vec![InjectParameter {
                name: "val".into(),
                size: 8,
            }],
            "res = val + 1;",
        )
        .unwrap();
    let mut user_ops = UserOpLibrary::new();
    user_ops.push(UserOp {
        name: "probe".into(),
        injection: Some(payload),
    });

    let mut flow = flow_over(&lifter, 0x900);
    let mut recovery = NoJumpTables;
    let mut env = FlowEnv {
        lifter: &mut lifter,
        jump_recovery: &mut recovery,
        user_ops: &user_ops,
        oracle: &NoFunctionInfo,
        inject: Some(&mut library),
    };
    flow.generate_ops(&mut env).unwrap();

    // The CALLOTHER is gone; its expansion computes through a
    // temporary and copies back out to the op's output.
    let ops: Vec<OpCode> = flow
        .bank()
        .at_address(&lifter.machine.at(0x900))
        .map(|op| op.opcode)
        .collect();
    assert!(!ops.contains(&OpCode::CallOther));
    assert!(ops.contains(&OpCode::IntAdd));
    assert_eq!(*ops.last().unwrap(), OpCode::Copy);

    flow.generate_blocks().unwrap();
    assert_block_invariants(&flow);
}
