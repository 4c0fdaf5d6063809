//! End-to-end decode over a hand-assembled specification.
//!
//! The fixture models a toy processor: every instruction is two
//! bytes, selected by its first byte. `add` does register
//! arithmetic, `li` carries an immediate operand, `ret` returns, and
//! `brds` returns after executing its delay slot.

use skald_sleigh::sla::format::*;
use skald_sleigh::sla::{seal_payload, PackedEncoder};
use skald_sleigh::{Error, Sleigh};

use skald_pcode::{Address, AssemblyEmit, LoadError, LoadImage, OpCode, PcodeEmit, VarnodeData};

const R0_OFFSET: u64 = 0x100;
const R1_OFFSET: u64 = 0x108;

const SYM_R0: u64 = 1;
const SYM_R1: u64 = 2;
const SYM_INSTRUCTION: u64 = 3;
const SYM_IMM: u64 = 4;
const SYM_NEXT: u64 = 5;
const SYM_CTXREG: u64 = 6;
const SYM_MODE: u64 = 7;

const MODE_MASK: u64 = 0x8000_0000;

fn encode_varnode_tpl(enc: &mut PackedEncoder, space: u64, offset: u64, size: u64) {
    enc.open_element(ELEM_VARNODE_TPL);
    encode_const(enc, 7, &[(ATTRIB_SPACE, space)]);
    encode_const(enc, 0, &[(ATTRIB_VAL, offset)]);
    encode_const(enc, 0, &[(ATTRIB_VAL, size)]);
    enc.close_element(ELEM_VARNODE_TPL);
}

fn encode_handle_varnode_tpl(enc: &mut PackedEncoder, operand: u64, size: u64) {
    enc.open_element(ELEM_VARNODE_TPL);
    encode_const_handle(enc, operand, 0);
    encode_const_handle(enc, operand, 1);
    encode_const(enc, 0, &[(ATTRIB_VAL, size)]);
    enc.close_element(ELEM_VARNODE_TPL);
}

fn encode_const(enc: &mut PackedEncoder, kind: u64, attrs: &[(u16, u64)]) {
    enc.open_element(ELEM_CONST_TPL);
    enc.write_uint(ATTRIB_TYPE, kind);
    for (attr, value) in attrs {
        enc.write_uint(*attr, *value);
    }
    enc.close_element(ELEM_CONST_TPL);
}

fn encode_const_handle(enc: &mut PackedEncoder, operand: u64, select: u64) {
    enc.open_element(ELEM_CONST_TPL);
    enc.write_uint(ATTRIB_TYPE, 1);
    enc.write_uint(ATTRIB_VAL, operand);
    enc.write_uint(ATTRIB_SELECT, select);
    enc.close_element(ELEM_CONST_TPL);
}

fn encode_op_tpl(
    enc: &mut PackedEncoder,
    opcode: u64,
    output: Option<(u64, u64, u64)>,
    inputs: &[(u64, u64, u64)],
) {
    enc.open_element(ELEM_OP_TPL);
    enc.write_uint(ATTRIB_CODE, opcode);
    match output {
        Some((space, offset, size)) => encode_varnode_tpl(enc, space, offset, size),
        None => {
            enc.open_element(ELEM_NULL);
            enc.close_element(ELEM_NULL);
        }
    }
    for (space, offset, size) in inputs {
        encode_varnode_tpl(enc, *space, *offset, *size);
    }
    enc.close_element(ELEM_OP_TPL);
}

fn encode_print(enc: &mut PackedEncoder, piece: &str) {
    enc.open_element(ELEM_PRINT);
    enc.write_string(ATTRIB_PIECE, piece);
    enc.close_element(ELEM_PRINT);
}

fn encode_byte_block(enc: &mut PackedEncoder, mask: u64, value: u64) {
    enc.open_element(ELEM_PAT_BLOCK);
    enc.write_uint(ATTRIB_OFF, 0);
    enc.write_int(ATTRIB_NONZERO, 1);
    enc.open_element(ELEM_MASK_WORD);
    enc.write_uint(ATTRIB_MASK, mask);
    enc.write_uint(ATTRIB_VAL, value);
    enc.close_element(ELEM_MASK_WORD);
    enc.close_element(ELEM_PAT_BLOCK);
}

fn encode_pattern_pair(enc: &mut PackedEncoder, ct_index: u64, value: u32) {
    enc.open_element(ELEM_PAIR);
    enc.write_uint(ATTRIB_ID, ct_index);
    enc.open_element(ELEM_INSTRUCT_PAT);
    encode_byte_block(enc, 0xff00_0000, u64::from(value) << 24);
    enc.close_element(ELEM_INSTRUCT_PAT);
    enc.close_element(ELEM_PAIR);
}

/// A pair constrained by the mode context bit as well as the first
/// instruction byte.
fn encode_combine_pair(enc: &mut PackedEncoder, ct_index: u64, value: u32, mode: bool) {
    enc.open_element(ELEM_PAIR);
    enc.write_uint(ATTRIB_ID, ct_index);
    enc.open_element(ELEM_COMBINE_PAT);
    enc.open_element(ELEM_CONTEXT_PAT);
    encode_byte_block(enc, MODE_MASK, if mode { MODE_MASK } else { 0 });
    enc.close_element(ELEM_CONTEXT_PAT);
    enc.open_element(ELEM_INSTRUCT_PAT);
    encode_byte_block(enc, 0xff00_0000, u64::from(value) << 24);
    enc.close_element(ELEM_INSTRUCT_PAT);
    enc.close_element(ELEM_COMBINE_PAT);
    enc.close_element(ELEM_PAIR);
}

/// Assemble the complete fixture specification.
fn fixture_spec() -> Vec<u8> {
    let mut enc = PackedEncoder::new();
    enc.open_element(ELEM_SLEIGH);
    enc.write_uint(ATTRIB_VERSION, 4);
    enc.write_bool(ATTRIB_BIGENDIAN, false);
    enc.write_uint(ATTRIB_ALIGN, 1);
    enc.write_uint(ATTRIB_UNIQBASE, 0x1000);
    enc.write_uint(ATTRIB_MAXDELAY, 1);
    enc.write_uint(ATTRIB_UNIQMASK, 0xff);
    enc.write_uint(ATTRIB_NUMSECTIONS, 0);

    enc.open_element(ELEM_SPACES);
    enc.write_string(ATTRIB_DEFAULTSPACE, "ram");
    enc.open_element(ELEM_SPACE);
    enc.write_string(ATTRIB_NAME, "ram");
    enc.write_uint(ATTRIB_INDEX, 1);
    enc.write_uint(ATTRIB_SIZE, 4);
    enc.write_uint(ATTRIB_WORDSIZE, 1);
    enc.write_bool(ATTRIB_PHYSICAL, true);
    enc.close_element(ELEM_SPACE);
    enc.open_element(ELEM_SPACE_UNIQUE);
    enc.write_string(ATTRIB_NAME, "unique");
    enc.write_uint(ATTRIB_INDEX, 2);
    enc.write_uint(ATTRIB_SIZE, 4);
    enc.close_element(ELEM_SPACE_UNIQUE);
    enc.close_element(ELEM_SPACES);

    enc.open_element(ELEM_SYMBOL_TABLE);

    // Headers.
    for (element, name, id) in [
        (ELEM_VARNODE_SYM_HEAD, "r0", SYM_R0),
        (ELEM_VARNODE_SYM_HEAD, "r1", SYM_R1),
        (ELEM_SUBTABLE_SYM_HEAD, "instruction", SYM_INSTRUCTION),
        (ELEM_OPERAND_SYM_HEAD, "imm", SYM_IMM),
        (ELEM_END_SYM_HEAD, "inst_next", SYM_NEXT),
        (ELEM_VARNODE_SYM_HEAD, "ctxreg", SYM_CTXREG),
        (ELEM_CONTEXT_SYM_HEAD, "mode", SYM_MODE),
    ] {
        enc.open_element(element);
        enc.write_string(ATTRIB_NAME, name);
        enc.write_uint(ATTRIB_ID, id);
        enc.write_uint(ATTRIB_SCOPE, 0);
        enc.close_element(element);
    }

    // Register contents.
    for (id, offset) in [(SYM_R0, R0_OFFSET), (SYM_R1, R1_OFFSET), (SYM_CTXREG, 0x200)] {
        enc.open_element(ELEM_VARNODE_SYM);
        enc.write_uint(ATTRIB_ID, id);
        enc.write_uint(ATTRIB_SPACE, 1);
        enc.write_uint(ATTRIB_OFFSET, offset);
        enc.write_uint(ATTRIB_SIZE, 8);
        enc.close_element(ELEM_VARNODE_SYM);
    }

    // The mode context bit: the top bit of context word 0.
    enc.open_element(ELEM_CONTEXT_SYM);
    enc.write_uint(ATTRIB_ID, SYM_MODE);
    enc.write_uint(ATTRIB_VARNODE, SYM_CTXREG);
    enc.write_uint(ATTRIB_LOW, 0);
    enc.write_uint(ATTRIB_HIGH, 0);
    enc.write_bool(ATTRIB_FLOW, true);
    enc.open_element(ELEM_CONTEXTFIELD_EXP);
    enc.write_bool(ATTRIB_SIGNBIT, false);
    enc.write_uint(ATTRIB_STARTBIT, 0);
    enc.write_uint(ATTRIB_ENDBIT, 0);
    enc.write_uint(ATTRIB_STARTBYTE, 0);
    enc.write_uint(ATTRIB_ENDBYTE, 0);
    enc.write_uint(ATTRIB_SHIFT, 7);
    enc.close_element(ELEM_CONTEXTFIELD_EXP);
    enc.close_element(ELEM_CONTEXT_SYM);

    // Immediate operand: the second instruction byte.
    enc.open_element(ELEM_OPERAND_SYM);
    enc.write_uint(ATTRIB_ID, SYM_IMM);
    enc.write_uint(ATTRIB_INDEX, 0);
    enc.write_uint(ATTRIB_OFF, 1);
    enc.write_int(ATTRIB_BASE, -1);
    enc.write_uint(ATTRIB_MINLEN, 1);
    enc.open_element(ELEM_TOKENFIELD_EXP);
    enc.write_bool(ATTRIB_BIGENDIAN, false);
    enc.write_bool(ATTRIB_SIGNBIT, false);
    enc.write_uint(ATTRIB_STARTBIT, 0);
    enc.write_uint(ATTRIB_ENDBIT, 7);
    enc.write_uint(ATTRIB_STARTBYTE, 0);
    enc.write_uint(ATTRIB_ENDBYTE, 0);
    enc.write_uint(ATTRIB_SHIFT, 0);
    enc.close_element(ELEM_TOKENFIELD_EXP);
    enc.close_element(ELEM_OPERAND_SYM);

    // The instruction table: add, ret, li, brds, alpha, beta.
    enc.open_element(ELEM_SUBTABLE_SYM);
    enc.write_uint(ATTRIB_ID, SYM_INSTRUCTION);
    enc.write_uint(ATTRIB_NUMCT, 6);

    // Constructor 0: add, r0 = r0 + r1.
    enc.open_element(ELEM_CONSTRUCTOR);
    enc.write_uint(ATTRIB_LENGTH, 2);
    encode_print(&mut enc, "add");
    encode_print(&mut enc, " ");
    encode_print(&mut enc, "r0,r1");
    enc.open_element(ELEM_CONSTRUCT_TPL);
    encode_op_tpl(
        &mut enc,
        OpCode::IntAdd.raw() as u64,
        Some((1, R0_OFFSET, 8)),
        &[(1, R0_OFFSET, 8), (1, R1_OFFSET, 8)],
    );
    enc.close_element(ELEM_CONSTRUCT_TPL);
    enc.close_element(ELEM_CONSTRUCTOR);

    // Constructor 1: ret.
    enc.open_element(ELEM_CONSTRUCTOR);
    enc.write_uint(ATTRIB_LENGTH, 2);
    encode_print(&mut enc, "ret");
    enc.open_element(ELEM_CONSTRUCT_TPL);
    encode_op_tpl(
        &mut enc,
        OpCode::Return.raw() as u64,
        None,
        &[(1, R0_OFFSET, 8)],
    );
    enc.close_element(ELEM_CONSTRUCT_TPL);
    enc.close_element(ELEM_CONSTRUCTOR);

    // Constructor 2: li imm, r0 = imm.
    enc.open_element(ELEM_CONSTRUCTOR);
    enc.write_uint(ATTRIB_LENGTH, 2);
    enc.open_element(ELEM_OPER);
    enc.write_uint(ATTRIB_ID, SYM_IMM);
    enc.close_element(ELEM_OPER);
    encode_print(&mut enc, "li");
    encode_print(&mut enc, " ");
    enc.open_element(ELEM_OPPRINT);
    enc.write_uint(ATTRIB_ID, 0);
    enc.close_element(ELEM_OPPRINT);
    enc.open_element(ELEM_CONSTRUCT_TPL);
    enc.open_element(ELEM_OP_TPL);
    enc.write_uint(ATTRIB_CODE, OpCode::Copy.raw() as u64);
    encode_varnode_tpl(&mut enc, 1, R0_OFFSET, 8);
    encode_handle_varnode_tpl(&mut enc, 0, 8);
    enc.close_element(ELEM_OP_TPL);
    enc.close_element(ELEM_CONSTRUCT_TPL);
    enc.close_element(ELEM_CONSTRUCTOR);

    // Constructor 3: brds, a delay slot then a return.
    enc.open_element(ELEM_CONSTRUCTOR);
    enc.write_uint(ATTRIB_LENGTH, 2);
    encode_print(&mut enc, "brds");
    enc.open_element(ELEM_CONSTRUCT_TPL);
    enc.write_uint(ATTRIB_DELAYSLOT, 2);
    encode_op_tpl(&mut enc, u64::from(OpCode::Indirect.raw()), None, &[]);
    encode_op_tpl(
        &mut enc,
        OpCode::Return.raw() as u64,
        None,
        &[(1, R0_OFFSET, 8)],
    );
    enc.close_element(ELEM_CONSTRUCT_TPL);
    enc.close_element(ELEM_CONSTRUCTOR);

    // Constructor 4: alpha, valid only in mode 0; flips mode for the next
    // instruction through a commit.
    enc.open_element(ELEM_CONSTRUCTOR);
    enc.write_uint(ATTRIB_LENGTH, 2);
    encode_print(&mut enc, "alpha");
    enc.open_element(ELEM_CONTEXT_OP);
    enc.write_uint(ATTRIB_NUMBER, 0);
    enc.write_uint(ATTRIB_SHIFT, 31);
    enc.write_uint(ATTRIB_MASK, MODE_MASK);
    enc.open_element(ELEM_INTB_EXP);
    enc.write_int(ATTRIB_VAL, 1);
    enc.close_element(ELEM_INTB_EXP);
    enc.close_element(ELEM_CONTEXT_OP);
    enc.open_element(ELEM_COMMIT);
    enc.write_uint(ATTRIB_ID, SYM_NEXT);
    enc.write_uint(ATTRIB_NUMBER, 0);
    enc.write_uint(ATTRIB_MASK, MODE_MASK);
    enc.write_bool(ATTRIB_FLOW, true);
    enc.close_element(ELEM_COMMIT);
    enc.open_element(ELEM_CONSTRUCT_TPL);
    encode_op_tpl(
        &mut enc,
        OpCode::Copy.raw() as u64,
        Some((1, R0_OFFSET, 8)),
        &[(1, R1_OFFSET, 8)],
    );
    enc.close_element(ELEM_CONSTRUCT_TPL);
    enc.close_element(ELEM_CONSTRUCTOR);

    // Constructor 5: beta, valid only in mode 1.
    enc.open_element(ELEM_CONSTRUCTOR);
    enc.write_uint(ATTRIB_LENGTH, 2);
    encode_print(&mut enc, "beta");
    enc.open_element(ELEM_CONSTRUCT_TPL);
    encode_op_tpl(
        &mut enc,
        OpCode::Copy.raw() as u64,
        Some((1, R1_OFFSET, 8)),
        &[(1, R0_OFFSET, 8)],
    );
    enc.close_element(ELEM_CONSTRUCT_TPL);
    enc.close_element(ELEM_CONSTRUCTOR);

    // Selection: a single leaf over the first byte; the 0x05 pairs
    // are disambiguated by the mode context bit.
    enc.open_element(ELEM_DECISION);
    enc.write_bool(ATTRIB_CONTEXT, false);
    enc.write_uint(ATTRIB_STARTBIT, 0);
    enc.write_uint(ATTRIB_SIZE, 0);
    encode_pattern_pair(&mut enc, 0, 0x01);
    encode_pattern_pair(&mut enc, 1, 0x02);
    encode_pattern_pair(&mut enc, 2, 0x03);
    encode_pattern_pair(&mut enc, 3, 0x04);
    encode_combine_pair(&mut enc, 4, 0x05, false);
    encode_combine_pair(&mut enc, 5, 0x05, true);
    enc.close_element(ELEM_DECISION);

    enc.close_element(ELEM_SUBTABLE_SYM);
    enc.close_element(ELEM_SYMBOL_TABLE);
    enc.close_element(ELEM_SLEIGH);
    seal_payload(&enc.finish())
}

struct Image(Vec<u8>);

impl LoadImage for Image {
    fn load_fill(&self, buf: &mut [u8], addr: &Address) -> Result<(), LoadError> {
        let start = addr.offset() as usize;
        let end = start + buf.len();
        if end > self.0.len() {
            return Err(LoadError::Unavailable {
                addr: addr.clone(),
                size: buf.len(),
            });
        }
        buf.copy_from_slice(&self.0[start..end]);
        Ok(())
    }
}

#[derive(Default)]
struct Ops(Vec<(u64, OpCode, Option<VarnodeData>, Vec<VarnodeData>)>);

impl PcodeEmit for Ops {
    fn dump(
        &mut self,
        addr: &Address,
        opcode: OpCode,
        output: Option<&VarnodeData>,
        inputs: &[VarnodeData],
    ) {
        self.0.push((
            addr.offset(),
            opcode,
            output.cloned(),
            inputs.to_vec(),
        ));
    }
}

#[derive(Default)]
struct Asm(Vec<(u64, String, String)>);

impl AssemblyEmit for Asm {
    fn dump(&mut self, addr: &Address, mnemonic: &str, body: &str) {
        self.0.push((addr.offset(), mnemonic.into(), body.into()));
    }
}

fn engine(program: &[u8]) -> Sleigh {
    let mut image = program.to_vec();
    image.resize(program.len().max(32), 0x02);
    Sleigh::new(&fixture_spec(), Box::new(Image(image))).expect("fixture loads")
}

fn ram_addr(sleigh: &Sleigh, offset: u64) -> Address {
    Address::new(sleigh.spaces().by_name("ram").unwrap(), offset)
}

#[test]
fn fixture_loads_and_describes_itself() {
    let sleigh = engine(&[]);
    assert_eq!(sleigh.version(), 4);
    assert!(!sleigh.is_big_endian());
    assert_eq!(sleigh.alignment(), 1);
    assert_eq!(sleigh.max_delay(), 1);
    assert_eq!(sleigh.default_space().name(), "ram");
    assert_eq!(sleigh.spaces().len(), 3);
}

#[test]
fn add_lifts_to_int_add() {
    let mut sleigh = engine(&[0x01, 0x00]);
    let mut ops = Ops::default();
    let addr = ram_addr(&sleigh, 0);
    let len = sleigh.one_instruction(&mut ops, &addr).unwrap();
    assert_eq!(len, 2);
    assert_eq!(ops.0.len(), 1);
    let (at, opcode, output, inputs) = &ops.0[0];
    assert_eq!(*at, 0);
    assert_eq!(*opcode, OpCode::IntAdd);
    assert_eq!(output.as_ref().unwrap().offset, R0_OFFSET);
    assert_eq!(inputs.len(), 2);
    assert_eq!(inputs[1].offset, R1_OFFSET);
}

#[test]
fn li_exports_its_immediate() {
    let mut sleigh = engine(&[0x03, 0x2a]);
    let mut ops = Ops::default();
    let addr = ram_addr(&sleigh, 0);
    sleigh.one_instruction(&mut ops, &addr).unwrap();
    let (_, opcode, output, inputs) = &ops.0[0];
    assert_eq!(*opcode, OpCode::Copy);
    assert_eq!(output.as_ref().unwrap().offset, R0_OFFSET);
    assert!(inputs[0].is_constant());
    assert_eq!(inputs[0].offset, 0x2a);
}

#[test]
fn assembly_printing_matches_constructors() {
    let mut sleigh = engine(&[0x01, 0x00, 0x03, 0x7f, 0x02, 0x00]);
    let mut asm = Asm::default();
    let mut offset = 0;
    for _ in 0..3 {
        let addr = ram_addr(&sleigh, offset);
        offset += sleigh.print_assembly(&mut asm, &addr).unwrap() as u64;
    }
    let printed: Vec<(String, String)> = asm
        .0
        .iter()
        .map(|(_, mnemonic, body)| (mnemonic.clone(), body.clone()))
        .collect();
    assert_eq!(
        printed,
        vec![
            ("add".into(), "r0,r1".into()),
            ("li".into(), "0x7f".into()),
            ("ret".into(), "".into()),
        ]
    );
}

#[test]
fn delay_slot_folds_following_instruction() {
    // brds at 0, add in its delay slot at 2.
    let mut sleigh = engine(&[0x04, 0x00, 0x01, 0x00, 0x02, 0x00]);
    let mut ops = Ops::default();
    let addr = ram_addr(&sleigh, 0);
    let len = sleigh.one_instruction(&mut ops, &addr).unwrap();
    // Fall-through spans the branch and its delay slot.
    assert_eq!(len, 4);
    let opcodes: Vec<OpCode> = ops.0.iter().map(|(_, opcode, _, _)| *opcode).collect();
    assert_eq!(opcodes, vec![OpCode::IntAdd, OpCode::Return]);
    // All ops are attributed to the branch instruction.
    assert!(ops.0.iter().all(|(at, ..)| *at == 0));
}

#[test]
fn context_bit_selects_the_constructor() {
    let mut sleigh = engine(&[0x05, 0x00]);
    let addr = ram_addr(&sleigh, 0);

    let mut asm = Asm::default();
    sleigh.print_assembly(&mut asm, &addr).unwrap();
    assert_eq!(asm.0[0].1, "alpha");

    // Painting the context bit changes how the same bytes decode.
    sleigh.set_context_variable("mode", &addr, 1).unwrap();
    sleigh.reset();
    let mut asm = Asm::default();
    sleigh.print_assembly(&mut asm, &addr).unwrap();
    assert_eq!(asm.0[0].1, "beta");
}

#[test]
fn context_commit_flows_to_the_next_instruction() {
    // alpha at 0 commits mode=1 from its own next address on, so the
    // same 0x05 byte at 2 decodes as beta.
    let mut sleigh = engine(&[0x05, 0x00, 0x05, 0x00]);
    let a0 = ram_addr(&sleigh, 0);
    let mut ops = Ops::default();
    let len = sleigh.one_instruction(&mut ops, &a0).unwrap();
    assert_eq!(len, 2);
    assert_eq!(
        sleigh.context().get_variable_value("mode", &ram_addr(&sleigh, 2)).unwrap(),
        1
    );

    let a2 = ram_addr(&sleigh, 2);
    let mut asm = Asm::default();
    sleigh.print_assembly(&mut asm, &a2).unwrap();
    assert_eq!(asm.0[0].1, "beta");
    // The instruction that committed still decoded in mode 0.
    assert_eq!(
        sleigh.context().get_variable_value("mode", &a0).unwrap(),
        0
    );
}

#[test]
fn undecodable_bytes_are_bad_data() {
    let mut sleigh = engine(&[0xff, 0xff]);
    let mut ops = Ops::default();
    let addr = ram_addr(&sleigh, 0);
    let err = sleigh.one_instruction(&mut ops, &addr).unwrap_err();
    assert!(matches!(err, Error::BadData { .. }));
}

#[test]
fn instruction_length_uses_disassembly_only() {
    let mut sleigh = engine(&[0x01, 0x00]);
    let addr = ram_addr(&sleigh, 0);
    assert_eq!(sleigh.instruction_length(&addr).unwrap(), 2);
}
