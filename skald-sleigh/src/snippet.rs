//! Runtime compiler for p-code snippets.
//!
//! Fix-ups and executable payloads registered at runtime are written
//! in a restricted dialect of the semantic language:
//!
//! - assignments `dest = expr;` and declarations
//!   `local name[:size] = expr;`
//! - loads `*[:size] expr` and stores `*[:size] expr = expr;`
//! - labels `<name>`, jumps `goto <name>;`, `goto expr;`,
//!   `goto [expr];`, conditionals `if (expr) goto <name>;`
//! - calls `call expr;`, `call [expr];` and returns
//!   `return;` / `return [expr];`
//! - integer literals (`0x` hex or decimal, optionally sized as
//!   `value:size`), the operators `+ - * / % & | ^ << >> == != < <=
//!   > >=` with `s`-prefixed signed comparison forms, and unary
//!   `- ~ !`
//!
//! Names resolve through the caller's scope; unknown names are
//! errors. The result is an ordinary construct template whose only
//! symbolic constants are relative labels.

use std::sync::Arc;

use hashbrown::HashMap;

use skald_pcode::{AddrSpace, OpCode, VarnodeData};

use crate::error::Error;
use crate::template::{ConstTpl, ConstructTpl, OpTpl, VarnodeTpl, DIRECTIVE_LABEL};

/// Name resolution and space context for one compilation.
pub struct SnippetScope<'a> {
    /// Resolver for register and parameter names.
    pub resolve: &'a dyn Fn(&str) -> Option<VarnodeData>,
    /// Space absolute jumps land in.
    pub default_space: Arc<AddrSpace>,
    /// The constant space.
    pub const_space: Arc<AddrSpace>,
    /// Space scratch temporaries are allocated in.
    pub unique_space: Arc<AddrSpace>,
    /// First unique offset available for scratch temporaries.
    pub temp_base: u64,
}

/// Compile `source` into a construct template.
pub fn compile_snippet(source: &str, scope: &SnippetScope<'_>) -> Result<ConstructTpl, Error> {
    let tokens = lex(source)?;
    let mut parser = SnippetParser {
        tokens,
        pos: 0,
        scope,
        locals: HashMap::new(),
        labels: HashMap::new(),
        next_temp: scope.temp_base,
        ops: Vec::new(),
    };
    parser.parse_statements()?;
    let num_labels = parser.labels.len();
    let ops = parser.finish()?;
    Ok(ConstructTpl {
        num_labels,
        delay_slot: 0,
        result: None,
        ops,
    })
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Token {
    Ident(String),
    Int(u64),
    Punct(&'static str),
}

const PUNCTS: &[&str] = &[
    "<<", ">>", "==", "!=", "<=", ">=", "&&", "||", "<", ">", "=", "+", "-", "*", "/", "%", "&",
    "|", "^", "~", "!", "(", ")", "[", "]", ":", ";", ",",
];

fn lex(source: &str) -> Result<Vec<Token>, Error> {
    let bytes = source.as_bytes();
    let mut tokens = Vec::new();
    let mut i = 0;
    'outer: while i < bytes.len() {
        let c = bytes[i] as char;
        if c.is_whitespace() {
            i += 1;
            continue;
        }
        if c == '#' {
            while i < bytes.len() && bytes[i] != b'\n' {
                i += 1;
            }
            continue;
        }
        if c.is_ascii_alphabetic() || c == '_' {
            let start = i;
            while i < bytes.len()
                && ((bytes[i] as char).is_ascii_alphanumeric()
                    || bytes[i] == b'_'
                    || bytes[i] == b'.')
            {
                i += 1;
            }
            tokens.push(Token::Ident(source[start..i].into()));
            continue;
        }
        if c.is_ascii_digit() {
            let start = i;
            let radix = if source[i..].starts_with("0x") || source[i..].starts_with("0X") {
                i += 2;
                16
            } else {
                10
            };
            let digits_start = i;
            while i < bytes.len() && (bytes[i] as char).is_ascii_alphanumeric() {
                i += 1;
            }
            let text = if radix == 16 {
                &source[digits_start..i]
            } else {
                &source[start..i]
            };
            let value = u64::from_str_radix(text, radix)
                .map_err(|_| Error::LowLevel(format!("bad integer literal `{}`", &source[start..i])))?;
            tokens.push(Token::Int(value));
            continue;
        }
        for punct in PUNCTS {
            if source[i..].starts_with(punct) {
                tokens.push(Token::Punct(punct));
                i += punct.len();
                continue 'outer;
            }
        }
        return Err(Error::LowLevel(format!(
            "unexpected character `{c}` in snippet"
        )));
    }
    Ok(tokens)
}

/// An op under construction; branch targets stay symbolic until all
/// labels are seen.
#[derive(Debug, Clone)]
enum RawOp {
    Op {
        opcode: OpCode,
        output: Option<VarnodeData>,
        inputs: Vec<VarnodeData>,
    },
    Label(usize),
    BranchTo {
        opcode: OpCode,
        label: usize,
        condition: Option<VarnodeData>,
    },
}

struct SnippetParser<'a, 'b> {
    tokens: Vec<Token>,
    pos: usize,
    scope: &'b SnippetScope<'a>,
    locals: HashMap<String, VarnodeData>,
    labels: HashMap<String, usize>,
    next_temp: u64,
    ops: Vec<RawOp>,
}

impl SnippetParser<'_, '_> {
    fn parse_statements(&mut self) -> Result<(), Error> {
        while self.pos < self.tokens.len() {
            self.parse_statement()?;
        }
        Ok(())
    }

    fn parse_statement(&mut self) -> Result<(), Error> {
        match self.peek().cloned() {
            Some(Token::Punct("<")) => {
                let label = self.parse_label_name()?;
                self.ops.push(RawOp::Label(label));
                Ok(())
            }
            Some(Token::Ident(word)) if word == "goto" => {
                self.advance();
                self.parse_goto(None)
            }
            Some(Token::Ident(word)) if word == "if" => {
                self.advance();
                self.expect_punct("(")?;
                let cond = self.parse_expr()?;
                self.expect_punct(")")?;
                let cond = self.force_bool(cond);
                match self.next_ident()?.as_str() {
                    "goto" => self.parse_goto(Some(cond)),
                    other => Err(Error::LowLevel(format!(
                        "expected `goto` after condition, found `{other}`"
                    ))),
                }
            }
            Some(Token::Ident(word)) if word == "call" => {
                self.advance();
                if self.eat_punct("[") {
                    let target = self.parse_expr()?;
                    self.expect_punct("]")?;
                    self.expect_punct(";")?;
                    self.push_op(OpCode::CallInd, None, vec![target]);
                } else {
                    let target = self.parse_expr()?;
                    self.expect_punct(";")?;
                    let target = self.as_code_address(target);
                    self.push_op(OpCode::Call, None, vec![target]);
                }
                Ok(())
            }
            Some(Token::Ident(word)) if word == "return" => {
                self.advance();
                let value = if self.eat_punct("[") {
                    let value = self.parse_expr()?;
                    self.expect_punct("]")?;
                    value
                } else {
                    self.constant(0, 8)
                };
                self.expect_punct(";")?;
                self.push_op(OpCode::Return, None, vec![value]);
                Ok(())
            }
            Some(Token::Ident(word)) if word == "local" => {
                self.advance();
                let name = self.next_ident()?;
                let size = if self.eat_punct(":") {
                    self.next_int()? as u32
                } else {
                    8
                };
                let slot = self.alloc_temp(size);
                self.locals.insert(name, slot.clone());
                self.expect_punct("=")?;
                let value = self.parse_expr()?;
                self.expect_punct(";")?;
                let value = self.coerce(value, slot.size);
                self.push_op(OpCode::Copy, Some(slot), vec![value]);
                Ok(())
            }
            Some(Token::Punct("*")) => {
                self.advance();
                let size = if self.eat_punct(":") {
                    self.next_int()? as u32
                } else {
                    8
                };
                let pointer = self.parse_unary()?;
                self.expect_punct("=")?;
                let value = self.parse_expr()?;
                self.expect_punct(";")?;
                let value = self.coerce(value, size);
                let space_const = self.space_constant(&self.scope.default_space.clone());
                self.push_op(OpCode::Store, None, vec![space_const, pointer, value]);
                Ok(())
            }
            Some(Token::Ident(name)) => {
                self.advance();
                let dest = self.lookup(&name)?;
                self.expect_punct("=")?;
                let value = self.parse_expr()?;
                self.expect_punct(";")?;
                let value = self.coerce(value, dest.size);
                self.push_op(OpCode::Copy, Some(dest), vec![value]);
                Ok(())
            }
            other => Err(Error::LowLevel(format!(
                "unexpected token {other:?} in snippet"
            ))),
        }
    }

    fn parse_goto(&mut self, condition: Option<VarnodeData>) -> Result<(), Error> {
        if self.peek() == Some(&Token::Punct("<")) {
            let label = self.parse_label_name()?;
            self.expect_punct(";")?;
            let opcode = if condition.is_some() {
                OpCode::CBranch
            } else {
                OpCode::Branch
            };
            self.ops.push(RawOp::BranchTo {
                opcode,
                label,
                condition,
            });
            return Ok(());
        }
        if self.eat_punct("[") {
            let target = self.parse_expr()?;
            self.expect_punct("]")?;
            self.expect_punct(";")?;
            if condition.is_some() {
                return Err(Error::LowLevel(
                    "conditional indirect jumps are not expressible".into(),
                ));
            }
            self.push_op(OpCode::BranchInd, None, vec![target]);
            return Ok(());
        }
        let target = self.parse_expr()?;
        self.expect_punct(";")?;
        let target = self.as_code_address(target);
        match condition {
            Some(cond) => self.push_op(OpCode::CBranch, None, vec![target, cond]),
            None => self.push_op(OpCode::Branch, None, vec![target]),
        }
        Ok(())
    }

    fn parse_label_name(&mut self) -> Result<usize, Error> {
        self.expect_punct("<")?;
        let name = self.next_ident()?;
        self.expect_punct(">")?;
        let next = self.labels.len();
        Ok(*self.labels.entry(name).or_insert(next))
    }

    fn parse_expr(&mut self) -> Result<VarnodeData, Error> {
        self.parse_binary(0)
    }

    fn parse_binary(&mut self, min_level: usize) -> Result<VarnodeData, Error> {
        // Precedence levels, loosest first.
        const LEVELS: &[&[&str]] = &[
            &["||"],
            &["&&"],
            &["|"],
            &["^"],
            &["&"],
            &["==", "!="],
            &["<", "<=", ">", ">=", "s<", "s<=", "s>", "s>="],
            &["<<", ">>", "s>>"],
            &["+", "-"],
            &["*", "/", "%", "s/", "s%"],
        ];
        if min_level >= LEVELS.len() {
            return self.parse_unary();
        }
        let mut left = self.parse_binary(min_level + 1)?;
        loop {
            let Some(op) = self.peek_operator(LEVELS[min_level]) else {
                return Ok(left);
            };
            let right = self.parse_binary(min_level + 1)?;
            left = self.emit_binary(&op, left, right)?;
        }
    }

    /// Match an operator at the current position, including the
    /// `s`-prefixed signed forms which lex as an ident plus a punct.
    fn peek_operator(&mut self, candidates: &[&str]) -> Option<String> {
        match self.peek() {
            Some(Token::Punct(p)) if candidates.contains(p) => {
                let op = (*p).to_string();
                self.advance();
                Some(op)
            }
            Some(Token::Ident(word)) if word == "s" => {
                let Some(Token::Punct(p)) = self.tokens.get(self.pos + 1) else {
                    return None;
                };
                let combined = format!("s{p}");
                if candidates.contains(&combined.as_str()) {
                    self.advance();
                    self.advance();
                    Some(combined)
                } else {
                    None
                }
            }
            _ => None,
        }
    }

    fn parse_unary(&mut self) -> Result<VarnodeData, Error> {
        match self.peek().cloned() {
            Some(Token::Punct("-")) => {
                self.advance();
                let operand = self.parse_unary()?;
                let out = self.alloc_temp(operand.size);
                self.push_op(OpCode::Int2Comp, Some(out.clone()), vec![operand]);
                Ok(out)
            }
            Some(Token::Punct("~")) => {
                self.advance();
                let operand = self.parse_unary()?;
                let out = self.alloc_temp(operand.size);
                self.push_op(OpCode::IntNegate, Some(out.clone()), vec![operand]);
                Ok(out)
            }
            Some(Token::Punct("!")) => {
                self.advance();
                let operand = self.parse_unary()?;
                let operand = self.force_bool(operand);
                let out = self.alloc_temp(1);
                self.push_op(OpCode::BoolNegate, Some(out.clone()), vec![operand]);
                Ok(out)
            }
            Some(Token::Punct("*")) => {
                self.advance();
                let size = if self.eat_punct(":") {
                    self.next_int()? as u32
                } else {
                    8
                };
                let pointer = self.parse_unary()?;
                let out = self.alloc_temp(size);
                let space_const = self.space_constant(&self.scope.default_space.clone());
                self.push_op(OpCode::Load, Some(out.clone()), vec![space_const, pointer]);
                Ok(out)
            }
            Some(Token::Punct("(")) => {
                self.advance();
                let inner = self.parse_expr()?;
                self.expect_punct(")")?;
                Ok(inner)
            }
            Some(Token::Int(value)) => {
                self.advance();
                let size = if self.eat_punct(":") {
                    self.next_int()? as u32
                } else {
                    8
                };
                Ok(self.constant(value, size))
            }
            Some(Token::Ident(name)) => {
                self.advance();
                self.lookup(&name)
            }
            other => Err(Error::LowLevel(format!(
                "unexpected token {other:?} in snippet expression"
            ))),
        }
    }

    fn emit_binary(
        &mut self,
        op: &str,
        left: VarnodeData,
        right: VarnodeData,
    ) -> Result<VarnodeData, Error> {
        let (opcode, boolean) = match op {
            "+" => (OpCode::IntAdd, false),
            "-" => (OpCode::IntSub, false),
            "*" => (OpCode::IntMult, false),
            "/" => (OpCode::IntDiv, false),
            "s/" => (OpCode::IntSDiv, false),
            "%" => (OpCode::IntRem, false),
            "s%" => (OpCode::IntSRem, false),
            "&" => (OpCode::IntAnd, false),
            "|" => (OpCode::IntOr, false),
            "^" => (OpCode::IntXor, false),
            "<<" => (OpCode::IntLeft, false),
            ">>" => (OpCode::IntRight, false),
            "s>>" => (OpCode::IntSRight, false),
            "==" => (OpCode::IntEqual, true),
            "!=" => (OpCode::IntNotEqual, true),
            "<" => (OpCode::IntLess, true),
            "<=" => (OpCode::IntLessEqual, true),
            "s<" => (OpCode::IntSLess, true),
            "s<=" => (OpCode::IntSLessEqual, true),
            ">" => (OpCode::IntLess, true),
            ">=" => (OpCode::IntLessEqual, true),
            "s>" => (OpCode::IntSLess, true),
            "s>=" => (OpCode::IntSLessEqual, true),
            "&&" => (OpCode::BoolAnd, true),
            "||" => (OpCode::BoolOr, true),
            other => {
                return Err(Error::LowLevel(format!("unsupported operator `{other}`")));
            }
        };
        // Greater-than forms swap operands around the less-than ops.
        let swap = matches!(op, ">" | ">=" | "s>" | "s>=");
        let (mut a, mut b) = if swap { (right, left) } else { (left, right) };
        if matches!(opcode, OpCode::BoolAnd | OpCode::BoolOr) {
            a = self.force_bool(a);
            b = self.force_bool(b);
        } else {
            let size = a.size.max(b.size);
            a = self.coerce(a, size);
            b = self.coerce(b, size);
        }
        let out_size = if boolean { 1 } else { a.size };
        let out = self.alloc_temp(out_size);
        self.push_op(opcode, Some(out.clone()), vec![a, b]);
        Ok(out)
    }

    /// Convert the raw op list into template ops, checking that every
    /// referenced label was defined.
    fn finish(self) -> Result<Vec<OpTpl>, Error> {
        let defined: Vec<usize> = self
            .ops
            .iter()
            .filter_map(|op| match op {
                RawOp::Label(id) => Some(*id),
                _ => None,
            })
            .collect();
        let mut result = Vec::with_capacity(self.ops.len());
        for raw in &self.ops {
            match raw {
                RawOp::Op {
                    opcode,
                    output,
                    inputs,
                } => result.push(OpTpl {
                    opcode: opcode.raw(),
                    output: output.as_ref().map(vn_tpl),
                    inputs: inputs.iter().map(vn_tpl).collect(),
                }),
                RawOp::Label(id) => result.push(OpTpl {
                    opcode: DIRECTIVE_LABEL,
                    output: None,
                    inputs: vec![VarnodeTpl {
                        space: ConstTpl::SpaceId(Arc::clone(&self.scope.const_space)),
                        offset: ConstTpl::Real(*id as u64),
                        size: ConstTpl::Real(4),
                    }],
                }),
                RawOp::BranchTo {
                    opcode,
                    label,
                    condition,
                } => {
                    if !defined.contains(label) {
                        return Err(Error::LowLevel(
                            "goto references a label that is never placed".into(),
                        ));
                    }
                    let mut inputs = vec![VarnodeTpl {
                        space: ConstTpl::SpaceId(Arc::clone(&self.scope.const_space)),
                        offset: ConstTpl::Relative(*label as u64),
                        size: ConstTpl::Real(4),
                    }];
                    if let Some(cond) = condition {
                        inputs.push(vn_tpl(cond));
                    }
                    result.push(OpTpl {
                        opcode: opcode.raw(),
                        output: None,
                        inputs,
                    });
                }
            }
        }
        Ok(result)
    }

    fn lookup(&self, name: &str) -> Result<VarnodeData, Error> {
        if let Some(local) = self.locals.get(name) {
            return Ok(local.clone());
        }
        (self.scope.resolve)(name)
            .ok_or_else(|| Error::LowLevel(format!("unknown name `{name}` in snippet")))
    }

    fn constant(&self, value: u64, size: u32) -> VarnodeData {
        VarnodeData::constant(Arc::clone(&self.scope.const_space), value, size)
    }

    fn space_constant(&self, space: &Arc<AddrSpace>) -> VarnodeData {
        VarnodeData::new(
            Arc::clone(&self.scope.const_space),
            space.index() as u64,
            8,
        )
    }

    /// Rewrite a constant into an address in the jump space.
    fn as_code_address(&self, vn: VarnodeData) -> VarnodeData {
        if vn.is_constant() {
            VarnodeData::new(
                Arc::clone(&self.scope.default_space),
                vn.offset,
                self.scope.default_space.addr_size(),
            )
        } else {
            vn
        }
    }

    /// Reduce a value to a 1-byte boolean.
    fn force_bool(&mut self, vn: VarnodeData) -> VarnodeData {
        if vn.size == 1 {
            return vn;
        }
        let zero = self.constant(0, vn.size);
        let out = self.alloc_temp(1);
        self.push_op(OpCode::IntNotEqual, Some(out.clone()), vec![vn, zero]);
        out
    }

    /// Match a value to `size`, zero-extending or truncating through
    /// a temporary when needed.
    fn coerce(&mut self, vn: VarnodeData, size: u32) -> VarnodeData {
        if vn.size == size {
            return vn;
        }
        if vn.is_constant() {
            return self.constant(vn.offset, size);
        }
        let out = self.alloc_temp(size);
        if vn.size < size {
            self.push_op(OpCode::IntZExt, Some(out.clone()), vec![vn]);
        } else {
            let zero = self.constant(0, 4);
            self.push_op(OpCode::SubPiece, Some(out.clone()), vec![vn, zero]);
        }
        out
    }

    fn alloc_temp(&mut self, size: u32) -> VarnodeData {
        let offset = self.next_temp;
        self.next_temp += 16;
        VarnodeData::new(Arc::clone(&self.scope.unique_space), offset, size)
    }

    fn push_op(&mut self, opcode: OpCode, output: Option<VarnodeData>, inputs: Vec<VarnodeData>) {
        self.ops.push(RawOp::Op {
            opcode,
            output,
            inputs,
        });
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn advance(&mut self) {
        self.pos += 1;
    }

    fn eat_punct(&mut self, punct: &str) -> bool {
        if matches!(self.peek(), Some(Token::Punct(p)) if *p == punct) {
            self.advance();
            return true;
        }
        false
    }

    fn expect_punct(&mut self, punct: &'static str) -> Result<(), Error> {
        if !self.eat_punct(punct) {
            return Err(Error::LowLevel(format!(
                "expected `{punct}` in snippet, found {:?}",
                self.peek()
            )));
        }
        Ok(())
    }

    fn next_ident(&mut self) -> Result<String, Error> {
        match self.peek().cloned() {
            Some(Token::Ident(name)) => {
                self.advance();
                Ok(name)
            }
            other => Err(Error::LowLevel(format!(
                "expected a name in snippet, found {other:?}"
            ))),
        }
    }

    fn next_int(&mut self) -> Result<u64, Error> {
        match self.peek().cloned() {
            Some(Token::Int(value)) => {
                self.advance();
                Ok(value)
            }
            other => Err(Error::LowLevel(format!(
                "expected an integer in snippet, found {other:?}"
            ))),
        }
    }
}

fn vn_tpl(vn: &VarnodeData) -> VarnodeTpl {
    VarnodeTpl {
        space: ConstTpl::SpaceId(Arc::clone(&vn.space)),
        offset: ConstTpl::Real(vn.offset),
        size: ConstTpl::Real(vn.size as u64),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_pcode::{SpaceFlags, SpaceKind, SpaceManager};

    fn scope_fixture() -> (SpaceManager, Arc<AddrSpace>, Arc<AddrSpace>) {
        let mut manager = SpaceManager::new();
        let ram = manager
            .insert(AddrSpace::new(
                "ram",
                SpaceKind::Processor,
                1,
                8,
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
        (manager, ram, unique)
    }

    fn compile(source: &str) -> Result<ConstructTpl, Error> {
        let (manager, ram, unique) = scope_fixture();
        let resolve = |name: &str| -> Option<VarnodeData> {
            match name {
                "r0" => Some(VarnodeData::new(Arc::clone(&ram), 0x1000, 8)),
                "r1" => Some(VarnodeData::new(Arc::clone(&ram), 0x1008, 8)),
                _ => None,
            }
        };
        let scope = SnippetScope {
            resolve: &resolve,
            default_space: Arc::clone(&ram),
            const_space: manager.constant_space(),
            unique_space: Arc::clone(&unique),
            temp_base: 0x1_0000,
        };
        compile_snippet(source, &scope)
    }

    #[test]
    fn assignment_compiles_to_copy() {
        let tpl = compile("r0 = r1;").unwrap();
        assert_eq!(tpl.ops.len(), 1);
        assert_eq!(tpl.ops[0].opcode, OpCode::Copy.raw());
    }

    #[test]
    fn arithmetic_allocates_temporaries() {
        let tpl = compile("r0 = r1 + 4;").unwrap();
        // INT_ADD into a temp, then COPY to r0.
        assert_eq!(tpl.ops.len(), 2);
        assert_eq!(tpl.ops[0].opcode, OpCode::IntAdd.raw());
        assert_eq!(tpl.ops[1].opcode, OpCode::Copy.raw());
    }

    #[test]
    fn precedence_orders_mul_before_add() {
        let tpl = compile("r0 = r1 + r1 * 2;").unwrap();
        assert_eq!(tpl.ops[0].opcode, OpCode::IntMult.raw());
        assert_eq!(tpl.ops[1].opcode, OpCode::IntAdd.raw());
    }

    #[test]
    fn labels_and_branches_resolve() {
        let tpl = compile(
            "if (r0 == 0) goto <done>; r0 = r0 - 1; <done> return [r0];",
        )
        .unwrap();
        assert_eq!(tpl.num_labels, 1);
        let cbranch = tpl
            .ops
            .iter()
            .find(|op| op.opcode == OpCode::CBranch.raw())
            .expect("cbranch present");
        assert!(matches!(
            cbranch.inputs[0].offset,
            ConstTpl::Relative(0)
        ));
        assert!(tpl
            .ops
            .iter()
            .any(|op| op.opcode == DIRECTIVE_LABEL));
    }

    #[test]
    fn undefined_label_is_rejected() {
        assert!(compile("goto <nowhere>;").is_err());
    }

    #[test]
    fn store_and_load_wrap_default_space() {
        let tpl = compile("*:4 r0 = r1; r1 = *:4 r0;").unwrap();
        assert_eq!(tpl.ops[1].opcode, OpCode::Store.raw());
        assert_eq!(tpl.ops[2].opcode, OpCode::Load.raw());
    }

    #[test]
    fn constant_goto_lands_in_default_space() {
        let tpl = compile("goto 0x4000;").unwrap();
        assert_eq!(tpl.ops[0].opcode, OpCode::Branch.raw());
        let ConstTpl::SpaceId(space) = &tpl.ops[0].inputs[0].space else {
            panic!("expected a concrete space");
        };
        assert_eq!(space.name(), "ram");
    }

    #[test]
    fn unknown_name_is_rejected() {
        assert!(compile("r9 = 1;").is_err());
    }

    #[test_case::test_case("r0 = r1 & 1;", OpCode::IntAnd; "and")]
    #[test_case::test_case("r0 = r1 | 1;", OpCode::IntOr; "or")]
    #[test_case::test_case("r0 = r1 ^ 1;", OpCode::IntXor; "xor")]
    #[test_case::test_case("r0 = r1 << 2;", OpCode::IntLeft; "shift left")]
    #[test_case::test_case("r0 = r1 >> 2;", OpCode::IntRight; "shift right")]
    #[test_case::test_case("r0 = r1 s>> 2;", OpCode::IntSRight; "arithmetic shift")]
    #[test_case::test_case("r0 = -r1;", OpCode::Int2Comp; "negate")]
    #[test_case::test_case("r0 = ~r1;", OpCode::IntNegate; "complement")]
    fn operators_map_to_opcodes(source: &str, opcode: OpCode) {
        let tpl = compile(source).unwrap();
        assert!(tpl.ops.iter().any(|op| op.opcode == opcode.raw()));
    }
}
