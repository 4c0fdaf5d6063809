//! The p-code injection library.
//!
//! Payloads are pre-compiled p-code templates spliced into the flow
//! in place of calls (call fix-ups), user ops (call-other fix-ups),
//! call mechanics (mechanism fix-ups), or evaluated directly
//! (executable p-code). Payloads are keyed by a stable integer id and
//! by name within four disjoint namespaces.

use std::sync::{Arc, OnceLock};

use hashbrown::HashMap;
use smallvec::SmallVec;

use skald_pcode::{calc_mask, AddrSpace, Address, OpCode, PcodeEmit, VarnodeData};
use skald_sleigh::builder::{PcodeCacher, PcodeData};
use skald_sleigh::sla::format::*;
use skald_sleigh::sla::PackedDecoder;
use skald_sleigh::snippet::{compile_snippet, SnippetScope};
use skald_sleigh::template::{ConstTpl, ConstructTpl, VarnodeTpl, DIRECTIVE_LABEL};

use crate::error::FlowError;

/// The four payload namespaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InjectKind {
    /// Replaces a CALL to a specific function.
    CallFixup,
    /// Replaces a CALLOTHER user op.
    CallOtherFixup,
    /// Wraps call sites with prologue/epilogue mechanics.
    CallMechanism,
    /// Standalone evaluable snippet.
    ExecutablePcode,
}

impl InjectKind {
    fn namespace(self) -> usize {
        match self {
            Self::CallFixup => 0,
            Self::CallOtherFixup => 1,
            Self::CallMechanism => 2,
            Self::ExecutablePcode => 3,
        }
    }
}

/// Declared parameter of a payload.
#[derive(Debug, Clone)]
pub struct InjectParameter {
    /// Name the snippet body refers to.
    pub name: String,
    /// Parameter size in bytes.
    pub size: u32,
}

/// Concrete call-site values substituted into a payload.
#[derive(Debug, Clone, Default)]
pub struct InjectContext {
    /// Address of the op being replaced.
    pub base_addr: Option<Address>,
    /// Entry of the callee, for call fix-ups.
    pub call_addr: Option<Address>,
    /// Actual input varnodes of the replaced op.
    pub inputs: Vec<VarnodeData>,
    /// Actual output varnode of the replaced op.
    pub output: Option<VarnodeData>,
}

impl InjectContext {
    /// Reset for reuse; callers must clear before filling.
    pub fn clear(&mut self) {
        self.base_addr = None;
        self.call_addr = None;
        self.inputs.clear();
        self.output = None;
    }
}

/// One op of a compiled evaluation body.
#[derive(Debug, Clone)]
struct EvalOp {
    opcode: OpCode,
    output: Option<VarnodeData>,
    inputs: Vec<VarnodeData>,
    /// Absolute op index of a relative branch target.
    branch_to: Option<usize>,
}

/// A named injection template.
#[derive(Debug)]
pub struct InjectPayload {
    /// Namespace of the payload.
    pub kind: InjectKind,
    /// Name within its namespace.
    pub name: String,
    /// Whether the parameter copies are bookkeeping, not semantics.
    pub incidental_copy: bool,
    /// Declared inputs.
    pub inputs: Vec<InjectParameter>,
    /// Declared outputs.
    pub outputs: Vec<InjectParameter>,
    template: ConstructTpl,
    input_slots: Vec<VarnodeData>,
    output_slots: Vec<VarnodeData>,
    const_space: Arc<AddrSpace>,
    eval_body: OnceLock<Result<Vec<EvalOp>, String>>,
}

impl InjectPayload {
    /// Splice the payload at the context's call site, streaming the
    /// concrete ops to `emit`.
    pub fn inject(
        &self,
        context: &InjectContext,
        emit: &mut dyn PcodeEmit,
    ) -> Result<(), FlowError> {
        let base_addr = context
            .base_addr
            .clone()
            .ok_or_else(|| FlowError::Inject("injection context has no address".into()))?;
        if context.inputs.len() < self.inputs.len() {
            return Err(FlowError::Inject(format!(
                "payload `{}` expects {} inputs, got {}",
                self.name,
                self.inputs.len(),
                context.inputs.len()
            )));
        }

        let mut cacher = PcodeCacher::new();
        for (slot, actual) in self.input_slots.iter().zip(&context.inputs) {
            cacher.allocate_instruction(PcodeData {
                opcode: OpCode::Copy,
                output: Some(slot.clone()),
                inputs: SmallVec::from_vec(vec![actual.clone()]),
            });
        }
        self.instantiate(&mut cacher)?;
        if let (Some(slot), Some(actual)) = (self.output_slots.first(), &context.output) {
            cacher.allocate_instruction(PcodeData {
                opcode: OpCode::Copy,
                output: Some(actual.clone()),
                inputs: SmallVec::from_vec(vec![slot.clone()]),
            });
        }
        cacher
            .resolve_relatives()
            .map_err(|err| FlowError::Inject(err.to_string()))?;
        cacher.emit(&base_addr, emit);
        Ok(())
    }

    /// Evaluate an executable payload on concrete input values.
    ///
    /// Inputs are written to the reserved unique slots, the body runs
    /// on a stripped-down emulator until it halts, and the first
    /// output slot's value is returned.
    pub fn evaluate(&self, inputs: &[u64]) -> Result<u64, FlowError> {
        if self.kind != InjectKind::ExecutablePcode {
            return Err(FlowError::Inject(format!(
                "payload `{}` is not executable",
                self.name
            )));
        }
        if inputs.len() != self.inputs.len() {
            return Err(FlowError::Inject(format!(
                "payload `{}` expects {} inputs, got {}",
                self.name,
                self.inputs.len(),
                inputs.len()
            )));
        }
        let body = self
            .eval_body
            .get_or_init(|| self.compile_for_eval().map_err(|err| err.to_string()))
            .as_ref()
            .map_err(|err| FlowError::Inject(err.clone()))?;

        let mut state: HashMap<(usize, u64), u64> = HashMap::new();
        for (slot, value) in self.input_slots.iter().zip(inputs) {
            state.insert(slot_key(slot), *value & calc_mask(slot.size));
        }

        let read = |state: &HashMap<(usize, u64), u64>, vn: &VarnodeData| -> u64 {
            if vn.is_constant() {
                vn.offset
            } else {
                state.get(&slot_key(vn)).copied().unwrap_or(0) & calc_mask(vn.size)
            }
        };

        let mut pc = 0usize;
        let mut steps = 0usize;
        'run: while pc < body.len() {
            steps += 1;
            if steps > 10_000 {
                return Err(FlowError::Inject(format!(
                    "payload `{}` exceeded its step budget",
                    self.name
                )));
            }
            let op = &body[pc];
            match op.opcode {
                OpCode::Return => break 'run,
                OpCode::Branch => {
                    pc = op
                        .branch_to
                        .ok_or_else(|| absolute_branch_error(&self.name))?;
                    continue;
                }
                OpCode::CBranch => {
                    let cond = read(&state, &op.inputs[1]);
                    if cond != 0 {
                        pc = op
                            .branch_to
                            .ok_or_else(|| absolute_branch_error(&self.name))?;
                        continue;
                    }
                }
                OpCode::Load => {
                    let space = op.inputs[0].offset as usize;
                    let pointer = read(&state, &op.inputs[1]);
                    let out = op.output.as_ref().expect("load has an output");
                    let value = state.get(&(space, pointer)).copied().unwrap_or(0);
                    state.insert(slot_key(out), value & calc_mask(out.size));
                }
                OpCode::Store => {
                    let space = op.inputs[0].offset as usize;
                    let pointer = read(&state, &op.inputs[1]);
                    let value = read(&state, &op.inputs[2]);
                    state.insert((space, pointer), value);
                }
                opcode => {
                    let out = op.output.as_ref().ok_or_else(|| {
                        FlowError::Inject(format!(
                            "op {opcode} without output in executable payload"
                        ))
                    })?;
                    let a = op.inputs.first().map(|vn| read(&state, vn)).unwrap_or(0);
                    let b = op.inputs.get(1).map(|vn| read(&state, vn)).unwrap_or(0);
                    let in_size = op.inputs.first().map(|vn| vn.size).unwrap_or(8);
                    let value = eval_arith(opcode, a, b, in_size, &self.name)?;
                    state.insert(slot_key(out), value & calc_mask(out.size));
                }
            }
            pc += 1;
        }

        let result_slot = self.output_slots.first().ok_or_else(|| {
            FlowError::Inject(format!("payload `{}` declares no output", self.name))
        })?;
        Ok(state
            .get(&slot_key(result_slot))
            .copied()
            .unwrap_or(0)
            & calc_mask(result_slot.size))
    }

    /// Expand the template into the cacher, turning label directives
    /// into cacher labels.
    fn instantiate(&self, cacher: &mut PcodeCacher) -> Result<(), FlowError> {
        for op in &self.template.ops {
            if op.opcode == DIRECTIVE_LABEL {
                let id = concrete_offset(&op.inputs[0])?;
                cacher.add_label(id as usize);
                continue;
            }
            let opcode = OpCode::from_raw(op.opcode).ok_or_else(|| {
                FlowError::Inject(format!("payload op {} is not injectable", op.opcode))
            })?;
            let mut inputs = SmallVec::new();
            let mut relative = None;
            for (slot, vn_tpl) in op.inputs.iter().enumerate() {
                if let ConstTpl::Relative(label) = vn_tpl.offset {
                    let size = match vn_tpl.size {
                        ConstTpl::Real(size) => size as u32,
                        _ => 4,
                    };
                    inputs.push(VarnodeData::constant(
                        Arc::clone(&self.const_space),
                        label,
                        size,
                    ));
                    relative = Some(slot);
                } else {
                    inputs.push(concrete_varnode(vn_tpl)?);
                }
            }
            let output = op
                .output
                .as_ref()
                .map(concrete_varnode)
                .transpose()?;
            let index = cacher.allocate_instruction(PcodeData {
                opcode,
                output,
                inputs,
            });
            if let Some(slot) = relative {
                cacher.add_label_ref(index, slot);
            }
        }
        Ok(())
    }

    /// Flatten the template into directly executable ops with
    /// absolute branch targets.
    fn compile_for_eval(&self) -> Result<Vec<EvalOp>, FlowError> {
        let mut labels: HashMap<u64, usize> = HashMap::new();
        let mut pending: Vec<(usize, u64)> = Vec::new();
        let mut body: Vec<EvalOp> = Vec::new();
        for op in &self.template.ops {
            if op.opcode == DIRECTIVE_LABEL {
                let id = concrete_offset(&op.inputs[0])?;
                labels.insert(id, body.len());
                continue;
            }
            let opcode = OpCode::from_raw(op.opcode).ok_or_else(|| {
                FlowError::Inject(format!("payload op {} is not executable", op.opcode))
            })?;
            let mut inputs = Vec::with_capacity(op.inputs.len());
            let mut branch_to = None;
            for vn_tpl in &op.inputs {
                if let ConstTpl::Relative(label) = vn_tpl.offset {
                    pending.push((body.len(), label));
                    branch_to = Some(usize::MAX);
                    inputs.push(VarnodeData::constant(
                        Arc::clone(&self.const_space),
                        label,
                        4,
                    ));
                } else {
                    inputs.push(concrete_varnode(vn_tpl)?);
                }
            }
            let output = op
                .output
                .as_ref()
                .map(concrete_varnode)
                .transpose()?;
            body.push(EvalOp {
                opcode,
                output,
                inputs,
                branch_to,
            });
        }
        for (index, label) in pending {
            let target = *labels.get(&label).ok_or_else(|| {
                FlowError::Inject("payload branches to an unplaced label".into())
            })?;
            body[index].branch_to = Some(target);
        }
        Ok(body)
    }
}

fn absolute_branch_error(name: &str) -> FlowError {
    FlowError::Inject(format!(
        "payload `{name}` branches outside its own body"
    ))
}

fn slot_key(vn: &VarnodeData) -> (usize, u64) {
    (vn.space.index(), vn.offset)
}

fn concrete_varnode(vn_tpl: &VarnodeTpl) -> Result<VarnodeData, FlowError> {
    let ConstTpl::SpaceId(space) = &vn_tpl.space else {
        return Err(FlowError::Inject(
            "payload template is not fully concrete".into(),
        ));
    };
    let ConstTpl::Real(offset) = vn_tpl.offset else {
        return Err(FlowError::Inject(
            "payload template is not fully concrete".into(),
        ));
    };
    let ConstTpl::Real(size) = vn_tpl.size else {
        return Err(FlowError::Inject(
            "payload template is not fully concrete".into(),
        ));
    };
    Ok(VarnodeData::new(Arc::clone(space), offset, size as u32))
}

fn concrete_offset(vn_tpl: &VarnodeTpl) -> Result<u64, FlowError> {
    match vn_tpl.offset {
        ConstTpl::Real(value) => Ok(value),
        _ => Err(FlowError::Inject(
            "payload template is not fully concrete".into(),
        )),
    }
}

fn eval_arith(
    opcode: OpCode,
    a: u64,
    b: u64,
    size: u32,
    name: &str,
) -> Result<u64, FlowError> {
    let mask = calc_mask(size);
    let sign_extend = |v: u64| -> i64 {
        let width = u64::from(size) * 8;
        if width >= 64 {
            v as i64
        } else if (v >> (width - 1)) & 1 == 1 {
            (v | !mask) as i64
        } else {
            v as i64
        }
    };
    let res = match opcode {
        OpCode::Copy => a,
        OpCode::IntAdd => a.wrapping_add(b),
        OpCode::IntSub => a.wrapping_sub(b),
        OpCode::IntMult => a.wrapping_mul(b),
        OpCode::IntDiv => {
            if b == 0 {
                return Err(FlowError::Inject(format!(
                    "division by zero in payload `{name}`"
                )));
            }
            a / b
        }
        OpCode::IntSDiv => {
            if b == 0 {
                return Err(FlowError::Inject(format!(
                    "division by zero in payload `{name}`"
                )));
            }
            sign_extend(a).wrapping_div(sign_extend(b)) as u64
        }
        OpCode::IntRem => {
            if b == 0 {
                return Err(FlowError::Inject(format!(
                    "division by zero in payload `{name}`"
                )));
            }
            a % b
        }
        OpCode::IntSRem => {
            if b == 0 {
                return Err(FlowError::Inject(format!(
                    "division by zero in payload `{name}`"
                )));
            }
            sign_extend(a).wrapping_rem(sign_extend(b)) as u64
        }
        OpCode::IntAnd => a & b,
        OpCode::IntOr => a | b,
        OpCode::IntXor => a ^ b,
        OpCode::IntLeft => {
            if b >= 64 {
                0
            } else {
                a << b
            }
        }
        OpCode::IntRight => {
            if b >= 64 {
                0
            } else {
                (a & mask) >> b
            }
        }
        OpCode::IntSRight => {
            if b >= 64 {
                if sign_extend(a) < 0 {
                    u64::MAX
                } else {
                    0
                }
            } else {
                (sign_extend(a) >> b) as u64
            }
        }
        OpCode::Int2Comp => (a as i64).wrapping_neg() as u64,
        OpCode::IntNegate => !a,
        OpCode::IntZExt => a & mask,
        OpCode::IntSExt => sign_extend(a) as u64,
        OpCode::SubPiece => a >> (8 * b),
        OpCode::IntEqual => u64::from((a & mask) == (b & mask)),
        OpCode::IntNotEqual => u64::from((a & mask) != (b & mask)),
        OpCode::IntLess => u64::from((a & mask) < (b & mask)),
        OpCode::IntLessEqual => u64::from((a & mask) <= (b & mask)),
        OpCode::IntSLess => u64::from(sign_extend(a) < sign_extend(b)),
        OpCode::IntSLessEqual => u64::from(sign_extend(a) <= sign_extend(b)),
        OpCode::BoolNegate => u64::from(a == 0),
        OpCode::BoolAnd => u64::from(a != 0 && b != 0),
        OpCode::BoolOr => u64::from(a != 0 || b != 0),
        OpCode::BoolXor => u64::from((a != 0) ^ (b != 0)),
        OpCode::PopCount => u64::from((a & mask).count_ones()),
        other => {
            return Err(FlowError::Inject(format!(
                "op {other} is not executable in payload `{name}`"
            )));
        }
    };
    Ok(res)
}

/// Resolver for register names referenced by payload bodies.
pub type RegisterResolver = Box<dyn Fn(&str) -> Option<VarnodeData> + Send + Sync>;

/// The per-session payload registry.
pub struct InjectLibrary {
    payloads: Vec<InjectPayload>,
    namespaces: [HashMap<String, usize>; 4],
    cached_context: InjectContext,
    resolver: RegisterResolver,
    const_space: Arc<AddrSpace>,
    default_space: Arc<AddrSpace>,
    unique_space: Arc<AddrSpace>,
    slot_base: u64,
    next_slot: u64,
}

impl InjectLibrary {
    /// Parameter and scratch slots live in the unique space starting
    /// at this offset.
    const SLOT_REGION: u64 = 0x1000_0000;

    /// Create an empty library over the session's spaces.
    pub fn new(
        const_space: Arc<AddrSpace>,
        default_space: Arc<AddrSpace>,
        unique_space: Arc<AddrSpace>,
        resolver: RegisterResolver,
    ) -> Self {
        Self {
            payloads: Vec::new(),
            namespaces: Default::default(),
            cached_context: InjectContext::default(),
            resolver,
            const_space,
            default_space,
            unique_space,
            slot_base: Self::SLOT_REGION,
            next_slot: Self::SLOT_REGION,
        }
    }

    /// Number of registered payloads.
    pub fn len(&self) -> usize {
        self.payloads.len()
    }

    /// Whether the library is empty.
    pub fn is_empty(&self) -> bool {
        self.payloads.is_empty()
    }

    /// Payload by id.
    pub fn get_payload(&self, id: usize) -> Result<&InjectPayload, FlowError> {
        self.payloads
            .get(id)
            .ok_or_else(|| FlowError::Inject(format!("no payload with id {id}")))
    }

    /// Id of a payload by kind and name.
    pub fn get_payload_id(&self, kind: InjectKind, name: &str) -> Option<usize> {
        self.namespaces[kind.namespace()].get(name).copied()
    }

    /// Name of a call-fixup payload.
    pub fn get_call_fixup_name(&self, id: usize) -> Option<&str> {
        self.name_of(id, InjectKind::CallFixup)
    }

    /// Name of a call-other-fixup payload.
    pub fn get_call_other_fixup_name(&self, id: usize) -> Option<&str> {
        self.name_of(id, InjectKind::CallOtherFixup)
    }

    /// Name of a call-mechanism payload.
    pub fn get_call_mechanism_name(&self, id: usize) -> Option<&str> {
        self.name_of(id, InjectKind::CallMechanism)
    }

    fn name_of(&self, id: usize, kind: InjectKind) -> Option<&str> {
        self.payloads
            .get(id)
            .filter(|payload| payload.kind == kind)
            .map(|payload| payload.name.as_str())
    }

    /// The reusable context object; clear before filling.
    pub fn get_cached_context(&mut self) -> &mut InjectContext {
        &mut self.cached_context
    }

    /// Decode a payload from a specification stream: a `<pcode>`
    /// element with `<input>`/`<output>` children and a `<body>`
    /// carrying snippet source. Returns the new payload's id.
    pub fn decode_inject(
        &mut self,
        source: &str,
        name: &str,
        kind: InjectKind,
        decoder: &mut PackedDecoder<'_>,
    ) -> Result<usize, FlowError> {
        let map_err =
            |err: skald_sleigh::Error| FlowError::Inject(format!("{source}: {err}"));
        decoder.open_element(ELEM_PCODE).map_err(map_err)?;
        let mut inputs = Vec::new();
        let mut outputs = Vec::new();
        let mut body = String::new();
        loop {
            match decoder.peek_element() {
                Some(ELEM_INPUT) => {
                    decoder.open_element(ELEM_INPUT).map_err(map_err)?;
                    inputs.push(InjectParameter {
                        name: decoder.read_string(ATTRIB_NAME).map_err(map_err)?,
                        size: decoder.read_uint_or(ATTRIB_SIZE, 8).map_err(map_err)? as u32,
                    });
                    decoder.close_element(ELEM_INPUT).map_err(map_err)?;
                }
                Some(ELEM_OUTPUT) => {
                    decoder.open_element(ELEM_OUTPUT).map_err(map_err)?;
                    outputs.push(InjectParameter {
                        name: decoder.read_string(ATTRIB_NAME).map_err(map_err)?,
                        size: decoder.read_uint_or(ATTRIB_SIZE, 8).map_err(map_err)? as u32,
                    });
                    decoder.close_element(ELEM_OUTPUT).map_err(map_err)?;
                }
                Some(ELEM_BODY) => {
                    decoder.open_element(ELEM_BODY).map_err(map_err)?;
                    body = decoder.read_string(ATTRIB_SOURCE).map_err(map_err)?;
                    decoder.close_element(ELEM_BODY).map_err(map_err)?;
                }
                _ => break,
            }
        }
        decoder.close_element(ELEM_PCODE).map_err(map_err)?;
        self.compile_payload(kind, name, inputs, outputs, &body)
    }

    /// Compile and register a call fixup from snippet source.
    pub fn manual_call_fixup(&mut self, name: &str, snippet: &str) -> Result<usize, FlowError> {
        self.compile_payload(InjectKind::CallFixup, name, Vec::new(), Vec::new(), snippet)
    }

    /// Compile and register a call-other fixup from snippet source.
    pub fn manual_call_other_fixup(
        &mut self,
        name: &str,
        outputs: Vec<InjectParameter>,
        inputs: Vec<InjectParameter>,
        snippet: &str,
    ) -> Result<usize, FlowError> {
        self.compile_payload(InjectKind::CallOtherFixup, name, inputs, outputs, snippet)
    }

    /// Compile and register an executable snippet.
    pub fn compile_executable(
        &mut self,
        name: &str,
        inputs: Vec<InjectParameter>,
        outputs: Vec<InjectParameter>,
        snippet: &str,
    ) -> Result<usize, FlowError> {
        self.compile_payload(InjectKind::ExecutablePcode, name, inputs, outputs, snippet)
    }

    fn compile_payload(
        &mut self,
        kind: InjectKind,
        name: &str,
        inputs: Vec<InjectParameter>,
        outputs: Vec<InjectParameter>,
        snippet: &str,
    ) -> Result<usize, FlowError> {
        let namespace = kind.namespace();
        if self.namespaces[namespace].contains_key(name) {
            return Err(FlowError::Inject(format!(
                "payload `{name}` registered twice in its namespace"
            )));
        }

        let mut slots: HashMap<String, VarnodeData> = HashMap::new();
        let mut input_slots = Vec::with_capacity(inputs.len());
        let mut output_slots = Vec::with_capacity(outputs.len());
        for param in inputs.iter().chain(&outputs) {
            let slot = VarnodeData::new(
                Arc::clone(&self.unique_space),
                self.next_slot,
                param.size,
            );
            self.next_slot += 16;
            slots.insert(param.name.clone(), slot.clone());
            if input_slots.len() < inputs.len() {
                input_slots.push(slot);
            } else {
                output_slots.push(slot);
            }
        }

        let resolver = &self.resolver;
        let resolve = |ident: &str| -> Option<VarnodeData> {
            slots.get(ident).cloned().or_else(|| resolver(ident))
        };
        let scope = SnippetScope {
            resolve: &resolve,
            default_space: Arc::clone(&self.default_space),
            const_space: Arc::clone(&self.const_space),
            unique_space: Arc::clone(&self.unique_space),
            temp_base: self.next_slot + 0x1000,
        };
        let template = compile_snippet(snippet, &scope)
            .map_err(|err| FlowError::Inject(format!("payload `{name}`: {err}")))?;

        let id = self.payloads.len();
        self.payloads.push(InjectPayload {
            kind,
            name: name.into(),
            incidental_copy: true,
            inputs,
            outputs,
            template,
            input_slots,
            output_slots,
            const_space: Arc::clone(&self.const_space),
            eval_body: OnceLock::new(),
        });
        self.namespaces[namespace].insert(name.into(), id);
        Ok(id)
    }

    /// First unique offset reserved for payload slots; flow and
    /// builder temporaries stay below this.
    pub fn slot_region(&self) -> u64 {
        self.slot_base
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use skald_pcode::{SpaceFlags, SpaceKind, SpaceManager};

    fn library() -> InjectLibrary {
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
        let sp = VarnodeData::new(Arc::clone(&ram), 0x2000, 8);
        let resolver: RegisterResolver = Box::new(move |name| match name {
            "sp" => Some(sp.clone()),
            _ => None,
        });
        InjectLibrary::new(manager.constant_space(), ram, unique, resolver)
    }

    fn param(name: &str, size: u32) -> InjectParameter {
        InjectParameter {
            name: name.into(),
            size,
        }
    }

    #[test]
    fn namespaces_are_disjoint() {
        let mut lib = library();
        let a = lib.manual_call_fixup("probe", "sp = sp + 8;").unwrap();
        let b = lib
            .manual_call_other_fixup("probe", vec![], vec![], "sp = sp - 8;")
            .unwrap();
        assert_ne!(a, b);
        assert_eq!(lib.get_payload_id(InjectKind::CallFixup, "probe"), Some(a));
        assert_eq!(
            lib.get_payload_id(InjectKind::CallOtherFixup, "probe"),
            Some(b)
        );
        assert_eq!(lib.get_call_fixup_name(a), Some("probe"));
        assert_eq!(lib.get_call_fixup_name(b), None);
        assert!(lib.manual_call_fixup("probe", "sp = 0;").is_err());
    }

    #[test]
    fn executable_payload_evaluates_arithmetic() {
        let mut lib = library();
        let id = lib
            .compile_executable(
                "sum3",
                vec![param("a", 8), param("b", 8)],
                vec![param("res", 8)],
                "res = a + b * 3;",
            )
            .unwrap();
        let payload = lib.get_payload(id).unwrap();
        assert_eq!(payload.evaluate(&[5, 4]).unwrap(), 17);
        // The lazily built body is reused across evaluations.
        assert_eq!(payload.evaluate(&[1, 1]).unwrap(), 4);
    }

    #[test]
    fn executable_payload_follows_branches() {
        let mut lib = library();
        let id = lib
            .compile_executable(
                "max",
                vec![param("a", 8), param("b", 8)],
                vec![param("res", 8)],
                "res = a; if (b <= a) goto <done>; res = b; <done> return [res];",
            )
            .unwrap();
        let payload = lib.get_payload(id).unwrap();
        assert_eq!(payload.evaluate(&[3, 9]).unwrap(), 9);
        assert_eq!(payload.evaluate(&[12, 9]).unwrap(), 12);
    }

    #[test]
    fn division_by_zero_is_reported() {
        let mut lib = library();
        let id = lib
            .compile_executable(
                "div",
                vec![param("a", 8), param("b", 8)],
                vec![param("res", 8)],
                "res = a / b;",
            )
            .unwrap();
        let payload = lib.get_payload(id).unwrap();
        assert!(payload.evaluate(&[10, 2]).is_ok());
        assert!(payload.evaluate(&[10, 0]).is_err());
    }

    #[test]
    fn cached_context_is_reusable() {
        let mut lib = library();
        let space = lib.default_space.clone();
        {
            let ctx = lib.get_cached_context();
            ctx.clear();
            ctx.base_addr = Some(Address::new(Arc::clone(&space), 0x100));
        }
        {
            let ctx = lib.get_cached_context();
            assert!(ctx.base_addr.is_some());
            ctx.clear();
            assert!(ctx.base_addr.is_none());
        }
    }

    struct Collect(Vec<(OpCode, Option<VarnodeData>, Vec<VarnodeData>)>);
    impl PcodeEmit for Collect {
        fn dump(
            &mut self,
            _addr: &Address,
            opcode: OpCode,
            output: Option<&VarnodeData>,
            inputs: &[VarnodeData],
        ) {
            self.0.push((opcode, output.cloned(), inputs.to_vec()));
        }
    }

    #[test]
    fn inject_substitutes_call_site_operands() {
        let mut lib = library();
        let id = lib
            .compile_executable(
                "bump",
                vec![param("a", 8)],
                vec![param("res", 8)],
                "res = a + 1;",
            )
            .unwrap();
        let space = lib.default_space.clone();
        let arg = VarnodeData::new(Arc::clone(&space), 0x3000, 8);
        let out = VarnodeData::new(Arc::clone(&space), 0x3008, 8);
        let context = InjectContext {
            base_addr: Some(Address::new(Arc::clone(&space), 0x100)),
            call_addr: None,
            inputs: vec![arg.clone()],
            output: Some(out.clone()),
        };
        let mut sink = Collect(Vec::new());
        lib.get_payload(id)
            .unwrap()
            .inject(&context, &mut sink)
            .unwrap();
        // Copy-in, body, copy-out.
        assert_eq!(sink.0.first().unwrap().0, OpCode::Copy);
        assert_eq!(sink.0.first().unwrap().2[0], arg);
        assert_eq!(sink.0.last().unwrap().0, OpCode::Copy);
        assert_eq!(sink.0.last().unwrap().1, Some(out));
    }
}
