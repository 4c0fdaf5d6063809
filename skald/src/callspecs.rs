//! Call-site bookkeeping.
//!
//! Call ops refer to their specs through the registry by sequence
//! number; nothing carries specs by pointer.

use hashbrown::HashMap;

use skald_pcode::{Address, SeqNum};

/// Everything the follower knows about one call site.
#[derive(Debug, Clone)]
pub struct FuncCallSpecs {
    /// The CALL or CALLIND op.
    pub op: SeqNum,
    /// Address of the calling instruction.
    pub call_addr: Address,
    /// Entry of the callee; absent for indirect calls.
    pub entry: Option<Address>,
    /// Whether the callee should be expanded in place.
    pub is_inline: bool,
    /// Whether the callee never returns.
    pub is_noreturn: bool,
    /// Call-fixup payload replacing the call, when configured.
    pub fixup: Option<usize>,
}

/// Registry of call sites in discovery order.
#[derive(Debug, Default)]
pub struct CallSpecsRegistry {
    order: Vec<SeqNum>,
    by_op: HashMap<SeqNum, FuncCallSpecs>,
}

impl CallSpecsRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of recorded call sites.
    pub fn len(&self) -> usize {
        self.order.len()
    }

    /// Whether no call sites were recorded.
    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Record a call site.
    pub fn insert(&mut self, specs: FuncCallSpecs) {
        if self.by_op.insert(specs.op.clone(), specs.clone()).is_none() {
            self.order.push(specs.op);
        }
    }

    /// The specs attached to a call op.
    pub fn get(&self, op: &SeqNum) -> Option<&FuncCallSpecs> {
        self.by_op.get(op)
    }

    /// Mutable access to the specs attached to a call op.
    pub fn get_mut(&mut self, op: &SeqNum) -> Option<&mut FuncCallSpecs> {
        self.by_op.get_mut(op)
    }

    /// Drop the specs of an op that is no longer a call.
    pub fn remove(&mut self, op: &SeqNum) -> Option<FuncCallSpecs> {
        self.order.retain(|seq| seq != op);
        self.by_op.remove(op)
    }

    /// Iterate call sites in discovery order.
    pub fn iter(&self) -> impl Iterator<Item = &FuncCallSpecs> {
        self.order.iter().filter_map(|seq| self.by_op.get(seq))
    }

    /// Sequence numbers of all call ops in discovery order.
    pub fn ops(&self) -> Vec<SeqNum> {
        self.order.clone()
    }

    /// Drop everything.
    pub fn clear(&mut self) {
        self.order.clear();
        self.by_op.clear();
    }
}

/// Knowledge about callees supplied by the surrounding analysis.
pub trait FunctionOracle {
    /// Properties of the function entered at `entry`.
    fn properties(&self, entry: &Address) -> FunctionProps {
        let _ = entry;
        FunctionProps::default()
    }
}

/// Callee properties the follower acts on.
#[derive(Debug, Clone, Copy, Default)]
pub struct FunctionProps {
    /// The callee should be expanded in place.
    pub is_inline: bool,
    /// The callee never returns.
    pub is_noreturn: bool,
    /// Payload id of a call fixup replacing calls to this function.
    pub call_fixup: Option<usize>,
}

/// Oracle with no knowledge; every call is an ordinary call.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoFunctionInfo;

impl FunctionOracle for NoFunctionInfo {}
