//! Jump-table recovery seam.
//!
//! Recovering a BRANCHIND's target set requires data-flow analysis
//! that lives outside the follower; the follower only schedules
//! recovery, records results, and rewrites unrecoverable jumps.

use skald_pcode::{Address, PcodeOp};

/// A recovered indirect-jump target set.
#[derive(Debug, Clone, Default)]
pub struct JumpTable {
    /// Branch targets in table order.
    pub targets: Vec<Address>,
    /// Addresses and sizes of the table loads feeding the jump, kept
    /// when the follower records jump loads.
    pub load_points: Vec<(Address, u32)>,
}

/// Result of one recovery attempt.
#[derive(Debug, Clone)]
pub enum TableOutcome {
    /// Recovery succeeded.
    Table(JumpTable),
    /// Recovery needs flow that does not exist yet; retry after the
    /// next round.
    Incomplete,
    /// Recovery cannot succeed; rewrite the jump.
    Fail(IndirectFailMode),
}

/// How an unrecoverable indirect jump is rewritten.
///
/// Only the named modes are meaningful; unknown raw values decode to
/// [`IndirectFailMode::Default`] so older override files keep working.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IndirectFailMode {
    /// Treat like a `CALLOTHER`-style unknown effect.
    #[default]
    Default,
    /// The jump is really a return.
    Return,
    /// The jump is a thunk; treat as an indirect call.
    Thunk,
    /// Keep the op but mark its targets unknowable.
    CallOther,
}

impl IndirectFailMode {
    /// Decode a raw override value.
    pub fn from_raw(raw: u32) -> Self {
        match raw {
            2 => Self::Return,
            3 => Self::Thunk,
            4 => Self::CallOther,
            _ => Self::Default,
        }
    }
}

/// Pluggable jump-table recovery.
pub trait JumpTableRecovery {
    /// Attempt to recover the target set of `op`.
    fn find_jump_table(&mut self, op: &PcodeOp) -> TableOutcome;
}

/// Recovery that always fails with the default mode.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoJumpTables;

impl JumpTableRecovery for NoJumpTables {
    fn find_jump_table(&mut self, _op: &PcodeOp) -> TableOutcome {
        TableOutcome::Fail(IndirectFailMode::Default)
    }
}
