//! Function recovery for the Skald decompiler: the flow follower,
//! basic-block partition, call-site bookkeeping, and the p-code
//! injection library.
//!
//! The pipeline is a straight line: a [`FlowInfo`] drives an
//! [`InstructionLifter`] from an entry address, emitting p-code for
//! every reachable instruction into an [`OpBank`], then partitions
//! the op stream into a [`BlockGraph`]. Jump-table recovery, callee
//! knowledge, user ops and injection payloads plug in through the
//! [`FlowEnv`] collaborators.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod block;
pub mod callspecs;
mod error;
pub mod flow;
pub mod inject;
pub mod jumptable;
pub mod lifter;
pub mod opbank;
pub mod userop;

pub use block::{BasicBlock, BlockGraph};
pub use callspecs::{
    CallSpecsRegistry, FuncCallSpecs, FunctionOracle, FunctionProps, NoFunctionInfo,
};
pub use error::FlowError;
pub use flow::{FlowCondition, FlowEnv, FlowFlags, FlowInfo, VisitStat};
pub use inject::{InjectContext, InjectKind, InjectLibrary, InjectParameter, InjectPayload};
pub use jumptable::{
    IndirectFailMode, JumpTable, JumpTableRecovery, NoJumpTables, TableOutcome,
};
pub use lifter::InstructionLifter;
pub use opbank::OpBank;
pub use userop::{NoUserOps, UserOp, UserOpLibrary, UserOpRegistry};

#[doc(no_inline)]
pub use skald_pcode;
#[doc(no_inline)]
pub use skald_sleigh;
