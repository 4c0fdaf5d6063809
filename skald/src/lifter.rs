//! The seam between the flow follower and the instruction decoder.

use skald_pcode::{Address, PcodeEmit};
use skald_sleigh::{Error, Sleigh};

/// Source of decoded instructions.
///
/// The flow follower consumes the decoder through this trait so that
/// tests can script instruction streams without a compiled
/// specification.
pub trait InstructionLifter {
    /// Emit the p-code of one instruction and return its fall-through
    /// byte count (the instruction plus any delay slots).
    fn one_instruction(
        &mut self,
        emit: &mut dyn PcodeEmit,
        addr: &Address,
    ) -> Result<usize, Error>;
}

impl InstructionLifter for Sleigh {
    fn one_instruction(
        &mut self,
        emit: &mut dyn PcodeEmit,
        addr: &Address,
    ) -> Result<usize, Error> {
        Sleigh::one_instruction(self, emit, addr)
    }
}
