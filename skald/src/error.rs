//! Flow-follower error taxonomy.

use skald_pcode::Address;

/// Errors raised while following a function's flow.
///
/// The per-instruction conditions appear here only when their policy
/// flag escalates them; under the default policy they become header
/// warnings and artificial halts instead.
#[derive(Debug, derive_more::Display)]
pub enum FlowError {
    /// Decoder failure surfaced as fatal.
    #[display(fmt = "{_0}")]
    Decode(skald_sleigh::Error),
    /// Flow left the permitted address range.
    #[display(fmt = "flow out of bounds at {addr}")]
    OutOfBounds {
        /// The offending target.
        addr: Address,
    },
    /// Bytes were decoded twice under different instruction framing.
    #[display(fmt = "instruction at {addr} reinterprets already-decoded bytes")]
    Reinterpreted {
        /// Start of the overlapping decode.
        addr: Address,
    },
    /// The instruction budget was exhausted.
    #[display(fmt = "flow exceeded maximum of {max} instructions")]
    TooManyInstructions {
        /// The configured budget.
        max: usize,
    },
    /// An injection payload could not be applied.
    #[display(fmt = "injection failed: {_0}")]
    Inject(String),
    /// The basic-block builder was driven out of order.
    #[display(fmt = "{_0}")]
    BlockGraph(String),
}

impl std::error::Error for FlowError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Decode(err) => Some(err),
            _ => None,
        }
    }
}

impl From<skald_sleigh::Error> for FlowError {
    fn from(err: skald_sleigh::Error) -> Self {
        Self::Decode(err)
    }
}
