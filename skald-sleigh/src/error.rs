//! Decoder error taxonomy.

use skald_pcode::{Address, LoadError};

use crate::context::ContextError;

/// Errors at the decoder boundary.
///
/// The first four variants are the distinguishable kinds consumers
/// dispatch on; the flow follower maps them to warnings or hard
/// failures per its policy flags. The remaining variants are fatal
/// configuration errors.
#[derive(Debug, derive_more::Display)]
pub enum Error {
    /// The matched constructor has no semantics.
    #[display(fmt = "unimplemented instruction ({length} bytes) at {addr}")]
    Unimplemented {
        /// Where the instruction was decoded.
        addr: Address,
        /// Length of the matched instruction in bytes.
        length: usize,
    },
    /// The bytes at an address match no constructor.
    #[display(fmt = "unable to decode instruction at {addr}")]
    BadData {
        /// Where decoding failed.
        addr: Address,
    },
    /// The loader could not provide the requested bytes.
    #[display(fmt = "{_0}")]
    DataUnavailable(LoadError),
    /// Low-level failure inside the decoding machinery.
    #[display(fmt = "{_0}")]
    LowLevel(String),
    /// The compiled specification stream is corrupt.
    #[display(fmt = "corrupt specification: {_0}")]
    Format(String),
    /// Context database misconfiguration.
    #[display(fmt = "{_0}")]
    Context(ContextError),
}

impl Error {
    /// Whether the error is one of the per-instruction recoverable
    /// kinds rather than a fatal configuration failure.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Unimplemented { .. } | Self::BadData { .. } | Self::DataUnavailable(_)
        )
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::DataUnavailable(err) => Some(err),
            Self::Context(err) => Some(err),
            _ => None,
        }
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        Self::DataUnavailable(err)
    }
}

impl From<ContextError> for Error {
    fn from(err: ContextError) -> Self {
        Self::Context(err)
    }
}

impl From<skald_pcode::SpaceError> for Error {
    fn from(err: skald_pcode::SpaceError) -> Self {
        Self::Format(err.to_string())
    }
}
