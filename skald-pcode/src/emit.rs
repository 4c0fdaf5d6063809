//! Consumer callbacks and the byte-loader seam.

use crate::{Address, OpCode, VarnodeData};

/// Consumer of decoded p-code, one op at a time.
pub trait PcodeEmit {
    /// Receive one op decoded at `addr`.
    fn dump(
        &mut self,
        addr: &Address,
        opcode: OpCode,
        output: Option<&VarnodeData>,
        inputs: &[VarnodeData],
    );
}

/// Consumer of disassembled instruction text.
pub trait AssemblyEmit {
    /// Receive the mnemonic and operand body printed at `addr`.
    fn dump(&mut self, addr: &Address, mnemonic: &str, body: &str);
}

/// Provider of raw program bytes.
pub trait LoadImage {
    /// Fill `buf` with the bytes starting at `addr`.
    ///
    /// Implementations must fail with [`LoadError::Unavailable`] when
    /// any requested byte is absent, rather than zero-filling.
    fn load_fill(&self, buf: &mut [u8], addr: &Address) -> Result<(), LoadError>;
}

/// Failure to read program bytes.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LoadError {
    /// The requested bytes are not mapped in the image.
    #[error("no bytes available at {addr} for {size} byte read")]
    Unavailable {
        /// Start of the failed read.
        addr: Address,
        /// Length of the failed read.
        size: usize,
    },
}

impl<L: LoadImage + ?Sized> LoadImage for &L {
    fn load_fill(&self, buf: &mut [u8], addr: &Address) -> Result<(), LoadError> {
        (**self).load_fill(buf, addr)
    }
}
