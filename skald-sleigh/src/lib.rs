//! Table-driven instruction decoder for compiled SLEIGH
//! specifications.
//!
//! The decoder translates machine bytes into p-code through a loaded
//! `.sla` specification: a context database supplies per-address mode
//! bits, a pattern engine selects constructors, the parser walks the
//! constructor tree, and the builder expands p-code templates into
//! concrete operations.

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![deny(unused_must_use)]

pub mod builder;
pub mod context;
mod error;
pub mod expression;
pub mod parser;
pub mod pattern;
pub mod sla;
pub mod sleigh;
pub mod snippet;
pub mod symbols;
pub mod template;

pub use context::{ContextBitRange, ContextDatabase, ContextError, TrackedContext, TrackedSet};
pub use error::Error;
pub use sleigh::Sleigh;
