//! Capability Class Mapper
//!
//! Answers "which runtime class satisfies logical class X with capabilities
//! C" from two indices (by name, by capability signature) that are rebuilt
//! together on every refresh.

mod mapper;
mod signature;
mod source;

pub use mapper::*;
pub use signature::*;
pub use source::*;
