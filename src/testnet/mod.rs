//! Regtest chain building for unit tests
//!
//! Helpers here open throwaway databases, assemble and mine blocks against
//! the in-memory regtest snow fields, and build signed spends.

pub mod test_utils;

pub use test_utils::*;
