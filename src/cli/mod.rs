//! Command-line interface
//!
//! Argument parsing for the `frostline` binary.

pub mod commands;

pub use commands::{Command, Opt};
