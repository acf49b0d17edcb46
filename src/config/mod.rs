//! Node configuration
//!
//! Settings come from an optional TOML file with `FROSTLINE_*` environment
//! variables layered on top.

pub mod settings;

pub use settings::NodeConfig;
