//! donenv command-line interface
//!
//! `donenv env start` provisions an environment from a preset or a TOML
//! config and delegates every external system to a backend program;
//! `donenv env stop` removes whatever is left.

pub mod cli;
pub mod commands;
pub mod config;
pub mod exec;
pub mod logging;

pub use cli::{parse_from, Action, Cli, StartArgs};
pub use commands::{start, stop, StartOutcome};
pub use config::{EnvConfig, TopologyPreset};
pub use exec::ExecBackend;
