//! CLI command implementations for herakles-res-monitor.
//!
//! - `check`: kernel source and config validation
//! - `config`: configuration file generation
//! - `test`: live sampling of every collector

pub mod check;
pub mod config;
pub mod test;

pub use check::command_check;
pub use config::command_config;
pub use test::command_test;
