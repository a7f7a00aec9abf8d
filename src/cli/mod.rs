//! CLI module for stackwright.
//!
//! This module provides the command-line interface: argument parsing and
//! rendering of plans, run reports and state.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, StateCommands};
pub use output::OutputFormatter;
