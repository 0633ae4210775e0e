//! CLI module for stackplan.
//!
//! This module provides the command-line interface for validating,
//! planning, applying and destroying stacks.

mod commands;
mod output;

pub use commands::{Cli, Commands, OutputFormat, ProviderKind, StateCommands};
pub use output::OutputFormatter;
