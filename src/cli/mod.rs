//! CLI module for the stackshift deployment tool.
//!
//! This module provides the command-line interface for planning and running
//! change-driven deployments.

mod commands;
mod output;

pub use commands::{Cli, Commands, LockCommands, OutputFormat, TriggerArgs};
pub use output::OutputFormatter;
