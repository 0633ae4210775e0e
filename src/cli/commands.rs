//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// stackplan - Dependency-graph resolver and declarative state reconciler.
#[derive(Parser, Debug)]
#[command(name = "stackplan")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the stack definition.
    #[arg(short, long, global = true, env = "STACKPLAN_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text", env = "STACKPLAN_LOG_FORMAT")]
    pub log_format: OutputFormat,

    /// Provider that materializes resources.
    #[arg(long, global = true, default_value = "simulated", env = "STACKPLAN_PROVIDER")]
    pub provider: ProviderKind,

    /// Base URL of the HTTP provider.
    #[arg(long, global = true, env = "STACKPLAN_PROVIDER_ENDPOINT")]
    pub provider_endpoint: Option<String>,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Write a starter stack definition.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack definition and its graph.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Compute and display the change plan.
    Plan {
        /// Show field-level changes.
        #[arg(short, long)]
        detailed: bool,

        /// Save the plan for a later `apply --plan`.
        #[arg(long)]
        out: Option<PathBuf>,
    },

    /// Apply the change plan.
    Apply {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Apply a plan saved with `plan --out`.
        #[arg(long)]
        plan: Option<PathBuf>,

        /// Maximum concurrent operations.
        #[arg(long)]
        parallelism: Option<usize>,
    },

    /// Delete every resource in the state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,
    },

    /// Print the dependency graph in DOT format.
    Graph,

    /// Manage the state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show current state.
    Show,

    /// Lock the state.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Unlock the state.
    Unlock {
        /// Lock ID to unlock.
        #[arg(long)]
        lock_id: Option<String>,

        /// Force unlock (dangerous).
        #[arg(long)]
        force: bool,
    },
}

/// Output format options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable text output.
    #[default]
    Text,
    /// JSON output for scripting.
    Json,
}

/// Provider options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum ProviderKind {
    /// In-memory provider with deterministic outputs.
    #[default]
    Simulated,
    /// JSON over HTTP.
    Http,
}

impl Cli {
    /// Parses CLI arguments from the command line.
    #[must_use]
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_apply_with_saved_plan() {
        let cli = Cli::try_parse_from([
            "stackplan",
            "--provider",
            "http",
            "--provider-endpoint",
            "http://localhost:8080",
            "apply",
            "--yes",
            "--plan",
            "plan.json",
            "--parallelism",
            "4",
        ])
        .unwrap();

        assert_eq!(cli.provider, ProviderKind::Http);
        assert_eq!(cli.provider_endpoint.as_deref(), Some("http://localhost:8080"));
        match cli.command {
            Commands::Apply { yes, plan, parallelism } => {
                assert!(yes);
                assert_eq!(plan, Some(PathBuf::from("plan.json")));
                assert_eq!(parallelism, Some(4));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_state_unlock() {
        let cli = Cli::try_parse_from(["stackplan", "--output", "json", "state", "unlock", "--force"])
            .unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock { force: true, lock_id: None }
            }
        ));
    }
}
