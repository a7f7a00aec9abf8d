//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Parser, Subcommand};
use std::path::PathBuf;

/// Stackwright - declarative provisioning orchestrator.
#[derive(Parser, Debug)]
#[command(name = "stackwright")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STACKWRIGHT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Log format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub log_format: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stackwright project.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the stack description.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Preview the plan an apply would run.
    Diff {
        /// Show changed property keys per step.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Apply the stack description.
    Apply {
        /// Skip confirmation prompt (also acknowledges downtime).
        #[arg(short, long)]
        yes: bool,

        /// Acknowledge replacements that cause downtime.
        #[arg(long)]
        accept_downtime: bool,

        /// Maximum number of steps in flight.
        #[arg(long)]
        parallel: Option<usize>,

        /// Bound on provider waits, in seconds.
        #[arg(long)]
        timeout: Option<u64>,
    },

    /// Delete every resource recorded in state.
    Destroy {
        /// Skip confirmation prompt.
        #[arg(short, long)]
        yes: bool,

        /// Maximum number of steps in flight.
        #[arg(long)]
        parallel: Option<usize>,
    },

    /// Manage state backend.
    State {
        /// State subcommand.
        #[command(subcommand)]
        command: StateCommands,
    },
}

/// State management subcommands.
#[derive(Subcommand, Debug)]
pub enum StateCommands {
    /// Show a summary of the current state.
    Show,

    /// List recorded resources.
    List,

    /// Take the state lease.
    Lock {
        /// Lock holder identifier.
        #[arg(long)]
        holder: Option<String>,
    },

    /// Release the state lease.
    Unlock {
        /// Lock ID to release.
        #[arg(long)]
        lock_id: Option<String>,

        /// Release whatever lease is held (dangerous).
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

    #[test]
    fn test_apply_flags() {
        let cli = Cli::try_parse_from([
            "stackwright",
            "apply",
            "--yes",
            "--parallel",
            "4",
            "--timeout",
            "60",
        ])
        .unwrap();

        match cli.command {
            Commands::Apply {
                yes,
                accept_downtime,
                parallel,
                timeout,
            } => {
                assert!(yes);
                assert!(!accept_downtime);
                assert_eq!(parallel, Some(4));
                assert_eq!(timeout, Some(60));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "stackwright",
            "diff",
            "--output",
            "json",
            "--log-format",
            "json",
            "-c",
            "stack.yaml",
        ])
        .unwrap();

        assert_eq!(cli.output, OutputFormat::Json);
        assert_eq!(cli.log_format, OutputFormat::Json);
        assert_eq!(cli.config, Some(PathBuf::from("stack.yaml")));
        assert!(matches!(cli.command, Commands::Diff { detailed: false }));
    }

    #[test]
    fn test_state_unlock() {
        let cli =
            Cli::try_parse_from(["stackwright", "state", "unlock", "--force"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::State {
                command: StateCommands::Unlock {
                    lock_id: None,
                    force: true
                }
            }
        ));
    }
}
