//! CLI command definitions.
//!
//! This module defines all CLI commands and their arguments using clap.

use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use crate::orchestrator::DeployTrigger;

/// Stackshift - change-driven selective redeployment of Docker Compose services.
#[derive(Parser, Debug)]
#[command(name = "stackshift")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
pub struct Cli {
    /// Path to the configuration file.
    #[arg(short, long, global = true, env = "STACKSHIFT_CONFIG")]
    pub config: Option<PathBuf>,

    /// Enable verbose output.
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Output format (text, json).
    #[arg(long, global = true, default_value = "text")]
    pub output: OutputFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available CLI commands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Initialize a new stackshift configuration.
    Init {
        /// Directory to initialize (defaults to current directory).
        #[arg(default_value = ".")]
        path: PathBuf,

        /// Force overwrite existing files.
        #[arg(short, long)]
        force: bool,
    },

    /// Validate the deployment configuration.
    Validate {
        /// Show all warnings, not just errors.
        #[arg(short, long)]
        warnings: bool,
    },

    /// Show what a deployment would redeploy, without touching anything.
    Plan {
        /// Revision selection.
        #[command(flatten)]
        trigger: TriggerArgs,

        /// Show how every changed path was matched.
        #[arg(short, long)]
        detailed: bool,
    },

    /// Redeploy the services affected by the revision range.
    Deploy {
        /// Revision selection.
        #[command(flatten)]
        trigger: TriggerArgs,
    },

    /// Show the runtime state of every service.
    Status,

    /// Show recorded deployments.
    History {
        /// Number of entries to show.
        #[arg(short, long, default_value = "10")]
        limit: usize,
    },

    /// Inspect or clear the deployment lock.
    Lock {
        /// Lock subcommand.
        #[command(subcommand)]
        command: LockCommands,
    },
}

/// Revision range and override flags shared by `plan` and `deploy`.
#[derive(Args, Debug, Clone, Default)]
pub struct TriggerArgs {
    /// Revision currently deployed (defaults to the one recorded in state).
    #[arg(long)]
    pub previous: Option<String>,

    /// Revision to deploy.
    #[arg(long, default_value = "HEAD")]
    pub current: String,

    /// Redeploy every service regardless of what changed.
    #[arg(long, conflicts_with = "services")]
    pub all: bool,

    /// Redeploy exactly these services regardless of what changed.
    #[arg(long, value_delimiter = ',')]
    pub services: Option<Vec<String>>,
}

/// Lock management subcommands.
#[derive(Subcommand, Debug)]
pub enum LockCommands {
    /// Show the current lock holder.
    Show,

    /// Release the lock.
    Unlock {
        /// Lock ID to release.
        #[arg(long, required_unless_present = "force")]
        lock_id: Option<String>,

        /// Release whoever holds the lock (dangerous).
        #[arg(long, conflicts_with = "lock_id")]
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

impl From<TriggerArgs> for DeployTrigger {
    fn from(args: TriggerArgs) -> Self {
        Self {
            previous: args.previous,
            current: args.current,
            force_all: args.all,
            services: args.services,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_deploy_trigger_flags() {
        let cli = Cli::try_parse_from([
            "stackshift",
            "deploy",
            "--previous",
            "abc123",
            "--services",
            "api,worker",
        ])
        .unwrap();

        let Commands::Deploy { trigger } = cli.command else {
            panic!("expected deploy");
        };
        let trigger = DeployTrigger::from(trigger);
        assert_eq!(trigger.previous.as_deref(), Some("abc123"));
        assert_eq!(trigger.current, "HEAD");
        assert_eq!(
            trigger.services,
            Some(vec![String::from("api"), String::from("worker")])
        );
        assert!(!trigger.force_all);
    }

    #[test]
    fn test_all_conflicts_with_services() {
        let result = Cli::try_parse_from(["stackshift", "deploy", "--all", "--services", "api"]);
        assert!(result.is_err());
    }

    #[test]
    fn test_unlock_requires_id_or_force() {
        assert!(Cli::try_parse_from(["stackshift", "lock", "unlock"]).is_err());
        assert!(Cli::try_parse_from(["stackshift", "lock", "unlock", "--force"]).is_ok());
    }

    #[test]
    fn test_global_output_flag() {
        let cli = Cli::try_parse_from(["stackshift", "status", "--output", "json"]).unwrap();
        assert_eq!(cli.output, OutputFormat::Json);
    }
}
