//! Stackshift CLI entrypoint.
//!
//! This is the main entrypoint for the stackshift command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use stackshift::cli::{Cli, Commands, LockCommands, OutputFormatter, TriggerArgs};
use stackshift::config::{ConfigParser, ConfigValidator, DeployConfig, find_config_file};
use stackshift::diff::GitDiffReader;
use stackshift::error::Result;
use stackshift::orchestrator::{DeployTrigger, Orchestrator};
use stackshift::planner::CancellationFlag;
use stackshift::runtime::{ComposeRuntime, ContainerRuntime};
use stackshift::secrets;
use stackshift::state::{LocalStateStore, StateStore};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Exit code for failures outside a deployment attempt.
const EXIT_ERROR: u8 = 2;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.verbose);

    // Run async runtime
    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(EXIT_ERROR);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(EXIT_ERROR)
        }
    }
}

/// Initializes the logging system.
///
/// Logs go to stderr so that JSON output on stdout stays parseable.
fn init_logging(verbose: bool) {
    let filter = if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if std::env::var("STACKSHIFT_LOG_FORMAT").is_ok_and(|f| f.eq_ignore_ascii_case("json")) {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force).map(|()| 0),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Plan { trigger, detailed } => {
            cmd_plan(cli.config.as_ref(), trigger, detailed, &formatter).await
        }
        Commands::Deploy { trigger } => cmd_deploy(cli.config.as_ref(), trigger, &formatter).await,
        Commands::Status => cmd_status(cli.config.as_ref(), &formatter).await,
        Commands::History { limit } => cmd_history(cli.config.as_ref(), limit, &formatter).await,
        Commands::Lock { command } => cmd_lock(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Initialize a new configuration.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing stackshift in: {}", path.display());

    let config_path = path.join("stackshift.yaml");
    let gitignore_path = path.join(".gitignore");

    // Check if files exist
    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    // Create directory if needed
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let config_template = include_str!("../templates/stackshift.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    // Runtime-config files and their snapshots carry secrets
    let wanted = [".env", "*.env.bak.*", ".stackshift/"];
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = wanted
            .iter()
            .copied()
            .filter(|entry| !existing.lines().any(|line| line.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# stackshift")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!("{}\n", wanted.join("\n")))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nNext steps:");
    eprintln!("  1. Edit stackshift.yaml with your path rules and secret-bearing services");
    eprintln!("  2. Run 'stackshift validate' to check the configuration");
    eprintln!("  3. Run 'stackshift plan --previous <sha>' to preview a deployment");
    eprintln!("  4. Call 'stackshift deploy' from your CI job on every push");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let config = parser_for(&config_file)?.load_with_env(&config_file)?;
    let result = ConfigValidator::new().check(&config);

    println!("{}", formatter.format_validation(&config, &result, show_warnings));
    Ok(u8::from(!result.is_valid()))
}

/// Show what a deployment would do.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    trigger: TriggerArgs,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let config = load_config(config_path)?;
    let diff = GitDiffReader::new(&config.repository.path);
    let secret_store = secrets::from_config(&config.secrets)?;
    let runtime = ComposeRuntime::from_config(&config.runtime, &config.repository.path)?;
    let state_store = LocalStateStore::with_base_dir(&config.state.path);

    let orchestrator =
        Orchestrator::new(&config, &diff, secret_store.as_ref(), &runtime, &state_store)?;
    let preview = orchestrator.plan(&DeployTrigger::from(trigger)).await?;

    println!("{}", formatter.format_preview(&preview, detailed));
    Ok(0)
}

/// Run a deployment.
async fn cmd_deploy(
    config_path: Option<&PathBuf>,
    trigger: TriggerArgs,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let config = load_config(config_path)?;
    let diff = GitDiffReader::new(&config.repository.path);
    let secret_store = secrets::from_config(&config.secrets)?;
    let runtime = ComposeRuntime::from_config(&config.runtime, &config.repository.path)?;
    let state_store = LocalStateStore::with_base_dir(&config.state.path);

    let cancel = CancellationFlag::new();
    spawn_interrupt_handler(cancel.clone());

    let orchestrator =
        Orchestrator::new(&config, &diff, secret_store.as_ref(), &runtime, &state_store)?
            .with_cancellation(cancel);
    let report = orchestrator.run(&DeployTrigger::from(trigger)).await;

    println!("{}", formatter.format_report(&report));
    Ok(u8::try_from(report.exit_code()).unwrap_or(EXIT_ERROR))
}

/// Show runtime status.
async fn cmd_status(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let config = load_config(config_path)?;
    let runtime = ComposeRuntime::from_config(&config.runtime, &config.repository.path)?;

    let statuses = runtime.list_status().await?;
    println!("{}", formatter.format_status(&config, &statuses));

    let all_healthy = statuses.iter().all(|s| s.state.is_healthy());
    Ok(u8::from(!all_healthy))
}

/// Show recorded deployments.
async fn cmd_history(
    config_path: Option<&PathBuf>,
    limit: usize,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let config = load_config(config_path)?;
    let state_store = LocalStateStore::with_base_dir(&config.state.path);

    let state = state_store.load().await?;
    println!("{}", formatter.format_history(state.as_ref(), limit));
    Ok(0)
}

/// Lock management commands.
async fn cmd_lock(
    config_path: Option<&PathBuf>,
    command: LockCommands,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let config = load_config(config_path)?;
    let state_store = LocalStateStore::with_base_dir(&config.state.path);

    match command {
        LockCommands::Show => {
            let lock = state_store.get_lock_info().await?;
            println!("{}", formatter.format_lock(lock.as_ref()));
        }
        LockCommands::Unlock { lock_id, force } => {
            let released = if force {
                warn!("Force-releasing the deployment lock");
                state_store.force_release_lock().await?
            } else if let Some(id) = lock_id {
                state_store.release_lock(&id).await?
            } else {
                false
            };

            if released {
                eprintln!("Deployment lock released.");
            } else {
                eprintln!("Deployment lock was not held (or is held under another ID).");
                return Ok(1);
            }
        }
    }

    Ok(0)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Cancels the deployment on Ctrl-C; the current service finishes first.
fn spawn_interrupt_handler(cancel: CancellationFlag) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, stopping after the current service");
            cancel.cancel();
        }
    });
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Creates a parser rooted at the configuration file and loads its `.env`.
fn parser_for(config_file: &Path) -> Result<ConfigParser> {
    let parser = ConfigParser::new().with_base_path(
        config_file
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new(".")),
    );
    parser.load_dotenv()?;
    Ok(parser)
}

/// Loads and validates the configuration.
fn load_config(config_path: Option<&PathBuf>) -> Result<DeployConfig> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading configuration from: {}", config_file.display());

    let config = parser_for(&config_file)?.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok(config)
}
