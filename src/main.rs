//! Stackwright CLI entrypoint.
//!
//! This is the main entrypoint for the stackwright command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use stackwright::cli::{Cli, Commands, OutputFormat, OutputFormatter, StateCommands};
use stackwright::config::{
    ConfigParser, ConfigValidator, ProviderKind, StackConfig, StateBackend, find_config_file,
};
use stackwright::error::{ConfigError, Result, StackError};
use stackwright::graph::GraphBuilder;
use stackwright::orchestrator::{Orchestrator, RunOptions};
use stackwright::provider::{HttpProvider, Provider, SimulatedProvider};
use stackwright::state::{
    LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id,
};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            let kind = e.kind();
            eprintln!("Error ({kind}): {e}");
            ExitCode::from(kind.exit_code())
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: OutputFormat) {
    let default_level = if verbose { "debug" } else { "info" };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    match format {
        OutputFormat::Json => builder.json().init(),
        OutputFormat::Text => builder.init(),
    }
}

/// Main async entry point.
async fn run(cli: Cli) -> Result<()> {
    let formatter = OutputFormatter::new(cli.output);

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(cli.config.as_ref(), warnings, &formatter),
        Commands::Diff { detailed } => cmd_diff(cli.config.as_ref(), detailed, &formatter).await,
        Commands::Apply {
            yes,
            accept_downtime,
            parallel,
            timeout,
        } => {
            let flags = ApplyFlags {
                yes,
                accept_downtime,
                parallel,
                timeout,
            };
            cmd_apply(cli.config.as_ref(), flags, &formatter).await
        }
        Commands::Destroy { yes, parallel } => {
            cmd_destroy(cli.config.as_ref(), yes, parallel, &formatter).await
        }
        Commands::State { command } => cmd_state(cli.config.as_ref(), command, &formatter).await,
    }
}

/// Flags of the apply command.
struct ApplyFlags {
    yes: bool,
    accept_downtime: bool,
    parallel: Option<usize>,
    timeout: Option<u64>,
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stackwright project in: {}", path.display());

    let config_path = path.join("stackwright.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Configuration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    let config_template = include_str!("../templates/stackwright.yaml");
    std::fs::write(&config_path, config_template)?;
    eprintln!("Created: {}", config_path.display());

    let env_template = include_str!("../templates/.env.example");
    std::fs::write(&env_path, env_template)?;
    eprintln!("Created: {}", env_path.display());

    let state_entry = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(".env") || !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# stackwright")?;
            if !existing.contains(".env") {
                writeln!(file, ".env")?;
            }
            if !existing.contains(STATE_DIR) {
                writeln!(file, "{state_entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!(".env\n{state_entry}\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit stackwright.yaml with your resources");
    eprintln!("  2. Run 'stackwright validate' to check the description");
    eprintln!("  3. Run 'stackwright diff' to see what would change");
    eprintln!("  4. Run 'stackwright apply' to provision the stack");

    Ok(())
}

/// Validate configuration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    info!("Validating configuration: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    let graph = GraphBuilder::new().build_config(&config)?;
    debug!("Graph has {} nodes and {} edges", graph.len(), graph.edges().len());

    println!("{}", formatter.format_validation(&config, &result, show_warnings));
    Ok(())
}

/// Preview the plan.
async fn cmd_diff(
    config_path: Option<&PathBuf>,
    detailed: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = RunContext::load(config_path).await?;
    let orchestrator = Orchestrator::new(&ctx.config, ctx.store.as_ref(), ctx.provider.as_ref());

    let preview = orchestrator.preview().await?;
    println!("{}", formatter.format_preview(&preview, detailed));

    Ok(())
}

/// Apply the description.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    flags: ApplyFlags,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = RunContext::load(config_path).await?;
    let mut options = RunOptions::from_config(&ctx.config.execution);
    if let Some(parallel) = flags.parallel {
        options.parallelism = parallel.max(1);
    }
    if let Some(secs) = flags.timeout {
        options.run_timeout = Some(Duration::from_secs(secs));
    }
    options.accept_downtime = flags.yes || flags.accept_downtime;

    let orchestrator = Orchestrator::new(&ctx.config, ctx.store.as_ref(), ctx.provider.as_ref());

    let preview = orchestrator.preview().await?;
    if preview.plan.is_empty() {
        println!("{}", formatter.format_plan(&preview.plan));
        return Ok(());
    }

    if !formatter.is_json() {
        println!("{}", formatter.format_plan(&preview.plan));
    }

    if !flags.yes {
        if preview.plan.has_downtime() && !options.accept_downtime {
            if !confirm("The plan deletes resources before recreating them. Accept downtime? [y/N]: ")? {
                eprintln!("Apply cancelled.");
                return Ok(());
            }
            options.acknowledged_downtime = preview
                .plan
                .warnings
                .iter()
                .map(|w| w.resource.clone())
                .collect();
        } else if !confirm("Do you want to apply this plan? [y/N]: ")? {
            eprintln!("Apply cancelled.");
            return Ok(());
        }
    }

    let outcome = orchestrator.with_options(options).apply().await?;
    println!("{}", formatter.format_outcome(&outcome));
    outcome.into_result()?;

    Ok(())
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    parallel: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let ctx = RunContext::load(config_path).await?;

    let Some(snapshot) = ctx.store.load().await?.filter(|s| !s.is_empty()) else {
        eprintln!("No resources to destroy.");
        return Ok(());
    };

    if !auto_approve {
        eprintln!("The following resources will be destroyed:");
        for record in snapshot.resources.values() {
            eprintln!("  - {} ({})", record.name, record.physical_id);
        }
        eprint!("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ");
        std::io::stderr().flush()?;

        let mut input = String::new();
        std::io::stdin().read_line(&mut input)?;

        if input.trim() != "destroy" {
            eprintln!("Destruction cancelled.");
            return Ok(());
        }
    }

    let mut options = RunOptions::from_config(&ctx.config.execution);
    if let Some(parallel) = parallel {
        options.parallelism = parallel.max(1);
    }

    let orchestrator = Orchestrator::new(&ctx.config, ctx.store.as_ref(), ctx.provider.as_ref())
        .with_options(options);
    let outcome = orchestrator.destroy().await?;
    println!("{}", formatter.format_outcome(&outcome));
    outcome.into_result()?;

    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let config_file = resolve_config_path(config_path)?;
    let config = load_config(&config_file)?;
    let store = build_store(&config, base_dir(&config_file)).await?;

    match command {
        StateCommands::Show => {
            if let Some(state) = store.load().await? {
                println!("{}", formatter.format_state(&state));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::List => {
            if let Some(state) = store.load().await? {
                println!("{}", formatter.format_resources(&state));
            } else {
                eprintln!("No state found.");
            }
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    warn!("Force-releasing lease held by {}", lock_info.holder);
                    store.release_lock(&lock_info.lock_id).await?;
                    eprintln!("State forcefully unlocked.");
                } else {
                    eprintln!("State is not locked.");
                }
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("State unlocked.");
            } else {
                eprintln!("Please provide --lock-id or use --force");
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Everything a run needs, built from the configuration file.
struct RunContext {
    config: StackConfig,
    store: Box<dyn StateStore>,
    provider: Box<dyn Provider>,
}

impl RunContext {
    async fn load(config_path: Option<&PathBuf>) -> Result<Self> {
        let config_file = resolve_config_path(config_path)?;
        let config = load_config(&config_file)?;
        let base = base_dir(&config_file);
        let store = build_store(&config, base).await?;
        let provider = build_provider(&config, base).await?;
        Ok(Self {
            config,
            store,
            provider,
        })
    }
}

/// Resolves the configuration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

fn base_dir(config_file: &Path) -> &Path {
    config_file.parent().unwrap_or_else(|| Path::new("."))
}

/// Loads and validates the configuration.
fn load_config(config_file: &Path) -> Result<StackConfig> {
    debug!("Loading configuration from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(base_dir(config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(config_file)?;

    let result = ConfigValidator::new().validate(&config)?;
    for warning in &result.warnings {
        warn!("{warning}");
    }

    Ok(config)
}

/// Creates the state store the configuration selects.
async fn build_store(config: &StackConfig, base: &Path) -> Result<Box<dyn StateStore>> {
    let store: Box<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| base.join(STATE_DIR), |p| base.join(p));
            Box::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config.state.bucket.as_deref().ok_or_else(|| {
                StackError::Config(ConfigError::validation(
                    "S3 bucket not configured",
                    "state.bucket",
                ))
            })?;
            let prefix = config.state.prefix.as_deref();
            let region = config.state.region.as_deref();
            Box::new(S3StateStore::new(bucket, prefix, region).await?)
        }
    };
    Ok(store)
}

/// Creates the provider the configuration selects.
async fn build_provider(config: &StackConfig, base: &Path) -> Result<Box<dyn Provider>> {
    let provider: Box<dyn Provider> = match config.provider.kind {
        ProviderKind::Simulated => {
            let path = config.provider.path.as_ref().map_or_else(
                || base.join(STATE_DIR).join("sim.json"),
                |p| base.join(p),
            );
            Box::new(SimulatedProvider::persistent(path).await?)
        }
        ProviderKind::Http => Box::new(HttpProvider::new(&config.provider)?),
    };
    Ok(provider)
}

/// Asks a yes/no question on stderr.
fn confirm(prompt: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;

    Ok(input.trim().eq_ignore_ascii_case("y"))
}
