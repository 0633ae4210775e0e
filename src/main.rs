//! stackplan CLI entrypoint.
//!
//! This is the main entrypoint for the stackplan command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;

use stackplan::cli::{Cli, Commands, OutputFormat, OutputFormatter, ProviderKind, StateCommands};
use stackplan::config::{ConfigParser, ConfigValidator, StackConfig, StateBackend, find_config_file};
use stackplan::error::{ConfigError, Result, StackError};
use stackplan::graph::ReferenceResolver;
use stackplan::planner::ChangePlan;
use stackplan::provider::{HttpProvider, Provider, SimulatedProvider};
use stackplan::reconciler::Reconciler;
use stackplan::state::{
    LocalStateStore, S3StateStore, STATE_DIR, StateStore, generate_holder_id,
};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse_args();

    // Initialize logging
    init_logging(cli.verbose, cli.log_format);

    // Run async runtime
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
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        }
    }
}

/// Initializes the logging system.
fn init_logging(verbose: bool, format: OutputFormat) {
    let default = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));

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
    let provider = ProviderOptions {
        kind: cli.provider,
        endpoint: cli.provider_endpoint,
    };
    let config = cli.config;

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config.as_ref(), warnings, &formatter),
        Commands::Plan { detailed, out } => {
            cmd_plan(config.as_ref(), &provider, detailed, out.as_deref(), &formatter).await
        }
        Commands::Apply { yes, plan, parallelism } => {
            cmd_apply(config.as_ref(), &provider, yes, plan.as_deref(), parallelism, &formatter)
                .await
        }
        Commands::Destroy { yes } => cmd_destroy(config.as_ref(), &provider, yes, &formatter).await,
        Commands::Graph => cmd_graph(config.as_ref()),
        Commands::State { command } => cmd_state(config.as_ref(), command, &formatter).await,
    }
}

/// Provider selection from the command line.
struct ProviderOptions {
    kind: ProviderKind,
    endpoint: Option<String>,
}

/// Initialize a new stack definition.
fn cmd_init(path: &Path, force: bool) -> Result<()> {
    info!("Initializing new stack in: {}", path.display());

    let config_path = path.join("stackplan.yaml");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Stack definition already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(());
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/stack.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    let ignored = format!("{STATE_DIR}/");
    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        if !existing.contains(STATE_DIR) {
            let mut file = std::fs::OpenOptions::new().append(true).open(&gitignore_path)?;
            writeln!(file, "\n# stackplan\n{ignored}")?;
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, format!("{ignored}\n.env\n"))?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nStack initialized successfully!");
    eprintln!("Next steps:");
    eprintln!("  1. Edit stackplan.yaml with your resources");
    eprintln!("  2. Run 'stackplan validate' to check the definition");
    eprintln!("  3. Run 'stackplan plan' to see what will change");
    eprintln!("  4. Run 'stackplan apply' to converge the stack");

    Ok(())
}

/// Validate the definition and its graph.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, _) = load_config(config_path)?;

    let result = ConfigValidator::new().check(&config);
    if !result.is_valid() {
        println!("{}", formatter.format_validation(&result, config.resources.len(), show_warnings));
        return Err(StackError::from(ConfigError::validation_general(format!(
            "{} validation errors",
            result.error_count()
        ))));
    }

    let graph = ReferenceResolver::new().resolve_config(&config)?;
    println!("{}", formatter.format_validation(&result, graph.len(), show_warnings));
    Ok(())
}

/// Show the change plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    provider: &ProviderOptions,
    detailed: bool,
    out: Option<&Path>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;
    let backend = create_provider(provider, &store).await?;
    let reconciler = Reconciler::new(&config, store, backend);

    let plan = reconciler.plan().await?;
    println!("{}", formatter.format_plan(&plan, detailed));

    if let Some(path) = out {
        plan.save(path)?;
        eprintln!("{}", formatter.success(&format!("Plan saved to {}", path.display())));
    }

    Ok(())
}

/// Apply a fresh or saved plan.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    provider: &ProviderOptions,
    auto_approve: bool,
    saved: Option<&Path>,
    parallelism: Option<usize>,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;

    let backend = create_provider(provider, &store).await?;
    let cancel = CancellationToken::new();
    let mut reconciler =
        Reconciler::new(&config, store, backend).with_cancellation(cancel.clone());
    if let Some(parallelism) = parallelism {
        reconciler = reconciler.with_parallelism(parallelism);
    }

    let plan = match saved {
        Some(path) => ChangePlan::load(path)?,
        None => reconciler.plan().await?,
    };

    if plan.is_empty() {
        eprintln!("{}", formatter.success("No changes to apply."));
        return Ok(());
    }

    println!("{}", formatter.format_plan(&plan, false));

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(());
    }

    let _interrupt = cancel_on_ctrl_c(cancel);
    let result = reconciler.apply(Some(&plan)).await?;
    println!("{}", formatter.format_reconciliation(&result));
    result.ensure_success()
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    provider: &ProviderOptions,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;

    let backend = create_provider(provider, &store).await?;
    let cancel = CancellationToken::new();
    let reconciler = Reconciler::new(&config, store, backend).with_cancellation(cancel.clone());

    let plan = reconciler.plan_destroy().await?;
    if plan.is_empty() {
        eprintln!("{}", formatter.success("No resources to destroy."));
        return Ok(());
    }

    println!("{}", formatter.format_plan(&plan, false));

    if !auto_approve
        && !confirm("\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ", "destroy")?
    {
        eprintln!("Destruction cancelled.");
        return Ok(());
    }

    let _interrupt = cancel_on_ctrl_c(cancel);
    let result = reconciler.apply(Some(&plan)).await?;
    println!("{}", formatter.format_reconciliation(&result));
    result.ensure_success()
}

/// Print the dependency graph.
fn cmd_graph(config_path: Option<&PathBuf>) -> Result<()> {
    let (config, _) = load_config(config_path)?;
    ConfigValidator::new().validate(&config)?;
    let graph = ReferenceResolver::new().resolve_config(&config)?;
    println!("{}", graph.to_dot());
    Ok(())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<()> {
    let (config, config_file) = load_config(config_path)?;
    let store = create_state_store(&config, &config_file).await?;

    match command {
        StateCommands::Show => match store.load().await? {
            Some(state) => println!("{}", formatter.format_state(&state)),
            None => eprintln!("{}", formatter.warning("No state found.")),
        },
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            println!("{}", formatter.format_lock(&lock));
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                warn!("Force unlocking state");
                store.force_unlock().await?;
                eprintln!("{}", formatter.success("State forcefully unlocked."));
            } else if let Some(id) = lock_id {
                store.release_lock(&id).await?;
                eprintln!("{}", formatter.success("State unlocked."));
            } else {
                return Err(StackError::from(ConfigError::validation_general(
                    "Please provide --lock-id or use --force",
                )));
            }
        }
    }

    Ok(())
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Prompts on stderr and compares the answer with `expected`.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Cancels `token` on the first Ctrl-C. The task is aborted on drop.
fn cancel_on_ctrl_c(token: CancellationToken) -> AbortOnDrop {
    AbortOnDrop(tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("\nInterrupt received, waiting for in-flight operations...");
            token.cancel();
        }
    }))
}

struct AbortOnDrop(tokio::task::JoinHandle<()>);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

/// Loads the stack definition, returning it with its path.
fn load_config(config_path: Option<&PathBuf>) -> Result<(StackConfig, PathBuf)> {
    let config_file = config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))?;
    debug!("Loading stack definition from: {}", config_file.display());

    let parser = ConfigParser::new().with_base_path(config_dir(&config_file));
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;

    Ok((config, config_file))
}

fn config_dir(config_file: &Path) -> PathBuf {
    config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf)
}

/// Creates the state store the definition selects.
async fn create_state_store(config: &StackConfig, config_file: &Path) -> Result<Arc<dyn StateStore>> {
    let store: Arc<dyn StateStore> = match config.state.backend {
        StateBackend::Local => {
            let path = config
                .state
                .path
                .as_ref()
                .map_or_else(|| config_dir(config_file).join(STATE_DIR), PathBuf::from);
            Arc::new(LocalStateStore::with_base_dir(path))
        }
        StateBackend::S3 => {
            let bucket = config
                .state
                .bucket
                .as_deref()
                .ok_or_else(|| StackError::internal("S3 bucket not configured"))?;
            Arc::new(
                S3StateStore::new(bucket, config.state.prefix.as_deref(), config.state.region.as_deref())
                    .await?,
            )
        }
    };
    debug!("Using {} state backend", store.backend_type());
    Ok(store)
}

/// Creates the provider selected on the command line. The simulated provider
/// starts out holding the resources already recorded in the state.
async fn create_provider(
    options: &ProviderOptions,
    store: &Arc<dyn StateStore>,
) -> Result<Arc<dyn Provider>> {
    match options.kind {
        ProviderKind::Simulated => {
            let provider = match store.load().await? {
                Some(snapshot) => SimulatedProvider::from_snapshot(&snapshot),
                None => SimulatedProvider::new(),
            };
            Ok(Arc::new(provider))
        }
        ProviderKind::Http => {
            let endpoint = options.endpoint.as_deref().ok_or_else(|| {
                StackError::from(ConfigError::validation_general(
                    "--provider-endpoint is required for the http provider",
                ))
            })?;
            let token = ConfigParser::get_provider_token().ok();
            Ok(Arc::new(HttpProvider::new(endpoint, token)?))
        }
    }
}
