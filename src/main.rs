//! Converge CLI entrypoint.
//!
//! This is the main entrypoint for the converge command-line tool.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use infra_converge::cli::{Cli, Commands, OutputFormatter, StateCommands};
use infra_converge::config::{ConfigParser, ConfigValidator, InfraConfig, find_config_file};
use infra_converge::error::{EXIT_OTHER, EXIT_SUCCESS, EXIT_VALIDATION, Result};
use infra_converge::model::ResourceModel;
use infra_converge::planner::CancellationHandle;
use infra_converge::reconciler::Reconciler;
use infra_converge::state::{generate_holder_id, open_store};

use clap::Parser;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Main entrypoint.
fn main() -> ExitCode {
    let cli = Cli::parse();

    init_logging(cli.verbose, cli.log_json);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::from(EXIT_OTHER);
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::from(e.exit_code())
        }
    }
}

/// Initializes the logging system.
///
/// `RUST_LOG` wins over the verbosity flag when set.
fn init_logging(verbose: bool, json: bool) {
    let level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Main async entry point, returning the process exit code.
async fn run(cli: Cli) -> Result<u8> {
    let formatter = OutputFormatter::new(cli.output);
    let config_path = cli.config.as_ref();

    match cli.command {
        Commands::Init { path, force } => cmd_init(&path, force),
        Commands::Validate { warnings } => cmd_validate(config_path, warnings, &formatter),
        Commands::Plan { detailed, refresh } => {
            cmd_plan(config_path, detailed, refresh, &formatter).await
        }
        Commands::Apply {
            yes,
            parallel,
            refresh,
        } => cmd_apply(config_path, yes, parallel, refresh, &formatter).await,
        Commands::Drift => cmd_drift(config_path, &formatter).await,
        Commands::Destroy { yes } => cmd_destroy(config_path, yes, &formatter).await,
        Commands::State { command } => cmd_state(config_path, command, &formatter).await,
    }
}

/// Writes rendered output to stdout.
fn emit(text: &str) -> Result<()> {
    let mut out = std::io::stdout().lock();
    out.write_all(text.as_bytes())?;
    if !text.ends_with('\n') {
        out.write_all(b"\n")?;
    }
    out.flush()?;
    Ok(())
}

/// Asks for confirmation on stderr.
fn confirm(prompt: &str, expected: &str) -> Result<bool> {
    eprint!("{prompt}");
    std::io::stderr().flush()?;

    let mut input = String::new();
    std::io::stdin().read_line(&mut input)?;
    Ok(input.trim().eq_ignore_ascii_case(expected))
}

/// Initialize a new project.
fn cmd_init(path: &Path, force: bool) -> Result<u8> {
    info!("Initializing new converge project in: {}", path.display());

    let config_path = path.join("converge.yaml");
    let env_path = path.join(".env.example");
    let gitignore_path = path.join(".gitignore");

    if !force && config_path.exists() {
        eprintln!("Declaration file already exists: {}", config_path.display());
        eprintln!("Use --force to overwrite.");
        return Ok(EXIT_SUCCESS);
    }

    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }

    std::fs::write(&config_path, include_str!("../templates/converge.yaml"))?;
    eprintln!("Created: {}", config_path.display());

    std::fs::write(&env_path, include_str!("../templates/.env.example"))?;
    eprintln!("Created: {}", env_path.display());

    if gitignore_path.exists() {
        let existing = std::fs::read_to_string(&gitignore_path)?;
        let missing: Vec<&str> = [".env", ".converge/"]
            .into_iter()
            .filter(|entry| !existing.lines().any(|l| l.trim() == *entry))
            .collect();
        if !missing.is_empty() {
            let mut file = std::fs::OpenOptions::new()
                .append(true)
                .open(&gitignore_path)?;
            writeln!(file, "\n# converge")?;
            for entry in missing {
                writeln!(file, "{entry}")?;
            }
            eprintln!("Updated: {}", gitignore_path.display());
        }
    } else {
        std::fs::write(&gitignore_path, ".env\n.converge/\n")?;
        eprintln!("Created: {}", gitignore_path.display());
    }

    eprintln!("\nProject initialized.");
    eprintln!("Next steps:");
    eprintln!("  1. Copy .env.example to .env and fill in your credentials");
    eprintln!("  2. Edit converge.yaml with your resources");
    eprintln!("  3. Run 'converge validate' to check the declaration");
    eprintln!("  4. Run 'converge plan' to see what will change");
    eprintln!("  5. Run 'converge apply' to provision");

    Ok(EXIT_SUCCESS)
}

/// Validate the declaration.
fn cmd_validate(
    config_path: Option<&PathBuf>,
    show_warnings: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (config, _) = load_config(config_path)?;

    let mut result = ConfigValidator::new().check(&config);
    if result.is_valid()
        && let Err(e) = ResourceModel::load(&config)
    {
        result.push_error("resources", e.to_string());
    }

    emit(&formatter.format_validation(&config, &result, show_warnings))?;
    Ok(if result.is_valid() {
        EXIT_SUCCESS
    } else {
        EXIT_VALIDATION
    })
}

/// Show the change plan.
async fn cmd_plan(
    config_path: Option<&PathBuf>,
    detailed: bool,
    refresh: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let reconciler = connect(config_path).await?;

    let plan = if refresh {
        let report = reconciler.refresh().await?;
        if !formatter.is_json() {
            emit(&formatter.format_refresh(&report))?;
        }
        reconciler.plan_against(&report.observed)?
    } else {
        reconciler.plan().await?
    };

    emit(&formatter.format_plan(&plan, detailed))?;
    Ok(EXIT_SUCCESS)
}

/// Plan and apply.
async fn cmd_apply(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    parallel: Option<usize>,
    refresh: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let cancel = CancellationHandle::new();
    let mut reconciler = connect(config_path)
        .await?
        .with_cancellation(cancel.clone());
    if let Some(parallel) = parallel {
        reconciler = reconciler.with_max_parallel(parallel);
    }

    let plan = if refresh {
        let report = reconciler.refresh().await?;
        reconciler.plan_against(&report.observed)?
    } else {
        reconciler.plan().await?
    };

    if plan.is_converged() {
        emit(&formatter.format_plan(&plan, false))?;
        return Ok(EXIT_SUCCESS);
    }

    if !formatter.is_json() {
        emit(&formatter.format_plan(&plan, false))?;
    }

    if !auto_approve && !confirm("Do you want to apply this plan? [y/N]: ", "y")? {
        eprintln!("Apply cancelled.");
        return Ok(EXIT_SUCCESS);
    }

    watch_ctrl_c(cancel);
    let report = reconciler.apply(&plan).await?;
    emit(&formatter.format_report(&report))?;
    Ok(report.exit_code())
}

/// Check for drift.
async fn cmd_drift(config_path: Option<&PathBuf>, formatter: &OutputFormatter) -> Result<u8> {
    let reconciler = connect(config_path).await?;
    let report = reconciler.check_drift().await?;
    emit(&formatter.format_drift(&report))?;
    Ok(EXIT_SUCCESS)
}

/// Destroy every recorded resource.
async fn cmd_destroy(
    config_path: Option<&PathBuf>,
    auto_approve: bool,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let cancel = CancellationHandle::new();
    let reconciler = connect(config_path)
        .await?
        .with_cancellation(cancel.clone());

    let plan = reconciler.plan_destroy().await?;
    if plan.delete_count() == 0 {
        eprintln!("No resources to destroy.");
        return Ok(EXIT_SUCCESS);
    }

    if !formatter.is_json() {
        emit(&formatter.format_plan(&plan, false))?;
    }

    if !auto_approve
        && !confirm(
            "\nThis action is IRREVERSIBLE. Type 'destroy' to confirm: ",
            "destroy",
        )?
    {
        eprintln!("Destruction cancelled.");
        return Ok(EXIT_SUCCESS);
    }

    watch_ctrl_c(cancel);
    let report = reconciler.destroy(&plan).await?;
    emit(&formatter.format_report(&report))?;
    Ok(report.exit_code())
}

/// State management commands.
async fn cmd_state(
    config_path: Option<&PathBuf>,
    command: StateCommands,
    formatter: &OutputFormatter,
) -> Result<u8> {
    let (config, base_dir) = load_config(config_path)?;
    let store = open_store(&config.state, &base_dir).await?;

    match command {
        StateCommands::Show => {
            let resources = store.all().await?;
            let history = store.history().await?;
            let lock = store.get_lock_info().await?;
            emit(&formatter.format_state(
                store.backend_type(),
                &resources,
                &history,
                lock.as_ref(),
            ))?;
        }
        StateCommands::List => {
            emit(&formatter.format_resources(&store.all().await?))?;
        }
        StateCommands::Lock { holder } => {
            let holder = holder.unwrap_or_else(generate_holder_id);
            let lock = store.acquire_lock(&holder).await?;
            eprintln!("State locked: {}", lock.lock_id);
        }
        StateCommands::Unlock { lock_id, force } => {
            if force {
                if let Some(lock_info) = store.get_lock_info().await? {
                    warn!("Force-releasing lock held by {}", lock_info.holder);
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
                return Ok(EXIT_VALIDATION);
            }
        }
    }

    Ok(EXIT_SUCCESS)
}

// ============================================================================
// Helper Functions
// ============================================================================

/// Resolves the declaration file path.
fn resolve_config_path(config_path: Option<&PathBuf>) -> Result<PathBuf> {
    config_path.map_or_else(|| find_config_file("."), |path| Ok(path.clone()))
}

/// Loads the declaration with `.env` and environment overrides applied.
///
/// Returns the declaration and the directory it lives in.
fn load_config(config_path: Option<&PathBuf>) -> Result<(InfraConfig, PathBuf)> {
    let config_file = resolve_config_path(config_path)?;
    debug!("Loading declaration from: {}", config_file.display());

    let base_dir = config_file
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);

    let parser = ConfigParser::new().with_base_path(base_dir.clone());
    parser.load_dotenv()?;
    let config = parser.load_with_env(&config_file)?;
    Ok((config, base_dir))
}

/// Loads the declaration and opens its store and provider.
async fn connect(config_path: Option<&PathBuf>) -> Result<Reconciler> {
    let (config, base_dir) = load_config(config_path)?;
    Reconciler::connect(config, &base_dir).await
}

/// Cancels the apply cycle on Ctrl-C.
fn watch_ctrl_c(cancel: CancellationHandle) {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, finishing in-flight actions");
            cancel.cancel();
        }
    });
}
