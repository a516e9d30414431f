//! VT Bootstrap - Main entry point

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::fmt::Write as _;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use vt_bootstrap::config::normalize_base_url;
use vt_bootstrap::{
    ApiPuller, BootstrapConfig, BootstrapError, BootstrapReport, Bootstrapper, CliPuller,
    FailurePolicy, ModelPuller, ModelRef, OllamaClient, OllamaService, PullMethod, PullOutcome,
    ScriptInstaller, ServiceApi, ServiceOutcome, SpawnConfig, StateManager, find_executable,
    metrics, service,
};

#[derive(Parser, Debug)]
#[command(name = "vt-bootstrap")]
#[command(about = "Install, start and provision the local Ollama daemon", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Override daemon base URL (accepts OLLAMA_HOST-style host:port)
    #[arg(long, global = true)]
    base_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    /// Log format (json or pretty)
    #[arg(long, default_value = "pretty", global = true)]
    log_format: String,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Install if needed, start the daemon, and pull the configured models (default)
    Run(RunArgs),
    /// Report installation, daemon and model status
    Status,
    /// Pull models into an already running daemon
    Pull {
        /// Model identifiers, e.g. llama3.1:8b
        #[arg(required = true)]
        models: Vec<String>,
    },
    /// Stop a daemon previously started by this tool
    Stop {
        /// Seconds to wait after SIGTERM before SIGKILL
        #[arg(long, default_value_t = 10)]
        timeout_secs: u64,
    },
}

#[derive(Args, Debug, Default)]
struct RunArgs {
    /// Model tier from the configuration
    #[arg(long)]
    tier: Option<String>,

    /// Explicit model to pull (repeatable); replaces the tier's list
    #[arg(long = "model")]
    models: Vec<String>,

    /// Fail instead of running the installer when the binary is missing
    #[arg(long)]
    no_install: bool,

    /// How to pull models
    #[arg(long, value_enum)]
    pull_method: Option<PullMethod>,

    /// Skip models the daemon already has
    #[arg(long)]
    skip_present: bool,

    /// Stop after the first failed pull
    #[arg(long)]
    abort_on_failure: bool,

    /// Per-model pull timeout in seconds
    #[arg(long)]
    pull_timeout_secs: Option<u64>,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Setup logging; stdout is reserved for the summary
    match cli.log_format.as_str() {
        "json" => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .json()
                .init();
        }
        _ => {
            tracing_subscriber::fmt()
                .with_env_filter(&cli.log_level)
                .with_writer(std::io::stderr)
                .init();
        }
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            let chain = format!("{:#}", e);
            tracing::error!(error = %chain, "vt-bootstrap failed");
            let code = e
                .downcast_ref::<BootstrapError>()
                .map(BootstrapError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let mut config = BootstrapConfig::load(cli.config)?;

    // CLI overrides
    if let Some(url) = cli.base_url {
        config.base_url = normalize_base_url(&url);
    }

    let command = resolve_command(cli.command);
    match &command {
        Command::Run(args) => apply_run_args(&mut config, args)?,
        Command::Pull { models } => {
            config.override_models(parse_models(models)?);
        }
        Command::Status | Command::Stop { .. } => {}
    }

    config.validate()?;

    tracing::debug!(
        binary = %config.binary,
        base_url = %config.base_url,
        tier = %config.llms.active,
        pull_method = ?config.pull.method,
        "Configuration loaded"
    );

    let metrics_handle = match &config.metrics_textfile {
        Some(_) => Some(metrics::setup_metrics()?),
        None => None,
    };

    let result = match command {
        Command::Run(_) => run_bootstrap(&config).await,
        Command::Status => status(&config).await,
        Command::Pull { .. } => pull_only(&config).await,
        Command::Stop { timeout_secs } => stop(&config, Duration::from_secs(timeout_secs)).await,
    };

    if let (Some(handle), Some(path)) = (&metrics_handle, &config.metrics_textfile)
        && let Err(e) = metrics::write_textfile(handle, path)
    {
        tracing::warn!(error = %e, "Failed to write metrics textfile");
    }

    result
}

/// A bare invocation runs the full bootstrap with defaults
fn resolve_command(command: Option<Command>) -> Command {
    command.unwrap_or_else(|| Command::Run(RunArgs::default()))
}

fn apply_run_args(config: &mut BootstrapConfig, args: &RunArgs) -> Result<()> {
    if let Some(tier) = &args.tier {
        config.llms.active = tier.clone();
    }
    if !args.models.is_empty() {
        config.override_models(parse_models(&args.models)?);
    }
    if args.no_install {
        config.auto_install = false;
    }
    if let Some(method) = args.pull_method {
        config.pull.method = method;
    }
    if args.skip_present {
        config.pull.skip_present = true;
    }
    if args.abort_on_failure {
        config.pull.on_failure = FailurePolicy::Abort;
    }
    if let Some(secs) = args.pull_timeout_secs {
        config.pull.timeout_secs = Some(secs);
    }
    Ok(())
}

fn parse_models(raw: &[String]) -> Result<Vec<ModelRef>> {
    raw.iter()
        .map(|m| ModelRef::parse(m).map_err(anyhow::Error::from))
        .collect()
}

fn client(config: &BootstrapConfig) -> Result<OllamaClient> {
    let timeout = Duration::from_secs(config.readiness.request_timeout_secs);
    Ok(OllamaClient::new(config.base_url()?, timeout)?)
}

fn build_bootstrapper(config: &BootstrapConfig) -> Result<Bootstrapper> {
    let client = client(config)?;
    let host = config.daemon_host()?;

    let installer = Arc::new(ScriptInstaller::new(
        config.binary.clone(),
        config.install_script_url.clone(),
        config.install_shell.clone(),
    ));

    let service = Arc::new(OllamaService::new(SpawnConfig {
        binary_path: config.binary.clone(),
        host: host.clone(),
        log_file: config.log_dir.join("ollama-serve.log"),
    }));

    let puller: Arc<dyn ModelPuller> = match config.pull.method {
        PullMethod::Cli => Arc::new(CliPuller::new(config.binary.clone(), host)),
        PullMethod::Api => Arc::new(ApiPuller::new(client.clone())),
    };

    let state = Arc::new(StateManager::new(config.state_file.clone()));

    let bootstrapper =
        Bootstrapper::new(config.clone(), installer, service, Arc::new(client), puller)?
            .with_state(state);

    Ok(bootstrapper)
}

async fn run_bootstrap(config: &BootstrapConfig) -> Result<ExitCode> {
    let bootstrapper = build_bootstrapper(config)?;

    tracing::info!(
        models = ?bootstrapper.models().iter().map(ToString::to_string).collect::<Vec<_>>(),
        "Starting bootstrap"
    );

    let report = tokio::select! {
        result = bootstrapper.run() => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::warn!("Received Ctrl+C signal");
            bootstrapper.abandon().await;
            return Ok(ExitCode::from(130));
        }
    };

    print!("{}", render_report(config, &report));

    Ok(ExitCode::from(report_exit_code(&report)))
}

async fn pull_only(config: &BootstrapConfig) -> Result<ExitCode> {
    let bootstrapper = build_bootstrapper(config)?;
    let api = client(config)?;

    // Pulling never starts the daemon
    if let Err(e) = api.version().await {
        tracing::error!(endpoint = %api.endpoint(), error = %e, "Daemon is not running");
        return Err(BootstrapError::NotReady {
            url: api.endpoint(),
            attempts: 1,
        }
        .into());
    }

    let models = bootstrapper.pull_all().await;
    let failed = models
        .iter()
        .filter(|m| matches!(m.outcome, PullOutcome::Failed { .. } | PullOutcome::NotAttempted))
        .count();

    for report in &models {
        println!("  {:<28} {}", report.model, describe(&report.outcome));
    }

    Ok(if failed == 0 {
        ExitCode::SUCCESS
    } else {
        ExitCode::from(4)
    })
}

async fn status(config: &BootstrapConfig) -> Result<ExitCode> {
    let api = client(config)?;
    let state = StateManager::new(config.state_file.clone());

    match find_executable(&config.binary, std::env::var_os("PATH")) {
        Some(path) => println!("binary:  {} ({})", config.binary, path.display()),
        None => println!("binary:  {} (not found on PATH)", config.binary),
    }

    if let Some(record) = state.load().await? {
        println!(
            "spawned: pid {} at {} (log: {})",
            record.pid,
            record.started_at.format("%Y-%m-%d %H:%M:%S UTC"),
            record.log_file.display()
        );
    }

    let version = match api.version().await {
        Ok(version) => version,
        Err(e) => {
            println!("daemon:  not reachable at {} ({})", config.base_url, e);
            return Ok(ExitCode::from(3));
        }
    };
    println!("daemon:  running at {} (version {})", config.base_url, version);

    println!("models ({} tier):", config.llms.active);
    for model in config.llms.active_models()? {
        let present = api
            .has_model(model)
            .await
            .context("Failed to list daemon models")?;
        println!(
            "  {:<28} {}",
            model,
            if present { "present" } else { "missing" }
        );
    }

    Ok(ExitCode::SUCCESS)
}

async fn stop(config: &BootstrapConfig, timeout: Duration) -> Result<ExitCode> {
    let state = StateManager::new(config.state_file.clone());

    let Some(record) = state.load().await? else {
        println!("No daemon recorded in {}", state.state_file().display());
        return Ok(ExitCode::SUCCESS);
    };

    let stopped = service::terminate_pid(record.pid, timeout).await?;
    state.clear().await?;

    if stopped {
        println!("Stopped daemon (pid {})", record.pid);
    } else {
        println!("Daemon (pid {}) was not running", record.pid);
    }

    Ok(ExitCode::SUCCESS)
}

fn describe(outcome: &PullOutcome) -> String {
    match outcome {
        PullOutcome::Pulled { elapsed } => format!("pulled ({}s)", elapsed.as_secs()),
        PullOutcome::Failed { error } => format!("failed: {}", error),
        other => other.label().to_string(),
    }
}

fn render_report(config: &BootstrapConfig, report: &BootstrapReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out);
    let _ = writeln!(out, "Virtual Teacher model setup complete.");
    let _ = writeln!(out, "  binary:  {}", report.install.path().display());
    let _ = match &report.service {
        ServiceOutcome::Started { pid, version, .. } => writeln!(
            out,
            "  daemon:  started at {} (version {}, pid {})",
            config.base_url,
            version,
            pid.map(|p| p.to_string()).unwrap_or_else(|| "?".to_string())
        ),
        ServiceOutcome::AlreadyRunning { version } => writeln!(
            out,
            "  daemon:  already running at {} (version {})",
            config.base_url, version
        ),
    };
    let _ = writeln!(out, "  models:");
    for model in &report.models {
        let _ = writeln!(out, "    {:<28} {}", model.model, describe(&model.outcome));
    }

    let failed = report.failed_models().count();
    if failed > 0 {
        let _ = writeln!(out);
        let _ = writeln!(out, "{} model(s) were not pulled; re-run to retry.", failed);
    }
    out
}

fn report_exit_code(report: &BootstrapReport) -> u8 {
    if report.is_success() { 0 } else { 4 }
}
