//! EdgeKeeper CLI - runs the workload agent and one-off probe checks

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use edgekeeper_core::config::AgentConfig;
use edgekeeper_core::workload::{HttpHeader, HttpScheme, ProbeAction, ProbeSpec, Workload};
use edgekeeper_supervisor::probe::{ProbeResult, ProbeRunner};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "edgekeeper")]
#[command(about = "Supervise locally deployed workloads and restart them when they fail", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the agent until interrupted
    Run {
        /// Configuration file (TOML, YAML or JSON)
        #[arg(short, long, env = "EDGEKEEPER_CONFIG_PATH")]
        config: Option<PathBuf>,
    },
    /// Load and validate a configuration
    Validate {
        /// Configuration file (TOML, YAML or JSON)
        #[arg(short, long, env = "EDGEKEEPER_CONFIG_PATH")]
        config: Option<PathBuf>,

        /// Print the resolved workloads as JSON
        #[arg(long)]
        json: bool,
    },
    /// Run a single health check
    Probe {
        #[command(subcommand)]
        command: ProbeCommands,
    },
    /// Version information
    Version,
}

#[derive(Subcommand)]
enum ProbeCommands {
    /// HTTP GET check
    Http {
        /// Target port
        #[arg(short, long)]
        port: u16,

        /// Target host
        #[arg(long, default_value = "127.0.0.1")]
        host: String,

        /// Request path, optionally with a query string
        #[arg(long, default_value = "/")]
        path: String,

        #[arg(long, value_enum, default_value_t = Scheme::Http)]
        scheme: Scheme,

        /// Extra request header as `Name: value`; may be repeated
        #[arg(short = 'H', long = "header")]
        headers: Vec<String>,

        /// Timeout in seconds
        #[arg(short, long, default_value_t = 1)]
        timeout: u64,

        /// Follow redirects to other hosts
        #[arg(long)]
        follow_redirects: bool,
    },
    /// TCP connect check
    Tcp {
        host: String,
        port: u16,

        /// Timeout in seconds
        #[arg(short, long, default_value_t = 1)]
        timeout: u64,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum Scheme {
    Http,
    Https,
}

impl From<Scheme> for HttpScheme {
    fn from(scheme: Scheme) -> Self {
        match scheme {
            Scheme::Http => HttpScheme::Http,
            Scheme::Https => HttpScheme::Https,
        }
    }
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Version => {
            println!("edgekeeper {}", env!("CARGO_PKG_VERSION"));
            println!("edgekeeper-core {}", edgekeeper_core::VERSION);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Validate { config, json } => {
            init_tracing(None);
            validate(config.as_deref(), json)
        }
        Commands::Run { config } => run(config).await,
        Commands::Probe { command } => {
            init_tracing(None);
            probe(command).await
        }
    }
}

/// Initialize tracing; `RUST_LOG` wins over the configured filter
fn init_tracing(configured: Option<&str>) {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(configured.unwrap_or("info")))
        .unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

fn load_config(path: Option<&Path>) -> Result<AgentConfig> {
    AgentConfig::load(path).context("Failed to load configuration")
}

fn validate(path: Option<&Path>, json: bool) -> Result<ExitCode> {
    let config = load_config(path)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&config.workloads)?);
        return Ok(ExitCode::SUCCESS);
    }

    println!("Configuration is valid");
    println!("  reconcile interval: {:?}", config.reconcile.interval);
    println!("  stop grace period:  {:?}", config.engine.grace_period);
    println!("  workloads:          {}", config.workloads.len());
    for workload in &config.workloads {
        println!("    {}", describe(workload));
    }
    Ok(ExitCode::SUCCESS)
}

fn describe(workload: &Workload) -> String {
    let mut line = format!(
        "{} ({}) restart={}",
        workload.workload_ref(),
        workload.command,
        workload.restart.policy
    );
    if workload.restart.max_retries() > 0 {
        line.push_str(&format!(" max-retries={}", workload.restart.max_retries()));
    }
    if let Some(probe) = &workload.startup_probe {
        line.push_str(&format!(" startup={}", describe_probe(probe)));
    }
    if let Some(probe) = &workload.liveness_probe {
        line.push_str(&format!(" liveness={}", describe_probe(probe)));
    }
    line
}

fn describe_probe(spec: &ProbeSpec) -> String {
    match &spec.action {
        ProbeAction::Http(http) => format!("{}:{}{}", http.scheme.as_str(), http.port, http.path),
        ProbeAction::Tcp(tcp) => format!("tcp:{}", tcp.port),
    }
}

async fn run(path: Option<PathBuf>) -> Result<ExitCode> {
    let config = load_config(path.as_deref())?;
    init_tracing(Some(&config.logging.filter));
    run_agent(config, path).await?;
    Ok(ExitCode::SUCCESS)
}

#[cfg(unix)]
async fn run_agent(config: AgentConfig, path: Option<PathBuf>) -> Result<()> {
    use edgekeeper_supervisor::{NativeEngine, WorkloadAgent};
    use std::sync::Arc;
    use tokio::time::MissedTickBehavior;

    let engine = Arc::new(NativeEngine::new(config.engine.clone()));
    let agent = WorkloadAgent::with_defaults(engine)?;
    info!(
        workloads = config.workloads.len(),
        interval = ?config.reconcile.interval,
        "Starting edgekeeper agent"
    );

    let mut desired = config.workloads;
    let mut ticker = tokio::time::interval(config.reconcile.interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let shutdown = shutdown_signal();
    tokio::pin!(shutdown);

    let mut first = true;
    loop {
        tokio::select! {
            biased;
            result = &mut shutdown => {
                result?;
                info!("Shutdown requested");
                break;
            }
            _ = ticker.tick() => {}
        }

        if !first {
            match load_config(path.as_deref()) {
                Ok(config) => desired = config.workloads,
                Err(e) => {
                    warn!(error = %format!("{e:#}"), "Failed to reload configuration, keeping previous workloads");
                    agent.resync_probes().await;
                    continue;
                }
            }
        }
        first = false;

        if let Err(e) = agent.apply(desired.clone()).await {
            error!(error = %e, "Reconciliation failed");
        }
    }

    agent.shutdown().await;
    Ok(())
}

#[cfg(not(unix))]
async fn run_agent(_config: AgentConfig, _path: Option<PathBuf>) -> Result<()> {
    anyhow::bail!("the native process engine is only available on unix platforms")
}

#[cfg(unix)]
async fn shutdown_signal() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};

    let mut terminate = signal(SignalKind::terminate())?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

async fn probe(command: ProbeCommands) -> Result<ExitCode> {
    let spec = match command {
        ProbeCommands::Http {
            port,
            host,
            path,
            scheme,
            headers,
            timeout,
            follow_redirects,
        } => {
            let mut spec = ProbeSpec::http(port, path)
                .with_host(host)
                .with_timeout_seconds(timeout)
                .with_follow_redirects(follow_redirects);
            if let ProbeAction::Http(http) = &mut spec.action {
                http.scheme = scheme.into();
                http.headers = headers
                    .iter()
                    .map(String::as_str)
                    .map(parse_header)
                    .collect::<Result<_>>()?;
            }
            spec
        }
        ProbeCommands::Tcp { host, port, timeout } => ProbeSpec::tcp(port)
            .with_host(host)
            .with_timeout_seconds(timeout),
    };

    let runner = ProbeRunner::new()?;
    let (result, output) = runner.execute(&spec).await?;

    println!("{}", result);
    if !output.is_empty() {
        println!("{}", output);
    }

    Ok(match result {
        ProbeResult::Success | ProbeResult::Warning => ExitCode::SUCCESS,
        ProbeResult::Failure | ProbeResult::Unknown => ExitCode::FAILURE,
    })
}

fn parse_header(raw: &str) -> Result<HttpHeader> {
    let (name, value) = raw
        .split_once(':')
        .with_context(|| format!("Invalid header '{}', expected 'Name: value'", raw))?;
    Ok(HttpHeader {
        name: name.trim().to_string(),
        value: value.trim().to_string(),
    })
}
