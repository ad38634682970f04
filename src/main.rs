mod broker;
mod cache;
mod config;
mod gateway;
mod guard;
mod llm;
mod manifest;
mod policy;
mod validator;

use std::sync::Arc;

use anyhow::{anyhow, Result};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use crate::cache::ScriptCache;
use crate::config::Config;
use crate::gateway::{JobState, SafetyGateway};
use crate::guard::ExecutionStatus;
use crate::llm::{AnthropicClient, CodeGenerator};
use crate::manifest::JobSpec;

fn print_help() {
    println!(
        "\
pipegate v{}

Execution safety gateway for LLM-generated data pipeline scripts.

USAGE:
    pipegate [OPTIONS] <JOB_SPEC> [CONFIG_PATH]

ARGUMENTS:
    JOB_SPEC       Path to the JSON job specification to run
    CONFIG_PATH    Path to TOML configuration file [default: config/gateway.toml]

OPTIONS:
    -h, --help       Print this help message and exit
    -V, --version    Print version and exit
    --cache-stats    Print script cache statistics and exit
    --cache-clear    Remove every cached script and exit

ENVIRONMENT VARIABLES:
    Variables are referenced in the config file via ${{VAR_NAME}} syntax.

    RUST_LOG              Log level filter for tracing
                          (e.g. debug, pipegate=debug,warn)
    ANTHROPIC_API_KEY     API key for Anthropic Claude models
                          (from https://console.anthropic.com/)
    STORAGE_ACCESS_KEY    Access key id for the object store
    STORAGE_SECRET_KEY    Secret key for the object store
                          (never exposed to generated scripts)

EXAMPLES:
    pipegate jobs/orders.json                        # uses config/gateway.toml
    pipegate jobs/orders.json /etc/pipegate.toml     # custom config path
    RUST_LOG=debug pipegate jobs/orders.json         # with debug logging",
        env!("CARGO_PKG_VERSION"),
    );
}

#[tokio::main]
async fn main() -> Result<()> {
    // Handle --help / --version before anything else
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--version" | "-V" => {
                println!("pipegate v{}", env!("CARGO_PKG_VERSION"));
                std::process::exit(0);
            }
            "--help" | "-h" => {
                print_help();
                std::process::exit(0);
            }
            _ => {}
        }
    }

    // Initialize logging (RUST_LOG=debug for debug mode)
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("pipegate=info")),
        )
        .init();

    let first_arg = std::env::args()
        .nth(1)
        .ok_or_else(|| anyhow!("missing JOB_SPEC argument, see --help"))?;
    let config_path = std::env::args()
        .nth(2)
        .unwrap_or_else(|| "config/gateway.toml".to_string());

    info!("Loading configuration from {config_path}");
    let config = Config::load(&config_path)?;

    // Cache maintenance modes run without a job
    match first_arg.as_str() {
        "--cache-stats" => {
            let cache = ScriptCache::open(config.cache.dir.clone(), config.cache.ttl_secs)?;
            let stats = cache.stats()?;
            println!(
                "Cache: {} entries, {} bytes of script code",
                stats.entries, stats.total_bytes
            );
            return Ok(());
        }
        "--cache-clear" => {
            let cache = ScriptCache::open(config.cache.dir.clone(), config.cache.ttl_secs)?;
            let removed = cache.clear()?;
            println!("Cache: {removed} entries removed");
            return Ok(());
        }
        _ => {}
    }
    let spec_path = first_arg;
    info!("LLM: {} ({})", config.llm.provider, config.llm.model);
    info!("Object store: {}", config.storage.endpoint_url);
    info!("Interpreter: {}", config.execution.interpreter);

    let spec = JobSpec::load(&spec_path)?;

    let generator: Arc<dyn CodeGenerator> = Arc::new(AnthropicClient::new(config.llm.clone()));
    let shutdown = CancellationToken::new();
    let gateway = SafetyGateway::new(&config, generator, shutdown.clone())?;

    // Ctrl-C cancels the running job; the guard kills the child process
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received, cancelling job");
                shutdown.cancel();
            }
        }
    });

    let report = gateway.run_job(&spec).await?;

    println!();
    println!("Job:         {}", spec.pipeline_name);
    println!("Fingerprint: {}", report.fingerprint);
    println!("State:       {:?}", report.state);
    println!(
        "Path:        {}",
        report
            .path
            .iter()
            .map(|s| format!("{s:?}"))
            .collect::<Vec<_>>()
            .join(" -> ")
    );
    println!(
        "Attempts:    {}{}",
        report.attempts,
        if report.cache_hit { " (cache hit)" } else { "" }
    );
    if let Some(validation) = &report.validation {
        if !validation.valid {
            println!("Validation:\n{}", validation.feedback());
        }
    }
    if let Some(execution) = &report.execution {
        if execution.status != ExecutionStatus::ValidationFailed {
            println!(
                "Execution:   {:?} in {:.1}s (exit code {:?})",
                execution.status,
                execution.duration.as_secs_f64(),
                execution.exit_code
            );
            if !execution.stdout.is_empty() {
                println!("── stdout ──\n{}", execution.stdout);
            }
            if !execution.stderr.is_empty() {
                println!("── stderr ──\n{}", execution.stderr);
            }
        }
    }
    if let Some(e) = &report.error {
        error!("Job infrastructure error: {e}");
    }

    match report.state {
        JobState::Succeeded => Ok(()),
        state => Err(anyhow!("job ended in state {state:?}")),
    }
}
