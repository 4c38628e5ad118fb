//! hdb command line.
//!
//! Runs operations against an engine opened from the project's
//! configuration. Operations are JSON objects; responses are printed one
//! per line as `{"status": .., "body": ..}`.
//!
//! ```bash
//! # One operation
//! hdb exec '{"operation": "describe_all"}'
//!
//! # Newline-delimited operations from stdin
//! cat setup.ndjson | hdb run
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hdb::{Caller, Hdb, OperationResponse};
use hdb_config::{ConfigLoader, HdbConfig};
use serde_json::Value;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::EnvFilter;

/// hdb - operations engine for a schema-on-write document database.
#[derive(Parser)]
#[command(name = "hdb")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Directory holding hdb.toml and hdb.local.toml.
    #[arg(short, long, global = true, default_value = ".")]
    project_dir: PathBuf,

    /// Run as this user instead of the default super user.
    #[arg(short, long, global = true)]
    user: Option<String>,

    /// Password for `--user`.
    #[arg(long, global = true, requires = "user")]
    password: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version information.
    Version,

    /// Execute a single operation.
    Exec {
        /// Operation as a JSON object.
        operation: String,
    },

    /// Execute newline-delimited operations read from stdin.
    Run {
        /// Stop at the first failed operation.
        #[arg(long)]
        fail_fast: bool,
    },

    /// Print the effective configuration.
    Config,
}

fn init_logging(config: &HdbConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.logging.level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn caller(hdb: &Hdb, cli: &Cli) -> Result<Caller> {
    let caller = match (&cli.user, &cli.password) {
        (Some(user), Some(password)) => hdb.authenticate(user, password),
        (Some(user), None) => hdb.caller(user),
        (None, _) => hdb.super_user(),
    };
    caller.map_err(|err| anyhow::anyhow!(err.to_string()))
}

fn print(response: &OperationResponse) -> Result<()> {
    println!("{}", serde_json::to_string(response)?);
    Ok(())
}

async fn execute(hdb: &Hdb, caller: &Caller, text: &str) -> Result<OperationResponse> {
    let request: Value = serde_json::from_str(text).context("operation is not valid JSON")?;
    let response = hdb.execute(caller, request).await;
    print(&response)?;
    // Jobs run in this process, so wait for them before moving on.
    if let Some(handle) = response
        .body
        .get("job_id")
        .and_then(Value::as_str)
        .and_then(|id| hdb.job(id))
    {
        let outcome = handle.wait().await;
        println!(
            "{}",
            serde_json::json!({ "job_id": outcome.id, "status": outcome.status, "message": outcome.message })
        );
    }
    Ok(response)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut config = ConfigLoader::new()
        .with_project_dir(&cli.project_dir)
        .load()
        .with_context(|| format!("failed to load configuration from {}", cli.project_dir.display()))?;
    config.resolve_paths(&cli.project_dir);
    init_logging(&config);

    if matches!(cli.command, Commands::Version) {
        println!("hdb {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }
    if matches!(cli.command, Commands::Config) {
        println!("{}", toml::to_string_pretty(&config)?);
        return Ok(());
    }

    let hdb = Hdb::builder(config)
        .with_project_dir(&cli.project_dir)
        .build()
        .map_err(|err| anyhow::anyhow!(err.to_string()))?;
    let caller = caller(&hdb, &cli)?;

    match &cli.command {
        Commands::Exec { operation } => {
            let response = execute(&hdb, &caller, operation).await?;
            if !response.is_success() {
                std::process::exit(1);
            }
        }
        Commands::Run { fail_fast } => {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            let mut failed = 0usize;
            while let Some(line) = lines.next_line().await? {
                let line = line.trim();
                if line.is_empty() || line.starts_with('#') {
                    continue;
                }
                let response = execute(&hdb, &caller, line).await?;
                if !response.is_success() {
                    failed += 1;
                    if *fail_fast {
                        break;
                    }
                }
            }
            if failed > 0 {
                tracing::warn!(failed, "Some operations failed");
                std::process::exit(1);
            }
        }
        Commands::Version | Commands::Config => {}
    }
    Ok(())
}
