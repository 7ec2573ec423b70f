//! tempdb command-line front-end
//!
//! Usage:
//!     tempdb list --json
//!     tempdb find --pg-version 16
//!     tempdb run --database app_test -c log_statement=all
//!     tempdb --log-file run

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tempdb::{InstanceFactory, ServerParams, TempDbConfig, Version};
use tempdb_logging::LogConfig;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "tempdb", about = "Disposable PostgreSQL instances for tests")]
struct Cli {
    /// Enable verbose logging (debug to stderr, including server output)
    #[arg(short = 'v', long, global = true)]
    verbose: bool,

    /// Also log to a rotating file under $TEMPDB_HOME/logs
    #[arg(long, global = true)]
    log_file: bool,

    /// TOML configuration file
    #[arg(long, global = true, env = "TEMPDB_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List discovered PostgreSQL installations
    List {
        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Print the bin directory that would be used
    Find {
        /// Version hint, e.g. 16 or 14.11
        #[arg(long)]
        pg_version: Option<Version>,
    },

    /// Start a disposable instance and keep it running until Ctrl-C
    Run {
        /// Use this bin directory instead of discovery
        #[arg(long)]
        bin_dir: Option<PathBuf>,

        /// Version hint for discovery
        #[arg(long)]
        pg_version: Option<Version>,

        /// Cluster superuser (default: current user)
        #[arg(long)]
        superuser: Option<String>,

        /// Database to create; can be given multiple times
        #[arg(short = 'd', long = "database")]
        databases: Vec<String>,

        /// Server setting as KEY=VALUE; can be given multiple times
        #[arg(short = 'c', value_parser = parse_setting)]
        settings: Vec<(String, String)>,
    },
}

fn parse_setting(raw: &str) -> std::result::Result<(String, String), String> {
    match raw.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() => {
            Ok((key.trim().to_string(), value.to_string()))
        }
        _ => Err(format!("expected KEY=VALUE, got {raw:?}")),
    }
}

fn load_config(path: Option<&PathBuf>) -> Result<TempDbConfig> {
    let config = match path {
        Some(path) => TempDbConfig::load(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => TempDbConfig::default(),
    };
    config
        .with_env_overrides(|key| std::env::var(key).ok())
        .context("Invalid TEMPDB_* environment variable")
}

fn cmd_list(json: bool) -> Result<ExitCode> {
    let installations: Vec<_> = tempdb::iter_installations()
        .context("Installation discovery failed")?
        .collect();

    if json {
        println!("{}", serde_json::to_string_pretty(&installations)?);
    } else if installations.is_empty() {
        eprintln!("No PostgreSQL installations found");
    } else {
        for installation in &installations {
            println!("{:<10} {}", installation.version, installation.bin_dir.display());
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn cmd_find(config: &TempDbConfig, pg_version: Option<Version>) -> Result<ExitCode> {
    let hint = match pg_version {
        Some(version) => Some(version),
        None => config.version_hint()?,
    };

    match tempdb::find_installation(hint.as_ref())? {
        Some(bin_dir) => {
            println!("{}", bin_dir.display());
            Ok(ExitCode::SUCCESS)
        }
        None => {
            eprintln!(
                "No installation matches version {}",
                hint.map(|v| v.to_string()).unwrap_or_default()
            );
            Ok(ExitCode::FAILURE)
        }
    }
}

async fn cmd_run(
    mut config: TempDbConfig,
    bin_dir: Option<PathBuf>,
    pg_version: Option<Version>,
    superuser: Option<String>,
    databases: Vec<String>,
    settings: Vec<(String, String)>,
) -> Result<ExitCode> {
    if bin_dir.is_some() {
        config.bin_dir = bin_dir;
    }
    if let Some(version) = pg_version {
        config.version = Some(version.to_string());
    }
    if superuser.is_some() {
        config.superuser = superuser;
    }

    let factory = InstanceFactory::from_config(&config).context("No usable PostgreSQL installation")?;
    if let Ok(version) = factory.version() {
        info!("Using PostgreSQL {} from {}", version, factory.bin_dir().display());
    }

    let params: ServerParams = settings.into_iter().collect();
    let mut instance = factory
        .provision_and_start_with(params)
        .await
        .context("Failed to start PostgreSQL")?;

    let created = create_databases(&instance, &databases).await;
    let result = match created {
        Ok(()) => {
            eprintln!("Instance ready, press Ctrl-C to stop");
            tokio::signal::ctrl_c()
                .await
                .context("Failed to listen for Ctrl-C")
        }
        Err(e) => Err(e),
    };

    info!("Stopping instance");
    if let Err(e) = instance.close().await {
        warn!("Instance did not shut down cleanly: {}", e);
        if result.is_ok() {
            return Err(e).context("Failed to close instance");
        }
    }
    result.map(|()| ExitCode::SUCCESS)
}

async fn create_databases(instance: &tempdb::RunningInstance, databases: &[String]) -> Result<()> {
    println!("{}", instance.uri());
    for name in databases {
        let db = instance
            .create_database(name, None)
            .await
            .with_context(|| format!("Failed to create database {name}"))?;
        println!("{}", db.dsn());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = tempdb_logging::init_logging(LogConfig {
        app_name: "tempdb",
        verbose: cli.verbose,
        log_to_file: cli.log_file,
    }) {
        eprintln!("Warning: failed to initialize logging: {e:#}");
    }

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    let config = load_config(cli.config.as_ref())?;
    match cli.command {
        Commands::List { json } => cmd_list(json),
        Commands::Find { pg_version } => cmd_find(&config, pg_version),
        Commands::Run {
            bin_dir,
            pg_version,
            superuser,
            databases,
            settings,
        } => {
            if databases.iter().any(|name| name.is_empty()) {
                bail!("Database names must not be empty");
            }
            cmd_run(config, bin_dir, pg_version, superuser, databases, settings).await
        }
    }
}
