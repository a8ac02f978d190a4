//! WgKeeper - WireGuard Interface Reconciliation Daemon
//!
//! A Rust daemon that keeps a host's WireGuard interfaces converged
//! onto desired state stored in PostgreSQL.

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use wgkeeper::config::WgKeeperConfig;
use wgkeeper::controller::InterfaceController;
use wgkeeper::error::Result;
use wgkeeper::feed::ChangeFeed;
use wgkeeper::process::SystemRunner;
use wgkeeper::store::{migrate, PgStore};
use wgkeeper::wg::WgCli;

/// WgKeeper - WireGuard Interface Reconciliation Daemon
#[derive(Parser)]
#[command(name = "wgkeeper")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "wgkeeper.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the WgKeeper daemon
    Start,

    /// Initialize a new configuration file
    Init {
        /// Output path for configuration file
        #[arg(short, long, default_value = "wgkeeper.toml")]
        output: PathBuf,

        /// Server name
        #[arg(long, default_value = "wg-server-1")]
        server_name: String,
    },

    /// Validate configuration file
    Validate,

    /// Show server information
    Info,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(&cli.log_level);

    match cli.command {
        Commands::Start => run_start(cli.config).await,
        Commands::Init {
            output,
            server_name,
        } => run_init(output, server_name),
        Commands::Validate => run_validate(cli.config),
        Commands::Info => run_info(cli.config),
    }
}

/// Initialize logging
fn init_logging(level: &str) {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| level.into());

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Start the WgKeeper daemon
async fn run_start(config_path: PathBuf) -> Result<()> {
    tracing::info!("Starting WgKeeper daemon...");

    let config = match WgKeeperConfig::from_file(&config_path) {
        Ok(c) => c,
        Err(e) => {
            tracing::error!("Failed to load configuration from {:?}: {}", config_path, e);
            tracing::error!("Please check that the config file exists and is valid TOML");
            return Err(e);
        }
    };
    tracing::info!("Loaded configuration for server: {}", config.server.name);

    tracing::info!(
        "Connecting to PostgreSQL at {}:{}...",
        config.database.host,
        config.database.port
    );
    let pool = match PgPoolOptions::new()
        .max_connections(config.database.pool_size)
        .acquire_timeout(config.connect_timeout())
        .connect(&config.database_url())
        .await
    {
        Ok(pool) => pool,
        Err(e) => {
            tracing::error!("Failed to connect to PostgreSQL: {}", e);
            tracing::error!("  Host: {}:{}", config.database.host, config.database.port);
            tracing::error!("  User: {}", config.database.user);
            tracing::error!("Please check that PostgreSQL is running and credentials are correct");
            return Err(e.into());
        }
    };
    tracing::info!("Database connection established");

    if config.database.init {
        migrate(&pool, &config.database.migration_dir).await?;
    }

    let store = Arc::new(PgStore::new(pool));
    let runner = Arc::new(SystemRunner::new(config.command_timeout()));
    let wg = WgCli::new(runner);

    let mut controller = InterfaceController::new(
        config.server.name.clone(),
        config.server.config_dir.clone(),
        config.server.staging_dir.clone(),
        store,
        wg,
    );
    controller.startup().await?;
    tracing::info!("Initial reconciliation complete");

    let (tx, mut rx) = tokio::sync::mpsc::channel(config.feed.queue_depth);
    let feed = ChangeFeed::new(
        config.database_url(),
        config.feed.interface_channel.clone(),
        config.feed.peer_channel.clone(),
        config.keepalive_interval(),
        config.probe_timeout(),
        config.retry_delay(),
        tx,
    );
    let feed_handle = tokio::spawn(feed.run());

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(event) => controller.handle(event).await,
                    None => {
                        tracing::error!("Change feed queue closed unexpectedly");
                        break;
                    }
                }
            }
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("Received shutdown signal");
                break;
            }
        }
    }

    feed_handle.abort();
    tracing::info!("WgKeeper shutdown complete");
    Ok(())
}

/// Initialize configuration file
fn run_init(output: PathBuf, server_name: String) -> Result<()> {
    let config_content = format!(
        r#"# WgKeeper Configuration
# Generated configuration file

[server]
name = "{server_name}"
config_dir = "/etc/wireguard"
# staging_dir = "/tmp"
command_timeout_secs = 60

[database]
host = "localhost"
port = 5432
user = "wgkeeper"
password = "changeme"
database = "wgkeeper"
pool_size = 5
connect_timeout_secs = 5
# Apply migrations/update_*.sql when the schema is missing
init = false

[feed]
interface_channel = "interface"
peer_channel = "peer"
keepalive_secs = 30
retry_delay_secs = 30

[logging]
level = "info"
format = "pretty"
"#
    );

    std::fs::write(&output, config_content)?;
    println!("Configuration file created: {}", output.display());
    println!("\nEdit the file to configure your database connection.");
    println!("Then start with: wgkeeper start --config {}", output.display());

    Ok(())
}

/// Validate configuration
fn run_validate(config_path: PathBuf) -> Result<()> {
    match WgKeeperConfig::from_file(&config_path) {
        Ok(config) => {
            println!("✓ Configuration is valid");
            println!("  Server Name: {}", config.server.name);
            println!("  Config Dir: {}", config.server.config_dir.display());
            println!(
                "  Database: {}@{}:{}/{}",
                config.database.user,
                config.database.host,
                config.database.port,
                config.database.database
            );
            Ok(())
        }
        Err(e) => {
            eprintln!("✗ Configuration error: {}", e);
            Err(e)
        }
    }
}

/// Show server information
fn run_info(config_path: PathBuf) -> Result<()> {
    let config = WgKeeperConfig::from_file(&config_path)?;

    println!("WgKeeper Server Information");
    println!("===========================");
    println!();
    println!("Server Name:      {}", config.server.name);
    println!("Config Dir:       {}", config.server.config_dir.display());
    println!("Staging Dir:      {}", config.server.staging_dir.display());
    println!();
    println!("Database Configuration:");
    println!(
        "  Host:           {}:{}",
        config.database.host, config.database.port
    );
    println!("  Database:       {}", config.database.database);
    println!("  Pool Size:      {}", config.database.pool_size);
    println!("  Schema Init:    {}", config.database.init);
    println!();
    println!("Change Feed Configuration:");
    println!(
        "  Channels:       {} / {}",
        config.feed.interface_channel, config.feed.peer_channel
    );
    println!("  Keepalive:      {} s", config.feed.keepalive_secs);
    println!("  Retry Delay:    {} s", config.feed.retry_delay_secs);
    println!("  Queue Depth:    {}", config.feed.queue_depth);

    Ok(())
}
