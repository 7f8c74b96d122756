//! Mock API Server - CLI Entry Point

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use mock_api_server::watcher::{self, watch_config, DEFAULT_INTERVAL_MS};
use mock_api_server::{
    start_server, ApiConfig, AppState, ConfigReloader, EndpointRegistry, EventBus, FileSource,
    ServerConfig,
};

#[derive(Parser, Debug)]
#[command(
    name = "mock-api-server",
    about = "Declarative HTTP API simulator - path routing, response templates and failure simulation",
    version
)]
struct Args {
    /// Path to configuration file
    #[arg(short, long, env = "CONFIG_FILE", default_value = "mock-api.yml")]
    config: PathBuf,

    /// Port to listen on
    #[arg(short, long, env = "PORT", default_value_t = 3000)]
    port: u16,

    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Reload automatically when the configuration file changes
    #[arg(long, env = "WATCH", default_value_t = true, action = clap::ArgAction::Set)]
    watch: bool,

    /// Polling interval of the configuration watcher in milliseconds
    #[arg(long, default_value_t = DEFAULT_INTERVAL_MS)]
    watch_interval_ms: u64,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'L', long, default_value = "info")]
    log_level: Level,

    /// Print a sample configuration and exit
    #[arg(long)]
    print_config: bool,

    /// Validate configuration and exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    let subscriber = FmtSubscriber::builder()
        .with_max_level(args.log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.print_config {
        let sample_config = include_str!("../mock-api.example.yml");
        println!("{}", sample_config);
        return Ok(());
    }

    if args.validate {
        let config = ApiConfig::from_file(&args.config)
            .with_context(|| format!("failed to load {}", args.config.display()))?;
        let problems = config.validate();
        for (index, problem) in &problems {
            println!("Endpoint #{}: {} (will be skipped)", index + 1, problem);
        }
        println!(
            "Configuration is valid ({} endpoints defined, {} skipped)",
            config.endpoints.len(),
            problems.len()
        );
        return Ok(());
    }

    let events = EventBus::new();
    let registry = Arc::new(EndpointRegistry::new(events.clone()));
    let source = Arc::new(FileSource::new(&args.config));
    let config_path = source.path().to_path_buf();
    let reloader = Arc::new(ConfigReloader::new(
        source,
        Arc::clone(&registry),
        events.clone(),
    ));

    // Sampled before loading so an edit racing the initial load is reloaded
    let baseline = watcher::fingerprint(&config_path).await;

    // A missing or broken file is not fatal, the watcher picks up a fix
    if reloader.reload().await.is_err() {
        warn!("Starting without endpoints");
    }

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let watch_task = if args.watch {
        Some(tokio::spawn(watch_config(
            Arc::clone(&reloader),
            config_path,
            baseline,
            Duration::from_millis(args.watch_interval_ms.max(1)),
            events.clone(),
            shutdown_rx,
        )))
    } else {
        info!("Config file watching disabled");
        None
    };

    let server_config = ServerConfig {
        host: args.host,
        port: args.port,
    };
    let state = Arc::new(AppState::new(reloader, events));

    start_server(&server_config, state, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutdown signal received");
    })
    .await?;

    let _ = shutdown_tx.send(true);
    if let Some(watch_task) = watch_task {
        let _ = watch_task.await;
    }

    Ok(())
}
