//! Segflow — self-hosted marketing automation engine.
//!
//! Main entry point: loads configuration, opens the store, starts the flow
//! executor tick loop and serves the HTTP API.

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use segflow_api::ApiState;
use segflow_channels::{EmailSender, ProviderSender};
use segflow_core::clock::system_clock;
use segflow_core::AppConfig;
use segflow_flow::FlowExecutor;
use segflow_services::Services;
use segflow_store::Database;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "segflow")]
#[command(about = "Self-hosted marketing automation engine")]
#[command(version)]
struct Cli {
    /// SQLite database path (overrides config)
    #[arg(long, env = "DATABASE_URL")]
    database: Option<String>,

    /// HTTP port (overrides config)
    #[arg(long, env = "SEGFLOW__API__PORT")]
    port: Option<u16>,

    /// Flow executor tick interval in milliseconds (overrides config)
    #[arg(long, env = "SEGFLOW__EXECUTOR__TICK_INTERVAL_MS")]
    tick_interval_ms: Option<u64>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "segflow=info,tower_http=info".into()),
        )
        .json()
        .init();

    let cli = Cli::parse();

    info!("Segflow starting up");

    let mut config = AppConfig::load().unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        AppConfig::default()
    });

    if let Some(database) = cli.database {
        config.database_url = database;
    }
    if let Some(port) = cli.port {
        config.api.port = port;
    }
    if let Some(tick) = cli.tick_interval_ms {
        config.executor.tick_interval_ms = tick;
    }

    if config.api_key.is_empty() {
        warn!("SEGFLOW_API_KEY is not set; every API request will be rejected");
    }

    info!(
        database = %config.database_url,
        port = config.api.port,
        tick_interval_ms = config.executor.tick_interval_ms,
        "Configuration loaded"
    );

    let db = Arc::new(Database::open(&config.database_url)?);
    let sender: Arc<dyn EmailSender> = Arc::new(ProviderSender);
    let clock = system_clock();

    let services = Arc::new(Services::new(db.clone(), sender.clone(), clock.clone()));
    let executor = Arc::new(FlowExecutor::new(db, sender, clock));

    tokio::spawn(
        executor.run(Duration::from_millis(config.executor.tick_interval_ms)),
    );

    let app = segflow_api::router(ApiState {
        services,
        api_key: config.api_key.clone(),
    });

    let listener =
        tokio::net::TcpListener::bind((config.api.host.as_str(), config.api.port)).await?;
    info!(addr = %listener.local_addr()?, "Segflow is ready to serve traffic");
    axum::serve(listener, app).await?;

    Ok(())
}
