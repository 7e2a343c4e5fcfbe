use clap::{Parser, ValueEnum};
use soko_core::{EngineConfig, MarketStoreConfig};
use soko_service::{build_router, ServiceConfig, ServiceState};
use std::net::SocketAddr;
use std::time::Duration;
use tracing::info;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum StorageMode {
    Auto,
    Memory,
    Postgres,
}

#[derive(Debug, Parser)]
#[command(name = "sokod", version, about = "Soko settlement engine REST service")]
struct Cli {
    /// REST socket address to bind, e.g. 127.0.0.1:8096
    #[arg(long, default_value = "127.0.0.1:8096")]
    listen: SocketAddr,
    /// Record storage backend. `auto` picks postgres when a database url is configured.
    #[arg(long, value_enum, default_value_t = StorageMode::Auto, env = "SOKO_STORAGE")]
    storage: StorageMode,
    /// PostgreSQL url for durable order/escrow/commission records.
    #[arg(long, env = "SOKO_DATABASE_URL")]
    database_url: Option<String>,
    /// Max PostgreSQL pool connections.
    #[arg(long, default_value_t = 5, env = "SOKO_PG_MAX_CONNECTIONS")]
    pg_max_connections: u32,
    /// Platform fee retained from every escrow, in basis points.
    #[arg(long, default_value_t = 1_000, env = "SOKO_PLATFORM_FEE_BPS")]
    platform_fee_bps: u32,
    /// Deadline in seconds for payment gateway calls.
    #[arg(long, default_value_t = 15, env = "SOKO_PAYMENT_TIMEOUT_SECS")]
    payment_timeout_secs: u64,
    /// Settlement currency code.
    #[arg(long, default_value = "NGN", env = "SOKO_CURRENCY")]
    currency: String,
}

fn resolve_storage(cli: &Cli) -> anyhow::Result<MarketStoreConfig> {
    let resolved_url = cli
        .database_url
        .clone()
        .or_else(|| std::env::var("DATABASE_URL").ok());

    let storage = match cli.storage {
        StorageMode::Memory => MarketStoreConfig::Memory,
        StorageMode::Postgres => {
            let database_url = resolved_url.ok_or_else(|| {
                anyhow::anyhow!("storage=postgres requires --database-url or DATABASE_URL")
            })?;
            MarketStoreConfig::postgres(database_url, cli.pg_max_connections)
        }
        StorageMode::Auto => {
            if let Some(database_url) = resolved_url {
                MarketStoreConfig::postgres(database_url, cli.pg_max_connections)
            } else {
                MarketStoreConfig::Memory
            }
        }
    };

    Ok(storage)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "soko_service=info,info".to_string()),
        )
        .init();

    let cli = Cli::parse();
    let storage = resolve_storage(&cli)?;
    let config = ServiceConfig {
        engine: EngineConfig {
            platform_fee_bps: cli.platform_fee_bps,
            currency: cli.currency.clone(),
            payment_timeout: Duration::from_secs(cli.payment_timeout_secs),
            storage,
        },
    };
    let state = ServiceState::bootstrap(config)
        .await
        .map_err(|e| anyhow::anyhow!("engine bootstrap failed: {e}"))?;
    info!(
        backend = state.engine.storage_backend(),
        fee_bps = cli.platform_fee_bps,
        "soko settlement engine ready"
    );

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind(cli.listen).await?;
    info!("soko-service REST listening on {}", listener.local_addr()?);

    axum::serve(listener, app).await?;
    Ok(())
}
