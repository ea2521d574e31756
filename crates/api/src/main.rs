//! Retreat booking API server

use std::net::SocketAddr;

use retreat_api::{create_router, init_tracing, AppState, Config};
use retreat_billing::BillingService;
use retreat_shared::{create_migration_pool, create_pool, run_migrations};
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env file if present
    dotenvy::dotenv().ok();

    init_tracing("info,retreat_api=debug,retreat_billing=debug");

    tracing::info!("Starting retreat API server v{}", env!("CARGO_PKG_VERSION"));

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    if config.run_migrations {
        tracing::info!("Running database migrations...");
        let migration_pool = create_migration_pool(&config.database_url).await?;
        run_migrations(&migration_pool).await?;
        migration_pool.close().await;
    } else {
        tracing::info!("Database migrations skipped (RUN_MIGRATIONS=false)");
    }

    let pool = create_pool(&config.database_url).await?;
    tracing::info!("Database connection established");

    let billing = BillingService::from_env(pool)?;
    tracing::info!("Billing service initialized");

    let addr: SocketAddr = config.bind_address.parse()?;
    let state = AppState::new(billing, config);

    let app = create_router(state).layer(TraceLayer::new_for_http());

    tracing::info!("Listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
