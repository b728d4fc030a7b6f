//! Payment Lifecycle Engine - Main Application Entry Point
//!
//! REST API server that runs payments and refunds against external providers,
//! ingests their webhooks and reconciles with them in the background.
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Open storage (PostgreSQL with migrations, or in-memory)
//! 3. Register provider adapters
//! 4. Start the scheduled jobs
//! 5. Build HTTP router with routes and middleware
//! 6. Serve until Ctrl-C, then stop the jobs

use std::sync::Arc;
use std::time::Duration;

use payment_lifecycle_engine::{
    AppState, build_router,
    clock::{Clock, SystemClock},
    config::{Config, StorageBackend},
    db,
    providers::{
        ProviderRegistry, card::CardProvider, mobile_money::MobileMoneyProvider, mock::MockProvider,
        wallet::WalletProvider,
    },
    store::{Store, WalletRepository, memory::InMemoryStore, postgres::PgStore},
};
use tokio::sync::watch;
use tracing_subscriber::EnvFilter;
use url::Url;

fn build_providers(
    config: &Config,
    wallets: Arc<dyn WalletRepository>,
    clock: Arc<dyn Clock>,
) -> anyhow::Result<ProviderRegistry> {
    if config.mock_providers {
        tracing::warn!("MOCK_PROVIDERS is set, no real provider will be called");
        return Ok(ProviderRegistry::new()
            .register(Arc::new(MockProvider::new("card", config.card_webhook_secret.clone())))
            .register(Arc::new(MockProvider::new(
                "mobile_money",
                config.mobile_money_webhook_secret.clone(),
            )))
            .register(Arc::new(MockProvider::new("wallet", config.wallet_webhook_secret.clone()))));
    }

    let client = reqwest::Client::builder()
        .timeout(Duration::from_millis(config.provider_timeout_ms))
        .build()?;

    Ok(ProviderRegistry::new()
        .register(Arc::new(CardProvider::new(
            Url::parse(&config.card_base_url)?,
            config.card_api_key.clone(),
            config.card_webhook_secret.clone(),
            config.webhook_tolerance_seconds,
            client.clone(),
            clock.clone(),
        )))
        .register(Arc::new(MobileMoneyProvider::new(
            Url::parse(&config.mobile_money_base_url)?,
            config.mobile_money_api_key.clone(),
            config.mobile_money_webhook_secret.clone(),
            client,
        )))
        .register(Arc::new(WalletProvider::new(
            wallets,
            config.wallet_webhook_secret.clone(),
            clock,
        ))))
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env()?;
    tracing::info!("Configuration loaded");

    let (store, wallets): (Arc<dyn Store>, Arc<dyn WalletRepository>) = match config.storage_backend {
        StorageBackend::Postgres => {
            let pool = db::create_pool(&config.database_url).await?;
            tracing::info!("Database pool created");
            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");
            let backend = Arc::new(PgStore::new(pool));
            let wallets: Arc<dyn WalletRepository> = backend.clone();
            let store: Arc<dyn Store> = backend;
            (store, wallets)
        }
        StorageBackend::Memory => {
            tracing::warn!("Using the in-memory store, nothing survives a restart");
            let backend = Arc::new(InMemoryStore::new());
            let wallets: Arc<dyn WalletRepository> = backend.clone();
            let store: Arc<dyn Store> = backend;
            (store, wallets)
        }
    };

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let providers = build_providers(&config, wallets, clock.clone())?;
    tracing::info!(providers = ?providers.names(), "Providers registered");

    let state = AppState::new(
        store,
        providers,
        clock,
        config.payment_settings(),
        config.retry_policy(),
        config.job_intervals(),
    );

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let jobs = state.scheduler.spawn(shutdown_rx);
    tracing::info!(jobs = ?state.scheduler.job_names(), "Scheduled jobs started");

    let app = build_router(state);

    let addr = format!("0.0.0.0:{}", config.server_port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Shutting down scheduled jobs");
    shutdown_tx.send(true)?;
    for job in jobs {
        job.await?;
    }

    Ok(())
}
