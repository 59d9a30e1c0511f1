use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use audit_ledger::audit::{
    AuditLedger, ChainHasher, ConcurrencyGuard, Scheduler, SchedulerConfig, SecretStore, Verifier,
};
use audit_ledger::config::LedgerConfig;
use audit_ledger::database::Database;
use audit_ledger::server::{self, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "audit_ledger=info,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting audit ledger");

    let config = LedgerConfig::load()?;
    info!("Configuration loaded");

    let database = Database::new(&config.database_url).await?;
    database.run_migrations().await?;
    info!("Database migrations completed");

    let secrets = SecretStore::new(database.pool().clone());
    let version = secrets.bootstrap(config.initial_secret.as_deref()).await?;
    info!(version, "Ledger secret available");

    let ledger = AuditLedger::new(&database, ChainHasher::new(secrets), ConcurrencyGuard::new());
    let verifier = Verifier::new(database.pool().clone(), ledger, config.verify_page_size);

    let scheduler = Scheduler::new(
        verifier,
        SchedulerConfig {
            incremental_interval: config.incremental_interval(),
            full_scan_interval: config.full_scan_interval(),
            missed_run_grace: config.missed_run_grace,
            retention: Some(config.retention()),
            ..Default::default()
        },
    );
    scheduler.start();

    if config.admin_token.is_none() {
        info!("No admin token configured; admin endpoints will refuse all requests");
    }

    let app = server::router(AppState::new(scheduler, config.admin_token.clone()));

    let addr = config.bind_address();
    info!("Server listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
