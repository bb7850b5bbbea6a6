//! Build farm manager daemon.
//!
//! Runs one scanner per configured worker and serves the HTTP API.

use anyhow::Context;
use buildfarm_api::{AppState, routes};
use buildfarm_config::{FarmConfig, LibrarianConfig, LogFormat, load_farm_config};
use buildfarm_core::artifact::Librarian;
use buildfarm_core::notify::Notifier;
use buildfarm_db::{JobStore, MemoryJobStore, PgJobStore, create_pool, run_migrations};
use buildfarm_scheduler::{Admin, Farm, FarmManager, SchedulerSettings};
use buildfarm_transport::{
    FsLibrarian, HttpLibrarian, HttpTransportFactory, LogNotifier, TransportSettings,
    WebhookNotifier,
};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "buildfarm-manager")]
#[command(about = "Schedules and dispatches builds to the worker farm")]
#[command(version)]
struct Args {
    /// Farm configuration file
    #[arg(short, long, env = "BUILDFARM_CONFIG", default_value = "buildfarm.kdl")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_farm_config(&args.config)
        .with_context(|| format!("loading {}", args.config.display()))?;

    init_tracing(config.manager.log_format);

    let store = open_store(&config).await?;
    for worker in &config.workers {
        let worker = store.register_worker(worker.to_new_worker()).await?;
        info!(worker = %worker.name, virtualized = worker.virtualized, "Worker registered");
    }

    let librarian: Arc<dyn Librarian> = match &config.librarian {
        LibrarianConfig::Http { url } => Arc::new(HttpLibrarian::new(url.clone())),
        LibrarianConfig::Filesystem { path } => Arc::new(FsLibrarian::new(path.clone())),
    };
    let notifier: Arc<dyn Notifier> = match &config.notify.webhook {
        Some(url) => Arc::new(WebhookNotifier::new(url.clone())),
        None => Arc::new(LogNotifier),
    };

    let settings = SchedulerSettings::from_config(&config.manager);
    if settings.private_files.is_none() {
        warn!("No private file signing configured; private builds will not be dispatched");
    }
    let farm = Arc::new(Farm::new(store, librarian, notifier, settings));
    let transports = Arc::new(HttpTransportFactory::new(TransportSettings::from_config(
        &config.manager,
    )));

    let manager = FarmManager::new(farm.clone(), transports);
    let state = AppState::new(Admin::new(farm), manager.router());
    let manager = manager.start();

    let app = routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        );

    info!("Starting server on {}", config.api.listen);
    let listener = TcpListener::bind(&config.api.listen).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    manager.shutdown().await;
    info!("Farm manager stopped");
    Ok(())
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    match format {
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
    }
}

async fn open_store(config: &FarmConfig) -> anyhow::Result<Arc<dyn JobStore>> {
    match &config.database_url {
        Some(url) => {
            info!("Connecting to database...");
            let pool = create_pool(url).await?;
            run_migrations(&pool).await?;
            info!("Database connected");
            Ok(Arc::new(PgJobStore::new(pool)))
        }
        None => {
            warn!("No database configured; using in-memory job store");
            Ok(Arc::new(MemoryJobStore::new()))
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for shutdown signal");
    }
    info!("Shutdown requested");
}
