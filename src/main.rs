mod broadcaster;
mod cache;
mod clients;
mod config;
mod coordinator;
mod db;
mod detector;
mod errors;
mod mapper;
mod margin;
mod scheduler;
mod settings;
mod types;
mod writequeue;

use axum::{routing::get, Router};
use broadcaster::Broadcaster;
use cache::Cache;
use clients::competitor_a::CompetitorAClient;
use clients::competitor_b::CompetitorBClient;
use clients::primary::PrimaryBookClient;
use clients::BookClient;
use config::Config;
use coordinator::Coordinator;
use scheduler::Scheduler;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};
use types::BookSlug;
use writequeue::WriteQueue;

/// How far back a kickoff may be and still count as "in the serving
/// window" for cache warmup.
const WARMUP_GRACE: chrono::Duration = chrono::Duration::hours(6);

const PROGRESS_CHANNEL_CAPACITY: usize = 4096;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();
    dotenvy::dotenv().ok();

    info!("starting odds sentinel");

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!(error = %e, "startup failed: bad configuration");
            return ExitCode::from(1);
        }
    };

    let pool = match db::connect(&config.database_url).await {
        Ok(p) => p,
        Err(e) => {
            error!(error = %e, "startup failed: cannot reach database");
            return ExitCode::from(1);
        }
    };
    info!("connected to postgres");

    let cache = Arc::new(Cache::new(pool.clone()));
    if let Err(e) = cache.warmup(WARMUP_GRACE).await {
        error!(error = %e, "startup failed: cache warmup");
        return ExitCode::from(1);
    }
    info!(events = cache.event_count(), "cache warmup complete");

    let known_events = match db::events::known_shared_keys(&pool).await {
        Ok(m) => m,
        Err(e) => {
            error!(error = %e, "startup failed: cannot load known events");
            return ExitCode::from(1);
        }
    };

    let initial_settings = settings::load_settings(&pool).await.unwrap_or_default();

    let (progress_tx, _progress_rx) = broadcast::channel(PROGRESS_CHANNEL_CAPACITY);

    let (write_queue, _write_queue_handle) = WriteQueue::spawn(pool.clone(), cache.clone(), progress_tx.clone());
    let write_queue = Arc::new(write_queue);

    let clients = build_clients(&config);
    let cycle_running = Arc::new(AtomicBool::new(false));

    let coordinator = Arc::new(Coordinator::new(
        pool.clone(),
        cache.clone(),
        write_queue,
        clients,
        progress_tx.clone(),
        known_events,
        cycle_running.clone(),
    ));

    let scheduler = Arc::new(Scheduler::new(coordinator, pool.clone(), cycle_running, initial_settings.scrape_interval_secs));
    scheduler.start();

    let broadcaster = Arc::new(Broadcaster::new(progress_tx));
    let app = Router::new()
        .route("/health", get(health_check))
        .route("/ws", get(broadcaster::ws_handler))
        .with_state(broadcaster);

    let addr = SocketAddr::from(([0, 0, 0, 0], config.server_port));
    let listener = match tokio::net::TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            error!(error = %e, %addr, "startup failed: cannot bind server address");
            return ExitCode::from(1);
        }
    };
    info!(%addr, "server ready");

    let shutdown = async {
        let _ = tokio::signal::ctrl_c().await;
        info!("shutdown signal received");
    };

    if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(shutdown).await {
        error!(error = %e, "server exited with error");
        return ExitCode::from(2);
    }

    ExitCode::from(0)
}

async fn health_check() -> &'static str {
    "OK"
}

fn build_clients(config: &Config) -> HashMap<BookSlug, Arc<dyn BookClient>> {
    let mut clients: HashMap<BookSlug, Arc<dyn BookClient>> = HashMap::new();

    clients.insert(
        BookSlug::Primary,
        Arc::new(PrimaryBookClient::new(
            config.primary_base_url.clone(),
            config.primary_api_key.clone(),
            config.primary_max_in_flight,
            config.request_timeout,
            config.retry_max_attempts,
        )),
    );
    clients.insert(
        BookSlug::CompetitorA,
        Arc::new(CompetitorAClient::new(
            config.competitor_a_base_url.clone(),
            config.competitor_a_api_key.clone(),
            config.competitor_a_max_in_flight,
            config.request_timeout,
            config.retry_max_attempts,
        )),
    );
    clients.insert(
        BookSlug::CompetitorB,
        Arc::new(CompetitorBClient::new(
            config.competitor_b_base_url.clone(),
            config.competitor_b_api_key.clone(),
            config.competitor_b_max_in_flight,
            config.competitor_b_min_spacing,
            config.request_timeout,
            config.retry_max_attempts,
        )),
    );

    clients
}
