use std::sync::Arc;

use pokemon_daily::api::{self, AppState};
use pokemon_daily::config::Config;
use pokemon_daily::db::Database;
use pokemon_daily::metrics;
use pokemon_daily::scheduler::DailyScheduler;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = match Config::load() {
        Ok(config) => config,
        Err(e) => {
            tracing::error!("Invalid configuration: {e}");
            std::process::exit(2);
        }
    };
    tracing::info!(
        "Daily rotation at {} local time for {} game slots, ranges {:?}, {:?} sampling",
        config.fire_time.format("%H:%M"),
        config.game_slots,
        config.id_ranges,
        config.sampling
    );

    metrics::register_metrics();

    let db = Database::new(&config.database_url, config.store_timeout)
        .await
        .expect("Failed to initialize database");
    let db = Arc::new(db);
    tracing::info!("Connected to {}", config.database_url);

    let state = AppState::new(db, &config);

    if config.scheduler_disabled {
        tracing::warn!("Daily rotation scheduler disabled");
    } else {
        DailyScheduler::new(state.generator.clone(), config.fire_time).spawn();
    }

    let app = api::router(state);

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {addr}: {e}"));

    tracing::info!("Server initialized on port {}", config.port);
    axum::serve(listener, app)
        .await
        .expect("Failed to start server");
}
