// Prometheus metrics definitions for the daily pokémon service.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts,
    Registry, TextEncoder,
};

lazy_static! {
    pub static ref REGISTRY: Registry = Registry::new();

    // ── Gauges ───────────────────────────────────────────────────────

    /// Seconds the scheduler is sleeping before the next rotation, as of the last re-arm.
    pub static ref SECONDS_UNTIL_ROTATION: IntGauge = IntGauge::new(
        "pokemon_daily_seconds_until_rotation",
        "Seconds until the next scheduled rotation"
    )
    .unwrap();

    // ── Counters ─────────────────────────────────────────────────────

    /// Scheduled rotations that have fired.
    pub static ref ROTATIONS_FIRED_TOTAL: IntCounter = IntCounter::new(
        "pokemon_daily_rotations_fired_total",
        "Scheduled daily rotations fired",
    )
    .unwrap();

    /// Daily picks persisted, by game slot.
    pub static ref DAILY_PICKS_CREATED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokemon_daily_picks_created_total", "Daily picks persisted"),
        &["game_id"],
    )
    .unwrap();

    /// Daily picks that failed to sample or persist, by game slot.
    pub static ref DAILY_PICKS_FAILED_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokemon_daily_picks_failed_total", "Daily picks that failed"),
        &["game_id"],
    )
    .unwrap();

    /// Total API requests, by method/endpoint/status.
    pub static ref API_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("pokemon_daily_api_requests_total", "Total API requests"),
        &["method", "endpoint", "status"],
    )
    .unwrap();

    // ── Histograms ───────────────────────────────────────────────────

    /// Time to generate a full batch of picks.
    pub static ref PICK_BATCH_DURATION_SECONDS: Histogram = Histogram::with_opts(
        HistogramOpts::new(
            "pokemon_daily_pick_batch_duration_seconds",
            "Time to generate picks for every game slot",
        )
        .buckets(vec![0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0]),
    )
    .unwrap();

    /// API request duration in seconds, by endpoint.
    pub static ref API_REQUEST_DURATION_SECONDS: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "pokemon_daily_api_request_duration_seconds",
            "API request duration in seconds",
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 5.0]),
        &["endpoint"],
    )
    .unwrap();
}

/// Register all metrics with the custom registry. Call once at startup.
pub fn register_metrics() {
    let collectors: Vec<Box<dyn prometheus::core::Collector>> = vec![
        Box::new(SECONDS_UNTIL_ROTATION.clone()),
        Box::new(ROTATIONS_FIRED_TOTAL.clone()),
        Box::new(DAILY_PICKS_CREATED_TOTAL.clone()),
        Box::new(DAILY_PICKS_FAILED_TOTAL.clone()),
        Box::new(API_REQUESTS_TOTAL.clone()),
        Box::new(PICK_BATCH_DURATION_SECONDS.clone()),
        Box::new(API_REQUEST_DURATION_SECONDS.clone()),
    ];

    for c in collectors {
        // Already registered (tests building several routers).
        if let Err(e) = REGISTRY.register(c) {
            tracing::debug!("metric registration skipped: {e}");
        }
    }
}

/// Serialize all registered metrics to the Prometheus text exposition format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode metrics: {e}");
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

/// Endpoint label for requests that matched no route.
pub const UNMATCHED_ENDPOINT: &str = "unmatched";

/// Metric label for a request: the route template it matched (e.g.
/// `/pokemons/name/{name}`), never the raw path, so the series count stays
/// bounded by the number of routes.
pub fn endpoint_label(matched_route: Option<&str>) -> String {
    matched_route.unwrap_or(UNMATCHED_ENDPOINT).to_string()
}
