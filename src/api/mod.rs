// HTTP API routes (species lookups, daily picks, health and metrics).

use std::sync::Arc;
use std::time::Instant;

use axum::{
    body::Body,
    extract::{Json, MatchedPath, Path, State},
    http::{Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use serde_json::{json, Value};
use tower_http::cors::CorsLayer;

use crate::config::Config;
use crate::db::{Database, NameMatch, Species};
use crate::metrics;
use crate::picks::{PickGenerator, PickQuery};
use crate::sampler::Sampler;

// ── Shared application state ─────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub generator: Arc<PickGenerator>,
    pub query: PickQuery,
    pub name_match: NameMatch,
}

impl AppState {
    /// Wire the sampler, generator and query service over one store handle.
    pub fn new(db: Arc<Database>, config: &Config) -> Self {
        let sampler = Arc::new(Sampler::new(
            db.clone(),
            config.id_ranges.clone(),
            config.sampling,
        ));
        Self {
            generator: Arc::new(PickGenerator::new(db.clone(), sampler, config.game_slots)),
            query: PickQuery::new(db.clone()),
            name_match: config.name_match,
            db,
        }
    }
}

// ── Error helper ──────────────────────────────────────────────────────

fn json_error(status: StatusCode, msg: &str) -> Response {
    (status, Json(json!({ "error": msg }))).into_response()
}

fn parse_id(raw: &str, what: &str) -> Result<i64, Response> {
    raw.parse::<i64>()
        .map_err(|_| json_error(StatusCode::BAD_REQUEST, &format!("{what} must be a number")))
}

fn payloads(species: Vec<Species>) -> Vec<Value> {
    species.into_iter().map(|s| s.data).collect()
}

// ── Router ────────────────────────────────────────────────────────────

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(liveness))
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_handler))
        // Species
        .route("/pokemons", get(list_pokemons))
        .route("/pokemons/{id}", get(get_pokemon))
        .route("/pokemons/{id}/evolution", get(get_evolution_chain))
        .route("/pokemons/name/{name}", get(get_pokemons_by_name))
        // Daily picks
        .route("/pokemons/daily/add", post(add_daily_pokemons))
        .route("/pokemons/daily/{game_id}/latest", get(latest_daily_pokemon))
        .route(
            "/pokemons/daily/{game_id}/yesterday",
            get(previous_daily_pokemon),
        )
        .with_state(state)
        .layer(middleware::from_fn(track_requests))
        .layer(CorsLayer::permissive())
}

async fn track_requests(req: Request<Body>, next: Next) -> Response {
    let method = req.method().to_string();
    let endpoint = metrics::endpoint_label(
        req.extensions()
            .get::<MatchedPath>()
            .map(MatchedPath::as_str),
    );
    let started = Instant::now();

    let response = next.run(req).await;

    metrics::API_REQUESTS_TOTAL
        .with_label_values(&[
            method.as_str(),
            endpoint.as_str(),
            response.status().as_str(),
        ])
        .inc();
    metrics::API_REQUEST_DURATION_SECONDS
        .with_label_values(&[endpoint.as_str()])
        .observe(started.elapsed().as_secs_f64());
    response
}

// ── Service handlers ──────────────────────────────────────────────────

async fn liveness() -> impl IntoResponse {
    tracing::debug!("Liveness probe");
    (StatusCode::OK, "OK")
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok", "service": "pokemon-daily" }))
}

async fn metrics_handler() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        metrics::gather_metrics(),
    )
}

// ── Species handlers ──────────────────────────────────────────────────

async fn list_pokemons(State(state): State<AppState>) -> Response {
    match state.db.list_species().await {
        Ok(species) => (StatusCode::OK, Json(payloads(species))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_pokemon(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "ID") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.db.get_species(id).await {
        Ok(Some(species)) => (StatusCode::OK, Json(species.data)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Pokémon not found"),
        Err(e) => e.into_response(),
    }
}

async fn get_pokemons_by_name(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> Response {
    if name.chars().count() < 2 {
        return json_error(
            StatusCode::BAD_REQUEST,
            "Search must contain at least 2 letters",
        );
    }
    match state.db.find_species_by_name(&name, state.name_match).await {
        Ok(species) if species.is_empty() => {
            json_error(StatusCode::NOT_FOUND, "No pokémons found with that name")
        }
        Ok(species) => (StatusCode::OK, Json(payloads(species))).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn get_evolution_chain(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    let id = match parse_id(&id, "ID") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    let chain_id = match state.db.get_species(id).await {
        Ok(Some(Species {
            evolution_chain_id: Some(chain_id),
            ..
        })) => chain_id,
        Ok(Some(_)) => {
            return json_error(StatusCode::NOT_FOUND, "Pokémon has no evolution chain")
        }
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Pokémon not found"),
        Err(e) => return e.into_response(),
    };
    match state.db.get_evolution_chain(chain_id).await {
        Ok(Some(chain)) => (StatusCode::OK, Json(chain)).into_response(),
        Ok(None) => json_error(StatusCode::NOT_FOUND, "Evolution chain not found"),
        Err(e) => e.into_response(),
    }
}

// ── Daily pick handlers ───────────────────────────────────────────────

async fn latest_daily_pokemon(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Response {
    let game_id = match parse_id(&game_id, "game_id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.query.latest(game_id).await {
        Ok(pick) => (StatusCode::OK, Json(pick)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn previous_daily_pokemon(
    State(state): State<AppState>,
    Path(game_id): Path<String>,
) -> Response {
    let game_id = match parse_id(&game_id, "game_id") {
        Ok(id) => id,
        Err(resp) => return resp,
    };
    match state.query.previous(game_id).await {
        Ok(pick) => (StatusCode::OK, Json(pick)).into_response(),
        Err(e) => e.into_response(),
    }
}

/// Manual rotation. Partial success is still a 200; the per-slot outcomes
/// let callers see which slots failed. Only a batch where every slot failed
/// is reported as a server error.
async fn add_daily_pokemons(State(state): State<AppState>) -> Response {
    let outcomes = state.generator.generate_all().await;
    let created = outcomes.iter().filter(|o| o.is_created()).count();
    let failed = outcomes.len() - created;

    let (status, message) = if created == 0 && failed > 0 {
        tracing::error!("Manual daily rotation failed for all {failed} slots");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Error obtaining random pokémon for all {failed} slots"),
        )
    } else if failed > 0 {
        (
            StatusCode::OK,
            format!("{created} of {} daily Pokémon added, {failed} failed", outcomes.len()),
        )
    } else {
        (
            StatusCode::OK,
            format!("{created} new daily Pokémon added successfully"),
        )
    };

    (
        status,
        Json(json!({
            "message": message,
            "created": created,
            "failed": failed,
            "outcomes": outcomes,
        })),
    )
        .into_response()
}
