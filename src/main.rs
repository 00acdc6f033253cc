use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{Path, Query, State};
use axum::http::{HeaderValue, Method, StatusCode};
use axum::routing::{get, put};
use axum::{Json, Router};
use chrono::Utc;
use http::header::{ACCEPT, CONTENT_TYPE};
use serde::Deserialize;
use sqlx::postgres::PgPoolOptions;
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};

mod config;
mod db_sync;
mod error;
mod models;
mod pubsub;
mod rank;
mod service;
mod state;
mod store;
mod tasks;
mod ws;

use crate::config::load_config;
use crate::error::ApiError;
use crate::models::{MAX_RATING, MIN_RATING};
use crate::rank::RankStore;
use crate::state::{AppState, PerfCounters};

const DEFAULT_LEADERBOARD_LIMIT: i64 = 100;
const MAX_LEADERBOARD_LIMIT: i64 = 1000;
const MAX_SEARCH_LIMIT: i64 = 200;
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Deserialize)]
struct LeaderboardQuery {
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SearchQuery {
    q: Option<String>,
    limit: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ScoreUpdateRequest {
    new_rating: i32,
}

// Bad or missing limits fall back to the default rather than erroring.
fn parse_limit(raw: Option<&str>, default: i64, max: i64) -> i64 {
    raw.and_then(|v| v.parse::<i64>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(default)
        .min(max)
}

// ===== HTTP handlers =====

async fn health_check() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "healthy",
        "time": Utc::now().to_rfc3339(),
    }))
}

async fn get_leaderboard(
    State(state): State<AppState>,
    Query(q): Query<LeaderboardQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let limit = parse_limit(q.limit.as_deref(), DEFAULT_LEADERBOARD_LIMIT, MAX_LEADERBOARD_LIMIT);
    let entries = service::get_leaderboard(&state, limit).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "count": entries.len(),
        "data": entries,
    })))
}

async fn get_user_rank(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
) -> Result<Json<serde_json::Value>, ApiError> {
    match service::get_user_rank(&state, user_id).await? {
        Some(rank) => Ok(Json(serde_json::json!({
            "success": true,
            "user_id": user_id,
            "rank": rank,
        }))),
        None => Err(ApiError::new(
            StatusCode::NOT_FOUND,
            "User not found in leaderboard",
        )),
    }
}

async fn update_user_score(
    State(state): State<AppState>,
    Path(user_id): Path<i64>,
    Json(req): Json<ScoreUpdateRequest>,
) -> Result<Json<serde_json::Value>, ApiError> {
    if req.new_rating < MIN_RATING || req.new_rating > MAX_RATING {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            format!("new_rating must be between {MIN_RATING} and {MAX_RATING}"),
        ));
    }
    let payload = service::update_user_score(&state, user_id, req.new_rating).await?;
    let mut body = serde_json::to_value(&payload)
        .map_err(|e| ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, format!("serialize error: {e}")))?;
    if let Some(map) = body.as_object_mut() {
        map.insert("success".to_string(), serde_json::Value::Bool(true));
    }
    Ok(Json(body))
}

async fn get_leaderboard_stats(
    State(state): State<AppState>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let stats = service::leaderboard_stats(&state).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "data": stats,
    })))
}

async fn search_users(
    State(state): State<AppState>,
    Query(q): Query<SearchQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    let query = q.q.as_deref().unwrap_or("").trim().to_string();
    if query.is_empty() {
        return Err(ApiError::new(
            StatusCode::BAD_REQUEST,
            "Search query 'q' is required",
        ));
    }
    let limit = parse_limit(
        q.limit.as_deref(),
        state.cfg.app.max_search_results,
        MAX_SEARCH_LIMIT,
    );
    let results = service::search_users(&state, &query, limit).await?;
    Ok(Json(serde_json::json!({
        "success": true,
        "query": query,
        "count": results.len(),
        "data": results,
    })))
}

async fn get_ws_stats(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "success": true,
        "connected_clients": state.hub.client_count(),
    }))
}

#[tokio::main]
async fn main() -> Result<()> {
    let cfg = Arc::new(load_config()?);

    let db = PgPoolOptions::new()
        .min_connections(cfg.database.min_pool_size)
        .max_connections(cfg.database.max_pool_size)
        .acquire_timeout(Duration::from_secs(cfg.database.acquire_timeout_seconds))
        .max_lifetime(Duration::from_secs(cfg.database.max_lifetime_seconds))
        .connect(&cfg.database.url)
        .await
        .context("failed to connect to postgres")?;

    let redis_client =
        redis::Client::open(cfg.redis.url()).context("invalid redis configuration")?;
    let redis = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("failed to connect to redis")?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let perf = Arc::new(PerfCounters::new());
    let hub = ws::spawn_hub(perf.clone(), shutdown_rx.clone());

    let state = AppState {
        cfg: cfg.clone(),
        db,
        redis: redis.clone(),
        redis_client,
        rank: RankStore::new(redis),
        hub,
        perf,
        shutdown: shutdown_rx.clone(),
    };

    db_sync::init_stream(&state.redis)
        .await
        .context("failed to initialize score update stream")?;

    let worker_handles = tasks::start_background_tasks(state.clone(), shutdown_rx);

    let allowed_methods = [Method::GET, Method::PUT, Method::OPTIONS];
    let allowed_headers = [CONTENT_TYPE, ACCEPT];
    let cors = if cfg.api.cors_origins.iter().any(|o| o == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    } else {
        let origins: Vec<HeaderValue> = cfg
            .api
            .cors_origins
            .iter()
            .filter_map(|origin| HeaderValue::from_str(origin).ok())
            .collect();
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(allowed_methods)
            .allow_headers(allowed_headers)
    };

    let app = Router::new()
        .route("/health", get(health_check))
        .route("/leaderboard", get(get_leaderboard))
        .route("/leaderboard/stats", get(get_leaderboard_stats))
        .route("/leaderboard/user/{user_id}/rank", get(get_user_rank))
        .route("/leaderboard/user/{user_id}/score", put(update_user_score))
        .route("/search", get(search_users))
        .route("/ws/stats", get(get_ws_stats))
        .route("/ws", get(ws::ws_handler))
        .layer(cors)
        .with_state(state);

    let addr: SocketAddr = format!("{}:{}", cfg.api.host, cfg.api.port)
        .parse()
        .context("invalid listen address")?;
    println!("Leaderboard API listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind listen address")?;
    // Workers, the hub and open sockets must see the signal while the server
    // is still draining connections, or upgraded sockets would never close.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            eprintln!("[shutdown] signal_received");
            let _ = shutdown_tx.send(true);
        })
        .await
        .context("server error")?;

    // Let the write-behind queue drain before exiting.
    eprintln!("[shutdown] draining_workers");
    for handle in worker_handles {
        if tokio::time::timeout(SHUTDOWN_GRACE, handle).await.is_err() {
            eprintln!("[shutdown] worker_drain_timed_out");
        }
    }
    eprintln!("[shutdown] complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limits_fall_back_and_cap() {
        assert_eq!(parse_limit(None, 100, 1000), 100);
        assert_eq!(parse_limit(Some("50"), 100, 1000), 50);
        assert_eq!(parse_limit(Some("junk"), 100, 1000), 100);
        assert_eq!(parse_limit(Some("0"), 100, 1000), 100);
        assert_eq!(parse_limit(Some("-5"), 100, 1000), 100);
        assert_eq!(parse_limit(Some("5000"), 100, 1000), 1000);
        assert_eq!(parse_limit(Some("250"), 100, 200), 200);
    }
}
