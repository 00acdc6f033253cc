use std::sync::atomic::Ordering;

use axum::http::StatusCode;
use chrono::Utc;

use crate::db_sync;
use crate::error::ApiError;
use crate::models::{
    clamp_rating, LeaderboardEntry, ScoreUpdatePayload, SearchResult, SyncQueueItem, UserRecord,
};
use crate::pubsub;
use crate::state::AppState;
use crate::store;

/// The score-update hot path. The rank store write is the commit point:
/// everything after it (cache refresh, publish, enqueue) is best-effort and
/// never fails the request.
pub(crate) async fn update_user_score(
    state: &AppState,
    user_id: i64,
    requested_rating: i32,
) -> Result<ScoreUpdatePayload, ApiError> {
    state.perf.updates_received.fetch_add(1, Ordering::Relaxed);
    let new_rating = clamp_rating(requested_rating);

    let cached = match state.rank.cached_user(user_id).await {
        Ok(v) => v,
        Err(e) => {
            eprintln!("[update] cache_read_failed user_id={user_id} error={e:#}");
            None
        }
    };
    let mut user = match cached {
        Some(user) => user,
        None => {
            let Some(user) = store::get_user(&state.db, user_id).await? else {
                return Err(ApiError::new(StatusCode::NOT_FOUND, "User not found"));
            };
            if let Err(e) = state.rank.cache_user(&user).await {
                eprintln!("[update] cache_populate_failed user_id={user_id} error={e:#}");
            }
            user
        }
    };

    let old_rating = user.rating;
    // Absent from the leaderboard means rank 0 in the emitted event.
    let old_rank = match state.rank.rank_of(user_id).await {
        Ok(Some(rank)) => rank,
        Ok(None) => 0,
        Err(e) => {
            eprintln!("[update] old_rank_failed user_id={user_id} error={e:#}");
            0
        }
    };

    // The one write that must land before the request can succeed.
    if let Err(e) = state.rank.add_or_update(user_id, new_rating).await {
        eprintln!("[update] rank_write_failed user_id={user_id} error={e:#}");
        return Err(ApiError::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "rank store unavailable",
        ));
    }

    user.rating = new_rating;
    if let Err(e) = state.rank.cache_user(&user).await {
        eprintln!("[update] cache_refresh_failed user_id={user_id} error={e:#}");
    }

    let new_rank = match state.rank.rank_of(user_id).await {
        Ok(Some(rank)) => rank,
        Ok(None) => 0,
        Err(e) => {
            eprintln!("[update] new_rank_failed user_id={user_id} error={e:#}");
            0
        }
    };

    let payload = build_payload(&user, old_rating, old_rank, new_rank, Utc::now().timestamp());

    if let Err(e) = pubsub::publish_score_update(&state.redis, &payload).await {
        state.perf.publish_failures.fetch_add(1, Ordering::Relaxed);
        eprintln!("[update] publish_failed user_id={user_id} error={e:#}");
    }

    let item = SyncQueueItem {
        user_id,
        old_rating,
        new_rating,
        timestamp: Utc::now(),
    };
    if let Err(e) = db_sync::enqueue_update(&state.redis, &item).await {
        state.perf.enqueue_failures.fetch_add(1, Ordering::Relaxed);
        eprintln!("[update] enqueue_failed user_id={user_id} error={e:#}");
    }

    state.perf.updates_applied.fetch_add(1, Ordering::Relaxed);
    Ok(payload)
}

pub(crate) fn build_payload(
    user: &UserRecord,
    old_rating: i32,
    old_rank: i64,
    new_rank: i64,
    timestamp: i64,
) -> ScoreUpdatePayload {
    ScoreUpdatePayload {
        user_id: user.id,
        username: user.username.clone(),
        old_rating,
        new_rating: user.rating,
        rating_delta: user.rating - old_rating,
        old_rank,
        new_rank,
        // Positive = moved up the board (#100 -> #50 is +50).
        rank_delta: old_rank - new_rank,
        timestamp,
    }
}

pub(crate) async fn get_leaderboard(
    state: &AppState,
    limit: i64,
) -> Result<Vec<LeaderboardEntry>, ApiError> {
    let mut entries = state.rank.top(limit).await.map_err(|e| {
        eprintln!("[read] leaderboard_failed error={e:#}");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch leaderboard")
    })?;

    for entry in &mut entries {
        match hydrate_username(state, entry.user_id).await {
            // Hydration failures keep the entry with an empty username;
            // ranking order is preserved either way.
            Some(username) => entry.username = username,
            None => eprintln!("[read] hydrate_failed user_id={}", entry.user_id),
        }
    }
    Ok(entries)
}

async fn hydrate_username(state: &AppState, user_id: i64) -> Option<String> {
    match state.rank.cached_user(user_id).await {
        Ok(Some(user)) => return Some(user.username),
        Ok(None) => {}
        Err(e) => eprintln!("[read] cache_read_failed user_id={user_id} error={e:#}"),
    }
    match store::get_user(&state.db, user_id).await {
        Ok(Some(user)) => {
            if let Err(e) = state.rank.cache_user(&user).await {
                eprintln!("[read] cache_populate_failed user_id={user_id} error={e:#}");
            }
            Some(user.username)
        }
        Ok(None) => None,
        Err(e) => {
            eprintln!("[read] user_lookup_failed user_id={user_id} error={e:#}");
            None
        }
    }
}

pub(crate) async fn get_user_rank(
    state: &AppState,
    user_id: i64,
) -> Result<Option<i64>, ApiError> {
    state.rank.rank_of(user_id).await.map_err(|e| {
        eprintln!("[read] rank_failed user_id={user_id} error={e:#}");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch rank")
    })
}

/// Annotates cold-store username matches with live ranks. Candidates whose
/// rank cannot be determined are dropped.
pub(crate) async fn search_users(
    state: &AppState,
    query: &str,
    limit: i64,
) -> Result<Vec<SearchResult>, ApiError> {
    let users = store::search_by_username(&state.db, query, limit).await.map_err(|e| {
        eprintln!("[search] query_failed error={e:#}");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Search failed")
    })?;

    let mut results = Vec::with_capacity(users.len());
    for user in users {
        match state.rank.rank_of(user.id).await {
            Ok(Some(rank)) => results.push(SearchResult {
                global_rank: rank,
                user_id: user.id,
                username: user.username,
                rating: user.rating,
            }),
            Ok(None) => {}
            Err(e) => eprintln!("[search] rank_lookup_failed user_id={} error={e:#}", user.id),
        }
    }
    sort_results(&mut results);
    Ok(results)
}

/// Rating descending; user_id ascending keeps tie order deterministic.
pub(crate) fn sort_results(results: &mut [SearchResult]) {
    results.sort_by(|a, b| b.rating.cmp(&a.rating).then(a.user_id.cmp(&b.user_id)));
}

pub(crate) async fn leaderboard_stats(state: &AppState) -> Result<serde_json::Value, ApiError> {
    let total_users = store::count_users(&state.db).await?;
    let leaderboard_size = state.rank.size().await.map_err(|e| {
        eprintln!("[read] stats_failed error={e:#}");
        ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, "Failed to fetch stats")
    })?;
    Ok(serde_json::json!({
        "total_users": total_users,
        "leaderboard_size": leaderboard_size,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: i64, rating: i32) -> UserRecord {
        UserRecord {
            id,
            username: format!("user_{id}"),
            rating,
        }
    }

    #[test]
    fn payload_deltas_are_consistent() {
        let payload = build_payload(&user(3, 5000), 4900, 3, 1, 1_700_000_000);
        assert_eq!(payload.rating_delta, payload.new_rating - payload.old_rating);
        assert_eq!(payload.rating_delta, 100);
        assert_eq!(payload.rank_delta, payload.old_rank - payload.new_rank);
        assert_eq!(payload.rank_delta, 2);
    }

    #[test]
    fn payload_for_first_appearance_reports_zero_old_rank() {
        let payload = build_payload(&user(8, 1500), 1500, 0, 42, 1_700_000_000);
        assert_eq!(payload.old_rank, 0);
        assert_eq!(payload.rating_delta, 0);
        assert_eq!(payload.rank_delta, -42);
    }

    #[test]
    fn search_results_sort_by_rating_then_user_id() {
        let mut results = vec![
            SearchResult { global_rank: 5, user_id: 9, username: "c".into(), rating: 3000 },
            SearchResult { global_rank: 1, user_id: 4, username: "a".into(), rating: 4800 },
            SearchResult { global_rank: 5, user_id: 2, username: "b".into(), rating: 3000 },
        ];
        sort_results(&mut results);
        let got: Vec<(i32, i64)> = results.iter().map(|r| (r.rating, r.user_id)).collect();
        assert_eq!(got, vec![(4800, 4), (3000, 2), (3000, 9)]);
    }
}
