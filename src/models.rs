use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub(crate) const MIN_RATING: i32 = 100;
pub(crate) const MAX_RATING: i32 = 5000;

// Ratings outside [MIN_RATING, MAX_RATING] are clamped on every ingress path.
pub(crate) fn clamp_rating(rating: i32) -> i32 {
    rating.clamp(MIN_RATING, MAX_RATING)
}

/// Cached user attributes, mirrored between the Redis hash and the users table.
#[derive(Debug, Clone, Serialize)]
pub(crate) struct UserRecord {
    pub(crate) id: i64,
    pub(crate) username: String,
    pub(crate) rating: i32,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct LeaderboardEntry {
    pub(crate) rank: i64,
    pub(crate) user_id: i64,
    pub(crate) username: String,
    pub(crate) rating: i32,
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct SearchResult {
    pub(crate) global_rank: i64,
    pub(crate) user_id: i64,
    pub(crate) username: String,
    pub(crate) rating: i32,
}

/// Score-update event fanned out to every instance and its WebSocket clients.
/// `rank_delta` is positive when the user moved up the board; both ranks are
/// point-in-time observations, so the delta is advisory under concurrency.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct ScoreUpdatePayload {
    pub(crate) user_id: i64,
    pub(crate) username: String,
    pub(crate) old_rating: i32,
    pub(crate) new_rating: i32,
    pub(crate) rating_delta: i32,
    pub(crate) old_rank: i64,
    pub(crate) new_rank: i64,
    pub(crate) rank_delta: i64,
    pub(crate) timestamp: i64,
}

/// Write-behind queue item carried through the score-update stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct SyncQueueItem {
    pub(crate) user_id: i64,
    pub(crate) old_rating: i32,
    pub(crate) new_rating: i32,
    pub(crate) timestamp: DateTime<Utc>,
}

/// One WebSocket frame: exactly one envelope, never concatenated events.
#[derive(Debug, Serialize)]
pub(crate) struct WsMessage<T: Serialize> {
    #[serde(rename = "type")]
    pub(crate) kind: &'static str,
    pub(crate) payload: T,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ratings_clamp_to_bounds() {
        assert_eq!(clamp_rating(99), 100);
        assert_eq!(clamp_rating(-50), 100);
        assert_eq!(clamp_rating(5001), 5000);
        assert_eq!(clamp_rating(100), 100);
        assert_eq!(clamp_rating(5000), 5000);
        assert_eq!(clamp_rating(2500), 2500);
    }

    #[test]
    fn score_update_payload_round_trips_over_the_wire() {
        let payload = ScoreUpdatePayload {
            user_id: 42,
            username: "storm_warrior_42".to_string(),
            old_rating: 3000,
            new_rating: 2900,
            rating_delta: -100,
            old_rank: 17,
            new_rank: 25,
            rank_delta: -8,
            timestamp: 1_700_000_000,
        };
        let wire = serde_json::to_string(&payload).unwrap();
        let decoded: ScoreUpdatePayload = serde_json::from_str(&wire).unwrap();
        assert_eq!(decoded.user_id, payload.user_id);
        assert_eq!(decoded.username, payload.username);
        assert_eq!(decoded.rating_delta, -100);
        assert_eq!(decoded.rank_delta, -8);
        assert_eq!(decoded.new_rank, 25);
    }

    #[test]
    fn ws_frame_envelope_shape() {
        let payload = ScoreUpdatePayload {
            user_id: 7,
            username: "shadow_king_7".to_string(),
            old_rating: 4900,
            new_rating: 4950,
            rating_delta: 50,
            old_rank: 2,
            new_rank: 2,
            rank_delta: 0,
            timestamp: 1_700_000_000,
        };
        let frame = serde_json::to_value(WsMessage { kind: "score_update", payload }).unwrap();
        assert_eq!(frame["type"], "score_update");
        assert_eq!(frame["payload"]["user_id"], 7);
        assert_eq!(frame["payload"]["rating_delta"], 50);
        assert_eq!(frame["payload"]["rank_delta"], 0);
    }
}
