use std::collections::HashMap;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;

use crate::models::{LeaderboardEntry, UserRecord};

pub(crate) const LEADERBOARD_KEY: &str = "leaderboard:global";

fn user_member(user_id: i64) -> String {
    format!("user:{user_id}")
}

fn user_cache_key(user_id: i64) -> String {
    format!("user:cache:{user_id}")
}

/// Authoritative live view of ratings: the global sorted set plus the user
/// attribute cache. Transport errors surface to callers; recovery is their
/// choice.
#[derive(Clone)]
pub(crate) struct RankStore {
    conn: MultiplexedConnection,
}

impl RankStore {
    pub(crate) fn new(conn: MultiplexedConnection) -> Self {
        Self { conn }
    }

    /// ZADD handles both insert and score update.
    pub(crate) async fn add_or_update(&self, user_id: i64, rating: i32) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zadd(LEADERBOARD_KEY, user_member(user_id), rating)
            .await
            .context("zadd leaderboard")?;
        Ok(())
    }

    /// Removes both the sorted-set member and the attribute cache entry.
    pub(crate) async fn remove(&self, user_id: i64) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .zrem(LEADERBOARD_KEY, user_member(user_id))
            .await
            .context("zrem leaderboard")?;
        let _: () = conn
            .del(user_cache_key(user_id))
            .await
            .context("del user cache")?;
        Ok(())
    }

    /// Tie-aware global rank: 1 + count of members with a strictly higher
    /// score. `None` means the user is not on the leaderboard. A concurrent
    /// update between the score read and the count can shift the result by
    /// one; rank is advisory on the hot path.
    pub(crate) async fn rank_of(&self, user_id: i64) -> Result<Option<i64>> {
        let mut conn = self.conn.clone();
        let score: Option<f64> = conn
            .zscore(LEADERBOARD_KEY, user_member(user_id))
            .await
            .context("zscore leaderboard")?;
        let Some(score) = score else {
            return Ok(None);
        };
        let higher: i64 = conn
            .zcount(LEADERBOARD_KEY, format!("({score}"), "+inf")
            .await
            .context("zcount leaderboard")?;
        Ok(Some(higher + 1))
    }

    /// Top N members in descending score order, with competition ranks
    /// assigned over the returned prefix. Usernames are hydrated by the
    /// caller.
    pub(crate) async fn top(&self, limit: i64) -> Result<Vec<LeaderboardEntry>> {
        if limit <= 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.conn.clone();
        let rows: Vec<(String, f64)> = conn
            .zrevrange_withscores(LEADERBOARD_KEY, 0, (limit - 1) as isize)
            .await
            .context("zrevrange leaderboard")?;
        Ok(assign_competition_ranks(&rows))
    }

    pub(crate) async fn size(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let size: i64 = conn.zcard(LEADERBOARD_KEY).await.context("zcard leaderboard")?;
        Ok(size)
    }

    /// Last-writer-wins attribute cache entry.
    pub(crate) async fn cache_user(&self, user: &UserRecord) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn
            .hset_multiple(
                user_cache_key(user.id),
                &[
                    ("id", user.id.to_string()),
                    ("username", user.username.clone()),
                    ("rating", user.rating.to_string()),
                ],
            )
            .await
            .context("hset user cache")?;
        Ok(())
    }

    /// `None` is an explicit miss; callers fall back to the cold store and
    /// populate on success.
    pub(crate) async fn cached_user(&self, user_id: i64) -> Result<Option<UserRecord>> {
        let mut conn = self.conn.clone();
        let fields: HashMap<String, String> = conn
            .hgetall(user_cache_key(user_id))
            .await
            .context("hgetall user cache")?;
        Ok(record_from_hash(user_id, &fields))
    }
}

/// Competition ("1224") ranking over a descending-score prefix: the first
/// member is rank 1; a member tied with its predecessor inherits that rank,
/// otherwise its rank is its zero-based index + 1.
pub(crate) fn assign_competition_ranks(rows: &[(String, f64)]) -> Vec<LeaderboardEntry> {
    let mut entries = Vec::with_capacity(rows.len());
    let mut current_rank = 1i64;
    let mut previous_score = 0f64;
    for (i, (member, score)) in rows.iter().enumerate() {
        if i > 0 && *score != previous_score {
            current_rank = i as i64 + 1;
        }
        previous_score = *score;
        let Some(user_id) = parse_member_id(member) else {
            continue;
        };
        entries.push(LeaderboardEntry {
            rank: current_rank,
            user_id,
            username: String::new(),
            rating: *score as i32,
        });
    }
    entries
}

fn parse_member_id(member: &str) -> Option<i64> {
    member.strip_prefix("user:")?.parse().ok()
}

fn record_from_hash(user_id: i64, fields: &HashMap<String, String>) -> Option<UserRecord> {
    if fields.is_empty() {
        return None;
    }
    let username = fields.get("username")?.clone();
    let rating = fields.get("rating")?.parse().ok()?;
    let id = fields
        .get("id")
        .and_then(|v| v.parse().ok())
        .unwrap_or(user_id);
    Some(UserRecord { id, username, rating })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rows(pairs: &[(i64, f64)]) -> Vec<(String, f64)> {
        pairs
            .iter()
            .map(|(id, score)| (format!("user:{id}"), *score))
            .collect()
    }

    #[test]
    fn distinct_scores_rank_sequentially() {
        let entries = assign_competition_ranks(&rows(&[(1, 5000.0), (2, 4950.0), (3, 4900.0)]));
        let got: Vec<(i64, i64)> = entries.iter().map(|e| (e.rank, e.user_id)).collect();
        assert_eq!(got, vec![(1, 1), (2, 2), (3, 3)]);
    }

    #[test]
    fn tied_members_share_the_minimum_rank() {
        let entries = assign_competition_ranks(&rows(&[(1, 5000.0), (2, 4900.0), (3, 4900.0)]));
        let got: Vec<(i64, i64, i32)> = entries
            .iter()
            .map(|e| (e.rank, e.user_id, e.rating))
            .collect();
        assert_eq!(got, vec![(1, 1, 5000), (2, 2, 4900), (2, 3, 4900)]);
    }

    #[test]
    fn rank_after_tie_group_skips_by_group_size() {
        let entries = assign_competition_ranks(&rows(&[
            (1, 5000.0),
            (2, 5000.0),
            (3, 5000.0),
            (4, 4800.0),
            (5, 4800.0),
            (6, 4700.0),
        ]));
        let got: Vec<i64> = entries.iter().map(|e| e.rank).collect();
        assert_eq!(got, vec![1, 1, 1, 4, 4, 6]);
    }

    #[test]
    fn empty_prefix_yields_no_entries() {
        assert!(assign_competition_ranks(&[]).is_empty());
    }

    // Walks the tie through an update sequence: B leaves the tie group, then
    // C clamps onto a new tie at the top.
    #[test]
    fn ordering_tracks_score_changes() {
        // A=5000, B=4900, C=4900.
        let before = assign_competition_ranks(&rows(&[(1, 5000.0), (2, 4900.0), (3, 4900.0)]));
        assert_eq!(before.iter().map(|e| e.rank).collect::<Vec<_>>(), vec![1, 2, 2]);

        // B -> 4950: the tie dissolves.
        let after_b = assign_competition_ranks(&rows(&[(1, 5000.0), (2, 4950.0), (3, 4900.0)]));
        let got: Vec<(i64, i64)> = after_b.iter().map(|e| (e.rank, e.user_id)).collect();
        assert_eq!(got, vec![(1, 1), (2, 2), (3, 3)]);

        // C -> 5000 (clamped): new tie group at rank 1, B drops to rank 3.
        let after_c = assign_competition_ranks(&rows(&[(1, 5000.0), (3, 5000.0), (2, 4950.0)]));
        let got: Vec<(i64, i64)> = after_c.iter().map(|e| (e.rank, e.user_id)).collect();
        assert_eq!(got, vec![(1, 1), (1, 3), (3, 2)]);
    }

    #[test]
    fn malformed_members_are_skipped_without_shifting_ranks() {
        let entries = assign_competition_ranks(&[
            ("user:1".to_string(), 5000.0),
            ("garbage".to_string(), 4900.0),
            ("user:3".to_string(), 4800.0),
        ]);
        let got: Vec<(i64, i64)> = entries.iter().map(|e| (e.rank, e.user_id)).collect();
        assert_eq!(got, vec![(1, 1), (3, 3)]);
    }

    #[test]
    fn cache_hash_round_trips_and_misses() {
        let mut fields = HashMap::new();
        assert!(record_from_hash(9, &fields).is_none());

        fields.insert("id".to_string(), "9".to_string());
        fields.insert("username".to_string(), "ninja_elite_9".to_string());
        fields.insert("rating".to_string(), "3100".to_string());
        let record = record_from_hash(9, &fields).unwrap();
        assert_eq!(record.id, 9);
        assert_eq!(record.username, "ninja_elite_9");
        assert_eq!(record.rating, 3100);

        fields.remove("rating");
        assert!(record_from_hash(9, &fields).is_none());
    }

    // Requires a local Redis (REDIS_URL, default redis://127.0.0.1:6379/15).
    // Run with: cargo test -- --ignored
    #[tokio::test]
    #[ignore]
    async fn rank_store_live_tie_ordering() {
        let url = std::env::var("REDIS_URL")
            .unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string());
        let client = redis::Client::open(url).unwrap();
        let conn = client.get_multiplexed_async_connection().await.unwrap();
        let store = RankStore::new(conn.clone());

        for id in [1i64, 2, 3] {
            store.remove(id).await.unwrap();
        }
        store.add_or_update(1, 5000).await.unwrap();
        store.add_or_update(2, 4900).await.unwrap();
        store.add_or_update(3, 4900).await.unwrap();

        let top = store.top(10).await.unwrap();
        let got: Vec<(i64, i64, i32)> =
            top.iter().map(|e| (e.rank, e.user_id, e.rating)).collect();
        assert_eq!(got, vec![(1, 1, 5000), (2, 2, 4900), (2, 3, 4900)]);
        assert_eq!(store.rank_of(3).await.unwrap(), Some(2));

        store.add_or_update(2, 4950).await.unwrap();
        assert_eq!(store.rank_of(2).await.unwrap(), Some(2));
        assert_eq!(store.rank_of(3).await.unwrap(), Some(3));

        store.remove(2).await.unwrap();
        assert_eq!(store.rank_of(2).await.unwrap(), None);
        assert!(store.cached_user(2).await.unwrap().is_none());
    }
}
