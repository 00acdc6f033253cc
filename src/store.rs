use anyhow::{Context, Result};
use sqlx::{Pool, Postgres, Row};

use crate::models::UserRecord;

pub(crate) async fn get_user(db: &Pool<Postgres>, user_id: i64) -> Result<Option<UserRecord>> {
    let row = sqlx::query("SELECT id, username, rating FROM users WHERE id = $1")
        .bind(user_id)
        .fetch_optional(db)
        .await
        .context("select user by id")?;
    Ok(row.map(|r| UserRecord {
        id: r.get("id"),
        username: r.get("username"),
        rating: r.get("rating"),
    }))
}

pub(crate) async fn count_users(db: &Pool<Postgres>) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(db)
        .await
        .context("count users")?;
    Ok(count)
}

/// Case-insensitive substring match; the trigram index on username keeps
/// ILIKE fast enough that no separate search index is needed.
pub(crate) async fn search_by_username(
    db: &Pool<Postgres>,
    query: &str,
    limit: i64,
) -> Result<Vec<UserRecord>> {
    let pattern = format!("%{query}%");
    let rows = sqlx::query(
        "SELECT id, username, rating FROM users WHERE username ILIKE $1 ORDER BY rating DESC LIMIT $2",
    )
    .bind(&pattern)
    .bind(limit)
    .fetch_all(db)
    .await
    .context("search users by username")?;
    Ok(rows
        .into_iter()
        .map(|r| UserRecord {
            id: r.get("id"),
            username: r.get("username"),
            rating: r.get("rating"),
        })
        .collect())
}

/// Random pick for the simulator.
pub(crate) async fn random_user_id(db: &Pool<Postgres>) -> Result<Option<i64>> {
    let id: Option<i64> = sqlx::query_scalar("SELECT id FROM users ORDER BY RANDOM() LIMIT 1")
        .fetch_optional(db)
        .await
        .context("select random user")?;
    Ok(id)
}
