use std::fs;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::Rng;
use redis::AsyncCommands;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres, QueryBuilder, Row};

const LEADERBOARD_KEY: &str = "leaderboard:global";

const MIN_RATING: i32 = 100;
const MAX_RATING: i32 = 5000;
const RATING_MEAN: f64 = 2500.0;
const RATING_STD_DEV: f64 = 800.0;

const INSERT_BATCH_SIZE: usize = 500;
const SYNC_BATCH_SIZE: i64 = 500;

const USERNAME_PREFIXES: &[&str] = &[
    "pro", "ninja", "gamer", "killer", "shadow", "master", "legend", "dark", "fire", "ice",
    "thunder", "storm", "dragon", "phoenix", "rahul", "amit", "priya", "rohan", "sneha",
    "vikram", "ananya",
];

const USERNAME_SUFFIXES: &[&str] = &[
    "x", "king", "queen", "lord", "god", "pro", "elite", "prime", "123", "007", "gamer",
    "player", "master", "legend", "warrior",
];

fn split_sql_statements(input: &str) -> Vec<String> {
    // Simple splitter suitable for our schema.sql (no functions / dollar-quoting).
    // Skips comments/whitespace-only segments.
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut in_single = false;

    for line in input.lines() {
        let trimmed = line.trim_start();
        if !in_single && trimmed.starts_with("--") {
            continue;
        }
        for ch in line.chars() {
            match ch {
                '\'' => {
                    in_single = !in_single;
                    cur.push(ch);
                }
                ';' if !in_single => {
                    let s = cur.trim();
                    if !s.is_empty() {
                        out.push(s.to_string());
                    }
                    cur.clear();
                }
                _ => cur.push(ch),
            }
        }
        cur.push('\n');
    }
    let s = cur.trim();
    if !s.is_empty() {
        out.push(s.to_string());
    }
    out
}

// Always embeds the user number so usernames stay unique.
fn generate_username(rng: &mut impl Rng, user_num: usize) -> String {
    let prefix = USERNAME_PREFIXES[rng.gen_range(0..USERNAME_PREFIXES.len())];
    let suffix = USERNAME_SUFFIXES[rng.gen_range(0..USERNAME_SUFFIXES.len())];
    let choice: f64 = rng.gen();
    if choice < 0.3 {
        format!("{prefix}_{suffix}_{user_num}")
    } else if choice < 0.6 {
        format!("{prefix}_{user_num}")
    } else {
        format!("user_{user_num}")
    }
}

// Box-Muller transform for a bell-curve rating distribution.
fn bell_curve_rating(rng: &mut impl Rng) -> i32 {
    let u1: f64 = rng.gen_range(f64::MIN_POSITIVE..1.0);
    let u2: f64 = rng.gen();
    let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
    let rating = (RATING_MEAN + RATING_STD_DEV * z) as i32;
    rating.clamp(MIN_RATING, MAX_RATING)
}

async fn apply_schema(db: &Pool<Postgres>) -> Result<()> {
    let path = env_string("SCHEMA_PATH", "schema.sql");
    let schema_sql =
        fs::read_to_string(&path).with_context(|| format!("read schema file: {path}"))?;
    for stmt in split_sql_statements(&schema_sql) {
        sqlx::query(&stmt).execute(db).await.with_context(|| {
            format!("exec schema stmt: {}", stmt.lines().next().unwrap_or("<empty>"))
        })?;
    }
    Ok(())
}

async fn seed_postgres(db: &Pool<Postgres>, num_users: usize) -> Result<()> {
    let mut rng = rand::thread_rng();
    let total_batches = num_users.div_ceil(INSERT_BATCH_SIZE);

    for batch in 0..total_batches {
        let start = batch * INSERT_BATCH_SIZE;
        let end = (start + INSERT_BATCH_SIZE).min(num_users);
        let rows: Vec<(String, i32)> = (start..end)
            .map(|i| (generate_username(&mut rng, i + 1), bell_curve_rating(&mut rng)))
            .collect();

        let mut qb: QueryBuilder<Postgres> =
            QueryBuilder::new("INSERT INTO users (username, rating) ");
        qb.push_values(rows.iter(), |mut b, (username, rating)| {
            b.push_bind(username).push_bind(rating);
        });
        qb.build()
            .execute(db)
            .await
            .with_context(|| format!("insert users batch {}", batch + 1))?;

        println!(
            "[seed] postgres_batch {}/{} users={}",
            batch + 1,
            total_batches,
            end
        );
    }
    Ok(())
}

async fn sync_to_redis(
    db: &Pool<Postgres>,
    conn: &mut redis::aio::MultiplexedConnection,
) -> Result<u64> {
    let mut offset = 0i64;
    let mut total_synced = 0u64;
    loop {
        let rows = sqlx::query(
            "SELECT id, username, rating FROM users ORDER BY rating DESC, username LIMIT $1 OFFSET $2",
        )
        .bind(SYNC_BATCH_SIZE)
        .bind(offset)
        .fetch_all(db)
        .await
        .context("fetch users page")?;
        if rows.is_empty() {
            break;
        }

        // One round trip per page: sorted-set member plus cache hash per user.
        let mut pipe = redis::pipe();
        for row in &rows {
            let id: i64 = row.get("id");
            let username: String = row.get("username");
            let rating: i32 = row.get("rating");
            pipe.zadd(LEADERBOARD_KEY, format!("user:{id}"), rating).ignore();
            pipe.hset_multiple(
                format!("user:cache:{id}"),
                &[
                    ("id", id.to_string()),
                    ("username", username),
                    ("rating", rating.to_string()),
                ],
            )
            .ignore();
        }
        let _: () = pipe.query_async(conn).await.context("sync users page to redis")?;

        total_synced += rows.len() as u64;
        println!("[seed] redis_synced total={total_synced}");

        let fetched = rows.len() as i64;
        offset += fetched;
        if fetched < SYNC_BATCH_SIZE {
            break;
        }
    }
    Ok(total_synced)
}

#[tokio::main]
async fn main() -> Result<()> {
    let db_url = env_required("DATABASE_URL")?;
    let num_users = env_usize("SEED_NUM_USERS", 10_000);
    let force = env_bool("SEED_FORCE", false);

    let db = PgPoolOptions::new()
        .max_connections(env_u32("DB_MAX_POOL_SIZE", 10))
        .acquire_timeout(Duration::from_secs(30))
        .connect(&db_url)
        .await
        .context("connect postgres")?;

    let redis_url = redis_url_from_env();
    let redis_client = redis::Client::open(redis_url).context("invalid redis configuration")?;
    let mut redis = redis_client
        .get_multiplexed_async_connection()
        .await
        .context("connect redis")?;

    apply_schema(&db).await?;

    let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM users")
        .fetch_one(&db)
        .await
        .context("count users")?;
    if existing > 0 && !force {
        return Err(anyhow!(
            "database already contains {existing} users; set SEED_FORCE=1 to add more"
        ));
    }

    let started = Instant::now();
    println!("[seed] creating_users count={num_users}");
    seed_postgres(&db, num_users).await?;
    let pg_elapsed = started.elapsed();

    let sync_started = Instant::now();
    let synced = sync_to_redis(&db, &mut redis).await?;
    let sync_elapsed = sync_started.elapsed();

    let leaderboard_size: i64 = redis.zcard(LEADERBOARD_KEY).await.context("zcard leaderboard")?;
    println!(
        "[seed] complete users={num_users} synced={synced} leaderboard_size={leaderboard_size} postgres_secs={} redis_secs={}",
        pg_elapsed.as_secs(),
        sync_elapsed.as_secs()
    );
    Ok(())
}

fn redis_url_from_env() -> String {
    let host = env_string("REDIS_HOST", "localhost");
    let port = env_string("REDIS_PORT", "6379");
    let password = env_string("REDIS_PASSWORD", "");
    let db = env_string("REDIS_DB", "0");
    if password.is_empty() {
        format!("redis://{host}:{port}/{db}")
    } else {
        format!("redis://:{password}@{host}:{port}/{db}")
    }
}

fn env_required(key: &str) -> Result<String> {
    std::env::var(key).with_context(|| format!("missing required env var: {key}"))
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_u32(key: &str, default: u32) -> u32 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u32>().ok())
        .unwrap_or(default)
}

fn env_usize(key: &str, default: usize) -> usize {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sql_splitter_drops_comments_and_splits_on_semicolons() {
        let sql = "-- comment\nCREATE TABLE a (id INT);\n\nINSERT INTO a VALUES (1);";
        let stmts = split_sql_statements(sql);
        assert_eq!(stmts.len(), 2);
        assert!(stmts[0].starts_with("CREATE TABLE a"));
        assert!(stmts[1].starts_with("INSERT INTO a"));
    }

    #[test]
    fn generated_usernames_embed_the_user_number() {
        let mut rng = rand::thread_rng();
        for i in 1..50 {
            assert!(generate_username(&mut rng, i).contains(&i.to_string()));
        }
    }

    #[test]
    fn generated_ratings_stay_in_bounds() {
        let mut rng = rand::thread_rng();
        for _ in 0..10_000 {
            let rating = bell_curve_rating(&mut rng);
            assert!((MIN_RATING..=MAX_RATING).contains(&rating));
        }
    }
}
