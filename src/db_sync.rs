use std::sync::atomic::Ordering;
use std::time::Duration;

use anyhow::{Context, Result};
use redis::aio::MultiplexedConnection;
use redis::streams::{StreamId, StreamMaxlen, StreamReadOptions, StreamReadReply};
use redis::AsyncCommands;
use tokio::sync::watch;

use crate::models::SyncQueueItem;
use crate::state::AppState;

pub(crate) const SCORE_UPDATE_STREAM: &str = "stream:score_updates";
pub(crate) const CONSUMER_GROUP: &str = "db-sync-group";
const CONSUMER_NAME: &str = "worker-1";
// Unparseable entries land here instead of wedging the consumer group.
const DEAD_LETTER_KEY: &str = "stream:score_updates:dead";

const BATCH_SIZE: usize = 100;
const BLOCK_TIMEOUT_MS: usize = 5_000;
const TRIM_EVERY_N_BATCHES: u64 = 10;
const RETRY_DELAY_MS: u64 = 1_000;

/// Idempotent consumer-group creation at startup.
pub(crate) async fn init_stream(conn: &MultiplexedConnection) -> Result<()> {
    let mut conn = conn.clone();
    let created: redis::RedisResult<()> = conn
        .xgroup_create_mkstream(SCORE_UPDATE_STREAM, CONSUMER_GROUP, "0")
        .await;
    match created {
        Ok(()) => Ok(()),
        Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
        Err(e) => Err(e).context("create score update consumer group"),
    }
}

/// Producer side: one stream entry per update, JSON under a single `data`
/// field. Must stay cheap; the hot path swallows failures here.
pub(crate) async fn enqueue_update(
    conn: &MultiplexedConnection,
    item: &SyncQueueItem,
) -> Result<()> {
    let data = serde_json::to_string(item).context("encode sync item")?;
    let mut conn = conn.clone();
    let _: String = conn
        .xadd(SCORE_UPDATE_STREAM, "*", &[("data", data.as_str())])
        .await
        .context("xadd score update")?;
    Ok(())
}

enum ReadMode {
    // Entries delivered to this consumer but never acknowledged (id "0").
    Pending,
    // Fresh entries, blocking up to BLOCK_TIMEOUT_MS (id ">").
    New,
    // Fresh entries without blocking; used while draining on shutdown.
    Drain,
}

/// Consumer side: drains the stream into Postgres in batches. Delivery is
/// at least once; the cold-store update is last-writer-wins per user and
/// duplicate history rows are acceptable, so redelivery is safe.
pub(crate) async fn run_worker(state: AppState, mut shutdown: watch::Receiver<bool>) {
    eprintln!(
        "[db_sync] worker_started stream={SCORE_UPDATE_STREAM} group={CONSUMER_GROUP} consumer={CONSUMER_NAME}"
    );
    let mut conn = state.redis.clone();
    let mut batch_counter: u64 = 0;

    // Reclaim our own pending entries from before the last shutdown/crash.
    loop {
        match process_once(&state, &mut conn, ReadMode::Pending, &mut batch_counter).await {
            Ok(0) => break,
            Ok(n) => eprintln!("[db_sync] pending_replayed items={n}"),
            Err(e) => {
                eprintln!("[db_sync] pending_replay_failed error={e:#}");
                break;
            }
        }
    }

    loop {
        if *shutdown.borrow() {
            break;
        }
        let result = tokio::select! {
            r = process_once(&state, &mut conn, ReadMode::New, &mut batch_counter) => r,
            _ = shutdown.changed() => break,
        };
        if let Err(e) = result {
            state.perf.sync_failures.fetch_add(1, Ordering::Relaxed);
            // Items stay pending in the group and are retried next loop.
            eprintln!("[db_sync] batch_failed error={e:#}");
            tokio::time::sleep(Duration::from_millis(RETRY_DELAY_MS)).await;
        }
    }

    // Drain entries that are already queued, then stop. A batch in flight
    // either commits and acks or stays pending for the next start.
    loop {
        match process_once(&state, &mut conn, ReadMode::Drain, &mut batch_counter).await {
            Ok(0) => break,
            Ok(n) => eprintln!("[db_sync] drained items={n}"),
            Err(e) => {
                eprintln!("[db_sync] drain_failed error={e:#}");
                break;
            }
        }
    }
    eprintln!("[db_sync] worker_stopped");
}

async fn process_once(
    state: &AppState,
    conn: &mut MultiplexedConnection,
    mode: ReadMode,
    batch_counter: &mut u64,
) -> Result<usize> {
    let Some(reply) = read_group(conn, mode).await? else {
        return Ok(0);
    };
    let total: usize = reply.keys.iter().map(|k| k.ids.len()).sum();
    if total == 0 {
        return Ok(0);
    }
    apply_batch(state, conn, reply, batch_counter).await?;
    Ok(total)
}

async fn read_group(
    conn: &mut MultiplexedConnection,
    mode: ReadMode,
) -> Result<Option<StreamReadReply>> {
    let mut opts = StreamReadOptions::default()
        .group(CONSUMER_GROUP, CONSUMER_NAME)
        .count(BATCH_SIZE);
    let id = match mode {
        ReadMode::Pending => "0",
        ReadMode::New => {
            opts = opts.block(BLOCK_TIMEOUT_MS);
            ">"
        }
        ReadMode::Drain => ">",
    };
    let reply: Option<StreamReadReply> = conn
        .xread_options(&[SCORE_UPDATE_STREAM], &[id], &opts)
        .await
        .context("xreadgroup score updates")?;
    Ok(reply)
}

fn decode_entry(entry: &StreamId) -> Option<SyncQueueItem> {
    let value = entry.map.get("data")?;
    let raw: String = redis::from_redis_value(value).ok()?;
    serde_json::from_str(&raw).ok()
}

fn raw_entry_data(entry: &StreamId) -> String {
    entry
        .map
        .get("data")
        .and_then(|v| redis::from_redis_value::<String>(v).ok())
        .unwrap_or_default()
}

async fn apply_batch(
    state: &AppState,
    conn: &mut MultiplexedConnection,
    reply: StreamReadReply,
    batch_counter: &mut u64,
) -> Result<()> {
    let mut items: Vec<(String, SyncQueueItem)> = Vec::new();
    let mut poison: Vec<(String, String)> = Vec::new();
    for key in reply.keys {
        for entry in key.ids {
            match decode_entry(&entry) {
                Some(item) => items.push((entry.id.clone(), item)),
                None => poison.push((entry.id.clone(), raw_entry_data(&entry))),
            }
        }
    }

    if !poison.is_empty() {
        for (id, raw) in &poison {
            let _: () = conn
                .rpush(DEAD_LETTER_KEY, format!("{id} {raw}"))
                .await
                .context("dead-letter poison entry")?;
        }
        let ids: Vec<&str> = poison.iter().map(|(id, _)| id.as_str()).collect();
        let _: i64 = conn
            .xack(SCORE_UPDATE_STREAM, CONSUMER_GROUP, &ids)
            .await
            .context("ack poison entries")?;
        eprintln!("[db_sync] dead_lettered count={}", poison.len());
    }
    if items.is_empty() {
        return Ok(());
    }

    // One transaction per batch. Stream order is preserved, so the last
    // enqueued rating per user within the batch wins.
    let mut tx = state.db.begin().await.context("begin sync transaction")?;
    for (_, item) in &items {
        sqlx::query("UPDATE users SET rating = $1, updated_at = now() WHERE id = $2")
            .bind(item.new_rating)
            .bind(item.user_id)
            .execute(&mut *tx)
            .await
            .context("apply rating")?;
        sqlx::query(
            "INSERT INTO score_updates (user_id, old_rating, new_rating, change, updated_at) VALUES ($1,$2,$3,$4,$5)",
        )
        .bind(item.user_id)
        .bind(item.old_rating)
        .bind(item.new_rating)
        .bind(item.new_rating - item.old_rating)
        .bind(item.timestamp)
        .execute(&mut *tx)
        .await
        .context("append history row")?;
    }
    tx.commit().await.context("commit sync transaction")?;

    // Ack only after commit; a failed batch is redelivered.
    let ids: Vec<&str> = items.iter().map(|(id, _)| id.as_str()).collect();
    let _: i64 = conn
        .xack(SCORE_UPDATE_STREAM, CONSUMER_GROUP, &ids)
        .await
        .context("ack committed batch")?;

    state.perf.sync_batches.fetch_add(1, Ordering::Relaxed);
    state.perf.sync_items.fetch_add(items.len() as u64, Ordering::Relaxed);
    eprintln!("[db_sync] batch_committed items={}", items.len());

    *batch_counter += 1;
    if *batch_counter % TRIM_EVERY_N_BATCHES == 0 {
        // Bounded retention caps storage but can drop pending entries if the
        // backlog ever exceeds the bound; STREAM_MAX_LEN must stay above
        // steady-state lag. Trim runs off the worker loop.
        let mut trim_conn = conn.clone();
        let max_len = state.cfg.app.stream_max_len;
        tokio::spawn(async move {
            let trimmed: redis::RedisResult<i64> = trim_conn
                .xtrim(SCORE_UPDATE_STREAM, StreamMaxlen::Approx(max_len))
                .await;
            match trimmed {
                Ok(removed) => {
                    if removed > 0 {
                        eprintln!("[db_sync] trimmed removed={removed} max_len={max_len}");
                    }
                }
                Err(e) => eprintln!("[db_sync] trim_failed error={e}"),
            }
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn entry(id: &str, data: Option<&str>) -> StreamId {
        let mut entry = StreamId::default();
        entry.id = id.to_string();
        if let Some(data) = data {
            entry.map.insert(
                "data".to_string(),
                redis::Value::BulkString(data.as_bytes().to_vec()),
            );
        }
        entry
    }

    #[test]
    fn well_formed_entries_decode() {
        let item = SyncQueueItem {
            user_id: 12,
            old_rating: 1500,
            new_rating: 1650,
            timestamp: Utc::now(),
        };
        let raw = serde_json::to_string(&item).unwrap();
        let decoded = decode_entry(&entry("1-1", Some(&raw))).unwrap();
        assert_eq!(decoded.user_id, 12);
        assert_eq!(decoded.old_rating, 1500);
        assert_eq!(decoded.new_rating, 1650);
    }

    #[test]
    fn poison_entries_fail_to_decode_but_keep_raw_data() {
        let bad = entry("1-2", Some("{not json"));
        assert!(decode_entry(&bad).is_none());
        assert_eq!(raw_entry_data(&bad), "{not json");

        let missing = entry("1-3", None);
        assert!(decode_entry(&missing).is_none());
        assert_eq!(raw_entry_data(&missing), "");
    }
}
