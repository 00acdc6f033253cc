use std::time::Duration;

use anyhow::{Context, Result};
use futures_util::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use tokio::sync::watch;

use crate::models::ScoreUpdatePayload;
use crate::state::AppState;

pub(crate) const SCORE_UPDATE_CHANNEL: &str = "leaderboard:score_updates";

const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Publishes one score-update event to every subscribed instance, this one
/// included. Best-effort: with no subscribers the event is simply dropped.
pub(crate) async fn publish_score_update(
    conn: &MultiplexedConnection,
    payload: &ScoreUpdatePayload,
) -> Result<()> {
    let data = serde_json::to_string(payload).context("encode score update")?;
    let mut conn = conn.clone();
    let _: i64 = conn
        .publish(SCORE_UPDATE_CHANNEL, data)
        .await
        .context("publish score update")?;
    Ok(())
}

/// Subscriber task bridging the bus into the local hub. Runs on a dedicated
/// pub/sub connection and reconnects with backoff; events during a
/// disconnected window are lost, so clients get a refresh signal instead.
pub(crate) async fn run_subscriber(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut first_connect = true;
    'outer: loop {
        if *shutdown.borrow() {
            break;
        }
        let mut pubsub = match state.redis_client.get_async_pubsub().await {
            Ok(ps) => ps,
            Err(e) => {
                eprintln!("[pubsub] connect_failed error={e}");
                if wait_or_shutdown(&mut shutdown, RECONNECT_DELAY).await {
                    break;
                }
                continue;
            }
        };
        if let Err(e) = pubsub.subscribe(SCORE_UPDATE_CHANNEL).await {
            eprintln!("[pubsub] subscribe_failed error={e}");
            if wait_or_shutdown(&mut shutdown, RECONNECT_DELAY).await {
                break;
            }
            continue;
        }
        eprintln!("[pubsub] subscribed channel={SCORE_UPDATE_CHANNEL}");

        if !first_connect {
            // Whatever was published while we were away is gone; tell
            // clients to refetch rather than pretending nothing happened.
            state.hub.broadcast_leaderboard_refresh().await;
        }
        first_connect = false;

        {
            let mut stream = pubsub.on_message();
            loop {
                tokio::select! {
                    maybe = stream.next() => match maybe {
                        Some(msg) => handle_message(&state, &msg).await,
                        None => {
                            eprintln!("[pubsub] connection_lost");
                            break;
                        }
                    },
                    _ = shutdown.changed() => break 'outer,
                }
            }
        }
        if wait_or_shutdown(&mut shutdown, RECONNECT_DELAY).await {
            break;
        }
    }
    eprintln!("[pubsub] subscriber_stopped");
}

async fn handle_message(state: &AppState, msg: &redis::Msg) {
    let raw: String = match msg.get_payload() {
        Ok(v) => v,
        Err(e) => {
            eprintln!("[pubsub] payload_read_failed error={e}");
            return;
        }
    };
    match serde_json::from_str::<ScoreUpdatePayload>(&raw) {
        Ok(payload) => state.hub.broadcast_score_update(&payload).await,
        // Unparseable messages are logged and skipped.
        Err(e) => eprintln!("[pubsub] unparseable_message error={e}"),
    }
}

async fn wait_or_shutdown(shutdown: &mut watch::Receiver<bool>, delay: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(delay) => false,
        _ = shutdown.changed() => true,
    }
}
