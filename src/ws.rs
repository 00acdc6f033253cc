use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::body::Bytes;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, watch};
use tokio::time::MissedTickBehavior;

use crate::models::{ScoreUpdatePayload, WsMessage};
use crate::state::{AppState, PerfCounters};

// Time allowed to write one frame to a peer.
const WRITE_WAIT: Duration = Duration::from_secs(10);
// A pong (or any frame) must arrive within this window.
const PONG_WAIT: Duration = Duration::from_secs(60);
// Ping period, 9/10 of the pong deadline.
const PING_PERIOD: Duration = Duration::from_secs(54);
// Maximum inbound frame size; this is a server-to-client feed.
const MAX_MESSAGE_SIZE: usize = 512;
// Per-client outbound queue; overflowing it evicts the client.
const CLIENT_SEND_BUFFER: usize = 256;
const BROADCAST_BUFFER: usize = 256;

pub(crate) struct HubClient {
    pub(crate) id: u64,
    pub(crate) tx: mpsc::Sender<Message>,
}

/// Handle to the single-owner hub task. All registry mutation happens inside
/// that task, so a broadcast can never race a register/unregister.
#[derive(Clone)]
pub(crate) struct HubHandle {
    register_tx: mpsc::UnboundedSender<HubClient>,
    unregister_tx: mpsc::UnboundedSender<u64>,
    broadcast_tx: mpsc::Sender<String>,
    client_count: Arc<AtomicUsize>,
    next_client_id: Arc<AtomicU64>,
}

impl HubHandle {
    pub(crate) fn next_id(&self) -> u64 {
        self.next_client_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn client_count(&self) -> usize {
        self.client_count.load(Ordering::Relaxed)
    }

    pub(crate) fn register(&self, client: HubClient) {
        let _ = self.register_tx.send(client);
    }

    pub(crate) fn unregister(&self, client_id: u64) {
        let _ = self.unregister_tx.send(client_id);
    }

    pub(crate) async fn broadcast_score_update(&self, payload: &ScoreUpdatePayload) {
        self.broadcast_frame(WsMessage { kind: "score_update", payload }).await;
    }

    pub(crate) async fn broadcast_leaderboard_refresh(&self) {
        let payload = serde_json::json!({"action": "refresh"});
        self.broadcast_frame(WsMessage { kind: "leaderboard_refresh", payload }).await;
    }

    async fn broadcast_frame<T: serde::Serialize>(&self, message: WsMessage<T>) {
        match serde_json::to_string(&message) {
            Ok(frame) => {
                if self.broadcast_tx.send(frame).await.is_err() {
                    eprintln!("[ws] broadcast_dropped reason=hub_stopped");
                }
            }
            Err(e) => eprintln!("[ws] frame_encode_failed error={e}"),
        }
    }
}

pub(crate) fn spawn_hub(perf: Arc<PerfCounters>, mut shutdown: watch::Receiver<bool>) -> HubHandle {
    let (register_tx, mut register_rx) = mpsc::unbounded_channel::<HubClient>();
    let (unregister_tx, mut unregister_rx) = mpsc::unbounded_channel::<u64>();
    let (broadcast_tx, mut broadcast_rx) = mpsc::channel::<String>(BROADCAST_BUFFER);
    let client_count = Arc::new(AtomicUsize::new(0));
    let count = client_count.clone();

    tokio::spawn(async move {
        let mut clients: HashMap<u64, mpsc::Sender<Message>> = HashMap::new();
        loop {
            tokio::select! {
                Some(client) = register_rx.recv() => {
                    clients.insert(client.id, client.tx);
                    count.store(clients.len(), Ordering::Relaxed);
                    eprintln!("[ws] client_connected id={} total={}", client.id, clients.len());
                }
                Some(client_id) = unregister_rx.recv() => {
                    if clients.remove(&client_id).is_some() {
                        count.store(clients.len(), Ordering::Relaxed);
                        eprintln!("[ws] client_disconnected id={} total={}", client_id, clients.len());
                    }
                }
                Some(frame) = broadcast_rx.recv() => {
                    perf.ws_broadcasts.fetch_add(1, Ordering::Relaxed);
                    let mut slow: Vec<u64> = Vec::new();
                    let mut gone: Vec<u64> = Vec::new();
                    for (client_id, tx) in &clients {
                        match tx.try_send(Message::Text(frame.clone().into())) {
                            Ok(()) => {}
                            // Full queue = slow consumer; dropping the sender
                            // ends its write pump and closes the socket.
                            Err(mpsc::error::TrySendError::Full(_)) => slow.push(*client_id),
                            Err(mpsc::error::TrySendError::Closed(_)) => gone.push(*client_id),
                        }
                    }
                    for client_id in slow {
                        clients.remove(&client_id);
                        perf.ws_evictions.fetch_add(1, Ordering::Relaxed);
                        eprintln!("[ws] client_evicted id={client_id} reason=send_buffer_full");
                    }
                    for client_id in gone {
                        clients.remove(&client_id);
                    }
                    count.store(clients.len(), Ordering::Relaxed);
                }
                _ = shutdown.changed() => {
                    // Count first: dropping the senders is observable by the
                    // write pumps immediately.
                    count.store(0, Ordering::Relaxed);
                    clients.clear();
                    break;
                }
                else => break,
            }
        }
        eprintln!("[ws] hub_stopped");
    });

    HubHandle {
        register_tx,
        unregister_tx,
        broadcast_tx,
        client_count,
        next_client_id: Arc::new(AtomicU64::new(1)),
    }
}

pub(crate) async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if !origin_allowed(&state.cfg.api.cors_origins, headers.get(header::ORIGIN)) {
        return StatusCode::FORBIDDEN.into_response();
    }
    ws.max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| handle_socket(state, socket))
}

/// `*` admits any origin (development). Requests without an Origin header
/// (non-browser clients) are admitted; browsers always send one.
fn origin_allowed(allowed: &[String], origin: Option<&HeaderValue>) -> bool {
    if allowed.iter().any(|o| o == "*") {
        return true;
    }
    let Some(origin) = origin else {
        return true;
    };
    let Ok(origin) = origin.to_str() else {
        return false;
    };
    allowed.iter().any(|o| o.eq_ignore_ascii_case(origin))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_SEND_BUFFER);
    let client_id = state.hub.next_id();
    state.hub.register(HubClient { id: client_id, tx });

    // Write pump: queued frames plus keepalive pings, one frame per message.
    let write_task = tokio::spawn(async move {
        let start = tokio::time::Instant::now() + PING_PERIOD;
        let mut ping = tokio::time::interval_at(start, PING_PERIOD);
        ping.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                maybe = rx.recv() => match maybe {
                    Some(msg) => {
                        match tokio::time::timeout(WRITE_WAIT, sender.send(msg)).await {
                            Ok(Ok(())) => {}
                            // Write error or timeout: the client is gone.
                            Ok(Err(_)) | Err(_) => break,
                        }
                    }
                    None => {
                        // Hub dropped our queue (eviction or shutdown).
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                },
                _ = ping.tick() => {
                    match tokio::time::timeout(WRITE_WAIT, sender.send(Message::Ping(Bytes::new()))).await {
                        Ok(Ok(())) => {}
                        Ok(Err(_)) | Err(_) => break,
                    }
                }
            }
        }
    });

    // Read pump: enforces the pong deadline; inbound frames are logged and
    // otherwise ignored. Also watches shutdown so draining connections close.
    let mut shutdown = state.shutdown.clone();
    loop {
        let next = tokio::select! {
            r = tokio::time::timeout(PONG_WAIT, receiver.next()) => r,
            _ = shutdown.changed() => break,
        };
        match next {
            Err(_) => {
                eprintln!("[ws] client_timed_out id={client_id}");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                eprintln!("[ws] read_error id={client_id} error={e}");
                break;
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Text(text)))) => {
                eprintln!("[ws] inbound_frame id={client_id} len={}", text.len());
            }
            // Pongs (and client pings) just reset the deadline.
            Ok(Some(Ok(_))) => {}
        }
    }

    state.hub.unregister(client_id);
    write_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UserRecord;
    use crate::service::build_payload;

    fn origins(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn origin_allow_list() {
        let any = origins(&["*"]);
        let strict = origins(&["https://game.example.com"]);
        let evil = HeaderValue::from_static("https://evil.example.com");
        let good = HeaderValue::from_static("https://game.example.com");
        let good_upper = HeaderValue::from_static("HTTPS://GAME.EXAMPLE.COM");

        assert!(origin_allowed(&any, Some(&evil)));
        assert!(origin_allowed(&strict, Some(&good)));
        assert!(origin_allowed(&strict, Some(&good_upper)));
        assert!(!origin_allowed(&strict, Some(&evil)));
        // No Origin header: non-browser client, admitted.
        assert!(origin_allowed(&strict, None));
    }

    fn payload(seq: i64) -> ScoreUpdatePayload {
        let user = UserRecord {
            id: seq,
            username: format!("user_{seq}"),
            rating: 2000,
        };
        build_payload(&user, 1900, 10, 8, seq)
    }

    fn frame_seq(msg: &Message) -> i64 {
        let Message::Text(text) = msg else {
            panic!("expected text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "score_update");
        value["payload"]["timestamp"].as_i64().unwrap()
    }

    #[tokio::test]
    async fn responsive_subscriber_keeps_receiving_when_another_stalls() {
        let perf = Arc::new(PerfCounters::new());
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = spawn_hub(perf.clone(), shutdown_rx);

        let (fast_tx, mut fast_rx) = mpsc::channel::<Message>(CLIENT_SEND_BUFFER);
        let (slow_tx, mut slow_rx) = mpsc::channel::<Message>(CLIENT_SEND_BUFFER);
        hub.register(HubClient { id: 1, tx: fast_tx });
        hub.register(HubClient { id: 2, tx: slow_tx });
        // Both registrations must land before the first broadcast.
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.client_count() != 2 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        // Drain the fast client concurrently; the slow one never reads.
        let drain = tokio::spawn(async move {
            let mut seen = Vec::new();
            while seen.len() < 300 {
                match tokio::time::timeout(Duration::from_secs(5), fast_rx.recv()).await {
                    Ok(Some(msg)) => seen.push(frame_seq(&msg)),
                    _ => break,
                }
            }
            seen
        });

        for seq in 0..300 {
            hub.broadcast_score_update(&payload(seq)).await;
        }

        let seen = drain.await.unwrap();
        assert_eq!(seen, (0..300).collect::<Vec<i64>>());

        // The stalled client overflowed its 256-slot queue and was evicted:
        // its sender is dropped, so after the buffered frames the channel ends.
        let mut buffered = 0;
        while slow_rx.recv().await.is_some() {
            buffered += 1;
        }
        assert_eq!(buffered, CLIENT_SEND_BUFFER);
        assert!(perf.ws_evictions.load(Ordering::Relaxed) >= 1);

        // Registry converges to the single healthy client.
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.client_count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn shutdown_clears_the_registry() {
        let perf = Arc::new(PerfCounters::new());
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let hub = spawn_hub(perf, shutdown_rx);

        let (tx, mut rx) = mpsc::channel::<Message>(CLIENT_SEND_BUFFER);
        hub.register(HubClient { id: 1, tx });
        tokio::time::timeout(Duration::from_secs(5), async {
            while hub.client_count() != 1 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .unwrap();

        shutdown_tx.send(true).unwrap();
        // Dropped sender: the client's queue ends, which closes its socket.
        assert!(rx.recv().await.is_none());
        assert_eq!(hub.client_count(), 0);
    }
}
