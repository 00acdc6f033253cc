use std::sync::atomic::Ordering;
use std::time::Duration;

use rand::Rng;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::db_sync;
use crate::models::clamp_rating;
use crate::pubsub;
use crate::service;
use crate::state::AppState;
use crate::store;

const TELEMETRY_INTERVAL: Duration = Duration::from_secs(30);
const SIMULATOR_BASE_RATING: i32 = 1500;
const SIMULATOR_MAX_SWING: i32 = 100;

pub(crate) fn start_background_tasks(
    state: AppState,
    shutdown: watch::Receiver<bool>,
) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::new();

    // 1) Write-behind worker: drains the score-update stream into Postgres.
    handles.push(tokio::spawn(db_sync::run_worker(state.clone(), shutdown.clone())));

    // 2) Fan-out subscriber: bridges the bus into the local hub.
    handles.push(tokio::spawn(pubsub::run_subscriber(state.clone(), shutdown.clone())));

    // 3) Simulator: periodic randomized score updates through the full pipeline.
    if state.cfg.app.simulator_enabled {
        handles.push(tokio::spawn(run_simulator(state.clone(), shutdown.clone())));
    }

    // 4) Counter telemetry.
    handles.push(tokio::spawn(run_telemetry(state, shutdown)));

    handles
}

async fn run_simulator(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let interval = Duration::from_secs(state.cfg.app.simulator_interval_seconds);
    eprintln!("[simulator] started interval_secs={}", interval.as_secs());
    let mut tick = tokio::time::interval(interval);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => simulate_score_update(&state).await,
            _ = shutdown.changed() => break,
        }
    }
    eprintln!("[simulator] stopped");
}

async fn simulate_score_update(state: &AppState) {
    let user_id = match store::random_user_id(&state.db).await {
        Ok(Some(id)) => id,
        Ok(None) => {
            eprintln!("[simulator] no_users");
            return;
        }
        Err(e) => {
            eprintln!("[simulator] pick_user_failed error={e:#}");
            return;
        }
    };

    // Random walk around the seed mean; the orchestrator clamps again.
    let change = rand::thread_rng().gen_range(-SIMULATOR_MAX_SWING..=SIMULATOR_MAX_SWING);
    let new_rating = clamp_rating(SIMULATOR_BASE_RATING + change);

    match service::update_user_score(state, user_id, new_rating).await {
        Ok(payload) => eprintln!(
            "[simulator] updated user_id={} rating={}=>{} rank={}",
            user_id, payload.old_rating, payload.new_rating, payload.new_rank
        ),
        Err(e) => eprintln!("[simulator] update_failed user_id={} error={}", user_id, e.detail),
    }
}

async fn run_telemetry(state: AppState, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(TELEMETRY_INTERVAL);
    tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                let perf = &state.perf;
                eprintln!(
                    "[perf] updates_received={} updates_applied={} publish_failures={} enqueue_failures={} sync_batches={} sync_items={} sync_failures={} ws_clients={} ws_broadcasts={} ws_evictions={}",
                    perf.updates_received.load(Ordering::Relaxed),
                    perf.updates_applied.load(Ordering::Relaxed),
                    perf.publish_failures.load(Ordering::Relaxed),
                    perf.enqueue_failures.load(Ordering::Relaxed),
                    perf.sync_batches.load(Ordering::Relaxed),
                    perf.sync_items.load(Ordering::Relaxed),
                    perf.sync_failures.load(Ordering::Relaxed),
                    state.hub.client_count(),
                    perf.ws_broadcasts.load(Ordering::Relaxed),
                    perf.ws_evictions.load(Ordering::Relaxed),
                );
            }
            _ = shutdown.changed() => break,
        }
    }
}
