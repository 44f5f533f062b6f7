//! Continuous scheduling mode: one independent task per configured
//! instance, each sleeping until its own `next_sync_time` instead of
//! ticking on a shared interval.
//!
//! A single process-wide permit serializes the actual Arr calls across
//! instances (matching [`Engine::run_instance`]'s assumption that only one
//! cycle touches an instance's upstream at a time), while the sleeping
//! itself happens fully in parallel.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

use crate::engine::{Engine, ProgressSender};

const NOT_DUE_POLL: Duration = Duration::from_secs(5);
const ERROR_BACKOFF: Duration = Duration::from_secs(5);
const LOCK_RETRY: Duration = Duration::from_secs(1);

/// Sleeps for `dur` or returns early if `shutdown` fires. Returns `true` if
/// the sleep completed, `false` if it was cut short by shutdown.
async fn sleep_or_cancel(shutdown: &CancellationToken, dur: Duration) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(dur) => true,
        _ = shutdown.cancelled() => false,
    }
}

async fn instance_loop(
    engine: Arc<Engine>,
    run_lock: Arc<Semaphore>,
    progress: Option<ProgressSender>,
    app_type: String,
    instance_id: i64,
    shutdown: CancellationToken,
) {
    loop {
        if shutdown.is_cancelled() {
            return;
        }
        if let Err(err) = engine.mark_heartbeat() {
            tracing::warn!(error = %err, "failed to record scheduler heartbeat");
        }

        let due_at = match engine.next_due_at(&app_type, instance_id) {
            Ok(due_at) => due_at,
            Err(err) => {
                tracing::error!(%app_type, instance_id, error = %err, "instance loop failed to read next sync time");
                if !sleep_or_cancel(&shutdown, ERROR_BACKOFF).await {
                    return;
                }
                continue;
            }
        };

        if let Some(due_at) = due_at {
            let now = chrono::Utc::now();
            if due_at > now {
                let wait = (due_at - now).to_std().unwrap_or(Duration::ZERO);
                if !sleep_or_cancel(&shutdown, wait).await {
                    return;
                }
                continue;
            }
        }

        let permit = loop {
            if shutdown.is_cancelled() {
                return;
            }
            match run_lock.clone().try_acquire_owned() {
                Ok(permit) => break permit,
                Err(_) => {
                    if !sleep_or_cancel(&shutdown, LOCK_RETRY).await {
                        return;
                    }
                }
            }
        };

        let result = engine.run_instance(&app_type, instance_id, false, progress.as_ref()).await;
        drop(permit);

        if let Err(err) = result {
            tracing::error!(%app_type, instance_id, error = %err, "instance loop run failed");
            if !sleep_or_cancel(&shutdown, ERROR_BACKOFF).await {
                return;
            }
        }
    }
}

/// Runs the independent per-instance scheduling loops until `shutdown` is
/// cancelled. If `force` is set, every enabled instance gets one immediate
/// run (serialized through the same lock the loops use) before the loops
/// start waiting on their own due times.
pub async fn run_scheduler(engine: Arc<Engine>, progress: Option<ProgressSender>, force: bool, shutdown: CancellationToken) {
    let run_lock = Arc::new(Semaphore::new(1));
    let instances = engine.enabled_instances();

    if force {
        for (app_type, instance_id) in &instances {
            let _permit = match run_lock.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => break,
            };
            if let Err(err) = engine.run_instance(app_type, *instance_id, true, progress.as_ref()).await {
                tracing::error!(%app_type, instance_id, error = %err, "forced startup run failed");
            }
        }
    }

    let mut handles = Vec::new();
    for (app_type, instance_id) in instances {
        handles.push(tokio::spawn(instance_loop(
            engine.clone(),
            run_lock.clone(),
            progress.clone(),
            app_type,
            instance_id,
            shutdown.clone(),
        )));
    }

    shutdown.cancelled().await;
    for handle in handles {
        let _ = tokio::time::timeout(Duration::from_secs(2), handle).await;
    }
}
