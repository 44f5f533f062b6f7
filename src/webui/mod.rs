//! Minimal operator Web UI: a status/settings JSON API plus a small bundled
//! HTML page, guarded by a single shared password.
//!
//! The UI never talks to Radarr/Sonarr directly; it only ever reads/writes
//! through [`Engine`] and [`Store`], the same surfaces the scheduler uses.

pub mod auth;
pub mod routes;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use tokio::sync::{RwLock, Semaphore};

use crate::engine::Engine;
use crate::store::Store;

const RECENT_ACTIONS_KEPT: usize = 8;

/// Mirrors the Web UI's in-memory run tracker: a best-effort snapshot of the
/// currently running (or most recently finished) cycle, derived from the
/// [`crate::engine::ProgressEvent`] stream. Never persisted; a restart loses it.
#[derive(Debug, Clone, Serialize)]
pub struct RunState {
    pub running: bool,
    pub force: bool,
    pub started_at: Option<String>,
    pub last_event: Option<String>,
    pub actions_triggered: u32,
    pub actions_skipped_cooldown: u32,
    pub actions_skipped_rate_limit: u32,
    pub last_title: Option<String>,
    pub recent_actions: VecDeque<RecentAction>,
    pub error: Option<String>,
    pub autorun_enabled: bool,
    pub autorun_last_check: Option<String>,
    pub autorun_last_run_started: Option<String>,
    pub active_app_type: Option<String>,
    pub active_instance_id: Option<i64>,
    pub active_instance_name: Option<String>,
}

impl Default for RunState {
    fn default() -> Self {
        Self {
            running: false,
            force: false,
            started_at: None,
            last_event: None,
            actions_triggered: 0,
            actions_skipped_cooldown: 0,
            actions_skipped_rate_limit: 0,
            last_title: None,
            recent_actions: VecDeque::new(),
            error: None,
            autorun_enabled: true,
            autorun_last_check: None,
            autorun_last_run_started: None,
            active_app_type: None,
            active_instance_id: None,
            active_instance_name: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentAction {
    pub ts: String,
    pub app_type: String,
    pub instance_name: String,
    pub title: String,
}

/// Shared state for every request handler.
pub struct AppState {
    pub engine: Arc<Engine>,
    pub store: Arc<Store>,
    pub config_path: PathBuf,
    pub password_hash: RwLock<Option<String>>,
    pub run_lock: Arc<Semaphore>,
    pub run_state: Mutex<RunState>,
}

impl AppState {
    pub fn new(engine: Arc<Engine>, store: Arc<Store>, config_path: PathBuf, password_hash: Option<String>) -> Arc<Self> {
        Arc::new(Self {
            engine,
            store,
            config_path,
            password_hash: RwLock::new(password_hash),
            run_lock: Arc::new(Semaphore::new(1)),
            run_state: Mutex::new(RunState::default()),
        })
    }

    /// Spawns one autorun loop per currently enabled instance. Snapshot at
    /// startup, same as the scheduler: instances added via a later config
    /// edit need a process restart to get their own loop.
    pub fn spawn_autorun_loops(self: &Arc<Self>) {
        for (app_type, instance_id) in self.engine.enabled_instances() {
            let state = self.clone();
            tokio::spawn(routes::autorun_instance_loop(state, app_type, instance_id));
        }
    }
}
