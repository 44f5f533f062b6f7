//! HTTP surface: status/settings JSON API, auth gate, and the bundled
//! static page.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use tower_http::services::{ServeDir, ServeFile};
use tower_http::trace::TraceLayer;

use crate::config::{ArrSyncInstanceConfig, AppConfig, RuntimeConfig};
use crate::engine::ProgressEvent;
use crate::error::StoreError;
use crate::store::Store;

use super::{auth, AppState, RecentAction};

const RECENT_ACTIONS_KEPT: usize = super::RECENT_ACTIONS_KEPT;

pub fn build_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/api/auth/status", get(auth_status))
        .route("/api/auth/bootstrap", post(auth_bootstrap))
        .route("/api/credentials/clear", post(clear_credentials))
        .route("/api/status", get(status))
        .route("/api/settings", get(get_settings).post(save_settings))
        .route("/api/run", post(run_now))
        .route("/api/run_instance", post(run_instance))
        .route("/api/autorun", post(set_autorun))
        .route("/favicon.ico", get(favicon))
        .route_layer(axum::middleware::from_fn_with_state(state.clone(), auth_gate));

    Router::new()
        .merge(api)
        .fallback_service(ServeDir::new("static").fallback(ServeFile::new("static/index.html")))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn unauthorized(msg: &str) -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({"error": msg}))).into_response()
}

fn internal_error(err: impl std::fmt::Display) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, Json(json!({"error": err.to_string()}))).into_response()
}

async fn auth_gate(State(state): State<Arc<AppState>>, headers: HeaderMap, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if !path.starts_with("/api/") || path == "/api/auth/status" || path == "/api/auth/bootstrap" {
        return next.run(request).await;
    }
    let password_hash = state.password_hash.read().await.clone();
    let Some(hash) = password_hash else {
        return unauthorized("Web UI password not set");
    };
    let authorization = headers.get(axum::http::header::AUTHORIZATION).and_then(|v| v.to_str().ok());
    let x_header = headers.get("X-Seekarr-Password").and_then(|v| v.to_str().ok());
    let candidate = auth::extract_password(authorization, x_header);
    if !auth::verify_password(&candidate, &hash) {
        return unauthorized("Unauthorized");
    }
    next.run(request).await
}

async fn auth_status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let set = state.password_hash.read().await.is_some();
    Json(json!({"password_set": set}))
}

#[derive(Debug, Deserialize, Default)]
struct BootstrapRequest {
    #[serde(default)]
    password: String,
}

async fn auth_bootstrap(State(state): State<Arc<AppState>>, Json(payload): Json<BootstrapRequest>) -> Response {
    let mut guard = state.password_hash.write().await;
    if guard.is_some() {
        return (StatusCode::CONFLICT, Json(json!({"error": "Password already set"}))).into_response();
    }
    let pw = payload.password.trim().to_string();
    if pw.len() < 8 {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "Password must be at least 8 characters"}))).into_response();
    }
    let hash = auth::hash_password(&pw);
    if let Err(err) = state.store.set_webui_password_hash(&hash) {
        return internal_error(err);
    }
    *guard = Some(hash);
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

#[derive(Debug, Deserialize, Default)]
struct ClearCredentialsRequest {
    #[serde(default)]
    app: String,
    #[serde(default)]
    instance_id: i64,
}

async fn clear_credentials(State(state): State<Arc<AppState>>, Json(payload): Json<ClearCredentialsRequest>) -> Response {
    let app = payload.app.trim().to_lowercase();
    if !matches!(app.as_str(), "radarr" | "sonarr") || payload.instance_id <= 0 {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid instance"}))).into_response();
    }
    match state.store.clear_arr_api_key(&app, payload.instance_id) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))).into_response(),
        Err(err) => internal_error(err),
    }
}

fn instance_row(app: &str, inst: &ArrSyncInstanceConfig, app_cfg: &AppConfig, store: &Store) -> Result<serde_json::Value, StoreError> {
    let has_stored_key = store.has_arr_api_key(app, inst.instance_id as i64)?;
    let api_key_set = has_stored_key || !inst.arr.api_key.is_empty();
    Ok(json!({
        "app": app,
        "instance_id": inst.instance_id,
        "instance_name": inst.instance_name,
        "enabled": inst.enabled,
        "interval_minutes": inst.interval_minutes,
        "search_missing": inst.search_missing,
        "search_cutoff_unmet": inst.search_cutoff_unmet,
        "search_order": inst.search_order,
        "quiet_hours_start": inst.quiet_hours_start.clone().unwrap_or_else(|| app_cfg.quiet_hours_start.clone()),
        "quiet_hours_end": inst.quiet_hours_end.clone().unwrap_or_else(|| app_cfg.quiet_hours_end.clone()),
        "min_hours_after_release": inst.min_hours_after_release.unwrap_or(app_cfg.min_hours_after_release),
        "min_seconds_between_actions": inst.min_seconds_between_actions.unwrap_or(app_cfg.min_seconds_between_actions),
        "max_missing_actions_per_instance_per_sync": inst
            .max_missing_actions_per_instance_per_sync
            .unwrap_or(app_cfg.max_missing_actions_per_instance_per_sync),
        "max_cutoff_actions_per_instance_per_sync": inst
            .max_cutoff_actions_per_instance_per_sync
            .unwrap_or(app_cfg.max_cutoff_actions_per_instance_per_sync),
        "sonarr_missing_mode": inst.sonarr_missing_mode,
        "item_retry_hours": inst.item_retry_hours.unwrap_or(app_cfg.item_retry_hours),
        "rate_window_minutes": inst.rate_window_minutes.unwrap_or(app_cfg.rate_window_minutes),
        "rate_cap": inst.rate_cap.unwrap_or(app_cfg.rate_cap_per_instance),
        "arr_enabled": inst.enabled,
        "arr_url": inst.arr.url,
        "api_key_set": api_key_set,
    }))
}

fn config_view(cfg: &RuntimeConfig, store: &Store) -> Result<serde_json::Value, StoreError> {
    let mut rows = Vec::new();
    for inst in &cfg.radarr_instances {
        rows.push(instance_row("radarr", inst, &cfg.app, store)?);
    }
    for inst in &cfg.sonarr_instances {
        rows.push(instance_row("sonarr", inst, &cfg.app, store)?);
    }
    Ok(json!({"instances": rows}))
}

async fn status(State(state): State<Arc<AppState>>) -> Response {
    let cfg = state.engine.snapshot_config();
    let now = Utc::now();

    let mut rate_status = serde_json::Map::new();
    let mut instance_last_run = serde_json::Map::new();
    let mut search_history = serde_json::Map::new();

    for (app_type, instances) in [("radarr", &cfg.radarr_instances), ("sonarr", &cfg.sonarr_instances)] {
        for inst in instances.iter() {
            let key = format!("{app_type}:{}", inst.instance_id);
            let window_minutes = inst.rate_window_minutes.unwrap_or(cfg.app.rate_window_minutes);
            let since = now - chrono::Duration::minutes(window_minutes as i64);
            let used = state
                .store
                .count_search_events_since(app_type, inst.instance_id as i64, since)
                .unwrap_or(0);
            rate_status.insert(key.clone(), json!({"used": used, "window_minutes": window_minutes}));

            let last_run = state.store.get_last_instance_run(app_type, inst.instance_id as i64).unwrap_or(None);
            instance_last_run.insert(key.clone(), json!(last_run));

            let actions = state
                .store
                .get_recent_search_actions(app_type, inst.instance_id as i64, 50)
                .unwrap_or_default();
            search_history.insert(key, json!(actions));
        }
    }

    let cfg_view = match config_view(&cfg, &state.store) {
        Ok(v) => v,
        Err(err) => return internal_error(err),
    };

    let run_state = state.run_state.lock().expect("run_state mutex poisoned").clone();

    Json(json!({
        "server_time_utc": now.to_rfc3339(),
        "config": cfg_view,
        "sync_status": state.store.get_sync_statuses().unwrap_or_default(),
        "recent_runs": state.store.get_recent_runs(20).unwrap_or_default(),
        "rate_status": rate_status,
        "instance_last_run": instance_last_run,
        "search_history": search_history,
        "run_state": run_state,
        "scheduler_heartbeat": state.store.get_scheduler_heartbeat().unwrap_or(None),
    }))
    .into_response()
}

async fn get_settings(State(state): State<Arc<AppState>>) -> Response {
    let cfg = state.engine.snapshot_config();
    match config_view(&cfg, &state.store) {
        Ok(v) => Json(json!({"instances": v.get("instances").cloned().unwrap_or_else(|| json!([]))})).into_response(),
        Err(err) => internal_error(err),
    }
}

#[derive(Debug, Deserialize, Default)]
struct SettingsInstanceRow {
    #[serde(default)]
    app: String,
    #[serde(default)]
    instance_id: i64,
    enabled: Option<bool>,
    search_missing: Option<bool>,
    search_cutoff_unmet: Option<bool>,
    search_order: Option<String>,
    quiet_hours_start: Option<String>,
    quiet_hours_end: Option<String>,
    min_hours_after_release: Option<i64>,
    min_seconds_between_actions: Option<i64>,
    max_missing_actions_per_instance_per_sync: Option<i64>,
    max_cutoff_actions_per_instance_per_sync: Option<i64>,
    sonarr_missing_mode: Option<String>,
    interval_minutes: Option<i64>,
    item_retry_hours: Option<i64>,
    rate_window_minutes: Option<i64>,
    rate_cap: Option<i64>,
    arr_url: Option<String>,
    arr_api_key: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct SaveSettingsRequest {
    #[serde(default)]
    instances: Vec<SettingsInstanceRow>,
}

async fn save_settings(State(state): State<Arc<AppState>>, Json(payload): Json<SaveSettingsRequest>) -> Response {
    match apply_settings(&state, &payload.instances) {
        Ok(()) => (StatusCode::OK, Json(json!({"ok": true}))).into_response(),
        Err(msg) => (StatusCode::BAD_REQUEST, Json(json!({"error": msg}))).into_response(),
    }
}

fn yaml_key(key: &str) -> serde_yaml::Value {
    serde_yaml::Value::String(key.to_string())
}

fn get_or_insert_mapping<'a>(map: &'a mut serde_yaml::Mapping, key: &str) -> Result<&'a mut serde_yaml::Mapping, String> {
    if map.get(yaml_key(key)).is_none() {
        map.insert(yaml_key(key), serde_yaml::Value::Mapping(serde_yaml::Mapping::new()));
    }
    match map.get_mut(yaml_key(key)) {
        Some(serde_yaml::Value::Mapping(m)) => Ok(m),
        _ => Err(format!("{key} is not a YAML mapping")),
    }
}

fn get_or_insert_sequence<'a>(map: &'a mut serde_yaml::Mapping, key: &str) -> Result<&'a mut Vec<serde_yaml::Value>, String> {
    if map.get(yaml_key(key)).is_none() {
        map.insert(yaml_key(key), serde_yaml::Value::Sequence(Vec::new()));
    }
    match map.get_mut(yaml_key(key)) {
        Some(serde_yaml::Value::Sequence(s)) => Ok(s),
        _ => Err(format!("{key} is not a YAML sequence")),
    }
}

fn set_bool(map: &mut serde_yaml::Mapping, key: &str, value: bool) {
    map.insert(serde_yaml::Value::String(key.to_string()), serde_yaml::Value::Bool(value));
}

fn set_str(map: &mut serde_yaml::Mapping, key: &str, value: &str) {
    map.insert(serde_yaml::Value::String(key.to_string()), serde_yaml::Value::String(value.to_string()));
}

fn set_u64(map: &mut serde_yaml::Mapping, key: &str, value: u64) {
    map.insert(serde_yaml::Value::String(key.to_string()), serde_yaml::Value::Number(value.into()));
}

/// Applies the UI-editable subset of instance settings directly onto the
/// YAML document, preserving every key the UI doesn't know about, then
/// reloads the live config. App-level settings are intentionally not
/// editable through this endpoint.
fn apply_settings(state: &AppState, rows: &[SettingsInstanceRow]) -> Result<(), String> {
    let text = std::fs::read_to_string(&state.config_path).map_err(|e| e.to_string())?;
    let mut root: serde_yaml::Value = serde_yaml::from_str(&text).map_err(|e| e.to_string())?;
    let root_map = root.as_mapping_mut().ok_or_else(|| "config file is not a YAML mapping".to_string())?;

    let app_cfg = state.engine.snapshot_config().app;
    update_instances_yaml(root_map, "radarr", rows, &app_cfg, &state.store)?;
    update_instances_yaml(root_map, "sonarr", rows, &app_cfg, &state.store)?;

    let rendered = serde_yaml::to_string(&root).map_err(|e| e.to_string())?;
    std::fs::write(&state.config_path, rendered).map_err(|e| e.to_string())?;

    let config_path_str = state.config_path.to_string_lossy().into_owned();
    let new_config = crate::config::load_config(&config_path_str).map_err(|e| e.to_string())?;
    if new_config.app.db_path.trim() != app_cfg.db_path.trim() {
        return Err("Changing app.db_path via Web UI is not supported. Edit config and restart.".to_string());
    }
    state.engine.reload_config(new_config);
    Ok(())
}

fn update_instances_yaml(
    root: &mut serde_yaml::Mapping,
    arr_key: &str,
    rows: &[SettingsInstanceRow],
    app_cfg: &AppConfig,
    store: &Store,
) -> Result<(), String> {
    let mut ui_map: HashMap<i64, &SettingsInstanceRow> = HashMap::new();
    for row in rows {
        if row.app.trim().to_lowercase() != arr_key || row.instance_id <= 0 {
            continue;
        }
        ui_map.insert(row.instance_id, row);
    }

    let section = get_or_insert_mapping(root, arr_key)?;
    let instances = get_or_insert_sequence(section, "instances")?;

    for instance in instances.iter_mut() {
        let serde_yaml::Value::Mapping(inst) = instance else { continue };
        let instance_id = inst
            .get(serde_yaml::Value::String("instance_id".to_string()))
            .and_then(serde_yaml::Value::as_u64)
            .unwrap_or(0) as i64;
        let Some(ui) = ui_map.get(&instance_id) else { continue };

        set_bool(inst, "enabled", ui.enabled.unwrap_or(true));
        set_bool(inst, "search_missing", ui.search_missing.unwrap_or(true));
        set_bool(inst, "search_cutoff_unmet", ui.search_cutoff_unmet.unwrap_or(true));
        if let Some(order) = &ui.search_order {
            set_str(inst, "search_order", &order.trim().to_lowercase());
        }
        if let Some(v) = &ui.quiet_hours_start {
            set_str(inst, "quiet_hours_start", v.trim());
        }
        if let Some(v) = &ui.quiet_hours_end {
            set_str(inst, "quiet_hours_end", v.trim());
        }
        if let Some(v) = ui.min_hours_after_release {
            set_u64(inst, "min_hours_after_release", v.max(0) as u64);
        }
        if let Some(v) = ui.min_seconds_between_actions {
            set_u64(inst, "min_seconds_between_actions", v.max(0) as u64);
        }
        if let Some(v) = ui.max_missing_actions_per_instance_per_sync {
            set_u64(inst, "max_missing_actions_per_instance_per_sync", v.max(0) as u64);
        }
        if let Some(v) = ui.max_cutoff_actions_per_instance_per_sync {
            set_u64(inst, "max_cutoff_actions_per_instance_per_sync", v.max(0) as u64);
        }
        if let Some(mode) = &ui.sonarr_missing_mode {
            set_str(inst, "sonarr_missing_mode", &mode.trim().to_lowercase());
        }
        let interval = ui.interval_minutes.unwrap_or(15).max(1) as u64;
        set_u64(inst, "interval_minutes", interval);
        let item_retry = ui.item_retry_hours.unwrap_or(app_cfg.item_retry_hours as i64).max(1) as u64;
        set_u64(inst, "item_retry_hours", item_retry);
        let rate_window = ui.rate_window_minutes.unwrap_or(app_cfg.rate_window_minutes as i64).max(1) as u64;
        set_u64(inst, "rate_window_minutes", rate_window);
        let rate_cap = ui.rate_cap.unwrap_or(app_cfg.rate_cap_per_instance as i64).max(1) as u64;
        set_u64(inst, "rate_cap", rate_cap);

        let arr_block = get_or_insert_mapping(inst, arr_key)?;
        set_bool(arr_block, "enabled", ui.enabled.unwrap_or(true));
        if let Some(url) = &ui.arr_url {
            let url = url.trim();
            if !url.is_empty() {
                set_str(arr_block, "url", url);
            }
        }
        if let Some(api_key) = &ui.arr_api_key {
            let api_key = api_key.trim();
            if !api_key.is_empty() {
                store.set_arr_api_key(arr_key, instance_id, api_key).map_err(|e| e.to_string())?;
                set_str(arr_block, "api_key", "");
            }
        }
    }

    Ok(())
}

#[derive(Debug, Deserialize, Default)]
struct RunRequest {
    #[serde(default)]
    force: bool,
}

async fn run_now(State(state): State<Arc<AppState>>, Json(payload): Json<RunRequest>) -> Response {
    if !start_run_async(state.clone(), payload.force) {
        return (StatusCode::CONFLICT, Json(json!({"error": "Run already in progress"}))).into_response();
    }
    (StatusCode::ACCEPTED, Json(json!({"message": "Run started", "force": payload.force}))).into_response()
}

fn start_run_async(state: Arc<AppState>, force: bool) -> bool {
    let permit = match state.run_lock.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => return false,
    };
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
    let consumer_state = state.clone();
    tokio::spawn(apply_progress_events(consumer_state, rx));
    tokio::spawn(async move {
        let result = state.engine.run_cycle(force, Some(&tx)).await;
        drop(tx);
        if let Err(err) = result {
            tracing::error!(error = %err, "web UI run failed");
            let mut rs = state.run_state.lock().expect("run_state mutex poisoned");
            rs.running = false;
            rs.error = Some(err.to_string());
        }
        drop(permit);
    });
    true
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Deserialize, Default)]
struct RunInstanceRequest {
    #[serde(default)]
    app: String,
    #[serde(default)]
    instance_id: i64,
    #[serde(default = "default_true")]
    force: bool,
}

async fn run_instance(State(state): State<Arc<AppState>>, Json(payload): Json<RunInstanceRequest>) -> Response {
    let app_type = payload.app.trim().to_lowercase();
    if !matches!(app_type.as_str(), "radarr" | "sonarr") || payload.instance_id <= 0 {
        return (StatusCode::BAD_REQUEST, Json(json!({"error": "Invalid instance"}))).into_response();
    }
    let permit = match state.run_lock.clone().try_acquire_owned() {
        Ok(p) => p,
        Err(_) => return (StatusCode::CONFLICT, Json(json!({"error": "Run already in progress"}))).into_response(),
    };

    let instance_id = payload.instance_id;
    let force = payload.force;
    let state_bg = state.clone();
    let app_type_bg = app_type.clone();
    tokio::spawn(async move {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let consumer = tokio::spawn(apply_progress_events(state_bg.clone(), rx));
        let result = state_bg.engine.run_instance(&app_type_bg, instance_id, force, Some(&tx)).await;
        drop(tx);
        let _ = consumer.await;
        if let Err(err) = result {
            tracing::error!(app_type = %app_type_bg, instance_id, error = %err, "web UI instance run failed");
            let mut rs = state_bg.run_state.lock().expect("run_state mutex poisoned");
            rs.running = false;
            rs.error = Some(err.to_string());
        }
        drop(permit);
    });

    (
        StatusCode::ACCEPTED,
        Json(json!({"message": format!("Instance run started: {app_type}:{instance_id}"), "force": force})),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
struct AutorunRequest {
    #[serde(default = "default_true")]
    enabled: bool,
}

async fn set_autorun(State(state): State<Arc<AppState>>, Json(payload): Json<AutorunRequest>) -> Response {
    let mut rs = state.run_state.lock().expect("run_state mutex poisoned");
    rs.autorun_enabled = payload.enabled;
    (StatusCode::OK, Json(json!({"autorun_enabled": payload.enabled}))).into_response()
}

async fn favicon() -> StatusCode {
    StatusCode::NO_CONTENT
}

fn event_type_name(event: &ProgressEvent) -> &'static str {
    match event {
        ProgressEvent::CycleStarted { .. } => "cycle_started",
        ProgressEvent::InstanceStarted { .. } => "instance_started",
        ProgressEvent::InstanceFinished { .. } => "instance_finished",
        ProgressEvent::ItemTriggered { .. } => "item_triggered",
        ProgressEvent::ItemSkippedNotReleased { .. } => "item_skipped_not_released",
        ProgressEvent::ItemSkippedRateLimit { .. } => "item_skipped_rate_limit",
        ProgressEvent::ItemSkippedCooldown { .. } => "item_skipped_cooldown",
        ProgressEvent::CycleFinished { .. } => "cycle_finished",
    }
}

/// Drains a cycle/instance run's progress events into the shared
/// [`super::RunState`] snapshot. Exits once every sender side is dropped.
async fn apply_progress_events(state: Arc<AppState>, mut rx: tokio::sync::mpsc::UnboundedReceiver<ProgressEvent>) {
    while let Some(event) = rx.recv().await {
        let type_name = event_type_name(&event);
        let mut rs = state.run_state.lock().expect("run_state mutex poisoned");
        rs.last_event = Some(type_name.to_string());
        match event {
            ProgressEvent::CycleStarted { force } => {
                rs.running = true;
                rs.force = force;
                rs.started_at = Some(Utc::now().to_rfc3339());
                rs.actions_triggered = 0;
                rs.actions_skipped_cooldown = 0;
                rs.actions_skipped_rate_limit = 0;
                rs.last_title = None;
                rs.error = None;
                rs.active_app_type = None;
                rs.active_instance_id = None;
                rs.active_instance_name = None;
            }
            ProgressEvent::InstanceStarted { app_type, instance_id, instance_name } => {
                rs.active_app_type = Some(app_type);
                rs.active_instance_id = Some(instance_id);
                rs.active_instance_name = Some(instance_name);
            }
            ProgressEvent::ItemTriggered { app_type, instance_name, title, .. } => {
                rs.actions_triggered += 1;
                rs.last_title = Some(title.clone());
                rs.recent_actions.push_back(RecentAction { ts: Utc::now().to_rfc3339(), app_type, instance_name, title });
                while rs.recent_actions.len() > RECENT_ACTIONS_KEPT {
                    rs.recent_actions.pop_front();
                }
            }
            ProgressEvent::ItemSkippedCooldown { .. } => {
                rs.actions_skipped_cooldown += 1;
            }
            ProgressEvent::ItemSkippedRateLimit { .. } => {
                rs.actions_skipped_rate_limit += 1;
            }
            ProgressEvent::ItemSkippedNotReleased { .. } => {}
            ProgressEvent::InstanceFinished { app_type, instance_id, .. } => {
                if rs.active_app_type.as_deref() == Some(app_type.as_str()) && rs.active_instance_id == Some(instance_id) {
                    rs.active_app_type = None;
                    rs.active_instance_id = None;
                    rs.active_instance_name = None;
                }
            }
            ProgressEvent::CycleFinished { status, .. } => {
                rs.running = false;
                rs.error = if status == "ok" { None } else { Some(status) };
                rs.active_app_type = None;
                rs.active_instance_id = None;
                rs.active_instance_name = None;
            }
        }
    }
}

/// Independent per-instance autorun loop, started once per enabled instance
/// when the Web UI process boots. Mirrors [`crate::scheduler::run_scheduler`]
/// but shares its run lock and progress reporting with manual `/api/run*`
/// triggers instead of owning its own.
pub async fn autorun_instance_loop(state: Arc<AppState>, app_type: String, instance_id: i64) {
    loop {
        if let Err(err) = state.engine.mark_heartbeat() {
            tracing::warn!(error = %err, "failed to record scheduler heartbeat");
        }

        let enabled = {
            let mut rs = state.run_state.lock().expect("run_state mutex poisoned");
            rs.autorun_last_check = Some(Utc::now().to_rfc3339());
            rs.autorun_enabled
        };
        if !enabled {
            tokio::time::sleep(Duration::from_secs(1)).await;
            continue;
        }

        let due_at = match state.engine.next_due_at(&app_type, instance_id) {
            Ok(v) => v,
            Err(err) => {
                tracing::error!(%app_type, instance_id, error = %err, "autorun loop failed to read next sync time");
                tokio::time::sleep(Duration::from_secs(5)).await;
                continue;
            }
        };
        if let Some(due_at) = due_at {
            let now = Utc::now();
            if due_at > now {
                let wait = (due_at - now).to_std().unwrap_or(Duration::ZERO).min(Duration::from_secs(300));
                tokio::time::sleep(wait).await;
                continue;
            }
        }

        let permit = match state.run_lock.clone().try_acquire_owned() {
            Ok(p) => p,
            Err(_) => {
                tokio::time::sleep(Duration::from_secs(1)).await;
                continue;
            }
        };
        {
            let mut rs = state.run_state.lock().expect("run_state mutex poisoned");
            rs.autorun_last_run_started = Some(Utc::now().to_rfc3339());
        }

        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let consumer = tokio::spawn(apply_progress_events(state.clone(), rx));
        let result = state.engine.run_instance(&app_type, instance_id, false, Some(&tx)).await;
        drop(tx);
        let _ = consumer.await;
        drop(permit);

        if let Err(err) = result {
            tracing::error!(%app_type, instance_id, error = %err, "autorun loop run failed");
            tokio::time::sleep(Duration::from_secs(5)).await;
        }
    }
}
