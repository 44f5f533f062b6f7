//! Persistent state: action history, rate tracking, sync scheduling,
//! credentials, and Web UI settings.

pub mod crypto;

use std::path::Path;

use chrono::{DateTime, Duration, Utc};
use r2d2::Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::{params, OptionalExtension};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::StoreError;
use crypto::CredentialCipher;

fn utc_now() -> String {
    Utc::now().to_rfc3339()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SearchAction {
    pub id: i64,
    pub app_type: String,
    pub instance_id: i64,
    pub instance_name: String,
    pub item_key: String,
    pub title: String,
    pub occurred_at: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CycleRecord {
    pub id: i64,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub stats: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct InstanceRunRecord {
    pub id: i64,
    pub cycle_run_id: i64,
    pub app_type: String,
    pub instance_id: i64,
    pub instance_name: String,
    pub started_at: String,
    pub finished_at: Option<String>,
    pub status: String,
    pub stats: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SyncStatusRecord {
    pub app_type: String,
    pub instance_id: i64,
    pub last_sync_time: Option<String>,
    pub next_sync_time: Option<String>,
}

/// Freeform per-instance Web UI overrides, stored as loosely typed columns
/// so the UI can persist a partial edit without the store validating
/// business rules (the loaded `RuntimeConfig` does that at startup).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct UiInstanceSettings {
    pub enabled: Option<bool>,
    pub interval_minutes: Option<i64>,
    pub search_missing: Option<bool>,
    pub search_cutoff_unmet: Option<bool>,
    pub search_order: Option<String>,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub min_hours_after_release: Option<i64>,
    pub min_seconds_between_actions: Option<i64>,
    pub max_missing_actions_per_instance_per_sync: Option<i64>,
    pub max_cutoff_actions_per_instance_per_sync: Option<i64>,
    pub sonarr_missing_mode: Option<String>,
    pub item_retry_hours: Option<i64>,
    pub rate_window_minutes: Option<i64>,
    pub rate_cap: Option<i64>,
    pub arr_url: Option<String>,
}

/// Thread-safe, pool-backed handle onto the sqlite state database.
pub struct Store {
    pool: Pool<SqliteConnectionManager>,
    cipher: CredentialCipher,
}

impl Store {
    pub fn open(db_path: &str) -> Result<Self, StoreError> {
        let path = Path::new(db_path);
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let manager = SqliteConnectionManager::file(path);
        let pool = Pool::builder().max_size(8).build(manager)?;
        let store = Self {
            pool,
            cipher: CredentialCipher::load_or_create(path.parent().unwrap_or_else(|| Path::new(".")))?,
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS item_action (
                hunt_type TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                item_key TEXT NOT NULL,
                last_action_at TEXT NOT NULL,
                last_guid TEXT,
                title TEXT,
                PRIMARY KEY (hunt_type, instance_id, item_key)
            );
            CREATE TABLE IF NOT EXISTS cycle_run (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                stats_json TEXT
            );
            CREATE TABLE IF NOT EXISTS sync_status (
                hunt_type TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                last_sync_time TEXT,
                next_sync_time TEXT,
                PRIMARY KEY (hunt_type, instance_id)
            );
            CREATE TABLE IF NOT EXISTS search_event (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hunt_type TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_search_event_lookup
            ON search_event(hunt_type, instance_id, occurred_at);
            CREATE TABLE IF NOT EXISTS search_action (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                hunt_type TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                instance_name TEXT,
                item_key TEXT,
                title TEXT NOT NULL,
                occurred_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_search_action_lookup
            ON search_action(hunt_type, instance_id, id DESC);
            CREATE TABLE IF NOT EXISTS instance_run (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                cycle_run_id INTEGER NOT NULL,
                hunt_type TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                instance_name TEXT,
                started_at TEXT NOT NULL,
                finished_at TEXT,
                status TEXT NOT NULL,
                stats_json TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_instance_run_lookup
            ON instance_run(hunt_type, instance_id, id DESC);
            CREATE TABLE IF NOT EXISTS scheduler_heartbeat (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS arr_credentials (
                app_type TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                api_key_enc TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (app_type, instance_id)
            );
            CREATE TABLE IF NOT EXISTS webui_auth (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                password_hash TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ui_app_settings (
                id INTEGER PRIMARY KEY CHECK (id = 1),
                quiet_hours_timezone TEXT,
                updated_at TEXT NOT NULL
            );
            CREATE TABLE IF NOT EXISTS ui_instance_settings (
                app_type TEXT NOT NULL,
                instance_id INTEGER NOT NULL,
                enabled INTEGER,
                interval_minutes INTEGER,
                search_missing INTEGER,
                search_cutoff_unmet INTEGER,
                search_order TEXT,
                quiet_hours_start TEXT,
                quiet_hours_end TEXT,
                min_hours_after_release INTEGER,
                min_seconds_between_actions INTEGER,
                max_missing_actions_per_instance_per_sync INTEGER,
                max_cutoff_actions_per_instance_per_sync INTEGER,
                sonarr_missing_mode TEXT,
                item_retry_hours INTEGER,
                rate_window_minutes INTEGER,
                rate_cap INTEGER,
                arr_url TEXT,
                updated_at TEXT NOT NULL,
                PRIMARY KEY (app_type, instance_id)
            );
            "#,
        )?;
        Ok(())
    }

    // -- Web UI auth -----------------------------------------------------

    pub fn get_webui_password_hash(&self) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        let value: Option<String> = conn
            .query_row("SELECT password_hash FROM webui_auth WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(value.map(|v| v.trim().to_string()).filter(|v| !v.is_empty()))
    }

    pub fn set_webui_password_hash(&self, password_hash: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO webui_auth(id, password_hash, updated_at) VALUES(1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET password_hash=excluded.password_hash, updated_at=excluded.updated_at",
            params![password_hash, utc_now()],
        )?;
        Ok(())
    }

    // -- Credentials -------------------------------------------------------

    pub fn has_arr_api_key(&self, app_type: &str, instance_id: i64) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let found: Option<i64> = conn
            .query_row(
                "SELECT 1 FROM arr_credentials WHERE app_type = ?1 AND instance_id = ?2",
                params![app_type, instance_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(found.is_some())
    }

    pub fn set_arr_api_key(&self, app_type: &str, instance_id: i64, api_key: &str) -> Result<(), StoreError> {
        let token = self.cipher.encrypt(api_key);
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO arr_credentials(app_type, instance_id, api_key_enc, updated_at) VALUES(?1, ?2, ?3, ?4)
             ON CONFLICT(app_type, instance_id) DO UPDATE SET api_key_enc=excluded.api_key_enc, updated_at=excluded.updated_at",
            params![app_type, instance_id, token, utc_now()],
        )?;
        Ok(())
    }

    pub fn get_arr_api_key(&self, app_type: &str, instance_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        let token: Option<String> = conn
            .query_row(
                "SELECT api_key_enc FROM arr_credentials WHERE app_type = ?1 AND instance_id = ?2",
                params![app_type, instance_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(token.and_then(|t| self.cipher.decrypt(&t)))
    }

    pub fn clear_arr_api_key(&self, app_type: &str, instance_id: i64) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "DELETE FROM arr_credentials WHERE app_type = ?1 AND instance_id = ?2",
            params![app_type, instance_id],
        )?;
        Ok(())
    }

    // -- Web UI settings -----------------------------------------------------

    pub fn get_ui_app_settings(&self) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        let value: Option<String> = conn
            .query_row("SELECT quiet_hours_timezone FROM ui_app_settings WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(value.map(|v| v.trim().to_string()))
    }

    pub fn set_ui_app_settings(&self, quiet_hours_timezone: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO ui_app_settings(id, quiet_hours_timezone, updated_at) VALUES(1, ?1, ?2)
             ON CONFLICT(id) DO UPDATE SET quiet_hours_timezone=excluded.quiet_hours_timezone, updated_at=excluded.updated_at",
            params![quiet_hours_timezone.trim(), utc_now()],
        )?;
        Ok(())
    }

    pub fn upsert_ui_instance_settings(
        &self,
        app_type: &str,
        instance_id: i64,
        values: &UiInstanceSettings,
    ) -> Result<(), StoreError> {
        let app_type = app_type.trim().to_lowercase();
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO ui_instance_settings(
                app_type, instance_id,
                enabled, interval_minutes, search_missing, search_cutoff_unmet, search_order,
                quiet_hours_start, quiet_hours_end,
                min_hours_after_release, min_seconds_between_actions,
                max_missing_actions_per_instance_per_sync, max_cutoff_actions_per_instance_per_sync,
                sonarr_missing_mode, item_retry_hours, rate_window_minutes, rate_cap, arr_url, updated_at
            )
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)
            ON CONFLICT(app_type, instance_id) DO UPDATE SET
                enabled=excluded.enabled,
                interval_minutes=excluded.interval_minutes,
                search_missing=excluded.search_missing,
                search_cutoff_unmet=excluded.search_cutoff_unmet,
                search_order=excluded.search_order,
                quiet_hours_start=excluded.quiet_hours_start,
                quiet_hours_end=excluded.quiet_hours_end,
                min_hours_after_release=excluded.min_hours_after_release,
                min_seconds_between_actions=excluded.min_seconds_between_actions,
                max_missing_actions_per_instance_per_sync=excluded.max_missing_actions_per_instance_per_sync,
                max_cutoff_actions_per_instance_per_sync=excluded.max_cutoff_actions_per_instance_per_sync,
                sonarr_missing_mode=excluded.sonarr_missing_mode,
                item_retry_hours=excluded.item_retry_hours,
                rate_window_minutes=excluded.rate_window_minutes,
                rate_cap=excluded.rate_cap,
                arr_url=excluded.arr_url,
                updated_at=excluded.updated_at
            "#,
            params![
                app_type,
                instance_id,
                values.enabled,
                values.interval_minutes,
                values.search_missing,
                values.search_cutoff_unmet,
                values.search_order,
                values.quiet_hours_start,
                values.quiet_hours_end,
                values.min_hours_after_release,
                values.min_seconds_between_actions,
                values.max_missing_actions_per_instance_per_sync,
                values.max_cutoff_actions_per_instance_per_sync,
                values.sonarr_missing_mode,
                values.item_retry_hours,
                values.rate_window_minutes,
                values.rate_cap,
                values.arr_url,
                utc_now(),
            ],
        )?;
        Ok(())
    }

    pub fn get_all_ui_instance_settings(
        &self,
    ) -> Result<Vec<((String, i64), UiInstanceSettings)>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT app_type, instance_id, enabled, interval_minutes, search_missing, search_cutoff_unmet,
                   search_order, quiet_hours_start, quiet_hours_end, min_hours_after_release,
                   min_seconds_between_actions, max_missing_actions_per_instance_per_sync,
                   max_cutoff_actions_per_instance_per_sync, sonarr_missing_mode, item_retry_hours,
                   rate_window_minutes, rate_cap, arr_url
            FROM ui_instance_settings
            "#,
        )?;
        let rows = stmt.query_map([], |row| {
            let app_type: String = row.get(0)?;
            let instance_id: i64 = row.get(1)?;
            let settings = UiInstanceSettings {
                enabled: row.get(2)?,
                interval_minutes: row.get(3)?,
                search_missing: row.get(4)?,
                search_cutoff_unmet: row.get(5)?,
                search_order: row.get(6)?,
                quiet_hours_start: row.get(7)?,
                quiet_hours_end: row.get(8)?,
                min_hours_after_release: row.get(9)?,
                min_seconds_between_actions: row.get(10)?,
                max_missing_actions_per_instance_per_sync: row.get(11)?,
                max_cutoff_actions_per_instance_per_sync: row.get(12)?,
                sonarr_missing_mode: row.get(13)?,
                item_retry_hours: row.get(14)?,
                rate_window_minutes: row.get(15)?,
                rate_cap: row.get(16)?,
                arr_url: row.get(17)?,
            };
            Ok(((app_type, instance_id), settings))
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- Admission / cooldown -----------------------------------------------

    pub fn item_on_cooldown(
        &self,
        hunt_type: &str,
        instance_id: i64,
        item_key: &str,
        retry_hours: i64,
    ) -> Result<bool, StoreError> {
        let conn = self.pool.get()?;
        let last_action_at: Option<String> = conn
            .query_row(
                "SELECT last_action_at FROM item_action WHERE hunt_type = ?1 AND instance_id = ?2 AND item_key = ?3",
                params![hunt_type, instance_id, item_key],
                |row| row.get(0),
            )
            .optional()?;
        let Some(raw) = last_action_at else {
            return Ok(false);
        };
        let Ok(last) = DateTime::parse_from_rfc3339(&raw) else {
            return Ok(false);
        };
        let last = last.with_timezone(&Utc);
        Ok(Utc::now() < last + Duration::hours(retry_hours))
    }

    pub fn mark_item_action(
        &self,
        hunt_type: &str,
        instance_id: i64,
        item_key: &str,
        guid: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO item_action(hunt_type, instance_id, item_key, last_action_at, last_guid, title)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6)
            ON CONFLICT(hunt_type, instance_id, item_key) DO UPDATE SET
                last_action_at=excluded.last_action_at, last_guid=excluded.last_guid, title=excluded.title
            "#,
            params![hunt_type, instance_id, item_key, utc_now(), guid, title],
        )?;
        Ok(())
    }

    // -- Sync scheduling -----------------------------------------------------

    pub fn get_next_sync_time(&self, hunt_type: &str, instance_id: i64) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        let value: Option<String> = conn
            .query_row(
                "SELECT next_sync_time FROM sync_status WHERE hunt_type = ?1 AND instance_id = ?2",
                params![hunt_type, instance_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.filter(|v| !v.is_empty()))
    }

    pub fn upsert_sync_status(
        &self,
        hunt_type: &str,
        instance_id: i64,
        last_sync_time: &str,
        next_sync_time: &str,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO sync_status(hunt_type, instance_id, last_sync_time, next_sync_time)
            VALUES(?1, ?2, ?3, ?4)
            ON CONFLICT(hunt_type, instance_id) DO UPDATE SET
                last_sync_time=excluded.last_sync_time, next_sync_time=excluded.next_sync_time
            "#,
            params![hunt_type, instance_id, last_sync_time, next_sync_time],
        )?;
        Ok(())
    }

    pub fn set_next_sync_time(&self, hunt_type: &str, instance_id: i64, next_sync_time: &str) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO sync_status(hunt_type, instance_id, next_sync_time)
            VALUES(?1, ?2, ?3)
            ON CONFLICT(hunt_type, instance_id) DO UPDATE SET next_sync_time=excluded.next_sync_time
            "#,
            params![hunt_type, instance_id, next_sync_time],
        )?;
        Ok(())
    }

    pub fn get_sync_statuses(&self) -> Result<Vec<SyncStatusRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT hunt_type, instance_id, last_sync_time, next_sync_time FROM sync_status ORDER BY hunt_type, instance_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok(SyncStatusRecord {
                app_type: row.get(0)?,
                instance_id: row.get(1)?,
                last_sync_time: row.get(2)?,
                next_sync_time: row.get(3)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    // -- Rate tracking -----------------------------------------------------

    pub fn record_search_event(&self, hunt_type: &str, instance_id: i64) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO search_event(hunt_type, instance_id, occurred_at) VALUES(?1, ?2, ?3)",
            params![hunt_type, instance_id, utc_now()],
        )?;
        Ok(())
    }

    pub fn count_search_events_since(
        &self,
        hunt_type: &str,
        instance_id: i64,
        since: DateTime<Utc>,
    ) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM search_event WHERE hunt_type = ?1 AND instance_id = ?2 AND occurred_at >= ?3",
            params![hunt_type, instance_id, since.to_rfc3339()],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    pub fn record_search_action(
        &self,
        hunt_type: &str,
        instance_id: i64,
        instance_name: &str,
        item_key: &str,
        title: &str,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO search_action(hunt_type, instance_id, instance_name, item_key, title, occurred_at) VALUES(?1, ?2, ?3, ?4, ?5, ?6)",
            params![hunt_type, instance_id, instance_name, item_key, title, utc_now()],
        )?;
        Ok(())
    }

    fn map_search_actions(conn: &rusqlite::Connection, sql: &str, args: &[&dyn rusqlite::ToSql]) -> Result<Vec<SearchAction>, StoreError> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt.query_map(args, |row| {
            Ok(SearchAction {
                id: row.get(0)?,
                app_type: row.get(1)?,
                instance_id: row.get(2)?,
                instance_name: row.get(3)?,
                item_key: row.get(4)?,
                title: row.get(5)?,
                occurred_at: row.get(6)?,
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_recent_search_actions(
        &self,
        hunt_type: &str,
        instance_id: i64,
        limit: i64,
    ) -> Result<Vec<SearchAction>, StoreError> {
        let conn = self.pool.get()?;
        Self::map_search_actions(
            &conn,
            "SELECT id, hunt_type, instance_id, instance_name, item_key, title, occurred_at
             FROM search_action WHERE hunt_type = ?1 AND instance_id = ?2 ORDER BY id DESC LIMIT ?3",
            params![hunt_type, instance_id, limit.max(1)],
        )
    }

    pub fn get_recent_search_actions_global(&self, limit: i64) -> Result<Vec<SearchAction>, StoreError> {
        let conn = self.pool.get()?;
        Self::map_search_actions(
            &conn,
            "SELECT id, hunt_type, instance_id, instance_name, item_key, title, occurred_at
             FROM search_action ORDER BY id DESC LIMIT ?1",
            params![limit.max(1)],
        )
    }

    // -- Heartbeat / cycle bookkeeping ---------------------------------------

    pub fn set_scheduler_heartbeat(&self) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO scheduler_heartbeat(id, updated_at) VALUES(1, ?1)
             ON CONFLICT(id) DO UPDATE SET updated_at=excluded.updated_at",
            params![utc_now()],
        )?;
        Ok(())
    }

    pub fn get_scheduler_heartbeat(&self) -> Result<Option<String>, StoreError> {
        let conn = self.pool.get()?;
        let value: Option<String> = conn
            .query_row("SELECT updated_at FROM scheduler_heartbeat WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        Ok(value)
    }

    pub fn start_run(&self) -> Result<i64, StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "INSERT INTO cycle_run(started_at, status) VALUES(?1, 'running')",
            params![utc_now()],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn finish_run(&self, run_id: i64, status: &str, stats: &JsonValue) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            "UPDATE cycle_run SET finished_at = ?1, status = ?2, stats_json = ?3 WHERE id = ?4",
            params![utc_now(), status, serde_json::to_string(stats)?, run_id],
        )?;
        Ok(())
    }

    pub fn get_recent_runs(&self, limit: i64) -> Result<Vec<CycleRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT id, started_at, finished_at, status, stats_json FROM cycle_run ORDER BY id DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit.max(1)], |row| {
            let stats_json: Option<String> = row.get(4)?;
            Ok(CycleRecord {
                id: row.get(0)?,
                started_at: row.get(1)?,
                finished_at: row.get(2)?,
                status: row.get(3)?,
                stats: stats_json
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(JsonValue::Null),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn record_instance_run(
        &self,
        cycle_run_id: i64,
        hunt_type: &str,
        instance_id: i64,
        instance_name: &str,
        started_at: &str,
        finished_at: &str,
        status: &str,
        stats: &JsonValue,
    ) -> Result<(), StoreError> {
        let conn = self.pool.get()?;
        conn.execute(
            r#"
            INSERT INTO instance_run(cycle_run_id, hunt_type, instance_id, instance_name, started_at, finished_at, status, stats_json)
            VALUES(?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
            "#,
            params![
                cycle_run_id,
                hunt_type,
                instance_id,
                instance_name,
                started_at,
                finished_at,
                status,
                serde_json::to_string(stats)?,
            ],
        )?;
        Ok(())
    }

    pub fn get_recent_instance_runs(
        &self,
        hunt_type: &str,
        instance_id: i64,
        limit: i64,
    ) -> Result<Vec<InstanceRunRecord>, StoreError> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            r#"
            SELECT id, cycle_run_id, hunt_type, instance_id, instance_name, started_at, finished_at, status, stats_json
            FROM instance_run WHERE hunt_type = ?1 AND instance_id = ?2 ORDER BY id DESC LIMIT ?3
            "#,
        )?;
        let rows = stmt.query_map(params![hunt_type, instance_id, limit.max(1)], |row| {
            let stats_json: Option<String> = row.get(8)?;
            Ok(InstanceRunRecord {
                id: row.get(0)?,
                cycle_run_id: row.get(1)?,
                app_type: row.get(2)?,
                instance_id: row.get(3)?,
                instance_name: row.get(4)?,
                started_at: row.get(5)?,
                finished_at: row.get(6)?,
                status: row.get(7)?,
                stats: stats_json
                    .and_then(|s| serde_json::from_str(&s).ok())
                    .unwrap_or(JsonValue::Null),
            })
        })?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    pub fn get_last_instance_run(
        &self,
        hunt_type: &str,
        instance_id: i64,
    ) -> Result<Option<InstanceRunRecord>, StoreError> {
        let rows = self.get_recent_instance_runs(hunt_type, instance_id, 1)?;
        Ok(rows.into_iter().next())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp_store() -> (tempfile::TempDir, Store) {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("seekarr.db");
        let store = Store::open(db_path.to_str().unwrap()).unwrap();
        (dir, store)
    }

    #[test]
    fn cooldown_starts_false_and_becomes_true_after_marking() {
        let (_dir, store) = open_temp_store();
        assert!(!store.item_on_cooldown("radarr", 1, "movie:1", 72).unwrap());
        store.mark_item_action("radarr", 1, "movie:1", "guid-1", "Some Movie").unwrap();
        assert!(store.item_on_cooldown("radarr", 1, "movie:1", 72).unwrap());
    }

    #[test]
    fn credential_round_trip() {
        let (_dir, store) = open_temp_store();
        assert!(!store.has_arr_api_key("radarr", 1).unwrap());
        store.set_arr_api_key("radarr", 1, "abc123").unwrap();
        assert!(store.has_arr_api_key("radarr", 1).unwrap());
        assert_eq!(store.get_arr_api_key("radarr", 1).unwrap().as_deref(), Some("abc123"));
        store.clear_arr_api_key("radarr", 1).unwrap();
        assert!(!store.has_arr_api_key("radarr", 1).unwrap());
    }

    #[test]
    fn sync_status_round_trip() {
        let (_dir, store) = open_temp_store();
        assert_eq!(store.get_next_sync_time("radarr", 1).unwrap(), None);
        store.upsert_sync_status("radarr", 1, &utc_now(), "2026-01-01T00:00:00+00:00").unwrap();
        assert_eq!(
            store.get_next_sync_time("radarr", 1).unwrap().as_deref(),
            Some("2026-01-01T00:00:00+00:00")
        );
    }

    #[test]
    fn search_event_counting_respects_window() {
        let (_dir, store) = open_temp_store();
        store.record_search_event("radarr", 1).unwrap();
        let since = Utc::now() - Duration::minutes(5);
        assert_eq!(store.count_search_events_since("radarr", 1, since).unwrap(), 1);
        let future = Utc::now() + Duration::minutes(5);
        assert_eq!(store.count_search_events_since("radarr", 1, future).unwrap(), 0);
    }

    #[test]
    fn cycle_run_lifecycle() {
        let (_dir, store) = open_temp_store();
        let run_id = store.start_run().unwrap();
        store.finish_run(run_id, "ok", &serde_json::json!({"triggered": 3})).unwrap();
        let recent = store.get_recent_runs(10).unwrap();
        assert_eq!(recent.len(), 1);
        assert_eq!(recent[0].status, "ok");
        assert_eq!(recent[0].stats["triggered"], 3);
    }
}
