//! Configuration loading: YAML file on disk, `${VAR}` environment
//! interpolation, a `.env` cascade, legacy key aliases, and auto-creation of
//! a usable default config on first run.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;
use std::env;
use std::path::{Path, PathBuf};

use crate::error::ConfigError;

static ENV_PATTERN: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").unwrap());

/// App-wide defaults, overridable per instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub db_path: String,
    pub item_retry_hours: u32,
    pub min_hours_after_release: u32,
    pub quiet_hours_start: String,
    pub quiet_hours_end: String,
    pub quiet_hours_timezone: String,
    pub max_missing_actions_per_instance_per_sync: u32,
    pub max_cutoff_actions_per_instance_per_sync: u32,
    pub min_seconds_between_actions: u32,
    pub rate_window_minutes: u32,
    pub rate_cap_per_instance: u32,
    pub request_timeout_seconds: u32,
    pub verify_ssl: bool,
    pub log_level: String,
}

/// Connection details for a single Radarr/Sonarr instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrConfig {
    pub enabled: bool,
    pub url: String,
    pub api_key: String,
}

/// One configured Radarr or Sonarr instance and its overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArrSyncInstanceConfig {
    pub instance_id: u32,
    pub instance_name: String,
    pub enabled: bool,
    pub interval_minutes: u32,
    pub search_missing: bool,
    pub search_cutoff_unmet: bool,
    /// `newest`, `random`, `oldest`, or `smart`.
    pub search_order: String,
    pub quiet_hours_start: Option<String>,
    pub quiet_hours_end: Option<String>,
    pub min_hours_after_release: Option<u32>,
    pub min_seconds_between_actions: Option<u32>,
    pub max_missing_actions_per_instance_per_sync: Option<u32>,
    pub max_cutoff_actions_per_instance_per_sync: Option<u32>,
    /// Sonarr only: `smart`, `season_packs`, `shows`, or `episodes`.
    pub sonarr_missing_mode: String,
    pub item_retry_hours: Option<u32>,
    pub rate_window_minutes: Option<u32>,
    pub rate_cap: Option<u32>,
    pub arr: ArrConfig,
}

/// Fully resolved configuration for a scheduler/web UI process.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub app: AppConfig,
    pub radarr_instances: Vec<ArrSyncInstanceConfig>,
    pub sonarr_instances: Vec<ArrSyncInstanceConfig>,
}

fn expand_env(value: Value) -> Value {
    match value {
        Value::String(s) => {
            let replaced = ENV_PATTERN.replace_all(&s, |caps: &regex::Captures| {
                env::var(&caps[1]).unwrap_or_default()
            });
            Value::String(replaced.into_owned())
        }
        Value::Mapping(map) => Value::Mapping(
            map.into_iter()
                .map(|(k, v)| (k, expand_env(v)))
                .collect(),
        ),
        Value::Sequence(seq) => Value::Sequence(seq.into_iter().map(expand_env).collect()),
        other => other,
    }
}

fn require_str(map: &serde_yaml::Mapping, key: &str, default: &str) -> String {
    map.get(Value::String(key.to_string()))
        .and_then(|v| match v {
            Value::Null => None,
            Value::String(s) => Some(s.clone()),
            other => Some(yaml_scalar_to_string(other)),
        })
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| default.to_string())
}

fn yaml_scalar_to_string(value: &Value) -> String {
    match value {
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.clone(),
        _ => String::new(),
    }
}

fn get_u32(map: &serde_yaml::Mapping, key: &str, default: u32, min: u32) -> u32 {
    let raw = map
        .get(Value::String(key.to_string()))
        .and_then(Value::as_u64)
        .map(|v| v as u32)
        .unwrap_or(default);
    raw.max(min)
}

fn get_opt_u32(map: &serde_yaml::Mapping, key: &str) -> Option<u32> {
    map.get(Value::String(key.to_string()))
        .and_then(Value::as_u64)
        .map(|v| v as u32)
}

fn get_bool(map: &serde_yaml::Mapping, key: &str, default: bool) -> bool {
    map.get(Value::String(key.to_string()))
        .and_then(Value::as_bool)
        .unwrap_or(default)
}

fn get_opt_str(map: &serde_yaml::Mapping, key: &str) -> Option<String> {
    match map.get(Value::String(key.to_string())) {
        Some(Value::Null) | None => None,
        Some(v) => Some(yaml_scalar_to_string(v).trim().to_string()),
    }
}

fn as_mapping(value: Option<&Value>) -> serde_yaml::Mapping {
    match value {
        Some(Value::Mapping(m)) => m.clone(),
        _ => serde_yaml::Mapping::new(),
    }
}

/// Prefers `config_dir/.env`, then `cwd/.env`. Only sets variables not
/// already present in the process environment. Stops at the first file found.
fn load_dotenv_if_present(config_path: &Path) {
    let mut candidates = Vec::new();
    if let Some(parent) = config_path.parent() {
        candidates.push(parent.join(".env"));
    }
    if let Ok(cwd) = env::current_dir() {
        candidates.push(cwd.join(".env"));
    }

    for candidate in candidates {
        let Ok(contents) = std::fs::read_to_string(&candidate) else {
            continue;
        };
        for raw_line in contents.lines() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let key = key.trim();
            let value = value.trim().trim_matches('"').trim_matches('\'');
            if !key.is_empty() && env::var(key).is_err() {
                env::set_var(key, value);
            }
        }
        return;
    }
}

/// Heuristic: default to `/data/config.yaml` inside Docker images.
fn is_docker_data_path(config_path: &Path) -> bool {
    let s = config_path.to_string_lossy().replace('\\', "/");
    s.starts_with("/data/") || s.ends_with("/data/config.yaml")
}

fn default_instance_yaml(app_key: &str, is_docker: bool) -> Value {
    let _ = is_docker;
    let mut instance = serde_yaml::Mapping::new();
    instance.insert("instance_id".into(), 1.into());
    instance.insert(
        "instance_name".into(),
        format!("{} Main", titlecase(app_key)).into(),
    );
    instance.insert("enabled".into(), true.into());
    instance.insert("interval_minutes".into(), 15.into());
    instance.insert("search_missing".into(), true.into());
    instance.insert("search_cutoff_unmet".into(), true.into());
    instance.insert("search_order".into(), "smart".into());
    instance.insert("quiet_hours_start".into(), "23:00".into());
    instance.insert("quiet_hours_end".into(), "06:00".into());
    instance.insert("min_hours_after_release".into(), 8.into());
    instance.insert("min_seconds_between_actions".into(), 2.into());
    instance.insert("max_missing_actions_per_instance_per_sync".into(), 5.into());
    instance.insert("max_cutoff_actions_per_instance_per_sync".into(), 1.into());
    if app_key == "sonarr" {
        instance.insert("sonarr_missing_mode".into(), "smart".into());
    }
    instance.insert("item_retry_hours".into(), 72.into());
    instance.insert("rate_window_minutes".into(), 60.into());
    instance.insert("rate_cap".into(), 25.into());
    let mut arr = serde_yaml::Mapping::new();
    arr.insert("url".into(), "".into());
    arr.insert("api_key".into(), "".into());
    instance.insert(app_key.into(), Value::Mapping(arr));
    Value::Mapping(instance)
}

fn titlecase(s: &str) -> String {
    let mut chars = s.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
        None => String::new(),
    }
}

/// Writes a usable default config if `config_path` doesn't exist yet.
fn ensure_config_exists(config_path: &Path) -> Result<(), ConfigError> {
    if config_path.exists() {
        return Ok(());
    }
    if let Some(parent) = config_path.parent() {
        std::fs::create_dir_all(parent).map_err(|source| ConfigError::Read {
            path: parent.display().to_string(),
            source,
        })?;
    }

    let docker = is_docker_data_path(config_path);
    let db_path = if docker {
        "/data/seekarr.db"
    } else {
        "./state/seekarr.db"
    };

    let mut app = serde_yaml::Mapping::new();
    app.insert("db_path".into(), db_path.into());
    app.insert("request_timeout_seconds".into(), 30.into());
    app.insert("verify_ssl".into(), true.into());
    app.insert("log_level".into(), "INFO".into());
    app.insert("quiet_hours_timezone".into(), "".into());

    let mut radarr = serde_yaml::Mapping::new();
    radarr.insert(
        "instances".into(),
        Value::Sequence(vec![default_instance_yaml("radarr", docker)]),
    );

    let mut sonarr = serde_yaml::Mapping::new();
    sonarr.insert(
        "instances".into(),
        Value::Sequence(vec![default_instance_yaml("sonarr", docker)]),
    );

    let mut root = serde_yaml::Mapping::new();
    root.insert("app".into(), Value::Mapping(app));
    root.insert("radarr".into(), Value::Mapping(radarr));
    root.insert("sonarr".into(), Value::Mapping(sonarr));

    let rendered = serde_yaml::to_string(&Value::Mapping(root)).map_err(|source| ConfigError::Parse {
        path: config_path.display().to_string(),
        source,
    })?;
    std::fs::write(config_path, rendered).map_err(|source| ConfigError::Read {
        path: config_path.display().to_string(),
        source,
    })?;
    Ok(())
}

fn parse_instances(
    root: &serde_yaml::Mapping,
    section_key: &str,
    arr_key: &str,
) -> Vec<ArrSyncInstanceConfig> {
    let section = as_mapping(root.get(Value::String(section_key.to_string())));
    let rows = match section.get(Value::String("instances".to_string())) {
        Some(Value::Sequence(seq)) => seq.clone(),
        _ => Vec::new(),
    };

    rows.into_iter()
        .filter_map(|row| {
            let Value::Mapping(row) = row else {
                return None;
            };
            let enabled = get_bool(&row, "enabled", true);
            let interval_minutes = get_u32(&row, "interval_minutes", 15, 0).clamp(15, 60);
            let arr_raw = as_mapping(row.get(Value::String(arr_key.to_string())));
            let arr = ArrConfig {
                enabled,
                url: require_str(&arr_raw, "url", ""),
                api_key: require_str(&arr_raw, "api_key", ""),
            };

            let item_retry_hours = get_opt_u32(&row, "item_retry_hours")
                .or_else(|| get_opt_u32(&row, "state_management_hours"));
            let rate_window_minutes = get_opt_u32(&row, "rate_window_minutes").or_else(|| {
                if row.get(Value::String("hourly_cap".to_string())).is_some() {
                    Some(60)
                } else {
                    None
                }
            });
            let rate_cap =
                get_opt_u32(&row, "rate_cap").or_else(|| get_opt_u32(&row, "hourly_cap"));

            Some(ArrSyncInstanceConfig {
                instance_id: get_u32(&row, "instance_id", 1, 1),
                instance_name: require_str(&row, "instance_name", &format!("{} Default", titlecase(arr_key))),
                enabled,
                interval_minutes,
                search_missing: get_bool(&row, "search_missing", true),
                search_cutoff_unmet: get_bool(&row, "search_cutoff_unmet", true),
                search_order: require_str(&row, "search_order", "smart").to_lowercase(),
                quiet_hours_start: get_opt_str(&row, "quiet_hours_start"),
                quiet_hours_end: get_opt_str(&row, "quiet_hours_end"),
                min_hours_after_release: get_opt_u32(&row, "min_hours_after_release"),
                min_seconds_between_actions: get_opt_u32(&row, "min_seconds_between_actions"),
                max_missing_actions_per_instance_per_sync: get_opt_u32(
                    &row,
                    "max_missing_actions_per_instance_per_sync",
                ),
                max_cutoff_actions_per_instance_per_sync: get_opt_u32(
                    &row,
                    "max_cutoff_actions_per_instance_per_sync",
                ),
                sonarr_missing_mode: require_str(&row, "sonarr_missing_mode", "smart").to_lowercase(),
                item_retry_hours,
                rate_window_minutes,
                rate_cap,
                arr,
            })
        })
        .collect()
}

fn fallback_instance(arr_key: &str, arr_raw: &serde_yaml::Mapping) -> ArrSyncInstanceConfig {
    ArrSyncInstanceConfig {
        instance_id: 1,
        instance_name: format!("{} Default", titlecase(arr_key)),
        enabled: true,
        interval_minutes: 15,
        search_missing: true,
        search_cutoff_unmet: true,
        search_order: "smart".to_string(),
        quiet_hours_start: None,
        quiet_hours_end: None,
        min_hours_after_release: None,
        min_seconds_between_actions: None,
        max_missing_actions_per_instance_per_sync: None,
        max_cutoff_actions_per_instance_per_sync: None,
        sonarr_missing_mode: "smart".to_string(),
        item_retry_hours: None,
        rate_window_minutes: None,
        rate_cap: None,
        arr: ArrConfig {
            enabled: get_bool(arr_raw, "enabled", true),
            url: require_str(arr_raw, "url", ""),
            api_key: require_str(arr_raw, "api_key", ""),
        },
    }
}

/// Loads, auto-creates if missing, expands `${ENV}` references in, and
/// validates the YAML config at `path`.
pub fn load_config(path: &str) -> Result<RuntimeConfig, ConfigError> {
    let config_path = std::fs::canonicalize(path)
        .unwrap_or_else(|_| PathBuf::from(path));

    ensure_config_exists(&config_path)?;
    load_dotenv_if_present(&config_path);

    let text = std::fs::read_to_string(&config_path).map_err(|source| ConfigError::Read {
        path: config_path.display().to_string(),
        source,
    })?;
    let raw: Value = serde_yaml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: config_path.display().to_string(),
        source,
    })?;
    let raw = expand_env(raw);
    let Value::Mapping(root) = raw else {
        return Err(ConfigError::InvalidValue {
            field: "<root>".to_string(),
            message: "config file must contain a YAML mapping".to_string(),
        });
    };

    let app_raw = as_mapping(root.get(Value::String("app".to_string())));
    let app = AppConfig {
        db_path: require_str(&app_raw, "db_path", "./state/seekarr.db"),
        item_retry_hours: get_u32(&app_raw, "item_retry_hours", 12, 1),
        min_hours_after_release: get_u32(&app_raw, "min_hours_after_release", 8, 0),
        quiet_hours_start: require_str(&app_raw, "quiet_hours_start", "23:00"),
        quiet_hours_end: require_str(&app_raw, "quiet_hours_end", "06:00"),
        quiet_hours_timezone: require_str(&app_raw, "quiet_hours_timezone", ""),
        max_missing_actions_per_instance_per_sync: get_u32(
            &app_raw,
            "max_missing_actions_per_instance_per_sync",
            5,
            0,
        ),
        max_cutoff_actions_per_instance_per_sync: get_u32(
            &app_raw,
            "max_cutoff_actions_per_instance_per_sync",
            1,
            0,
        ),
        min_seconds_between_actions: get_u32(&app_raw, "min_seconds_between_actions", 2, 0),
        rate_window_minutes: get_u32(&app_raw, "rate_window_minutes", 30, 1),
        rate_cap_per_instance: get_u32(&app_raw, "rate_cap_per_instance", 10, 1),
        request_timeout_seconds: get_u32(&app_raw, "request_timeout_seconds", 30, 5),
        verify_ssl: get_bool(&app_raw, "verify_ssl", true),
        log_level: require_str(&app_raw, "log_level", "INFO").to_uppercase(),
    };

    let mut radarr_instances = parse_instances(&root, "radarr", "radarr");
    let mut sonarr_instances = parse_instances(&root, "sonarr", "sonarr");

    if radarr_instances.is_empty() {
        radarr_instances.extend(parse_instances(&root, "movie_hunt", "radarr"));
    }
    if sonarr_instances.is_empty() {
        sonarr_instances.extend(parse_instances(&root, "tv_hunt", "sonarr"));
    }

    if radarr_instances.is_empty() && sonarr_instances.is_empty() {
        let radarr_raw = as_mapping(root.get(Value::String("radarr".to_string())));
        let sonarr_raw = as_mapping(root.get(Value::String("sonarr".to_string())));
        if get_bool(&radarr_raw, "enabled", true) {
            radarr_instances.push(fallback_instance("radarr", &radarr_raw));
        }
        if get_bool(&sonarr_raw, "enabled", true) {
            sonarr_instances.push(fallback_instance("sonarr", &sonarr_raw));
        }
    }

    Ok(RuntimeConfig {
        app,
        radarr_instances,
        sonarr_instances,
    })
}

/// Resolves the appdata directory used for default db/log locations.
/// Priority: `SEEKARR_APPDATA_DIR` env var, then `./appData`.
pub fn get_appdata_dir() -> PathBuf {
    env::var("SEEKARR_APPDATA_DIR")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("./appData"))
}

pub fn ensure_appdata_dirs() -> std::io::Result<()> {
    let appdata_dir = get_appdata_dir();
    std::fs::create_dir_all(appdata_dir.join("config"))?;
    std::fs::create_dir_all(appdata_dir.join("data"))?;
    std::fs::create_dir_all(appdata_dir.join("logs"))?;
    Ok(())
}

/// Per-instance resolved overrides, falling back to app-level defaults.
#[derive(Debug, Clone)]
pub struct EffectiveInstanceConfig {
    pub quiet_hours_start: String,
    pub quiet_hours_end: String,
    pub min_hours_after_release: u32,
    pub min_seconds_between_actions: u32,
    pub max_missing_actions_per_instance_per_sync: u32,
    pub max_cutoff_actions_per_instance_per_sync: u32,
    pub item_retry_hours: u32,
    pub rate_window_minutes: u32,
    pub rate_cap: u32,
}

impl ArrSyncInstanceConfig {
    pub fn effective(&self, app: &AppConfig) -> EffectiveInstanceConfig {
        EffectiveInstanceConfig {
            quiet_hours_start: self
                .quiet_hours_start
                .clone()
                .unwrap_or_else(|| app.quiet_hours_start.clone()),
            quiet_hours_end: self
                .quiet_hours_end
                .clone()
                .unwrap_or_else(|| app.quiet_hours_end.clone()),
            min_hours_after_release: self
                .min_hours_after_release
                .unwrap_or(app.min_hours_after_release),
            min_seconds_between_actions: self
                .min_seconds_between_actions
                .unwrap_or(app.min_seconds_between_actions),
            max_missing_actions_per_instance_per_sync: self
                .max_missing_actions_per_instance_per_sync
                .unwrap_or(app.max_missing_actions_per_instance_per_sync),
            max_cutoff_actions_per_instance_per_sync: self
                .max_cutoff_actions_per_instance_per_sync
                .unwrap_or(app.max_cutoff_actions_per_instance_per_sync),
            item_retry_hours: self.item_retry_hours.unwrap_or(app.item_retry_hours),
            rate_window_minutes: self.rate_window_minutes.unwrap_or(app.rate_window_minutes),
            rate_cap: self.rate_cap.unwrap_or(app.rate_cap_per_instance),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn expand_env_substitutes_known_vars() {
        env::set_var("SEEKARR_TEST_VAR", "shhh");
        let value = Value::String("key=${SEEKARR_TEST_VAR}".to_string());
        assert_eq!(expand_env(value), Value::String("key=shhh".to_string()));
    }

    #[test]
    fn expand_env_blanks_unknown_vars() {
        env::remove_var("SEEKARR_TEST_MISSING");
        let value = Value::String("key=${SEEKARR_TEST_MISSING}".to_string());
        assert_eq!(expand_env(value), Value::String("key=".to_string()));
    }

    #[test]
    fn load_config_creates_default_and_parses_it() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        let cfg = load_config(config_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.radarr_instances.len(), 1);
        assert_eq!(cfg.sonarr_instances.len(), 1);
        assert_eq!(cfg.radarr_instances[0].interval_minutes, 15);
        assert_eq!(cfg.app.log_level, "INFO");
    }

    #[test]
    fn load_config_clamps_interval_minutes() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            r#"
app:
  db_path: "./state/seekarr.db"
radarr:
  instances:
    - instance_id: 1
      interval_minutes: 5
      radarr:
        url: "http://localhost:7878"
        api_key: "abc"
"#,
        )
        .unwrap();
        let cfg = load_config(config_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.radarr_instances[0].interval_minutes, 15);
    }

    #[test]
    fn load_config_applies_legacy_hourly_cap_alias() {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("config.yaml");
        std::fs::write(
            &config_path,
            r#"
app:
  db_path: "./state/seekarr.db"
sonarr:
  instances:
    - instance_id: 1
      hourly_cap: 40
      sonarr:
        url: "http://localhost:8989"
        api_key: "abc"
"#,
        )
        .unwrap();
        let cfg = load_config(config_path.to_str().unwrap()).unwrap();
        assert_eq!(cfg.sonarr_instances[0].rate_cap, Some(40));
        assert_eq!(cfg.sonarr_instances[0].rate_window_minutes, Some(60));
    }
}
