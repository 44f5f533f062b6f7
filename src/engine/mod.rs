//! Orchestrates one search cycle: for every due instance, fetch wanted
//! items, order them, push them through admission control, and trigger
//! searches for whatever gets through.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::json;

use crate::admission::{self, AdmissionContext, AdmissionDecision, Pacer};
use crate::arr::{ArrClient, SeasonInventory, WantedEpisode, WantedMovie};
use crate::config::{ArrConfig, ArrSyncInstanceConfig, RuntimeConfig};
use crate::error::EngineError;
use crate::selector::{self, CalendarBoost, EpisodeCalendarBoost, SearchOrder};
use crate::store::Store;
use crate::time_util::{parse_arr_datetime_utc, quiet_hours_end_utc};

const RADARR: &str = "radarr";
const SONARR: &str = "sonarr";

/// Running totals for one cycle (or, when reported per instance, one
/// instance's pass). Mirrors what gets persisted into `cycle_run`/
/// `instance_run` and what the Web UI's `/api/status` surfaces.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CycleStats {
    pub instances_due: u32,
    pub instances_processed: u32,
    pub wanted_total: u32,
    pub actions_triggered: u32,
    pub actions_skipped_cooldown: u32,
    pub actions_skipped_rate_limit: u32,
    pub actions_skipped_not_released: u32,
}

impl CycleStats {
    fn merge(&mut self, other: &CycleStats) {
        self.instances_due += other.instances_due;
        self.instances_processed += other.instances_processed;
        self.wanted_total += other.wanted_total;
        self.actions_triggered += other.actions_triggered;
        self.actions_skipped_cooldown += other.actions_skipped_cooldown;
        self.actions_skipped_rate_limit += other.actions_skipped_rate_limit;
        self.actions_skipped_not_released += other.actions_skipped_not_released;
    }

    pub fn as_json(&self) -> serde_json::Value {
        json!(self)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProgressEvent {
    CycleStarted { force: bool },
    InstanceStarted { app_type: String, instance_id: i64, instance_name: String },
    InstanceFinished { app_type: String, instance_id: i64, instance_name: String, status: String },
    ItemTriggered { app_type: String, instance_id: i64, instance_name: String, item_key: String, title: String },
    ItemSkippedNotReleased { app_type: String, instance_id: i64, item_key: String },
    ItemSkippedRateLimit { app_type: String, instance_id: i64, item_key: String },
    ItemSkippedCooldown { app_type: String, instance_id: i64, item_key: String },
    CycleFinished { status: String, stats: serde_json::Value },
}

pub type ProgressSender = tokio::sync::mpsc::UnboundedSender<ProgressEvent>;

fn emit(progress: Option<&ProgressSender>, event: ProgressEvent) {
    if let Some(tx) = progress {
        let _ = tx.send(event);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SonarrMode {
    Episodes,
    Shows,
    SeasonPacks,
    Smart,
}

impl SonarrMode {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "shows" => SonarrMode::Shows,
            "season_packs" => SonarrMode::SeasonPacks,
            "smart" => SonarrMode::Smart,
            _ => SonarrMode::Episodes,
        }
    }
}

enum GroupAction {
    SeasonPack,
    PerEpisode,
}

/// Minimum missing-episode count before the smart Sonarr mode will consider
/// a season pack at all, regardless of how complete the season already is.
const SMART_MIN_MISSING_FOR_COVERAGE_PACK: usize = 3;
/// Coverage (missing episodes / highest known episode number) above which a
/// season pack is preferred once `SMART_MIN_MISSING_FOR_COVERAGE_PACK` is met.
const SMART_MIN_COVERAGE_FOR_PACK: f64 = 0.6;
/// Missing-episode count above which a season pack is always preferred,
/// irrespective of coverage.
const SMART_MIN_MISSING_FOR_FORCED_PACK: usize = 6;
/// Fallback threshold (by group size) when no episode has a usable episode
/// number, so there's nothing to compute coverage against.
const SMART_FALLBACK_MIN_MISSING_FOR_PACK: usize = 3;

/// Picks season pack vs per-episode for one Sonarr "smart" group.
///
/// `episode_numbers` are the group's episode numbers as fetched (not
/// deduplicated by the caller); a season already empty in the library
/// (`aired_total > 0 && aired_downloaded == 0`) always gets a pack. Otherwise
/// coverage is the fraction of the season's aired run the missing episodes
/// represent: `missing_count / highest_episode_number`.
fn choose_smart_action(inventory: Option<&SeasonInventory>, episode_numbers: &[i32]) -> GroupAction {
    if let Some(inv) = inventory {
        if inv.aired_total > 0 && inv.aired_downloaded == 0 {
            return GroupAction::SeasonPack;
        }
    }
    let distinct: HashSet<i32> = episode_numbers.iter().copied().filter(|&n| n > 0).collect();
    if distinct.is_empty() {
        return if episode_numbers.len() >= SMART_FALLBACK_MIN_MISSING_FOR_PACK {
            GroupAction::SeasonPack
        } else {
            GroupAction::PerEpisode
        };
    }
    let missing_count = distinct.len();
    let highest_episode = *distinct.iter().max().expect("distinct is non-empty");
    let coverage = missing_count as f64 / highest_episode as f64;
    if missing_count >= SMART_MIN_MISSING_FOR_FORCED_PACK
        || (missing_count >= SMART_MIN_MISSING_FOR_COVERAGE_PACK && coverage >= SMART_MIN_COVERAGE_FOR_PACK)
    {
        GroupAction::SeasonPack
    } else {
        GroupAction::PerEpisode
    }
}

/// Drives the scheduled search loop for every configured Radarr/Sonarr
/// instance. Holds a read-write copy of the config so the Web UI can push a
/// new one in without restarting the process.
pub struct Engine {
    config: RwLock<RuntimeConfig>,
    store: Arc<Store>,
    pacer: Arc<Pacer>,
}

impl Engine {
    pub fn new(config: RuntimeConfig, store: Arc<Store>, pacer: Arc<Pacer>) -> Self {
        Self {
            config: RwLock::new(config),
            store,
            pacer,
        }
    }

    pub fn reload_config(&self, config: RuntimeConfig) {
        *self.config.write().expect("config lock poisoned") = config;
    }

    pub fn snapshot_config(&self) -> RuntimeConfig {
        self.config.read().expect("config lock poisoned").clone()
    }

    fn find_instance(&self, app_type: &str, instance_id: i64) -> Option<ArrSyncInstanceConfig> {
        let cfg = self.config.read().expect("config lock poisoned");
        let list = if app_type == RADARR { &cfg.radarr_instances } else { &cfg.sonarr_instances };
        list.iter().find(|i| i.instance_id as i64 == instance_id).cloned()
    }

    /// All enabled `(app_type, instance_id)` pairs, in config order.
    pub fn enabled_instances(&self) -> Vec<(String, i64)> {
        let cfg = self.config.read().expect("config lock poisoned");
        cfg.radarr_instances
            .iter()
            .filter(|i| i.enabled)
            .map(|i| (RADARR.to_string(), i.instance_id as i64))
            .chain(
                cfg.sonarr_instances
                    .iter()
                    .filter(|i| i.enabled)
                    .map(|i| (SONARR.to_string(), i.instance_id as i64)),
            )
            .collect()
    }

    pub fn is_due(&self, app_type: &str, instance_id: i64) -> Result<bool, EngineError> {
        let Some(next) = self.store.get_next_sync_time(app_type, instance_id)? else {
            return Ok(true);
        };
        match DateTime::parse_from_rfc3339(&next) {
            Ok(dt) => Ok(Utc::now() >= dt.with_timezone(&Utc)),
            Err(_) => Ok(true),
        }
    }

    /// The instance's next scheduled run, if any. `None` means "due now" (no
    /// sync status row yet, or the stored timestamp couldn't be parsed).
    pub fn next_due_at(&self, app_type: &str, instance_id: i64) -> Result<Option<DateTime<Utc>>, EngineError> {
        let Some(next) = self.store.get_next_sync_time(app_type, instance_id)? else {
            return Ok(None);
        };
        match DateTime::parse_from_rfc3339(&next) {
            Ok(dt) => Ok(Some(dt.with_timezone(&Utc))),
            Err(_) => Ok(None),
        }
    }

    /// Records a scheduler liveness heartbeat, surfaced by the Web UI.
    pub fn mark_heartbeat(&self) -> Result<(), EngineError> {
        self.store.set_scheduler_heartbeat()?;
        Ok(())
    }

    fn effective_api_key(&self, app_type: &str, inst: &ArrSyncInstanceConfig) -> Result<String, EngineError> {
        Ok(self
            .store
            .get_arr_api_key(app_type, inst.instance_id as i64)?
            .unwrap_or_else(|| inst.arr.api_key.clone()))
    }

    /// Runs a full cycle over every enabled, due instance (or every enabled
    /// instance, if `force`). Persists a `cycle_run` row and returns the
    /// aggregated stats.
    pub async fn run_cycle(&self, force: bool, progress: Option<&ProgressSender>) -> Result<CycleStats, EngineError> {
        emit(progress, ProgressEvent::CycleStarted { force });
        let run_id = self.store.start_run()?;
        let mut stats = CycleStats::default();
        let mut status = "ok";

        for (app_type, instance_id) in self.enabled_instances() {
            let due = force || self.is_due(&app_type, instance_id)?;
            if !due {
                continue;
            }
            stats.instances_due += 1;
            match self.run_instance(&app_type, instance_id, force, progress).await {
                Ok(delta) => stats.merge(&delta),
                Err(err) => {
                    tracing::warn!(%app_type, instance_id, error = %err, "instance run failed");
                    status = "partial";
                }
            }
        }

        self.store.finish_run(run_id, status, &stats.as_json())?;
        emit(
            progress,
            ProgressEvent::CycleFinished { status: status.to_string(), stats: stats.as_json() },
        );
        Ok(stats)
    }

    /// Runs a single instance's pass, recording an `instance_run` row.
    /// Returns `Ok(default stats)` (not an error) if the instance isn't
    /// configured or isn't due and `force` wasn't set.
    pub async fn run_instance(
        &self,
        app_type: &str,
        instance_id: i64,
        force: bool,
        progress: Option<&ProgressSender>,
    ) -> Result<CycleStats, EngineError> {
        let Some(inst) = self.find_instance(app_type, instance_id) else {
            return Ok(CycleStats::default());
        };
        if !inst.enabled {
            return Ok(CycleStats::default());
        }
        if !force && !self.is_due(app_type, instance_id)? {
            return Ok(CycleStats::default());
        }

        let app_cfg = self.config.read().expect("config lock poisoned").app.clone();
        emit(
            progress,
            ProgressEvent::InstanceStarted {
                app_type: app_type.to_string(),
                instance_id,
                instance_name: inst.instance_name.clone(),
            },
        );

        let started_at = Utc::now().to_rfc3339();
        let cycle_run_id = self.store.start_run()?;
        let (status, stats) = self.run_instance_sync(&app_cfg, app_type, &inst, progress).await?;
        let finished_at = Utc::now().to_rfc3339();
        self.store.finish_run(cycle_run_id, &status, &stats.as_json())?;
        self.store.record_instance_run(
            cycle_run_id,
            app_type,
            instance_id,
            &inst.instance_name,
            &started_at,
            &finished_at,
            &status,
            &stats.as_json(),
        )?;

        emit(
            progress,
            ProgressEvent::InstanceFinished {
                app_type: app_type.to_string(),
                instance_id,
                instance_name: inst.instance_name.clone(),
                status,
            },
        );
        Ok(stats)
    }

    async fn run_instance_sync(
        &self,
        app: &crate::config::AppConfig,
        app_type: &str,
        inst: &ArrSyncInstanceConfig,
        progress: Option<&ProgressSender>,
    ) -> Result<(String, CycleStats), EngineError> {
        let mut stats = CycleStats {
            instances_processed: 1,
            ..Default::default()
        };
        let now = Utc::now();
        let eff = inst.effective(app);

        if let Some(quiet_until) = quiet_hours_end_utc(now, &eff.quiet_hours_start, &eff.quiet_hours_end, &app.quiet_hours_timezone) {
            self.store
                .upsert_sync_status(app_type, inst.instance_id as i64, &now.to_rfc3339(), &quiet_until.to_rfc3339())?;
            return Ok(("quiet_hours".to_string(), stats));
        }

        let api_key = self.effective_api_key(app_type, inst)?;
        let client = ArrClient::new(
            inst.instance_name.clone(),
            ArrConfig { enabled: inst.enabled, url: inst.arr.url.clone(), api_key },
            app.request_timeout_seconds as u64,
            app.verify_ssl,
        );

        let order = SearchOrder::parse(&inst.search_order);
        let mut triggered_items: HashSet<String> = HashSet::new();
        let mut next_wakeup: Option<DateTime<Utc>> = None;

        if app_type == RADARR {
            let movies = client.fetch_wanted_movies(inst.search_missing, inst.search_cutoff_unmet).await;
            stats.wanted_total += movies.len() as u32;
            let (missing, cutoff): (Vec<WantedMovie>, Vec<WantedMovie>) =
                movies.into_iter().partition(|m| m.wanted_kind == crate::arr::WantedKind::Missing);

            let calendar = self.fetch_movie_calendar_boost(&client, order, now).await;
            track_movie_wakeup(&missing, eff.min_hours_after_release, now, &mut next_wakeup);

            let missing_ordered = selector::order_movies(missing, order, now, &calendar);
            self.process_movies(
                &client,
                app_type,
                inst.instance_id as i64,
                &inst.instance_name,
                &eff,
                missing_ordered,
                eff.max_missing_actions_per_instance_per_sync,
                &mut triggered_items,
                &mut stats,
                progress,
            )
            .await?;

            let cutoff_ordered = selector::order_movies(cutoff, order, now, &calendar);
            self.process_movies(
                &client,
                app_type,
                inst.instance_id as i64,
                &inst.instance_name,
                &eff,
                cutoff_ordered,
                eff.max_cutoff_actions_per_instance_per_sync,
                &mut triggered_items,
                &mut stats,
                progress,
            )
            .await?;
        } else {
            let episodes = client.fetch_wanted_episodes(inst.search_missing, inst.search_cutoff_unmet).await;
            stats.wanted_total += episodes.len() as u32;
            let episodes = drop_specials_if_non_specials_exist(episodes);
            let (missing, cutoff): (Vec<WantedEpisode>, Vec<WantedEpisode>) =
                episodes.into_iter().partition(|e| e.wanted_kind == crate::arr::WantedKind::Missing);

            let calendar = self.fetch_episode_calendar_boost(&client, order, now).await;
            track_episode_wakeup(&missing, eff.min_hours_after_release, now, &mut next_wakeup);

            let mode = SonarrMode::parse(&inst.sonarr_missing_mode);
            self.process_sonarr_missing(
                &client,
                inst.instance_id as i64,
                &eff,
                missing,
                mode,
                order,
                now,
                &calendar,
                &mut triggered_items,
                &mut stats,
                progress,
            )
            .await?;

            // Cutoff-unmet episodes are always processed per-episode: an
            // upgrade search for a whole season the episode already exists
            // in doesn't need season-pack/show bulk shaping.
            let cutoff_ordered = selector::order_episodes(cutoff, order, now, &calendar);
            self.process_episodes(
                &client,
                app_type,
                inst.instance_id as i64,
                &eff,
                cutoff_ordered,
                eff.max_cutoff_actions_per_instance_per_sync,
                &mut triggered_items,
                &mut stats,
                progress,
            )
            .await?;
        }

        let next_sync = next_wakeup.unwrap_or_else(|| now + Duration::minutes(inst.interval_minutes as i64));
        self.store
            .upsert_sync_status(app_type, inst.instance_id as i64, &now.to_rfc3339(), &next_sync.to_rfc3339())?;

        Ok(("ok".to_string(), stats))
    }

    async fn fetch_movie_calendar_boost(&self, client: &ArrClient, order: SearchOrder, now: DateTime<Utc>) -> CalendarBoost {
        let mut boost = CalendarBoost::new();
        if order != SearchOrder::Smart {
            return boost;
        }
        let rows = client.fetch_calendar((now - Duration::days(3)).date_naive(), (now + Duration::days(1)).date_naive()).await;
        for row in rows {
            let Some(obj) = row.as_object() else { continue };
            let id = obj.get("movieId").and_then(|v| v.as_i64()).or_else(|| obj.get("id").and_then(|v| v.as_i64()));
            let Some(id) = id else { continue };
            if id == 0 {
                continue;
            }
            boost.insert(id, now.timestamp());
        }
        boost
    }

    async fn fetch_episode_calendar_boost(&self, client: &ArrClient, order: SearchOrder, now: DateTime<Utc>) -> EpisodeCalendarBoost {
        let mut boost = EpisodeCalendarBoost::new();
        if order != SearchOrder::Smart {
            return boost;
        }
        let rows = client.fetch_calendar((now - Duration::days(3)).date_naive(), (now + Duration::days(1)).date_naive()).await;
        for row in rows {
            let Some(obj) = row.as_object() else { continue };
            let episode_id = obj.get("id").and_then(|v| v.as_i64()).unwrap_or(0);
            if episode_id != 0 {
                boost.insert_by_id(episode_id, now.timestamp());
            }
            let series_id = obj.get("seriesId").and_then(|v| v.as_i64()).unwrap_or(0);
            let season = obj.get("seasonNumber").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
            let episode_number = obj.get("episodeNumber").and_then(|v| v.as_i64()).unwrap_or(-1) as i32;
            if series_id != 0 && season >= 0 && episode_number >= 0 {
                boost.insert_by_triple(series_id, season, episode_number, now.timestamp());
            }
        }
        boost
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_movies(
        &self,
        client: &ArrClient,
        app_type: &str,
        instance_id: i64,
        eff: &crate::config::EffectiveInstanceConfig,
        items: Vec<WantedMovie>,
        cap: u32,
        triggered_items: &mut HashSet<String>,
        stats: &mut CycleStats,
        progress: Option<&ProgressSender>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut triggered_this_call = 0u32;
        for movie in items {
            if triggered_this_call >= cap {
                break;
            }
            let item_key = movie.item_key();
            let release = parse_arr_datetime_utc(movie.release_date_utc.as_deref());
            let released = admission::is_released(release, eff.min_hours_after_release, now);
            let recent = release.map(|r| admission::is_recent_release(r, now)).unwrap_or(false);
            let ctx = AdmissionContext {
                app_type,
                instance_id,
                now,
                rate_window_minutes: eff.rate_window_minutes,
                rate_cap: eff.rate_cap,
                item_retry_hours: eff.item_retry_hours,
            };
            let decision = admission::evaluate(&self.store, &ctx, &item_key, released, recent, triggered_items)?;
            match decision {
                AdmissionDecision::Duplicate => continue,
                AdmissionDecision::NotReleased => {
                    stats.actions_skipped_not_released += 1;
                    emit(progress, ProgressEvent::ItemSkippedNotReleased { app_type: app_type.to_string(), instance_id, item_key });
                }
                AdmissionDecision::RateLimited => {
                    stats.actions_skipped_rate_limit += 1;
                    emit(progress, ProgressEvent::ItemSkippedRateLimit { app_type: app_type.to_string(), instance_id, item_key });
                    break;
                }
                AdmissionDecision::Cooldown => {
                    stats.actions_skipped_cooldown += 1;
                    emit(progress, ProgressEvent::ItemSkippedCooldown { app_type: app_type.to_string(), instance_id, item_key });
                }
                AdmissionDecision::Admit => {
                    self.pacer.wait(eff.min_seconds_between_actions).await;
                    let ok = client.trigger_movie_search(movie.movie_id).await;
                    self.pacer.mark();
                    if ok {
                        self.store.mark_item_action(app_type, instance_id, &item_key, "", &movie.title)?;
                        self.store.record_search_event(app_type, instance_id)?;
                        self.store.record_search_action(app_type, instance_id, "", &item_key, &movie.title)?;
                        triggered_items.insert(item_key.clone());
                        triggered_this_call += 1;
                        stats.actions_triggered += 1;
                        emit(
                            progress,
                            ProgressEvent::ItemTriggered {
                                app_type: app_type.to_string(),
                                instance_id,
                                instance_name: String::new(),
                                item_key,
                                title: movie.title,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_episodes(
        &self,
        client: &ArrClient,
        app_type: &str,
        instance_id: i64,
        eff: &crate::config::EffectiveInstanceConfig,
        items: Vec<WantedEpisode>,
        cap: u32,
        triggered_items: &mut HashSet<String>,
        stats: &mut CycleStats,
        progress: Option<&ProgressSender>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut triggered_this_call = 0u32;
        for ep in items {
            if triggered_this_call >= cap {
                break;
            }
            let item_key = ep.item_key();
            let release = parse_arr_datetime_utc(ep.air_date_utc.as_deref());
            let released = admission::is_released(release, eff.min_hours_after_release, now);
            let recent = release.map(|r| admission::is_recent_release(r, now)).unwrap_or(false);
            let ctx = AdmissionContext {
                app_type,
                instance_id,
                now,
                rate_window_minutes: eff.rate_window_minutes,
                rate_cap: eff.rate_cap,
                item_retry_hours: eff.item_retry_hours,
            };
            let decision = admission::evaluate(&self.store, &ctx, &item_key, released, recent, triggered_items)?;
            match decision {
                AdmissionDecision::Duplicate => continue,
                AdmissionDecision::NotReleased => {
                    stats.actions_skipped_not_released += 1;
                    emit(progress, ProgressEvent::ItemSkippedNotReleased { app_type: app_type.to_string(), instance_id, item_key });
                }
                AdmissionDecision::RateLimited => {
                    stats.actions_skipped_rate_limit += 1;
                    emit(progress, ProgressEvent::ItemSkippedRateLimit { app_type: app_type.to_string(), instance_id, item_key });
                    break;
                }
                AdmissionDecision::Cooldown => {
                    stats.actions_skipped_cooldown += 1;
                    emit(progress, ProgressEvent::ItemSkippedCooldown { app_type: app_type.to_string(), instance_id, item_key });
                }
                AdmissionDecision::Admit => {
                    self.pacer.wait(eff.min_seconds_between_actions).await;
                    let ok = client.trigger_episode_search(ep.episode_id).await;
                    self.pacer.mark();
                    if ok {
                        let title = format!("{} S{:02}E{:02}", ep.series_title, ep.season_number, ep.episode_number);
                        self.store.mark_item_action(app_type, instance_id, &item_key, "", &title)?;
                        self.store.record_search_event(app_type, instance_id)?;
                        self.store.record_search_action(app_type, instance_id, "", &item_key, &title)?;
                        triggered_items.insert(item_key.clone());
                        triggered_this_call += 1;
                        stats.actions_triggered += 1;
                        emit(
                            progress,
                            ProgressEvent::ItemTriggered {
                                app_type: app_type.to_string(),
                                instance_id,
                                instance_name: String::new(),
                                item_key,
                                title,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_sonarr_missing(
        &self,
        client: &ArrClient,
        instance_id: i64,
        eff: &crate::config::EffectiveInstanceConfig,
        missing: Vec<WantedEpisode>,
        mode: SonarrMode,
        order: SearchOrder,
        now: DateTime<Utc>,
        calendar: &EpisodeCalendarBoost,
        triggered_items: &mut HashSet<String>,
        stats: &mut CycleStats,
        progress: Option<&ProgressSender>,
    ) -> Result<(), EngineError> {
        match mode {
            SonarrMode::Episodes => {
                let ordered = selector::order_episodes(missing, order, now, calendar);
                self.process_episodes(
                    client,
                    SONARR,
                    instance_id,
                    eff,
                    ordered,
                    eff.max_missing_actions_per_instance_per_sync,
                    triggered_items,
                    stats,
                    progress,
                )
                .await
            }
            SonarrMode::Shows => {
                let groups = selector::group_by_series(missing);
                let cold_start = self.cold_start_series_for_groups(client, groups.iter().map(|(sid, _)| *sid)).await;
                let groups = selector::order_series_groups(groups, order, now, calendar);
                self.process_series_groups(client, instance_id, eff, groups, cold_start, triggered_items, stats, progress)
                    .await
            }
            SonarrMode::SeasonPacks => {
                let groups = selector::group_by_season(missing);
                let cold_start = self.cold_start_series_for_groups(client, groups.iter().map(|(k, _)| k.series_id)).await;
                let groups = selector::order_season_groups(groups, order, now, calendar);
                let groups = selector::cold_start_prioritize(groups, &cold_start);
                self.process_season_groups(client, instance_id, eff, groups, true, triggered_items, stats, progress).await
            }
            SonarrMode::Smart => {
                let groups = selector::group_by_season(missing);
                let cold_start = self.cold_start_series_for_groups(client, groups.iter().map(|(k, _)| k.series_id)).await;
                let groups = selector::order_season_groups(groups, order, now, calendar);
                let groups = selector::cold_start_prioritize(groups, &cold_start);
                self.process_season_groups(client, instance_id, eff, groups, false, triggered_items, stats, progress).await
            }
        }
    }

    async fn cold_start_series_for_groups(&self, client: &ArrClient, series_ids: impl Iterator<Item = i64>) -> HashSet<i64> {
        let mut seen = HashSet::new();
        let mut cold_start = HashSet::new();
        for series_id in series_ids {
            if !seen.insert(series_id) {
                continue;
            }
            let inventory = client.fetch_series_season_inventory(series_id).await;
            if selector::is_cold_start_series(&inventory) {
                cold_start.insert(series_id);
            }
        }
        cold_start
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_series_groups(
        &self,
        client: &ArrClient,
        instance_id: i64,
        eff: &crate::config::EffectiveInstanceConfig,
        groups: Vec<(i64, Vec<WantedEpisode>)>,
        cold_start: HashSet<i64>,
        triggered_items: &mut HashSet<String>,
        stats: &mut CycleStats,
        progress: Option<&ProgressSender>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let _ = &cold_start; // a single group per series: nothing left to reorder within it
        let mut triggered_this_call = 0u32;
        for (series_id, episodes) in groups {
            if triggered_this_call >= eff.max_missing_actions_per_instance_per_sync {
                break;
            }
            let item_key = format!("series:{series_id}");
            let dates: Vec<Option<DateTime<Utc>>> = episodes.iter().map(|e| parse_arr_datetime_utc(e.air_date_utc.as_deref())).collect();
            let released = admission::is_group_released(&dates, eff.min_hours_after_release, now);
            let recent = dates.iter().copied().flatten().any(|d| admission::is_recent_release(d, now));
            let ctx = AdmissionContext {
                app_type: SONARR,
                instance_id,
                now,
                rate_window_minutes: eff.rate_window_minutes,
                rate_cap: eff.rate_cap,
                item_retry_hours: eff.item_retry_hours,
            };
            let decision = admission::evaluate(&self.store, &ctx, &item_key, released, recent, triggered_items)?;
            match decision {
                AdmissionDecision::Duplicate => continue,
                AdmissionDecision::NotReleased => {
                    stats.actions_skipped_not_released += 1;
                    emit(progress, ProgressEvent::ItemSkippedNotReleased { app_type: SONARR.to_string(), instance_id, item_key });
                }
                AdmissionDecision::RateLimited => {
                    stats.actions_skipped_rate_limit += 1;
                    emit(progress, ProgressEvent::ItemSkippedRateLimit { app_type: SONARR.to_string(), instance_id, item_key });
                    break;
                }
                AdmissionDecision::Cooldown => {
                    stats.actions_skipped_cooldown += 1;
                    emit(progress, ProgressEvent::ItemSkippedCooldown { app_type: SONARR.to_string(), instance_id, item_key });
                }
                AdmissionDecision::Admit => {
                    let episode_ids: Vec<i64> = episodes.iter().map(|e| e.episode_id).collect();
                    let title = episodes.first().map(|e| e.series_title.clone()).unwrap_or_default();
                    self.pacer.wait(eff.min_seconds_between_actions).await;
                    let ok = client.trigger_episode_search_bulk(&episode_ids).await;
                    self.pacer.mark();
                    if ok {
                        self.store.mark_item_action(SONARR, instance_id, &item_key, "", &title)?;
                        self.store.record_search_event(SONARR, instance_id)?;
                        self.store.record_search_action(SONARR, instance_id, "", &item_key, &title)?;
                        triggered_items.insert(item_key.clone());
                        triggered_this_call += 1;
                        stats.actions_triggered += 1;
                        emit(
                            progress,
                            ProgressEvent::ItemTriggered {
                                app_type: SONARR.to_string(),
                                instance_id,
                                instance_name: String::new(),
                                item_key,
                                title,
                            },
                        );
                    }
                }
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    async fn process_season_groups(
        &self,
        client: &ArrClient,
        instance_id: i64,
        eff: &crate::config::EffectiveInstanceConfig,
        groups: Vec<selector::SeasonGroup>,
        always_season_pack: bool,
        triggered_items: &mut HashSet<String>,
        stats: &mut CycleStats,
        progress: Option<&ProgressSender>,
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let mut inventory_cache: HashMap<i64, HashMap<i32, SeasonInventory>> = HashMap::new();
        let mut triggered_this_call = 0u32;

        for (key, episodes) in groups {
            if triggered_this_call >= eff.max_missing_actions_per_instance_per_sync {
                break;
            }
            let item_key = format!("season:{}:{}", key.series_id, key.season_number);
            let dates: Vec<Option<DateTime<Utc>>> = episodes.iter().map(|e| parse_arr_datetime_utc(e.air_date_utc.as_deref())).collect();
            let released = admission::is_group_released(&dates, eff.min_hours_after_release, now);
            let recent = dates.iter().copied().flatten().any(|d| admission::is_recent_release(d, now));
            let ctx = AdmissionContext {
                app_type: SONARR,
                instance_id,
                now,
                rate_window_minutes: eff.rate_window_minutes,
                rate_cap: eff.rate_cap,
                item_retry_hours: eff.item_retry_hours,
            };
            let decision = admission::evaluate(&self.store, &ctx, &item_key, released, recent, triggered_items)?;
            match decision {
                AdmissionDecision::Duplicate => continue,
                AdmissionDecision::NotReleased => {
                    stats.actions_skipped_not_released += 1;
                    emit(progress, ProgressEvent::ItemSkippedNotReleased { app_type: SONARR.to_string(), instance_id, item_key });
                    continue;
                }
                AdmissionDecision::RateLimited => {
                    stats.actions_skipped_rate_limit += 1;
                    emit(progress, ProgressEvent::ItemSkippedRateLimit { app_type: SONARR.to_string(), instance_id, item_key });
                    break;
                }
                AdmissionDecision::Cooldown => {
                    stats.actions_skipped_cooldown += 1;
                    emit(progress, ProgressEvent::ItemSkippedCooldown { app_type: SONARR.to_string(), instance_id, item_key });
                    continue;
                }
                AdmissionDecision::Admit => {}
            }

            let action = if always_season_pack {
                GroupAction::SeasonPack
            } else {
                if !inventory_cache.contains_key(&key.series_id) {
                    let inventory = client.fetch_series_season_inventory(key.series_id).await;
                    inventory_cache.insert(key.series_id, inventory);
                }
                let inventory = inventory_cache.get(&key.series_id).and_then(|m| m.get(&key.season_number));
                let episode_numbers: Vec<i32> = episodes.iter().map(|e| e.episode_number).collect();
                choose_smart_action(inventory, &episode_numbers)
            };

            match action {
                GroupAction::SeasonPack => {
                    let title = episodes.first().map(|e| e.series_title.clone()).unwrap_or_default();
                    self.pacer.wait(eff.min_seconds_between_actions).await;
                    let ok = client.trigger_season_search(key.series_id, key.season_number).await;
                    self.pacer.mark();
                    if ok {
                        self.store.mark_item_action(SONARR, instance_id, &item_key, "", &title)?;
                        self.store.record_search_event(SONARR, instance_id)?;
                        self.store.record_search_action(SONARR, instance_id, "", &item_key, &title)?;
                        triggered_items.insert(item_key.clone());
                        triggered_this_call += 1;
                        stats.actions_triggered += 1;
                        emit(
                            progress,
                            ProgressEvent::ItemTriggered {
                                app_type: SONARR.to_string(),
                                instance_id,
                                instance_name: String::new(),
                                item_key,
                                title,
                            },
                        );
                    }
                }
                GroupAction::PerEpisode => {
                    let remaining = eff.max_missing_actions_per_instance_per_sync.saturating_sub(triggered_this_call);
                    let mut capped_eff = eff.clone();
                    capped_eff.max_missing_actions_per_instance_per_sync = remaining;
                    let before = stats.actions_triggered;
                    self.process_episodes(client, SONARR, instance_id, &capped_eff, episodes, remaining, triggered_items, stats, progress)
                        .await?;
                    triggered_this_call += stats.actions_triggered - before;
                }
            }
        }
        Ok(())
    }
}

fn drop_specials_if_non_specials_exist(episodes: Vec<WantedEpisode>) -> Vec<WantedEpisode> {
    if episodes.iter().any(|e| e.season_number > 0) {
        episodes.into_iter().filter(|e| e.season_number != 0).collect()
    } else {
        episodes
    }
}

fn track_movie_wakeup(missing: &[WantedMovie], min_hours_after_release: u32, now: DateTime<Utc>, next_wakeup: &mut Option<DateTime<Utc>>) {
    if min_hours_after_release == 0 {
        return;
    }
    let recent_floor = now - Duration::days(admission::RECENT_PRIORITY_WINDOW_DAYS);
    for movie in missing {
        let Some(release) = parse_arr_datetime_utc(movie.release_date_utc.as_deref()) else { continue };
        if release < recent_floor || release > now {
            continue;
        }
        let eligible_at = release + Duration::hours(min_hours_after_release as i64);
        if eligible_at > now {
            *next_wakeup = Some(next_wakeup.map_or(eligible_at, |current| current.min(eligible_at)));
        }
    }
}

fn track_episode_wakeup(missing: &[WantedEpisode], min_hours_after_release: u32, now: DateTime<Utc>, next_wakeup: &mut Option<DateTime<Utc>>) {
    if min_hours_after_release == 0 {
        return;
    }
    let recent_floor = now - Duration::days(admission::RECENT_PRIORITY_WINDOW_DAYS);
    for ep in missing {
        let Some(release) = parse_arr_datetime_utc(ep.air_date_utc.as_deref()) else { continue };
        if release < recent_floor || release > now {
            continue;
        }
        let eligible_at = release + Duration::hours(min_hours_after_release as i64);
        if eligible_at > now {
            *next_wakeup = Some(next_wakeup.map_or(eligible_at, |current| current.min(eligible_at)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn smart_action_prefers_pack_on_high_coverage() {
        // 3 missing out of a highest episode number of 5 -> coverage 0.6.
        let inv = SeasonInventory { aired_total: 10, aired_downloaded: 7, unaired_total: 0 };
        assert!(matches!(choose_smart_action(Some(&inv), &[1, 2, 5]), GroupAction::SeasonPack));
    }

    #[test]
    fn smart_action_forces_pack_on_large_missing_count_regardless_of_coverage() {
        let inv = SeasonInventory { aired_total: 20, aired_downloaded: 5, unaired_total: 0 };
        assert!(matches!(choose_smart_action(Some(&inv), &[1, 2, 3, 4, 5, 6, 20]), GroupAction::SeasonPack));
    }

    #[test]
    fn smart_action_prefers_episodes_on_low_coverage_small_count() {
        // 2 missing out of a highest episode number of 10 -> coverage 0.2.
        let inv = SeasonInventory { aired_total: 10, aired_downloaded: 1, unaired_total: 0 };
        assert!(matches!(choose_smart_action(Some(&inv), &[1, 10]), GroupAction::PerEpisode));
    }

    #[test]
    fn smart_action_falls_back_to_group_size_without_inventory() {
        assert!(matches!(choose_smart_action(None, &[1, 2, 3]), GroupAction::SeasonPack));
        assert!(matches!(choose_smart_action(None, &[1, 2]), GroupAction::PerEpisode));
    }

    #[test]
    fn smart_action_picks_season_pack_for_library_empty_season() {
        // spec.md §8 seed scenario 4: aired_total=6, aired_downloaded=0,
        // missing episodes {1,2,3} -> season_pack, via the library-empty
        // rule rather than the missing-count/coverage thresholds.
        let inv = SeasonInventory { aired_total: 6, aired_downloaded: 0, unaired_total: 0 };
        assert!(matches!(choose_smart_action(Some(&inv), &[1, 2, 3]), GroupAction::SeasonPack));
    }

    #[test]
    fn drop_specials_only_when_non_specials_present() {
        let eps = vec![
            WantedEpisode {
                episode_id: 1,
                series_id: 1,
                series_title: "Show".into(),
                series_tvdb_id: 1,
                season_number: 0,
                episode_number: 1,
                air_date_utc: None,
                wanted_kind: crate::arr::WantedKind::Missing,
            },
            WantedEpisode {
                episode_id: 2,
                series_id: 1,
                series_title: "Show".into(),
                series_tvdb_id: 1,
                season_number: 1,
                episode_number: 1,
                air_date_utc: None,
                wanted_kind: crate::arr::WantedKind::Missing,
            },
        ];
        let filtered = drop_specials_if_non_specials_exist(eps);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].season_number, 1);

        let only_specials = vec![WantedEpisode {
            episode_id: 1,
            series_id: 1,
            series_title: "Show".into(),
            series_tvdb_id: 1,
            season_number: 0,
            episode_number: 1,
            air_date_utc: None,
            wanted_kind: crate::arr::WantedKind::Missing,
        }];
        assert_eq!(drop_specials_if_non_specials_exist(only_specials).len(), 1);
    }
}
