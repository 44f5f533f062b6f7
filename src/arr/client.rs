//! Async HTTP client for a single Radarr/Sonarr instance.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use reqwest::Client;
use serde_json::{json, Value};

use crate::config::ArrConfig;
use crate::error::ArrRequestError;
use crate::time_util::parse_arr_datetime_utc;

use super::models::{SeasonInventory, WantedEpisode, WantedKind, WantedMovie};

fn as_bool(value: Option<&Value>) -> Option<bool> {
    match value {
        None | Some(Value::Null) => None,
        Some(Value::Bool(b)) => Some(*b),
        Some(Value::Number(n)) => n.as_f64().map(|f| f != 0.0),
        Some(Value::String(s)) => match s.trim().to_lowercase().as_str() {
            "true" | "1" | "yes" | "on" => Some(true),
            "false" | "0" | "no" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

fn as_i64(value: Option<&Value>) -> i64 {
    match value {
        Some(Value::Number(n)) => n.as_i64().unwrap_or(0),
        Some(Value::String(s)) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

fn as_str(value: Option<&Value>) -> String {
    match value {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn as_opt_str(value: Option<&Value>) -> Option<String> {
    match value {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

#[derive(Clone)]
struct MovieMeta {
    monitored: bool,
    release_date_utc: Option<String>,
}

/// De-duplicates `missing`/`cutoff` movie rows into the union the selector
/// works with, preferring the "missing" variant when an id appears in both
/// lists and dropping cutoff rows the upstream no longer considers unmet
/// (`qualityCutoffNotMet: false`).
fn merge_wanted_movies(missing_rows: Vec<Value>, cutoff_rows: Vec<Value>, movie_meta: &HashMap<i64, MovieMeta>) -> Vec<WantedMovie> {
    let mut out: HashMap<i64, WantedMovie> = HashMap::new();
    for (kind, rows) in [
        (WantedKind::Missing, missing_rows),
        (WantedKind::Cutoff, cutoff_rows),
    ] {
        for row in rows.iter().filter_map(Value::as_object) {
            let movie_id = {
                let id = as_i64(row.get("id"));
                if id != 0 { id } else { as_i64(row.get("movieId")) }
            };
            if movie_id == 0 {
                continue;
            }
            if kind == WantedKind::Cutoff {
                if out.contains_key(&movie_id) {
                    continue;
                }
                if as_bool(row.get("qualityCutoffNotMet")) == Some(false) {
                    continue;
                }
            }

            let meta = movie_meta.get(&movie_id);
            let nested_movie = row.get("movie").and_then(Value::as_object);
            let monitored = meta
                .map(|m| m.monitored)
                .or_else(|| as_bool(row.get("monitored")))
                .or_else(|| nested_movie.and_then(|m| as_bool(m.get("monitored"))))
                .unwrap_or(true);
            if !monitored {
                continue;
            }

            let release_date_utc = meta
                .and_then(|m| m.release_date_utc.clone())
                .or_else(|| as_opt_str(row.get("digitalRelease")))
                .or_else(|| as_opt_str(row.get("physicalRelease")))
                .or_else(|| as_opt_str(row.get("inCinemas")))
                .or_else(|| nested_movie.and_then(|m| as_opt_str(m.get("digitalRelease"))))
                .or_else(|| nested_movie.and_then(|m| as_opt_str(m.get("physicalRelease"))))
                .or_else(|| nested_movie.and_then(|m| as_opt_str(m.get("inCinemas"))));

            out.insert(
                movie_id,
                WantedMovie {
                    movie_id,
                    title: as_str(row.get("title")),
                    year: as_i64(row.get("year")) as i32,
                    tmdb_id: as_i64(row.get("tmdbId")),
                    imdb_id: as_str(row.get("imdbId")).to_lowercase(),
                    release_date_utc,
                    wanted_kind: kind,
                },
            );
        }
    }
    out.into_values().collect()
}

/// Same idea as [`merge_wanted_movies`] but for episodes, with the
/// series-monitored lookup keyed by `(title, tvdb_id, monitored)`.
fn merge_wanted_episodes(
    missing_rows: Vec<Value>,
    cutoff_rows: Vec<Value>,
    series_lookup: &HashMap<i64, (String, i64, bool)>,
) -> Vec<WantedEpisode> {
    let mut out: HashMap<i64, WantedEpisode> = HashMap::new();
    for (kind, rows) in [
        (WantedKind::Missing, missing_rows),
        (WantedKind::Cutoff, cutoff_rows),
    ] {
        for row in rows.iter().filter_map(Value::as_object) {
            let episode_id = {
                let id = as_i64(row.get("id"));
                if id != 0 { id } else { as_i64(row.get("episodeId")) }
            };
            if episode_id == 0 {
                continue;
            }
            if kind == WantedKind::Cutoff {
                if out.contains_key(&episode_id) {
                    continue;
                }
                if as_bool(row.get("qualityCutoffNotMet")) == Some(false) {
                    continue;
                }
            }

            let series = row.get("series").and_then(Value::as_object);
            let series_id = {
                let id = as_i64(row.get("seriesId"));
                if id != 0 {
                    id
                } else {
                    series.map(|s| as_i64(s.get("id"))).unwrap_or(0)
                }
            };
            let fallback = series_lookup.get(&series_id).cloned();
            let series_monitored = series
                .and_then(|s| as_bool(s.get("monitored")))
                .or_else(|| fallback.as_ref().map(|f| f.2));
            if series_monitored == Some(false) {
                continue;
            }
            if as_bool(row.get("monitored")) == Some(false) {
                continue;
            }

            let air_date_utc = as_opt_str(row.get("airDateUtc")).or_else(|| as_opt_str(row.get("airDate")));

            out.insert(
                episode_id,
                WantedEpisode {
                    episode_id,
                    series_id,
                    series_title: series
                        .and_then(|s| as_opt_str(s.get("title")))
                        .or_else(|| as_opt_str(row.get("seriesTitle")))
                        .or_else(|| fallback.as_ref().map(|f| f.0.clone()))
                        .unwrap_or_default(),
                    series_tvdb_id: series
                        .map(|s| as_i64(s.get("tvdbId")))
                        .filter(|&v| v != 0)
                        .or_else(|| {
                            let v = as_i64(row.get("seriesTvdbId"));
                            if v != 0 { Some(v) } else { None }
                        })
                        .or_else(|| fallback.as_ref().map(|f| f.1))
                        .unwrap_or(0),
                    season_number: as_i64(row.get("seasonNumber")) as i32,
                    episode_number: as_i64(row.get("episodeNumber")) as i32,
                    air_date_utc,
                    wanted_kind: kind,
                },
            );
        }
    }
    out.into_values().collect()
}

/// Thin wrapper over Radarr/Sonarr's v3 REST API.
pub struct ArrClient {
    name: String,
    config: ArrConfig,
    http: Client,
    timeout_seconds: u64,
}

impl ArrClient {
    pub fn new(name: impl Into<String>, config: ArrConfig, timeout_seconds: u64, verify_ssl: bool) -> Self {
        let http = Client::builder()
            .danger_accept_invalid_certs(!verify_ssl)
            .timeout(Duration::from_secs(timeout_seconds))
            .build()
            .expect("reqwest client builds with well-formed TLS options");
        Self {
            name: name.into(),
            config,
            http,
            timeout_seconds,
        }
    }

    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        query: &[(&str, String)],
        body: Option<Value>,
    ) -> Result<Value, ArrRequestError> {
        let base = self.config.url.trim_end_matches('/').to_string();
        let url = format!("{base}{path}");

        let mut builder = self
            .http
            .request(method.clone(), &url)
            .header("X-Api-Key", &self.config.api_key)
            .query(query);
        if let Some(ref payload) = body {
            builder = builder.json(payload);
        }

        let response = builder.send().await.map_err(|err| {
            if err.is_timeout() {
                ArrRequestError::new(
                    &self.name,
                    &base,
                    method.as_str(),
                    path,
                    format!("Request timed out after {}s", self.timeout_seconds),
                )
                .with_hint("Increase request_timeout_seconds or check network latency.")
            } else if err.is_connect() {
                ArrRequestError::new(
                    &self.name,
                    &base,
                    method.as_str(),
                    path,
                    "Cannot connect (connection refused/unreachable)",
                )
                .with_hint("Check the instance URL/port and that the service is running.")
            } else {
                ArrRequestError::new(&self.name, &base, method.as_str(), path, err.to_string())
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let mut snippet = text.trim().replace('\n', " ");
            if snippet.chars().count() > 200 {
                snippet = snippet.chars().take(200).collect::<String>() + "...";
            }
            let message = if snippet.is_empty() {
                format!("HTTP {}", status.as_u16())
            } else {
                format!("HTTP {} ({snippet})", status.as_u16())
            };
            return Err(ArrRequestError::new(&self.name, &base, method.as_str(), path, message)
                .with_hint("Check API key permissions and that the endpoint exists for your Arr version."));
        }

        let text = response.text().await.unwrap_or_default();
        if text.is_empty() {
            return Ok(json!({}));
        }
        serde_json::from_str(&text).map_err(|_| {
            ArrRequestError::new(&self.name, &base, method.as_str(), path, "Invalid JSON response")
        })
    }

    async fn fetch_paged_records(&self, path: &str) -> Vec<Value> {
        let mut page = 1u32;
        let page_size = 250u32;
        let mut records = Vec::new();
        loop {
            let query = [("page", page.to_string()), ("pageSize", page_size.to_string())];
            let payload = match self.request(reqwest::Method::GET, path, &query, None).await {
                Ok(p) => p,
                Err(_) => break,
            };
            let chunk: Vec<Value> = match payload {
                Value::Object(ref map) if map.contains_key("records") => map
                    .get("records")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                Value::Array(arr) => arr,
                _ => Vec::new(),
            };
            if chunk.is_empty() {
                break;
            }
            let chunk_len = chunk.len();
            records.extend(chunk.into_iter().filter(Value::is_object));
            if chunk_len < page_size as usize {
                break;
            }
            page += 1;
        }
        records
    }

    /// Fetches calendar entries in `[start, end]` inclusive. Works for both
    /// Sonarr and Radarr.
    pub async fn fetch_calendar(&self, start: NaiveDate, end: NaiveDate) -> Vec<Value> {
        let query = [
            ("start", start.format("%Y-%m-%d").to_string()),
            ("end", end.format("%Y-%m-%d").to_string()),
        ];
        match self.request(reqwest::Method::GET, "/api/v3/calendar", &query, None).await {
            Ok(Value::Array(rows)) => rows.into_iter().filter(Value::is_object).collect(),
            _ => Vec::new(),
        }
    }

    async fn fetch_series_lookup(&self) -> HashMap<i64, (String, i64, bool)> {
        let mut lookup = HashMap::new();
        let payload = match self.request(reqwest::Method::GET, "/api/v3/series", &[], None).await {
            Ok(p) => p,
            Err(_) => return lookup,
        };
        let Value::Array(rows) = payload else {
            return lookup;
        };
        for row in rows.iter().filter_map(Value::as_object) {
            let series_id = as_i64(row.get("id"));
            if series_id == 0 {
                continue;
            }
            let title = as_str(row.get("title")).trim().to_string();
            let tvdb_id = as_i64(row.get("tvdbId"));
            let monitored = as_bool(row.get("monitored")) != Some(false);
            lookup.insert(series_id, (title, tvdb_id, monitored));
        }
        lookup
    }

    async fn fetch_movie_meta_lookup(&self) -> HashMap<i64, MovieMeta> {
        let mut lookup = HashMap::new();
        let payload = match self.request(reqwest::Method::GET, "/api/v3/movie", &[], None).await {
            Ok(p) => p,
            Err(_) => return lookup,
        };
        let Value::Array(rows) = payload else {
            return lookup;
        };
        for row in rows.iter().filter_map(Value::as_object) {
            let movie_id = as_i64(row.get("id"));
            if movie_id == 0 {
                continue;
            }
            let monitored = as_bool(row.get("monitored")) != Some(false);
            let release_date_utc = as_opt_str(row.get("digitalRelease"))
                .or_else(|| as_opt_str(row.get("physicalRelease")))
                .or_else(|| as_opt_str(row.get("inCinemas")));
            lookup.insert(
                movie_id,
                MovieMeta {
                    monitored,
                    release_date_utc,
                },
            );
        }
        lookup
    }

    /// Returns the de-duplicated union of missing and cutoff-unmet movies,
    /// preferring the "missing" variant when an id appears in both lists.
    pub async fn fetch_wanted_movies(
        &self,
        search_missing: bool,
        search_cutoff_unmet: bool,
    ) -> Vec<WantedMovie> {
        if !self.config.enabled {
            return Vec::new();
        }
        let movie_meta = self.fetch_movie_meta_lookup().await;
        let missing_rows = if search_missing {
            self.fetch_paged_records("/api/v3/wanted/missing").await
        } else {
            Vec::new()
        };
        let cutoff_rows = if search_cutoff_unmet {
            self.fetch_paged_records("/api/v3/wanted/cutoff").await
        } else {
            Vec::new()
        };
        merge_wanted_movies(missing_rows, cutoff_rows, &movie_meta)
    }

    /// Returns the de-duplicated union of missing and cutoff-unmet episodes.
    pub async fn fetch_wanted_episodes(
        &self,
        search_missing: bool,
        search_cutoff_unmet: bool,
    ) -> Vec<WantedEpisode> {
        if !self.config.enabled {
            return Vec::new();
        }
        let missing_rows = if search_missing {
            self.fetch_paged_records("/api/v3/wanted/missing").await
        } else {
            Vec::new()
        };
        let cutoff_rows = if search_cutoff_unmet {
            self.fetch_paged_records("/api/v3/wanted/cutoff").await
        } else {
            Vec::new()
        };
        let series_lookup = self.fetch_series_lookup().await;
        merge_wanted_episodes(missing_rows, cutoff_rows, &series_lookup)
    }

    pub async fn trigger_movie_search(&self, movie_id: i64) -> bool {
        let body = json!({"name": "MoviesSearch", "movieIds": [movie_id]});
        match self.request(reqwest::Method::POST, "/api/v3/command", &[], Some(body)).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(%movie_id, error = %err, "Radarr command failed for movie");
                false
            }
        }
    }

    pub async fn trigger_episode_search(&self, episode_id: i64) -> bool {
        let body = json!({"name": "EpisodeSearch", "episodeIds": [episode_id]});
        match self.request(reqwest::Method::POST, "/api/v3/command", &[], Some(body)).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(%episode_id, error = %err, "Sonarr command failed for episode");
                false
            }
        }
    }

    pub async fn trigger_episode_search_bulk(&self, episode_ids: &[i64]) -> bool {
        let ids: Vec<i64> = episode_ids.iter().copied().filter(|&id| id > 0).collect();
        if ids.is_empty() {
            return false;
        }
        let body = json!({"name": "EpisodeSearch", "episodeIds": ids});
        match self.request(reqwest::Method::POST, "/api/v3/command", &[], Some(body)).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(count = ids.len(), error = %err, "Sonarr command failed for bulk episodes");
                false
            }
        }
    }

    pub async fn trigger_season_search(&self, series_id: i64, season_number: i32) -> bool {
        let body = json!({"name": "SeasonSearch", "seriesId": series_id, "seasonNumber": season_number});
        match self.request(reqwest::Method::POST, "/api/v3/command", &[], Some(body)).await {
            Ok(_) => true,
            Err(err) => {
                tracing::warn!(%series_id, %season_number, error = %err, "Sonarr command failed for season");
                false
            }
        }
    }

    /// Sonarr-only helper for Smart mode: per-season counts of aired
    /// episodes known to Sonarr, how many are downloaded, and how many
    /// episodes haven't aired yet.
    pub async fn fetch_series_season_inventory(&self, series_id: i64) -> HashMap<i32, SeasonInventory> {
        let mut out = HashMap::new();
        let query = [("seriesId", series_id.to_string())];
        let payload = match self.request(reqwest::Method::GET, "/api/v3/episode", &query, None).await {
            Ok(p) => p,
            Err(_) => return out,
        };
        let Value::Array(rows) = payload else {
            return out;
        };

        let now_utc = Utc::now();
        for row in rows.iter().filter_map(Value::as_object) {
            let season_number = as_i64(row.get("seasonNumber")) as i32;
            if season_number <= 0 {
                continue;
            }
            let air_iso = as_opt_str(row.get("airDateUtc")).or_else(|| as_opt_str(row.get("airDate")));
            let aired = match air_iso.as_deref() {
                Some(s) => parse_arr_datetime_utc(Some(s)).map(|dt| dt <= now_utc).unwrap_or(true),
                None => true,
            };

            let slot = out.entry(season_number).or_insert_with(SeasonInventory::default);
            if aired {
                slot.aired_total += 1;
                if as_bool(row.get("hasFile")) == Some(true) {
                    slot.aired_downloaded += 1;
                }
            } else {
                slot.unaired_total += 1;
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cutoff_rows_no_longer_unmet_are_dropped() {
        // spec.md §8 seed scenario 1: cutoff=[{202, qualityCutoffNotMet:true},
        // {201, qualityCutoffNotMet:false}] -> only 202 surfaces as wanted.
        let cutoff_rows = vec![
            json!({"id": 202, "qualityCutoffNotMet": true}),
            json!({"id": 201, "qualityCutoffNotMet": false}),
        ];
        let movies = merge_wanted_movies(Vec::new(), cutoff_rows, &HashMap::new());
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].movie_id, 202);
        assert_eq!(movies[0].wanted_kind, WantedKind::Cutoff);
    }

    #[test]
    fn cutoff_rows_without_the_field_still_surface() {
        // Older/partial upstream payloads may omit qualityCutoffNotMet
        // entirely; absence shouldn't be treated as "not met" (false).
        let cutoff_rows = vec![json!({"id": 303})];
        let movies = merge_wanted_movies(Vec::new(), cutoff_rows, &HashMap::new());
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].movie_id, 303);
    }

    #[test]
    fn missing_wins_over_cutoff_for_the_same_id() {
        let missing_rows = vec![json!({"id": 5, "title": "Missing Copy"})];
        let cutoff_rows = vec![json!({"id": 5, "title": "Cutoff Copy", "qualityCutoffNotMet": true})];
        let movies = merge_wanted_movies(missing_rows, cutoff_rows, &HashMap::new());
        assert_eq!(movies.len(), 1);
        assert_eq!(movies[0].wanted_kind, WantedKind::Missing);
        assert_eq!(movies[0].title, "Missing Copy");
    }

    #[test]
    fn episode_cutoff_rows_no_longer_unmet_are_dropped() {
        let cutoff_rows = vec![
            json!({"id": 1001, "seriesId": 1, "qualityCutoffNotMet": true}),
            json!({"id": 1002, "seriesId": 1, "qualityCutoffNotMet": false}),
        ];
        let episodes = merge_wanted_episodes(Vec::new(), cutoff_rows, &HashMap::new());
        assert_eq!(episodes.len(), 1);
        assert_eq!(episodes[0].episode_id, 1001);
    }
}
