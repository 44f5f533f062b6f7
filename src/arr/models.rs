//! Wanted-item types shared between the selector, admission pipeline, and
//! the Arr client.

use serde::{Deserialize, Serialize};

/// Whether an item was pulled from the "missing" list or the "cutoff unmet"
/// (quality upgrade) list. Missing wins when an item shows up in both.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WantedKind {
    Missing,
    Cutoff,
}

impl WantedKind {
    pub fn as_str(self) -> &'static str {
        match self {
            WantedKind::Missing => "missing",
            WantedKind::Cutoff => "cutoff",
        }
    }
}

impl std::fmt::Display for WantedKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedMovie {
    pub movie_id: i64,
    pub title: String,
    pub year: i32,
    pub tmdb_id: i64,
    pub imdb_id: String,
    pub release_date_utc: Option<String>,
    pub wanted_kind: WantedKind,
}

impl WantedMovie {
    pub fn item_key(&self) -> String {
        format!("movie:{}", self.movie_id)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WantedEpisode {
    pub episode_id: i64,
    pub series_id: i64,
    pub series_title: String,
    pub series_tvdb_id: i64,
    pub season_number: i32,
    pub episode_number: i32,
    pub air_date_utc: Option<String>,
    pub wanted_kind: WantedKind,
}

impl WantedEpisode {
    pub fn item_key(&self) -> String {
        format!("episode:{}", self.episode_id)
    }
}

/// Per-season inventory counts used by Sonarr's smart grouping heuristic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SeasonInventory {
    pub aired_total: u32,
    pub aired_downloaded: u32,
    pub unaired_total: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_movie() -> WantedMovie {
        WantedMovie {
            movie_id: 1,
            title: "The Matrix".to_string(),
            year: 1999,
            tmdb_id: 603,
            imdb_id: "tt0133093".to_string(),
            release_date_utc: None,
            wanted_kind: WantedKind::Missing,
        }
    }

    #[test]
    fn item_keys_are_stable() {
        assert_eq!(sample_movie().item_key(), "movie:1");
        let ep = WantedEpisode {
            episode_id: 7,
            series_id: 1,
            series_title: "Example Show".to_string(),
            series_tvdb_id: 42,
            season_number: 2,
            episode_number: 5,
            air_date_utc: None,
            wanted_kind: WantedKind::Missing,
        };
        assert_eq!(ep.item_key(), "episode:7");
    }
}
