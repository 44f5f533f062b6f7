//! Pure ordering and grouping logic for wanted items.
//!
//! Nothing here talks to Radarr/Sonarr or the store: callers hand in the
//! wanted items (already fetched) plus whatever calendar/inventory context
//! they have, and get back an order to process them in. Keeping this side
//! effect free makes the ordering rules easy to test against fixed clocks.

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Duration, Utc};
use rand::seq::SliceRandom;
use rand::thread_rng;

use crate::arr::{WantedEpisode, WantedMovie};
use crate::time_util::parse_arr_datetime_utc;

/// Items airing/releasing within this many days of "now" jump to the front
/// of the smart ordering, just behind anything boosted by the calendar.
pub const RECENT_PRIORITY_WINDOW_DAYS: i64 = 2;

/// Fraction of the remaining (non-recent) dated items pushed to the very
/// back of a smart ordering, oldest first.
const OLDEST_TAIL_FRACTION: f64 = 0.10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchOrder {
    Smart,
    Newest,
    Oldest,
    Random,
}

impl SearchOrder {
    /// Matches the original's normalization: anything other than the three
    /// explicit non-smart names falls back to "newest" rather than failing.
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_lowercase().as_str() {
            "smart" => SearchOrder::Smart,
            "oldest" => SearchOrder::Oldest,
            "random" => SearchOrder::Random,
            "newest" => SearchOrder::Newest,
            _ => SearchOrder::Newest,
        }
    }
}

/// Calendar-derived boost: items that already showed up on the Arr
/// instance's calendar get pulled to the very front of a smart ordering,
/// ranked among themselves by calendar timestamp (most recent first).
#[derive(Debug, Default, Clone)]
pub struct CalendarBoost {
    timestamps: HashMap<i64, i64>,
}

impl CalendarBoost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, id: i64, timestamp: i64) {
        self.timestamps
            .entry(id)
            .and_modify(|existing| *existing = (*existing).max(timestamp))
            .or_insert(timestamp);
    }

    fn boost_ts(&self, id: i64) -> Option<i64> {
        self.timestamps.get(&id).copied()
    }
}

/// Same idea as [`CalendarBoost`] but for episodes, which the calendar may
/// only identify by `(series_id, season_number, episode_number)` rather
/// than by episode id.
#[derive(Debug, Default, Clone)]
pub struct EpisodeCalendarBoost {
    by_id: HashMap<i64, i64>,
    by_triple: HashMap<(i64, i32, i32), i64>,
}

impl EpisodeCalendarBoost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_by_id(&mut self, episode_id: i64, timestamp: i64) {
        self.by_id
            .entry(episode_id)
            .and_modify(|existing| *existing = (*existing).max(timestamp))
            .or_insert(timestamp);
    }

    pub fn insert_by_triple(&mut self, series_id: i64, season_number: i32, episode_number: i32, timestamp: i64) {
        self.by_triple
            .entry((series_id, season_number, episode_number))
            .and_modify(|existing| *existing = (*existing).max(timestamp))
            .or_insert(timestamp);
    }

    fn boost_ts(&self, ep: &WantedEpisode) -> Option<i64> {
        self.by_id.get(&ep.episode_id).copied().or_else(|| {
            self.by_triple
                .get(&(ep.series_id, ep.season_number, ep.episode_number))
                .copied()
        })
    }
}

/// Buckets a pre-resolved `(item, known date, calendar boost)` list into the
/// five smart-ordering bands: calendar boost desc, recent desc, shuffled
/// middle, oldest tail asc, unknown-date last.
fn band_order<T>(entries: Vec<(T, Option<DateTime<Utc>>, Option<i64>)>, now: DateTime<Utc>) -> Vec<T> {
    let mut boosted: Vec<(i64, T)> = Vec::new();
    let mut candidates: Vec<(T, Option<DateTime<Utc>>)> = Vec::new();
    for (item, dt, boost) in entries {
        match boost {
            Some(ts) => boosted.push((ts, item)),
            None => candidates.push((item, dt)),
        }
    }
    boosted.sort_by(|a, b| b.0.cmp(&a.0));

    let recent_floor = now - Duration::days(RECENT_PRIORITY_WINDOW_DAYS);
    let mut recent: Vec<(DateTime<Utc>, T)> = Vec::new();
    let mut dated_rest: Vec<(DateTime<Utc>, T)> = Vec::new();
    let mut unknown: Vec<T> = Vec::new();
    for (item, dt) in candidates {
        match dt {
            None => unknown.push(item),
            Some(d) if d >= recent_floor => recent.push((d, item)),
            Some(d) => dated_rest.push((d, item)),
        }
    }
    recent.sort_by(|a, b| b.0.cmp(&a.0));
    dated_rest.sort_by(|a, b| a.0.cmp(&b.0));

    let tail_len = if dated_rest.is_empty() {
        0
    } else {
        ((dated_rest.len() as f64 * OLDEST_TAIL_FRACTION) as usize).max(1)
    };
    let tail_len = tail_len.min(dated_rest.len());
    let oldest_tail: Vec<_> = dated_rest.drain(..tail_len).collect();
    let mut middle = dated_rest;
    middle.shuffle(&mut thread_rng());

    let mut out = Vec::with_capacity(boosted.len() + recent.len() + middle.len() + oldest_tail.len() + unknown.len());
    out.extend(boosted.into_iter().map(|(_, item)| item));
    out.extend(recent.into_iter().map(|(_, item)| item));
    out.extend(middle.into_iter().map(|(_, item)| item));
    out.extend(oldest_tail.into_iter().map(|(_, item)| item));
    out.extend(unknown);
    out
}

fn date_sort<T>(mut items: Vec<T>, date_of: impl Fn(&T) -> Option<DateTime<Utc>>, newest_first: bool) -> Vec<T> {
    items.sort_by(|a, b| {
        let (da, db) = (date_of(a), date_of(b));
        match (da, db) {
            (Some(x), Some(y)) => {
                if newest_first {
                    y.cmp(&x)
                } else {
                    x.cmp(&y)
                }
            }
            (Some(_), None) => std::cmp::Ordering::Less,
            (None, Some(_)) => std::cmp::Ordering::Greater,
            (None, None) => std::cmp::Ordering::Equal,
        }
    });
    items
}

pub fn order_movies(items: Vec<WantedMovie>, order: SearchOrder, now: DateTime<Utc>, calendar: &CalendarBoost) -> Vec<WantedMovie> {
    match order {
        SearchOrder::Random => {
            let mut items = items;
            items.shuffle(&mut thread_rng());
            items
        }
        SearchOrder::Newest => date_sort(items, |m| parse_arr_datetime_utc(m.release_date_utc.as_deref()), true),
        SearchOrder::Oldest => date_sort(items, |m| parse_arr_datetime_utc(m.release_date_utc.as_deref()), false),
        SearchOrder::Smart => {
            let entries = items
                .into_iter()
                .map(|m| {
                    let dt = parse_arr_datetime_utc(m.release_date_utc.as_deref());
                    let boost = calendar.boost_ts(m.movie_id);
                    (m, dt, boost)
                })
                .collect();
            band_order(entries, now)
        }
    }
}

pub fn order_episodes(
    items: Vec<WantedEpisode>,
    order: SearchOrder,
    now: DateTime<Utc>,
    calendar: &EpisodeCalendarBoost,
) -> Vec<WantedEpisode> {
    match order {
        SearchOrder::Random => {
            let mut items = items;
            items.shuffle(&mut thread_rng());
            items
        }
        SearchOrder::Newest => date_sort(items, |e| parse_arr_datetime_utc(e.air_date_utc.as_deref()), true),
        SearchOrder::Oldest => date_sort(items, |e| parse_arr_datetime_utc(e.air_date_utc.as_deref()), false),
        SearchOrder::Smart => {
            let entries = items
                .into_iter()
                .map(|e| {
                    let dt = parse_arr_datetime_utc(e.air_date_utc.as_deref());
                    let boost = calendar.boost_ts(&e);
                    (e, dt, boost)
                })
                .collect();
            band_order(entries, now)
        }
    }
}

/// `(series_id, season_number)` grouping key for Sonarr's season-pack and
/// smart missing modes. Season 0 (specials) is kept: callers decide
/// upstream whether to drop specials when a series has non-special seasons.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SeasonGroupKey {
    pub series_id: i64,
    pub season_number: i32,
}

pub type SeasonGroup = (SeasonGroupKey, Vec<WantedEpisode>);

/// Groups episodes by `(series_id, season_number)`, preserving the relative
/// order groups first appear in `items`.
pub fn group_by_season(items: Vec<WantedEpisode>) -> Vec<SeasonGroup> {
    let mut map: HashMap<SeasonGroupKey, Vec<WantedEpisode>> = HashMap::new();
    let mut order: Vec<SeasonGroupKey> = Vec::new();
    for ep in items {
        if ep.series_id <= 0 {
            continue;
        }
        let key = SeasonGroupKey {
            series_id: ep.series_id,
            season_number: ep.season_number,
        };
        if !map.contains_key(&key) {
            order.push(key);
        }
        map.entry(key).or_default().push(ep);
    }
    order
        .into_iter()
        .map(|key| {
            let eps = map.remove(&key).unwrap_or_default();
            (key, eps)
        })
        .collect()
}

/// Groups episodes by `series_id` alone, for Sonarr's "shows" missing mode.
pub fn group_by_series(items: Vec<WantedEpisode>) -> Vec<(i64, Vec<WantedEpisode>)> {
    let mut map: HashMap<i64, Vec<WantedEpisode>> = HashMap::new();
    let mut order: Vec<i64> = Vec::new();
    for ep in items {
        if ep.series_id <= 0 {
            continue;
        }
        if !map.contains_key(&ep.series_id) {
            order.push(ep.series_id);
        }
        map.entry(ep.series_id).or_default().push(ep);
    }
    order
        .into_iter()
        .map(|series_id| {
            let eps = map.remove(&series_id).unwrap_or_default();
            (series_id, eps)
        })
        .collect()
}

fn group_representative_date(eps: &[WantedEpisode], newest: bool) -> Option<DateTime<Utc>> {
    let dates: Vec<DateTime<Utc>> = eps
        .iter()
        .filter_map(|e| parse_arr_datetime_utc(e.air_date_utc.as_deref()))
        .collect();
    if newest {
        dates.into_iter().max()
    } else {
        dates.into_iter().min()
    }
}

fn group_boost_ts(eps: &[WantedEpisode], calendar: &EpisodeCalendarBoost) -> Option<i64> {
    eps.iter().filter_map(|e| calendar.boost_ts(e)).max()
}

/// Orders season groups the same way individual episodes are ordered, using
/// each group's newest (or, for "oldest", earliest) air date as its date key.
pub fn order_season_groups(groups: Vec<SeasonGroup>, order: SearchOrder, now: DateTime<Utc>, calendar: &EpisodeCalendarBoost) -> Vec<SeasonGroup> {
    match order {
        SearchOrder::Random => {
            let mut groups = groups;
            groups.shuffle(&mut thread_rng());
            groups
        }
        SearchOrder::Newest => {
            let mut groups = groups;
            groups.sort_by(|a, b| group_representative_date(&b.1, true).cmp(&group_representative_date(&a.1, true)));
            groups
        }
        SearchOrder::Oldest => {
            let mut groups = groups;
            groups.sort_by(|a, b| group_representative_date(&a.1, false).cmp(&group_representative_date(&b.1, false)));
            groups
        }
        SearchOrder::Smart => {
            let entries = groups
                .into_iter()
                .map(|group| {
                    let dt = group_representative_date(&group.1, true);
                    let boost = group_boost_ts(&group.1, calendar);
                    (group, dt, boost)
                })
                .collect();
            band_order(entries, now)
        }
    }
}

/// Orders whole-series groups (Sonarr's "shows" missing mode) the same way
/// season groups are ordered.
pub fn order_series_groups(
    groups: Vec<(i64, Vec<WantedEpisode>)>,
    order: SearchOrder,
    now: DateTime<Utc>,
    calendar: &EpisodeCalendarBoost,
) -> Vec<(i64, Vec<WantedEpisode>)> {
    match order {
        SearchOrder::Random => {
            let mut groups = groups;
            groups.shuffle(&mut thread_rng());
            groups
        }
        SearchOrder::Newest => {
            let mut groups = groups;
            groups.sort_by(|a, b| group_representative_date(&b.1, true).cmp(&group_representative_date(&a.1, true)));
            groups
        }
        SearchOrder::Oldest => {
            let mut groups = groups;
            groups.sort_by(|a, b| group_representative_date(&a.1, false).cmp(&group_representative_date(&b.1, false)));
            groups
        }
        SearchOrder::Smart => {
            let entries = groups
                .into_iter()
                .map(|group| {
                    let dt = group_representative_date(&group.1, true);
                    let boost = group_boost_ts(&group.1, calendar);
                    (group, dt, boost)
                })
                .collect();
            band_order(entries, now)
        }
    }
}

/// Re-slots a cold-start series' own season groups into ascending season
/// order, leaving every other series' slots (and their relative order)
/// untouched. A series is "cold start" when it has no downloaded episodes
/// anywhere in the library yet, so airing order matters more than whatever
/// order the smart/newest/oldest/random pass happened to produce.
pub fn cold_start_prioritize(groups: Vec<SeasonGroup>, cold_start_series: &HashSet<i64>) -> Vec<SeasonGroup> {
    if cold_start_series.is_empty() {
        return groups;
    }
    let mut result = groups;
    let mut slots_by_series: HashMap<i64, Vec<usize>> = HashMap::new();
    for (idx, (key, _)) in result.iter().enumerate() {
        if cold_start_series.contains(&key.series_id) {
            slots_by_series.entry(key.series_id).or_default().push(idx);
        }
    }
    for (_series_id, slots) in slots_by_series {
        if slots.len() < 2 {
            continue;
        }
        let mut sorted_slots = slots.clone();
        sorted_slots.sort_by_key(|&idx| result[idx].0.season_number);
        let values: Vec<SeasonGroup> = sorted_slots.iter().map(|&idx| result[idx].clone()).collect();
        for (slot, value) in slots.into_iter().zip(values.into_iter()) {
            result[slot] = value;
        }
    }
    result
}

/// A series has no footprint in the library yet: every known season has
/// zero downloaded episodes. An empty inventory (lookup failed) is treated
/// as "not cold start" so a transient Sonarr error never reshuffles order.
pub fn is_cold_start_series(inventory: &HashMap<i32, crate::arr::SeasonInventory>) -> bool {
    !inventory.is_empty() && inventory.values().all(|season| season.aired_downloaded == 0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arr::WantedKind;

    fn movie(id: i64, days_from_now: Option<i64>, now: DateTime<Utc>) -> WantedMovie {
        WantedMovie {
            movie_id: id,
            title: format!("Movie {id}"),
            year: 2020,
            tmdb_id: id,
            imdb_id: String::new(),
            release_date_utc: days_from_now.map(|d| (now + Duration::days(d)).to_rfc3339()),
            wanted_kind: WantedKind::Missing,
        }
    }

    fn episode(series_id: i64, season: i32, episode: i32) -> WantedEpisode {
        WantedEpisode {
            episode_id: series_id * 1000 + (season as i64) * 100 + episode as i64,
            series_id,
            series_title: format!("Series {series_id}"),
            series_tvdb_id: series_id,
            season_number: season,
            episode_number: episode,
            air_date_utc: None,
            wanted_kind: WantedKind::Missing,
        }
    }

    #[test]
    fn parse_falls_back_to_newest_for_unknown_strings() {
        assert_eq!(SearchOrder::parse("bogus"), SearchOrder::Newest);
        assert_eq!(SearchOrder::parse("SMART"), SearchOrder::Smart);
        assert_eq!(SearchOrder::parse(" random "), SearchOrder::Random);
    }

    #[test]
    fn smart_order_boosts_calendar_hits_first() {
        let now = DateTime::parse_from_rfc3339("2026-01-10T00:00:00Z").unwrap().with_timezone(&Utc);
        let items = vec![movie(1, Some(-30), now), movie(2, Some(-1), now), movie(3, None, now)];
        let mut calendar = CalendarBoost::new();
        calendar.insert(3, 999);
        let ordered = order_movies(items, SearchOrder::Smart, now, &calendar);
        assert_eq!(ordered[0].movie_id, 3);
        assert_eq!(ordered[1].movie_id, 2);
        assert_eq!(ordered[2].movie_id, 1);
    }

    #[test]
    fn smart_order_pushes_oldest_tail_last_before_unknown() {
        let now = DateTime::parse_from_rfc3339("2026-01-10T00:00:00Z").unwrap().with_timezone(&Utc);
        let items: Vec<WantedMovie> = (0..10).map(|i| movie(i, Some(-30 - i), now)).collect();
        let calendar = CalendarBoost::new();
        let ordered = order_movies(items, SearchOrder::Smart, now, &calendar);
        let oldest_id = ordered.last().unwrap().movie_id;
        assert_eq!(oldest_id, 9);
    }

    #[test]
    fn newest_and_oldest_sort_by_date_with_unknown_last() {
        let now = Utc::now();
        let items = vec![movie(1, Some(-5), now), movie(2, Some(-1), now), movie(3, None, now)];
        let newest = date_sort(items.clone(), |m| parse_arr_datetime_utc(m.release_date_utc.as_deref()), true);
        assert_eq!(newest.iter().map(|m| m.movie_id).collect::<Vec<_>>(), vec![2, 1, 3]);
        let oldest = date_sort(items, |m| parse_arr_datetime_utc(m.release_date_utc.as_deref()), false);
        assert_eq!(oldest.iter().map(|m| m.movie_id).collect::<Vec<_>>(), vec![1, 2, 3]);
    }

    #[test]
    fn group_by_season_preserves_first_seen_order() {
        let items = vec![episode(101, 3, 1), episode(202, 1, 1), episode(101, 1, 1), episode(101, 1, 2)];
        let groups = group_by_season(items);
        let keys: Vec<(i64, i32)> = groups.iter().map(|(k, _)| (k.series_id, k.season_number)).collect();
        assert_eq!(keys, vec![(101, 3), (202, 1), (101, 1)]);
        assert_eq!(groups[2].1.len(), 2);
    }

    #[test]
    fn cold_start_moves_earliest_season_to_front_of_its_own_slots() {
        let groups: Vec<SeasonGroup> = vec![
            (SeasonGroupKey { series_id: 101, season_number: 3 }, vec![episode(101, 3, 1)]),
            (SeasonGroupKey { series_id: 202, season_number: 1 }, vec![episode(202, 1, 1)]),
            (SeasonGroupKey { series_id: 101, season_number: 1 }, vec![episode(101, 1, 1)]),
            (SeasonGroupKey { series_id: 101, season_number: 2 }, vec![episode(101, 2, 1)]),
            (SeasonGroupKey { series_id: 202, season_number: 2 }, vec![episode(202, 2, 1)]),
        ];
        let mut cold_start = HashSet::new();
        cold_start.insert(101);
        let reordered = cold_start_prioritize(groups, &cold_start);
        let keys: Vec<(i64, i32)> = reordered.iter().map(|(k, _)| (k.series_id, k.season_number)).collect();
        assert_eq!(keys, vec![(101, 1), (202, 1), (101, 2), (101, 3), (202, 2)]);
    }

    #[test]
    fn cold_start_ignores_series_not_in_the_set() {
        let groups: Vec<SeasonGroup> = vec![
            (SeasonGroupKey { series_id: 101, season_number: 3 }, vec![episode(101, 3, 1)]),
            (SeasonGroupKey { series_id: 101, season_number: 1 }, vec![episode(101, 1, 1)]),
        ];
        let reordered = cold_start_prioritize(groups.clone(), &HashSet::new());
        let keys: Vec<(i64, i32)> = reordered.iter().map(|(k, _)| (k.series_id, k.season_number)).collect();
        assert_eq!(keys, vec![(101, 3), (101, 1)]);
    }

    #[test]
    fn is_cold_start_series_requires_known_inventory_and_zero_downloads() {
        let mut inventory = HashMap::new();
        assert!(!is_cold_start_series(&inventory));
        inventory.insert(1, crate::arr::SeasonInventory { aired_total: 10, aired_downloaded: 0, unaired_total: 0 });
        assert!(is_cold_start_series(&inventory));
        inventory.insert(2, crate::arr::SeasonInventory { aired_total: 5, aired_downloaded: 2, unaired_total: 0 });
        assert!(!is_cold_start_series(&inventory));
    }
}
