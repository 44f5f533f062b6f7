//! Admission control: the gate sequence every candidate item runs through
//! before a search gets triggered, plus the cross-instance pacer.
//!
//! Each gate is cheap and store-backed; none of them touch the network.
//! [`Engine`](crate::engine) owns the per-cycle counters (duplicates,
//! per-cycle caps) and calls into here for the parts that need history.

use std::collections::HashSet;

use chrono::{DateTime, Duration, Utc};

use crate::error::StoreError;
use crate::store::Store;

/// A release is "recent" within this many days of now; recent items get a
/// shorter cooldown so a just-aired episode gets retried sooner than the
/// configured `item_retry_hours` would normally allow.
pub const RECENT_PRIORITY_WINDOW_DAYS: i64 = 2;

/// Cooldown ceiling applied to recent releases, regardless of how long
/// `item_retry_hours` is configured for.
pub const RECENT_RETRY_HOURS: i64 = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    Admit,
    Duplicate,
    NotReleased,
    RateLimited,
    Cooldown,
}

impl AdmissionDecision {
    pub fn is_admit(self) -> bool {
        matches!(self, AdmissionDecision::Admit)
    }
}

pub struct AdmissionContext<'a> {
    pub app_type: &'a str,
    pub instance_id: i64,
    pub now: DateTime<Utc>,
    pub rate_window_minutes: u32,
    pub rate_cap: u32,
    pub item_retry_hours: u32,
}

/// `now` falls within [release, release + RECENT_PRIORITY_WINDOW_DAYS).
pub fn is_recent_release(release: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    let floor = now - Duration::days(RECENT_PRIORITY_WINDOW_DAYS);
    release >= floor && release <= now
}

/// Release gate for a single dated item: eligible once `min_hours_after_release`
/// has elapsed since release, or immediately if the release date is unknown
/// or the gate is disabled.
pub fn is_released(release: Option<DateTime<Utc>>, min_hours_after_release: u32, now: DateTime<Utc>) -> bool {
    if min_hours_after_release == 0 {
        return true;
    }
    match release {
        None => true,
        Some(r) => now >= r + Duration::hours(min_hours_after_release as i64),
    }
}

/// Release gate for a group of episodes (season pack / bulk show search):
/// eligible as soon as any member is released, or if any member's date is
/// unknown (an unknown date never blocks a group, it only fails to help it).
pub fn is_group_released(releases: &[Option<DateTime<Utc>>], min_hours_after_release: u32, now: DateTime<Utc>) -> bool {
    if min_hours_after_release == 0 {
        return true;
    }
    let mut any_known = false;
    for release in releases {
        match release {
            None => return true,
            Some(r) => {
                any_known = true;
                if now >= *r + Duration::hours(min_hours_after_release as i64) {
                    return true;
                }
            }
        }
    }
    !any_known
}

/// Runs the duplicate / release / rate-cap / cooldown gates for a single
/// item. Per-cycle caps and cross-instance pacing are the caller's job:
/// they need mutable cycle-wide state this function doesn't have.
pub fn evaluate(
    store: &Store,
    ctx: &AdmissionContext,
    item_key: &str,
    released: bool,
    recent: bool,
    already_triggered_this_cycle: &HashSet<String>,
) -> Result<AdmissionDecision, StoreError> {
    if already_triggered_this_cycle.contains(item_key) {
        return Ok(AdmissionDecision::Duplicate);
    }
    if !released {
        return Ok(AdmissionDecision::NotReleased);
    }
    let window_start = ctx.now - Duration::minutes(ctx.rate_window_minutes as i64);
    let used = store.count_search_events_since(ctx.app_type, ctx.instance_id, window_start)?;
    if used >= ctx.rate_cap as i64 {
        return Ok(AdmissionDecision::RateLimited);
    }
    let mut cooldown_hours = ctx.item_retry_hours as i64;
    if recent {
        cooldown_hours = cooldown_hours.min(RECENT_RETRY_HOURS);
    }
    if store.item_on_cooldown(ctx.app_type, ctx.instance_id, item_key, cooldown_hours)? {
        return Ok(AdmissionDecision::Cooldown);
    }
    Ok(AdmissionDecision::Admit)
}

/// Shared cross-instance pacer: serializes search triggers across every
/// enabled instance so a burst of admits doesn't hammer the Arr app (or
/// whatever's behind it, e.g. a shared indexer) all at once.
pub struct Pacer {
    last_action_at: std::sync::Mutex<Option<tokio::time::Instant>>,
}

impl Pacer {
    pub fn new() -> Self {
        Self {
            last_action_at: std::sync::Mutex::new(None),
        }
    }

    /// Sleeps until at least `min_seconds` have elapsed since the last
    /// recorded action, then returns. Call [`Pacer::mark`] right after the
    /// action actually runs.
    pub async fn wait(&self, min_seconds: u32) {
        if min_seconds == 0 {
            return;
        }
        let wait_until = {
            let guard = self.last_action_at.lock().expect("pacer mutex poisoned");
            guard.map(|last| last + tokio::time::Duration::from_secs(min_seconds as u64))
        };
        if let Some(deadline) = wait_until {
            let now = tokio::time::Instant::now();
            if deadline > now {
                tokio::time::sleep(deadline - now).await;
            }
        }
    }

    pub fn mark(&self) {
        let mut guard = self.last_action_at.lock().expect("pacer mutex poisoned");
        *guard = Some(tokio::time::Instant::now());
    }
}

impl Default for Pacer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn release_gate_passes_immediately_when_disabled() {
        let now = Utc::now();
        assert!(is_released(None, 0, now));
        assert!(is_released(Some(now), 0, now));
    }

    #[test]
    fn release_gate_blocks_until_min_hours_elapsed() {
        let now = Utc::now();
        let release = now - Duration::hours(1);
        assert!(!is_released(Some(release), 3, now));
        assert!(is_released(Some(release), 1, now));
    }

    #[test]
    fn release_gate_never_blocks_unknown_dates() {
        let now = Utc::now();
        assert!(is_released(None, 48, now));
    }

    #[test]
    fn group_release_gate_passes_if_any_member_is_unknown() {
        let now = Utc::now();
        let releases = vec![Some(now + Duration::days(10)), None];
        assert!(is_group_released(&releases, 24, now));
    }

    #[test]
    fn group_release_gate_passes_if_any_member_is_released() {
        let now = Utc::now();
        let releases = vec![Some(now + Duration::days(10)), Some(now - Duration::hours(48))];
        assert!(is_group_released(&releases, 24, now));
    }

    #[test]
    fn group_release_gate_blocks_when_all_known_and_unreleased() {
        let now = Utc::now();
        let releases = vec![Some(now + Duration::days(1)), Some(now + Duration::hours(2))];
        assert!(!is_group_released(&releases, 24, now));
    }

    #[test]
    fn recent_release_window_is_inclusive_of_now_and_two_days_back() {
        let now = Utc::now();
        assert!(is_recent_release(now, now));
        assert!(is_recent_release(now - Duration::days(2), now));
        assert!(!is_recent_release(now - Duration::days(3), now));
    }

    #[tokio::test]
    async fn pacer_waits_until_min_interval_has_elapsed() {
        let pacer = Pacer::new();
        pacer.mark();
        let start = tokio::time::Instant::now();
        pacer.wait(0).await;
        assert!(tokio::time::Instant::now().duration_since(start) < tokio::time::Duration::from_millis(50));
    }
}
