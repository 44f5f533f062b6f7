//! Datetime parsing and quiet-hours math shared by the engine and selector.

use chrono::{DateTime, Duration, NaiveTime, Utc};
use chrono_tz::Tz;

/// Parses an Arr-style date string into a UTC instant, best effort.
///
/// Handles a trailing `Z`, a bare `YYYY-MM-DD` (treated as midnight UTC),
/// and naive timestamps (assumed already UTC).
pub fn parse_arr_datetime_utc(value: Option<&str>) -> Option<DateTime<Utc>> {
    let s = value?.trim();
    if s.is_empty() {
        return None;
    }

    if s.len() == 10 && s.bytes().filter(|&b| b == b'-').count() == 2 {
        let naive_date = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d").ok()?;
        let naive_dt = naive_date.and_hms_opt(0, 0, 0)?;
        return Some(DateTime::from_naive_utc_and_offset(naive_dt, Utc));
    }

    let normalized = if let Some(stripped) = s.strip_suffix('Z') {
        format!("{stripped}+00:00")
    } else {
        s.to_string()
    };

    if let Ok(dt) = DateTime::parse_from_rfc3339(&normalized) {
        return Some(dt.with_timezone(&Utc));
    }

    // Naive timestamp with no offset: assume UTC.
    let naive = chrono::NaiveDateTime::parse_from_str(&normalized, "%Y-%m-%dT%H:%M:%S%.f").ok()?;
    Some(DateTime::from_naive_utc_and_offset(naive, Utc))
}

/// Parses an `HH:MM` string into `(hour, minute)`, rejecting anything out of range.
pub fn parse_hhmm(value: &str) -> Option<(u32, u32)> {
    let s = value.trim();
    if s.is_empty() {
        return None;
    }
    let mut parts = s.split(':');
    let hh: u32 = parts.next()?.parse().ok()?;
    let mm: u32 = parts.next()?.parse().ok()?;
    if parts.next().is_some() {
        return None;
    }
    if hh > 23 || mm > 59 {
        return None;
    }
    Some((hh, mm))
}

/// If `now_utc` falls inside the quiet-hours window, returns the UTC instant
/// the window ends. Otherwise returns `None`.
///
/// The window is evaluated in `timezone`: a fixed UTC offset string such as
/// `"-05:00"`, or an empty string meaning "the host's local timezone".
/// Quiet hours are inclusive of the start instant and exclusive of the end
/// instant, and may wrap midnight (e.g. `23:00` -> `06:00`).
pub fn quiet_hours_end_utc(
    now_utc: DateTime<Utc>,
    start_hhmm: &str,
    end_hhmm: &str,
    timezone: &str,
) -> Option<DateTime<Utc>> {
    let (sh, sm) = parse_hhmm(start_hhmm)?;
    let (eh, em) = parse_hhmm(end_hhmm)?;

    let local_now = local_instant(now_utc, timezone);
    let start_time = NaiveTime::from_hms_opt(sh, sm, 0)?;
    let end_time = NaiveTime::from_hms_opt(eh, em, 0)?;

    let date = local_now.date_naive();
    let start_today = date.and_time(start_time);
    let end_today = date.and_time(end_time);

    let (in_window, end_local) = if start_today < end_today {
        (start_today <= local_now && local_now < end_today, end_today)
    } else if local_now >= start_today {
        (true, end_today + Duration::days(1))
    } else if local_now < end_today {
        (true, end_today)
    } else {
        (false, end_today)
    };

    if !in_window {
        return None;
    }
    Some(to_utc_instant(end_local, timezone))
}

/// Converts a UTC instant into a naive local time for the given fixed-offset
/// (or host-local, if `timezone` is empty) timezone.
fn local_instant(now_utc: DateTime<Utc>, timezone: &str) -> chrono::NaiveDateTime {
    if timezone.trim().is_empty() {
        let local: DateTime<chrono::Local> = DateTime::from(now_utc);
        return local.naive_local();
    }
    if let Some(offset) = parse_fixed_offset(timezone) {
        return (now_utc + offset).naive_utc();
    }
    if let Ok(tz) = timezone.parse::<Tz>() {
        return now_utc.with_timezone(&tz).naive_local();
    }
    now_utc.naive_utc()
}

/// Reverses [`local_instant`]: given a naive local time, produce the matching
/// UTC instant for the same fixed-offset/host-local/named timezone.
fn to_utc_instant(naive_local: chrono::NaiveDateTime, timezone: &str) -> DateTime<Utc> {
    if timezone.trim().is_empty() {
        if let chrono::LocalResult::Single(local) =
            chrono::Local.from_local_datetime(&naive_local)
        {
            return local.with_timezone(&Utc);
        }
        return DateTime::from_naive_utc_and_offset(naive_local, Utc);
    }
    if let Some(offset) = parse_fixed_offset(timezone) {
        return DateTime::from_naive_utc_and_offset(naive_local - offset, Utc);
    }
    if let Ok(tz) = timezone.parse::<Tz>() {
        if let chrono::LocalResult::Single(dt) = tz.from_local_datetime(&naive_local) {
            return dt.with_timezone(&Utc);
        }
    }
    DateTime::from_naive_utc_and_offset(naive_local, Utc)
}

use chrono::TimeZone;

/// Parses a fixed UTC offset string like `"-05:00"` or `"+02:00"`.
fn parse_fixed_offset(value: &str) -> Option<Duration> {
    let s = value.trim();
    if s.len() != 6 {
        return None;
    }
    let sign = match s.as_bytes()[0] {
        b'+' => 1,
        b'-' => -1,
        _ => return None,
    };
    let hh: i64 = s[1..3].parse().ok()?;
    let mm: i64 = s[4..6].parse().ok()?;
    if hh > 23 || mm > 59 {
        return None;
    }
    Some(Duration::minutes(sign * (hh * 60 + mm)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_z_suffixed_datetime() {
        let dt = parse_arr_datetime_utc(Some("2026-02-24T01:23:45Z")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-02-24T01:23:45+00:00");
    }

    #[test]
    fn parses_date_only_as_midnight_utc() {
        let dt = parse_arr_datetime_utc(Some("2026-02-24")).unwrap();
        assert_eq!(dt.to_rfc3339(), "2026-02-24T00:00:00+00:00");
    }

    #[test]
    fn rejects_empty_and_garbage() {
        assert!(parse_arr_datetime_utc(Some("")).is_none());
        assert!(parse_arr_datetime_utc(Some("not-a-date")).is_none());
        assert!(parse_arr_datetime_utc(None).is_none());
    }

    #[test]
    fn parses_valid_hhmm() {
        assert_eq!(parse_hhmm("23:05"), Some((23, 5)));
        assert_eq!(parse_hhmm(" 00:00 "), Some((0, 0)));
    }

    #[test]
    fn rejects_invalid_hhmm() {
        assert_eq!(parse_hhmm("24:00"), None);
        assert_eq!(parse_hhmm("10:60"), None);
        assert_eq!(parse_hhmm("garbage"), None);
        assert_eq!(parse_hhmm(""), None);
    }

    #[test]
    fn quiet_hours_non_wrapping_window_inside() {
        let now = DateTime::parse_from_rfc3339("2026-02-24T10:30:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let end = quiet_hours_end_utc(now, "09:00", "11:00", "+00:00").unwrap();
        assert_eq!(end.to_rfc3339(), "2026-02-24T11:00:00+00:00");
    }

    #[test]
    fn quiet_hours_non_wrapping_window_outside() {
        let now = DateTime::parse_from_rfc3339("2026-02-24T12:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert!(quiet_hours_end_utc(now, "09:00", "11:00", "+00:00").is_none());
    }

    #[test]
    fn quiet_hours_wrapping_window_after_start() {
        let now = DateTime::parse_from_rfc3339("2026-02-24T23:30:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let end = quiet_hours_end_utc(now, "23:00", "06:00", "+00:00").unwrap();
        assert_eq!(end.to_rfc3339(), "2026-02-25T06:00:00+00:00");
    }

    #[test]
    fn quiet_hours_wrapping_window_before_end() {
        let now = DateTime::parse_from_rfc3339("2026-02-24T02:00:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let end = quiet_hours_end_utc(now, "23:00", "06:00", "+00:00").unwrap();
        assert_eq!(end.to_rfc3339(), "2026-02-24T06:00:00+00:00");
    }

    #[test]
    fn quiet_hours_fixed_offset_shifts_window() {
        // 22:30 UTC is 17:30 at -05:00, which is outside 23:00-06:00 local.
        let now = DateTime::parse_from_rfc3339("2026-02-24T22:30:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        assert!(quiet_hours_end_utc(now, "23:00", "06:00", "-05:00").is_none());

        // 04:30 UTC is 23:30 at -05:00 (previous day), inside the window.
        let now2 = DateTime::parse_from_rfc3339("2026-02-24T04:30:00+00:00")
            .unwrap()
            .with_timezone(&Utc);
        let end = quiet_hours_end_utc(now2, "23:00", "06:00", "-05:00").unwrap();
        assert_eq!(end.to_rfc3339(), "2026-02-24T11:00:00+00:00");
    }
}
