//! The CLI time-expression grammar (§6): epoch seconds, several fixed textual formats, and a
//! relative `-<d>d:<h>h:<m>m` offset from now. Grounded in the teacher's CLI timestamp parsing
//! (`rpglotd-dump`'s `--since`/`--until` flags), generalized to the fuller format list this
//! spec's `goquery` `-f`/`-l` flags require.

use crate::error::{FlowError, FlowResult};
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

const SECS_PER_DAY: i64 = 86_400;

pub fn now_epoch() -> i64 {
    Utc::now().timestamp()
}

/// Default `first`: 24h back when the query groups by time (so a time-bucketed query doesn't
/// default to scanning a month), else 30 days back (§6).
pub fn default_first(now: DateTime<Utc>, group_by_time: bool) -> i64 {
    let back = if group_by_time { chrono::Duration::hours(24) } else { chrono::Duration::days(30) };
    (now - back).timestamp()
}

pub fn default_last(now: DateTime<Utc>) -> i64 {
    now.timestamp()
}

/// Parses one of: a bare epoch integer; a relative `-<d>d:<h>h:<m>m` offset from `now`; RFC 3339;
/// RFC 2822; ANSIC (`Mon Jan 2 15:04:05 2006`); or a `DD.MM.YYYY`/`YYYY-MM-DD` date with an
/// optional `HH:MM[:SS]` suffix (§6).
pub fn parse_time(input: &str, now: DateTime<Utc>) -> FlowResult<i64> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(FlowError::invalid_argument("time value is empty"));
    }

    if let Some(ts) = parse_relative(trimmed, now) {
        return Ok(ts);
    }
    if let Ok(epoch) = trimmed.parse::<i64>() {
        return Ok(epoch);
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(dt.timestamp());
    }
    if let Ok(dt) = DateTime::parse_from_rfc2822(trimmed) {
        return Ok(dt.timestamp());
    }
    for fmt in ["%a %b %e %T %Y", "%a %b %d %T %Y"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(trimmed, fmt) {
            return Ok(naive.and_utc().timestamp());
        }
    }
    if let Some(ts) = parse_date_and_time(trimmed) {
        return Ok(ts);
    }

    Err(FlowError::invalid_argument(format!("unrecognized time format '{input}'")))
}

fn parse_relative(s: &str, now: DateTime<Utc>) -> Option<i64> {
    let body = s.strip_prefix('-')?;
    let mut days = 0i64;
    let mut hours = 0i64;
    let mut minutes = 0i64;
    let mut saw_any = false;

    for part in body.split(':') {
        if let Some(v) = part.strip_suffix('d') {
            days = v.parse().ok()?;
        } else if let Some(v) = part.strip_suffix('h') {
            hours = v.parse().ok()?;
        } else if let Some(v) = part.strip_suffix('m') {
            minutes = v.parse().ok()?;
        } else {
            return None;
        }
        saw_any = true;
    }
    if !saw_any {
        return None;
    }
    let offset = chrono::Duration::days(days) + chrono::Duration::hours(hours) + chrono::Duration::minutes(minutes);
    Some((now - offset).timestamp())
}

fn parse_date_and_time(s: &str) -> Option<i64> {
    let (date_part, time_part) = match s.split_once(|c: char| c == ' ' || c == 'T') {
        Some((d, t)) => (d, Some(t)),
        None => (s, None),
    };

    let date = parse_date_only(date_part)?;
    let (hour, min, sec) = match time_part {
        Some(t) => parse_clock(t)?,
        None => (0, 0, 0),
    };
    date.and_hms_opt(hour, min, sec).map(|naive| naive.and_utc().timestamp())
}

fn parse_date_only(s: &str) -> Option<NaiveDate> {
    if let Ok(d) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Some(d);
    }
    if let Ok(d) = NaiveDate::parse_from_str(s, "%d.%m.%Y") {
        return Some(d);
    }
    None
}

fn parse_clock(s: &str) -> Option<(u32, u32, u32)> {
    let s = s.trim_end_matches(|c: char| c == 'Z');
    let parts: Vec<&str> = s.split(':').collect();
    match parts.as_slice() {
        [h, m] => Some((h.parse().ok()?, m.parse().ok()?, 0)),
        [h, m, sec] => Some((h.parse().ok()?, m.parse().ok()?, sec.parse().ok()?)),
        _ => None,
    }
}

pub fn day_epoch_containing(ts: i64) -> i64 {
    ts - ts.rem_euclid(SECS_PER_DAY)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 7, 28, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_bare_epoch() {
        assert_eq!(parse_time("1700000000", fixed_now()).unwrap(), 1_700_000_000);
    }

    #[test]
    fn parses_relative_offset() {
        let now = fixed_now();
        let ts = parse_time("-1d:2h:30m", now).unwrap();
        let expected = (now - chrono::Duration::days(1) - chrono::Duration::hours(2) - chrono::Duration::minutes(30)).timestamp();
        assert_eq!(ts, expected);
    }

    #[test]
    fn parses_iso_date() {
        let ts = parse_time("2026-01-15", fixed_now()).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap().timestamp());
    }

    #[test]
    fn parses_iso_date_with_time() {
        let ts = parse_time("2026-01-15 08:30:00", fixed_now()).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 1, 15, 8, 30, 0).unwrap().timestamp());
    }

    #[test]
    fn parses_european_date() {
        let ts = parse_time("15.01.2026", fixed_now()).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 1, 15, 0, 0, 0).unwrap().timestamp());
    }

    #[test]
    fn parses_rfc3339() {
        let ts = parse_time("2026-01-15T08:30:00Z", fixed_now()).unwrap();
        assert_eq!(ts, Utc.with_ymd_and_hms(2026, 1, 15, 8, 30, 0).unwrap().timestamp());
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_time("not-a-time", fixed_now()).is_err());
    }

    #[test]
    fn default_first_shrinks_window_for_time_grouped_queries() {
        let now = fixed_now();
        assert_eq!(default_first(now, true), (now - chrono::Duration::hours(24)).timestamp());
        assert_eq!(default_first(now, false), (now - chrono::Duration::days(30)).timestamp());
    }
}
