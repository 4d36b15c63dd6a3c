//! Date bounds for the export window.
//!
//! Accepts "dd.mm.yyyy", "YYYY-MM-DD", RFC3339, "today", "yesterday" and
//! relative expressions like "3d ago", "2w ago" or "1mo ago".

use chrono::{DateTime, Duration, NaiveDate, TimeZone, Utc};
use regex::Regex;
use std::sync::LazyLock;

/// Matches: "3d ago", "2w ago", "1mo ago"
static RELATIVE_AGO_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+)\s*(mo|w|d)\s*ago$").expect("valid ago regex"));

/// Earliest message date when no lower bound is given.
pub fn epoch() -> DateTime<Utc> {
    DateTime::<Utc>::UNIX_EPOCH
}

/// Parses a date bound. Calendar dates resolve to midnight UTC.
pub fn parse_date_bound(input: &str, now: DateTime<Utc>) -> Result<DateTime<Utc>, String> {
    let raw = input.trim();
    if raw.is_empty() {
        return Err("empty date".to_string());
    }

    let lower = raw.to_lowercase();
    match lower.as_str() {
        "today" => return Ok(start_of_day(now)),
        "yesterday" => return Ok(start_of_day(now - Duration::days(1))),
        _ => {}
    }

    if let Some(caps) = RELATIVE_AGO_RE.captures(&lower) {
        let value: i64 = caps[1]
            .parse()
            .map_err(|_| format!("invalid number in {raw:?}"))?;
        if value < 1 {
            return Err(format!("invalid relative date {raw:?}"));
        }
        let days = match &caps[2] {
            "mo" => value * 30,
            "w" => value * 7,
            _ => value,
        };
        return Ok(start_of_day(now - Duration::days(days)));
    }

    for format in ["%d.%m.%Y", "%Y-%m-%d"] {
        if let Ok(date) = NaiveDate::parse_from_str(raw, format) {
            return midnight(date).ok_or_else(|| format!("invalid date {raw:?}"));
        }
    }

    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Ok(dt.with_timezone(&Utc));
    }

    Err(format!("invalid date {raw:?} (expected dd.mm.yyyy, YYYY-MM-DD or \"N(d|w|mo) ago\")"))
}

fn midnight(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|naive| Utc.from_utc_datetime(&naive))
}

fn start_of_day(dt: DateTime<Utc>) -> DateTime<Utc> {
    midnight(dt.date_naive()).unwrap_or(dt)
}
