use std::sync::LazyLock;

use chrono::{DateTime, NaiveDate, NaiveDateTime, SecondsFormat, TimeZone, Utc};
use regex::Regex;
use serde_json::Value;

static ISO_DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^PT(?:(\d+)H)?(?:(\d+)M)?(?:(\d+(?:\.\d+)?)S)?$").unwrap()
});

static HOURS_MINUTES_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^(\d+):(\d{1,2})$").unwrap());

static DATE_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^\d{4}-\d{2}-\d{2}$").unwrap());

/// ISO-8601 duration (`PT8H30M`, any subset of H/M/S) to fractional hours.
/// Also accepts the `"8:30"` and `"8.5"` shapes some instances emit.
pub fn parse_duration(raw: &str) -> Option<f64> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Some(caps) = ISO_DURATION_RE.captures(raw) {
        let h = caps.get(1).and_then(|m| m.as_str().parse::<f64>().ok());
        let m = caps.get(2).and_then(|m| m.as_str().parse::<f64>().ok());
        let s = caps.get(3).and_then(|m| m.as_str().parse::<f64>().ok());
        if h.is_some() || m.is_some() || s.is_some() {
            return Some(h.unwrap_or(0.0) + m.unwrap_or(0.0) / 60.0 + s.unwrap_or(0.0) / 3600.0);
        }
    }
    if let Some(caps) = HOURS_MINUTES_RE.captures(raw) {
        let h: f64 = caps[1].parse().ok()?;
        let m: f64 = caps[2].parse().ok()?;
        return Some(h + m / 60.0);
    }
    raw.parse::<f64>().ok()
}

/// Lenient ISO-8601 timestamp parse: full RFC3339 (with `Z` or offset),
/// then naive `YYYY-MM-DDTHH:MM[:SS]` assumed UTC.
pub fn parse_datetime(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in ["%Y-%m-%dT%H:%M:%S", "%Y-%m-%dT%H:%M"] {
        if let Ok(naive) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Some(Utc.from_utc_datetime(&naive));
        }
    }
    None
}

/// Normalized RFC3339 UTC string, or None when unparseable.
pub fn normalize_datetime(raw: &str) -> Option<String> {
    parse_datetime(raw).map(|dt| dt.to_rfc3339_opts(SecondsFormat::Secs, true))
}

/// `YYYY-MM-DD` passthrough; otherwise the date part of a parsed timestamp.
pub fn parse_date(raw: &str) -> Option<String> {
    let raw = raw.trim();
    if DATE_RE.is_match(raw) {
        // Reject shapes like 2024-13-99 that match the regex.
        NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()?;
        return Some(raw.to_string());
    }
    parse_datetime(raw).map(|dt| dt.date_naive().to_string())
}

/// Resolve a HAL link object into `(id, title)`. The id is the trailing
/// path segment of `href`; non-numeric or missing segments give None.
pub fn resolve_link(link: Option<&Value>) -> (Option<i64>, Option<String>) {
    let Some(link) = link else {
        return (None, None);
    };
    let id = link
        .get("href")
        .and_then(Value::as_str)
        .and_then(|href| href.rsplit('/').next())
        .and_then(|seg| seg.parse::<i64>().ok());
    let title = link
        .get("title")
        .and_then(Value::as_str)
        .filter(|t| !t.is_empty())
        .map(str::to_string);
    (id, title)
}

// ── Tests ──

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn close(a: f64, b: f64) -> bool {
        (a - b).abs() < 1e-6
    }

    #[test]
    fn iso_durations() {
        assert!(close(parse_duration("PT8H").unwrap(), 8.0));
        assert!(close(parse_duration("PT8H30M").unwrap(), 8.5));
        assert!(close(parse_duration("PT30M").unwrap(), 0.5));
        assert!(close(parse_duration("PT1H30M30S").unwrap(), 1.508333));
        assert!(close(parse_duration("PT45S").unwrap(), 0.0125));
    }

    #[test]
    fn duration_fallbacks() {
        assert!(close(parse_duration("8:30").unwrap(), 8.5));
        assert!(close(parse_duration("8.5").unwrap(), 8.5));
        assert!(close(parse_duration("8").unwrap(), 8.0));
    }

    #[test]
    fn duration_garbage_is_none() {
        assert_eq!(parse_duration(""), None);
        assert_eq!(parse_duration("PT"), None);
        assert_eq!(parse_duration("eight hours"), None);
        assert_eq!(parse_duration("P1D"), None);
    }

    #[test]
    fn datetimes_with_and_without_zone() {
        let a = parse_datetime("2024-01-01T00:00:00Z").unwrap();
        let b = parse_datetime("2024-01-01T00:00:00+00:00").unwrap();
        let c = parse_datetime("2024-01-01T00:00").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, c);
        assert_eq!(normalize_datetime("2024-01-03T00:00").as_deref(), Some("2024-01-03T00:00:00Z"));
        assert_eq!(parse_datetime("not a date"), None);
    }

    #[test]
    fn dates() {
        assert_eq!(parse_date("2024-06-15").as_deref(), Some("2024-06-15"));
        assert_eq!(parse_date("2024-06-15T10:30:00Z").as_deref(), Some("2024-06-15"));
        assert_eq!(parse_date("2024-99-99"), None);
        assert_eq!(parse_date("June 15"), None);
    }

    #[test]
    fn links_resolve_trailing_segment() {
        let link = json!({"href": "/api/v3/users/42", "title": "Ada"});
        assert_eq!(resolve_link(Some(&link)), (Some(42), Some("Ada".to_string())));
    }

    #[test]
    fn links_tolerate_malformed_hrefs() {
        let no_id = json!({"href": "/api/v3/users/", "title": "Ada"});
        assert_eq!(resolve_link(Some(&no_id)), (None, Some("Ada".to_string())));

        let non_numeric = json!({"href": "/api/v3/statuses/open"});
        assert_eq!(resolve_link(Some(&non_numeric)), (None, None));

        let null_href = json!({"href": null, "title": ""});
        assert_eq!(resolve_link(Some(&null_href)), (None, None));

        assert_eq!(resolve_link(None), (None, None));
    }
}
