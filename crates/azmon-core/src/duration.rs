//! Duration parsing for configuration values and query parameters.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

static ISO8601_DURATION_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^P(?:\d+Y)?(?:\d+M)?(?:\d+W)?(?:\d+D)?(?:T(?:\d+H)?(?:\d+M)?(?:\d+(?:\.\d+)?S)?)?$")
        .unwrap()
});

/// Parse a duration string like "500ms", "5s", "1m", "2h".
///
/// A plain number is read as seconds. Values that overflow are rejected.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled_secs(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled_secs(hours, 3600)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

fn scaled_secs(value: &str, unit: u64) -> Option<Duration> {
    value
        .parse::<u64>()
        .ok()
        .and_then(|v| v.checked_mul(unit))
        .map(Duration::from_secs)
}

/// Whether `s` is an ISO-8601 duration (`PT1H`) or a `start/end` interval.
pub fn is_iso8601_duration(s: &str) -> bool {
    let s = s.trim();
    if let Some((start, end)) = s.split_once('/') {
        return !start.is_empty() && !end.is_empty();
    }
    // "P" and "PT" match the pattern but carry no components.
    s.len() > 2 && !s.ends_with('T') && ISO8601_DURATION_RE.is_match(s)
}
