//! Human-friendly duration strings used in `taskgrid.toml`.

use std::time::Duration;

/// Parse `"500ms"`, `"5s"`, `"2m"`, `"1h"`, or a bare number of seconds.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if let Some(ms) = s.strip_suffix("ms") {
        ms.trim().parse::<u64>().ok().map(Duration::from_millis)
    } else if let Some(secs) = s.strip_suffix('s') {
        secs.trim().parse::<u64>().ok().map(Duration::from_secs)
    } else if let Some(mins) = s.strip_suffix('m') {
        scaled(mins, 60)
    } else if let Some(hours) = s.strip_suffix('h') {
        scaled(hours, 3600)
    } else {
        s.parse::<u64>().ok().map(Duration::from_secs)
    }
}

/// `None` when the value does not fit in a `u64` of seconds.
fn scaled(value: &str, unit_secs: u64) -> Option<Duration> {
    let value = value.trim().parse::<u64>().ok()?;
    value.checked_mul(unit_secs).map(Duration::from_secs)
}
