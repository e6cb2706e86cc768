//! Parsing utilities for durations and absolute timestamps.

use crate::{Error, Result};

/// Parse a human-friendly duration string into milliseconds.
///
/// Supported suffixes: `s`, `m`, `h`, `d`, `w`. Units may be combined, largest
/// first: `"1h30m"`, `"2d12h"`.
pub fn parse_duration_ms(input: &str) -> Result<u64> {
    let input = input.trim();
    if input.is_empty() {
        return Err(Error::message("empty duration string"));
    }

    let mut total: u64 = 0;
    let mut rest = input;
    while !rest.is_empty() {
        let split = rest
            .find(|c: char| !c.is_ascii_digit())
            .ok_or_else(|| Error::message(format!("duration missing unit suffix: {input}")))?;
        let (num_str, tail) = rest.split_at(split);
        let unit_len = tail
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(tail.len());
        let (suffix, next) = tail.split_at(unit_len);

        let value: u64 = num_str
            .parse()
            .map_err(|_| Error::message(format!("invalid number in duration: {input}")))?;
        let unit_ms = match suffix {
            "s" => 1_000,
            "m" => 60_000,
            "h" => 3_600_000,
            "d" => 86_400_000,
            "w" => 604_800_000,
            _ => {
                return Err(Error::message(format!(
                    "unknown duration suffix: {suffix} (expected s/m/h/d/w)"
                )));
            },
        };
        total = value
            .checked_mul(unit_ms)
            .and_then(|ms| total.checked_add(ms))
            .ok_or_else(|| Error::message(format!("duration out of range: {input}")))?;
        rest = next;
    }

    if total == 0 {
        return Err(Error::message("duration must be > 0"));
    }
    Ok(total)
}

/// Parse an ISO 8601 timestamp string into epoch milliseconds.
///
/// Accepts formats like `"2026-01-12T18:00:00Z"` or with timezone offset.
pub fn parse_absolute_time_ms(input: &str) -> Result<u64> {
    use chrono::{DateTime, Utc};

    let dt: DateTime<Utc> = input.trim().parse::<DateTime<Utc>>()?;

    let ms = dt.timestamp_millis();
    if ms < 0 {
        return Err(Error::message("timestamp is before epoch"));
    }
    Ok(ms as u64)
}

/// Parse either an absolute ISO 8601 time or a duration meaning "that long
/// before `now_ms`".
pub fn parse_time_or_ago_ms(input: &str, now_ms: u64) -> Result<u64> {
    match parse_absolute_time_ms(input) {
        Ok(ms) => Ok(ms),
        Err(_) => Ok(now_ms.saturating_sub(parse_duration_ms(input)?)),
    }
}

/// Render epoch millis as an RFC 3339 UTC timestamp.
pub fn format_time_ms(ms: u64) -> String {
    chrono::DateTime::from_timestamp_millis(ms as i64)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Secs, true))
        .unwrap_or_else(|| ms.to_string())
}
