//! ---
//! tso_section: "01-core-functionality"
//! tso_subsection: "module"
//! tso_type: "source"
//! tso_scope: "code"
//! tso_description: "Clock helpers shared by lifecycle and reconciliation code."
//! tso_version: "v0.0.0-prealpha"
//! tso_owner: "tbd"
//! ---
use chrono::{DateTime, TimeZone, Utc};

/// Epoch values above this are treated as milliseconds rather than seconds.
const MILLIS_THRESHOLD: i64 = 100_000_000_000;

/// Parse a worker-supplied timestamp.
///
/// Accepts RFC 3339 strings as well as integral or fractional epoch values in
/// seconds or milliseconds.
pub fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return None;
    }
    if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
        return Some(parsed.with_timezone(&Utc));
    }
    if let Ok(value) = trimmed.parse::<i64>() {
        return from_epoch(value);
    }
    if let Ok(value) = trimmed.parse::<f64>() {
        if value.is_finite() {
            let millis = if value.abs() >= MILLIS_THRESHOLD as f64 {
                value
            } else {
                value * 1_000.0
            };
            return Utc.timestamp_millis_opt(millis.round() as i64).single();
        }
    }
    None
}

fn from_epoch(value: i64) -> Option<DateTime<Utc>> {
    if value.abs() >= MILLIS_THRESHOLD {
        Utc.timestamp_millis_opt(value).single()
    } else {
        Utc.timestamp_opt(value, 0).single()
    }
}

/// Seconds a run has been active, measured up to `ended` or `now`.
pub fn elapsed_seconds(
    started: Option<DateTime<Utc>>,
    ended: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<i64> {
    let started = started?;
    let until = ended.unwrap_or(now);
    Some((until - started).num_seconds().max(0))
}

/// Seconds left before a run's configured duration elapses; zero once it has.
pub fn remaining_seconds(
    started: Option<DateTime<Utc>>,
    duration_seconds: u64,
    now: DateTime<Utc>,
) -> Option<i64> {
    let elapsed = elapsed_seconds(started, None, now)?;
    let duration = i64::try_from(duration_seconds).unwrap_or(i64::MAX);
    Some(duration.saturating_sub(elapsed).max(0))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn parses_rfc3339_and_epoch_forms() {
        let rfc = parse_timestamp("2024-01-01T00:00:00Z").unwrap();
        assert_eq!(rfc.timestamp(), 1_704_067_200);
        assert_eq!(parse_timestamp("1704067200").unwrap(), rfc);
        assert_eq!(parse_timestamp("1704067200000").unwrap(), rfc);
        assert_eq!(parse_timestamp("1704067200.5").unwrap().timestamp_millis(), 1_704_067_200_500);
        assert!(parse_timestamp("yesterday").is_none());
        assert!(parse_timestamp("").is_none());
    }

    #[test]
    fn remaining_never_negative() {
        let now = Utc::now();
        let started = now - Duration::seconds(90);
        assert_eq!(elapsed_seconds(Some(started), None, now), Some(90));
        assert_eq!(remaining_seconds(Some(started), 60, now), Some(0));
        assert_eq!(remaining_seconds(Some(started), 120, now), Some(30));
        assert_eq!(remaining_seconds(None, 120, now), None);
    }
}
