//! Cron expression parsing and deterministic next-run computation
//! (spec.md §4.3 "Due-time computation", §6 "Cron expression", §8
//! invariant 5 "Schedule determinism").

use crate::error::{CoreError, CoreResult};
use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use std::str::FromStr;
use std::time::Duration;

/// A parsed schedule: either a standard cron expression or the `@every
/// <duration>` alias, which the `cron` crate doesn't model natively.
#[derive(Debug, Clone)]
pub enum ScheduleExpr {
    Cron(cron::Schedule),
    Every(Duration),
}

/// Parse a spec.md §6 schedule string: standard 5-field cron, or one of
/// `@daily`, `@hourly`, `@every <duration>`.
pub fn parse_schedule(expr: &str) -> CoreResult<ScheduleExpr> {
    let trimmed = expr.trim();
    if let Some(rest) = trimmed.strip_prefix("@every ") {
        let duration = humantime_duration(rest)?;
        return Ok(ScheduleExpr::Every(duration));
    }
    let normalized = match trimmed {
        "@daily" | "@midnight" => "0 0 0 * * *".to_string(),
        "@hourly" => "0 0 * * * *".to_string(),
        "@weekly" => "0 0 0 * * 0".to_string(),
        "@monthly" => "0 0 0 1 * *".to_string(),
        "@yearly" | "@annually" => "0 0 0 1 1 *".to_string(),
        five_field => prepend_seconds_field(five_field)?,
    };
    let schedule = cron::Schedule::from_str(&normalized).map_err(|e| CoreError::ValidationFailure {
        message: format!("invalid cron expression '{expr}': {e}"),
    })?;
    Ok(ScheduleExpr::Cron(schedule))
}

/// The `cron` crate expects a leading seconds field; spec.md §6 mandates
/// the standard 5-field (minute hour day-of-month month day-of-week)
/// syntax, so every expression gets `0` prepended for "at second zero".
fn prepend_seconds_field(expr: &str) -> CoreResult<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CoreError::ValidationFailure {
            message: format!(
                "cron expression '{expr}' must have 5 fields (minute hour day month weekday), got {}",
                fields.len()
            ),
        });
    }
    Ok(format!("0 {expr}"))
}

/// Minimal duration parser for `@every <duration>`: accepts `<n>s`,
/// `<n>m`, `<n>h` units, optionally combined (`1h30m`).
fn humantime_duration(input: &str) -> CoreResult<Duration> {
    let mut total = Duration::ZERO;
    let mut digits = String::new();
    for ch in input.trim().chars() {
        if ch.is_ascii_digit() {
            digits.push(ch);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| CoreError::ValidationFailure {
            message: format!("invalid duration '{input}'"),
        })?;
        digits.clear();
        let unit = match ch {
            's' => Duration::from_secs(value),
            'm' => Duration::from_secs(value * 60),
            'h' => Duration::from_secs(value * 3600),
            'd' => Duration::from_secs(value * 86_400),
            other => {
                return Err(CoreError::ValidationFailure {
                    message: format!("unsupported duration unit '{other}' in '{input}'"),
                })
            }
        };
        total += unit;
    }
    if !digits.is_empty() || total.is_zero() {
        return Err(CoreError::ValidationFailure {
            message: format!("invalid duration '{input}'"),
        });
    }
    Ok(total)
}

/// Compute the smallest future instant strictly greater than `after`,
/// evaluated in `tz`. Deterministic for a given `(expr, tz, after)`
/// triple (spec.md §8 invariant 5).
pub fn next_run_after(expr: &ScheduleExpr, tz: Tz, after: DateTime<Utc>) -> CoreResult<DateTime<Utc>> {
    match expr {
        ScheduleExpr::Every(duration) => {
            let delta = chrono::Duration::from_std(*duration).map_err(|e| CoreError::Internal {
                message: e.to_string(),
            })?;
            Ok(after + delta)
        }
        ScheduleExpr::Cron(schedule) => {
            let after_tz = after.with_timezone(&tz);
            schedule
                .after(&after_tz)
                .next()
                .map(|dt| dt.with_timezone(&Utc))
                .ok_or_else(|| CoreError::ValidationFailure {
                    message: "cron expression has no future occurrences".to_string(),
                })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn s1_every_five_minutes_from_midnight_utc() {
        let expr = parse_schedule("*/5 * * * *").unwrap();
        let reference = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let next = next_run_after(&expr, chrono_tz::UTC, reference).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 0, 5, 0).unwrap());
    }

    #[test]
    fn same_inputs_produce_same_next_run() {
        let expr = parse_schedule("*/5 * * * *").unwrap();
        let reference = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let a = next_run_after(&expr, chrono_tz::UTC, reference).unwrap();
        let b = next_run_after(&expr, chrono_tz::UTC, reference).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn daily_alias_fires_at_midnight() {
        let expr = parse_schedule("@daily").unwrap();
        let reference = Utc.with_ymd_and_hms(2025, 1, 1, 12, 0, 0).unwrap();
        let next = next_run_after(&expr, chrono_tz::UTC, reference).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 2, 0, 0, 0).unwrap());
    }

    #[test]
    fn every_alias_adds_fixed_duration() {
        let expr = parse_schedule("@every 1h30m").unwrap();
        let reference = Utc.with_ymd_and_hms(2025, 1, 1, 0, 0, 0).unwrap();
        let next = next_run_after(&expr, chrono_tz::UTC, reference).unwrap();
        assert_eq!(next, Utc.with_ymd_and_hms(2025, 1, 1, 1, 30, 0).unwrap());
    }

    #[test]
    fn rejects_malformed_expression() {
        assert!(parse_schedule("not a cron expr").is_err());
    }

    #[test]
    fn rejects_wrong_field_count() {
        assert!(parse_schedule("* * *").is_err());
    }
}
