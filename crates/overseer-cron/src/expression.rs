//! 5-field cron expression handling.
//!
//! User-facing expressions are POSIX style — minute, hour, day-of-month,
//! month, day-of-week — with `*`, `,`, `-`, and `/` operators.  The
//! `cron` crate expects a seconds field and numbers weekdays 1 (Sunday)
//! through 7 (Saturday), so normalization prepends `0` for seconds and
//! rewrites numeric day-of-week tokens from the POSIX convention
//! (0 or 7 = Sunday, 1 = Monday) into the crate's ordinals.
//! Occurrences are computed in the schedule's IANA timezone and
//! returned as UTC instants.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use chrono_tz::Tz;

use crate::error::{CronError, CronResult};

/// Parse and validate a 5-field POSIX cron expression.
pub fn parse_expression(expr: &str) -> CronResult<cron::Schedule> {
    let normalized = normalize(expr)?;
    cron::Schedule::from_str(&normalized).map_err(|e| CronError::InvalidExpression {
        expression: expr.to_string(),
        reason: e.to_string(),
    })
}

/// Resolve an IANA timezone name.
pub fn parse_timezone(name: &str) -> CronResult<Tz> {
    name.parse::<Tz>().map_err(|_| CronError::InvalidTimezone {
        timezone: name.to_string(),
    })
}

/// The next occurrence strictly after `after`, evaluated in `tz`.
pub fn next_run_after(
    schedule: &cron::Schedule,
    tz: Tz,
    after: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    schedule
        .after(&after.with_timezone(&tz))
        .next()
        .map(|local| local.with_timezone(&Utc))
}

/// The next occurrence for a raw expression/timezone pair, as epoch
/// milliseconds.  Convenience for schedule creation and re-enabling.
pub fn next_run_millis(expr: &str, timezone: &str, after: DateTime<Utc>) -> CronResult<Option<i64>> {
    let schedule = parse_expression(expr)?;
    let tz = parse_timezone(timezone)?;
    Ok(next_run_after(&schedule, tz, after).map(|dt| dt.timestamp_millis()))
}

/// The next `k` occurrences after `now`, strictly increasing, all in the
/// future.  Used by the CLI to preview a schedule and by tests to pin
/// the expression semantics.
pub fn get_next_run_times(
    expr: &str,
    timezone: &str,
    k: usize,
    now: DateTime<Utc>,
) -> CronResult<Vec<DateTime<Utc>>> {
    let schedule = parse_expression(expr)?;
    let tz = parse_timezone(timezone)?;
    Ok(schedule
        .after(&now.with_timezone(&tz))
        .take(k)
        .map(|local| local.with_timezone(&Utc))
        .collect())
}

// ---------------------------------------------------------------------------
// Normalization
// ---------------------------------------------------------------------------

/// Convert a 5-field POSIX expression into the 6-field form the `cron`
/// crate parses, translating the day-of-week field.
fn normalize(expr: &str) -> CronResult<String> {
    let fields: Vec<&str> = expr.split_whitespace().collect();
    if fields.len() != 5 {
        return Err(CronError::InvalidExpression {
            expression: expr.to_string(),
            reason: format!("expected 5 fields, got {}", fields.len()),
        });
    }

    let dow = translate_dow_field(fields[4]).map_err(|reason| CronError::InvalidExpression {
        expression: expr.to_string(),
        reason,
    })?;

    Ok(format!(
        "0 {} {} {} {} {}",
        fields[0], fields[1], fields[2], fields[3], dow
    ))
}

/// Rewrite numeric day-of-week tokens from POSIX (0/7 = Sunday) to the
/// crate's ordinals (1 = Sunday).
///
/// `*` and named days (`MON`, `fri-sun`) pass through untouched; numeric
/// parts — including ranges and steps — are expanded into an explicit
/// sorted day list so wrap-arounds like `5-7` stay correct.
fn translate_dow_field(field: &str) -> Result<String, String> {
    if field == "*" || field.chars().any(|c| c.is_ascii_alphabetic()) {
        return Ok(field.to_string());
    }

    let mut days: Vec<u8> = Vec::new();
    for part in field.split(',') {
        let (body, step) = match part.split_once('/') {
            Some((body, step)) => {
                let step: u8 = step
                    .parse()
                    .map_err(|_| format!("bad day-of-week step `{step}`"))?;
                if step == 0 {
                    return Err("day-of-week step cannot be 0".to_string());
                }
                (body, step)
            }
            None => (part, 1),
        };

        let (start, end) = if body == "*" {
            (0u8, 6u8)
        } else if let Some((a, b)) = body.split_once('-') {
            (parse_posix_day(a)?, parse_posix_day(b)?)
        } else {
            let day = parse_posix_day(body)?;
            (day, day)
        };

        let mut day = start;
        let mut offset: u8 = 0;
        loop {
            if offset % step == 0 {
                days.push(day);
            }
            if day == end {
                break;
            }
            day = (day + 1) % 7;
            offset += 1;
            if day == start {
                break;
            }
        }
    }

    days.sort_unstable();
    days.dedup();
    let translated: Vec<String> = days.iter().map(|d| (d + 1).to_string()).collect();
    Ok(translated.join(","))
}

/// Parse one POSIX day number; 7 folds to Sunday (0).
fn parse_posix_day(token: &str) -> Result<u8, String> {
    let day: u8 = token
        .parse()
        .map_err(|_| format!("bad day-of-week `{token}`"))?;
    if day > 7 {
        return Err(format!("day-of-week {day} outside 0-7"));
    }
    Ok(day % 7)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Datelike, Timelike};

    fn at(iso: &str) -> DateTime<Utc> {
        iso.parse().unwrap()
    }

    #[test]
    fn five_field_expression_parses() {
        assert!(parse_expression("*/5 * * * *").is_ok());
        assert!(parse_expression("30 9 * * 1-5").is_ok());
        assert!(parse_expression("0 0 1,15 * *").is_ok());
        assert!(parse_expression("0 9 * * 0").is_ok());
    }

    #[test]
    fn wrong_field_count_is_rejected() {
        assert!(parse_expression("* * * *").is_err());
        assert!(parse_expression("0 0 * * * *").is_err());
        assert!(parse_expression("").is_err());
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(parse_expression("not a cron expr x").is_err());
        assert!(parse_expression("61 * * * *").is_err());
        assert!(parse_expression("* * * * 9").is_err());
    }

    #[test]
    fn unknown_timezone_is_rejected() {
        assert!(parse_timezone("Mars/Olympus_Mons").is_err());
        assert!(parse_timezone("America/New_York").is_ok());
        assert!(parse_timezone("UTC").is_ok());
    }

    #[test]
    fn dow_translation_uses_posix_numbering() {
        // Monday-Friday in POSIX.
        assert_eq!(translate_dow_field("1-5").unwrap(), "2,3,4,5,6");
        // Sunday, both spellings.
        assert_eq!(translate_dow_field("0").unwrap(), "1");
        assert_eq!(translate_dow_field("7").unwrap(), "1");
        // Friday-Sunday wraps.
        assert_eq!(translate_dow_field("5-7").unwrap(), "1,6,7");
        // Every second day from Sunday.
        assert_eq!(translate_dow_field("*/2").unwrap(), "1,3,5,7");
        // Names and stars are untouched.
        assert_eq!(translate_dow_field("*").unwrap(), "*");
        assert_eq!(translate_dow_field("MON-FRI").unwrap(), "MON-FRI");
    }

    #[test]
    fn next_run_is_strictly_in_the_future() {
        let now = at("2026-03-01T10:30:30Z");
        let next = next_run_millis("*/15 * * * *", "UTC", now).unwrap().unwrap();
        assert_eq!(next, at("2026-03-01T10:45:00Z").timestamp_millis());
    }

    #[test]
    fn next_run_times_are_increasing_and_match_the_expression() {
        let now = at("2026-03-01T00:00:30Z");
        let times = get_next_run_times("*/10 * * * *", "UTC", 5, now).unwrap();
        assert_eq!(times.len(), 5);
        for window in times.windows(2) {
            assert!(window[1] > window[0]);
        }
        for time in &times {
            assert!(*time > now);
            assert_eq!(time.minute() % 10, 0);
            assert_eq!(time.second(), 0);
        }
    }

    #[test]
    fn timezone_shifts_the_utc_instant() {
        // 09:00 in New York during EST is 14:00 UTC.
        let now = at("2026-01-05T00:00:00Z");
        let times = get_next_run_times("0 9 * * *", "America/New_York", 1, now).unwrap();
        assert_eq!(times[0], at("2026-01-05T14:00:00Z"));
    }

    #[test]
    fn weekday_range_means_monday_to_friday() {
        // 2026-03-06 is a Friday; after its 09:00 firing the next 1-5
        // occurrences are Monday and Tuesday.
        let now = at("2026-03-06T10:00:00Z");
        let times = get_next_run_times("0 9 * * 1-5", "UTC", 2, now).unwrap();
        assert_eq!(times[0], at("2026-03-09T09:00:00Z"));
        assert_eq!(times[0].weekday().number_from_monday(), 1);
        assert_eq!(times[1], at("2026-03-10T09:00:00Z"));
    }

    #[test]
    fn sunday_as_zero_fires_on_sunday() {
        // 2026-03-08 is a Sunday.
        let now = at("2026-03-06T00:00:00Z");
        let times = get_next_run_times("0 6 * * 0", "UTC", 1, now).unwrap();
        assert_eq!(times[0], at("2026-03-08T06:00:00Z"));
        assert_eq!(times[0].weekday().number_from_monday(), 7);
    }

    #[test]
    fn step_and_range_operators() {
        let now = at("2026-06-01T00:00:00Z");
        let times = get_next_run_times("0 8-10/2 * * *", "UTC", 3, now).unwrap();
        let hours: Vec<u32> = times.iter().map(|t| t.hour()).collect();
        assert_eq!(hours, vec![8, 10, 8]);
    }
}
