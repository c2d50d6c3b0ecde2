//! Schedule parsing and activation-time calculation.
//!
//! Accepts three cron grammars, picked by field count:
//! - 5 fields: `minute hour day month weekday` (seconds fixed at 0)
//! - 6 fields: `second minute hour day month weekday`
//! - 7 fields: as 6, with a trailing year field that is ignored
//!
//! plus the shortcuts `@yearly`, `@monthly`, `@weekly`, `@daily`,
//! `@hourly` and interval expressions such as `@every 1h30m`.

use chrono::{DateTime, Utc};
use chrono_tz::Tz;
use cron::Schedule as CronSchedule;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;

/// Errors that can occur when parsing a schedule.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    /// Invalid cron expression.
    #[error("invalid cron expression: {0}")]
    InvalidCron(String),

    /// Invalid interval expression.
    #[error("invalid interval expression: {0}")]
    InvalidInterval(String),

    /// Invalid timezone.
    #[error("invalid timezone: {0}")]
    InvalidTimezone(String),
}

/// A parsed, immutable recurrence rule.
#[derive(Clone)]
pub struct Schedule {
    expression: String,
    timezone: Tz,
    kind: ScheduleKind,
}

#[derive(Clone)]
enum ScheduleKind {
    Cron(Box<CronSchedule>),
    Interval(chrono::Duration),
}

impl Schedule {
    /// Parse an expression evaluated in UTC.
    pub fn new(expression: impl Into<String>) -> Result<Self, ScheduleError> {
        Self::with_timezone(expression, "UTC")
    }

    /// Parse an expression evaluated in the given IANA timezone.
    pub fn with_timezone(
        expression: impl Into<String>,
        timezone: &str,
    ) -> Result<Self, ScheduleError> {
        let expression = expression.into();
        let timezone: Tz = timezone
            .parse()
            .map_err(|_| ScheduleError::InvalidTimezone(timezone.to_string()))?;

        let trimmed = expression.trim();
        let kind = if trimmed.starts_with('@') {
            parse_descriptor(trimmed)?
        } else {
            parse_fields(trimmed)?
        };

        Ok(Self {
            expression,
            timezone,
            kind,
        })
    }

    /// First activation strictly after `after`.
    ///
    /// `None` means the schedule can never fire again.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match &self.kind {
            ScheduleKind::Cron(schedule) => schedule
                .after(&after.with_timezone(&self.timezone))
                .next()
                .map(|dt| dt.with_timezone(&Utc)),
            ScheduleKind::Interval(step) => after.checked_add_signed(*step),
        }
    }

    /// Up to `n` consecutive activations after `after`.
    pub fn next_n_after(&self, after: DateTime<Utc>, n: usize) -> Vec<DateTime<Utc>> {
        let mut out = Vec::with_capacity(n);
        let mut cursor = after;
        while out.len() < n {
            match self.next_after(cursor) {
                Some(next) => {
                    out.push(next);
                    cursor = next;
                }
                None => break,
            }
        }
        out
    }

    /// Activations in the half-open window `(start, end]`, at most `limit`.
    pub fn between(
        &self,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        limit: usize,
    ) -> Vec<DateTime<Utc>> {
        let mut out = Vec::new();
        let mut cursor = start;
        while out.len() < limit {
            match self.next_after(cursor) {
                Some(next) if next <= end => {
                    out.push(next);
                    cursor = next;
                }
                _ => break,
            }
        }
        out
    }

    /// The expression this schedule was parsed from.
    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// The timezone activations are computed in.
    pub fn timezone(&self) -> Tz {
        self.timezone
    }
}

impl fmt::Debug for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Schedule")
            .field("expression", &self.expression)
            .field("timezone", &self.timezone.name())
            .finish()
    }
}

impl FromStr for Schedule {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

fn parse_descriptor(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    let lowered = expression.to_lowercase();
    match lowered.as_str() {
        "@yearly" | "@annually" => parse_fields("0 0 0 1 1 *"),
        "@monthly" => parse_fields("0 0 0 1 * *"),
        "@weekly" => parse_fields("0 0 0 * * SUN"),
        "@daily" | "@midnight" => parse_fields("0 0 0 * * *"),
        "@hourly" => parse_fields("0 0 * * * *"),
        s if s.starts_with("@every ") => {
            let step = parse_duration(s["@every ".len()..].trim())
                .map_err(|_| ScheduleError::InvalidInterval(expression.to_string()))?;
            let step = chrono::Duration::from_std(step)
                .map_err(|_| ScheduleError::InvalidInterval(expression.to_string()))?;
            Ok(ScheduleKind::Interval(step))
        }
        _ => Err(ScheduleError::InvalidCron(format!(
            "unknown descriptor: {}",
            expression
        ))),
    }
}

fn parse_fields(expression: &str) -> Result<ScheduleKind, ScheduleError> {
    let fields: Vec<&str> = expression.split_whitespace().collect();

    let mut fields: Vec<String> = match fields.len() {
        7 => fields[..6].iter().map(|f| f.to_string()).collect(),
        6 => fields.iter().map(|f| f.to_string()).collect(),
        5 => std::iter::once("0")
            .chain(fields.iter().copied())
            .map(String::from)
            .collect(),
        n => {
            return Err(ScheduleError::InvalidCron(format!(
                "expected 5, 6 or 7 fields, got {}: {:?}",
                n, expression
            )));
        }
    };
    fields[5] = normalize_weekdays(&fields[5], expression)?;
    let normalized = fields.join(" ");

    let schedule = CronSchedule::from_str(&normalized)
        .map_err(|e| ScheduleError::InvalidCron(format!("{:?}: {}", expression, e)))?;

    Ok(ScheduleKind::Cron(Box::new(schedule)))
}

const WEEKDAY_NAMES: [&str; 7] = ["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Rewrite a day-of-week field numbered the usual cron way (0-6, with
/// Sunday also accepted as 7) into day names.
///
/// The `cron` grammar numbers days 1-7 starting at Sunday, so numeric
/// fields cannot be passed through as written. Fields without digits are
/// left alone.
fn normalize_weekdays(field: &str, expression: &str) -> Result<String, ScheduleError> {
    if !field.chars().any(|c| c.is_ascii_digit()) {
        return Ok(field.to_string());
    }
    let invalid = || {
        ScheduleError::InvalidCron(format!(
            "{:?}: invalid day-of-week field {:?}",
            expression, field
        ))
    };

    let mut days = [false; 7];
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: usize = step.parse().map_err(|_| invalid())?;
                if step == 0 {
                    return Err(invalid());
                }
                (range, Some(step))
            }
            None => (part, None),
        };
        let (start, end) = match range {
            "*" | "?" => (0, 6),
            _ => match range.split_once('-') {
                Some((a, b)) => (
                    weekday_number(a).ok_or_else(invalid)?,
                    weekday_number(b).ok_or_else(invalid)?,
                ),
                None => {
                    let day = weekday_number(range).ok_or_else(invalid)?;
                    // `n/step` runs from n to the end of the week.
                    (day, if step.is_some() { day.max(6) } else { day })
                }
            },
        };
        if start > end {
            return Err(invalid());
        }
        for day in (start..=end).step_by(step.unwrap_or(1)) {
            days[day % 7] = true;
        }
    }

    if days.iter().all(|d| *d) {
        return Ok("*".to_string());
    }
    Ok(WEEKDAY_NAMES
        .iter()
        .zip(days)
        .filter(|(_, on)| *on)
        .map(|(name, _)| *name)
        .collect::<Vec<_>>()
        .join(","))
}

/// Day number 0-7 of a numeric or three-letter day token.
fn weekday_number(token: &str) -> Option<usize> {
    if let Ok(n) = token.parse::<usize>() {
        return (n <= 7).then_some(n);
    }
    WEEKDAY_NAMES
        .iter()
        .position(|name| name.eq_ignore_ascii_case(token))
}

/// Parse a compact duration such as `30s`, `5m`, `1h30m` or `7d`.
///
/// Also used by the configuration loader for interval settings.
pub fn parse_duration(s: &str) -> Result<Duration, ScheduleError> {
    let invalid = || ScheduleError::InvalidInterval(s.to_string());
    let mut total_secs: u64 = 0;
    let mut digits = String::new();

    for c in s.trim().chars() {
        if c.is_ascii_digit() {
            digits.push(c);
            continue;
        }
        let value: u64 = digits.parse().map_err(|_| invalid())?;
        digits.clear();
        let unit = match c {
            's' => 1,
            'm' => 60,
            'h' => 3600,
            'd' => 86400,
            _ => return Err(invalid()),
        };
        total_secs = value
            .checked_mul(unit)
            .and_then(|v| total_secs.checked_add(v))
            .ok_or_else(invalid)?;
    }

    if !digits.is_empty() || total_secs == 0 {
        return Err(invalid());
    }

    Ok(Duration::from_secs(total_secs))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    fn at(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_five_field_fires_on_minute_boundary() {
        let schedule = Schedule::new("*/5 * * * *").unwrap();
        let next = schedule.next_after(at(10, 3, 17)).unwrap();
        assert_eq!((next.hour(), next.minute(), next.second()), (10, 5, 0));
    }

    #[test]
    fn test_six_field_with_seconds() {
        let schedule = Schedule::new("*/2 * * * * *").unwrap();
        let next = schedule.next_after(at(10, 0, 1)).unwrap();
        assert_eq!(next, at(10, 0, 2));
    }

    #[test]
    fn test_seven_field_matches_six_field() {
        let with_year = Schedule::new("0 30 9 * * * 2099").unwrap();
        let without_year = Schedule::new("0 30 9 * * *").unwrap();

        let mut t = at(0, 0, 0);
        for _ in 0..5 {
            let a = with_year.next_after(t).unwrap();
            let b = without_year.next_after(t).unwrap();
            assert_eq!(a, b);
            t = a;
        }
    }

    #[test]
    fn test_next_after_is_strict() {
        let schedule = Schedule::new("0 * * * * *").unwrap();
        let on_boundary = at(10, 1, 0);
        assert_eq!(schedule.next_after(on_boundary).unwrap(), at(10, 2, 0));
    }

    #[test]
    fn test_activations_are_strictly_increasing() {
        let schedule = Schedule::new("*/7 */3 * * * *").unwrap();
        let times = schedule.next_n_after(at(0, 0, 0), 50);
        assert_eq!(times.len(), 50);
        for pair in times.windows(2) {
            assert!(pair[0] < pair[1]);
        }
    }

    #[test]
    fn test_invalid_expressions_rejected() {
        for expr in ["", "* *", "61 * * * *", "a b c d e", "* * * * * * * *"] {
            let err = Schedule::new(expr).unwrap_err();
            assert!(
                matches!(err, ScheduleError::InvalidCron(_)),
                "{:?} gave {:?}",
                expr,
                err
            );
        }
    }

    #[test]
    fn test_weekday_zero_is_sunday() {
        // 2024-01-15 is a Monday.
        let sunday = Utc.with_ymd_and_hms(2024, 1, 21, 0, 0, 0).unwrap();
        for expr in ["0 0 * * 0", "0 0 * * 7", "0 0 0 * * 0", "0 0 0 * * 0 2099"] {
            let schedule = Schedule::new(expr).unwrap();
            assert_eq!(schedule.next_after(at(12, 0, 0)).unwrap(), sunday, "{}", expr);
        }
    }

    #[test]
    fn test_weekday_range_is_monday_to_friday() {
        // 2024-01-06 is a Saturday.
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
        let expected: Vec<DateTime<Utc>> = (8..=12)
            .map(|d| Utc.with_ymd_and_hms(2024, 1, d, 9, 0, 0).unwrap())
            .collect();
        for expr in ["0 9 * * 1-5", "0 0 9 * * 1-5", "0 0 9 * * 1-5 *", "0 9 * * MON-FRI"] {
            let schedule = Schedule::new(expr).unwrap();
            assert_eq!(schedule.next_n_after(saturday, 5), expected, "{}", expr);
        }
    }

    #[test]
    fn test_weekday_lists_and_steps() {
        let saturday = Utc.with_ymd_and_hms(2024, 1, 6, 12, 0, 0).unwrap();
        let day = |d| Utc.with_ymd_and_hms(2024, 1, d, 0, 0, 0).unwrap();

        let weekend = Schedule::new("0 0 * * 6,0").unwrap();
        assert_eq!(weekend.next_n_after(saturday, 2), vec![day(7), day(13)]);

        let every_other = Schedule::new("0 0 * * 1-5/2").unwrap();
        assert_eq!(
            every_other.next_n_after(saturday, 3),
            vec![day(8), day(10), day(12)]
        );

        let from_thursday = Schedule::new("0 0 * * 4/1").unwrap();
        assert_eq!(
            from_thursday.next_n_after(saturday, 2),
            vec![day(11), day(12)]
        );
    }

    #[test]
    fn test_invalid_weekdays_rejected() {
        for expr in ["0 0 * * 8", "0 0 * * 5-1", "0 0 * * */0", "0 0 * * 1-x"] {
            assert!(
                matches!(Schedule::new(expr), Err(ScheduleError::InvalidCron(_))),
                "{} should be rejected",
                expr
            );
        }
    }

    #[test]
    fn test_descriptors() {
        let daily = Schedule::new("@daily").unwrap();
        let next = daily.next_after(at(12, 0, 0)).unwrap();
        assert_eq!((next.hour(), next.minute()), (0, 0));

        let hourly = Schedule::new("@HOURLY").unwrap();
        assert_eq!(hourly.next_after(at(12, 30, 0)).unwrap(), at(13, 0, 0));

        assert!(matches!(
            Schedule::new("@fortnightly"),
            Err(ScheduleError::InvalidCron(_))
        ));
    }

    #[test]
    fn test_every_interval() {
        let schedule = Schedule::new("@every 1h30m").unwrap();
        assert_eq!(schedule.next_after(at(10, 0, 0)).unwrap(), at(11, 30, 0));
        assert!(matches!(
            Schedule::new("@every soon"),
            Err(ScheduleError::InvalidInterval(_))
        ));
    }

    #[test]
    fn test_unsatisfiable_schedule_never_fires() {
        // February 30th does not exist.
        let schedule = Schedule::new("0 0 0 30 2 *").unwrap();
        assert!(schedule.next_after(at(0, 0, 0)).is_none());
    }

    #[test]
    fn test_timezone_shifts_activation() {
        let schedule = Schedule::with_timezone("0 0 9 * * *", "Asia/Shanghai").unwrap();
        let next = schedule.next_after(at(0, 0, 0)).unwrap();
        assert_eq!(next, at(1, 0, 0));

        assert!(matches!(
            Schedule::with_timezone("* * * * *", "Mars/Olympus"),
            Err(ScheduleError::InvalidTimezone(_))
        ));
    }

    #[test]
    fn test_between_is_half_open_and_capped() {
        let schedule = Schedule::new("0 * * * * *").unwrap();
        let all = schedule.between(at(10, 0, 0), at(10, 5, 0), 100);
        assert_eq!(all.first(), Some(&at(10, 1, 0)));
        assert_eq!(all.last(), Some(&at(10, 5, 0)));
        assert_eq!(all.len(), 5);

        let capped = schedule.between(at(10, 0, 0), at(12, 0, 0), 3);
        assert_eq!(capped.len(), 3);
    }

    #[test]
    fn test_parse_duration() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("168h").unwrap(), Duration::from_secs(168 * 3600));
        assert_eq!(parse_duration("1d2h").unwrap(), Duration::from_secs(93600));
        assert!(parse_duration("10").is_err());
        assert!(parse_duration("0s").is_err());
        assert!(parse_duration("5w").is_err());
    }
}
