//! Cron expression parsing and fire-time search.
//!
//! Supports standard 5-field cron expressions:
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12 or jan-dec)
//! │ │ │ │ ┌───────────── day of week (0-7 or sun-sat, 0 and 7 = Sunday)
//! │ │ │ │ │
//! * * * * *
//! ```
//!
//! When both day-of-month and day-of-week are restricted (neither starts with
//! `*`) a day matches if *either* field matches, as in Vixie cron.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

/// Upper bound on the number of days a fire-time search walks.
const MAX_SEARCH_DAYS: u32 = 5 * 366;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];

const WEEKDAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Errors that can occur when parsing cron expressions.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronParseError {
    #[error("Invalid cron expression: expected 5 fields, got {0}")]
    InvalidFieldCount(usize),
    #[error("Invalid field '{field}': {reason}")]
    InvalidField { field: String, reason: String },
    #[error("Value {value} is out of range [{min}, {max}] for {field}")]
    OutOfRange {
        field: String,
        value: u32,
        min: u32,
        max: u32,
    },
    #[error("Invalid range: {0}-{1}")]
    InvalidRange(u32, u32),
    #[error("Invalid step value: {0}")]
    InvalidStep(String),
    #[error("Unknown shorthand: {0}")]
    UnknownShorthand(String),
}

// ---------------------------------------------------------------------------
// CronField
// ---------------------------------------------------------------------------

/// A single field in a cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    values: BTreeSet<u32>,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// `false` when the field text starts with `*`.
    restricted: bool,
}

impl CronField {
    fn new(min: u32, max: u32, names: &'static [&'static str]) -> Self {
        Self {
            values: BTreeSet::new(),
            min,
            max,
            names,
            restricted: true,
        }
    }

    fn parse(&mut self, expr: &str) -> Result<(), CronParseError> {
        self.restricted = !expr.starts_with('*');
        for part in expr.split(',') {
            self.parse_part(part.trim())?;
        }
        Ok(())
    }

    fn parse_part(&mut self, part: &str) -> Result<(), CronParseError> {
        let (range_part, step) = match part.split_once('/') {
            Some((range, step_str)) => {
                let step = step_str
                    .parse::<u32>()
                    .map_err(|_| CronParseError::InvalidStep(step_str.to_string()))?;
                if step == 0 {
                    return Err(CronParseError::InvalidStep("0".to_string()));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (start, end) = if range_part == "*" {
            (self.min, self.max)
        } else if let Some((lo, hi)) = range_part.split_once('-') {
            let start = self.parse_value(lo, range_part)?;
            let end = self.parse_value(hi, range_part)?;
            if start > end {
                return Err(CronParseError::InvalidRange(start, end));
            }
            (start, end)
        } else {
            let value = self.parse_value(range_part, range_part)?;
            // `5/15` means "from 5 to the end of the range, every 15".
            if step.is_some() {
                (value, self.max)
            } else {
                (value, value)
            }
        };

        if start < self.min || end > self.max {
            return Err(CronParseError::OutOfRange {
                field: range_part.to_string(),
                value: if start < self.min { start } else { end },
                min: self.min,
                max: self.max,
            });
        }

        let step = step.unwrap_or(1);
        let mut value = start;
        while value <= end {
            self.values.insert(value);
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }

        Ok(())
    }

    fn parse_value(&self, token: &str, field: &str) -> Result<u32, CronParseError> {
        if let Ok(value) = token.parse::<u32>() {
            return Ok(value);
        }
        let lower = token.to_ascii_lowercase();
        self.names
            .iter()
            .position(|name| *name == lower)
            .map(|idx| idx as u32 + self.min)
            .ok_or_else(|| CronParseError::InvalidField {
                field: field.to_string(),
                reason: format!("invalid value '{token}'"),
            })
    }

    /// Check if a value matches this field.
    pub fn matches(&self, value: u32) -> bool {
        self.values.contains(&value)
    }
}

// ---------------------------------------------------------------------------
// CronExpr
// ---------------------------------------------------------------------------

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    expr: String,
    minute: CronField,
    hour: CronField,
    day_of_month: CronField,
    month: CronField,
    day_of_week: CronField,
}

impl CronExpr {
    /// Parse a cron expression string or one of the `@` shorthands.
    pub fn parse(expr: &str) -> Result<Self, CronParseError> {
        let trimmed = expr.trim();
        let fields = if trimmed.starts_with('@') {
            expand_shorthand(trimmed)?
        } else {
            trimmed
        };

        let parts: Vec<&str> = fields.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronParseError::InvalidFieldCount(parts.len()));
        }

        let mut minute = CronField::new(0, 59, &[]);
        let mut hour = CronField::new(0, 23, &[]);
        let mut day_of_month = CronField::new(1, 31, &[]);
        let mut month = CronField::new(1, 12, &MONTH_NAMES);
        let mut day_of_week = CronField::new(0, 7, &WEEKDAY_NAMES);

        minute.parse(parts[0])?;
        hour.parse(parts[1])?;
        day_of_month.parse(parts[2])?;
        month.parse(parts[3])?;
        day_of_week.parse(parts[4])?;

        // 7 is an alias for Sunday.
        if day_of_week.values.remove(&7) {
            day_of_week.values.insert(0);
        }

        Ok(Self {
            expr: trimmed.to_string(),
            minute,
            hour,
            day_of_month,
            month,
            day_of_week,
        })
    }

    /// The expression text as written.
    pub fn as_str(&self) -> &str {
        &self.expr
    }

    /// Check if a datetime (truncated to the minute) matches this expression.
    pub fn matches(&self, dt: &DateTime<Utc>) -> bool {
        self.minute.matches(dt.minute())
            && self.hour.matches(dt.hour())
            && self.day_matches(dt.date_naive())
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        if !self.month.matches(date.month()) {
            return false;
        }
        let dom = self.day_of_month.matches(date.day());
        let dow = self
            .day_of_week
            .matches(date.weekday().num_days_from_sunday());
        if self.day_of_month.restricted && self.day_of_week.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// The latest fire time on or before `at`.
    ///
    /// Seconds are ignored: a fire time of 02:00 is "on or before" 02:00:59.
    /// Returns `None` if nothing fires within the search horizon (for example
    /// `0 0 30 2 *`).
    pub fn prev_fire(&self, at: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let mut date = at.date_naive();
        let mut hour_cap = at.hour();
        let mut minute_cap = at.minute();

        for _ in 0..MAX_SEARCH_DAYS {
            if self.day_matches(date) {
                for &hour in self.hour.values.range(..=hour_cap).rev() {
                    let cap = if hour == hour_cap { minute_cap } else { 59 };
                    if let Some(&minute) = self.minute.values.range(..=cap).next_back() {
                        return date.and_hms_opt(hour, minute, 0).map(|dt| dt.and_utc());
                    }
                }
            }
            date = date.pred_opt()?;
            hour_cap = 23;
            minute_cap = 59;
        }

        None
    }

    /// The earliest fire time strictly after `after`.
    pub fn next_fire(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + chrono::Duration::minutes(1);
        let mut date = start.date_naive();
        let mut hour_floor = start.hour();
        let mut minute_floor = start.minute();

        for _ in 0..MAX_SEARCH_DAYS {
            if self.day_matches(date) {
                for &hour in self.hour.values.range(hour_floor..) {
                    let floor = if hour == hour_floor { minute_floor } else { 0 };
                    if let Some(&minute) = self.minute.values.range(floor..).next() {
                        return date.and_hms_opt(hour, minute, 0).map(|dt| dt.and_utc());
                    }
                }
            }
            date = date.succ_opt()?;
            hour_floor = 0;
            minute_floor = 0;
        }

        None
    }
}

fn expand_shorthand(expr: &str) -> Result<&'static str, CronParseError> {
    match expr.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(CronParseError::UnknownShorthand(expr.to_string())),
    }
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    #[test]
    fn parse_wildcard() {
        let expr = CronExpr::parse("* * * * *").unwrap();
        assert_eq!(expr.minute.values.len(), 60);
        assert_eq!(expr.hour.values.len(), 24);
        assert_eq!(expr.day_of_week.values.len(), 7);
    }

    #[test]
    fn parse_step_and_list() {
        let expr = CronExpr::parse("*/15 1,13 * * *").unwrap();
        assert_eq!(
            expr.minute.values.iter().copied().collect::<Vec<_>>(),
            vec![0, 15, 30, 45]
        );
        assert!(expr.hour.matches(13));
        assert!(!expr.hour.matches(2));
    }

    #[test]
    fn parse_value_with_step_runs_to_end_of_range() {
        let expr = CronExpr::parse("50/5 * * * *").unwrap();
        assert_eq!(
            expr.minute.values.iter().copied().collect::<Vec<_>>(),
            vec![50, 55]
        );
    }

    #[test]
    fn step_larger_than_the_range_keeps_only_the_start() {
        let expr = CronExpr::parse("1/4294967295 * * * *").unwrap();
        assert_eq!(expr.minute.values.iter().copied().collect::<Vec<_>>(), vec![1]);

        let expr = CronExpr::parse("*/4294967295 * * * *").unwrap();
        assert_eq!(expr.minute.values.iter().copied().collect::<Vec<_>>(), vec![0]);

        let expr = CronExpr::parse("0 20-23/4294967290 * * *").unwrap();
        assert_eq!(expr.hour.values.iter().copied().collect::<Vec<_>>(), vec![20]);
    }

    #[test]
    fn parse_names_case_insensitive() {
        let expr = CronExpr::parse("0 0 * JAN-mar mon-FRI").unwrap();
        assert!(expr.month.matches(3));
        assert!(!expr.month.matches(4));
        assert!(expr.day_of_week.matches(1));
        assert!(!expr.day_of_week.matches(0));
    }

    #[test]
    fn seven_is_sunday() {
        let expr = CronExpr::parse("0 0 * * 7").unwrap();
        assert!(expr.day_of_week.matches(0));
        assert!(!expr.day_of_week.matches(7));
    }

    #[test]
    fn shorthands_expand() {
        assert_eq!(
            CronExpr::parse("@daily").unwrap().prev_fire(&at(2024, 3, 5, 12, 0, 0)),
            Some(at(2024, 3, 5, 0, 0, 0))
        );
        assert_eq!(
            CronExpr::parse("@bogus").unwrap_err(),
            CronParseError::UnknownShorthand("@bogus".to_string())
        );
    }

    #[test]
    fn invalid_expressions() {
        assert_eq!(
            CronExpr::parse("* *").unwrap_err(),
            CronParseError::InvalidFieldCount(2)
        );
        assert!(CronExpr::parse("60 * * * *").is_err());
        assert!(CronExpr::parse("* 25 * * *").is_err());
        assert!(CronExpr::parse("*/0 * * * *").is_err());
        assert!(CronExpr::parse("30-10 * * * *").is_err());
        assert!(CronExpr::parse("* * * foo *").is_err());
    }

    #[test]
    fn matches_ignores_seconds() {
        let expr = CronExpr::parse("30 4 * * *").unwrap();
        assert!(expr.matches(&at(2024, 1, 15, 4, 30, 42)));
        assert!(!expr.matches(&at(2024, 1, 15, 4, 31, 0)));
    }

    #[test]
    fn dom_and_dow_combine_with_or_when_both_restricted() {
        // 1st of the month or any Monday.
        let expr = CronExpr::parse("0 0 1 * 1").unwrap();
        // 2024-01-08 is a Monday.
        assert!(expr.matches(&at(2024, 1, 8, 0, 0, 0)));
        assert!(expr.matches(&at(2024, 2, 1, 0, 0, 0)));
        assert!(!expr.matches(&at(2024, 1, 9, 0, 0, 0)));
    }

    #[test]
    fn dow_only_restriction_uses_and() {
        let expr = CronExpr::parse("0 0 * * 1").unwrap();
        assert!(!expr.matches(&at(2024, 2, 1, 0, 0, 0)));
        assert!(expr.matches(&at(2024, 1, 8, 0, 0, 0)));
    }

    #[test]
    fn prev_fire_same_minute() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        assert_eq!(
            expr.prev_fire(&at(2024, 1, 15, 2, 0, 5)),
            Some(at(2024, 1, 15, 2, 0, 0))
        );
    }

    #[test]
    fn prev_fire_earlier_day() {
        let expr = CronExpr::parse("0 2 * * *").unwrap();
        assert_eq!(
            expr.prev_fire(&at(2024, 1, 15, 1, 59, 59)),
            Some(at(2024, 1, 14, 2, 0, 0))
        );
    }

    #[test]
    fn prev_fire_crosses_year_boundary() {
        let expr = CronExpr::parse("30 23 31 12 *").unwrap();
        assert_eq!(
            expr.prev_fire(&at(2024, 6, 1, 0, 0, 0)),
            Some(at(2023, 12, 31, 23, 30, 0))
        );
    }

    #[test]
    fn prev_fire_quarter_hour() {
        let expr = CronExpr::parse("*/15 * * * *").unwrap();
        assert_eq!(
            expr.prev_fire(&at(2024, 1, 15, 10, 44, 59)),
            Some(at(2024, 1, 15, 10, 30, 0))
        );
    }

    #[test]
    fn prev_fire_leap_day() {
        let expr = CronExpr::parse("0 0 29 2 *").unwrap();
        assert_eq!(
            expr.prev_fire(&at(2027, 3, 1, 0, 0, 0)),
            Some(at(2024, 2, 29, 0, 0, 0))
        );
    }

    #[test]
    fn impossible_date_never_fires() {
        let expr = CronExpr::parse("0 0 30 2 *").unwrap();
        assert_eq!(expr.prev_fire(&at(2024, 3, 1, 0, 0, 0)), None);
        assert_eq!(expr.next_fire(&at(2024, 3, 1, 0, 0, 0)), None);
    }

    #[test]
    fn next_fire_is_strictly_after() {
        let expr = CronExpr::parse("0 * * * *").unwrap();
        assert_eq!(
            expr.next_fire(&at(2024, 1, 15, 14, 0, 0)),
            Some(at(2024, 1, 15, 15, 0, 0))
        );
        assert_eq!(
            expr.next_fire(&at(2024, 1, 15, 23, 30, 0)),
            Some(at(2024, 1, 16, 0, 0, 0))
        );
    }

    #[test]
    fn prev_and_next_agree_with_matches() {
        let expr = CronExpr::parse("5,35 */6 * * mon-fri").unwrap();
        let mut t = at(2024, 1, 1, 0, 0, 0);
        for _ in 0..50 {
            let next = expr.next_fire(&t).unwrap();
            assert!(expr.matches(&next));
            assert_eq!(expr.prev_fire(&next), Some(next));
            t = next;
        }
    }
}
