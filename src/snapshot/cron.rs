//! Cron expressions
//!
//! Standard 5-field schedules evaluated in UTC.
//!
//! ```text
//! ┌───────────── minute        0-59
//! │ ┌─────────── hour          0-23
//! │ │ ┌───────── day of month  1-31
//! │ │ │ ┌─────── month         1-12
//! │ │ │ │ ┌───── day of week   0-7 (0 and 7 are Sunday)
//! * * * * *
//! ```
//!
//! Each field accepts `*`, numbers, lists (`1,5`), ranges (`1-5`) and steps
//! (`*/15`, `0-30/10`). When both day fields are restricted a day matches if
//! either does.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};

use crate::error::{EmberError, Result};

/// How far ahead `next_after` searches before giving up
///
/// Covers the longest gap a satisfiable expression can have (Feb 29).
const SEARCH_YEARS: i32 = 9;

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expr: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    /// Parse a 5-field expression
    pub fn parse(expr: &str) -> Result<Self> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expr,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let mut days_of_week = parse_field(expr, fields[4], 0, 7)?;
        // 7 is an alias for Sunday
        if days_of_week & (1u64 << 7) != 0 {
            days_of_week = (days_of_week & !(1u64 << 7)) | 1;
        }

        Ok(Self {
            expr: fields.join(" "),
            minutes: parse_field(expr, fields[0], 0, 59)?,
            hours: parse_field(expr, fields[1], 0, 23)?,
            days_of_month: parse_field(expr, fields[2], 1, 31)?,
            months: parse_field(expr, fields[3], 1, 12)?,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    /// The expression, whitespace-normalized
    pub fn expr(&self) -> &str {
        &self.expr
    }

    /// First matching minute strictly after `after`
    ///
    /// `None` if nothing matches within the search horizon (e.g. `0 0 30 2 *`).
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = start.year() + SEARCH_YEARS;
        let mut t = start;

        while t.year() <= horizon {
            if !bit(self.months, t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t) {
                t = start_of_day(t.date_naive().succ_opt()?)?;
                continue;
            }
            if !bit(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !bit(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, t: DateTime<Utc>) -> bool {
        let dom = bit(self.days_of_month, t.day());
        let dow = bit(self.days_of_week, t.weekday().num_days_from_sunday());
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom || dow,
            (true, false) => dom,
            (false, true) => dow,
            (false, false) => true,
        }
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expr)
    }
}

// =============================================================================
// Field Parsing
// =============================================================================

/// Parse one field into a bit set over `min..=max`
fn parse_field(expr: &str, field: &str, min: u32, max: u32) -> Result<u64> {
    let mut set = 0u64;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step = parse_number(expr, step)?;
                if step == 0 {
                    return Err(invalid(expr, format!("zero step in '{}'", part)));
                }
                if step > max {
                    return Err(invalid(
                        expr,
                        format!("step in '{}' exceeds {}", part, max),
                    ));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" {
            (min, max)
        } else if let Some((lo, hi)) = range.split_once('-') {
            (parse_number(expr, lo)?, parse_number(expr, hi)?)
        } else {
            let value = parse_number(expr, range)?;
            // `5/15` means "from 5, every 15"
            (value, if step.is_some() { max } else { value })
        };

        if lo < min || hi > max || lo > hi {
            return Err(invalid(
                expr,
                format!("'{}' is outside {}-{}", part, min, max),
            ));
        }

        let step = step.unwrap_or(1);
        let mut value = lo;
        while value <= hi {
            set |= 1u64 << value;
            value += step;
        }
    }
    Ok(set)
}

fn parse_number(expr: &str, s: &str) -> Result<u32> {
    s.parse::<u32>()
        .map_err(|_| invalid(expr, format!("'{}' is not a number", s)))
}

fn invalid(expr: &str, reason: String) -> EmberError {
    EmberError::InvalidCron {
        expr: expr.to_string(),
        reason,
    }
}

// =============================================================================
// Time Helpers
// =============================================================================

fn bit(set: u64, value: u32) -> bool {
    set & (1u64 << value) != 0
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    Some(Utc.from_utc_datetime(&date.and_hms_opt(0, 0, 0)?))
}

fn start_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    start_of_day(NaiveDate::from_ymd_opt(year, month, 1)?)
}
