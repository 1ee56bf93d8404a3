//! Cron expression parsing and next-match search, always in UTC.
//!
//! Accepted forms:
//!
//! | Fields | Layout                                   |
//! |--------|------------------------------------------|
//! | 5      | `minute hour day-of-month month weekday` |
//! | 6      | `second minute hour day-of-month month weekday` |
//!
//! Each field takes `*`, values, ranges (`a-b`), steps (`*/n`, `a-b/n`,
//! `a/n`) and comma lists. Months and weekdays also accept three-letter
//! names; weekday `7` is Sunday. `?` is a synonym for `*`. The macros
//! `@yearly`, `@annually`, `@monthly`, `@weekly`, `@daily`, `@midnight`
//! and `@hourly` expand to their usual five-field forms.

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc};
use thiserror::Error;

/// How far ahead `next_after` searches before declaring an expression
/// unsatisfiable. The calendar repeats its weekday layout every 28 years,
/// so this covers a Feb 29 pinned to one weekday.
const SEARCH_HORIZON_YEARS: i32 = 28;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronParseError {
    #[error("expected 5 or 6 fields, found {0}")]
    FieldCount(usize),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },

    #[error("unknown macro '{0}'")]
    UnknownMacro(String),
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    /// Symbolic names; index 0 maps to `min`.
    names: &'static [&'static str],
}

const SECOND: FieldSpec = FieldSpec { name: "second", min: 0, max: 59, names: &[] };
const MINUTE: FieldSpec = FieldSpec { name: "minute", min: 0, max: 59, names: &[] };
const HOUR: FieldSpec = FieldSpec { name: "hour", min: 0, max: 23, names: &[] };
const DAY_OF_MONTH: FieldSpec = FieldSpec { name: "day-of-month", min: 1, max: 31, names: &[] };
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &["JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC"],
};
// 7 is accepted as an alias for Sunday and folded onto 0 after parsing.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"],
};

/// Set of allowed values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FieldSet {
    bits: u64,
}

impl FieldSet {
    fn contains(&self, value: u32) -> bool {
        value < 64 && self.bits & (1u64 << value) != 0
    }
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    seconds: FieldSet,
    minutes: FieldSet,
    hours: FieldSet,
    days_of_month: FieldSet,
    months: FieldSet,
    days_of_week: FieldSet,
}

impl CronExpr {
    pub fn parse(expression: &str) -> Result<Self, CronParseError> {
        let trimmed = expression.trim();
        let expanded = if trimmed.starts_with('@') {
            expand_macro(trimmed)?
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (second, rest) = match fields.len() {
            5 => ("0", &fields[..]),
            6 => (fields[0], &fields[1..]),
            n => return Err(CronParseError::FieldCount(n)),
        };

        let mut days_of_week = parse_field(&DAY_OF_WEEK, rest[4])?;
        if days_of_week.contains(7) {
            days_of_week.bits = (days_of_week.bits & !(1 << 7)) | 1;
        }

        Ok(Self {
            source: trimmed.to_string(),
            seconds: parse_field(&SECOND, second)?,
            minutes: parse_field(&MINUTE, rest[0])?,
            hours: parse_field(&HOUR, rest[1])?,
            days_of_month: parse_field(&DAY_OF_MONTH, rest[2])?,
            months: parse_field(&MONTH, rest[3])?,
            days_of_week,
        })
    }

    /// The expression as written (macros are not expanded).
    pub fn source(&self) -> &str {
        &self.source
    }

    /// Earliest instant strictly after `after` matching every field.
    ///
    /// Returns `None` when nothing matches within the search horizon, which
    /// only happens for unsatisfiable expressions such as `0 0 30 2 *`.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let limit_year = after.year() + SEARCH_HORIZON_YEARS;
        // Drop sub-second precision, then step to the next whole second so
        // the result is strictly later than `after`.
        let mut t = after.naive_utc().with_nanosecond(0)? + Duration::seconds(1);

        loop {
            if t.year() > limit_year {
                return None;
            }
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t.date())?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t = t.date().and_hms_opt(t.hour(), t.minute(), 0)? + Duration::minutes(1);
                continue;
            }
            if !self.seconds.contains(t.second()) {
                t += Duration::seconds(1);
                continue;
            }
            return Some(Utc.from_utc_datetime(&t));
        }
    }

    /// Both day fields must match, even when both are restricted.
    fn day_matches(&self, date: NaiveDate) -> bool {
        self.days_of_month.contains(date.day())
            && self
                .days_of_week
                .contains(date.weekday().num_days_from_sunday())
    }
}

impl std::str::FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronExpr::parse(s)
    }
}

impl std::fmt::Display for CronExpr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.source)
    }
}

fn expand_macro(name: &str) -> Result<&'static str, CronParseError> {
    match name.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(CronParseError::UnknownMacro(name.to_string())),
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDateTime> {
    let (year, month) = if date.month() == 12 {
        (date.year() + 1, 1)
    } else {
        (date.year(), date.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

fn parse_field(spec: &FieldSpec, text: &str) -> Result<FieldSet, CronParseError> {
    let invalid = |reason: &str| CronParseError::InvalidField {
        field: spec.name,
        value: text.to_string(),
        reason: reason.to_string(),
    };

    let mut bits = 0u64;
    for part in text.split(',') {
        if part.is_empty() {
            return Err(invalid("empty list element"));
        }

        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step.parse().map_err(|_| invalid("step is not a number"))?;
                if step == 0 {
                    return Err(invalid("step must be positive"));
                }
                (range, Some(step))
            }
            None => (part, None),
        };

        let (lo, hi) = if range == "*" || range == "?" {
            (spec.min, spec.max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo = parse_value(spec, a).ok_or_else(|| invalid("value out of range"))?;
            let hi = parse_value(spec, b).ok_or_else(|| invalid("value out of range"))?;
            if lo > hi {
                return Err(invalid("range start is after range end"));
            }
            (lo, hi)
        } else {
            let v = parse_value(spec, range).ok_or_else(|| invalid("value out of range"))?;
            // `a/n` means "from a to the end of the field, every n".
            match step {
                Some(_) => (v, spec.max),
                None => (v, v),
            }
        };

        let step = step.unwrap_or(1) as usize;
        for v in (lo..=hi).step_by(step) {
            bits |= 1u64 << v;
        }
    }

    Ok(FieldSet { bits })
}

fn parse_value(spec: &FieldSpec, raw: &str) -> Option<u32> {
    let value = match raw.parse::<u32>() {
        Ok(n) => n,
        Err(_) => {
            let upper = raw.to_ascii_uppercase();
            let idx = spec.names.iter().position(|n| *n == upper)?;
            spec.min + idx as u32
        }
    };
    (spec.min..=spec.max).contains(&value).then_some(value)
}
