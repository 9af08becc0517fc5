//! Standard 5-field crontab expressions.
//!
//! Fields are minute, hour, day-of-month, month and day-of-week. Each field
//! accepts `*`, numbers, names (`jan`..`dec`, `sun`..`sat`), lists, ranges
//! and `/step`. Day-of-week `7` is Sunday. When both day fields are
//! restricted a day matches if either one does, as in crontab.

use crate::error::{Error, Result};
use chrono::{DateTime, Datelike, Duration, NaiveDate, TimeZone, Timelike, Utc};
use std::fmt;
use std::str::FromStr;

const MONTH_NAMES: [&str; 12] = [
    "jan", "feb", "mar", "apr", "may", "jun", "jul", "aug", "sep", "oct", "nov", "dec",
];
const DAY_NAMES: [&str; 7] = ["sun", "mon", "tue", "wed", "thu", "fri", "sat"];

/// Upper bound on the search for the next fire time
const SEARCH_HORIZON_DAYS: i64 = 366 * 5;

#[derive(Clone, Copy)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value the first name maps to
    names_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: &MONTH_NAMES,
    names_base: 1,
};
// 7 is accepted as Sunday and folded onto 0
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: &DAY_NAMES,
    names_base: 0,
};

/// A parsed cron expression
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronSchedule {
    expression: String,
    minutes: u64,
    hours: u64,
    days_of_month: u64,
    months: u64,
    days_of_week: u64,
    dom_restricted: bool,
    dow_restricted: bool,
}

impl CronSchedule {
    pub fn parse(expression: &str) -> Result<Self> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(invalid(
                expression,
                format!("expected 5 fields, found {}", fields.len()),
            ));
        }

        let minutes = parse_field(fields[0], MINUTE).map_err(|e| invalid(expression, e))?;
        let hours = parse_field(fields[1], HOUR).map_err(|e| invalid(expression, e))?;
        let days_of_month =
            parse_field(fields[2], DAY_OF_MONTH).map_err(|e| invalid(expression, e))?;
        let months = parse_field(fields[3], MONTH).map_err(|e| invalid(expression, e))?;
        let mut days_of_week =
            parse_field(fields[4], DAY_OF_WEEK).map_err(|e| invalid(expression, e))?;
        if days_of_week & (1 << 7) != 0 {
            days_of_week = (days_of_week & !(1 << 7)) | 1;
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes,
            hours,
            days_of_month,
            months,
            days_of_week,
            dom_restricted: !fields[2].starts_with('*'),
            dow_restricted: !fields[4].starts_with('*'),
        })
    }

    pub fn expression(&self) -> &str {
        &self.expression
    }

    /// Whether the schedule fires at the minute containing `at`
    pub fn matches(&self, at: DateTime<Utc>) -> bool {
        has(self.months, at.month())
            && self.day_matches(at.date_naive())
            && has(self.hours, at.hour())
            && has(self.minutes, at.minute())
    }

    /// First fire time strictly after `after`, or `None` when the expression
    /// can never match (e.g. `0 0 31 2 *`)
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let start = after.with_second(0)?.with_nanosecond(0)? + Duration::minutes(1);
        let horizon = start + Duration::days(SEARCH_HORIZON_DAYS);
        let mut t = start;

        while t <= horizon {
            if !has(self.months, t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date_naive()) {
                t = start_of_day(t.date_naive().succ_opt()?)?;
                continue;
            }
            if !has(self.hours, t.hour()) {
                t = t.with_minute(0)? + Duration::hours(1);
                continue;
            }
            if !has(self.minutes, t.minute()) {
                t += Duration::minutes(1);
                continue;
            }
            return Some(t);
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = has(self.days_of_month, date.day());
        let dow = has(self.days_of_week, date.weekday().num_days_from_sunday());
        if self.dom_restricted && self.dow_restricted {
            dom || dow
        } else {
            dom && dow
        }
    }
}

impl FromStr for CronSchedule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for CronSchedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}

fn invalid(expression: &str, reason: impl fmt::Display) -> Error {
    Error::Validation(format!("invalid cron expression `{}`: {}", expression, reason))
}

fn has(mask: u64, value: u32) -> bool {
    mask & (1 << value) != 0
}

fn start_of_day(date: NaiveDate) -> Option<DateTime<Utc>> {
    date.and_hms_opt(0, 0, 0)
        .map(|midnight| Utc.from_utc_datetime(&midnight))
}

fn first_of_next_month(t: DateTime<Utc>) -> Option<DateTime<Utc>> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1).and_then(start_of_day)
}

fn parse_field(field: &str, spec: FieldSpec) -> std::result::Result<u64, String> {
    let mut mask = 0u64;
    for part in field.split(',') {
        if part.is_empty() {
            return Err(format!("empty list entry in {} field", spec.name));
        }
        let (range, step) = match part.split_once('/') {
            Some((range, step)) => {
                let step: u32 = step
                    .parse()
                    .map_err(|_| format!("invalid step `{}` in {} field", step, spec.name))?;
                if step == 0 {
                    return Err(format!("zero step in {} field", spec.name));
                }
                if step > spec.max - spec.min {
                    return Err(format!("step {} is too large for {} field", step, spec.name));
                }
                (range, step)
            }
            None => (part, 1),
        };

        let (low, high) = if range == "*" {
            (spec.min, spec.max)
        } else if let Some((low, high)) = range.split_once('-') {
            (parse_value(low, spec)?, parse_value(high, spec)?)
        } else {
            let value = parse_value(range, spec)?;
            // `5/10` runs from 5 to the end of the field
            if part.contains('/') {
                (value, spec.max)
            } else {
                (value, value)
            }
        };
        if low > high {
            return Err(format!(
                "range {}-{} is reversed in {} field",
                low, high, spec.name
            ));
        }

        let mut value = low;
        while value <= high {
            mask |= 1 << value;
            match value.checked_add(step) {
                Some(next) => value = next,
                None => break,
            }
        }
    }
    Ok(mask)
}

fn parse_value(text: &str, spec: FieldSpec) -> std::result::Result<u32, String> {
    let lower = text.to_ascii_lowercase();
    let value = match spec.names.iter().position(|name| *name == lower) {
        Some(index) => index as u32 + spec.names_base,
        None => text
            .parse()
            .map_err(|_| format!("invalid value `{}` in {} field", text, spec.name))?,
    };
    if value < spec.min || value > spec.max {
        return Err(format!(
            "{} out of range {}-{} in {} field",
            value, spec.min, spec.max, spec.name
        ));
    }
    Ok(value)
}
