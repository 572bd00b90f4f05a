use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, NaiveDate, NaiveDateTime, Timelike, Utc};
use thiserror::Error;

const MIN_YEAR: u32 = 1970;
const MAX_YEAR: u32 = 2099;

const MONTH_NAMES: &[(&str, u32)] = &[
    ("JAN", 1),
    ("FEB", 2),
    ("MAR", 3),
    ("APR", 4),
    ("MAY", 5),
    ("JUN", 6),
    ("JUL", 7),
    ("AUG", 8),
    ("SEP", 9),
    ("OCT", 10),
    ("NOV", 11),
    ("DEC", 12),
];

const DAY_NAMES: &[(&str, u32)] = &[
    ("SUN", 0),
    ("MON", 1),
    ("TUE", 2),
    ("WED", 3),
    ("THU", 4),
    ("FRI", 5),
    ("SAT", 6),
];

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CronParseError {
    #[error("empty expression")]
    Empty,

    #[error("expected 5, 6 or 7 fields, found {0}")]
    FieldCount(usize),

    #[error("unknown macro: {0}")]
    UnknownMacro(String),

    #[error("invalid {field} field '{value}': {reason}")]
    InvalidField {
        field: &'static str,
        value: String,
        reason: String,
    },
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [(&'static str, u32)],
}

const SECONDS: FieldSpec = FieldSpec {
    name: "second",
    min: 0,
    max: 59,
    names: &[],
};
const MINUTES: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
};
const HOURS: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
};
const DAYS_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
};
const MONTHS: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
};
// 7 is accepted as an alias for Sunday and folded to 0 after parsing.
const DAYS_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: DAY_NAMES,
};
const YEARS: FieldSpec = FieldSpec {
    name: "year",
    min: MIN_YEAR,
    max: MAX_YEAR,
    names: &[],
};

/// The set of values one cron field allows.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronField {
    values: BTreeSet<u32>,
    restricted: bool,
}

impl CronField {
    fn full(spec: &FieldSpec) -> Self {
        Self {
            values: (spec.min..=spec.max).collect(),
            restricted: false,
        }
    }

    pub fn contains(&self, value: u32) -> bool {
        self.values.contains(&value)
    }

    /// Smallest allowed value that is `>= value`.
    pub fn next_from(&self, value: u32) -> Option<u32> {
        self.values.range(value..).next().copied()
    }

    /// False when the field was written as `*` or `?`.
    pub fn is_restricted(&self) -> bool {
        self.restricted
    }

    fn parse(text: &str, spec: &FieldSpec) -> Result<Self, CronParseError> {
        let invalid = |reason: String| CronParseError::InvalidField {
            field: spec.name,
            value: text.to_string(),
            reason,
        };

        if text == "*" || text == "?" {
            return Ok(Self::full(spec));
        }

        let mut values = BTreeSet::new();
        for part in text.split(',') {
            if part.is_empty() {
                return Err(invalid("empty list element".to_string()));
            }

            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step
                        .parse()
                        .map_err(|_| invalid(format!("bad step '{step}'")))?;
                    if step == 0 {
                        return Err(invalid("step must be positive".to_string()));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" || range == "?" {
                (spec.min, spec.max)
            } else if let Some((lo, hi)) = range.split_once('-') {
                (parse_value(lo, spec, &invalid)?, parse_value(hi, spec, &invalid)?)
            } else {
                let start = parse_value(range, spec, &invalid)?;
                // `a/n` runs from a to the end of the field
                let end = if step.is_some() { spec.max } else { start };
                (start, end)
            };

            if start > end {
                return Err(invalid(format!("range {start}-{end} is reversed")));
            }

            let step = step.unwrap_or(1) as usize;
            values.extend((start..=end).step_by(step));
        }

        Ok(Self {
            values,
            restricted: true,
        })
    }
}

fn parse_value(
    raw: &str,
    spec: &FieldSpec,
    invalid: &dyn Fn(String) -> CronParseError,
) -> Result<u32, CronParseError> {
    let upper = raw.to_ascii_uppercase();
    let value = match spec.names.iter().find(|(name, _)| *name == upper) {
        Some((_, v)) => *v,
        None => raw
            .parse::<u32>()
            .map_err(|_| invalid(format!("'{raw}' is not a number")))?,
    };
    if value < spec.min || value > spec.max {
        return Err(invalid(format!(
            "{value} is outside {}-{}",
            spec.min, spec.max
        )));
    }
    Ok(value)
}

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpr {
    source: String,
    seconds: CronField,
    minutes: CronField,
    hours: CronField,
    days_of_month: CronField,
    months: CronField,
    days_of_week: CronField,
    years: CronField,
}

impl CronExpr {
    pub fn parse(source: &str) -> Result<Self, CronParseError> {
        let trimmed = source.trim();
        if trimmed.is_empty() {
            return Err(CronParseError::Empty);
        }

        let expanded = if trimmed.starts_with('@') {
            match trimmed.to_ascii_lowercase().as_str() {
                "@yearly" | "@annually" => "0 0 0 1 1 *",
                "@monthly" => "0 0 0 1 * *",
                "@weekly" => "0 0 0 * * 0",
                "@daily" | "@midnight" => "0 0 0 * * *",
                "@hourly" => "0 0 * * * *",
                _ => return Err(CronParseError::UnknownMacro(trimmed.to_string())),
            }
        } else {
            trimmed
        };

        let fields: Vec<&str> = expanded.split_whitespace().collect();
        let (sec, rest, year) = match fields.len() {
            5 => ("0", &fields[..], None),
            6 => (fields[0], &fields[1..], None),
            7 => (fields[0], &fields[1..6], Some(fields[6])),
            n => return Err(CronParseError::FieldCount(n)),
        };

        let mut days_of_week = CronField::parse(rest[4], &DAYS_OF_WEEK)?;
        if days_of_week.values.remove(&7) {
            days_of_week.values.insert(0);
        }

        Ok(Self {
            source: trimmed.to_string(),
            seconds: CronField::parse(sec, &SECONDS)?,
            minutes: CronField::parse(rest[0], &MINUTES)?,
            hours: CronField::parse(rest[1], &HOURS)?,
            days_of_month: CronField::parse(rest[2], &DAYS_OF_MONTH)?,
            months: CronField::parse(rest[3], &MONTHS)?,
            days_of_week,
            years: match year {
                Some(y) => CronField::parse(y, &YEARS)?,
                None => CronField::full(&YEARS),
            },
        })
    }

    /// The expression as it was written, trimmed.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// First matching instant strictly after `after`, or `None` when the
    /// expression never fires again before the end of the supported range.
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let base = after.naive_utc().with_nanosecond(0)?;
        let mut t = base + Duration::seconds(1);

        while (t.year() as u32) <= MAX_YEAR {
            let year = t.year() as u32;
            if !self.years.contains(year) {
                let next_year = self.years.next_from(year + 1)?;
                t = start_of_day(NaiveDate::from_ymd_opt(next_year as i32, 1, 1)?)?;
                continue;
            }

            if !self.months.contains(t.month()) {
                t = start_of_next_month(t)?;
                continue;
            }

            if !self.day_matches(t.date()) {
                t = start_of_day(t.date().succ_opt()?)?;
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

            return Some(t.and_utc());
        }

        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self
            .days_of_week
            .contains(date.weekday().num_days_from_sunday());

        if self.days_of_month.is_restricted() && self.days_of_week.is_restricted() {
            dom || dow
        } else {
            dom && dow
        }
    }
}

fn start_of_day(date: NaiveDate) -> Option<NaiveDateTime> {
    date.and_hms_opt(0, 0, 0)
}

fn start_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    start_of_day(NaiveDate::from_ymd_opt(year, month, 1)?)
}

impl FromStr for CronExpr {
    type Err = CronParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}
