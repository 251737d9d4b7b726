//! Calendar recurrence schedules.
//!
//! A [`CronSchedule`] constrains seven calendar units independently. Each
//! field is a wildcard (unset, empty or `"*"`), a comma-separated list of
//! integers, or an inclusive range `"a-b"`; list items may themselves be
//! ranges (`"1-5,10"`). Unlike classic cron, `day_of_month` and
//! `day_of_week` are combined with AND.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Errors produced while validating a [`CronSchedule`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CronError {
    #[error("{unit}: `{token}` is not a number or range")]
    InvalidToken { unit: CronUnit, token: String },
    #[error("{unit}: range `{token}` has its start after its end")]
    ReversedRange { unit: CronUnit, token: String },
    #[error("{unit}: {value} is outside {min}..={max}")]
    OutOfRange {
        unit: CronUnit,
        value: u32,
        min: u32,
        max: u32,
    },
}

/// The seven calendar units of a schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CronUnit {
    Second,
    Minute,
    Hour,
    DayOfMonth,
    Month,
    DayOfWeek,
    Year,
}

impl CronUnit {
    /// Inclusive domain accepted for this unit.
    #[must_use]
    pub const fn bounds(self) -> (u32, u32) {
        match self {
            Self::Second | Self::Minute => (0, 59),
            Self::Hour => (0, 23),
            Self::DayOfMonth => (1, 31),
            Self::Month => (1, 12),
            // 0 and 7 both mean Sunday.
            Self::DayOfWeek => (0, 7),
            Self::Year => (1970, 9999),
        }
    }
}

impl fmt::Display for CronUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Second => "second",
            Self::Minute => "minute",
            Self::Hour => "hour",
            Self::DayOfMonth => "dayOfMonth",
            Self::Month => "month",
            Self::DayOfWeek => "dayOfWeek",
            Self::Year => "year",
        };
        f.write_str(name)
    }
}

/// Seven optional calendar constraints describing a recurrence.
///
/// A schedule whose fields are all wildcards means "no recurrence".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CronSchedule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub second: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minute: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub month: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub year: Option<String>,
}

impl CronSchedule {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn second(mut self, expr: impl Into<String>) -> Self {
        self.second = Some(expr.into());
        self
    }

    #[must_use]
    pub fn minute(mut self, expr: impl Into<String>) -> Self {
        self.minute = Some(expr.into());
        self
    }

    #[must_use]
    pub fn hour(mut self, expr: impl Into<String>) -> Self {
        self.hour = Some(expr.into());
        self
    }

    #[must_use]
    pub fn day_of_month(mut self, expr: impl Into<String>) -> Self {
        self.day_of_month = Some(expr.into());
        self
    }

    #[must_use]
    pub fn month(mut self, expr: impl Into<String>) -> Self {
        self.month = Some(expr.into());
        self
    }

    #[must_use]
    pub fn day_of_week(mut self, expr: impl Into<String>) -> Self {
        self.day_of_week = Some(expr.into());
        self
    }

    #[must_use]
    pub fn year(mut self, expr: impl Into<String>) -> Self {
        self.year = Some(expr.into());
        self
    }

    fn fields(&self) -> [(CronUnit, Option<&str>); 7] {
        [
            (CronUnit::Second, self.second.as_deref()),
            (CronUnit::Minute, self.minute.as_deref()),
            (CronUnit::Hour, self.hour.as_deref()),
            (CronUnit::DayOfMonth, self.day_of_month.as_deref()),
            (CronUnit::Month, self.month.as_deref()),
            (CronUnit::DayOfWeek, self.day_of_week.as_deref()),
            (CronUnit::Year, self.year.as_deref()),
        ]
    }

    /// Returns `true` when no field constrains anything.
    #[must_use]
    pub fn is_wildcard(&self) -> bool {
        self.fields().iter().all(|(_, spec)| is_wildcard_spec(*spec))
    }

    /// Checks every field against its syntax and domain.
    ///
    /// # Errors
    ///
    /// Returns the first [`CronError`] found, scanning from `second` to `year`.
    pub fn validate(&self) -> Result<(), CronError> {
        self.compile().map(|_| ())
    }

    /// Parses all seven fields into matchers.
    ///
    /// # Errors
    ///
    /// Returns a [`CronError`] if any field is malformed.
    pub fn compile(&self) -> Result<CompiledSchedule, CronError> {
        let [second, minute, hour, day_of_month, month, day_of_week, year] = self.fields();
        let mut day_of_week = FieldMatcher::parse(day_of_week.0, day_of_week.1)?;
        if let FieldMatcher::Set(values) = &mut day_of_week {
            if values.remove(&7) {
                values.insert(0);
            }
        }
        Ok(CompiledSchedule {
            second: FieldMatcher::parse(second.0, second.1)?,
            minute: FieldMatcher::parse(minute.0, minute.1)?,
            hour: FieldMatcher::parse(hour.0, hour.1)?,
            day_of_month: FieldMatcher::parse(day_of_month.0, day_of_month.1)?,
            month: FieldMatcher::parse(month.0, month.1)?,
            day_of_week,
            year: FieldMatcher::parse(year.0, year.1)?,
        })
    }
}

fn is_wildcard_spec(spec: Option<&str>) -> bool {
    spec.map_or(true, |s| {
        let s = s.trim();
        s.is_empty() || s == "*"
    })
}

/// A parsed schedule field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FieldMatcher {
    /// Matches every value.
    Any,
    /// Matches exactly the listed values.
    Set(BTreeSet<u32>),
}

impl FieldMatcher {
    /// Parses one field specification for `unit`.
    ///
    /// # Errors
    ///
    /// Returns a [`CronError`] for non-numeric tokens, reversed ranges and
    /// values outside the unit's domain.
    pub fn parse(unit: CronUnit, spec: Option<&str>) -> Result<Self, CronError> {
        if is_wildcard_spec(spec) {
            return Ok(Self::Any);
        }
        let spec = spec.unwrap_or_default();
        let (min, max) = unit.bounds();
        let mut values = BTreeSet::new();

        for token in spec.split(',').map(str::trim) {
            let invalid = || CronError::InvalidToken {
                unit,
                token: token.to_string(),
            };
            let (start, end) = match token.split_once('-') {
                Some((a, b)) => (
                    a.trim().parse::<u32>().map_err(|_| invalid())?,
                    b.trim().parse::<u32>().map_err(|_| invalid())?,
                ),
                None => {
                    let v = token.parse::<u32>().map_err(|_| invalid())?;
                    (v, v)
                }
            };
            if start > end {
                return Err(CronError::ReversedRange {
                    unit,
                    token: token.to_string(),
                });
            }
            for value in [start, end] {
                if value < min || value > max {
                    return Err(CronError::OutOfRange {
                        unit,
                        value,
                        min,
                        max,
                    });
                }
            }
            values.extend(start..=end);
        }

        Ok(Self::Set(values))
    }

    #[must_use]
    pub fn matches(&self, value: u32) -> bool {
        match self {
            Self::Any => true,
            Self::Set(values) => values.contains(&value),
        }
    }

    /// Smallest accepted value `>= from`, if any, within `..=max`.
    #[must_use]
    pub fn next_from(&self, from: u32, max: u32) -> Option<u32> {
        match self {
            Self::Any => (from <= max).then_some(from),
            Self::Set(values) => values.range(from..=max).next().copied(),
        }
    }
}

/// A schedule whose fields have been parsed and validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompiledSchedule {
    pub second: FieldMatcher,
    pub minute: FieldMatcher,
    pub hour: FieldMatcher,
    pub day_of_month: FieldMatcher,
    pub month: FieldMatcher,
    /// Sunday is normalised to 0.
    pub day_of_week: FieldMatcher,
    pub year: FieldMatcher,
}
