//! Next-occurrence calculation for interval and calendar schedules.
//!
//! The calendar search walks from the coarsest unit (year) to the finest
//! (second). Whenever a unit does not match, the cursor jumps to the next
//! accepted value of that unit with every finer unit reset to its minimum,
//! carrying into the coarser unit when the current one is exhausted. The
//! search starts one second after `last_run`, so the result is always
//! strictly later even when `last_run` itself matches every field.

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};

use crate::schedule::{CompiledSchedule, CronSchedule};

/// How many years past `last_run` the calendar search looks before giving up.
///
/// 28 years is one full cycle of weekdays over leap years, so any satisfiable
/// day-of-month / day-of-week / month combination is found within it.
pub const DEFAULT_SEARCH_YEARS: u32 = 28;

/// Earliest instant strictly after `last_run` matching `schedule`.
///
/// Returns `None` when the schedule is all wildcards (no recurrence), when it
/// is malformed, or when nothing matches within [`DEFAULT_SEARCH_YEARS`].
#[must_use]
pub fn calculate_next_run(schedule: &CronSchedule, last_run: DateTime<Utc>) -> Option<DateTime<Utc>> {
    calculate_next_run_within(schedule, last_run, DEFAULT_SEARCH_YEARS)
}

/// Like [`calculate_next_run`] with an explicit search horizon in years.
#[must_use]
pub fn calculate_next_run_within(
    schedule: &CronSchedule,
    last_run: DateTime<Utc>,
    horizon_years: u32,
) -> Option<DateTime<Utc>> {
    if schedule.is_wildcard() {
        return None;
    }
    match schedule.compile() {
        Ok(compiled) => compiled.next_after(last_run, horizon_years),
        Err(err) => {
            tracing::warn!(error = %err, "malformed schedule has no next run");
            None
        }
    }
}

/// `last_run + interval_secs`, or `None` on overflow.
#[must_use]
pub fn next_interval_run(last_run: DateTime<Utc>, interval_secs: u64) -> Option<DateTime<Utc>> {
    let secs = i64::try_from(interval_secs).ok()?;
    last_run.checked_add_signed(TimeDelta::try_seconds(secs)?)
}

impl CompiledSchedule {
    fn day_matches(&self, date: NaiveDate) -> bool {
        self.day_of_month.matches(date.day())
            && self
                .day_of_week
                .matches(date.weekday().num_days_from_sunday())
    }

    /// Earliest matching instant strictly after `last_run`.
    #[must_use]
    pub fn next_after(&self, last_run: DateTime<Utc>, horizon_years: u32) -> Option<DateTime<Utc>> {
        let mut cursor = last_run.naive_utc().with_nanosecond(0)? + TimeDelta::seconds(1);
        let limit = u32::try_from(cursor.year())
            .ok()?
            .saturating_add(horizon_years);

        loop {
            let year = u32::try_from(cursor.year()).ok()?;
            if year > limit {
                return None;
            }
            if !self.year.matches(year) {
                let next = self.year.next_from(year + 1, limit)?;
                cursor = start_of_month(next, 1)?;
                continue;
            }

            let month = cursor.month();
            if !self.month.matches(month) {
                cursor = match self.month.next_from(month + 1, 12) {
                    Some(next) => start_of_month(year, next)?,
                    None => start_of_month(year + 1, 1)?,
                };
                continue;
            }

            let date = cursor.date();
            if !self.day_matches(date) {
                cursor = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }

            let hour = cursor.hour();
            if !self.hour.matches(hour) {
                cursor = match self.hour.next_from(hour + 1, 23) {
                    Some(next) => date.and_hms_opt(next, 0, 0)?,
                    None => date.succ_opt()?.and_hms_opt(0, 0, 0)?,
                };
                continue;
            }

            let minute = cursor.minute();
            if !self.minute.matches(minute) {
                cursor = match self.minute.next_from(minute + 1, 59) {
                    Some(next) => date.and_hms_opt(hour, next, 0)?,
                    None => date.and_hms_opt(hour, 0, 0)? + TimeDelta::hours(1),
                };
                continue;
            }

            let second = cursor.second();
            if !self.second.matches(second) {
                cursor = match self.second.next_from(second + 1, 59) {
                    Some(next) => date.and_hms_opt(hour, minute, next)?,
                    None => date.and_hms_opt(hour, minute, 0)? + TimeDelta::minutes(1),
                };
                continue;
            }

            return Some(cursor.and_utc());
        }
    }
}

fn start_of_month(year: u32, month: u32) -> Option<NaiveDateTime> {
    NaiveDate::from_ymd_opt(i32::try_from(year).ok()?, month, 1)?.and_hms_opt(0, 0, 0)
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use proptest::prelude::*;

    use super::*;

    fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, mo, d, h, mi, s).unwrap()
    }

    fn reference() -> DateTime<Utc> {
        at(2024, 9, 26, 10, 0, 0)
    }

    #[test]
    fn empty_schedule_has_no_next_run() {
        assert_eq!(calculate_next_run(&CronSchedule::new(), reference()), None);
    }

    #[test]
    fn all_blank_fields_have_no_next_run() {
        let schedule = CronSchedule {
            second: Some(String::new()),
            minute: None,
            hour: Some(String::new()),
            day_of_month: None,
            month: Some("*".to_string()),
            day_of_week: Some(String::new()),
            year: None,
        };
        assert_eq!(calculate_next_run(&schedule, reference()), None);
    }

    #[test]
    fn matching_second_still_advances_strictly() {
        let schedule = CronSchedule::new().second("0,30");
        assert_eq!(
            calculate_next_run(&schedule, reference()),
            Some(at(2024, 9, 26, 10, 0, 30))
        );
    }

    #[test]
    fn month_and_weekday_roll_into_next_year() {
        let schedule = CronSchedule::new()
            .month("1,4")
            .day_of_week("1")
            .year("*")
            .hour("10")
            .minute("5")
            .second("0");
        assert_eq!(
            calculate_next_run(&schedule, reference()),
            Some(at(2025, 1, 6, 10, 5, 0))
        );
    }

    #[test]
    fn day_of_month_resets_lower_units() {
        let schedule = CronSchedule::new().day_of_month("3");
        assert_eq!(
            calculate_next_run(&schedule, reference()),
            Some(at(2024, 10, 3, 0, 0, 0))
        );
    }

    #[test]
    fn month_with_weekday_range() {
        let schedule = CronSchedule::new().month("12").day_of_week("1-5");
        assert_eq!(
            calculate_next_run(&schedule, reference()),
            Some(at(2024, 12, 2, 0, 0, 0))
        );
    }

    #[test]
    fn day_fields_combine_with_and() {
        // Friday the 13th.
        let schedule = CronSchedule::new().day_of_month("13").day_of_week("5");
        assert_eq!(
            calculate_next_run(&schedule, reference()),
            Some(at(2024, 12, 13, 0, 0, 0))
        );
    }

    #[test]
    fn minute_overflow_carries_into_next_hour() {
        let schedule = CronSchedule::new().minute("0-10").second("0");
        assert_eq!(
            calculate_next_run(&schedule, at(2024, 9, 26, 10, 10, 0)),
            Some(at(2024, 9, 26, 11, 0, 0))
        );
    }

    #[test]
    fn hour_overflow_carries_across_year_end() {
        let schedule = CronSchedule::new().hour("6").minute("0").second("0");
        assert_eq!(
            calculate_next_run(&schedule, at(2024, 12, 31, 7, 0, 0)),
            Some(at(2025, 1, 1, 6, 0, 0))
        );
    }

    #[test]
    fn sub_second_last_run_still_lands_on_whole_seconds() {
        let last = reference() + TimeDelta::milliseconds(400);
        let schedule = CronSchedule::new().second("0,30");
        assert_eq!(
            calculate_next_run(&schedule, last),
            Some(at(2024, 9, 26, 10, 0, 30))
        );
    }

    #[test]
    fn leap_day_is_found() {
        let schedule = CronSchedule::new().month("2").day_of_month("29");
        assert_eq!(
            calculate_next_run(&schedule, reference()),
            Some(at(2028, 2, 29, 0, 0, 0))
        );
    }

    #[test]
    fn past_year_never_matches() {
        let schedule = CronSchedule::new().year("2020-2023");
        assert_eq!(calculate_next_run(&schedule, reference()), None);
    }

    #[test]
    fn year_beyond_horizon_fails_closed() {
        let schedule = CronSchedule::new().year("2090");
        assert_eq!(calculate_next_run(&schedule, reference()), None);
        assert_eq!(
            calculate_next_run_within(&schedule, reference(), 100),
            Some(at(2090, 1, 1, 0, 0, 0))
        );
    }

    #[test]
    fn impossible_date_fails_closed() {
        let schedule = CronSchedule::new().month("2").day_of_month("30");
        assert_eq!(calculate_next_run(&schedule, reference()), None);
    }

    #[test]
    fn malformed_schedule_fails_closed() {
        let schedule = CronSchedule::new().minute("every");
        assert_eq!(calculate_next_run(&schedule, reference()), None);
    }

    #[test]
    fn interval_adds_exact_seconds() {
        assert_eq!(
            next_interval_run(reference(), 90),
            Some(at(2024, 9, 26, 10, 1, 30))
        );
        assert_eq!(next_interval_run(reference(), 0), Some(reference()));
        assert_eq!(next_interval_run(reference(), u64::MAX), None);
    }

    fn field() -> impl Strategy<Value = Option<String>> {
        prop_oneof![
            Just(None),
            Just(Some("*".to_string())),
            (0u32..5).prop_map(|v| Some(v.to_string())),
            (0u32..3, 3u32..6).prop_map(|(a, b)| Some(format!("{a}-{b}"))),
        ]
    }

    proptest! {
        #[test]
        fn next_run_is_strictly_later_and_matches(
            second in field(),
            minute in field(),
            hour in field(),
            day_of_week in field(),
            offset in 0i64..400_000_000,
        ) {
            let schedule = CronSchedule {
                second,
                minute,
                hour,
                day_of_month: None,
                month: None,
                day_of_week,
                year: None,
            };
            let last = at(2020, 1, 1, 0, 0, 0) + TimeDelta::seconds(offset);
            let next = calculate_next_run(&schedule, last);

            if schedule.is_wildcard() {
                prop_assert!(next.is_none());
            } else {
                let next = next.expect("every generated schedule is satisfiable");
                prop_assert!(next > last);
                let compiled = schedule.compile().unwrap();
                prop_assert!(compiled.second.matches(next.second()));
                prop_assert!(compiled.minute.matches(next.minute()));
                prop_assert!(compiled.hour.matches(next.hour()));
                prop_assert!(compiled
                    .day_of_week
                    .matches(next.weekday().num_days_from_sunday()));
                let again = calculate_next_run(&schedule, next - TimeDelta::seconds(1));
                prop_assert_eq!(again, Some(next));
            }
        }
    }
}
