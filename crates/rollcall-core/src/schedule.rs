//! Class schedules and the session gate.

use chrono::{Datelike, Duration, NaiveDateTime, NaiveTime, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::{ClassId, Punctuality};

#[derive(Error, Debug, PartialEq)]
pub enum ScheduleError {
    #[error("class start {start} must be before end {end}")]
    InvalidWindow { start: NaiveTime, end: NaiveTime },
    #[error("classes cannot meet on Sunday")]
    SundayNotAllowed,
    #[error("class must meet on at least one weekday")]
    NoWeekdays,
    #[error("unknown weekday: {0}")]
    UnknownWeekday(String),
    #[error("invalid time {0:?}, expected HH:MM or HH:MM:SS")]
    InvalidTime(String),
}

/// A recurring weekly class session, in local wall-clock time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassSchedule {
    pub class_id: ClassId,
    pub name: String,
    pub days: Vec<Weekday>,
    pub start: NaiveTime,
    pub end: NaiveTime,
}

impl ClassSchedule {
    /// Build a validated schedule. Duplicate weekdays are collapsed.
    pub fn new(
        class_id: impl Into<ClassId>,
        name: impl Into<String>,
        days: impl IntoIterator<Item = Weekday>,
        start: NaiveTime,
        end: NaiveTime,
    ) -> Result<Self, ScheduleError> {
        let mut days: Vec<Weekday> = days.into_iter().collect();
        days.sort_by_key(|d| d.num_days_from_monday());
        days.dedup();
        let schedule = Self {
            class_id: class_id.into(),
            name: name.into(),
            days,
            start,
            end,
        };
        schedule.validate()?;
        Ok(schedule)
    }

    pub fn validate(&self) -> Result<(), ScheduleError> {
        if self.start >= self.end {
            return Err(ScheduleError::InvalidWindow {
                start: self.start,
                end: self.end,
            });
        }
        if self.days.contains(&Weekday::Sun) {
            return Err(ScheduleError::SundayNotAllowed);
        }
        if self.days.is_empty() {
            return Err(ScheduleError::NoWeekdays);
        }
        Ok(())
    }

    /// Whether the session is open at `at`: never on Sunday, otherwise on a
    /// scheduled weekday within `[start, end)`.
    pub fn is_active_at(&self, at: NaiveDateTime) -> bool {
        let day = at.weekday();
        if day == Weekday::Sun {
            return false;
        }
        let t = at.time();
        self.days.contains(&day) && self.start <= t && t < self.end
    }

    /// Late iff `at` is more than `late_after` past the session start.
    pub fn punctuality(&self, at: NaiveDateTime, late_after: Duration) -> Punctuality {
        if at.time() - self.start > late_after {
            Punctuality::Late
        } else {
            Punctuality::OnTime
        }
    }
}

/// Classes whose session is open at `at`.
pub fn active_classes<'a>(
    schedules: &'a [ClassSchedule],
    at: NaiveDateTime,
) -> impl Iterator<Item = &'a ClassSchedule> + 'a {
    schedules.iter().filter(move |s| s.is_active_at(at))
}

/// Parse a comma- or space-separated weekday list (`"Mon,Wed,Fri"`,
/// `"monday tuesday"`).
pub fn parse_days(input: &str) -> Result<Vec<Weekday>, ScheduleError> {
    input
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<Weekday>()
                .map_err(|_| ScheduleError::UnknownWeekday(s.to_string()))
        })
        .collect()
}

pub fn parse_time(input: &str) -> Result<NaiveTime, ScheduleError> {
    let s = input.trim();
    NaiveTime::parse_from_str(s, "%H:%M:%S")
        .or_else(|_| NaiveTime::parse_from_str(s, "%H:%M"))
        .map_err(|_| ScheduleError::InvalidTime(input.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn mwf() -> ClassSchedule {
        ClassSchedule::new(
            "cs101",
            "Intro",
            [Weekday::Mon, Weekday::Wed, Weekday::Fri],
            parse_time("09:00").unwrap(),
            parse_time("10:00").unwrap(),
        )
        .unwrap()
    }

    // 2024-06-05 is a Wednesday.
    fn at(day: u32, h: u32, m: u32) -> NaiveDateTime {
        NaiveDate::from_ymd_opt(2024, 6, day)
            .unwrap()
            .and_hms_opt(h, m, 0)
            .unwrap()
    }

    #[test]
    fn test_gate_wednesday_inside() {
        assert!(mwf().is_active_at(at(5, 9, 30)));
    }

    #[test]
    fn test_gate_tuesday_closed() {
        assert!(!mwf().is_active_at(at(4, 9, 30)));
    }

    #[test]
    fn test_gate_end_exclusive_start_inclusive() {
        assert!(!mwf().is_active_at(at(5, 10, 0)));
        assert!(mwf().is_active_at(at(5, 9, 0)));
        assert!(!mwf().is_active_at(at(5, 8, 59)));
    }

    #[test]
    fn test_gate_sunday_always_closed() {
        // Bypass validation to prove the gate itself refuses Sunday.
        let mut s = mwf();
        s.days = vec![
            Weekday::Mon,
            Weekday::Tue,
            Weekday::Wed,
            Weekday::Thu,
            Weekday::Fri,
            Weekday::Sat,
            Weekday::Sun,
        ];
        // 2024-06-09 is a Sunday.
        assert!(!s.is_active_at(at(9, 9, 30)));
        assert!(s.is_active_at(at(8, 9, 30)));
    }

    #[test]
    fn test_new_validates() {
        let nine = parse_time("09:00").unwrap();
        let ten = parse_time("10:00").unwrap();
        assert_eq!(
            ClassSchedule::new("c", "n", [Weekday::Mon], ten, nine).unwrap_err(),
            ScheduleError::InvalidWindow { start: ten, end: nine }
        );
        assert_eq!(
            ClassSchedule::new("c", "n", [Weekday::Sun], nine, ten).unwrap_err(),
            ScheduleError::SundayNotAllowed
        );
        assert_eq!(
            ClassSchedule::new("c", "n", [], nine, ten).unwrap_err(),
            ScheduleError::NoWeekdays
        );
        let s = ClassSchedule::new("c", "n", [Weekday::Fri, Weekday::Mon, Weekday::Fri], nine, ten).unwrap();
        assert_eq!(s.days, vec![Weekday::Mon, Weekday::Fri]);
    }

    #[test]
    fn test_punctuality() {
        let s = mwf();
        let grace = Duration::minutes(15);
        assert_eq!(s.punctuality(at(5, 9, 15), grace), Punctuality::OnTime);
        assert_eq!(s.punctuality(at(5, 9, 16), grace), Punctuality::Late);
    }

    #[test]
    fn test_active_classes() {
        let mut tue = mwf();
        tue.class_id = "tue".into();
        tue.days = vec![Weekday::Tue];
        let all = vec![mwf(), tue];
        let open: Vec<&str> = active_classes(&all, at(4, 9, 5)).map(|s| s.class_id.as_str()).collect();
        assert_eq!(open, vec!["tue"]);
        assert_eq!(active_classes(&all, at(9, 9, 5)).count(), 0);
    }

    #[test]
    fn test_parse_days() {
        assert_eq!(
            parse_days("Mon, wednesday Fri").unwrap(),
            vec![Weekday::Mon, Weekday::Wed, Weekday::Fri]
        );
        assert_eq!(
            parse_days("Mon,Funday").unwrap_err(),
            ScheduleError::UnknownWeekday("Funday".into())
        );
    }

    #[test]
    fn test_parse_time() {
        assert_eq!(parse_time("13:45:10").unwrap(), NaiveTime::from_hms_opt(13, 45, 10).unwrap());
        assert!(matches!(parse_time("25:00"), Err(ScheduleError::InvalidTime(_))));
    }
}
