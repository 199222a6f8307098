use chrono::{NaiveDate, NaiveDateTime};
use zbus::interface;

use rollcall_core::schedule::{parse_days, parse_time};
use rollcall_core::{AttendanceError, ClassSchedule, LocatorError, RecognizerError};

use crate::config::Config;
use crate::engine::{EngineError, EngineHandle};

pub const BUS_NAME: &str = "org.rollcall.Attendance1";
pub const OBJECT_PATH: &str = "/org/rollcall/Attendance1";

/// D-Bus interface for the Rollcall attendance daemon.
///
/// Bus name: org.rollcall.Attendance1
/// Object path: /org/rollcall/Attendance1
pub struct RollcallService {
    engine: EngineHandle,
    config: Config,
}

impl RollcallService {
    pub fn new(engine: EngineHandle, config: Config) -> Self {
        Self { engine, config }
    }
}

/// Map engine failures onto D-Bus errors: caller mistakes become
/// `InvalidArgs`, everything else `Failed`.
fn to_fdo(e: EngineError) -> zbus::fdo::Error {
    use AttendanceError as A;
    let invalid = matches!(
        &e,
        EngineError::InvalidImage(_)
            | EngineError::Attendance(
                A::UnknownClass(_)
                    | A::UnknownStudent(_)
                    | A::ClassNotEmpty { .. }
                    | A::InvalidDateRange { .. }
                    | A::NotInRoster { .. }
                    | A::InvalidImage(_)
                    | A::InvalidEnrollment(_)
                    | A::Schedule(_)
                    | A::Locator(LocatorError::NoFaceDetected | LocatorError::AmbiguousFace { .. })
            )
    );
    match e {
        EngineError::Attendance(A::Recognizer(RecognizerError::ModelNotTrained)) => {
            zbus::fdo::Error::Failed("no students enrolled in this class yet".into())
        }
        e if invalid => zbus::fdo::Error::InvalidArgs(e.to_string()),
        e => zbus::fdo::Error::Failed(e.to_string()),
    }
}

fn to_json<T: serde::Serialize>(value: &T) -> zbus::fdo::Result<String> {
    serde_json::to_string(value).map_err(|e| zbus::fdo::Error::Failed(e.to_string()))
}

fn now() -> NaiveDateTime {
    chrono::Local::now().naive_local()
}

/// Empty means now; otherwise ISO-8601 local time with `T` or a space.
fn parse_timestamp(s: &str) -> zbus::fdo::Result<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(now());
    }
    ["%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M", "%Y-%m-%d %H:%M"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .ok_or_else(|| zbus::fdo::Error::InvalidArgs(format!("invalid timestamp {s:?}")))
}

/// Empty means today.
fn parse_date(s: &str) -> zbus::fdo::Result<NaiveDate> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(now().date());
    }
    NaiveDate::parse_from_str(s, "%Y-%m-%d")
        .map_err(|_| zbus::fdo::Error::InvalidArgs(format!("invalid date {s:?}, expected YYYY-MM-DD")))
}

/// Empty means `None`, i.e. every class.
fn class_filter(class_id: &str) -> Option<String> {
    let class_id = class_id.trim();
    (!class_id.is_empty()).then(|| class_id.to_string())
}

/// Days covered by a report when `from` is left empty.
const DEFAULT_REPORT_DAYS: i64 = 7;

/// Empty `to` means today; empty `from` means the week ending at `to`.
fn parse_range(from: &str, to: &str) -> zbus::fdo::Result<(NaiveDate, NaiveDate)> {
    let to = parse_date(to)?;
    let from = if from.trim().is_empty() {
        to - chrono::Duration::days(DEFAULT_REPORT_DAYS - 1)
    } else {
        parse_date(from)?
    };
    Ok((from, to))
}

#[interface(name = "org.rollcall.Attendance1")]
impl RollcallService {
    /// Enroll (or re-enroll) a student from one encoded photo.
    ///
    /// Returns the student profile as JSON.
    async fn enroll(
        &self,
        roll_number: &str,
        name: &str,
        class_id: &str,
        image: Vec<u8>,
    ) -> zbus::fdo::Result<String> {
        tracing::info!(roll_number, class_id, bytes = image.len(), "enroll requested");
        let profile = self
            .engine
            .enroll(roll_number.into(), name.into(), class_id.into(), image)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, roll_number, "enroll failed");
                to_fdo(e)
            })?;
        to_json(&profile)
    }

    /// Submit a group photo for a class. `timestamp` empty means now.
    async fn submit_attendance(
        &self,
        class_id: &str,
        image: Vec<u8>,
        timestamp: &str,
    ) -> zbus::fdo::Result<String> {
        let at = parse_timestamp(timestamp)?;
        tracing::info!(class_id, %at, bytes = image.len(), "attendance submitted");
        let outcome = self
            .engine
            .submit(class_id.into(), image, at)
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, class_id, "submission failed");
                to_fdo(e)
            })?;
        to_json(&outcome)
    }

    /// Manually mark a student present. `date` empty means today.
    async fn mark_manual(
        &self,
        student_id: &str,
        class_id: &str,
        date: &str,
    ) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let outcome = self
            .engine
            .mark_manual(student_id.into(), class_id.into(), date)
            .await
            .map_err(to_fdo)?;
        to_json(&outcome)
    }

    async fn remove_student(&self, student_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(student_id, "remove_student requested");
        self.engine
            .remove_student(student_id.into())
            .await
            .map_err(to_fdo)
    }

    /// Create or replace a class schedule.
    async fn define_class(
        &self,
        class_id: &str,
        name: &str,
        days: &str,
        start: &str,
        end: &str,
    ) -> zbus::fdo::Result<()> {
        let invalid = |e: rollcall_core::ScheduleError| zbus::fdo::Error::InvalidArgs(e.to_string());
        let schedule = ClassSchedule::new(
            class_id,
            name,
            parse_days(days).map_err(invalid)?,
            parse_time(start).map_err(invalid)?,
            parse_time(end).map_err(invalid)?,
        )
        .map_err(invalid)?;
        self.engine.define_class(schedule).await.map_err(to_fdo)
    }

    /// Delete a class that has no enrolled students. Returns whether it existed.
    async fn delete_class(&self, class_id: &str) -> zbus::fdo::Result<bool> {
        tracing::info!(class_id, "delete_class requested");
        self.engine
            .delete_class(class_id.into())
            .await
            .map_err(to_fdo)
    }

    /// Student profiles as JSON. `class_id` empty lists every student.
    async fn list_students(&self, class_id: &str) -> zbus::fdo::Result<String> {
        let students = self
            .engine
            .students(class_filter(class_id))
            .await
            .map_err(to_fdo)?;
        to_json(&students)
    }

    /// Attendance records between two dates (inclusive) as JSON.
    /// `class_id` empty covers every class.
    async fn attendance_report(
        &self,
        class_id: &str,
        from: &str,
        to: &str,
    ) -> zbus::fdo::Result<String> {
        let (from, to) = parse_range(from, to)?;
        let report = self
            .engine
            .attendance_report(class_filter(class_id), from, to)
            .await
            .map_err(to_fdo)?;
        to_json(&report)
    }

    /// All classes as JSON, each with an `active` flag for the current time.
    async fn list_classes(&self) -> zbus::fdo::Result<String> {
        let classes = self.engine.classes(now()).await.map_err(to_fdo)?;
        to_json(&classes)
    }

    async fn daily_summary(&self, class_id: &str, date: &str) -> zbus::fdo::Result<String> {
        let date = parse_date(date)?;
        let summary = self
            .engine
            .daily_summary(class_id.into(), date)
            .await
            .map_err(to_fdo)?;
        to_json(&summary)
    }

    /// Return daemon status information.
    async fn status(&self) -> zbus::fdo::Result<String> {
        let settings = self.engine.settings();
        Ok(serde_json::json!({
            "version": env!("CARGO_PKG_VERSION"),
            "locator": self.engine.locator_name(),
            "confidence_threshold": settings.confidence_threshold,
            "late_after_mins": settings.late_after.num_minutes(),
            "duplicate_face_threshold": settings.duplicate_face_threshold,
            "db_path": self.config.db_path.display().to_string(),
            "bus": if self.config.session_bus { "session" } else { "system" },
        })
        .to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_formats() {
        let expected = NaiveDate::from_ymd_opt(2024, 6, 5)
            .unwrap()
            .and_hms_opt(9, 5, 0)
            .unwrap();
        assert_eq!(parse_timestamp("2024-06-05T09:05:00").unwrap(), expected);
        assert_eq!(parse_timestamp("2024-06-05 09:05").unwrap(), expected);
        assert!(parse_timestamp("yesterday").is_err());
    }

    #[test]
    fn test_parse_date() {
        assert_eq!(
            parse_date("2024-06-05").unwrap(),
            NaiveDate::from_ymd_opt(2024, 6, 5).unwrap()
        );
        assert!(parse_date("05/06/2024").is_err());
    }

    #[test]
    fn test_parse_range_defaults_to_a_week() {
        let (from, to) = parse_range("", "2024-06-05").unwrap();
        assert_eq!(to, NaiveDate::from_ymd_opt(2024, 6, 5).unwrap());
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 5, 30).unwrap());
        let (from, _) = parse_range("2024-06-01", "2024-06-05").unwrap();
        assert_eq!(from, NaiveDate::from_ymd_opt(2024, 6, 1).unwrap());
        assert!(parse_range("June", "").is_err());
    }

    #[test]
    fn test_class_filter() {
        assert_eq!(class_filter("  "), None);
        assert_eq!(class_filter(" math "), Some("math".to_string()));
    }

    #[test]
    fn test_error_mapping() {
        let e = to_fdo(EngineError::Attendance(AttendanceError::UnknownClass("x".into())));
        assert!(matches!(e, zbus::fdo::Error::InvalidArgs(_)));
        let e = to_fdo(EngineError::Attendance(AttendanceError::Recognizer(
            RecognizerError::ModelNotTrained,
        )));
        assert!(matches!(e, zbus::fdo::Error::Failed(_)));
        let e = to_fdo(EngineError::Attendance(AttendanceError::ClassNotEmpty {
            class_id: "math".into(),
            students: 3,
        }));
        assert!(matches!(e, zbus::fdo::Error::InvalidArgs(_)));
        let e = to_fdo(EngineError::TaskFailed("panic".into()));
        assert!(matches!(e, zbus::fdo::Error::Failed(_)));
    }
}
