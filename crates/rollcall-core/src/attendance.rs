//! Attendance decision engine.
//!
//! A submission moves through Gate → Detect → Classify → Decide → Commit.
//! Gate and Detect may end it early; Commit is serialized per class so the
//! one-record-per-(student, class, date) rule holds under concurrent
//! submissions.

use chrono::{Duration, NaiveDate, NaiveDateTime};
use image::GrayImage;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error;

use crate::imgops;
use crate::locator::{crop_face, FaceLocator, LocatorError};
use crate::recognizer::{ModelRegistry, RecognizerError, DEFAULT_CONFIDENCE_THRESHOLD};
use crate::schedule::{self, ClassSchedule, ScheduleError};
use crate::store::{RecordStore, StoreError};
use crate::types::{
    AttendanceMethod, AttendanceRecord, BoundingBox, ClassId, Prediction, Punctuality, StudentId,
    StudentProfile, Verdict, VerdictStatus,
};

/// Default grace period after class start before an arrival counts as late.
pub const DEFAULT_LATE_AFTER_MINS: i64 = 15;

#[derive(Error, Debug)]
pub enum AttendanceError {
    #[error("unknown class: {0}")]
    UnknownClass(ClassId),
    #[error("unknown student: {0}")]
    UnknownStudent(StudentId),
    #[error("class {class_id} still has {students} enrolled students")]
    ClassNotEmpty { class_id: ClassId, students: usize },
    #[error("invalid date range: {from} is after {to}")]
    InvalidDateRange { from: NaiveDate, to: NaiveDate },
    #[error("student {student_id} is not in the roster of class {class_id}")]
    NotInRoster {
        student_id: StudentId,
        class_id: ClassId,
    },
    #[error("class {class_id} is not in session at {at}")]
    ScheduleClosed { class_id: ClassId, at: NaiveDateTime },
    #[error("face is already enrolled as student {student_id} ({confidence:.1}% match)")]
    DuplicateFace {
        student_id: StudentId,
        confidence: f32,
    },
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("invalid enrollment: {0}")]
    InvalidEnrollment(String),
    #[error(transparent)]
    Locator(#[from] LocatorError),
    #[error(transparent)]
    Recognizer(#[from] RecognizerError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Policy knobs for the engine. Mechanism lives in the recognizer and gate.
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Minimum confidence (percent) for a verdict to auto-commit.
    pub confidence_threshold: f32,
    pub late_after: Duration,
    /// When set, enrollment refuses a face that already matches another
    /// student of the class at or above this confidence.
    pub duplicate_face_threshold: Option<f32>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            late_after: Duration::minutes(DEFAULT_LATE_AFTER_MINS),
            duplicate_face_threshold: None,
        }
    }
}

/// A group photo submitted against one class.
#[derive(Debug, Clone)]
pub struct AttendanceSubmission {
    pub class_id: ClassId,
    pub image: GrayImage,
    pub timestamp: NaiveDateTime,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AttendanceOutcome {
    pub verdicts: Vec<Verdict>,
    /// Records written by this submission.
    pub committed: Vec<AttendanceRecord>,
    /// Present students that already had a record for the day.
    pub already_recorded: Vec<StudentId>,
}

/// Result of a manual mark. An existing record is not an error.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "record", rename_all = "snake_case")]
pub enum MarkOutcome {
    Recorded(AttendanceRecord),
    AlreadyRecorded(AttendanceRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DailySummary {
    pub class_id: ClassId,
    pub date: NaiveDate,
    pub roster: usize,
    pub on_time: usize,
    pub late: usize,
    pub manual: usize,
    pub absent: Vec<StudentId>,
    /// Fraction of the roster with a record, 0.0 for an empty roster.
    pub attendance_rate: f32,
}

/// One attendance record joined with the student's identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ReportEntry {
    #[serde(flatten)]
    pub record: AttendanceRecord,
    /// `None` once the student has been removed.
    pub name: Option<String>,
    pub roll_number: Option<String>,
}

pub struct AttendanceEngine<S, L> {
    pub(crate) store: S,
    pub(crate) locator: L,
    pub(crate) models: ModelRegistry,
    pub(crate) settings: EngineSettings,
    commit_locks: Mutex<HashMap<ClassId, Arc<Mutex<()>>>>,
}

pub(crate) fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

impl<S: RecordStore, L: FaceLocator> AttendanceEngine<S, L> {
    pub fn new(store: S, locator: L, settings: EngineSettings) -> Self {
        Self {
            store,
            locator,
            models: ModelRegistry::new(),
            settings,
            commit_locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn locator(&self) -> &L {
        &self.locator
    }

    pub fn models(&self) -> &ModelRegistry {
        &self.models
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.settings
    }

    fn class_lock(&self, class_id: &str) -> Arc<Mutex<()>> {
        lock(&self.commit_locks)
            .entry(class_id.to_string())
            .or_default()
            .clone()
    }

    pub(crate) fn require_class(&self, class_id: &str) -> Result<ClassSchedule, AttendanceError> {
        self.store
            .schedule(class_id)?
            .ok_or_else(|| AttendanceError::UnknownClass(class_id.to_string()))
    }

    /// Validate and persist a class schedule, replacing any previous one.
    pub fn define_class(&self, schedule: ClassSchedule) -> Result<(), AttendanceError> {
        schedule.validate()?;
        self.store.put_schedule(&schedule)?;
        tracing::info!(
            class_id = %schedule.class_id,
            days = ?schedule.days,
            start = %schedule.start,
            end = %schedule.end,
            "class defined"
        );
        Ok(())
    }

    pub fn classes(&self) -> Result<Vec<ClassSchedule>, AttendanceError> {
        Ok(self.store.schedules()?)
    }

    /// Delete an empty class together with its model. Attendance history is
    /// kept. Returns whether the class existed.
    pub fn delete_class(&self, class_id: &str) -> Result<bool, AttendanceError> {
        let handle = self.models.handle(class_id);
        let _guard = handle.retrain_guard();

        let students = self.store.roster(class_id)?.len();
        if students > 0 {
            return Err(AttendanceError::ClassNotEmpty {
                class_id: class_id.to_string(),
                students,
            });
        }
        let existed = self.store.remove_schedule(class_id)?;
        self.store.remove_model(class_id)?;
        handle.clear();
        if existed {
            tracing::info!(class_id, "class deleted");
        }
        Ok(existed)
    }

    /// Students of one class, or every student when `class_id` is `None`.
    pub fn students(&self, class_id: Option<&str>) -> Result<Vec<StudentProfile>, AttendanceError> {
        match class_id {
            Some(class_id) => {
                self.require_class(class_id)?;
                Ok(self.store.roster(class_id)?)
            }
            None => Ok(self.store.students()?),
        }
    }

    /// Committed records dated `from..=to`, optionally for one class.
    pub fn attendance_report(
        &self,
        class_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ReportEntry>, AttendanceError> {
        if from > to {
            return Err(AttendanceError::InvalidDateRange { from, to });
        }
        let profiles: HashMap<StudentId, StudentProfile> = self
            .store
            .students()?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        let entries: Vec<ReportEntry> = self
            .store
            .attendance_between(class_id, from, to)?
            .into_iter()
            .map(|record| {
                let profile = profiles.get(&record.student_id);
                ReportEntry {
                    name: profile.map(|p| p.name.clone()),
                    roll_number: profile.map(|p| p.roll_number.clone()),
                    record,
                }
            })
            .collect();
        tracing::debug!(class_id, %from, %to, records = entries.len(), "attendance report built");
        Ok(entries)
    }

    pub fn active_classes(&self, at: NaiveDateTime) -> Result<Vec<ClassSchedule>, AttendanceError> {
        let all = self.store.schedules()?;
        Ok(schedule::active_classes(&all, at).cloned().collect())
    }

    /// Publish every persisted model. Returns how many classes were restored.
    pub fn restore_models(&self) -> Result<usize, AttendanceError> {
        let mut restored = 0;
        for schedule in self.store.schedules()? {
            if let Some(model) = self.store.model(&schedule.class_id)? {
                tracing::info!(
                    class_id = %schedule.class_id,
                    students = model.student_count(),
                    trained_at = %model.trained_at(),
                    "restored recognition model"
                );
                self.models.handle(&schedule.class_id).publish(model);
                restored += 1;
            }
        }
        Ok(restored)
    }

    /// Run one group photo through the decision pipeline.
    pub fn submit(
        &self,
        submission: &AttendanceSubmission,
    ) -> Result<AttendanceOutcome, AttendanceError> {
        let class_id = submission.class_id.as_str();
        let at = submission.timestamp;

        // Gate
        let schedule = self.require_class(class_id)?;
        if !schedule.is_active_at(at) {
            tracing::info!(class_id, %at, "submission rejected: class not in session");
            return Err(AttendanceError::ScheduleClosed {
                class_id: class_id.to_string(),
                at,
            });
        }

        // Detect
        let faces = self.locator.locate(&submission.image)?;
        if faces.is_empty() {
            tracing::info!(class_id, "no faces in submission");
            return Ok(AttendanceOutcome::default());
        }

        // Classify
        let model = self
            .models
            .handle(class_id)
            .snapshot()
            .ok_or(RecognizerError::ModelNotTrained)?;
        let roster: HashSet<StudentId> = self
            .store
            .roster(class_id)?
            .into_iter()
            .map(|p| p.id)
            .collect();

        let predictions: Vec<(BoundingBox, Option<Prediction>)> = faces
            .par_iter()
            .map(|face| -> Result<_, RecognizerError> {
                let Some(crop) = crop_face(&submission.image, face) else {
                    return Ok((*face, None));
                };
                let canonical = imgops::canonical_face(&crop);
                let p = model.predict_among(&canonical, |id| roster.contains(id))?;
                Ok((*face, p))
            })
            .collect::<Result<_, _>>()?;

        // Decide
        let verdicts: Vec<Verdict> = predictions
            .into_iter()
            .filter_map(|(face, p)| p.map(|p| decide(p, face, self.settings.confidence_threshold)))
            .collect();

        // Commit
        let mut outcome = AttendanceOutcome {
            verdicts,
            ..Default::default()
        };
        let class_lock = self.class_lock(class_id);
        let _guard = lock(&class_lock);
        let date = at.date();
        for verdict in outcome.verdicts.iter().filter(|v| v.status == VerdictStatus::Present) {
            let seen = outcome.committed.iter().any(|r| r.student_id == verdict.student_id)
                || outcome.already_recorded.contains(&verdict.student_id);
            if seen || self.store.attendance(&verdict.student_id, class_id, date)?.is_some() {
                tracing::debug!(class_id, student_id = %verdict.student_id, "already recorded today");
                if !outcome.already_recorded.contains(&verdict.student_id) {
                    outcome.already_recorded.push(verdict.student_id.clone());
                }
                continue;
            }
            let record = AttendanceRecord {
                student_id: verdict.student_id.clone(),
                class_id: class_id.to_string(),
                date,
                timestamp: at,
                confidence: Some(verdict.confidence),
                method: AttendanceMethod::Auto,
                punctuality: Some(schedule.punctuality(at, self.settings.late_after)),
            };
            self.store.put_attendance(&record)?;
            tracing::info!(
                class_id,
                student_id = %record.student_id,
                confidence = verdict.confidence,
                late = record.punctuality == Some(Punctuality::Late),
                "attendance committed"
            );
            outcome.committed.push(record);
        }

        tracing::info!(
            class_id,
            faces = faces.len(),
            verdicts = outcome.verdicts.len(),
            committed = outcome.committed.len(),
            already_recorded = outcome.already_recorded.len(),
            "submission processed"
        );
        Ok(outcome)
    }

    /// Record a human decision that a student attended. Bypasses the
    /// classifier and the schedule gate but not the one-record-per-day rule.
    pub fn mark_manual(
        &self,
        student_id: &str,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<MarkOutcome, AttendanceError> {
        let schedule = self.require_class(class_id)?;
        let profile = self
            .store
            .profile(student_id)?
            .ok_or_else(|| AttendanceError::UnknownStudent(student_id.to_string()))?;
        if profile.class_id != class_id {
            return Err(AttendanceError::NotInRoster {
                student_id: student_id.to_string(),
                class_id: class_id.to_string(),
            });
        }

        let class_lock = self.class_lock(class_id);
        let _guard = lock(&class_lock);
        if let Some(existing) = self.store.attendance(student_id, class_id, date)? {
            tracing::info!(class_id, student_id, %date, "manual mark skipped: already recorded");
            return Ok(MarkOutcome::AlreadyRecorded(existing));
        }

        let now = chrono::Local::now().naive_local();
        let timestamp = if now.date() == date {
            now
        } else {
            date.and_time(schedule.start)
        };
        let record = AttendanceRecord {
            student_id: student_id.to_string(),
            class_id: class_id.to_string(),
            date,
            timestamp,
            confidence: None,
            method: AttendanceMethod::Manual,
            punctuality: None,
        };
        self.store.put_attendance(&record)?;
        tracing::info!(class_id, student_id, %date, "manual attendance recorded");
        Ok(MarkOutcome::Recorded(record))
    }

    pub fn daily_summary(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<DailySummary, AttendanceError> {
        self.require_class(class_id)?;
        let roster = self.store.roster(class_id)?;
        let records: HashMap<StudentId, AttendanceRecord> = self
            .store
            .attendance_for_class(class_id, date)?
            .into_iter()
            .map(|r| (r.student_id.clone(), r))
            .collect();

        let mut summary = DailySummary {
            class_id: class_id.to_string(),
            date,
            roster: roster.len(),
            on_time: 0,
            late: 0,
            manual: 0,
            absent: Vec::new(),
            attendance_rate: 0.0,
        };
        for student in &roster {
            match records.get(&student.id) {
                None => summary.absent.push(student.id.clone()),
                Some(r) => match (r.method, r.punctuality) {
                    (AttendanceMethod::Manual, _) => summary.manual += 1,
                    (AttendanceMethod::Auto, Some(Punctuality::Late)) => summary.late += 1,
                    (AttendanceMethod::Auto, _) => summary.on_time += 1,
                },
            }
        }
        if !roster.is_empty() {
            let present = roster.len() - summary.absent.len();
            summary.attendance_rate = present as f32 / roster.len() as f32;
        }
        Ok(summary)
    }
}

/// Apply the acceptance threshold to one prediction.
pub fn decide(prediction: Prediction, face: BoundingBox, threshold: f32) -> Verdict {
    let status = if prediction.confidence >= threshold {
        VerdictStatus::Present
    } else {
        VerdictStatus::Uncertain
    };
    Verdict {
        student_id: prediction.student_id,
        confidence: prediction.confidence,
        status,
        face,
    }
}
