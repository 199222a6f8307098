//! Storage contract for profiles, image sets, models, schedules and records.
//!
//! Key-value semantics: reads go by id, writes replace by id. The engine owns
//! every invariant; a backend only has to be durable and thread-safe.

use chrono::NaiveDate;
use std::collections::HashMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use thiserror::Error;

use crate::recognizer::RecognitionModel;
use crate::schedule::ClassSchedule;
use crate::types::{AttendanceRecord, AugmentedImageSet, ClassId, StudentId, StudentProfile};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("storage backend error: {0}")]
    Backend(String),
    #[error("corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

pub trait RecordStore: Send + Sync {
    fn schedule(&self, class_id: &str) -> Result<Option<ClassSchedule>, StoreError>;
    fn schedules(&self) -> Result<Vec<ClassSchedule>, StoreError>;
    fn put_schedule(&self, schedule: &ClassSchedule) -> Result<(), StoreError>;
    /// Returns whether the class existed.
    fn remove_schedule(&self, class_id: &str) -> Result<bool, StoreError>;

    fn profile(&self, student_id: &str) -> Result<Option<StudentProfile>, StoreError>;
    fn profile_by_roll(&self, roll_number: &str) -> Result<Option<StudentProfile>, StoreError>;
    /// Every profile assigned to `class_id`.
    fn roster(&self, class_id: &str) -> Result<Vec<StudentProfile>, StoreError>;
    /// Every profile, ordered by roll number.
    fn students(&self) -> Result<Vec<StudentProfile>, StoreError>;
    fn put_profile(&self, profile: &StudentProfile) -> Result<(), StoreError>;
    /// Delete a profile and its image set. Returns whether it existed.
    fn remove_profile(&self, student_id: &str) -> Result<bool, StoreError>;

    fn image_set(&self, student_id: &str) -> Result<Option<AugmentedImageSet>, StoreError>;
    fn put_image_set(&self, student_id: &str, set: &AugmentedImageSet) -> Result<(), StoreError>;

    fn model(&self, class_id: &str) -> Result<Option<RecognitionModel>, StoreError>;
    fn put_model(&self, class_id: &str, model: &RecognitionModel) -> Result<(), StoreError>;
    fn remove_model(&self, class_id: &str) -> Result<(), StoreError>;

    fn attendance(
        &self,
        student_id: &str,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError>;
    fn put_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError>;
    fn attendance_for_class(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;
    /// Records dated `from..=to`, optionally for one class, ordered by
    /// date, class and timestamp.
    fn attendance_between(
        &self,
        class_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError>;
}

/// Process-local store, used by tests and embedders without persistence.
#[derive(Default)]
pub struct MemoryStore {
    schedules: RwLock<HashMap<ClassId, ClassSchedule>>,
    profiles: RwLock<HashMap<StudentId, StudentProfile>>,
    image_sets: RwLock<HashMap<StudentId, AugmentedImageSet>>,
    models: RwLock<HashMap<ClassId, RecognitionModel>>,
    attendance: RwLock<HashMap<(StudentId, ClassId, NaiveDate), AttendanceRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn read<T>(lock: &RwLock<T>) -> RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

impl RecordStore for MemoryStore {
    fn schedule(&self, class_id: &str) -> Result<Option<ClassSchedule>, StoreError> {
        Ok(read(&self.schedules).get(class_id).cloned())
    }

    fn schedules(&self) -> Result<Vec<ClassSchedule>, StoreError> {
        let mut all: Vec<ClassSchedule> = read(&self.schedules).values().cloned().collect();
        all.sort_by(|a, b| a.class_id.cmp(&b.class_id));
        Ok(all)
    }

    fn put_schedule(&self, schedule: &ClassSchedule) -> Result<(), StoreError> {
        write(&self.schedules).insert(schedule.class_id.clone(), schedule.clone());
        Ok(())
    }

    fn remove_schedule(&self, class_id: &str) -> Result<bool, StoreError> {
        Ok(write(&self.schedules).remove(class_id).is_some())
    }

    fn profile(&self, student_id: &str) -> Result<Option<StudentProfile>, StoreError> {
        Ok(read(&self.profiles).get(student_id).cloned())
    }

    fn profile_by_roll(&self, roll_number: &str) -> Result<Option<StudentProfile>, StoreError> {
        Ok(read(&self.profiles)
            .values()
            .find(|p| p.roll_number == roll_number)
            .cloned())
    }

    fn roster(&self, class_id: &str) -> Result<Vec<StudentProfile>, StoreError> {
        let mut roster: Vec<StudentProfile> = read(&self.profiles)
            .values()
            .filter(|p| p.class_id == class_id)
            .cloned()
            .collect();
        roster.sort_by(|a, b| a.roll_number.cmp(&b.roll_number));
        Ok(roster)
    }

    fn students(&self) -> Result<Vec<StudentProfile>, StoreError> {
        let mut all: Vec<StudentProfile> = read(&self.profiles).values().cloned().collect();
        all.sort_by(|a, b| a.roll_number.cmp(&b.roll_number));
        Ok(all)
    }

    fn put_profile(&self, profile: &StudentProfile) -> Result<(), StoreError> {
        write(&self.profiles).insert(profile.id.clone(), profile.clone());
        Ok(())
    }

    fn remove_profile(&self, student_id: &str) -> Result<bool, StoreError> {
        write(&self.image_sets).remove(student_id);
        Ok(write(&self.profiles).remove(student_id).is_some())
    }

    fn image_set(&self, student_id: &str) -> Result<Option<AugmentedImageSet>, StoreError> {
        Ok(read(&self.image_sets).get(student_id).cloned())
    }

    fn put_image_set(&self, student_id: &str, set: &AugmentedImageSet) -> Result<(), StoreError> {
        write(&self.image_sets).insert(student_id.to_string(), set.clone());
        Ok(())
    }

    fn model(&self, class_id: &str) -> Result<Option<RecognitionModel>, StoreError> {
        Ok(read(&self.models).get(class_id).cloned())
    }

    fn put_model(&self, class_id: &str, model: &RecognitionModel) -> Result<(), StoreError> {
        write(&self.models).insert(class_id.to_string(), model.clone());
        Ok(())
    }

    fn remove_model(&self, class_id: &str) -> Result<(), StoreError> {
        write(&self.models).remove(class_id);
        Ok(())
    }

    fn attendance(
        &self,
        student_id: &str,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Option<AttendanceRecord>, StoreError> {
        let key = (student_id.to_string(), class_id.to_string(), date);
        Ok(read(&self.attendance).get(&key).cloned())
    }

    fn put_attendance(&self, record: &AttendanceRecord) -> Result<(), StoreError> {
        let key = (
            record.student_id.clone(),
            record.class_id.clone(),
            record.date,
        );
        write(&self.attendance).insert(key, record.clone());
        Ok(())
    }

    fn attendance_for_class(
        &self,
        class_id: &str,
        date: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut records: Vec<AttendanceRecord> = read(&self.attendance)
            .values()
            .filter(|r| r.class_id == class_id && r.date == date)
            .cloned()
            .collect();
        records.sort_by_key(|r| r.timestamp);
        Ok(records)
    }

    fn attendance_between(
        &self,
        class_id: Option<&str>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<AttendanceRecord>, StoreError> {
        let mut records: Vec<AttendanceRecord> = read(&self.attendance)
            .values()
            .filter(|r| (from..=to).contains(&r.date))
            .filter(|r| class_id.map_or(true, |c| r.class_id == c))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            (a.date, &a.class_id, a.timestamp).cmp(&(b.date, &b.class_id, b.timestamp))
        });
        Ok(records)
    }
}
