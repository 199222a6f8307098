use chrono::{NaiveDate, NaiveDateTime};
use image::GrayImage;
use std::sync::Arc;
use thiserror::Error;

use rollcall_core::{
    AttendanceEngine, AttendanceError, AttendanceOutcome, AttendanceSubmission, ClassSchedule,
    DailySummary, EngineSettings, EnrollmentRequest, FaceLocator, MarkOutcome, ReportEntry,
    StudentProfile,
};

use crate::store::SqliteStore;

pub type Engine = AttendanceEngine<SqliteStore, Box<dyn FaceLocator>>;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error(transparent)]
    Attendance(#[from] AttendanceError),
    #[error("could not decode image: {0}")]
    InvalidImage(#[from] image::ImageError),
    #[error("engine task failed: {0}")]
    TaskFailed(String),
}

/// A class schedule together with whether it is in session right now.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ClassInfo {
    #[serde(flatten)]
    pub schedule: ClassSchedule,
    pub active: bool,
}

/// Clone-safe async handle to the attendance engine.
///
/// Every call runs on tokio's blocking pool; the engine itself is synchronous
/// and serializes whatever needs serializing.
#[derive(Clone)]
pub struct EngineHandle {
    engine: Arc<Engine>,
}

fn decode(bytes: &[u8]) -> Result<GrayImage, EngineError> {
    Ok(image::load_from_memory(bytes)?.to_luma8())
}

impl EngineHandle {
    pub fn new(engine: Engine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        self.engine.settings()
    }

    pub fn locator_name(&self) -> &'static str {
        self.engine.locator().name()
    }

    async fn run<T, F>(&self, f: F) -> Result<T, EngineError>
    where
        T: Send + 'static,
        F: FnOnce(&Engine) -> Result<T, EngineError> + Send + 'static,
    {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || f(&engine))
            .await
            .map_err(|e| EngineError::TaskFailed(e.to_string()))?
    }

    pub async fn enroll(
        &self,
        roll_number: String,
        name: String,
        class_id: String,
        image: Vec<u8>,
    ) -> Result<StudentProfile, EngineError> {
        self.run(move |engine| {
            let image = decode(&image)?;
            Ok(engine.enroll(EnrollmentRequest {
                roll_number,
                name,
                class_id,
                image,
            })?)
        })
        .await
    }

    pub async fn submit(
        &self,
        class_id: String,
        image: Vec<u8>,
        timestamp: NaiveDateTime,
    ) -> Result<AttendanceOutcome, EngineError> {
        self.run(move |engine| {
            let image = decode(&image)?;
            Ok(engine.submit(&AttendanceSubmission {
                class_id,
                image,
                timestamp,
            })?)
        })
        .await
    }

    pub async fn mark_manual(
        &self,
        student_id: String,
        class_id: String,
        date: NaiveDate,
    ) -> Result<MarkOutcome, EngineError> {
        self.run(move |engine| Ok(engine.mark_manual(&student_id, &class_id, date)?))
            .await
    }

    pub async fn remove_student(&self, student_id: String) -> Result<bool, EngineError> {
        self.run(move |engine| Ok(engine.remove_student(&student_id)?))
            .await
    }

    pub async fn define_class(&self, schedule: ClassSchedule) -> Result<(), EngineError> {
        self.run(move |engine| Ok(engine.define_class(schedule)?)).await
    }

    pub async fn delete_class(&self, class_id: String) -> Result<bool, EngineError> {
        self.run(move |engine| Ok(engine.delete_class(&class_id)?))
            .await
    }

    pub async fn students(&self, class_id: Option<String>) -> Result<Vec<StudentProfile>, EngineError> {
        self.run(move |engine| Ok(engine.students(class_id.as_deref())?))
            .await
    }

    pub async fn attendance_report(
        &self,
        class_id: Option<String>,
        from: NaiveDate,
        to: NaiveDate,
    ) -> Result<Vec<ReportEntry>, EngineError> {
        self.run(move |engine| Ok(engine.attendance_report(class_id.as_deref(), from, to)?))
            .await
    }

    pub async fn classes(&self, at: NaiveDateTime) -> Result<Vec<ClassInfo>, EngineError> {
        self.run(move |engine| {
            Ok(engine
                .classes()?
                .into_iter()
                .map(|schedule| ClassInfo {
                    active: schedule.is_active_at(at),
                    schedule,
                })
                .collect())
        })
        .await
    }

    pub async fn daily_summary(
        &self,
        class_id: String,
        date: NaiveDate,
    ) -> Result<DailySummary, EngineError> {
        self.run(move |engine| Ok(engine.daily_summary(&class_id, date)?))
            .await
    }
}
