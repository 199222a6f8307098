//! rollcall-core: face-recognition attendance engine.
//!
//! One enrollment capture is expanded into a 100-image augmented set, every
//! class roster gets its own LBPH model, and group photos are turned into
//! attendance records only while the class is in session.

pub mod attendance;
pub mod augment;
pub mod detector;
pub mod enrollment;
pub mod imgops;
pub mod lbph;
pub mod locator;
pub mod recognizer;
pub mod schedule;
pub mod store;
pub mod types;

#[cfg(test)]
pub(crate) mod testutil;

pub use attendance::{
    AttendanceEngine, AttendanceError, AttendanceOutcome, AttendanceSubmission, DailySummary,
    EngineSettings, MarkOutcome, ReportEntry,
};
pub use detector::ScrfdLocator;
pub use enrollment::EnrollmentRequest;
pub use locator::{FaceLocator, LocatorError, WholeFrameLocator};
pub use recognizer::{ModelHandle, ModelRegistry, RecognitionModel, RecognizerError};
pub use schedule::{ClassSchedule, ScheduleError};
pub use store::{MemoryStore, RecordStore, StoreError};
pub use types::{
    AttendanceMethod, AttendanceRecord, AugmentedImageSet, BoundingBox, ClassId, Prediction,
    Punctuality, StudentId, StudentProfile, Verdict, VerdictStatus,
};

/// SCRFD model file name looked up inside the model directory.
pub const SCRFD_MODEL_FILE: &str = "det_10g.onnx";

/// Default directory holding the detector model.
pub fn default_model_dir() -> std::path::PathBuf {
    std::path::PathBuf::from("/usr/share/rollcall/models")
}
