//! Enrollment, re-enrollment and removal, each followed by a roster retrain.

use image::GrayImage;
use std::sync::Arc;

use crate::attendance::{AttendanceEngine, AttendanceError};
use crate::augment;
use crate::imgops;
use crate::locator::{crop_face, select_subject, FaceLocator, LocatorError};
use crate::recognizer::{RecognitionModel, RecognizerError};
use crate::store::RecordStore;
use crate::types::{AugmentedImageSet, StudentProfile};

/// A single-subject capture for a new or returning student.
#[derive(Debug, Clone)]
pub struct EnrollmentRequest {
    pub roll_number: String,
    pub name: String,
    pub class_id: String,
    pub image: GrayImage,
}

impl<S: RecordStore, L: FaceLocator> AttendanceEngine<S, L> {
    /// Enroll a student from one capture.
    ///
    /// An existing roll number keeps its student id; its image set is replaced
    /// and both the previous and the new class are retrained.
    pub fn enroll(&self, request: EnrollmentRequest) -> Result<StudentProfile, AttendanceError> {
        let roll_number = request.roll_number.trim();
        let name = request.name.trim();
        if roll_number.is_empty() || name.is_empty() {
            return Err(AttendanceError::InvalidEnrollment(
                "roll number and name are required".into(),
            ));
        }
        if request.image.width() == 0 || request.image.height() == 0 {
            return Err(AttendanceError::InvalidImage("empty image".into()));
        }
        self.require_class(&request.class_id)?;

        let boxes = self.locator.locate(&request.image)?;
        let subject = select_subject(&boxes)?;
        let crop = crop_face(&request.image, &subject).ok_or(LocatorError::NoFaceDetected)?;
        let face = imgops::canonical_face(&crop);

        let previous = self.store.profile_by_roll(roll_number)?;
        self.check_duplicate(&request.class_id, &face, previous.as_ref())?;

        let set = augment::augment(&face);
        let profile = StudentProfile {
            id: previous
                .as_ref()
                .map(|p| p.id.clone())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
            roll_number: roll_number.to_string(),
            name: name.to_string(),
            class_id: request.class_id.clone(),
            enrolled_at: chrono::Local::now().naive_local(),
        };
        self.store.put_image_set(&profile.id, &set)?;
        self.store.put_profile(&profile)?;
        tracing::info!(
            student_id = %profile.id,
            roll_number = %profile.roll_number,
            class_id = %profile.class_id,
            images = set.len(),
            reenrolled = previous.is_some(),
            "student enrolled"
        );

        self.retrain(&profile.class_id)?;
        if let Some(old) = previous.filter(|p| p.class_id != profile.class_id) {
            self.retrain(&old.class_id)?;
        }
        Ok(profile)
    }

    fn check_duplicate(
        &self,
        class_id: &str,
        face: &GrayImage,
        previous: Option<&StudentProfile>,
    ) -> Result<(), AttendanceError> {
        let Some(threshold) = self.settings.duplicate_face_threshold else {
            return Ok(());
        };
        let Some(model) = self.models.handle(class_id).snapshot() else {
            return Ok(());
        };
        let own_id = previous.map(|p| p.id.as_str());
        let prediction = model.predict_among(face, |id| Some(id) != own_id)?;
        match prediction {
            Some(p) if p.confidence >= threshold => {
                tracing::warn!(
                    class_id,
                    matched = %p.student_id,
                    confidence = p.confidence,
                    "enrollment refused: face already enrolled"
                );
                Err(AttendanceError::DuplicateFace {
                    student_id: p.student_id,
                    confidence: p.confidence,
                })
            }
            _ => Ok(()),
        }
    }

    /// Remove a student and retrain their class. Returns whether they existed.
    pub fn remove_student(&self, student_id: &str) -> Result<bool, AttendanceError> {
        let Some(profile) = self.store.profile(student_id)? else {
            return Ok(false);
        };
        self.store.remove_profile(student_id)?;
        tracing::info!(student_id, class_id = %profile.class_id, "student removed");
        self.retrain(&profile.class_id)?;
        Ok(true)
    }

    /// Rebuild and publish a class model from its current roster.
    ///
    /// An empty roster clears the model, so later submissions fail with
    /// `ModelNotTrained`. Returns the published model, if any.
    pub fn retrain(
        &self,
        class_id: &str,
    ) -> Result<Option<Arc<RecognitionModel>>, AttendanceError> {
        let handle = self.models.handle(class_id);
        let _guard = handle.retrain_guard();

        let mut sets: Vec<(String, AugmentedImageSet)> = Vec::new();
        for student in self.store.roster(class_id)? {
            if let Some(set) = self.store.image_set(&student.id)? {
                sets.push((student.id, set));
            }
        }

        match RecognitionModel::train(sets.iter().map(|(id, set)| (id.as_str(), set.images()))) {
            Ok(model) => {
                self.store.put_model(class_id, &model)?;
                Ok(Some(handle.publish(model)))
            }
            Err(RecognizerError::EmptyRoster) => {
                self.store.remove_model(class_id)?;
                handle.clear();
                tracing::info!(class_id, "roster empty, model cleared");
                Ok(None)
            }
            Err(e) => Err(e.into()),
        }
    }
}
