//! LBPH face recognizer with atomically published per-roster models.
//!
//! A [`RecognitionModel`] is an immutable value: training always builds a new
//! one, and a [`ModelHandle`] publishes it by swapping an `Arc`. Predictions
//! run against a snapshot, so a retrain never disturbs an in-flight prediction.

use chrono::NaiveDateTime;
use image::GrayImage;
use rayon::prelude::*;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use thiserror::Error;

use crate::imgops;
use crate::lbph::{self, DESCRIPTOR_LEN};
use crate::types::{ClassId, Prediction, StudentId};

/// Default acceptance boundary, in percent.
pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 80.0;

#[derive(Error, Debug, PartialEq)]
pub enum RecognizerError {
    #[error("no student in the roster has training images")]
    EmptyRoster,
    #[error("training image {index} of student {student_id} is {width}x{height}, expected 100x100 grayscale")]
    InconsistentImageShape {
        student_id: StudentId,
        index: usize,
        width: u32,
        height: u32,
    },
    #[error("query face is {width}x{height}, expected 100x100 grayscale")]
    InvalidQueryShape { width: u32, height: u32 },
    #[error("recognition model has not been trained")]
    ModelNotTrained,
    #[error("stored model is corrupt: {0}")]
    CorruptModel(String),
}

/// Chi-square distance at which confidence reaches 0%.
///
/// Unrelated 100x100 faces land around 15 to 25, so they stay well below the
/// default threshold; 80% corresponds to a distance of 4.8.
pub const DISTANCE_CEILING: f32 = 24.0;

/// Convert a chi-square descriptor distance into a confidence percentage.
pub fn confidence_from_distance(distance: f32) -> f32 {
    ((1.0 - distance / DISTANCE_CEILING) * 100.0).clamp(0.0, 100.0)
}

/// Trained per-roster state: one LBPH descriptor per training image.
#[derive(Debug, Clone)]
pub struct RecognitionModel {
    labels: Vec<StudentId>,
    /// Row-major, `labels.len() × DESCRIPTOR_LEN`.
    descriptors: Vec<f32>,
    trained_at: NaiveDateTime,
}

impl RecognitionModel {
    /// Build a model from every student's training images.
    ///
    /// Students with no images are skipped; if none remain the roster is empty.
    pub fn train<'a, I>(roster: I) -> Result<Self, RecognizerError>
    where
        I: IntoIterator<Item = (&'a str, &'a [GrayImage])>,
    {
        let mut samples: Vec<(&'a str, &'a GrayImage)> = Vec::new();
        for (student_id, images) in roster {
            for (index, img) in images.iter().enumerate() {
                if !imgops::is_canonical(img) {
                    return Err(RecognizerError::InconsistentImageShape {
                        student_id: student_id.to_string(),
                        index,
                        width: img.width(),
                        height: img.height(),
                    });
                }
                samples.push((student_id, img));
            }
        }
        if samples.is_empty() {
            return Err(RecognizerError::EmptyRoster);
        }

        let rows: Vec<Vec<f32>> = samples
            .par_iter()
            .map(|(_, img)| lbph::descriptor(img))
            .collect();
        let descriptors = rows.concat();
        let labels: Vec<StudentId> = samples.iter().map(|(id, _)| id.to_string()).collect();

        let model = Self {
            labels,
            descriptors,
            trained_at: chrono::Local::now().naive_local(),
        };
        tracing::info!(
            samples = model.labels.len(),
            students = model.student_count(),
            "recognition model trained"
        );
        Ok(model)
    }

    /// Reassemble a model from persisted parts.
    pub fn from_parts(
        labels: Vec<StudentId>,
        descriptors: Vec<f32>,
        trained_at: NaiveDateTime,
    ) -> Result<Self, RecognizerError> {
        if labels.is_empty() {
            return Err(RecognizerError::CorruptModel("no labels".into()));
        }
        if descriptors.len() != labels.len() * DESCRIPTOR_LEN {
            return Err(RecognizerError::CorruptModel(format!(
                "{} descriptor values for {} labels (expected {} each)",
                descriptors.len(),
                labels.len(),
                DESCRIPTOR_LEN
            )));
        }
        if descriptors.iter().any(|v| !v.is_finite()) {
            return Err(RecognizerError::CorruptModel("non-finite descriptor value".into()));
        }
        Ok(Self {
            labels,
            descriptors,
            trained_at,
        })
    }

    pub fn labels(&self) -> &[StudentId] {
        &self.labels
    }

    pub fn descriptors(&self) -> &[f32] {
        &self.descriptors
    }

    pub fn trained_at(&self) -> NaiveDateTime {
        self.trained_at
    }

    pub fn sample_count(&self) -> usize {
        self.labels.len()
    }

    pub fn student_count(&self) -> usize {
        let mut ids: Vec<&str> = self.labels.iter().map(String::as_str).collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    pub fn contains(&self, student_id: &str) -> bool {
        self.labels.iter().any(|l| l == student_id)
    }

    /// Nearest stored label for a canonical face, with its confidence.
    pub fn predict(&self, face: &GrayImage) -> Result<Prediction, RecognizerError> {
        self.predict_among(face, |_| true)?
            .ok_or(RecognizerError::ModelNotTrained)
    }

    /// Like [`predict`](Self::predict), but only labels accepted by `allowed`
    /// are candidates. Returns `None` when no stored label is allowed.
    ///
    /// Always scans every stored descriptor.
    pub fn predict_among(
        &self,
        face: &GrayImage,
        allowed: impl Fn(&str) -> bool,
    ) -> Result<Option<Prediction>, RecognizerError> {
        if !imgops::is_canonical(face) {
            return Err(RecognizerError::InvalidQueryShape {
                width: face.width(),
                height: face.height(),
            });
        }
        let query = lbph::descriptor(face);

        let mut best: Option<(usize, f32)> = None;
        for (i, stored) in self.descriptors.chunks_exact(DESCRIPTOR_LEN).enumerate() {
            if !allowed(&self.labels[i]) {
                continue;
            }
            let d = lbph::chi_square(&query, stored);
            if best.map_or(true, |(_, bd)| d < bd) {
                best = Some((i, d));
            }
        }

        Ok(best.map(|(i, distance)| Prediction {
            student_id: self.labels[i].clone(),
            confidence: confidence_from_distance(distance),
            distance,
        }))
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Publication point for one roster's model.
///
/// Readers take an `Arc` snapshot; retrains build off-lock and publish by
/// replacement. Concurrent retrains of the same roster are serialized.
#[derive(Default)]
pub struct ModelHandle {
    current: RwLock<Option<Arc<RecognitionModel>>>,
    retrain: Mutex<()>,
}

impl ModelHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<Arc<RecognitionModel>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn publish(&self, model: RecognitionModel) -> Arc<RecognitionModel> {
        let model = Arc::new(model);
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(model.clone());
        model
    }

    pub fn clear(&self) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = None;
    }

    pub fn is_trained(&self) -> bool {
        self.snapshot().is_some()
    }

    /// Hold the retrain lock for this roster.
    pub fn retrain_guard(&self) -> MutexGuard<'_, ()> {
        lock(&self.retrain)
    }

    /// Predict against the currently published model.
    pub fn predict(&self, face: &GrayImage) -> Result<Prediction, RecognizerError> {
        self.snapshot()
            .ok_or(RecognizerError::ModelNotTrained)?
            .predict(face)
    }
}

/// Independent model handles keyed by roster (class) id.
#[derive(Default)]
pub struct ModelRegistry {
    handles: RwLock<HashMap<ClassId, Arc<ModelHandle>>>,
}

impl ModelRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Handle for a roster, created on first use.
    pub fn handle(&self, class_id: &str) -> Arc<ModelHandle> {
        if let Some(h) = self
            .handles
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(class_id)
        {
            return h.clone();
        }
        self.handles
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .entry(class_id.to_string())
            .or_default()
            .clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::augment::augment_with_rng;
    use crate::testutil::{checker_face, noise_face, oval_face};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    #[test]
    fn test_train_rejects_empty_roster() {
        let none: Vec<(&str, &[GrayImage])> = vec![("a", &[])];
        assert_eq!(RecognitionModel::train(none).unwrap_err(), RecognizerError::EmptyRoster);
    }

    #[test]
    fn test_train_rejects_wrong_shape() {
        let imgs = vec![oval_face(), GrayImage::new(64, 64)];
        let err = RecognitionModel::train([("alice", imgs.as_slice())]).unwrap_err();
        assert!(matches!(
            err,
            RecognizerError::InconsistentImageShape { index: 1, width: 64, .. }
        ));
    }

    #[test]
    fn test_self_consistency_over_whole_set() {
        let set = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(11));
        let model = RecognitionModel::train([("alice", set.images())]).unwrap();
        assert_eq!(model.sample_count(), 100);
        for img in set.images() {
            let p = model.predict(img).unwrap();
            assert_eq!(p.student_id, "alice");
            assert!(p.confidence >= DEFAULT_CONFIDENCE_THRESHOLD);
        }
    }

    #[test]
    fn test_distinguishes_two_students() {
        let a = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(1));
        let b = augment_with_rng(&checker_face(), &mut StdRng::seed_from_u64(2));
        let model =
            RecognitionModel::train([("alice", a.images()), ("bob", b.images())]).unwrap();
        assert_eq!(model.student_count(), 2);
        assert_eq!(model.predict(&oval_face()).unwrap().student_id, "alice");
        assert_eq!(model.predict(&checker_face()).unwrap().student_id, "bob");
    }

    #[test]
    fn test_unrelated_images_stay_below_threshold() {
        let set = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(12));
        let model = RecognitionModel::train([("alice", set.images())]).unwrap();

        let flat = GrayImage::from_pixel(100, 100, image::Luma([128]));
        for (label, img) in [("checker", checker_face()), ("noise", noise_face(5)), ("flat", flat)] {
            let p = model.predict(&img).unwrap();
            assert_eq!(p.student_id, "alice");
            assert!(
                p.confidence < DEFAULT_CONFIDENCE_THRESHOLD - 20.0,
                "{label} scored {:.1}% (distance {:.2})",
                p.confidence,
                p.distance
            );
        }
    }

    #[test]
    fn test_predict_among_excludes_outsiders() {
        let a = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(1));
        let b = augment_with_rng(&checker_face(), &mut StdRng::seed_from_u64(2));
        let model =
            RecognitionModel::train([("alice", a.images()), ("bob", b.images())]).unwrap();

        let p = model
            .predict_among(&checker_face(), |id| id == "alice")
            .unwrap()
            .unwrap();
        assert_eq!(p.student_id, "alice");
        assert!(model.predict_among(&checker_face(), |_| false).unwrap().is_none());
    }

    #[test]
    fn test_repeated_augmentation_is_distribution_stable() {
        // Train on one run, query with an independent run of the pipeline.
        let train_a = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(100));
        let train_b = augment_with_rng(&checker_face(), &mut StdRng::seed_from_u64(101));
        let model = RecognitionModel::train([
            ("alice", train_a.images()),
            ("bob", train_b.images()),
        ])
        .unwrap();

        let queries = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(200));
        let correct = queries
            .images()
            .iter()
            .filter(|img| model.predict(img).unwrap().student_id == "alice")
            .count();
        assert!(correct >= 80, "only {correct}/100 re-augmented queries matched");
        assert!(model.predict(&queries.images()[0]).unwrap().confidence >= DEFAULT_CONFIDENCE_THRESHOLD);
    }

    #[test]
    fn test_query_shape_checked() {
        let set = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(3));
        let model = RecognitionModel::train([("alice", set.images())]).unwrap();
        assert!(matches!(
            model.predict(&GrayImage::new(50, 50)),
            Err(RecognizerError::InvalidQueryShape { width: 50, height: 50 })
        ));
    }

    #[test]
    fn test_confidence_mapping() {
        assert_eq!(confidence_from_distance(0.0), 100.0);
        assert_eq!(confidence_from_distance(DISTANCE_CEILING), 0.0);
        assert_eq!(confidence_from_distance(3.0 * DISTANCE_CEILING), 0.0);
        assert!((confidence_from_distance(4.8) - 80.0).abs() < 1e-3);
    }

    #[test]
    fn test_handle_untrained_fails() {
        let handle = ModelHandle::new();
        assert_eq!(
            handle.predict(&oval_face()).unwrap_err(),
            RecognizerError::ModelNotTrained
        );
    }

    #[test]
    fn test_snapshot_survives_republish() {
        let a = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(1));
        let b = augment_with_rng(&checker_face(), &mut StdRng::seed_from_u64(2));
        let handle = ModelHandle::new();
        handle.publish(RecognitionModel::train([("alice", a.images())]).unwrap());

        let before = handle.snapshot().unwrap();
        handle.publish(
            RecognitionModel::train([("alice", a.images()), ("bob", b.images())]).unwrap(),
        );

        // The in-flight snapshot still sees only alice.
        assert_eq!(before.predict(&checker_face()).unwrap().student_id, "alice");
        // New predictions can return the newly added student.
        assert_eq!(handle.predict(&checker_face()).unwrap().student_id, "bob");
    }

    #[test]
    fn test_from_parts_validates_length() {
        let now = chrono::Local::now().naive_local();
        let err = RecognitionModel::from_parts(vec!["a".into()], vec![0.0; 3], now).unwrap_err();
        assert!(matches!(err, RecognizerError::CorruptModel(_)));
    }

    #[test]
    fn test_registry_handles_are_independent() {
        let reg = ModelRegistry::new();
        let set = augment_with_rng(&oval_face(), &mut StdRng::seed_from_u64(4));
        reg.handle("math").publish(RecognitionModel::train([("alice", set.images())]).unwrap());
        assert!(reg.handle("math").is_trained());
        assert!(!reg.handle("physics").is_trained());
        assert!(Arc::ptr_eq(&reg.handle("math"), &reg.handle("math")));
    }
}
