use chrono::{NaiveDate, NaiveDateTime};
use image::GrayImage;
use serde::{Deserialize, Serialize};

use crate::augment::Transform;

/// Student identifier (UUID v4, assigned at first enrollment).
pub type StudentId = String;
/// Class identifier, chosen by whoever defines the class.
pub type ClassId = String;

/// Bounding box for a detected face, in source-image pixel coordinates.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

impl BoundingBox {
    pub fn area(&self) -> f32 {
        self.width.max(0.0) * self.height.max(0.0)
    }
}

/// An enrolled student. Replaced wholesale on re-enrollment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StudentProfile {
    pub id: StudentId,
    pub roll_number: String,
    pub name: String,
    pub class_id: ClassId,
    pub enrolled_at: NaiveDateTime,
}

/// One augmented training image together with the transform that produced it.
#[derive(Debug, Clone)]
pub struct AugmentedImage {
    pub transform: Transform,
    pub image: GrayImage,
}

/// The fixed-size training set generated from a single enrollment capture.
///
/// Element 0 is always the unmodified grayscale capture. The set is immutable
/// once built; re-enrollment produces a new one.
#[derive(Debug, Clone)]
pub struct AugmentedImageSet {
    transforms: Vec<Transform>,
    images: Vec<GrayImage>,
}

impl AugmentedImageSet {
    pub(crate) fn from_entries(entries: Vec<AugmentedImage>) -> Self {
        let (transforms, images) = entries.into_iter().map(|e| (e.transform, e.image)).unzip();
        Self { transforms, images }
    }

    /// Rebuild a set from stored parts. Shape is validated at training time.
    pub fn from_parts(transforms: Vec<Transform>, images: Vec<GrayImage>) -> Option<Self> {
        (transforms.len() == images.len()).then_some(Self { transforms, images })
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }

    pub fn images(&self) -> &[GrayImage] {
        &self.images
    }

    /// Transform metadata, index-aligned with [`images`](Self::images).
    pub fn transforms(&self) -> &[Transform] {
        &self.transforms
    }

    pub fn iter(&self) -> impl Iterator<Item = AugmentedImage> + '_ {
        self.transforms
            .iter()
            .zip(self.images.iter())
            .map(|(t, i)| AugmentedImage {
                transform: *t,
                image: i.clone(),
            })
    }
}

/// How an attendance record came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttendanceMethod {
    Auto,
    Manual,
}

impl AttendanceMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auto => "auto",
            Self::Manual => "manual",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "auto" => Some(Self::Auto),
            "manual" => Some(Self::Manual),
            _ => None,
        }
    }
}

/// Arrival relative to the class start, for auto-committed records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Punctuality {
    OnTime,
    Late,
}

impl Punctuality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnTime => "on_time",
            Self::Late => "late",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on_time" => Some(Self::OnTime),
            "late" => Some(Self::Late),
            _ => None,
        }
    }
}

/// A committed attendance credit. At most one exists per (student, class, date).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AttendanceRecord {
    pub student_id: StudentId,
    pub class_id: ClassId,
    pub date: NaiveDate,
    pub timestamp: NaiveDateTime,
    /// Classifier confidence in percent; `None` for manual marks.
    pub confidence: Option<f32>,
    pub method: AttendanceMethod,
    /// `None` for manual marks.
    pub punctuality: Option<Punctuality>,
}

/// Classifier output for one detected face.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Prediction {
    pub student_id: StudentId,
    /// Confidence in percent, 0 to 100. Higher = more similar.
    pub confidence: f32,
    /// Chi-square distance to the nearest stored descriptor.
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerdictStatus {
    Present,
    /// Below the acceptance threshold; routed for manual review, never committed.
    Uncertain,
}

/// Decision for one detected face in a group photo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Verdict {
    pub student_id: StudentId,
    pub confidence: f32,
    pub status: VerdictStatus,
    pub face: BoundingBox,
}
