//! Face locator contract and subject selection.

use image::GrayImage;
use thiserror::Error;

use crate::types::BoundingBox;

/// The largest face must be at least this many times the area of the
/// runner-up for an enrollment capture to name a single subject.
pub const SUBJECT_DOMINANCE_RATIO: f32 = 1.5;

#[derive(Error, Debug)]
pub enum LocatorError {
    #[error("no face detected")]
    NoFaceDetected,
    #[error("ambiguous capture: {count} faces, largest {largest:.0}px² is not 1.5x the next ({runner_up:.0}px²)")]
    AmbiguousFace {
        count: usize,
        largest: f32,
        runner_up: f32,
    },
    #[error("face detector failed: {0}")]
    Detector(String),
}

/// Finds faces in a grayscale image.
///
/// Implementations return boxes ordered by descending area. An empty result
/// is a valid outcome; callers that need a face decide whether it is an error.
pub trait FaceLocator: Send + Sync {
    fn locate(&self, image: &GrayImage) -> Result<Vec<BoundingBox>, LocatorError>;

    /// Short identifier for status reporting.
    fn name(&self) -> &'static str;
}

impl<T: FaceLocator + ?Sized> FaceLocator for Box<T> {
    fn locate(&self, image: &GrayImage) -> Result<Vec<BoundingBox>, LocatorError> {
        (**self).locate(image)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Sort boxes largest first.
pub fn sort_by_area(boxes: &mut [BoundingBox]) {
    boxes.sort_by(|a, b| {
        b.area()
            .partial_cmp(&a.area())
            .unwrap_or(std::cmp::Ordering::Equal)
    });
}

/// Pick the enrollment subject from a set of detections.
pub fn select_subject(boxes: &[BoundingBox]) -> Result<BoundingBox, LocatorError> {
    let mut sorted = boxes.to_vec();
    sort_by_area(&mut sorted);
    match sorted.as_slice() {
        [] => Err(LocatorError::NoFaceDetected),
        [only] => Ok(*only),
        [first, second, ..] => {
            if first.area() >= SUBJECT_DOMINANCE_RATIO * second.area() {
                Ok(*first)
            } else {
                Err(LocatorError::AmbiguousFace {
                    count: sorted.len(),
                    largest: first.area(),
                    runner_up: second.area(),
                })
            }
        }
    }
}

/// Crop a detected face out of the source image, clamped to its bounds.
///
/// Returns `None` when the clamped box is empty.
pub fn crop_face(image: &GrayImage, face: &BoundingBox) -> Option<GrayImage> {
    let (w, h) = image.dimensions();
    let x0 = face.x.max(0.0).floor() as u32;
    let y0 = face.y.max(0.0).floor() as u32;
    let x1 = ((face.x + face.width).ceil().max(0.0) as u32).min(w);
    let y1 = ((face.y + face.height).ceil().max(0.0) as u32).min(h);
    if x0 >= x1 || y0 >= y1 {
        return None;
    }
    Some(image::imageops::crop_imm(image, x0, y0, x1 - x0, y1 - y0).to_image())
}

/// Treats the whole frame as a single face.
///
/// For capture layers that hand over pre-cropped faces.
pub struct WholeFrameLocator;

impl FaceLocator for WholeFrameLocator {
    fn locate(&self, image: &GrayImage) -> Result<Vec<BoundingBox>, LocatorError> {
        let (w, h) = image.dimensions();
        if w == 0 || h == 0 {
            return Ok(Vec::new());
        }
        Ok(vec![BoundingBox {
            x: 0.0,
            y: 0.0,
            width: w as f32,
            height: h as f32,
            confidence: 1.0,
        }])
    }

    fn name(&self) -> &'static str {
        "whole-frame"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bbox(x: f32, y: f32, w: f32, h: f32) -> BoundingBox {
        BoundingBox { x, y, width: w, height: h, confidence: 0.9 }
    }

    #[test]
    fn test_select_subject_none() {
        assert!(matches!(select_subject(&[]), Err(LocatorError::NoFaceDetected)));
    }

    #[test]
    fn test_select_subject_single() {
        let b = bbox(1.0, 2.0, 30.0, 30.0);
        assert_eq!(select_subject(&[b]).unwrap(), b);
    }

    #[test]
    fn test_select_subject_dominant_regardless_of_order() {
        let small = bbox(0.0, 0.0, 20.0, 20.0); // 400
        let big = bbox(50.0, 50.0, 30.0, 20.0); // 600 = 1.5 × 400
        assert_eq!(select_subject(&[small, big]).unwrap(), big);
    }

    #[test]
    fn test_select_subject_ambiguous() {
        let a = bbox(0.0, 0.0, 20.0, 20.0);
        let b = bbox(50.0, 50.0, 22.0, 22.0);
        match select_subject(&[a, b]) {
            Err(LocatorError::AmbiguousFace { count, largest, runner_up }) => {
                assert_eq!(count, 2);
                assert_eq!(largest, 484.0);
                assert_eq!(runner_up, 400.0);
            }
            other => panic!("expected AmbiguousFace, got {other:?}"),
        }
    }

    #[test]
    fn test_sort_by_area_descending() {
        let mut boxes = vec![bbox(0.0, 0.0, 5.0, 5.0), bbox(0.0, 0.0, 9.0, 9.0), bbox(0.0, 0.0, 7.0, 7.0)];
        sort_by_area(&mut boxes);
        let areas: Vec<f32> = boxes.iter().map(BoundingBox::area).collect();
        assert_eq!(areas, vec![81.0, 49.0, 25.0]);
    }

    #[test]
    fn test_crop_face_clamps_to_image() {
        let img = GrayImage::new(50, 40);
        let crop = crop_face(&img, &bbox(-10.0, 30.0, 30.0, 30.0)).unwrap();
        assert_eq!(crop.dimensions(), (20, 10));
    }

    #[test]
    fn test_crop_face_outside_is_none() {
        let img = GrayImage::new(50, 40);
        assert!(crop_face(&img, &bbox(60.0, 0.0, 10.0, 10.0)).is_none());
    }

    #[test]
    fn test_whole_frame_locator() {
        let img = GrayImage::new(120, 90);
        let boxes = WholeFrameLocator.locate(&img).unwrap();
        assert_eq!(boxes.len(), 1);
        assert_eq!(boxes[0].area(), 120.0 * 90.0);
        assert!(WholeFrameLocator.locate(&GrayImage::new(0, 0)).unwrap().is_empty());
    }
}
