//! SCRFD face locator via ONNX Runtime.
//!
//! Anchor-free decoding over strides 8/16/32 followed by NMS. Only the score
//! and box heads are read; keypoints are not needed for LBPH crops.

use image::imageops::{self, FilterType};
use image::GrayImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use std::sync::Mutex;

use crate::locator::{sort_by_area, FaceLocator, LocatorError};
use crate::types::BoundingBox;

const SCRFD_INPUT_SIZE: u32 = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_CONFIDENCE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

/// Maps letterboxed detector coordinates back to the source image.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: u32,
    pad_y: u32,
}

impl Letterbox {
    fn fit(width: u32, height: u32) -> (Self, u32, u32) {
        let scale = (SCRFD_INPUT_SIZE as f32 / width as f32).min(SCRFD_INPUT_SIZE as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let new_h = ((height as f32 * scale).round() as u32).clamp(1, SCRFD_INPUT_SIZE);
        let lb = Self {
            scale,
            pad_x: (SCRFD_INPUT_SIZE - new_w) / 2,
            pad_y: (SCRFD_INPUT_SIZE - new_h) / 2,
        };
        (lb, new_w, new_h)
    }

    fn to_source(self, x: f32, y: f32) -> (f32, f32) {
        (
            (x - self.pad_x as f32) / self.scale,
            (y - self.pad_y as f32) / self.scale,
        )
    }
}

/// (score, bbox) output tensor indices for one stride.
type StrideOutputs = (usize, usize);

pub struct ScrfdLocator {
    session: Mutex<Session>,
    stride_outputs: [StrideOutputs; 3],
}

impl ScrfdLocator {
    pub fn load(model_path: &Path) -> Result<Self, LocatorError> {
        if !model_path.exists() {
            return Err(LocatorError::Detector(format!(
                "SCRFD model not found at {}",
                model_path.display()
            )));
        }

        let session = Session::builder()
            .map_err(detector_err)?
            .with_intra_threads(2)
            .map_err(detector_err)?
            .commit_from_file(model_path)
            .map_err(detector_err)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 6 {
            return Err(LocatorError::Detector(format!(
                "SCRFD model needs score and bbox outputs for 3 strides, got {} outputs",
                names.len()
            )));
        }
        let stride_outputs = output_indices(&names);
        tracing::info!(path = %model_path.display(), outputs = ?names, ?stride_outputs, "loaded SCRFD model");

        Ok(Self {
            session: Mutex::new(session),
            stride_outputs,
        })
    }

    fn tensor(image: &GrayImage) -> (Array4<f32>, Letterbox) {
        let (lb, new_w, new_h) = Letterbox::fit(image.width(), image.height());
        let resized = imageops::resize(image, new_w, new_h, FilterType::Triangle);

        // Padding takes the mean so it normalizes to zero.
        let size = SCRFD_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));
        for (x, y, px) in resized.enumerate_pixels() {
            let v = (px.0[0] as f32 - SCRFD_MEAN) / SCRFD_STD;
            let (tx, ty) = ((x + lb.pad_x) as usize, (y + lb.pad_y) as usize);
            for c in 0..3 {
                tensor[[0, c, ty, tx]] = v;
            }
        }
        (tensor, lb)
    }
}

impl FaceLocator for ScrfdLocator {
    fn locate(&self, image: &GrayImage) -> Result<Vec<BoundingBox>, LocatorError> {
        if image.width() == 0 || image.height() == 0 {
            return Ok(Vec::new());
        }
        let (input, lb) = Self::tensor(image);

        let mut session = self.session.lock().unwrap_or_else(|e| e.into_inner());
        let outputs = session
            .run(ort::inputs![TensorRef::from_array_view(input.view()).map_err(detector_err)?])
            .map_err(detector_err)?;

        let mut detections = Vec::new();
        for (pos, &stride) in SCRFD_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_outputs[pos];
            let (_, scores) = outputs[score_idx].try_extract_tensor::<f32>().map_err(detector_err)?;
            let (_, boxes) = outputs[bbox_idx].try_extract_tensor::<f32>().map_err(detector_err)?;
            detections.extend(decode_stride(scores, boxes, stride, lb, SCRFD_CONFIDENCE_THRESHOLD));
        }

        let mut faces = nms(detections, SCRFD_NMS_THRESHOLD);
        sort_by_area(&mut faces);
        tracing::debug!(faces = faces.len(), "SCRFD detection");
        Ok(faces)
    }

    fn name(&self) -> &'static str {
        "scrfd"
    }
}

fn detector_err(e: impl std::fmt::Display) -> LocatorError {
    LocatorError::Detector(e.to_string())
}

/// Locate score and bbox heads by name, falling back to the standard
/// positional layout (scores 0..3, boxes 3..6).
fn output_indices(names: &[String]) -> [StrideOutputs; 3] {
    let find = |head: &str, stride: usize| {
        let target = format!("{head}_{stride}");
        names.iter().position(|n| *n == target)
    };
    let named: Option<Vec<StrideOutputs>> = SCRFD_STRIDES
        .iter()
        .map(|&s| Some((find("score", s)?, find("bbox", s)?)))
        .collect();
    match named {
        Some(v) => [v[0], v[1], v[2]],
        None => [(0, 3), (1, 4), (2, 5)],
    }
}

fn decode_stride(
    scores: &[f32],
    boxes: &[f32],
    stride: usize,
    lb: Letterbox,
    threshold: f32,
) -> Vec<BoundingBox> {
    let grid_w = SCRFD_INPUT_SIZE as usize / stride;
    let grid_h = SCRFD_INPUT_SIZE as usize / stride;
    let s = stride as f32;

    (0..grid_w * grid_h * SCRFD_ANCHORS_PER_CELL)
        .filter_map(|idx| {
            let score = *scores.get(idx)?;
            if score <= threshold {
                return None;
            }
            let off = boxes.get(idx * 4..idx * 4 + 4)?;
            let cell = idx / SCRFD_ANCHORS_PER_CELL;
            let ax = (cell % grid_w) as f32 * s;
            let ay = (cell / grid_w) as f32 * s;

            let (x1, y1) = lb.to_source(ax - off[0] * s, ay - off[1] * s);
            let (x2, y2) = lb.to_source(ax + off[2] * s, ay + off[3] * s);
            Some(BoundingBox {
                x: x1,
                y: y1,
                width: x2 - x1,
                height: y2 - y1,
                confidence: score,
            })
        })
        .collect()
}

/// Greedy non-maximum suppression, highest confidence first.
fn nms(mut detections: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    let mut keep: Vec<BoundingBox> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.width).min(b.x + b.width);
    let y2 = (a.y + a.height).min(b.y + b.height);
    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.area() + b.area() - inter;
    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
