//! Training-set augmentation.
//!
//! Expands one captured face into exactly [`AUGMENTED_SET_SIZE`] canonical
//! 100×100 grayscale variants. The transform family of every slot is fixed;
//! only the parameters inside each family are sampled. Ranged parameters are
//! stratified so a family always covers its whole range, whatever the seed.

use image::GrayImage;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::imgops::{self, Element};
use crate::types::{AugmentedImage, AugmentedImageSet};

pub const AUGMENTED_SET_SIZE: usize = 100;

const BRIGHTNESS_RANGE: (f32, f32) = (-40.0, 40.0);
const NOISE_SIGMA_RANGE: (f32, f32) = (4.0, 20.0);
const ROTATION_RANGE_DEG: (f32, f32) = (-15.0, 15.0);
const BLUR_KERNELS: [u32; 5] = [3, 5, 7, 9, 11];
const CONTRAST_RANGE: (f32, f32) = (0.8, 1.5);
const SALT_PEPPER_RANGE: (f32, f32) = (0.01, 0.08);
const SCALE_RANGE: (f32, f32) = (0.9, 1.1);
const CLAHE_TILES: u32 = 4;
const CLAHE_CLIP: f32 = 0.03;

/// Transform family, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransformFamily {
    Identity,
    Brightness,
    GaussianNoise,
    Rotation,
    Equalization,
    GaussianBlur,
    Contrast,
    SaltAndPepper,
    Mirror,
    Scale,
    Morphology,
}

/// Number of images generated per family. Sums to [`AUGMENTED_SET_SIZE`].
pub const FAMILY_COUNTS: [(TransformFamily, usize); 11] = [
    (TransformFamily::Identity, 1),
    (TransformFamily::Brightness, 14),
    (TransformFamily::GaussianNoise, 12),
    (TransformFamily::Rotation, 14),
    (TransformFamily::Equalization, 2),
    (TransformFamily::GaussianBlur, 10),
    (TransformFamily::Contrast, 13),
    (TransformFamily::SaltAndPepper, 10),
    (TransformFamily::Mirror, 1),
    (TransformFamily::Scale, 13),
    (TransformFamily::Morphology, 10),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MorphOp {
    OpenSquare,
    CloseSquare,
    OpenCross,
    CloseCross,
}

/// The transform (with its sampled parameter) that produced an augmented image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transform {
    Identity,
    Brightness { delta: i16 },
    GaussianNoise { sigma: f32 },
    Rotation { degrees: f32 },
    Equalize,
    AdaptiveEqualize,
    GaussianBlur { kernel: u32 },
    Contrast { factor: f32 },
    SaltAndPepper { density: f32 },
    Mirror,
    Scale { factor: f32 },
    Morphology { op: MorphOp },
}

impl Transform {
    pub fn family(&self) -> TransformFamily {
        match self {
            Transform::Identity => TransformFamily::Identity,
            Transform::Brightness { .. } => TransformFamily::Brightness,
            Transform::GaussianNoise { .. } => TransformFamily::GaussianNoise,
            Transform::Rotation { .. } => TransformFamily::Rotation,
            Transform::Equalize | Transform::AdaptiveEqualize => TransformFamily::Equalization,
            Transform::GaussianBlur { .. } => TransformFamily::GaussianBlur,
            Transform::Contrast { .. } => TransformFamily::Contrast,
            Transform::SaltAndPepper { .. } => TransformFamily::SaltAndPepper,
            Transform::Mirror => TransformFamily::Mirror,
            Transform::Scale { .. } => TransformFamily::Scale,
            Transform::Morphology { .. } => TransformFamily::Morphology,
        }
    }

    /// Apply this transform to a canonical face.
    pub fn apply<R: Rng + ?Sized>(&self, face: &GrayImage, rng: &mut R) -> GrayImage {
        match *self {
            Transform::Identity => face.clone(),
            Transform::Brightness { delta } => imgops::shift_brightness(face, delta),
            Transform::GaussianNoise { sigma } => imgops::add_gaussian_noise(face, sigma, rng),
            Transform::Rotation { degrees } => imgops::rotate_and_crop(face, degrees),
            Transform::Equalize => imgops::equalize_histogram(face),
            Transform::AdaptiveEqualize => imgops::clahe(face, CLAHE_TILES, CLAHE_CLIP),
            Transform::GaussianBlur { kernel } => imgops::gaussian_blur(face, kernel),
            Transform::Contrast { factor } => imgops::scale_contrast(face, factor),
            Transform::SaltAndPepper { density } => imgops::salt_and_pepper(face, density, rng),
            Transform::Mirror => image::imageops::flip_horizontal(face),
            Transform::Scale { factor } => imgops::warp_about_center(face, 0.0, factor),
            Transform::Morphology { op } => match op {
                MorphOp::OpenSquare => imgops::open(face, Element::Square),
                MorphOp::CloseSquare => imgops::close(face, Element::Square),
                MorphOp::OpenCross => imgops::open(face, Element::Cross),
                MorphOp::CloseCross => imgops::close(face, Element::Cross),
            },
        }
    }
}

/// Draw `n` values covering `range`: one uniform sample per equal-width stratum.
fn stratified<R: Rng + ?Sized>(rng: &mut R, range: (f32, f32), n: usize) -> Vec<f32> {
    let (lo, hi) = range;
    let width = (hi - lo) / n as f32;
    (0..n)
        .map(|i| {
            let start = lo + width * i as f32;
            start + rng.gen::<f32>() * width
        })
        .collect()
}

/// Sample the parameterized transforms for one family.
fn plan_family<R: Rng + ?Sized>(rng: &mut R, family: TransformFamily, n: usize) -> Vec<Transform> {
    match family {
        TransformFamily::Identity => vec![Transform::Identity; n],
        TransformFamily::Brightness => stratified(rng, BRIGHTNESS_RANGE, n)
            .into_iter()
            .map(|d| Transform::Brightness { delta: d.round() as i16 })
            .collect(),
        TransformFamily::GaussianNoise => stratified(rng, NOISE_SIGMA_RANGE, n)
            .into_iter()
            .map(|sigma| Transform::GaussianNoise { sigma })
            .collect(),
        TransformFamily::Rotation => stratified(rng, ROTATION_RANGE_DEG, n)
            .into_iter()
            .map(|degrees| Transform::Rotation { degrees })
            .collect(),
        TransformFamily::Equalization => [Transform::Equalize, Transform::AdaptiveEqualize]
            .into_iter()
            .cycle()
            .take(n)
            .collect(),
        TransformFamily::GaussianBlur => (0..n)
            .map(|i| Transform::GaussianBlur { kernel: BLUR_KERNELS[i % BLUR_KERNELS.len()] })
            .collect(),
        TransformFamily::Contrast => stratified(rng, CONTRAST_RANGE, n)
            .into_iter()
            .map(|factor| Transform::Contrast { factor })
            .collect(),
        TransformFamily::SaltAndPepper => stratified(rng, SALT_PEPPER_RANGE, n)
            .into_iter()
            .map(|density| Transform::SaltAndPepper { density })
            .collect(),
        TransformFamily::Mirror => vec![Transform::Mirror; n],
        TransformFamily::Scale => stratified(rng, SCALE_RANGE, n)
            .into_iter()
            .map(|factor| Transform::Scale { factor })
            .collect(),
        TransformFamily::Morphology => {
            let ops = [MorphOp::OpenSquare, MorphOp::CloseSquare, MorphOp::OpenCross, MorphOp::CloseCross];
            (0..n)
                .map(|i| Transform::Morphology { op: ops[i % ops.len()] })
                .collect()
        }
    }
}

/// Sample the full, ordered transform plan for one set.
pub fn plan<R: Rng + ?Sized>(rng: &mut R) -> Vec<Transform> {
    let mut out = Vec::with_capacity(AUGMENTED_SET_SIZE);
    for (family, n) in FAMILY_COUNTS {
        out.extend(plan_family(rng, family, n));
    }
    out
}

/// Generate the augmented set for a face crop using the thread-local RNG.
pub fn augment(face: &GrayImage) -> AugmentedImageSet {
    augment_with_rng(face, &mut rand::thread_rng())
}

/// Generate the augmented set with a caller-supplied RNG (seed it for reproducible sets).
pub fn augment_with_rng<R: Rng + ?Sized>(face: &GrayImage, rng: &mut R) -> AugmentedImageSet {
    let base = imgops::canonical_face(face);
    let entries: Vec<AugmentedImage> = plan(rng)
        .into_iter()
        .map(|transform| {
            let image = imgops::canonical_face(&transform.apply(&base, rng));
            AugmentedImage { transform, image }
        })
        .collect();

    tracing::debug!(
        count = entries.len(),
        source_width = face.width(),
        source_height = face.height(),
        "augmented face set generated"
    );

    AugmentedImageSet::from_entries(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::imgops::FACE_SIZE;
    use image::Luma;
    use rand::rngs::StdRng;
    use rand::SeedableRng;
    use std::collections::HashMap;

    fn synthetic_face(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| {
            let dx = x as f32 - w as f32 / 2.0;
            let dy = y as f32 - h as f32 / 2.0;
            Luma([(128.0 + 60.0 * ((dx * 0.2).sin() + (dy * 0.15).cos())).clamp(0.0, 255.0) as u8])
        })
    }

    #[test]
    fn test_family_counts_sum_to_set_size() {
        let total: usize = FAMILY_COUNTS.iter().map(|(_, n)| n).sum();
        assert_eq!(total, AUGMENTED_SET_SIZE);
        assert_eq!(FAMILY_COUNTS.len(), 11);
    }

    #[test]
    fn test_set_has_exact_size_and_shape() {
        let mut rng = StdRng::seed_from_u64(1);
        for (w, h) in [(100, 100), (64, 80), (240, 180)] {
            let set = augment_with_rng(&synthetic_face(w, h), &mut rng);
            assert_eq!(set.len(), AUGMENTED_SET_SIZE);
            assert!(set
                .images()
                .iter()
                .all(|img| img.dimensions() == (FACE_SIZE, FACE_SIZE)));
        }
    }

    #[test]
    fn test_first_element_is_unmodified_capture() {
        let face = synthetic_face(100, 100);
        let set = augment_with_rng(&face, &mut StdRng::seed_from_u64(9));
        assert_eq!(set.transforms()[0], Transform::Identity);
        assert_eq!(set.images()[0], face);
    }

    #[test]
    fn test_family_order_is_fixed_across_seeds() {
        let a: Vec<_> = plan(&mut StdRng::seed_from_u64(1)).iter().map(Transform::family).collect();
        let b: Vec<_> = plan(&mut StdRng::seed_from_u64(2)).iter().map(Transform::family).collect();
        assert_eq!(a, b);

        let mut counts: HashMap<TransformFamily, usize> = HashMap::new();
        for f in a {
            *counts.entry(f).or_default() += 1;
        }
        for (family, n) in FAMILY_COUNTS {
            assert_eq!(counts[&family], n, "{family:?}");
        }
    }

    #[test]
    fn test_parameters_stay_in_range_and_span_it() {
        let transforms = plan(&mut StdRng::seed_from_u64(42));
        let rotations: Vec<f32> = transforms
            .iter()
            .filter_map(|t| match t {
                Transform::Rotation { degrees } => Some(*degrees),
                _ => None,
            })
            .collect();
        assert!(rotations.iter().all(|d| (-15.0..=15.0).contains(d)));
        // Stratification guarantees both ends of the range are visited.
        assert!(rotations.iter().any(|&d| d < -12.0));
        assert!(rotations.iter().any(|&d| d > 12.0));

        for t in &transforms {
            match *t {
                Transform::Brightness { delta } => assert!((-40..=40).contains(&delta)),
                Transform::Contrast { factor } => assert!((0.8..=1.5).contains(&factor)),
                Transform::Scale { factor } => assert!((0.9..=1.1).contains(&factor)),
                _ => {}
            }
        }
    }

    #[test]
    fn test_mirror_slot_is_flipped() {
        let face = synthetic_face(100, 100);
        let set = augment_with_rng(&face, &mut StdRng::seed_from_u64(5));
        let idx = set
            .transforms()
            .iter()
            .position(|t| *t == Transform::Mirror)
            .unwrap();
        let mirrored = &set.images()[idx];
        assert_eq!(mirrored.get_pixel(0, 50), face.get_pixel(99, 50));
    }

    #[test]
    fn test_transform_serializes_with_kind_tag() {
        let json = serde_json::to_string(&Transform::GaussianBlur { kernel: 5 }).unwrap();
        assert_eq!(json, r#"{"kind":"gaussian_blur","kernel":5}"#);
        let back: Transform = serde_json::from_str(&json).unwrap();
        assert_eq!(back, Transform::GaussianBlur { kernel: 5 });
    }
}
