//! Grayscale pixel operations used by the augmentation pipeline and the
//! recognizer: geometric warps, histogram equalization, CLAHE, blur, noise
//! and morphology on `image::GrayImage`.

use image::imageops::{self, FilterType};
use image::{GrayImage, Luma};
use rand::Rng;

/// Canonical face edge length in pixels (faces are `FACE_SIZE` × `FACE_SIZE`).
pub const FACE_SIZE: u32 = 100;

/// Resize a face crop to the canonical frame.
///
/// Returns an exact copy when the input is already canonical, so the
/// identity element of an augmented set stays bit-identical to its source.
pub fn canonical_face(img: &GrayImage) -> GrayImage {
    if img.width() == FACE_SIZE && img.height() == FACE_SIZE {
        return img.clone();
    }
    imageops::resize(img, FACE_SIZE, FACE_SIZE, FilterType::Triangle)
}

pub fn is_canonical(img: &GrayImage) -> bool {
    img.width() == FACE_SIZE && img.height() == FACE_SIZE
}

/// Map each pixel through `f`, saturating into the displayable 0..=255 range.
///
/// Results are clamped, never min-max stretched: a brightened face keeps its
/// clipped highlights and a low-contrast one stays low-contrast.
fn map_pixels(img: &GrayImage, f: impl Fn(f32) -> f32) -> GrayImage {
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p.0[0] = f(p.0[0] as f32).round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Add a constant intensity offset.
pub fn shift_brightness(img: &GrayImage, delta: i16) -> GrayImage {
    map_pixels(img, |v| v + delta as f32)
}

/// Scale intensities about the image mean.
pub fn scale_contrast(img: &GrayImage, factor: f32) -> GrayImage {
    let mean = mean_intensity(img);
    map_pixels(img, |v| (v - mean) * factor + mean)
}

pub fn mean_intensity(img: &GrayImage) -> f32 {
    let n = img.as_raw().len();
    if n == 0 {
        return 0.0;
    }
    img.as_raw().iter().map(|&b| b as f32).sum::<f32>() / n as f32
}

/// Sample from N(0, 1) via the Box-Muller transform.
fn standard_normal<R: Rng + ?Sized>(rng: &mut R) -> f32 {
    let u1: f32 = rng.gen_range(f32::EPSILON..1.0);
    let u2: f32 = rng.gen();
    (-2.0 * u1.ln()).sqrt() * (std::f32::consts::TAU * u2).cos()
}

/// Add zero-mean Gaussian noise with standard deviation `sigma`.
pub fn add_gaussian_noise<R: Rng + ?Sized>(img: &GrayImage, sigma: f32, rng: &mut R) -> GrayImage {
    let mut out = img.clone();
    for p in out.pixels_mut() {
        let v = p.0[0] as f32 + standard_normal(rng) * sigma;
        p.0[0] = v.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Force a `density` fraction of pixels to pure black or white, half each.
pub fn salt_and_pepper<R: Rng + ?Sized>(img: &GrayImage, density: f32, rng: &mut R) -> GrayImage {
    let half = density / 2.0;
    let mut out = img.clone();
    for p in out.pixels_mut() {
        let r: f32 = rng.gen();
        if r < half {
            p.0[0] = 0;
        } else if r > 1.0 - half {
            p.0[0] = 255;
        }
    }
    out
}

/// Sample with bilinear interpolation, replicating edge pixels outside the frame.
fn sample_bilinear(img: &GrayImage, sx: f32, sy: f32) -> f32 {
    let w = img.width() as i32;
    let h = img.height() as i32;
    let x0 = sx.floor() as i32;
    let y0 = sy.floor() as i32;
    let fx = sx - x0 as f32;
    let fy = sy - y0 as f32;

    let at = |x: i32, y: i32| -> f32 {
        let x = x.clamp(0, w - 1) as u32;
        let y = y.clamp(0, h - 1) as u32;
        img.get_pixel(x, y).0[0] as f32
    };

    at(x0, y0) * (1.0 - fx) * (1.0 - fy)
        + at(x0 + 1, y0) * fx * (1.0 - fy)
        + at(x0, y0 + 1) * (1.0 - fx) * fy
        + at(x0 + 1, y0 + 1) * fx * fy
}

/// Rotate by `degrees` and zoom by `scale` about the image centre, keeping
/// the output frame size. Out-of-frame samples replicate the border.
pub fn warp_about_center(img: &GrayImage, degrees: f32, scale: f32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 || scale <= 0.0 {
        return img.clone();
    }
    let cx = (w as f32 - 1.0) / 2.0;
    let cy = (h as f32 - 1.0) / 2.0;
    let (sin, cos) = degrees.to_radians().sin_cos();
    let inv = 1.0 / scale;

    let mut out = GrayImage::new(w, h);
    for (ox, oy, px) in out.enumerate_pixels_mut() {
        // Inverse map: src = R(-θ) · (dst - c) / s + c
        let dx = ox as f32 - cx;
        let dy = oy as f32 - cy;
        let sx = (cos * dx + sin * dy) * inv + cx;
        let sy = (-sin * dx + cos * dy) * inv + cy;
        *px = Luma([sample_bilinear(img, sx, sy).round().clamp(0.0, 255.0) as u8]);
    }
    out
}

/// Rotate about the centre and zoom in just enough that no border fill is
/// visible, then re-crop to the original frame.
pub fn rotate_and_crop(img: &GrayImage, degrees: f32) -> GrayImage {
    let (sin, cos) = degrees.to_radians().sin_cos();
    let fill = sin.abs() + cos.abs();
    warp_about_center(img, degrees, fill)
}

/// Global histogram equalization.
pub fn equalize_histogram(img: &GrayImage) -> GrayImage {
    let total = img.as_raw().len();
    if total == 0 {
        return img.clone();
    }
    let mut hist = [0u32; 256];
    for &v in img.as_raw() {
        hist[v as usize] += 1;
    }

    let mut cdf = [0u32; 256];
    let mut acc = 0u32;
    for (i, &count) in hist.iter().enumerate() {
        acc += count;
        cdf[i] = acc;
    }
    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    let denom = total as u32 - cdf_min;
    if denom == 0 {
        // Single-intensity image: nothing to spread.
        return img.clone();
    }

    let mut lut = [0u8; 256];
    for i in 0..256 {
        let v = (cdf[i].saturating_sub(cdf_min)) as f32 / denom as f32 * 255.0;
        lut[i] = v.round().clamp(0.0, 255.0) as u8;
    }
    let mut out = img.clone();
    for p in out.pixels_mut() {
        p.0[0] = lut[p.0[0] as usize];
    }
    out
}

/// Contrast-Limited Adaptive Histogram Equalization.
///
/// Divides the image into a `tiles` × `tiles` grid, clips each tile's
/// histogram at `clip_limit` (fraction of tile pixels), and bilinearly
/// interpolates between neighbouring tile CDFs.
pub fn clahe(img: &GrayImage, tiles: u32, clip_limit: f32) -> GrayImage {
    let w = img.width() as usize;
    let h = img.height() as usize;
    let t = tiles.max(1) as usize;
    let tile_w = w / t;
    let tile_h = h / t;
    if tile_w == 0 || tile_h == 0 {
        return img.clone();
    }
    let tile_pixels = tile_w * tile_h;
    let gray = img.as_raw();

    let mut cdfs: Vec<[f32; 256]> = Vec::with_capacity(t * t);
    for row in 0..t {
        for col in 0..t {
            let mut hist = [0u32; 256];
            for y in row * tile_h..(row + 1) * tile_h {
                for x in col * tile_w..(col + 1) * tile_w {
                    hist[gray[y * w + x] as usize] += 1;
                }
            }

            let clip = ((clip_limit * tile_pixels as f32) as u32).max(1);
            let mut excess = 0u32;
            for bin in hist.iter_mut() {
                if *bin > clip {
                    excess += *bin - clip;
                    *bin = clip;
                }
            }
            let redist = excess / 256;
            let leftover = (excess % 256) as usize;
            for (i, bin) in hist.iter_mut().enumerate() {
                *bin += redist;
                if i < leftover {
                    *bin += 1;
                }
            }

            let mut cdf = [0f32; 256];
            cdf[0] = hist[0] as f32;
            for i in 1..256 {
                cdf[i] = cdf[i - 1] + hist[i] as f32;
            }
            let cdf_min = cdf.iter().find(|&&v| v > 0.0).copied().unwrap_or(0.0);
            let denom = tile_pixels as f32 - cdf_min;
            if denom > 0.0 {
                for v in cdf.iter_mut() {
                    *v = ((*v - cdf_min) / denom * 255.0).clamp(0.0, 255.0);
                }
            }
            cdfs.push(cdf);
        }
    }

    let mut out = img.clone();
    for (x, y, px) in out.enumerate_pixels_mut() {
        let (x, y) = (x as usize, y as usize);
        let v = gray[y * w + x] as usize;

        let fy = (y as f32 / tile_h as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let fx = (x as f32 / tile_w as f32 - 0.5).clamp(0.0, (t - 1) as f32);
        let r0 = fy as usize;
        let c0 = fx as usize;
        let r1 = (r0 + 1).min(t - 1);
        let c1 = (c0 + 1).min(t - 1);
        let dy = fy - r0 as f32;
        let dx = fx - c0 as f32;

        let top = cdfs[r0 * t + c0][v] * (1.0 - dx) + cdfs[r0 * t + c1][v] * dx;
        let bot = cdfs[r1 * t + c0][v] * (1.0 - dx) + cdfs[r1 * t + c1][v] * dx;
        let val = top * (1.0 - dy) + bot * dy;
        px.0[0] = val.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// 1-D Gaussian kernel of odd length `size`, normalized to sum 1.
///
/// Sigma follows the usual derivation from kernel size:
/// `0.3 * ((size - 1) / 2 - 1) + 0.8`.
fn gaussian_kernel(size: u32) -> Vec<f32> {
    let size = (size.max(1) | 1) as i32;
    let radius = size / 2;
    let sigma = 0.3 * ((size - 1) as f32 * 0.5 - 1.0) + 0.8;
    let denom = 2.0 * sigma * sigma;
    let mut k: Vec<f32> = (-radius..=radius)
        .map(|i| (-(i * i) as f32 / denom).exp())
        .collect();
    let sum: f32 = k.iter().sum();
    for v in k.iter_mut() {
        *v /= sum;
    }
    k
}

/// Separable Gaussian blur with an explicit odd kernel size.
pub fn gaussian_blur(img: &GrayImage, kernel_size: u32) -> GrayImage {
    let (w, h) = img.dimensions();
    if w == 0 || h == 0 {
        return img.clone();
    }
    let k = gaussian_kernel(kernel_size);
    let r = (k.len() / 2) as i32;
    let src = img.as_raw();
    let (wi, hi) = (w as i32, h as i32);

    let mut horiz = vec![0f32; src.len()];
    for y in 0..hi {
        for x in 0..wi {
            let mut acc = 0.0;
            for (i, kv) in k.iter().enumerate() {
                let sx = (x + i as i32 - r).clamp(0, wi - 1);
                acc += src[(y * wi + sx) as usize] as f32 * kv;
            }
            horiz[(y * wi + x) as usize] = acc;
        }
    }

    let mut out = GrayImage::new(w, h);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let (x, y) = (x as i32, y as i32);
        let mut acc = 0.0;
        for (i, kv) in k.iter().enumerate() {
            let sy = (y + i as i32 - r).clamp(0, hi - 1);
            acc += horiz[(sy * wi + x) as usize] * kv;
        }
        px.0[0] = acc.round().clamp(0.0, 255.0) as u8;
    }
    out
}

/// Morphological structuring element shapes (3×3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    Square,
    Cross,
}

impl Element {
    fn offsets(self) -> &'static [(i32, i32)] {
        match self {
            Element::Square => &[
                (-1, -1), (0, -1), (1, -1),
                (-1, 0), (0, 0), (1, 0),
                (-1, 1), (0, 1), (1, 1),
            ],
            Element::Cross => &[(0, -1), (-1, 0), (0, 0), (1, 0), (0, 1)],
        }
    }
}

fn morph(img: &GrayImage, element: Element, pick_max: bool) -> GrayImage {
    let (w, h) = img.dimensions();
    let (wi, hi) = (w as i32, h as i32);
    let mut out = GrayImage::new(w, h);
    for (x, y, px) in out.enumerate_pixels_mut() {
        let mut acc = if pick_max { 0u8 } else { 255u8 };
        for &(dx, dy) in element.offsets() {
            let sx = (x as i32 + dx).clamp(0, wi - 1) as u32;
            let sy = (y as i32 + dy).clamp(0, hi - 1) as u32;
            let v = img.get_pixel(sx, sy).0[0];
            acc = if pick_max { acc.max(v) } else { acc.min(v) };
        }
        px.0[0] = acc;
    }
    out
}

pub fn erode(img: &GrayImage, element: Element) -> GrayImage {
    morph(img, element, false)
}

pub fn dilate(img: &GrayImage, element: Element) -> GrayImage {
    morph(img, element, true)
}

/// Opening: erosion followed by dilation. Removes small bright specks.
pub fn open(img: &GrayImage, element: Element) -> GrayImage {
    dilate(&erode(img, element), element)
}

/// Closing: dilation followed by erosion. Fills small dark gaps.
pub fn close(img: &GrayImage, element: Element) -> GrayImage {
    erode(&dilate(img, element), element)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn ramp(w: u32, h: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([((x * 2 + y) % 256) as u8]))
    }

    fn stddev(img: &GrayImage) -> f32 {
        let mean = mean_intensity(img);
        let n = img.as_raw().len() as f32;
        (img.as_raw().iter().map(|&b| (b as f32 - mean).powi(2)).sum::<f32>() / n).sqrt()
    }

    #[test]
    fn test_canonical_face_identity_when_already_canonical() {
        let img = ramp(FACE_SIZE, FACE_SIZE);
        assert_eq!(canonical_face(&img), img);
    }

    #[test]
    fn test_canonical_face_resizes() {
        let img = ramp(37, 64);
        let out = canonical_face(&img);
        assert_eq!(out.dimensions(), (FACE_SIZE, FACE_SIZE));
    }

    #[test]
    fn test_brightness_saturates() {
        let img = GrayImage::from_pixel(4, 4, Luma([250]));
        assert!(shift_brightness(&img, 40).pixels().all(|p| p.0[0] == 255));
        let img = GrayImage::from_pixel(4, 4, Luma([10]));
        assert!(shift_brightness(&img, -40).pixels().all(|p| p.0[0] == 0));
    }

    #[test]
    fn test_photometric_ops_do_not_stretch_range() {
        let img = GrayImage::from_fn(10, 10, |x, _| Luma([100 + x as u8]));
        let out = shift_brightness(&img, 10);
        let (lo, hi) = out
            .pixels()
            .fold((u8::MAX, 0), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
        assert_eq!((lo, hi), (110, 119));
    }

    #[test]
    fn test_contrast_preserves_uniform_image() {
        let img = GrayImage::from_pixel(8, 8, Luma([90]));
        assert_eq!(scale_contrast(&img, 1.5), img);
    }

    #[test]
    fn test_contrast_increases_spread() {
        let img = ramp(50, 50);
        assert!(stddev(&scale_contrast(&img, 1.4)) > stddev(&img));
    }

    #[test]
    fn test_warp_identity() {
        let img = ramp(20, 20);
        assert_eq!(warp_about_center(&img, 0.0, 1.0), img);
    }

    #[test]
    fn test_rotate_and_crop_uniform_stays_uniform() {
        // Border replication means no black corners appear.
        let img = GrayImage::from_pixel(30, 30, Luma([128]));
        let out = rotate_and_crop(&img, 13.0);
        assert!(out.pixels().all(|p| p.0[0] == 128));
    }

    #[test]
    fn test_equalize_spreads_to_full_range() {
        let img = GrayImage::from_fn(16, 16, |x, _| Luma([100 + (x % 8) as u8]));
        let out = equalize_histogram(&img);
        let max = out.pixels().map(|p| p.0[0]).max().unwrap();
        let min = out.pixels().map(|p| p.0[0]).min().unwrap();
        assert_eq!(max, 255);
        assert_eq!(min, 0);
    }

    #[test]
    fn test_equalize_single_value() {
        let img = GrayImage::from_pixel(5, 5, Luma([42]));
        assert_eq!(equalize_histogram(&img), img);
    }

    #[test]
    fn test_clahe_increases_contrast() {
        let img = GrayImage::from_fn(16, 16, |x, y| Luma([100 + ((y * 16 + x) % 11) as u8]));
        let out = clahe(&img, 2, 0.02);
        assert!(stddev(&out) > stddev(&img));
    }

    #[test]
    fn test_gaussian_kernel_normalized_and_symmetric() {
        let k = gaussian_kernel(5);
        assert_eq!(k.len(), 5);
        assert!((k.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!((k[0] - k[4]).abs() < 1e-6);
        assert!(k[2] > k[1]);
    }

    #[test]
    fn test_blur_reduces_variance() {
        let img = GrayImage::from_fn(20, 20, |x, y| Luma([if (x + y) % 2 == 0 { 0 } else { 255 }]));
        assert!(stddev(&gaussian_blur(&img, 5)) < stddev(&img));
    }

    #[test]
    fn test_noise_is_seed_deterministic() {
        let img = ramp(10, 10);
        let a = add_gaussian_noise(&img, 10.0, &mut StdRng::seed_from_u64(7));
        let b = add_gaussian_noise(&img, 10.0, &mut StdRng::seed_from_u64(7));
        assert_eq!(a, b);
        assert_ne!(a, img);
    }

    #[test]
    fn test_salt_and_pepper_density() {
        let img = GrayImage::from_pixel(100, 100, Luma([128]));
        let out = salt_and_pepper(&img, 0.1, &mut StdRng::seed_from_u64(3));
        let changed = out.pixels().filter(|p| p.0[0] != 128).count();
        // Expect ~1000 of 10000 pixels.
        assert!((600..1400).contains(&changed), "changed = {changed}");
        assert!(out.pixels().all(|p| matches!(p.0[0], 0 | 128 | 255)));
    }

    #[test]
    fn test_open_removes_single_bright_pixel() {
        let mut img = GrayImage::from_pixel(9, 9, Luma([20]));
        img.put_pixel(4, 4, Luma([255]));
        let out = open(&img, Element::Square);
        assert_eq!(out.get_pixel(4, 4).0[0], 20);
    }

    #[test]
    fn test_close_fills_single_dark_pixel() {
        let mut img = GrayImage::from_pixel(9, 9, Luma([200]));
        img.put_pixel(4, 4, Luma([0]));
        let out = close(&img, Element::Cross);
        assert_eq!(out.get_pixel(4, 4).0[0], 200);
    }
}
