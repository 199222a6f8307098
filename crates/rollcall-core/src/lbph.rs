//! Local Binary Pattern Histogram descriptors.
//!
//! Each pixel is encoded by comparing its 8 radius-1 neighbours to the centre.
//! Codes are folded into the 59 "uniform pattern" bins (58 uniform patterns
//! plus one bin for everything else), histogrammed per cell of a fixed spatial
//! grid, and concatenated.

use image::GrayImage;
use std::sync::OnceLock;

pub const GRID_X: usize = 8;
pub const GRID_Y: usize = 8;
pub const UNIFORM_BINS: usize = 59;
pub const DESCRIPTOR_LEN: usize = GRID_X * GRID_Y * UNIFORM_BINS;

/// Clockwise neighbour offsets starting at top-left.
const NEIGHBOURS: [(i32, i32); 8] = [
    (-1, -1),
    (0, -1),
    (1, -1),
    (1, 0),
    (1, 1),
    (0, 1),
    (-1, 1),
    (-1, 0),
];

static UNIFORM_TABLE: OnceLock<[u8; 256]> = OnceLock::new();

/// Maps each 8-bit LBP code to its uniform bin (0..58), non-uniform codes to 58.
fn uniform_table() -> &'static [u8; 256] {
    UNIFORM_TABLE.get_or_init(|| {
        let mut table = [0u8; 256];
        let mut next = 0u8;
        for code in 0..=255u8 {
            let transitions = (code ^ code.rotate_left(1)).count_ones();
            table[code as usize] = if transitions <= 2 {
                let bin = next;
                next += 1;
                bin
            } else {
                (UNIFORM_BINS - 1) as u8
            };
        }
        table
    })
}

/// Compute the raw 8-bit LBP code image (border pixels are skipped).
fn lbp_codes(img: &GrayImage) -> (Vec<u8>, usize, usize) {
    let (w, h) = (img.width() as usize, img.height() as usize);
    if w < 3 || h < 3 {
        return (Vec::new(), 0, 0);
    }
    let px = img.as_raw();
    let (cw, ch) = (w - 2, h - 2);
    let mut codes = Vec::with_capacity(cw * ch);
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let center = px[y * w + x];
            let mut code = 0u8;
            for (bit, (dx, dy)) in NEIGHBOURS.iter().enumerate() {
                let nx = (x as i32 + dx) as usize;
                let ny = (y as i32 + dy) as usize;
                if px[ny * w + nx] >= center {
                    code |= 1 << (7 - bit);
                }
            }
            codes.push(code);
        }
    }
    (codes, cw, ch)
}

/// Spatial uniform-LBP histogram of a face image.
///
/// Every cell histogram is normalized to sum 1, so the descriptor is
/// independent of image size as long as the grid fits.
pub fn descriptor(img: &GrayImage) -> Vec<f32> {
    let table = uniform_table();
    let (codes, cw, ch) = lbp_codes(img);
    let mut out = vec![0f32; DESCRIPTOR_LEN];
    if cw < GRID_X || ch < GRID_Y {
        return out;
    }

    for gy in 0..GRID_Y {
        let y0 = gy * ch / GRID_Y;
        let y1 = (gy + 1) * ch / GRID_Y;
        for gx in 0..GRID_X {
            let x0 = gx * cw / GRID_X;
            let x1 = (gx + 1) * cw / GRID_X;
            let cell = &mut out[(gy * GRID_X + gx) * UNIFORM_BINS..][..UNIFORM_BINS];
            for y in y0..y1 {
                for x in x0..x1 {
                    cell[table[codes[y * cw + x] as usize] as usize] += 1.0;
                }
            }
            let n = ((y1 - y0) * (x1 - x0)) as f32;
            if n > 0.0 {
                for v in cell.iter_mut() {
                    *v /= n;
                }
            }
        }
    }
    out
}

/// Symmetric chi-square distance `Σ (a - b)² / (a + b)` between two descriptors.
///
/// Cell histograms have unit mass, so the result lies in `[0, 2 × cells]`.
pub fn chi_square(a: &[f32], b: &[f32]) -> f32 {
    let mut sum = 0.0f32;
    for (x, y) in a.iter().zip(b.iter()) {
        let s = x + y;
        if s > 0.0 {
            let d = x - y;
            sum += d * d / s;
        }
    }
    sum
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn checker(w: u32, h: u32, cell: u32) -> GrayImage {
        GrayImage::from_fn(w, h, |x, y| Luma([if (x / cell + y / cell) % 2 == 0 { 30 } else { 220 }]))
    }

    #[test]
    fn test_uniform_table_has_58_uniform_patterns() {
        let table = uniform_table();
        let uniform = table.iter().filter(|&&b| (b as usize) < UNIFORM_BINS - 1).count();
        assert_eq!(uniform, 58);
        assert!(table.iter().all(|&b| (b as usize) < UNIFORM_BINS));
        // All-zero and all-one codes are uniform.
        assert_ne!(table[0] as usize, UNIFORM_BINS - 1);
        assert_ne!(table[255] as usize, UNIFORM_BINS - 1);
        // 0b01010101 has 8 transitions.
        assert_eq!(table[0b0101_0101] as usize, UNIFORM_BINS - 1);
    }

    #[test]
    fn test_flat_image_codes_all_ones() {
        let img = GrayImage::from_pixel(5, 5, Luma([77]));
        let (codes, w, h) = lbp_codes(&img);
        assert_eq!((w, h), (3, 3));
        assert!(codes.iter().all(|&c| c == 255));
    }

    #[test]
    fn test_descriptor_cells_are_unit_mass() {
        let d = descriptor(&checker(100, 100, 7));
        assert_eq!(d.len(), DESCRIPTOR_LEN);
        for cell in d.chunks(UNIFORM_BINS) {
            assert!((cell.iter().sum::<f32>() - 1.0).abs() < 1e-4);
        }
    }

    #[test]
    fn test_descriptor_invariant_to_uniform_brightness_shift() {
        let a = checker(100, 100, 9);
        let b = GrayImage::from_fn(100, 100, |x, y| Luma([a.get_pixel(x, y).0[0] + 20]));
        assert_eq!(descriptor(&a), descriptor(&b));
    }

    #[test]
    fn test_chi_square_identity_and_bounds() {
        let a = descriptor(&checker(100, 100, 5));
        let b = descriptor(&GrayImage::from_pixel(100, 100, Luma([128])));
        assert_eq!(chi_square(&a, &a), 0.0);
        let d = chi_square(&a, &b);
        assert!(d > 0.0 && d <= 2.0 * (GRID_X * GRID_Y) as f32, "d = {d}");
        assert!((chi_square(&a, &b) - chi_square(&b, &a)).abs() < 1e-6);
    }

    #[test]
    fn test_tiny_image_yields_zero_descriptor() {
        let d = descriptor(&GrayImage::new(4, 4));
        assert!(d.iter().all(|&v| v == 0.0));
    }
}
