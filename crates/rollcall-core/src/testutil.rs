//! Synthetic faces and stub collaborators shared by unit tests.

use image::{GrayImage, Luma};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::atomic::{AtomicUsize, Ordering};

use crate::locator::{sort_by_area, FaceLocator, LocatorError};
use crate::types::BoundingBox;

/// A bright oval on a dark background with darker eyes and mouth.
pub fn oval_face() -> GrayImage {
    GrayImage::from_fn(100, 100, |x, y| {
        let (fx, fy) = (x as f32 - 50.0, y as f32 - 50.0);
        let inside = (fx / 36.0).powi(2) + (fy / 46.0).powi(2) <= 1.0;
        let eye = ((fx.abs() - 15.0).powi(2) + (fy + 12.0).powi(2)) <= 36.0;
        let mouth = fx.abs() <= 14.0 && (fy - 22.0).abs() <= 3.0;
        let v = if !inside {
            40.0
        } else if eye || mouth {
            60.0
        } else {
            170.0 + fy * 0.6
        };
        Luma([v as u8])
    })
}

/// 10-pixel checkerboard; texture-wise very different from [`oval_face`].
pub fn checker_face() -> GrayImage {
    GrayImage::from_fn(100, 100, |x, y| {
        Luma([if (x / 10 + y / 10) % 2 == 0 { 35 } else { 215 }])
    })
}

/// Seeded uniform noise. No pixel is black, so [`TileLocator`] sees one tile.
pub fn noise_face(seed: u64) -> GrayImage {
    let mut rng = StdRng::seed_from_u64(seed);
    GrayImage::from_fn(100, 100, |_, _| Luma([rng.gen_range(1..=255u8)]))
}

/// Paste `tiles` side by side on a black frame, 20px apart.
pub fn group_photo(tiles: &[&GrayImage]) -> GrayImage {
    let width = tiles.iter().map(|t| t.width() + 20).sum::<u32>() + 20;
    let height = tiles.iter().map(|t| t.height()).max().unwrap_or(0) + 40;
    let mut frame = GrayImage::from_pixel(width, height, Luma([0]));
    let mut x = 20;
    for tile in tiles {
        image::imageops::replace(&mut frame, *tile, x as i64, 20);
        x += tile.width() + 20;
    }
    frame
}

/// Reports every run of non-black columns as one face. Counts calls.
#[derive(Default)]
pub struct TileLocator {
    calls: AtomicUsize,
}

impl TileLocator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl FaceLocator for TileLocator {
    fn locate(&self, image: &GrayImage) -> Result<Vec<BoundingBox>, LocatorError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let (w, h) = image.dimensions();
        let lit = |x: u32, y: u32| image.get_pixel(x, y).0[0] > 0;
        let col_lit = |x: u32| (0..h).any(|y| lit(x, y));

        let mut boxes = Vec::new();
        let mut x = 0;
        while x < w {
            if !col_lit(x) {
                x += 1;
                continue;
            }
            let x0 = x;
            while x < w && col_lit(x) {
                x += 1;
            }
            let rows: Vec<u32> = (0..h).filter(|&y| (x0..x).any(|c| lit(c, y))).collect();
            let (y0, y1) = (rows[0], rows[rows.len() - 1] + 1);
            boxes.push(BoundingBox {
                x: x0 as f32,
                y: y0 as f32,
                width: (x - x0) as f32,
                height: (y1 - y0) as f32,
                confidence: 0.99,
            });
        }
        sort_by_area(&mut boxes);
        Ok(boxes)
    }

    fn name(&self) -> &'static str {
        "tile"
    }
}
