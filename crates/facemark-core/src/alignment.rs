//! Warps a located face onto the canonical 112×112 ArcFace crop.
//!
//! A least-squares similarity transform (uniform scale, rotation,
//! translation) maps the five face landmarks onto the reference layout.

use crate::normalize::NormalizedImage;
use crate::types::{FaceRegion, Landmarks};
use image::{Rgb, RgbImage};

/// Landmark positions ArcFace was trained on, in 112×112 crop pixels.
const REFERENCE_LANDMARKS_112: Landmarks = [
    (38.2946, 51.6963), // left eye
    (73.5318, 51.5014), // right eye
    (56.0252, 71.7366), // nose
    (41.5493, 92.3655), // left mouth
    (70.7299, 92.2041), // right mouth
];

pub const ALIGNED_SIZE: u32 = 112;

/// Least-squares similarity transform taking `src` onto `dst`.
///
/// Returns [a, -b, tx, b, a, ty] representing the matrix:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
/// or `None` when the landmarks are degenerate (e.g. all coincident).
fn estimate_similarity_transform(src: &Landmarks, dst: &Landmarks) -> Option<[f32; 6]> {
    let n = src.len() as f32;
    let mean_x = src.iter().map(|p| p.0).sum::<f32>() / n;
    let mean_y = src.iter().map(|p| p.1).sum::<f32>() / n;
    let spread: f32 = src
        .iter()
        .map(|(x, y)| (x - mean_x).powi(2) + (y - mean_y).powi(2))
        .sum();
    if spread < 1e-6 {
        return None;
    }

    // Normal equations for A * [a, b, tx, ty]^T = B, two rows per point pair:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [[0.0f32; 4]; 4];
    let mut atb = [0.0f32; 4];

    for ((sx, sy), (dx, dy)) in src.iter().copied().zip(dst.iter().copied()) {
        let r1 = [sx, -sy, 1.0, 0.0];
        let r2 = [sy, sx, 0.0, 1.0];

        for j in 0..4 {
            for k in 0..4 {
                ata[j][k] += r1[j] * r1[k] + r2[j] * r2[k];
            }
            atb[j] += r1[j] * dx + r2[j] * dy;
        }
    }

    let [a, b, tx, ty] = solve_4x4(ata, atb)?;
    Some([a, -b, tx, b, a, ty])
}

/// Gaussian elimination with partial pivoting; `None` when singular.
#[allow(clippy::needless_range_loop)]
fn solve_4x4(ata: [[f32; 4]; 4], atb: [f32; 4]) -> Option<[f32; 4]> {
    // Augmented matrix [A | b]
    let mut m = [[0.0f32; 5]; 4];
    for i in 0..4 {
        m[i][..4].copy_from_slice(&ata[i]);
        m[i][4] = atb[i];
    }

    for col in 0..4 {
        let max_row = (col..4)
            .max_by(|&r1, &r2| m[r1][col].abs().total_cmp(&m[r2][col].abs()))
            .unwrap_or(col);
        m.swap(col, max_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            return None;
        }

        for row in (col + 1)..4 {
            let factor = m[row][col] / pivot;
            for j in col..5 {
                m[row][j] -= factor * m[col][j];
            }
        }
    }

    let mut x = [0.0f32; 4];
    for i in (0..4).rev() {
        x[i] = m[i][4];
        for j in (i + 1)..4 {
            x[i] -= m[i][j] * x[j];
        }
        x[i] /= m[i][i];
    }

    x.iter().all(|v| v.is_finite()).then_some(x)
}

/// Apply a 2×3 similarity warp to produce a square RGB output.
///
/// Uses bilinear interpolation. Out-of-bounds pixels are filled with black.
fn warp_affine(src: &RgbImage, matrix: &[f32; 6], out_size: u32) -> Option<RgbImage> {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    // Invert the 2x2 part: M = [[a, -b], [b, a]], det = a^2 + b^2
    let det = a * a + b * b;
    if det < 1e-12 {
        return None;
    }
    let ia = a / det;
    let ib = b / det;

    let (w, h) = (src.width() as i32, src.height() as i32);
    let sample = |x: i32, y: i32, c: usize| -> f32 {
        if x >= 0 && x < w && y >= 0 && y < h {
            src.get_pixel(x as u32, y as u32).0[c] as f32
        } else {
            0.0
        }
    };

    let mut output = RgbImage::new(out_size, out_size);
    for (ox, oy, pixel) in output.enumerate_pixels_mut() {
        // src = M_inv * (dst - t)
        let dx = ox as f32 - tx;
        let dy = oy as f32 - ty;
        let sx = ia * dx + ib * dy;
        let sy = -ib * dx + ia * dy;

        let x0 = sx.floor() as i32;
        let y0 = sy.floor() as i32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let channel = |c: usize| -> u8 {
            let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                + sample(x0 + 1, y0 + 1, c) * fx * fy;
            val.round().clamp(0.0, 255.0) as u8
        };
        *pixel = Rgb([channel(0), channel(1), channel(2)]);
    }

    Some(output)
}

/// Approximate landmarks for a region that came without them, by laying
/// the reference layout over the box.
pub fn landmarks_from_region(region: &FaceRegion) -> Landmarks {
    let sx = region.width() as f32 / ALIGNED_SIZE as f32;
    let sy = region.height() as f32 / ALIGNED_SIZE as f32;
    REFERENCE_LANDMARKS_112.map(|(x, y)| (region.left as f32 + x * sx, region.top as f32 + y * sy))
}

/// Align a detected face to a canonical 112×112 RGB crop.
///
/// Uses the region's landmarks when present, otherwise
/// [`landmarks_from_region`]. Returns `None` if the transform is degenerate.
pub fn align_face(image: &NormalizedImage, region: &FaceRegion) -> Option<RgbImage> {
    let landmarks = region
        .landmarks
        .unwrap_or_else(|| landmarks_from_region(region));
    if landmarks.iter().any(|(x, y)| !x.is_finite() || !y.is_finite()) {
        return None;
    }
    let matrix = estimate_similarity_transform(&landmarks, &REFERENCE_LANDMARKS_112)?;
    warp_affine(image.raster(), &matrix, ALIGNED_SIZE)
}
