//! Face-chip extraction via 4-DOF similarity transform.
//!
//! Five anchor points are derived from the 68 predicted landmarks, a
//! least-squares similarity transform maps them to canonical positions,
//! and the face region is warped into a fixed 150×150 chip with a 0.25
//! margin ratio around the face.

use crate::types::Landmarks;
use image::{Rgb, RgbImage};

/// Output chip edge length in pixels.
pub const CHIP_SIZE: u32 = 150;
/// Margin ratio: the face occupies the central `1 / (1 + 2 * padding)`
/// fraction of the chip, leaving context around jawline and forehead.
pub const CHIP_PADDING: f32 = 0.25;

/// Canonical five-point positions for a tight 112×112 face crop
/// (left eye, right eye, nose tip, left mouth corner, right mouth corner).
const BASE_LANDMARKS_112: [(f32, f32); 5] = [
    (38.2946, 51.6963),
    (73.5318, 51.5014),
    (56.0252, 71.7366),
    (41.5493, 92.3655),
    (70.7299, 92.2041),
];

/// Scale the canonical positions into a `size`-pixel chip with the given
/// margin ratio: the tight 112 geometry shrinks to the central region and
/// shifts by the border width.
fn reference_landmarks(size: u32, padding: f32) -> [(f32, f32); 5] {
    let inner = size as f32 / (1.0 + 2.0 * padding);
    let border = padding * inner;
    BASE_LANDMARKS_112.map(|(x, y)| (x / 112.0 * inner + border, y / 112.0 * inner + border))
}

/// Reduce the 68-point landmark set to the five alignment anchors:
/// eye centers (mean of the six points of each eye), nose tip, mouth corners.
fn anchor_points(landmarks: &Landmarks) -> [(f32, f32); 5] {
    let eye_center = |range: std::ops::RangeInclusive<usize>| -> (f32, f32) {
        let mut sx = 0.0f32;
        let mut sy = 0.0f32;
        let n = range.clone().count() as f32;
        for i in range {
            let (x, y) = landmarks.point(i);
            sx += x as f32;
            sy += y as f32;
        }
        (sx / n, sy / n)
    };

    let nose = landmarks.point(30);
    let left_mouth = landmarks.point(48);
    let right_mouth = landmarks.point(54);

    [
        eye_center(36..=41),
        eye_center(42..=47),
        (nose.0 as f32, nose.1 as f32),
        (left_mouth.0 as f32, left_mouth.1 as f32),
        (right_mouth.0 as f32, right_mouth.1 as f32),
    ]
}

/// Estimate a 2×3 similarity transform (scale, rotation, translation) from
/// `src` to `dst` points by least-squares.
///
/// Returns [a, -b, tx, b, a, ty] representing:
/// ```text
/// | a  -b  tx |
/// | b   a  ty |
/// ```
fn estimate_similarity_transform(src: &[(f32, f32); 5], dst: &[(f32, f32); 5]) -> [f32; 6] {
    // Overdetermined system A * [a, b, tx, ty]^T = B; for each pair:
    //   sx * a - sy * b + tx = dx
    //   sy * a + sx * b + ty = dy
    let mut ata = [0.0f32; 16];
    let mut atb = [0.0f32; 4];

    for i in 0..5 {
        let (sx, sy) = src[i];
        let (dx, dy) = dst[i];
        let rows = [([sx, -sy, 1.0, 0.0], dx), ([sy, sx, 0.0, 1.0], dy)];
        for (row, rhs) in rows {
            for j in 0..4 {
                for k in 0..4 {
                    ata[j * 4 + k] += row[j] * row[k];
                }
                atb[j] += row[j] * rhs;
            }
        }
    }

    let x = solve_4x4(&ata, &atb);
    [x[0], -x[1], x[2], x[1], x[0], x[3]]
}

/// Solve a 4×4 linear system by Gaussian elimination with partial pivoting.
fn solve_4x4(ata: &[f32; 16], atb: &[f32; 4]) -> [f32; 4] {
    let mut m = [[0.0f32; 5]; 4];
    for (i, row) in m.iter_mut().enumerate() {
        row[..4].copy_from_slice(&ata[i * 4..i * 4 + 4]);
        row[4] = atb[i];
    }

    for col in 0..4 {
        let mut pivot_row = col;
        for row in (col + 1)..4 {
            if m[row][col].abs() > m[pivot_row][col].abs() {
                pivot_row = row;
            }
        }
        m.swap(col, pivot_row);

        let pivot = m[col][col];
        if pivot.abs() < 1e-12 {
            // Degenerate anchor configuration; fall back to identity.
            return [1.0, 0.0, 0.0, 0.0];
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
    x
}

/// Apply a 2×3 similarity warp to an RGB image, producing a square output.
///
/// Samples with bilinear interpolation; out-of-bounds pixels are black.
/// Shared by chip extraction and the jitter augmenter.
pub(crate) fn warp_similarity(img: &RgbImage, matrix: &[f32; 6], out_size: u32) -> RgbImage {
    let (a, tx) = (matrix[0], matrix[2]);
    let (b, ty) = (matrix[3], matrix[5]);

    // Invert the 2x2 part [[a, -b], [b, a]]: det = a^2 + b^2.
    let det = a * a + b * b;
    if det.abs() < 1e-12 {
        return RgbImage::new(out_size, out_size);
    }
    let ia = a / det;
    let ib = b / det;

    let width = img.width() as i64;
    let height = img.height() as i64;
    let mut out = RgbImage::new(out_size, out_size);

    for oy in 0..out_size {
        for ox in 0..out_size {
            let dx = ox as f32 - tx;
            let dy = oy as f32 - ty;
            let sx = ia * dx + ib * dy;
            let sy = -ib * dx + ia * dy;

            let x0 = sx.floor() as i64;
            let y0 = sy.floor() as i64;
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let sample = |x: i64, y: i64, c: usize| -> f32 {
                if x >= 0 && x < width && y >= 0 && y < height {
                    img.get_pixel(x as u32, y as u32).0[c] as f32
                } else {
                    0.0
                }
            };

            let mut px = [0u8; 3];
            for (c, out_c) in px.iter_mut().enumerate() {
                let val = sample(x0, y0, c) * (1.0 - fx) * (1.0 - fy)
                    + sample(x0 + 1, y0, c) * fx * (1.0 - fy)
                    + sample(x0, y0 + 1, c) * (1.0 - fx) * fy
                    + sample(x0 + 1, y0 + 1, c) * fx * fy;
                *out_c = val.round().clamp(0.0, 255.0) as u8;
            }
            out.put_pixel(ox, oy, Rgb(px));
        }
    }

    out
}

/// Extract a normalized 150×150 face chip from the image, aligned by the
/// 68-point landmark set. This is the input unit of the embedder.
pub fn extract_chip(img: &RgbImage, landmarks: &Landmarks) -> RgbImage {
    let src = anchor_points(landmarks);
    let dst = reference_landmarks(CHIP_SIZE, CHIP_PADDING);
    let matrix = estimate_similarity_transform(&src, &dst);
    warp_similarity(img, &matrix, CHIP_SIZE)
}
