//! Stochastic chip augmentation for descriptor stabilization.
//!
//! A single embedding of a face chip is noisy with respect to small pose and
//! crop variation. The pipeline therefore embeds several jittered copies of
//! the chip and averages the resulting descriptors. Each copy is zoomed,
//! rotated and translated a little bit differently, and randomly mirrored
//! left to right.

use crate::alignment::warp_similarity;
use image::RgbImage;
use rand::Rng;

/// Maximum zoom deviation from 1.0.
const MAX_ZOOM: f32 = 0.04;
/// Maximum rotation in radians (~2.9°).
const MAX_ROTATION: f32 = 0.05;
/// Maximum translation per axis, in pixels.
const MAX_TRANSLATION: f32 = 2.0;

/// Produce one randomly perturbed copy of a face chip.
///
/// The perturbation combines an independent random zoom, rotation and
/// translation about the chip center, plus a 50% left-right mirror. The RNG
/// is caller-supplied; the pipeline uses a per-thread source so concurrent
/// stabilization never serializes on random-number generation.
pub fn jitter_chip<R: Rng + ?Sized>(chip: &RgbImage, rng: &mut R) -> RgbImage {
    let size = chip.width();
    let center = (size as f32 - 1.0) / 2.0;

    let zoom = 1.0 + rng.gen_range(-MAX_ZOOM..=MAX_ZOOM);
    let angle = rng.gen_range(-MAX_ROTATION..=MAX_ROTATION);
    let dx = rng.gen_range(-MAX_TRANSLATION..=MAX_TRANSLATION);
    let dy = rng.gen_range(-MAX_TRANSLATION..=MAX_TRANSLATION);
    let mirror = rng.gen_bool(0.5);

    // dst = zoom * R(angle) * (src - center) + center + (dx, dy)
    let a = zoom * angle.cos();
    let b = zoom * angle.sin();
    let tx = center + dx - (a * center - b * center);
    let ty = center + dy - (b * center + a * center);
    let matrix = [a, -b, tx, b, a, ty];

    let mut out = warp_similarity(chip, &matrix, size);
    if mirror {
        image::imageops::flip_horizontal_in_place(&mut out);
    }
    out
}
