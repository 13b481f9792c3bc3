//! 68-point facial landmark prediction.
//!
//! Given an image and a face rectangle, produce the iBUG 300-W landmark set.
//! The trait takes `&self`: landmark extraction is call-local work and the
//! pipeline shares one predictor across calls without its own lock.

use crate::types::{Landmarks, Rect, LANDMARK_COUNT};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

const LANDMARK_INPUT_SIZE: usize = 112;
const LANDMARK_OUTPUT_LEN: usize = LANDMARK_COUNT * 2;
/// Fraction by which the face rectangle is expanded before cropping; the
/// regressor is trained on loose crops that include the full jawline.
const LANDMARK_CROP_MARGIN: f32 = 0.15;

#[derive(Error, Debug)]
pub enum PredictorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Shape predictor contract: (image, rectangle) → 68 landmark points.
pub trait ShapePredictor {
    fn predict(&self, img: &RgbImage, rect: Rect) -> Result<Landmarks, PredictorError>;
}

/// ONNX-backed 68-point landmark regressor.
///
/// The session sits behind an internal mutex because ONNX Runtime requires
/// exclusive access per run; the predictor still presents the lock-free
/// `&self` contract to the pipeline.
pub struct OnnxShapePredictor {
    session: Mutex<Session>,
}

impl OnnxShapePredictor {
    /// Load the landmark ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, PredictorError> {
        if !Path::new(model_path).exists() {
            return Err(PredictorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded shape predictor model"
        );

        Ok(Self { session: Mutex::new(session) })
    }

    /// Crop the expanded face rectangle and resize to the model input size.
    ///
    /// Returns the tensor plus the crop origin and dimensions used to map the
    /// regressed points back to image space.
    fn preprocess(img: &RgbImage, rect: Rect) -> (Array4<f32>, (f32, f32, f32, f32)) {
        let margin_x = rect.width() as f32 * LANDMARK_CROP_MARGIN;
        let margin_y = rect.height() as f32 * LANDMARK_CROP_MARGIN;
        let crop_left = rect.left as f32 - margin_x;
        let crop_top = rect.top as f32 - margin_y;
        let crop_w = (rect.width() as f32 + 2.0 * margin_x).max(1.0);
        let crop_h = (rect.height() as f32 + 2.0 * margin_y).max(1.0);

        let size = LANDMARK_INPUT_SIZE;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        let max_x = img.width() as i64 - 1;
        let max_y = img.height() as i64 - 1;
        for y in 0..size {
            // Nearest-neighbor sampling; the regressor is robust to the
            // sub-pixel error and the crop is discarded immediately after.
            let src_y = crop_top + (y as f32 + 0.5) / size as f32 * crop_h;
            let sy = (src_y.floor() as i64).clamp(0, max_y) as u32;
            for x in 0..size {
                let src_x = crop_left + (x as f32 + 0.5) / size as f32 * crop_w;
                let sx = (src_x.floor() as i64).clamp(0, max_x) as u32;
                let px = img.get_pixel(sx, sy).0;
                for c in 0..3 {
                    tensor[[0, c, y, x]] = px[c] as f32 / 255.0;
                }
            }
        }

        (tensor, (crop_left, crop_top, crop_w, crop_h))
    }
}

impl ShapePredictor for OnnxShapePredictor {
    fn predict(&self, img: &RgbImage, rect: Rect) -> Result<Landmarks, PredictorError> {
        let (input, (crop_left, crop_top, crop_w, crop_h)) = Self::preprocess(img, rect);

        let mut session = self.session.lock();
        let outputs = session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| PredictorError::InferenceFailed(format!("landmark regression: {e}")))?;

        if raw.len() < LANDMARK_OUTPUT_LEN {
            return Err(PredictorError::InferenceFailed(format!(
                "expected {LANDMARK_OUTPUT_LEN} landmark values, got {}",
                raw.len()
            )));
        }

        // Regressed coordinates are normalized to the crop; map to pixels.
        let mut points = [(0i64, 0i64); LANDMARK_COUNT];
        for (i, point) in points.iter_mut().enumerate() {
            let nx = raw[i * 2];
            let ny = raw[i * 2 + 1];
            *point = (
                (crop_left + nx * crop_w).round() as i64,
                (crop_top + ny * crop_h).round() as i64,
            );
        }

        Ok(Landmarks(points))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_preprocess_output_shape() {
        let img = RgbImage::from_pixel(200, 200, image::Rgb([100, 100, 100]));
        let (tensor, _) = OnnxShapePredictor::preprocess(&img, Rect::new(50, 50, 150, 150));
        assert_eq!(tensor.shape(), &[1, 3, LANDMARK_INPUT_SIZE, LANDMARK_INPUT_SIZE]);
    }

    #[test]
    fn test_preprocess_normalizes_to_unit_range() {
        let img = RgbImage::from_pixel(100, 100, image::Rgb([255, 0, 51]));
        let (tensor, _) = OnnxShapePredictor::preprocess(&img, Rect::new(10, 10, 90, 90));
        assert!((tensor[[0, 0, 50, 50]] - 1.0).abs() < 1e-6);
        assert!(tensor[[0, 1, 50, 50]].abs() < 1e-6);
        assert!((tensor[[0, 2, 50, 50]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_preprocess_crop_geometry_includes_margin() {
        let img = RgbImage::new(400, 400);
        let rect = Rect::new(100, 100, 300, 300);
        let (_, (crop_left, crop_top, crop_w, crop_h)) =
            OnnxShapePredictor::preprocess(&img, rect);

        // 200-wide box with 15% margin each side → 260-wide crop at (70, 70).
        assert!((crop_left - 70.0).abs() < 1e-4);
        assert!((crop_top - 70.0).abs() < 1e-4);
        assert!((crop_w - 260.0).abs() < 1e-4);
        assert!((crop_h - 260.0).abs() < 1e-4);
    }

    #[test]
    fn test_preprocess_degenerate_rect_does_not_panic() {
        let img = RgbImage::new(50, 50);
        let (tensor, (_, _, crop_w, crop_h)) =
            OnnxShapePredictor::preprocess(&img, Rect::new(10, 10, 10, 10));
        assert_eq!(tensor.shape()[2], LANDMARK_INPUT_SIZE);
        assert!(crop_w >= 1.0);
        assert!(crop_h >= 1.0);
    }
}
