//! Face detection.
//!
//! The pipeline only needs rectangles; facial geometry comes from the shape
//! predictor afterwards. [`OnnxDetector`] runs an anchor-free single-stage
//! detector (SCRFD family) via ONNX Runtime with letterbox preprocessing and
//! NMS post-processing.

use crate::types::Rect;
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const DETECTOR_INPUT_SIZE: usize = 640;
const DETECTOR_MEAN: f32 = 127.5;
const DETECTOR_STD: f32 = 128.0;
const DETECTOR_CONFIDENCE_THRESHOLD: f32 = 0.5;
const DETECTOR_NMS_THRESHOLD: f32 = 0.4;
const DETECTOR_STRIDES: [usize; 3] = [8, 16, 32];
const DETECTOR_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Face detector contract: one image in, zero or more rectangles out.
///
/// Order of the returned rectangles is unspecified; callers that need a
/// stable order sort them. Implementations may be stateful across calls,
/// which is why `detect` takes `&mut self`; shared instances are serialized
/// by the pipeline.
pub trait Detector {
    fn detect(&mut self, img: &RgbImage) -> Result<Vec<Rect>, DetectorError>;
}

/// A candidate detection before NMS. Confidence is internal to the detector;
/// the pipeline contract exposes only rectangles.
struct Detection {
    left: f32,
    top: f32,
    right: f32,
    bottom: f32,
    confidence: f32,
}

/// Metadata for coordinate de-mapping after letterbox resize.
struct LetterboxInfo {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

/// ONNX-backed face detector.
pub struct OnnxDetector {
    session: Session,
    input_size: usize,
    /// Per-stride (score, bbox) output indices for strides [8, 16, 32].
    /// Discovered by name at load time; falls back to positional ordering.
    stride_indices: [(usize, usize); 3],
}

impl OnnxDetector {
    /// Load the detector ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        let output_names: Vec<String> =
            session.outputs().iter().map(|o| o.name().to_string()).collect();

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?output_names,
            "loaded face detector model"
        );

        if output_names.len() < 6 {
            return Err(DetectorError::InferenceFailed(format!(
                "detector model requires 6 outputs (3 strides × score/bbox), got {}",
                output_names.len()
            )));
        }

        let stride_indices = discover_output_indices(&output_names);
        tracing::debug!(?stride_indices, "detector output tensor mapping");

        Ok(Self {
            session,
            input_size: DETECTOR_INPUT_SIZE,
            stride_indices,
        })
    }

    /// Preprocess an RGB image into a NCHW float tensor with letterbox padding.
    fn preprocess(&self, img: &RgbImage) -> (Array4<f32>, LetterboxInfo) {
        let (width, height) = (img.width() as usize, img.height() as usize);
        let size = self.input_size;

        let scale = (size as f32 / width as f32).min(size as f32 / height as f32);
        let new_w = ((width as f32 * scale).round() as usize).max(1);
        let new_h = ((height as f32 * scale).round() as usize).max(1);
        let pad_x = (size - new_w) as f32 / 2.0;
        let pad_y = (size - new_h) as f32 / 2.0;
        let pad_x_start = pad_x.floor() as usize;
        let pad_y_start = pad_y.floor() as usize;

        let letterbox = LetterboxInfo { scale, pad_x, pad_y };

        // Pad value equals the mean, so padding normalizes to 0.0.
        let mut tensor =
            Array4::<f32>::from_elem((1, 3, size, size), 0.0);

        let inv_scale = 1.0 / scale;
        for y in 0..new_h {
            let src_y = (y as f32 + 0.5) * inv_scale - 0.5;
            let y0 = (src_y.floor() as i64).clamp(0, height as i64 - 1) as u32;
            let y1 = (y0 + 1).min(height as u32 - 1);
            let fy = (src_y - src_y.floor()).clamp(0.0, 1.0);

            for x in 0..new_w {
                let src_x = (x as f32 + 0.5) * inv_scale - 0.5;
                let x0 = (src_x.floor() as i64).clamp(0, width as i64 - 1) as u32;
                let x1 = (x0 + 1).min(width as u32 - 1);
                let fx = (src_x - src_x.floor()).clamp(0.0, 1.0);

                let tl = img.get_pixel(x0, y0).0;
                let tr = img.get_pixel(x1, y0).0;
                let bl = img.get_pixel(x0, y1).0;
                let br = img.get_pixel(x1, y1).0;

                for c in 0..3 {
                    let val = tl[c] as f32 * (1.0 - fx) * (1.0 - fy)
                        + tr[c] as f32 * fx * (1.0 - fy)
                        + bl[c] as f32 * (1.0 - fx) * fy
                        + br[c] as f32 * fx * fy;
                    tensor[[0, c, y + pad_y_start, x + pad_x_start]] =
                        (val - DETECTOR_MEAN) / DETECTOR_STD;
                }
            }
        }

        (tensor, letterbox)
    }
}

impl Detector for OnnxDetector {
    fn detect(&mut self, img: &RgbImage) -> Result<Vec<Rect>, DetectorError> {
        let (input, letterbox) = self.preprocess(img);

        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut all_detections = Vec::new();
        for (stride_pos, &stride) in DETECTOR_STRIDES.iter().enumerate() {
            let (score_idx, bbox_idx) = self.stride_indices[stride_pos];

            let (_, scores) = outputs[score_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("scores stride {stride}: {e}")))?;
            let (_, bboxes) = outputs[bbox_idx]
                .try_extract_tensor::<f32>()
                .map_err(|e| DetectorError::InferenceFailed(format!("bboxes stride {stride}: {e}")))?;

            all_detections.extend(decode_stride(
                scores,
                bboxes,
                stride,
                self.input_size,
                &letterbox,
                DETECTOR_CONFIDENCE_THRESHOLD,
            ));
        }

        let kept = nms(all_detections, DETECTOR_NMS_THRESHOLD);
        tracing::debug!(faces = kept.len(), "detector pass complete");

        let max_x = img.width() as i64 - 1;
        let max_y = img.height() as i64 - 1;
        Ok(kept
            .into_iter()
            .map(|d| {
                Rect::new(
                    (d.left.round() as i64).clamp(0, max_x),
                    (d.top.round() as i64).clamp(0, max_y),
                    (d.right.round() as i64).clamp(0, max_x),
                    (d.bottom.round() as i64).clamp(0, max_y),
                )
            })
            .collect())
    }
}

/// Discover output tensor ordering by name.
///
/// Exports may name tensors ("score_8", "bbox_16", ...) or use generic
/// numeric names. Falls back to positional ordering:
///   [0-2] = scores (strides 8, 16, 32), [3-5] = bboxes (strides 8, 16, 32).
fn discover_output_indices(names: &[String]) -> [(usize, usize); 3] {
    let find = |prefix: &str, stride: usize| -> Option<usize> {
        let target = format!("{prefix}_{stride}");
        names.iter().position(|n| n == &target)
    };

    let named = DETECTOR_STRIDES
        .iter()
        .all(|&stride| find("score", stride).is_some() && find("bbox", stride).is_some());

    if named {
        tracing::info!("detector: using name-based output tensor mapping");
        std::array::from_fn(|i| {
            let stride = DETECTOR_STRIDES[i];
            (find("score", stride).unwrap(), find("bbox", stride).unwrap())
        })
    } else {
        tracing::info!(
            ?names,
            "detector: output names not recognized, using positional mapping [0-2]=scores, [3-5]=bboxes"
        );
        [(0, 3), (1, 4), (2, 5)]
    }
}

/// Decode detections for a single stride level.
fn decode_stride(
    scores: &[f32],
    bboxes: &[f32],
    stride: usize,
    input_size: usize,
    letterbox: &LetterboxInfo,
    threshold: f32,
) -> Vec<Detection> {
    let grid = input_size / stride;
    let num_anchors = grid * grid * DETECTOR_ANCHORS_PER_CELL;

    let mut detections = Vec::new();
    for idx in 0..num_anchors {
        let score = scores.get(idx).copied().unwrap_or(0.0);
        if score <= threshold {
            continue;
        }

        let anchor_idx = idx / DETECTOR_ANCHORS_PER_CELL;
        let anchor_cx = (anchor_idx % grid) as f32 * stride as f32;
        let anchor_cy = (anchor_idx / grid) as f32 * stride as f32;

        let off = idx * 4;
        if off + 3 >= bboxes.len() {
            continue;
        }
        // Offsets are distances from the anchor center, in stride units.
        let x1 = anchor_cx - bboxes[off] * stride as f32;
        let y1 = anchor_cy - bboxes[off + 1] * stride as f32;
        let x2 = anchor_cx + bboxes[off + 2] * stride as f32;
        let y2 = anchor_cy + bboxes[off + 3] * stride as f32;

        detections.push(Detection {
            left: (x1 - letterbox.pad_x) / letterbox.scale,
            top: (y1 - letterbox.pad_y) / letterbox.scale,
            right: (x2 - letterbox.pad_x) / letterbox.scale,
            bottom: (y2 - letterbox.pad_y) / letterbox.scale,
            confidence: score,
        });
    }

    detections
}

/// Non-Maximum Suppression: remove overlapping detections.
fn nms(mut detections: Vec<Detection>, iou_threshold: f32) -> Vec<Detection> {
    detections.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });

    let mut keep: Vec<Detection> = Vec::new();
    for det in detections {
        if keep.iter().all(|k| iou(k, &det) <= iou_threshold) {
            keep.push(det);
        }
    }
    keep
}

/// Intersection-over-Union between two candidate detections.
fn iou(a: &Detection, b: &Detection) -> f32 {
    let x1 = a.left.max(b.left);
    let y1 = a.top.max(b.top);
    let x2 = a.right.min(b.right);
    let y2 = a.bottom.min(b.bottom);

    let inter = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let area_a = (a.right - a.left) * (a.bottom - a.top);
    let area_b = (b.right - b.left) * (b.bottom - b.top);
    let union = area_a + area_b - inter;

    if union > 0.0 {
        inter / union
    } else {
        0.0
    }
}
