//! Descriptor extraction from aligned face chips.
//!
//! Maps one 150×150 chip to a raw 128-dimensional descriptor. Descriptor
//! stabilization (jitter + averaging) lives in the pipeline; this module is
//! the single-evaluation contract.

use crate::types::{Descriptor, DESCRIPTOR_LEN};
use image::RgbImage;
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

const EMBEDDER_INPUT_SIZE: u32 = 150;
const EMBEDDER_MEAN: f32 = 127.5;
const EMBEDDER_STD: f32 = 127.5;

#[derive(Error, Debug)]
pub enum EmbedderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("chip must be {expected}×{expected} pixels, got {width}×{height}")]
    BadChipSize { expected: u32, width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Embedding network contract: one aligned chip in, one raw descriptor out.
///
/// Implementations process a single chip per call and may be stateful, so
/// `embed` takes `&mut self`; the pipeline serializes the shared instance
/// and re-acquires it per evaluation.
pub trait Embedder {
    fn embed(&mut self, chip: &RgbImage) -> Result<Descriptor, EmbedderError>;
}

/// ONNX-backed 128-dimensional face embedder.
pub struct OnnxEmbedder {
    session: Session,
}

impl OnnxEmbedder {
    /// Load the embedding ONNX model from the given path.
    pub fn load(model_path: &str) -> Result<Self, EmbedderError> {
        if !Path::new(model_path).exists() {
            return Err(EmbedderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face embedding model"
        );

        Ok(Self { session })
    }

    /// Preprocess a 150×150 RGB chip into a NCHW float tensor with symmetric
    /// normalization.
    fn preprocess(chip: &RgbImage) -> Array4<f32> {
        let size = EMBEDDER_INPUT_SIZE as usize;
        let mut tensor = Array4::<f32>::zeros((1, 3, size, size));

        for (x, y, pixel) in chip.enumerate_pixels() {
            for c in 0..3 {
                tensor[[0, c, y as usize, x as usize]] =
                    (pixel.0[c] as f32 - EMBEDDER_MEAN) / EMBEDDER_STD;
            }
        }

        tensor
    }
}

impl Embedder for OnnxEmbedder {
    fn embed(&mut self, chip: &RgbImage) -> Result<Descriptor, EmbedderError> {
        if chip.dimensions() != (EMBEDDER_INPUT_SIZE, EMBEDDER_INPUT_SIZE) {
            return Err(EmbedderError::BadChipSize {
                expected: EMBEDDER_INPUT_SIZE,
                width: chip.width(),
                height: chip.height(),
            });
        }

        let input = Self::preprocess(chip);
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let (_, raw) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EmbedderError::InferenceFailed(format!("descriptor extraction: {e}")))?;

        Descriptor::from_slice(raw).ok_or_else(|| {
            EmbedderError::InferenceFailed(format!(
                "expected {DESCRIPTOR_LEN}-dim descriptor, got {}",
                raw.len()
            ))
        })
    }
}
