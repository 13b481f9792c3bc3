//! facerec-core — Face detection and recognition engine.
//!
//! Pipeline: detect faces, predict 68-point landmarks, extract aligned
//! 150×150 chips, embed each chip into a 128-dimensional descriptor
//! (averaged over jittered copies), and classify descriptors against a
//! replaceable sample set. Inference runs via ONNX Runtime on CPU; the
//! pipeline itself is generic over the model traits so it can be driven
//! by mocks in tests.

pub mod alignment;
pub mod classify;
pub mod detector;
pub mod embedder;
pub mod jitter;
pub mod landmarks;
pub mod pipeline;
pub mod store;
pub mod types;

pub use detector::Detector;
pub use embedder::Embedder;
pub use landmarks::ShapePredictor;
pub use pipeline::{OnnxRecognizer, RecognizeError, Recognizer};
pub use store::SampleStore;
pub use types::{Descriptor, Face, Landmarks, Rect, Sample, DESCRIPTOR_LEN, LANDMARK_COUNT};
