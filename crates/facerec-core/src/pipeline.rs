//! Recognition pipeline and resource sharing.
//!
//! One [`Recognizer`] owns the three model objects and the sample store.
//! The detector and the embedder are each a single expensive stateful
//! instance behind its own mutex, so detection for one call can overlap
//! with embedding work for another. The shape predictor is stateless with
//! respect to calls and shared without a pipeline-level lock. The sample
//! store takes many concurrent readers or one writer.
//!
//! Everything else — landmark extraction, chip warping, jitter transforms,
//! distance computation — is call-local and needs no synchronization.

use crate::alignment::extract_chip;
use crate::classify;
use crate::detector::{Detector, DetectorError, OnnxDetector};
use crate::embedder::{Embedder, EmbedderError, OnnxEmbedder};
use crate::jitter::jitter_chip;
use crate::landmarks::{OnnxShapePredictor, PredictorError, ShapePredictor};
use crate::store::SampleStore;
use crate::types::{Descriptor, Face, Sample};
use image::RgbImage;
use parking_lot::Mutex;
use std::path::Path;
use thiserror::Error;

/// Model artifact file names expected inside a model directory.
pub const DETECTOR_MODEL_FILE: &str = "face_detector.onnx";
pub const SHAPE_MODEL_FILE: &str = "shape_predictor_68.onnx";
pub const EMBEDDING_MODEL_FILE: &str = "face_embedding_r128.onnx";

#[derive(Error, Debug)]
pub enum RecognizeError {
    #[error("detector error: {0}")]
    Detector(#[from] DetectorError),
    #[error("shape predictor error: {0}")]
    Predictor(#[from] PredictorError),
    #[error("embedder error: {0}")]
    Embedder(#[from] EmbedderError),
}

/// Face recognition service instance.
///
/// Construct one per process (or several in tests); all state is owned
/// explicitly, there are no process globals. All methods take `&self` and
/// are safe to call from many threads at once.
pub struct Recognizer<D, P, E> {
    detector: Mutex<D>,
    predictor: P,
    embedder: Mutex<E>,
    samples: SampleStore,
}

/// The production pipeline over the ONNX model implementations.
pub type OnnxRecognizer = Recognizer<OnnxDetector, OnnxShapePredictor, OnnxEmbedder>;

impl OnnxRecognizer {
    /// Load the three model artifacts from `model_dir` and assemble the
    /// pipeline. Fails fast with the collaborator's error if an artifact is
    /// missing or not deserializable.
    pub fn open(model_dir: &Path) -> Result<Self, RecognizeError> {
        let path = |file: &str| model_dir.join(file).to_string_lossy().into_owned();

        let detector = OnnxDetector::load(&path(DETECTOR_MODEL_FILE))?;
        let predictor = OnnxShapePredictor::load(&path(SHAPE_MODEL_FILE))?;
        let embedder = OnnxEmbedder::load(&path(EMBEDDING_MODEL_FILE))?;

        tracing::info!(dir = %model_dir.display(), "recognizer models loaded");
        Ok(Recognizer::new(detector, predictor, embedder))
    }
}

impl<D: Detector, P: ShapePredictor, E: Embedder> Recognizer<D, P, E> {
    pub fn new(detector: D, predictor: P, embedder: E) -> Self {
        Self {
            detector: Mutex::new(detector),
            predictor,
            embedder: Mutex::new(embedder),
            samples: SampleStore::new(),
        }
    }

    /// Locate every face in the image and compute landmarks and a
    /// stabilized descriptor for each, in deterministic left-to-right
    /// rectangle order.
    ///
    /// `max_faces == 0` means unlimited. When more than `max_faces` faces
    /// are present the call returns an empty result without doing any
    /// landmark or embedding work: crowded images are an expected input,
    /// not a fault. `jitter` is the number of augmented evaluations per
    /// face; 0 degenerates to a single unperturbed evaluation.
    pub fn recognize(
        &self,
        img: &RgbImage,
        max_faces: u32,
        jitter: u32,
    ) -> Result<Vec<Face>, RecognizeError> {
        let mut rects = {
            let mut detector = self.detector.lock();
            detector.detect(img)?
        };

        if rects.is_empty() || (max_faces > 0 && rects.len() > max_faces as usize) {
            tracing::debug!(
                found = rects.len(),
                max_faces,
                "short-circuit: empty result without landmark or embedding work"
            );
            return Ok(Vec::new());
        }

        // Deterministic output order, independent of detector internals.
        rects.sort();

        let mut faces = Vec::with_capacity(rects.len());
        for rect in rects {
            let landmarks = self.predictor.predict(img, rect)?;
            let chip = extract_chip(img, &landmarks);
            let descriptor = self.stabilize(&chip, jitter)?;
            faces.push(Face { rect, landmarks, descriptor });
        }

        tracing::debug!(faces = faces.len(), jitter, "recognize complete");
        Ok(faces)
    }

    /// Recognize expecting exactly one face; `None` when the image holds
    /// zero or several faces.
    pub fn recognize_single(
        &self,
        img: &RgbImage,
        jitter: u32,
    ) -> Result<Option<Face>, RecognizeError> {
        let mut faces = self.recognize(img, 1, jitter)?;
        if faces.len() == 1 {
            Ok(faces.pop())
        } else {
            Ok(None)
        }
    }

    /// Compute the stabilized descriptor for one chip: the elementwise mean
    /// of `jitter` independently perturbed evaluations.
    ///
    /// The embedder lock is re-acquired for each evaluation, so it is never
    /// held across jitter transforms or across another call's detection.
    fn stabilize(&self, chip: &RgbImage, jitter: u32) -> Result<Descriptor, RecognizeError> {
        if jitter == 0 {
            return Ok(self.embedder.lock().embed(chip)?);
        }

        let mut rng = rand::thread_rng();
        let mut evaluations = Vec::with_capacity(jitter as usize);
        for _ in 0..jitter {
            let variant = jitter_chip(chip, &mut rng);
            let descriptor = self.embedder.lock().embed(&variant)?;
            evaluations.push(descriptor);
        }

        // jitter >= 1 here, so the mean always exists.
        Ok(Descriptor::mean(evaluations.iter()).unwrap_or_else(Descriptor::zeroed))
    }

    /// Atomically replace the classification sample set.
    pub fn set_samples(&self, samples: Vec<Sample>) {
        tracing::debug!(count = samples.len(), "replacing sample set");
        self.samples.replace(samples);
    }

    /// Classify a descriptor against the current sample set; `None` means
    /// no match (including the empty-store case).
    pub fn classify(&self, descriptor: &Descriptor) -> Option<i32> {
        let snapshot = self.samples.snapshot();
        classify::classify(&snapshot, descriptor)
    }

    /// Like [`classify`](Self::classify), but rejects matches whose squared
    /// Euclidean distance exceeds `max_squared_distance`.
    pub fn classify_with_threshold(
        &self,
        descriptor: &Descriptor,
        max_squared_distance: f32,
    ) -> Option<i32> {
        let snapshot = self.samples.snapshot();
        classify::classify_with_threshold(&snapshot, descriptor, max_squared_distance)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Landmarks, Rect, LANDMARK_COUNT};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn _assert_shareable<T: Send + Sync>() {}
    #[allow(dead_code)]
    fn _recognizer_is_shareable() {
        _assert_shareable::<Recognizer<MockDetector, MockPredictor, MockEmbedder>>();
    }

    struct MockDetector {
        rects: Vec<Rect>,
        calls: Arc<AtomicUsize>,
    }

    impl Detector for MockDetector {
        fn detect(&mut self, _img: &RgbImage) -> Result<Vec<Rect>, DetectorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.rects.clone())
        }
    }

    struct MockPredictor {
        calls: Arc<AtomicUsize>,
    }

    impl ShapePredictor for MockPredictor {
        fn predict(&self, _img: &RgbImage, rect: Rect) -> Result<Landmarks, PredictorError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Encode the rectangle into the landmarks so tests can verify
            // index alignment between rects and landmark sets.
            Ok(Landmarks([(rect.left, rect.top); LANDMARK_COUNT]))
        }
    }

    /// Returns a descriptor whose first element is the 1-based call number.
    struct MockEmbedder {
        calls: Arc<AtomicUsize>,
    }

    impl Embedder for MockEmbedder {
        fn embed(&mut self, _chip: &RgbImage) -> Result<Descriptor, EmbedderError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            let mut d = Descriptor::zeroed();
            d.0[0] = n as f32;
            Ok(d)
        }
    }

    struct Counters {
        detector: Arc<AtomicUsize>,
        predictor: Arc<AtomicUsize>,
        embedder: Arc<AtomicUsize>,
    }

    fn recognizer_with(
        rects: Vec<Rect>,
    ) -> (Recognizer<MockDetector, MockPredictor, MockEmbedder>, Counters) {
        let counters = Counters {
            detector: Arc::new(AtomicUsize::new(0)),
            predictor: Arc::new(AtomicUsize::new(0)),
            embedder: Arc::new(AtomicUsize::new(0)),
        };
        let rec = Recognizer::new(
            MockDetector { rects, calls: Arc::clone(&counters.detector) },
            MockPredictor { calls: Arc::clone(&counters.predictor) },
            MockEmbedder { calls: Arc::clone(&counters.embedder) },
        );
        (rec, counters)
    }

    fn test_image() -> RgbImage {
        RgbImage::new(320, 240)
    }

    fn rect_at(left: i64) -> Rect {
        Rect::new(left, 10, left + 50, 60)
    }

    fn descriptor_at(first: f32) -> Descriptor {
        let mut d = Descriptor::zeroed();
        d.0[0] = first;
        d
    }

    #[test]
    fn test_zero_faces_is_empty_success() {
        let (rec, counters) = recognizer_with(vec![]);
        let faces = rec.recognize(&test_image(), 0, 3).unwrap();
        assert!(faces.is_empty());
        assert_eq!(counters.detector.load(Ordering::SeqCst), 1);
        assert_eq!(counters.predictor.load(Ordering::SeqCst), 0);
        assert_eq!(counters.embedder.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_too_many_faces_short_circuits() {
        let (rec, counters) = recognizer_with(vec![rect_at(0), rect_at(100)]);
        let faces = rec.recognize(&test_image(), 1, 3).unwrap();
        assert!(faces.is_empty());
        // No landmark or embedding work was performed.
        assert_eq!(counters.predictor.load(Ordering::SeqCst), 0);
        assert_eq!(counters.embedder.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_max_faces_zero_means_unlimited() {
        let (rec, _) = recognizer_with(vec![rect_at(0), rect_at(100), rect_at(200)]);
        let faces = rec.recognize(&test_image(), 0, 0).unwrap();
        assert_eq!(faces.len(), 3);
    }

    #[test]
    fn test_faces_come_back_in_sorted_rect_order() {
        let (rec, _) = recognizer_with(vec![rect_at(200), rect_at(0), rect_at(100)]);
        let faces = rec.recognize(&test_image(), 0, 0).unwrap();

        let lefts: Vec<i64> = faces.iter().map(|f| f.rect.left).collect();
        assert_eq!(lefts, vec![0, 100, 200]);
        // Landmarks stay aligned with their rectangle after sorting.
        for face in &faces {
            assert_eq!(face.landmarks.point(0), (face.rect.left, face.rect.top));
        }
    }

    #[test]
    fn test_result_sequences_share_length() {
        let (rec, _) = recognizer_with(vec![rect_at(0), rect_at(100)]);
        let faces = rec.recognize(&test_image(), 5, 2).unwrap();
        assert_eq!(faces.len(), 2);
        for face in &faces {
            assert_eq!(face.landmarks.points().len(), LANDMARK_COUNT);
        }
    }

    #[test]
    fn test_stabilize_averages_jitter_evaluations() {
        // The mock embedder yields 1.0, 2.0, 3.0 across calls; the
        // stabilized descriptor is their elementwise mean.
        let (rec, counters) = recognizer_with(vec![rect_at(0)]);
        let faces = rec.recognize(&test_image(), 0, 3).unwrap();
        assert_eq!(counters.embedder.load(Ordering::SeqCst), 3);
        assert!((faces[0].descriptor.0[0] - 2.0).abs() < 1e-6);
    }

    #[test]
    fn test_jitter_zero_is_a_single_raw_evaluation() {
        let (rec, counters) = recognizer_with(vec![rect_at(0)]);
        let faces = rec.recognize(&test_image(), 0, 0).unwrap();
        assert_eq!(counters.embedder.load(Ordering::SeqCst), 1);
        assert!((faces[0].descriptor.0[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_jitter_one_equals_that_single_variant() {
        let (rec, counters) = recognizer_with(vec![rect_at(0)]);
        let faces = rec.recognize(&test_image(), 0, 1).unwrap();
        assert_eq!(counters.embedder.load(Ordering::SeqCst), 1);
        assert!((faces[0].descriptor.0[0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_detector_error_propagates() {
        struct FailingDetector;
        impl Detector for FailingDetector {
            fn detect(&mut self, _img: &RgbImage) -> Result<Vec<Rect>, DetectorError> {
                Err(DetectorError::InferenceFailed("boom".into()))
            }
        }
        let rec = Recognizer::new(
            FailingDetector,
            MockPredictor { calls: Arc::new(AtomicUsize::new(0)) },
            MockEmbedder { calls: Arc::new(AtomicUsize::new(0)) },
        );
        let err = rec.recognize(&test_image(), 0, 0).unwrap_err();
        assert!(matches!(err, RecognizeError::Detector(_)));
    }

    #[test]
    fn test_recognize_single_rejects_multiple_faces() {
        let (rec, counters) = recognizer_with(vec![rect_at(0), rect_at(100)]);
        assert!(rec.recognize_single(&test_image(), 0).unwrap().is_none());
        // Short-circuited before any per-face work.
        assert_eq!(counters.embedder.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_recognize_single_accepts_exactly_one() {
        let (rec, _) = recognizer_with(vec![rect_at(40)]);
        let face = rec.recognize_single(&test_image(), 0).unwrap().unwrap();
        assert_eq!(face.rect.left, 40);
    }

    #[test]
    fn test_set_samples_then_classify_roundtrip() {
        let (rec, _) = recognizer_with(vec![]);
        let d1 = descriptor_at(1.0);
        let d2 = descriptor_at(5.0);
        rec.set_samples(vec![
            Sample::new(d1.clone(), 7),
            Sample::new(d2.clone(), 9),
        ]);
        assert_eq!(rec.classify(&d1), Some(7));
        assert_eq!(rec.classify(&d2), Some(9));
    }

    #[test]
    fn test_classify_empty_store_is_no_match() {
        let (rec, _) = recognizer_with(vec![]);
        assert_eq!(rec.classify(&descriptor_at(0.0)), None);
    }

    #[test]
    fn test_classify_with_threshold_rejects_distant_query() {
        let (rec, _) = recognizer_with(vec![]);
        rec.set_samples(vec![Sample::new(descriptor_at(0.0), 3)]);
        let far = descriptor_at(2.0);
        assert_eq!(rec.classify_with_threshold(&far, 0.36), None);
        assert_eq!(rec.classify(&far), Some(3));
    }

    #[test]
    fn test_sample_replacement_is_visible_to_later_classifies() {
        let (rec, _) = recognizer_with(vec![]);
        let d = descriptor_at(1.0);
        rec.set_samples(vec![Sample::new(d.clone(), 1)]);
        assert_eq!(rec.classify(&d), Some(1));
        rec.set_samples(vec![Sample::new(d.clone(), 2)]);
        assert_eq!(rec.classify(&d), Some(2));
        rec.set_samples(Vec::new());
        assert_eq!(rec.classify(&d), None);
    }

    #[test]
    fn test_concurrent_recognize_and_classify() {
        let (rec, _) = recognizer_with(vec![rect_at(0)]);
        let rec = Arc::new(rec);
        rec.set_samples(vec![Sample::new(descriptor_at(0.0), 1)]);

        std::thread::scope(|scope| {
            for _ in 0..4 {
                let rec = Arc::clone(&rec);
                scope.spawn(move || {
                    let img = test_image();
                    for _ in 0..20 {
                        let faces = rec.recognize(&img, 0, 2).unwrap();
                        assert_eq!(faces.len(), 1);
                        assert!(rec.classify(&descriptor_at(0.0)).is_some());
                    }
                });
            }
        });
    }
}
