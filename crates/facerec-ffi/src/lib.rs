//! facerec — C boundary for the face recognition pipeline.
//!
//! Exposes a narrow synchronous surface for foreign callers: init with a
//! model directory, recognize raw image bytes into flat rectangle /
//! landmark / descriptor buffers, replace the classification sample set,
//! classify a descriptor, free the handle. All outputs the caller must
//! free are allocated with `malloc`, so plain `free(3)` works from C.
//!
//! # Safety
//!
//! All Rust logic is wrapped in `catch_unwind` — a panic unwinding across
//! the `extern "C"` boundary is undefined behavior. Failures surface as an
//! error code plus a malloc'd message, never as partial results.

#![allow(non_camel_case_types)]
#![warn(unsafe_op_in_unsafe_fn)]

use facerec_core::{Descriptor, Face, OnnxRecognizer, Sample, DESCRIPTOR_LEN, LANDMARK_COUNT};
use libc::{c_char, c_int, c_long, c_void, size_t};
use std::ffi::CStr;
use std::panic;
use std::path::Path;
use std::ptr;

/// Error codes shared with the C header.
pub const FACEREC_OK: c_int = 0;
pub const IMAGE_LOAD_ERROR: c_int = 1;
pub const SERIALIZATION_ERROR: c_int = 2;
pub const UNKNOWN_ERROR: c_int = 3;

/// Sentinel category for "no match".
pub const FACEREC_NO_MATCH: c_int = -1;

const RECT_LEN: usize = 4;
const FEATURE_LEN: usize = LANDMARK_COUNT * 2;

/// Recognizer handle — mirrors `struct facerec` in the C header.
///
/// On init failure `cls` is null and `err_str`/`err_code` describe the
/// fault; the caller still owns the struct and frees it via
/// [`facerec_free`] (plus `free` on `err_str`).
#[repr(C)]
pub struct facerec {
    cls: *mut c_void,
    err_str: *mut c_char,
    err_code: c_int,
}

/// Recognition result — mirrors `struct faceret` in the C header.
///
/// Per face: 4 longs in `rectangles` (left, top, right, bottom), 136 longs
/// in `features` (68 (x, y) pairs in landmark-index order), 128 floats in
/// `descriptors`. Buffers are null when `num_faces` is 0 or on error.
#[repr(C)]
pub struct faceret {
    num_faces: c_int,
    rectangles: *mut c_long,
    features: *mut c_long,
    descriptors: *mut f32,
    err_str: *mut c_char,
    err_code: c_int,
}

/// `strdup` via `malloc`, so C callers release the message with `free(3)`.
/// Interior NUL bytes are replaced rather than truncating the message.
fn c_strdup(s: &str) -> *mut c_char {
    let sanitized: Vec<u8> = s.bytes().map(|b| if b == 0 { b'?' } else { b }).collect();
    let len = sanitized.len();
    // SAFETY: allocating len + 1 bytes and writing exactly that many.
    unsafe {
        let buf = libc::malloc(len + 1) as *mut u8;
        if buf.is_null() {
            return ptr::null_mut();
        }
        ptr::copy_nonoverlapping(sanitized.as_ptr(), buf, len);
        *buf.add(len) = 0;
        buf as *mut c_char
    }
}

/// Allocate a zeroed C struct with `calloc`; the caller frees with `free`.
fn calloc_struct<T>() -> *mut T {
    // SAFETY: calloc returns zeroed memory of the requested size; both
    // boundary structs are plain-old-data for which zeroed is valid.
    unsafe { libc::calloc(1, std::mem::size_of::<T>() as size_t) as *mut T }
}

/// Copy a slice into a fresh malloc'd buffer.
fn malloc_copy<T: Copy>(data: &[T]) -> *mut T {
    let bytes = std::mem::size_of_val(data);
    // SAFETY: allocating exactly `bytes` and copying `data.len()` elements.
    unsafe {
        let buf = libc::malloc(bytes) as *mut T;
        if !buf.is_null() {
            ptr::copy_nonoverlapping(data.as_ptr(), buf, data.len());
        }
        buf
    }
}

/// Decode an encoded image buffer into RGB pixels, mapping any decode
/// failure to [`IMAGE_LOAD_ERROR`].
fn decode_image(bytes: &[u8]) -> Result<image::RgbImage, (c_int, String)> {
    if bytes.is_empty() {
        return Err((IMAGE_LOAD_ERROR, "empty image buffer".to_string()));
    }
    image::load_from_memory(bytes)
        .map(|img| img.to_rgb8())
        .map_err(|e| (IMAGE_LOAD_ERROR, e.to_string()))
}

/// Flatten faces into the three index-aligned flat buffers of the C layout.
fn flatten_faces(faces: &[Face]) -> (Vec<c_long>, Vec<c_long>, Vec<f32>) {
    let mut rectangles = Vec::with_capacity(faces.len() * RECT_LEN);
    let mut features = Vec::with_capacity(faces.len() * FEATURE_LEN);
    let mut descriptors = Vec::with_capacity(faces.len() * DESCRIPTOR_LEN);

    for face in faces {
        rectangles.extend_from_slice(&[
            face.rect.left as c_long,
            face.rect.top as c_long,
            face.rect.right as c_long,
            face.rect.bottom as c_long,
        ]);
        for &(x, y) in face.landmarks.points() {
            features.push(x as c_long);
            features.push(y as c_long);
        }
        descriptors.extend_from_slice(&face.descriptor.0);
    }

    (rectangles, features, descriptors)
}

/// Borrow the pipeline out of a handle; `None` when the handle or its
/// `cls` pointer is null (init failed or already freed).
unsafe fn pipeline<'a>(rec: *mut facerec) -> Option<&'a OnnxRecognizer> {
    if rec.is_null() {
        return None;
    }
    // SAFETY: caller guarantees `rec` is a live handle from facerec_init.
    let cls = unsafe { (*rec).cls };
    if cls.is_null() {
        None
    } else {
        // SAFETY: non-null cls is always a Box<OnnxRecognizer> we created.
        Some(unsafe { &*(cls as *const OnnxRecognizer) })
    }
}

/// Create a recognizer from the model artifacts in `model_dir`.
///
/// Always returns an owned struct (even on failure) so the caller can read
/// `err_code`/`err_str`; release it with [`facerec_free`].
///
/// # Safety
///
/// `model_dir` must be a valid NUL-terminated string or null.
#[no_mangle]
pub unsafe extern "C" fn facerec_init(model_dir: *const c_char) -> *mut facerec {
    let rec = calloc_struct::<facerec>();
    if rec.is_null() {
        return ptr::null_mut();
    }

    let result = panic::catch_unwind(|| {
        if model_dir.is_null() {
            return Err((UNKNOWN_ERROR, "model_dir is null".to_string()));
        }
        // SAFETY: non-null model_dir is a valid C string per the contract.
        let dir = unsafe { CStr::from_ptr(model_dir) }
            .to_str()
            .map_err(|_| (UNKNOWN_ERROR, "model_dir is not valid UTF-8".to_string()))?;

        OnnxRecognizer::open(Path::new(dir)).map_err(|e| (init_error_code(&e), e.to_string()))
    });

    // SAFETY: rec is the struct allocated above.
    unsafe {
        match result {
            Ok(Ok(pipeline)) => {
                (*rec).cls = Box::into_raw(Box::new(pipeline)) as *mut c_void;
                (*rec).err_code = FACEREC_OK;
            }
            Ok(Err((code, msg))) => {
                (*rec).err_str = c_strdup(&msg);
                (*rec).err_code = code;
            }
            Err(_) => {
                (*rec).err_str = c_strdup("panic during initialization");
                (*rec).err_code = UNKNOWN_ERROR;
            }
        }
    }
    rec
}

/// Map an initialization failure to its boundary code: missing or
/// unloadable model artifacts are deserialization errors, anything else is
/// unknown.
fn init_error_code(err: &facerec_core::RecognizeError) -> c_int {
    use facerec_core::RecognizeError as E;
    match err {
        E::Detector(facerec_core::detector::DetectorError::ModelNotFound(_))
        | E::Detector(facerec_core::detector::DetectorError::Ort(_))
        | E::Predictor(facerec_core::landmarks::PredictorError::ModelNotFound(_))
        | E::Predictor(facerec_core::landmarks::PredictorError::Ort(_))
        | E::Embedder(facerec_core::embedder::EmbedderError::ModelNotFound(_))
        | E::Embedder(facerec_core::embedder::EmbedderError::Ort(_)) => SERIALIZATION_ERROR,
        _ => UNKNOWN_ERROR,
    }
}

fn ret_error(ret: *mut faceret, code: c_int, msg: &str) -> *mut faceret {
    // SAFETY: ret is a live struct allocated by the caller of this helper.
    unsafe {
        (*ret).err_str = c_strdup(msg);
        (*ret).err_code = code;
    }
    ret
}

/// Recognize every face in an encoded image buffer.
///
/// `max_faces <= 0` means unlimited; when more faces are present than
/// `max_faces` the call succeeds with `num_faces == 0`. `jitter` is the
/// number of augmented embedding evaluations per face.
///
/// # Safety
///
/// `rec` must be a handle from [`facerec_init`]; `img_data` must point to
/// `len` readable bytes. The returned struct and its buffers are released
/// by the caller with `free(3)`.
#[no_mangle]
pub unsafe extern "C" fn facerec_recognize(
    rec: *mut facerec,
    img_data: *const u8,
    len: c_int,
    max_faces: c_int,
    jitter: c_int,
) -> *mut faceret {
    let ret = calloc_struct::<faceret>();
    if ret.is_null() {
        return ptr::null_mut();
    }

    let result = panic::catch_unwind(|| {
        // SAFETY: deref of rec is guarded inside `pipeline`.
        let pipeline = unsafe { pipeline(rec) }
            .ok_or((UNKNOWN_ERROR, "recognizer handle is not initialized".to_string()))?;
        if img_data.is_null() || len < 0 {
            return Err((IMAGE_LOAD_ERROR, "empty image buffer".to_string()));
        }
        // SAFETY: img_data points to len readable bytes per the contract.
        let bytes = unsafe { std::slice::from_raw_parts(img_data, len as usize) };
        let img = decode_image(bytes)?;

        pipeline
            .recognize(&img, max_faces.max(0) as u32, jitter.max(0) as u32)
            .map_err(|e| (UNKNOWN_ERROR, e.to_string()))
    });

    let faces = match result {
        Ok(Ok(faces)) => faces,
        Ok(Err((code, msg))) => return ret_error(ret, code, &msg),
        Err(_) => return ret_error(ret, UNKNOWN_ERROR, "panic during recognition"),
    };

    // SAFETY: ret is the struct allocated above; buffers are sized to
    // num_faces × their per-face width.
    unsafe {
        (*ret).num_faces = faces.len() as c_int;
        if !faces.is_empty() {
            let (rectangles, features, descriptors) = flatten_faces(&faces);
            (*ret).rectangles = malloc_copy(&rectangles);
            (*ret).features = malloc_copy(&features);
            (*ret).descriptors = malloc_copy(&descriptors);
        }
    }
    ret
}

/// Replace the classification sample set.
///
/// `samples` holds `len` concatenated 128-float descriptors; `cats` holds
/// `len` category IDs, index-aligned. The swap is atomic with respect to
/// concurrent classification.
///
/// # Safety
///
/// `rec` must be a handle from [`facerec_init`]; `samples` must point to
/// `len * 128` floats and `cats` to `len` ints.
#[no_mangle]
pub unsafe extern "C" fn facerec_set_samples(
    rec: *mut facerec,
    samples: *const f32,
    cats: *const i32,
    len: c_int,
) {
    let _ = panic::catch_unwind(|| {
        // SAFETY: deref of rec is guarded inside `pipeline`.
        let Some(pipeline) = (unsafe { pipeline(rec) }) else {
            return;
        };
        if len < 0 || (len > 0 && (samples.is_null() || cats.is_null())) {
            return;
        }
        let count = len as usize;
        // SAFETY: buffer extents per the contract above.
        let descr = unsafe { std::slice::from_raw_parts(samples, count * DESCRIPTOR_LEN) };
        let categories = unsafe { std::slice::from_raw_parts(cats, count) };

        let mut set = Vec::with_capacity(count);
        for i in 0..count {
            let window = &descr[i * DESCRIPTOR_LEN..(i + 1) * DESCRIPTOR_LEN];
            if let Some(descriptor) = Descriptor::from_slice(window) {
                set.push(Sample::new(descriptor, categories[i]));
            }
        }
        pipeline.set_samples(set);
    });
}

/// Classify one 128-float descriptor; returns the category ID or
/// [`FACEREC_NO_MATCH`] when the store is empty or the handle is invalid.
///
/// # Safety
///
/// `rec` must be a handle from [`facerec_init`]; `test_sample` must point
/// to 128 floats.
#[no_mangle]
pub unsafe extern "C" fn facerec_classify(rec: *mut facerec, test_sample: *const f32) -> c_int {
    // SAFETY: contract as above; forwarded with no distance cutoff.
    unsafe { classify_impl(rec, test_sample, f32::INFINITY) }
}

/// Like [`facerec_classify`] with an acceptance cutoff: candidates whose
/// squared Euclidean distance exceeds `max_sq_distance` are ignored.
///
/// # Safety
///
/// Same contract as [`facerec_classify`].
#[no_mangle]
pub unsafe extern "C" fn facerec_classify_threshold(
    rec: *mut facerec,
    test_sample: *const f32,
    max_sq_distance: f32,
) -> c_int {
    // SAFETY: contract as above.
    unsafe { classify_impl(rec, test_sample, max_sq_distance) }
}

unsafe fn classify_impl(rec: *mut facerec, test_sample: *const f32, max_sq: f32) -> c_int {
    let result = panic::catch_unwind(|| {
        // SAFETY: deref of rec is guarded inside `pipeline`.
        let pipeline = unsafe { pipeline(rec) }?;
        if test_sample.is_null() {
            return None;
        }
        // SAFETY: test_sample points to 128 floats per the contract.
        let values = unsafe { std::slice::from_raw_parts(test_sample, DESCRIPTOR_LEN) };
        let descriptor = Descriptor::from_slice(values)?;
        pipeline.classify_with_threshold(&descriptor, max_sq)
    });

    match result {
        Ok(Some(category)) => category as c_int,
        _ => FACEREC_NO_MATCH,
    }
}

/// Release a recognizer handle. Null-safe and idempotent: freeing a null
/// or already-freed handle is a no-op.
///
/// # Safety
///
/// `rec` must be null or a handle from [`facerec_init`] not yet freed.
#[no_mangle]
pub unsafe extern "C" fn facerec_free(rec: *mut facerec) {
    if rec.is_null() {
        return;
    }
    // SAFETY: rec was allocated by calloc in facerec_init; cls, if set, is
    // a Box<OnnxRecognizer>; err_str, if set, came from c_strdup.
    unsafe {
        if !(*rec).cls.is_null() {
            drop(Box::from_raw((*rec).cls as *mut OnnxRecognizer));
            (*rec).cls = ptr::null_mut();
        }
        if !(*rec).err_str.is_null() {
            libc::free((*rec).err_str as *mut c_void);
            (*rec).err_str = ptr::null_mut();
        }
        libc::free(rec as *mut c_void);
    }
}
