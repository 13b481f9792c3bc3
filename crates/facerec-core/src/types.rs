use serde::{Deserialize, Serialize};

/// Serde support for fixed-size arrays longer than 32 elements, which the
/// derive cannot handle. Wire format matches the derive's: a plain sequence.
mod serde_array {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S, T, const N: usize>(arr: &[T; N], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
        T: Serialize,
    {
        arr[..].serialize(serializer)
    }

    pub fn deserialize<'de, D, T, const N: usize>(deserializer: D) -> Result<[T; N], D::Error>
    where
        D: Deserializer<'de>,
        T: Deserialize<'de>,
    {
        let values = Vec::<T>::deserialize(deserializer)?;
        let len = values.len();
        values
            .try_into()
            .map_err(|_| serde::de::Error::invalid_length(len, &"a fixed-length array"))
    }
}

/// Length of a face descriptor vector.
pub const DESCRIPTOR_LEN: usize = 128;

/// Number of landmark points produced by the shape predictor.
pub const LANDMARK_COUNT: usize = 68;

/// Face bounding rectangle in image pixel space.
///
/// The derived `Ord` is lexicographic over (left, top, right, bottom); the
/// pipeline sorts detections by it so that output index `i` is stable for a
/// given set of detections regardless of detector-internal ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Rect {
    pub left: i64,
    pub top: i64,
    pub right: i64,
    pub bottom: i64,
}

impl Rect {
    pub fn new(left: i64, top: i64, right: i64, bottom: i64) -> Self {
        Self { left, top, right, bottom }
    }

    pub fn width(&self) -> i64 {
        self.right - self.left
    }

    pub fn height(&self) -> i64 {
        self.bottom - self.top
    }
}

/// The 68 (x, y) landmark points for one face, index-aligned with its [`Rect`].
///
/// Point indices follow the iBUG 300-W annotation scheme: 0–16 jawline,
/// 17–26 eyebrows, 27–35 nose, 36–47 eyes, 48–67 mouth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Landmarks(#[serde(with = "serde_array")] pub [(i64, i64); LANDMARK_COUNT]);

impl Landmarks {
    pub fn point(&self, idx: usize) -> (i64, i64) {
        self.0[idx]
    }

    pub fn points(&self) -> &[(i64, i64); LANDMARK_COUNT] {
        &self.0
    }
}

/// 128-dimensional face descriptor, L2-comparable.
///
/// Descriptors of the same identity land close together: for this embedding
/// family a Euclidean distance of 0.6 or less usually means the same person.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Descriptor(#[serde(with = "serde_array")] pub [f32; DESCRIPTOR_LEN]);

impl Descriptor {
    pub fn zeroed() -> Self {
        Self([0.0; DESCRIPTOR_LEN])
    }

    /// Build a descriptor from a slice; `None` if the length is wrong.
    pub fn from_slice(values: &[f32]) -> Option<Self> {
        let arr: [f32; DESCRIPTOR_LEN] = values.try_into().ok()?;
        Some(Self(arr))
    }

    /// Squared Euclidean distance. Cheaper than [`euclidean_distance`](Self::euclidean_distance)
    /// and order-equivalent, so the classifier ranks by it directly.
    pub fn squared_distance(&self, other: &Descriptor) -> f32 {
        self.0
            .iter()
            .zip(other.0.iter())
            .map(|(a, b)| (a - b) * (a - b))
            .sum()
    }

    /// Euclidean distance between two descriptors.
    pub fn euclidean_distance(&self, other: &Descriptor) -> f32 {
        self.squared_distance(other).sqrt()
    }

    /// Probability-style score that two descriptors belong to the same person.
    /// 0.85 or greater usually means the same identity.
    pub fn similarity_probability(&self, other: &Descriptor) -> f32 {
        1.0 - self.euclidean_distance(other) / 4.0
    }

    /// Elementwise mean of a non-empty set of descriptors; `None` when empty.
    pub fn mean<'a, I>(descriptors: I) -> Option<Descriptor>
    where
        I: IntoIterator<Item = &'a Descriptor>,
    {
        let mut acc = [0.0f64; DESCRIPTOR_LEN];
        let mut count = 0usize;
        for d in descriptors {
            for (a, v) in acc.iter_mut().zip(d.0.iter()) {
                *a += f64::from(*v);
            }
            count += 1;
        }
        if count == 0 {
            return None;
        }
        let mut out = [0.0f32; DESCRIPTOR_LEN];
        for (o, a) in out.iter_mut().zip(acc.iter()) {
            *o = (*a / count as f64) as f32;
        }
        Some(Descriptor(out))
    }
}

/// A known-identity reference: a descriptor plus the caller's category ID.
///
/// The category is an opaque integer; it is not assumed small or contiguous.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Sample {
    pub descriptor: Descriptor,
    pub category: i32,
}

impl Sample {
    pub fn new(descriptor: Descriptor, category: i32) -> Self {
        Self { descriptor, category }
    }
}

/// One recognized face: rectangle, landmarks and descriptor, index-aligned
/// across the result of a single recognize call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Face {
    pub rect: Rect,
    pub landmarks: Landmarks,
    pub descriptor: Descriptor,
}
