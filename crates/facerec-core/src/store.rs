//! Shared sample store with atomic whole-set replacement.
//!
//! The reference set lives as an immutable `Arc` generation behind a
//! readers-writer lock. `replace` builds the new generation off to the side
//! and publishes it with a single swap; `snapshot` clones the current `Arc`,
//! so a classification in flight keeps working from the generation it
//! started with and never observes a torn mix of old and new samples.

use crate::types::Sample;
use parking_lot::RwLock;
use std::sync::Arc;

/// The set of known-identity samples shared across calls.
///
/// This is the only piece of state mutated after construction; everything
/// else in the pipeline is call-local.
#[derive(Default)]
pub struct SampleStore {
    current: RwLock<Arc<Vec<Sample>>>,
}

impl SampleStore {
    /// Create an empty store. Empty is a valid state: classification
    /// against it reports no match.
    pub fn new() -> Self {
        Self::default()
    }

    /// Atomically replace the whole sample set.
    ///
    /// Readers that already hold a snapshot are unaffected; readers that
    /// start after the swap see the new generation in full.
    pub fn replace(&self, samples: Vec<Sample>) {
        let generation = Arc::new(samples);
        *self.current.write() = generation;
    }

    /// Acquire the current generation. Cheap (one `Arc` clone under a read
    /// lock) and never blocked by other readers.
    pub fn snapshot(&self) -> Arc<Vec<Sample>> {
        Arc::clone(&self.current.read())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Descriptor;

    fn tagged_generation(tag: i32, len: usize) -> Vec<Sample> {
        let mut d = Descriptor::zeroed();
        d.0[0] = tag as f32;
        (0..len).map(|_| Sample::new(d.clone(), tag)).collect()
    }

    #[test]
    fn test_new_store_is_empty() {
        let store = SampleStore::new();
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_replace_publishes_new_generation() {
        let store = SampleStore::new();
        store.replace(tagged_generation(7, 3));
        let snap = store.snapshot();
        assert_eq!(snap.len(), 3);
        assert!(snap.iter().all(|s| s.category == 7));

        store.replace(Vec::new());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn test_snapshot_survives_replace() {
        let store = SampleStore::new();
        store.replace(tagged_generation(1, 2));
        let old = store.snapshot();
        store.replace(tagged_generation(2, 5));
        // The old snapshot still observes its own generation in full.
        assert_eq!(old.len(), 2);
        assert!(old.iter().all(|s| s.category == 1));
        assert_eq!(store.snapshot().len(), 5);
    }

    #[test]
    fn test_concurrent_replace_never_tears_a_snapshot() {
        let store = Arc::new(SampleStore::new());
        store.replace(tagged_generation(1, 64));

        std::thread::scope(|scope| {
            let writer_store = Arc::clone(&store);
            scope.spawn(move || {
                for i in 0..500 {
                    let tag = if i % 2 == 0 { 1 } else { 2 };
                    writer_store.replace(tagged_generation(tag, 64));
                }
            });

            for _ in 0..4 {
                let reader_store = Arc::clone(&store);
                scope.spawn(move || {
                    for _ in 0..500 {
                        let snap = reader_store.snapshot();
                        let tag = snap[0].category;
                        // Every sample in one snapshot carries the same
                        // generation tag, in both the category and the
                        // descriptor it would be looked up by.
                        for s in snap.iter() {
                            assert_eq!(s.category, tag);
                            assert_eq!(s.descriptor.0[0], tag as f32);
                        }
                    }
                });
            }
        });
    }
}
