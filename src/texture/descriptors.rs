use std::sync::atomic::{AtomicU64, Ordering};

use crate::gpu::DescriptorHandle;

/// Fixed-capacity, shader-visible descriptor entries indexed by texture slot.
///
/// Writers touch disjoint slots and readers may snapshot the whole array while
/// another slot is being populated. Each entry is a single atomic word, so a
/// reader sees either the placeholder or the new descriptor for any slot but may
/// combine entries from before and after a concurrent insertion. That
/// cross-slot tearing is accepted; the array is never locked as a whole.
#[derive(Debug)]
pub struct DescriptorArray {
    entries: Box<[AtomicU64]>,
}

impl DescriptorArray {
    pub fn new(capacity: usize, fill: DescriptorHandle) -> Self {
        Self {
            entries: (0..capacity).map(|_| AtomicU64::new(fill.raw())).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, slot: usize) -> DescriptorHandle {
        DescriptorHandle(self.entries[slot].load(Ordering::Acquire))
    }

    pub fn set(&self, slot: usize, handle: DescriptorHandle) {
        self.entries[slot].store(handle.raw(), Ordering::Release);
    }

    /// Copies the current entries into `out`, replacing its contents.
    pub fn snapshot_into(&self, out: &mut Vec<DescriptorHandle>) {
        out.clear();
        out.extend(
            self.entries
                .iter()
                .map(|entry| DescriptorHandle(entry.load(Ordering::Acquire))),
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filled_then_overwritten_per_slot() {
        let array = DescriptorArray::new(4, DescriptorHandle(7));
        array.set(1, DescriptorHandle(42));

        let mut snapshot = Vec::new();
        array.snapshot_into(&mut snapshot);
        assert_eq!(
            snapshot,
            vec![
                DescriptorHandle(7),
                DescriptorHandle(42),
                DescriptorHandle(7),
                DescriptorHandle(7)
            ]
        );
        assert_eq!(array.get(1), DescriptorHandle(42));
    }
}
