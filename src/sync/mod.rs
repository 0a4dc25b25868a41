//! Frame-in-flight synchronization.
//!
//! K frame slots are visited round-robin. Each slot owns a fence and a pair of
//! semaphores; every N-buffered resource is indexed by [`FrameSlot`] and may only
//! be mutated once the slot's fence has been observed signalled. Resources
//! dropped while frames are in flight go through a [`DeletionQueue`].

pub mod deletion_queue;
pub mod frame_sync;
pub mod images_in_flight;

pub use deletion_queue::{DeletionQueue, Retired};
pub use frame_sync::FrameSynchronizer;
pub use images_in_flight::ImageInUseTable;

/// Index of a frame slot in `[0, K)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct FrameSlot(usize);

impl FrameSlot {
    pub fn new(index: usize) -> Self {
        Self(index)
    }

    pub fn index(self) -> usize {
        self.0
    }

    /// The slot after this one when `frames_in_flight` slots exist.
    pub fn next(self, frames_in_flight: usize) -> Self {
        assert!(frames_in_flight > 0);
        Self((self.0 + 1) % frames_in_flight)
    }
}

impl std::fmt::Display for FrameSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "slot {}", self.0)
    }
}
