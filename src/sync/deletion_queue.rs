//! Deferred destruction of GPU resources.
//!
//! A resource dropped while frames are in flight may still be read by a
//! submission that has not completed. It is parked here, tagged with the frame
//! each slot had open at the time, and destroyed once every one of those slots
//! has had its fence observed signalled again.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use super::FrameSlot;
use crate::gpu::{BindFrequency, RenderBackend};

/// A GPU object whose destruction has been deferred.
pub enum Retired<B: RenderBackend> {
    Buffer(B::Buffer),
    BindingTables(BindFrequency, Vec<B::BindingTable>),
}

impl<B: RenderBackend> Retired<B> {
    fn destroy(self, backend: &B) {
        match self {
            Self::Buffer(buffer) => backend.destroy_buffer(buffer),
            Self::BindingTables(frequency, tables) => {
                backend.destroy_binding_tables(frequency, tables)
            }
        }
    }
}

struct Deferred<B: RenderBackend> {
    /// Per slot, the last frame opened when the resource was retired.
    after: Vec<u64>,
    resource: Retired<B>,
}

/// Thread-safe queue of resources waiting for the frames that may use them.
///
/// The frame synchronizer reports each slot's frames as they are opened for
/// recording and as their fences are observed signalled; resources are
/// destroyed once nothing opened before their retirement can still be pending.
pub struct DeletionQueue<B: RenderBackend> {
    backend: Arc<B>,
    opened: Vec<AtomicU64>,
    completed: Vec<AtomicU64>,
    pending: Mutex<Vec<Deferred<B>>>,
}

impl<B: RenderBackend> std::fmt::Debug for DeletionQueue<B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeletionQueue")
            .field("slots", &self.opened.len())
            .field("pending", &self.len())
            .finish()
    }
}

impl<B: RenderBackend> DeletionQueue<B> {
    pub fn new(backend: Arc<B>, frames_in_flight: usize) -> Self {
        Self {
            backend,
            opened: (0..frames_in_flight).map(|_| AtomicU64::new(0)).collect(),
            completed: (0..frames_in_flight).map(|_| AtomicU64::new(0)).collect(),
            pending: Mutex::new(Vec::new()),
        }
    }

    pub fn frames_in_flight(&self) -> usize {
        self.opened.len()
    }

    /// Destroys `resource` now if no frame can still be using it, otherwise
    /// parks it until the open frames have completed.
    pub fn retire(&self, resource: Retired<B>) {
        let mut pending = self.pending.lock();
        let after: Vec<u64> = self
            .opened
            .iter()
            .map(|opened| opened.load(Ordering::SeqCst))
            .collect();

        if self.is_complete(&after) {
            drop(pending);
            resource.destroy(&self.backend);
            return;
        }

        pending.push(Deferred { after, resource });
        log::trace!("Deferred GPU resource destruction ({} pending)", pending.len());
    }

    /// Marks a new frame as opened on `slot`. Everything recorded from now on
    /// belongs to it.
    pub fn frame_opened(&self, slot: FrameSlot) {
        self.opened[slot.index()].fetch_add(1, Ordering::SeqCst);
    }

    /// Records that every frame opened so far on `slot` has completed, then
    /// destroys whatever no longer has a pending reader.
    pub fn slot_completed(&self, slot: FrameSlot) {
        let index = slot.index();
        let opened = self.opened[index].load(Ordering::SeqCst);
        self.completed[index].fetch_max(opened, Ordering::SeqCst);
        self.collect();
    }

    /// Destroys every parked resource. Only valid once the device is idle.
    pub fn flush(&self) {
        for (opened, completed) in self.opened.iter().zip(&self.completed) {
            completed.fetch_max(opened.load(Ordering::SeqCst), Ordering::SeqCst);
        }
        let drained: Vec<_> = std::mem::take(&mut *self.pending.lock());
        if !drained.is_empty() {
            log::debug!("Flushing {} deferred GPU resources", drained.len());
        }
        for deferred in drained.into_iter().rev() {
            deferred.resource.destroy(&self.backend);
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    fn is_complete(&self, after: &[u64]) -> bool {
        after
            .iter()
            .zip(&self.completed)
            .all(|(&after, completed)| completed.load(Ordering::SeqCst) >= after)
    }

    fn collect(&self) {
        let ready: Vec<Retired<B>> = {
            let mut pending = self.pending.lock();
            let mut ready = Vec::new();
            let mut i = 0;
            while i < pending.len() {
                if self.is_complete(&pending[i].after) {
                    ready.push(pending.swap_remove(i).resource);
                } else {
                    i += 1;
                }
            }
            ready
        };

        if !ready.is_empty() {
            log::trace!("Destroying {} retired GPU resources", ready.len());
        }
        for resource in ready {
            resource.destroy(&self.backend);
        }
    }
}

impl<B: RenderBackend> Drop for DeletionQueue<B> {
    fn drop(&mut self) {
        let count = self.pending.get_mut().len();
        if count > 0 {
            log::warn!("Deletion queue dropped with {count} pending resources; destroying them");
            self.flush();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessBackend;

    fn queue() -> (Arc<HeadlessBackend>, DeletionQueue<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new());
        let queue = DeletionQueue::new(backend.clone(), 2);
        (backend, queue)
    }

    #[test]
    fn idle_queue_destroys_immediately() {
        let (backend, queue) = queue();
        let buffer = backend.create_uniform_buffer(64).unwrap();
        queue.retire(Retired::Buffer(buffer));
        assert!(queue.is_empty());
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn waits_for_every_slot_open_at_retirement() {
        let (backend, queue) = queue();
        queue.frame_opened(FrameSlot::new(0));
        queue.frame_opened(FrameSlot::new(1));

        let buffer = backend.create_uniform_buffer(64).unwrap();
        queue.retire(Retired::Buffer(buffer));
        assert_eq!(queue.len(), 1);

        queue.slot_completed(FrameSlot::new(0));
        assert_eq!(queue.len(), 1);

        // Frames opened after retirement do not hold it back.
        queue.frame_opened(FrameSlot::new(0));
        queue.slot_completed(FrameSlot::new(1));
        assert!(queue.is_empty());
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn flush_destroys_everything() {
        let (backend, queue) = queue();
        queue.frame_opened(FrameSlot::new(0));
        for _ in 0..3 {
            let buffer = backend.create_uniform_buffer(64).unwrap();
            queue.retire(Retired::Buffer(buffer));
        }
        let tables = backend.create_binding_tables(BindFrequency::Object, 2).unwrap();
        queue.retire(Retired::BindingTables(BindFrequency::Object, tables));
        assert_eq!(queue.len(), 4);

        queue.flush();
        assert!(queue.is_empty());
        assert_eq!(backend.live_buffer_count(), 0);

        // Nothing is open any more, so later retirements are immediate.
        let buffer = backend.create_uniform_buffer(64).unwrap();
        queue.retire(Retired::Buffer(buffer));
        assert!(queue.is_empty());
    }
}
