use std::sync::Arc;
use std::time::Duration;

use super::{DeletionQueue, FrameSlot, ImageInUseTable};
use crate::config::SLOW_FENCE_WAIT;
use crate::error::{EngineError, Result};
use crate::gpu::{RenderBackend, WaitStage};
use crate::utils::logging::ScopedTimer;

/// Synchronization primitives required for a single in-flight frame.
struct SlotSync<B: RenderBackend> {
    image_available: B::Semaphore,
    render_finished: B::Semaphore,
    in_flight: B::Fence,
}

/// Bounds the number of frames the CPU may have outstanding on the GPU.
///
/// All primitives are owned here and destroyed on drop, after the device has
/// gone idle. Fence observations are forwarded to the shared deletion queue so
/// that resources retired mid-flight are destroyed once no frame reads them.
pub struct FrameSynchronizer<B: RenderBackend> {
    backend: Arc<B>,
    slots: Vec<SlotSync<B>>,
    deletion: Arc<DeletionQueue<B>>,
    images: ImageInUseTable,
    current: FrameSlot,
    fence_timeout: Option<Duration>,
    /// Slots whose fence was reset but whose submission failed. Nothing will
    /// ever signal them, and nothing is pending on them either.
    disarmed: Vec<bool>,
}

impl<B: RenderBackend> FrameSynchronizer<B> {
    /// Creates `frames_in_flight` pre-signalled fences so the first K frames
    /// do not block, and one acquire/render-finished semaphore pair per slot.
    pub fn new(
        backend: Arc<B>,
        frames_in_flight: usize,
        image_count: usize,
        fence_timeout: Option<Duration>,
    ) -> Result<Self> {
        assert!(frames_in_flight > 0, "at least one frame slot is required");

        let mut slots = Vec::with_capacity(frames_in_flight);
        for _ in 0..frames_in_flight {
            slots.push(SlotSync {
                image_available: backend.create_semaphore()?,
                render_finished: backend.create_semaphore()?,
                in_flight: backend.create_fence(true)?,
            });
        }

        log::info!(
            "Frame synchronizer created on {}: {} slots, {} surface images",
            backend.name(),
            frames_in_flight,
            image_count
        );

        Ok(Self {
            deletion: Arc::new(DeletionQueue::new(backend.clone(), frames_in_flight)),
            backend,
            slots,
            images: ImageInUseTable::new(image_count),
            current: FrameSlot::default(),
            fence_timeout,
            disarmed: vec![false; frames_in_flight],
        })
    }

    pub fn current_slot(&self) -> FrameSlot {
        self.current
    }

    pub fn frames_in_flight(&self) -> usize {
        self.slots.len()
    }

    pub fn images(&self) -> &ImageInUseTable {
        &self.images
    }

    /// Queue through which resources used by recorded frames are destroyed.
    pub fn deletion_queue(&self) -> &Arc<DeletionQueue<B>> {
        &self.deletion
    }

    fn slot(&self, slot: FrameSlot) -> &SlotSync<B> {
        assert!(
            slot.index() < self.slots.len(),
            "{slot} out of range for {} frames in flight",
            self.slots.len()
        );
        &self.slots[slot.index()]
    }

    pub fn acquire_semaphore(&self) -> &B::Semaphore {
        &self.slot(self.current).image_available
    }

    pub fn render_finished_semaphore(&self) -> &B::Semaphore {
        &self.slot(self.current).render_finished
    }

    pub fn in_flight_fence(&self, slot: FrameSlot) -> &B::Fence {
        &self.slot(slot).in_flight
    }

    fn wait_fence(&self, slot: FrameSlot) -> Result<()> {
        if !self.disarmed[slot.index()] {
            self.backend
                .wait_for_fence(&self.slot(slot).in_flight, self.fence_timeout)
                .inspect_err(|e| log::error!("Waiting on {slot} fence failed: {e}"))?;
        }
        self.deletion.slot_completed(slot);
        Ok(())
    }

    /// Blocks until the current slot's previous submission has completed. After
    /// this returns, the slot's command buffer and resource copies are free and
    /// a new frame is open on the slot.
    pub fn wait_for_slot(&self) -> Result<()> {
        let _timer = ScopedTimer::new("frame slot fence").warn_after(SLOW_FENCE_WAIT);
        self.wait_fence(self.current)?;
        self.deletion.frame_opened(self.current);
        Ok(())
    }

    /// Waits on the fence of whichever other slot last claimed `image_index`,
    /// then records the current slot as its claimant.
    ///
    /// Returns whether an extra wait was needed.
    pub fn claim_image(&mut self, image_index: u32) -> Result<bool> {
        assert!(
            (image_index as usize) < self.images.len(),
            "image index {image_index} out of range for {} surface images",
            self.images.len()
        );

        let current = self.current;
        let mut waited = false;
        if let Some(previous) = self.images.claimant(image_index) {
            if previous != current {
                let _timer = ScopedTimer::new("image claimant fence").warn_after(SLOW_FENCE_WAIT);
                log::trace!("Image {image_index} still claimed by {previous}; waiting");
                self.wait_fence(previous)?;
                waited = true;
            }
        }
        self.images.claim(image_index, current);
        Ok(waited)
    }

    /// Resets the current slot's fence and submits `commands`, waiting on the
    /// acquire semaphore at color output and signalling render-finished and
    /// the fence on completion.
    pub fn submit(&mut self, commands: &B::CommandBuffer) -> Result<()> {
        let index = self.current.index();
        let slot = self.slot(self.current);
        self.backend.reset_fence(&slot.in_flight)?;
        let submitted = self
            .backend
            .submit(
                commands,
                &slot.image_available,
                WaitStage::ColorAttachmentOutput,
                &slot.render_finished,
                &slot.in_flight,
            )
            .inspect_err(|e| log::error!("Submission for {} failed: {e}", self.current));
        self.disarmed[index] = submitted.is_err();
        submitted
    }

    /// Moves on to the next slot.
    pub fn advance(&mut self) -> FrameSlot {
        self.current = self.current.next(self.slots.len());
        log::trace!("Advanced to {}", self.current);
        self.current
    }

    /// Waits for every slot's outstanding work.
    pub fn wait_all(&self) -> Result<()> {
        (0..self.slots.len()).try_for_each(|i| self.wait_fence(FrameSlot::new(i)))
    }

    /// Clears image claims after the surface was rebuilt with `image_count` images.
    pub fn reset_images(&mut self, image_count: usize) {
        self.images.reset(image_count);
    }
}

impl<B: RenderBackend> Drop for FrameSynchronizer<B> {
    fn drop(&mut self) {
        match self.backend.wait_idle() {
            Ok(()) => {}
            Err(EngineError::DeviceLost) => {
                log::warn!("Device lost before frame synchronizer teardown");
            }
            Err(e) => log::error!("wait_idle failed during teardown: {e}"),
        }
        self.deletion.flush();

        for slot in self.slots.drain(..) {
            self.backend.destroy_semaphore(slot.image_available);
            self.backend.destroy_semaphore(slot.render_finished);
            self.backend.destroy_fence(slot.in_flight);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessBackend;
    use crate::sync::Retired;

    fn synchronizer(images: usize) -> (Arc<HeadlessBackend>, FrameSynchronizer<HeadlessBackend>) {
        let backend = Arc::new(HeadlessBackend::new());
        let sync = FrameSynchronizer::new(backend.clone(), 2, images, None).unwrap();
        (backend, sync)
    }

    fn submit_empty(backend: &HeadlessBackend, sync: &mut FrameSynchronizer<HeadlessBackend>) {
        let mut cmd = backend.create_command_buffer().unwrap();
        backend.begin_commands(&mut cmd).unwrap();
        backend.end_commands(&mut cmd).unwrap();
        sync.submit(&cmd).unwrap();
    }

    #[test]
    fn fences_start_signalled() {
        let (backend, sync) = synchronizer(3);
        for i in 0..2 {
            let fence = sync.in_flight_fence(FrameSlot::new(i));
            assert!(backend.is_fence_signaled(fence).unwrap());
        }
        sync.wait_for_slot().unwrap();
        assert_eq!(backend.submission_count(), 0);
    }

    #[test]
    fn submit_resets_and_arms_the_slot_fence() {
        let (backend, mut sync) = synchronizer(3);
        submit_empty(&backend, &mut sync);
        let fence = sync.in_flight_fence(FrameSlot::new(0));
        assert!(!backend.is_fence_signaled(fence).unwrap());

        sync.wait_for_slot().unwrap();
        assert!(backend.is_fence_signaled(fence).unwrap());
    }

    #[test]
    fn claiming_an_image_held_by_another_slot_waits_on_its_fence() {
        let (backend, mut sync) = synchronizer(3);

        assert!(!sync.claim_image(1).unwrap());
        submit_empty(&backend, &mut sync);
        sync.advance();

        sync.wait_for_slot().unwrap();
        assert!(sync.claim_image(1).unwrap());
        let previous = sync.in_flight_fence(FrameSlot::new(0));
        assert!(backend.is_fence_signaled(previous).unwrap());
        assert_eq!(sync.images().claimant(1), Some(FrameSlot::new(1)));
    }

    #[test]
    fn advance_cycles_through_all_slots() {
        let (_backend, mut sync) = synchronizer(2);
        assert_eq!(sync.advance(), FrameSlot::new(1));
        assert_eq!(sync.advance(), FrameSlot::new(0));
    }

    #[test]
    fn stalled_fence_times_out() {
        let backend = Arc::new(HeadlessBackend::new());
        let mut sync =
            FrameSynchronizer::new(backend.clone(), 1, 2, Some(Duration::from_millis(5))).unwrap();
        submit_empty(&backend, &mut sync);
        backend.stall_gpu(true);

        let err = sync.wait_for_slot().unwrap_err();
        assert!(matches!(err, EngineError::FenceTimeout { .. }));
        backend.stall_gpu(false);
    }

    #[test]
    fn retired_resources_outlive_the_frames_that_read_them() {
        let (backend, mut sync) = synchronizer(3);
        sync.wait_for_slot().unwrap();
        submit_empty(&backend, &mut sync);
        sync.advance();

        let buffer = backend.create_uniform_buffer(64).unwrap();
        sync.deletion_queue().retire(Retired::Buffer(buffer));
        assert_eq!(sync.deletion_queue().len(), 1);

        // Slot 1 has nothing in flight; slot 0 still holds the frame.
        sync.wait_for_slot().unwrap();
        assert_eq!(sync.deletion_queue().len(), 1);

        sync.advance();
        sync.wait_for_slot().unwrap();
        assert!(sync.deletion_queue().is_empty());
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn teardown_flushes_retired_resources() {
        let (backend, mut sync) = synchronizer(2);
        sync.wait_for_slot().unwrap();
        submit_empty(&backend, &mut sync);
        let buffer = backend.create_uniform_buffer(64).unwrap();
        sync.deletion_queue().retire(Retired::Buffer(buffer));
        assert_eq!(backend.live_buffer_count(), 1);

        drop(sync);
        assert_eq!(backend.live_buffer_count(), 0);
    }

    #[test]
    fn failed_submission_does_not_block_the_slot() {
        let (backend, mut sync) = synchronizer(2);
        backend.fail_next_submit();
        let mut cmd = backend.create_command_buffer().unwrap();
        backend.begin_commands(&mut cmd).unwrap();
        backend.end_commands(&mut cmd).unwrap();
        assert!(matches!(sync.submit(&cmd), Err(EngineError::SubmitFailed(_))));

        sync.wait_for_slot().unwrap();
        sync.wait_all().unwrap();
        submit_empty(&backend, &mut sync);
        sync.wait_for_slot().unwrap();
    }
}
