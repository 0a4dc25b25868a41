//! N-buffered uniform memory.
//!
//! Every uniform block lives in one buffer holding one aligned copy per frame
//! slot. The copy for a slot may only be written after that slot's fence has
//! been observed signalled. Rings that can be dropped while frames are in
//! flight hand their buffer to a [`DeletionQueue`] instead of destroying it.

pub mod per_frame;
pub mod renderable;

pub use per_frame::{PerFrameUbo, PerFrameUniformSystem};
pub use renderable::{Drawable, Renderable, RenderableUbo};

use std::marker::PhantomData;
use std::mem::ManuallyDrop;
use std::sync::Arc;

use bytemuck::Pod;

use crate::error::Result;
use crate::gpu::RenderBackend;
use crate::sync::{DeletionQueue, FrameSlot, Retired};

/// Rounds `size` up to a multiple of `alignment`.
pub fn aligned_stride(size: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return size;
    }
    size.div_ceil(alignment) * alignment
}

/// One host-visible buffer holding `depth` aligned copies of `T`.
pub struct UniformRing<B: RenderBackend, T: Pod> {
    backend: Arc<B>,
    buffer: ManuallyDrop<B::Buffer>,
    stride: u64,
    depth: usize,
    deletion: Option<Arc<DeletionQueue<B>>>,
    _marker: PhantomData<fn(T)>,
}

impl<B: RenderBackend, T: Pod> UniformRing<B, T> {
    pub fn new(backend: Arc<B>, depth: usize) -> Result<Self> {
        assert!(depth > 0);
        let element = std::mem::size_of::<T>() as u64;
        let stride = aligned_stride(element, backend.min_uniform_alignment());
        let buffer = backend.create_uniform_buffer(stride * depth as u64)?;
        log::debug!(
            "Uniform ring created: {} x {} bytes (stride {})",
            depth,
            element,
            stride
        );

        Ok(Self {
            backend,
            buffer: ManuallyDrop::new(buffer),
            stride,
            depth,
            deletion: None,
            _marker: PhantomData,
        })
    }

    /// Defers destruction of the buffer through `deletion` when the ring is dropped.
    pub fn retire_through(mut self, deletion: Arc<DeletionQueue<B>>) -> Self {
        self.deletion = Some(deletion);
        self
    }

    /// Copies `value` into the region of `slot`.
    pub fn write(&self, slot: FrameSlot, value: &T) -> Result<()> {
        let (offset, _) = self.region(slot);
        self.backend
            .write_buffer(&self.buffer, offset, bytemuck::bytes_of(value))
    }

    /// Byte offset and range of the copy belonging to `slot`.
    pub fn region(&self, slot: FrameSlot) -> (u64, u64) {
        assert!(
            slot.index() < self.depth,
            "{slot} out of range for a ring of depth {}",
            self.depth
        );
        (
            self.stride * slot.index() as u64,
            std::mem::size_of::<T>() as u64,
        )
    }

    pub fn buffer(&self) -> &B::Buffer {
        &self.buffer
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    pub fn depth(&self) -> usize {
        self.depth
    }
}

impl<B: RenderBackend, T: Pod> Drop for UniformRing<B, T> {
    fn drop(&mut self) {
        // SAFETY: the buffer is taken exactly once, here, and never used afterwards.
        let buffer = unsafe { ManuallyDrop::take(&mut self.buffer) };
        match &self.deletion {
            Some(deletion) => deletion.retire(Retired::Buffer(buffer)),
            None => self.backend.destroy_buffer(buffer),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::HeadlessBackend;

    #[test]
    fn stride_rounds_up_to_alignment() {
        assert_eq!(aligned_stride(80, 256), 256);
        assert_eq!(aligned_stride(256, 256), 256);
        assert_eq!(aligned_stride(257, 64), 320);
        assert_eq!(aligned_stride(80, 0), 80);
    }

    #[test]
    fn slots_write_disjoint_regions() {
        let backend = Arc::new(HeadlessBackend::new().with_min_alignment(64));
        let ring: UniformRing<HeadlessBackend, [u32; 4]> =
            UniformRing::new(backend.clone(), 3).unwrap();
        assert_eq!(ring.stride(), 64);
        assert_eq!(ring.region(FrameSlot::new(2)), (128, 16));

        ring.write(FrameSlot::new(1), &[7, 7, 7, 7]).unwrap();
        assert_eq!(backend.read_buffer(ring.buffer(), 0, 4), vec![0; 4]);
        assert_eq!(
            backend.read_buffer(ring.buffer(), 64, 4),
            7u32.to_ne_bytes().to_vec()
        );
    }

    #[test]
    #[should_panic]
    fn slot_beyond_depth_panics() {
        let backend = Arc::new(HeadlessBackend::new());
        let ring: UniformRing<HeadlessBackend, [f32; 4]> = UniformRing::new(backend, 2).unwrap();
        ring.region(FrameSlot::new(2));
    }
}
