//! Seams to the GPU and presentation layers.
//!
//! Everything the frame-synchronization core needs from the device is expressed
//! through [`RenderBackend`]; swapchain image acquisition and presentation go
//! through [`PresentationSurface`]. Two implementations ship with the crate:
//!
//! - [`HeadlessBackend`] simulates a GPU timeline on the CPU and records
//!   resource hazards, which makes every ordering guarantee testable.
//! - [`AshBackend`] drives a real Vulkan device through `ash` and `vk-mem`.

pub mod ash_backend;
pub mod headless;

pub use ash_backend::{AshBackend, AshBindingLayouts, AshSurface, IndexedDraw};
pub use headless::{Hazard, HeadlessBackend, HeadlessDraw, HeadlessSurface};

use std::time::Duration;

use crate::error::Result;
use crate::texture::DecodedImage;

/// Opaque, backend-defined handle of a shader-visible texture descriptor.
///
/// Vulkan backends store the raw `VkImageView` here. The value is plain data so
/// that descriptor slots can be published through atomics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DescriptorHandle(pub u64);

impl DescriptorHandle {
    pub const NULL: Self = Self(0);

    pub fn raw(self) -> u64 {
        self.0
    }
}

/// Rebind frequency of a binding table, which also fixes its set number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BindFrequency {
    /// Set 0: texture array, sampler, camera block. Rebound once per frame.
    Frame,
    /// Set 1: model block. Rebound per drawable.
    Object,
}

impl BindFrequency {
    pub fn set_index(self) -> u32 {
        match self {
            Self::Frame => 0,
            Self::Object => 1,
        }
    }
}

/// Pipeline stage at which a submission waits on its acquire semaphore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitStage {
    ColorAttachmentOutput,
}

/// Result of asking the presentation surface for its next image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    /// The surface no longer matches the window; rebuild it and retry.
    Stale,
}

/// Result of queueing an image for presentation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented { suboptimal: bool },
    Stale,
}

/// Device-side operations used by the frame synchronizer, texture registry and
/// uniform systems.
///
/// Handles are owned values; every `create_*` has a matching `destroy_*` and
/// callers are responsible for destroying what they create once the GPU no
/// longer uses it.
pub trait RenderBackend: Send + Sync + 'static {
    type Fence: Send + Sync;
    type Semaphore: Send + Sync;
    type Buffer: Send + Sync;
    type Texture: Send + Sync;
    type BindingTable: Send + Sync;
    type CommandBuffer: Send;

    fn name(&self) -> &str;

    // Synchronization

    fn create_fence(&self, signaled: bool) -> Result<Self::Fence>;

    fn create_semaphore(&self) -> Result<Self::Semaphore>;

    /// Blocks until `fence` is signalled. `None` waits indefinitely; expiry of a
    /// finite timeout returns [`crate::EngineError::FenceTimeout`].
    fn wait_for_fence(&self, fence: &Self::Fence, timeout: Option<Duration>) -> Result<()>;

    fn reset_fence(&self, fence: &Self::Fence) -> Result<()>;

    fn is_fence_signaled(&self, fence: &Self::Fence) -> Result<bool>;

    fn destroy_fence(&self, fence: Self::Fence);

    fn destroy_semaphore(&self, semaphore: Self::Semaphore);

    // Command recording and submission

    fn create_command_buffer(&self) -> Result<Self::CommandBuffer>;

    /// Resets `commands` and starts recording. The caller must have observed
    /// the fence of its previous submission signalled.
    fn begin_commands(&self, commands: &mut Self::CommandBuffer) -> Result<()>;

    fn end_commands(&self, commands: &mut Self::CommandBuffer) -> Result<()>;

    fn destroy_command_buffer(&self, commands: Self::CommandBuffer);

    /// Submits recorded commands. The GPU waits on `wait` at `wait_stage`,
    /// signals `signal` and then `fence` once execution completes.
    fn submit(
        &self,
        commands: &Self::CommandBuffer,
        wait: &Self::Semaphore,
        wait_stage: WaitStage,
        signal: &Self::Semaphore,
        fence: &Self::Fence,
    ) -> Result<()>;

    fn wait_idle(&self) -> Result<()>;

    // Uniform memory

    /// Minimum offset alignment for uniform buffer bindings.
    fn min_uniform_alignment(&self) -> u64;

    /// Allocates persistently host-visible uniform memory.
    fn create_uniform_buffer(&self, size: u64) -> Result<Self::Buffer>;

    /// Copies `bytes` into `buffer` at `offset`, flushing when the memory is
    /// not host-coherent.
    fn write_buffer(&self, buffer: &Self::Buffer, offset: u64, bytes: &[u8]) -> Result<()>;

    fn destroy_buffer(&self, buffer: Self::Buffer);

    // Textures

    /// Uploads RGBA8 pixels and leaves the image ready for shader reads.
    fn upload_texture(&self, image: &DecodedImage) -> Result<Self::Texture>;

    fn texture_descriptor(&self, texture: &Self::Texture) -> DescriptorHandle;

    fn destroy_texture(&self, texture: Self::Texture);

    // Binding tables

    /// Number of descriptors the frame table's texture array can hold.
    fn texture_array_capacity(&self) -> usize;

    fn create_binding_tables(
        &self,
        frequency: BindFrequency,
        count: usize,
    ) -> Result<Vec<Self::BindingTable>>;

    fn write_uniform_binding(
        &self,
        table: &Self::BindingTable,
        binding: u32,
        buffer: &Self::Buffer,
        offset: u64,
        range: u64,
    ) -> Result<()>;

    /// Writes the full texture array (and the shared sampler) into `table`.
    /// Fails with [`crate::EngineError::InvalidConfig`] when `entries` is longer
    /// than [`RenderBackend::texture_array_capacity`].
    fn write_texture_array(
        &self,
        table: &Self::BindingTable,
        entries: &[DescriptorHandle],
    ) -> Result<()>;

    fn bind_table(
        &self,
        commands: &mut Self::CommandBuffer,
        frequency: BindFrequency,
        table: &Self::BindingTable,
    ) -> Result<()>;

    fn destroy_binding_tables(&self, frequency: BindFrequency, tables: Vec<Self::BindingTable>);
}

/// The swapchain side of a frame: image acquisition and presentation.
pub trait PresentationSurface<B: RenderBackend> {
    fn image_count(&self) -> usize;

    /// Requests the next presentable image; `signal` is signalled once the
    /// image may be written.
    fn acquire_next_image(
        &mut self,
        timeout: Option<Duration>,
        signal: &B::Semaphore,
    ) -> Result<AcquireOutcome>;

    /// Queues `image_index` for presentation after `wait` is signalled.
    fn present(&mut self, image_index: u32, wait: &B::Semaphore) -> Result<PresentOutcome>;
}
