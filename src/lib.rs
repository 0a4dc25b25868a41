//! Frameloom – frame-in-flight core for Vulkan-style renderers.
//!
//! This crate keeps CPU command recording K frames ahead of the GPU without
//! ever overwriting a resource the GPU still reads: a fence/semaphore
//! synchronizer, N-buffered per-frame and per-object uniforms, a concurrently
//! populated bindless texture registry and a lock-protected camera shared with
//! the input thread.

pub mod camera;
pub mod config;
pub mod driver;
pub mod error;
pub mod gpu;
pub mod input;
pub mod sync;
pub mod texture;
pub mod uniforms;
pub mod utils;

use std::sync::Arc;

pub use glam::{Mat4, Vec3};

pub use camera::{CameraPose, CameraState, MoveDirection, ViewProjection};
pub use config::{CameraConfig, EngineConfig};
pub use driver::{FrameContext, FrameDriver, FrameOutcome};
pub use error::{DecodeError, EngineError, Result};
pub use gpu::{
    AcquireOutcome, BindFrequency, DescriptorHandle, HeadlessBackend, HeadlessSurface,
    PresentOutcome, PresentationSurface, RenderBackend,
};
pub use input::{InputAdapter, Key};
pub use sync::{DeletionQueue, FrameSlot, FrameSynchronizer, ImageInUseTable};
pub use texture::{DecodedImage, FileDecoder, ImageDecoder, MemoryDecoder, TextureRegistry, TextureSlot};
pub use uniforms::{Drawable, PerFrameUniformSystem, Renderable, RenderableUbo};

/// High-level convenience wrapper wiring the registry, camera, input adapter
/// and frame driver together from one [`EngineConfig`].
pub struct Engine<B: RenderBackend, S: PresentationSurface<B>> {
    backend: Arc<B>,
    textures: Arc<TextureRegistry<B>>,
    camera: Arc<CameraState>,
    input: InputAdapter,
    driver: FrameDriver<B, S>,
    config: EngineConfig,
}

impl<B: RenderBackend, S: PresentationSurface<B>> Engine<B, S> {
    pub fn new(
        backend: Arc<B>,
        surface: S,
        decoder: Arc<dyn ImageDecoder>,
        config: EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let textures = Arc::new(TextureRegistry::new(backend.clone(), decoder, &config)?);
        let camera = Arc::new(CameraState::new(&config.camera));
        let per_frame =
            PerFrameUniformSystem::new(backend.clone(), textures.clone(), camera.clone(), &config)?;
        let driver = FrameDriver::new(backend.clone(), surface, per_frame, &config)?;

        Ok(Self {
            backend,
            textures,
            input: InputAdapter::new(camera.clone()),
            camera,
            driver,
            config,
        })
    }

    /// Creates a renderable buffered once per frame slot. It may be dropped at
    /// any time; its GPU memory is released once the frames using it complete.
    pub fn create_renderable<D: Drawable<B>>(
        &self,
        drawable: D,
        initial: RenderableUbo,
    ) -> Result<Renderable<B, D>> {
        Renderable::new(
            self.backend.clone(),
            self.driver.deletion_queue().clone(),
            drawable,
            initial,
        )
    }

    /// Applies held movement keys and runs one frame.
    pub fn frame<F>(&mut self, record: F) -> Result<FrameOutcome>
    where
        F: FnOnce(&mut FrameContext<'_, B>) -> Result<()>,
    {
        self.input.apply_held_keys();
        self.driver.tick(record)
    }

    /// Swaps in a rebuilt surface and updates the camera projection.
    pub fn rebuild_surface(&mut self, surface: S, aspect_ratio: f32) -> Result<S> {
        self.camera.set_aspect_ratio(aspect_ratio);
        self.driver.rebuild_surface(surface)
    }

    pub fn textures(&self) -> &Arc<TextureRegistry<B>> {
        &self.textures
    }

    pub fn camera(&self) -> &Arc<CameraState> {
        &self.camera
    }

    pub fn input(&self) -> &InputAdapter {
        &self.input
    }

    pub fn driver(&self) -> &FrameDriver<B, S> {
        &self.driver
    }

    pub fn driver_mut(&mut self) -> &mut FrameDriver<B, S> {
        &mut self.driver
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}
