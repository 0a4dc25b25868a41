use std::sync::Arc;

use bytemuck::{Pod, Zeroable};

use super::UniformRing;
use crate::camera::{CameraState, ViewProjection};
use crate::config::{EngineConfig, PER_FRAME_UBO_BINDING};
use crate::error::{EngineError, Result};
use crate::gpu::{BindFrequency, DescriptorHandle, RenderBackend};
use crate::sync::FrameSlot;
use crate::texture::TextureRegistry;

/// Global data visible to every draw of a frame.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Pod, Zeroable)]
pub struct PerFrameUbo {
    pub camera: ViewProjection,
}

/// Owns the K-deep global uniform buffer and the K frame-frequency binding
/// tables that expose it together with the bindless texture array.
pub struct PerFrameUniformSystem<B: RenderBackend> {
    backend: Arc<B>,
    textures: Arc<TextureRegistry<B>>,
    camera: Arc<CameraState>,
    ring: UniformRing<B, PerFrameUbo>,
    tables: Vec<B::BindingTable>,
    bound_generation: Vec<Option<u64>>,
    scratch: Vec<DescriptorHandle>,
    skip_unchanged: bool,
}

impl<B: RenderBackend> PerFrameUniformSystem<B> {
    pub fn new(
        backend: Arc<B>,
        textures: Arc<TextureRegistry<B>>,
        camera: Arc<CameraState>,
        config: &EngineConfig,
    ) -> Result<Self> {
        let capacity = backend.texture_array_capacity();
        if textures.capacity() > capacity {
            return Err(EngineError::InvalidConfig(format!(
                "texture registry holds {} slots but {} binds only {}",
                textures.capacity(),
                backend.name(),
                capacity
            )));
        }

        let frames = config.frames_in_flight;
        let ring = UniformRing::new(backend.clone(), frames)?;
        let tables = backend.create_binding_tables(BindFrequency::Frame, frames)?;

        for (i, table) in tables.iter().enumerate() {
            let (offset, range) = ring.region(FrameSlot::new(i));
            backend.write_uniform_binding(table, PER_FRAME_UBO_BINDING, ring.buffer(), offset, range)?;
        }

        log::info!(
            "Per-frame uniform system created: {} binding tables, stride {}",
            frames,
            ring.stride()
        );

        Ok(Self {
            backend,
            scratch: Vec::with_capacity(textures.capacity()),
            textures,
            camera,
            ring,
            tables,
            bound_generation: vec![None; frames],
            skip_unchanged: config.skip_unchanged_texture_rebinds,
        })
    }

    /// Rebinds the texture array into table `slot` and writes the camera
    /// matrices into the slot's uniform region.
    ///
    /// The slot's fence must have been waited on first. Returns whether the
    /// texture array was rewritten.
    pub fn refresh(&mut self, slot: FrameSlot) -> Result<bool> {
        let index = slot.index();
        assert!(index < self.tables.len(), "{slot} out of range");

        // Read before snapshotting so growth during the copy forces a rebind next time.
        let generation = self.textures.generation();
        let unchanged = self.bound_generation[index] == Some(generation);
        let rebind = !(self.skip_unchanged && unchanged);

        if rebind {
            self.textures.snapshot_descriptors(&mut self.scratch);
            self.backend
                .write_texture_array(&self.tables[index], &self.scratch)?;
            self.bound_generation[index] = Some(generation);
        }

        let ubo = PerFrameUbo {
            camera: self.camera.snapshot_view_projection(),
        };
        self.ring.write(slot, &ubo)?;
        log::trace!("Per-frame uniforms refreshed for {slot} (textures rebound: {rebind})");
        Ok(rebind)
    }

    /// Binds table `slot` at the frame-frequency set.
    pub fn bind(&self, commands: &mut B::CommandBuffer, slot: FrameSlot) -> Result<()> {
        self.backend
            .bind_table(commands, BindFrequency::Frame, self.table(slot))
    }

    pub fn table(&self, slot: FrameSlot) -> &B::BindingTable {
        &self.tables[slot.index()]
    }

    pub fn ring(&self) -> &UniformRing<B, PerFrameUbo> {
        &self.ring
    }

    pub fn frames_in_flight(&self) -> usize {
        self.tables.len()
    }

    pub fn camera(&self) -> &Arc<CameraState> {
        &self.camera
    }

    pub fn textures(&self) -> &Arc<TextureRegistry<B>> {
        &self.textures
    }
}

impl<B: RenderBackend> Drop for PerFrameUniformSystem<B> {
    fn drop(&mut self) {
        let tables = std::mem::take(&mut self.tables);
        self.backend
            .destroy_binding_tables(BindFrequency::Frame, tables);
    }
}
