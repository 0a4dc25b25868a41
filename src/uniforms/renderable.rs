use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Mat4;

use super::UniformRing;
use crate::config::PER_OBJECT_UBO_BINDING;
use crate::error::Result;
use crate::gpu::{BindFrequency, RenderBackend};
use crate::sync::{DeletionQueue, FrameSlot, Retired};

/// Per-object uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct RenderableUbo {
    pub model: Mat4,
    /// Seconds since start, for animated shaders.
    pub time: f32,
    pub _padding: [f32; 3],
}

impl RenderableUbo {
    pub fn new(model: Mat4, time: f32) -> Self {
        Self {
            model,
            time,
            _padding: [0.0; 3],
        }
    }
}

impl Default for RenderableUbo {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, 0.0)
    }
}

/// Records the draw commands of one object. Its binding table is already bound.
pub trait Drawable<B: RenderBackend>: Send + Sync {
    fn record(&self, backend: &B, commands: &mut B::CommandBuffer) -> Result<()>;
}

/// A drawable with its own K-deep model uniform block.
///
/// Dropping it while frames are in flight is allowed: the uniform buffer and
/// tables are retired through the frame synchronizer's deletion queue.
pub struct Renderable<B: RenderBackend, D: Drawable<B>> {
    backend: Arc<B>,
    deletion: Arc<DeletionQueue<B>>,
    ring: UniformRing<B, RenderableUbo>,
    tables: Vec<B::BindingTable>,
    drawable: D,
}

impl<B: RenderBackend, D: Drawable<B>> Renderable<B, D> {
    /// Allocates one uniform copy and one object-frequency table per slot of
    /// `deletion`, all initialised to `initial`.
    pub fn new(
        backend: Arc<B>,
        deletion: Arc<DeletionQueue<B>>,
        drawable: D,
        initial: RenderableUbo,
    ) -> Result<Self> {
        let frames_in_flight = deletion.frames_in_flight();
        let ring = UniformRing::new(backend.clone(), frames_in_flight)?
            .retire_through(deletion.clone());
        let tables = backend.create_binding_tables(BindFrequency::Object, frames_in_flight)?;
        for (i, table) in tables.iter().enumerate() {
            let slot = FrameSlot::new(i);
            let (offset, range) = ring.region(slot);
            backend.write_uniform_binding(table, PER_OBJECT_UBO_BINDING, ring.buffer(), offset, range)?;
            ring.write(slot, &initial)?;
        }

        Ok(Self {
            backend,
            deletion,
            ring,
            tables,
            drawable,
        })
    }

    /// Writes `data` into the copy for `slot`. The slot's fence must have been
    /// waited on.
    pub fn set_transform(&self, slot: FrameSlot, data: &RenderableUbo) -> Result<()> {
        self.ring.write(slot, data)
    }

    /// Binds the table for `slot` and records the draw.
    pub fn draw(&self, commands: &mut B::CommandBuffer, slot: FrameSlot) -> Result<()> {
        self.backend
            .bind_table(commands, BindFrequency::Object, &self.tables[slot.index()])?;
        self.drawable.record(&self.backend, commands)
    }

    pub fn drawable(&self) -> &D {
        &self.drawable
    }

    pub fn ring(&self) -> &UniformRing<B, RenderableUbo> {
        &self.ring
    }
}

impl<B: RenderBackend, D: Drawable<B>> Drop for Renderable<B, D> {
    fn drop(&mut self) {
        let tables = std::mem::take(&mut self.tables);
        self.deletion
            .retire(Retired::BindingTables(BindFrequency::Object, tables));
    }
}
