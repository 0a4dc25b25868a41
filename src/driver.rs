//! Per-tick frame orchestration.
//!
//! One [`FrameDriver::tick`] waits on the current slot's fence, acquires an
//! image, waits on that image's previous claimant, refreshes per-frame
//! uniforms, records commands, submits, presents and advances the slot.
//! The slot fence is waited on before acquisition because the acquire
//! semaphore belongs to the slot.

use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::EngineConfig;
use crate::error::Result;
use crate::gpu::{AcquireOutcome, PresentOutcome, PresentationSurface, RenderBackend};
use crate::sync::{DeletionQueue, FrameSlot, FrameSynchronizer};
use crate::uniforms::PerFrameUniformSystem;
use crate::utils::logging::warn_if_frame_budget_exceeded;
use crate::utils::profiling::{FrameProfiler, SpanTimer};

/// Everything a recording callback needs for the current frame.
///
/// The frame-frequency table is already bound. Per-object data for `slot` may
/// be written freely; its previous GPU use has completed.
pub struct FrameContext<'a, B: RenderBackend> {
    pub slot: FrameSlot,
    pub image_index: u32,
    pub commands: &'a mut B::CommandBuffer,
    pub backend: &'a B,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented {
        slot: FrameSlot,
        image_index: u32,
        suboptimal: bool,
    },
    /// The surface must be rebuilt through [`FrameDriver::rebuild_surface`].
    SurfaceStale,
}

pub struct FrameDriver<B: RenderBackend, S: PresentationSurface<B>> {
    backend: Arc<B>,
    surface: S,
    sync: FrameSynchronizer<B>,
    per_frame: PerFrameUniformSystem<B>,
    command_buffers: Vec<B::CommandBuffer>,
    acquire_timeout: Option<Duration>,
    frame_budget_ms: Option<f32>,
    profiler: FrameProfiler,
}

impl<B: RenderBackend, S: PresentationSurface<B>> FrameDriver<B, S> {
    pub fn new(
        backend: Arc<B>,
        surface: S,
        per_frame: PerFrameUniformSystem<B>,
        config: &EngineConfig,
    ) -> Result<Self> {
        config.validate()?;
        let frames = config.frames_in_flight;
        assert_eq!(
            per_frame.frames_in_flight(),
            frames,
            "per-frame uniforms must be buffered once per frame slot"
        );

        let sync = FrameSynchronizer::new(
            backend.clone(),
            frames,
            surface.image_count(),
            config.fence_timeout(),
        )?;
        let command_buffers = (0..frames)
            .map(|_| backend.create_command_buffer())
            .collect::<Result<Vec<_>>>()?;

        log::info!(
            "Frame driver ready on {} ({} frames in flight, {} surface images)",
            backend.name(),
            frames,
            surface.image_count()
        );

        Ok(Self {
            backend,
            surface,
            sync,
            per_frame,
            command_buffers,
            acquire_timeout: config.acquire_timeout(),
            frame_budget_ms: None,
            profiler: FrameProfiler::default(),
        })
    }

    /// Warn whenever the CPU side of a tick exceeds `budget_ms`.
    pub fn with_frame_budget(mut self, budget_ms: f32) -> Self {
        self.frame_budget_ms = Some(budget_ms);
        self
    }

    /// Runs one frame. `record` is called with the frame's command buffer after
    /// the per-frame table is bound.
    ///
    /// A stale surface is reported as [`FrameOutcome::SurfaceStale`]; every
    /// error is fatal.
    pub fn tick<F>(&mut self, record: F) -> Result<FrameOutcome>
    where
        F: FnOnce(&mut FrameContext<'_, B>) -> Result<()>,
    {
        let frame_start = Instant::now();
        let slot = self.sync.current_slot();
        log::trace!("Frame begins on {slot}");

        {
            let _t = SpanTimer::new(&mut self.profiler.fence_wait_time);
            self.sync.wait_for_slot()?;
        }

        let acquired = self
            .surface
            .acquire_next_image(self.acquire_timeout, self.sync.acquire_semaphore())?;
        let (image_index, acquire_suboptimal) = match acquired {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => (image_index, suboptimal),
            AcquireOutcome::Stale => {
                log::warn!("Surface stale on acquire; rebuild required");
                self.profiler.stale_frames += 1;
                return Ok(FrameOutcome::SurfaceStale);
            }
        };

        {
            let _t = SpanTimer::new(&mut self.profiler.image_wait_time);
            if self.sync.claim_image(image_index)? {
                self.profiler.image_stalls += 1;
            }
        }

        {
            let _t = SpanTimer::new(&mut self.profiler.uniform_refresh_time);
            self.per_frame.refresh(slot)?;
        }

        {
            let _t = SpanTimer::new(&mut self.profiler.record_time);
            let commands = &mut self.command_buffers[slot.index()];
            self.backend.begin_commands(commands)?;
            self.per_frame.bind(commands, slot)?;
            let mut ctx = FrameContext {
                slot,
                image_index,
                commands,
                backend: &*self.backend,
            };
            record(&mut ctx)?;
            self.backend.end_commands(ctx.commands)?;
        }

        {
            let _t = SpanTimer::new(&mut self.profiler.submit_time);
            self.sync.submit(&self.command_buffers[slot.index()])?;
        }

        let presented = self
            .surface
            .present(image_index, self.sync.render_finished_semaphore());
        self.sync.advance();

        let elapsed = frame_start.elapsed();
        self.profiler.frames += 1;
        self.profiler.total_frame_time += elapsed;
        if let Some(budget) = self.frame_budget_ms {
            warn_if_frame_budget_exceeded(slot, elapsed, budget);
        }

        match presented? {
            PresentOutcome::Presented { suboptimal } => Ok(FrameOutcome::Presented {
                slot,
                image_index,
                suboptimal: suboptimal || acquire_suboptimal,
            }),
            PresentOutcome::Stale => {
                log::warn!("Surface stale on present; rebuild required");
                self.profiler.stale_frames += 1;
                Ok(FrameOutcome::SurfaceStale)
            }
        }
    }

    /// Waits for all frames in flight, swaps in `surface` and forgets image
    /// claims. Returns the previous surface.
    pub fn rebuild_surface(&mut self, surface: S) -> Result<S> {
        self.sync.wait_all()?;
        let image_count = surface.image_count();
        let old = std::mem::replace(&mut self.surface, surface);
        self.sync.reset_images(image_count);
        log::info!("Surface rebuilt with {image_count} images");
        Ok(old)
    }

    pub fn current_slot(&self) -> FrameSlot {
        self.sync.current_slot()
    }

    pub fn surface(&self) -> &S {
        &self.surface
    }

    pub fn surface_mut(&mut self) -> &mut S {
        &mut self.surface
    }

    pub fn synchronizer(&self) -> &FrameSynchronizer<B> {
        &self.sync
    }

    /// Shared queue that defers destruction of per-object resources until the
    /// frames that may read them have completed.
    pub fn deletion_queue(&self) -> &Arc<DeletionQueue<B>> {
        self.sync.deletion_queue()
    }

    pub fn per_frame(&self) -> &PerFrameUniformSystem<B> {
        &self.per_frame
    }

    pub fn profiler(&self) -> &FrameProfiler {
        &self.profiler
    }

    pub fn reset_profiler(&mut self) {
        self.profiler.reset();
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.sync.wait_all()?;
        self.backend.wait_idle()
    }
}

impl<B: RenderBackend, S: PresentationSurface<B>> Drop for FrameDriver<B, S> {
    fn drop(&mut self) {
        if let Err(e) = self.sync.wait_all() {
            log::error!("Frames still in flight at driver teardown: {e}");
        }
        for commands in self.command_buffers.drain(..) {
            self.backend.destroy_command_buffer(commands);
        }
    }
}
