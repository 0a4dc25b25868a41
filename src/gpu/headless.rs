//! CPU-simulated GPU timeline.
//!
//! Submissions are queued FIFO and retired either explicitly ([`HeadlessBackend::retire_one`],
//! [`HeadlessBackend::retire_all`]) or implicitly when the CPU blocks on a fence, in which case
//! the simulated GPU executes queued work up to the submission that signals it.
//!
//! Every uniform-buffer write is checked against the regions read by still-pending
//! submissions, every buffer or binding-table destruction against the submissions that use
//! it, and every command-buffer reset against its last submission. Violations are
//! recorded as [`Hazard`]s instead of corrupting anything, which lets tests assert that
//! frame-slot discipline holds under arbitrary interleavings.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use super::{
    AcquireOutcome, BindFrequency, DescriptorHandle, PresentOutcome, PresentationSurface,
    RenderBackend, WaitStage,
};
use crate::error::{EngineError, Result};
use crate::texture::DecodedImage;
use crate::uniforms::Drawable;

/// A byte range of a headless buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferRegion {
    pub buffer: u64,
    pub offset: u64,
    pub len: u64,
}

impl BufferRegion {
    pub fn overlaps(&self, other: &BufferRegion) -> bool {
        self.buffer == other.buffer
            && self.offset < other.offset + other.len
            && other.offset < self.offset + self.len
    }
}

/// A CPU/GPU ordering violation observed by the simulation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Hazard {
    /// Host wrote memory a pending submission still reads.
    UniformOverwrite { region: BufferRegion, submission: u64 },
    /// A command buffer was reset while its last submission was still executing.
    CommandBufferReuse { command_buffer: u64, submission: u64 },
    /// A fence was reset while a pending submission was going to signal it.
    FenceResetWhilePending { fence: u64, submission: u64 },
    /// A buffer or binding table was destroyed while a pending submission used it.
    DestroyedWhilePending { resource: u64, submission: u64 },
}

#[derive(Debug, Clone)]
pub struct HeadlessFence {
    id: u64,
    signaled: Arc<AtomicBool>,
}

impl HeadlessFence {
    fn is_signaled(&self) -> bool {
        self.signaled.load(Ordering::Acquire)
    }
}

#[derive(Debug, Clone)]
pub struct HeadlessSemaphore;

#[derive(Debug, Clone)]
pub struct HeadlessBuffer {
    id: u64,
    size: u64,
}

impl HeadlessBuffer {
    pub fn id(&self) -> u64 {
        self.id
    }
}

#[derive(Debug)]
pub struct HeadlessTexture {
    id: u64,
    width: u32,
    height: u32,
}

impl HeadlessTexture {
    pub fn extent(&self) -> (u32, u32) {
        (self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UniformBinding {
    pub binding: u32,
    pub region: BufferRegion,
}

/// What has been written into a binding table so far.
#[derive(Debug, Clone, Default)]
pub struct TableContents {
    pub uniforms: Vec<UniformBinding>,
    pub textures: Vec<DescriptorHandle>,
    pub texture_writes: u64,
}

#[derive(Debug)]
pub struct HeadlessBindingTable {
    id: u64,
    frequency: BindFrequency,
    contents: Mutex<TableContents>,
}

impl HeadlessBindingTable {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn contents(&self) -> TableContents {
        self.contents.lock().clone()
    }
}

#[derive(Debug)]
pub struct HeadlessCommandBuffer {
    id: u64,
    recording: bool,
    reads: Vec<BufferRegion>,
    bound: Vec<(BindFrequency, u64)>,
    draws: Vec<String>,
}

impl HeadlessCommandBuffer {
    /// Binding tables bound since recording began, in order.
    pub fn bound_tables(&self) -> &[(BindFrequency, u64)] {
        &self.bound
    }

    pub fn draws(&self) -> &[String] {
        &self.draws
    }
}

#[derive(Debug)]
struct PendingSubmission {
    id: u64,
    fence: HeadlessFence,
    reads: Vec<BufferRegion>,
    tables: Vec<u64>,
}

impl PendingSubmission {
    fn uses(&self, resource: u64) -> bool {
        self.reads.iter().any(|read| read.buffer == resource) || self.tables.contains(&resource)
    }
}

#[derive(Debug, Default)]
struct GpuState {
    pending: VecDeque<PendingSubmission>,
    submitted: u64,
    retired: u64,
    last_submission: HashMap<u64, u64>,
    buffers: HashMap<u64, Vec<u8>>,
    live_tables: usize,
    hazards: Vec<Hazard>,
}

impl GpuState {
    fn retire_front(&mut self) -> bool {
        match self.pending.pop_front() {
            Some(submission) => {
                submission.fence.signaled.store(true, Ordering::Release);
                self.retired = submission.id;
                true
            }
            None => false,
        }
    }

    fn is_retired(&self, submission: u64) -> bool {
        submission <= self.retired
    }

    fn check_destroy(&mut self, resource: u64) {
        let conflicts: Vec<Hazard> = self
            .pending
            .iter()
            .filter(|p| p.uses(resource))
            .map(|p| Hazard::DestroyedWhilePending {
                resource,
                submission: p.id,
            })
            .collect();
        self.hazards.extend(conflicts);
    }
}

/// Simulated GPU used by tests, benches and the headless demo.
pub struct HeadlessBackend {
    state: Mutex<GpuState>,
    progress: Condvar,
    next_id: AtomicU64,
    stalled: AtomicBool,
    fail_next_submit: AtomicBool,
    uploads: AtomicUsize,
    min_alignment: u64,
    texture_array_capacity: usize,
    upload_latency: Option<Duration>,
}

impl Default for HeadlessBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl HeadlessBackend {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(GpuState::default()),
            progress: Condvar::new(),
            next_id: AtomicU64::new(1),
            stalled: AtomicBool::new(false),
            fail_next_submit: AtomicBool::new(false),
            uploads: AtomicUsize::new(0),
            min_alignment: 256,
            texture_array_capacity: usize::MAX,
            upload_latency: None,
        }
    }

    pub fn with_min_alignment(mut self, alignment: u64) -> Self {
        assert!(alignment.is_power_of_two());
        self.min_alignment = alignment;
        self
    }

    /// Limits the frame table's texture array, as a Vulkan layout would.
    pub fn with_texture_array_capacity(mut self, capacity: usize) -> Self {
        self.texture_array_capacity = capacity;
        self
    }

    /// Sleeps inside every upload, widening race windows in concurrency tests.
    pub fn with_upload_latency(mut self, latency: Duration) -> Self {
        self.upload_latency = Some(latency);
        self
    }

    fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Executes the oldest pending submission. Returns `false` when idle.
    pub fn retire_one(&self) -> bool {
        let retired = self.state.lock().retire_front();
        if retired {
            self.progress.notify_all();
        }
        retired
    }

    pub fn retire_all(&self) -> usize {
        let mut state = self.state.lock();
        let mut count = 0;
        while state.retire_front() {
            count += 1;
        }
        drop(state);
        self.progress.notify_all();
        count
    }

    /// While stalled, fence waits do not make the GPU progress.
    pub fn stall_gpu(&self, stalled: bool) {
        self.stalled.store(stalled, Ordering::SeqCst);
        if !stalled {
            self.progress.notify_all();
        }
    }

    /// Makes the next [`RenderBackend::submit`] fail.
    pub fn fail_next_submit(&self) {
        self.fail_next_submit.store(true, Ordering::SeqCst);
    }

    pub fn hazards(&self) -> Vec<Hazard> {
        self.state.lock().hazards.clone()
    }

    pub fn submission_count(&self) -> u64 {
        self.state.lock().submitted
    }

    pub fn pending_count(&self) -> usize {
        self.state.lock().pending.len()
    }

    pub fn upload_count(&self) -> usize {
        self.uploads.load(Ordering::SeqCst)
    }

    /// Uniform buffers created and not yet destroyed.
    pub fn live_buffer_count(&self) -> usize {
        self.state.lock().buffers.len()
    }

    /// Binding tables created and not yet destroyed.
    pub fn live_table_count(&self) -> usize {
        self.state.lock().live_tables
    }

    /// Current contents of a uniform buffer range.
    pub fn read_buffer(&self, buffer: &HeadlessBuffer, offset: u64, len: u64) -> Vec<u8> {
        let state = self.state.lock();
        let start = offset as usize;
        let end = (offset + len) as usize;
        state
            .buffers
            .get(&buffer.id)
            .map(|bytes| bytes[start..end].to_vec())
            .unwrap_or_default()
    }

    /// Records a labelled draw into `commands`.
    pub fn record_draw(&self, commands: &mut HeadlessCommandBuffer, label: &str) {
        assert!(commands.recording, "draw recorded outside of begin/end");
        commands.draws.push(label.to_owned());
    }
}

impl RenderBackend for HeadlessBackend {
    type Fence = HeadlessFence;
    type Semaphore = HeadlessSemaphore;
    type Buffer = HeadlessBuffer;
    type Texture = HeadlessTexture;
    type BindingTable = HeadlessBindingTable;
    type CommandBuffer = HeadlessCommandBuffer;

    fn name(&self) -> &str {
        "headless"
    }

    fn create_fence(&self, signaled: bool) -> Result<HeadlessFence> {
        Ok(HeadlessFence {
            id: self.next_id(),
            signaled: Arc::new(AtomicBool::new(signaled)),
        })
    }

    fn create_semaphore(&self) -> Result<HeadlessSemaphore> {
        Ok(HeadlessSemaphore)
    }

    fn wait_for_fence(&self, fence: &HeadlessFence, timeout: Option<Duration>) -> Result<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        let mut advanced = false;

        loop {
            if fence.is_signaled() {
                if advanced {
                    self.progress.notify_all();
                }
                return Ok(());
            }

            if !self.stalled.load(Ordering::SeqCst) && state.retire_front() {
                advanced = true;
                continue;
            }

            match (deadline, timeout) {
                (Some(deadline), Some(timeout)) => {
                    if self.progress.wait_until(&mut state, deadline).timed_out()
                        && !fence.is_signaled()
                    {
                        return Err(EngineError::FenceTimeout { timeout });
                    }
                }
                _ => self.progress.wait(&mut state),
            }
        }
    }

    fn reset_fence(&self, fence: &HeadlessFence) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(pending) = state.pending.iter().find(|p| p.fence.id == fence.id) {
            let hazard = Hazard::FenceResetWhilePending {
                fence: fence.id,
                submission: pending.id,
            };
            state.hazards.push(hazard);
        }
        fence.signaled.store(false, Ordering::Release);
        Ok(())
    }

    fn is_fence_signaled(&self, fence: &HeadlessFence) -> Result<bool> {
        Ok(fence.is_signaled())
    }

    fn destroy_fence(&self, _fence: HeadlessFence) {}

    fn destroy_semaphore(&self, _semaphore: HeadlessSemaphore) {}

    fn create_command_buffer(&self) -> Result<HeadlessCommandBuffer> {
        Ok(HeadlessCommandBuffer {
            id: self.next_id(),
            recording: false,
            reads: Vec::new(),
            bound: Vec::new(),
            draws: Vec::new(),
        })
    }

    fn begin_commands(&self, commands: &mut HeadlessCommandBuffer) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(&submission) = state.last_submission.get(&commands.id) {
            if !state.is_retired(submission) {
                state.hazards.push(Hazard::CommandBufferReuse {
                    command_buffer: commands.id,
                    submission,
                });
            }
        }
        commands.recording = true;
        commands.reads.clear();
        commands.bound.clear();
        commands.draws.clear();
        Ok(())
    }

    fn end_commands(&self, commands: &mut HeadlessCommandBuffer) -> Result<()> {
        assert!(commands.recording, "end_commands without begin_commands");
        commands.recording = false;
        Ok(())
    }

    fn destroy_command_buffer(&self, _commands: HeadlessCommandBuffer) {}

    fn submit(
        &self,
        commands: &HeadlessCommandBuffer,
        _wait: &HeadlessSemaphore,
        _wait_stage: WaitStage,
        _signal: &HeadlessSemaphore,
        fence: &HeadlessFence,
    ) -> Result<()> {
        if self.fail_next_submit.swap(false, Ordering::SeqCst) {
            return Err(EngineError::SubmitFailed("injected submission failure".into()));
        }
        if commands.recording {
            return Err(EngineError::SubmitFailed(
                "command buffer is still recording".into(),
            ));
        }
        if fence.is_signaled() {
            return Err(EngineError::SubmitFailed(
                "fence must be unsignalled at submission".into(),
            ));
        }

        let mut state = self.state.lock();
        state.submitted += 1;
        let id = state.submitted;
        state.last_submission.insert(commands.id, id);
        state.pending.push_back(PendingSubmission {
            id,
            fence: fence.clone(),
            reads: commands.reads.clone(),
            tables: commands.bound.iter().map(|&(_, table)| table).collect(),
        });
        Ok(())
    }

    fn wait_idle(&self) -> Result<()> {
        if self.stalled.load(Ordering::SeqCst) {
            return Err(EngineError::DeviceLost);
        }
        self.retire_all();
        Ok(())
    }

    fn min_uniform_alignment(&self) -> u64 {
        self.min_alignment
    }

    fn create_uniform_buffer(&self, size: u64) -> Result<HeadlessBuffer> {
        let id = self.next_id();
        self.state.lock().buffers.insert(id, vec![0; size as usize]);
        Ok(HeadlessBuffer { id, size })
    }

    fn write_buffer(&self, buffer: &HeadlessBuffer, offset: u64, bytes: &[u8]) -> Result<()> {
        let region = BufferRegion {
            buffer: buffer.id,
            offset,
            len: bytes.len() as u64,
        };
        assert!(offset + region.len <= buffer.size, "write past end of buffer");

        let mut state = self.state.lock();
        let conflicts: Vec<Hazard> = state
            .pending
            .iter()
            .filter(|p| p.reads.iter().any(|read| read.overlaps(&region)))
            .map(|p| Hazard::UniformOverwrite {
                region,
                submission: p.id,
            })
            .collect();
        state.hazards.extend(conflicts);

        if let Some(memory) = state.buffers.get_mut(&buffer.id) {
            let start = offset as usize;
            memory[start..start + bytes.len()].copy_from_slice(bytes);
        }
        Ok(())
    }

    fn destroy_buffer(&self, buffer: HeadlessBuffer) {
        let mut state = self.state.lock();
        state.check_destroy(buffer.id);
        state.buffers.remove(&buffer.id);
    }

    fn upload_texture(&self, image: &DecodedImage) -> Result<HeadlessTexture> {
        if let Some(latency) = self.upload_latency {
            std::thread::sleep(latency);
        }
        self.uploads.fetch_add(1, Ordering::SeqCst);
        Ok(HeadlessTexture {
            id: self.next_id(),
            width: image.width,
            height: image.height,
        })
    }

    fn texture_descriptor(&self, texture: &HeadlessTexture) -> DescriptorHandle {
        DescriptorHandle(texture.id)
    }

    fn destroy_texture(&self, _texture: HeadlessTexture) {}

    fn texture_array_capacity(&self) -> usize {
        self.texture_array_capacity
    }

    fn create_binding_tables(
        &self,
        frequency: BindFrequency,
        count: usize,
    ) -> Result<Vec<HeadlessBindingTable>> {
        self.state.lock().live_tables += count;
        Ok((0..count)
            .map(|_| HeadlessBindingTable {
                id: self.next_id(),
                frequency,
                contents: Mutex::new(TableContents::default()),
            })
            .collect())
    }

    fn write_uniform_binding(
        &self,
        table: &HeadlessBindingTable,
        binding: u32,
        buffer: &HeadlessBuffer,
        offset: u64,
        range: u64,
    ) -> Result<()> {
        let region = BufferRegion {
            buffer: buffer.id,
            offset,
            len: range,
        };
        let mut contents = table.contents.lock();
        contents.uniforms.retain(|u| u.binding != binding);
        contents.uniforms.push(UniformBinding { binding, region });
        Ok(())
    }

    fn write_texture_array(
        &self,
        table: &HeadlessBindingTable,
        entries: &[DescriptorHandle],
    ) -> Result<()> {
        if entries.len() > self.texture_array_capacity {
            return Err(EngineError::InvalidConfig(format!(
                "texture array of {} entries exceeds capacity {}",
                entries.len(),
                self.texture_array_capacity
            )));
        }
        let mut contents = table.contents.lock();
        contents.textures.clear();
        contents.textures.extend_from_slice(entries);
        contents.texture_writes += 1;
        Ok(())
    }

    fn bind_table(
        &self,
        commands: &mut HeadlessCommandBuffer,
        frequency: BindFrequency,
        table: &HeadlessBindingTable,
    ) -> Result<()> {
        assert!(commands.recording, "bind_table outside of begin/end");
        assert_eq!(frequency, table.frequency, "table bound at the wrong set");
        let contents = table.contents.lock();
        commands
            .reads
            .extend(contents.uniforms.iter().map(|u| u.region));
        commands.bound.push((frequency, table.id));
        Ok(())
    }

    fn destroy_binding_tables(&self, _frequency: BindFrequency, tables: Vec<HeadlessBindingTable>) {
        let mut state = self.state.lock();
        for table in &tables {
            state.check_destroy(table.id);
        }
        state.live_tables -= tables.len();
    }
}

/// A labelled draw, recorded into the command buffer for inspection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeadlessDraw(pub String);

impl HeadlessDraw {
    pub fn new(label: impl Into<String>) -> Self {
        Self(label.into())
    }
}

impl Drawable<HeadlessBackend> for HeadlessDraw {
    fn record(&self, backend: &HeadlessBackend, commands: &mut HeadlessCommandBuffer) -> Result<()> {
        backend.record_draw(commands, &self.0);
        Ok(())
    }
}

/// Scripted presentation surface for the headless backend.
#[derive(Debug)]
pub struct HeadlessSurface {
    image_count: usize,
    sequence: Vec<u32>,
    cursor: usize,
    stale_acquires: usize,
    stale_presents: usize,
    presented: Vec<u32>,
}

impl HeadlessSurface {
    /// Hands out images round-robin.
    pub fn new(image_count: usize) -> Self {
        assert!(image_count > 0);
        Self::with_sequence(image_count, (0..image_count as u32).collect())
    }

    /// Hands out images in the given (cycled) order, which may repeat or skip
    /// indices to model out-of-order acquisition.
    pub fn with_sequence(image_count: usize, sequence: Vec<u32>) -> Self {
        assert!(!sequence.is_empty());
        assert!(sequence.iter().all(|&i| (i as usize) < image_count));
        Self {
            image_count,
            sequence,
            cursor: 0,
            stale_acquires: 0,
            stale_presents: 0,
            presented: Vec::new(),
        }
    }

    /// The next acquisition reports a stale surface.
    pub fn mark_stale(&mut self) {
        self.stale_acquires += 1;
    }

    /// The next presentation reports a stale surface.
    pub fn mark_stale_on_present(&mut self) {
        self.stale_presents += 1;
    }

    pub fn presented(&self) -> &[u32] {
        &self.presented
    }
}

impl PresentationSurface<HeadlessBackend> for HeadlessSurface {
    fn image_count(&self) -> usize {
        self.image_count
    }

    fn acquire_next_image(
        &mut self,
        _timeout: Option<Duration>,
        _signal: &HeadlessSemaphore,
    ) -> Result<AcquireOutcome> {
        if self.stale_acquires > 0 {
            self.stale_acquires -= 1;
            return Ok(AcquireOutcome::Stale);
        }
        let image_index = self.sequence[self.cursor % self.sequence.len()];
        self.cursor += 1;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn present(&mut self, image_index: u32, _wait: &HeadlessSemaphore) -> Result<PresentOutcome> {
        self.presented.push(image_index);
        if self.stale_presents > 0 {
            self.stale_presents -= 1;
            return Ok(PresentOutcome::Stale);
        }
        Ok(PresentOutcome::Presented { suboptimal: false })
    }
}
