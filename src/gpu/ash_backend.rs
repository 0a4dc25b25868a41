//! Vulkan backend built on `ash` and `vk-mem`.
//!
//! The backend borrows an already-created logical device and queue; instance,
//! surface and swapchain creation belong to the windowing layer. Uniform memory is
//! host-visible and written with map/copy/flush, textures go through a staging
//! buffer and a one-shot command buffer.

use std::time::Duration;

use ash::vk::{self, Handle};
use parking_lot::Mutex;
use vk_mem::Alloc;

use super::{
    AcquireOutcome, BindFrequency, DescriptorHandle, PresentOutcome, PresentationSurface,
    RenderBackend, WaitStage,
};
use crate::config::{
    PER_FRAME_SAMPLER_BINDING, PER_FRAME_TEXTURE_ARRAY_BINDING, PER_FRAME_UBO_BINDING,
    PER_OBJECT_UBO_BINDING,
};
use crate::error::{EngineError, Result};
use crate::texture::DecodedImage;
use crate::uniforms::Drawable;

const TEXTURE_FORMAT: vk::Format = vk::Format::R8G8B8A8_SRGB;

fn map_vk(err: vk::Result) -> EngineError {
    match err {
        vk::Result::ERROR_DEVICE_LOST => EngineError::DeviceLost,
        other => EngineError::Vulkan(other),
    }
}

fn timeout_nanos(timeout: Option<Duration>) -> u64 {
    timeout.map_or(u64::MAX, |t| t.as_nanos().min(u64::MAX as u128) as u64)
}

/// Descriptor set layouts and the pipeline layout shared by every pipeline
/// that samples the bindless texture array.
#[derive(Debug, Clone, Copy)]
pub struct AshBindingLayouts {
    pub frame: vk::DescriptorSetLayout,
    pub object: vk::DescriptorSetLayout,
    pub pipeline_layout: vk::PipelineLayout,
}

pub struct AshBuffer {
    buffer: vk::Buffer,
    allocation: Mutex<vk_mem::Allocation>,
    size: u64,
}

impl AshBuffer {
    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }
}

pub struct AshTexture {
    image: vk::Image,
    view: vk::ImageView,
    allocation: vk_mem::Allocation,
}

impl AshTexture {
    pub fn view(&self) -> vk::ImageView {
        self.view
    }
}

/// A descriptor set and the pool it was allocated from. Every table from one
/// `create_binding_tables` call shares a pool, which is destroyed with them.
#[derive(Debug)]
pub struct AshBindingTable {
    set: vk::DescriptorSet,
    pool: vk::DescriptorPool,
}

impl AshBindingTable {
    pub fn handle(&self) -> vk::DescriptorSet {
        self.set
    }
}

/// Distinct pools backing `tables`, in first-seen order.
fn pools_of(tables: &[AshBindingTable]) -> Vec<vk::DescriptorPool> {
    let mut pools: Vec<vk::DescriptorPool> = Vec::new();
    for table in tables {
        if !pools.contains(&table.pool) {
            pools.push(table.pool);
        }
    }
    pools
}

fn check_texture_array_len(len: usize, textures_max: u32) -> Result<()> {
    if len > textures_max as usize {
        return Err(EngineError::InvalidConfig(format!(
            "texture array of {len} entries exceeds the layout's {textures_max} descriptors"
        )));
    }
    Ok(())
}

#[derive(Debug)]
pub struct AshCommandBuffer {
    handle: vk::CommandBuffer,
}

impl AshCommandBuffer {
    pub fn handle(&self) -> vk::CommandBuffer {
        self.handle
    }
}

pub struct AshBackend {
    device: ash::Device,
    queue: Mutex<vk::Queue>,
    allocator: vk_mem::Allocator,
    upload_pool: Mutex<vk::CommandPool>,
    render_pool: Mutex<vk::CommandPool>,
    descriptor_pools: Mutex<Vec<vk::DescriptorPool>>,
    sampler: vk::Sampler,
    layouts: AshBindingLayouts,
    min_uniform_alignment: u64,
    textures_max: u32,
}

impl AshBackend {
    /// Creates the backend on top of an existing device.
    ///
    /// # Safety
    ///
    /// Caller must ensure:
    /// - `device` was created from `physical_device` of `instance`
    /// - `queue` belongs to `queue_family_index` and supports graphics and transfer
    /// - the device outlives the backend and everything created through it
    pub unsafe fn new(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        device: ash::Device,
        queue: vk::Queue,
        queue_family_index: u32,
        textures_max: u32,
    ) -> Result<Self> {
        let allocator = vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
            instance,
            &device,
            physical_device,
        ))
        .map_err(|e| EngineError::Allocation(format!("VMA init failed: {e:?}")))?;

        let properties = instance.get_physical_device_properties(physical_device);
        let min_uniform_alignment = properties.limits.min_uniform_buffer_offset_alignment.max(1);

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family_index)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let render_pool = device.create_command_pool(&pool_info, None).map_err(map_vk)?;
        let upload_pool = device
            .create_command_pool(
                &vk::CommandPoolCreateInfo::default()
                    .queue_family_index(queue_family_index)
                    .flags(vk::CommandPoolCreateFlags::TRANSIENT),
                None,
            )
            .map_err(map_vk)?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .compare_op(vk::CompareOp::ALWAYS)
            .max_lod(0.0);
        let sampler = device.create_sampler(&sampler_info, None).map_err(map_vk)?;

        let layouts = Self::create_layouts(&device, textures_max)?;

        log::info!(
            "Vulkan backend ready: {} texture slots, uniform alignment {}",
            textures_max,
            min_uniform_alignment
        );

        Ok(Self {
            device,
            queue: Mutex::new(queue),
            allocator,
            upload_pool: Mutex::new(upload_pool),
            render_pool: Mutex::new(render_pool),
            descriptor_pools: Mutex::new(Vec::new()),
            sampler,
            layouts,
            min_uniform_alignment,
            textures_max,
        })
    }

    unsafe fn create_layouts(device: &ash::Device, textures_max: u32) -> Result<AshBindingLayouts> {
        let frame_bindings = [
            vk::DescriptorSetLayoutBinding::default()
                .binding(PER_FRAME_TEXTURE_ARRAY_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .descriptor_count(textures_max)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(PER_FRAME_SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::FRAGMENT),
            vk::DescriptorSetLayoutBinding::default()
                .binding(PER_FRAME_UBO_BINDING)
                .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::VERTEX | vk::ShaderStageFlags::FRAGMENT),
        ];
        let object_bindings = [vk::DescriptorSetLayoutBinding::default()
            .binding(PER_OBJECT_UBO_BINDING)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .descriptor_count(1)
            .stage_flags(vk::ShaderStageFlags::VERTEX)];

        let frame = device
            .create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&frame_bindings),
                None,
            )
            .map_err(map_vk)?;
        let object = device
            .create_descriptor_set_layout(
                &vk::DescriptorSetLayoutCreateInfo::default().bindings(&object_bindings),
                None,
            )
            .map_err(map_vk)?;

        let set_layouts = [frame, object];
        let pipeline_layout = device
            .create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts),
                None,
            )
            .map_err(map_vk)?;

        Ok(AshBindingLayouts {
            frame,
            object,
            pipeline_layout,
        })
    }

    pub fn device(&self) -> &ash::Device {
        &self.device
    }

    pub fn layouts(&self) -> AshBindingLayouts {
        self.layouts
    }

    pub fn queue(&self) -> vk::Queue {
        *self.queue.lock()
    }

    fn set_layout(&self, frequency: BindFrequency) -> vk::DescriptorSetLayout {
        match frequency {
            BindFrequency::Frame => self.layouts.frame,
            BindFrequency::Object => self.layouts.object,
        }
    }

    /// Records and submits a one-shot command buffer, blocking until it completes.
    ///
    /// The upload pool is locked only while allocating, recording and freeing,
    /// so concurrent uploads overlap their GPU round-trips.
    fn execute_single_use<F>(&self, recorder: F) -> Result<()>
    where
        F: FnOnce(vk::CommandBuffer),
    {
        unsafe {
            let fence = self
                .device
                .create_fence(&vk::FenceCreateInfo::default(), None)
                .map_err(map_vk)?;

            let recorded = {
                let pool = self.upload_pool.lock();
                let alloc_info = vk::CommandBufferAllocateInfo::default()
                    .command_pool(*pool)
                    .level(vk::CommandBufferLevel::PRIMARY)
                    .command_buffer_count(1);
                self.device
                    .allocate_command_buffers(&alloc_info)
                    .map_err(map_vk)
                    .and_then(|command_buffers| {
                        let command_buffer = command_buffers[0];
                        let begun = self
                            .device
                            .begin_command_buffer(
                                command_buffer,
                                &vk::CommandBufferBeginInfo::default()
                                    .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                            )
                            .map_err(map_vk);
                        if let Err(e) = begun {
                            self.device.free_command_buffers(*pool, &command_buffers);
                            return Err(e);
                        }
                        recorder(command_buffer);
                        match self.device.end_command_buffer(command_buffer) {
                            Ok(()) => Ok(command_buffer),
                            Err(e) => {
                                self.device.free_command_buffers(*pool, &command_buffers);
                                Err(map_vk(e))
                            }
                        }
                    })
            };
            let command_buffer = match recorded {
                Ok(command_buffer) => command_buffer,
                Err(e) => {
                    self.device.destroy_fence(fence, None);
                    return Err(e);
                }
            };

            let submit_info =
                vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&command_buffer));
            let submitted = {
                let queue = self.queue.lock();
                self.device
                    .queue_submit(*queue, &[submit_info], fence)
                    .map_err(|e| EngineError::Upload(format!("upload submit failed: {e:?}")))
            };
            let result = submitted.and_then(|()| {
                self.device
                    .wait_for_fences(&[fence], true, u64::MAX)
                    .map_err(map_vk)
            });

            self.device.destroy_fence(fence, None);
            let pool = self.upload_pool.lock();
            self.device
                .free_command_buffers(*pool, std::slice::from_ref(&command_buffer));
            result
        }
    }
}

impl Drop for AshBackend {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::error!("device_wait_idle failed during backend teardown: {e:?}");
            }
            for pool in self.descriptor_pools.get_mut().drain(..) {
                self.device.destroy_descriptor_pool(pool, None);
            }
            self.device
                .destroy_pipeline_layout(self.layouts.pipeline_layout, None);
            self.device
                .destroy_descriptor_set_layout(self.layouts.frame, None);
            self.device
                .destroy_descriptor_set_layout(self.layouts.object, None);
            self.device.destroy_sampler(self.sampler, None);
            self.device
                .destroy_command_pool(*self.upload_pool.get_mut(), None);
            self.device
                .destroy_command_pool(*self.render_pool.get_mut(), None);
        }
        log::info!("Vulkan backend destroyed");
    }
}

impl RenderBackend for AshBackend {
    type Fence = vk::Fence;
    type Semaphore = vk::Semaphore;
    type Buffer = AshBuffer;
    type Texture = AshTexture;
    type BindingTable = AshBindingTable;
    type CommandBuffer = AshCommandBuffer;

    fn name(&self) -> &str {
        "vulkan"
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)
                .map_err(map_vk)
        }
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                .map_err(map_vk)
        }
    }

    fn wait_for_fence(&self, fence: &vk::Fence, timeout: Option<Duration>) -> Result<()> {
        let result = unsafe {
            self.device
                .wait_for_fences(std::slice::from_ref(fence), true, timeout_nanos(timeout))
        };
        match (result, timeout) {
            (Ok(()), _) => Ok(()),
            (Err(vk::Result::TIMEOUT), Some(timeout)) => Err(EngineError::FenceTimeout { timeout }),
            (Err(e), _) => Err(map_vk(e)),
        }
    }

    fn reset_fence(&self, fence: &vk::Fence) -> Result<()> {
        unsafe {
            self.device
                .reset_fences(std::slice::from_ref(fence))
                .map_err(map_vk)
        }
    }

    fn is_fence_signaled(&self, fence: &vk::Fence) -> Result<bool> {
        unsafe { self.device.get_fence_status(*fence).map_err(map_vk) }
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) }
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) }
    }

    fn create_command_buffer(&self) -> Result<AshCommandBuffer> {
        let pool = self.render_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe {
            self.device
                .allocate_command_buffers(&alloc_info)
                .map_err(map_vk)?
        };
        Ok(AshCommandBuffer { handle: buffers[0] })
    }

    fn begin_commands(&self, commands: &mut AshCommandBuffer) -> Result<()> {
        let _pool = self.render_pool.lock();
        unsafe {
            self.device
                .reset_command_buffer(commands.handle, vk::CommandBufferResetFlags::empty())
                .map_err(map_vk)?;
            self.device
                .begin_command_buffer(
                    commands.handle,
                    &vk::CommandBufferBeginInfo::default()
                        .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT),
                )
                .map_err(map_vk)
        }
    }

    fn end_commands(&self, commands: &mut AshCommandBuffer) -> Result<()> {
        let _pool = self.render_pool.lock();
        unsafe { self.device.end_command_buffer(commands.handle).map_err(map_vk) }
    }

    fn destroy_command_buffer(&self, commands: AshCommandBuffer) {
        let pool = self.render_pool.lock();
        unsafe {
            self.device
                .free_command_buffers(*pool, std::slice::from_ref(&commands.handle))
        }
    }

    fn submit(
        &self,
        commands: &AshCommandBuffer,
        wait: &vk::Semaphore,
        wait_stage: WaitStage,
        signal: &vk::Semaphore,
        fence: &vk::Fence,
    ) -> Result<()> {
        let stage = match wait_stage {
            WaitStage::ColorAttachmentOutput => vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
        };
        let wait_semaphores = [*wait];
        let wait_stages = [stage];
        let command_buffers = [commands.handle];
        let signal_semaphores = [*signal];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        let queue = self.queue.lock();
        unsafe {
            self.device
                .queue_submit(*queue, &[submit_info], *fence)
                .map_err(|e| match e {
                    vk::Result::ERROR_DEVICE_LOST => EngineError::DeviceLost,
                    other => EngineError::SubmitFailed(format!("{other:?}")),
                })
        }
    }

    fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle().map_err(map_vk) }
    }

    fn min_uniform_alignment(&self) -> u64 {
        self.min_uniform_alignment
    }

    fn create_uniform_buffer(&self, size: u64) -> Result<AshBuffer> {
        let (buffer, allocation) = unsafe {
            self.allocator
                .create_buffer(
                    &vk::BufferCreateInfo::default()
                        .size(size)
                        .usage(vk::BufferUsageFlags::UNIFORM_BUFFER)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    &vk_mem::AllocationCreateInfo {
                        usage: vk_mem::MemoryUsage::AutoPreferHost,
                        flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                        ..Default::default()
                    },
                )
                .map_err(|e| EngineError::Allocation(format!("uniform buffer: {e:?}")))?
        };
        log::debug!("Uniform buffer created: {} bytes", size);
        Ok(AshBuffer {
            buffer,
            allocation: Mutex::new(allocation),
            size,
        })
    }

    fn write_buffer(&self, buffer: &AshBuffer, offset: u64, bytes: &[u8]) -> Result<()> {
        let len = bytes.len() as u64;
        if offset + len > buffer.size {
            return Err(EngineError::Allocation(format!(
                "write of {len} bytes at offset {offset} exceeds buffer size {}",
                buffer.size
            )));
        }

        let mut allocation = buffer.allocation.lock();
        unsafe {
            let ptr = self
                .allocator
                .map_memory(&mut allocation)
                .map_err(|e| EngineError::Allocation(format!("map uniform buffer: {e:?}")))?;
            std::ptr::copy_nonoverlapping(bytes.as_ptr(), ptr.add(offset as usize), bytes.len());
            let flushed = self.allocator.flush_allocation(&allocation, offset, len);
            self.allocator.unmap_memory(&mut allocation);
            flushed.map_err(|e| EngineError::Allocation(format!("flush uniform buffer: {e:?}")))
        }
    }

    fn destroy_buffer(&self, buffer: AshBuffer) {
        let AshBuffer {
            buffer, allocation, ..
        } = buffer;
        let mut allocation = allocation.into_inner();
        unsafe { self.allocator.destroy_buffer(buffer, &mut allocation) }
    }

    fn upload_texture(&self, image: &DecodedImage) -> Result<AshTexture> {
        let image_size = image.pixels.len() as vk::DeviceSize;

        let (staging_buffer, mut staging_alloc) = unsafe {
            self.allocator
                .create_buffer(
                    &vk::BufferCreateInfo::default()
                        .size(image_size)
                        .usage(vk::BufferUsageFlags::TRANSFER_SRC)
                        .sharing_mode(vk::SharingMode::EXCLUSIVE),
                    &vk_mem::AllocationCreateInfo {
                        usage: vk_mem::MemoryUsage::AutoPreferHost,
                        flags: vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                        ..Default::default()
                    },
                )
                .map_err(|e| EngineError::Upload(format!("staging buffer: {e:?}")))?
        };

        let staged = unsafe {
            self.allocator
                .map_memory(&mut staging_alloc)
                .map(|ptr| {
                    std::ptr::copy_nonoverlapping(image.pixels.as_ptr(), ptr, image.pixels.len());
                })
                .and_then(|()| {
                    let flushed = self.allocator.flush_allocation(&staging_alloc, 0, image_size);
                    self.allocator.unmap_memory(&mut staging_alloc);
                    flushed
                })
                .map_err(|e| EngineError::Upload(format!("staging write: {e:?}")))
        };
        if let Err(e) = staged {
            unsafe {
                self.allocator
                    .destroy_buffer(staging_buffer, &mut staging_alloc)
            };
            return Err(e);
        }

        let extent = vk::Extent3D {
            width: image.width,
            height: image.height,
            depth: 1,
        };
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(TEXTURE_FORMAT)
            .extent(extent)
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let created = unsafe {
            self.allocator.create_image(
                &image_info,
                &vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    ..Default::default()
                },
            )
        };
        let (vk_image, mut allocation) = match created {
            Ok(pair) => pair,
            Err(e) => {
                unsafe {
                    self.allocator
                        .destroy_buffer(staging_buffer, &mut staging_alloc)
                };
                return Err(EngineError::Upload(format!("image allocation: {e:?}")));
            }
        };

        let subresource_range = vk::ImageSubresourceRange {
            aspect_mask: vk::ImageAspectFlags::COLOR,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        };

        let uploaded = self.execute_single_use(|cmd| unsafe {
            let to_transfer = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::UNDEFINED)
                .new_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .src_access_mask(vk::AccessFlags::empty())
                .dst_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .image(vk_image)
                .subresource_range(subresource_range);
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_transfer],
            );

            let region = vk::BufferImageCopy {
                buffer_offset: 0,
                buffer_row_length: 0,
                buffer_image_height: 0,
                image_subresource: vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                },
                image_offset: vk::Offset3D { x: 0, y: 0, z: 0 },
                image_extent: extent,
            };
            self.device.cmd_copy_buffer_to_image(
                cmd,
                staging_buffer,
                vk_image,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                &[region],
            );

            let to_shader = vk::ImageMemoryBarrier::default()
                .old_layout(vk::ImageLayout::TRANSFER_DST_OPTIMAL)
                .new_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                .src_access_mask(vk::AccessFlags::TRANSFER_WRITE)
                .dst_access_mask(vk::AccessFlags::SHADER_READ)
                .image(vk_image)
                .subresource_range(subresource_range);
            self.device.cmd_pipeline_barrier(
                cmd,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                &[to_shader],
            );
        });

        unsafe {
            self.allocator
                .destroy_buffer(staging_buffer, &mut staging_alloc)
        };

        let view = uploaded.and_then(|()| unsafe {
            self.device
                .create_image_view(
                    &vk::ImageViewCreateInfo::default()
                        .image(vk_image)
                        .view_type(vk::ImageViewType::TYPE_2D)
                        .format(TEXTURE_FORMAT)
                        .subresource_range(subresource_range),
                    None,
                )
                .map_err(map_vk)
        });

        match view {
            Ok(view) => {
                log::debug!("Texture uploaded: {}x{}", image.width, image.height);
                Ok(AshTexture {
                    image: vk_image,
                    view,
                    allocation,
                })
            }
            Err(e) => {
                unsafe { self.allocator.destroy_image(vk_image, &mut allocation) };
                Err(e)
            }
        }
    }

    fn texture_descriptor(&self, texture: &AshTexture) -> DescriptorHandle {
        DescriptorHandle(texture.view.as_raw())
    }

    fn destroy_texture(&self, texture: AshTexture) {
        let AshTexture {
            image,
            view,
            mut allocation,
        } = texture;
        unsafe {
            self.device.destroy_image_view(view, None);
            self.allocator.destroy_image(image, &mut allocation);
        }
    }

    fn create_binding_tables(
        &self,
        frequency: BindFrequency,
        count: usize,
    ) -> Result<Vec<AshBindingTable>> {
        let sets = count as u32;
        let pool_sizes: Vec<vk::DescriptorPoolSize> = match frequency {
            BindFrequency::Frame => vec![
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLED_IMAGE,
                    descriptor_count: self.textures_max * sets,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::SAMPLER,
                    descriptor_count: sets,
                },
                vk::DescriptorPoolSize {
                    ty: vk::DescriptorType::UNIFORM_BUFFER,
                    descriptor_count: sets,
                },
            ],
            BindFrequency::Object => vec![vk::DescriptorPoolSize {
                ty: vk::DescriptorType::UNIFORM_BUFFER,
                descriptor_count: sets,
            }],
        };

        let pool = unsafe {
            self.device
                .create_descriptor_pool(
                    &vk::DescriptorPoolCreateInfo::default()
                        .max_sets(sets)
                        .pool_sizes(&pool_sizes),
                    None,
                )
                .map_err(map_vk)?
        };

        let layouts = vec![self.set_layout(frequency); count];
        let allocated = unsafe {
            self.device.allocate_descriptor_sets(
                &vk::DescriptorSetAllocateInfo::default()
                    .descriptor_pool(pool)
                    .set_layouts(&layouts),
            )
        };
        let handles = match allocated {
            Ok(handles) => handles,
            Err(e) => {
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
                return Err(map_vk(e));
            }
        };
        self.descriptor_pools.lock().push(pool);

        Ok(handles
            .into_iter()
            .map(|set| AshBindingTable { set, pool })
            .collect())
    }

    fn write_uniform_binding(
        &self,
        table: &AshBindingTable,
        binding: u32,
        buffer: &AshBuffer,
        offset: u64,
        range: u64,
    ) -> Result<()> {
        let buffer_info = vk::DescriptorBufferInfo {
            buffer: buffer.buffer,
            offset,
            range,
        };
        let write = vk::WriteDescriptorSet::default()
            .dst_set(table.set)
            .dst_binding(binding)
            .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
            .buffer_info(std::slice::from_ref(&buffer_info));
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };
        Ok(())
    }

    fn write_texture_array(&self, table: &AshBindingTable, entries: &[DescriptorHandle]) -> Result<()> {
        check_texture_array_len(entries.len(), self.textures_max)?;
        let image_infos: Vec<vk::DescriptorImageInfo> = entries
            .iter()
            .map(|handle| vk::DescriptorImageInfo {
                sampler: vk::Sampler::null(),
                image_view: vk::ImageView::from_raw(handle.raw()),
                image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            })
            .collect();
        let sampler_info = vk::DescriptorImageInfo {
            sampler: self.sampler,
            ..Default::default()
        };

        let writes = [
            vk::WriteDescriptorSet::default()
                .dst_set(table.set)
                .dst_binding(PER_FRAME_TEXTURE_ARRAY_BINDING)
                .dst_array_element(0)
                .descriptor_type(vk::DescriptorType::SAMPLED_IMAGE)
                .image_info(&image_infos),
            vk::WriteDescriptorSet::default()
                .dst_set(table.set)
                .dst_binding(PER_FRAME_SAMPLER_BINDING)
                .descriptor_type(vk::DescriptorType::SAMPLER)
                .image_info(std::slice::from_ref(&sampler_info)),
        ];
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
        Ok(())
    }

    fn bind_table(
        &self,
        commands: &mut AshCommandBuffer,
        frequency: BindFrequency,
        table: &AshBindingTable,
    ) -> Result<()> {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                commands.handle,
                vk::PipelineBindPoint::GRAPHICS,
                self.layouts.pipeline_layout,
                frequency.set_index(),
                &[table.set],
                &[],
            );
        }
        Ok(())
    }

    fn texture_array_capacity(&self) -> usize {
        self.textures_max as usize
    }

    fn destroy_binding_tables(&self, frequency: BindFrequency, tables: Vec<AshBindingTable>) {
        let pools = pools_of(&tables);
        self.descriptor_pools.lock().retain(|pool| !pools.contains(pool));
        for pool in pools {
            // Destroying the pool frees every set allocated from it.
            unsafe { self.device.destroy_descriptor_pool(pool, None) };
        }
        log::trace!("{} {:?} binding tables released", tables.len(), frequency);
    }
}

/// Swapchain presentation through `VK_KHR_swapchain`.
pub struct AshSurface {
    loader: ash::khr::swapchain::Device,
    swapchain: vk::SwapchainKHR,
    present_queue: vk::Queue,
    image_count: usize,
}

impl AshSurface {
    pub fn new(
        loader: ash::khr::swapchain::Device,
        swapchain: vk::SwapchainKHR,
        present_queue: vk::Queue,
        image_count: usize,
    ) -> Self {
        Self {
            loader,
            swapchain,
            present_queue,
            image_count,
        }
    }

    pub fn swapchain(&self) -> vk::SwapchainKHR {
        self.swapchain
    }

    /// Swaps in a rebuilt swapchain. The caller destroys the old one.
    pub fn replace_swapchain(&mut self, swapchain: vk::SwapchainKHR, image_count: usize) -> vk::SwapchainKHR {
        self.image_count = image_count;
        std::mem::replace(&mut self.swapchain, swapchain)
    }
}

impl PresentationSurface<AshBackend> for AshSurface {
    fn image_count(&self) -> usize {
        self.image_count
    }

    fn acquire_next_image(
        &mut self,
        timeout: Option<Duration>,
        signal: &vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.loader.acquire_next_image(
                self.swapchain,
                timeout_nanos(timeout),
                *signal,
                vk::Fence::null(),
            )
        };
        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::Stale),
            Err(vk::Result::TIMEOUT) | Err(vk::Result::NOT_READY) => Err(EngineError::FenceTimeout {
                timeout: timeout.unwrap_or_default(),
            }),
            Err(e) => Err(map_vk(e)),
        }
    }

    fn present(&mut self, image_index: u32, wait: &vk::Semaphore) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];
        let wait_semaphores = [*wait];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(self.present_queue, &present_info) } {
            Ok(suboptimal) => Ok(PresentOutcome::Presented { suboptimal }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::Stale),
            Err(vk::Result::ERROR_DEVICE_LOST) => Err(EngineError::DeviceLost),
            Err(e) => Err(EngineError::PresentFailed(format!("{e:?}"))),
        }
    }
}

/// An indexed mesh draw, bound after the object's binding table.
#[derive(Debug, Clone, Copy)]
pub struct IndexedDraw {
    pub vertex_buffer: vk::Buffer,
    pub index_buffer: vk::Buffer,
    pub index_count: u32,
    pub index_type: vk::IndexType,
}

impl Drawable<AshBackend> for IndexedDraw {
    fn record(&self, backend: &AshBackend, commands: &mut AshCommandBuffer) -> Result<()> {
        let device = backend.device();
        unsafe {
            device.cmd_bind_vertex_buffers(commands.handle, 0, &[self.vertex_buffer], &[0]);
            device.cmd_bind_index_buffer(commands.handle, self.index_buffer, 0, self.index_type);
            device.cmd_draw_indexed(commands.handle, self.index_count, 1, 0, 0, 0);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(set: u64, pool: u64) -> AshBindingTable {
        AshBindingTable {
            set: vk::DescriptorSet::from_raw(set),
            pool: vk::DescriptorPool::from_raw(pool),
        }
    }

    #[test]
    fn tables_from_one_call_share_a_single_pool() {
        let tables = [table(1, 10), table(2, 10), table(3, 11)];
        assert_eq!(
            pools_of(&tables),
            vec![
                vk::DescriptorPool::from_raw(10),
                vk::DescriptorPool::from_raw(11)
            ]
        );
        assert!(pools_of(&[]).is_empty());
    }

    #[test]
    fn texture_array_longer_than_layout_is_rejected() {
        assert!(check_texture_array_len(64, 64).is_ok());
        assert!(check_texture_array_len(0, 64).is_ok());
        assert!(matches!(
            check_texture_array_len(65, 64),
            Err(EngineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn timeouts_saturate_to_infinite() {
        assert_eq!(timeout_nanos(None), u64::MAX);
        assert_eq!(timeout_nanos(Some(Duration::from_millis(3))), 3_000_000);
    }
}
