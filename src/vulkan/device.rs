//! The narrow interface the frame lifecycle consumes from the GPU.
//!
//! Everything above this module (frame slots, the swapchain manager, meshes
//! and scenes) talks to the device only through [`GpuDevice`] and
//! [`ResourceUploader`]. [`AshDevice`](super::AshDevice) is the Vulkan
//! implementation; tests substitute a recording double.

use std::path::Path;

use ash::vk;

use super::command::CommandContext;
use crate::Result;

/// Where a buffer's memory lives.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Host-visible, persistently mapped for the buffer's whole lifetime.
    CpuToGpu,
    /// Device-local; filled through a staging copy.
    GpuOnly,
}

/// A device buffer. Memory is tracked by the device that created it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GpuBuffer {
    pub handle: vk::Buffer,
    pub size: vk::DeviceSize,
}

impl GpuBuffer {
    pub const fn null() -> Self {
        Self {
            handle: vk::Buffer::null(),
            size: 0,
        }
    }

    pub fn is_null(&self) -> bool {
        self.handle == vk::Buffer::null()
    }
}

/// Depth attachment owned by a frame slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DepthImage {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub format: vk::Format,
}

/// A sampled texture together with the set-1 descriptor set that binds it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Texture {
    pub image: vk::Image,
    pub view: vk::ImageView,
    pub sampler: vk::Sampler,
    pub descriptor_pool: vk::DescriptorPool,
    pub descriptor_set: vk::DescriptorSet,
    pub extent: vk::Extent2D,
}

/// What the surface supports, as reported by the physical device.
#[derive(Clone, Debug, Default)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Parameters for one swapchain creation.
#[derive(Clone, Copy, Debug)]
pub struct SwapchainDesc {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub min_image_count: u32,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcquireOutcome {
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

/// One command buffer submission to the graphics queue.
#[derive(Clone, Copy, Debug)]
pub struct Submission {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphore: vk::Semaphore,
    pub wait_stage: vk::PipelineStageFlags,
    pub signal_semaphore: vk::Semaphore,
    pub fence: vk::Fence,
}

/// A descriptor pool holding exactly one set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DescriptorAllocation {
    pub pool: vk::DescriptorPool,
    pub set: vk::DescriptorSet,
}

/// One buffer-to-binding write into a descriptor set.
#[derive(Clone, Copy, Debug)]
pub struct BufferBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub buffer: GpuBuffer,
}

/// Buffer creation, staging uploads and texture loading.
pub trait ResourceUploader {
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<GpuBuffer>;

    /// Copies `data` into a [`MemoryLocation::CpuToGpu`] buffer through its mapping.
    fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()>;

    /// Copies `data` into `dst` through a temporary staging buffer and a
    /// one-shot command, blocking until the copy has finished.
    fn upload_via_staging(&self, dst: &GpuBuffer, data: &[u8]) -> Result<()>;

    fn destroy_buffer(&self, buffer: GpuBuffer);

    /// Decodes an image file and uploads it as a sampled texture whose
    /// descriptor set uses `layout`.
    fn load_texture(&self, path: &Path, layout: vk::DescriptorSetLayout) -> Result<Texture>;

    fn destroy_texture(&self, texture: Texture);
}

/// Surface queries, presentation, synchronization and submission.
pub trait GpuDevice: ResourceUploader {
    type Context<'a>: CommandContext
    where
        Self: 'a;

    fn surface_support(&self) -> Result<SurfaceSupport>;

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR>;
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>>;
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);

    /// Requests the next presentable image, signalling `signal` once it is ready.
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<AcquireOutcome>;

    /// Queues `image_index` for presentation once `wait` is signalled.
    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome>;

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView>;
    fn destroy_image_view(&self, view: vk::ImageView);

    fn create_depth_image(&self, extent: vk::Extent2D, format: vk::Format) -> Result<DepthImage>;
    fn destroy_depth_image(&self, depth: DepthImage);

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer>;
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    fn create_semaphore(&self) -> Result<vk::Semaphore>;
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence>;
    fn destroy_fence(&self, fence: vk::Fence);
    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()>;
    fn reset_fence(&self, fence: vk::Fence) -> Result<()>;

    fn device_wait_idle(&self) -> Result<()>;

    /// A pool on the graphics family whose buffers can be reset individually.
    fn create_command_pool(&self) -> Result<vk::CommandPool>;
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer>;
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    fn command_context(&self, command_buffer: vk::CommandBuffer) -> Self::Context<'_>;

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorAllocation>;
    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool);
    fn write_buffer_descriptors(&self, set: vk::DescriptorSet, bindings: &[BufferBinding]);

    /// Submits to the graphics queue. Failures come back as
    /// [`RenderError::Vulkan`](crate::RenderError::Vulkan).
    fn submit(&self, submission: &Submission) -> Result<()>;
}
