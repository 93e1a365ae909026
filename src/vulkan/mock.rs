//! A recording [`GpuDevice`] for unit tests.
//!
//! Handles are fabricated from a counter. Every created object is tracked
//! until destroyed so tests can assert nothing leaks. Submissions signal
//! their fence immediately.

use std::collections::{HashMap, HashSet, VecDeque};
use std::path::Path;

use ash::vk::{self, Handle};
use parking_lot::Mutex;

use super::command::CommandContext;
use super::device::{
    AcquireOutcome, BufferBinding, DepthImage, DescriptorAllocation, GpuBuffer, GpuDevice,
    MemoryLocation, PresentOutcome, ResourceUploader, Submission, SurfaceSupport, SwapchainDesc,
    Texture,
};
use super::surface::ExtentSource;
use crate::{RenderError, Result};

#[derive(Clone, Debug, PartialEq)]
pub enum Command {
    Reset,
    Begin,
    End,
    BeginRenderPass {
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
    },
    EndRenderPass,
    SetViewportAndScissor(vk::Extent2D),
    BindPipeline(vk::Pipeline),
    BindDescriptorSet {
        set_index: u32,
        set: vk::DescriptorSet,
    },
    BindVertexBuffer(vk::Buffer),
    BindIndexBuffer(vk::Buffer),
    DrawIndexed {
        index_count: u32,
        instance_count: u32,
        first_instance: u32,
    },
}

struct MockState {
    next_handle: u64,
    live: HashSet<u64>,
    fences: HashMap<vk::Fence, bool>,
    buffers: HashMap<vk::Buffer, Vec<u8>>,
    commands: HashMap<vk::CommandBuffer, Vec<Command>>,
    descriptor_writes: HashMap<vk::DescriptorSet, Vec<BufferBinding>>,
    swapchains: HashMap<vk::SwapchainKHR, Vec<vk::Image>>,
    swapchain_descs: Vec<SwapchainDesc>,
    submissions: Vec<Submission>,
    presents: Vec<u32>,
    present_waits: Vec<vk::Semaphore>,
    acquire_script: VecDeque<AcquireOutcome>,
    present_script: VecDeque<PresentOutcome>,
    next_image: u32,
    image_count_override: Option<u32>,
    surface: SurfaceSupport,
    failing_submits: usize,
    fail_buffer_creation: bool,
    fail_uploads: bool,
    wait_idle_calls: usize,
}

impl MockState {
    fn handle<H: Handle>(&mut self) -> H {
        self.next_handle += 1;
        self.live.insert(self.next_handle);
        H::from_raw(self.next_handle)
    }

    fn release<H: Handle>(&mut self, handle: H) {
        self.live.remove(&handle.as_raw());
    }
}

pub struct MockDevice {
    state: Mutex<MockState>,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl MockDevice {
    pub fn new() -> Self {
        let surface = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR {
                min_image_count: 2,
                max_image_count: 3,
                current_extent: vk::Extent2D {
                    width: u32::MAX,
                    height: u32::MAX,
                },
                min_image_extent: vk::Extent2D {
                    width: 1,
                    height: 1,
                },
                max_image_extent: vk::Extent2D {
                    width: 4096,
                    height: 4096,
                },
                current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
                ..Default::default()
            },
            formats: vec![
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_UNORM,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
                vk::SurfaceFormatKHR {
                    format: vk::Format::B8G8R8A8_SRGB,
                    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
                },
            ],
            present_modes: vec![vk::PresentModeKHR::FIFO, vk::PresentModeKHR::MAILBOX],
        };

        Self {
            state: Mutex::new(MockState {
                next_handle: 0,
                live: HashSet::new(),
                fences: HashMap::new(),
                buffers: HashMap::new(),
                commands: HashMap::new(),
                descriptor_writes: HashMap::new(),
                swapchains: HashMap::new(),
                swapchain_descs: Vec::new(),
                submissions: Vec::new(),
                presents: Vec::new(),
                present_waits: Vec::new(),
                acquire_script: VecDeque::new(),
                present_script: VecDeque::new(),
                next_image: 0,
                image_count_override: None,
                surface,
                failing_submits: 0,
                fail_buffer_creation: false,
                fail_uploads: false,
                wait_idle_calls: 0,
            }),
        }
    }

    /// Number of created objects not yet destroyed.
    pub fn live_objects(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_live<H: Handle>(&self, handle: H) -> bool {
        self.state.lock().live.contains(&handle.as_raw())
    }

    pub fn commands(&self, command_buffer: vk::CommandBuffer) -> Vec<Command> {
        self.state
            .lock()
            .commands
            .get(&command_buffer)
            .cloned()
            .unwrap_or_default()
    }

    pub fn buffer_contents(&self, buffer: &GpuBuffer) -> Vec<u8> {
        self.state
            .lock()
            .buffers
            .get(&buffer.handle)
            .cloned()
            .unwrap_or_default()
    }

    pub fn descriptor_writes(&self, set: vk::DescriptorSet) -> Vec<BufferBinding> {
        self.state
            .lock()
            .descriptor_writes
            .get(&set)
            .cloned()
            .unwrap_or_default()
    }

    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state.lock().fences.get(&fence).copied().unwrap_or(false)
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.state.lock().submissions.clone()
    }

    /// Image indices passed to `queue_present`, in order.
    pub fn presents(&self) -> Vec<u32> {
        self.state.lock().presents.clone()
    }

    /// Semaphores each present waited on, in present order.
    pub fn present_waits(&self) -> Vec<vk::Semaphore> {
        self.state.lock().present_waits.clone()
    }

    pub fn swapchain_descs(&self) -> Vec<SwapchainDesc> {
        self.state.lock().swapchain_descs.clone()
    }

    pub fn wait_idle_calls(&self) -> usize {
        self.state.lock().wait_idle_calls
    }

    pub fn script_acquire(&self, outcome: AcquireOutcome) {
        self.state.lock().acquire_script.push_back(outcome);
    }

    pub fn script_present(&self, outcome: PresentOutcome) {
        self.state.lock().present_script.push_back(outcome);
    }

    /// The next `count` submissions fail with `ERROR_DEVICE_LOST` and leave
    /// their fence unsignaled.
    pub fn fail_next_submits(&self, count: usize) {
        self.state.lock().failing_submits = count;
    }

    pub fn set_fail_buffer_creation(&self, fail: bool) {
        self.state.lock().fail_buffer_creation = fail;
    }

    pub fn set_fail_uploads(&self, fail: bool) {
        self.state.lock().fail_uploads = fail;
    }

    pub fn set_image_count(&self, count: u32) {
        self.state.lock().image_count_override = Some(count);
    }

    pub fn set_surface_formats(&self, formats: Vec<vk::SurfaceFormatKHR>) {
        self.state.lock().surface.formats = formats;
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: Command) {
        let mut state = self.state.lock();
        let log = state.commands.entry(command_buffer).or_default();
        if command == Command::Reset {
            log.clear();
        }
        log.push(command);
    }
}

impl ResourceUploader for MockDevice {
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        _usage: vk::BufferUsageFlags,
        _location: MemoryLocation,
    ) -> Result<GpuBuffer> {
        let mut state = self.state.lock();
        if state.fail_buffer_creation {
            return Err(RenderError::Vulkan(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY));
        }
        let handle = state.handle();
        state.buffers.insert(handle, vec![0; size as usize]);
        Ok(GpuBuffer { handle, size })
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        let contents = state
            .buffers
            .get_mut(&buffer.handle)
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_MEMORY_MAP_FAILED))?;
        let start = offset as usize;
        let end = start + data.len();
        if end > contents.len() {
            return Err(RenderError::CapacityExceeded {
                requested: end,
                capacity: contents.len(),
            });
        }
        contents[start..end].copy_from_slice(data);
        Ok(())
    }

    fn upload_via_staging(&self, dst: &GpuBuffer, data: &[u8]) -> Result<()> {
        if self.state.lock().fail_uploads {
            return Err(RenderError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        self.write_buffer(dst, 0, data)
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        let mut state = self.state.lock();
        state.buffers.remove(&buffer.handle);
        state.release(buffer.handle);
    }

    fn load_texture(&self, _path: &Path, _layout: vk::DescriptorSetLayout) -> Result<Texture> {
        let mut state = self.state.lock();
        if state.fail_uploads {
            return Err(RenderError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        let image = state.handle();
        Ok(Texture {
            image,
            view: vk::ImageView::from_raw(image.as_raw()),
            sampler: vk::Sampler::from_raw(image.as_raw()),
            descriptor_pool: vk::DescriptorPool::from_raw(image.as_raw()),
            descriptor_set: vk::DescriptorSet::from_raw(image.as_raw()),
            extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
        })
    }

    fn destroy_texture(&self, texture: Texture) {
        self.state.lock().release(texture.image);
    }
}

pub struct MockCommandContext<'a> {
    device: &'a MockDevice,
    command_buffer: vk::CommandBuffer,
}

impl CommandContext for MockCommandContext<'_> {
    fn reset(&mut self) -> Result<()> {
        self.device.record(self.command_buffer, Command::Reset);
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        self.device.record(self.command_buffer, Command::Begin);
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        self.device.record(self.command_buffer, Command::End);
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        _render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        _clear_values: &[vk::ClearValue],
    ) {
        self.device.record(
            self.command_buffer,
            Command::BeginRenderPass {
                framebuffer,
                extent,
            },
        );
    }

    fn end_render_pass(&mut self) {
        self.device
            .record(self.command_buffer, Command::EndRenderPass);
    }

    fn set_viewport_and_scissor(&mut self, extent: vk::Extent2D) {
        self.device
            .record(self.command_buffer, Command::SetViewportAndScissor(extent));
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        self.device
            .record(self.command_buffer, Command::BindPipeline(pipeline));
    }

    fn bind_descriptor_set(
        &mut self,
        _layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        self.device.record(
            self.command_buffer,
            Command::BindDescriptorSet { set_index, set },
        );
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer) {
        self.device
            .record(self.command_buffer, Command::BindVertexBuffer(buffer));
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer) {
        self.device
            .record(self.command_buffer, Command::BindIndexBuffer(buffer));
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_instance: u32) {
        self.device.record(
            self.command_buffer,
            Command::DrawIndexed {
                index_count,
                instance_count,
                first_instance,
            },
        );
    }
}

impl GpuDevice for MockDevice {
    type Context<'a> = MockCommandContext<'a>;

    fn surface_support(&self) -> Result<SurfaceSupport> {
        Ok(self.state.lock().surface.clone())
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let mut state = self.state.lock();
        let count = state.image_count_override.unwrap_or(desc.min_image_count);
        let swapchain: vk::SwapchainKHR = state.handle();
        let images: Vec<vk::Image> = (0..count)
            .map(|_| {
                state.next_handle += 1;
                vk::Image::from_raw(state.next_handle)
            })
            .collect();
        state.swapchains.insert(swapchain, images);
        state.swapchain_descs.push(*desc);
        state.next_image = 0;
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        self.state
            .lock()
            .swapchains
            .get(&swapchain)
            .cloned()
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.lock();
        state.swapchains.remove(&swapchain);
        state.release(swapchain);
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        _signal: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let mut state = self.state.lock();
        if let Some(outcome) = state.acquire_script.pop_front() {
            return Ok(outcome);
        }
        let count = state
            .swapchains
            .get(&swapchain)
            .map(|images| images.len() as u32)
            .ok_or(RenderError::Vulkan(vk::Result::ERROR_SURFACE_LOST_KHR))?;
        let image_index = state.next_image % count;
        state.next_image += 1;
        Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal: false,
        })
    }

    fn queue_present(
        &self,
        _swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let mut state = self.state.lock();
        state.presents.push(image_index);
        state.present_waits.push(wait);
        Ok(state
            .present_script
            .pop_front()
            .unwrap_or(PresentOutcome::Presented))
    }

    fn create_image_view(
        &self,
        _image: vk::Image,
        _format: vk::Format,
        _aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        Ok(self.state.lock().handle())
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.state.lock().release(view);
    }

    fn create_depth_image(&self, _extent: vk::Extent2D, format: vk::Format) -> Result<DepthImage> {
        let mut state = self.state.lock();
        Ok(DepthImage {
            image: state.handle(),
            view: state.handle(),
            format,
        })
    }

    fn destroy_depth_image(&self, depth: DepthImage) {
        let mut state = self.state.lock();
        state.release(depth.view);
        state.release(depth.image);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        _attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        Ok(self.state.lock().handle())
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.state.lock().release(framebuffer);
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(self.state.lock().handle())
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.lock().release(semaphore);
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let mut state = self.state.lock();
        let fence = state.handle();
        state.fences.insert(fence, signaled);
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.lock();
        state.fences.remove(&fence);
        state.release(fence);
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout_ns: u64) -> Result<()> {
        match self.state.lock().fences.get(&fence) {
            Some(true) => Ok(()),
            _ => Err(RenderError::FenceTimeout),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        self.state.lock().fences.insert(fence, false);
        Ok(())
    }

    fn device_wait_idle(&self) -> Result<()> {
        self.state.lock().wait_idle_calls += 1;
        Ok(())
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        Ok(self.state.lock().handle())
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let mut state = self.state.lock();
        // Freed with the pool, so not tracked on its own.
        state.next_handle += 1;
        let command_buffer = vk::CommandBuffer::from_raw(state.next_handle);
        debug_assert!(state.live.contains(&pool.as_raw()));
        Ok(command_buffer)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.state.lock().release(pool);
    }

    fn command_context(&self, command_buffer: vk::CommandBuffer) -> Self::Context<'_> {
        MockCommandContext {
            device: self,
            command_buffer,
        }
    }

    fn allocate_descriptor_set(
        &self,
        _layout: vk::DescriptorSetLayout,
        _pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorAllocation> {
        let mut state = self.state.lock();
        let pool = state.handle();
        state.next_handle += 1;
        Ok(DescriptorAllocation {
            pool,
            set: vk::DescriptorSet::from_raw(state.next_handle),
        })
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        self.state.lock().release(pool);
    }

    fn write_buffer_descriptors(&self, set: vk::DescriptorSet, bindings: &[BufferBinding]) {
        self.state
            .lock()
            .descriptor_writes
            .insert(set, bindings.to_vec());
    }

    fn submit(&self, submission: &Submission) -> Result<()> {
        let mut state = self.state.lock();
        if state.failing_submits > 0 {
            state.failing_submits -= 1;
            return Err(RenderError::Vulkan(vk::Result::ERROR_DEVICE_LOST));
        }
        state.fences.insert(submission.fence, true);
        state.submissions.push(*submission);
        Ok(())
    }
}

/// Returns scripted extents in order, then repeats the last one.
pub struct ScriptedExtent {
    script: Mutex<VecDeque<vk::Extent2D>>,
    last: Mutex<vk::Extent2D>,
    polls: Mutex<usize>,
}

impl ScriptedExtent {
    pub fn new(extents: &[(u32, u32)]) -> Self {
        let script: VecDeque<_> = extents
            .iter()
            .map(|&(width, height)| vk::Extent2D { width, height })
            .collect();
        let last = script.back().copied().unwrap_or_default();
        Self {
            script: Mutex::new(script),
            last: Mutex::new(last),
            polls: Mutex::new(0),
        }
    }

    pub fn polls(&self) -> usize {
        *self.polls.lock()
    }
}

impl ExtentSource for ScriptedExtent {
    fn current_extent(&self) -> vk::Extent2D {
        *self.polls.lock() += 1;
        match self.script.lock().pop_front() {
            Some(extent) => {
                *self.last.lock() = extent;
                extent
            }
            None => *self.last.lock(),
        }
    }
}
