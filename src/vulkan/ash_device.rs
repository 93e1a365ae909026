//! [`GpuDevice`] over a real Vulkan device.
//!
//! Buffers and images are allocated through `vk-mem`. Host-visible buffers
//! stay mapped for their whole lifetime; device-local buffers and textures
//! are filled with a staging buffer and a one-shot command on the graphics
//! queue.

use std::collections::HashMap;
use std::ffi::CStr;
use std::mem::ManuallyDrop;
use std::path::Path;
use std::ptr;
use std::sync::Arc;

use ash::prelude::VkResult;
use ash::{khr::swapchain, vk};
use log::{debug, info, warn};
use parking_lot::Mutex;
use vk_mem::Alloc;

use super::command::AshCommandContext;
use super::device::{
    AcquireOutcome, BufferBinding, DepthImage, DescriptorAllocation, GpuBuffer, GpuDevice,
    MemoryLocation, PresentOutcome, ResourceUploader, Submission, SurfaceSupport, SwapchainDesc,
    Texture,
};
use super::instance::VulkanInstance;
use crate::{RenderError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueueFamilies {
    pub graphics: u32,
    pub present: u32,
}

/// The logical device, its queues and the memory allocator.
///
/// Every object created through this device must be destroyed before it is
/// dropped. Holders share it through an `Arc`.
pub struct AshDevice {
    physical_device: vk::PhysicalDevice,
    device_name: String,
    device: Arc<ash::Device>,
    swapchain_loader: swapchain::Device,
    queue_families: QueueFamilies,
    graphics_queue: vk::Queue,
    present_queue: vk::Queue,
    upload_pool: Mutex<vk::CommandPool>,
    allocator: ManuallyDrop<vk_mem::Allocator>,
    buffer_allocations: Mutex<HashMap<vk::Buffer, vk_mem::Allocation>>,
    image_allocations: Mutex<HashMap<vk::Image, vk_mem::Allocation>>,
    // Dropped last: the surface and instance outlive the device.
    instance: VulkanInstance,
}

impl AshDevice {
    /// Picks the best GPU that can present to `instance`'s surface and
    /// creates a logical device with one graphics and one present queue.
    pub fn new(instance: VulkanInstance) -> Result<Self> {
        let (physical_device, queue_families, device_name) = select_physical_device(&instance)?;

        let priorities = [1.0f32];
        let mut families = vec![queue_families.graphics];
        if queue_families.present != queue_families.graphics {
            families.push(queue_families.present);
        }
        let queue_infos: Vec<_> = families
            .iter()
            .map(|&family| {
                vk::DeviceQueueCreateInfo::default()
                    .queue_family_index(family)
                    .queue_priorities(&priorities)
            })
            .collect();

        let extensions = [swapchain::NAME.as_ptr()];
        let features = vk::PhysicalDeviceFeatures::default();
        let create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(&queue_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&features);

        let device = unsafe {
            instance
                .instance()
                .create_device(physical_device, &create_info, None)
                .map_err(|e| RenderError::Creation(format!("logical device: {e}")))?
        };

        let graphics_queue = unsafe { device.get_device_queue(queue_families.graphics, 0) };
        let present_queue = unsafe { device.get_device_queue(queue_families.present, 0) };
        let swapchain_loader = swapchain::Device::new(instance.instance(), &device);

        let allocator = unsafe {
            vk_mem::Allocator::new(vk_mem::AllocatorCreateInfo::new(
                instance.instance(),
                &device,
                physical_device,
            ))
        };
        let allocator = match allocator {
            Ok(allocator) => allocator,
            Err(e) => {
                unsafe { device.destroy_device(None) };
                return Err(RenderError::Creation(format!("memory allocator: {e}")));
            }
        };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::TRANSIENT)
            .queue_family_index(queue_families.graphics);
        let upload_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                drop(allocator);
                unsafe { device.destroy_device(None) };
                return Err(RenderError::Creation(format!("upload command pool: {e}")));
            }
        };

        info!(
            "Logical device created on '{device_name}' (graphics family {}, present family {})",
            queue_families.graphics, queue_families.present
        );

        Ok(Self {
            physical_device,
            device_name,
            device: Arc::new(device),
            swapchain_loader,
            queue_families,
            graphics_queue,
            present_queue,
            upload_pool: Mutex::new(upload_pool),
            allocator: ManuallyDrop::new(allocator),
            buffer_allocations: Mutex::new(HashMap::new()),
            image_allocations: Mutex::new(HashMap::new()),
            instance,
        })
    }

    /// The raw device, for building pipelines and layouts.
    pub fn device(&self) -> &Arc<ash::Device> {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn device_name(&self) -> &str {
        &self.device_name
    }

    pub fn queue_families(&self) -> QueueFamilies {
        self.queue_families
    }

    pub fn instance(&self) -> &VulkanInstance {
        &self.instance
    }

    /// Records with `record` into a fresh command buffer, submits it to the
    /// graphics queue and blocks until it has executed.
    fn one_shot(&self, record: impl FnOnce(vk::CommandBuffer)) -> Result<()> {
        let pool = self.upload_pool.lock();
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(*pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        unsafe {
            let command_buffers = self.device.allocate_command_buffers(&alloc_info)?;
            let result = self.run_one_shot(command_buffers[0], record);
            self.device.free_command_buffers(*pool, &command_buffers);
            result
        }
    }

    unsafe fn run_one_shot(
        &self,
        command_buffer: vk::CommandBuffer,
        record: impl FnOnce(vk::CommandBuffer),
    ) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        self.device
            .begin_command_buffer(command_buffer, &begin_info)?;
        record(command_buffer);
        self.device.end_command_buffer(command_buffer)?;

        let fence = self
            .device
            .create_fence(&vk::FenceCreateInfo::default(), None)?;
        let command_buffers = [command_buffer];
        let submit_info = vk::SubmitInfo::default().command_buffers(&command_buffers);
        let result = self
            .device
            .queue_submit(self.graphics_queue, &[submit_info], fence)
            .and_then(|()| self.device.wait_for_fences(&[fence], true, u64::MAX));
        self.device.destroy_fence(fence, None);
        Ok(result?)
    }

    fn create_image(
        &self,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
    ) -> Result<vk::Image> {
        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_2D)
            .format(format)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);
        let alloc_info = vk_mem::AllocationCreateInfo {
            usage: vk_mem::MemoryUsage::AutoPreferDevice,
            ..Default::default()
        };

        let (image, allocation) = unsafe { self.allocator.create_image(&image_info, &alloc_info)? };
        self.image_allocations.lock().insert(image, allocation);
        Ok(image)
    }

    fn destroy_image(&self, image: vk::Image) {
        if let Some(mut allocation) = self.image_allocations.lock().remove(&image) {
            unsafe { self.allocator.destroy_image(image, &mut allocation) };
        }
    }

    fn upload_texture_pixels(&self, image: vk::Image, extent: vk::Extent2D, pixels: &[u8]) -> Result<()> {
        let staging = self.create_buffer(
            pixels.len() as vk::DeviceSize,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        let result = self.write_buffer(&staging, 0, pixels).and_then(|()| {
            self.one_shot(|cmd| unsafe {
                self.transition_color_image(
                    cmd,
                    image,
                    vk::ImageLayout::UNDEFINED,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                );
                let region = vk::BufferImageCopy::default()
                    .image_subresource(vk::ImageSubresourceLayers {
                        aspect_mask: vk::ImageAspectFlags::COLOR,
                        mip_level: 0,
                        base_array_layer: 0,
                        layer_count: 1,
                    })
                    .image_extent(vk::Extent3D {
                        width: extent.width,
                        height: extent.height,
                        depth: 1,
                    });
                self.device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.handle,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
                self.transition_color_image(
                    cmd,
                    image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
                );
            })
        });

        self.destroy_buffer(staging);
        result
    }

    unsafe fn transition_color_image(
        &self,
        cmd: vk::CommandBuffer,
        image: vk::Image,
        old_layout: vk::ImageLayout,
        new_layout: vk::ImageLayout,
    ) {
        let (src_access, dst_access, src_stage, dst_stage) = match new_layout {
            vk::ImageLayout::TRANSFER_DST_OPTIMAL => (
                vk::AccessFlags::empty(),
                vk::AccessFlags::TRANSFER_WRITE,
                vk::PipelineStageFlags::TOP_OF_PIPE,
                vk::PipelineStageFlags::TRANSFER,
            ),
            _ => (
                vk::AccessFlags::TRANSFER_WRITE,
                vk::AccessFlags::SHADER_READ,
                vk::PipelineStageFlags::TRANSFER,
                vk::PipelineStageFlags::FRAGMENT_SHADER,
            ),
        };

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old_layout)
            .new_layout(new_layout)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(image)
            .subresource_range(color_subresource_range())
            .src_access_mask(src_access)
            .dst_access_mask(dst_access);

        self.device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    fn create_sampler(&self) -> Result<vk::Sampler> {
        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::LINEAR)
            .min_filter(vk::Filter::LINEAR)
            .address_mode_u(vk::SamplerAddressMode::REPEAT)
            .address_mode_v(vk::SamplerAddressMode::REPEAT)
            .address_mode_w(vk::SamplerAddressMode::REPEAT)
            .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
            .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
            .max_lod(0.0);
        Ok(unsafe { self.device.create_sampler(&sampler_info, None)? })
    }

    fn build_texture(&self, texture: &mut Texture, path: &Path, layout: vk::DescriptorSetLayout) -> Result<()> {
        let pixels = image::open(path)?.to_rgba8();
        let extent = vk::Extent2D {
            width: pixels.width(),
            height: pixels.height(),
        };
        texture.extent = extent;

        texture.image = self.create_image(
            extent,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
        )?;
        self.upload_texture_pixels(texture.image, extent, pixels.as_raw())?;
        texture.view = self.create_image_view(
            texture.image,
            vk::Format::R8G8B8A8_SRGB,
            vk::ImageAspectFlags::COLOR,
        )?;
        texture.sampler = self.create_sampler()?;

        let descriptor = self.allocate_descriptor_set(
            layout,
            &[vk::DescriptorPoolSize {
                ty: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                descriptor_count: 1,
            }],
        )?;
        texture.descriptor_pool = descriptor.pool;
        texture.descriptor_set = descriptor.set;

        let image_info = [vk::DescriptorImageInfo {
            sampler: texture.sampler,
            image_view: texture.view,
            image_layout: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
        }];
        let write = vk::WriteDescriptorSet::default()
            .dst_set(descriptor.set)
            .dst_binding(0)
            .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
            .image_info(&image_info);
        unsafe { self.device.update_descriptor_sets(&[write], &[]) };

        info!(
            "Loaded texture {} ({}x{})",
            path.display(),
            extent.width,
            extent.height
        );
        Ok(())
    }
}

impl Drop for AshDevice {
    fn drop(&mut self) {
        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during shutdown: {e}");
            }

            let buffers = std::mem::take(&mut *self.buffer_allocations.lock());
            if !buffers.is_empty() {
                warn!("{} buffers still alive at device shutdown", buffers.len());
            }
            for (buffer, mut allocation) in buffers {
                self.allocator.destroy_buffer(buffer, &mut allocation);
            }
            let images = std::mem::take(&mut *self.image_allocations.lock());
            if !images.is_empty() {
                warn!("{} images still alive at device shutdown", images.len());
            }
            for (image, mut allocation) in images {
                self.allocator.destroy_image(image, &mut allocation);
            }

            self.device
                .destroy_command_pool(*self.upload_pool.get_mut(), None);
            ManuallyDrop::drop(&mut self.allocator);
            self.device.destroy_device(None);
        }
        debug!("Logical device destroyed");
    }
}

impl ResourceUploader for AshDevice {
    fn create_buffer(
        &self,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        location: MemoryLocation,
    ) -> Result<GpuBuffer> {
        let (usage, alloc_info) = match location {
            MemoryLocation::CpuToGpu => (
                usage,
                vk_mem::AllocationCreateInfo {
                    flags: vk_mem::AllocationCreateFlags::MAPPED
                        | vk_mem::AllocationCreateFlags::HOST_ACCESS_SEQUENTIAL_WRITE,
                    usage: vk_mem::MemoryUsage::Auto,
                    ..Default::default()
                },
            ),
            MemoryLocation::GpuOnly => (
                usage | vk::BufferUsageFlags::TRANSFER_DST,
                vk_mem::AllocationCreateInfo {
                    usage: vk_mem::MemoryUsage::AutoPreferDevice,
                    ..Default::default()
                },
            ),
        };

        let buffer_info = vk::BufferCreateInfo::default()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let (handle, allocation) =
            unsafe { self.allocator.create_buffer(&buffer_info, &alloc_info)? };
        self.buffer_allocations.lock().insert(handle, allocation);
        Ok(GpuBuffer { handle, size })
    }

    fn write_buffer(&self, buffer: &GpuBuffer, offset: vk::DeviceSize, data: &[u8]) -> Result<()> {
        let end = offset + data.len() as vk::DeviceSize;
        if end > buffer.size {
            return Err(RenderError::CapacityExceeded {
                requested: end as usize,
                capacity: buffer.size as usize,
            });
        }

        let allocations = self.buffer_allocations.lock();
        let allocation = allocations
            .get(&buffer.handle)
            .ok_or_else(|| RenderError::Upload("write to unknown buffer".to_string()))?;

        unsafe {
            let mapped = self.allocator.get_allocation_info(allocation).mapped_data;
            if mapped.is_null() {
                return Err(RenderError::Upload("buffer is not host-mapped".to_string()));
            }
            ptr::copy_nonoverlapping(
                data.as_ptr(),
                mapped.cast::<u8>().add(offset as usize),
                data.len(),
            );
            self.allocator
                .flush_allocation(allocation, offset, data.len() as vk::DeviceSize)?;
        }
        Ok(())
    }

    fn upload_via_staging(&self, dst: &GpuBuffer, data: &[u8]) -> Result<()> {
        let size = data.len() as vk::DeviceSize;
        let staging = self.create_buffer(
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            MemoryLocation::CpuToGpu,
        )?;

        let result = self.write_buffer(&staging, 0, data).and_then(|()| {
            self.one_shot(|cmd| unsafe {
                let region = vk::BufferCopy {
                    src_offset: 0,
                    dst_offset: 0,
                    size,
                };
                self.device
                    .cmd_copy_buffer(cmd, staging.handle, dst.handle, &[region]);
            })
        });

        self.destroy_buffer(staging);
        result
    }

    fn destroy_buffer(&self, buffer: GpuBuffer) {
        if let Some(mut allocation) = self.buffer_allocations.lock().remove(&buffer.handle) {
            unsafe { self.allocator.destroy_buffer(buffer.handle, &mut allocation) };
        }
    }

    fn load_texture(&self, path: &Path, layout: vk::DescriptorSetLayout) -> Result<Texture> {
        let mut texture = Texture {
            image: vk::Image::null(),
            view: vk::ImageView::null(),
            sampler: vk::Sampler::null(),
            descriptor_pool: vk::DescriptorPool::null(),
            descriptor_set: vk::DescriptorSet::null(),
            extent: vk::Extent2D::default(),
        };

        match self.build_texture(&mut texture, path, layout) {
            Ok(()) => Ok(texture),
            Err(e) => {
                self.destroy_texture(texture);
                Err(e)
            }
        }
    }

    fn destroy_texture(&self, texture: Texture) {
        unsafe {
            if texture.descriptor_pool != vk::DescriptorPool::null() {
                self.device
                    .destroy_descriptor_pool(texture.descriptor_pool, None);
            }
            if texture.sampler != vk::Sampler::null() {
                self.device.destroy_sampler(texture.sampler, None);
            }
            if texture.view != vk::ImageView::null() {
                self.device.destroy_image_view(texture.view, None);
            }
        }
        if texture.image != vk::Image::null() {
            self.destroy_image(texture.image);
        }
    }
}

impl GpuDevice for AshDevice {
    type Context<'a> = AshCommandContext<'a>;

    fn surface_support(&self) -> Result<SurfaceSupport> {
        let loader = self.instance.surface_loader();
        let surface = self.instance.surface();
        unsafe {
            Ok(SurfaceSupport {
                capabilities: loader
                    .get_physical_device_surface_capabilities(self.physical_device, surface)?,
                formats: loader.get_physical_device_surface_formats(self.physical_device, surface)?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(self.physical_device, surface)?,
            })
        }
    }

    fn create_swapchain(&self, desc: &SwapchainDesc) -> Result<vk::SwapchainKHR> {
        let families = [self.queue_families.graphics, self.queue_families.present];
        let mut create_info = vk::SwapchainCreateInfoKHR::default()
            .surface(self.instance.surface())
            .min_image_count(desc.min_image_count)
            .image_format(desc.surface_format.format)
            .image_color_space(desc.surface_format.color_space)
            .image_extent(desc.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .pre_transform(desc.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(desc.present_mode)
            .clipped(true);

        create_info = if families[0] != families[1] {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        let swapchain = unsafe {
            self.swapchain_loader
                .create_swapchain(&create_info, None)
                .map_err(|e| RenderError::Creation(format!("swapchain: {e}")))?
        };
        debug!(
            "Created swapchain {}x{} ({:?}, {:?})",
            desc.extent.width, desc.extent.height, desc.surface_format.format, desc.present_mode
        );
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> Result<Vec<vk::Image>> {
        Ok(unsafe { self.swapchain_loader.get_swapchain_images(swapchain)? })
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        unsafe { self.swapchain_loader.destroy_swapchain(swapchain, None) };
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        acquire_outcome(unsafe {
            self.swapchain_loader
                .acquire_next_image(swapchain, u64::MAX, signal, vk::Fence::null())
        })
    }

    fn queue_present(
        &self,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> Result<PresentOutcome> {
        let wait_semaphores = [wait];
        let swapchains = [swapchain];
        let image_indices = [image_index];
        let present_info = vk::PresentInfoKHR::default()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        present_outcome(unsafe {
            self.swapchain_loader
                .queue_present(self.present_queue, &present_info)
        })
    }

    fn create_image_view(
        &self,
        image: vk::Image,
        format: vk::Format,
        aspect: vk::ImageAspectFlags,
    ) -> Result<vk::ImageView> {
        let create_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_2D)
            .format(format)
            .subresource_range(vk::ImageSubresourceRange {
                aspect_mask: aspect,
                ..color_subresource_range()
            });
        Ok(unsafe { self.device.create_image_view(&create_info, None)? })
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        unsafe { self.device.destroy_image_view(view, None) };
    }

    fn create_depth_image(&self, extent: vk::Extent2D, format: vk::Format) -> Result<DepthImage> {
        let image = self.create_image(
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
        )?;
        match self.create_image_view(image, format, vk::ImageAspectFlags::DEPTH) {
            Ok(view) => Ok(DepthImage {
                image,
                view,
                format,
            }),
            Err(e) => {
                self.destroy_image(image);
                Err(e)
            }
        }
    }

    fn destroy_depth_image(&self, depth: DepthImage) {
        self.destroy_image_view(depth.view);
        self.destroy_image(depth.image);
    }

    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> Result<vk::Framebuffer> {
        let create_info = vk::FramebufferCreateInfo::default()
            .render_pass(render_pass)
            .attachments(attachments)
            .width(extent.width)
            .height(extent.height)
            .layers(1);
        Ok(unsafe { self.device.create_framebuffer(&create_info, None)? })
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        unsafe { self.device.destroy_framebuffer(framebuffer, None) };
    }

    fn create_semaphore(&self) -> Result<vk::Semaphore> {
        Ok(unsafe {
            self.device
                .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)?
        })
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        unsafe { self.device.destroy_semaphore(semaphore, None) };
    }

    fn create_fence(&self, signaled: bool) -> Result<vk::Fence> {
        let flags = if signaled {
            vk::FenceCreateFlags::SIGNALED
        } else {
            vk::FenceCreateFlags::empty()
        };
        Ok(unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default().flags(flags), None)?
        })
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        unsafe { self.device.destroy_fence(fence, None) };
    }

    fn wait_for_fence(&self, fence: vk::Fence, timeout_ns: u64) -> Result<()> {
        match unsafe { self.device.wait_for_fences(&[fence], true, timeout_ns) } {
            Ok(()) => Ok(()),
            Err(vk::Result::TIMEOUT) => Err(RenderError::FenceTimeout),
            Err(e) => Err(e.into()),
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> Result<()> {
        Ok(unsafe { self.device.reset_fences(&[fence])? })
    }

    fn device_wait_idle(&self) -> Result<()> {
        Ok(unsafe { self.device.device_wait_idle()? })
    }

    fn create_command_pool(&self) -> Result<vk::CommandPool> {
        let create_info = vk::CommandPoolCreateInfo::default()
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER)
            .queue_family_index(self.queue_families.graphics);
        Ok(unsafe { self.device.create_command_pool(&create_info, None)? })
    }

    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info)? };
        buffers
            .into_iter()
            .next()
            .ok_or_else(|| RenderError::Creation("no command buffer allocated".to_string()))
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        unsafe { self.device.destroy_command_pool(pool, None) };
    }

    fn command_context(&self, command_buffer: vk::CommandBuffer) -> Self::Context<'_> {
        AshCommandContext::new(self.device.as_ref(), command_buffer)
    }

    fn allocate_descriptor_set(
        &self,
        layout: vk::DescriptorSetLayout,
        pool_sizes: &[vk::DescriptorPoolSize],
    ) -> Result<DescriptorAllocation> {
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(pool_sizes);
        let pool = unsafe { self.device.create_descriptor_pool(&pool_info, None)? };

        let layouts = [layout];
        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(&layouts);
        match unsafe { self.device.allocate_descriptor_sets(&alloc_info) } {
            Ok(sets) => Ok(DescriptorAllocation { pool, set: sets[0] }),
            Err(e) => {
                unsafe { self.device.destroy_descriptor_pool(pool, None) };
                Err(e.into())
            }
        }
    }

    fn destroy_descriptor_pool(&self, pool: vk::DescriptorPool) {
        unsafe { self.device.destroy_descriptor_pool(pool, None) };
    }

    fn write_buffer_descriptors(&self, set: vk::DescriptorSet, bindings: &[BufferBinding]) {
        let infos: Vec<[vk::DescriptorBufferInfo; 1]> = bindings
            .iter()
            .map(|binding| {
                [vk::DescriptorBufferInfo {
                    buffer: binding.buffer.handle,
                    offset: 0,
                    range: vk::WHOLE_SIZE,
                }]
            })
            .collect();
        let writes: Vec<_> = bindings
            .iter()
            .zip(&infos)
            .map(|(binding, info)| {
                vk::WriteDescriptorSet::default()
                    .dst_set(set)
                    .dst_binding(binding.binding)
                    .descriptor_type(binding.descriptor_type)
                    .buffer_info(info)
            })
            .collect();
        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }

    fn submit(&self, submission: &Submission) -> Result<()> {
        let wait_semaphores = [submission.wait_semaphore];
        let wait_stages = [submission.wait_stage];
        let command_buffers = [submission.command_buffer];
        let signal_semaphores = [submission.signal_semaphore];
        let submit_info = vk::SubmitInfo::default()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.device
                .queue_submit(self.graphics_queue, &[submit_info], submission.fence)?;
        }
        Ok(())
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange {
        aspect_mask: vk::ImageAspectFlags::COLOR,
        base_mip_level: 0,
        level_count: 1,
        base_array_layer: 0,
        layer_count: 1,
    }
}

fn acquire_outcome(result: VkResult<(u32, bool)>) -> Result<AcquireOutcome> {
    match result {
        Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
            image_index,
            suboptimal,
        }),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
        Err(e) => Err(e.into()),
    }
}

fn present_outcome(result: VkResult<bool>) -> Result<PresentOutcome> {
    match result {
        Ok(false) => Ok(PresentOutcome::Presented),
        Ok(true) => Ok(PresentOutcome::Suboptimal),
        Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
        Err(e) => Err(e.into()),
    }
}

/// Higher is better. Discrete GPUs win over integrated ones.
fn rate_device_type(device_type: vk::PhysicalDeviceType) -> u32 {
    match device_type {
        vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
        vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
        vk::PhysicalDeviceType::VIRTUAL_GPU => 10,
        vk::PhysicalDeviceType::CPU => 1,
        _ => 0,
    }
}

fn select_physical_device(
    instance: &VulkanInstance,
) -> Result<(vk::PhysicalDevice, QueueFamilies, String)> {
    let vk_instance = instance.instance();
    let devices = unsafe { vk_instance.enumerate_physical_devices()? };
    info!("Found {} GPU(s)", devices.len());

    let mut best: Option<(u32, vk::PhysicalDevice, QueueFamilies, String)> = None;
    for device in devices {
        let properties = unsafe { vk_instance.get_physical_device_properties(device) };
        let name = unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }
            .to_string_lossy()
            .into_owned();

        let Some(families) = find_queue_families(instance, device) else {
            debug!("GPU '{name}' skipped: no graphics or present queue");
            continue;
        };
        if !supports_swapchain(instance, device) {
            debug!("GPU '{name}' skipped: {:?} not supported", swapchain::NAME);
            continue;
        }

        let score = rate_device_type(properties.device_type);
        debug!("GPU '{name}' ({:?}) score {score}", properties.device_type);
        if best.as_ref().map_or(true, |(best_score, ..)| score > *best_score) {
            best = Some((score, device, families, name));
        }
    }

    let (_, device, families, name) = best.ok_or_else(|| {
        RenderError::Creation("no GPU can present to this surface".to_string())
    })?;
    info!("Selected GPU '{name}'");
    Ok((device, families, name))
}

fn find_queue_families(
    instance: &VulkanInstance,
    device: vk::PhysicalDevice,
) -> Option<QueueFamilies> {
    let families = unsafe {
        instance
            .instance()
            .get_physical_device_queue_family_properties(device)
    };

    let mut graphics = None;
    let mut present = None;
    for (index, family) in families.iter().enumerate() {
        let index = index as u32;
        if family.queue_count == 0 {
            continue;
        }
        let has_graphics = family.queue_flags.contains(vk::QueueFlags::GRAPHICS);
        let can_present = unsafe {
            instance
                .surface_loader()
                .get_physical_device_surface_support(device, index, instance.surface())
                .unwrap_or(false)
        };

        // One family doing both is the common case and avoids concurrent sharing.
        if has_graphics && can_present {
            return Some(QueueFamilies {
                graphics: index,
                present: index,
            });
        }
        if has_graphics && graphics.is_none() {
            graphics = Some(index);
        }
        if can_present && present.is_none() {
            present = Some(index);
        }
    }

    Some(QueueFamilies {
        graphics: graphics?,
        present: present?,
    })
}

fn supports_swapchain(instance: &VulkanInstance, device: vk::PhysicalDevice) -> bool {
    let extensions = unsafe {
        instance
            .instance()
            .enumerate_device_extension_properties(device)
    };
    extensions.is_ok_and(|extensions| {
        extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == swapchain::NAME)
    })
}
