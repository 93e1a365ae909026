use std::mem::size_of;
use std::sync::Arc;

use ash::vk;
use log::debug;

use super::camera::CameraUniform;
use super::instanced_scene::SceneSnapshot;
use crate::vulkan::{
    BufferBinding, CommandContext, DepthImage, DescriptorAllocation, FramePipeline, GpuBuffer,
    GpuDevice, MemoryLocation, Submission,
};
use crate::{RenderError, Result};

/// Everything needed to build one frame slot.
#[derive(Clone, Copy, Debug)]
pub struct FrameSlotDesc {
    /// Presentable image, owned by the swapchain.
    pub image: vk::Image,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub render_pass: vk::RenderPass,
    pub frame_set_layout: vk::DescriptorSetLayout,
    pub depth_format: Option<vk::Format>,
    /// Storage buffer capacity in instance transforms.
    pub max_instances: usize,
    /// Storage buffer size in bytes, from [`RendererConfig::storage_buffer_size`].
    ///
    /// [`RendererConfig::storage_buffer_size`]: crate::config::RendererConfig::storage_buffer_size
    pub storage_buffer_size: vk::DeviceSize,
    pub fence_timeout_ns: u64,
}

/// Where a frame's commands render to.
#[derive(Clone, Copy, Debug)]
pub struct RenderTarget {
    pub framebuffer: vk::Framebuffer,
    pub extent: vk::Extent2D,
    pub clear_color: [f32; 4],
}

/// One ring position: a presentable image with its view and framebuffer,
/// the command buffer that renders into it, the synchronization primitives
/// guarding it and the per-frame uniform and instance storage buffers.
///
/// The CPU may only touch the command buffer and the two host-mapped buffers
/// between [`acquire_guard`](Self::acquire_guard) and
/// [`submit`](Self::submit).
pub struct FrameSlot<D: GpuDevice> {
    device: Arc<D>,
    image: vk::Image,
    image_view: vk::ImageView,
    depth: Option<DepthImage>,
    framebuffer: vk::Framebuffer,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    image_available: vk::Semaphore,
    render_finished: vk::Semaphore,
    in_flight: vk::Fence,
    uniform_buffer: GpuBuffer,
    storage_buffer: GpuBuffer,
    descriptor: DescriptorAllocation,
    capacity: usize,
    fence_timeout_ns: u64,
}

fn creation(what: &'static str) -> impl FnOnce(RenderError) -> RenderError {
    move |e| RenderError::Creation(format!("frame slot {what}: {e}"))
}

impl<D: GpuDevice> FrameSlot<D> {
    /// Creates every per-frame object. On failure, whatever was already
    /// created is destroyed before the error is returned.
    pub fn new(device: Arc<D>, desc: &FrameSlotDesc) -> Result<Self> {
        let mut slot = Self {
            device,
            image: desc.image,
            image_view: vk::ImageView::null(),
            depth: None,
            framebuffer: vk::Framebuffer::null(),
            command_pool: vk::CommandPool::null(),
            command_buffer: vk::CommandBuffer::null(),
            image_available: vk::Semaphore::null(),
            render_finished: vk::Semaphore::null(),
            in_flight: vk::Fence::null(),
            uniform_buffer: GpuBuffer::null(),
            storage_buffer: GpuBuffer::null(),
            descriptor: DescriptorAllocation {
                pool: vk::DescriptorPool::null(),
                set: vk::DescriptorSet::null(),
            },
            capacity: desc.max_instances,
            fence_timeout_ns: desc.fence_timeout_ns,
        };
        let device = slot.device.clone();

        slot.image_view = device
            .create_image_view(desc.image, desc.format, vk::ImageAspectFlags::COLOR)
            .map_err(creation("image view"))?;

        if let Some(format) = desc.depth_format {
            slot.depth = Some(
                device
                    .create_depth_image(desc.extent, format)
                    .map_err(creation("depth image"))?,
            );
        }

        let mut attachments = vec![slot.image_view];
        if let Some(depth) = &slot.depth {
            attachments.push(depth.view);
        }
        slot.framebuffer = device
            .create_framebuffer(desc.render_pass, &attachments, desc.extent)
            .map_err(creation("framebuffer"))?;

        slot.command_pool = device
            .create_command_pool()
            .map_err(creation("command pool"))?;
        slot.command_buffer = device
            .allocate_command_buffer(slot.command_pool)
            .map_err(creation("command buffer"))?;

        slot.image_available = device.create_semaphore().map_err(creation("semaphore"))?;
        slot.render_finished = device.create_semaphore().map_err(creation("semaphore"))?;
        // Signaled so the first acquire_guard does not block.
        slot.in_flight = device.create_fence(true).map_err(creation("fence"))?;

        slot.uniform_buffer = device
            .create_buffer(
                size_of::<CameraUniform>() as vk::DeviceSize,
                vk::BufferUsageFlags::UNIFORM_BUFFER,
                MemoryLocation::CpuToGpu,
            )
            .map_err(creation("uniform buffer"))?;
        slot.storage_buffer = device
            .create_buffer(
                desc.storage_buffer_size,
                vk::BufferUsageFlags::STORAGE_BUFFER,
                MemoryLocation::CpuToGpu,
            )
            .map_err(creation("storage buffer"))?;

        slot.descriptor = device
            .allocate_descriptor_set(
                desc.frame_set_layout,
                &[
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::UNIFORM_BUFFER,
                        descriptor_count: 1,
                    },
                    vk::DescriptorPoolSize {
                        ty: vk::DescriptorType::STORAGE_BUFFER,
                        descriptor_count: 1,
                    },
                ],
            )
            .map_err(creation("descriptor set"))?;
        slot.bind_buffers();

        Ok(slot)
    }

    pub fn image(&self) -> vk::Image {
        self.image
    }

    pub fn image_view(&self) -> vk::ImageView {
        self.image_view
    }

    pub fn depth(&self) -> Option<&DepthImage> {
        self.depth.as_ref()
    }

    pub fn framebuffer(&self) -> vk::Framebuffer {
        self.framebuffer
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    pub fn image_available(&self) -> vk::Semaphore {
        self.image_available
    }

    pub fn render_finished(&self) -> vk::Semaphore {
        self.render_finished
    }

    pub fn in_flight(&self) -> vk::Fence {
        self.in_flight
    }

    pub fn uniform_buffer(&self) -> &GpuBuffer {
        &self.uniform_buffer
    }

    pub fn storage_buffer(&self) -> &GpuBuffer {
        &self.storage_buffer
    }

    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.descriptor.set
    }

    /// Maximum number of instance transforms one frame can carry.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Blocks until the previous submission from this slot has finished, then
    /// resets the fence for the next one.
    pub fn acquire_guard(&self) -> Result<()> {
        self.device
            .wait_for_fence(self.in_flight, self.fence_timeout_ns)?;
        self.device.reset_fence(self.in_flight)
    }

    /// Writes the camera and the packed transforms into this slot's buffers
    /// and records the whole frame into its command buffer.
    ///
    /// The snapshot is rejected with [`RenderError::CapacityExceeded`] before
    /// anything is touched if it carries more transforms than fit.
    pub fn record_into(
        &mut self,
        snapshot: &SceneSnapshot<'_, D>,
        camera: &CameraUniform,
        target: &RenderTarget,
        pipeline: &FramePipeline,
    ) -> Result<u32> {
        let transforms = snapshot.transforms();
        if transforms.len() > self.capacity {
            return Err(RenderError::CapacityExceeded {
                requested: transforms.len(),
                capacity: self.capacity,
            });
        }

        let mut ctx = self.device.command_context(self.command_buffer);
        ctx.reset()?;

        self.device
            .write_buffer(&self.uniform_buffer, 0, bytemuck::bytes_of(camera))?;
        if !transforms.is_empty() {
            self.device
                .write_buffer(&self.storage_buffer, 0, bytemuck::cast_slice(transforms))?;
        }
        self.bind_buffers();

        let mut clear_values = vec![vk::ClearValue {
            color: vk::ClearColorValue {
                float32: target.clear_color,
            },
        }];
        if pipeline.depth_format.is_some() {
            clear_values.push(vk::ClearValue {
                depth_stencil: vk::ClearDepthStencilValue {
                    depth: 1.0,
                    stencil: 0,
                },
            });
        }

        ctx.begin()?;
        ctx.begin_render_pass(
            pipeline.render_pass,
            target.framebuffer,
            target.extent,
            &clear_values,
        );
        ctx.set_viewport_and_scissor(target.extent);
        ctx.bind_descriptor_set(pipeline.layout, 0, self.descriptor.set);
        ctx.bind_pipeline(pipeline.pipeline);
        let drawn = snapshot.draw(&mut ctx, pipeline.layout);
        ctx.end_render_pass();
        ctx.end()?;

        Ok(drawn)
    }

    /// Submits the recorded commands. Execution waits on `image_available`
    /// at the color output stage, then signals `signal` and the in-flight
    /// fence. `signal` must be the `render_finished` semaphore of the slot
    /// that owns the acquired image, since presentation waits on it.
    pub fn submit(&self, signal: vk::Semaphore) -> Result<()> {
        self.device
            .submit(&Submission {
                command_buffer: self.command_buffer,
                wait_semaphore: self.image_available,
                wait_stage: vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT,
                signal_semaphore: signal,
                fence: self.in_flight,
            })
            .map_err(|e| match e {
                RenderError::Vulkan(result) => RenderError::SubmissionFailure(result),
                other => other,
            })
    }

    /// Replaces the in-flight fence with a signaled one. Used after a failed
    /// submission, which leaves the reset fence unsignaled forever.
    pub fn rearm_fence(&mut self) -> Result<()> {
        let fence = self.device.create_fence(true).map_err(creation("fence"))?;
        self.device.destroy_fence(self.in_flight);
        self.in_flight = fence;
        debug!("Re-armed frame fence {:?}", fence);
        Ok(())
    }

    fn bind_buffers(&self) {
        self.device.write_buffer_descriptors(
            self.descriptor.set,
            &[
                BufferBinding {
                    binding: 0,
                    descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                    buffer: self.uniform_buffer,
                },
                BufferBinding {
                    binding: 1,
                    descriptor_type: vk::DescriptorType::STORAGE_BUFFER,
                    buffer: self.storage_buffer,
                },
            ],
        );
    }
}

impl<D: GpuDevice> Drop for FrameSlot<D> {
    fn drop(&mut self) {
        let device = &self.device;
        if self.framebuffer != vk::Framebuffer::null() {
            device.destroy_framebuffer(self.framebuffer);
        }
        if let Some(depth) = self.depth.take() {
            device.destroy_depth_image(depth);
        }
        if self.image_view != vk::ImageView::null() {
            device.destroy_image_view(self.image_view);
        }
        if self.descriptor.pool != vk::DescriptorPool::null() {
            device.destroy_descriptor_pool(self.descriptor.pool);
        }
        for buffer in [self.storage_buffer, self.uniform_buffer] {
            if !buffer.is_null() {
                device.destroy_buffer(buffer);
            }
        }
        if self.in_flight != vk::Fence::null() {
            device.destroy_fence(self.in_flight);
        }
        for semaphore in [self.render_finished, self.image_available] {
            if semaphore != vk::Semaphore::null() {
                device.destroy_semaphore(semaphore);
            }
        }
        if self.command_pool != vk::CommandPool::null() {
            device.destroy_command_pool(self.command_pool);
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use ash::vk::Handle;
    use glam::{Mat4, Vec3};

    use super::*;
    use crate::config::RendererConfig;
    use crate::renderer::instanced_mesh::InstancedMesh;
    use crate::renderer::instanced_scene::InstancedScene;
    use crate::renderer::vertex::quad;
    use crate::vulkan::mock::{Command, MockDevice};

    pub(crate) fn test_pipeline() -> FramePipeline {
        FramePipeline {
            pipeline: vk::Pipeline::from_raw(0xA000),
            layout: vk::PipelineLayout::from_raw(0xA001),
            render_pass: vk::RenderPass::from_raw(0xA002),
            frame_set_layout: vk::DescriptorSetLayout::from_raw(0xA003),
            texture_set_layout: vk::DescriptorSetLayout::from_raw(0xA004),
            color_format: vk::Format::B8G8R8A8_SRGB,
            depth_format: Some(vk::Format::D32_SFLOAT),
        }
    }

    fn desc(max_instances: usize) -> FrameSlotDesc {
        let pipeline = test_pipeline();
        FrameSlotDesc {
            image: vk::Image::from_raw(0xB000),
            format: pipeline.color_format,
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            render_pass: pipeline.render_pass,
            frame_set_layout: pipeline.frame_set_layout,
            depth_format: pipeline.depth_format,
            max_instances,
            storage_buffer_size: RendererConfig::default()
                .with_max_instances(max_instances as u32)
                .storage_buffer_size(),
            fence_timeout_ns: u64::MAX,
        }
    }

    fn target(slot: &FrameSlot<MockDevice>) -> RenderTarget {
        RenderTarget {
            framebuffer: slot.framebuffer(),
            extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            clear_color: [0.0, 0.0, 0.0, 1.0],
        }
    }

    fn scene(device: &Arc<MockDevice>, instances: usize) -> InstancedScene<MockDevice> {
        let mut scene = InstancedScene::new(100);
        let (vertices, indices) = quad();
        let mesh = InstancedMesh::new(device.clone(), vertices, indices, None).unwrap();
        let id = scene.add_mesh(mesh).unwrap();
        for i in 0..instances {
            scene
                .add_instance(id, Mat4::from_translation(Vec3::X * i as f32))
                .unwrap();
        }
        scene
    }

    #[test]
    fn construction_and_drop_balance() {
        let device = Arc::new(MockDevice::new());
        {
            let slot = FrameSlot::new(device.clone(), &desc(16)).unwrap();
            assert!(device.is_live(slot.in_flight()));
            assert!(device.fence_signaled(slot.in_flight()));
            assert!(device.live_objects() > 0);
        }
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn partial_construction_is_cleaned_up() {
        let device = Arc::new(MockDevice::new());
        device.set_fail_buffer_creation(true);

        let result = FrameSlot::new(device.clone(), &desc(16));
        assert!(matches!(result, Err(RenderError::Creation(_))));
        assert_eq!(device.live_objects(), 0);
    }

    #[test]
    fn guard_leaves_fence_reset() {
        let device = Arc::new(MockDevice::new());
        let slot = FrameSlot::new(device.clone(), &desc(16)).unwrap();

        slot.acquire_guard().unwrap();
        assert!(!device.fence_signaled(slot.in_flight()));

        // Nothing was submitted, so a second wait cannot complete.
        assert!(matches!(
            slot.acquire_guard(),
            Err(RenderError::FenceTimeout)
        ));
    }

    #[test]
    fn record_writes_buffers_and_commands_in_order() {
        let device = Arc::new(MockDevice::new());
        let mut slot = FrameSlot::new(device.clone(), &desc(16)).unwrap();
        let mut scene = scene(&device, 3);
        let pipeline = test_pipeline();
        let camera = CameraUniform {
            view: Mat4::from_translation(Vec3::Z),
            ..Default::default()
        };

        slot.acquire_guard().unwrap();
        let snapshot = scene.snapshot();
        let drawn = slot
            .record_into(&snapshot, &camera, &target(&slot), &pipeline)
            .unwrap();
        assert_eq!(drawn, 3);

        assert_eq!(
            device.buffer_contents(slot.uniform_buffer()),
            bytemuck::bytes_of(&camera)
        );
        let stored = device.buffer_contents(slot.storage_buffer());
        let expected: &[u8] = bytemuck::cast_slice(snapshot.transforms());
        assert_eq!(&stored[..expected.len()], expected);

        let writes = device.descriptor_writes(slot.descriptor_set());
        assert_eq!(writes[0].buffer, *slot.uniform_buffer());
        assert_eq!(writes[1].buffer, *slot.storage_buffer());

        let commands = device.commands(slot.command_buffer());
        let mesh = snapshot_mesh_buffers(&scene);
        assert_eq!(
            commands,
            vec![
                Command::Reset,
                Command::Begin,
                Command::BeginRenderPass {
                    framebuffer: slot.framebuffer(),
                    extent: vk::Extent2D {
                        width: 800,
                        height: 600
                    },
                },
                Command::SetViewportAndScissor(vk::Extent2D {
                    width: 800,
                    height: 600
                }),
                Command::BindDescriptorSet {
                    set_index: 0,
                    set: slot.descriptor_set(),
                },
                Command::BindPipeline(pipeline.pipeline),
                Command::BindVertexBuffer(mesh.0),
                Command::BindIndexBuffer(mesh.1),
                Command::DrawIndexed {
                    index_count: 6,
                    instance_count: 3,
                    first_instance: 0,
                },
                Command::EndRenderPass,
                Command::End,
            ]
        );
    }

    fn snapshot_mesh_buffers(scene: &InstancedScene<MockDevice>) -> (vk::Buffer, vk::Buffer) {
        let id = scene.mesh_ids().next().unwrap();
        let mesh = scene.mesh(id).unwrap();
        (mesh.vertex_buffer().handle, mesh.index_buffer().handle)
    }

    #[test]
    fn oversized_snapshot_is_rejected_before_recording() {
        let device = Arc::new(MockDevice::new());
        let mut slot = FrameSlot::new(device.clone(), &desc(2)).unwrap();
        let mut scene = scene(&device, 3);

        let result = slot.record_into(
            &scene.snapshot(),
            &CameraUniform::default(),
            &target(&slot),
            &test_pipeline(),
        );
        assert!(matches!(
            result,
            Err(RenderError::CapacityExceeded {
                requested: 3,
                capacity: 2
            })
        ));
        assert!(device.commands(slot.command_buffer()).is_empty());
    }

    #[test]
    fn submit_signals_fence_and_waits_on_acquire() {
        let device = Arc::new(MockDevice::new());
        let slot = FrameSlot::new(device.clone(), &desc(4)).unwrap();

        slot.acquire_guard().unwrap();
        slot.submit(slot.render_finished()).unwrap();

        let submission = device.submissions()[0];
        assert_eq!(submission.wait_semaphore, slot.image_available());
        assert_eq!(submission.signal_semaphore, slot.render_finished());
        assert_eq!(
            submission.wait_stage,
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
        );
        assert!(device.fence_signaled(slot.in_flight()));
        slot.acquire_guard().unwrap();
    }

    #[test]
    fn failed_submit_can_be_recovered_by_rearming() {
        let device = Arc::new(MockDevice::new());
        let mut slot = FrameSlot::new(device.clone(), &desc(4)).unwrap();
        device.fail_next_submits(1);

        slot.acquire_guard().unwrap();
        assert!(matches!(
            slot.submit(slot.render_finished()),
            Err(RenderError::SubmissionFailure(vk::Result::ERROR_DEVICE_LOST))
        ));

        let old = slot.in_flight();
        slot.rearm_fence().unwrap();
        assert!(!device.is_live(old));
        slot.acquire_guard().unwrap();
    }
}
