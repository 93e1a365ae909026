use ash::vk;

use crate::Result;

/// The subset of command buffer recording a frame needs.
///
/// One context wraps one command buffer. Calls are recorded in order; nothing
/// executes until the buffer is submitted.
pub trait CommandContext {
    fn reset(&mut self) -> Result<()>;
    fn begin(&mut self) -> Result<()>;
    fn end(&mut self) -> Result<()>;

    fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    );
    fn end_render_pass(&mut self);

    /// Viewport and scissor covering the whole of `extent`.
    fn set_viewport_and_scissor(&mut self, extent: vk::Extent2D);

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline);
    fn bind_descriptor_set(
        &mut self,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    );
    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer);
    /// Indices are always 32-bit.
    fn bind_index_buffer(&mut self, buffer: vk::Buffer);

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_instance: u32);
}

/// Records straight into a Vulkan command buffer.
pub struct AshCommandContext<'a> {
    device: &'a ash::Device,
    command_buffer: vk::CommandBuffer,
}

impl<'a> AshCommandContext<'a> {
    pub fn new(device: &'a ash::Device, command_buffer: vk::CommandBuffer) -> Self {
        Self {
            device,
            command_buffer,
        }
    }

    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }
}

impl CommandContext for AshCommandContext<'_> {
    fn reset(&mut self) -> Result<()> {
        unsafe {
            self.device
                .reset_command_buffer(self.command_buffer, vk::CommandBufferResetFlags::empty())?;
        }
        Ok(())
    }

    fn begin(&mut self) -> Result<()> {
        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe {
            self.device
                .begin_command_buffer(self.command_buffer, &begin_info)?;
        }
        Ok(())
    }

    fn end(&mut self) -> Result<()> {
        unsafe {
            self.device.end_command_buffer(self.command_buffer)?;
        }
        Ok(())
    }

    fn begin_render_pass(
        &mut self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_values: &[vk::ClearValue],
    ) {
        let begin_info = vk::RenderPassBeginInfo::default()
            .render_pass(render_pass)
            .framebuffer(framebuffer)
            .render_area(vk::Rect2D {
                offset: vk::Offset2D { x: 0, y: 0 },
                extent,
            })
            .clear_values(clear_values);
        unsafe {
            self.device.cmd_begin_render_pass(
                self.command_buffer,
                &begin_info,
                vk::SubpassContents::INLINE,
            );
        }
    }

    fn end_render_pass(&mut self) {
        unsafe { self.device.cmd_end_render_pass(self.command_buffer) };
    }

    fn set_viewport_and_scissor(&mut self, extent: vk::Extent2D) {
        let viewport = vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        };
        let scissor = vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        };
        unsafe {
            self.device
                .cmd_set_viewport(self.command_buffer, 0, &[viewport]);
            self.device.cmd_set_scissor(self.command_buffer, 0, &[scissor]);
        }
    }

    fn bind_pipeline(&mut self, pipeline: vk::Pipeline) {
        unsafe {
            self.device.cmd_bind_pipeline(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                pipeline,
            );
        }
    }

    fn bind_descriptor_set(
        &mut self,
        layout: vk::PipelineLayout,
        set_index: u32,
        set: vk::DescriptorSet,
    ) {
        unsafe {
            self.device.cmd_bind_descriptor_sets(
                self.command_buffer,
                vk::PipelineBindPoint::GRAPHICS,
                layout,
                set_index,
                &[set],
                &[],
            );
        }
    }

    fn bind_vertex_buffer(&mut self, buffer: vk::Buffer) {
        unsafe {
            self.device
                .cmd_bind_vertex_buffers(self.command_buffer, 0, &[buffer], &[0]);
        }
    }

    fn bind_index_buffer(&mut self, buffer: vk::Buffer) {
        unsafe {
            self.device.cmd_bind_index_buffer(
                self.command_buffer,
                buffer,
                0,
                vk::IndexType::UINT32,
            );
        }
    }

    fn draw_indexed(&mut self, index_count: u32, instance_count: u32, first_instance: u32) {
        unsafe {
            self.device.cmd_draw_indexed(
                self.command_buffer,
                index_count,
                instance_count,
                0,
                0,
                first_instance,
            );
        }
    }
}
