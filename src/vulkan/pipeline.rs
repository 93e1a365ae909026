use std::ffi::CStr;
use std::io::Cursor;
use std::sync::Arc;

use ash::vk;
use log::{debug, info};

use super::descriptor_layout::DescriptorSetLayout;
use crate::renderer::VertexLayout;
use crate::{RenderError, Result};

const SHADER_ENTRY: &CStr = c"main";

/// The handles a frame needs to record against one pipeline.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FramePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub render_pass: vk::RenderPass,
    /// Set 0: camera uniform and instance transforms.
    pub frame_set_layout: vk::DescriptorSetLayout,
    /// Set 1: per-mesh texture.
    pub texture_set_layout: vk::DescriptorSetLayout,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
}

/// Parameters for [`GraphicsPipeline::new`]. Shader code is SPIR-V.
pub struct PipelineDesc<'a> {
    pub vertex_spirv: &'a [u8],
    pub fragment_spirv: &'a [u8],
    pub vertex_layout: VertexLayout,
    pub color_format: vk::Format,
    pub depth_format: Option<vk::Format>,
}

/// Render pass, descriptor set layouts, pipeline layout and the instanced
/// graphics pipeline, destroyed together.
///
/// Front faces are counter-clockwise and back faces are culled. Viewport and
/// scissor are dynamic so the pipeline survives swapchain recreation.
pub struct GraphicsPipeline {
    device: Arc<ash::Device>,
    render_pass: vk::RenderPass,
    frame_set_layout: DescriptorSetLayout,
    texture_set_layout: DescriptorSetLayout,
    layout: vk::PipelineLayout,
    pipeline: vk::Pipeline,
    vertex_layout: VertexLayout,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
}

impl GraphicsPipeline {
    pub fn new(device: Arc<ash::Device>, desc: &PipelineDesc<'_>) -> Result<Self> {
        let frame_set_layout = DescriptorSetLayout::per_frame(device.clone())?;
        let texture_set_layout = DescriptorSetLayout::texture(device.clone())?;

        let render_pass = create_render_pass(&device, desc.color_format, desc.depth_format)?;

        let set_layouts = [frame_set_layout.handle(), texture_set_layout.handle()];
        let layout_info = vk::PipelineLayoutCreateInfo::default().set_layouts(&set_layouts);
        let layout = match unsafe { device.create_pipeline_layout(&layout_info, None) } {
            Ok(layout) => layout,
            Err(e) => {
                unsafe { device.destroy_render_pass(render_pass, None) };
                return Err(RenderError::Creation(format!("pipeline layout: {e}")));
            }
        };

        let pipeline = match create_pipeline(&device, desc, render_pass, layout) {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                    device.destroy_render_pass(render_pass, None);
                }
                return Err(e);
            }
        };

        info!(
            "Graphics pipeline created ({:?}, color {:?}, depth {:?})",
            desc.vertex_layout, desc.color_format, desc.depth_format
        );

        Ok(Self {
            device,
            render_pass,
            frame_set_layout,
            texture_set_layout,
            layout,
            pipeline,
            vertex_layout: desc.vertex_layout,
            color_format: desc.color_format,
            depth_format: desc.depth_format,
        })
    }

    pub fn frame_pipeline(&self) -> FramePipeline {
        FramePipeline {
            pipeline: self.pipeline,
            layout: self.layout,
            render_pass: self.render_pass,
            frame_set_layout: self.frame_set_layout.handle(),
            texture_set_layout: self.texture_set_layout.handle(),
            color_format: self.color_format,
            depth_format: self.depth_format,
        }
    }

    pub fn vertex_layout(&self) -> VertexLayout {
        self.vertex_layout
    }

    pub fn texture_set_layout(&self) -> vk::DescriptorSetLayout {
        self.texture_set_layout.handle()
    }
}

impl Drop for GraphicsPipeline {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_pipeline(self.pipeline, None);
            self.device.destroy_pipeline_layout(self.layout, None);
            self.device.destroy_render_pass(self.render_pass, None);
        }
        debug!("Graphics pipeline destroyed");
    }
}

fn create_render_pass(
    device: &ash::Device,
    color_format: vk::Format,
    depth_format: Option<vk::Format>,
) -> Result<vk::RenderPass> {
    let mut attachments = vec![vk::AttachmentDescription::default()
        .format(color_format)
        .samples(vk::SampleCountFlags::TYPE_1)
        .load_op(vk::AttachmentLoadOp::CLEAR)
        .store_op(vk::AttachmentStoreOp::STORE)
        .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
        .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
        .initial_layout(vk::ImageLayout::UNDEFINED)
        .final_layout(vk::ImageLayout::PRESENT_SRC_KHR)];
    if let Some(format) = depth_format {
        attachments.push(
            vk::AttachmentDescription::default()
                .format(format)
                .samples(vk::SampleCountFlags::TYPE_1)
                .load_op(vk::AttachmentLoadOp::CLEAR)
                .store_op(vk::AttachmentStoreOp::DONT_CARE)
                .stencil_load_op(vk::AttachmentLoadOp::DONT_CARE)
                .stencil_store_op(vk::AttachmentStoreOp::DONT_CARE)
                .initial_layout(vk::ImageLayout::UNDEFINED)
                .final_layout(vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL),
        );
    }

    let color_refs = [vk::AttachmentReference {
        attachment: 0,
        layout: vk::ImageLayout::COLOR_ATTACHMENT_OPTIMAL,
    }];
    let depth_ref = vk::AttachmentReference {
        attachment: 1,
        layout: vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
    };
    let mut subpass = vk::SubpassDescription::default()
        .pipeline_bind_point(vk::PipelineBindPoint::GRAPHICS)
        .color_attachments(&color_refs);
    if depth_format.is_some() {
        subpass = subpass.depth_stencil_attachment(&depth_ref);
    }

    // The depth clear must wait for the last pass that tested against the
    // same attachment.
    let dependencies = [vk::SubpassDependency::default()
        .src_subpass(vk::SUBPASS_EXTERNAL)
        .dst_subpass(0)
        .src_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::LATE_FRAGMENT_TESTS,
        )
        .dst_stage_mask(
            vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT
                | vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
        )
        .src_access_mask(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE)
        .dst_access_mask(
            vk::AccessFlags::COLOR_ATTACHMENT_WRITE
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
        )];

    let subpasses = [subpass];
    let create_info = vk::RenderPassCreateInfo::default()
        .attachments(&attachments)
        .subpasses(&subpasses)
        .dependencies(&dependencies);

    unsafe {
        device
            .create_render_pass(&create_info, None)
            .map_err(|e| RenderError::Creation(format!("render pass: {e}")))
    }
}

fn create_shader_module(device: &ash::Device, spirv: &[u8]) -> Result<vk::ShaderModule> {
    let code = ash::util::read_spv(&mut Cursor::new(spirv))?;
    let create_info = vk::ShaderModuleCreateInfo::default().code(&code);
    unsafe {
        device
            .create_shader_module(&create_info, None)
            .map_err(|e| RenderError::Creation(format!("shader module: {e}")))
    }
}

fn create_pipeline(
    device: &ash::Device,
    desc: &PipelineDesc<'_>,
    render_pass: vk::RenderPass,
    layout: vk::PipelineLayout,
) -> Result<vk::Pipeline> {
    let vertex_module = create_shader_module(device, desc.vertex_spirv)?;
    let fragment_module = match create_shader_module(device, desc.fragment_spirv) {
        Ok(module) => module,
        Err(e) => {
            unsafe { device.destroy_shader_module(vertex_module, None) };
            return Err(e);
        }
    };

    let stages = [
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::VERTEX)
            .module(vertex_module)
            .name(SHADER_ENTRY),
        vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::FRAGMENT)
            .module(fragment_module)
            .name(SHADER_ENTRY),
    ];

    let bindings = [desc.vertex_layout.binding_description()];
    let attributes = desc.vertex_layout.attribute_descriptions();
    let vertex_input = vk::PipelineVertexInputStateCreateInfo::default()
        .vertex_binding_descriptions(&bindings)
        .vertex_attribute_descriptions(&attributes);

    let input_assembly = vk::PipelineInputAssemblyStateCreateInfo::default()
        .topology(vk::PrimitiveTopology::TRIANGLE_LIST)
        .primitive_restart_enable(false);

    let viewport_state = vk::PipelineViewportStateCreateInfo::default()
        .viewport_count(1)
        .scissor_count(1);

    let rasterization = vk::PipelineRasterizationStateCreateInfo::default()
        .polygon_mode(vk::PolygonMode::FILL)
        .line_width(1.0)
        .cull_mode(vk::CullModeFlags::BACK)
        .front_face(vk::FrontFace::COUNTER_CLOCKWISE);

    let multisample = vk::PipelineMultisampleStateCreateInfo::default()
        .rasterization_samples(vk::SampleCountFlags::TYPE_1);

    let depth_stencil = vk::PipelineDepthStencilStateCreateInfo::default()
        .depth_test_enable(desc.depth_format.is_some())
        .depth_write_enable(desc.depth_format.is_some())
        .depth_compare_op(vk::CompareOp::LESS);

    let blend_attachments = [vk::PipelineColorBlendAttachmentState::default()
        .color_write_mask(vk::ColorComponentFlags::RGBA)
        .blend_enable(false)];
    let color_blend =
        vk::PipelineColorBlendStateCreateInfo::default().attachments(&blend_attachments);

    let dynamic_states = [vk::DynamicState::VIEWPORT, vk::DynamicState::SCISSOR];
    let dynamic_state =
        vk::PipelineDynamicStateCreateInfo::default().dynamic_states(&dynamic_states);

    let pipeline_info = vk::GraphicsPipelineCreateInfo::default()
        .stages(&stages)
        .vertex_input_state(&vertex_input)
        .input_assembly_state(&input_assembly)
        .viewport_state(&viewport_state)
        .rasterization_state(&rasterization)
        .multisample_state(&multisample)
        .depth_stencil_state(&depth_stencil)
        .color_blend_state(&color_blend)
        .dynamic_state(&dynamic_state)
        .layout(layout)
        .render_pass(render_pass)
        .subpass(0);

    let result = unsafe {
        device.create_graphics_pipelines(vk::PipelineCache::null(), &[pipeline_info], None)
    };
    unsafe {
        device.destroy_shader_module(fragment_module, None);
        device.destroy_shader_module(vertex_module, None);
    }

    let pipelines =
        result.map_err(|(_, e)| RenderError::Creation(format!("graphics pipeline: {e}")))?;
    pipelines
        .into_iter()
        .next()
        .ok_or_else(|| RenderError::Creation("graphics pipeline: none returned".to_string()))
}
