use std::sync::Arc;

use ash::vk;

use crate::{RenderError, Result};

/// RAII wrapper for a descriptor set layout.
pub struct DescriptorSetLayout {
    device: Arc<ash::Device>,
    layout: vk::DescriptorSetLayout,
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayout {
    pub fn new(
        device: Arc<ash::Device>,
        bindings: &[vk::DescriptorSetLayoutBinding<'static>],
    ) -> Result<Self> {
        let create_info = vk::DescriptorSetLayoutCreateInfo::default().bindings(bindings);

        let layout = unsafe {
            device
                .create_descriptor_set_layout(&create_info, None)
                .map_err(|e| RenderError::Creation(format!("descriptor set layout: {e}")))?
        };

        Ok(Self {
            device,
            layout,
            bindings: bindings.to_vec(),
        })
    }

    /// Set 0: the camera uniform (binding 0) and the instance transform
    /// storage buffer (binding 1), both read by the vertex stage.
    pub fn per_frame(device: Arc<ash::Device>) -> Result<Self> {
        DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::UNIFORM_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .add_binding(
                1,
                vk::DescriptorType::STORAGE_BUFFER,
                vk::ShaderStageFlags::VERTEX,
            )
            .build(device)
    }

    /// Set 1: one combined image sampler for the fragment stage.
    pub fn texture(device: Arc<ash::Device>) -> Result<Self> {
        DescriptorSetLayoutBuilder::new()
            .add_binding(
                0,
                vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
                vk::ShaderStageFlags::FRAGMENT,
            )
            .build(device)
    }

    pub fn handle(&self) -> vk::DescriptorSetLayout {
        self.layout
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device.destroy_descriptor_set_layout(self.layout, None);
        }
    }
}

#[derive(Default)]
pub struct DescriptorSetLayoutBuilder {
    bindings: Vec<vk::DescriptorSetLayoutBinding<'static>>,
}

impl DescriptorSetLayoutBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_binding(
        mut self,
        binding: u32,
        descriptor_type: vk::DescriptorType,
        stage_flags: vk::ShaderStageFlags,
    ) -> Self {
        self.bindings.push(
            vk::DescriptorSetLayoutBinding::default()
                .binding(binding)
                .descriptor_type(descriptor_type)
                .descriptor_count(1)
                .stage_flags(stage_flags),
        );
        self
    }

    pub fn bindings(&self) -> &[vk::DescriptorSetLayoutBinding<'static>] {
        &self.bindings
    }

    pub fn build(self, device: Arc<ash::Device>) -> Result<DescriptorSetLayout> {
        DescriptorSetLayout::new(device, &self.bindings)
    }
}
