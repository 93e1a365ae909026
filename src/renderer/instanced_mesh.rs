use std::sync::Arc;

use ash::vk;
use glam::{Mat4, Quat, Vec3};
use log::debug;

use super::vertex::{VertexData, VertexLayout};
use crate::vulkan::{CommandContext, GpuBuffer, MemoryLocation, ResourceUploader, Texture};
use crate::{RenderError, Result};

/// One shape uploaded once and drawn as many independent instances.
///
/// Vertex and index buffers are device-local and never rewritten. Instance
/// transforms live on the CPU; the owning scene flattens them into the
/// per-frame storage buffer.
pub struct InstancedMesh<D: ResourceUploader> {
    device: Arc<D>,
    vertices: VertexData,
    indices: Vec<u32>,
    vertex_buffer: GpuBuffer,
    index_buffer: GpuBuffer,
    texture: Option<Texture>,
    transforms: Vec<Mat4>,
}

impl<D: ResourceUploader> InstancedMesh<D> {
    /// Uploads `vertices` and `indices` into device-local buffers. The mesh
    /// takes ownership of `texture`. Any failure is reported as
    /// [`RenderError::Upload`] and frees what was created and the texture.
    pub fn new(
        device: Arc<D>,
        vertices: impl Into<VertexData>,
        indices: Vec<u32>,
        texture: Option<Texture>,
    ) -> Result<Self> {
        let vertices = vertices.into();
        if vertices.is_empty() || indices.is_empty() {
            if let Some(texture) = texture {
                device.destroy_texture(texture);
            }
            return Err(RenderError::Upload(
                "mesh needs at least one vertex and one index".to_string(),
            ));
        }

        let mut mesh = Self {
            device,
            vertices,
            indices,
            vertex_buffer: GpuBuffer::null(),
            index_buffer: GpuBuffer::null(),
            texture,
            transforms: Vec::new(),
        };

        mesh.vertex_buffer = upload(
            mesh.device.as_ref(),
            mesh.vertices.as_bytes(),
            vk::BufferUsageFlags::VERTEX_BUFFER,
        )?;
        mesh.index_buffer = upload(
            mesh.device.as_ref(),
            bytemuck::cast_slice(&mesh.indices),
            vk::BufferUsageFlags::INDEX_BUFFER,
        )?;

        debug!(
            "Uploaded mesh: {} vertices, {} indices",
            mesh.vertices.len(),
            mesh.indices.len()
        );
        Ok(mesh)
    }

    pub fn layout(&self) -> VertexLayout {
        self.vertices.layout()
    }

    pub fn vertices(&self) -> &VertexData {
        &self.vertices
    }

    pub fn indices(&self) -> &[u32] {
        &self.indices
    }

    pub fn index_count(&self) -> u32 {
        self.indices.len() as u32
    }

    pub fn texture(&self) -> Option<&Texture> {
        self.texture.as_ref()
    }

    pub fn vertex_buffer(&self) -> &GpuBuffer {
        &self.vertex_buffer
    }

    pub fn index_buffer(&self) -> &GpuBuffer {
        &self.index_buffer
    }

    pub fn instance_count(&self) -> usize {
        self.transforms.len()
    }

    pub fn transforms(&self) -> &[Mat4] {
        &self.transforms
    }

    pub fn transform(&self, index: usize) -> Result<Mat4> {
        self.transforms
            .get(index)
            .copied()
            .ok_or(self.out_of_range(index))
    }

    /// Appends an instance and returns its index.
    pub fn add_instance(&mut self, transform: Mat4) -> usize {
        self.transforms.push(transform);
        self.transforms.len() - 1
    }

    /// Removes the instance at `index`. Later instances shift down by one and
    /// keep their relative order.
    pub fn remove_instance(&mut self, index: usize) -> Result<Mat4> {
        self.check(index)?;
        Ok(self.transforms.remove(index))
    }

    pub fn set_instance_transform(&mut self, index: usize, transform: Mat4) -> Result<()> {
        *self.slot(index)? = transform;
        Ok(())
    }

    /// Rotates the instance about `axis` in its local frame.
    pub fn rotate_instance(&mut self, index: usize, axis: Vec3, angle: f32) -> Result<()> {
        let rotation = Mat4::from_quat(Quat::from_axis_angle(axis.normalize_or_zero(), angle));
        let transform = self.slot(index)?;
        *transform *= rotation;
        Ok(())
    }

    pub fn scale_instance(&mut self, index: usize, scale: Vec3) -> Result<()> {
        let transform = self.slot(index)?;
        *transform *= Mat4::from_scale(scale);
        Ok(())
    }

    /// Moves the instance by `offset` in its local frame.
    pub fn translate_instance(&mut self, index: usize, offset: Vec3) -> Result<()> {
        let transform = self.slot(index)?;
        *transform *= Mat4::from_translation(offset);
        Ok(())
    }

    pub fn rotate_all(&mut self, axis: Vec3, angle: f32) {
        let rotation = Mat4::from_quat(Quat::from_axis_angle(axis.normalize_or_zero(), angle));
        for transform in &mut self.transforms {
            *transform *= rotation;
        }
    }

    /// Records one indexed draw of every instance, reading transforms from
    /// `base_instance` onwards in the bound storage buffer.
    pub fn draw<C: CommandContext + ?Sized>(
        &self,
        ctx: &mut C,
        layout: vk::PipelineLayout,
        base_instance: u32,
    ) {
        ctx.bind_vertex_buffer(self.vertex_buffer.handle);
        ctx.bind_index_buffer(self.index_buffer.handle);
        if let Some(texture) = &self.texture {
            ctx.bind_descriptor_set(layout, 1, texture.descriptor_set);
        }
        ctx.draw_indexed(
            self.index_count(),
            self.transforms.len() as u32,
            base_instance,
        );
    }

    fn check(&self, index: usize) -> Result<()> {
        if index < self.transforms.len() {
            Ok(())
        } else {
            Err(self.out_of_range(index))
        }
    }

    fn slot(&mut self, index: usize) -> Result<&mut Mat4> {
        let count = self.transforms.len();
        self.transforms
            .get_mut(index)
            .ok_or(RenderError::IndexOutOfRange { index, count })
    }

    fn out_of_range(&self, index: usize) -> RenderError {
        RenderError::IndexOutOfRange {
            index,
            count: self.transforms.len(),
        }
    }
}

impl<D: ResourceUploader> Drop for InstancedMesh<D> {
    fn drop(&mut self) {
        for buffer in [self.vertex_buffer, self.index_buffer] {
            if !buffer.is_null() {
                self.device.destroy_buffer(buffer);
            }
        }
        if let Some(texture) = self.texture.take() {
            self.device.destroy_texture(texture);
        }
    }
}

fn upload<D: ResourceUploader + ?Sized>(
    device: &D,
    bytes: &[u8],
    usage: vk::BufferUsageFlags,
) -> Result<GpuBuffer> {
    let buffer = device
        .create_buffer(
            bytes.len() as vk::DeviceSize,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            MemoryLocation::GpuOnly,
        )
        .map_err(|e| RenderError::Upload(format!("buffer creation failed: {e}")))?;

    if let Err(e) = device.upload_via_staging(&buffer, bytes) {
        device.destroy_buffer(buffer);
        return Err(RenderError::Upload(format!("staging copy failed: {e}")));
    }
    Ok(buffer)
}
