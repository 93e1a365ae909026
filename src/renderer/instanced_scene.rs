use ash::vk;
use glam::{Mat4, Vec3};
use log::{debug, warn};

use super::instanced_mesh::InstancedMesh;
use crate::vulkan::{CommandContext, ResourceUploader};
use crate::{RenderError, Result};

/// Stable handle to a mesh inside one [`InstancedScene`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(u64);

/// The slice of the flattened transform array one mesh draws from.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DrawRange {
    pub mesh: MeshId,
    pub base_instance: u32,
    pub instance_count: u32,
}

/// Concatenates per-mesh transform lists in order.
pub fn flatten_transforms<'a>(lists: impl IntoIterator<Item = &'a [Mat4]> + Clone) -> Vec<Mat4> {
    let total = lists.clone().into_iter().map(<[Mat4]>::len).sum();
    let mut flattened = Vec::with_capacity(total);
    for list in lists {
        flattened.extend_from_slice(list);
    }
    flattened
}

/// An ordered set of instanced meshes drawn as one unit.
///
/// Mesh order is draw order. Instance transforms of every mesh are packed
/// into one array, mesh after mesh, and each mesh's draw reads from the
/// offset where its own transforms start. The packed array is cached and
/// rebuilt only after a mutation.
pub struct InstancedScene<D: ResourceUploader> {
    meshes: Vec<(MeshId, InstancedMesh<D>)>,
    flattened: Option<Vec<Mat4>>,
    capacity: usize,
    next_id: u64,
}

impl<D: ResourceUploader> InstancedScene<D> {
    /// `capacity` bounds the total instance count across all meshes and
    /// should match the per-frame storage buffer size.
    pub fn new(capacity: usize) -> Self {
        Self {
            meshes: Vec::new(),
            flattened: None,
            capacity,
            next_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }

    /// Total instances across all meshes.
    pub fn instance_count(&self) -> usize {
        self.meshes.iter().map(|(_, mesh)| mesh.instance_count()).sum()
    }

    /// True when the next snapshot will rebuild the packed array.
    pub fn is_dirty(&self) -> bool {
        self.flattened.is_none()
    }

    pub fn mesh_ids(&self) -> impl Iterator<Item = MeshId> + '_ {
        self.meshes.iter().map(|(id, _)| *id)
    }

    pub fn mesh(&self, id: MeshId) -> Option<&InstancedMesh<D>> {
        self.meshes
            .iter()
            .find(|(mesh_id, _)| *mesh_id == id)
            .map(|(_, mesh)| mesh)
    }

    /// Appends `mesh`, which is drawn after every mesh already present.
    ///
    /// A mesh without a texture is accepted but leaves set 1 unbound, so it
    /// must only be drawn with a pipeline that does not sample it.
    pub fn add_mesh(&mut self, mesh: InstancedMesh<D>) -> Result<MeshId> {
        self.ensure_room(mesh.instance_count())?;

        let id = MeshId(self.next_id);
        self.next_id += 1;
        if mesh.texture().is_none() {
            warn!(
                "Mesh {id:?} has no texture; a pipeline that samples set 1 will read an unbound descriptor"
            );
        }
        self.meshes.push((id, mesh));
        self.flattened = None;
        Ok(id)
    }

    /// Takes `id` out of the scene. The caller must keep the returned mesh
    /// alive until no in-flight frame references its buffers.
    pub fn remove_mesh(&mut self, id: MeshId) -> Result<InstancedMesh<D>> {
        let position = self.position(id)?;
        self.flattened = None;
        Ok(self.meshes.remove(position).1)
    }

    pub fn add_instance(&mut self, id: MeshId, transform: Mat4) -> Result<usize> {
        let position = self.position(id)?;
        self.ensure_room(1)?;
        self.flattened = None;
        Ok(self.meshes[position].1.add_instance(transform))
    }

    pub fn remove_instance(&mut self, id: MeshId, index: usize) -> Result<Mat4> {
        self.mutate(id, |mesh| mesh.remove_instance(index))
    }

    pub fn set_instance_transform(&mut self, id: MeshId, index: usize, transform: Mat4) -> Result<()> {
        self.mutate(id, |mesh| mesh.set_instance_transform(index, transform))
    }

    pub fn rotate_instance(&mut self, id: MeshId, index: usize, axis: Vec3, angle: f32) -> Result<()> {
        self.mutate(id, |mesh| mesh.rotate_instance(index, axis, angle))
    }

    pub fn scale_instance(&mut self, id: MeshId, index: usize, scale: Vec3) -> Result<()> {
        self.mutate(id, |mesh| mesh.scale_instance(index, scale))
    }

    pub fn translate_instance(&mut self, id: MeshId, index: usize, offset: Vec3) -> Result<()> {
        self.mutate(id, |mesh| mesh.translate_instance(index, offset))
    }

    pub fn rotate_all_instances(&mut self, id: MeshId, axis: Vec3, angle: f32) -> Result<()> {
        self.mutate(id, |mesh| {
            mesh.rotate_all(axis, angle);
            Ok(())
        })
    }

    /// The packed transform array, rebuilt first if anything changed.
    pub fn flattened_transforms(&mut self) -> &[Mat4] {
        self.snapshot().transforms
    }

    /// Borrows the packed array together with the mesh list it was built
    /// from. Both stay frozen for the lifetime of the snapshot.
    pub fn snapshot(&mut self) -> SceneSnapshot<'_, D> {
        let meshes = &self.meshes;
        let transforms = self.flattened.get_or_insert_with(|| {
            let flattened = flatten_transforms(meshes.iter().map(|(_, mesh)| mesh.transforms()));
            debug!(
                "Flattened {} instance transforms across {} meshes",
                flattened.len(),
                meshes.len()
            );
            flattened
        });
        SceneSnapshot { transforms, meshes }
    }

    /// Records every mesh's draw. Returns the number of instances drawn.
    pub fn draw<C: CommandContext + ?Sized>(&mut self, ctx: &mut C, layout: vk::PipelineLayout) -> u32 {
        self.snapshot().draw(ctx, layout)
    }

    fn position(&self, id: MeshId) -> Result<usize> {
        self.meshes
            .iter()
            .position(|(mesh_id, _)| *mesh_id == id)
            .ok_or(RenderError::UnknownMesh(id))
    }

    fn ensure_room(&self, additional: usize) -> Result<()> {
        let requested = self.instance_count() + additional;
        if requested > self.capacity {
            return Err(RenderError::CapacityExceeded {
                requested,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    fn mutate<R>(
        &mut self,
        id: MeshId,
        f: impl FnOnce(&mut InstancedMesh<D>) -> Result<R>,
    ) -> Result<R> {
        let position = self.position(id)?;
        let result = f(&mut self.meshes[position].1)?;
        self.flattened = None;
        Ok(result)
    }
}

/// A frozen view of a scene for one frame.
pub struct SceneSnapshot<'a, D: ResourceUploader> {
    transforms: &'a [Mat4],
    meshes: &'a [(MeshId, InstancedMesh<D>)],
}

impl<'a, D: ResourceUploader> SceneSnapshot<'a, D> {
    pub fn transforms(&self) -> &'a [Mat4] {
        self.transforms
    }

    pub fn instance_count(&self) -> usize {
        self.transforms.len()
    }

    /// Base instance and count for each mesh, in draw order.
    pub fn draw_ranges(&self) -> Vec<DrawRange> {
        let mut offset = 0u32;
        self.meshes
            .iter()
            .map(|(id, mesh)| {
                let range = DrawRange {
                    mesh: *id,
                    base_instance: offset,
                    instance_count: mesh.instance_count() as u32,
                };
                offset += range.instance_count;
                range
            })
            .collect()
    }

    /// Issues one draw per mesh with a running base-instance offset.
    /// Returns the number of instances drawn.
    pub fn draw<C: CommandContext + ?Sized>(&self, ctx: &mut C, layout: vk::PipelineLayout) -> u32 {
        let mut offset = 0u32;
        for (_, mesh) in self.meshes {
            mesh.draw(ctx, layout, offset);
            offset += mesh.instance_count() as u32;
        }
        debug_assert_eq!(offset as usize, self.transforms.len());
        offset
    }
}
