use std::mem::{offset_of, size_of};

use ash::vk;
use bytemuck::{Pod, Zeroable};

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex2D {
    pub position: [f32; 2],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct Vertex3D {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coord: [f32; 2],
}

/// The vertex formats a pipeline can be built for.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VertexLayout {
    Vertex2D,
    Vertex3D,
}

impl VertexLayout {
    pub fn stride(self) -> u32 {
        match self {
            VertexLayout::Vertex2D => size_of::<Vertex2D>() as u32,
            VertexLayout::Vertex3D => size_of::<Vertex3D>() as u32,
        }
    }

    pub fn binding_description(self) -> vk::VertexInputBindingDescription {
        vk::VertexInputBindingDescription {
            binding: 0,
            stride: self.stride(),
            input_rate: vk::VertexInputRate::VERTEX,
        }
    }

    /// Locations match the vertex shader inputs: position, color, then
    /// normal (3D only), then texture coordinates last.
    pub fn attribute_descriptions(self) -> Vec<vk::VertexInputAttributeDescription> {
        let attribute = |location, format, offset: usize| vk::VertexInputAttributeDescription {
            location,
            binding: 0,
            format,
            offset: offset as u32,
        };

        match self {
            VertexLayout::Vertex2D => vec![
                attribute(0, vk::Format::R32G32_SFLOAT, offset_of!(Vertex2D, position)),
                attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex2D, color)),
                attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(Vertex2D, tex_coord)),
            ],
            VertexLayout::Vertex3D => vec![
                attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex3D, position)),
                attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex3D, color)),
                attribute(2, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex3D, normal)),
                attribute(3, vk::Format::R32G32_SFLOAT, offset_of!(Vertex3D, tex_coord)),
            ],
        }
    }
}

/// Vertex data for one mesh, in one of the supported layouts.
#[derive(Clone, Debug, PartialEq)]
pub enum VertexData {
    Vertex2D(Vec<Vertex2D>),
    Vertex3D(Vec<Vertex3D>),
}

impl VertexData {
    pub fn layout(&self) -> VertexLayout {
        match self {
            VertexData::Vertex2D(_) => VertexLayout::Vertex2D,
            VertexData::Vertex3D(_) => VertexLayout::Vertex3D,
        }
    }

    pub fn len(&self) -> usize {
        match self {
            VertexData::Vertex2D(v) => v.len(),
            VertexData::Vertex3D(v) => v.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn as_bytes(&self) -> &[u8] {
        match self {
            VertexData::Vertex2D(v) => bytemuck::cast_slice(v),
            VertexData::Vertex3D(v) => bytemuck::cast_slice(v),
        }
    }
}

impl From<Vec<Vertex2D>> for VertexData {
    fn from(vertices: Vec<Vertex2D>) -> Self {
        VertexData::Vertex2D(vertices)
    }
}

impl From<Vec<Vertex3D>> for VertexData {
    fn from(vertices: Vec<Vertex3D>) -> Self {
        VertexData::Vertex3D(vertices)
    }
}

/// A unit quad in the XY plane, wound counter-clockwise when viewed from +Z.
pub fn quad() -> (Vec<Vertex2D>, Vec<u32>) {
    let vertices = vec![
        Vertex2D {
            position: [-0.5, -0.5],
            color: [1.0, 0.0, 0.0],
            tex_coord: [0.0, 1.0],
        },
        Vertex2D {
            position: [0.5, -0.5],
            color: [0.0, 1.0, 0.0],
            tex_coord: [1.0, 1.0],
        },
        Vertex2D {
            position: [0.5, 0.5],
            color: [0.0, 0.0, 1.0],
            tex_coord: [1.0, 0.0],
        },
        Vertex2D {
            position: [-0.5, 0.5],
            color: [1.0, 1.0, 1.0],
            tex_coord: [0.0, 0.0],
        },
    ];
    (vertices, vec![0, 1, 2, 2, 3, 0])
}

/// A unit cube centred on the origin with outward normals and
/// counter-clockwise front faces.
pub fn cube() -> (Vec<Vertex3D>, Vec<u32>) {
    // (normal, up, right) per face; the face's corners are built from them.
    const FACES: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
        ([0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [1.0, 0.0, 0.0]),
        ([0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [-1.0, 0.0, 0.0]),
        ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
        ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
        ([0.0, 1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
        ([0.0, -1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
    ];
    const CORNERS: [(f32, f32, [f32; 2]); 4] = [
        (-1.0, -1.0, [0.0, 1.0]),
        (1.0, -1.0, [1.0, 1.0]),
        (1.0, 1.0, [1.0, 0.0]),
        (-1.0, 1.0, [0.0, 0.0]),
    ];

    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);

    for (normal, up, right) in FACES {
        let base = vertices.len() as u32;
        for (r, u, tex_coord) in CORNERS {
            let position = [0, 1, 2].map(|i| 0.5 * (normal[i] + r * right[i] + u * up[i]));
            vertices.push(Vertex3D {
                position,
                color: normal.map(|n| n.abs() * 0.5 + 0.5),
                normal,
                tex_coord,
            });
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }

    (vertices, indices)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attribute_offsets_fit_inside_stride() {
        for layout in [VertexLayout::Vertex2D, VertexLayout::Vertex3D] {
            let stride = layout.stride();
            for attribute in layout.attribute_descriptions() {
                assert!(attribute.offset < stride);
            }
        }
        assert_eq!(VertexLayout::Vertex2D.stride(), 28);
        assert_eq!(VertexLayout::Vertex3D.stride(), 44);
    }

    #[test]
    fn vertex_data_reports_layout_and_bytes() {
        let (vertices, _) = quad();
        let data = VertexData::from(vertices);
        assert_eq!(data.layout(), VertexLayout::Vertex2D);
        assert_eq!(data.len(), 4);
        assert_eq!(data.as_bytes().len(), 4 * 28);
    }

    #[test]
    fn cube_faces_wind_counter_clockwise_outward() {
        let (vertices, indices) = cube();
        assert_eq!(vertices.len(), 24);
        assert_eq!(indices.len(), 36);

        for triangle in indices.chunks(3) {
            let [a, b, c] = [0, 1, 2].map(|i| glam::Vec3::from(vertices[triangle[i] as usize].position));
            let normal = glam::Vec3::from(vertices[triangle[0] as usize].normal);
            let face = (b - a).cross(c - a);
            assert!(face.dot(normal) > 0.0);
        }
    }
}
