//! Common imports for applications.

pub use crate::config::RendererConfig;
pub use crate::error::{RenderError, Result};
pub use crate::renderer::{
    cube, quad, CameraController, CameraSource, CameraUniform, FixedCamera, FrameOrchestrator,
    FrameOutcome, FrameStats, InstancedMesh, InstancedScene, MeshId, SwapchainState, Vertex2D,
    Vertex3D, VertexData, VertexLayout,
};
pub use crate::vulkan::{
    AshDevice, ExtentSource, FixedExtent, GpuDevice, GraphicsPipeline, PipelineDesc,
    ResourceUploader, SurfaceProvider, VulkanInstance, WindowSurfaceProvider,
};
