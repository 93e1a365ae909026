pub mod camera;
pub mod frame_slot;
pub mod instanced_mesh;
pub mod instanced_scene;
pub mod orchestrator;
pub mod swapchain;
pub mod vertex;

pub use camera::{CameraController, CameraSource, CameraUniform, FixedCamera};
pub use frame_slot::{FrameSlot, FrameSlotDesc, RenderTarget};
pub use instanced_mesh::InstancedMesh;
pub use instanced_scene::{flatten_transforms, DrawRange, InstancedScene, MeshId, SceneSnapshot};
pub use orchestrator::{FrameOrchestrator, FrameOutcome, FrameStats};
pub use swapchain::{
    choose_extent, choose_present_mode, choose_surface_format, determine_image_count, Acquired,
    SwapchainManager, SwapchainState,
};
pub use vertex::{cube, quad, Vertex2D, Vertex3D, VertexData, VertexLayout};
