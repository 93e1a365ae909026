//! Vulkan frame lifecycle and instanced drawing on top of ASH.
//!
//! A [`FrameOrchestrator`](renderer::FrameOrchestrator) drives a ring of frame
//! slots over a swapchain it rebuilds on resize, while an
//! [`InstancedScene`](renderer::InstancedScene) owns meshes and their
//! per-instance transforms. Each frame the scene is flattened into one storage
//! buffer and drawn with one instanced call per mesh.
//!
//! ```no_run
//! use ash_instancing::prelude::*;
//! # fn run(window: std::sync::Arc<winit::window::Window>, vert: &[u8], frag: &[u8]) -> Result<()> {
//! let config = RendererConfig::default();
//! let instance = VulkanInstance::new(
//!     &WindowSurfaceProvider::new(window.clone()),
//!     config.enable_validation,
//! )?;
//! let device = std::sync::Arc::new(AshDevice::new(instance)?);
//! let pipeline = GraphicsPipeline::new(
//!     device.device().clone(),
//!     &PipelineDesc {
//!         vertex_spirv: vert,
//!         fragment_spirv: frag,
//!         vertex_layout: VertexLayout::Vertex3D,
//!         color_format: config.preferred_surface_format.format,
//!         depth_format: config.depth_format,
//!     },
//! )?;
//! let mut frames = FrameOrchestrator::new(
//!     device.clone(),
//!     pipeline.frame_pipeline(),
//!     &config,
//!     window.current_extent(),
//! )?;
//! let mut scene = InstancedScene::new(config.max_instances as usize);
//! frames.render_frame(&mut scene, &FixedCamera::default(), &window)?;
//! # Ok(())
//! # }
//! ```

pub mod config;
mod error;
pub mod prelude;
pub mod renderer;
pub mod vulkan;

pub use config::RendererConfig;
pub use error::{RenderError, Result};
