use ash::vk;
use thiserror::Error;

use crate::renderer::MeshId;

/// Errors produced by the frame lifecycle and the instanced-draw resources.
#[derive(Error, Debug)]
pub enum RenderError {
    /// Device, buffer, image, view or pipeline creation failed. Fatal at startup.
    #[error("Creation failed: {0}")]
    Creation(String),

    /// Staging copy or device-local buffer creation failed while building a mesh.
    #[error("Upload failed: {0}")]
    Upload(String),

    #[error("Instance index {index} out of range (instance count {count})")]
    IndexOutOfRange { index: usize, count: usize },

    #[error("Unknown mesh {0:?}")]
    UnknownMesh(MeshId),

    #[error("Instance capacity exceeded: {requested} requested, {capacity} available")]
    CapacityExceeded { requested: usize, capacity: usize },

    /// The presentation surface no longer matches the swapchain.
    #[error("Presentation surface is stale")]
    PresentationStale,

    #[error("Queue submission failed: {0}")]
    SubmissionFailure(vk::Result),

    #[error("`{operation}` is not valid while the swapchain is {state}")]
    InvalidState {
        operation: &'static str,
        state: &'static str,
    },

    #[error("Timed out waiting for frame fence")]
    FenceTimeout,

    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),

    #[error("Failed to load Vulkan: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("Image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl RenderError {
    /// Errors after which no valid render state remains.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            RenderError::IndexOutOfRange { .. }
                | RenderError::UnknownMesh(_)
                | RenderError::CapacityExceeded { .. }
                | RenderError::PresentationStale
                | RenderError::SubmissionFailure(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, RenderError>;
