pub mod ash_device;
pub mod command;
pub mod descriptor_layout;
pub mod device;
pub mod instance;
#[cfg(test)]
pub mod mock;
pub mod pipeline;
pub mod surface;

pub use ash_device::{AshDevice, QueueFamilies};
pub use command::{AshCommandContext, CommandContext};
pub use descriptor_layout::{DescriptorSetLayout, DescriptorSetLayoutBuilder};
pub use device::{
    AcquireOutcome, BufferBinding, DepthImage, DescriptorAllocation, GpuBuffer, GpuDevice,
    MemoryLocation, PresentOutcome, ResourceUploader, Submission, SurfaceSupport, SwapchainDesc,
    Texture,
};
pub use instance::VulkanInstance;
pub use pipeline::{FramePipeline, GraphicsPipeline, PipelineDesc};
pub use surface::{ExtentSource, FixedExtent, SurfaceProvider, WindowSurfaceProvider};
