use std::time::Duration;

use ash::vk;

/// Default upper bound on instances across a whole scene.
pub const DEFAULT_MAX_INSTANCES: u32 = 100_000;

/// Renderer-wide settings fixed at startup.
#[derive(Clone, Debug)]
pub struct RendererConfig {
    /// Capacity of each frame slot's storage buffer, in instance transforms.
    pub max_instances: u32,
    pub preferred_surface_format: vk::SurfaceFormatKHR,
    /// Used when the surface supports it, otherwise FIFO.
    pub preferred_present_mode: vk::PresentModeKHR,
    /// `None` disables the per-frame depth target.
    pub depth_format: Option<vk::Format>,
    pub clear_color: [f32; 4],
    /// `u64::MAX` waits forever. Any finite value turns expiry into
    /// [`RenderError::FenceTimeout`](crate::RenderError::FenceTimeout).
    pub fence_timeout_ns: u64,
    /// Sleep between polls while the surface reports a zero extent.
    pub extent_poll_interval: Duration,
    pub enable_validation: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            max_instances: DEFAULT_MAX_INSTANCES,
            preferred_surface_format: vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            preferred_present_mode: vk::PresentModeKHR::MAILBOX,
            depth_format: Some(vk::Format::D32_SFLOAT),
            clear_color: [0.01, 0.01, 0.02, 1.0],
            fence_timeout_ns: u64::MAX,
            extent_poll_interval: Duration::from_millis(16),
            enable_validation: cfg!(feature = "validation") && cfg!(debug_assertions),
        }
    }
}

impl RendererConfig {
    pub fn with_max_instances(mut self, max_instances: u32) -> Self {
        self.max_instances = max_instances;
        self
    }

    pub fn with_present_mode(mut self, mode: vk::PresentModeKHR) -> Self {
        self.preferred_present_mode = mode;
        self
    }

    pub fn with_depth_format(mut self, format: Option<vk::Format>) -> Self {
        self.depth_format = format;
        self
    }

    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_fence_timeout(mut self, timeout: Duration) -> Self {
        self.fence_timeout_ns = u64::try_from(timeout.as_nanos()).unwrap_or(u64::MAX);
        self
    }

    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = enabled;
        self
    }

    /// Size in bytes of one frame slot's instance storage buffer. Never zero,
    /// so a zero instance limit still gets a valid buffer.
    pub fn storage_buffer_size(&self) -> vk::DeviceSize {
        self.max_instances.max(1) as vk::DeviceSize
            * std::mem::size_of::<glam::Mat4>() as vk::DeviceSize
    }
}
