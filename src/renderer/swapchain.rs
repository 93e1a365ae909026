use std::fmt;
use std::sync::Arc;
use std::thread;

use ash::vk;
use log::{debug, info, warn};

use super::frame_slot::{FrameSlot, FrameSlotDesc};
use crate::config::RendererConfig;
use crate::vulkan::{
    AcquireOutcome, ExtentSource, FramePipeline, GpuDevice, PresentOutcome, SwapchainDesc,
};
use crate::{RenderError, Result};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SwapchainState {
    Uninitialized,
    Ready,
    /// The surface no longer matches the image set. Only `recreate` is valid.
    Stale,
    Destroyed,
}

impl SwapchainState {
    fn name(self) -> &'static str {
        match self {
            SwapchainState::Uninitialized => "uninitialized",
            SwapchainState::Ready => "ready",
            SwapchainState::Stale => "stale",
            SwapchainState::Destroyed => "destroyed",
        }
    }
}

impl fmt::Display for SwapchainState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Result of asking for the next presentable image.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Acquired {
    Image(u32),
    /// The surface went stale. Recreate and try again next frame.
    Retry,
}

/// Picks `preferred` if the surface offers it, otherwise the first format.
pub fn choose_surface_format(
    formats: &[vk::SurfaceFormatKHR],
    preferred: vk::SurfaceFormatKHR,
) -> Option<vk::SurfaceFormatKHR> {
    if formats.contains(&preferred) {
        debug!("Selected preferred surface format {:?}", preferred.format);
        return Some(preferred);
    }
    let first = formats.first().copied();
    if let Some(format) = first {
        warn!(
            "Preferred surface format {:?} unavailable, using {:?}",
            preferred.format, format.format
        );
    }
    first
}

/// Picks `preferred` if available, otherwise FIFO, which every surface supports.
pub fn choose_present_mode(
    modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    let mode = if modes.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    };
    debug!("Selected present mode {mode:?}");
    mode
}

/// Uses the surface's current extent when it defines one, otherwise clamps
/// `requested` to the supported range.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    requested: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: requested.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: requested.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One more than the minimum, capped by the maximum when there is one.
pub fn determine_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let preferred = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        preferred.min(capabilities.max_image_count)
    } else {
        preferred
    }
}

/// Owns the swapchain and the ring of frame slots built on its images.
///
/// The ring size is fixed by the first successful creation. Extent and
/// format are only reported while the manager is [`SwapchainState::Ready`].
pub struct SwapchainManager<D: GpuDevice> {
    device: Arc<D>,
    config: RendererConfig,
    pipeline: FramePipeline,
    swapchain: vk::SwapchainKHR,
    slots: Vec<FrameSlot<D>>,
    extent: vk::Extent2D,
    surface_format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    ring_size: Option<usize>,
    state: SwapchainState,
}

impl<D: GpuDevice> SwapchainManager<D> {
    /// Frame slots render with `pipeline`, so its color format must be the
    /// one [`choose_surface_format`] picks for this surface.
    pub fn new(device: Arc<D>, pipeline: FramePipeline, config: &RendererConfig) -> Self {
        Self {
            device,
            config: config.clone(),
            pipeline,
            swapchain: vk::SwapchainKHR::null(),
            slots: Vec::new(),
            extent: vk::Extent2D::default(),
            surface_format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            ring_size: None,
            state: SwapchainState::Uninitialized,
        }
    }

    pub fn state(&self) -> SwapchainState {
        self.state
    }

    pub fn extent(&self) -> Option<vk::Extent2D> {
        (self.state == SwapchainState::Ready).then_some(self.extent)
    }

    pub fn surface_format(&self) -> Option<vk::SurfaceFormatKHR> {
        (self.state == SwapchainState::Ready).then_some(self.surface_format)
    }

    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    pub fn pipeline(&self) -> &FramePipeline {
        &self.pipeline
    }

    /// Number of frame slots. Zero before the first creation.
    pub fn ring_size(&self) -> usize {
        self.ring_size.unwrap_or(0)
    }

    pub fn slot(&self, index: usize) -> Option<&FrameSlot<D>> {
        self.slots.get(index)
    }

    pub fn slot_mut(&mut self, index: usize) -> Option<&mut FrameSlot<D>> {
        self.slots.get_mut(index)
    }

    /// Framebuffer targeting the presentable image `image_index`.
    pub fn framebuffer(&self, image_index: u32) -> Option<vk::Framebuffer> {
        self.slots
            .get(image_index as usize)
            .map(FrameSlot::framebuffer)
    }

    /// Builds the swapchain and one frame slot per image. Only valid once,
    /// from [`SwapchainState::Uninitialized`].
    pub fn create(&mut self, requested_extent: vk::Extent2D) -> Result<()> {
        self.expect_state("create", SwapchainState::Uninitialized)?;
        self.build(requested_extent)?;
        self.state = SwapchainState::Ready;
        info!(
            "Swapchain created: {}x{}, {} images, {:?}",
            self.extent.width,
            self.extent.height,
            self.slots.len(),
            self.present_mode
        );
        Ok(())
    }

    /// Requests the next image using the "image available" semaphore of
    /// ring slot `slot_index`.
    pub fn acquire_next(&mut self, slot_index: usize) -> Result<Acquired> {
        self.expect_state("acquire_next", SwapchainState::Ready)?;
        let slot = self
            .slots
            .get(slot_index)
            .ok_or(RenderError::IndexOutOfRange {
                index: slot_index,
                count: self.slots.len(),
            })?;

        match self
            .device
            .acquire_next_image(self.swapchain, slot.image_available())?
        {
            AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            } => {
                if suboptimal {
                    debug!("Acquired suboptimal image {image_index}");
                }
                Ok(Acquired::Image(image_index))
            }
            AcquireOutcome::OutOfDate => {
                warn!("Swapchain out of date on acquire");
                self.state = SwapchainState::Stale;
                Ok(Acquired::Retry)
            }
        }
    }

    /// Queues `image_index` for presentation after `wait` is signalled. A
    /// suboptimal or out-of-date result marks the manager stale.
    pub fn present(&mut self, image_index: u32, wait: vk::Semaphore) -> Result<PresentOutcome> {
        self.expect_state("present", SwapchainState::Ready)?;
        let outcome = self
            .device
            .queue_present(self.swapchain, image_index, wait)?;
        if outcome != PresentOutcome::Presented {
            debug!("Present reported {outcome:?}");
            self.state = SwapchainState::Stale;
        }
        Ok(outcome)
    }

    /// Flags the image set as needing a rebuild, for example after a resize.
    pub fn mark_stale(&mut self) {
        if self.state == SwapchainState::Ready {
            self.state = SwapchainState::Stale;
        }
    }

    /// Rebuilds the swapchain and every frame slot. Only valid from
    /// [`SwapchainState::Stale`].
    ///
    /// Blocks while `extent_source` reports a zero-sized surface, then waits
    /// for the device to go idle before destroying anything. On failure the
    /// manager stays stale with no image set.
    pub fn recreate(&mut self, extent_source: &dyn ExtentSource) -> Result<()> {
        self.expect_state("recreate", SwapchainState::Stale)?;

        let extent = self.wait_for_nonzero_extent(extent_source);
        self.device.device_wait_idle()?;
        self.teardown();
        self.build(extent)?;

        self.state = SwapchainState::Ready;
        info!(
            "Swapchain recreated: {}x{}, {} images",
            self.extent.width,
            self.extent.height,
            self.slots.len()
        );
        Ok(())
    }

    /// Releases the image set and every frame slot. Idempotent.
    pub fn destroy(&mut self) {
        if self.state == SwapchainState::Destroyed {
            return;
        }
        if !self.slots.is_empty() || self.swapchain != vk::SwapchainKHR::null() {
            if let Err(e) = self.device.device_wait_idle() {
                warn!("device_wait_idle failed during swapchain teardown: {e}");
            }
        }
        self.teardown();
        self.state = SwapchainState::Destroyed;
        debug!("Swapchain destroyed");
    }

    fn expect_state(&self, operation: &'static str, expected: SwapchainState) -> Result<()> {
        if self.state == expected {
            Ok(())
        } else {
            Err(RenderError::InvalidState {
                operation,
                state: self.state.name(),
            })
        }
    }

    fn wait_for_nonzero_extent(&self, source: &dyn ExtentSource) -> vk::Extent2D {
        let mut extent = source.current_extent();
        if extent.width == 0 || extent.height == 0 {
            info!("Surface is zero-sized, waiting before recreating swapchain");
            while extent.width == 0 || extent.height == 0 {
                thread::sleep(self.config.extent_poll_interval);
                extent = source.current_extent();
            }
        }
        extent
    }

    fn build(&mut self, requested_extent: vk::Extent2D) -> Result<()> {
        let creation = |what: &str| {
            let what = what.to_string();
            move |e: RenderError| RenderError::Creation(format!("{what}: {e}"))
        };

        let support = self
            .device
            .surface_support()
            .map_err(creation("surface query"))?;
        if !support.is_adequate() {
            return Err(RenderError::Creation(
                "surface reports no formats or present modes".to_string(),
            ));
        }
        let surface_format =
            choose_surface_format(&support.formats, self.config.preferred_surface_format)
                .ok_or_else(|| RenderError::Creation("surface reports no formats".to_string()))?;
        if surface_format.format != self.pipeline.color_format {
            return Err(RenderError::Creation(format!(
                "surface format {:?} does not match render pass format {:?}",
                surface_format.format, self.pipeline.color_format
            )));
        }
        let present_mode =
            choose_present_mode(&support.present_modes, self.config.preferred_present_mode);
        let extent = choose_extent(&support.capabilities, requested_extent);
        if extent.width == 0 || extent.height == 0 {
            return Err(RenderError::Creation(
                "surface has a zero-sized extent".to_string(),
            ));
        }

        let desc = SwapchainDesc {
            surface_format,
            present_mode,
            extent,
            min_image_count: determine_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
        };
        self.swapchain = self
            .device
            .create_swapchain(&desc)
            .map_err(creation("swapchain"))?;

        match self.build_slots(surface_format.format, extent) {
            Ok(slots) => {
                self.ring_size.get_or_insert(slots.len());
                self.slots = slots;
                self.extent = extent;
                self.surface_format = surface_format;
                self.present_mode = present_mode;
                Ok(())
            }
            Err(e) => {
                self.device.destroy_swapchain(self.swapchain);
                self.swapchain = vk::SwapchainKHR::null();
                Err(e)
            }
        }
    }

    fn build_slots(&self, format: vk::Format, extent: vk::Extent2D) -> Result<Vec<FrameSlot<D>>> {
        let images = self
            .device
            .swapchain_images(self.swapchain)
            .map_err(|e| RenderError::Creation(format!("swapchain images: {e}")))?;
        if images.is_empty() {
            return Err(RenderError::Creation(
                "swapchain returned no images".to_string(),
            ));
        }

        if let Some(ring_size) = self.ring_size {
            if images.len() != ring_size {
                return Err(RenderError::Creation(format!(
                    "swapchain image count changed from {ring_size} to {}",
                    images.len()
                )));
            }
        }

        images
            .into_iter()
            .map(|image| {
                FrameSlot::new(
                    self.device.clone(),
                    &FrameSlotDesc {
                        image,
                        format,
                        extent,
                        render_pass: self.pipeline.render_pass,
                        frame_set_layout: self.pipeline.frame_set_layout,
                        depth_format: self.pipeline.depth_format,
                        max_instances: self.config.max_instances as usize,
                        storage_buffer_size: self.config.storage_buffer_size(),
                        fence_timeout_ns: self.config.fence_timeout_ns,
                    },
                )
            })
            .collect()
    }

    fn teardown(&mut self) {
        self.slots.clear();
        if self.swapchain != vk::SwapchainKHR::null() {
            self.device.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
    }
}

impl<D: GpuDevice> Drop for SwapchainManager<D> {
    fn drop(&mut self) {
        self.destroy();
    }
}
