use std::sync::Arc;

use ash::vk;
use log::{debug, error, info, warn};

use super::camera::{CameraSource, CameraUniform};
use super::frame_slot::{FrameSlot, RenderTarget};
use super::instanced_mesh::InstancedMesh;
use super::instanced_scene::InstancedScene;
use super::swapchain::{Acquired, SwapchainManager, SwapchainState};
use crate::config::RendererConfig;
use crate::vulkan::{ExtentSource, FramePipeline, GpuDevice, PresentOutcome};
use crate::{RenderError, Result};

/// What happened to one call of [`FrameOrchestrator::render_frame`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FrameOutcome {
    /// The frame reached the presentation engine.
    Presented { image_index: u32, instances: u32 },
    /// The surface went stale before the frame could be shown. The swapchain
    /// has been rebuilt.
    SkippedStale,
    /// Queue submission failed. Nothing was presented.
    Dropped,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub presented: u64,
    pub skipped: u64,
    pub dropped: u64,
    pub recreations: u64,
}

/// Drives acquire, record, submit and present over the frame slot ring.
pub struct FrameOrchestrator<D: GpuDevice> {
    device: Arc<D>,
    swapchain: SwapchainManager<D>,
    current_frame: usize,
    frame_counter: u64,
    /// Meshes removed from a scene, kept alive until no in-flight frame can
    /// still reference their buffers.
    retired: Vec<(u64, InstancedMesh<D>)>,
    stats: FrameStats,
    clear_color: [f32; 4],
}

impl<D: GpuDevice> FrameOrchestrator<D> {
    /// Creates the swapchain at `initial_extent` and its frame slot ring.
    pub fn new(
        device: Arc<D>,
        pipeline: FramePipeline,
        config: &RendererConfig,
        initial_extent: vk::Extent2D,
    ) -> Result<Self> {
        let mut swapchain = SwapchainManager::new(device.clone(), pipeline, config);
        swapchain.create(initial_extent)?;
        info!(
            "Frame orchestrator ready with {} frames in flight",
            swapchain.ring_size()
        );

        Ok(Self {
            device,
            swapchain,
            current_frame: 0,
            frame_counter: 0,
            retired: Vec::new(),
            stats: FrameStats::default(),
            clear_color: config.clear_color,
        })
    }

    pub fn swapchain(&self) -> &SwapchainManager<D> {
        &self.swapchain
    }

    pub fn stats(&self) -> FrameStats {
        self.stats
    }

    /// Ring slot the next frame will use.
    pub fn current_frame_index(&self) -> usize {
        self.current_frame
    }

    /// Frames that reached queue submission, presented or dropped.
    pub fn frame_counter(&self) -> u64 {
        self.frame_counter
    }

    pub fn retired_meshes(&self) -> usize {
        self.retired.len()
    }

    /// Renders `scene` from `camera` and presents it.
    ///
    /// A stale swapchain is rebuilt first, polling `extent_source` until the
    /// surface has a non-zero size. If the next image cannot be acquired the
    /// frame is abandoned before anything is submitted.
    pub fn render_frame(
        &mut self,
        scene: &mut InstancedScene<D>,
        camera: &dyn CameraSource,
        extent_source: &dyn ExtentSource,
    ) -> Result<FrameOutcome> {
        if self.swapchain.state() == SwapchainState::Stale {
            self.recreate(extent_source)?;
        }

        let frame = self.current_frame;
        self.slot(frame)?.acquire_guard()?;
        self.release_retired();

        let image_index = match self.swapchain.acquire_next(frame)? {
            Acquired::Image(index) => index,
            Acquired::Retry => {
                self.stats.skipped += 1;
                self.recreate(extent_source)?;
                return Ok(FrameOutcome::SkippedStale);
            }
        };

        let extent = self
            .swapchain
            .extent()
            .ok_or(RenderError::PresentationStale)?;
        let target = RenderTarget {
            framebuffer: self
                .swapchain
                .framebuffer(image_index)
                .ok_or(RenderError::PresentationStale)?,
            extent,
            clear_color: self.clear_color,
        };
        let pipeline = *self.swapchain.pipeline();
        let camera = CameraUniform::new(camera, extent.width as f32 / extent.height as f32);

        let snapshot = scene.snapshot();
        let recorded = self
            .slot_mut(frame)?
            .record_into(&snapshot, &camera, &target, &pipeline);
        let instances = match recorded {
            Ok(instances) => instances,
            Err(e) => {
                self.abandon_frame(frame)?;
                return Err(e);
            }
        };

        let render_finished = self.slot(image_index as usize)?.render_finished();
        match self.slot(frame)?.submit(render_finished) {
            Ok(()) => {}
            Err(RenderError::SubmissionFailure(result)) => {
                error!(
                    "Dropping frame {}: queue submission failed: {result}",
                    self.frame_counter
                );
                self.abandon_frame(frame)?;
                self.stats.dropped += 1;
                self.advance();
                return Ok(FrameOutcome::Dropped);
            }
            Err(e) => {
                self.abandon_frame(frame)?;
                return Err(e);
            }
        }

        let presented = self.swapchain.present(image_index, render_finished)?;
        self.advance();

        let outcome = if presented == PresentOutcome::OutOfDate {
            self.stats.skipped += 1;
            FrameOutcome::SkippedStale
        } else {
            self.stats.presented += 1;
            FrameOutcome::Presented {
                image_index,
                instances,
            }
        };

        if self.swapchain.state() == SwapchainState::Stale {
            self.recreate(extent_source)?;
        }
        Ok(outcome)
    }

    /// Marks the swapchain stale so the next frame rebuilds it at the size
    /// the extent source reports.
    pub fn request_resize(&mut self) {
        debug!("Swapchain resize requested");
        self.swapchain.mark_stale();
    }

    /// Takes ownership of a mesh removed from a scene and frees it once every
    /// frame that might have drawn it has completed.
    pub fn retire_mesh(&mut self, mesh: InstancedMesh<D>) {
        self.retired.push((self.frame_counter, mesh));
    }

    pub fn wait_idle(&self) -> Result<()> {
        self.device.device_wait_idle()
    }

    fn slot(&self, index: usize) -> Result<&FrameSlot<D>> {
        let count = self.swapchain.ring_size();
        self.swapchain
            .slot(index)
            .ok_or(RenderError::IndexOutOfRange { index, count })
    }

    fn slot_mut(&mut self, index: usize) -> Result<&mut FrameSlot<D>> {
        let count = self.swapchain.ring_size();
        self.swapchain
            .slot_mut(index)
            .ok_or(RenderError::IndexOutOfRange { index, count })
    }

    fn advance(&mut self) {
        self.current_frame = (self.current_frame + 1) % self.swapchain.ring_size().max(1);
        self.frame_counter += 1;
    }

    fn recreate(&mut self, extent_source: &dyn ExtentSource) -> Result<()> {
        self.swapchain.recreate(extent_source)?;
        self.stats.recreations += 1;
        // Recreation waits for the device to go idle.
        if !self.retired.is_empty() {
            debug!("Releasing {} retired meshes", self.retired.len());
            self.retired.clear();
        }
        Ok(())
    }

    /// Recovers a slot whose frame will never be submitted. Its fence is
    /// left reset and its acquire semaphore may be pending, so the fence is
    /// re-armed and the image set rebuilt on the next frame.
    fn abandon_frame(&mut self, frame: usize) -> Result<()> {
        warn!("Abandoning frame {} in slot {frame}", self.frame_counter);
        self.slot_mut(frame)?.rearm_fence()?;
        self.swapchain.mark_stale();
        Ok(())
    }

    fn release_retired(&mut self) {
        // A mesh retired at counter F was last drawn by frame F - 1. The fence
        // just waited on belongs to frame counter - ring.
        let ring = self.swapchain.ring_size() as u64;
        let counter = self.frame_counter;
        let before = self.retired.len();
        self.retired
            .retain(|(retired_at, _)| counter + 1 < retired_at + ring);
        if self.retired.len() != before {
            debug!("Released {} retired meshes", before - self.retired.len());
        }
    }
}

impl<D: GpuDevice> Drop for FrameOrchestrator<D> {
    fn drop(&mut self) {
        if let Err(e) = self.device.device_wait_idle() {
            error!("device_wait_idle failed during shutdown: {e}");
        }
        self.retired.clear();
        info!(
            "Frame orchestrator shut down after {} frames ({} presented, {} dropped)",
            self.frame_counter, self.stats.presented, self.stats.dropped
        );
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use glam::{Mat4, Vec3};

    use super::*;
    use crate::renderer::camera::FixedCamera;
    use crate::renderer::frame_slot::tests::test_pipeline;
    use crate::renderer::instanced_scene::MeshId;
    use crate::renderer::vertex::{cube, quad};
    use crate::vulkan::mock::{Command, MockDevice, ScriptedExtent};
    use crate::vulkan::AcquireOutcome;

    fn config(max_instances: u32) -> RendererConfig {
        let mut config = RendererConfig::default().with_max_instances(max_instances);
        config.extent_poll_interval = Duration::from_millis(1);
        config
    }

    fn extent(width: u32, height: u32) -> vk::Extent2D {
        vk::Extent2D { width, height }
    }

    fn orchestrator(device: &Arc<MockDevice>, max_instances: u32) -> FrameOrchestrator<MockDevice> {
        FrameOrchestrator::new(
            device.clone(),
            test_pipeline(),
            &config(max_instances),
            extent(800, 600),
        )
        .unwrap()
    }

    fn populated_scene(
        device: &Arc<MockDevice>,
        capacity: usize,
    ) -> (InstancedScene<MockDevice>, MeshId, MeshId) {
        let mut scene = InstancedScene::new(capacity);
        let (vertices, indices) = quad();
        let a = scene
            .add_mesh(InstancedMesh::new(device.clone(), vertices, indices, None).unwrap())
            .unwrap();
        let (vertices, indices) = cube();
        let b = scene
            .add_mesh(InstancedMesh::new(device.clone(), vertices, indices, None).unwrap())
            .unwrap();
        scene.add_instance(a, Mat4::IDENTITY).unwrap();
        scene
            .add_instance(b, Mat4::from_translation(Vec3::X))
            .unwrap();
        scene
            .add_instance(b, Mat4::from_translation(Vec3::Y))
            .unwrap();
        (scene, a, b)
    }

    #[test]
    fn frames_rotate_through_the_ring() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);
        let source = ScriptedExtent::new(&[(800, 600)]);
        let camera = FixedCamera::default();

        for expected in 0..3u32 {
            assert_eq!(frames.current_frame_index(), expected as usize);
            let outcome = frames.render_frame(&mut scene, &camera, &source).unwrap();
            assert_eq!(
                outcome,
                FrameOutcome::Presented {
                    image_index: expected,
                    instances: 3
                }
            );
        }
        assert_eq!(frames.current_frame_index(), 0);
        assert_eq!(device.presents(), vec![0, 1, 2]);

        let submitted: Vec<_> = device
            .submissions()
            .iter()
            .map(|s| s.command_buffer)
            .collect();
        let slots: Vec<_> = (0..3)
            .map(|i| frames.swapchain().slot(i).unwrap().command_buffer())
            .collect();
        assert_eq!(submitted, slots);
        assert_eq!(frames.stats().presented, 3);
    }

    #[test]
    fn frame_records_offsets_into_acquired_image() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);
        let source = ScriptedExtent::new(&[(800, 600)]);

        device.script_acquire(AcquireOutcome::Acquired {
            image_index: 2,
            suboptimal: false,
        });
        frames
            .render_frame(&mut scene, &FixedCamera::default(), &source)
            .unwrap();

        let slot = frames.swapchain().slot(0).unwrap();
        let commands = device.commands(slot.command_buffer());
        assert!(commands.contains(&Command::BeginRenderPass {
            framebuffer: frames.swapchain().framebuffer(2).unwrap(),
            extent: extent(800, 600),
        }));
        let draws: Vec<_> = commands
            .iter()
            .filter_map(|c| match c {
                Command::DrawIndexed {
                    instance_count,
                    first_instance,
                    ..
                } => Some((*first_instance, *instance_count)),
                _ => None,
            })
            .collect();
        assert_eq!(draws, vec![(0, 1), (1, 2)]);
        assert_eq!(device.presents(), vec![2]);
    }

    #[test]
    fn present_waits_on_semaphore_of_acquired_image() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);
        let source = ScriptedExtent::new(&[(800, 600)]);

        device.script_acquire(AcquireOutcome::Acquired {
            image_index: 2,
            suboptimal: false,
        });
        frames
            .render_frame(&mut scene, &FixedCamera::default(), &source)
            .unwrap();

        let frame_slot = frames.swapchain().slot(0).unwrap();
        let image_slot = frames.swapchain().slot(2).unwrap();
        let submission = device.submissions()[0];
        assert_eq!(submission.command_buffer, frame_slot.command_buffer());
        assert_eq!(submission.wait_semaphore, frame_slot.image_available());
        assert_eq!(submission.signal_semaphore, image_slot.render_finished());
        assert_ne!(submission.signal_semaphore, frame_slot.render_finished());
        assert_eq!(device.present_waits(), vec![image_slot.render_finished()]);
    }

    #[test]
    fn uniform_carries_camera_matrices() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);
        let camera = FixedCamera {
            view: Mat4::from_translation(Vec3::new(0.0, 0.0, -5.0)),
            projection: Mat4::from_scale(Vec3::splat(0.5)),
        };

        frames
            .render_frame(&mut scene, &camera, &ScriptedExtent::new(&[(800, 600)]))
            .unwrap();

        let slot = frames.swapchain().slot(0).unwrap();
        assert_eq!(
            device.buffer_contents(slot.uniform_buffer()),
            bytemuck::bytes_of(&CameraUniform::new(&camera, 800.0 / 600.0))
        );
    }

    #[test]
    fn stale_acquire_skips_frame_and_recreates() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);
        let source = ScriptedExtent::new(&[(1024, 768)]);

        device.script_acquire(AcquireOutcome::OutOfDate);
        let outcome = frames
            .render_frame(&mut scene, &FixedCamera::default(), &source)
            .unwrap();

        assert_eq!(outcome, FrameOutcome::SkippedStale);
        assert!(device.submissions().is_empty());
        assert!(device.presents().is_empty());
        assert_eq!(frames.swapchain().state(), SwapchainState::Ready);
        assert_eq!(frames.swapchain().extent(), Some(extent(1024, 768)));
        assert_eq!(frames.stats().recreations, 1);
        assert_eq!(frames.current_frame_index(), 0);

        assert!(matches!(
            frames.render_frame(&mut scene, &FixedCamera::default(), &source),
            Ok(FrameOutcome::Presented { .. })
        ));
    }

    #[test]
    fn stale_present_recreates_after_advancing() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);
        let source = ScriptedExtent::new(&[(0, 0), (640, 480)]);

        device.script_present(PresentOutcome::OutOfDate);
        let outcome = frames
            .render_frame(&mut scene, &FixedCamera::default(), &source)
            .unwrap();

        assert_eq!(outcome, FrameOutcome::SkippedStale);
        assert_eq!(device.submissions().len(), 1);
        assert_eq!(frames.current_frame_index(), 1);
        assert_eq!(frames.swapchain().extent(), Some(extent(640, 480)));
        assert_eq!(frames.stats().skipped, 1);
    }

    #[test]
    fn suboptimal_present_counts_as_presented() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);

        device.script_present(PresentOutcome::Suboptimal);
        let outcome = frames
            .render_frame(
                &mut scene,
                &FixedCamera::default(),
                &ScriptedExtent::new(&[(800, 600)]),
            )
            .unwrap();

        assert!(matches!(outcome, FrameOutcome::Presented { .. }));
        assert_eq!(frames.stats().recreations, 1);
    }

    #[test]
    fn failed_submission_drops_frame_and_recovers() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);
        let source = ScriptedExtent::new(&[(800, 600)]);
        let camera = FixedCamera::default();

        device.fail_next_submits(1);
        assert_eq!(
            frames.render_frame(&mut scene, &camera, &source).unwrap(),
            FrameOutcome::Dropped
        );
        assert!(device.presents().is_empty());
        assert_eq!(frames.swapchain().state(), SwapchainState::Stale);
        assert_eq!(frames.current_frame_index(), 1);

        assert!(matches!(
            frames.render_frame(&mut scene, &camera, &source).unwrap(),
            FrameOutcome::Presented { .. }
        ));
        let stats = frames.stats();
        assert_eq!((stats.dropped, stats.presented, stats.recreations), (1, 1, 1));
    }

    #[test]
    fn oversized_scene_is_rejected_without_deadlock() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 2);
        let (mut scene, a, _) = populated_scene(&device, 16);
        let source = ScriptedExtent::new(&[(800, 600)]);
        let camera = FixedCamera::default();

        assert!(matches!(
            frames.render_frame(&mut scene, &camera, &source),
            Err(RenderError::CapacityExceeded {
                requested: 3,
                capacity: 2
            })
        ));
        assert!(device.submissions().is_empty());

        scene.remove_instance(a, 0).unwrap();
        assert!(matches!(
            frames.render_frame(&mut scene, &camera, &source).unwrap(),
            FrameOutcome::Presented { instances: 2, .. }
        ));
    }

    #[test]
    fn retired_mesh_outlives_in_flight_frames() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, a, _) = populated_scene(&device, 16);
        let source = ScriptedExtent::new(&[(800, 600)]);
        let camera = FixedCamera::default();

        frames.render_frame(&mut scene, &camera, &source).unwrap();
        let mesh = scene.remove_mesh(a).unwrap();
        let vertex_buffer = mesh.vertex_buffer().handle;
        frames.retire_mesh(mesh);

        for _ in 0..3 {
            assert!(device.is_live(vertex_buffer));
            frames.render_frame(&mut scene, &camera, &source).unwrap();
        }
        assert!(!device.is_live(vertex_buffer));
        assert_eq!(frames.retired_meshes(), 0);
    }

    #[test]
    fn request_resize_rebuilds_on_next_frame() {
        let device = Arc::new(MockDevice::new());
        let mut frames = orchestrator(&device, 16);
        let (mut scene, _, _) = populated_scene(&device, 16);

        frames.request_resize();
        assert_eq!(frames.swapchain().state(), SwapchainState::Stale);
        frames
            .render_frame(
                &mut scene,
                &FixedCamera::default(),
                &ScriptedExtent::new(&[(1920, 1080)]),
            )
            .unwrap();

        assert_eq!(frames.swapchain().extent(), Some(extent(1920, 1080)));
        assert_eq!(frames.swapchain().ring_size(), 3);
    }

    #[test]
    fn shutdown_releases_every_object() {
        let device = Arc::new(MockDevice::new());
        {
            let mut frames = orchestrator(&device, 16);
            let (mut scene, _, b) = populated_scene(&device, 16);
            let source = ScriptedExtent::new(&[(800, 600)]);
            frames
                .render_frame(&mut scene, &FixedCamera::default(), &source)
                .unwrap();
            frames.retire_mesh(scene.remove_mesh(b).unwrap());
        }
        assert_eq!(device.live_objects(), 0);
    }
}
