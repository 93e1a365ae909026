//! A spinning grid of textured cubes drawn with one instanced call.
//!
//! WASD/Space/Shift move the camera, the mouse turns it, Escape quits.
//! Run with `cargo run --example instanced_grid --features shader_compilation`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use ash_instancing::prelude::*;
use glam::{Mat4, Vec3};
use winit::{
    application::ApplicationHandler,
    event::{DeviceEvent, DeviceId, ElementState, KeyEvent, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{KeyCode, PhysicalKey},
    window::{Window, WindowId},
};

const VERT_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/instanced.vert.spv"));
const FRAG_SPV: &[u8] = include_bytes!(concat!(env!("OUT_DIR"), "/instanced.frag.spv"));

const GRID_SIZE: i32 = 32;
const SPACING: f32 = 2.0;

// Fields drop top to bottom: the GPU work and its resources go before the
// pipeline, and the device goes last.
struct Demo {
    frames: FrameOrchestrator<AshDevice>,
    scene: InstancedScene<AshDevice>,
    _pipeline: GraphicsPipeline,
    _device: Arc<AshDevice>,
    window: Arc<Window>,
    camera: CameraController,
    cubes: MeshId,
    last_frame: Instant,
}

impl Demo {
    fn new(window: Arc<Window>) -> Result<Self> {
        let config = RendererConfig::default().with_max_instances((GRID_SIZE * GRID_SIZE) as u32);

        let instance = VulkanInstance::new(
            &WindowSurfaceProvider::new(window.clone()),
            config.enable_validation,
        )?;
        let device = Arc::new(AshDevice::new(instance)?);

        let pipeline = GraphicsPipeline::new(
            device.device().clone(),
            &PipelineDesc {
                vertex_spirv: VERT_SPV,
                fragment_spirv: FRAG_SPV,
                vertex_layout: VertexLayout::Vertex3D,
                color_format: config.preferred_surface_format.format,
                depth_format: config.depth_format,
            },
        )?;

        let frames = FrameOrchestrator::new(
            device.clone(),
            pipeline.frame_pipeline(),
            &config,
            window.current_extent(),
        )?;

        let texture_path = write_checker_texture()?;
        let texture = device.load_texture(&texture_path, pipeline.texture_set_layout())?;
        let (vertices, indices) = cube();
        let mesh = InstancedMesh::new(device.clone(), vertices, indices, Some(texture))?;

        let mut scene = InstancedScene::new(config.max_instances as usize);
        let cubes = scene.add_mesh(mesh)?;
        let offset = (GRID_SIZE - 1) as f32 * SPACING * 0.5;
        for x in 0..GRID_SIZE {
            for z in 0..GRID_SIZE {
                let position = Vec3::new(x as f32 * SPACING - offset, 0.0, z as f32 * SPACING - offset);
                scene.add_instance(cubes, Mat4::from_translation(position))?;
            }
        }
        log::info!("Scene ready with {} cubes", scene.instance_count());

        let camera = CameraController::new(Vec3::new(0.0, 12.0, 40.0)).look_at(Vec3::ZERO);

        Ok(Self {
            frames,
            scene,
            _pipeline: pipeline,
            _device: device,
            window,
            camera,
            cubes,
            last_frame: Instant::now(),
        })
    }

    fn redraw(&mut self) -> Result<()> {
        let now = Instant::now();
        let delta = now.duration_since(self.last_frame).as_secs_f32();
        self.last_frame = now;

        self.camera.update(delta);
        self.scene.rotate_all_instances(self.cubes, Vec3::Y, delta)?;

        match self
            .frames
            .render_frame(&mut self.scene, &self.camera, &self.window)?
        {
            FrameOutcome::Dropped => log::warn!("Frame dropped"),
            FrameOutcome::SkippedStale | FrameOutcome::Presented { .. } => {}
        }
        Ok(())
    }
}

fn write_checker_texture() -> Result<PathBuf> {
    let image = image::RgbaImage::from_fn(64, 64, |x, y| {
        if (x / 8 + y / 8) % 2 == 0 {
            image::Rgba([235, 235, 235, 255])
        } else {
            image::Rgba([60, 110, 200, 255])
        }
    });
    let path = std::env::temp_dir().join("ash_instancing_checker.png");
    image.save(&path)?;
    Ok(path)
}

#[derive(Default)]
struct App {
    demo: Option<Demo>,
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.demo.is_some() {
            return;
        }

        let attrs = Window::default_attributes()
            .with_title("ash_instancing - Instanced Grid")
            .with_inner_size(winit::dpi::LogicalSize::new(1280, 720));
        let window = match event_loop.create_window(attrs) {
            Ok(window) => Arc::new(window),
            Err(e) => {
                log::error!("Failed to create window: {e}");
                event_loop.exit();
                return;
            }
        };

        match Demo::new(window) {
            Ok(demo) => self.demo = Some(demo),
            Err(e) => {
                log::error!("Failed to initialize renderer: {e}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(demo) = &mut self.demo else {
            return;
        };

        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => event_loop.exit(),
            WindowEvent::KeyboardInput { event, .. } => demo.camera.handle_key_event(&event),
            WindowEvent::Resized(_) => demo.frames.request_resize(),
            WindowEvent::RedrawRequested => {
                if let Err(e) = demo.redraw() {
                    log::error!("Render error: {e}");
                    if e.is_fatal() {
                        event_loop.exit();
                        return;
                    }
                }
                demo.window.request_redraw();
            }
            _ => {}
        }
    }

    fn device_event(&mut self, _event_loop: &ActiveEventLoop, _id: DeviceId, event: DeviceEvent) {
        if let (Some(demo), DeviceEvent::MouseMotion { delta }) = (&mut self.demo, event) {
            demo.camera.handle_mouse_motion(delta);
        }
    }

    fn exiting(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(demo) = self.demo.take() {
            let stats = demo.frames.stats();
            log::info!(
                "Presented {} frames ({} skipped, {} dropped, {} swapchain rebuilds)",
                stats.presented,
                stats.skipped,
                stats.dropped,
                stats.recreations
            );
        }
    }
}

fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
    env_logger::init();

    let event_loop = EventLoop::new()?;
    event_loop.set_control_flow(ControlFlow::Poll);

    let mut app = App::default();
    event_loop.run_app(&mut app)?;

    Ok(())
}
