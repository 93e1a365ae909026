use std::collections::HashSet;
use std::f32::consts::{FRAC_PI_2, TAU};

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use winit::event::{ElementState, KeyEvent};
use winit::keyboard::{KeyCode, PhysicalKey};

/// Supplies the view and projection matrices for a frame.
pub trait CameraSource {
    fn view_matrix(&self) -> Mat4;
    /// Projection for a target with the given width / height ratio, already
    /// in Vulkan clip space (Y down, depth 0..1).
    fn projection_matrix(&self, aspect_ratio: f32) -> Mat4;
}

/// Layout of the per-frame uniform buffer (set 0, binding 0).
#[repr(C)]
#[derive(Clone, Copy, Debug, PartialEq, Pod, Zeroable)]
pub struct CameraUniform {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
}

impl CameraUniform {
    pub fn new(camera: &dyn CameraSource, aspect_ratio: f32) -> Self {
        let view = camera.view_matrix();
        let projection = camera.projection_matrix(aspect_ratio);
        Self {
            view,
            projection,
            view_projection: projection * view,
        }
    }
}

impl Default for CameraUniform {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
            view_projection: Mat4::IDENTITY,
        }
    }
}

/// Camera with fixed matrices. The projection ignores the aspect ratio.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct FixedCamera {
    pub view: Mat4,
    pub projection: Mat4,
}

impl Default for FixedCamera {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

impl CameraSource for FixedCamera {
    fn view_matrix(&self) -> Mat4 {
        self.view
    }

    fn projection_matrix(&self, _aspect_ratio: f32) -> Mat4 {
        self.projection
    }
}

/// First-person camera driven by keyboard and mouse events.
///
/// WASD moves in the look direction, Space and Shift move along world Y,
/// mouse motion changes yaw and pitch.
pub struct CameraController {
    pub position: Vec3,
    /// Radians around world Y. Zero looks down -Z.
    pub yaw: f32,
    /// Radians, clamped short of straight up or down.
    pub pitch: f32,
    pub fov_y: f32,
    pub near: f32,
    pub far: f32,
    /// World units per second.
    pub speed: f32,
    pub mouse_sensitivity: f32,

    keys_pressed: HashSet<KeyCode>,
    mouse_delta: (f32, f32),
}

impl CameraController {
    pub fn new(position: Vec3) -> Self {
        Self {
            position,
            yaw: 0.0,
            pitch: 0.0,
            fov_y: 60f32.to_radians(),
            near: 0.1,
            far: 500.0,
            speed: 5.0,
            mouse_sensitivity: 0.003,
            keys_pressed: HashSet::new(),
            mouse_delta: (0.0, 0.0),
        }
    }

    /// Turns the camera to face `target`.
    pub fn look_at(mut self, target: Vec3) -> Self {
        let direction = (target - self.position).normalize_or_zero();
        if direction != Vec3::ZERO {
            self.yaw = (-direction.x).atan2(-direction.z);
            self.pitch = direction.y.asin().clamp(-Self::MAX_PITCH, Self::MAX_PITCH);
        }
        self
    }

    const MAX_PITCH: f32 = FRAC_PI_2 - 0.1;

    pub fn handle_key_event(&mut self, event: &KeyEvent) {
        let PhysicalKey::Code(code) = event.physical_key else {
            return;
        };
        match event.state {
            ElementState::Pressed => {
                self.keys_pressed.insert(code);
            }
            ElementState::Released => {
                self.keys_pressed.remove(&code);
            }
        }
    }

    /// Accumulates raw mouse motion until the next [`update`](Self::update).
    pub fn handle_mouse_motion(&mut self, delta: (f64, f64)) {
        self.mouse_delta.0 += delta.0 as f32;
        self.mouse_delta.1 += delta.1 as f32;
    }

    pub fn update(&mut self, delta_time: f32) {
        let (dx, dy) = std::mem::take(&mut self.mouse_delta);
        if dx != 0.0 || dy != 0.0 {
            self.yaw = (self.yaw - dx * self.mouse_sensitivity).rem_euclid(TAU);
            self.pitch = (self.pitch - dy * self.mouse_sensitivity)
                .clamp(-Self::MAX_PITCH, Self::MAX_PITCH);
        }

        let mut local = Vec3::ZERO;
        for key in &self.keys_pressed {
            match key {
                KeyCode::KeyW => local.z += 1.0,
                KeyCode::KeyS => local.z -= 1.0,
                KeyCode::KeyD => local.x += 1.0,
                KeyCode::KeyA => local.x -= 1.0,
                KeyCode::Space => local.y += 1.0,
                KeyCode::ShiftLeft | KeyCode::ShiftRight => local.y -= 1.0,
                _ => {}
            }
        }

        if local != Vec3::ZERO {
            let local = local.normalize();
            let movement = self.forward() * local.z + self.right() * local.x + Vec3::Y * local.y;
            self.position += movement * self.speed * delta_time;
        }
    }

    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            -self.yaw.sin() * self.pitch.cos(),
            self.pitch.sin(),
            -self.yaw.cos() * self.pitch.cos(),
        )
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize_or_zero()
    }
}

impl CameraSource for CameraController {
    fn view_matrix(&self) -> Mat4 {
        Mat4::look_to_rh(self.position, self.forward(), Vec3::Y)
    }

    fn projection_matrix(&self, aspect_ratio: f32) -> Mat4 {
        let mut projection = Mat4::perspective_rh(self.fov_y, aspect_ratio, self.near, self.far);
        projection.y_axis.y *= -1.0;
        projection
    }
}
