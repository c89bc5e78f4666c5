// Free-fly camera
//
// Yaw/pitch from cursor deltas, WASD movement scaled by frame time.
// Projection is right-handed with Y flipped for Vulkan clip space.

use glam::{Mat4, Vec3};

use crate::scene::GpuCameraData;

const FOV_Y_DEGREES: f32 = 90.0;
const NEAR: f32 = 0.1;
const FAR: f32 = 2000.0;
const PITCH_LIMIT: f32 = 89.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Movement {
    Forward,
    Backward,
    Left,
    Right,
}

#[derive(Debug, Clone)]
pub struct Camera {
    pub position: Vec3,
    yaw: f32,
    pitch: f32,
    pub speed: f32,
    pub sensitivity: f32,
}

impl Camera {
    /// Camera at `position` looking down -Z.
    pub fn new(position: Vec3, speed: f32, sensitivity: f32) -> Self {
        Self {
            position,
            yaw: -90.0,
            pitch: 0.0,
            speed,
            sensitivity,
        }
    }

    pub fn front(&self) -> Vec3 {
        let (yaw, pitch) = (self.yaw.to_radians(), self.pitch.to_radians());
        Vec3::new(yaw.cos() * pitch.cos(), pitch.sin(), yaw.sin() * pitch.cos()).normalize()
    }

    fn right(&self) -> Vec3 {
        self.front().cross(Vec3::Y).normalize()
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.position, self.position + self.front(), Vec3::Y)
    }

    pub fn projection_matrix(&self, width: u32, height: u32) -> Mat4 {
        let aspect = width.max(1) as f32 / height.max(1) as f32;
        let mut projection = Mat4::perspective_rh(FOV_Y_DEGREES.to_radians(), aspect, NEAR, FAR);
        projection.y_axis.y *= -1.0;
        projection
    }

    /// Cursor deltas in pixels. Screen-space Y grows downward.
    pub fn process_mouse(&mut self, dx: f32, dy: f32) {
        self.yaw += dx * self.sensitivity;
        self.pitch = (self.pitch - dy * self.sensitivity).clamp(-PITCH_LIMIT, PITCH_LIMIT);
    }

    pub fn process_movement(&mut self, movement: Movement, dt: f32) {
        let step = self.speed * dt;
        match movement {
            Movement::Forward => self.position += self.front() * step,
            Movement::Backward => self.position -= self.front() * step,
            Movement::Left => self.position -= self.right() * step,
            Movement::Right => self.position += self.right() * step,
        }
    }

    pub fn gpu_data(&self, width: u32, height: u32) -> GpuCameraData {
        let view = self.view_matrix();
        let projection = self.projection_matrix(width, height);
        GpuCameraData {
            view,
            projection,
            viewproj: projection * view,
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::new(Vec3::new(0.0, 2.0, 8.0), 5.0, 0.1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn close(a: Vec3, b: Vec3) -> bool {
        (a - b).length() < 1e-4
    }

    #[test]
    fn starts_looking_down_negative_z() {
        let camera = Camera::new(Vec3::ZERO, 5.0, 0.1);
        assert!(close(camera.front(), Vec3::NEG_Z));
    }

    #[test]
    fn pitch_is_clamped() {
        let mut camera = Camera::default();
        camera.process_mouse(0.0, -100_000.0);
        assert!(camera.front().y > 0.99);
        assert!(camera.front().y < 1.0);
    }

    #[test]
    fn forward_moves_by_speed_times_dt() {
        let mut camera = Camera::new(Vec3::ZERO, 5.0, 0.1);
        camera.process_movement(Movement::Forward, 0.5);
        assert!(close(camera.position, Vec3::new(0.0, 0.0, -2.5)));

        camera.process_movement(Movement::Right, 0.2);
        assert!(close(camera.position, Vec3::new(1.0, 0.0, -2.5)));
    }

    #[test]
    fn projection_flips_y_and_survives_zero_height() {
        let camera = Camera::default();
        assert!(camera.projection_matrix(1280, 720).y_axis.y < 0.0);
        assert!(camera.projection_matrix(1280, 0).is_finite());
    }

    #[test]
    fn viewproj_is_projection_times_view() {
        let camera = Camera::default();
        let data = camera.gpu_data(800, 600);
        let expected = data.projection * data.view;
        assert!(data.viewproj.abs_diff_eq(expected, 1e-6));
    }
}
