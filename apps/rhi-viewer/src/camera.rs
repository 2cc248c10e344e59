use glam::{Mat4, Vec3};

/// Direction keys held this frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MoveInput {
    pub forward: bool,
    pub back: bool,
    pub left: bool,
    pub right: bool,
    pub up: bool,
    pub down: bool,
    pub fast: bool,
}

/// Free-flying perspective camera driven by WASD and mouse look.
#[derive(Debug, Clone)]
pub struct FlyCamera {
    pub position: Vec3,
    pub yaw: f32,
    pub pitch: f32,
    pub fov: f32,
    pub aspect: f32,
    pub near: f32,
    pub far: f32,
    pub speed: f32,
    pub sensitivity: f32,
}

impl Default for FlyCamera {
    fn default() -> Self {
        Self {
            position: Vec3::new(0.0, 6.0, 14.0),
            yaw: -90.0_f32.to_radians(),
            pitch: -20.0_f32.to_radians(),
            fov: 60.0_f32.to_radians(),
            aspect: 16.0 / 9.0,
            near: 0.1,
            far: 500.0,
            speed: 8.0,
            sensitivity: 0.003,
        }
    }
}

impl FlyCamera {
    pub fn forward(&self) -> Vec3 {
        Vec3::new(
            self.yaw.cos() * self.pitch.cos(),
            self.pitch.sin(),
            self.yaw.sin() * self.pitch.cos(),
        )
        .normalize()
    }

    pub fn right(&self) -> Vec3 {
        self.forward().cross(Vec3::Y).normalize()
    }

    /// Moves along the view axes; opposing keys cancel.
    pub fn advance(&mut self, input: MoveInput, dt: f32) {
        let axis = |pos: bool, neg: bool| pos as i32 as f32 - neg as i32 as f32;
        let direction = self.forward() * axis(input.forward, input.back)
            + self.right() * axis(input.right, input.left)
            + Vec3::Y * axis(input.up, input.down);
        if direction == Vec3::ZERO {
            return;
        }
        let boost = if input.fast { 3.0 } else { 1.0 };
        self.position += direction.normalize() * self.speed * boost * dt;
    }

    pub fn rotate(&mut self, dx: f32, dy: f32) {
        let limit = 89.0_f32.to_radians();
        self.yaw += dx * self.sensitivity;
        self.pitch = (self.pitch - dy * self.sensitivity).clamp(-limit, limit);
    }

    pub fn set_viewport(&mut self, width: u32, height: u32) {
        self.aspect = width.max(1) as f32 / height.max(1) as f32;
    }

    pub fn view_projection(&self) -> Mat4 {
        let view = Mat4::look_at_rh(self.position, self.position + self.forward(), Vec3::Y);
        Mat4::perspective_rh(self.fov, self.aspect, self.near, self.far) * view
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_camera_looks_down_negative_z() {
        let cam = FlyCamera::default();
        let fwd = cam.forward();
        assert!(fwd.z < 0.0);
        assert!(fwd.y < 0.0);
    }

    #[test]
    fn opposing_keys_cancel() {
        let mut cam = FlyCamera::default();
        let start = cam.position;
        cam.advance(
            MoveInput {
                forward: true,
                back: true,
                ..Default::default()
            },
            1.0,
        );
        assert_eq!(cam.position, start);
    }

    #[test]
    fn diagonal_moves_at_nominal_speed() {
        let mut cam = FlyCamera::default();
        let start = cam.position;
        cam.advance(
            MoveInput {
                forward: true,
                right: true,
                ..Default::default()
            },
            0.5,
        );
        let travelled = (cam.position - start).length();
        assert!((travelled - cam.speed * 0.5).abs() < 1e-4);
    }

    #[test]
    fn pitch_is_clamped() {
        let mut cam = FlyCamera::default();
        cam.rotate(0.0, -100_000.0);
        assert!(cam.pitch <= 89.0_f32.to_radians() + f32::EPSILON);
    }

    #[test]
    fn aspect_follows_viewport() {
        let mut cam = FlyCamera::default();
        cam.set_viewport(800, 400);
        assert_eq!(cam.aspect, 2.0);
        cam.set_viewport(100, 0);
        assert_eq!(cam.aspect, 100.0);
    }
}
