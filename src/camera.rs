//! Shared camera state.
//!
//! Written from the input context at arbitrary frequency and read once per frame
//! by the render context. Position, facing and up feed the same view matrix, so
//! they live behind a single reader/writer lock and are always observed as a set.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use parking_lot::RwLock;

use crate::config::CameraConfig;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MoveDirection {
    Forward,
    Backward,
    Left,
    Right,
}

/// A consistent copy of the camera's orientation data. Angles are in degrees.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraPose {
    pub position: Vec3,
    pub facing: Vec3,
    pub up: Vec3,
    pub yaw: f32,
    pub pitch: f32,
}

/// Camera matrices as laid out in the per-frame uniform block.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ViewProjection {
    pub view: Mat4,
    pub projection: Mat4,
}

impl Default for ViewProjection {
    fn default() -> Self {
        Self {
            view: Mat4::IDENTITY,
            projection: Mat4::IDENTITY,
        }
    }
}

#[derive(Debug)]
struct CameraInner {
    pose: CameraPose,
    last_cursor: Option<(f64, f64)>,
    projection: Mat4,
    fov_y_degrees: f32,
    near: f32,
    far: f32,
}

/// Perspective projection for Vulkan clip space (Y pointing down).
fn vulkan_perspective(fov_y_degrees: f32, aspect: f32, near: f32, far: f32) -> Mat4 {
    let mut proj = Mat4::perspective_rh(fov_y_degrees.to_radians(), aspect, near, far);
    proj.y_axis.y *= -1.0;
    proj
}

fn facing_from_angles(yaw: f32, pitch: f32) -> Vec3 {
    let (yaw, pitch) = (yaw.to_radians(), pitch.to_radians());
    Vec3::new(
        yaw.cos() * pitch.cos(),
        pitch.sin(),
        yaw.sin() * pitch.cos(),
    )
    .normalize()
}

pub struct CameraState {
    inner: RwLock<CameraInner>,
    speed: f32,
    sensitivity: f32,
    pitch_limit: f32,
}

impl CameraState {
    /// Starts at `config.position` looking down -Z (yaw -90°, pitch 0°).
    pub fn new(config: &CameraConfig) -> Self {
        let yaw = -90.0;
        let pitch = 0.0;
        let pose = CameraPose {
            position: Vec3::from_array(config.position),
            facing: facing_from_angles(yaw, pitch),
            up: Vec3::Y,
            yaw,
            pitch,
        };

        Self {
            inner: RwLock::new(CameraInner {
                pose,
                last_cursor: None,
                projection: vulkan_perspective(
                    config.fov_y_degrees,
                    config.aspect_ratio,
                    config.near,
                    config.far,
                ),
                fov_y_degrees: config.fov_y_degrees,
                near: config.near,
                far: config.far,
            }),
            speed: config.speed,
            sensitivity: config.sensitivity,
            pitch_limit: config.pitch_limit_degrees,
        }
    }

    fn rotate(&self, pose: &mut CameraPose, dx: f32, dy: f32) {
        pose.yaw += dx * self.sensitivity;
        pose.pitch = (pose.pitch + dy * self.sensitivity).clamp(-self.pitch_limit, self.pitch_limit);
        pose.facing = facing_from_angles(pose.yaw, pose.pitch);
    }

    /// Applies a relative cursor delta. Positive `dx` turns right, positive `dy`
    /// looks up.
    pub fn on_mouse_move(&self, dx: f32, dy: f32) {
        let mut inner = self.inner.write();
        self.rotate(&mut inner.pose, dx, dy);
    }

    /// Applies an absolute cursor position in window coordinates. The first
    /// event only records the position.
    pub fn on_cursor_moved(&self, x: f64, y: f64) {
        let mut inner = self.inner.write();
        let Some((last_x, last_y)) = inner.last_cursor.replace((x, y)) else {
            return;
        };
        // Window y grows downward.
        let dx = (x - last_x) as f32;
        let dy = (last_y - y) as f32;
        self.rotate(&mut inner.pose, dx, dy);
    }

    pub fn on_move_command(&self, direction: MoveDirection) {
        let mut inner = self.inner.write();
        let pose = &mut inner.pose;
        let right = pose.facing.cross(pose.up).normalize();
        let step = match direction {
            MoveDirection::Forward => pose.facing,
            MoveDirection::Backward => -pose.facing,
            MoveDirection::Right => right,
            MoveDirection::Left => -right,
        };
        pose.position += step * self.speed;
    }

    /// View and projection for the current pose, computed under the shared lock.
    pub fn snapshot_view_projection(&self) -> ViewProjection {
        let inner = self.inner.read();
        let pose = &inner.pose;
        ViewProjection {
            view: Mat4::look_at_rh(pose.position, pose.position + pose.facing, pose.up),
            projection: inner.projection,
        }
    }

    pub fn pose(&self) -> CameraPose {
        self.inner.read().pose
    }

    /// Replaces position and orientation in one write. Pitch is clamped.
    pub fn set_pose(&self, position: Vec3, yaw: f32, pitch: f32) {
        let pitch = pitch.clamp(-self.pitch_limit, self.pitch_limit);
        let mut inner = self.inner.write();
        inner.pose.position = position;
        inner.pose.yaw = yaw;
        inner.pose.pitch = pitch;
        inner.pose.facing = facing_from_angles(yaw, pitch);
    }

    /// Recomputes the projection, e.g. after the surface was resized.
    pub fn set_aspect_ratio(&self, aspect: f32) {
        let mut inner = self.inner.write();
        inner.projection = vulkan_perspective(inner.fov_y_degrees, aspect, inner.near, inner.far);
        log::debug!("Camera aspect ratio set to {aspect:.3}");
    }

    pub fn speed(&self) -> f32 {
        self.speed
    }

    pub fn sensitivity(&self) -> f32 {
        self.sensitivity
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    fn camera() -> CameraState {
        CameraState::new(&CameraConfig::default())
    }

    #[test]
    fn starts_looking_down_negative_z() {
        let pose = camera().pose();
        assert_relative_eq!(pose.facing.x, 0.0, epsilon = 1e-6);
        assert_relative_eq!(pose.facing.z, -1.0, epsilon = 1e-6);
        assert_eq!(pose.position, Vec3::new(0.0, 0.0, 5.0));
    }

    #[test]
    fn forward_moves_along_facing() {
        let camera = camera();
        camera.on_move_command(MoveDirection::Forward);
        let pose = camera.pose();
        assert_relative_eq!(pose.position.z, 5.0 - 0.05, epsilon = 1e-6);
    }

    #[test]
    fn right_strafes_towards_positive_x() {
        let camera = camera();
        camera.on_move_command(MoveDirection::Right);
        assert!(camera.pose().position.x > 0.0);
        camera.on_move_command(MoveDirection::Left);
        camera.on_move_command(MoveDirection::Left);
        assert!(camera.pose().position.x < 0.0);
    }

    #[test]
    fn positive_x_motion_turns_right() {
        let camera = camera();
        camera.on_mouse_move(10.0, 0.0);
        let pose = camera.pose();
        assert_relative_eq!(pose.yaw, -85.0, epsilon = 1e-4);
        assert!(pose.facing.x > 0.0);
    }

    #[test]
    fn first_cursor_event_only_seeds() {
        let camera = camera();
        camera.on_cursor_moved(400.0, 300.0);
        assert_relative_eq!(camera.pose().yaw, -90.0);

        // Moving the cursor up the window looks up.
        camera.on_cursor_moved(400.0, 280.0);
        assert_relative_eq!(camera.pose().pitch, 10.0, epsilon = 1e-4);
    }

    #[test]
    fn pitch_is_clamped_symmetrically() {
        let camera = camera();
        for _ in 0..100 {
            camera.on_mouse_move(0.0, 50.0);
        }
        assert_relative_eq!(camera.pose().pitch, 89.0);
        for _ in 0..100 {
            camera.on_mouse_move(0.0, -50.0);
        }
        assert_relative_eq!(camera.pose().pitch, -89.0);
    }

    #[test]
    fn projection_flips_y_for_vulkan() {
        let camera = camera();
        let vp = camera.snapshot_view_projection();
        assert!(vp.projection.y_axis.y < 0.0);

        camera.set_aspect_ratio(1.0);
        let square = camera.snapshot_view_projection();
        assert_relative_eq!(
            square.projection.x_axis.x,
            -square.projection.y_axis.y,
            epsilon = 1e-5
        );
    }

    #[test]
    fn uniform_block_layout() {
        assert_eq!(std::mem::size_of::<ViewProjection>(), 128);
    }
}
