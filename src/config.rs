//! Global configuration constants and runtime configuration for the engine core.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

/// Default number of frames the CPU may record ahead of the GPU.
pub const MAX_FRAMES_IN_FLIGHT: usize = 2;

/// Upper bound accepted for `frames_in_flight`.
pub const FRAMES_IN_FLIGHT_LIMIT: usize = 8;

/// Fence waits longer than this are logged as warnings.
pub const SLOW_FENCE_WAIT: Duration = Duration::from_millis(250);

/// Size of the shader-visible texture array.
pub const TEXTURES_MAX: usize = 4096;

/// Frame-frequency set: sampled texture array binding.
pub const PER_FRAME_TEXTURE_ARRAY_BINDING: u32 = 0;

/// Frame-frequency set: sampler binding.
pub const PER_FRAME_SAMPLER_BINDING: u32 = 1;

/// Frame-frequency set: global uniform block binding.
pub const PER_FRAME_UBO_BINDING: u32 = 2;

/// Object-frequency set: model uniform block binding.
pub const PER_OBJECT_UBO_BINDING: u32 = 0;

/// Opaque yellow, substituted for missing or unassigned textures.
pub const DEFAULT_PLACEHOLDER_COLOR: [u8; 4] = [255, 255, 0, 255];

/// Edge length of the placeholder image in texels.
pub const DEFAULT_PLACEHOLDER_EXTENT: u32 = 500;

/// Distance travelled per movement command.
pub const DEFAULT_CAMERA_SPEED: f32 = 0.05;

/// Degrees of rotation per unit of cursor movement.
pub const DEFAULT_MOUSE_SENSITIVITY: f32 = 0.5;

/// Maximum absolute pitch in degrees.
pub const DEFAULT_PITCH_LIMIT_DEGREES: f32 = 89.0;

/// Default vertical field of view in degrees.
pub const DEFAULT_FOV_Y_DEGREES: f32 = 45.0;

pub const DEFAULT_NEAR_PLANE: f32 = 0.1;
pub const DEFAULT_FAR_PLANE: f32 = 100.0;

/// Initial camera position (Y-up, looking down -Z).
pub const DEFAULT_CAMERA_POSITION: [f32; 3] = [0.0, 0.0, 5.0];

/// Camera and projection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub position: [f32; 3],
    pub speed: f32,
    pub sensitivity: f32,
    pub fov_y_degrees: f32,
    pub aspect_ratio: f32,
    pub near: f32,
    pub far: f32,
    pub pitch_limit_degrees: f32,
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            position: DEFAULT_CAMERA_POSITION,
            speed: DEFAULT_CAMERA_SPEED,
            sensitivity: DEFAULT_MOUSE_SENSITIVITY,
            fov_y_degrees: DEFAULT_FOV_Y_DEGREES,
            aspect_ratio: 16.0 / 9.0,
            near: DEFAULT_NEAR_PLANE,
            far: DEFAULT_FAR_PLANE,
            pitch_limit_degrees: DEFAULT_PITCH_LIMIT_DEGREES,
        }
    }
}

/// Runtime configuration shared by every subsystem.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Number of frame slots (K).
    pub frames_in_flight: usize,
    /// Capacity of the bindless texture table, including the sentinel slot.
    pub textures_max: usize,
    /// `None` blocks until the fence signals; expiry of a finite timeout is fatal.
    pub fence_timeout_ms: Option<u64>,
    pub acquire_timeout_ms: Option<u64>,
    /// Skip re-writing the texture array into a binding table when the
    /// registry has not grown since that table was last refreshed.
    pub skip_unchanged_texture_rebinds: bool,
    pub placeholder_color: [u8; 4],
    pub placeholder_extent: u32,
    pub camera: CameraConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            frames_in_flight: MAX_FRAMES_IN_FLIGHT,
            textures_max: TEXTURES_MAX,
            fence_timeout_ms: None,
            acquire_timeout_ms: None,
            skip_unchanged_texture_rebinds: false,
            placeholder_color: DEFAULT_PLACEHOLDER_COLOR,
            placeholder_extent: DEFAULT_PLACEHOLDER_EXTENT,
            camera: CameraConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.frames_in_flight == 0 || self.frames_in_flight > FRAMES_IN_FLIGHT_LIMIT {
            return Err(EngineError::InvalidConfig(format!(
                "frames_in_flight must be in 1..={FRAMES_IN_FLIGHT_LIMIT}, got {}",
                self.frames_in_flight
            )));
        }
        if self.textures_max < 2 {
            return Err(EngineError::InvalidConfig(format!(
                "textures_max must leave room for the placeholder slot, got {}",
                self.textures_max
            )));
        }
        if self.placeholder_extent == 0 {
            return Err(EngineError::InvalidConfig(
                "placeholder_extent must be non-zero".into(),
            ));
        }

        let camera = &self.camera;
        if camera.aspect_ratio <= 0.0 || camera.fov_y_degrees <= 0.0 {
            return Err(EngineError::InvalidConfig(format!(
                "camera projection requires positive fov and aspect, got fov={} aspect={}",
                camera.fov_y_degrees, camera.aspect_ratio
            )));
        }
        if camera.near <= 0.0 || camera.far <= camera.near {
            return Err(EngineError::InvalidConfig(format!(
                "camera clip planes must satisfy 0 < near < far, got near={} far={}",
                camera.near, camera.far
            )));
        }
        if !(0.0..90.0).contains(&camera.pitch_limit_degrees) {
            return Err(EngineError::InvalidConfig(format!(
                "pitch limit must be below 90 degrees, got {}",
                camera.pitch_limit_degrees
            )));
        }
        Ok(())
    }

    pub fn fence_timeout(&self) -> Option<Duration> {
        self.fence_timeout_ms.map(Duration::from_millis)
    }

    pub fn acquire_timeout(&self) -> Option<Duration> {
        self.acquire_timeout_ms.map(Duration::from_millis)
    }
}
