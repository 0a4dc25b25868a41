//! Error types for the engine core.
//!
//! [`EngineError`] covers capacity, device/sync and configuration failures, all
//! of which are fatal. Texture decode failures use [`DecodeError`] and are
//! recovered inside the texture registry. A stale presentation surface is not
//! an error at all; see [`crate::gpu::AcquireOutcome`].

use std::time::Duration;

use ash::vk;
use thiserror::Error;

/// Main error type for the engine core.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The bindless texture table is full. Raise `textures_max`.
    #[error("texture capacity exceeded: slot {slot} requested, {capacity} slots configured")]
    TextureCapacityExceeded { slot: usize, capacity: usize },
    /// A fence did not signal within the configured timeout.
    #[error("fence wait timed out after {timeout:?}")]
    FenceTimeout { timeout: Duration },
    #[error("device lost")]
    DeviceLost,
    #[error("queue submission failed: {0}")]
    SubmitFailed(String),
    #[error("presentation failed: {0}")]
    PresentFailed(String),
    #[error("GPU allocation failed: {0}")]
    Allocation(String),
    #[error("texture upload failed: {0}")]
    Upload(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Vulkan error: {0}")]
    Vulkan(#[from] vk::Result),
}

impl EngineError {
    /// Whether the frame loop must terminate on this error.
    ///
    /// Every variant is fatal: failed submissions are never retried because
    /// command buffers cannot be resubmitted without re-recording.
    pub fn is_fatal(&self) -> bool {
        true
    }

    /// Whether the error indicates the device is gone (timeouts included).
    pub fn is_device_loss(&self) -> bool {
        matches!(
            self,
            Self::DeviceLost
                | Self::FenceTimeout { .. }
                | Self::Vulkan(vk::Result::ERROR_DEVICE_LOST)
        )
    }
}

/// Failure to turn a resource key into pixels.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("no image for key `{0}`")]
    NotFound(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported or corrupt image: {0}")]
    Format(String),
    #[error("invalid dimensions {width}x{height} for {len} bytes of RGBA data")]
    InvalidDimensions { width: u32, height: u32, len: usize },
}

impl From<image::ImageError> for DecodeError {
    fn from(err: image::ImageError) -> Self {
        match err {
            image::ImageError::IoError(io) => Self::Io(io),
            other => Self::Format(other.to_string()),
        }
    }
}

/// Convenient Result type alias for engine operations.
pub type Result<T> = std::result::Result<T, EngineError>;
