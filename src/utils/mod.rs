//! Utility helpers: scoped logging timers and frame profiling.

pub mod logging;
pub mod profiling;

pub use logging::ScopedTimer;
pub use profiling::{FrameProfiler, SpanTimer};
