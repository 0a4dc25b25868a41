use std::time::{Duration, Instant};

/// Accumulated CPU-side frame timings and counters.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameProfiler {
    pub fence_wait_time: Duration,
    pub image_wait_time: Duration,
    pub uniform_refresh_time: Duration,
    pub record_time: Duration,
    pub submit_time: Duration,
    pub total_frame_time: Duration,

    pub frames: u64,
    pub stale_frames: u64,
    /// Frames that had to wait on another slot's fence before reusing an image.
    pub image_stalls: u64,
}

impl FrameProfiler {
    pub fn reset(&mut self) {
        *self = Self::default();
    }

    pub fn average_frame_time(&self) -> Duration {
        if self.frames == 0 {
            return Duration::ZERO;
        }
        self.total_frame_time / self.frames as u32
    }

    pub fn report(&self) {
        let total_us = self.total_frame_time.as_micros() as f32;
        if total_us < 1.0 {
            return;
        }

        log::debug!(
            "Frames: {}, stale: {}, image stalls: {}",
            self.frames,
            self.stale_frames,
            self.image_stalls
        );
        log::debug!(
            "Total: {:.2} ms (avg {:.3} ms)",
            self.total_frame_time.as_secs_f32() * 1000.0,
            self.average_frame_time().as_secs_f32() * 1000.0
        );

        let share = |d: Duration| (d.as_micros() as f32 / total_us) * 100.0;
        log::debug!(
            "  Fence wait:   {:.2} ms ({:.1}%)",
            self.fence_wait_time.as_secs_f32() * 1000.0,
            share(self.fence_wait_time)
        );
        log::debug!(
            "  Image wait:   {:.2} ms ({:.1}%)",
            self.image_wait_time.as_secs_f32() * 1000.0,
            share(self.image_wait_time)
        );
        log::debug!(
            "  Uniforms:     {:.2} ms ({:.1}%)",
            self.uniform_refresh_time.as_secs_f32() * 1000.0,
            share(self.uniform_refresh_time)
        );
        log::debug!(
            "  Recording:    {:.2} ms ({:.1}%)",
            self.record_time.as_secs_f32() * 1000.0,
            share(self.record_time)
        );
        log::debug!(
            "  Submit:       {:.2} ms ({:.1}%)",
            self.submit_time.as_secs_f32() * 1000.0,
            share(self.submit_time)
        );
    }
}

/// Adds the lifetime of the timer to `output` on drop.
pub struct SpanTimer<'a> {
    start: Instant,
    output: &'a mut Duration,
}

impl<'a> SpanTimer<'a> {
    pub fn new(output: &'a mut Duration) -> Self {
        Self {
            start: Instant::now(),
            output,
        }
    }
}

impl<'a> Drop for SpanTimer<'a> {
    fn drop(&mut self) {
        *self.output += self.start.elapsed();
    }
}
