use log::{log_enabled, Level};
use std::time::{Duration, Instant};

use crate::sync::FrameSlot;

/// Traces how long a blocking section took and optionally warns when it
/// blocked for longer than expected.
pub struct ScopedTimer<'a> {
    label: &'a str,
    start: Instant,
    warn_after: Option<Duration>,
}

impl<'a> ScopedTimer<'a> {
    pub fn new(label: &'a str) -> Self {
        if log_enabled!(Level::Trace) {
            log::trace!("⏱️ waiting on {label}");
        }
        Self {
            label,
            start: Instant::now(),
            warn_after: None,
        }
    }

    /// Emits a warning on drop when the section took longer than `threshold`.
    pub fn warn_after(mut self, threshold: Duration) -> Self {
        self.warn_after = Some(threshold);
        self
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for ScopedTimer<'_> {
    fn drop(&mut self) {
        let elapsed = self.start.elapsed();
        match self.warn_after {
            Some(threshold) if elapsed > threshold => log::warn!(
                "{} blocked for {:.2} ms (threshold {:.2} ms)",
                self.label,
                elapsed.as_secs_f64() * 1000.0,
                threshold.as_secs_f64() * 1000.0
            ),
            _ if log_enabled!(Level::Trace) => {
                log::trace!("⏱️ {} done after {} µs", self.label, elapsed.as_micros());
            }
            _ => {}
        }
    }
}

/// Warns when the CPU side of the frame recorded on `slot` overran `budget_ms`.
pub fn warn_if_frame_budget_exceeded(slot: FrameSlot, duration: Duration, budget_ms: f32) {
    let elapsed_ms = duration.as_secs_f32() * 1000.0;
    if elapsed_ms > budget_ms {
        log::warn!("Frame on {slot} took {elapsed_ms:.2} ms, budget is {budget_ms:.2} ms");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_measures_its_scope() {
        let timer = ScopedTimer::new("test scope").warn_after(Duration::from_secs(60));
        std::thread::sleep(Duration::from_millis(2));
        assert!(timer.elapsed() >= Duration::from_millis(2));
    }
}
