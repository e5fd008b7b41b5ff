//! Request timing.

use log::{debug, warn};
use std::time::{Duration, Instant};

/// Measures one logical request, with named phases (admission, attempts).
#[derive(Debug)]
pub struct Timer {
    start_time: Instant,
    operation_name: String,
    checkpoints: Vec<(String, Instant)>,
}

impl Timer {
    pub fn start(operation_name: &str) -> Self {
        debug!("⏱️ Starting timer for: {}", operation_name);
        Self {
            start_time: Instant::now(),
            operation_name: operation_name.to_string(),
            checkpoints: Vec::new(),
        }
    }

    /// Add a checkpoint to track intermediate timing
    pub fn checkpoint(&mut self, checkpoint_name: &str) {
        let now = Instant::now();
        debug!(
            "📍 {} - {}: {}ms",
            self.operation_name,
            checkpoint_name,
            now.duration_since(self.start_time).as_millis()
        );
        self.checkpoints.push((checkpoint_name.to_string(), now));
    }

    pub fn elapsed(&self) -> Duration {
        self.start_time.elapsed()
    }

    /// Logs the phase breakdown and warns when the request ran past
    /// `threshold`.
    pub fn finish_with_threshold(self, threshold: Duration) -> Duration {
        let total = self.start_time.elapsed();

        let mut last_time = self.start_time;
        let phases: Vec<String> = self
            .checkpoints
            .iter()
            .map(|(name, time)| {
                let segment = time.duration_since(last_time);
                last_time = *time;
                format!("{} {}ms", name, segment.as_millis())
            })
            .collect();

        if phases.is_empty() {
            debug!("🕐 {} completed in {}ms", self.operation_name, total.as_millis());
        } else {
            debug!(
                "🕐 {} completed in {}ms ({})",
                self.operation_name,
                total.as_millis(),
                phases.join(", ")
            );
        }

        if total > threshold {
            warn!(
                "⚠️ {} took {}ms (exceeds threshold of {}ms)",
                self.operation_name,
                total.as_millis(),
                threshold.as_millis()
            );
        }
        total
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timer_reports_elapsed_time() {
        let mut timer = Timer::start("GET events.php");
        std::thread::sleep(Duration::from_millis(5));
        timer.checkpoint("admitted");
        let total = timer.finish_with_threshold(Duration::from_secs(10));
        assert!(total >= Duration::from_millis(5));
    }
}
