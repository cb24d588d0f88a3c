//! Global byte-rate throttle shared by the workers of one downloader

use parking_lot::Mutex;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;

const WINDOW: Duration = Duration::from_secs(1);

#[derive(Debug, Clone)]
pub struct BandwidthController {
    limit: Option<u64>,
    state: Arc<Mutex<BandwidthState>>,
}

#[derive(Debug)]
struct BandwidthState {
    window_start: Instant,
    bytes_in_window: u64,
}

impl BandwidthState {
    fn new() -> Self {
        Self {
            window_start: Instant::now(),
            bytes_in_window: 0,
        }
    }
}

impl BandwidthController {
    /// `limit` is in bytes per second; `None` disables throttling
    pub fn new(limit: Option<u64>) -> Self {
        Self {
            limit: limit.filter(|l| *l > 0),
            state: Arc::new(Mutex::new(BandwidthState::new())),
        }
    }

    pub fn unlimited() -> Self {
        Self::new(None)
    }

    pub fn limit(&self) -> Option<u64> {
        self.limit
    }

    /// Account for `bytes` just received and wait if the window is over budget
    pub async fn throttle(&self, bytes: u64) {
        let Some(limit) = self.limit else {
            return;
        };

        let wait = {
            let mut state = self.state.lock();
            if state.window_start.elapsed() >= WINDOW {
                state.window_start = Instant::now();
                state.bytes_in_window = 0;
            }
            state.bytes_in_window += bytes;

            let earliest = Duration::from_secs_f64(state.bytes_in_window as f64 / limit as f64);
            earliest.checked_sub(state.window_start.elapsed())
        };

        if let Some(wait) = wait.filter(|w| !w.is_zero()) {
            sleep(wait).await;
        }
    }
}

impl Default for BandwidthController {
    fn default() -> Self {
        Self::unlimited()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_unlimited_never_waits() {
        let controller = BandwidthController::unlimited();
        let started = Instant::now();
        for _ in 0..100 {
            controller.throttle(1024 * 1024).await;
        }
        assert!(started.elapsed() < Duration::from_millis(100));
    }

    #[tokio::test]
    async fn test_limit_delays_over_budget() {
        let controller = BandwidthController::new(Some(10_000));
        let started = Instant::now();

        controller.throttle(5_000).await;
        controller.throttle(5_000).await;
        controller.throttle(2_000).await;

        assert!(started.elapsed() >= Duration::from_millis(1100));
    }

    #[test]
    fn test_zero_limit_is_unlimited() {
        assert_eq!(BandwidthController::new(Some(0)).limit(), None);
    }
}
