//! Outbound request pacing.
//!
//! Brokers throttle request rates per session. A pacer hands out send
//! slots at least `min_interval` apart, in arrival order (tokio's mutex
//! is fair), so a batch of N requests is drained one at a time.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::trace;

#[derive(Debug)]
pub struct RequestPacer {
    name: &'static str,
    min_interval: Duration,
    last_slot: Mutex<Option<Instant>>,
}

impl RequestPacer {
    pub fn new(name: &'static str, min_interval: Duration) -> Self {
        Self {
            name,
            min_interval,
            last_slot: Mutex::new(None),
        }
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }

    /// Wait for the next send slot.
    pub async fn acquire(&self) {
        let mut last = self.last_slot.lock().await;
        if let Some(prev) = *last {
            let next = prev + self.min_interval;
            if next > Instant::now() {
                trace!(pacer = self.name, "waiting for send slot");
                sleep_until(next).await;
            }
        }
        *last = Some(Instant::now());
    }
}
