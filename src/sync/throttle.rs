use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Enforces a minimum spacing between remote requests across all tasks
/// sharing it.
#[derive(Debug)]
pub struct Throttle {
    min_interval: Duration,
    next_slot: Mutex<Option<Instant>>,
}

impl Throttle {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            next_slot: Mutex::new(None),
        }
    }

    /// Wait for the next free slot and claim it.
    pub async fn wait(&self) {
        if self.min_interval.is_zero() {
            return;
        }
        let mut next = self.next_slot.lock().await;
        if let Some(slot) = *next {
            tokio::time::sleep_until(slot).await;
        }
        *next = Some(Instant::now() + self.min_interval);
    }
}
