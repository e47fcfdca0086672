//! Heartbeat-style [`Watchdog`].
//!
//! Records when it was last petted so a supervisor can tell a hung listener
//! from an idle one.

use crate::service::collaborators::Watchdog;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

#[derive(Debug)]
pub struct Heartbeat {
    created: Instant,
    /// Milliseconds since `created` at the last pet.
    last_pet_ms: AtomicU64,
    pets: AtomicU64,
}

impl Heartbeat {
    pub fn new() -> Self {
        Self {
            created: Instant::now(),
            last_pet_ms: AtomicU64::new(0),
            pets: AtomicU64::new(0),
        }
    }

    pub fn pet_count(&self) -> u64 {
        self.pets.load(Ordering::Relaxed)
    }

    /// Time since the last pet (or since creation if never petted).
    pub fn since_last_pet(&self) -> Duration {
        let last = Duration::from_millis(self.last_pet_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last)
    }

    /// Whether the watchdog was petted within `interval`.
    pub fn is_alive(&self, interval: Duration) -> bool {
        self.since_last_pet() <= interval
    }
}

impl Default for Heartbeat {
    fn default() -> Self {
        Self::new()
    }
}

impl Watchdog for Heartbeat {
    fn pet(&self) {
        let now = self.created.elapsed().as_millis() as u64;
        self.last_pet_ms.store(now, Ordering::Relaxed);
        self.pets.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pet_updates_liveness() {
        let heartbeat = Heartbeat::new();
        assert_eq!(heartbeat.pet_count(), 0);
        std::thread::sleep(Duration::from_millis(30));
        assert!(!heartbeat.is_alive(Duration::from_millis(10)));
        heartbeat.pet();
        assert_eq!(heartbeat.pet_count(), 1);
        assert!(heartbeat.is_alive(Duration::from_millis(10)));
    }
}
