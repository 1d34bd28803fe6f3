use std::time::Instant;

/// Milliseconds since boot, the time base `NodeRuntime::tick` schedules on.
#[derive(Debug, Clone, Copy)]
pub struct Uptime {
    booted: Instant,
}

impl Uptime {
    pub fn start() -> Self {
        Self {
            booted: Instant::now(),
        }
    }

    pub fn now_ms(&self) -> u64 {
        u64::try_from(self.booted.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
