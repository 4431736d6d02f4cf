use std::time::Duration;

/// Driver tuning parameters shared by the queue pool and every player.
#[derive(Clone, Debug)]
pub struct DriverConfig {
    /// Audio held by one hardware buffer. The staging target per player is
    /// twice this.
    pub buffer_duration: Duration,
    /// Fixed buffer complement allocated per queue.
    pub buffers_per_queue: usize,
    /// Maximum queues resident in the pool, idle and lent out combined;
    /// a release that would exceed this tears the queue down instead of
    /// caching it.
    pub pool_capacity: usize,
    /// Delay between prime retries while the device reports busy.
    pub prime_retry_delay: Duration,
    /// Prime retries before the busy condition is treated as terminal.
    pub prime_retry_attempts: usize,
}

impl Default for DriverConfig {
    /// Defaults matched to two quarter-second buffers per queue, which keeps
    /// restart latency low without starving slow sources.
    fn default() -> Self {
        Self {
            buffer_duration: Duration::from_millis(250),
            buffers_per_queue: 2,
            pool_capacity: 32,
            prime_retry_delay: Duration::from_millis(10),
            prime_retry_attempts: 100,
        }
    }
}
