//! Driver context: one per process, owns the pool and the refill loop.

use std::io::Read;
use std::sync::Arc;

use anyhow::{Context as _, Result, anyhow};
use crossbeam_channel::Receiver;

use crate::config::DriverConfig;
use crate::engine::{AudioEngine, CompletionHandler, StreamFormat};
use crate::player::{Player, PlayerError};
use crate::pool::QueuePool;
use crate::scheduler::PlayerSet;

/// State shared between the context and every player it creates.
pub(crate) struct DriverShared {
    pub(crate) engine: Arc<dyn AudioEngine>,
    pub(crate) config: DriverConfig,
    pub(crate) one_buffer_size: usize,
    pub(crate) max_buffer_size: usize,
    pub(crate) pool: QueuePool,
    pub(crate) players: Arc<PlayerSet>,
}

/// Immutable per-process driver context for a fixed PCM format.
///
/// Construction pre-warms the queue pool, so the native allocation cost is
/// paid once up front instead of during playback.
pub struct Context {
    format: StreamFormat,
    pub(crate) shared: Arc<DriverShared>,
}

impl Context {
    /// Build a context over `engine`.
    ///
    /// `bytes_per_sample` must be 1 (unsigned 8-bit) or 2 (signed 16-bit
    /// little-endian). The returned receiver carries the backend ready
    /// signal; the engines in this crate satisfy it before returning, but
    /// callers written against slower backends should wait on it.
    pub fn new(
        engine: Arc<dyn AudioEngine>,
        sample_rate: u32,
        channel_count: u16,
        bytes_per_sample: u16,
        config: DriverConfig,
    ) -> Result<(Self, Receiver<()>)> {
        if sample_rate == 0 {
            return Err(anyhow!("sample rate must be non-zero"));
        }
        if channel_count == 0 {
            return Err(anyhow!("channel count must be non-zero"));
        }
        if !matches!(bytes_per_sample, 1 | 2) {
            return Err(anyhow!("unsupported bytes per sample: {bytes_per_sample}"));
        }
        if config.buffers_per_queue == 0 {
            return Err(anyhow!("buffers per queue must be non-zero"));
        }

        let format = StreamFormat {
            sample_rate,
            channel_count,
            bytes_per_sample,
        };
        let one_buffer_size = one_buffer_size(&format, &config);

        let players = PlayerSet::new();
        let router = players.clone();
        let on_complete: CompletionHandler = Arc::new(move |queue, buffer| {
            // A lookup miss means the owning player is already closed and
            // the queue disposed or repooled; the event is dropped.
            if let Some(player) = router.lookup(queue) {
                player.on_buffer_complete(queue, buffer);
            }
        });

        let pool = QueuePool::new(
            engine.clone(),
            format,
            one_buffer_size,
            config.buffers_per_queue,
            config.pool_capacity,
            on_complete,
        );
        pool.prewarm().context("pre-warming the queue pool")?;

        tracing::info!(
            sample_rate,
            channel_count,
            bytes_per_sample,
            one_buffer_size,
            pool_capacity = config.pool_capacity,
            "driver context ready"
        );

        let (ready_tx, ready) = crossbeam_channel::bounded(1);
        let _ = ready_tx.send(());

        let shared = Arc::new(DriverShared {
            engine,
            max_buffer_size: one_buffer_size * 2,
            one_buffer_size,
            config,
            pool,
            players,
        });
        Ok((Self { format, shared }, ready))
    }

    /// Create a player over `src`. It starts paused with no queue and
    /// borrows one from the pool on its first play.
    pub fn new_player(&self, src: Box<dyn Read + Send>) -> Player {
        Player::new(self.shared.clone(), src)
    }

    /// Pause every playing player, remembering the set for [`Self::resume`].
    pub fn suspend(&self) -> Result<(), PlayerError> {
        self.shared.players.suspend()
    }

    /// Restart exactly the players that were playing at suspend time.
    pub fn resume(&self) -> Result<(), PlayerError> {
        self.shared.players.resume()
    }

    pub fn format(&self) -> StreamFormat {
        self.format
    }

    /// Bytes held by one hardware buffer.
    pub fn one_buffer_size(&self) -> usize {
        self.shared.one_buffer_size
    }

    /// Bytes each player tries to keep staged across backlog and buffers.
    pub fn max_buffer_size(&self) -> usize {
        self.shared.max_buffer_size
    }
}

/// Size of one hardware buffer: the configured duration's worth of frames,
/// kept frame aligned.
fn one_buffer_size(format: &StreamFormat, config: &DriverConfig) -> usize {
    let frames =
        (u128::from(format.sample_rate) * config.buffer_duration.as_millis() / 1000) as usize;
    frames.max(1) * format.bytes_per_frame()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake_engine::FakeEngine;
    use std::time::Duration;

    #[test]
    fn buffer_sizes_follow_the_format() {
        let engine = FakeEngine::new();
        let config = DriverConfig {
            pool_capacity: 2,
            ..DriverConfig::default()
        };
        let (ctx, _ready) = Context::new(engine, 48_000, 2, 2, config).unwrap();
        // A quarter second of 48 kHz stereo 16-bit audio.
        assert_eq!(ctx.one_buffer_size(), 48_000);
        assert_eq!(ctx.max_buffer_size(), 96_000);
    }

    #[test]
    fn invalid_formats_are_rejected() {
        let config = DriverConfig {
            pool_capacity: 1,
            ..DriverConfig::default()
        };
        assert!(Context::new(FakeEngine::new(), 0, 2, 2, config.clone()).is_err());
        assert!(Context::new(FakeEngine::new(), 48_000, 0, 2, config.clone()).is_err());
        assert!(Context::new(FakeEngine::new(), 48_000, 2, 3, config).is_err());
    }

    #[test]
    fn ready_signal_fires_immediately() {
        let engine = FakeEngine::new();
        let config = DriverConfig {
            pool_capacity: 1,
            ..DriverConfig::default()
        };
        let (_ctx, ready) = Context::new(engine, 8_000, 1, 2, config).unwrap();
        assert!(ready.recv_timeout(Duration::from_secs(1)).is_ok());
    }

    #[test]
    fn construction_prewarms_the_pool() {
        let engine = FakeEngine::new();
        let config = DriverConfig {
            pool_capacity: 4,
            ..DriverConfig::default()
        };
        let (_ctx, _ready) = Context::new(engine.clone(), 8_000, 1, 2, config).unwrap();
        assert_eq!(engine.created_queues(), 4);
        assert_eq!(engine.live_queues(), 4);
    }

    #[test]
    fn prewarm_failure_surfaces_from_new() {
        let engine = FakeEngine::new();
        engine.fail_next_buffer_alloc();
        let config = DriverConfig {
            pool_capacity: 2,
            ..DriverConfig::default()
        };
        assert!(Context::new(engine, 8_000, 1, 2, config).is_err());
    }

    #[test]
    fn one_buffer_size_stays_frame_aligned() {
        let format = StreamFormat {
            sample_rate: 44_100,
            channel_count: 2,
            bytes_per_sample: 2,
        };
        let config = DriverConfig::default();
        let size = one_buffer_size(&format, &config);
        assert_eq!(size % format.bytes_per_frame(), 0);
        assert_eq!(size, 44_100 / 4 * 4);
    }
}
