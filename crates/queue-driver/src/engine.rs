//! Native audio engine seam.
//!
//! The driver core is written against [`AudioEngine`] rather than a concrete
//! audio API. A queue is an opaque playback channel owning a fixed set of
//! fixed-size buffers; the engine consumes enqueued buffers in order and
//! reports each finished buffer through the completion handler registered at
//! queue creation. Completions arrive on the engine's own delivery thread,
//! concurrently with everything else.

use std::fmt;
use std::sync::Arc;

/// Opaque handle for one playback queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct QueueId(pub u64);

/// Opaque handle for one buffer owned by a queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct BufferId(pub u64);

/// PCM format shared by every queue a driver context creates.
///
/// Only unsigned 8-bit (`bytes_per_sample == 1`) and signed 16-bit
/// little-endian (`bytes_per_sample == 2`) interleaved PCM are supported.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamFormat {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub bytes_per_sample: u16,
}

impl StreamFormat {
    /// Bytes occupied by one interleaved frame.
    pub fn bytes_per_frame(&self) -> usize {
        self.channel_count as usize * self.bytes_per_sample as usize
    }
}

/// Invoked once per finished buffer, from the engine's delivery thread.
///
/// Registered once at queue creation and kept for the queue's whole lifetime,
/// including across pool reuse by different players.
pub type CompletionHandler = Arc<dyn Fn(QueueId, BufferId) + Send + Sync>;

/// Failures reported by an [`AudioEngine`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// Queue or buffer allocation failed; nothing was constructed.
    Construction(String),
    /// Enqueue rejected because the queue is mid-reset. The buffer stays
    /// with the caller; this is not a playback error.
    EnqueueDuringReset,
    /// The device is temporarily claimed elsewhere (for example a system
    /// recording session). Prime retries after a short delay.
    DeviceBusy,
    /// Any other native call failure. These are terminal for the player
    /// that issued the call.
    Call { op: &'static str, detail: String },
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EngineError::Construction(detail) => {
                write!(f, "queue construction failed: {detail}")
            }
            EngineError::EnqueueDuringReset => write!(f, "enqueue rejected during reset"),
            EngineError::DeviceBusy => write!(f, "device busy"),
            EngineError::Call { op, detail } => write!(f, "{op} failed: {detail}"),
        }
    }
}

impl std::error::Error for EngineError {}

/// Handle-based playback engine with asynchronous buffer completions.
///
/// Implementations must be callable from arbitrary threads; the driver
/// serializes per-player calls but issues pool and scheduler traffic
/// concurrently.
pub trait AudioEngine: Send + Sync {
    /// Create a playback queue for `format` and attach its completion
    /// handler.
    fn new_queue(
        &self,
        format: StreamFormat,
        on_complete: CompletionHandler,
    ) -> Result<QueueId, EngineError>;

    /// Allocate one fixed-size buffer owned by `queue`.
    fn allocate_buffer(&self, queue: QueueId, size: usize) -> Result<BufferId, EngineError>;

    /// Release a buffer previously allocated on `queue`.
    fn free_buffer(&self, queue: QueueId, buffer: BufferId) -> Result<(), EngineError>;

    /// Copy `data` into `buffer` and submit it for playback.
    ///
    /// `data` is always exactly one buffer size; callers zero-pad short
    /// tails. A queue that is mid-reset rejects the submission with
    /// [`EngineError::EnqueueDuringReset`].
    fn enqueue_buffer(
        &self,
        queue: QueueId,
        buffer: BufferId,
        data: &[u8],
    ) -> Result<(), EngineError>;

    /// Prepare the queue to start. May report [`EngineError::DeviceBusy`]
    /// while another session holds the device.
    fn prime(&self, queue: QueueId) -> Result<(), EngineError>;

    fn start(&self, queue: QueueId) -> Result<(), EngineError>;

    fn pause(&self, queue: QueueId) -> Result<(), EngineError>;

    /// Stop playback and hand every in-flight buffer back to the queue
    /// without delivering further completions for them.
    fn stop(&self, queue: QueueId) -> Result<(), EngineError>;

    /// Tear the queue down. Buffers still allocated on it are freed with it.
    fn dispose(&self, queue: QueueId) -> Result<(), EngineError>;

    /// Apply a gain in `0.0..=1.0` to the queue's output.
    fn set_volume(&self, queue: QueueId, volume: f32) -> Result<(), EngineError>;
}
