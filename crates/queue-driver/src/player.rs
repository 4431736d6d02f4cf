//! Per-session playback state machine.
//!
//! A player wraps one pull-based byte source. On play it borrows a queue
//! (plus its buffer set) from the pool, stages source bytes in a backlog,
//! and keeps the queue's buffers filled; completions arriving from the
//! engine's delivery thread refill buffers straight from the backlog. When
//! the source ends and every buffer has drained back, the queue is released
//! so an idle player holds no native resources.
//!
//! ## Locking
//! One mutex per player serializes every mutation, including the completion
//! path. The scheduler lock is always taken before a player lock; the player
//! lock is therefore dropped across registry calls.

use std::fmt;
use std::io::Read;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;

use crate::context::DriverShared;
use crate::engine::{BufferId, EngineError, QueueId};

/// Terminal and non-terminal failures surfaced by [`Player::err`].
///
/// Once recorded the error is sticky: the player closes and every further
/// mutating call is a no-op.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlayerError {
    Engine(EngineError),
    Source(String),
}

impl fmt::Display for PlayerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlayerError::Engine(err) => write!(f, "audio engine: {err}"),
            PlayerError::Source(detail) => write!(f, "source read: {detail}"),
        }
    }
}

impl std::error::Error for PlayerError {}

impl From<EngineError> for PlayerError {
    fn from(err: EngineError) -> Self {
        PlayerError::Engine(err)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum StateTag {
    Paused,
    Playing,
    Closed,
}

struct PlayerState {
    src: Box<dyn Read + Send>,
    tag: StateTag,
    queue: Option<QueueId>,
    /// Buffers held by the player and not submitted to the device.
    unqueued: Vec<BufferId>,
    /// Bytes read from the source but not yet written into a buffer.
    backlog: Vec<u8>,
    /// Sticky until reset: the source has no more data.
    eof: bool,
    err: Option<PlayerError>,
    volume: f32,
}

/// One playback session.
///
/// Created by [`crate::Context::new_player`] in the paused state with no
/// queue. Dropping the handle closes it.
pub struct Player {
    inner: Arc<PlayerInner>,
}

impl Player {
    pub(crate) fn new(shared: Arc<DriverShared>, src: Box<dyn Read + Send>) -> Self {
        Self {
            inner: Arc::new(PlayerInner {
                shared,
                state: Mutex::new(PlayerState {
                    src,
                    tag: StateTag::Paused,
                    queue: None,
                    unqueued: Vec::new(),
                    backlog: Vec::new(),
                    eof: false,
                    err: None,
                    volume: 1.0,
                }),
            }),
        }
    }

    /// Start (or restart) playback.
    ///
    /// The mutation runs off the caller's thread because priming and
    /// starting a native queue can take a while; this returns once the
    /// mutation holds the player lock, not once it completes. Check
    /// [`Player::err`] afterwards.
    pub fn play(&self) {
        self.inner.play();
    }

    /// Pause a playing queue. No-op in any other state.
    pub fn pause(&self) {
        self.inner.pause();
    }

    /// Stop playback, give the queue back to the pool, and drop all staged
    /// data. The player returns to paused and can play again from the
    /// source's current position.
    pub fn reset(&self) {
        self.inner.reset();
    }

    /// Close the player for good, surfacing the sticky error if one was
    /// recorded. Idempotent.
    pub fn close(&self) -> Result<(), PlayerError> {
        self.inner.close()
    }

    pub fn is_playing(&self) -> bool {
        self.inner.is_playing()
    }

    pub fn volume(&self) -> f32 {
        self.inner.volume()
    }

    /// Cache `volume` (clamped to `0.0..=1.0`) and apply it to the current
    /// queue, if any. The cached value is reapplied to every queue acquired
    /// later.
    pub fn set_volume(&self, volume: f32) {
        self.inner.set_volume(volume);
    }

    /// Bytes staged in the backlog, not yet written to hardware.
    pub fn unplayed_buffer_size(&self) -> usize {
        self.inner.unplayed_buffer_size()
    }

    pub fn err(&self) -> Option<PlayerError> {
        self.inner.err()
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        let _ = self.inner.close();
    }
}

pub(crate) struct PlayerInner {
    shared: Arc<DriverShared>,
    state: Mutex<PlayerState>,
}

impl PlayerInner {
    pub(crate) fn play(self: &Arc<Self>) {
        // Return to the caller as soon as the dispatch thread owns the
        // player lock; the native prime/start latency stays off the
        // caller's thread.
        let inner = self.clone();
        let (locked_tx, locked_rx) = crossbeam_channel::bounded::<()>(1);
        thread::spawn(move || {
            let st = inner.state.lock().unwrap();
            let _ = locked_tx.send(());
            inner.play_locked(st);
        });
        let _ = locked_rx.recv();
    }

    fn play_locked<'a>(self: &'a Arc<Self>, mut st: MutexGuard<'a, PlayerState>) {
        if st.err.is_some() || st.tag != StateTag::Paused {
            return;
        }

        let mut registered = None;
        if st.queue.is_none() {
            let (queue, buffers) = match self.shared.pool.acquire() {
                Ok(handles) => handles,
                Err(err) => {
                    self.set_error_locked(st, err.into());
                    return;
                }
            };
            st.queue = Some(queue);
            st.unqueued = buffers;
            if let Err(err) = self.shared.engine.set_volume(queue, st.volume) {
                self.set_error_locked(st, err.into());
                return;
            }

            // Registration takes the scheduler lock; the player lock must
            // not be held across it.
            drop(st);
            self.shared.players.register(queue, self.clone());
            registered = Some(queue);
            st = self.state.lock().unwrap();
            if st.err.is_some() || st.tag != StateTag::Paused {
                self.bail_registration(st, registered);
                return;
            }
        }

        // Initial synchronous fill: stage up to the full target before the
        // device starts pulling.
        let max = self.shared.max_buffer_size;
        let mut chunk = vec![0u8; max];
        while st.backlog.len() < max && !st.eof {
            let n = match st.src.read(&mut chunk) {
                Ok(n) => n,
                Err(err) => {
                    self.set_error_locked(st, PlayerError::Source(err.to_string()));
                    return;
                }
            };
            if n == 0 {
                st.eof = true;
                break;
            }
            st.backlog.extend_from_slice(&chunk[..n]);
        }

        // A concurrent reset may have taken the queue while the lock was
        // released for registration.
        let Some(queue) = st.queue else {
            self.bail_registration(st, registered);
            return;
        };

        let buffers: Vec<BufferId> = st.unqueued.clone();
        let mut still_unqueued = Vec::new();
        for buffer in buffers {
            match self.append_buffer_locked(&mut st, queue, buffer) {
                Ok(true) => {}
                Ok(false) => still_unqueued.push(buffer),
                Err(err) => {
                    self.set_error_locked(st, err);
                    return;
                }
            }
        }
        st.unqueued = still_unqueued;

        // Source already exhausted and everything fit into the idle
        // buffers: nothing to start, stay paused.
        if st.eof && st.unqueued.len() == self.shared.config.buffers_per_queue {
            return;
        }

        let mut attempts = 0;
        loop {
            match self.shared.engine.prime(queue) {
                Ok(()) => break,
                Err(EngineError::DeviceBusy)
                    if attempts < self.shared.config.prime_retry_attempts =>
                {
                    attempts += 1;
                    // Another session (a recording, say) holds the device;
                    // back off without blocking the completion path.
                    drop(st);
                    thread::sleep(self.shared.config.prime_retry_delay);
                    st = self.state.lock().unwrap();
                    if st.err.is_some() || st.queue != Some(queue) {
                        return;
                    }
                }
                Err(err) => {
                    self.set_error_locked(st, err.into());
                    return;
                }
            }
        }

        if let Err(err) = self.shared.engine.start(queue) {
            self.set_error_locked(st, err.into());
            return;
        }
        st.tag = StateTag::Playing;
    }

    /// Undo a registration made by this play call if a concurrent reset or
    /// close took the queue while the player lock was released. A queue the
    /// player still owns stays registered; a queue that has moved on to
    /// another owner is left alone.
    fn bail_registration(
        self: &Arc<Self>,
        st: MutexGuard<'_, PlayerState>,
        registered: Option<QueueId>,
    ) {
        let Some(queue) = registered else {
            return;
        };
        if st.queue == Some(queue) {
            return;
        }
        drop(st);
        self.shared.players.unregister_if_owned(queue, self);
    }

    pub(crate) fn pause(&self) {
        let mut st = self.state.lock().unwrap();
        if st.err.is_some() || st.tag != StateTag::Playing {
            return;
        }
        let Some(queue) = st.queue else {
            return;
        };
        if let Err(err) = self.shared.engine.pause(queue) {
            self.set_error_locked(st, err.into());
            return;
        }
        st.tag = StateTag::Paused;
    }

    pub(crate) fn reset(&self) {
        let st = self.state.lock().unwrap();
        self.reset_locked(st);
    }

    fn reset_locked(&self, mut st: MutexGuard<'_, PlayerState>) {
        if st.err.is_some() || st.tag == StateTag::Closed {
            return;
        }
        let Some(queue) = st.queue.take() else {
            return;
        };
        st.unqueued.clear();
        drop(st);

        // Re-acquiring a queue on the next play is cheaper than keeping one
        // started-and-idle, so a reset releases it entirely.
        let teardown_err = self.teardown_queue(queue);

        let mut st = self.state.lock().unwrap();
        if let Some(err) = teardown_err {
            self.set_error_locked(st, err);
            return;
        }
        st.tag = StateTag::Paused;
        st.backlog.clear();
        st.eof = false;
        drop(st);
        self.shared.players.notify();
    }

    pub(crate) fn close(&self) -> Result<(), PlayerError> {
        let st = self.state.lock().unwrap();
        match self.close_locked(st) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Transition to closed and tear the queue down. Returns the sticky
    /// error, which a teardown failure never overwrites.
    fn close_locked(&self, mut st: MutexGuard<'_, PlayerState>) -> Option<PlayerError> {
        let queue = st.queue.take();
        st.unqueued.clear();
        st.backlog = Vec::new();
        st.tag = StateTag::Closed;
        drop(st);

        let teardown_err = queue.and_then(|queue| self.teardown_queue(queue));

        let mut st = self.state.lock().unwrap();
        if let Some(err) = teardown_err {
            if st.err.is_none() {
                st.err = Some(err);
            }
        }
        st.err.clone()
    }

    /// Stop the queue, hand it back to the pool, and drop the scheduler
    /// registration. Must be called without the player lock held; engines
    /// may deliver completions from inside stop.
    fn teardown_queue(&self, queue: QueueId) -> Option<PlayerError> {
        let stop_err = self.shared.engine.stop(queue).err();
        let release_err = self.shared.pool.release(queue).err();
        self.shared.players.unregister(queue);
        stop_err.or(release_err).map(PlayerError::from)
    }

    /// Record the first error and force the terminal close.
    fn set_error_locked(&self, mut st: MutexGuard<'_, PlayerState>, err: PlayerError) {
        if st.err.is_none() {
            tracing::warn!(error = %err, "player entered terminal error state");
            st.err = Some(err);
        }
        let _ = self.close_locked(st);
    }

    /// Fill `buffer` from the backlog (zero-padding the tail) and enqueue
    /// it.
    ///
    /// `Ok(false)` means the buffer stays with the caller: either there is
    /// nothing left to write (end of stream, empty backlog) or the queue
    /// rejected the submission mid-reset.
    fn append_buffer_locked(
        &self,
        st: &mut PlayerState,
        queue: QueueId,
        buffer: BufferId,
    ) -> Result<bool, PlayerError> {
        if st.eof && st.backlog.is_empty() {
            return Ok(false);
        }

        let size = self.shared.one_buffer_size;
        let n = st.backlog.len().min(size);
        let mut data = vec![0u8; size];
        data[..n].copy_from_slice(&st.backlog[..n]);

        match self.shared.engine.enqueue_buffer(queue, buffer, &data) {
            Ok(()) => {}
            Err(EngineError::EnqueueDuringReset) => return Ok(false),
            Err(err) => return Err(err.into()),
        }

        st.backlog.drain(..n);
        // The backlog shrank; the refill loop may have room to pull again.
        self.shared.players.notify();
        Ok(true)
    }

    /// Completion path, called from the engine's delivery thread once
    /// `buffer` finished playing.
    pub(crate) fn on_buffer_complete(&self, queue: QueueId, buffer: BufferId) {
        let mut st = self.state.lock().unwrap();
        // The queue may have been released while this event was in flight.
        if st.queue != Some(queue) {
            return;
        }

        match self.append_buffer_locked(&mut st, queue, buffer) {
            Ok(true) => {}
            Ok(false) => {
                st.unqueued.push(buffer);
                if st.eof && st.unqueued.len() == self.shared.config.buffers_per_queue {
                    // Fully drained after end of stream: release the queue
                    // instead of holding it idle.
                    self.reset_locked(st);
                }
            }
            Err(err) => self.set_error_locked(st, err),
        }
    }

    /// Whether the refill loop should pull more source data. A closed or
    /// errored player never does, even if it lingers in the registry.
    pub(crate) fn can_read_source(&self) -> bool {
        let st = self.state.lock().unwrap();
        st.err.is_none()
            && st.tag != StateTag::Closed
            && !st.eof
            && st.backlog.len() < self.shared.max_buffer_size
    }

    /// One bounded pull from the source into the backlog. Only the refill
    /// loop calls this; the player lock additionally serializes it against
    /// every other mutation.
    pub(crate) fn read_source(&self) {
        let mut st = self.state.lock().unwrap();
        if st.err.is_some() || st.tag == StateTag::Closed {
            return;
        }
        let max = self.shared.max_buffer_size;
        if st.backlog.len() >= max {
            return;
        }

        let mut chunk = vec![0u8; max];
        let n = match st.src.read(&mut chunk) {
            Ok(n) => n,
            Err(err) => {
                self.set_error_locked(st, PlayerError::Source(err.to_string()));
                return;
            }
        };
        st.backlog.extend_from_slice(&chunk[..n]);
        if n == 0 && st.backlog.is_empty() {
            st.eof = true;
        }
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.state.lock().unwrap().tag == StateTag::Playing
    }

    pub(crate) fn volume(&self) -> f32 {
        self.state.lock().unwrap().volume
    }

    pub(crate) fn set_volume(&self, volume: f32) {
        let volume = volume.clamp(0.0, 1.0);
        let mut st = self.state.lock().unwrap();
        st.volume = volume;
        let Some(queue) = st.queue else {
            return;
        };
        if let Err(err) = self.shared.engine.set_volume(queue, volume) {
            self.set_error_locked(st, err.into());
        }
    }

    pub(crate) fn unplayed_buffer_size(&self) -> usize {
        self.state.lock().unwrap().backlog.len()
    }

    pub(crate) fn err(&self) -> Option<PlayerError> {
        self.state.lock().unwrap().err.clone()
    }
}
