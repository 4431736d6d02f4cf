//! Scriptable in-memory engine used by the driver tests.
//!
//! Completions are delivered synchronously from [`FakeEngine::complete_one`],
//! letting tests stand in for the native delivery thread.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::engine::{AudioEngine, BufferId, CompletionHandler, EngineError, QueueId, StreamFormat};

pub(crate) struct FakeEngine {
    inner: Mutex<FakeInner>,
}

#[derive(Default)]
struct FakeInner {
    next_id: u64,
    queues: HashMap<QueueId, FakeQueue>,
    created_queues: usize,
    fail_next_buffer_alloc: bool,
    busy_primes: usize,
    reject_enqueue_during_reset: bool,
    fail_enqueue_call: bool,
    fail_start: bool,
}

struct FakeQueue {
    handler: CompletionHandler,
    buffers: Vec<BufferId>,
    enqueued: VecDeque<(BufferId, Vec<u8>)>,
    started: bool,
    volume: f32,
}

impl FakeEngine {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(FakeInner::default()),
        })
    }

    /// Deliver the completion for the oldest in-flight buffer of `queue`.
    ///
    /// The handler runs with no engine lock held, exactly like a real
    /// delivery thread, so it may re-enter the engine.
    pub(crate) fn complete_one(&self, queue: QueueId) -> bool {
        let (handler, buffer) = {
            let mut inner = self.inner.lock().unwrap();
            let Some(q) = inner.queues.get_mut(&queue) else {
                return false;
            };
            let Some((buffer, _)) = q.enqueued.pop_front() else {
                return false;
            };
            (q.handler.clone(), buffer)
        };
        handler(queue, buffer);
        true
    }

    pub(crate) fn created_queues(&self) -> usize {
        self.inner.lock().unwrap().created_queues
    }

    pub(crate) fn live_queues(&self) -> usize {
        self.inner.lock().unwrap().queues.len()
    }

    pub(crate) fn enqueued_len(&self, queue: QueueId) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(&queue).map_or(0, |q| q.enqueued.len())
    }

    pub(crate) fn queue_volume(&self, queue: QueueId) -> Option<f32> {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(&queue).map(|q| q.volume)
    }

    pub(crate) fn is_started(&self, queue: QueueId) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queues.get(&queue).is_some_and(|q| q.started)
    }

    pub(crate) fn any_started(&self) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.queues.values().any(|q| q.started)
    }

    /// First queue currently started, in creation order.
    pub(crate) fn first_started(&self) -> Option<QueueId> {
        let inner = self.inner.lock().unwrap();
        let mut started: Vec<QueueId> = inner
            .queues
            .iter()
            .filter(|(_, q)| q.started)
            .map(|(id, _)| *id)
            .collect();
        started.sort_by_key(|id| id.0);
        started.first().copied()
    }

    pub(crate) fn fail_next_buffer_alloc(&self) {
        self.inner.lock().unwrap().fail_next_buffer_alloc = true;
    }

    pub(crate) fn set_busy_primes(&self, n: usize) {
        self.inner.lock().unwrap().busy_primes = n;
    }

    pub(crate) fn set_reject_enqueue_during_reset(&self, reject: bool) {
        self.inner.lock().unwrap().reject_enqueue_during_reset = reject;
    }

    pub(crate) fn set_fail_enqueue_call(&self, fail: bool) {
        self.inner.lock().unwrap().fail_enqueue_call = fail;
    }

    pub(crate) fn set_fail_start(&self, fail: bool) {
        self.inner.lock().unwrap().fail_start = fail;
    }
}

impl AudioEngine for FakeEngine {
    fn new_queue(
        &self,
        _format: StreamFormat,
        on_complete: CompletionHandler,
    ) -> Result<QueueId, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = QueueId(inner.next_id);
        inner.created_queues += 1;
        inner.queues.insert(
            id,
            FakeQueue {
                handler: on_complete,
                buffers: Vec::new(),
                enqueued: VecDeque::new(),
                started: false,
                volume: 1.0,
            },
        );
        Ok(id)
    }

    fn allocate_buffer(&self, queue: QueueId, _size: usize) -> Result<BufferId, EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_next_buffer_alloc {
            inner.fail_next_buffer_alloc = false;
            return Err(EngineError::Construction("buffer allocation refused".into()));
        }
        inner.next_id += 1;
        let id = BufferId(inner.next_id);
        let q = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "allocate_buffer", detail: "unknown queue".into() })?;
        q.buffers.push(id);
        Ok(id)
    }

    fn free_buffer(&self, queue: QueueId, buffer: BufferId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "free_buffer", detail: "unknown queue".into() })?;
        q.buffers.retain(|b| *b != buffer);
        Ok(())
    }

    fn enqueue_buffer(
        &self,
        queue: QueueId,
        buffer: BufferId,
        data: &[u8],
    ) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.reject_enqueue_during_reset {
            return Err(EngineError::EnqueueDuringReset);
        }
        if inner.fail_enqueue_call {
            return Err(EngineError::Call { op: "enqueue_buffer", detail: "injected".into() });
        }
        let q = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "enqueue_buffer", detail: "unknown queue".into() })?;
        if !q.buffers.contains(&buffer) {
            return Err(EngineError::Call { op: "enqueue_buffer", detail: "foreign buffer".into() });
        }
        q.enqueued.push_back((buffer, data.to_vec()));
        Ok(())
    }

    fn prime(&self, queue: QueueId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.busy_primes > 0 {
            inner.busy_primes -= 1;
            return Err(EngineError::DeviceBusy);
        }
        inner
            .queues
            .get(&queue)
            .map(|_| ())
            .ok_or(EngineError::Call { op: "prime", detail: "unknown queue".into() })
    }

    fn start(&self, queue: QueueId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_start {
            return Err(EngineError::Call { op: "start", detail: "injected".into() });
        }
        let q = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "start", detail: "unknown queue".into() })?;
        q.started = true;
        Ok(())
    }

    fn pause(&self, queue: QueueId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "pause", detail: "unknown queue".into() })?;
        q.started = false;
        Ok(())
    }

    fn stop(&self, queue: QueueId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "stop", detail: "unknown queue".into() })?;
        q.started = false;
        // In-flight buffers come back without completions.
        q.enqueued.clear();
        Ok(())
    }

    fn dispose(&self, queue: QueueId) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .queues
            .remove(&queue)
            .map(|_| ())
            .ok_or(EngineError::Call { op: "dispose", detail: "unknown queue".into() })
    }

    fn set_volume(&self, queue: QueueId, volume: f32) -> Result<(), EngineError> {
        let mut inner = self.inner.lock().unwrap();
        let q = inner
            .queues
            .get_mut(&queue)
            .ok_or(EngineError::Call { op: "set_volume", detail: "unknown queue".into() })?;
        q.volume = volume;
        Ok(())
    }
}
