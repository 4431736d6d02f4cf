//! Bounded cache of hardware queues and their buffer sets.
//!
//! Creating and disposing a native queue is expensive, so playback sessions
//! borrow a queue from this pool instead of owning one. Released queues go
//! back on the idle list up to a fixed capacity; beyond that they are torn
//! down so resident native handles stay bounded under churn.

use std::sync::{Arc, Mutex};

use crate::engine::{AudioEngine, BufferId, CompletionHandler, EngineError, QueueId, StreamFormat};

pub(crate) struct QueuePool {
    engine: Arc<dyn AudioEngine>,
    format: StreamFormat,
    buffer_size: usize,
    buffers_per_queue: usize,
    capacity: usize,
    on_complete: CompletionHandler,
    inner: Mutex<PoolInner>,
}

#[derive(Default)]
struct PoolInner {
    unused: Vec<PoolItem>,
    used: Vec<PoolItem>,
}

#[derive(Clone)]
struct PoolItem {
    queue: QueueId,
    buffers: Vec<BufferId>,
}

impl QueuePool {
    pub(crate) fn new(
        engine: Arc<dyn AudioEngine>,
        format: StreamFormat,
        buffer_size: usize,
        buffers_per_queue: usize,
        capacity: usize,
        on_complete: CompletionHandler,
    ) -> Self {
        Self {
            engine,
            format,
            buffer_size,
            buffers_per_queue,
            capacity,
            on_complete,
            inner: Mutex::new(PoolInner::default()),
        }
    }

    /// Pay the native allocation cost for a full complement of queues once,
    /// before playback starts.
    ///
    /// Only valid at construction time, before any player can acquire.
    pub(crate) fn prewarm(&self) -> Result<(), EngineError> {
        for _ in 0..self.capacity {
            self.acquire()?;
        }
        let mut inner = self.inner.lock().unwrap();
        let mut used = std::mem::take(&mut inner.used);
        inner.unused.append(&mut used);
        Ok(())
    }

    /// Borrow an idle queue, constructing a fresh one when none is cached.
    ///
    /// On a construction failure nothing is retained: a queue whose buffer
    /// allocation fails is disposed before the error is returned.
    pub(crate) fn acquire(&self) -> Result<(QueueId, Vec<BufferId>), EngineError> {
        let mut inner = self.inner.lock().unwrap();

        if let Some(item) = inner.unused.pop() {
            let handles = (item.queue, item.buffers.clone());
            inner.used.push(item);
            return Ok(handles);
        }

        let queue = self.engine.new_queue(self.format, self.on_complete.clone())?;
        let mut buffers = Vec::with_capacity(self.buffers_per_queue);
        for _ in 0..self.buffers_per_queue {
            match self.engine.allocate_buffer(queue, self.buffer_size) {
                Ok(buffer) => buffers.push(buffer),
                Err(err) => {
                    // Unwind the half-built queue; the pool keeps no record
                    // of it.
                    if let Err(dispose_err) = self.engine.dispose(queue) {
                        tracing::warn!(error = %dispose_err, "disposing half-built queue failed");
                    }
                    return Err(err);
                }
            }
        }

        inner.used.push(PoolItem {
            queue,
            buffers: buffers.clone(),
        });
        Ok((queue, buffers))
    }

    /// Return a borrowed queue.
    ///
    /// The item goes back on the idle list while total residency (idle plus
    /// lent out) stays below capacity; otherwise it is torn down. Teardown
    /// failures are reported, but the item is gone from the pool's
    /// bookkeeping either way.
    pub(crate) fn release(&self, queue: QueueId) -> Result<(), EngineError> {
        let item = {
            let mut inner = self.inner.lock().unwrap();
            let Some(pos) = inner.used.iter().position(|item| item.queue == queue) else {
                return Ok(());
            };
            let item = inner.used.remove(pos);
            if inner.unused.len() + inner.used.len() < self.capacity {
                inner.unused.push(item);
                return Ok(());
            }
            item
        };

        tracing::debug!(queue = item.queue.0, "pool at capacity, tearing queue down");
        let mut first_err = None;
        for buffer in &item.buffers {
            if let Err(err) = self.engine.free_buffer(item.queue, *buffer) {
                first_err.get_or_insert(err);
            }
        }
        if let Err(err) = self.engine.dispose(item.queue) {
            first_err.get_or_insert(err);
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Queues currently cached or lent out. Diagnostic only.
    pub(crate) fn resident_items(&self) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.unused.len() + inner.used.len()
    }

    /// Queues sitting on the idle list. Diagnostic only.
    pub(crate) fn idle_items(&self) -> usize {
        self.inner.lock().unwrap().unused.len()
    }
}
