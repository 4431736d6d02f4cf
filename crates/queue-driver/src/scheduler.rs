//! Shared refill loop and player registry.
//!
//! Every player holding a queue is registered here, keyed by its queue
//! handle. One background worker serves the whole set: it sleeps on a
//! condition variable while no registered player can accept source data and
//! wakes when registration changes or a completion drains a backlog. The
//! worker starts when the set becomes non-empty and exits when it empties,
//! so an idle driver runs no threads.
//!
//! Lock order: the set lock is always taken before any player lock.
//! Condition-variable signals need no lock and may be issued from the
//! completion path.

use std::collections::HashMap;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use crate::engine::QueueId;
use crate::player::{PlayerError, PlayerInner};

pub(crate) struct PlayerSet {
    inner: Mutex<PlayerSetInner>,
    cond: Condvar,
}

#[derive(Default)]
struct PlayerSetInner {
    players: HashMap<QueueId, Arc<PlayerInner>>,
    /// Players that were playing when the driver was suspended.
    to_resume: Vec<Arc<PlayerInner>>,
    worker_running: bool,
}

impl PlayerSet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: Mutex::new(PlayerSetInner::default()),
            cond: Condvar::new(),
        })
    }

    /// Register a player under its freshly acquired queue, starting the
    /// refill worker if none is running.
    pub(crate) fn register(self: &Arc<Self>, queue: QueueId, player: Arc<PlayerInner>) {
        let mut inner = self.inner.lock().unwrap();
        inner.players.insert(queue, player);
        if !inner.worker_running {
            inner.worker_running = true;
            let set = self.clone();
            thread::spawn(move || set.refill_loop());
        }
        drop(inner);
        self.cond.notify_one();
    }

    /// Drop the registration for `queue`, if any, including its slot in the
    /// resume set.
    pub(crate) fn unregister(&self, queue: QueueId) {
        let mut inner = self.inner.lock().unwrap();
        let Some(player) = inner.players.remove(&queue) else {
            return;
        };
        inner.to_resume.retain(|p| !Arc::ptr_eq(p, &player));
        drop(inner);
        self.cond.notify_one();
    }

    /// Drop the registration for `queue` only while it still belongs to
    /// `player`. Used by a play call that lost its queue to a concurrent
    /// reset: by the time it notices, the queue may have been re-acquired
    /// and re-registered by someone else, whose entry must survive.
    pub(crate) fn unregister_if_owned(&self, queue: QueueId, player: &Arc<PlayerInner>) {
        let mut inner = self.inner.lock().unwrap();
        let owned = inner
            .players
            .get(&queue)
            .is_some_and(|current| Arc::ptr_eq(current, player));
        if !owned {
            return;
        }
        // The resume set is left alone: the player may hold a different
        // queue by now, and only a real teardown evicts it from there.
        inner.players.remove(&queue);
        drop(inner);
        self.cond.notify_one();
    }

    /// Route a completion event to its owner. A miss means the player was
    /// already closed and the event is dropped.
    pub(crate) fn lookup(&self, queue: QueueId) -> Option<Arc<PlayerInner>> {
        self.inner.lock().unwrap().players.get(&queue).cloned()
    }

    /// Wake the refill worker; called whenever a backlog may have gained
    /// room.
    pub(crate) fn notify(&self) {
        self.cond.notify_one();
    }

    pub(crate) fn registered_len(&self) -> usize {
        self.inner.lock().unwrap().players.len()
    }

    fn should_wait(inner: &PlayerSetInner) -> bool {
        if inner.players.is_empty() {
            return false;
        }
        !inner.players.values().any(|p| p.can_read_source())
    }

    /// Block until a player needs data or the set empties. Returns whether
    /// the worker should keep running; the flag flips under the same lock
    /// that observes emptiness so register never races a dying worker.
    fn wait(&self) -> bool {
        let mut inner = self.inner.lock().unwrap();
        while Self::should_wait(&inner) {
            inner = self.cond.wait(inner).unwrap();
        }
        if inner.players.is_empty() {
            inner.worker_running = false;
            return false;
        }
        true
    }

    fn refill_loop(&self) {
        tracing::debug!("refill worker started");
        let mut snapshot: Vec<Arc<PlayerInner>> = Vec::new();
        loop {
            if !self.wait() {
                tracing::debug!("refill worker exiting, no players registered");
                return;
            }

            {
                let inner = self.inner.lock().unwrap();
                snapshot.clear();
                snapshot.extend(inner.players.values().cloned());
            }

            // Source reads happen outside the set lock; each player's own
            // lock serializes the read against its other mutations.
            for player in &snapshot {
                player.read_source();
            }
        }
    }

    /// Pause every playing player, remembering the set for [`Self::resume`].
    ///
    /// Pausing takes player locks, so it happens on a snapshot outside the
    /// set lock; an errored pause can tear a registration down re-entrantly.
    pub(crate) fn suspend(&self) -> Result<(), PlayerError> {
        let snapshot: Vec<Arc<PlayerInner>> = {
            let inner = self.inner.lock().unwrap();
            inner.players.values().cloned().collect()
        };

        let mut paused = Vec::new();
        for player in snapshot {
            if !player.is_playing() {
                continue;
            }
            player.pause();
            if let Some(err) = player.err() {
                return Err(err);
            }
            paused.push(player);
        }

        let mut inner = self.inner.lock().unwrap();
        for player in paused {
            if !inner.to_resume.iter().any(|p| Arc::ptr_eq(p, &player)) {
                inner.to_resume.push(player);
            }
        }
        Ok(())
    }

    /// Replay play on exactly the set remembered by [`Self::suspend`].
    ///
    /// The set is swapped out before any play call: play re-enters the
    /// registry, so holding the set lock across it would deadlock.
    pub(crate) fn resume(&self) -> Result<(), PlayerError> {
        let to_resume = {
            let mut inner = self.inner.lock().unwrap();
            std::mem::take(&mut inner.to_resume)
        };
        for player in to_resume {
            player.play();
            if let Some(err) = player.err() {
                return Err(err);
            }
        }
        Ok(())
    }
}
