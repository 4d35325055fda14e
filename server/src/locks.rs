//! Per-game serialization. Every coordinator operation on a game runs under
//! that game's mutex; operations on different games proceed in parallel.
//!
//! Entries are reference counted and evicted as soon as the last guard
//! drops, so the map stays proportional to the number of games with
//! in-flight operations rather than growing for the lifetime of the
//! process.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

use crate::game::GameId;

struct LockEntry {
    mutex: Arc<Mutex<()>>,
    refs: AtomicUsize,
}

impl LockEntry {
    fn new() -> LockEntry {
        LockEntry {
            mutex: Arc::new(Mutex::new(())),
            refs: AtomicUsize::new(0),
        }
    }
}

#[derive(Clone, Default)]
pub struct GameLocks {
    map: Arc<DashMap<GameId, Arc<LockEntry>>>,
}

/// Holds the critical section for one game. Dropping it releases the lock
/// and evicts the map entry when no other task is waiting on it.
pub struct GameGuard {
    _guard: OwnedMutexGuard<()>,
    map: Arc<DashMap<GameId, Arc<LockEntry>>>,
    key: GameId,
}

impl Drop for GameGuard {
    fn drop(&mut self) {
        // remove_if holds the shard lock while the predicate runs, so the
        // decrement and the removal decision are one atomic step relative
        // to acquire().
        self.map
            .remove_if(&self.key, |_, entry| {
                entry.refs.fetch_sub(1, Ordering::SeqCst) == 1
            });
    }
}

impl GameLocks {
    pub fn new() -> GameLocks {
        GameLocks::default()
    }

    /// Acquires the critical section for `game_id`, waiting behind any
    /// operation already inside it.
    pub async fn acquire(&self, game_id: &str) -> GameGuard {
        let mutex = {
            let entry = self
                .map
                .entry(game_id.to_owned())
                .or_insert_with(|| Arc::new(LockEntry::new()));
            entry.refs.fetch_add(1, Ordering::SeqCst);
            entry.mutex.clone()
            // The shard lock is released here, before we await.
        };

        GameGuard {
            _guard: mutex.lock_owned().await,
            map: self.map.clone(),
            key: game_id.to_owned(),
        }
    }

    #[cfg(test)]
    fn entry_count(&self) -> usize {
        self.map.len()
    }
}
