//! Stats-counter aggregation is an external concern; the core only promises
//! to invoke it exactly once per counted completion. The `statsApplied`
//! latch on the game record is what makes the promise hold across retries
//! and concurrent terminators.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::game::Game;

/// Side-effect hook fired by whichever terminator wins the termination
/// latch, for completed games that are not aborted. Implementations must be
/// idempotent and must never fail loudly; the game flow does not wait for
/// them and does not care if they break.
pub trait StatsSink: Send + Sync {
    fn record_result(&self, game: &Game);
}

/// Default sink: writes a log line. The production aggregation job consumes
/// those elsewhere.
pub struct LogStats;

impl StatsSink for LogStats {
    fn record_result(&self, game: &Game) {
        info!(
            "game {} finished: {:?} ({:?})",
            game.id, game.result, game.result_reason
        );
    }
}

/// Counting sink for tests asserting the exactly-once property.
#[derive(Default)]
pub struct CountingStats {
    applied: AtomicUsize,
}

impl CountingStats {
    pub fn applied(&self) -> usize {
        self.applied.load(Ordering::SeqCst)
    }
}

impl StatsSink for CountingStats {
    fn record_result(&self, _game: &Game) {
        self.applied.fetch_add(1, Ordering::SeqCst);
    }
}
