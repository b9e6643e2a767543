//! Turn epochs.
//!
//! Every turn captures the epoch that was current when it started. Advancing
//! the clock invalidates all earlier guards at once: `is_current` turns false
//! and every pending `cancelled()` resolves.

use tokio::sync::watch;

/// Monotonic epoch counter shared by one pipeline.
#[derive(Debug)]
pub struct EpochClock {
    tx: watch::Sender<u64>,
}

impl EpochClock {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(0);
        Self { tx }
    }

    /// The epoch of the turn currently allowed to produce output.
    pub fn current(&self) -> u64 {
        *self.tx.borrow()
    }

    /// Advances the epoch and returns the new value.
    pub fn advance(&self) -> u64 {
        let mut next = 0;
        self.tx.send_modify(|epoch| {
            *epoch += 1;
            next = *epoch;
        });
        next
    }

    /// Captures the current epoch.
    pub fn guard(&self) -> TurnGuard {
        let rx = self.tx.subscribe();
        let epoch = *rx.borrow();
        TurnGuard { epoch, rx }
    }
}

impl Default for EpochClock {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancellation scope for one turn.
#[derive(Debug, Clone)]
pub struct TurnGuard {
    epoch: u64,
    rx: watch::Receiver<u64>,
}

impl TurnGuard {
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn is_current(&self) -> bool {
        *self.rx.borrow() == self.epoch
    }

    /// Resolves once the epoch has moved past this guard, or the clock is gone.
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        loop {
            if *rx.borrow_and_update() != self.epoch {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }
}
