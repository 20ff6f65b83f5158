//! Stall watchdog.
//!
//! Every new block resets a timer. If the timer runs out the watchdog raises
//! [`Fatal::ChainStalled`] once and stops. It runs on its own task so a cycle blocked on a hung
//! RPC call cannot keep it from firing.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::debug;
use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::fatal::{Fatal, FatalSignal};

/// Shared between the watchdog handle and its timer task.
#[derive(Debug)]
struct WatchdogState {
    /// Reset notifications.
    reset: Notify,
    /// Highest observed block plus one, zero while nothing was observed.
    last_block: AtomicU64,
}

impl WatchdogState {
    fn last_block(&self) -> Option<u64> {
        self.last_block.load(Ordering::SeqCst).checked_sub(1)
    }
}

/// Handle to a running stall watchdog. Dropping it stops the timer.
#[derive(Debug)]
pub struct StallWatchdog {
    state: Arc<WatchdogState>,
    task: JoinHandle<()>,
}

impl StallWatchdog {
    /// Starts a watchdog that raises on `signal` after `timeout` without a new block.
    pub fn spawn(timeout: Duration, signal: FatalSignal) -> Self {
        let state = Arc::new(WatchdogState {
            reset: Notify::new(),
            last_block: AtomicU64::new(0),
        });

        let timer_state = state.clone();
        let task = tokio::spawn(async move {
            loop {
                if tokio::time::timeout(timeout, timer_state.reset.notified())
                    .await
                    .is_err()
                {
                    signal.raise(Fatal::ChainStalled {
                        last_block: timer_state.last_block(),
                        timeout,
                    });
                    return;
                }
            }
        });

        Self { state, task }
    }

    /// Records a block. Returns `true` and resets the timer when the block is newer than any
    /// block seen so far.
    pub fn observe_block(&self, block_number: u64) -> bool {
        let encoded = block_number.saturating_add(1);
        let previous = self.state.last_block.fetch_max(encoded, Ordering::SeqCst);
        if encoded > previous {
            debug!("watchdog reset at block {}", block_number);
            self.state.reset.notify_one();
            true
        } else {
            false
        }
    }

    /// The highest block observed so far.
    pub fn last_block(&self) -> Option<u64> {
        self.state.last_block()
    }

    /// Whether the timer already fired.
    pub fn has_fired(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for StallWatchdog {
    fn drop(&mut self) {
        self.task.abort();
    }
}
