//! Conditions under which the guardian must stop instead of acting on unsafe state.
//!
//! Library code never exits the process. It either returns a [`Fatal`] or, from background tasks
//! such as the stall watchdog, raises one through a [`FatalSignal`]. `main` is the only place that
//! turns either into a non-zero exit.

use std::future::Future;
use std::time::Duration;

use log::error;
use snafu::Snafu;
use tokio::sync::mpsc;

/// A condition the daemon cannot recover from.
#[derive(Debug, Clone, PartialEq, Eq, Snafu)]
#[snafu(visibility(pub))]
pub enum Fatal {
    /// No new block arrived within the watchdog threshold.
    #[snafu(display(
        "No new block observed for {timeout:?} (last block {last_block:?}), refusing to act on stale state"
    ))]
    ChainStalled {
        /// Last block number observed before the stall.
        last_block: Option<u64>,
        /// The watchdog threshold.
        timeout: Duration,
    },

    /// The chain id could not be resolved at startup.
    #[snafu(display("Unable to detect network: {message}"))]
    NetworkUndetectable {
        /// Last error returned by the node.
        message: String,
    },

    /// The node serves a different chain than configured.
    #[snafu(display("Node serves chain {actual}, expected {expected}"))]
    UnexpectedNetwork {
        /// Configured chain id.
        expected: u64,
        /// Chain id reported by the node.
        actual: u64,
    },

    /// The chain has no known deployment parameters.
    #[snafu(display("Chain {chain_id} is not supported"))]
    UnsupportedNetwork {
        /// Chain id reported by the node.
        chain_id: u64,
    },

    /// Chain data broke a structural assumption.
    #[snafu(display("Malformed chain data: {message}"))]
    MalformedChainData {
        /// What was wrong with it.
        message: String,
    },
}

/// Sending half used by background tasks to stop the daemon.
#[derive(Clone, Debug)]
pub struct FatalSignal {
    sender: mpsc::UnboundedSender<Fatal>,
}

/// Receiving half owned by the top-level loop.
pub type FatalReceiver = mpsc::UnboundedReceiver<Fatal>;

impl FatalSignal {
    /// Creates a connected signal/receiver pair.
    pub fn channel() -> (Self, FatalReceiver) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// Reports `fatal` to the top-level loop.
    pub fn raise(&self, fatal: Fatal) {
        error!("☠️ {}", fatal);
        // the receiver is gone only while the daemon is already shutting down
        let _ = self.sender.send(fatal);
    }
}

/// Drives `future` to completion unless a [`Fatal`] is raised first, in which case `future` is
/// dropped where it stands.
pub async fn supervise<F: Future>(fatal: &mut FatalReceiver, future: F) -> Result<F::Output, Fatal> {
    tokio::pin!(future);
    tokio::select! {
        biased;
        Some(source) = fatal.recv() => Err(source),
        output = &mut future => Ok(output),
    }
}
