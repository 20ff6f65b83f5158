//! Deposit contract events.
//!
//! A [`DepositEvent`] is immutable once read from chain. The verifier turns each one into a
//! [`VerifiedDepositEvent`] exactly once, and the cache only ever stores verified events.

use alloy::primitives::{FixedBytes, B256};
use serde::{Deserialize, Serialize};

/// A 48 byte BLS12-381 public key.
pub type BlsPublicKey = FixedBytes<48>;

/// A 96 byte BLS12-381 signature.
pub type BlsSignature = FixedBytes<96>;

/// Position of a log in the chain.
///
/// Ordering is by block number first and log index second, which is the order logs were emitted.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogPosition {
    /// Block the log was emitted in.
    pub block_number: u64,
    /// Index of the log inside the block.
    pub log_index: u64,
}

impl LogPosition {
    /// Creates a new position.
    pub fn new(block_number: u64, log_index: u64) -> Self {
        Self {
            block_number,
            log_index,
        }
    }
}

/// A single `DepositEvent` emitted by the deposit contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositEvent {
    /// Validator public key.
    pub pubkey: BlsPublicKey,
    /// Withdrawal credentials the deposit was made with.
    #[serde(rename = "wc")]
    pub withdrawal_credentials: B256,
    /// Deposit amount in gwei.
    pub amount: u64,
    /// BLS signature over the deposit message.
    pub signature: BlsSignature,
    /// Transaction that emitted the event.
    #[serde(rename = "tx")]
    pub tx_hash: B256,
    /// Block the event was emitted in.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: B256,
    /// Index of the log inside the block.
    pub log_index: u64,
    /// Raw little-endian `index` field of the event.
    pub index: FixedBytes<8>,
    /// Decoded deposit count.
    pub deposit_count: u64,
    /// Hash tree root of the deposit data, the node inserted into the deposit tree.
    pub deposit_data_root: B256,
}

impl DepositEvent {
    /// Chain position of this event.
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.block_number, self.log_index)
    }
}

/// A deposit event with its verification verdict.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifiedDepositEvent {
    /// The deposit as read from chain.
    #[serde(flatten)]
    pub event: DepositEvent,
    /// Whether the deposit data root and BLS signature both check out.
    pub valid: bool,
}

impl VerifiedDepositEvent {
    /// Chain position of the underlying event.
    pub fn position(&self) -> LogPosition {
        self.event.position()
    }
}

/// Events fetched for the inclusive block range `start_block..=end_block`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventGroup<E> {
    /// Events in chain order.
    pub events: Vec<E>,
    /// First block of the range.
    pub start_block: u64,
    /// Last block of the range.
    pub end_block: u64,
}

impl<E> EventGroup<E> {
    /// Creates a group for a fetched range.
    pub fn new(events: Vec<E>, start_block: u64, end_block: u64) -> Self {
        Self {
            events,
            start_block,
            end_block,
        }
    }

    /// An empty group for the given range.
    pub fn empty(start_block: u64, end_block: u64) -> Self {
        Self::new(Vec::new(), start_block, end_block)
    }

    /// Appends another group fetched for the range directly after this one.
    pub fn append(&mut self, mut other: EventGroup<E>) {
        self.events.append(&mut other.events);
        self.end_block = self.end_block.max(other.end_block);
    }
}

/// Raw deposits for a range.
pub type DepositEventGroup = EventGroup<DepositEvent>;

/// Verified deposits for a range.
pub type VerifiedDepositEventGroup = EventGroup<VerifiedDepositEvent>;

/// All deposits known at a block, with the outcome of the integrity checks for that block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositedEvents {
    /// Cached and fresh deposits merged in chain order.
    pub group: VerifiedDepositEventGroup,
    /// `false` when the cache, the fresh events or the deposit root could not be trusted.
    pub is_valid: bool,
}

/// Decodes the little-endian u64 the deposit contract uses for amounts and counts.
pub fn parse_little_endian_64(bytes: &FixedBytes<8>) -> u64 {
    u64::from_le_bytes(bytes.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_order_by_block_then_log_index() {
        assert!(LogPosition::new(10, 5) < LogPosition::new(11, 0));
        assert!(LogPosition::new(10, 1) < LogPosition::new(10, 2));
        assert_eq!(LogPosition::new(7, 7), LogPosition::new(7, 7));
    }

    #[test]
    fn little_endian_counts_are_decoded() {
        let raw = FixedBytes::<8>::from([0x2a, 0x01, 0, 0, 0, 0, 0, 0]);
        assert_eq!(parse_little_endian_64(&raw), 298);
    }

    #[test]
    fn appending_groups_extends_the_range() {
        let mut first = EventGroup::new(vec![1u8, 2], 100, 150);
        first.append(EventGroup::new(vec![3u8], 151, 200));

        assert_eq!(first.events, vec![1, 2, 3]);
        assert_eq!(first.start_block, 100);
        assert_eq!(first.end_block, 200);
    }
}
