//! Structural decoding and cryptographic verification of deposit logs.
//!
//! Every deposit log is first decoded into a [`DepositEvent`]; a log that does not have the shape
//! the deposit contract guarantees is malformed chain data and aborts the cycle. The decoded event
//! is then checked twice: its recorded deposit data root must match the root recomputed from its
//! fields, and its BLS signature must verify over the deposit signing root. A failed check only
//! marks the event invalid.

use std::sync::Arc;

use alloy::primitives::{Bytes, FixedBytes, B256};
use alloy::rpc::types::Log;
use guardian_core::crypto::{genesis_fork_version, verify_deposit_signature, DepositCrypto};
use guardian_core::deposit::{parse_little_endian_64, DepositEvent, VerifiedDepositEvent};
use guardian_core::ssz::DepositData;
use log::{debug, warn};
use snafu::Snafu;

use crate::contracts::IDepositContract;

/// Errors returned by [`DepositVerifier`].
#[derive(Debug, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum VerifierError {
    /// A deposit log does not have the shape the deposit contract guarantees.
    #[snafu(display("Malformed deposit event: {message}"))]
    MalformedEvent {
        /// What was wrong with it.
        message: String,
    },
}

/// Result alias of this module.
pub type Result<T, E = VerifierError> = std::result::Result<T, E>;

/// A deposit log as emitted, before any length checks.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RawDepositEvent {
    /// Raw `pubkey` field.
    pub pubkey: Bytes,
    /// Raw `withdrawal_credentials` field.
    pub withdrawal_credentials: Bytes,
    /// Raw little-endian `amount` field.
    pub amount: Bytes,
    /// Raw `signature` field.
    pub signature: Bytes,
    /// Raw little-endian `index` field.
    pub index: Bytes,
    /// Block the log was emitted in.
    pub block_number: Option<u64>,
    /// Hash of that block.
    pub block_hash: Option<B256>,
    /// Index of the log inside the block.
    pub log_index: Option<u64>,
    /// Transaction that emitted the log.
    pub tx_hash: Option<B256>,
}

impl RawDepositEvent {
    /// ABI decodes a deposit contract log.
    pub fn from_log(log: &Log) -> Result<Self> {
        let decoded = log
            .log_decode::<IDepositContract::DepositEvent>()
            .map_err(|e| VerifierError::MalformedEvent {
                message: e.to_string(),
            })?;
        let event = decoded.inner.data;

        Ok(Self {
            pubkey: event.pubkey,
            withdrawal_credentials: event.withdrawal_credentials,
            amount: event.amount,
            signature: event.signature,
            index: event.index,
            block_number: log.block_number,
            block_hash: log.block_hash,
            log_index: log.log_index,
            tx_hash: log.transaction_hash,
        })
    }
}

fn fixed<const N: usize>(field: &str, bytes: &Bytes) -> Result<FixedBytes<N>> {
    FixedBytes::try_from(bytes.as_ref()).map_err(|_| VerifierError::MalformedEvent {
        message: format!("{field} has {} bytes, expected {N}", bytes.len()),
    })
}

fn present<T>(field: &str, value: Option<T>) -> Result<T> {
    value.ok_or_else(|| VerifierError::MalformedEvent {
        message: format!("{field} is missing"),
    })
}

/// Decodes and verifies deposit events for one network.
#[derive(Clone)]
pub struct DepositVerifier {
    crypto: Arc<dyn DepositCrypto>,
    fork_version: [u8; 4],
}

impl std::fmt::Debug for DepositVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DepositVerifier")
            .field("fork_version", &self.fork_version)
            .finish_non_exhaustive()
    }
}

impl DepositVerifier {
    /// Creates a verifier signing roots against `fork_version`.
    pub fn new(crypto: Arc<dyn DepositCrypto>, fork_version: [u8; 4]) -> Self {
        Self {
            crypto,
            fork_version,
        }
    }

    /// Creates a verifier for a known chain.
    pub fn for_chain(crypto: Arc<dyn DepositCrypto>, chain_id: u64) -> Option<Self> {
        genesis_fork_version(chain_id).map(|fork_version| Self::new(crypto, fork_version))
    }

    /// The crypto backend, shared with the key aggregator.
    pub fn crypto(&self) -> Arc<dyn DepositCrypto> {
        self.crypto.clone()
    }

    /// Fork version deposit signatures are checked against.
    pub fn fork_version(&self) -> [u8; 4] {
        self.fork_version
    }

    /// Checks field lengths and metadata and computes the deposit data root.
    pub fn format(&self, raw: &RawDepositEvent) -> Result<DepositEvent> {
        let pubkey = fixed::<48>("pubkey", &raw.pubkey)?;
        let withdrawal_credentials = fixed::<32>("withdrawal_credentials", &raw.withdrawal_credentials)?;
        let amount = parse_little_endian_64(&fixed::<8>("amount", &raw.amount)?);
        let signature = fixed::<96>("signature", &raw.signature)?;
        let index = fixed::<8>("index", &raw.index)?;

        let deposit_data_root = self.crypto.deposit_data_root(&DepositData {
            pubkey,
            withdrawal_credentials,
            amount,
            signature,
        });

        Ok(DepositEvent {
            pubkey,
            withdrawal_credentials,
            amount,
            signature,
            tx_hash: present("transaction hash", raw.tx_hash)?,
            block_number: present("block number", raw.block_number)?,
            block_hash: present("block hash", raw.block_hash)?,
            log_index: present("log index", raw.log_index)?,
            deposit_count: parse_little_endian_64(&index),
            index,
            deposit_data_root,
        })
    }

    /// Marks `event` valid iff its root matches the recomputed one and its signature verifies.
    pub fn verify(&self, event: DepositEvent) -> VerifiedDepositEvent {
        let data = DepositData {
            pubkey: event.pubkey,
            withdrawal_credentials: event.withdrawal_credentials,
            amount: event.amount,
            signature: event.signature,
        };

        let root_matches = self.crypto.deposit_data_root(&data) == event.deposit_data_root;
        let valid =
            root_matches && verify_deposit_signature(self.crypto.as_ref(), &data, self.fork_version);
        if !valid {
            debug!(
                "deposit {} at block {} is invalid (root matches: {root_matches})",
                event.pubkey, event.block_number
            );
        }

        VerifiedDepositEvent { event, valid }
    }

    /// Formats and verifies one raw event.
    pub fn verify_raw(&self, raw: &RawDepositEvent) -> Result<VerifiedDepositEvent> {
        Ok(self.verify(self.format(raw)?))
    }

    /// Formats and verifies a batch, failing on the first malformed event.
    pub fn verify_all(&self, raws: &[RawDepositEvent]) -> Result<Vec<VerifiedDepositEvent>> {
        let verified = raws
            .iter()
            .map(|raw| self.verify_raw(raw))
            .collect::<Result<Vec<_>>>()?;

        let invalid = verified.iter().filter(|e| !e.valid).count();
        if invalid > 0 {
            warn!("⚠️ {invalid} of {} deposit events failed verification", verified.len());
        }
        Ok(verified)
    }
}
