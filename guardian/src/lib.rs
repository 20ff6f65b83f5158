//! # Deposit Guardian
//!
//! A daemon that watches the deposit contract and the staking modules of a staking protocol,
//! verifies that deposits and operator keys are consistent, and broadcasts signed guardian
//! messages so that guardians can pause deposits or unvet keys when something is wrong.
//!
//! ## Modules
//! - [`provider`]: JSON-RPC access with metrics, retries and a stall watchdog.
//! - [`event_cache`]: Persisted, versioned caches of chain events.
//! - [`deposit_registry`] and [`signing_keys_registry`]: Event histories kept up to date per cycle.
//! - [`key_state`]: Classification of operator keys.
//! - [`messenger`]: Guardian protocol messages and their publication.
//! - [`guardian`]: The per-block cycle tying everything together.

/// Lock/unlock mutex serializing message publication.
pub mod async_mutex;

/// Runtime configuration.
pub mod config;

/// Typed reads of the deposit contract, staking router and deposit security module.
pub mod contracts;

/// Deposit history with integrity checks against the contract root.
pub mod deposit_registry;

/// Decoding and verification of deposit logs.
pub mod deposit_verifier;

/// File backed event caches with reorg detection.
pub mod event_cache;

/// Unrecoverable conditions and the channel that reports them.
pub mod fatal;

/// The guardian cycle.
pub mod guardian;

/// Duplicate, invalid and front-run key detection.
pub mod key_state;

/// Keys API client.
pub mod keys_api;

/// Guardian protocol messages.
pub mod messenger;

/// Prometheus metrics.
pub mod metrics;

/// Metered JSON-RPC provider with block tag handling and range fall-over.
pub mod provider;

/// Raw JSON-RPC transports.
pub mod rpc;

/// `SigningKeyAdded` event history of the staking modules.
pub mod signing_keys_registry;

/// Pub/sub transports for guardian messages.
pub mod transport;

/// Packing of unvet requests.
pub mod unvetting;

/// Detects a chain head that stopped moving.
pub mod watchdog;
