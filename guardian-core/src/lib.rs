//! # Guardian Core
//!
//! Shared types and cryptographic helpers for the deposit guardian.
//!
//! ## Modules
//! - [`deposit`]: Deposit contract events and event groups.
//! - [`keys`]: Operator keys, registry snapshots and per-module classification results.
//! - [`ssz`]: Deposit data hashing and the incremental deposit tree.
//! - [`crypto`]: The BLS verification seam and its `blst` implementation.
//! - [`signing`]: ECDSA signing of guardian messages.

/// Deposit contract events as they are read from chain and cached.
pub mod deposit;

/// Staking module, operator and key registry types.
pub mod keys;

/// SSZ hash tree roots for deposit data and the deposit contract merkle tree.
///
/// ## Features
/// - **Deposit data roots**: computes the node inserted into the deposit contract tree.
/// - **Signing roots**: computes the message a depositor signs with their BLS key.
/// - **Deposit tree**: an incremental merkle tree matching `get_deposit_root`.
pub mod ssz;

/// BLS signature verification used for deposits and vetted keys.
pub mod crypto;

/// Guardian message payload encoding and secp256k1 signatures.
pub mod signing;
