//! Staking module, operator and signing key types.
//!
//! Registry types mirror the keys API payloads (camelCase JSON). [`StakingModuleData`] is the
//! per-cycle classification result handed to whoever decides to pause or unvet.

use alloy::primitives::{Address, B256};
use serde::{Deserialize, Serialize};

use crate::deposit::{BlsPublicKey, BlsSignature, LogPosition};

/// A signing key as reported by the key registry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryKey {
    /// Validator public key.
    pub key: BlsPublicKey,
    /// Deposit signature submitted together with the key.
    pub deposit_signature: BlsSignature,
    /// Operator the key belongs to.
    pub operator_index: u64,
    /// Whether a deposit was already made with this key.
    pub used: bool,
    /// Whether the key is within the operator's vetted limit.
    pub vetted: bool,
    /// Index of the key inside the operator's key list.
    pub index: u64,
    /// Staking module contract the key is registered in.
    pub module_address: Address,
}

/// An operator as reported by the key registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistryOperator {
    /// Operator index inside its module.
    pub index: u64,
    /// Whether the operator is active.
    pub active: bool,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
    /// Number of vetted keys.
    pub staking_limit: u64,
    /// Number of keys already used for deposits.
    pub used_signing_keys: u64,
    /// Total number of keys.
    pub total_signing_keys: u64,
    /// Staking module contract the operator belongs to.
    pub module_address: Address,
}

/// A staking module as reported by the key registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StakingModule {
    /// Staking router module id.
    pub id: u64,
    /// Module contract address.
    pub staking_module_address: Address,
    /// Keys nonce of the module.
    pub nonce: u64,
    /// Block hash of the last change to the module's keys or operators.
    pub last_changed_block_hash: B256,
    /// Human readable name.
    #[serde(default)]
    pub name: String,
}

/// The block a registry response was computed at.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BlockSnapshot {
    /// Block number.
    pub block_number: u64,
    /// Block hash.
    pub block_hash: B256,
}

/// Keys and operators of one module at a registry snapshot.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleRegistry {
    /// The module itself.
    pub module: StakingModule,
    /// All keys of the module.
    pub keys: Vec<RegistryKey>,
    /// All operators of the module.
    pub operators: Vec<RegistryOperator>,
}

/// A `SigningKeyAdded` event from a staking module contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SigningKeyEvent {
    /// Operator the key was added for.
    pub operator_index: u64,
    /// The added key.
    pub key: BlsPublicKey,
    /// Module contract that emitted the event.
    pub module_address: Address,
    /// Index of the log inside the block.
    pub log_index: u64,
    /// Block the event was emitted in.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: B256,
}

impl SigningKeyEvent {
    /// Chain position of this event.
    pub fn position(&self) -> LogPosition {
        LogPosition::new(self.block_number, self.log_index)
    }
}

/// Classification of a single module's keys at one block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StakingModuleData {
    /// Block the classification was computed at.
    pub block_hash: B256,
    /// Staking router module id.
    pub staking_module_id: u64,
    /// Module contract address.
    pub staking_module_address: Address,
    /// Keys nonce of the module.
    pub nonce: u64,
    /// Block hash of the last change to the module's keys or operators.
    pub last_changed_block_hash: B256,
    /// Every vetted key of the module.
    pub vetted_keys: Vec<RegistryKey>,
    /// Vetted keys without a deposit yet.
    pub vetted_unused_keys: Vec<RegistryKey>,
    /// Vetted unused keys that duplicate another key.
    pub duplicated_keys: Vec<RegistryKey>,
    /// Duplicates whose original could not be determined from chain events.
    pub unresolved_duplicated_keys: Vec<RegistryKey>,
    /// Vetted unused keys whose deposit signature does not verify.
    pub invalid_keys: Vec<RegistryKey>,
    /// Vetted unused keys that were deposited to outside the protocol first.
    pub front_run_keys: Vec<RegistryKey>,
    /// Whether the staking router reports the module as inactive.
    pub is_module_deposits_paused: bool,
}

impl StakingModuleData {
    /// Whether any key of the module needs to be unvetted.
    pub fn has_keys_to_unvet(&self) -> bool {
        !self.duplicated_keys.is_empty() || !self.invalid_keys.is_empty()
    }

    /// Whether a deposit was made to one of the module's keys outside the protocol.
    pub fn has_front_run(&self) -> bool {
        !self.front_run_keys.is_empty()
    }
}
