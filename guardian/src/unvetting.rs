//! Packing of unvet requests.
//!
//! The security module takes the operators to unvet as two packed byte strings: operator ids as
//! 8 byte big-endian words and the new vetted key counts as 16 byte big-endian words. A single
//! transaction can only touch a bounded number of operators, so the request is split into chunks.

use alloy::primitives::Bytes;
use guardian_core::keys::{RegistryKey, StakingModuleData};
use log::info;

use crate::key_state::new_vetted_amounts;

/// One unvet request for the security module.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UnvetChunk {
    /// Packed 8 byte operator ids.
    pub operator_ids: Bytes,
    /// Packed 16 byte new vetted counts, in the order of `operator_ids`.
    pub vetted_keys_by_operator: Bytes,
}

/// Keys that make the module unvet: invalid, duplicated and front-run keys.
pub fn keys_to_unvet(data: &StakingModuleData) -> Vec<RegistryKey> {
    data.invalid_keys
        .iter()
        .chain(&data.duplicated_keys)
        .chain(&data.front_run_keys)
        .cloned()
        .collect()
}

/// Splits the new vetted amounts of `keys` into chunks of at most `max_operators` operators.
pub fn unvet_chunks(keys: &[RegistryKey], max_operators: u64) -> Vec<UnvetChunk> {
    let amounts: Vec<(u64, u64)> = new_vetted_amounts(keys).into_iter().collect();
    if amounts.is_empty() {
        info!("Did not find keys for unvetting");
        return Vec::new();
    }

    let chunk_size = usize::try_from(max_operators.max(1)).unwrap_or(usize::MAX);
    amounts
        .chunks(chunk_size)
        .map(|chunk| UnvetChunk {
            operator_ids: chunk
                .iter()
                .flat_map(|(operator, _)| operator.to_be_bytes())
                .collect::<Vec<u8>>()
                .into(),
            vetted_keys_by_operator: chunk
                .iter()
                .flat_map(|(_, amount)| u128::from(*amount).to_be_bytes())
                .collect::<Vec<u8>>()
                .into(),
        })
        .collect()
}
