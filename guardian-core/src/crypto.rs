//! BLS verification for deposits.
//!
//! The guardian never implements pairing math itself. Everything goes through [`DepositCrypto`],
//! which [`BlstCrypto`] implements on top of the `blst` library.

use alloy::primitives::B256;
use blst::min_pk::{PublicKey, Signature};
use blst::BLST_ERROR;

use crate::ssz::{self, DepositData};

/// Domain separation tag of the proof-of-possession BLS scheme used by the beacon chain.
const BLS_DST: &[u8] = b"BLS_SIG_BLS12381G2_XMD:SHA-256_SSWU_RO_POP_";

/// Genesis fork version of the beacon chain paired with an execution chain id.
pub fn genesis_fork_version(chain_id: u64) -> Option<[u8; 4]> {
    match chain_id {
        1 => Some([0x00, 0x00, 0x00, 0x00]),
        5 => Some([0x00, 0x00, 0x10, 0x20]),
        17000 => Some([0x01, 0x01, 0x70, 0x00]),
        560048 => Some([0x10, 0x00, 0x09, 0x10]),
        _ => None,
    }
}

/// BLS primitives consumed by the verifier and the key aggregator.
pub trait DepositCrypto: Send + Sync {
    /// Verifies `signature` by `pubkey` over a 32 byte signing root.
    ///
    /// Malformed keys or signatures verify as `false`.
    fn verify_signature(&self, pubkey: &[u8], message: &B256, signature: &[u8]) -> bool;

    /// Hash tree root of the deposit data.
    fn deposit_data_root(&self, data: &DepositData) -> B256;
}

/// [`DepositCrypto`] backed by `blst`.
#[derive(Clone, Copy, Debug, Default)]
pub struct BlstCrypto;

impl DepositCrypto for BlstCrypto {
    fn verify_signature(&self, pubkey: &[u8], message: &B256, signature: &[u8]) -> bool {
        let Ok(pubkey) = PublicKey::key_validate(pubkey) else {
            return false;
        };
        let Ok(signature) = Signature::from_bytes(signature) else {
            return false;
        };

        signature.verify(true, message.as_slice(), BLS_DST, &[], &pubkey, false)
            == BLST_ERROR::BLST_SUCCESS
    }

    fn deposit_data_root(&self, data: &DepositData) -> B256 {
        ssz::deposit_data_root(data)
    }
}

/// Verifies the deposit signature of `data` for the network with the given fork version.
pub fn verify_deposit_signature(
    crypto: &dyn DepositCrypto,
    data: &DepositData,
    fork_version: [u8; 4],
) -> bool {
    let signing_root = ssz::deposit_signing_root(
        &data.pubkey,
        &data.withdrawal_credentials,
        data.amount,
        fork_version,
    );
    crypto.verify_signature(
        data.pubkey.as_slice(),
        &signing_root,
        data.signature.as_slice(),
    )
}
