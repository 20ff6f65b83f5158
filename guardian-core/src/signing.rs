//! Guardian message signing.
//!
//! The security module recovers the guardian from a raw secp256k1 signature over
//! `keccak256(prefix ++ fields)`, with every numeric field packed as a 32 byte word. This module
//! builds those payloads and signs them with the guardian key.

use alloy::primitives::{Address, Bytes, B256, U256};
use k256::ecdsa::{RecoveryId, SigningKey};
use serde::{Deserialize, Serialize};
use sha3::{Digest, Keccak256};
use snafu::Snafu;

/// Errors raised while loading a key or signing.
#[derive(Debug, Snafu)]
pub enum SigningError {
    /// The private key bytes are not a valid secp256k1 scalar.
    #[snafu(display("Invalid guardian private key"))]
    InvalidPrivateKey,

    /// The signer failed to produce a signature.
    #[snafu(display("Failed to sign guardian message: {message}"))]
    SignFailed {
        /// Error reported by the signer.
        message: String,
    },
}

/// Specialized `Result` type for signing.
pub type Result<T, E = SigningError> = core::result::Result<T, E>;

/// A secp256k1 signature in the shape the security module accepts.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GuardianSignature {
    /// The `r` scalar.
    pub r: B256,
    /// The `s` scalar.
    pub s: B256,
    /// Recovery byte, 27 or 28.
    pub v: u8,
    /// EIP-2098 compact `s` with the parity in the top bit.
    #[serde(rename = "_vs")]
    pub vs: B256,
}

/// The guardian's signing key and the address derived from it.
#[derive(Clone)]
pub struct GuardianKey {
    signing_key: SigningKey,
    address: Address,
}

impl std::fmt::Debug for GuardianKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GuardianKey")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl GuardianKey {
    /// Loads a key from its 32 raw bytes.
    pub fn from_bytes(private_key: &[u8]) -> Result<Self> {
        let signing_key =
            SigningKey::from_slice(private_key).map_err(|_| SigningError::InvalidPrivateKey)?;
        let address = public_key_address(&signing_key);
        Ok(Self {
            signing_key,
            address,
        })
    }

    /// The Ethereum address of the guardian.
    pub fn address(&self) -> Address {
        self.address
    }

    /// Signs `keccak256(payload)`.
    pub fn sign_payload(&self, payload: &[u8]) -> Result<GuardianSignature> {
        let digest = Keccak256::new_with_prefix(payload);
        let (signature, recovery_id) = self
            .signing_key
            .sign_digest_recoverable(digest)
            .map_err(|e| SigningError::SignFailed {
                message: e.to_string(),
            })?;

        let r = B256::from_slice(&signature.r().to_bytes());
        let s = B256::from_slice(&signature.s().to_bytes());
        Ok(compose_signature(r, s, recovery_id))
    }
}

fn compose_signature(r: B256, s: B256, recovery_id: RecoveryId) -> GuardianSignature {
    let mut vs = s;
    if recovery_id.is_y_odd() {
        vs.0[0] |= 0x80;
    }
    GuardianSignature {
        r,
        s,
        v: 27 + recovery_id.to_byte(),
        vs,
    }
}

fn public_key_address(signing_key: &SigningKey) -> Address {
    let encoded = signing_key.verifying_key().to_encoded_point(false);
    // Skip the 0x04 prefix of the uncompressed point
    let hash = Keccak256::digest(&encoded.as_bytes()[1..]);
    Address::from_slice(&hash[12..])
}

fn word(value: u64) -> [u8; 32] {
    U256::from(value).to_be_bytes::<32>()
}

/// Payload of a deposit attestation.
pub fn deposit_payload(
    prefix: B256,
    block_number: u64,
    block_hash: B256,
    deposit_root: B256,
    staking_module_id: u64,
    nonce: u64,
) -> Vec<u8> {
    [
        prefix.0,
        word(block_number),
        block_hash.0,
        deposit_root.0,
        word(staking_module_id),
        word(nonce),
    ]
    .concat()
}

/// Payload of a per-module pause.
pub fn pause_v2_payload(prefix: B256, block_number: u64, staking_module_id: u64) -> Vec<u8> {
    [prefix.0, word(block_number), word(staking_module_id)].concat()
}

/// Payload of a protocol wide pause.
pub fn pause_v3_payload(prefix: B256, block_number: u64) -> Vec<u8> {
    [prefix.0, word(block_number)].concat()
}

/// Payload of an unvet request.
pub fn unvet_payload(
    prefix: B256,
    block_number: u64,
    block_hash: B256,
    staking_module_id: u64,
    nonce: u64,
    operator_ids: &Bytes,
    vetted_keys_by_operator: &Bytes,
) -> Vec<u8> {
    let mut payload = [
        prefix.0,
        word(block_number),
        block_hash.0,
        word(staking_module_id),
        word(nonce),
    ]
    .concat();
    payload.extend_from_slice(operator_ids);
    payload.extend_from_slice(vetted_keys_by_operator);
    payload
}
