//! SSZ hash tree roots for the deposit flow and the deposit contract merkle tree.

use alloy::primitives::B256;
use sha2::{Digest, Sha256};

use crate::deposit::{BlsPublicKey, BlsSignature};

/// Depth of the deposit contract merkle tree.
pub const DEPOSIT_CONTRACT_TREE_DEPTH: usize = 32;

/// Domain type for deposits.
pub const DOMAIN_DEPOSIT: [u8; 4] = [3, 0, 0, 0];

/// 32 ETH in gwei, the amount every vetted key is expected to be deposited with.
pub const DEPOSIT_AMOUNT_GWEI: u64 = 32_000_000_000;

/// The fields of a deposit covered by the deposit data root.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositData {
    /// Validator public key.
    pub pubkey: BlsPublicKey,
    /// Withdrawal credentials.
    pub withdrawal_credentials: B256,
    /// Amount in gwei.
    pub amount: u64,
    /// BLS signature over the deposit message.
    pub signature: BlsSignature,
}

/// sha256 of two concatenated 32 byte chunks.
pub fn hash_pair(left: &[u8; 32], right: &[u8; 32]) -> B256 {
    let mut hasher = Sha256::new();
    hasher.update(left);
    hasher.update(right);
    B256::from_slice(&hasher.finalize())
}

fn pubkey_root(pubkey: &BlsPublicKey) -> B256 {
    let mut chunks = [[0u8; 32]; 2];
    chunks[0].copy_from_slice(&pubkey[..32]);
    chunks[1][..16].copy_from_slice(&pubkey[32..]);
    hash_pair(&chunks[0], &chunks[1])
}

fn signature_root(signature: &BlsSignature) -> B256 {
    let mut chunks = [[0u8; 32]; 4];
    chunks[0].copy_from_slice(&signature[..32]);
    chunks[1].copy_from_slice(&signature[32..64]);
    chunks[2].copy_from_slice(&signature[64..]);
    let left = hash_pair(&chunks[0], &chunks[1]);
    let right = hash_pair(&chunks[2], &chunks[3]);
    hash_pair(&left.0, &right.0)
}

fn amount_chunk(amount: u64) -> [u8; 32] {
    let mut chunk = [0u8; 32];
    chunk[..8].copy_from_slice(&amount.to_le_bytes());
    chunk
}

/// Hash tree root of `DepositData`, the leaf the deposit contract inserts into its tree.
pub fn deposit_data_root(data: &DepositData) -> B256 {
    let left = hash_pair(&pubkey_root(&data.pubkey).0, &data.withdrawal_credentials.0);
    let right = hash_pair(&amount_chunk(data.amount), &signature_root(&data.signature).0);
    hash_pair(&left.0, &right.0)
}

/// Hash tree root of `DepositMessage`, the object a depositor signs.
pub fn deposit_message_root(
    pubkey: &BlsPublicKey,
    withdrawal_credentials: &B256,
    amount: u64,
) -> B256 {
    let left = hash_pair(&pubkey_root(pubkey).0, &withdrawal_credentials.0);
    let right = hash_pair(&amount_chunk(amount), &[0u8; 32]);
    hash_pair(&left.0, &right.0)
}

/// Deposit signing domain for a fork version. Deposits always use a zero genesis validators root.
pub fn deposit_domain(fork_version: [u8; 4]) -> [u8; 32] {
    let mut version_chunk = [0u8; 32];
    version_chunk[..4].copy_from_slice(&fork_version);
    let fork_data_root = hash_pair(&version_chunk, &[0u8; 32]);

    let mut domain = [0u8; 32];
    domain[..4].copy_from_slice(&DOMAIN_DEPOSIT);
    domain[4..].copy_from_slice(&fork_data_root[..28]);
    domain
}

/// The 32 byte message a deposit's BLS signature must cover.
pub fn deposit_signing_root(
    pubkey: &BlsPublicKey,
    withdrawal_credentials: &B256,
    amount: u64,
    fork_version: [u8; 4],
) -> B256 {
    let object_root = deposit_message_root(pubkey, withdrawal_credentials, amount);
    hash_pair(&object_root.0, &deposit_domain(fork_version))
}

/// Incremental merkle tree with the same layout as the deposit contract.
///
/// Only the left branch is stored, so inserting and computing the root are both `O(depth)`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DepositTree {
    branch: [B256; DEPOSIT_CONTRACT_TREE_DEPTH],
    zero_hashes: [B256; DEPOSIT_CONTRACT_TREE_DEPTH],
    node_count: u64,
}

impl Default for DepositTree {
    fn default() -> Self {
        Self::new()
    }
}

impl DepositTree {
    /// An empty tree.
    pub fn new() -> Self {
        let mut zero_hashes = [B256::ZERO; DEPOSIT_CONTRACT_TREE_DEPTH];
        for height in 0..DEPOSIT_CONTRACT_TREE_DEPTH - 1 {
            zero_hashes[height + 1] = hash_pair(&zero_hashes[height].0, &zero_hashes[height].0);
        }
        Self {
            branch: [B256::ZERO; DEPOSIT_CONTRACT_TREE_DEPTH],
            zero_hashes,
            node_count: 0,
        }
    }

    /// Number of inserted leaves.
    pub fn node_count(&self) -> u64 {
        self.node_count
    }

    /// Inserts the next deposit data root.
    pub fn insert(&mut self, leaf: B256) {
        self.node_count += 1;
        let mut node = leaf;
        let mut size = self.node_count;
        for height in 0..DEPOSIT_CONTRACT_TREE_DEPTH {
            if size & 1 == 1 {
                self.branch[height] = node;
                return;
            }
            node = hash_pair(&self.branch[height].0, &node.0);
            size /= 2;
        }
    }

    /// The root `get_deposit_root` would return for the same leaves.
    pub fn root(&self) -> B256 {
        let mut node = B256::ZERO;
        let mut size = self.node_count;
        for height in 0..DEPOSIT_CONTRACT_TREE_DEPTH {
            node = if size & 1 == 1 {
                hash_pair(&self.branch[height].0, &node.0)
            } else {
                hash_pair(&node.0, &self.zero_hashes[height].0)
            };
            size /= 2;
        }

        let mut length_chunk = [0u8; 32];
        length_chunk[..8].copy_from_slice(&self.node_count.to_le_bytes());
        hash_pair(&node.0, &length_chunk)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::b256;

    use super::*;

    #[test]
    fn empty_tree_matches_fresh_deposit_contract() {
        let tree = DepositTree::new();
        assert_eq!(
            tree.root(),
            b256!("d70a234731285c6804c2a4f56711ddb8c82c99740f207854891028af34e27e5e")
        );
    }

    #[test]
    fn single_leaf_root_is_leaf_hashed_with_zero_branches() {
        let leaf = B256::repeat_byte(1);
        let mut tree = DepositTree::new();
        tree.insert(leaf);

        let mut expected = leaf;
        let mut zero = B256::ZERO;
        for _ in 0..DEPOSIT_CONTRACT_TREE_DEPTH {
            expected = hash_pair(&expected.0, &zero.0);
            zero = hash_pair(&zero.0, &zero.0);
        }
        let mut length_chunk = [0u8; 32];
        length_chunk[0] = 1;

        assert_eq!(tree.node_count(), 1);
        assert_eq!(tree.root(), hash_pair(&expected.0, &length_chunk));
    }

    #[test]
    fn second_insert_hashes_into_first_branch() {
        let mut tree = DepositTree::new();
        tree.insert(B256::repeat_byte(1));
        tree.insert(B256::repeat_byte(2));

        assert_eq!(
            tree.branch[1],
            hash_pair(&B256::repeat_byte(1).0, &B256::repeat_byte(2).0)
        );
    }

    #[test]
    fn cloned_tree_diverges_independently() {
        let mut tree = DepositTree::new();
        tree.insert(B256::repeat_byte(7));
        let mut clone = tree.clone();
        clone.insert(B256::repeat_byte(8));

        assert_eq!(tree.node_count(), 1);
        assert_eq!(clone.node_count(), 2);
        assert_ne!(tree.root(), clone.root());
    }

    #[test]
    fn deposit_data_root_depends_on_every_field() {
        let data = DepositData {
            pubkey: BlsPublicKey::repeat_byte(1),
            withdrawal_credentials: B256::repeat_byte(2),
            amount: DEPOSIT_AMOUNT_GWEI,
            signature: BlsSignature::repeat_byte(3),
        };
        let root = deposit_data_root(&data);

        let mut other = data.clone();
        other.amount = 1_000_000_000;
        assert_ne!(root, deposit_data_root(&other));

        let mut other = data.clone();
        other.signature = BlsSignature::repeat_byte(4);
        assert_ne!(root, deposit_data_root(&other));
    }

    #[test]
    fn mainnet_deposit_domain_matches_known_value() {
        assert_eq!(
            B256::from(deposit_domain([0, 0, 0, 0])),
            b256!("03000000f5a5fd42d16a20302798ef6ed309979b43003d2320d9f0e8ea9831a9")
        );
    }

    #[test]
    fn deposit_domain_starts_with_domain_type() {
        let domain = deposit_domain([0, 0, 0, 0]);
        assert_eq!(&domain[..4], &DOMAIN_DEPOSIT);
        assert_ne!(deposit_domain([0, 0, 0, 0]), deposit_domain([1, 1, 0x70, 0]));
    }
}
