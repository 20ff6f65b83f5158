//! # Key State Aggregator
//!
//! Cross-references the operator key listings of every staking module with chain data and
//! classifies the vetted unused keys of each module:
//!
//! - **duplicated**: the same pubkey is registered more than once and this copy is not the original,
//! - **unresolved duplicated**: duplicated, but the original cannot be told from chain events,
//! - **invalid**: the stored deposit signature does not verify for the protocol credentials,
//! - **front-run**: somebody deposited to the pubkey outside the protocol, or before the key was
//!   even registered.
//!
//! Every computation is a pure function of its inputs, so identical inputs always produce
//! identical results.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::num::NonZeroUsize;
use std::sync::{Arc, Mutex, PoisonError};

use alloy::primitives::{Address, B256};
use futures::future::try_join_all;
use guardian_core::crypto::{verify_deposit_signature, DepositCrypto};
use guardian_core::deposit::{BlsPublicKey, BlsSignature, LogPosition, VerifiedDepositEvent};
use guardian_core::keys::{ModuleRegistry, RegistryKey, RegistryOperator, SigningKeyEvent, StakingModuleData};
use guardian_core::ssz::{DepositData, DEPOSIT_AMOUNT_GWEI};
use log::{debug, warn};
use lru::LruCache;
use snafu::{ResultExt, Snafu};

/// Errors returned by [`KeyStateAggregator`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum AggregatorError {
    /// A classification task panicked or was cancelled.
    #[snafu(display("Key classification task failed: {source}"))]
    Join {
        /// Task error.
        source: tokio::task::JoinError,
    },
}

/// Identity of a key slot: module, operator and index inside the operator's key list.
pub type KeyId = (Address, u64, u64);

fn key_id(key: &RegistryKey) -> KeyId {
    (key.module_address, key.operator_index, key.index)
}

/// Per-module chain state read for the cycle.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ModuleState {
    /// Keys, operators and module metadata from the key registry.
    pub registry: ModuleRegistry,
    /// Whether the staking router allows deposits into the module.
    pub is_active: bool,
}

/// Chain data shared by every module of one cycle.
#[derive(Debug, Default)]
pub struct ClassificationContext {
    /// Block the classification is computed at.
    pub block_hash: B256,
    /// Withdrawal credentials of the protocol.
    pub protocol_wc: B256,
    /// Valid deposits by pubkey.
    valid_deposits: HashMap<BlsPublicKey, Vec<VerifiedDepositEvent>>,
    /// `SigningKeyAdded` events by pubkey.
    key_events: HashMap<BlsPublicKey, Vec<SigningKeyEvent>>,
}

impl ClassificationContext {
    /// Indexes deposits and signing key events for lookups by pubkey.
    pub fn new(
        block_hash: B256,
        protocol_wc: B256,
        deposits: &[VerifiedDepositEvent],
        key_events: &[SigningKeyEvent],
    ) -> Self {
        let mut valid_deposits: HashMap<BlsPublicKey, Vec<VerifiedDepositEvent>> = HashMap::new();
        for deposit in deposits.iter().filter(|d| d.valid) {
            valid_deposits
                .entry(deposit.event.pubkey)
                .or_default()
                .push(deposit.clone());
        }

        let mut by_key: HashMap<BlsPublicKey, Vec<SigningKeyEvent>> = HashMap::new();
        for event in key_events {
            by_key.entry(event.key).or_default().push(event.clone());
        }

        Self {
            block_hash,
            protocol_wc,
            valid_deposits,
            key_events: by_key,
        }
    }

    /// Earliest `SigningKeyAdded` of `key` in its module and operator.
    fn key_added_at(&self, key: &RegistryKey) -> Option<LogPosition> {
        self.key_events
            .get(&key.key)?
            .iter()
            .filter(|e| e.module_address == key.module_address && e.operator_index == key.operator_index)
            .map(SigningKeyEvent::position)
            .min()
    }
}

/// Outcome of the duplicate search over all modules.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DuplicateReport {
    /// Copies that are not the original.
    pub duplicated: HashSet<KeyId>,
    /// Copies of keys whose original could not be determined.
    pub unresolved: HashSet<KeyId>,
}

fn is_used(key: &RegistryKey, operators: &HashMap<(Address, u64), &RegistryOperator>) -> bool {
    key.used
        || operators
            .get(&(key.module_address, key.operator_index))
            .is_some_and(|operator| key.index < operator.used_signing_keys)
}

/// Splits the module's keys into vetted and vetted unused keys.
pub fn partition_keys(module: &ModuleRegistry) -> (Vec<RegistryKey>, Vec<RegistryKey>) {
    let address = module.module.staking_module_address;
    let operators = module
        .operators
        .iter()
        .map(|o| ((o.module_address, o.index), o))
        .collect();

    let vetted: Vec<RegistryKey> = module
        .keys
        .iter()
        .filter(|k| k.vetted && k.module_address == address)
        .cloned()
        .collect();
    let vetted_unused = vetted
        .iter()
        .filter(|k| !is_used(k, &operators))
        .cloned()
        .collect();
    (vetted, vetted_unused)
}

/// Finds duplicated keys across every module and operator.
///
/// Keys are grouped by pubkey. In a group with a used copy every unused copy is a duplicate. In a
/// group owned by one operator the lowest index is the original. Otherwise the operator whose
/// `SigningKeyAdded` came first keeps its lowest index copy. Every copy is a duplicate when several
/// operators registered the key in that first block, or when the first registration belongs to an
/// operator outside the group. When any operator of the group has no event at all the group is
/// unresolved.
pub fn find_duplicates(
    keys: &[RegistryKey],
    operators: &[RegistryOperator],
    context: &ClassificationContext,
) -> DuplicateReport {
    let operators: HashMap<(Address, u64), &RegistryOperator> = operators
        .iter()
        .map(|o| ((o.module_address, o.index), o))
        .collect();

    let mut groups: HashMap<BlsPublicKey, Vec<&RegistryKey>> = HashMap::new();
    for key in keys {
        groups.entry(key.key).or_default().push(key);
    }

    let mut report = DuplicateReport::default();
    for (pubkey, mut group) in groups.into_iter().filter(|(_, g)| g.len() > 1) {
        group.sort_by_key(|k| key_id(k));

        if group.iter().any(|k| is_used(k, &operators)) {
            report.duplicated.extend(
                group
                    .iter()
                    .filter(|k| !is_used(k, &operators))
                    .map(|k| key_id(k)),
            );
            continue;
        }

        let owners: Vec<(Address, u64)> = {
            let mut owners: Vec<_> = group
                .iter()
                .map(|k| (k.module_address, k.operator_index))
                .collect();
            owners.dedup();
            owners
        };

        if owners.len() == 1 {
            report.duplicated.extend(group.iter().skip(1).map(|k| key_id(k)));
            continue;
        }

        let events = context.key_events.get(&pubkey).map(Vec::as_slice).unwrap_or_default();
        let first_event = |owner: &(Address, u64)| {
            events
                .iter()
                .filter(|e| (e.module_address, e.operator_index) == *owner)
                .min_by_key(|e| e.position())
        };
        if owners.iter().any(|owner| first_event(owner).is_none()) {
            debug!("duplicated key {pubkey} has an operator without SigningKeyAdded");
            report.unresolved.extend(group.iter().map(|k| key_id(k)));
            continue;
        }

        // operators outside the group count too: a key first added elsewhere has no original here
        let Some(earliest_block) = events.iter().map(|e| e.block_number).min() else {
            continue;
        };
        let earliest: Vec<&SigningKeyEvent> = events
            .iter()
            .filter(|e| e.block_number == earliest_block)
            .collect();

        match earliest.as_slice() {
            [only] => {
                let owner = (only.module_address, only.operator_index);
                let original = group
                    .iter()
                    .find(|k| (k.module_address, k.operator_index) == owner)
                    .map(|k| key_id(k));
                report.duplicated.extend(
                    group
                        .iter()
                        .map(|k| key_id(k))
                        .filter(|id| Some(*id) != original),
                );
            }
            _ => report.duplicated.extend(group.iter().map(|k| key_id(k))),
        }
    }
    report
}

/// Vetted unused keys with a valid deposit outside the protocol credentials or before the key was
/// registered.
pub fn front_run_keys(keys: &[RegistryKey], context: &ClassificationContext) -> Vec<RegistryKey> {
    keys.iter()
        .filter(|key| {
            let Some(deposits) = context.valid_deposits.get(&key.key) else {
                return false;
            };
            let added_at = context.key_added_at(key);
            deposits.iter().any(|deposit| {
                deposit.event.withdrawal_credentials != context.protocol_wc
                    || added_at.is_some_and(|added| deposit.position() < added)
            })
        })
        .cloned()
        .collect()
}

/// Registry keys that were front-run at some point in the past.
///
/// A valid deposit with foreign credentials that precedes the earliest protocol deposit of the
/// same pubkey counts, provided the registry reports that pubkey as used.
pub fn historical_front_run(
    deposits: &[VerifiedDepositEvent],
    protocol_wc: B256,
    registry_keys: &[RegistryKey],
) -> Vec<RegistryKey> {
    let mut earliest_protocol: HashMap<BlsPublicKey, LogPosition> = HashMap::new();
    for deposit in deposits
        .iter()
        .filter(|d| d.valid && d.event.withdrawal_credentials == protocol_wc)
    {
        earliest_protocol
            .entry(deposit.event.pubkey)
            .and_modify(|position| *position = (*position).min(deposit.position()))
            .or_insert_with(|| deposit.position());
    }

    let front_run: HashSet<BlsPublicKey> = deposits
        .iter()
        .filter(|d| d.valid && d.event.withdrawal_credentials != protocol_wc)
        .filter(|d| {
            earliest_protocol
                .get(&d.event.pubkey)
                .is_some_and(|protocol| d.position() < *protocol)
        })
        .map(|d| d.event.pubkey)
        .collect();

    let keys: Vec<RegistryKey> = registry_keys
        .iter()
        .filter(|k| k.used && front_run.contains(&k.key))
        .cloned()
        .collect();
    if !keys.is_empty() {
        warn!("🚨 Found historical front-run of {} keys", keys.len());
    }
    keys
}

/// Per-operator new vetted counts: the lowest flagged key index of each operator.
pub fn new_vetted_amounts(keys: &[RegistryKey]) -> BTreeMap<u64, u64> {
    let mut amounts = BTreeMap::new();
    for key in keys {
        amounts
            .entry(key.operator_index)
            .and_modify(|amount: &mut u64| *amount = (*amount).min(key.index))
            .or_insert(key.index);
    }
    amounts
}

type SignatureMemoKey = (BlsPublicKey, BlsSignature, B256);

/// Deposit signature verdicts remembered between cycles.
pub const DEPOSIT_DATA_LRU_CACHE_SIZE: NonZeroUsize = match NonZeroUsize::new(50_000) {
    Some(size) => size,
    None => NonZeroUsize::MIN,
};

/// Builds [`StakingModuleData`] for every module of a cycle.
pub struct KeyStateAggregator {
    crypto: Arc<dyn DepositCrypto>,
    fork_version: [u8; 4],
    signature_memo: Mutex<LruCache<SignatureMemoKey, bool>>,
}

impl std::fmt::Debug for KeyStateAggregator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyStateAggregator")
            .field("fork_version", &self.fork_version)
            .finish_non_exhaustive()
    }
}

impl KeyStateAggregator {
    /// An aggregator verifying signatures for `fork_version` and remembering up to
    /// `signature_cache_size` verdicts.
    pub fn new(
        crypto: Arc<dyn DepositCrypto>,
        fork_version: [u8; 4],
        signature_cache_size: NonZeroUsize,
    ) -> Self {
        Self {
            crypto,
            fork_version,
            signature_memo: Mutex::new(LruCache::new(signature_cache_size)),
        }
    }

    /// Number of remembered signature verdicts.
    pub fn memoized_signatures(&self) -> usize {
        self.signature_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    /// Vetted unused keys whose deposit signature does not verify for `wc` and 32 ETH.
    pub fn invalid_keys(&self, keys: &[RegistryKey], wc: B256) -> Vec<RegistryKey> {
        keys.iter()
            .filter(|key| !self.is_signature_valid(key, wc))
            .cloned()
            .collect()
    }

    fn is_signature_valid(&self, key: &RegistryKey, wc: B256) -> bool {
        let memo_key = (key.key, key.deposit_signature, wc);
        if let Some(valid) = self
            .signature_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&memo_key)
            .copied()
        {
            return valid;
        }

        let valid = verify_deposit_signature(
            self.crypto.as_ref(),
            &DepositData {
                pubkey: key.key,
                withdrawal_credentials: wc,
                amount: DEPOSIT_AMOUNT_GWEI,
                signature: key.deposit_signature,
            },
            self.fork_version,
        );
        self.signature_memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .put(memo_key, valid);
        valid
    }

    /// Classifies one module against precomputed duplicates.
    pub fn classify_module(
        &self,
        context: &ClassificationContext,
        duplicates: &DuplicateReport,
        module: &ModuleState,
    ) -> StakingModuleData {
        let (vetted_keys, vetted_unused_keys) = partition_keys(&module.registry);
        let select = |ids: &HashSet<KeyId>| -> Vec<RegistryKey> {
            vetted_unused_keys
                .iter()
                .filter(|k| ids.contains(&key_id(k)))
                .cloned()
                .collect()
        };

        let info = &module.registry.module;
        let data = StakingModuleData {
            block_hash: context.block_hash,
            staking_module_id: info.id,
            staking_module_address: info.staking_module_address,
            nonce: info.nonce,
            last_changed_block_hash: info.last_changed_block_hash,
            duplicated_keys: select(&duplicates.duplicated),
            unresolved_duplicated_keys: select(&duplicates.unresolved),
            invalid_keys: self.invalid_keys(&vetted_unused_keys, context.protocol_wc),
            front_run_keys: front_run_keys(&vetted_unused_keys, context),
            is_module_deposits_paused: !module.is_active,
            vetted_keys,
            vetted_unused_keys,
        };

        if data.has_keys_to_unvet() || data.has_front_run() {
            warn!(
                "⚠️ Module {}: {} duplicated, {} invalid, {} front-run keys",
                data.staking_module_id,
                data.duplicated_keys.len(),
                data.invalid_keys.len(),
                data.front_run_keys.len()
            );
        }
        data
    }

    /// Classifies every module, one blocking task per module.
    pub async fn classify_modules(
        self: &Arc<Self>,
        context: ClassificationContext,
        modules: Vec<ModuleState>,
    ) -> Result<Vec<StakingModuleData>, AggregatorError> {
        let keys: Vec<RegistryKey> = modules
            .iter()
            .flat_map(|m| m.registry.keys.iter().cloned())
            .collect();
        let operators: Vec<RegistryOperator> = modules
            .iter()
            .flat_map(|m| m.registry.operators.iter().cloned())
            .collect();

        let context = Arc::new(context);
        let duplicates = {
            let context = context.clone();
            tokio::task::spawn_blocking(move || find_duplicates(&keys, &operators, &context))
                .await
                .context(JoinSnafu)?
        };
        let duplicates = Arc::new(duplicates);

        let tasks = modules.into_iter().map(|module| {
            let this = self.clone();
            let context = context.clone();
            let duplicates = duplicates.clone();
            tokio::task::spawn_blocking(move || {
                this.classify_module(&context, &duplicates, &module)
            })
        });
        try_join_all(tasks).await.context(JoinSnafu)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy::primitives::FixedBytes;
    use guardian_core::deposit::DepositEvent;
    use guardian_core::keys::StakingModule;

    use super::*;
    use crate::deposit_verifier::tests::FixedVerdict;

    const PROTOCOL_WC: B256 = B256::repeat_byte(0x01);

    fn module_address(id: u8) -> Address {
        Address::repeat_byte(id)
    }

    fn key(module: u8, operator: u64, index: u64, pubkey: u8) -> RegistryKey {
        RegistryKey {
            key: FixedBytes::repeat_byte(pubkey),
            deposit_signature: FixedBytes::repeat_byte(0xaa),
            operator_index: operator,
            used: false,
            vetted: true,
            index,
            module_address: module_address(module),
        }
    }

    fn used(mut key: RegistryKey) -> RegistryKey {
        key.used = true;
        key
    }

    fn added(module: u8, operator: u64, pubkey: u8, block_number: u64, log_index: u64) -> SigningKeyEvent {
        SigningKeyEvent {
            operator_index: operator,
            key: FixedBytes::repeat_byte(pubkey),
            module_address: module_address(module),
            log_index,
            block_number,
            block_hash: B256::with_last_byte(block_number as u8),
        }
    }

    fn deposit(pubkey: u8, wc: B256, block_number: u64, log_index: u64, valid: bool) -> VerifiedDepositEvent {
        VerifiedDepositEvent {
            event: DepositEvent {
                pubkey: FixedBytes::repeat_byte(pubkey),
                withdrawal_credentials: wc,
                amount: DEPOSIT_AMOUNT_GWEI,
                signature: FixedBytes::repeat_byte(0xbb),
                tx_hash: B256::ZERO,
                block_number,
                block_hash: B256::with_last_byte(block_number as u8),
                log_index,
                index: FixedBytes::ZERO,
                deposit_count: 0,
                deposit_data_root: B256::ZERO,
            },
            valid,
        }
    }

    fn registry(id: u8, keys: Vec<RegistryKey>) -> ModuleRegistry {
        ModuleRegistry {
            module: StakingModule {
                id: id as u64,
                staking_module_address: module_address(id),
                nonce: 7,
                last_changed_block_hash: B256::repeat_byte(0x0c),
                name: format!("module-{id}"),
            },
            keys,
            operators: Vec::new(),
        }
    }

    fn context(deposits: &[VerifiedDepositEvent], events: &[SigningKeyEvent]) -> ClassificationContext {
        ClassificationContext::new(B256::repeat_byte(0xbb), PROTOCOL_WC, deposits, events)
    }

    fn ids(keys: &[&RegistryKey]) -> HashSet<KeyId> {
        keys.iter().map(|k| key_id(k)).collect()
    }

    #[test]
    fn partition_uses_operator_counters_and_module_address() {
        let mut module = registry(1, vec![key(1, 0, 0, 1), key(1, 0, 1, 2), key(1, 0, 2, 3), key(2, 0, 3, 4)]);
        module.keys[2].vetted = false;
        module.operators.push(RegistryOperator {
            index: 0,
            active: true,
            name: "op".into(),
            staking_limit: 10,
            used_signing_keys: 1,
            total_signing_keys: 3,
            module_address: module_address(1),
        });

        let (vetted, vetted_unused) = partition_keys(&module);
        assert_eq!(vetted.len(), 2);
        assert_eq!(vetted_unused, vec![key(1, 0, 1, 2)]);
    }

    #[test]
    fn single_operator_keeps_the_lowest_index() {
        let keys = vec![key(1, 0, 5, 9), key(1, 0, 2, 9), key(1, 0, 8, 9)];
        let report = find_duplicates(&keys, &[], &context(&[], &[]));

        assert_eq!(report.duplicated, ids(&[&keys[0], &keys[2]]));
        assert!(report.unresolved.is_empty());
    }

    #[test]
    fn used_copies_make_every_unused_copy_a_duplicate() {
        let keys = vec![used(key(1, 0, 0, 9)), key(1, 3, 0, 9), key(2, 1, 4, 9)];
        let report = find_duplicates(&keys, &[], &context(&[], &[]));

        assert_eq!(report.duplicated, ids(&[&keys[1], &keys[2]]));
    }

    #[test]
    fn earliest_registration_wins_across_operators() {
        let keys = vec![key(1, 0, 3, 9), key(1, 0, 4, 9), key(1, 1, 0, 9)];
        let events = vec![added(1, 1, 9, 100, 0), added(1, 0, 9, 120, 0), added(1, 0, 9, 121, 0)];
        let report = find_duplicates(&keys, &[], &context(&[], &events));

        assert_eq!(report.duplicated, ids(&[&keys[0], &keys[1]]));
        assert!(report.unresolved.is_empty());
    }

    #[test]
    fn registrations_in_the_same_block_are_all_duplicates() {
        let keys = vec![key(1, 0, 3, 9), key(2, 1, 0, 9)];
        let events = vec![added(1, 0, 9, 100, 4), added(2, 1, 9, 100, 2)];
        let report = find_duplicates(&keys, &[], &context(&[], &events));

        assert_eq!(report.duplicated, ids(&[&keys[0], &keys[1]]));
    }

    #[test]
    fn earlier_registration_by_another_operator_duplicates_every_copy() {
        let keys = vec![key(1, 0, 3, 9), key(1, 1, 0, 9)];
        let events = vec![
            added(1, 0, 9, 20, 0),
            added(1, 1, 9, 30, 0),
            added(2, 5, 9, 10, 0),
        ];
        let report = find_duplicates(&keys, &[], &context(&[], &events));

        assert_eq!(report.duplicated, ids(&[&keys[0], &keys[1]]));
        assert!(report.unresolved.is_empty());
    }

    #[test]
    fn missing_registration_leaves_the_group_unresolved() {
        let keys = vec![key(1, 0, 3, 9), key(1, 1, 0, 9), key(1, 2, 0, 7)];
        let events = vec![added(1, 0, 9, 100, 0)];
        let report = find_duplicates(&keys, &[], &context(&[], &events));

        assert!(report.duplicated.is_empty());
        assert_eq!(report.unresolved, ids(&[&keys[0], &keys[1]]));
    }

    #[test]
    fn deposit_before_registration_is_front_run() {
        let vetted = key(1, 0, 0, 5);
        let events = vec![added(1, 0, 5, 500, 0)];
        let deposits = vec![deposit(5, PROTOCOL_WC, 400, 0, true)];

        let front_run = front_run_keys(&[vetted.clone()], &context(&deposits, &events));
        assert_eq!(front_run, vec![vetted]);
    }

    #[test]
    fn only_valid_foreign_deposits_front_run() {
        let keys = vec![key(1, 0, 0, 5), key(1, 0, 1, 6), key(1, 0, 2, 7)];
        let events = vec![added(1, 0, 5, 10, 0), added(1, 0, 6, 10, 1), added(1, 0, 7, 10, 2)];
        let deposits = vec![
            deposit(5, B256::repeat_byte(0xee), 600, 0, true),
            deposit(6, B256::repeat_byte(0xee), 600, 1, false),
            deposit(7, PROTOCOL_WC, 600, 2, true),
        ];

        let front_run = front_run_keys(&keys, &context(&deposits, &events));
        assert_eq!(front_run, vec![keys[0].clone()]);
    }

    #[test]
    fn historical_front_run_needs_a_used_registry_key() {
        let foreign = B256::repeat_byte(0xee);
        let deposits = vec![
            deposit(5, foreign, 100, 3, true),
            deposit(5, PROTOCOL_WC, 100, 4, true),
            deposit(6, PROTOCOL_WC, 200, 0, true),
            deposit(6, foreign, 201, 0, true),
            deposit(7, foreign, 100, 0, false),
            deposit(7, PROTOCOL_WC, 300, 0, true),
        ];
        let registry_keys = vec![used(key(1, 0, 0, 5)), used(key(1, 0, 1, 6)), used(key(1, 0, 2, 7))];

        assert_eq!(
            historical_front_run(&deposits, PROTOCOL_WC, &registry_keys),
            vec![registry_keys[0].clone()]
        );
        assert!(historical_front_run(&deposits, PROTOCOL_WC, &[key(1, 0, 0, 5)]).is_empty());
    }

    #[test]
    fn new_vetted_amounts_take_the_lowest_flagged_index() {
        let keys = vec![key(1, 4, 9, 1), key(1, 4, 3, 2), key(1, 1, 6, 3)];
        let amounts = new_vetted_amounts(&keys);
        assert_eq!(amounts.into_iter().collect::<Vec<_>>(), vec![(1, 6), (4, 3)]);
    }

    struct CountingCrypto {
        calls: AtomicUsize,
    }

    impl DepositCrypto for CountingCrypto {
        fn verify_signature(&self, _pubkey: &[u8], _message: &B256, _signature: &[u8]) -> bool {
            self.calls.fetch_add(1, Ordering::SeqCst);
            false
        }

        fn deposit_data_root(&self, data: &DepositData) -> B256 {
            guardian_core::ssz::deposit_data_root(data)
        }
    }

    #[test]
    fn signature_checks_are_memoized() {
        let crypto = Arc::new(CountingCrypto {
            calls: AtomicUsize::new(0),
        });
        let aggregator =
            KeyStateAggregator::new(crypto.clone(), [0; 4], DEPOSIT_DATA_LRU_CACHE_SIZE);
        let keys = vec![key(1, 0, 0, 1), key(1, 0, 1, 2)];

        assert_eq!(aggregator.invalid_keys(&keys, PROTOCOL_WC).len(), 2);
        assert_eq!(aggregator.invalid_keys(&keys, PROTOCOL_WC).len(), 2);
        assert_eq!(crypto.calls.load(Ordering::SeqCst), 2);

        aggregator.invalid_keys(&keys, B256::repeat_byte(0x02));
        assert_eq!(crypto.calls.load(Ordering::SeqCst), 4);
    }

    #[test]
    fn signature_memo_evicts_the_least_recently_checked() {
        let crypto = Arc::new(CountingCrypto {
            calls: AtomicUsize::new(0),
        });
        let capacity = NonZeroUsize::new(2).unwrap();
        let aggregator = KeyStateAggregator::new(crypto.clone(), [0; 4], capacity);
        let keys = vec![key(1, 0, 0, 1), key(1, 0, 1, 2), key(1, 0, 2, 3)];

        aggregator.invalid_keys(&keys, PROTOCOL_WC);
        assert_eq!(crypto.calls.load(Ordering::SeqCst), 3);
        assert_eq!(aggregator.memoized_signatures(), 2);

        // the last two stay cached, the first was evicted
        aggregator.invalid_keys(&keys[1..], PROTOCOL_WC);
        assert_eq!(crypto.calls.load(Ordering::SeqCst), 3);
        aggregator.invalid_keys(&keys[..1], PROTOCOL_WC);
        assert_eq!(crypto.calls.load(Ordering::SeqCst), 4);
        assert_eq!(aggregator.memoized_signatures(), 2);
    }

    fn cycle_inputs() -> (Vec<VerifiedDepositEvent>, Vec<SigningKeyEvent>, Vec<ModuleState>) {
        let deposits = vec![
            deposit(3, PROTOCOL_WC, 400, 0, true),
            deposit(4, B256::repeat_byte(0xee), 410, 0, true),
        ];
        let events = vec![
            added(1, 0, 3, 500, 0),
            added(1, 0, 9, 90, 0),
            added(2, 0, 9, 95, 0),
        ];
        let modules = vec![
            ModuleState {
                registry: registry(1, vec![key(1, 0, 0, 3), key(1, 0, 1, 9), key(1, 0, 2, 4)]),
                is_active: true,
            },
            ModuleState {
                registry: registry(2, vec![key(2, 0, 0, 9), key(2, 0, 1, 8)]),
                is_active: false,
            },
        ];
        (deposits, events, modules)
    }

    #[tokio::test]
    async fn modules_are_classified_in_order() {
        let aggregator = Arc::new(KeyStateAggregator::new(
            Arc::new(FixedVerdict(true)),
            [0; 4],
            DEPOSIT_DATA_LRU_CACHE_SIZE,
        ));
        let (deposits, events, modules) = cycle_inputs();

        let data = aggregator
            .classify_modules(context(&deposits, &events), modules)
            .await
            .unwrap();

        assert_eq!(data.len(), 2);
        let first = &data[0];
        assert_eq!(first.staking_module_id, 1);
        assert_eq!(first.vetted_unused_keys.len(), 3);
        assert_eq!(first.front_run_keys, vec![key(1, 0, 0, 3), key(1, 0, 2, 4)]);
        assert!(first.duplicated_keys.is_empty());
        assert!(first.invalid_keys.is_empty());
        assert!(!first.is_module_deposits_paused);

        let second = &data[1];
        assert_eq!(second.duplicated_keys, vec![key(2, 0, 0, 9)]);
        assert!(second.is_module_deposits_paused);
        assert!(second.has_keys_to_unvet());
    }

    #[tokio::test]
    async fn classification_is_idempotent() {
        let aggregator = Arc::new(KeyStateAggregator::new(
            Arc::new(FixedVerdict(false)),
            [0; 4],
            DEPOSIT_DATA_LRU_CACHE_SIZE,
        ));
        let (deposits, events, modules) = cycle_inputs();

        let first = aggregator
            .classify_modules(context(&deposits, &events), modules.clone())
            .await
            .unwrap();
        let second = aggregator
            .classify_modules(context(&deposits, &events), modules)
            .await
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(first[0].invalid_keys.len(), 3);
    }
}
