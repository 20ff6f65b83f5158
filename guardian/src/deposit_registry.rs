//! # Deposit Registry
//!
//! Keeps every deposit ever made to the deposit contract, verified and persisted in an
//! [`EventCache`], together with an incremental deposit tree that must reproduce the contract's
//! `get_deposit_root`.
//!
//! The cache trails the head by [`DEPOSIT_EVENTS_CACHE_LAG_BLOCKS`] so persisted data is unlikely to
//! be reorganized. Deposits above the cache are fetched fresh for every cycle and checked against
//! the head block hash and the contract root before anyone relies on them.

use std::sync::Arc;

use alloy::primitives::B256;
use alloy::rpc::types::Filter;
use alloy::sol_types::SolEvent;
use guardian_core::deposit::{DepositedEvents, EventGroup, VerifiedDepositEvent, VerifiedDepositEventGroup};
use guardian_core::ssz::DepositTree;
use log::{error, info, warn};
use snafu::{ResultExt, Snafu};

use crate::contracts::{DepositContract, IDepositContract};
use crate::deposit_verifier::{DepositVerifier, RawDepositEvent, VerifierError};
use crate::event_cache::{CacheError, Consistency, EventCache};
use crate::fatal::Fatal;
use crate::metrics::GuardianMetrics;
use crate::provider::{BlockTag, ProviderError, ResilientProvider};

/// Blocks fetched per historical `eth_getLogs` request.
pub const DEPOSIT_EVENTS_STEP: u64 = 10_000;

/// Distance between the head and the last persisted block.
pub const DEPOSIT_EVENTS_CACHE_LAG_BLOCKS: u64 = 100;

/// The persisted cache is extended once it trails `head - lag` by at least this many blocks.
pub const DEPOSIT_EVENTS_CACHE_UPDATE_BLOCK_RATE: u64 = 10;

/// Cache file name of the deposit registry.
pub const DEPOSIT_CACHE_KEY: &str = "deposits";

/// Block the deposit contract was deployed at.
pub fn deposit_deployment_block(chain_id: u64) -> Option<u64> {
    match chain_id {
        1 => Some(11_052_984),
        5 => Some(4_367_322),
        17000 | 560048 => Some(0),
        _ => None,
    }
}

/// Errors returned by [`DepositRegistry`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum DepositRegistryError {
    /// A chain read failed.
    #[snafu(display("Deposit registry RPC failure: {source}"))]
    Provider {
        /// Provider error.
        source: ProviderError,
    },

    /// A deposit log could not be decoded.
    #[snafu(display("{source}"))]
    Verifier {
        /// Verifier error.
        source: VerifierError,
    },

    /// The cache rejected an update.
    #[snafu(display("Deposit cache update failed: {source}"))]
    Cache {
        /// Cache error.
        source: CacheError,
    },

    /// Verification was interrupted.
    #[snafu(display("Deposit verification task failed: {source}"))]
    Join {
        /// Task error.
        source: tokio::task::JoinError,
    },

    /// The cached deposits do not reproduce the contract root.
    #[snafu(display(
        "Deposit tree root {tree_root} does not match contract root {contract_root} at block {block_number}"
    ))]
    RootMismatch {
        /// Block the roots were compared at.
        block_number: u64,
        /// Root of the locally built tree.
        tree_root: B256,
        /// Root reported by the contract.
        contract_root: B256,
    },
}

impl DepositRegistryError {
    /// The fatal condition behind this error, if any.
    pub fn fatal(&self) -> Option<Fatal> {
        match self {
            DepositRegistryError::Verifier { source } => Some(Fatal::MalformedChainData {
                message: source.to_string(),
            }),
            _ => None,
        }
    }
}

/// Result alias of this module.
pub type Result<T, E = DepositRegistryError> = std::result::Result<T, E>;

fn build_tree(events: &[VerifiedDepositEvent]) -> DepositTree {
    let mut tree = DepositTree::new();
    for event in events {
        tree.insert(event.event.deposit_data_root);
    }
    tree
}

/// Verified deposit history with an integrity-checked deposit tree.
#[derive(Debug)]
pub struct DepositRegistry {
    provider: ResilientProvider,
    contract: DepositContract,
    verifier: Arc<DepositVerifier>,
    cache: EventCache<VerifiedDepositEvent>,
    tree: DepositTree,
    metrics: GuardianMetrics,
}

impl DepositRegistry {
    /// Creates a registry on top of a loaded cache.
    pub fn new(
        provider: ResilientProvider,
        contract: DepositContract,
        verifier: DepositVerifier,
        cache: EventCache<VerifiedDepositEvent>,
        metrics: GuardianMetrics,
    ) -> Self {
        let tree = build_tree(cache.events());
        Self {
            provider,
            contract,
            verifier: Arc::new(verifier),
            cache,
            tree,
            metrics,
        }
    }

    /// The persisted deposit history.
    pub fn cache(&self) -> &EventCache<VerifiedDepositEvent> {
        &self.cache
    }

    /// Cleans stale cache artifacts and brings the cache up to date.
    pub async fn initialize(&mut self) -> Result<()> {
        self.cache.remove_stale_artifacts();
        info!(
            "📦 Deposit cache holds {} events up to block {}",
            self.cache.len(),
            self.cache.end_block()
        );
        self.update_events_cache().await
    }

    /// Extends the cache once it is [`DEPOSIT_EVENTS_CACHE_UPDATE_BLOCK_RATE`] blocks behind its
    /// target, whichever heads the caller happens to observe.
    pub async fn handle_new_block(&mut self, block_number: u64) -> Result<()> {
        let target = block_number.saturating_sub(DEPOSIT_EVENTS_CACHE_LAG_BLOCKS);
        if target.saturating_sub(self.cache.end_block()) < DEPOSIT_EVENTS_CACHE_UPDATE_BLOCK_RATE {
            return Ok(());
        }
        self.update_events_cache().await
    }

    /// Fetches, verifies and persists deposits up to `head - lag`, then checks the tree root.
    pub async fn update_events_cache(&mut self) -> Result<()> {
        let head = self.provider.block_number().await.context(ProviderSnafu)?;
        if !self.cache.validate_against_head(head) {
            warn!(
                "⚠️ Deposit cache ends at {} which is ahead of head {}, skipping update",
                self.cache.end_block(),
                head
            );
            return Ok(());
        }

        self.repair_reorganized_tail().await?;

        let to_block = head.saturating_sub(DEPOSIT_EVENTS_CACHE_LAG_BLOCKS);
        let mut from_block = self.cache.end_block() + 1;
        while from_block <= to_block {
            let chunk_end = to_block.min(from_block + DEPOSIT_EVENTS_STEP - 1);
            let group = self.fetch_events(from_block, chunk_end).await?;
            let count = group.events.len();
            let roots: Vec<B256> = group
                .events
                .iter()
                .map(|e| e.event.deposit_data_root)
                .collect();

            self.cache.extend(group.events, chunk_end).context(CacheSnafu)?;
            for root in roots {
                self.tree.insert(root);
            }
            info!(
                "📥 Cached {count} deposits for blocks {from_block}..={chunk_end} ({} total)",
                self.cache.len()
            );
            from_block = chunk_end + 1;
        }

        self.metrics
            .deposit_events_cached
            .set(self.cache.len() as i64);
        self.metrics
            .invalid_deposit_events
            .set(self.cache.events().iter().filter(|e| !e.valid).count() as i64);

        self.check_integrity().await
    }

    async fn repair_reorganized_tail(&mut self) -> Result<()> {
        while let Some((block_number, _)) = self.cache.checkpoint() {
            let block = self
                .provider
                .get_block(BlockTag::Number(block_number))
                .await
                .context(ProviderSnafu)?;
            match self.cache.detect_inconsistency(block.hash) {
                Consistency::Consistent | Consistency::NoCheckpoint => break,
                Consistency::Reorganized { cached_hash, .. } => {
                    warn!(
                        "⚠️ Cached deposit block {block_number} ({cached_hash}) was reorganized, rewinding"
                    );
                    self.cache.rewind().context(CacheSnafu)?;
                    self.tree = build_tree(self.cache.events());
                }
            }
        }
        Ok(())
    }

    async fn check_integrity(&mut self) -> Result<()> {
        let block_number = self.cache.end_block();
        let contract_root = self
            .contract
            .get_deposit_root(BlockTag::Number(block_number))
            .await
            .context(ProviderSnafu)?;
        let tree_root = self.tree.root();
        if tree_root != contract_root {
            error!(
                "❌ Deposit tree root {tree_root} differs from contract root {contract_root} at block {block_number}, resetting cache"
            );
            self.cache.reset();
            self.tree = DepositTree::new();
            return RootMismatchSnafu {
                block_number,
                tree_root,
                contract_root,
            }
            .fail();
        }
        Ok(())
    }

    /// Fetches and verifies deposits in `from_block..=to_block`.
    pub async fn fetch_events(
        &self,
        from_block: u64,
        to_block: u64,
    ) -> Result<VerifiedDepositEventGroup> {
        let filter = Filter::new()
            .address(self.contract.address())
            .event_signature(IDepositContract::DepositEvent::SIGNATURE_HASH);
        let provider = &self.provider;
        let logs = provider
            .fetch_events_fall_over(from_block, to_block, |start, end| {
                let filter = filter.clone().from_block(start).to_block(end);
                async move { provider.get_logs(&filter).await }
            })
            .await
            .context(ProviderSnafu)?;

        let raws = logs
            .iter()
            .map(RawDepositEvent::from_log)
            .collect::<std::result::Result<Vec<_>, _>>()
            .context(VerifierSnafu)?;

        let verifier = self.verifier.clone();
        let mut events = tokio::task::spawn_blocking(move || verifier.verify_all(&raws))
            .await
            .context(JoinSnafu)?
            .context(VerifierSnafu)?;
        events.sort_by_key(|e| e.event.position());

        Ok(EventGroup::new(events, from_block, to_block))
    }

    /// Every deposit up to `block_number`, with the integrity verdict for that block.
    ///
    /// Valid only when the cache is not ahead of the block, fresh deposits at the block carry
    /// `block_hash`, and the tree over all deposits matches the contract root at `block_hash`.
    pub async fn get_all_deposited_events(
        &self,
        block_number: u64,
        block_hash: B256,
    ) -> Result<DepositedEvents> {
        let end_block = self.cache.end_block();
        let mut is_valid = self.cache.validate_against_head(block_number);
        let mut group = EventGroup::new(
            self.cache.events().to_vec(),
            self.cache.headers().start_block,
            end_block,
        );
        let mut tree = self.tree.clone();

        if end_block < block_number {
            let fresh = self.fetch_events(end_block + 1, block_number).await?;
            let reorganized = fresh
                .events
                .iter()
                .any(|e| e.event.block_number == block_number && e.event.block_hash != block_hash);
            if reorganized {
                warn!("⚠️ Fresh deposits at block {block_number} belong to another fork");
                is_valid = false;
            }
            for event in &fresh.events {
                tree.insert(event.event.deposit_data_root);
            }
            group.append(fresh);
        }

        if is_valid {
            let contract_root = self
                .contract
                .get_deposit_root(BlockTag::canonical(block_hash))
                .await
                .context(ProviderSnafu)?;
            if contract_root != tree.root() {
                warn!(
                    "⚠️ Deposit root {contract_root} at block {block_number} does not match {} known deposits",
                    tree.node_count()
                );
                is_valid = false;
            }
        }

        Ok(DepositedEvents { group, is_valid })
    }
}
