//! `SigningKeyAdded` history of every staking module.
//!
//! The key aggregator uses these events to tell which operator registered a duplicated key first
//! and whether a deposit was made before its key was even registered. Events are cached up to the
//! finalized block; anything newer is fetched fresh for each cycle. The cache version embeds a hash
//! of the module address list, so adding or replacing a module rebuilds the cache.

use alloy::primitives::{keccak256, Address, FixedBytes, B256};
use alloy::rpc::types::{Filter, Log};
use alloy::sol_types::SolEvent;
use guardian_core::deposit::EventGroup;
use guardian_core::keys::SigningKeyEvent;
use log::{info, warn};
use snafu::{ResultExt, Snafu};

use crate::contracts::IStakingModule;
use crate::event_cache::{CacheError, EventCache, EventCacheConfig};
use crate::fatal::Fatal;
use crate::provider::{BlockTag, ProviderError, ResilientProvider};

/// Blocks fetched per historical `eth_getLogs` request.
pub const SIGNING_KEYS_EVENTS_STEP: u64 = 10_000;

/// Cache file name of the signing keys registry.
pub const SIGNING_KEYS_CACHE_KEY: &str = "signing-keys";

/// First block any staking module could have emitted `SigningKeyAdded`.
pub fn earliest_module_deployment_block(chain_id: u64) -> u64 {
    match chain_id {
        1 => 11_473_216,
        _ => 0,
    }
}

/// Errors returned by [`SigningKeysRegistry`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum SigningKeysError {
    /// A chain read failed.
    #[snafu(display("Signing keys RPC failure: {source}"))]
    Provider {
        /// Provider error.
        source: ProviderError,
    },

    /// The cache rejected an update.
    #[snafu(display("Signing keys cache update failed: {source}"))]
    Cache {
        /// Cache error.
        source: CacheError,
    },

    /// A `SigningKeyAdded` log could not be decoded.
    #[snafu(display("Malformed SigningKeyAdded event: {message}"))]
    MalformedEvent {
        /// What was wrong with it.
        message: String,
    },
}

impl SigningKeysError {
    /// The fatal condition behind this error, if any.
    pub fn fatal(&self) -> Option<Fatal> {
        match self {
            SigningKeysError::MalformedEvent { message } => Some(Fatal::MalformedChainData {
                message: message.clone(),
            }),
            _ => None,
        }
    }
}

/// Result alias of this module.
pub type Result<T, E = SigningKeysError> = std::result::Result<T, E>;

/// Signing key events up to a block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SigningKeyEvents {
    /// Cached and fresh events in chain order.
    pub group: EventGroup<SigningKeyEvent>,
    /// `false` when fresh events at the requested block came from another fork.
    pub is_valid: bool,
}

/// Cache version for `base` and a module address list.
pub fn cache_version(base: &str, module_addresses: &[Address]) -> String {
    let mut addresses = module_addresses.to_vec();
    addresses.sort();
    addresses.dedup();
    let bytes: Vec<u8> = addresses.iter().flat_map(|a| a.0 .0).collect();
    let digest = keccak256(bytes);
    format!("{base}-{}", hex::encode(&digest[..8]))
}

fn decode_log(log: &Log) -> Result<SigningKeyEvent> {
    let malformed = |message: String| SigningKeysError::MalformedEvent { message };
    let decoded = log
        .log_decode::<IStakingModule::SigningKeyAdded>()
        .map_err(|e| malformed(e.to_string()))?;
    let event = &decoded.inner.data;

    let key = FixedBytes::<48>::try_from(event.pubkey.as_ref())
        .map_err(|_| malformed(format!("pubkey has {} bytes", event.pubkey.len())))?;
    Ok(SigningKeyEvent {
        operator_index: event.nodeOperatorId.saturating_to(),
        key,
        module_address: log.address(),
        log_index: log
            .log_index
            .ok_or_else(|| malformed("log index is missing".into()))?,
        block_number: log
            .block_number
            .ok_or_else(|| malformed("block number is missing".into()))?,
        block_hash: log
            .block_hash
            .ok_or_else(|| malformed("block hash is missing".into()))?,
    })
}

/// Cached `SigningKeyAdded` events of the known staking modules.
///
/// The cache file is only opened once the module list is known, since its version depends on it.
#[derive(Debug)]
pub struct SigningKeysRegistry {
    provider: ResilientProvider,
    config: EventCacheConfig,
    base_version: String,
    module_addresses: Vec<Address>,
    cache: Option<EventCache<SigningKeyEvent>>,
}

impl SigningKeysRegistry {
    /// A registry whose cache under `dir` is opened by the first
    /// [`set_module_addresses`](Self::set_module_addresses).
    pub fn new(
        provider: ResilientProvider,
        dir: std::path::PathBuf,
        chain_id: u64,
        base_version: &str,
    ) -> Self {
        Self {
            provider,
            config: EventCacheConfig {
                dir,
                chain_id,
                key: SIGNING_KEYS_CACHE_KEY.to_owned(),
                version: base_version.to_owned(),
                deployment_block: earliest_module_deployment_block(chain_id),
            },
            base_version: base_version.to_owned(),
            module_addresses: Vec::new(),
            cache: None,
        }
    }

    /// Loads the cache under `dir` for `module_addresses`.
    pub fn open(
        provider: ResilientProvider,
        dir: std::path::PathBuf,
        chain_id: u64,
        base_version: &str,
        module_addresses: Vec<Address>,
    ) -> Self {
        let mut registry = Self::new(provider, dir, chain_id, base_version);
        registry.set_module_addresses(module_addresses);
        registry
    }

    /// The cache, once a module list is set.
    pub fn cache(&self) -> Option<&EventCache<SigningKeyEvent>> {
        self.cache.as_ref()
    }

    /// Modules whose events are tracked.
    pub fn module_addresses(&self) -> &[Address] {
        &self.module_addresses
    }

    /// Switches to a new module list, dropping the cache if the list changed.
    pub fn set_module_addresses(&mut self, module_addresses: Vec<Address>) {
        let version = cache_version(&self.base_version, &module_addresses);
        if let Some(cache) = &self.cache {
            if cache.headers().version == version {
                self.module_addresses = module_addresses;
                return;
            }
            info!("🔁 Staking module list changed, rebuilding signing keys cache");
            cache.delete();
        }

        self.cache = Some(EventCache::load(EventCacheConfig {
            version,
            ..self.config.clone()
        }));
        self.module_addresses = module_addresses;
    }

    /// Caches events up to the finalized block.
    pub async fn update_events_cache(&mut self) -> Result<()> {
        if self.module_addresses.is_empty() {
            return Ok(());
        }
        let Some(end_block) = self.cache.as_ref().map(EventCache::end_block) else {
            return Ok(());
        };

        let finalized = self
            .provider
            .get_block(BlockTag::Finalized)
            .await
            .context(ProviderSnafu)?
            .number;
        if end_block > finalized {
            warn!(
                "⚠️ Signing keys cache ends at {end_block} which is ahead of finalized block {finalized}"
            );
            return Ok(());
        }

        let mut from_block = end_block + 1;
        while from_block <= finalized {
            let chunk_end = finalized.min(from_block + SIGNING_KEYS_EVENTS_STEP - 1);
            let events = self.fetch_events(from_block, chunk_end).await?;
            let count = events.len();
            if let Some(cache) = self.cache.as_mut() {
                cache.extend(events, chunk_end).context(CacheSnafu)?;
            }
            info!("🔑 Cached {count} signing key events for blocks {from_block}..={chunk_end}");
            from_block = chunk_end + 1;
        }
        Ok(())
    }

    /// Fetches events of every module in `from_block..=to_block`.
    pub async fn fetch_events(&self, from_block: u64, to_block: u64) -> Result<Vec<SigningKeyEvent>> {
        let filter = Filter::new()
            .address(self.module_addresses.clone())
            .event_signature(IStakingModule::SigningKeyAdded::SIGNATURE_HASH);
        let provider = &self.provider;
        let logs = provider
            .fetch_events_fall_over(from_block, to_block, |start, end| {
                let filter = filter.clone().from_block(start).to_block(end);
                async move { provider.get_logs(&filter).await }
            })
            .await
            .context(ProviderSnafu)?;

        let mut events = logs.iter().map(decode_log).collect::<Result<Vec<_>>>()?;
        events.sort_by_key(SigningKeyEvent::position);
        Ok(events)
    }

    /// Cached events plus fresh ones up to `block_number`.
    pub async fn get_updated_signing_key_events(
        &self,
        block_number: u64,
        block_hash: B256,
    ) -> Result<SigningKeyEvents> {
        let Some(cache) = &self.cache else {
            return Ok(SigningKeyEvents {
                group: EventGroup::empty(self.config.deployment_block, block_number),
                is_valid: false,
            });
        };

        let end_block = cache.end_block();
        let mut group = EventGroup::new(cache.events().to_vec(), cache.headers().start_block, end_block);
        let mut is_valid = cache.validate_against_head(block_number);

        if end_block < block_number {
            let fresh = self.fetch_events(end_block + 1, block_number).await?;
            if fresh
                .iter()
                .any(|e| e.block_number == block_number && e.block_hash != block_hash)
            {
                warn!("⚠️ Fresh signing key events at block {block_number} belong to another fork");
                is_valid = false;
            }
            group.append(EventGroup::new(fresh, end_block + 1, block_number));
        }

        Ok(SigningKeyEvents { group, is_valid })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    use alloy::primitives::{Bytes, U256};
    use prometheus::Registry;
    use serde_json::{json, Value};

    use super::*;
    use crate::event_cache::tests::temp_dir;
    use crate::metrics::GuardianMetrics;
    use crate::rpc::testing::MockTransport;

    fn module(byte: u8) -> Address {
        Address::repeat_byte(byte)
    }

    fn key_log(module_address: Address, operator: u64, key: u8, block: u64, log_index: u64) -> Value {
        let event = IStakingModule::SigningKeyAdded {
            nodeOperatorId: U256::from(operator),
            pubkey: Bytes::from(vec![key; 48]),
        };
        let log = Log {
            inner: alloy::primitives::Log {
                address: module_address,
                data: event.encode_log_data(),
            },
            block_hash: Some(B256::with_last_byte(block as u8)),
            block_number: Some(block),
            log_index: Some(log_index),
            ..Default::default()
        };
        serde_json::to_value(log).unwrap()
    }

    fn hex_u64(value: &Value) -> u64 {
        u64::from_str_radix(value.as_str().unwrap().trim_start_matches("0x"), 16).unwrap()
    }

    type Ranges = Arc<Mutex<Vec<(u64, u64)>>>;

    fn scripted_provider(logs: Vec<(u64, Value)>, finalized: u64) -> (ResilientProvider, Ranges) {
        let ranges = Arc::new(Mutex::new(Vec::new()));
        let seen = ranges.clone();
        let transport = MockTransport::new(move |method, params| match method {
            "eth_getBlockByNumber" => Ok(json!({
                "number": format!("{finalized:#x}"),
                "hash": B256::with_last_byte(finalized as u8),
                "parentHash": B256::ZERO,
                "timestamp": "0x0",
            })),
            "eth_getLogs" => {
                let from = hex_u64(&params[0]["fromBlock"]);
                let to = hex_u64(&params[0]["toBlock"]);
                seen.lock().unwrap().push((from, to));
                Ok(Value::Array(
                    logs.iter()
                        .filter(|(block, _)| (from..=to).contains(block))
                        .map(|(_, log)| log.clone())
                        .collect(),
                ))
            }
            _ => Ok(Value::Null),
        });
        let provider = ResilientProvider::new(
            Arc::new(transport),
            GuardianMetrics::new(&Registry::new()).unwrap(),
        )
        .with_retry_delay(Duration::ZERO);
        (provider, ranges)
    }

    fn registry(dir: &std::path::Path, logs: Vec<(u64, Value)>, finalized: u64) -> (SigningKeysRegistry, Ranges) {
        let (provider, ranges) = scripted_provider(logs, finalized);
        let registry = SigningKeysRegistry::open(
            provider,
            dir.to_path_buf(),
            17000,
            "1",
            vec![module(1), module(2)],
        );
        (registry, ranges)
    }

    #[test]
    fn cache_version_ignores_module_order() {
        let a = cache_version("1", &[module(1), module(2)]);
        assert_eq!(a, cache_version("1", &[module(2), module(1), module(2)]));
        assert_ne!(a, cache_version("1", &[module(1)]));
        assert!(a.starts_with("1-"));
    }

    #[tokio::test]
    async fn events_are_cached_up_to_the_finalized_block() {
        let dir = temp_dir("signing-keys");
        let logs = vec![
            (30, key_log(module(1), 0, 7, 30, 1)),
            (30, key_log(module(2), 4, 8, 30, 0)),
            (90, key_log(module(2), 5, 9, 90, 0)),
        ];
        let (mut registry, ranges) = registry(&dir, logs, 60);

        registry.update_events_cache().await.unwrap();
        assert_eq!(registry.cache().unwrap().end_block(), 60);
        let cached: Vec<_> = registry.cache().unwrap().events().iter().map(|e| e.operator_index).collect();
        // sorted by log index inside the block
        assert_eq!(cached, vec![4, 0]);
        assert_eq!(*ranges.lock().unwrap(), vec![(1, 60)]);

        let all = registry
            .get_updated_signing_key_events(90, B256::with_last_byte(90))
            .await
            .unwrap();
        assert!(all.is_valid);
        assert_eq!(all.group.events.len(), 3);
        assert_eq!(all.group.events[2].module_address, module(2));
        assert_eq!(registry.cache().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn changing_the_module_list_rebuilds_the_cache() {
        let dir = temp_dir("signing-keys-modules");
        let (mut registry, _) = registry(&dir, vec![(30, key_log(module(1), 0, 7, 30, 0))], 60);
        registry.update_events_cache().await.unwrap();
        assert_eq!(registry.cache().unwrap().len(), 1);

        registry.set_module_addresses(vec![module(2), module(1)]);
        assert_eq!(registry.cache().unwrap().len(), 1);

        registry.set_module_addresses(vec![module(1), module(2), module(3)]);
        assert!(registry.cache().unwrap().is_empty());
        assert_eq!(registry.cache().unwrap().end_block(), 0);
        assert_eq!(registry.module_addresses().len(), 3);
    }

    #[tokio::test]
    async fn cached_events_survive_a_restart() {
        let dir = temp_dir("signing-keys-restart");
        let logs = vec![(30, key_log(module(1), 0, 7, 30, 0))];
        let (mut registry, _) = registry(&dir, logs.clone(), 60);
        registry.update_events_cache().await.unwrap();
        drop(registry);

        // startup opens the registry before the keys API has named any module
        let (provider, ranges) = scripted_provider(logs, 60);
        let mut restarted = SigningKeysRegistry::new(provider, dir.clone(), 17000, "1");
        assert!(restarted.cache().is_none());
        restarted.update_events_cache().await.unwrap();

        restarted.set_module_addresses(vec![module(2), module(1)]);
        restarted.update_events_cache().await.unwrap();
        let cache = restarted.cache().unwrap();
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.end_block(), 60);
        assert!(ranges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn events_before_any_module_list_are_untrusted() {
        let dir = temp_dir("signing-keys-unset");
        let (provider, ranges) = scripted_provider(Vec::new(), 60);
        let registry = SigningKeysRegistry::new(provider, dir, 17000, "1");

        let events = registry
            .get_updated_signing_key_events(90, B256::with_last_byte(90))
            .await
            .unwrap();
        assert!(!events.is_valid);
        assert!(events.group.events.is_empty());
        assert!(ranges.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn short_pubkeys_are_malformed() {
        let dir = temp_dir("signing-keys-malformed");
        let event = IStakingModule::SigningKeyAdded {
            nodeOperatorId: U256::from(1),
            pubkey: Bytes::from(vec![1; 47]),
        };
        let log = serde_json::to_value(Log {
            inner: alloy::primitives::Log {
                address: module(1),
                data: event.encode_log_data(),
            },
            block_hash: Some(B256::ZERO),
            block_number: Some(10),
            log_index: Some(0),
            ..Default::default()
        })
        .unwrap();
        let (mut registry, _) = registry(&dir, vec![(10, log)], 60);

        let error = registry.update_events_cache().await.unwrap_err();
        assert!(error.fatal().is_some());
    }
}
