//! # Event Cache
//!
//! A persisted, versioned store of verified chain events covering a contiguous block range.
//!
//! The record lives in one JSON file per network and cache key:
//!
//! ```text
//! <cache_dir>/chain-<chain_id>/<key>.json
//! { "headers": { "startBlock", "endBlock", "version" }, "data": [...], "lastValidEvent": ... }
//! ```
//!
//! Events are kept sorted by `(blockNumber, logIndex)`. The cache only grows by appending
//! ranges that start where it ends, and is written atomically after every extension. A record with
//! a different schema version is discarded and rebuilt from the deployment block. The last valid
//! event doubles as a reorg checkpoint: when its block hash no longer matches the chain, the tail
//! is rewound and refetched.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use alloy::primitives::B256;
use guardian_core::deposit::{LogPosition, VerifiedDepositEvent};
use guardian_core::keys::SigningKeyEvent;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

/// An event that can be stored in an [`EventCache`].
pub trait CachedEvent: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Chain position of the event.
    fn position(&self) -> LogPosition;

    /// Hash of the block the event was emitted in.
    fn block_hash(&self) -> B256;

    /// Whether the event can serve as a reorg checkpoint.
    fn is_valid(&self) -> bool {
        true
    }
}

impl CachedEvent for VerifiedDepositEvent {
    fn position(&self) -> LogPosition {
        self.event.position()
    }

    fn block_hash(&self) -> B256 {
        self.event.block_hash
    }

    fn is_valid(&self) -> bool {
        self.valid
    }
}

impl CachedEvent for SigningKeyEvent {
    fn position(&self) -> LogPosition {
        SigningKeyEvent::position(self)
    }

    fn block_hash(&self) -> B256 {
        self.block_hash
    }
}

/// Errors returned by [`EventCache`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum CacheError {
    /// The new end block is behind the cached one.
    #[snafu(display("New end block {new_end_block} is behind cached end block {end_block}"))]
    EndBlockBehind {
        /// Cached end block.
        end_block: u64,
        /// Requested end block.
        new_end_block: u64,
    },

    /// An appended event lies before the cached range end.
    #[snafu(display("Event at block {block_number} is before cached end block {end_block}"))]
    EventBeforeRange {
        /// Block of the event.
        block_number: u64,
        /// Cached end block.
        end_block: u64,
    },

    /// An appended event lies after the new end block.
    #[snafu(display("Event at block {block_number} is after new end block {new_end_block}"))]
    EventAfterRange {
        /// Block of the event.
        block_number: u64,
        /// Requested end block.
        new_end_block: u64,
    },

    /// An appended event does not sort strictly after its predecessor.
    #[snafu(display("Event at {position:?} does not follow {previous:?}"))]
    EventOutOfOrder {
        /// Position of the offending event.
        position: LogPosition,
        /// Position of the event before it.
        previous: LogPosition,
    },

    /// The record could not be serialized.
    #[snafu(display("Unable to serialize cache: {source}"))]
    Serialize {
        /// Serialization error.
        source: serde_json::Error,
    },

    /// The record could not be written.
    #[snafu(display("Unable to write cache {}: {source}", path.display()))]
    Persist {
        /// Target file.
        path: PathBuf,
        /// IO error.
        source: io::Error,
    },
}

impl CacheError {
    /// Whether the error is a range violation rather than an IO failure.
    pub fn is_range_error(&self) -> bool {
        matches!(
            self,
            CacheError::EndBlockBehind { .. }
                | CacheError::EventBeforeRange { .. }
                | CacheError::EventAfterRange { .. }
                | CacheError::EventOutOfOrder { .. }
        )
    }
}

/// Result alias of this module.
pub type Result<T, E = CacheError> = std::result::Result<T, E>;

/// Block range and schema version of a cache record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheHeaders {
    /// First block covered.
    pub start_block: u64,
    /// Last block fetched.
    pub end_block: u64,
    /// Schema version tag.
    pub version: String,
}

/// The persisted form of a cache.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", bound(deserialize = "E: Deserialize<'de>"))]
pub struct CacheRecord<E> {
    /// Range and version.
    pub headers: CacheHeaders,
    /// Events, ascending by position.
    pub data: Vec<E>,
    /// Last event, in ascending order, that is valid.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_valid_event: Option<E>,
}

impl<E: CachedEvent> CacheRecord<E> {
    /// An empty record anchored at `block`.
    pub fn empty(block: u64, version: &str) -> Self {
        Self {
            headers: CacheHeaders {
                start_block: block,
                end_block: block,
                version: version.to_owned(),
            },
            data: Vec::new(),
            last_valid_event: None,
        }
    }

    /// Reorg checkpoint: block number and hash of the last valid event.
    pub fn checkpoint(&self) -> Option<(u64, B256)> {
        self.last_valid_event
            .as_ref()
            .map(|event| (event.position().block_number, event.block_hash()))
    }

    fn is_sorted(&self) -> bool {
        self.data
            .windows(2)
            .all(|pair| pair[0].position() < pair[1].position())
    }

    fn refresh_last_valid_event(&mut self) {
        self.last_valid_event = self.data.iter().rev().find(|e| e.is_valid()).cloned();
    }
}

/// Outcome of comparing the cache checkpoint with the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Consistency {
    /// The checkpoint block is still part of the chain.
    Consistent,
    /// Nothing valid is cached yet.
    NoCheckpoint,
    /// The checkpoint block was replaced.
    Reorganized {
        /// Checkpoint block number.
        block_number: u64,
        /// Hash stored in the cache.
        cached_hash: B256,
        /// Hash reported by the chain.
        chain_hash: B256,
    },
}

/// Where and how a cache is stored.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EventCacheConfig {
    /// Root cache directory.
    pub dir: PathBuf,
    /// Chain the events belong to.
    pub chain_id: u64,
    /// File name without extension.
    pub key: String,
    /// Schema version tag.
    pub version: String,
    /// Block a fresh cache starts at.
    pub deployment_block: u64,
}

impl EventCacheConfig {
    /// Directory of this chain's caches.
    pub fn chain_dir(&self) -> PathBuf {
        self.dir.join(format!("chain-{}", self.chain_id))
    }

    /// Path of the cache file.
    pub fn path(&self) -> PathBuf {
        self.chain_dir().join(format!("{}.json", self.key))
    }

    fn temp_path(&self) -> PathBuf {
        self.chain_dir().join(format!("{}.json.tmp", self.key))
    }
}

/// A persisted event cache.
#[derive(Debug)]
pub struct EventCache<E> {
    config: EventCacheConfig,
    record: CacheRecord<E>,
}

impl<E: CachedEvent> EventCache<E> {
    /// Loads the cache described by `config`.
    ///
    /// Never fails: a missing, unreadable or outdated file yields an empty record anchored at the
    /// deployment block.
    pub fn load(config: EventCacheConfig) -> Self {
        let path = config.path();
        let record = match fs::read(&path) {
            Ok(bytes) => match serde_json::from_slice::<CacheRecord<E>>(&bytes) {
                Ok(record) if record.headers.version != config.version => {
                    info!(
                        "🧹 Cache {} has version {}, expected {}, rebuilding",
                        path.display(),
                        record.headers.version,
                        config.version
                    );
                    remove_best_effort(&path);
                    None
                }
                Ok(record) if !record.is_sorted() => {
                    warn!("⚠️ Cache {} is not sorted, rebuilding", path.display());
                    remove_best_effort(&path);
                    None
                }
                Ok(record) => Some(record),
                Err(e) => {
                    warn!("⚠️ Cache {} is unreadable ({e}), rebuilding", path.display());
                    remove_best_effort(&path);
                    None
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => None,
            Err(e) => {
                warn!("⚠️ Unable to read cache {} ({e})", path.display());
                None
            }
        };

        let record = record
            .unwrap_or_else(|| CacheRecord::empty(config.deployment_block, &config.version));
        Self { config, record }
    }

    /// Location and identity of this cache.
    pub fn config(&self) -> &EventCacheConfig {
        &self.config
    }

    /// Headers and events as persisted.
    pub fn record(&self) -> &CacheRecord<E> {
        &self.record
    }

    /// Covered block range and version.
    pub fn headers(&self) -> &CacheHeaders {
        &self.record.headers
    }

    /// Cached events, ascending.
    pub fn events(&self) -> &[E] {
        &self.record.data
    }

    /// Last block the cache covers.
    pub fn end_block(&self) -> u64 {
        self.record.headers.end_block
    }

    /// Number of cached events.
    pub fn len(&self) -> usize {
        self.record.data.len()
    }

    /// Whether no event is cached.
    pub fn is_empty(&self) -> bool {
        self.record.data.is_empty()
    }

    /// Appends `events` fetched up to `new_end_block` and persists the result.
    pub fn extend(&mut self, events: Vec<E>, new_end_block: u64) -> Result<()> {
        let end_block = self.record.headers.end_block;
        if new_end_block < end_block {
            return EndBlockBehindSnafu {
                end_block,
                new_end_block,
            }
            .fail();
        }

        let mut previous = self.record.data.last().map(CachedEvent::position);
        for event in &events {
            let position = event.position();
            if position.block_number < end_block {
                return EventBeforeRangeSnafu {
                    block_number: position.block_number,
                    end_block,
                }
                .fail();
            }
            if position.block_number > new_end_block {
                return EventAfterRangeSnafu {
                    block_number: position.block_number,
                    new_end_block,
                }
                .fail();
            }
            if let Some(previous) = previous {
                if position <= previous {
                    return EventOutOfOrderSnafu { position, previous }.fail();
                }
            }
            previous = Some(position);
        }

        if let Some(last_valid) = events.iter().rev().find(|e| e.is_valid()) {
            self.record.last_valid_event = Some(last_valid.clone());
        }
        self.record.data.extend(events);
        self.record.headers.end_block = new_end_block;
        self.persist()
    }

    /// Reorg checkpoint of the cached data.
    pub fn checkpoint(&self) -> Option<(u64, B256)> {
        self.record.checkpoint()
    }

    /// Compares the checkpoint with the hash the chain reports for the checkpoint block.
    pub fn detect_inconsistency(&self, chain_hash: B256) -> Consistency {
        match self.checkpoint() {
            None => Consistency::NoCheckpoint,
            Some((_, cached_hash)) if cached_hash == chain_hash => Consistency::Consistent,
            Some((block_number, cached_hash)) => Consistency::Reorganized {
                block_number,
                cached_hash,
                chain_hash,
            },
        }
    }

    /// Drops every event at or after the checkpoint block and moves the end block before it.
    ///
    /// Returns the new end block. Callers repeat until the cache is consistent.
    pub fn rewind(&mut self) -> Result<u64> {
        let Some((block_number, _)) = self.checkpoint() else {
            return Ok(self.record.headers.end_block);
        };

        self.record
            .data
            .retain(|event| event.position().block_number < block_number);
        self.record.refresh_last_valid_event();
        self.record.headers.end_block = block_number
            .saturating_sub(1)
            .max(self.record.headers.start_block);
        info!(
            "⏪ Cache {} rewound to block {}",
            self.config.key, self.record.headers.end_block
        );
        self.persist()?;
        Ok(self.record.headers.end_block)
    }

    /// Whether the cache can be trusted against a chain head at `current_block`.
    ///
    /// A cache newer than the head means the node serves stale data.
    pub fn validate_against_head(&self, current_block: u64) -> bool {
        self.record.headers.end_block <= current_block
    }

    /// Replaces the record with an empty one and removes the file.
    pub fn reset(&mut self) {
        self.record = CacheRecord::empty(self.config.deployment_block, &self.config.version);
        self.delete();
    }

    /// Removes the cache file, best effort.
    pub fn delete(&self) {
        remove_best_effort(&self.config.path());
    }

    /// Removes temporary files and numbered batch files left over by older layouts.
    pub fn remove_stale_artifacts(&self) {
        let dir = self.config.chain_dir();
        let entries = match fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!("unable to list {}: {e}", dir.display());
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if is_stale_artifact(name, &self.config.key) {
                remove_best_effort(&entry.path());
            }
        }
    }

    fn persist(&self) -> Result<()> {
        let dir = self.config.chain_dir();
        fs::create_dir_all(&dir).context(PersistSnafu { path: dir })?;

        let bytes = serde_json::to_vec(&self.record).context(SerializeSnafu)?;
        let temp = self.config.temp_path();
        fs::write(&temp, bytes).context(PersistSnafu { path: temp.clone() })?;

        let path = self.config.path();
        fs::rename(&temp, &path).context(PersistSnafu { path })?;
        debug!(
            "cache {} persisted up to block {}",
            self.config.key, self.record.headers.end_block
        );
        Ok(())
    }
}

fn is_stale_artifact(name: &str, key: &str) -> bool {
    if name.ends_with(".tmp") {
        return true;
    }
    name.strip_prefix(key)
        .and_then(|rest| rest.strip_prefix('-'))
        .and_then(|rest| rest.strip_suffix(".json"))
        .is_some_and(|batch| !batch.is_empty() && batch.bytes().all(|b| b.is_ascii_digit()))
}

fn remove_best_effort(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => debug!("removed {}", path.display()),
        Err(e) => debug!("unable to remove {}: {e}", path.display()),
    }
}
