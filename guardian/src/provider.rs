//! # Resilient Provider
//!
//! A thin chain client over an [`RpcTransport`] that the rest of the guardian uses for every read.
//!
//! ## Features
//! - **Metering**: request counts, error counts and latency per JSON-RPC method.
//! - **Stall detection**: block numbers seen by the provider feed the [`StallWatchdog`].
//! - **Block tags**: `latest`, `finalized`, numbers and EIP-1898 block hashes.
//! - **Range fall-over**: log fetches that hit provider limits are split into small chunks.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{Address, Bytes, B256, U64};
use alloy::rpc::types::{EIP1186AccountProofResponse, Filter, Log};
use alloy::sol_types::SolCall;
use log::{debug, info, warn};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use snafu::{ResultExt, Snafu};
use tokio::time::sleep;

use crate::fatal::Fatal;
use crate::metrics::GuardianMetrics;
use crate::rpc::{RpcError, RpcTransport, BATCH_METHOD};
use crate::watchdog::StallWatchdog;

/// Block range used when a log query is split after a range-limit error.
pub const FALLBACK_CHUNK_SIZE: u64 = 50;

/// Delay before a failed log query is retried.
pub const FETCH_EVENTS_RETRY_TIMEOUT: Duration = Duration::from_secs(5);

/// Whole-range retries before a log query gives up.
pub const MAX_FETCH_RETRIES: usize = 3;

/// Attempts to resolve the chain id at startup.
const NETWORK_DETECTION_ATTEMPTS: usize = 3;

/// Errors returned by [`ResilientProvider`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum ProviderError {
    /// The transport or the node failed.
    #[snafu(display("{source}"))]
    Rpc {
        /// Transport error.
        source: RpcError,
    },

    /// The node answered with something that does not decode.
    #[snafu(display("Unable to decode {method} response: {source}"))]
    Decode {
        /// RPC method.
        method: String,
        /// Decoding error.
        source: serde_json::Error,
    },

    /// Contract call output does not match the ABI.
    #[snafu(display("Unable to decode call to {to}: {source}"))]
    AbiDecode {
        /// Called contract.
        to: Address,
        /// ABI error.
        source: alloy::sol_types::Error,
    },

    /// A log could not be decoded as the expected event.
    #[snafu(display("Unable to decode log: {message}"))]
    LogDecode {
        /// Decoding error.
        message: String,
    },

    /// The node does not know the requested block.
    #[snafu(display("Block {tag} not found"))]
    BlockNotFound {
        /// Requested tag.
        tag: String,
    },

    /// A batched exchange answered a different number of requests than it carried.
    #[snafu(display("Batch of {expected} requests returned {actual} responses"))]
    BatchSize {
        /// Requests sent.
        expected: usize,
        /// Responses received.
        actual: usize,
    },

    /// A log query kept failing.
    #[snafu(display("Fetching blocks {from_block}..={to_block} failed: {source}"))]
    FetchFailed {
        /// First block of the range.
        from_block: u64,
        /// Last block of the range.
        to_block: u64,
        /// Last error seen.
        source: Box<ProviderError>,
    },
}

impl ProviderError {
    /// Whether a smaller block range may succeed where this error occurred.
    pub fn is_range_limit(&self) -> bool {
        match self {
            ProviderError::Rpc { source } => source.is_range_limit(),
            _ => false,
        }
    }
}

/// Result alias of this module.
pub type Result<T, E = ProviderError> = std::result::Result<T, E>;

/// A block selector understood by every read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BlockTag {
    /// Head of the chain.
    Latest,
    /// Latest finalized block.
    Finalized,
    /// Latest safe block.
    Safe,
    /// A block by number.
    Number(u64),
    /// A block by hash (EIP-1898).
    Hash {
        /// Block hash.
        hash: B256,
        /// Fail when the block is not on the canonical chain.
        require_canonical: bool,
    },
}

impl BlockTag {
    /// A canonical block by hash.
    pub fn canonical(hash: B256) -> Self {
        BlockTag::Hash {
            hash,
            require_canonical: true,
        }
    }

    /// JSON-RPC parameter for this tag.
    pub fn to_param(&self) -> Value {
        match self {
            BlockTag::Latest => json!("latest"),
            BlockTag::Finalized => json!("finalized"),
            BlockTag::Safe => json!("safe"),
            BlockTag::Number(number) => json!(format!("{number:#x}")),
            BlockTag::Hash {
                hash,
                require_canonical,
            } => json!({ "blockHash": hash, "requireCanonical": require_canonical }),
        }
    }
}

impl std::fmt::Display for BlockTag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BlockTag::Latest => write!(f, "latest"),
            BlockTag::Finalized => write!(f, "finalized"),
            BlockTag::Safe => write!(f, "safe"),
            BlockTag::Number(number) => write!(f, "{number}"),
            BlockTag::Hash { hash, .. } => write!(f, "{hash}"),
        }
    }
}

/// The header fields the guardian needs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BlockHeader {
    /// Block number.
    pub number: u64,
    /// Block hash.
    pub hash: B256,
    /// Parent hash.
    pub parent_hash: B256,
    /// Unix timestamp.
    pub timestamp: u64,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeader {
    number: U64,
    hash: B256,
    parent_hash: B256,
    timestamp: U64,
}

impl From<RawHeader> for BlockHeader {
    fn from(raw: RawHeader) -> Self {
        Self {
            number: raw.number.to(),
            hash: raw.hash,
            parent_hash: raw.parent_hash,
            timestamp: raw.timestamp.to(),
        }
    }
}

/// Metered chain client with stall detection and range fall-over.
#[derive(Debug, Clone)]
pub struct ResilientProvider {
    transport: Arc<dyn RpcTransport>,
    metrics: GuardianMetrics,
    watchdog: Option<Arc<StallWatchdog>>,
    retry_delay: Duration,
}

impl ResilientProvider {
    /// Creates a provider over `transport`.
    pub fn new(transport: Arc<dyn RpcTransport>, metrics: GuardianMetrics) -> Self {
        Self {
            transport,
            metrics,
            watchdog: None,
            retry_delay: FETCH_EVENTS_RETRY_TIMEOUT,
        }
    }

    /// Overrides the delay between retries.
    pub fn with_retry_delay(mut self, retry_delay: Duration) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// Feeds every block number this provider sees into `watchdog`.
    pub fn attach_watchdog(&mut self, watchdog: Arc<StallWatchdog>) {
        self.watchdog = Some(watchdog);
    }

    /// An equivalent provider on a new connection with no watchdog attached.
    pub fn fresh_instance(&self) -> Self {
        Self {
            transport: self.transport.reconnect(),
            metrics: self.metrics.clone(),
            watchdog: None,
            retry_delay: self.retry_delay,
        }
    }

    async fn metered<T, F>(&self, method: &str, exchange: F) -> Result<T>
    where
        F: Future<Output = std::result::Result<T, RpcError>>,
    {
        self.metrics.rpc_requests.with_label_values(&[method]).inc();
        let timer = self
            .metrics
            .rpc_duration
            .with_label_values(&[method])
            .start_timer();

        let result = exchange.await;
        timer.observe_duration();

        if let Err(e) = &result {
            self.metrics.rpc_errors.with_label_values(&[method]).inc();
            debug!("{method} failed: {e}");
        }
        result.context(RpcSnafu)
    }

    /// Sends one metered request.
    pub async fn request(&self, method: &str, params: Value) -> Result<Value> {
        self.metered(method, self.transport.request(method, params)).await
    }

    async fn request_as<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value).context(DecodeSnafu { method })
    }

    fn observe_block(&self, block_number: u64) {
        if let Some(watchdog) = &self.watchdog {
            watchdog.observe_block(block_number);
        }
    }

    /// Chain id served by the node.
    pub async fn chain_id(&self) -> Result<u64> {
        let id: U64 = self.request_as("eth_chainId", json!([])).await?;
        Ok(id.to())
    }

    /// Current head block number.
    pub async fn block_number(&self) -> Result<u64> {
        let number: U64 = self.request_as("eth_blockNumber", json!([])).await?;
        let number = number.to();
        self.observe_block(number);
        Ok(number)
    }

    /// Header of the block selected by `tag`.
    pub async fn get_block(&self, tag: BlockTag) -> Result<BlockHeader> {
        let (method, params) = match tag {
            BlockTag::Hash { hash, .. } => ("eth_getBlockByHash", json!([hash, false])),
            other => ("eth_getBlockByNumber", json!([other.to_param(), false])),
        };
        let raw: Option<RawHeader> = self.request_as(method, params).await?;
        let header = BlockHeader::from(raw.ok_or_else(|| ProviderError::BlockNotFound {
            tag: tag.to_string(),
        })?);
        self.observe_block(header.number);
        Ok(header)
    }

    /// Header of the chain head.
    pub async fn latest_block(&self) -> Result<BlockHeader> {
        self.get_block(BlockTag::Latest).await
    }

    /// `eth_call` against `to` at `tag`.
    pub async fn call(&self, to: Address, data: Bytes, tag: BlockTag) -> Result<Bytes> {
        self.request_as(
            "eth_call",
            json!([{ "to": to, "data": data }, tag.to_param()]),
        )
        .await
    }

    /// Sends every `(to, data)` call as one batched exchange at `tag` and returns the outputs in
    /// order. Any failed call fails the whole read.
    pub async fn call_batch(&self, calls: &[(Address, Bytes)], tag: BlockTag) -> Result<Vec<Bytes>> {
        let requests = calls
            .iter()
            .map(|(to, data)| {
                (
                    "eth_call".to_owned(),
                    json!([{ "to": to, "data": data }, tag.to_param()]),
                )
            })
            .collect();
        let outcomes = self
            .metered(BATCH_METHOD, self.transport.batch(requests))
            .await?;
        if outcomes.len() != calls.len() {
            return Err(ProviderError::BatchSize {
                expected: calls.len(),
                actual: outcomes.len(),
            });
        }

        outcomes
            .into_iter()
            .map(|outcome| {
                let value = outcome.context(RpcSnafu)?;
                serde_json::from_value(value).context(DecodeSnafu { method: "eth_call" })
            })
            .collect()
    }

    /// ABI encoded `eth_call`.
    pub async fn call_contract<C: SolCall>(
        &self,
        to: Address,
        call: &C,
        tag: BlockTag,
    ) -> Result<C::Return> {
        let output = self.call(to, call.abi_encode().into(), tag).await?;
        C::abi_decode_returns(&output, true).context(AbiDecodeSnafu { to })
    }

    /// Logs matching `filter`.
    pub async fn get_logs(&self, filter: &Filter) -> Result<Vec<Log>> {
        self.request_as("eth_getLogs", json!([filter])).await
    }

    /// Merkle proof of `address` and `storage_keys` at `tag`.
    pub async fn get_proof(
        &self,
        address: Address,
        storage_keys: &[B256],
        tag: BlockTag,
    ) -> Result<EIP1186AccountProofResponse> {
        self.request_as(
            "eth_getProof",
            json!([address, storage_keys, tag.to_param()]),
        )
        .await
    }

    /// Resolves the chain id and checks it against `expected`.
    pub async fn detect_network(&self, expected: u64) -> std::result::Result<u64, Fatal> {
        let mut last_error = String::new();
        for attempt in 1..=NETWORK_DETECTION_ATTEMPTS {
            match self.chain_id().await {
                Ok(chain_id) if chain_id == expected => {
                    info!("🌐 Connected to chain {chain_id}");
                    return Ok(chain_id);
                }
                Ok(actual) => return Err(Fatal::UnexpectedNetwork { expected, actual }),
                Err(e) => {
                    warn!("⚠️ Network detection attempt {attempt} failed: {e}");
                    last_error = e.to_string();
                    if attempt < NETWORK_DETECTION_ATTEMPTS {
                        sleep(self.retry_delay).await;
                    }
                }
            }
        }
        Err(Fatal::NetworkUndetectable {
            message: last_error,
        })
    }

    /// Runs `fetch` over `start..=end`, splitting the range on provider limits.
    ///
    /// A range-limit error switches to chunks of [`FALLBACK_CHUNK_SIZE`] blocks, each retried
    /// once. Any other error retries the whole range up to [`MAX_FETCH_RETRIES`] times.
    pub async fn fetch_events_fall_over<T, F, Fut>(
        &self,
        start: u64,
        end: u64,
        fetch: F,
    ) -> Result<Vec<T>>
    where
        F: Fn(u64, u64) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let mut attempt = 0;
        loop {
            match fetch(start, end).await {
                Ok(events) => return Ok(events),
                Err(e) if e.is_range_limit() && end > start => {
                    warn!("⚠️ Range {start}..={end} hit a provider limit ({e}), splitting");
                    return self.fetch_in_chunks(start, end, &fetch).await;
                }
                Err(e) if attempt < MAX_FETCH_RETRIES => {
                    attempt += 1;
                    warn!("⚠️ Fetching {start}..={end} failed ({e}), retry {attempt}");
                    sleep(self.retry_delay).await;
                }
                Err(e) => {
                    return Err(ProviderError::FetchFailed {
                        from_block: start,
                        to_block: end,
                        source: Box::new(e),
                    })
                }
            }
        }
    }

    async fn fetch_in_chunks<T, F, Fut>(&self, start: u64, end: u64, fetch: &F) -> Result<Vec<T>>
    where
        F: Fn(u64, u64) -> Fut,
        Fut: Future<Output = Result<Vec<T>>>,
    {
        let mut events = Vec::new();
        let mut chunk_start = start;
        while chunk_start <= end {
            let chunk_end = end.min(chunk_start + FALLBACK_CHUNK_SIZE - 1);
            let chunk = match fetch(chunk_start, chunk_end).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    debug!("chunk {chunk_start}..={chunk_end} failed ({e}), retrying once");
                    sleep(self.retry_delay).await;
                    fetch(chunk_start, chunk_end)
                        .await
                        .map_err(|e| ProviderError::FetchFailed {
                            from_block: chunk_start,
                            to_block: chunk_end,
                            source: Box::new(e),
                        })?
                }
            };
            events.extend(chunk);
            chunk_start = chunk_end + 1;
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use alloy::primitives::{address, b256};
    use prometheus::Registry;

    use super::*;
    use crate::fatal::FatalSignal;
    use crate::rpc::testing::MockTransport;

    fn provider(transport: MockTransport) -> ResilientProvider {
        let metrics = GuardianMetrics::new(&Registry::new()).unwrap();
        ResilientProvider::new(Arc::new(transport), metrics).with_retry_delay(Duration::ZERO)
    }

    fn limit_error() -> ProviderError {
        ProviderError::Rpc {
            source: RpcError::Response {
                method: "eth_getLogs".into(),
                code: -32005,
                message: "query returned more than 10000 results".into(),
            },
        }
    }

    fn header_json(number: u64) -> Value {
        json!({
            "number": format!("{number:#x}"),
            "hash": B256::with_last_byte(number as u8),
            "parentHash": B256::with_last_byte(number as u8 - 1),
            "timestamp": "0x64",
            "miner": Address::ZERO,
        })
    }

    #[test]
    fn block_tags_serialize_to_rpc_params() {
        let hash = b256!("00000000000000000000000000000000000000000000000000000000000000aa");
        assert_eq!(BlockTag::Latest.to_param(), json!("latest"));
        assert_eq!(BlockTag::Finalized.to_param(), json!("finalized"));
        assert_eq!(BlockTag::Number(255).to_param(), json!("0xff"));
        assert_eq!(
            BlockTag::canonical(hash).to_param(),
            json!({ "blockHash": hash, "requireCanonical": true })
        );
    }

    #[tokio::test]
    async fn requests_are_metered_per_method() {
        let registry = Registry::new();
        let metrics = GuardianMetrics::new(&registry).unwrap();
        let transport = MockTransport::new(|method, _| match method {
            "eth_blockNumber" => Ok(json!("0x10")),
            _ => Err(RpcError::Transport {
                method: method.into(),
                message: "connection reset".into(),
            }),
        });
        let provider = ResilientProvider::new(Arc::new(transport), metrics.clone());

        assert_eq!(provider.block_number().await.unwrap(), 16);
        assert!(provider.chain_id().await.is_err());

        assert_eq!(
            metrics
                .rpc_requests
                .with_label_values(&["eth_blockNumber"])
                .get(),
            1
        );
        assert_eq!(
            metrics.rpc_errors.with_label_values(&["eth_chainId"]).get(),
            1
        );
        assert_eq!(
            metrics
                .rpc_duration
                .with_label_values(&["eth_blockNumber"])
                .get_sample_count(),
            1
        );
    }

    #[tokio::test]
    async fn blocks_by_hash_use_get_block_by_hash() {
        let transport = MockTransport::new(|method, _| match method {
            "eth_getBlockByHash" => Ok(header_json(7)),
            _ => Ok(Value::Null),
        });
        let provider = provider(transport.clone());

        let header = provider
            .get_block(BlockTag::canonical(B256::with_last_byte(7)))
            .await
            .unwrap();
        assert_eq!(header.number, 7);
        assert_eq!(header.parent_hash, B256::with_last_byte(6));

        assert!(matches!(
            provider.get_block(BlockTag::Number(9)).await,
            Err(ProviderError::BlockNotFound { .. })
        ));
        assert_eq!(transport.count("eth_getBlockByNumber"), 1);
    }

    #[tokio::test]
    async fn observed_blocks_reset_the_watchdog() {
        let (signal, _receiver) = FatalSignal::channel();
        let watchdog = Arc::new(StallWatchdog::spawn(Duration::from_secs(60), signal));
        let mut provider = provider(MockTransport::new(|_, _| Ok(json!("0x2a"))));
        provider.attach_watchdog(watchdog.clone());

        provider.block_number().await.unwrap();
        assert_eq!(watchdog.last_block(), Some(42));

        // fresh instances keep their own bookkeeping
        let fresh = provider.fresh_instance();
        assert!(fresh.watchdog.is_none());
    }

    #[tokio::test]
    async fn detect_network_rejects_other_chains() {
        let provider = provider(MockTransport::new(|_, _| Ok(json!("0x5"))));
        assert_eq!(provider.detect_network(5).await, Ok(5));
        assert_eq!(
            provider.detect_network(1).await,
            Err(Fatal::UnexpectedNetwork {
                expected: 1,
                actual: 5
            })
        );
    }

    #[tokio::test]
    async fn detect_network_gives_up_after_a_few_attempts() {
        let transport = MockTransport::new(|method, _| {
            Err(RpcError::Transport {
                method: method.into(),
                message: "connection refused".into(),
            })
        });
        let provider = provider(transport.clone());

        assert!(matches!(
            provider.detect_network(1).await,
            Err(Fatal::NetworkUndetectable { .. })
        ));
        assert_eq!(transport.count("eth_chainId"), NETWORK_DETECTION_ATTEMPTS);
    }

    #[tokio::test]
    async fn contract_calls_decode_outputs() {
        alloy::sol! {
            function answer() external view returns (uint256);
        }
        let target = address!("00000000219ab540356cBB839Cbe05303d7705Fa");
        let transport = MockTransport::new(|_, _| Ok(json!(B256::with_last_byte(42))));
        let provider = provider(transport.clone());

        let output = provider
            .call_contract(target, &answerCall {}, BlockTag::Number(1))
            .await
            .unwrap();
        assert_eq!(output._0, alloy::primitives::U256::from(42));

        let (_, params) = &transport.calls()[0];
        assert_eq!(params[1], json!("0x1"));
    }

    #[tokio::test]
    async fn batched_calls_share_one_exchange() {
        let first = address!("00000000219ab540356cBB839Cbe05303d7705Fa");
        let second = address!("FdDf38947aFB03C621C71b06C9C70bce73f12999");
        let transport = MockTransport::new(move |_, params| {
            let to: Address = serde_json::from_value(params[0]["to"].clone()).unwrap();
            Ok(json!(Bytes::from(vec![u8::from(to == second)])))
        });
        let provider = provider(transport.clone());

        let outputs = provider
            .call_batch(
                &[(first, Bytes::new()), (second, Bytes::new()), (first, Bytes::new())],
                BlockTag::Latest,
            )
            .await
            .unwrap();

        assert_eq!(outputs, vec![Bytes::from(vec![0]), Bytes::from(vec![1]), Bytes::from(vec![0])]);
        assert_eq!(transport.batch_sizes(), vec![3]);
        assert_eq!(transport.count("eth_call"), 3);
    }

    #[tokio::test]
    async fn a_failed_call_fails_the_batch() {
        let transport = MockTransport::new(|method, _| {
            Err(RpcError::Response {
                method: method.into(),
                code: 3,
                message: "execution reverted".into(),
            })
        });
        let provider = provider(transport);

        let error = provider
            .call_batch(&[(Address::ZERO, Bytes::new())], BlockTag::Latest)
            .await
            .unwrap_err();
        assert!(matches!(error, ProviderError::Rpc { source: RpcError::Response { code: 3, .. } }));
    }

    #[tokio::test]
    async fn range_limits_fall_over_to_small_chunks() {
        let provider = provider(MockTransport::new(|_, _| Ok(Value::Null)));
        let ranges = Mutex::new(Vec::new());

        let events = provider
            .fetch_events_fall_over(1, 120, |from, to| {
                ranges.lock().unwrap().push((from, to));
                async move {
                    if to - from >= FALLBACK_CHUNK_SIZE {
                        Err(limit_error())
                    } else {
                        Ok((from..=to).collect::<Vec<_>>())
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(events, (1..=120).collect::<Vec<_>>());
        assert_eq!(
            *ranges.lock().unwrap(),
            vec![(1, 120), (1, 50), (51, 100), (101, 120)]
        );
    }

    #[tokio::test]
    async fn failing_chunks_are_retried_once() {
        let provider = provider(MockTransport::new(|_, _| Ok(Value::Null)));
        let calls = AtomicUsize::new(0);

        let result = provider
            .fetch_events_fall_over(1, 60, |_, _| {
                calls.fetch_add(1, Ordering::SeqCst);
                async { Err::<Vec<u64>, _>(limit_error()) }
            })
            .await;

        assert!(matches!(
            result,
            Err(ProviderError::FetchFailed {
                from_block: 1,
                to_block: 50,
                ..
            })
        ));
        // whole range, then the first chunk twice
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn other_errors_retry_the_whole_range() {
        let provider = provider(MockTransport::new(|_, _| Ok(Value::Null)));
        let calls = AtomicUsize::new(0);

        let events = provider
            .fetch_events_fall_over(10, 20, |from, to| {
                let attempt = calls.fetch_add(1, Ordering::SeqCst);
                async move {
                    if attempt < 2 {
                        Err(ProviderError::Rpc {
                            source: RpcError::Transport {
                                method: "eth_getLogs".into(),
                                message: "connection reset".into(),
                            },
                        })
                    } else {
                        Ok(vec![from, to])
                    }
                }
            })
            .await
            .unwrap();

        assert_eq!(events, vec![10, 20]);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
