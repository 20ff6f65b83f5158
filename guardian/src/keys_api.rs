//! Client of the keys API, the off-chain index of staking module keys and operators.

use std::time::Duration;

use async_trait::async_trait;
use guardian_core::keys::{BlockSnapshot, ModuleRegistry, RegistryKey, RegistryOperator, StakingModule};
use reqwest::Client;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use snafu::{ResultExt, Snafu};
use url::Url;

/// Default timeout of a single keys API request.
pub const FETCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// Errors returned by a [`KeysRegistry`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum KeysApiError {
    /// The request failed or returned a non-success status.
    #[snafu(display("Keys API request to {url} failed: {source}"))]
    Request {
        /// Requested endpoint.
        url: Url,
        /// HTTP error.
        source: reqwest::Error,
    },

    /// An endpoint path could not be joined to the base URL.
    #[snafu(display("Invalid keys API endpoint {path}: {source}"))]
    Endpoint {
        /// The path.
        path: String,
        /// URL error.
        source: url::ParseError,
    },

    /// The API has no data yet.
    #[snafu(display("Keys API not synced, please wait"))]
    NotSynced,

    /// Keys and operators were served from different blocks.
    #[snafu(display(
        "Keys API snapshots differ: keys at {keys_block}, operators at {operators_block}"
    ))]
    SnapshotMismatch {
        /// Block of the keys response.
        keys_block: u64,
        /// Block of the operators response.
        operators_block: u64,
    },
}

/// Result alias of this module.
pub type Result<T, E = KeysApiError> = std::result::Result<T, E>;

/// Every module with its keys and operators at one block.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RegistrySnapshot {
    /// Modules in the order the API lists them.
    pub modules: Vec<ModuleRegistry>,
    /// Block the data was indexed at.
    pub block: BlockSnapshot,
}

/// Source of staking module keys and operators.
#[async_trait]
pub trait KeysRegistry: Send + Sync + std::fmt::Debug {
    /// Keys and operators of every module at the latest indexed block.
    async fn snapshot(&self) -> Result<RegistrySnapshot>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct Meta {
    el_block_snapshot: Option<BlockSnapshot>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModuleKeys {
    module: StakingModule,
    keys: Vec<RegistryKey>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ModuleOperators {
    module: StakingModule,
    operators: Vec<RegistryOperator>,
}

#[derive(Debug, Deserialize)]
#[serde(bound(deserialize = "T: Deserialize<'de>"))]
pub(crate) struct ListResponse<T> {
    #[serde(default)]
    data: Vec<T>,
    meta: Option<Meta>,
}

impl<T> ListResponse<T> {
    fn into_parts(self) -> Result<(Vec<T>, BlockSnapshot)> {
        match self.meta.and_then(|m| m.el_block_snapshot) {
            Some(block) if !self.data.is_empty() => Ok((self.data, block)),
            _ => NotSyncedSnafu.fail(),
        }
    }
}

/// Joins the keys and operators listings by module id.
pub(crate) fn join_snapshot(
    keys: ListResponse<ModuleKeys>,
    operators: ListResponse<ModuleOperators>,
) -> Result<RegistrySnapshot> {
    let (keys, keys_block) = keys.into_parts()?;
    let (mut operators, operators_block) = operators.into_parts()?;
    if keys_block.block_hash != operators_block.block_hash {
        return SnapshotMismatchSnafu {
            keys_block: keys_block.block_number,
            operators_block: operators_block.block_number,
        }
        .fail();
    }

    let modules = keys
        .into_iter()
        .map(|entry| {
            let operators = operators
                .iter()
                .position(|o| o.module.id == entry.module.id)
                .map(|i| operators.swap_remove(i).operators)
                .unwrap_or_default();
            ModuleRegistry {
                module: entry.module,
                keys: entry.keys,
                operators,
            }
        })
        .collect();

    Ok(RegistrySnapshot {
        modules,
        block: keys_block,
    })
}

/// [`KeysRegistry`] over the keys API HTTP endpoints.
#[derive(Debug, Clone)]
pub struct HttpKeysRegistry {
    client: Client,
    base: Url,
    timeout: Duration,
}

impl HttpKeysRegistry {
    /// A client of the keys API at `base` abandoning requests slower than `timeout`.
    pub fn new(base: Url, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base,
            timeout,
        }
    }

    async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base.join(path).context(EndpointSnafu { path })?;
        self.client
            .get(url.clone())
            .timeout(self.timeout)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(RequestSnafu { url: url.clone() })?
            .json()
            .await
            .context(RequestSnafu { url })
    }
}

#[async_trait]
impl KeysRegistry for HttpKeysRegistry {
    async fn snapshot(&self) -> Result<RegistrySnapshot> {
        let (keys, operators) = tokio::try_join!(
            self.fetch::<ListResponse<ModuleKeys>>("v1/modules/keys"),
            self.fetch::<ListResponse<ModuleOperators>>("v1/operators"),
        )?;
        join_snapshot(keys, operators)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::B256;
    use serde_json::{json, Value};

    use super::*;

    fn module(id: u64) -> Value {
        json!({
            "id": id,
            "stakingModuleAddress": format!("0x{:040x}", id),
            "nonce": 12,
            "lastChangedBlockHash": B256::repeat_byte(0x0c),
            "name": "curated",
            "type": "curated-onchain-v1",
        })
    }

    fn meta(block_number: u64, hash_byte: u8) -> Value {
        json!({
            "elBlockSnapshot": {
                "blockNumber": block_number,
                "blockHash": B256::repeat_byte(hash_byte),
                "timestamp": 1_700_000_000u64,
            }
        })
    }

    fn keys_response(meta: Value) -> ListResponse<ModuleKeys> {
        serde_json::from_value(json!({
            "data": [
                {
                    "module": module(1),
                    "keys": [{
                        "key": format!("0x{}", "11".repeat(48)),
                        "depositSignature": format!("0x{}", "22".repeat(96)),
                        "operatorIndex": 0,
                        "used": false,
                        "vetted": true,
                        "index": 4,
                        "moduleAddress": format!("0x{:040x}", 1),
                    }],
                },
                { "module": module(2), "keys": [] },
            ],
            "meta": meta,
        }))
        .unwrap()
    }

    fn operators_response(meta: Value) -> ListResponse<ModuleOperators> {
        serde_json::from_value(json!({
            "data": [{
                "module": module(1),
                "operators": [{
                    "index": 0,
                    "active": true,
                    "name": "op",
                    "rewardAddress": format!("0x{:040x}", 9),
                    "stakingLimit": 10,
                    "stoppedValidators": 0,
                    "totalSigningKeys": 12,
                    "usedSigningKeys": 4,
                    "moduleAddress": format!("0x{:040x}", 1),
                }],
            }],
            "meta": meta,
        }))
        .unwrap()
    }

    #[test]
    fn listings_are_joined_by_module() {
        let snapshot = join_snapshot(keys_response(meta(900, 7)), operators_response(meta(900, 7))).unwrap();

        assert_eq!(snapshot.block.block_number, 900);
        assert_eq!(snapshot.modules.len(), 2);
        assert_eq!(snapshot.modules[0].keys[0].index, 4);
        assert_eq!(snapshot.modules[0].operators[0].used_signing_keys, 4);
        assert!(snapshot.modules[1].operators.is_empty());
    }

    #[test]
    fn mismatching_snapshots_are_rejected() {
        let result = join_snapshot(keys_response(meta(900, 7)), operators_response(meta(901, 8)));
        assert!(matches!(
            result,
            Err(KeysApiError::SnapshotMismatch {
                keys_block: 900,
                operators_block: 901
            })
        ));
    }

    #[test]
    fn unsynced_api_is_an_error() {
        let empty: ListResponse<ModuleKeys> = serde_json::from_value(json!({ "data": [] })).unwrap();
        assert!(matches!(
            join_snapshot(empty, operators_response(meta(900, 7))),
            Err(KeysApiError::NotSynced)
        ));
    }

    #[tokio::test]
    async fn unresponsive_api_times_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and never answer
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let base = Url::parse(&format!("http://{addr}/")).unwrap();
        let registry = HttpKeysRegistry::new(base, Duration::from_millis(100));
        let error = tokio::time::timeout(Duration::from_secs(5), registry.snapshot())
            .await
            .expect("request was not abandoned")
            .unwrap_err();

        assert!(matches!(error, KeysApiError::Request { ref source, .. } if source.is_timeout()));
        server.abort();
    }
}
