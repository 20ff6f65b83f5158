//! Runtime configuration of the guardian daemon, collected by `main` from flags and environment.

use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::PathBuf;
use std::time::Duration;

use alloy::primitives::Address;
use clap::ValueEnum;
use url::Url;

use crate::transport::{AmqpConfig, KafkaConfig, RabbitConfig};

/// Which pause message the security module understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default, ValueEnum)]
pub enum PauseVersion {
    /// Per-module pause.
    V2,
    /// Protocol wide pause.
    #[default]
    V3,
}

/// Where guardian messages go.
#[derive(Clone, Debug)]
pub enum TransportConfig {
    /// Keep messages in process, for dry runs.
    InMemory,
    /// Publish through a RabbitMQ management API.
    RabbitHttp(RabbitConfig),
    /// Publish to RabbitMQ over AMQP.
    Amqp(AmqpConfig),
    /// Publish to Kafka. Needs the `kafka` feature.
    Kafka(KafkaConfig),
}

/// Deployed contracts the guardian reads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContractAddresses {
    /// Beacon chain deposit contract.
    pub deposit_contract: Address,
    /// Staking router holding the module list and withdrawal credentials.
    pub staking_router: Address,
    /// Deposit security module guardian messages are addressed to.
    pub security_module: Address,
}

/// Everything the daemon needs to run.
#[derive(Clone, Debug)]
pub struct GuardianConfig {
    /// Execution layer JSON-RPC endpoint.
    pub rpc_url: Url,
    /// Chain the RPC endpoint must serve.
    pub chain_id: u64,
    /// Contracts read every cycle.
    pub contracts: ContractAddresses,
    /// Bound of a single JSON-RPC exchange.
    pub rpc_timeout: Duration,
    /// File holding the hex encoded guardian private key.
    pub key_file: PathBuf,
    /// Directory of the event caches.
    pub cache_dir: PathBuf,
    /// Schema tag of the event caches.
    pub cache_version: String,
    /// Base URL of the keys API.
    pub keys_api_url: Url,
    /// Bound of a single keys API request.
    pub keys_api_timeout: Duration,
    /// Broker guardian messages are published to.
    pub transport: TransportConfig,
    /// Time between cycles.
    pub poll_interval: Duration,
    /// How long the chain head may stand still before the daemon gives up.
    pub stall_timeout: Duration,
    /// Address of the `/metrics` server.
    pub metrics_addr: SocketAddr,
    /// Pause message flavor the security module accepts.
    pub pause_version: PauseVersion,
    /// Deposit signature verdicts kept between cycles.
    pub signature_cache_size: NonZeroUsize,
    /// Overrides the security module's unvet batch limit.
    pub max_operators_per_unvetting: Option<u64>,
}
