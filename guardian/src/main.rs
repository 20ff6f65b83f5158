//! Deposit guardian daemon.
use std::net::SocketAddr;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::Address;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use axum::Router;
use clap::{Parser, ValueEnum};
use deposit_guardian::config::{ContractAddresses, GuardianConfig, PauseVersion, TransportConfig};
use deposit_guardian::fatal::{supervise, Fatal, FatalSignal};
use deposit_guardian::guardian::{Guardian, GuardianError};
use deposit_guardian::metrics::{encode_metrics, GuardianMetrics};
use deposit_guardian::key_state::DEPOSIT_DATA_LRU_CACHE_SIZE;
use deposit_guardian::keys_api::FETCH_REQUEST_TIMEOUT;
use deposit_guardian::rpc::DEFAULT_REQUEST_TIMEOUT;
use deposit_guardian::transport::{AmqpConfig, KafkaConfig, RabbitConfig, DEFAULT_BROKER_TIMEOUT};
use guardian_core::signing::{GuardianKey, SigningError};
use log::{error, info, warn};
use prometheus::Registry;
use snafu::{ResultExt, Snafu};
use tokio::net::TcpListener;
use tokio::time::MissedTickBehavior;
use url::Url;

#[derive(Debug, Snafu)]
enum MainError {
    #[snafu(display("Failed to read key file {}: {source}", path.display()))]
    ReadKey {
        path: PathBuf,
        source: std::io::Error,
    },

    #[snafu(display("Key file {} is not hex: {source}", path.display()))]
    DecodeKey {
        path: PathBuf,
        source: hex::FromHexError,
    },

    #[snafu(display("{source}"))]
    InvalidKey { source: SigningError },

    #[snafu(display("Failed to register metrics: {source}"))]
    Metrics { source: prometheus::Error },

    #[snafu(display("Failed to start guardian: {source}"))]
    Startup { source: GuardianError },

    #[snafu(display("{source}"))]
    Fatal { source: Fatal },

    #[snafu(display("--{flag} is required by the {service:?} pub/sub service"))]
    MissingSetting {
        flag: &'static str,
        service: PubSubService,
    },
}

/// Broker guardian messages go through.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum PubSubService {
    /// Nowhere, messages stay in process.
    Memory,
    /// RabbitMQ management HTTP API.
    RabbitHttp,
    /// RabbitMQ over AMQP.
    Amqp,
    /// Kafka.
    Kafka,
}

type Result<T, E = MainError> = std::result::Result<T, E>;

/// Watches deposits and staking module keys and broadcasts guardian messages.
#[derive(Debug, Parser)]
#[command(name = "deposit-guardian", version, about, long_about = None)]
struct Cli {
    /// Execution layer JSON-RPC endpoint
    #[arg(long, env = "GUARDIAN_RPC_URL")]
    rpc_url: Url,

    /// Chain id the RPC endpoint must serve
    #[arg(long, env = "GUARDIAN_CHAIN_ID", default_value_t = 1)]
    chain_id: u64,

    /// Deposit contract address
    #[arg(long, env = "GUARDIAN_DEPOSIT_CONTRACT")]
    deposit_contract: Address,

    /// Staking router address
    #[arg(long, env = "GUARDIAN_STAKING_ROUTER")]
    staking_router: Address,

    /// Deposit security module address
    #[arg(long, env = "GUARDIAN_SECURITY_MODULE")]
    security_module: Address,

    /// File with the hex encoded guardian private key
    #[arg(long, env = "GUARDIAN_KEY_FILE", default_value = ".guardian-key")]
    key_file: PathBuf,

    /// Directory of the event caches
    #[arg(long, env = "GUARDIAN_CACHE_DIR", default_value = "cache")]
    cache_dir: PathBuf,

    /// Schema tag of the event caches; changing it forces a refetch
    #[arg(long, env = "GUARDIAN_CACHE_VERSION", default_value = "v1")]
    cache_version: String,

    /// Keys API base URL
    #[arg(long, env = "GUARDIAN_KEYS_API_URL")]
    keys_api_url: Url,

    /// Seconds before a JSON-RPC request is abandoned
    #[arg(long, env = "GUARDIAN_RPC_TIMEOUT_SECS", default_value_t = DEFAULT_REQUEST_TIMEOUT.as_secs())]
    rpc_timeout_secs: u64,

    /// Seconds before a keys API request is abandoned
    #[arg(long, env = "GUARDIAN_KEYS_API_TIMEOUT_SECS", default_value_t = FETCH_REQUEST_TIMEOUT.as_secs())]
    keys_api_timeout_secs: u64,

    /// Broker guardian messages are published to
    #[arg(long, env = "GUARDIAN_PUBSUB_SERVICE", value_enum, default_value_t = PubSubService::Memory)]
    pubsub_service: PubSubService,

    /// Seconds before a broker round trip is abandoned
    #[arg(long, env = "GUARDIAN_BROKER_TIMEOUT_SECS", default_value_t = DEFAULT_BROKER_TIMEOUT.as_secs())]
    broker_timeout_secs: u64,

    /// RabbitMQ management API URL
    #[arg(long, env = "GUARDIAN_RABBITMQ_URL")]
    rabbitmq_url: Option<Url>,

    /// RabbitMQ virtual host
    #[arg(long, env = "GUARDIAN_RABBITMQ_VHOST", default_value = "/")]
    rabbitmq_vhost: String,

    /// RabbitMQ exchange guardian messages are published to
    #[arg(long, env = "GUARDIAN_RABBITMQ_EXCHANGE", default_value = "amq.topic")]
    rabbitmq_exchange: String,

    /// RabbitMQ user
    #[arg(long, env = "GUARDIAN_RABBITMQ_USER", default_value = "guest")]
    rabbitmq_user: String,

    /// RabbitMQ password
    #[arg(long, env = "GUARDIAN_RABBITMQ_PASSWORD", default_value = "guest", hide_env_values = true)]
    rabbitmq_password: String,

    /// AMQP broker URI
    #[arg(long, env = "GUARDIAN_AMQP_URL", hide_env_values = true)]
    amqp_url: Option<Url>,

    /// Kafka bootstrap brokers
    #[arg(long, env = "GUARDIAN_KAFKA_BROKERS", value_delimiter = ',')]
    kafka_brokers: Vec<String>,

    /// Kafka client id
    #[arg(long, env = "GUARDIAN_KAFKA_CLIENT_ID", default_value = "deposit-guardian")]
    kafka_client_id: String,

    /// Connect to Kafka over TLS
    #[arg(long, env = "GUARDIAN_KAFKA_SSL")]
    kafka_ssl: bool,

    /// Kafka SASL mechanism
    #[arg(long, env = "GUARDIAN_KAFKA_SASL_MECHANISM")]
    kafka_sasl_mechanism: Option<String>,

    /// Kafka SASL user
    #[arg(long, env = "GUARDIAN_KAFKA_USERNAME")]
    kafka_username: Option<String>,

    /// Kafka SASL password
    #[arg(long, env = "GUARDIAN_KAFKA_PASSWORD", hide_env_values = true)]
    kafka_password: Option<String>,

    /// Deposit signature verdicts kept between cycles
    #[arg(long, env = "GUARDIAN_SIGNATURE_CACHE_SIZE", default_value_t = DEPOSIT_DATA_LRU_CACHE_SIZE)]
    signature_cache_size: NonZeroUsize,

    /// Seconds between guardian cycles
    #[arg(long, env = "GUARDIAN_POLL_INTERVAL_SECS", default_value_t = 12)]
    poll_interval_secs: u64,

    /// Seconds without a new block before the daemon stops
    #[arg(long, env = "GUARDIAN_STALL_TIMEOUT_SECS", default_value_t = 600)]
    stall_timeout_secs: u64,

    /// Bind address of the Prometheus metrics server
    #[arg(long, env = "GUARDIAN_METRICS_BIND", default_value = "0.0.0.0:9090")]
    metrics_bind: SocketAddr,

    /// Pause message version understood by the security module
    #[arg(long, env = "GUARDIAN_PAUSE_VERSION", value_enum, default_value_t = PauseVersion::V3)]
    pause_version: PauseVersion,

    /// Overrides the security module's limit of operators per unvet message
    #[arg(long, env = "GUARDIAN_MAX_OPERATORS_PER_UNVETTING")]
    max_operators_per_unvetting: Option<u64>,
}

impl Cli {
    fn into_config(self) -> Result<GuardianConfig> {
        let poll_interval = Duration::from_secs(self.poll_interval_secs);
        let broker_timeout = Duration::from_secs(self.broker_timeout_secs);
        let service = self.pubsub_service;
        let missing = |flag: &'static str| MissingSettingSnafu { flag, service }.build();

        let transport = match service {
            PubSubService::Memory => TransportConfig::InMemory,
            PubSubService::RabbitHttp => TransportConfig::RabbitHttp(RabbitConfig {
                url: self.rabbitmq_url.ok_or_else(|| missing("rabbitmq-url"))?,
                vhost: self.rabbitmq_vhost,
                exchange: self.rabbitmq_exchange,
                user: self.rabbitmq_user,
                password: self.rabbitmq_password,
                poll_interval,
                request_timeout: broker_timeout,
            }),
            PubSubService::Amqp => TransportConfig::Amqp(AmqpConfig {
                url: self.amqp_url.ok_or_else(|| missing("amqp-url"))?,
                request_timeout: broker_timeout,
            }),
            PubSubService::Kafka => {
                if self.kafka_brokers.is_empty() {
                    return Err(missing("kafka-brokers"));
                }
                TransportConfig::Kafka(KafkaConfig {
                    brokers: self.kafka_brokers,
                    client_id: self.kafka_client_id,
                    ssl: self.kafka_ssl,
                    sasl_mechanism: self.kafka_sasl_mechanism,
                    username: self.kafka_username,
                    password: self.kafka_password,
                    request_timeout: broker_timeout,
                })
            }
        };

        Ok(GuardianConfig {
            rpc_url: self.rpc_url,
            chain_id: self.chain_id,
            rpc_timeout: Duration::from_secs(self.rpc_timeout_secs),
            contracts: ContractAddresses {
                deposit_contract: self.deposit_contract,
                staking_router: self.staking_router,
                security_module: self.security_module,
            },
            key_file: self.key_file,
            cache_dir: self.cache_dir,
            cache_version: self.cache_version,
            keys_api_url: self.keys_api_url,
            keys_api_timeout: Duration::from_secs(self.keys_api_timeout_secs),
            transport,
            poll_interval,
            stall_timeout: Duration::from_secs(self.stall_timeout_secs),
            metrics_addr: self.metrics_bind,
            pause_version: self.pause_version,
            signature_cache_size: self.signature_cache_size,
            max_operators_per_unvetting: self.max_operators_per_unvetting,
        })
    }
}

fn load_guardian_key(path: &Path) -> Result<GuardianKey> {
    let contents = std::fs::read_to_string(path).context(ReadKeySnafu { path })?;
    let trimmed = contents.trim();
    let bytes = hex::decode(trimmed.strip_prefix("0x").unwrap_or(trimmed))
        .context(DecodeKeySnafu { path })?;
    GuardianKey::from_bytes(&bytes).context(InvalidKeySnafu)
}

async fn metrics_handler(State(registry): State<Arc<Registry>>) -> Result<String, StatusCode> {
    encode_metrics(&registry).map_err(|_| StatusCode::INTERNAL_SERVER_ERROR)
}

async fn serve_metrics(bind_addr: SocketAddr, registry: Arc<Registry>) -> std::io::Result<()> {
    let app = Router::new()
        .route("/metrics", get(metrics_handler))
        .with_state(registry);

    let listener = TcpListener::bind(bind_addr).await?;
    info!("📊 Prometheus metrics server running on http://{bind_addr}");
    axum::serve(listener, app).await
}

async fn run(config: GuardianConfig) -> Result<()> {
    let key = load_guardian_key(&config.key_file)?;
    let registry = Arc::new(Registry::new());
    let metrics = GuardianMetrics::new(&registry).context(MetricsSnafu)?;

    tokio::spawn({
        let addr = config.metrics_addr;
        let registry = registry.clone();
        async move {
            if let Err(e) = serve_metrics(addr, registry).await {
                error!("❌ Failed to start metrics server: {e}");
            }
        }
    });

    if matches!(config.transport, TransportConfig::InMemory) {
        warn!("⚠️ No message broker configured, guardian messages stay in process");
    }

    let (signal, mut fatal) = FatalSignal::channel();
    let mut guardian = Guardian::start(&config, key, metrics, signal)
        .await
        .context(StartupSnafu)?;

    let mut interval = tokio::time::interval(config.poll_interval);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            Some(source) = fatal.recv() => return Err(MainError::Fatal { source }),
            _ = tokio::signal::ctrl_c() => {
                info!("👋 Shutting down");
                return Ok(());
            }
            _ = interval.tick() => {}
        }

        // a stall raised mid-cycle drops the cycle instead of waiting for it
        tokio::select! {
            cycle = supervise(&mut fatal, guardian.run_cycle()) => match cycle {
                Err(source) => return Err(MainError::Fatal { source }),
                Ok(Err(e)) => {
                    if let Some(source) = e.fatal() {
                        return Err(MainError::Fatal { source });
                    }
                }
                Ok(Ok(())) => {}
            },
            _ = tokio::signal::ctrl_c() => {
                info!("👋 Shutting down");
                return Ok(());
            }
        }
    }
}

#[tokio::main]
async fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    info!("🚀 Starting deposit guardian...");

    let result = match Cli::parse().into_config() {
        Ok(config) => run(config).await,
        Err(e) => Err(e),
    };
    if let Err(e) = result {
        error!("☠️ {e}");
        std::process::exit(1);
    }
}
