//! # Guardian cycle
//!
//! One cycle takes the latest keys API snapshot, reads the chain at the snapshot's block, builds
//! [`StakingModuleData`] for every module and decides what to broadcast:
//!
//! 1. a `ping`, always;
//! 2. a `pause` when any key was front-run, now or in the past;
//! 3. otherwise `unvet` requests for modules with duplicated or invalid keys;
//! 4. and `deposit` attestations for active modules whose deposit data can be trusted.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use alloy::primitives::{Address, B256};
use guardian_core::crypto::{genesis_fork_version, BlstCrypto};
use guardian_core::keys::{BlockSnapshot, RegistryKey, StakingModuleData};
use guardian_core::signing::{self, GuardianKey, GuardianSignature, SigningError};
use log::{error, info, warn};
use snafu::{ResultExt, Snafu};

use crate::config::{GuardianConfig, PauseVersion, TransportConfig};
use crate::contracts::{CycleReader, CycleState, DepositContract, MessagePrefixes, SecurityModule};
use crate::deposit_registry::{
    deposit_deployment_block, DepositRegistry, DepositRegistryError, DEPOSIT_CACHE_KEY,
};
use crate::deposit_verifier::DepositVerifier;
use crate::event_cache::{EventCache, EventCacheConfig};
use crate::fatal::{Fatal, FatalSignal};
use crate::key_state::{historical_front_run, AggregatorError, ClassificationContext, KeyStateAggregator, ModuleState};
use crate::keys_api::{HttpKeysRegistry, KeysApiError, KeysRegistry};
use crate::messenger::{
    topic_prefix, DepositMessage, GuardianIdentity, GuardianMessage, GuardianMessenger,
    MessengerError, PauseMessage, PauseV2Message, PauseV3Message, PingMessage, UnvetMessage,
    DEFENDER_TOPIC,
};
use crate::metrics::GuardianMetrics;
use crate::provider::{BlockTag, ProviderError, ResilientProvider};
use crate::rpc::HttpRpcTransport;
use crate::signing_keys_registry::{SigningKeysError, SigningKeysRegistry};
use crate::transport::{
    self, AmqpTransport, InMemoryTransport, RabbitHttpTransport, Transport, TransportError,
};
use crate::unvetting::{keys_to_unvet, unvet_chunks};
use crate::watchdog::StallWatchdog;

/// Blocks after which an unchanged deposit attestation is signed again.
pub const GUARDIAN_DEPOSIT_RESIGNING_BLOCKS: u64 = 50;

/// Errors of a guardian cycle.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum GuardianError {
    /// Startup hit an unrecoverable condition.
    #[snafu(display("{source}"))]
    Startup {
        /// The condition.
        source: Fatal,
    },

    /// The keys API could not be read.
    #[snafu(display("Keys API failure: {source}"))]
    KeysApi {
        /// Keys API error.
        source: KeysApiError,
    },

    /// A contract read failed.
    #[snafu(display("Chain read failed: {source}"))]
    Provider {
        /// Provider error.
        source: ProviderError,
    },

    /// The deposit registry failed.
    #[snafu(display("{source}"))]
    Deposits {
        /// Registry error.
        source: DepositRegistryError,
    },

    /// The signing keys registry failed.
    #[snafu(display("{source}"))]
    SigningKeys {
        /// Registry error.
        source: SigningKeysError,
    },

    /// Key classification failed.
    #[snafu(display("{source}"))]
    Aggregator {
        /// Aggregator error.
        source: AggregatorError,
    },

    /// A message could not be signed.
    #[snafu(display("{source}"))]
    Signing {
        /// Signing error.
        source: SigningError,
    },

    /// The message broker could not be set up.
    #[snafu(display("Broker setup failed: {source}"))]
    Transport {
        /// Transport error.
        source: TransportError,
    },

    /// A message could not be sent.
    #[snafu(display("{source}"))]
    Messenger {
        /// Messenger error.
        source: MessengerError,
    },
}

impl GuardianError {
    /// The fatal condition behind this error, if any.
    pub fn fatal(&self) -> Option<Fatal> {
        match self {
            GuardianError::Startup { source } => Some(source.clone()),
            GuardianError::Deposits { source } => source.fatal(),
            GuardianError::SigningKeys { source } => source.fatal(),
            _ => None,
        }
    }
}

/// Result alias of this module.
pub type Result<T, E = GuardianError> = std::result::Result<T, E>;

/// Contract state a deposit attestation was signed for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ContractsState {
    /// Deposit contract root.
    pub deposit_root: B256,
    /// Key registry nonce of the module.
    pub nonce: u64,
    /// Block of the module's last key change.
    pub last_changed_block_hash: B256,
    /// Block the state was read at.
    pub block_number: u64,
}

impl ContractsState {
    /// Whether an attestation for `self` would repeat one already signed for `other`.
    pub fn is_same(&self, other: &ContractsState) -> bool {
        self.deposit_root == other.deposit_root
            && self.nonce == other.nonce
            && self.last_changed_block_hash == other.last_changed_block_hash
            && self.block_number / GUARDIAN_DEPOSIT_RESIGNING_BLOCKS
                == other.block_number / GUARDIAN_DEPOSIT_RESIGNING_BLOCKS
    }
}

/// Whether a new keys API snapshot is worth a cycle.
///
/// A snapshot older than the last processed one means the keys API went back in time and is
/// rejected; the same block is skipped.
pub fn is_new_snapshot(last: Option<&BlockSnapshot>, next: &BlockSnapshot) -> bool {
    let Some(last) = last else {
        return true;
    };
    if last.block_number > next.block_number {
        error!(
            "❌ Keys API returns old state: {} after {}",
            next.block_number, last.block_number
        );
        return false;
    }
    last.block_hash != next.block_hash
}

/// Messages warranted by one cycle's classification.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CyclePlan {
    /// Deposits must be paused.
    pub pause: bool,
    /// Indices of modules that need unvetting.
    pub unvet: Vec<usize>,
    /// Indices of modules that may be deposited into.
    pub deposit: Vec<usize>,
}

/// Decides which messages a cycle sends.
///
/// `data_trusted` is false when the deposit history or the signing key events at the cycle block
/// could not be verified; nothing but a pause is sent then.
pub fn plan_cycle(modules: &[StakingModuleData], historical_front_run: bool, data_trusted: bool) -> CyclePlan {
    if historical_front_run || modules.iter().any(StakingModuleData::has_front_run) {
        return CyclePlan {
            pause: true,
            ..CyclePlan::default()
        };
    }
    if !data_trusted {
        return CyclePlan::default();
    }

    let mut plan = CyclePlan::default();
    for (i, module) in modules.iter().enumerate() {
        if module.has_keys_to_unvet() {
            plan.unvet.push(i);
        } else if module.is_module_deposits_paused {
            info!("Module {} is not active, skipping deposit", module.staking_module_id);
        } else if !module.unresolved_duplicated_keys.is_empty() {
            warn!(
                "⚠️ Module {} has {} unresolved duplicated keys, skipping deposit",
                module.staking_module_id,
                module.unresolved_duplicated_keys.len()
            );
        } else {
            plan.deposit.push(i);
        }
    }
    plan
}

/// Chain state shared by every message of a cycle.
#[derive(Clone, Debug)]
struct CycleBlock {
    block_number: u64,
    block_hash: B256,
    identity: GuardianIdentity,
    deposit_root: B256,
    prefixes: MessagePrefixes,
}

impl CycleBlock {
    fn tag(&self) -> BlockTag {
        BlockTag::canonical(self.block_hash)
    }
}

/// The guardian daemon state carried from one cycle to the next.
#[derive(Debug)]
pub struct Guardian {
    provider: ResilientProvider,
    keys_api: Arc<dyn KeysRegistry>,
    deposits: DepositRegistry,
    signing_keys: SigningKeysRegistry,
    reader: CycleReader,
    security: SecurityModule,
    aggregator: Arc<KeyStateAggregator>,
    messenger: GuardianMessenger,
    key: GuardianKey,
    pause_version: PauseVersion,
    max_operators_per_unvetting: Option<u64>,
    last_snapshot: Option<BlockSnapshot>,
    last_deposits: HashMap<u64, ContractsState>,
    metrics: GuardianMetrics,
    _watchdog: Arc<StallWatchdog>,
}

impl Guardian {
    /// Connects to the chain and wires every component from `config`.
    pub async fn start(
        config: &GuardianConfig,
        key: GuardianKey,
        metrics: GuardianMetrics,
        signal: FatalSignal,
    ) -> Result<Self> {
        let mut provider = ResilientProvider::new(
            Arc::new(HttpRpcTransport::new(config.rpc_url.clone(), config.rpc_timeout)),
            metrics.clone(),
        );
        let chain_id = provider
            .detect_network(config.chain_id)
            .await
            .context(StartupSnafu)?;
        let unsupported = || Fatal::UnsupportedNetwork { chain_id };
        let prefix = topic_prefix(chain_id).ok_or_else(unsupported).context(StartupSnafu)?;
        let deployment_block = deposit_deployment_block(chain_id)
            .ok_or_else(unsupported)
            .context(StartupSnafu)?;
        let fork_version = genesis_fork_version(chain_id)
            .ok_or_else(unsupported)
            .context(StartupSnafu)?;

        let watchdog = Arc::new(StallWatchdog::spawn(config.stall_timeout, signal));
        provider.attach_watchdog(watchdog.clone());

        let crypto = Arc::new(BlstCrypto);
        let deposits = DepositRegistry::new(
            provider.clone(),
            DepositContract::new(provider.clone(), config.contracts.deposit_contract),
            DepositVerifier::new(crypto.clone(), fork_version),
            EventCache::load(EventCacheConfig {
                dir: config.cache_dir.clone(),
                chain_id,
                key: DEPOSIT_CACHE_KEY.to_owned(),
                version: config.cache_version.clone(),
                deployment_block,
            }),
            metrics.clone(),
        );
        // opened once the first keys API snapshot names the staking modules
        let signing_keys = SigningKeysRegistry::new(
            provider.clone(),
            config.cache_dir.clone(),
            chain_id,
            &config.cache_version,
        );

        let transport: Arc<dyn Transport> = match &config.transport {
            TransportConfig::InMemory => Arc::new(InMemoryTransport::new()),
            TransportConfig::RabbitHttp(rabbit) => {
                Arc::new(RabbitHttpTransport::new(rabbit.clone()).context(TransportSnafu)?)
            }
            TransportConfig::Amqp(amqp) => Arc::new(
                AmqpTransport::connect(amqp.clone())
                    .await
                    .context(TransportSnafu)?,
            ),
            TransportConfig::Kafka(kafka) => {
                transport::kafka(kafka.clone()).context(TransportSnafu)?
            }
        };
        info!("🔑 Guardian address {}", key.address());

        let mut guardian = Self {
            reader: CycleReader::new(provider.clone(), config.contracts),
            security: SecurityModule::new(provider.clone(), config.contracts.security_module),
            keys_api: Arc::new(HttpKeysRegistry::new(
                config.keys_api_url.clone(),
                config.keys_api_timeout,
            )),
            aggregator: Arc::new(KeyStateAggregator::new(
                crypto,
                fork_version,
                config.signature_cache_size,
            )),
            messenger: GuardianMessenger::new(transport, prefix, metrics.clone()),
            provider,
            deposits,
            signing_keys,
            key,
            pause_version: config.pause_version,
            max_operators_per_unvetting: config.max_operators_per_unvetting,
            last_snapshot: None,
            last_deposits: HashMap::new(),
            metrics,
            _watchdog: watchdog,
        };
        guardian.deposits.initialize().await.context(DepositsSnafu)?;
        Ok(guardian)
    }

    /// Runs one cycle, recording its duration and failures.
    pub async fn run_cycle(&mut self) -> Result<()> {
        let started = Instant::now();
        let result = self.handle_new_block().await;
        self.metrics
            .cycle_duration
            .observe(started.elapsed().as_secs_f64());
        if let Err(e) = &result {
            self.metrics.cycle_errors.inc();
            error!("❌ Guardian cycle failed: {e}");
        }
        result
    }

    async fn handle_new_block(&mut self) -> Result<()> {
        let snapshot = self.keys_api.snapshot().await.context(KeysApiSnafu)?;
        if !is_new_snapshot(self.last_snapshot.as_ref(), &snapshot.block) {
            return Ok(());
        }
        let BlockSnapshot {
            block_number,
            block_hash,
        } = snapshot.block;
        info!("📥 New cycle at block {block_number} ({block_hash})");

        let head = self.provider.block_number().await.context(ProviderSnafu)?;
        self.metrics.block_number.set(i64::try_from(head).unwrap_or(i64::MAX));

        self.deposits
            .handle_new_block(head)
            .await
            .context(DepositsSnafu)?;
        self.signing_keys.set_module_addresses(
            snapshot
                .modules
                .iter()
                .map(|m| m.module.staking_module_address)
                .collect(),
        );
        self.signing_keys
            .update_events_cache()
            .await
            .context(SigningKeysSnafu)?;

        let tag = BlockTag::canonical(block_hash);
        let guardian_address = self.key.address();
        let (deposited, key_events) = tokio::try_join!(
            async {
                self.deposits
                    .get_all_deposited_events(block_number, block_hash)
                    .await
                    .context(DepositsSnafu)
            },
            async {
                self.signing_keys
                    .get_updated_signing_key_events(block_number, block_hash)
                    .await
                    .context(SigningKeysSnafu)
            },
        )?;
        let module_ids: Vec<u64> = snapshot.modules.iter().map(|m| m.module.id).collect();
        let CycleState {
            deposit_root,
            guardian_index,
            withdrawal_credentials: protocol_wc,
            prefixes,
            active_modules,
        } = self
            .reader
            .read(guardian_address, &module_ids, tag)
            .await
            .context(ProviderSnafu)?;

        let registry_keys: Vec<RegistryKey> = snapshot
            .modules
            .iter()
            .flat_map(|m| m.keys.iter().cloned())
            .collect();
        let modules: Vec<ModuleState> = snapshot
            .modules
            .into_iter()
            .zip(active_modules)
            .map(|(registry, is_active)| ModuleState {
                registry,
                is_active,
            })
            .collect();

        let context = ClassificationContext::new(
            block_hash,
            protocol_wc,
            &deposited.group.events,
            &key_events.group.events,
        );
        let modules_data = self
            .aggregator
            .classify_modules(context, modules)
            .await
            .context(AggregatorSnafu)?;
        self.collect_module_metrics(&modules_data);

        let block = CycleBlock {
            block_number,
            block_hash,
            identity: GuardianIdentity {
                guardian_address,
                guardian_index,
            },
            deposit_root,
            prefixes,
        };
        self.ping(&block, module_ids).await?;

        let historical = !historical_front_run(&deposited.group.events, protocol_wc, &registry_keys).is_empty();
        let data_trusted = deposited.is_valid && key_events.is_valid;
        if !data_trusted {
            warn!("⚠️ Deposit or signing key data at block {block_number} is not trusted");
        }
        let plan = plan_cycle(&modules_data, historical, data_trusted);

        if plan.pause {
            self.pause(&block, &modules_data).await?;
        }
        for &i in &plan.unvet {
            self.unvet(&block, &modules_data[i]).await?;
        }
        for &i in &plan.deposit {
            self.deposit(&block, &modules_data[i]).await?;
        }

        self.last_snapshot = Some(snapshot.block);
        Ok(())
    }

    fn collect_module_metrics(&self, modules: &[StakingModuleData]) {
        for module in modules {
            let id = module.staking_module_id.to_string();
            for (kind, count) in [
                ("vetted_unused", module.vetted_unused_keys.len()),
                ("duplicated", module.duplicated_keys.len()),
                ("unresolved_duplicated", module.unresolved_duplicated_keys.len()),
                ("invalid", module.invalid_keys.len()),
                ("front_run", module.front_run_keys.len()),
            ] {
                self.metrics
                    .module_keys
                    .with_label_values(&[id.as_str(), kind])
                    .set(i64::try_from(count).unwrap_or(i64::MAX));
            }
        }
    }

    fn sign(&self, payload: &[u8]) -> Result<GuardianSignature> {
        self.key.sign_payload(payload).context(SigningSnafu)
    }

    async fn send(&self, message: GuardianMessage) -> Result<()> {
        self.messenger
            .send(DEFENDER_TOPIC, message)
            .await
            .context(MessengerSnafu)?;
        Ok(())
    }

    async fn ping(&self, block: &CycleBlock, staking_module_ids: Vec<u64>) -> Result<()> {
        self.send(GuardianMessage::Ping(PingMessage {
            identity: block.identity,
            block_number: block.block_number,
            staking_module_ids,
        }))
        .await
    }

    async fn pause(&self, block: &CycleBlock, modules: &[StakingModuleData]) -> Result<()> {
        warn!(
            "🚨 Front-run detected at block {}, initiating deposit pause",
            block.block_number
        );
        match self.pause_version {
            PauseVersion::V3 => {
                let paused = self
                    .security
                    .is_deposits_paused(block.tag())
                    .await
                    .context(ProviderSnafu)?;
                if paused {
                    warn!("⚠️ Deposits are already paused");
                    return Ok(());
                }
                let signature = self.sign(&signing::pause_v3_payload(
                    block.prefixes.pause,
                    block.block_number,
                ))?;
                self.send(GuardianMessage::Pause(PauseMessage::V3(PauseV3Message {
                    identity: block.identity,
                    block_number: block.block_number,
                    block_hash: block.block_hash,
                    signature,
                })))
                .await
            }
            PauseVersion::V2 => {
                let Some(module) = modules.iter().find(|m| !m.is_module_deposits_paused) else {
                    warn!("⚠️ Deposits into every module are already paused");
                    return Ok(());
                };
                let signature = self.sign(&signing::pause_v2_payload(
                    block.prefixes.pause,
                    block.block_number,
                    module.staking_module_id,
                ))?;
                self.send(GuardianMessage::Pause(PauseMessage::V2(PauseV2Message {
                    identity: block.identity,
                    block_number: block.block_number,
                    block_hash: block.block_hash,
                    deposit_root: block.deposit_root,
                    nonce: module.nonce,
                    staking_module_id: module.staking_module_id,
                    signature,
                })))
                .await
            }
        }
    }

    async fn unvet(&self, block: &CycleBlock, module: &StakingModuleData) -> Result<()> {
        let max_operators = match self.max_operators_per_unvetting {
            Some(max) => max,
            None => self
                .security
                .max_operators_per_unvetting(block.tag())
                .await
                .context(ProviderSnafu)?,
        };
        let keys = keys_to_unvet(module);
        warn!(
            "⚠️ Unvetting {} keys of module {}",
            keys.len(),
            module.staking_module_id
        );

        for chunk in unvet_chunks(&keys, max_operators) {
            let signature = self.sign(&signing::unvet_payload(
                block.prefixes.unvet,
                block.block_number,
                block.block_hash,
                module.staking_module_id,
                module.nonce,
                &chunk.operator_ids,
                &chunk.vetted_keys_by_operator,
            ))?;
            self.send(GuardianMessage::Unvet(UnvetMessage {
                identity: block.identity,
                block_number: block.block_number,
                block_hash: block.block_hash,
                nonce: module.nonce,
                staking_module_id: module.staking_module_id,
                operator_ids: chunk.operator_ids,
                vetted_keys_by_operator: chunk.vetted_keys_by_operator,
                signature,
            }))
            .await?;
        }
        Ok(())
    }

    async fn deposit(&mut self, block: &CycleBlock, module: &StakingModuleData) -> Result<()> {
        let state = ContractsState {
            deposit_root: block.deposit_root,
            nonce: module.nonce,
            last_changed_block_hash: module.last_changed_block_hash,
            block_number: block.block_number,
        };
        if self
            .last_deposits
            .get(&module.staking_module_id)
            .is_some_and(|last| last.is_same(&state))
        {
            return Ok(());
        }

        let signature = self.sign(&signing::deposit_payload(
            block.prefixes.attest,
            block.block_number,
            block.block_hash,
            block.deposit_root,
            module.staking_module_id,
            module.nonce,
        ))?;
        self.send(GuardianMessage::Deposit(DepositMessage {
            identity: block.identity,
            block_number: block.block_number,
            block_hash: block.block_hash,
            deposit_root: block.deposit_root,
            nonce: module.nonce,
            staking_module_id: module.staking_module_id,
            signature,
        }))
        .await?;
        self.last_deposits.insert(module.staking_module_id, state);
        Ok(())
    }

    /// Address messages are signed with.
    pub fn guardian_address(&self) -> Address {
        self.key.address()
    }
}
