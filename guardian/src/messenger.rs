//! # Guardian messenger
//!
//! Guardian protocol messages and the component that publishes them. A message goes through
//! `Drafted -> MetadataAttached -> GuardianCheck` and ends up either discarded, when this guardian
//! is not a member of the guardian set, or published on `<network prefix>-<topic>`.

use std::sync::Arc;

use alloy::primitives::{Address, Bytes, B256};
use guardian_core::signing::GuardianSignature;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use snafu::{ResultExt, Snafu};

use crate::async_mutex::{AsyncMutex, MutexError};
use crate::metrics::GuardianMetrics;
use crate::transport::{MessageHandler, MessageType, Transport, TransportError};

/// Topic guardian messages are exchanged on.
pub const DEFENDER_TOPIC: &str = "defender";

/// Errors returned by [`GuardianMessenger`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum MessengerError {
    /// The message could not be turned into JSON.
    #[snafu(display("Failed to serialize {message_type} message: {source}"))]
    Encode {
        /// Kind of the message.
        message_type: MessageType,
        /// Serialization error.
        source: serde_json::Error,
    },

    /// The transport failed.
    #[snafu(display("Failed to publish {message_type} message: {source}"))]
    Publish {
        /// Kind of the message.
        message_type: MessageType,
        /// Transport error.
        source: TransportError,
    },

    /// The publish lock failed.
    #[snafu(display("Publish lock failed: {source}"))]
    Lock {
        /// Mutex error.
        source: MutexError,
    },

    /// Subscribing to a topic failed.
    #[snafu(display("Failed to subscribe to {topic}: {source}"))]
    Subscribe {
        /// Topic subscribed to.
        topic: String,
        /// Transport error.
        source: TransportError,
    },
}

/// Result alias of this module.
pub type Result<T, E = MessengerError> = std::result::Result<T, E>;

/// Topic prefix of a supported network.
pub fn topic_prefix(chain_id: u64) -> Option<&'static str> {
    match chain_id {
        1 => Some("mainnet"),
        5 => Some("goerli"),
        17000 => Some("holesky"),
        560048 => Some("hoodi"),
        _ => None,
    }
}

/// Sender identity attached to every message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GuardianIdentity {
    /// Address of the guardian key.
    pub guardian_address: Address,
    /// Index in the security module's guardian list, `-1` when not a member.
    pub guardian_index: i64,
}

impl GuardianIdentity {
    /// Whether the guardian is part of the guardian set.
    pub fn is_member(&self) -> bool {
        self.guardian_index >= 0
    }
}

/// Liveness beacon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PingMessage {
    /// Sender of the message.
    #[serde(flatten)]
    pub identity: GuardianIdentity,
    /// Block the message refers to.
    pub block_number: u64,
    /// Modules the guardian watches.
    pub staking_module_ids: Vec<u64>,
}

/// Attestation that deposits into a module are safe at a block.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DepositMessage {
    /// Sender of the message.
    #[serde(flatten)]
    pub identity: GuardianIdentity,
    /// Block the message refers to.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: B256,
    /// Deposit contract root at that block.
    pub deposit_root: B256,
    /// Key registry nonce of the module at that block.
    pub nonce: u64,
    /// Module the message is about.
    pub staking_module_id: u64,
    /// Guardian signature over the message payload.
    pub signature: GuardianSignature,
}

/// Request to pause deposits into one module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseV2Message {
    /// Sender of the message.
    #[serde(flatten)]
    pub identity: GuardianIdentity,
    /// Block the message refers to.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: B256,
    /// Deposit contract root at that block.
    pub deposit_root: B256,
    /// Key registry nonce of the module at that block.
    pub nonce: u64,
    /// Module the message is about.
    pub staking_module_id: u64,
    /// Guardian signature over the message payload.
    pub signature: GuardianSignature,
}

/// Request to pause deposits protocol wide.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PauseV3Message {
    /// Sender of the message.
    #[serde(flatten)]
    pub identity: GuardianIdentity,
    /// Block the message refers to.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: B256,
    /// Guardian signature over the message payload.
    pub signature: GuardianSignature,
}

/// Either pause format. `V2` is tried first as it carries a superset of the fields.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PauseMessage {
    /// Per-module pause.
    V2(PauseV2Message),
    /// Protocol wide pause.
    V3(PauseV3Message),
}

/// Request to lower the vetted key counts of some operators of a module.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnvetMessage {
    /// Sender of the message.
    #[serde(flatten)]
    pub identity: GuardianIdentity,
    /// Block the message refers to.
    pub block_number: u64,
    /// Hash of that block.
    pub block_hash: B256,
    /// Key registry nonce of the module at that block.
    pub nonce: u64,
    /// Module the message is about.
    pub staking_module_id: u64,
    /// Packed 8 byte operator ids.
    pub operator_ids: Bytes,
    /// Packed 16 byte vetted key counts.
    pub vetted_keys_by_operator: Bytes,
    /// Guardian signature over the message payload.
    pub signature: GuardianSignature,
}

/// A guardian protocol message, tagged by `type` on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GuardianMessage {
    /// Liveness beacon.
    Ping(PingMessage),
    /// Deposit attestation.
    Deposit(DepositMessage),
    /// Deposit pause request.
    Pause(PauseMessage),
    /// Key unvetting request.
    Unvet(UnvetMessage),
}

impl GuardianMessage {
    /// Broker message type of this message.
    pub fn message_type(&self) -> MessageType {
        match self {
            GuardianMessage::Ping(_) => MessageType::Ping,
            GuardianMessage::Deposit(_) => MessageType::Deposit,
            GuardianMessage::Pause(_) => MessageType::Pause,
            GuardianMessage::Unvet(_) => MessageType::Unvet,
        }
    }

    /// Sender of this message.
    pub fn identity(&self) -> &GuardianIdentity {
        match self {
            GuardianMessage::Ping(m) => &m.identity,
            GuardianMessage::Deposit(m) => &m.identity,
            GuardianMessage::Pause(PauseMessage::V2(m)) => &m.identity,
            GuardianMessage::Pause(PauseMessage::V3(m)) => &m.identity,
            GuardianMessage::Unvet(m) => &m.identity,
        }
    }

    /// Block this message refers to.
    pub fn block_number(&self) -> u64 {
        match self {
            GuardianMessage::Ping(m) => m.block_number,
            GuardianMessage::Deposit(m) => m.block_number,
            GuardianMessage::Pause(PauseMessage::V2(m)) => m.block_number,
            GuardianMessage::Pause(PauseMessage::V3(m)) => m.block_number,
            GuardianMessage::Unvet(m) => m.block_number,
        }
    }
}

/// Name and version of the sending daemon.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppMeta {
    /// Daemon name.
    pub name: String,
    /// Daemon version.
    pub version: String,
}

impl Default for AppMeta {
    fn default() -> Self {
        Self {
            name: env!("CARGO_PKG_NAME").to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

/// A message with the sender's app metadata, as it goes on the wire.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageEnvelope {
    /// The message itself.
    #[serde(flatten)]
    pub message: GuardianMessage,
    /// Sending daemon.
    pub app: AppMeta,
}

/// What happened to a message handed to [`GuardianMessenger::send`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    /// The guardian is not in the guardian list; nothing was sent.
    Discarded,
    /// The message went out on the transport.
    Published,
}

/// Publishes guardian messages, one at a time.
#[derive(Debug)]
pub struct GuardianMessenger {
    transport: Arc<dyn Transport>,
    publish_lock: AsyncMutex,
    prefix: String,
    app: AppMeta,
    metrics: GuardianMetrics,
}

impl GuardianMessenger {
    /// Creates a messenger publishing under the network `prefix`.
    pub fn new(transport: Arc<dyn Transport>, prefix: impl Into<String>, metrics: GuardianMetrics) -> Self {
        Self {
            transport,
            publish_lock: AsyncMutex::new(),
            prefix: prefix.into(),
            app: AppMeta::default(),
            metrics,
        }
    }

    /// Replaces the app metadata attached to every message.
    pub fn with_app(mut self, app: AppMeta) -> Self {
        self.app = app;
        self
    }

    /// Full topic name of `topic` on this network.
    pub fn topic(&self, topic: &str) -> String {
        format!("{}-{topic}", self.prefix)
    }

    /// Attaches app metadata and publishes `message` on `topic`, unless the guardian is not a member.
    pub async fn send(&self, topic: &str, message: GuardianMessage) -> Result<PublishOutcome> {
        let message_type = message.message_type();
        let identity = *message.identity();
        if !identity.is_member() {
            warn!(
                "⚠️ Your address {} is not in the guardian list, {message_type} message skipped",
                identity.guardian_address
            );
            return Ok(PublishOutcome::Discarded);
        }

        let envelope = MessageEnvelope {
            message,
            app: self.app.clone(),
        };
        let payload = serde_json::to_value(&envelope).context(EncodeSnafu { message_type })?;
        let topic = self.topic(topic);

        self.publish_lock
            .run_exclusive(self.transport.publish(&topic, payload, message_type))
            .await
            .context(LockSnafu)?
            .context(PublishSnafu { message_type })?;

        self.metrics
            .messages_sent
            .with_label_values(&[message_type.as_str()])
            .inc();
        info!(
            "📤 Sent {message_type} message for block {}",
            envelope.message.block_number()
        );
        Ok(PublishOutcome::Published)
    }

    /// Delivers inbound messages of `message_type` on `topic` to `handler`.
    pub async fn subscribe(
        &self,
        topic: &str,
        message_type: MessageType,
        handler: MessageHandler,
    ) -> Result<()> {
        let topic = self.topic(topic);
        self.transport
            .subscribe(&topic, message_type, handler)
            .await
            .context(SubscribeSnafu { topic })
    }
}
