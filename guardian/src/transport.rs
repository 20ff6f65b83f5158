//! # Message transports
//!
//! Guardians exchange messages over a topic based pub/sub broker. The [`Transport`] trait is the
//! seam the messenger publishes through. Implementations:
//! - [`AmqpTransport`]: RabbitMQ over AMQP 0-9-1, one topic exchange per topic.
//! - [`RabbitHttpTransport`]: RabbitMQ through its management HTTP API.
//! - `KafkaTransport` (feature `kafka`): one Kafka topic per guardian topic.
//! - [`InMemoryTransport`]: everything stays in process.
//!
//! Every broker round trip is bounded by the transport's request timeout, so a stuck broker
//! surfaces as [`TransportError::Timeout`] instead of blocking the messenger.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use snafu::Snafu;
use url::Url;

mod amqp;
#[cfg(feature = "kafka")]
mod kafka;
mod rabbit_http;

pub use amqp::{AmqpConfig, AmqpTransport};
#[cfg(feature = "kafka")]
pub use kafka::KafkaTransport;
pub use rabbit_http::{RabbitConfig, RabbitHttpTransport};

/// Default bound of a single broker round trip.
pub const DEFAULT_BROKER_TIMEOUT: Duration = Duration::from_secs(30);

/// Header carrying the message type where the broker has no better place for it.
const MESSAGE_TYPE_HEADER: &str = "messageType";

/// Errors returned by a [`Transport`].
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum TransportError {
    /// The broker could not be reached or rejected the request.
    #[snafu(display("Broker request to {url} failed: {source}"))]
    Http {
        /// Endpoint of the request.
        url: Url,
        /// Underlying HTTP error.
        source: reqwest::Error,
    },

    /// The broker base URL cannot take a path.
    #[snafu(display("Broker url {url} cannot be a base"))]
    InvalidUrl {
        /// The configured URL.
        url: Url,
    },

    /// The HTTP client could not be built.
    #[snafu(display("Failed to build broker client: {source}"))]
    Client {
        /// Underlying HTTP error.
        source: reqwest::Error,
    },

    /// The AMQP connection or channel failed.
    #[snafu(display("AMQP {operation} failed: {source}"))]
    Amqp {
        /// What was being done.
        operation: String,
        /// Client error.
        source: lapin::Error,
    },

    /// The Kafka client failed.
    #[snafu(display("Kafka {operation} failed: {message}"))]
    Kafka {
        /// What was being done.
        operation: String,
        /// Client error.
        message: String,
    },

    /// The broker did not answer in time.
    #[snafu(display("Broker {operation} timed out after {timeout:?}"))]
    Timeout {
        /// What was being done.
        operation: String,
        /// The bound that was hit.
        timeout: Duration,
    },

    /// The configured transport is not part of this build.
    #[snafu(display("Transport {name} is not supported by this build"))]
    Unsupported {
        /// Transport name.
        name: String,
    },

    /// A message could not be serialized.
    #[snafu(display("Failed to serialize message: {source}"))]
    Serialize {
        /// Serialization error.
        source: serde_json::Error,
    },
}

/// Result alias of this module.
pub type Result<T, E = TransportError> = std::result::Result<T, E>;

/// Kind of a guardian message, carried next to the payload by the broker.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageType {
    /// Liveness beacon.
    Ping,
    /// Deposit attestation.
    Deposit,
    /// Request to pause deposits.
    Pause,
    /// Request to unvet keys.
    Unvet,
}

impl MessageType {
    /// Wire name of the message type.
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Ping => "ping",
            MessageType::Deposit => "deposit",
            MessageType::Pause => "pause",
            MessageType::Unvet => "unvet",
        }
    }

    /// The message type named `value` on the wire.
    pub fn parse(value: &str) -> Option<Self> {
        [Self::Ping, Self::Deposit, Self::Pause, Self::Unvet]
            .into_iter()
            .find(|t| t.as_str() == value)
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Callback for inbound messages.
pub type MessageHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Topic based pub/sub broker.
#[async_trait]
pub trait Transport: Send + Sync + fmt::Debug {
    /// Publishes `payload` on `topic`.
    async fn publish(&self, topic: &str, payload: Value, message_type: MessageType) -> Result<()>;

    /// Delivers every message of `message_type` published on `topic` to `handler`.
    ///
    /// A message may be delivered more than once.
    async fn subscribe(
        &self,
        topic: &str,
        message_type: MessageType,
        handler: MessageHandler,
    ) -> Result<()>;
}

/// A message recorded by [`InMemoryTransport`].
#[derive(Clone, Debug, PartialEq)]
pub struct PublishedMessage {
    /// Topic it was published on.
    pub topic: String,
    /// The payload.
    pub payload: Value,
    /// Its message type.
    pub message_type: MessageType,
}

type Subscribers = HashMap<(String, MessageType), Vec<MessageHandler>>;

/// In-process transport that records every published message.
#[derive(Default)]
pub struct InMemoryTransport {
    published: Mutex<Vec<PublishedMessage>>,
    subscribers: Mutex<Subscribers>,
}

impl fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("published", &self.published().len())
            .finish_non_exhaustive()
    }
}

impl InMemoryTransport {
    /// An empty transport without subscribers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every message published so far, oldest first.
    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, topic: &str, payload: Value, message_type: MessageType) -> Result<()> {
        let handlers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(topic.to_string(), message_type))
            .cloned()
            .unwrap_or_default();

        self.published
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.clone(),
                message_type,
            });

        for handler in handlers {
            handler(payload.clone());
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        message_type: MessageType,
        handler: MessageHandler,
    ) -> Result<()> {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry((topic.to_string(), message_type))
            .or_default()
            .push(handler);
        Ok(())
    }
}

/// Connection settings of a Kafka cluster.
#[derive(Clone, Debug)]
pub struct KafkaConfig {
    /// Bootstrap brokers, `host:port`.
    pub brokers: Vec<String>,
    /// Client id reported to the brokers.
    pub client_id: String,
    /// Connect over TLS.
    pub ssl: bool,
    /// SASL mechanism such as `plain` or `scram-sha-512`; no authentication when unset.
    pub sasl_mechanism: Option<String>,
    /// SASL user.
    pub username: Option<String>,
    /// SASL password.
    pub password: Option<String>,
    /// Bound of a single produce.
    pub request_timeout: Duration,
}

/// Builds the Kafka transport when the `kafka` feature is enabled.
#[cfg(feature = "kafka")]
pub fn kafka(config: KafkaConfig) -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(KafkaTransport::new(config)?))
}

/// Builds the Kafka transport when the `kafka` feature is enabled.
#[cfg(not(feature = "kafka"))]
pub fn kafka(_config: KafkaConfig) -> Result<Arc<dyn Transport>> {
    Err(TransportError::Unsupported {
        name: "kafka".to_owned(),
    })
}

/// Runs one broker round trip, giving up after `timeout`.
async fn bounded<T, F>(operation: &str, timeout: Duration, round_trip: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(timeout, round_trip)
        .await
        .unwrap_or_else(|_| {
            Err(TransportError::Timeout {
                operation: operation.to_owned(),
                timeout,
            })
        })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn in_memory_delivers_to_matching_subscribers() {
        let transport = InMemoryTransport::new();
        let received = Arc::new(AtomicUsize::new(0));
        let counter = received.clone();
        transport
            .subscribe(
                "mainnet-defender",
                MessageType::Pause,
                Arc::new(move |_| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .await
            .unwrap();

        transport
            .publish("mainnet-defender", json!({"a": 1}), MessageType::Pause)
            .await
            .unwrap();
        transport
            .publish("mainnet-defender", json!({"a": 2}), MessageType::Ping)
            .await
            .unwrap();
        transport
            .publish("holesky-defender", json!({"a": 3}), MessageType::Pause)
            .await
            .unwrap();

        assert_eq!(received.load(Ordering::SeqCst), 1);
        assert_eq!(transport.published().len(), 3);
        assert_eq!(transport.published()[1].message_type, MessageType::Ping);
    }

    #[tokio::test]
    async fn slow_round_trips_time_out() {
        let error = bounded("publish", Duration::from_millis(10), async {
            std::future::pending::<Result<()>>().await
        })
        .await
        .unwrap_err();
        assert!(matches!(error, TransportError::Timeout { ref operation, .. } if operation == "publish"));

        assert_eq!(
            bounded("publish", Duration::from_secs(1), async { Ok(5) }).await.unwrap(),
            5
        );
    }

    #[cfg(not(feature = "kafka"))]
    #[test]
    fn kafka_needs_its_feature() {
        let config = KafkaConfig {
            brokers: vec!["localhost:9092".into()],
            client_id: "guardian".into(),
            ssl: false,
            sasl_mechanism: None,
            username: None,
            password: None,
            request_timeout: DEFAULT_BROKER_TIMEOUT,
        };
        assert!(matches!(kafka(config), Err(TransportError::Unsupported { .. })));
    }

    #[test]
    fn message_types_have_wire_names() {
        assert_eq!(MessageType::parse("unvet"), Some(MessageType::Unvet));
        assert_eq!(MessageType::parse("UNVET"), None);
        assert_eq!(serde_json::to_value(MessageType::Deposit).unwrap(), json!("deposit"));
    }
}
