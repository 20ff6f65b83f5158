//! Kafka transport: each guardian topic is a Kafka topic and the message type travels in a header.

use std::fmt;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use futures::StreamExt;
use log::{debug, warn};
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::message::{Header, Headers, Message, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::util::Timeout;
use serde_json::Value;
use snafu::ResultExt;
use tokio::task::JoinHandle;

use super::{
    KafkaConfig, MessageHandler, MessageType, Result, SerializeSnafu, Transport, TransportError,
    MESSAGE_TYPE_HEADER,
};

fn security_protocol(config: &KafkaConfig) -> &'static str {
    match (config.ssl, config.sasl_mechanism.is_some()) {
        (false, false) => "plaintext",
        (true, false) => "ssl",
        (false, true) => "sasl_plaintext",
        (true, true) => "sasl_ssl",
    }
}

fn client_config(config: &KafkaConfig) -> ClientConfig {
    let mut client = ClientConfig::new();
    client
        .set("bootstrap.servers", config.brokers.join(","))
        .set("client.id", &config.client_id)
        .set("security.protocol", security_protocol(config))
        .set(
            "message.timeout.ms",
            config.request_timeout.as_millis().to_string(),
        );
    if let Some(mechanism) = &config.sasl_mechanism {
        client.set("sasl.mechanism", mechanism.to_uppercase());
        if let Some(username) = &config.username {
            client.set("sasl.username", username);
        }
        if let Some(password) = &config.password {
            client.set("sasl.password", password);
        }
    }
    client
}

/// Consumer group of a subscription; one per message type so subscriptions never split partitions.
fn group_id(topic: &str, message_type: MessageType) -> String {
    format!("{topic}-{message_type}-group")
}

fn kafka_error(operation: &str, error: rdkafka::error::KafkaError) -> TransportError {
    TransportError::Kafka {
        operation: operation.to_owned(),
        message: error.to_string(),
    }
}

/// Transport over a shared Kafka producer.
pub struct KafkaTransport {
    config: KafkaConfig,
    producer: FutureProducer,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl fmt::Debug for KafkaTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KafkaTransport")
            .field("brokers", &self.config.brokers)
            .finish_non_exhaustive()
    }
}

impl Drop for KafkaTransport {
    fn drop(&mut self) {
        for task in self
            .subscriptions
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
        {
            task.abort();
        }
    }
}

impl KafkaTransport {
    /// Creates the producer. Brokers are contacted lazily.
    pub fn new(config: KafkaConfig) -> Result<Self> {
        let producer = client_config(&config)
            .create()
            .map_err(|e| kafka_error("create producer", e))?;
        Ok(Self {
            config,
            producer,
            subscriptions: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl Transport for KafkaTransport {
    async fn publish(&self, topic: &str, payload: Value, message_type: MessageType) -> Result<()> {
        let body = serde_json::to_vec(&payload).context(SerializeSnafu)?;
        let record = FutureRecord::to(topic)
            .key(message_type.as_str())
            .payload(&body)
            .headers(OwnedHeaders::new().insert(Header {
                key: MESSAGE_TYPE_HEADER,
                value: Some(message_type.as_str()),
            }));

        self.producer
            .send(record, Timeout::After(self.config.request_timeout))
            .await
            .map_err(|(e, _)| kafka_error("publish", e))?;
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        message_type: MessageType,
        handler: MessageHandler,
    ) -> Result<()> {
        let consumer: StreamConsumer = client_config(&self.config)
            .set("group.id", group_id(topic, message_type))
            .set("auto.offset.reset", "latest")
            .create()
            .map_err(|e| kafka_error("create consumer", e))?;
        consumer
            .subscribe(&[topic])
            .map_err(|e| kafka_error("subscribe", e))?;

        let topic = topic.to_owned();
        let task = tokio::spawn(async move {
            let mut stream = consumer.stream();
            while let Some(message) = stream.next().await {
                let message = match message {
                    Ok(message) => message,
                    Err(e) => {
                        warn!("⚠️ Failed to consume {topic}: {e}");
                        continue;
                    }
                };
                let kind = message
                    .headers()
                    .and_then(|headers| headers.iter().find(|h| h.key == MESSAGE_TYPE_HEADER))
                    .and_then(|header| header.value)
                    .and_then(|value| std::str::from_utf8(value).ok())
                    .and_then(MessageType::parse);
                if kind != Some(message_type) {
                    continue;
                }
                match message.payload().map(serde_json::from_slice::<Value>) {
                    Some(Ok(payload)) => handler(payload),
                    Some(Err(e)) => debug!("skipping undecodable {message_type} message: {e}"),
                    None => debug!("skipping empty {message_type} message"),
                }
            }
        });
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn config() -> KafkaConfig {
        KafkaConfig {
            brokers: vec!["b1:9092".into(), "b2:9092".into()],
            client_id: "guardian".into(),
            ssl: true,
            sasl_mechanism: Some("scram-sha-512".into()),
            username: Some("user".into()),
            password: Some("secret".into()),
            request_timeout: Duration::from_secs(2),
        }
    }

    #[test]
    fn client_settings_follow_the_config() {
        let client = client_config(&config());
        assert_eq!(client.get("bootstrap.servers"), Some("b1:9092,b2:9092"));
        assert_eq!(client.get("security.protocol"), Some("sasl_ssl"));
        assert_eq!(client.get("sasl.mechanism"), Some("SCRAM-SHA-512"));
        assert_eq!(client.get("message.timeout.ms"), Some("2000"));

        let plain = KafkaConfig {
            ssl: false,
            sasl_mechanism: None,
            ..config()
        };
        assert_eq!(client_config(&plain).get("security.protocol"), Some("plaintext"));
        assert_eq!(client_config(&plain).get("sasl.username"), None);
    }

    #[test]
    fn message_types_consume_in_separate_groups() {
        assert_eq!(
            group_id("mainnet-defender", MessageType::Pause),
            "mainnet-defender-pause-group"
        );
    }

    #[tokio::test]
    async fn unreachable_brokers_fail_the_publish_in_time() {
        let transport = KafkaTransport::new(KafkaConfig {
            brokers: vec!["127.0.0.1:1".into()],
            ssl: false,
            sasl_mechanism: None,
            request_timeout: Duration::from_millis(500),
            ..config()
        })
        .unwrap();

        let result = tokio::time::timeout(
            Duration::from_secs(10),
            transport.publish("holesky-defender", serde_json::json!({}), MessageType::Ping),
        )
        .await
        .expect("publish was not abandoned");
        assert!(matches!(result, Err(TransportError::Kafka { .. })));
    }
}
