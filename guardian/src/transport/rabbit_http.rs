//! RabbitMQ through the management HTTP API: publishing posts to an exchange, subscriptions poll
//! a queue bound to it.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, warn};
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use snafu::ResultExt;
use tokio::task::JoinHandle;
use url::Url;

use super::{
    ClientSnafu, HttpSnafu, MessageHandler, MessageType, Result, SerializeSnafu, Transport,
    TransportError, MESSAGE_TYPE_HEADER,
};

/// Connection settings of a RabbitMQ management API.
#[derive(Clone, Debug)]
pub struct RabbitConfig {
    /// Base URL of the management API, e.g. `http://localhost:15672`.
    pub url: Url,
    /// Virtual host.
    pub vhost: String,
    /// Exchange messages are published to, with the topic as routing key.
    pub exchange: String,
    /// Management API user.
    pub user: String,
    /// Management API password.
    pub password: String,
    /// Interval between polls of subscribed queues.
    pub poll_interval: Duration,
    /// Bound of a single management API request.
    pub request_timeout: Duration,
}

/// Messages fetched from a queue per poll.
const POLL_BATCH: u32 = 100;

#[derive(Deserialize)]
struct PublishResponse {
    routed: bool,
}

#[derive(Deserialize)]
struct QueuedMessage {
    payload: String,
    #[serde(default)]
    properties: QueuedProperties,
}

#[derive(Default, Deserialize)]
struct QueuedProperties {
    #[serde(default)]
    headers: HashMap<String, Value>,
}

/// Transport backed by the RabbitMQ management HTTP API.
#[derive(Debug)]
pub struct RabbitHttpTransport {
    client: Client,
    config: RabbitConfig,
    subscriptions: Mutex<Vec<JoinHandle<()>>>,
}

impl Drop for RabbitHttpTransport {
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

impl RabbitHttpTransport {
    /// A transport for the management API described by `config`.
    pub fn new(config: RabbitConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.request_timeout)
            .build()
            .context(ClientSnafu)?;
        Ok(Self {
            client,
            config,
            subscriptions: Mutex::new(Vec::new()),
        })
    }

    fn endpoint(&self, segments: &[&str]) -> Result<Url> {
        endpoint(&self.config.url, segments)
    }

    async fn post(&self, url: Url, body: &Value) -> Result<reqwest::Response> {
        self.client
            .post(url.clone())
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(HttpSnafu { url })
    }

    async fn put(&self, url: Url, body: &Value) -> Result<()> {
        self.client
            .put(url.clone())
            .basic_auth(&self.config.user, Some(&self.config.password))
            .json(body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .context(HttpSnafu { url })?;
        Ok(())
    }
}

fn endpoint(base: &Url, segments: &[&str]) -> Result<Url> {
    let mut url = base.clone();
    url.path_segments_mut()
        .map_err(|_| TransportError::InvalidUrl { url: base.clone() })?
        .pop_if_empty()
        .push("api")
        .extend(segments);
    Ok(url)
}

async fn poll_queue(
    client: Client,
    config: RabbitConfig,
    url: Url,
    message_type: MessageType,
    handler: MessageHandler,
) {
    let mut interval = tokio::time::interval(config.poll_interval);
    let body = json!({
        "count": POLL_BATCH,
        "ackmode": "ack_requeue_false",
        "encoding": "auto",
    });

    loop {
        interval.tick().await;
        let response = client
            .post(url.clone())
            .basic_auth(&config.user, Some(&config.password))
            .json(&body)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status);
        let messages: Vec<QueuedMessage> = match response {
            Ok(response) => match response.json().await {
                Ok(messages) => messages,
                Err(e) => {
                    warn!("⚠️ Unreadable messages from {url}: {e}");
                    continue;
                }
            },
            Err(e) => {
                warn!("⚠️ Failed to poll {url}: {e}");
                continue;
            }
        };

        for message in messages {
            let kind = message
                .properties
                .headers
                .get(MESSAGE_TYPE_HEADER)
                .and_then(Value::as_str)
                .and_then(MessageType::parse);
            if kind != Some(message_type) {
                continue;
            }
            match serde_json::from_str(&message.payload) {
                Ok(payload) => handler(payload),
                Err(e) => debug!("skipping undecodable {message_type} message: {e}"),
            }
        }
    }
}

#[async_trait]
impl Transport for RabbitHttpTransport {
    async fn publish(&self, topic: &str, payload: Value, message_type: MessageType) -> Result<()> {
        let url = self.endpoint(&[
            "exchanges",
            &self.config.vhost,
            &self.config.exchange,
            "publish",
        ])?;
        let body = json!({
            "properties": { "headers": { MESSAGE_TYPE_HEADER: message_type.as_str() } },
            "routing_key": topic,
            "payload": serde_json::to_string(&payload).context(SerializeSnafu)?,
            "payload_encoding": "string",
        });

        let response = self.post(url.clone(), &body).await?;
        match response.json::<PublishResponse>().await {
            Ok(PublishResponse { routed: false }) => {
                warn!("⚠️ {message_type} message on {topic} was not routed to any queue")
            }
            Ok(_) => {}
            Err(e) => debug!("unreadable publish response from {url}: {e}"),
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        topic: &str,
        message_type: MessageType,
        handler: MessageHandler,
    ) -> Result<()> {
        let queue = format!("{topic}.{message_type}");
        self.put(
            self.endpoint(&["queues", &self.config.vhost, &queue])?,
            &json!({ "durable": false, "auto_delete": true }),
        )
        .await?;
        self.post(
            self.endpoint(&[
                "bindings",
                &self.config.vhost,
                "e",
                &self.config.exchange,
                "q",
                &queue,
            ])?,
            &json!({ "routing_key": topic }),
        )
        .await?;

        let url = self.endpoint(&["queues", &self.config.vhost, &queue, "get"])?;
        let task = tokio::spawn(poll_queue(
            self.client.clone(),
            self.config.clone(),
            url,
            message_type,
            handler,
        ));
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(task);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(url: Url) -> RabbitConfig {
        RabbitConfig {
            url,
            vhost: "/".into(),
            exchange: "amq.topic".into(),
            user: "guest".into(),
            password: "guest".into(),
            poll_interval: Duration::from_secs(1),
            request_timeout: Duration::from_millis(100),
        }
    }

    #[test]
    fn management_endpoints_escape_the_vhost() {
        let base = Url::parse("http://localhost:15672/").unwrap();
        let url = endpoint(&base, &["exchanges", "/", "amq.topic", "publish"]).unwrap();
        assert_eq!(
            url.as_str(),
            "http://localhost:15672/api/exchanges/%2F/amq.topic/publish"
        );
    }


    #[tokio::test]
    async fn stuck_broker_does_not_hold_a_publish() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and never answer
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = Url::parse(&format!("http://{addr}/")).unwrap();
        let transport = RabbitHttpTransport::new(config(url)).unwrap();
        let error = tokio::time::timeout(
            Duration::from_secs(5),
            transport.publish("holesky-defender", json!({}), MessageType::Ping),
        )
        .await
        .expect("publish was not abandoned")
        .unwrap_err();

        assert!(matches!(error, TransportError::Http { ref source, .. } if source.is_timeout()));
        server.abort();
    }
}
