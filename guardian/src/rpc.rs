//! JSON-RPC transport seam.
//!
//! [`ResilientProvider`](crate::provider::ResilientProvider) only ever talks to the node through
//! [`RpcTransport`]. Production uses [`HttpRpcTransport`], built on alloy's `RpcClient`; tests
//! plug in scripted transports. Every HTTP exchange is bounded by a request timeout.

use std::fmt::Debug;
use std::sync::Arc;
use std::time::Duration;

use alloy::rpc::client::{ClientBuilder, RpcClient};
use alloy::transports::{RpcError as AlloyRpcError, TransportError};
use async_trait::async_trait;
use serde_json::Value;
use snafu::Snafu;
use url::Url;

/// JSON-RPC error codes some providers use for "query returned more than N results" and
/// rate limiting.
const LIMIT_EXCEEDED_CODES: &[i64] = &[-32005, -32602];

/// Generic server side error codes.
const SERVER_ERROR_CODES: &[i64] = &[-32000, -32603];

/// Upper bound of a single JSON-RPC exchange unless configured otherwise.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// Label of batched exchanges in errors.
pub const BATCH_METHOD: &str = "batch";

/// Errors returned by a transport.
#[derive(Debug, Clone, Snafu, PartialEq, Eq)]
#[snafu(visibility(pub))]
pub enum RpcError {
    /// The request never produced a JSON-RPC response.
    #[snafu(display("RPC transport error on {method}: {message}"))]
    Transport {
        /// RPC method.
        method: String,
        /// Error reported by the transport.
        message: String,
    },

    /// The node answered with a JSON-RPC error object.
    #[snafu(display("RPC error {code} on {method}: {message}"))]
    Response {
        /// RPC method.
        method: String,
        /// JSON-RPC error code.
        code: i64,
        /// JSON-RPC error message.
        message: String,
    },

    /// The node answered without a result.
    #[snafu(display("Missing response for {method}"))]
    MissingResponse {
        /// RPC method.
        method: String,
    },
}

impl RpcError {
    /// Converts an alloy transport error for `method`.
    pub fn from_transport(method: &str, error: TransportError) -> Self {
        match error {
            AlloyRpcError::ErrorResp(payload) => RpcError::Response {
                method: method.to_owned(),
                code: payload.code,
                message: payload.message.to_string(),
            },
            AlloyRpcError::NullResp => RpcError::MissingResponse {
                method: method.to_owned(),
            },
            other => RpcError::Transport {
                method: method.to_owned(),
                message: other.to_string(),
            },
        }
    }

    /// The error reported when `method` got no answer within `timeout`.
    pub fn timed_out(method: &str, timeout: Duration) -> Self {
        RpcError::Transport {
            method: method.to_owned(),
            message: format!("request timed out after {timeout:?}"),
        }
    }

    /// Whether retrying the same request over a smaller block range may succeed.
    ///
    /// Covers timeouts, result-size limits, missing responses and generic server errors.
    pub fn is_range_limit(&self) -> bool {
        match self {
            RpcError::MissingResponse { .. } => true,
            RpcError::Transport { message, .. } => {
                let message = message.to_lowercase();
                message.contains("timeout") || message.contains("timed out")
            }
            RpcError::Response { code, message, .. } => {
                let message = message.to_lowercase();
                LIMIT_EXCEEDED_CODES.contains(code)
                    || SERVER_ERROR_CODES.contains(code)
                    || message.contains("limit")
                    || message.contains("more than")
                    || message.contains("range")
            }
        }
    }
}

/// A JSON-RPC endpoint.
#[async_trait]
pub trait RpcTransport: Send + Sync + Debug {
    /// Sends one request and returns the raw `result` value.
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError>;

    /// Sends `requests` together and returns one outcome per request, in order.
    ///
    /// The outer error means the exchange as a whole failed. Transports without batching send the
    /// requests one by one.
    async fn batch(
        &self,
        requests: Vec<(String, Value)>,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let mut outcomes = Vec::with_capacity(requests.len());
        for (method, params) in requests {
            outcomes.push(self.request(&method, params).await);
        }
        Ok(outcomes)
    }

    /// Opens an independent connection to the same endpoint.
    fn reconnect(&self) -> Arc<dyn RpcTransport>;
}

/// HTTP transport over alloy's `RpcClient`.
#[derive(Debug, Clone)]
pub struct HttpRpcTransport {
    url: Url,
    client: RpcClient,
    timeout: Duration,
}

impl HttpRpcTransport {
    /// Creates a transport for `url` giving up on exchanges slower than `timeout`.
    pub fn new(url: Url, timeout: Duration) -> Self {
        let client = ClientBuilder::default().http(url.clone());
        Self {
            url,
            client,
            timeout,
        }
    }

    /// The endpoint this transport talks to.
    pub fn url(&self) -> &Url {
        &self.url
    }
}

#[async_trait]
impl RpcTransport for HttpRpcTransport {
    async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
        let call = self.client.request::<Value, Value>(method.to_owned(), params);
        match tokio::time::timeout(self.timeout, call).await {
            Ok(result) => result.map_err(|e| RpcError::from_transport(method, e)),
            Err(_) => Err(RpcError::timed_out(method, self.timeout)),
        }
    }

    async fn batch(
        &self,
        requests: Vec<(String, Value)>,
    ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
        let mut batch = self.client.new_batch();
        let mut waiters = Vec::with_capacity(requests.len());
        for (method, params) in requests {
            let waiter = batch
                .add_call::<Value, Value>(method.clone(), &params)
                .map_err(|e| RpcError::from_transport(&method, e))?;
            waiters.push((method, waiter));
        }

        let exchange = async move {
            batch
                .send()
                .await
                .map_err(|e| RpcError::from_transport(BATCH_METHOD, e))?;
            let mut outcomes = Vec::with_capacity(waiters.len());
            for (method, waiter) in waiters {
                outcomes.push(waiter.await.map_err(|e| RpcError::from_transport(&method, e)));
            }
            Ok(outcomes)
        };
        tokio::time::timeout(self.timeout, exchange)
            .await
            .unwrap_or_else(|_| Err(RpcError::timed_out(BATCH_METHOD, self.timeout)))
    }

    fn reconnect(&self) -> Arc<dyn RpcTransport> {
        Arc::new(Self::new(self.url.clone(), self.timeout))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(code: i64, message: &str) -> RpcError {
        RpcError::Response {
            method: "eth_getLogs".into(),
            code,
            message: message.into(),
        }
    }

    #[test]
    fn size_limits_and_timeouts_are_range_limits() {
        assert!(response(-32005, "query returned more than 10000 results").is_range_limit());
        assert!(response(-32000, "header not found").is_range_limit());
        assert!(response(1, "block range too large").is_range_limit());
        assert!(RpcError::MissingResponse {
            method: "eth_getLogs".into()
        }
        .is_range_limit());
        assert!(RpcError::Transport {
            method: "eth_getLogs".into(),
            message: "operation timed out".into(),
        }
        .is_range_limit());
    }

    #[test]
    fn timeouts_are_reported_as_range_limits() {
        let error = RpcError::timed_out("eth_getLogs", Duration::from_secs(2));
        assert_eq!(
            error.to_string(),
            "RPC transport error on eth_getLogs: request timed out after 2s"
        );
        assert!(error.is_range_limit());
    }

    #[tokio::test]
    async fn unresponsive_nodes_time_out() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        // accept and never answer
        let server = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let url = Url::parse(&format!("http://{addr}")).unwrap();
        let transport = HttpRpcTransport::new(url, Duration::from_millis(100));
        let started = std::time::Instant::now();

        let error = transport.request("eth_blockNumber", Value::Array(vec![])).await.unwrap_err();
        assert_eq!(error, RpcError::timed_out("eth_blockNumber", Duration::from_millis(100)));

        let error = transport
            .batch(vec![("eth_chainId".into(), Value::Array(vec![]))])
            .await
            .unwrap_err();
        assert_eq!(error, RpcError::timed_out(BATCH_METHOD, Duration::from_millis(100)));
        assert!(started.elapsed() < Duration::from_secs(5));
        server.abort();
    }

    #[test]
    fn other_errors_are_not_range_limits() {
        assert!(!response(3, "execution reverted").is_range_limit());
        assert!(!RpcError::Transport {
            method: "eth_call".into(),
            message: "connection refused".into(),
        }
        .is_range_limit());
    }
}

/// Scripted transports shared by test modules across the crate.
#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::*;

    type Handler = dyn Fn(&str, &Value) -> Result<Value, RpcError> + Send + Sync;

    /// Transport answering every request through a closure and recording the calls.
    #[derive(Clone)]
    pub(crate) struct MockTransport {
        handler: Arc<Handler>,
        calls: Arc<Mutex<Vec<(String, Value)>>>,
        batches: Arc<Mutex<Vec<usize>>>,
    }

    impl Debug for MockTransport {
        fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
            f.debug_struct("MockTransport").finish_non_exhaustive()
        }
    }

    impl MockTransport {
        pub(crate) fn new(
            handler: impl Fn(&str, &Value) -> Result<Value, RpcError> + Send + Sync + 'static,
        ) -> Self {
            Self {
                handler: Arc::new(handler),
                calls: Arc::new(Mutex::new(Vec::new())),
                batches: Arc::new(Mutex::new(Vec::new())),
            }
        }

        /// Sizes of the batches sent so far.
        pub(crate) fn batch_sizes(&self) -> Vec<usize> {
            self.batches.lock().unwrap().clone()
        }

        pub(crate) fn calls(&self) -> Vec<(String, Value)> {
            self.calls.lock().unwrap().clone()
        }

        pub(crate) fn count(&self, method: &str) -> usize {
            self.calls
                .lock()
                .unwrap()
                .iter()
                .filter(|(m, _)| m == method)
                .count()
        }
    }

    #[async_trait]
    impl RpcTransport for MockTransport {
        async fn request(&self, method: &str, params: Value) -> Result<Value, RpcError> {
            self.calls
                .lock()
                .unwrap()
                .push((method.to_owned(), params.clone()));
            (self.handler)(method, &params)
        }

        async fn batch(
            &self,
            requests: Vec<(String, Value)>,
        ) -> Result<Vec<Result<Value, RpcError>>, RpcError> {
            self.batches.lock().unwrap().push(requests.len());
            let mut outcomes = Vec::with_capacity(requests.len());
            for (method, params) in requests {
                outcomes.push(self.request(&method, params).await);
            }
            Ok(outcomes)
        }

        fn reconnect(&self) -> Arc<dyn RpcTransport> {
            Arc::new(Self {
                handler: self.handler.clone(),
                calls: Arc::new(Mutex::new(Vec::new())),
                batches: Arc::new(Mutex::new(Vec::new())),
            })
        }
    }
}
