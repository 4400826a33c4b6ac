//! Request/reply on top of plain publish/subscribe.
//!
//! # Protocol
//!
//! ```text
//! caller                                         callee
//!   │ subscribe {self}/rpc/replies/{token}
//!   │ {"input", "replyTopic"}  ─────────────▶  {target}/rpc/services/{address}
//!   │                                             handler runs in its own task
//!   │ {"output"} | {"error"}   ◀─────────────  replyTopic
//!   │ unsubscribe reply topic
//! ```
//!
//! A call ends with the first of: reply received, connection lost, timeout.

use bytes::Bytes;
use parking_lot::Mutex;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, warn};

use super::client::BusClient;
use super::error::RpcError;
use super::topic::{BusMessage, Domain};
use crate::observable::Observer;

const TOKEN_LEN: usize = 16;
const SERVICES: &str = "services";
const REPLIES: &str = "replies";

type ServiceFuture = Pin<Box<dyn Future<Output = color_eyre::Result<serde_json::Value>> + Send>>;
type ServiceHandler = Arc<dyn Fn(serde_json::Value) -> ServiceFuture + Send + Sync>;

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Request {
    input: serde_json::Value,
    reply_topic: String,
}

#[derive(Debug, Serialize, Deserialize)]
struct RemoteError {
    message: String,
    stacktrace: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct Reply {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    output: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RemoteError>,
}

struct RpcInner {
    client: BusClient,
    pending: Mutex<HashMap<String, oneshot::Sender<Bytes>>>,
    services: Mutex<HashMap<String, ServiceHandler>>,
    handlers: TaskTracker,
    default_timeout: Duration,
}

pub struct Rpc {
    inner: Arc<RpcInner>,
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Rpc {
    pub fn new(client: BusClient, default_timeout: Duration) -> Self {
        let inner = Arc::new(RpcInner {
            client,
            pending: Mutex::new(HashMap::new()),
            services: Mutex::new(HashMap::new()),
            handlers: TaskTracker::new(),
            default_timeout,
        });
        let cancel = CancellationToken::new();

        let message_rx = inner.client.on_message();
        let handle = tokio::spawn(dispatch_worker(inner.clone(), message_rx, cancel.clone()));

        Self {
            inner,
            cancel,
            task_handle: Mutex::new(Some(handle)),
        }
    }

    pub fn default_timeout(&self) -> Duration {
        self.inner.default_timeout
    }

    /// Exposes `handler` at `{self}/rpc/services/{address}`.
    pub fn serve<I, O, F, Fut>(&self, address: &str, handler: F) -> Result<(), RpcError>
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = color_eyre::Result<O>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        let erased: ServiceHandler = Arc::new(move |input: serde_json::Value| {
            Box::pin(invoke(handler.clone(), input)) as ServiceFuture
        });

        {
            let mut services = self.inner.services.lock();
            if services.contains_key(address) {
                return Err(RpcError::DuplicateService(address.to_string()));
            }
            services.insert(address.to_string(), erased);
        }

        let topic = self.inner.client.build_topic(Domain::Rpc, &[SERVICES, address]);
        self.inner.client.subscribe(&[topic])?;

        debug!("Serving rpc '{}'", address);
        Ok(())
    }

    pub fn unserve(&self, address: &str) -> Result<(), RpcError> {
        if self.inner.services.lock().remove(address).is_none() {
            return Err(RpcError::UnknownService(address.to_string()));
        }

        let topic = self.inner.client.build_topic(Domain::Rpc, &[SERVICES, address]);
        self.inner.client.unsubscribe(&[topic])?;

        debug!("Stopped serving rpc '{}'", address);
        Ok(())
    }

    /// Calls `address` on `target_instance` with the default timeout.
    pub async fn call<I, O>(&self, target_instance: &str, address: &str, input: I) -> Result<O, RpcError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        self.call_with_timeout(target_instance, address, input, self.inner.default_timeout)
            .await
    }

    pub async fn call_with_timeout<I, O>(
        &self,
        target_instance: &str,
        address: &str,
        input: I,
        timeout: Duration,
    ) -> Result<O, RpcError>
    where
        I: Serialize,
        O: DeserializeOwned,
    {
        let client = &self.inner.client;

        let mut online_rx = client.on_online_changed();
        if !client.online() {
            return Err(RpcError::ConnectionLost);
        }

        let token = generate_token();
        let reply_topic = client.build_topic(Domain::Rpc, &[REPLIES, &token]);
        let request = Request {
            input: serde_json::to_value(input)?,
            reply_topic: reply_topic.clone(),
        };
        let payload = Bytes::from(serde_json::to_vec(&request)?);

        let (reply_tx, reply_rx) = oneshot::channel();
        self.inner.pending.lock().insert(token.clone(), reply_tx);

        let result = self
            .exchange(target_instance, address, &reply_topic, payload, reply_rx, &mut online_rx, timeout)
            .await;

        self.inner.pending.lock().remove(&token);
        if let Err(e) = client.unsubscribe(&[&reply_topic]) {
            debug!("Could not unsubscribe '{}': {}", reply_topic, e);
        }

        let reply = result?;
        decode_reply(target_instance, address, &reply)
    }

    #[allow(clippy::too_many_arguments)]
    async fn exchange(
        &self,
        target_instance: &str,
        address: &str,
        reply_topic: &str,
        payload: Bytes,
        reply_rx: oneshot::Receiver<Bytes>,
        online_rx: &mut Observer<bool>,
        timeout: Duration,
    ) -> Result<Bytes, RpcError> {
        let client = &self.inner.client;
        client.subscribe(&[reply_topic])?;

        let service_topic = client.build_remote_topic(target_instance, Domain::Rpc, &[SERVICES, address]);
        client.publish(&service_topic, payload, false)?;

        let lost = async {
            loop {
                match online_rx.recv().await {
                    Some(false) | None => break,
                    Some(true) => {}
                }
            }
        };

        tokio::select! {
            reply = reply_rx => reply.map_err(|_| RpcError::ConnectionLost),
            _ = lost => Err(RpcError::ConnectionLost),
            _ = tokio::time::sleep(timeout) => Err(RpcError::Timeout(timeout.as_millis() as u64)),
        }
    }

    pub async fn terminate(&self) {
        let addresses: Vec<String> = self.inner.services.lock().keys().cloned().collect();
        for address in addresses {
            if let Err(e) = self.unserve(&address) {
                warn!("Could not unserve '{}': {}", address, e);
            }
        }

        self.cancel.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Rpc dispatch task failed: {}", e);
            }
        }

        // requests already dispatched still get their reply
        self.inner.handlers.close();
        self.inner.handlers.wait().await;

        // wake up pending callers
        self.inner.pending.lock().clear();
    }
}

async fn invoke<I, O, F, Fut>(handler: Arc<F>, input: serde_json::Value) -> color_eyre::Result<serde_json::Value>
where
    I: DeserializeOwned,
    O: Serialize,
    F: Fn(I) -> Fut,
    Fut: Future<Output = color_eyre::Result<O>>,
{
    let input: I = serde_json::from_value(input)
        .map_err(|e| color_eyre::eyre::eyre!("Invalid input: {}", e))?;
    let output = handler(input).await?;
    Ok(serde_json::to_value(output)?)
}

fn generate_token() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(TOKEN_LEN)
        .map(|c| (c as char).to_ascii_lowercase())
        .collect()
}

fn decode_reply<O: DeserializeOwned>(
    target_instance: &str,
    address: &str,
    payload: &[u8],
) -> Result<O, RpcError> {
    let reply: Reply =
        serde_json::from_slice(payload).map_err(|e| RpcError::MalformedReply(e.to_string()))?;

    if let Some(error) = reply.error {
        warn!(
            "Rpc '{}' on '{}' failed: {}\n{}",
            address, target_instance, error.message, error.stacktrace
        );
        return Err(RpcError::Remote(error.message));
    }

    let output = reply.output.unwrap_or(serde_json::Value::Null);
    serde_json::from_value(output).map_err(|e| RpcError::MalformedReply(e.to_string()))
}

async fn dispatch_worker(
    inner: Arc<RpcInner>,
    mut message_rx: Observer<Arc<BusMessage>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = message_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if message.instance_name != inner.client.instance_name() || !message.is_domain(Domain::Rpc) {
            continue;
        }

        if let Some(token) = message.path.strip_prefix("replies/") {
            let pending = inner.pending.lock().remove(token);
            match pending {
                Some(reply_tx) => {
                    let _ = reply_tx.send(message.payload.clone());
                }
                None => debug!("Dropping reply for unknown call '{}'", token),
            }
        } else if let Some(address) = message.path.strip_prefix("services/") {
            let handler = inner.services.lock().get(address).cloned();
            match handler {
                Some(handler) => {
                    inner.handlers.spawn(handle_request(
                        inner.client.clone(),
                        address.to_string(),
                        handler,
                        message.payload.clone(),
                    ));
                }
                None => debug!("Dropping request for unknown service '{}'", address),
            }
        }
    }

    debug!("Rpc dispatch worker terminated");
}

async fn handle_request(client: BusClient, address: String, handler: ServiceHandler, payload: Bytes) {
    let request: Request = match serde_json::from_slice(&payload) {
        Ok(request) => request,
        Err(e) => {
            warn!("Malformed request on '{}': {}", address, e);
            return;
        }
    };

    let reply = match handler(request.input).await {
        Ok(output) => Reply {
            output: Some(output),
            error: None,
        },
        Err(report) => {
            debug!("Service '{}' failed: {}", address, report);
            Reply {
                output: None,
                error: Some(RemoteError {
                    message: report.to_string(),
                    stacktrace: format!("{:?}", report),
                }),
            }
        }
    };

    let payload = match serde_json::to_vec(&reply) {
        Ok(payload) => Bytes::from(payload),
        Err(e) => {
            error!("Could not serialize reply of '{}': {}", address, e);
            return;
        }
    };

    if let Err(e) = client.publish(&request.reply_topic, payload, false) {
        warn!("Could not send reply of '{}': {}", address, e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tokens_are_lowercase_alphanumeric() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.chars().all(|c| c.is_ascii_lowercase() || c.is_ascii_digit()));
        assert_ne!(generate_token(), token);
    }

    #[test]
    fn error_reply_keeps_message_only() {
        let payload = br#"{"error":{"message":"boom","stacktrace":"at somewhere"}}"#;
        let result: Result<u32, RpcError> = decode_reply("remote", "svc", payload);
        match result {
            Err(RpcError::Remote(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn output_reply_is_decoded() {
        let value: u32 = decode_reply("remote", "svc", br#"{"output":42}"#).unwrap();
        assert_eq!(value, 42);

        let unit: () = decode_reply("remote", "svc", br#"{"output":null}"#).unwrap();
        assert_eq!(unit, ());

        assert!(matches!(
            decode_reply::<u32>("remote", "svc", b"nope"),
            Err(RpcError::MalformedReply(_))
        ));
    }
}
