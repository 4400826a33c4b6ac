//! Bus client: connection lifecycle, topic naming and message fan-out.
//!
//! # Connection sequence
//!
//! ```text
//! link Connected
//!   ├─ clear retained {self}/online
//!   ├─ resident cleanup: subscribe {self}/#, clear every retained leftover,
//!   │  stop after a quiet window, unsubscribe {self}/#
//!   ├─ publish retained {self}/online = true
//!   ├─ online -> true
//!   └─ replay recorded subscriptions in one batch
//! ```
//!
//! A lost link only flips `online` to false. The link reconnects by itself and
//! the sequence above runs again. Subscriptions are recorded regardless of the
//! connection state so they survive reconnects.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, error, info, warn};

use super::encoding;
use super::error::{BusError, BusResult};
use super::link::{Connector, Link, LinkEvent, LinkOptions};
use super::topic::{build_topic, BusMessage, Domain};
use crate::observable::{ObservableValue, Observer, Subject};

#[derive(Debug, Clone)]
pub struct ClientOptions {
    pub instance_name: String,
    /// Quiet window ending the resident state cleanup.
    pub cleanup_quiescence: Duration,
    /// Upper bound for the link to close during `terminate`.
    pub close_timeout: Duration,
}

impl ClientOptions {
    pub fn new(instance_name: &str) -> Self {
        Self {
            instance_name: instance_name.to_string(),
            cleanup_quiescence: Duration::from_secs(1),
            close_timeout: Duration::from_secs(5),
        }
    }
}

enum ClientCommand {
    Terminate { response_tx: oneshot::Sender<()> },
}

struct ClientInner {
    instance_name: String,
    link: Arc<dyn Link>,
    link_connected: AtomicBool,
    online: ObservableValue<bool>,
    messages: Subject<Arc<BusMessage>>,
    subscriptions: Mutex<HashSet<String>>,
    options: ClientOptions,
}

/// Cheap to clone; all clones drive the same connection.
#[derive(Clone)]
pub struct BusClient {
    inner: Arc<ClientInner>,
    command_tx: mpsc::UnboundedSender<ClientCommand>,
    task_handle: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl BusClient {
    pub fn new(options: ClientOptions, connector: &dyn Connector) -> BusResult<Self> {
        let link_options = LinkOptions {
            client_id: options.instance_name.clone(),
            will_topic: build_topic(&options.instance_name, Domain::Online, &[]),
        };
        let (link, events) = connector.connect(&link_options)?;

        let inner = Arc::new(ClientInner {
            instance_name: options.instance_name.clone(),
            link,
            link_connected: AtomicBool::new(false),
            online: ObservableValue::new(false),
            messages: Subject::new(),
            subscriptions: Mutex::new(HashSet::new()),
            options,
        });

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let worker = ClientWorker {
            inner: inner.clone(),
            events,
            commands: command_rx,
        };
        let handle = tokio::spawn(worker.run());

        info!("Bus client '{}' started", inner.instance_name);

        Ok(Self {
            inner,
            command_tx,
            task_handle: Arc::new(Mutex::new(Some(handle))),
        })
    }

    pub fn instance_name(&self) -> &str {
        &self.inner.instance_name
    }

    pub fn online(&self) -> bool {
        self.inner.online.get()
    }

    pub fn on_online_changed(&self) -> Observer<bool> {
        self.inner.online.subscribe(false)
    }

    pub fn online_value(&self) -> &ObservableValue<bool> {
        &self.inner.online
    }

    pub fn on_message(&self) -> Observer<Arc<BusMessage>> {
        self.inner.messages.subscribe()
    }

    pub fn build_topic(&self, domain: Domain, args: &[&str]) -> String {
        build_topic(&self.inner.instance_name, domain, args)
    }

    pub fn build_remote_topic(&self, instance_name: &str, domain: Domain, args: &[&str]) -> String {
        build_topic(instance_name, domain, args)
    }

    pub fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> BusResult<()> {
        self.inner.publish(topic, payload, retain)
    }

    pub fn clear_retain(&self, topic: &str) -> BusResult<()> {
        self.inner.publish(topic, Bytes::new(), true)
    }

    pub fn subscribe<S: AsRef<str>>(&self, topics: &[S]) -> BusResult<()> {
        let mut subscriptions = self.inner.subscriptions.lock();

        let added: Vec<String> = topics
            .iter()
            .map(|topic| topic.as_ref().to_string())
            .filter(|topic| subscriptions.insert(topic.clone()))
            .collect();

        if added.is_empty() || !self.inner.online.get() {
            return Ok(());
        }

        self.inner.link.subscribe(&added)
    }

    pub fn unsubscribe<S: AsRef<str>>(&self, topics: &[S]) -> BusResult<()> {
        let mut subscriptions = self.inner.subscriptions.lock();

        let removed: Vec<String> = topics
            .iter()
            .map(|topic| topic.as_ref().to_string())
            .filter(|topic| subscriptions.remove(topic))
            .collect();

        if removed.is_empty() || !self.inner.online.get() {
            return Ok(());
        }

        self.inner.link.unsubscribe(&removed)
    }

    /// Clears presence and resident state if online, then closes the link.
    pub async fn terminate(&self) {
        let (response_tx, response_rx) = oneshot::channel();
        if self
            .command_tx
            .send(ClientCommand::Terminate { response_tx })
            .is_ok()
        {
            let _ = response_rx.await;
        }

        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Bus client task failed: {}", e);
            }
        }

        info!("Bus client '{}' terminated", self.inner.instance_name);
    }
}

impl ClientInner {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> BusResult<()> {
        if !self.link_connected.load(Ordering::SeqCst) {
            return Err(BusError::Offline);
        }

        self.link.publish(topic, payload, retain).map_err(|e| {
            warn!("Could not publish on '{}': {}", topic, e);
            e
        })
    }

    fn self_topic(&self, domain: Domain) -> String {
        build_topic(&self.instance_name, domain, &[])
    }

    fn dispatch(&self, topic: String, payload: Bytes, retain: bool) {
        let message = BusMessage::parse(&topic, payload, retain);
        self.messages.notify(Arc::new(message));
    }
}

enum CleanupOutcome {
    Done,
    LinkLost,
    LinkClosed,
}

struct ClientWorker {
    inner: Arc<ClientInner>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    commands: mpsc::UnboundedReceiver<ClientCommand>,
}

impl ClientWorker {
    async fn run(mut self) {
        debug!("Bus client worker started");

        loop {
            tokio::select! {
                event = self.events.recv() => match event {
                    Some(LinkEvent::Connected) => self.on_connected().await,
                    Some(LinkEvent::Disconnected(reason)) => self.on_disconnected(&reason),
                    Some(LinkEvent::Message { topic, payload, retain }) => {
                        self.inner.dispatch(topic, payload, retain)
                    }
                    Some(LinkEvent::Closed) | None => {
                        warn!("Bus link closed unexpectedly");
                        self.set_offline();
                        break;
                    }
                },
                command = self.commands.recv() => match command {
                    Some(ClientCommand::Terminate { response_tx }) => {
                        self.shutdown().await;
                        let _ = response_tx.send(());
                        break;
                    }
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
            }
        }

        debug!("Bus client worker terminated");
    }

    async fn on_connected(&mut self) {
        info!("Bus link connected");
        self.inner.link_connected.store(true, Ordering::SeqCst);

        let online_topic = self.inner.self_topic(Domain::Online);
        if let Err(e) = self.inner.publish(&online_topic, Bytes::new(), true) {
            warn!("Could not clear presence: {}", e);
        }

        match self.resident_cleanup().await {
            CleanupOutcome::Done => {}
            CleanupOutcome::LinkLost => {
                self.on_disconnected("link lost during cleanup");
                return;
            }
            CleanupOutcome::LinkClosed => {
                self.set_offline();
                return;
            }
        }

        if let Err(e) = self
            .inner
            .publish(&online_topic, encoding::write_bool(true), true)
        {
            error!("Could not announce presence: {}", e);
        }

        let subscriptions = self.inner.subscriptions.lock();
        self.inner.online.update(true);

        let topics: Vec<String> = subscriptions.iter().cloned().collect();
        if !topics.is_empty() {
            if let Err(e) = self.inner.link.subscribe(&topics) {
                error!("Could not replay {} subscriptions: {}", topics.len(), e);
            }
        }
        drop(subscriptions);

        info!("Bus client '{}' online", self.inner.instance_name);
    }

    fn on_disconnected(&mut self, reason: &str) {
        warn!("Bus link disconnected: {}", reason);
        self.inner.link_connected.store(false, Ordering::SeqCst);
        self.set_offline();
    }

    fn set_offline(&self) {
        let _subscriptions = self.inner.subscriptions.lock();
        self.inner.online.update(false);
    }

    /// Removes every retained message left under our own prefix by a
    /// previous run.
    async fn resident_cleanup(&mut self) -> CleanupOutcome {
        let prefix = format!("{}/", self.inner.instance_name);
        let filter = format!("{}#", prefix);
        let quiescence = self.inner.options.cleanup_quiescence;

        if let Err(e) = self.inner.link.subscribe(std::slice::from_ref(&filter)) {
            warn!("Could not subscribe for resident cleanup: {}", e);
            return CleanupOutcome::Done;
        }

        let mut cleared = 0usize;
        let mut deadline = Instant::now() + quiescence;

        let outcome = loop {
            tokio::select! {
                _ = sleep_until(deadline) => break CleanupOutcome::Done,
                event = self.events.recv() => match event {
                    Some(LinkEvent::Message { topic, payload, retain }) => {
                        if retain && !payload.is_empty() && topic.starts_with(&prefix) {
                            debug!("Clearing resident '{}'", topic);
                            if let Err(e) = self.inner.publish(&topic, Bytes::new(), true) {
                                warn!("Could not clear resident '{}': {}", topic, e);
                            }
                            cleared += 1;
                            deadline = Instant::now() + quiescence;
                        } else {
                            self.inner.dispatch(topic, payload, retain);
                        }
                    }
                    Some(LinkEvent::Connected) => {}
                    Some(LinkEvent::Disconnected(_)) => break CleanupOutcome::LinkLost,
                    Some(LinkEvent::Closed) | None => break CleanupOutcome::LinkClosed,
                },
            }
        };

        if matches!(outcome, CleanupOutcome::Done) {
            if let Err(e) = self.inner.link.unsubscribe(std::slice::from_ref(&filter)) {
                warn!("Could not unsubscribe after resident cleanup: {}", e);
            }
            debug!("Resident cleanup done, {} topics cleared", cleared);
        }

        outcome
    }

    async fn shutdown(&mut self) {
        if self.inner.online.get() {
            let online_topic = self.inner.self_topic(Domain::Online);
            if let Err(e) = self.inner.publish(&online_topic, Bytes::new(), true) {
                warn!("Could not clear presence: {}", e);
            }

            if !matches!(self.resident_cleanup().await, CleanupOutcome::Done) {
                warn!("Resident cleanup interrupted during shutdown");
            }
        }

        self.set_offline();
        self.inner.link_connected.store(false, Ordering::SeqCst);

        if let Err(e) = self.inner.link.disconnect() {
            debug!("Link disconnect: {}", e);
            return;
        }

        let close_timeout = self.inner.options.close_timeout;
        let events = &mut self.events;
        let wait_closed = async {
            while let Some(event) = events.recv().await {
                if event == LinkEvent::Closed {
                    break;
                }
            }
        };

        if timeout(close_timeout, wait_closed).await.is_err() {
            warn!("Link did not close within {:?}", close_timeout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::link::MemoryBroker;

    fn options(name: &str) -> ClientOptions {
        ClientOptions {
            cleanup_quiescence: Duration::from_millis(50),
            ..ClientOptions::new(name)
        }
    }

    async fn wait_online(client: &BusClient) {
        let mut observer = client.on_online_changed();
        if client.online() {
            return;
        }
        while let Some(online) = observer.recv().await {
            if online {
                return;
            }
        }
    }

    #[tokio::test]
    async fn announces_presence_when_connected() {
        let broker = MemoryBroker::new();
        let client = BusClient::new(options("alpha"), &broker).unwrap();

        wait_online(&client).await;

        assert_eq!(broker.retained("alpha/online").as_deref(), Some(&[1u8][..]));
        client.terminate().await;
        assert!(broker.retained("alpha/online").is_none());
    }

    #[tokio::test]
    async fn offline_subscriptions_are_replayed() {
        let broker = MemoryBroker::new();
        broker.retain("beta/metadata/x", Bytes::from_static(b"1"));

        let client = BusClient::new(options("alpha"), &broker).unwrap();
        let mut messages = client.on_message();
        client.subscribe(&["beta/metadata/#"]).unwrap();

        let message = messages.recv().await.unwrap();
        assert_eq!(message.instance_name, "beta");
        assert_eq!(message.path, "x");
        assert!(message.retained);

        client.terminate().await;
    }

    #[tokio::test]
    async fn topic_helpers() {
        let broker = MemoryBroker::new();
        let client = BusClient::new(options("alpha"), &broker).unwrap();

        assert_eq!(client.instance_name(), "alpha");
        assert_eq!(
            client.build_topic(Domain::Metadata, &["plugins", "a.b"]),
            "alpha/metadata/plugins/a.b"
        );
        assert_eq!(
            client.build_remote_topic("beta", Domain::Rpc, &["services", "x"]),
            "beta/rpc/services/x"
        );

        client.terminate().await;
    }
}
