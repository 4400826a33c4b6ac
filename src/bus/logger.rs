//! Forwards local log records to `{instance}/logger`.
//!
//! [`BusLogLayer`] is a `tracing-subscriber` layer capturing every event into
//! a bounded [`LogQueue`] (oldest records are dropped when full). The
//! [`BusLogger`] writer drains the queue and publishes each record as JSON
//! once the client is online.

use bytes::Bytes;
use chrono::{DateTime, SecondsFormat, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::VecDeque;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::field::{Field, Visit};
use tracing::{error, Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use super::client::BusClient;
use super::topic::Domain;

pub const QUEUE_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub name: String,
    pub level: Level,
    pub msg: String,
    pub err: Option<String>,
    pub time: DateTime<Utc>,
}

fn level_code(level: Level) -> u8 {
    match level {
        Level::TRACE => 10,
        Level::DEBUG => 20,
        Level::INFO => 30,
        Level::WARN => 40,
        _ => 50,
    }
}

struct QueueInner {
    records: Mutex<VecDeque<LogRecord>>,
    notify: Notify,
    capacity: usize,
}

/// Bounded record queue shared by the layer and the writer.
#[derive(Clone)]
pub struct LogQueue {
    inner: Arc<QueueInner>,
}

impl Default for LogQueue {
    fn default() -> Self {
        Self::with_capacity(QUEUE_CAPACITY)
    }
}

impl LogQueue {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(QueueInner {
                records: Mutex::new(VecDeque::with_capacity(capacity)),
                notify: Notify::new(),
                capacity,
            }),
        }
    }

    pub fn push(&self, record: LogRecord) {
        {
            let mut records = self.inner.records.lock();
            if records.len() >= self.inner.capacity {
                records.pop_front();
            }
            records.push_back(record);
        }
        self.inner.notify.notify_one();
    }

    pub fn pop(&self) -> Option<LogRecord> {
        self.inner.records.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.inner.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn next(&self) -> LogRecord {
        loop {
            if let Some(record) = self.pop() {
                return record;
            }
            self.inner.notify.notified().await;
        }
    }
}

#[derive(Default)]
struct RecordVisitor {
    message: String,
    error: Option<String>,
    fields: String,
}

impl Visit for RecordVisitor {
    fn record_debug(&mut self, field: &Field, value: &dyn fmt::Debug) {
        match field.name() {
            "message" => {
                let _ = write!(self.message, "{:?}", value);
            }
            "error" | "err" => self.error = Some(format!("{:?}", value)),
            name => {
                let _ = write!(self.fields, " {}={:?}", name, value);
            }
        }
    }

    fn record_str(&mut self, field: &Field, value: &str) {
        match field.name() {
            "message" => self.message.push_str(value),
            "error" | "err" => self.error = Some(value.to_string()),
            name => {
                let _ = write!(self.fields, " {}={}", name, value);
            }
        }
    }
}

pub struct BusLogLayer {
    queue: LogQueue,
}

impl BusLogLayer {
    pub fn new(queue: LogQueue) -> Self {
        Self { queue }
    }
}

impl<S: Subscriber> Layer<S> for BusLogLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        let metadata = event.metadata();

        let mut visitor = RecordVisitor::default();
        event.record(&mut visitor);

        let mut msg = visitor.message;
        msg.push_str(&visitor.fields);

        self.queue.push(LogRecord {
            name: metadata.target().to_string(),
            level: *metadata.level(),
            msg,
            err: visitor.error,
            time: Utc::now(),
        });
    }
}

/// Process identity stamped on every published record.
#[derive(Debug, Clone)]
pub struct LoggerIdentity {
    pub instance_name: String,
    pub hostname: String,
    pub pid: u32,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WireRecord<'a> {
    name: &'a str,
    instance_name: &'a str,
    hostname: &'a str,
    pid: u32,
    level: u8,
    msg: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    err: Option<&'a str>,
    time: String,
    v: u8,
}

pub fn serialize_record(identity: &LoggerIdentity, record: &LogRecord) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec(&WireRecord {
        name: &record.name,
        instance_name: &identity.instance_name,
        hostname: &identity.hostname,
        pid: identity.pid,
        level: level_code(record.level),
        msg: &record.msg,
        err: record.err.as_deref(),
        time: record.time.to_rfc3339_opts(SecondsFormat::Millis, true),
        v: 0,
    })
}

pub struct BusLogger {
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BusLogger {
    pub fn new(client: BusClient, queue: LogQueue, identity: LoggerIdentity) -> Self {
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(writer(client, queue, identity, cancel.clone()));

        Self {
            cancel,
            task_handle: Mutex::new(Some(handle)),
        }
    }

    pub async fn terminate(&self) {
        self.cancel.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Bus logger task failed: {}", e);
            }
        }
    }
}

async fn wait_online(client: &BusClient, cancel: &CancellationToken) -> bool {
    let mut online_rx = client.on_online_changed();
    if client.online() {
        return true;
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return false,
            online = online_rx.recv() => match online {
                Some(true) => return true,
                Some(false) => {}
                None => return false,
            },
        }
    }
}

async fn writer(client: BusClient, queue: LogQueue, identity: LoggerIdentity, cancel: CancellationToken) {
    let topic = client.build_topic(Domain::Logger, &[]);

    loop {
        let record = tokio::select! {
            _ = cancel.cancelled() => break,
            record = queue.next() => record,
        };

        // no logging in here: it would feed the queue
        let payload = match serialize_record(&identity, &record) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                eprintln!("Could not serialize log record: {}", e);
                continue;
            }
        };

        if !wait_online(&client, &cancel).await {
            break;
        }

        if let Err(e) = client.publish(&topic, payload, false) {
            eprintln!("Could not publish log record: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(msg: &str) -> LogRecord {
        LogRecord {
            name: "homebus::test".to_string(),
            level: Level::WARN,
            msg: msg.to_string(),
            err: None,
            time: Utc::now(),
        }
    }

    #[test]
    fn queue_drops_oldest() {
        let queue = LogQueue::with_capacity(2);
        queue.push(record("a"));
        queue.push(record("b"));
        queue.push(record("c"));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().msg, "b");
        assert_eq!(queue.pop().unwrap().msg, "c");
        assert!(queue.is_empty());
    }

    #[test]
    fn wire_shape() {
        let identity = LoggerIdentity {
            instance_name: "host-core".to_string(),
            hostname: "host".to_string(),
            pid: 42,
        };
        let mut rec = record("hello");
        rec.err = Some("boom".to_string());

        let json: serde_json::Value =
            serde_json::from_slice(&serialize_record(&identity, &rec).unwrap()).unwrap();

        assert_eq!(json["name"], "homebus::test");
        assert_eq!(json["instanceName"], "host-core");
        assert_eq!(json["hostname"], "host");
        assert_eq!(json["pid"], 42);
        assert_eq!(json["level"], 40);
        assert_eq!(json["msg"], "hello");
        assert_eq!(json["err"], "boom");
        assert_eq!(json["v"], 0);
        assert!(DateTime::parse_from_rfc3339(json["time"].as_str().unwrap()).is_ok());
    }

    #[test]
    fn layer_captures_events() {
        use tracing_subscriber::layer::SubscriberExt;

        let queue = LogQueue::default();
        let subscriber = tracing_subscriber::registry().with(BusLogLayer::new(queue.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::info!(component = "lamp", "switched {}", "on");
        });

        let captured = queue.pop().unwrap();
        assert_eq!(captured.level, Level::INFO);
        assert_eq!(captured.msg, "switched on component=lamp");
    }
}
