//! Per-instance replicated key/value store on `{instance}/metadata/{path}`.
//!
//! Writers publish retained JSON and clear with an empty retained payload.
//! Readers open a [`MetadataView`] on a remote instance which mirrors its
//! entries into a local snapshot and reports every change.

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::client::BusClient;
use super::error::MetadataError;
use super::topic::{BusMessage, Domain};
use crate::observable::{Observer, Subject};

#[derive(Debug, Clone, PartialEq)]
pub enum MetadataChange {
    Set {
        path: String,
        value: serde_json::Value,
    },
    Clear {
        path: String,
    },
}

impl MetadataChange {
    pub fn path(&self) -> &str {
        match self {
            MetadataChange::Set { path, .. } | MetadataChange::Clear { path } => path,
        }
    }
}

pub struct MetadataChannel {
    client: BusClient,
    views: Arc<Mutex<HashSet<String>>>,
}

impl MetadataChannel {
    pub fn new(client: BusClient) -> Self {
        Self {
            client,
            views: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn set<T: Serialize + ?Sized>(&self, path: &str, value: &T) -> Result<(), MetadataError> {
        let topic = self.topic(path)?;
        let payload = serde_json::to_vec(value)?;
        self.client.publish(&topic, Bytes::from(payload), true)?;
        Ok(())
    }

    pub fn clear(&self, path: &str) -> Result<(), MetadataError> {
        let topic = self.topic(path)?;
        self.client.clear_retain(&topic)?;
        Ok(())
    }

    fn topic(&self, path: &str) -> Result<String, MetadataError> {
        if path.is_empty() || path.contains(['+', '#']) {
            return Err(MetadataError::InvalidPath(path.to_string()));
        }
        Ok(self.client.build_topic(Domain::Metadata, &[path]))
    }

    pub fn create_view(&self, instance_name: &str) -> Result<MetadataView, MetadataError> {
        if !self.views.lock().insert(instance_name.to_string()) {
            return Err(MetadataError::ViewExists(instance_name.to_string()));
        }

        let inner = Arc::new(ViewInner {
            instance_name: instance_name.to_string(),
            values: Mutex::new(HashMap::new()),
            changes: Subject::new(),
        });
        let cancel = CancellationToken::new();

        let message_rx = self.client.on_message();
        let handle = tokio::spawn(view_worker(inner.clone(), message_rx, cancel.clone()));

        let filter = self
            .client
            .build_remote_topic(instance_name, Domain::Metadata, &["#"]);
        if let Err(e) = self.client.subscribe(&[&filter]) {
            warn!("Could not subscribe metadata of '{}': {}", instance_name, e);
        }

        debug!("Opened metadata view on '{}'", instance_name);

        Ok(MetadataView {
            inner,
            client: self.client.clone(),
            views: self.views.clone(),
            filter,
            cancel,
            task_handle: Some(handle),
        })
    }

    pub async fn close_view(&self, view: MetadataView) {
        view.close().await;
    }
}

struct ViewInner {
    instance_name: String,
    values: Mutex<HashMap<String, serde_json::Value>>,
    changes: Subject<MetadataChange>,
}

impl ViewInner {
    fn apply(&self, path: &str, payload: &[u8]) {
        let mut values = self.values.lock();

        if payload.is_empty() {
            if values.remove(path).is_some() {
                self.changes.notify(MetadataChange::Clear {
                    path: path.to_string(),
                });
            }
            return;
        }

        let value: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(value) => value,
            Err(e) => {
                warn!(
                    "Dropping invalid metadata '{}' of '{}': {}",
                    path, self.instance_name, e
                );
                return;
            }
        };

        if values.get(path) == Some(&value) {
            return;
        }

        values.insert(path.to_string(), value.clone());
        self.changes.notify(MetadataChange::Set {
            path: path.to_string(),
            value,
        });
    }
}

/// Live mirror of a remote instance's metadata.
pub struct MetadataView {
    inner: Arc<ViewInner>,
    client: BusClient,
    views: Arc<Mutex<HashSet<String>>>,
    filter: String,
    cancel: CancellationToken,
    task_handle: Option<JoinHandle<()>>,
}

impl MetadataView {
    pub fn instance_name(&self) -> &str {
        &self.inner.instance_name
    }

    pub fn get(&self, path: &str) -> Option<serde_json::Value> {
        self.inner.values.lock().get(path).cloned()
    }

    pub fn values(&self) -> HashMap<String, serde_json::Value> {
        self.inner.values.lock().clone()
    }

    pub fn on_change(&self) -> Observer<MetadataChange> {
        self.inner.changes.subscribe()
    }

    /// Observer that first receives a `Set` for every entry already known.
    pub fn on_change_with_current(&self) -> Observer<MetadataChange> {
        let values = self.inner.values.lock();
        let current = values.iter().map(|(path, value)| MetadataChange::Set {
            path: path.clone(),
            value: value.clone(),
        });
        self.inner.changes.subscribe_with(current)
    }

    pub async fn close(mut self) {
        if let Err(e) = self.client.unsubscribe(&[&self.filter]) {
            warn!("Could not unsubscribe '{}': {}", self.filter, e);
        }

        self.cancel.cancel();
        if let Some(handle) = self.task_handle.take() {
            if let Err(e) = handle.await {
                error!("Metadata view task failed: {}", e);
            }
        }

        self.views.lock().remove(&self.inner.instance_name);
        debug!("Closed metadata view on '{}'", self.inner.instance_name);
    }
}

async fn view_worker(
    inner: Arc<ViewInner>,
    mut message_rx: Observer<Arc<BusMessage>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            message = message_rx.recv() => match message {
                Some(message) => {
                    if message.instance_name == inner.instance_name
                        && message.is_domain(Domain::Metadata)
                        && !message.path.is_empty()
                    {
                        inner.apply(&message.path, &message.payload);
                    }
                }
                None => break,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn view() -> ViewInner {
        ViewInner {
            instance_name: "remote".to_string(),
            values: Mutex::new(HashMap::new()),
            changes: Subject::new(),
        }
    }

    #[test]
    fn set_then_clear() {
        let view = view();
        let mut changes = view.changes.subscribe();

        view.apply("plugins/a.b", br#"{"id":"a.b"}"#);
        view.apply("plugins/a.b", br#"{"id":"a.b"}"#);
        view.apply("plugins/a.b", b"");
        view.apply("plugins/a.b", b"");

        assert_eq!(
            changes.try_recv(),
            Some(MetadataChange::Set {
                path: "plugins/a.b".to_string(),
                value: serde_json::json!({"id": "a.b"}),
            })
        );
        assert_eq!(
            changes.try_recv(),
            Some(MetadataChange::Clear {
                path: "plugins/a.b".to_string()
            })
        );
        assert_eq!(changes.try_recv(), None);
    }

    #[test]
    fn invalid_json_is_dropped() {
        let view = view();
        view.apply("components/x", b"{not json");
        assert!(view.values.lock().is_empty());
    }
}
