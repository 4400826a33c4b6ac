use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::client::BusClient;
use super::encoding;
use super::topic::{BusMessage, Domain};
use crate::observable::{Observer, Subject};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PresenceChange {
    pub instance_name: String,
    pub online: bool,
}

struct PresenceInner {
    instances: Mutex<HashSet<String>>,
    changes: Subject<PresenceChange>,
}

impl PresenceInner {
    fn set(&self, instance_name: &str, online: bool) {
        let mut instances = self.instances.lock();
        let changed = if online {
            instances.insert(instance_name.to_string())
        } else {
            instances.remove(instance_name)
        };

        if changed {
            debug!(
                "Instance '{}' is now {}",
                instance_name,
                if online { "online" } else { "offline" }
            );
            self.changes.notify(PresenceChange {
                instance_name: instance_name.to_string(),
                online,
            });
        }
    }

    fn clear(&self) {
        let mut instances = self.instances.lock();
        for instance_name in instances.drain() {
            self.changes.notify(PresenceChange {
                instance_name,
                online: false,
            });
        }
    }
}

/// Set of remote instances currently announcing themselves on `+/online`.
pub struct Presence {
    client: BusClient,
    inner: Arc<PresenceInner>,
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
    tracking: bool,
}

impl Presence {
    const FILTER: &'static str = "+/online";

    pub fn new(client: BusClient, tracking: bool) -> Self {
        let inner = Arc::new(PresenceInner {
            instances: Mutex::new(HashSet::new()),
            changes: Subject::new(),
        });
        let cancel = CancellationToken::new();

        let task_handle = if tracking {
            let online_rx = client.on_online_changed();
            let message_rx = client.on_message();

            if let Err(e) = client.subscribe(&[Self::FILTER]) {
                error!("Could not subscribe presence topics: {}", e);
            }

            Some(tokio::spawn(presence_worker(
                client.instance_name().to_string(),
                inner.clone(),
                online_rx,
                message_rx,
                cancel.clone(),
            )))
        } else {
            info!("Presence tracking disabled");
            None
        };

        Self {
            client,
            inner,
            cancel,
            task_handle: Mutex::new(task_handle),
            tracking,
        }
    }

    pub fn tracking(&self) -> bool {
        self.tracking
    }

    pub fn is_online(&self, instance_name: &str) -> bool {
        self.inner.instances.lock().contains(instance_name)
    }

    pub fn online_instances(&self) -> Vec<String> {
        let mut instances: Vec<String> = self.inner.instances.lock().iter().cloned().collect();
        instances.sort();
        instances
    }

    pub fn on_change(&self) -> Observer<PresenceChange> {
        self.inner.changes.subscribe()
    }

    /// Like [`Presence::on_change`], but first replays an `online` change for
    /// every instance already known.
    pub fn on_change_with_current(&self) -> Observer<PresenceChange> {
        let instances = self.inner.instances.lock();
        let current = instances.iter().map(|instance_name| PresenceChange {
            instance_name: instance_name.clone(),
            online: true,
        });
        self.inner.changes.subscribe_with(current)
    }

    pub async fn terminate(&self) {
        if !self.tracking {
            return;
        }

        self.cancel.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Presence task failed: {}", e);
            }
        }

        if let Err(e) = self.client.unsubscribe(&[Self::FILTER]) {
            warn!("Could not unsubscribe presence topics: {}", e);
        }
        self.inner.clear();
    }
}

async fn presence_worker(
    own_instance: String,
    inner: Arc<PresenceInner>,
    mut online_rx: Observer<bool>,
    mut message_rx: Observer<Arc<BusMessage>>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            online = online_rx.recv() => match online {
                Some(false) => inner.clear(),
                Some(true) => {}
                None => break,
            },
            message = message_rx.recv() => match message {
                Some(message) => {
                    if !message.is_domain(Domain::Online)
                        || !message.path.is_empty()
                        || message.instance_name == own_instance
                    {
                        continue;
                    }

                    let online = !message.payload.is_empty()
                        && encoding::read_bool(&message.payload).unwrap_or(false);
                    inner.set(&message.instance_name, online);
                }
                None => break,
            },
        }
    }

    debug!("Presence worker terminated");
}
