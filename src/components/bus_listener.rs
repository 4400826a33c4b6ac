//! Feeds the registry with the plugins and components of remote instances.
//!
//! ```text
//! Presence ──online──► InstanceWorker ── MetadataView(instance) ──► Registry
//!          ──offline─► (worker stops, removes everything it added)
//! ```
//!
//! Components announced before their plugin wait in a pending list keyed by
//! plugin id. Components whose id is already owned by another instance are
//! held back and registered once that owner lets go of the id.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::registry::{ComponentChange, Registry, RegistryAction, RegistryError};
use crate::bus::components::RemoteComponentLink;
use crate::bus::metadata::{MetadataChange, MetadataView};
use crate::bus::presence::PresenceChange;
use crate::bus::{BusError, BusResult, Transport};
use crate::metadata::{ComponentDescriptor, PluginDescriptor};
use crate::observable::Observer;

pub struct BusListener {
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BusListener {
    pub fn new(transport: Arc<Transport>, registry: Arc<Registry>) -> BusResult<Self> {
        if !transport.presence().tracking() {
            return Err(BusError::PresenceDisabled);
        }

        let presence_rx = transport.presence().on_change_with_current();
        let cancel = CancellationToken::new();
        let handle = tokio::spawn(listener_worker(
            transport,
            registry,
            presence_rx,
            cancel.clone(),
        ));

        Ok(Self {
            cancel,
            task_handle: Mutex::new(Some(handle)),
        })
    }

    /// Stops listening and removes every remote entry from the registry.
    pub async fn terminate(&self) {
        self.cancel.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Bus listener task failed: {}", e);
            }
        }
    }
}

struct InstanceHandle {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl InstanceHandle {
    async fn stop(self, instance_name: &str) {
        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Listener task for '{}' failed: {}", instance_name, e);
        }
    }
}

async fn listener_worker(
    transport: Arc<Transport>,
    registry: Arc<Registry>,
    mut presence_rx: Observer<PresenceChange>,
    cancel: CancellationToken,
) {
    let mut instances: HashMap<String, InstanceHandle> = HashMap::new();

    loop {
        let change = tokio::select! {
            _ = cancel.cancelled() => break,
            change = presence_rx.recv() => match change {
                Some(change) => change,
                None => break,
            },
        };

        if change.online {
            if instances.contains_key(&change.instance_name) {
                continue;
            }

            let view = match transport.metadata().create_view(&change.instance_name) {
                Ok(view) => view,
                Err(e) => {
                    error!("Could not listen to '{}': {}", change.instance_name, e);
                    continue;
                }
            };

            let instance_cancel = CancellationToken::new();
            let worker = InstanceWorker {
                instance_name: change.instance_name.clone(),
                transport: transport.clone(),
                registry: registry.clone(),
                links: HashMap::new(),
                pending: HashMap::new(),
                contested: HashMap::new(),
            };
            let handle = tokio::spawn(worker.run(view, instance_cancel.clone()));

            instances.insert(
                change.instance_name,
                InstanceHandle {
                    cancel: instance_cancel,
                    handle,
                },
            );
        } else if let Some(instance) = instances.remove(&change.instance_name) {
            instance.stop(&change.instance_name).await;
        }
    }

    for (instance_name, instance) in instances.drain() {
        instance.stop(&instance_name).await;
    }

    debug!("Bus listener terminated");
}

/// Splits `plugins/{id}` or `components/{id}`.
fn split_path(path: &str) -> (&str, &str) {
    path.split_once('/').unwrap_or((path, ""))
}

struct InstanceWorker {
    instance_name: String,
    transport: Arc<Transport>,
    registry: Arc<Registry>,
    links: HashMap<String, RemoteComponentLink>,
    pending: HashMap<String, Vec<ComponentDescriptor>>,
    contested: HashMap<String, (ComponentDescriptor, Arc<PluginDescriptor>)>,
}

impl InstanceWorker {
    async fn run(mut self, view: MetadataView, cancel: CancellationToken) {
        info!("Listening to instance '{}'", self.instance_name);
        let mut registry_rx = self.registry.on_component_change();
        let mut change_rx = view.on_change_with_current();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = change_rx.recv() => match change {
                    Some(change) => self.on_view_change(change).await,
                    None => break,
                },
                Some(change) = registry_rx.recv() => self.on_registry_change(change).await,
            }
        }

        drop(change_rx);
        drop(registry_rx);
        self.clear_all().await;
        view.close().await;
        info!("Stopped listening to instance '{}'", self.instance_name);
    }

    async fn on_view_change(&mut self, change: MetadataChange) {
        match change {
            MetadataChange::Set { path, value } => match split_path(&path) {
                ("plugins", id) => self.set_plugin(id, value).await,
                ("components", id) => self.set_component(id, value).await,
                _ => {}
            },
            MetadataChange::Clear { path } => match split_path(&path) {
                ("plugins", id) => self.clear_plugin(id),
                ("components", id) => self.clear_component(id).await,
                _ => {}
            },
        }
    }

    async fn on_registry_change(&mut self, change: ComponentChange) {
        if change.action != RegistryAction::Remove || change.instance_name == self.instance_name {
            return;
        }

        if let Some((descriptor, plugin)) = self.contested.remove(change.payload.id()) {
            debug!(
                "Component id '{}' released by '{}', retrying for '{}'",
                descriptor.id, change.instance_name, self.instance_name
            );
            self.create_component(descriptor, plugin).await;
        }
    }

    async fn set_plugin(&mut self, id: &str, value: serde_json::Value) {
        if self.registry.has_plugin(&self.instance_name, id) {
            return;
        }

        let plugin: PluginDescriptor = match serde_json::from_value(value) {
            Ok(plugin) => plugin,
            Err(e) => {
                warn!("Invalid plugin '{}' on '{}': {}", id, self.instance_name, e);
                return;
            }
        };
        let plugin = Arc::new(plugin);

        if let Err(e) = self.registry.add_plugin(&self.instance_name, plugin.clone()) {
            warn!("{}", e);
            return;
        }

        if let Some(waiting) = self.pending.remove(&plugin.id) {
            for descriptor in waiting {
                self.create_component(descriptor, plugin.clone()).await;
            }
        }
    }

    async fn set_component(&mut self, id: &str, value: serde_json::Value) {
        if self.links.contains_key(id) || self.contested.contains_key(id) || self.is_pending(id) {
            return;
        }

        let descriptor: ComponentDescriptor = match serde_json::from_value(value) {
            Ok(descriptor) => descriptor,
            Err(e) => {
                warn!("Invalid component '{}' on '{}': {}", id, self.instance_name, e);
                return;
            }
        };

        match self.registry.get_plugin(&self.instance_name, &descriptor.plugin) {
            Some(plugin) => self.create_component(descriptor, plugin).await,
            None => {
                debug!(
                    "Component '{}' waits for plugin '{}:{}'",
                    descriptor.id, self.instance_name, descriptor.plugin
                );
                self.pending
                    .entry(descriptor.plugin.clone())
                    .or_default()
                    .push(descriptor);
            }
        }
    }

    async fn create_component(&mut self, descriptor: ComponentDescriptor, plugin: Arc<PluginDescriptor>) {
        if let Some(owner) = self
            .registry
            .get_component_data(&descriptor.id)
            .map(|data| data.instance_name)
        {
            warn!(
                "Holding back component '{}' of '{}': already registered by instance '{}'",
                descriptor.id, self.instance_name, owner
            );
            self.contested.insert(descriptor.id.clone(), (descriptor, plugin));
            return;
        }

        let link = match self
            .transport
            .components()
            .track_remote(&self.instance_name, &descriptor.id, plugin.clone())
        {
            Ok(link) => link,
            Err(e) => {
                warn!("Could not track component '{}': {}", descriptor.id, e);
                return;
            }
        };

        if let Err(e) = self
            .registry
            .add_component(&self.instance_name, link.component().clone())
        {
            warn!("{}", e);
            link.close().await;
            if matches!(e, RegistryError::ComponentExists { .. }) {
                self.contested.insert(descriptor.id.clone(), (descriptor, plugin));
            }
            return;
        }

        self.links.insert(descriptor.id, link);
    }

    fn clear_plugin(&mut self, id: &str) {
        let Some(plugin) = self.registry.get_plugin(&self.instance_name, id) else {
            return;
        };

        let users: Vec<&str> = self
            .links
            .values()
            .filter(|link| link.component().plugin().id == id)
            .map(|link| link.component().id())
            .collect();
        if !users.is_empty() {
            warn!(
                "Plugin '{}:{}' removed while still used by {:?}, keeping last known descriptor",
                self.instance_name, id, users
            );
        }

        if let Err(e) = self.registry.remove_plugin(&self.instance_name, &plugin) {
            warn!("{}", e);
        }
    }

    async fn clear_component(&mut self, id: &str) {
        if let Some(link) = self.links.remove(id) {
            if let Err(e) = self
                .registry
                .remove_component(&self.instance_name, link.component())
            {
                warn!("{}", e);
            }
            link.close().await;
            return;
        }

        if self.contested.remove(id).is_some() {
            return;
        }

        for waiting in self.pending.values_mut() {
            waiting.retain(|descriptor| descriptor.id != id);
        }
        self.pending.retain(|_, waiting| !waiting.is_empty());
    }

    fn is_pending(&self, id: &str) -> bool {
        self.pending
            .values()
            .any(|waiting| waiting.iter().any(|descriptor| descriptor.id == id))
    }

    async fn clear_all(&mut self) {
        let ids: Vec<String> = self.links.keys().cloned().collect();
        for id in ids {
            self.clear_component(&id).await;
        }
        self.pending.clear();
        self.contested.clear();

        for plugin in self.registry.get_plugins(&self.instance_name) {
            if let Err(e) = self.registry.remove_plugin(&self.instance_name, &plugin) {
                warn!("{}", e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_path_keeps_nested_ids() {
        assert_eq!(split_path("plugins/logic.value-binary"), ("plugins", "logic.value-binary"));
        assert_eq!(split_path("components/a/b"), ("components", "a/b"));
        assert_eq!(split_path("instance-info"), ("instance-info", ""));
    }
}
