//! Mirrors the local part of the registry onto the bus.
//!
//! ```text
//! Registry ("" instance) ──► BusPublisher ──► metadata: plugins/{id}, components/{id}
//!                                        └─► component channel (state, actions)
//! ```
//!
//! On every connect plugins are announced before components so that remote
//! listeners can resolve them without waiting.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::component::Component;
use super::registry::{ComponentChange, PluginChange, Registry, RegistryAction, LOCAL_INSTANCE};
use crate::bus::components::LocalComponentLink;
use crate::bus::topic::Domain;
use crate::bus::Transport;
use crate::metadata::{ComponentDescriptor, MemberType, PluginDescriptor};
use crate::observable::Observer;

pub fn plugin_path(id: &str) -> String {
    format!("plugins/{}", id)
}

pub fn component_path(id: &str) -> String {
    format!("components/{}", id)
}

pub struct BusPublisher {
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl BusPublisher {
    pub fn new(transport: Arc<Transport>, registry: Arc<Registry>) -> Self {
        let online_rx = transport.on_online_changed();
        let plugin_rx = registry.on_plugin_change();
        let component_rx = registry.on_component_change();

        let cancel = CancellationToken::new();
        let worker = PublisherWorker {
            online: transport.online(),
            transport,
            plugins: HashMap::new(),
            components: HashMap::new(),
        };

        let handle = tokio::spawn(worker.run(
            registry,
            online_rx,
            plugin_rx,
            component_rx,
            cancel.clone(),
        ));

        Self {
            cancel,
            task_handle: Mutex::new(Some(handle)),
        }
    }

    /// Unpublishes every local entry and stops the worker.
    pub async fn terminate(&self) {
        self.cancel.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Bus publisher task failed: {}", e);
            }
        }
    }
}

struct PublishedComponent {
    component: Arc<Component>,
    link: Option<LocalComponentLink>,
}

struct PublisherWorker {
    transport: Arc<Transport>,
    online: bool,
    plugins: HashMap<String, Arc<PluginDescriptor>>,
    components: HashMap<String, PublishedComponent>,
}

impl PublisherWorker {
    async fn run(
        mut self,
        registry: Arc<Registry>,
        mut online_rx: Observer<bool>,
        mut plugin_rx: Observer<PluginChange>,
        mut component_rx: Observer<ComponentChange>,
        cancel: CancellationToken,
    ) {
        for plugin in registry.get_plugins(LOCAL_INSTANCE) {
            self.publish_plugin(plugin);
        }
        for data in registry.get_components_data() {
            if data.instance_name == LOCAL_INSTANCE {
                self.publish_component(data.component);
            }
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                online = online_rx.recv() => match online {
                    Some(online) => self.on_online_change(online).await,
                    None => break,
                },
                change = plugin_rx.recv() => match change {
                    Some(change) => self.on_plugin_change(change),
                    None => break,
                },
                change = component_rx.recv() => match change {
                    Some(change) => self.on_component_change(change).await,
                    None => break,
                },
            }
        }

        self.close().await;
        debug!("Bus publisher terminated");
    }

    fn on_plugin_change(&mut self, change: PluginChange) {
        if change.instance_name != LOCAL_INSTANCE {
            return;
        }

        match change.action {
            RegistryAction::Add => self.publish_plugin(change.payload),
            RegistryAction::Remove => self.unpublish_plugin(&change.payload.id),
        }
    }

    async fn on_component_change(&mut self, change: ComponentChange) {
        if change.instance_name != LOCAL_INSTANCE {
            return;
        }

        match change.action {
            RegistryAction::Add => self.publish_component(change.payload),
            RegistryAction::Remove => self.unpublish_component(change.payload.id()).await,
        }
    }

    async fn on_online_change(&mut self, online: bool) {
        if self.online == online {
            return;
        }
        self.online = online;

        if online {
            for plugin in self.plugins.values() {
                self.set_plugin_meta(plugin);
            }

            let transport = self.transport.clone();
            for published in self.components.values_mut() {
                attach(&transport, published);
            }
        } else {
            for published in self.components.values_mut() {
                if let Some(link) = published.link.take() {
                    link.close().await;
                }
            }
        }
    }

    fn publish_plugin(&mut self, plugin: Arc<PluginDescriptor>) {
        if self.plugins.contains_key(&plugin.id) {
            return;
        }

        if self.online {
            self.set_plugin_meta(&plugin);
        }
        self.plugins.insert(plugin.id.clone(), plugin);
    }

    fn unpublish_plugin(&mut self, id: &str) {
        if self.plugins.remove(id).is_none() {
            return;
        }

        if self.online {
            self.clear_meta(&plugin_path(id));
        }
    }

    fn publish_component(&mut self, component: Arc<Component>) {
        if self.components.contains_key(component.id()) {
            return;
        }

        let mut published = PublishedComponent {
            component: component.clone(),
            link: None,
        };
        if self.online {
            attach(&self.transport, &mut published);
        }
        self.components.insert(component.id().to_string(), published);
    }

    async fn unpublish_component(&mut self, id: &str) {
        let Some(mut published) = self.components.remove(id) else {
            return;
        };

        if let Some(link) = published.link.take() {
            link.close().await;
        }

        if self.online {
            self.clear_meta(&component_path(id));

            let client = self.transport.client();
            for member in published.component.plugin().members_of(MemberType::State) {
                let topic = client.build_topic(Domain::Components, &[id, &member.name]);
                if let Err(e) = client.clear_retain(&topic) {
                    warn!("Could not clear state '{}': {}", topic, e);
                }
            }
        }
    }

    async fn close(&mut self) {
        let ids: Vec<String> = self.components.keys().cloned().collect();
        for id in ids {
            self.unpublish_component(&id).await;
        }

        let ids: Vec<String> = self.plugins.keys().cloned().collect();
        for id in ids {
            self.unpublish_plugin(&id);
        }
    }

    fn set_plugin_meta(&self, plugin: &PluginDescriptor) {
        let path = plugin_path(&plugin.id);
        if let Err(e) = self.transport.metadata().set(&path, plugin) {
            error!("Could not publish metadata '{}': {}", path, e);
        }
    }

    fn clear_meta(&self, path: &str) {
        if let Err(e) = self.transport.metadata().clear(path) {
            error!("Could not unpublish metadata '{}': {}", path, e);
        }
    }
}

/// Opens the component channel and announces the descriptor.
fn attach(transport: &Transport, published: &mut PublishedComponent) {
    if published.link.is_none() {
        published.link = Some(transport.components().add_local(published.component.clone()));
    }

    let descriptor = ComponentDescriptor {
        id: published.component.id().to_string(),
        plugin: published.component.plugin().id.clone(),
    };
    let path = component_path(&descriptor.id);
    if let Err(e) = transport.metadata().set(&path, &descriptor) {
        error!("Could not publish metadata '{}': {}", path, e);
    }
}
