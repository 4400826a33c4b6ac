//! Authoritative catalogue of known plugins and components.
//!
//! Entries are grouped by instance name, `""` being the local instance. A
//! reverse index maps every component id to its owning instance; component
//! ids are unique across instances. Empty instances are pruned.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

use super::component::Component;
use crate::metadata::PluginDescriptor;
use crate::observable::{Observer, Subject};

pub const LOCAL_INSTANCE: &str = "";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Plugin '{0}' does already exist in the registry")]
    PluginExists(String),

    #[error("Plugin '{0}' does not exist in the registry")]
    PluginMissing(String),

    #[error("Component '{id}' does already exist in the registry (instance '{owner}')")]
    ComponentExists { id: String, owner: String },

    #[error("Component '{0}' does not exist in the registry")]
    ComponentMissing(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryAction {
    Add,
    Remove,
}

#[derive(Debug, Clone)]
pub struct RegistryChange<T> {
    pub action: RegistryAction,
    pub instance_name: String,
    pub payload: T,
}

pub type PluginChange = RegistryChange<Arc<PluginDescriptor>>;
pub type ComponentChange = RegistryChange<Arc<Component>>;

#[derive(Debug, Clone)]
pub struct ComponentData {
    pub instance_name: String,
    pub component: Arc<Component>,
}

#[derive(Default)]
struct InstanceData {
    plugins: HashMap<String, Arc<PluginDescriptor>>,
    components: HashMap<String, Arc<Component>>,
}

impl InstanceData {
    fn is_empty(&self) -> bool {
        self.plugins.is_empty() && self.components.is_empty()
    }
}

#[derive(Default)]
struct RegistryState {
    instances: HashMap<String, InstanceData>,
    components: HashMap<String, ComponentData>,
}

impl RegistryState {
    fn update_instance<R>(
        &mut self,
        instance_name: &str,
        callback: impl FnOnce(&mut InstanceData) -> R,
    ) -> R {
        let data = self
            .instances
            .entry(instance_name.to_string())
            .or_insert_with(|| {
                debug!("Instance '{}' added", instance_name);
                InstanceData::default()
            });

        let result = callback(data);

        if data.is_empty() {
            self.instances.remove(instance_name);
            debug!("Instance '{}' removed", instance_name);
        }

        result
    }
}

fn log_id(instance_name: &str, id: &str) -> String {
    if instance_name.is_empty() {
        id.to_string()
    } else {
        format!("{}:{}", instance_name, id)
    }
}

pub struct Registry {
    state: Mutex<RegistryState>,
    plugin_changes: Subject<PluginChange>,
    component_changes: Subject<ComponentChange>,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            plugin_changes: Subject::new(),
            component_changes: Subject::new(),
        }
    }

    pub fn on_plugin_change(&self) -> Observer<PluginChange> {
        self.plugin_changes.subscribe()
    }

    pub fn on_component_change(&self) -> Observer<ComponentChange> {
        self.component_changes.subscribe()
    }

    pub fn add_plugin(
        &self,
        instance_name: &str,
        plugin: Arc<PluginDescriptor>,
    ) -> Result<(), RegistryError> {
        let id = log_id(instance_name, &plugin.id);

        // observers see changes in the order they were applied
        let mut state = self.state.lock();
        state.update_instance(instance_name, |data| {
            if data.plugins.contains_key(&plugin.id) {
                return Err(RegistryError::PluginExists(id.clone()));
            }
            data.plugins.insert(plugin.id.clone(), plugin.clone());
            Ok(())
        })?;

        debug!("Plugin '{}' added", id);
        self.plugin_changes.notify(RegistryChange {
            action: RegistryAction::Add,
            instance_name: instance_name.to_string(),
            payload: plugin,
        });
        Ok(())
    }

    pub fn remove_plugin(
        &self,
        instance_name: &str,
        plugin: &Arc<PluginDescriptor>,
    ) -> Result<(), RegistryError> {
        let id = log_id(instance_name, &plugin.id);

        let mut state = self.state.lock();
        let removed = state.update_instance(instance_name, |data| {
            data.plugins
                .remove(&plugin.id)
                .ok_or_else(|| RegistryError::PluginMissing(id.clone()))
        })?;

        debug!("Plugin '{}' removed", id);
        self.plugin_changes.notify(RegistryChange {
            action: RegistryAction::Remove,
            instance_name: instance_name.to_string(),
            payload: removed,
        });
        Ok(())
    }

    pub fn has_plugin(&self, instance_name: &str, id: &str) -> bool {
        self.get_plugin(instance_name, id).is_some()
    }

    pub fn get_plugin(&self, instance_name: &str, id: &str) -> Option<Arc<PluginDescriptor>> {
        self.state
            .lock()
            .instances
            .get(instance_name)
            .and_then(|data| data.plugins.get(id).cloned())
    }

    pub fn get_plugins(&self, instance_name: &str) -> Vec<Arc<PluginDescriptor>> {
        self.state
            .lock()
            .instances
            .get(instance_name)
            .map(|data| data.plugins.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn add_component(
        &self,
        instance_name: &str,
        component: Arc<Component>,
    ) -> Result<(), RegistryError> {
        let id = component.id().to_string();

        let mut state = self.state.lock();
        if let Some(existing) = state.components.get(&id) {
            return Err(RegistryError::ComponentExists {
                id,
                owner: existing.instance_name.clone(),
            });
        }

        state.update_instance(instance_name, |data| {
            data.components.insert(id.clone(), component.clone());
        });
        state.components.insert(
            id.clone(),
            ComponentData {
                instance_name: instance_name.to_string(),
                component: component.clone(),
            },
        );

        debug!("Component '{}' added", log_id(instance_name, &id));
        self.component_changes.notify(RegistryChange {
            action: RegistryAction::Add,
            instance_name: instance_name.to_string(),
            payload: component,
        });
        Ok(())
    }

    pub fn remove_component(
        &self,
        instance_name: &str,
        component: &Arc<Component>,
    ) -> Result<(), RegistryError> {
        let id = component.id();
        let log_id = log_id(instance_name, id);

        let mut state = self.state.lock();
        let owned = state
            .instances
            .get(instance_name)
            .map(|data| data.components.contains_key(id))
            .unwrap_or(false);
        if !owned {
            return Err(RegistryError::ComponentMissing(log_id));
        }

        state.components.remove(id);
        let removed = state.update_instance(instance_name, |data| data.components.remove(id));

        let Some(removed) = removed else {
            return Err(RegistryError::ComponentMissing(log_id));
        };

        debug!("Component '{}' removed", log_id);
        self.component_changes.notify(RegistryChange {
            action: RegistryAction::Remove,
            instance_name: instance_name.to_string(),
            payload: removed,
        });
        Ok(())
    }

    pub fn has_component(&self, id: &str) -> bool {
        self.state.lock().components.contains_key(id)
    }

    pub fn get_component(&self, id: &str) -> Option<Arc<Component>> {
        self.state
            .lock()
            .components
            .get(id)
            .map(|data| data.component.clone())
    }

    pub fn get_component_data(&self, id: &str) -> Option<ComponentData> {
        self.state.lock().components.get(id).cloned()
    }

    pub fn get_components_data(&self) -> Vec<ComponentData> {
        self.state.lock().components.values().cloned().collect()
    }

    pub fn get_components(&self) -> Vec<Arc<Component>> {
        self.state
            .lock()
            .components
            .values()
            .map(|data| data.component.clone())
            .collect()
    }

    pub fn get_instance_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.state.lock().instances.keys().cloned().collect();
        names.sort();
        names
    }
}
