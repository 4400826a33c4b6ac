use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{error, info, warn};

use super::binding::{Binding, BindingConfig};
use crate::bus::{BusError, RpcError};
use crate::components::{Component, Registry, RegistryError, LOCAL_INSTANCE};
use crate::plugins::{PluginCatalog, PluginConfig, PluginError};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Component id duplicate: '{0}'")]
    ComponentExists(String),

    #[error("Component id does not exist: '{0}'")]
    ComponentMissing(String),

    #[error("Plugin does not exist: '{0}'")]
    UnknownPlugin(String),

    #[error("Could not create component '{id}': {source}")]
    Plugin {
        id: String,
        #[source]
        source: PluginError,
    },

    #[error("Binding already exists: {0}")]
    BindingExists(String),

    #[error("Binding does not exist: {0}")]
    BindingMissing(String),

    #[error("Bindings are not supported without presence tracking")]
    BindingsUnsupported,

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Bus error: {0}")]
    Bus(#[from] BusError),

    #[error("Rpc error: {0}")]
    Rpc(#[from] RpcError),
}

/// Local component to instantiate: `id` built by `plugin` with `config`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComponentConfig {
    pub id: String,
    pub plugin: String,
    #[serde(default)]
    pub config: HashMap<String, serde_json::Value>,
}

struct LocalComponent {
    config: ComponentConfig,
    component: Arc<Component>,
}

#[derive(Default)]
struct ManagerState {
    components: HashMap<String, LocalComponent>,
    bindings: HashMap<BindingConfig, Arc<Binding>>,
}

/// Owner of the local components and of the binding instances.
pub struct ComponentManager {
    registry: Arc<Registry>,
    catalog: Arc<PluginCatalog>,
    supports_bindings: bool,
    state: Mutex<ManagerState>,
}

impl ComponentManager {
    /// Registers every plugin of `catalog` as a local plugin.
    pub fn new(
        registry: Arc<Registry>,
        catalog: Arc<PluginCatalog>,
        supports_bindings: bool,
    ) -> Result<Self, ManagerError> {
        for plugin in catalog.descriptors() {
            registry.add_plugin(LOCAL_INSTANCE, plugin)?;
        }

        Ok(Self {
            registry,
            catalog,
            supports_bindings,
            state: Mutex::new(ManagerState::default()),
        })
    }

    pub fn supports_bindings(&self) -> bool {
        self.supports_bindings
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn add_component(&self, config: ComponentConfig) -> Result<(), ManagerError> {
        let mut state = self.state.lock();

        if state.components.contains_key(&config.id) {
            return Err(ManagerError::ComponentExists(config.id));
        }

        let plugin = self
            .catalog
            .get(&config.plugin)
            .ok_or_else(|| ManagerError::UnknownPlugin(config.plugin.clone()))?;

        let component = PluginConfig::build(plugin.descriptor(), &config.config)
            .and_then(|plugin_config| plugin.instantiate(&config.id, &plugin_config))
            .map_err(|source| ManagerError::Plugin {
                id: config.id.clone(),
                source,
            })?;
        let component = Arc::new(component);

        self.registry.add_component(LOCAL_INSTANCE, component.clone())?;
        info!("Component '{}' ({}) added", config.id, config.plugin);

        state
            .components
            .insert(config.id.clone(), LocalComponent { config, component });
        Ok(())
    }

    pub fn remove_component(&self, id: &str) -> Result<(), ManagerError> {
        let mut state = self.state.lock();

        let local = state
            .components
            .remove(id)
            .ok_or_else(|| ManagerError::ComponentMissing(id.to_string()))?;

        self.registry.remove_component(LOCAL_INSTANCE, &local.component)?;
        info!("Component '{}' removed", id);
        Ok(())
    }

    pub fn get_component(&self, id: &str) -> Option<Arc<Component>> {
        self.state
            .lock()
            .components
            .get(id)
            .map(|local| local.component.clone())
    }

    pub fn get_components(&self) -> Vec<ComponentConfig> {
        let mut configs: Vec<ComponentConfig> = self
            .state
            .lock()
            .components
            .values()
            .map(|local| local.config.clone())
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    pub fn add_binding(&self, config: BindingConfig) -> Result<(), ManagerError> {
        if !self.supports_bindings {
            return Err(ManagerError::BindingsUnsupported);
        }

        let mut state = self.state.lock();
        if state.bindings.contains_key(&config) {
            return Err(ManagerError::BindingExists(config.to_string()));
        }

        let binding = Arc::new(Binding::new(self.registry.clone(), config.clone()));
        state.bindings.insert(config, binding);
        Ok(())
    }

    pub async fn remove_binding(&self, config: &BindingConfig) -> Result<(), ManagerError> {
        let binding = self
            .state
            .lock()
            .bindings
            .remove(config)
            .ok_or_else(|| ManagerError::BindingMissing(config.to_string()))?;

        binding.terminate().await;
        Ok(())
    }

    pub fn get_binding(&self, config: &BindingConfig) -> Option<Arc<Binding>> {
        self.state.lock().bindings.get(config).cloned()
    }

    pub fn get_bindings(&self) -> Vec<BindingConfig> {
        let mut configs: Vec<BindingConfig> = self.state.lock().bindings.keys().cloned().collect();
        configs.sort_by_key(|config| config.to_string());
        configs
    }

    pub async fn terminate_bindings(&self) {
        let bindings: Vec<Arc<Binding>> = self
            .state
            .lock()
            .bindings
            .drain()
            .map(|(_, binding)| binding)
            .collect();

        for binding in bindings {
            binding.terminate().await;
        }
    }

    /// Removes every local component and plugin from the registry.
    pub async fn terminate(&self) {
        self.terminate_bindings().await;

        let components: Vec<LocalComponent> = self
            .state
            .lock()
            .components
            .drain()
            .map(|(_, local)| local)
            .collect();

        for local in components {
            if let Err(e) = self.registry.remove_component(LOCAL_INSTANCE, &local.component) {
                error!("{}", e);
            }
        }

        for plugin in self.catalog.descriptors() {
            if let Err(e) = self.registry.remove_plugin(LOCAL_INSTANCE, &plugin) {
                warn!("{}", e);
            }
        }

        info!("Component manager terminated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manager(supports_bindings: bool) -> ComponentManager {
        ComponentManager::new(
            Arc::new(Registry::new()),
            Arc::new(PluginCatalog::builtin()),
            supports_bindings,
        )
        .unwrap()
    }

    fn value_binary(id: &str) -> ComponentConfig {
        ComponentConfig {
            id: id.to_string(),
            plugin: "logic.value-binary".to_string(),
            config: HashMap::from([("initialValue".to_string(), json!(false))]),
        }
    }

    #[test]
    fn plugins_are_registered_locally() {
        let manager = manager(true);
        assert!(manager.registry().has_plugin(LOCAL_INSTANCE, "logic.value-binary"));
    }

    #[test]
    fn plugin_registration_failure_is_reported() {
        let registry = Arc::new(Registry::new());
        let catalog = Arc::new(PluginCatalog::builtin());
        let taken = catalog
            .descriptors()
            .into_iter()
            .find(|plugin| plugin.id == "logic.value-binary")
            .unwrap();
        registry.add_plugin(LOCAL_INSTANCE, taken).unwrap();

        let result = ComponentManager::new(registry, catalog, true);
        assert!(matches!(result, Err(ManagerError::Registry(_))));
    }

    #[test]
    fn components_lifecycle() {
        let manager = manager(true);

        manager.add_component(value_binary("v1")).unwrap();
        assert!(manager.registry().has_component("v1"));
        assert!(matches!(
            manager.add_component(value_binary("v1")),
            Err(ManagerError::ComponentExists(_))
        ));

        let unknown = ComponentConfig {
            plugin: "nope.nope".to_string(),
            ..value_binary("v2")
        };
        assert!(matches!(
            manager.add_component(unknown),
            Err(ManagerError::UnknownPlugin(_))
        ));

        let bad_config = ComponentConfig {
            config: HashMap::new(),
            ..value_binary("v3")
        };
        assert!(matches!(
            manager.add_component(bad_config),
            Err(ManagerError::Plugin { .. })
        ));

        assert_eq!(manager.get_components(), vec![value_binary("v1")]);

        manager.remove_component("v1").unwrap();
        assert!(!manager.registry().has_component("v1"));
        assert!(matches!(
            manager.remove_component("v1"),
            Err(ManagerError::ComponentMissing(_))
        ));
    }

    #[tokio::test]
    async fn bindings_need_support() {
        let config = BindingConfig::new("a", "value", "b", "setValue");

        assert!(matches!(
            manager(false).add_binding(config.clone()),
            Err(ManagerError::BindingsUnsupported)
        ));

        let manager = manager(true);
        manager.add_binding(config.clone()).unwrap();
        assert!(matches!(
            manager.add_binding(config.clone()),
            Err(ManagerError::BindingExists(_))
        ));
        assert_eq!(manager.get_bindings(), vec![config.clone()]);

        manager.remove_binding(&config).await.unwrap();
        assert!(manager.remove_binding(&config).await.is_err());
    }
}
