//! Plugins a node can instantiate local components from.
//!
//! A [`Plugin`] couples a descriptor with a constructor. The [`PluginCatalog`]
//! holds every plugin available in this process, keyed by plugin id.

pub mod value_binary;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use thiserror::Error;

use crate::components::{Component, ComponentError};
use crate::metadata::{ConfigType, PluginDescriptor, Value};

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("Missing config value for item '{0}'")]
    MissingConfig(String),

    #[error("Could not read value {value} for item '{item}' (expected {expected:?})")]
    InvalidConfig {
        item: String,
        value: String,
        expected: ConfigType,
    },

    #[error("Component error: {0}")]
    Component(#[from] ComponentError),
}

/// Typed configuration of one component, checked against its plugin.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PluginConfig {
    values: HashMap<String, Value>,
}

impl PluginConfig {
    /// Reads every config item declared by `plugin` from `raw`.
    pub fn build(
        plugin: &PluginDescriptor,
        raw: &HashMap<String, serde_json::Value>,
    ) -> Result<Self, PluginError> {
        let mut values = HashMap::new();

        for item in &plugin.config {
            let raw_value = raw
                .get(&item.name)
                .ok_or_else(|| PluginError::MissingConfig(item.name.clone()))?;

            let value = match item.value_type {
                ConfigType::String => raw_value.as_str().map(|v| Value::Text(v.to_string())),
                ConfigType::Bool => raw_value.as_bool().map(Value::Bool),
                ConfigType::Integer => raw_value.as_i64().map(Value::Int),
                ConfigType::Float => raw_value.as_f64().map(Value::Float),
            };

            let value = value.ok_or_else(|| PluginError::InvalidConfig {
                item: item.name.clone(),
                value: raw_value.to_string(),
                expected: item.value_type,
            })?;

            values.insert(item.name.clone(), value);
        }

        Ok(Self { values })
    }

    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    pub fn get_bool(&self, name: &str) -> Option<bool> {
        match self.values.get(name) {
            Some(Value::Bool(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_int(&self, name: &str) -> Option<i64> {
        match self.values.get(name) {
            Some(Value::Int(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_float(&self, name: &str) -> Option<f64> {
        match self.values.get(name) {
            Some(Value::Float(value)) => Some(*value),
            _ => None,
        }
    }

    pub fn get_text(&self, name: &str) -> Option<&str> {
        match self.values.get(name) {
            Some(Value::Text(value)) => Some(value),
            _ => None,
        }
    }
}

pub trait Plugin: Send + Sync + 'static {
    fn descriptor(&self) -> &Arc<PluginDescriptor>;

    /// Builds component `id`. The returned component is live: its state is
    /// initialized and its actions are wired.
    fn instantiate(&self, id: &str, config: &PluginConfig) -> Result<Component, PluginError>;
}

#[derive(Default)]
pub struct PluginCatalog {
    plugins: HashMap<String, Arc<dyn Plugin>>,
}

impl PluginCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Catalog with the plugins shipped in this crate.
    pub fn builtin() -> Self {
        let mut catalog = Self::new();
        catalog.register(Arc::new(value_binary::ValueBinary::new()));
        catalog
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.insert(plugin.descriptor().id.clone(), plugin);
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Plugin>> {
        self.plugins.get(id).cloned()
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.plugins.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn descriptors(&self) -> Vec<Arc<PluginDescriptor>> {
        self.plugins
            .values()
            .map(|plugin| plugin.descriptor().clone())
            .collect()
    }

    /// Version of every plugin module.
    pub fn modules(&self) -> BTreeMap<String, String> {
        self.plugins
            .values()
            .map(|plugin| {
                let descriptor = plugin.descriptor();
                (descriptor.module.clone(), descriptor.version.clone())
            })
            .collect()
    }
}
