use std::sync::Arc;
use tracing::debug;

use super::{Plugin, PluginConfig, PluginError};
use crate::components::{Component, ComponentError};
use crate::metadata::{ConfigType, PluginDescriptor, PluginUsage, Value, ValueType};

pub const STATE: &str = "value";
pub const ACTION: &str = "setValue";
pub const INITIAL_VALUE: &str = "initialValue";

/// Boolean memory cell: `setValue` writes `value`.
pub struct ValueBinary {
    descriptor: Arc<PluginDescriptor>,
}

impl Default for ValueBinary {
    fn default() -> Self {
        Self::new()
    }
}

impl ValueBinary {
    pub fn new() -> Self {
        let descriptor = PluginDescriptor::new(
            "logic",
            "value-binary",
            env!("CARGO_PKG_VERSION"),
            PluginUsage::Logic,
        )
        .with_description("Stores a binary value")
        .with_state(STATE, ValueType::Bool)
        .with_action(ACTION, ValueType::Bool)
        .with_config(INITIAL_VALUE, ConfigType::Bool, "Initial value");

        Self {
            descriptor: Arc::new(descriptor),
        }
    }
}

impl Plugin for ValueBinary {
    fn descriptor(&self) -> &Arc<PluginDescriptor> {
        &self.descriptor
    }

    fn instantiate(&self, id: &str, config: &PluginConfig) -> Result<Component, PluginError> {
        let initial = config
            .get_bool(INITIAL_VALUE)
            .ok_or_else(|| PluginError::MissingConfig(INITIAL_VALUE.to_string()))?;

        let builder = Component::builder(id, self.descriptor.clone());
        let Some(state) = builder.state_handle(STATE) else {
            return Err(PluginError::Component(ComponentError::UnknownState {
                component: id.to_string(),
                state: STATE.to_string(),
            }));
        };
        state.update(Some(Value::Bool(initial)));

        let component_id = id.to_string();
        let component = builder
            .on_action(ACTION, move |value| {
                debug!("{} := {}", component_id, value);
                state.update(Some(value));
            })
            .build()?;

        Ok(component)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashMap;

    fn config(initial: bool) -> PluginConfig {
        let raw = HashMap::from([(INITIAL_VALUE.to_string(), json!(initial))]);
        PluginConfig::build(ValueBinary::new().descriptor(), &raw).unwrap()
    }

    #[test]
    fn starts_with_initial_value() {
        let component = ValueBinary::new().instantiate("v1", &config(true)).unwrap();
        assert_eq!(component.get_state(STATE), Some(Value::Bool(true)));
    }

    #[test]
    fn action_sets_state() {
        let component = ValueBinary::new().instantiate("v1", &config(false)).unwrap();
        let mut changes = component.state_item(STATE).unwrap().subscribe(false);

        component.execute_action(ACTION, Value::Bool(true)).unwrap();

        assert_eq!(component.get_state(STATE), Some(Value::Bool(true)));
        assert_eq!(changes.try_recv(), Some(Some(Value::Bool(true))));
        assert!(component.execute_action(ACTION, Value::Int(1)).is_err());
    }
}
