use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use crate::metadata::{MemberType, PluginDescriptor, Value};
use crate::observable::ObservableValue;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum ComponentError {
    #[error("Unknown action '{action}' on component '{component}'")]
    UnknownAction { component: String, action: String },

    #[error("Unknown state '{state}' on component '{component}'")]
    UnknownState { component: String, state: String },

    #[error("Missing handler for action '{action}' on component '{component}'")]
    MissingActionHandler { component: String, action: String },

    #[error("Invalid value {value} for '{member}' on component '{component}'")]
    InvalidValue {
        component: String,
        member: String,
        value: String,
    },
}

pub type ActionHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// State value of a component member; `None` until known.
pub type StateValue = ObservableValue<Option<Value>>;

/// Runtime instance of a plugin.
///
/// State members are observable values, actions are write-only sinks. Local
/// components are driven by their plugin; remote proxies mirror state from the
/// bus and forward action writes to it.
pub struct Component {
    id: String,
    plugin: Arc<PluginDescriptor>,
    state: HashMap<String, StateValue>,
    actions: HashMap<String, ActionHandler>,
}

impl Component {
    pub fn builder(id: &str, plugin: Arc<PluginDescriptor>) -> ComponentBuilder {
        let state = plugin
            .members_of(MemberType::State)
            .map(|member| (member.name.clone(), ObservableValue::new(None)))
            .collect();

        ComponentBuilder {
            id: id.to_string(),
            plugin,
            state,
            actions: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn plugin(&self) -> &Arc<PluginDescriptor> {
        &self.plugin
    }

    pub fn state_item(&self, name: &str) -> Option<&StateValue> {
        self.state.get(name)
    }

    pub fn get_state(&self, name: &str) -> Option<Value> {
        self.state.get(name).and_then(|value| value.get())
    }

    /// Snapshot of every state member.
    pub fn state(&self) -> HashMap<String, Option<Value>> {
        self.state
            .iter()
            .map(|(name, value)| (name.clone(), value.get()))
            .collect()
    }

    pub fn set_state(&self, name: &str, value: Value) -> Result<bool, ComponentError> {
        let item = self
            .state
            .get(name)
            .ok_or_else(|| ComponentError::UnknownState {
                component: self.id.clone(),
                state: name.to_string(),
            })?;

        self.check_value(name, &value)?;
        Ok(item.update(Some(value)))
    }

    pub fn execute_action(&self, name: &str, value: Value) -> Result<(), ComponentError> {
        let handler = self
            .actions
            .get(name)
            .ok_or_else(|| ComponentError::UnknownAction {
                component: self.id.clone(),
                action: name.to_string(),
            })?;

        self.check_value(name, &value)?;
        handler(value);
        Ok(())
    }

    fn check_value(&self, name: &str, value: &Value) -> Result<(), ComponentError> {
        let valid = self
            .plugin
            .member(name)
            .map(|member| member.value_type.validate(value))
            .unwrap_or(false);

        if !valid {
            return Err(ComponentError::InvalidValue {
                component: self.id.clone(),
                member: name.to_string(),
                value: value.to_string(),
            });
        }
        Ok(())
    }
}

impl fmt::Debug for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Component")
            .field("id", &self.id)
            .field("plugin", &self.plugin.id)
            .finish()
    }
}

pub struct ComponentBuilder {
    id: String,
    plugin: Arc<PluginDescriptor>,
    state: HashMap<String, StateValue>,
    actions: HashMap<String, ActionHandler>,
}

impl ComponentBuilder {
    /// Handle on a state member of the component being built, for action
    /// handlers that drive the component's own state.
    pub fn state_handle(&self, name: &str) -> Option<StateValue> {
        self.state.get(name).cloned()
    }

    pub fn on_action<F>(mut self, name: &str, handler: F) -> Self
    where
        F: Fn(Value) + Send + Sync + 'static,
    {
        self.actions.insert(name.to_string(), Arc::new(handler));
        self
    }

    /// Routes every action member to one handler receiving the action name.
    pub fn on_any_action<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, Value) + Send + Sync + 'static,
    {
        let handler = Arc::new(handler);
        let names: Vec<String> = self
            .plugin
            .members_of(MemberType::Action)
            .map(|member| member.name.clone())
            .collect();

        for name in names {
            let handler = handler.clone();
            let action = name.clone();
            self.actions
                .insert(name, Arc::new(move |value| handler(&action, value)));
        }
        self
    }

    pub fn build(self) -> Result<Component, ComponentError> {
        for member in self.plugin.members_of(MemberType::Action) {
            if !self.actions.contains_key(&member.name) {
                return Err(ComponentError::MissingActionHandler {
                    component: self.id.clone(),
                    action: member.name.clone(),
                });
            }
        }

        Ok(Component {
            id: self.id,
            plugin: self.plugin,
            state: self.state,
            actions: self.actions,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metadata::{PluginUsage, ValueType};
    use parking_lot::Mutex;

    fn plugin() -> Arc<PluginDescriptor> {
        Arc::new(
            PluginDescriptor::new("test", "dimmer", "1.0.0", PluginUsage::Actuator)
                .with_state("level", ValueType::range(0, 100).unwrap())
                .with_action("setLevel", ValueType::range(0, 100).unwrap()),
        )
    }

    #[test]
    fn actions_are_validated() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        let component = Component::builder("dimmer1", plugin())
            .on_action("setLevel", move |value| sink.lock().push(value))
            .build()
            .unwrap();

        component.execute_action("setLevel", Value::Int(40)).unwrap();
        assert!(component.execute_action("setLevel", Value::Int(400)).is_err());
        assert!(component.execute_action("level", Value::Int(4)).is_err());
        assert_eq!(*received.lock(), vec![Value::Int(40)]);
    }

    #[test]
    fn state_starts_unknown() {
        let component = Component::builder("dimmer1", plugin())
            .on_any_action(|_, _| {})
            .build()
            .unwrap();

        assert_eq!(component.get_state("level"), None);
        assert!(component.set_state("level", Value::Int(10)).unwrap());
        assert!(!component.set_state("level", Value::Int(10)).unwrap());
        assert_eq!(component.get_state("level"), Some(Value::Int(10)));
        assert!(component.set_state("missing", Value::Int(1)).is_err());
    }

    #[test]
    fn missing_handler_is_rejected() {
        assert!(matches!(
            Component::builder("dimmer1", plugin()).build(),
            Err(ComponentError::MissingActionHandler { .. })
        ));
    }
}
