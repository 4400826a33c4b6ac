//! Wires a component state to a component action.
//!
//! ```text
//!                 Registry component changes
//!                            │
//!                            ▼
//!   source.state ──► BindingWorker ──► target.action   (active)
//! ```
//!
//! A binding is active iff both components are in the registry, the source
//! member is a state, the target member is an action and both share the same
//! value type. It re-resolves on every registry change touching one of its
//! endpoints.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::future::pending;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::components::{Component, ComponentChange, Registry, RegistryAction, LOCAL_INSTANCE};
use crate::metadata::{Member, MemberType, Value};
use crate::observable::Observer;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BindingConfig {
    pub source_component: String,
    pub source_state: String,
    pub target_component: String,
    pub target_action: String,
}

impl BindingConfig {
    pub fn new(source_component: &str, source_state: &str, target_component: &str, target_action: &str) -> Self {
        Self {
            source_component: source_component.to_string(),
            source_state: source_state.to_string(),
            target_component: target_component.to_string(),
            target_action: target_action.to_string(),
        }
    }
}

impl fmt::Display for BindingConfig {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{}.{} -> {}.{}",
            self.source_component, self.source_state, self.target_component, self.target_action
        )
    }
}

#[derive(Default)]
struct BindingStatus {
    active: bool,
    errors: Vec<String>,
}

pub struct Binding {
    config: BindingConfig,
    status: Arc<Mutex<BindingStatus>>,
    cancel: CancellationToken,
    task_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Binding {
    pub fn new(registry: Arc<Registry>, config: BindingConfig) -> Self {
        let status = Arc::new(Mutex::new(BindingStatus::default()));
        let cancel = CancellationToken::new();

        let change_rx = registry.on_component_change();
        let worker = BindingWorker {
            config: config.clone(),
            status: status.clone(),
            source: None,
            target: None,
            source_rx: None,
        };
        let handle = tokio::spawn(worker.run(registry, change_rx, cancel.clone()));

        info!("Binding '{}' created", config);

        Self {
            config,
            status,
            cancel,
            task_handle: Mutex::new(Some(handle)),
        }
    }

    pub fn config(&self) -> &BindingConfig {
        &self.config
    }

    pub fn is_active(&self) -> bool {
        self.status.lock().active
    }

    /// Validation errors of the last resolution attempt.
    pub fn errors(&self) -> Vec<String> {
        self.status.lock().errors.clone()
    }

    pub async fn terminate(&self) {
        self.cancel.cancel();
        let handle = self.task_handle.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Binding task failed: {}", e);
            }
        }
        info!("Binding '{}' closed", self.config);
    }
}

#[derive(Clone)]
struct Endpoint {
    instance_name: String,
    component: Arc<Component>,
}

impl Endpoint {
    fn full_id(&self) -> String {
        let instance_name = if self.instance_name == LOCAL_INSTANCE {
            "local"
        } else {
            &self.instance_name
        };
        format!(
            "'{}' (plugin='{}:{}')",
            self.component.id(),
            instance_name,
            self.component.plugin().id
        )
    }

    fn find_member(&self, name: &str, member_type: MemberType) -> Option<&Member> {
        self.component
            .plugin()
            .member(name)
            .filter(|member| member.member_type == member_type)
    }
}

struct BindingWorker {
    config: BindingConfig,
    status: Arc<Mutex<BindingStatus>>,
    source: Option<Endpoint>,
    target: Option<Endpoint>,
    source_rx: Option<Observer<Option<Value>>>,
}

impl BindingWorker {
    async fn run(
        mut self,
        registry: Arc<Registry>,
        mut change_rx: Observer<ComponentChange>,
        cancel: CancellationToken,
    ) {
        for data in registry.get_components_data() {
            self.on_component_add(&data.instance_name, data.component);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                change = change_rx.recv() => match change {
                    Some(change) => match change.action {
                        RegistryAction::Add => self.on_component_add(&change.instance_name, change.payload),
                        RegistryAction::Remove => self.on_component_remove(&change.payload),
                    },
                    None => break,
                },
                value = next_value(&mut self.source_rx) => match value {
                    Some(Some(value)) => self.forward(value),
                    Some(None) => {}
                    None => self.deactivate(),
                },
            }
        }

        self.deactivate();
    }

    fn on_component_add(&mut self, instance_name: &str, component: Arc<Component>) {
        let endpoint = Endpoint {
            instance_name: instance_name.to_string(),
            component,
        };
        let id = endpoint.component.id();

        if id == self.config.source_component && !same(&self.source, &endpoint.component) {
            self.deactivate();
            self.source = Some(endpoint.clone());
            self.activate();
        }

        if endpoint.component.id() == self.config.target_component
            && !same(&self.target, &endpoint.component)
        {
            self.deactivate();
            self.target = Some(endpoint);
            self.activate();
        }
    }

    fn on_component_remove(&mut self, component: &Arc<Component>) {
        if same(&self.source, component) {
            self.deactivate();
            self.source = None;
        }

        if same(&self.target, component) {
            self.deactivate();
            self.target = None;
        }
    }

    fn activate(&mut self) {
        let (Some(source), Some(target)) = (&self.source, &self.target) else {
            return;
        };

        let source_state = &self.config.source_state;
        let target_action = &self.config.target_action;

        let source_member = source.find_member(source_state, MemberType::State);
        let target_member = target.find_member(target_action, MemberType::Action);

        let mut errors = Vec::new();

        if source_member.is_none() {
            errors.push(format!(
                "State '{}' does not exist on component {}",
                source_state,
                source.full_id()
            ));
        }

        if target_member.is_none() {
            errors.push(format!(
                "Action '{}' does not exist on component {}",
                target_action,
                target.full_id()
            ));
        }

        if let (Some(source_member), Some(target_member)) = (source_member, target_member) {
            if source_member.value_type != target_member.value_type {
                errors.push(format!(
                    "State '{}' on component {} has type '{}', which is different from type '{}' for action '{}' on component {}",
                    source_state,
                    source.full_id(),
                    source_member.value_type,
                    target_member.value_type,
                    target_action,
                    target.full_id()
                ));
            }
        }

        if !errors.is_empty() {
            error!("Binding '{}' errors: {}", self.config, errors.join(", "));
            self.status.lock().errors = errors;
            return;
        }

        // the first value received is the current one, if known
        self.source_rx = source
            .component
            .state_item(source_state)
            .map(|item| item.subscribe(true));

        *self.status.lock() = BindingStatus {
            active: self.source_rx.is_some(),
            errors: Vec::new(),
        };
        debug!("Binding '{}' activated", self.config);
    }

    fn deactivate(&mut self) {
        let was_active = self.source_rx.take().is_some();
        *self.status.lock() = BindingStatus::default();

        if was_active {
            debug!("Binding '{}' deactivated", self.config);
        }
    }

    fn forward(&self, value: Value) {
        let Some(target) = &self.target else {
            return;
        };

        if let Err(e) = target
            .component
            .execute_action(&self.config.target_action, value)
        {
            warn!("Binding '{}' could not forward value: {}", self.config, e);
        }
    }
}

fn same(endpoint: &Option<Endpoint>, component: &Arc<Component>) -> bool {
    endpoint
        .as_ref()
        .map(|endpoint| Arc::ptr_eq(&endpoint.component, component))
        .unwrap_or(false)
}

async fn next_value(source_rx: &mut Option<Observer<Option<Value>>>) -> Option<Option<Value>> {
    match source_rx {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}
