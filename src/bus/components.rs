//! Component state and action replication on
//! `{instance}/components/{componentId}/{member}`.
//!
//! Local components publish every state change retained and receive actions.
//! Remote proxies mirror state into local observables and publish actions
//! non-retained.

use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::client::BusClient;
use super::encoding;
use super::topic::{BusMessage, Domain};
use crate::components::{Component, ComponentError};
use crate::metadata::{MemberType, PluginDescriptor, Value};
use crate::observable::Observer;

pub struct ComponentChannel {
    client: BusClient,
}

impl ComponentChannel {
    pub fn new(client: BusClient) -> Self {
        Self { client }
    }

    /// Starts publishing the state of `component` and delivering its actions.
    pub fn add_local(&self, component: Arc<Component>) -> LocalComponentLink {
        let client = self.client.clone();
        let cancel = CancellationToken::new();
        let mut handles = Vec::new();

        for member in component.plugin().members_of(MemberType::State) {
            let Some(item) = component.state_item(&member.name) else {
                continue;
            };

            let topic = client.build_topic(Domain::Components, &[component.id(), &member.name]);
            let observer = item.subscribe(true);
            handles.push(tokio::spawn(publish_state_worker(
                client.clone(),
                component.clone(),
                member.name.clone(),
                topic,
                observer,
                cancel.clone(),
            )));
        }

        let action_topics: Vec<String> = component
            .plugin()
            .members_of(MemberType::Action)
            .map(|member| client.build_topic(Domain::Components, &[component.id(), &member.name]))
            .collect();

        if !action_topics.is_empty() {
            let message_rx = client.on_message();
            handles.push(tokio::spawn(local_action_worker(
                client.instance_name().to_string(),
                component.clone(),
                message_rx,
                cancel.clone(),
            )));

            if let Err(e) = client.subscribe(&action_topics) {
                warn!("Could not subscribe actions of '{}': {}", component.id(), e);
            }
        }

        debug!("Local component '{}' attached to bus", component.id());

        LocalComponentLink {
            client,
            component,
            topics: action_topics,
            cancel,
            handles,
        }
    }

    pub async fn remove_local(&self, link: LocalComponentLink) {
        link.close().await;
    }

    /// Builds a proxy for component `id` hosted by `instance_name`.
    pub fn track_remote(
        &self,
        instance_name: &str,
        id: &str,
        plugin: Arc<PluginDescriptor>,
    ) -> Result<RemoteComponentLink, ComponentError> {
        let client = self.client.clone();
        let remote = instance_name.to_string();
        let component_id = id.to_string();
        let descriptor = plugin.clone();

        let component = Component::builder(id, plugin.clone())
            .on_any_action(move |action, value| {
                let Some(member) = descriptor.member(action) else {
                    return;
                };

                let topic = client.build_remote_topic(&remote, Domain::Components, &[component_id.as_str(), action]);
                match encoding::encode_value(&member.value_type, &value) {
                    Ok(payload) => {
                        if let Err(e) = client.publish(&topic, payload, false) {
                            warn!("Could not emit action '{}': {}", topic, e);
                        }
                    }
                    Err(e) => warn!("Could not encode action '{}': {}", topic, e),
                }
            })
            .build()?;
        let component = Arc::new(component);

        let state_topics: Vec<String> = plugin
            .members_of(MemberType::State)
            .map(|member| {
                self.client
                    .build_remote_topic(instance_name, Domain::Components, &[id, &member.name])
            })
            .collect();

        let cancel = CancellationToken::new();
        let message_rx = self.client.on_message();
        let handle = tokio::spawn(remote_state_worker(
            instance_name.to_string(),
            component.clone(),
            message_rx,
            cancel.clone(),
        ));

        if !state_topics.is_empty() {
            if let Err(e) = self.client.subscribe(&state_topics) {
                warn!("Could not subscribe state of '{}': {}", id, e);
            }
        }

        debug!("Tracking remote component '{}' on '{}'", id, instance_name);

        Ok(RemoteComponentLink {
            client: self.client.clone(),
            component,
            topics: state_topics,
            cancel,
            handle,
        })
    }

    pub async fn untrack_remote(&self, link: RemoteComponentLink) {
        link.close().await;
    }
}

pub struct LocalComponentLink {
    client: BusClient,
    component: Arc<Component>,
    topics: Vec<String>,
    cancel: CancellationToken,
    handles: Vec<JoinHandle<()>>,
}

impl LocalComponentLink {
    pub fn component(&self) -> &Arc<Component> {
        &self.component
    }

    pub async fn close(self) {
        if !self.topics.is_empty() {
            if let Err(e) = self.client.unsubscribe(&self.topics) {
                warn!("Could not unsubscribe actions of '{}': {}", self.component.id(), e);
            }
        }

        self.cancel.cancel();
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Component task failed: {}", e);
            }
        }

        debug!("Local component '{}' detached from bus", self.component.id());
    }
}

pub struct RemoteComponentLink {
    client: BusClient,
    component: Arc<Component>,
    topics: Vec<String>,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

impl RemoteComponentLink {
    pub fn component(&self) -> &Arc<Component> {
        &self.component
    }

    pub async fn close(self) {
        if !self.topics.is_empty() {
            if let Err(e) = self.client.unsubscribe(&self.topics) {
                warn!("Could not unsubscribe state of '{}': {}", self.component.id(), e);
            }
        }

        self.cancel.cancel();
        if let Err(e) = self.handle.await {
            error!("Remote component task failed: {}", e);
        }
    }
}

/// Splits `{componentId}/{member}`.
fn member_path(path: &str) -> Option<(&str, &str)> {
    path.rsplit_once('/')
}

async fn publish_state_worker(
    client: BusClient,
    component: Arc<Component>,
    member: String,
    topic: String,
    mut observer: Observer<Option<Value>>,
    cancel: CancellationToken,
) {
    let Some(value_type) = component
        .plugin()
        .member(&member)
        .map(|member| member.value_type.clone())
    else {
        return;
    };

    loop {
        let value = tokio::select! {
            _ = cancel.cancelled() => break,
            value = observer.recv() => match value {
                Some(Some(value)) => value,
                Some(None) => continue,
                None => break,
            },
        };

        match encoding::encode_value(&value_type, &value) {
            Ok(payload) => {
                if let Err(e) = client.publish(&topic, payload, true) {
                    warn!("Could not publish state '{}': {}", topic, e);
                }
            }
            Err(e) => error!("Could not encode state '{}': {}", topic, e),
        }
    }
}

async fn local_action_worker(
    own_instance: String,
    component: Arc<Component>,
    mut message_rx: Observer<Arc<BusMessage>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = message_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if message.instance_name != own_instance || !message.is_domain(Domain::Components) {
            continue;
        }

        let Some((id, action)) = member_path(&message.path) else {
            continue;
        };
        if id != component.id() {
            continue;
        }

        let Some(member) = component.plugin().member(action) else {
            continue;
        };
        if member.member_type != MemberType::Action {
            continue;
        }

        match encoding::decode_value(&member.value_type, &message.payload) {
            Ok(value) => {
                if let Err(e) = component.execute_action(action, value) {
                    warn!("Could not execute action: {}", e);
                }
            }
            Err(e) => warn!(
                "Dropping undecodable action '{}' on '{}': {}",
                action,
                component.id(),
                e
            ),
        }
    }
}

async fn remote_state_worker(
    instance_name: String,
    component: Arc<Component>,
    mut message_rx: Observer<Arc<BusMessage>>,
    cancel: CancellationToken,
) {
    loop {
        let message = tokio::select! {
            _ = cancel.cancelled() => break,
            message = message_rx.recv() => match message {
                Some(message) => message,
                None => break,
            },
        };

        if message.instance_name != instance_name || !message.is_domain(Domain::Components) {
            continue;
        }

        let Some((id, state)) = member_path(&message.path) else {
            continue;
        };
        if id != component.id() {
            continue;
        }

        let Some(member) = component.plugin().member(state) else {
            continue;
        };
        if member.member_type != MemberType::State || message.payload.is_empty() {
            continue;
        }

        match encoding::decode_value(&member.value_type, &message.payload) {
            Ok(value) => {
                if let Some(item) = component.state_item(state) {
                    item.update(Some(value));
                }
            }
            Err(e) => warn!(
                "Dropping undecodable state '{}' of '{}': {}",
                state,
                component.id(),
                e
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn member_path_splits_on_last_separator() {
        assert_eq!(member_path("lamp/value"), Some(("lamp", "value")));
        assert_eq!(member_path("value"), None);
    }
}
