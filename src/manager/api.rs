//! Component manager operations exposed as rpc services.
//!
//! | address             | input             | output              |
//! |---------------------|-------------------|---------------------|
//! | `components.add`    | `ComponentConfig` | `{}`                |
//! | `components.remove` | `{id}`            | `{}`                |
//! | `components.list`   | `{}`              | `[ComponentConfig]` |
//! | `bindings.add`      | `BindingConfig`   | `{}`                |
//! | `bindings.remove`   | `BindingConfig`   | `{}`                |
//! | `bindings.list`     | `{}`              | `[BindingConfig]`   |
//!
//! Binding services only exist when the manager supports bindings.

use color_eyre::Report;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::warn;

use super::binding::BindingConfig;
use super::component_manager::{ComponentConfig, ComponentManager, ManagerError};
use crate::bus::Transport;

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Empty {}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentId {
    pub id: String,
}

const COMPONENT_SERVICES: [&str; 3] = ["components.add", "components.remove", "components.list"];
const BINDING_SERVICES: [&str; 3] = ["bindings.add", "bindings.remove", "bindings.list"];

pub struct ManagerApi {
    transport: Arc<Transport>,
    addresses: Vec<&'static str>,
}

impl ManagerApi {
    pub fn new(transport: Arc<Transport>, manager: Arc<ComponentManager>) -> Result<Self, ManagerError> {
        let rpc = transport.rpc();
        let mut addresses = COMPONENT_SERVICES.to_vec();

        let cm = manager.clone();
        rpc.serve("components.add", move |config: ComponentConfig| {
            let cm = cm.clone();
            async move {
                cm.add_component(config)?;
                Ok::<_, Report>(Empty {})
            }
        })?;

        let cm = manager.clone();
        rpc.serve("components.remove", move |input: ComponentId| {
            let cm = cm.clone();
            async move {
                cm.remove_component(&input.id)?;
                Ok::<_, Report>(Empty {})
            }
        })?;

        let cm = manager.clone();
        rpc.serve("components.list", move |_: Empty| {
            let cm = cm.clone();
            async move { Ok::<_, Report>(cm.get_components()) }
        })?;

        transport.instance_info().add_capability("components-api");

        if manager.supports_bindings() {
            let cm = manager.clone();
            rpc.serve("bindings.add", move |config: BindingConfig| {
                let cm = cm.clone();
                async move {
                    cm.add_binding(config)?;
                    Ok::<_, Report>(Empty {})
                }
            })?;

            let cm = manager.clone();
            rpc.serve("bindings.remove", move |config: BindingConfig| {
                let cm = cm.clone();
                async move {
                    cm.remove_binding(&config).await?;
                    Ok::<_, Report>(Empty {})
                }
            })?;

            let cm = manager.clone();
            rpc.serve("bindings.list", move |_: Empty| {
                let cm = cm.clone();
                async move { Ok::<_, Report>(cm.get_bindings()) }
            })?;

            addresses.extend(BINDING_SERVICES);
            transport.instance_info().add_capability("bindings-api");
        }

        Ok(Self {
            transport,
            addresses,
        })
    }

    pub fn terminate(&self) {
        for address in &self.addresses {
            if let Err(e) = self.transport.rpc().unserve(address) {
                warn!("Could not unserve '{}': {}", address, e);
            }
        }
    }
}
