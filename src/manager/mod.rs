//! Local component hosting and bindings.
//!
//! A [`Node`] is one running instance:
//!
//! ```text
//!            ┌──────────── Node ─────────────┐
//!            │  ComponentManager ─► Registry │
//!            │  Binding* ◄──────── Registry  │
//!  Bus ◄─────┼─ BusPublisher ◄──── Registry  │
//!  Bus ──────┼► BusListener ─────► Registry  │
//!  Bus ◄────►┼─ ManagerApi (rpc)             │
//!            └───────────────────────────────┘
//! ```
//!
//! Shutdown runs bindings, listener, publisher, manager, then the transport.

pub mod api;
pub mod binding;
pub mod component_manager;

pub use api::ManagerApi;
pub use binding::{Binding, BindingConfig};
pub use component_manager::{ComponentConfig, ComponentManager, ManagerError};

use std::sync::Arc;
use tracing::info;

use crate::bus::{Connector, LogQueue, Transport, TransportOptions};
use crate::components::{BusListener, BusPublisher, Registry};
use crate::plugins::PluginCatalog;

pub struct Node {
    transport: Arc<Transport>,
    registry: Arc<Registry>,
    manager: Arc<ComponentManager>,
    api: ManagerApi,
    publisher: BusPublisher,
    listener: Option<BusListener>,
}

impl Node {
    /// Bindings (and the listener feeding them remote components) are enabled
    /// iff presence tracking is.
    pub fn new(
        options: TransportOptions,
        connector: &dyn Connector,
        log_queue: Option<LogQueue>,
        catalog: PluginCatalog,
    ) -> Result<Self, ManagerError> {
        let supports_bindings = options.presence_tracking;
        let modules = catalog.modules();

        let registry = Arc::new(Registry::new());
        let manager = Arc::new(ComponentManager::new(
            registry.clone(),
            Arc::new(catalog),
            supports_bindings,
        )?);

        let transport = Arc::new(Transport::new(options, connector, log_queue)?);
        for (module, version) in modules {
            transport
                .instance_info()
                .add_component_version(&format!("core-plugins-{}", module), &version);
        }

        transport.instance_info().add_capability("components-manager");
        if supports_bindings {
            transport.instance_info().add_capability("bindings-manager");
        }

        let api = ManagerApi::new(transport.clone(), manager.clone())?;
        let publisher = BusPublisher::new(transport.clone(), registry.clone());
        let listener = if supports_bindings {
            Some(BusListener::new(transport.clone(), registry.clone())?)
        } else {
            None
        };

        info!("Node '{}' started", transport.instance_name());

        Ok(Self {
            transport,
            registry,
            manager,
            api,
            publisher,
            listener,
        })
    }

    pub fn transport(&self) -> &Arc<Transport> {
        &self.transport
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.registry
    }

    pub fn manager(&self) -> &Arc<ComponentManager> {
        &self.manager
    }

    pub async fn terminate(&self) {
        self.manager.terminate_bindings().await;

        if let Some(listener) = &self.listener {
            listener.terminate().await;
        }

        self.publisher.terminate().await;
        self.api.terminate();
        self.manager.terminate().await;
        self.transport.terminate().await;

        info!("Node terminated");
    }
}
