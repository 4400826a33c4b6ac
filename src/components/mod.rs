//! Runtime components and the registry that tracks them.
//!
//! ```text
//! components/
//! ├── component.rs      - component runtime (observable state, action sinks)
//! ├── registry.rs       - catalogue of plugins and components per instance
//! ├── bus_publisher.rs  - local registry entries → bus
//! └── bus_listener.rs   - remote instances on the bus → registry
//! ```

pub mod bus_listener;
pub mod bus_publisher;
pub mod component;
pub mod registry;

pub use bus_listener::BusListener;
pub use bus_publisher::BusPublisher;
pub use component::{ActionHandler, Component, ComponentBuilder, ComponentError, StateValue};
pub use registry::{
    ComponentChange, ComponentData, PluginChange, Registry, RegistryAction, RegistryChange,
    RegistryError, LOCAL_INSTANCE,
};
