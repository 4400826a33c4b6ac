//! Home-automation bus middleware.
//!
//! Instances discover each other, replicate component state and call each
//! other over an MQTT broker used as a retained-message transport.
//!
//! ```text
//! src/
//! ├── observable.rs  - observer lists and observable values
//! ├── metadata/      - plugin descriptors, value types, values
//! ├── bus/           - broker link, client, presence, rpc, metadata, components
//! ├── components/    - component runtime, registry, bus publisher/listener
//! ├── manager/       - local components, bindings, node
//! ├── plugins/       - built-in plugins
//! └── config.rs      - node configuration
//! ```

pub mod bus;
pub mod components;
pub mod config;
pub mod manager;
pub mod metadata;
pub mod observable;
pub mod plugins;
