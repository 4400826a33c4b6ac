//! Static description of plugins and components.
//!
//! ```text
//! metadata/
//! ├── types.rs   - member value types and their textual grammar
//! ├── value.rs   - runtime values carried by state and actions
//! └── plugin.rs  - plugin and component descriptors
//! ```

pub mod plugin;
pub mod types;
pub mod value;

pub use plugin::{
    ComponentDescriptor, ConfigItem, ConfigType, Member, MemberType, PluginDescriptor, PluginUsage,
};
pub use types::{TypeParseError, ValueType};
pub use value::Value;
