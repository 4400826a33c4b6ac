//! Bus transport: everything that goes over the broker.
//!
//! Topics are laid out as `{instance}/{domain}/{path...}`:
//!
//! ```text
//! {instance}/online                              retained presence flag
//! {instance}/metadata/{path}                     retained JSON entries
//! {instance}/components/{componentId}/{member}   state (retained) / actions
//! {instance}/rpc/services/{address}              rpc requests
//! {instance}/rpc/replies/{token}                 rpc replies
//! {instance}/logger                              log records
//! ```
//!
//! ```text
//! bus/
//! ├── topic.rs          - topic building, parsing and filter matching
//! ├── encoding.rs       - binary value codec
//! ├── link/             - broker connection (rumqttc or in-memory)
//! ├── client.rs         - connection lifecycle and message fan-out
//! ├── presence.rs       - online remote instances
//! ├── rpc.rs            - request/reply over pub/sub
//! ├── metadata.rs       - replicated key/value entries
//! ├── components.rs     - component state/action replication
//! ├── logger.rs         - log record forwarding
//! ├── instance_info.rs  - `instance-info` entry
//! └── transport.rs      - all of the above on one client
//! ```

pub mod client;
pub mod components;
pub mod encoding;
pub mod error;
pub mod instance_info;
pub mod link;
pub mod logger;
pub mod metadata;
pub mod presence;
pub mod rpc;
pub mod topic;
pub mod transport;

pub use client::{BusClient, ClientOptions};
pub use error::{BusError, BusResult, EncodingError, MetadataError, RpcError};
pub use link::{Connector, Link, LinkEvent, LinkOptions, MemoryBroker, MqttConnector};
pub use logger::{BusLogLayer, LogQueue};
pub use topic::{BusMessage, Domain};
pub use transport::{Transport, TransportOptions};
