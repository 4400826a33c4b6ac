//! Seam between the bus client and the broker connection.
//!
//! A [`Connector`] opens a [`Link`] plus the stream of [`LinkEvent`]s it
//! produces. Link calls never block: they hand the request to the connection
//! and return. The link keeps retrying the connection on its own and reports
//! every transition through the event stream.
//!
//! ```text
//!              publish/subscribe           Connected / Disconnected
//!  BusClient ─────────────────────▶ Link ─────────────────────────▶ BusClient
//!                                    │          Message / Closed
//!                                    ▼
//!                      MqttLink (rumqttc) | MemoryLink (in-process)
//! ```

pub mod memory;
pub mod mqtt;

use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::error::BusResult;

pub use memory::MemoryBroker;
pub use mqtt::MqttConnector;

#[derive(Debug, Clone, PartialEq)]
pub enum LinkEvent {
    Connected,
    Disconnected(String),
    Message {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// The link was shut down on request and will emit nothing more.
    Closed,
}

/// Parameters for opening a link.
#[derive(Debug, Clone)]
pub struct LinkOptions {
    pub client_id: String,
    /// Topic receiving an empty retained payload if the connection is lost.
    pub will_topic: String,
}

pub trait Link: Send + Sync {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> BusResult<()>;
    fn subscribe(&self, topics: &[String]) -> BusResult<()>;
    fn unsubscribe(&self, topics: &[String]) -> BusResult<()>;
    fn disconnect(&self) -> BusResult<()>;
}

pub trait Connector: Send + Sync {
    fn connect(
        &self,
        options: &LinkOptions,
    ) -> BusResult<(Arc<dyn Link>, mpsc::UnboundedReceiver<LinkEvent>)>;
}
