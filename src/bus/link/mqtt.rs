//! Broker connection over `rumqttc`.
//!
//! The event loop runs in its own task. Connection errors are reported once as
//! [`LinkEvent::Disconnected`]; polling then resumes after the reconnect
//! interval, which makes `rumqttc` reconnect.

use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, Event, EventLoop, LastWill, MqttOptions, Outgoing, Packet,
    QoS, SubscribeFilter,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::{Connector, Link, LinkEvent, LinkOptions};
use crate::bus::error::{BusError, BusResult};

const REQUEST_CAPACITY: usize = 1000;

#[derive(Debug, Clone)]
pub struct MqttConnector {
    pub server_url: String,
    pub keep_alive: Duration,
    pub reconnect_interval: Duration,
}

impl MqttConnector {
    pub fn new(server_url: &str, keep_alive: Duration, reconnect_interval: Duration) -> Self {
        Self {
            server_url: server_url.to_string(),
            keep_alive,
            reconnect_interval,
        }
    }

    /// Accepts `mqtt://host:port`, `tcp://host:port` or `host[:port]`.
    fn server_address(&self) -> BusResult<(String, u16)> {
        let address = self
            .server_url
            .split_once("://")
            .map(|(_, rest)| rest)
            .unwrap_or(&self.server_url);
        let address = address.trim_end_matches('/');

        let server_comps: Vec<&str> = address.split(':').collect();
        let host = server_comps
            .first()
            .filter(|host| !host.is_empty())
            .ok_or_else(|| BusError::LinkError(format!("Invalid server url '{}'", self.server_url)))?;

        let port = match server_comps.get(1) {
            Some(port) => port.parse().map_err(|_| {
                BusError::LinkError(format!("Invalid port in server url '{}'", self.server_url))
            })?,
            None => 1883,
        };

        Ok((host.to_string(), port))
    }
}

impl Connector for MqttConnector {
    fn connect(
        &self,
        options: &LinkOptions,
    ) -> BusResult<(Arc<dyn Link>, mpsc::UnboundedReceiver<LinkEvent>)> {
        let (host, port) = self.server_address()?;
        info!("Connecting to mqtt broker {}:{} as '{}'", host, port, options.client_id);

        let mut mqtt_options = MqttOptions::new(options.client_id.clone(), host, port);
        mqtt_options
            .set_keep_alive(self.keep_alive)
            .set_clean_session(true)
            .set_last_will(LastWill::new(
                options.will_topic.clone(),
                Vec::<u8>::new(),
                QoS::AtMostOnce,
                true,
            ));

        let (client, eventloop) = AsyncClient::new(mqtt_options, REQUEST_CAPACITY);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();

        tokio::spawn(run_event_loop(
            eventloop,
            events_tx,
            cancel.clone(),
            self.reconnect_interval,
        ));

        let link = MqttLink { client, cancel };
        Ok((Arc::new(link), events_rx))
    }
}

async fn run_event_loop(
    mut eventloop: EventLoop,
    events: mpsc::UnboundedSender<LinkEvent>,
    cancel: CancellationToken,
    reconnect_interval: Duration,
) {
    let mut connected = false;

    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = eventloop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                if ack.code == ConnectReturnCode::Success {
                    debug!("Mqtt connection established");
                    connected = true;
                    let _ = events.send(LinkEvent::Connected);
                } else {
                    warn!("Mqtt connection refused: {:?}", ack.code);
                }
            }
            Ok(Event::Incoming(Packet::Publish(publish))) => {
                let _ = events.send(LinkEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                    retain: publish.retain,
                });
            }
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                debug!("Mqtt disconnect sent");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                if connected {
                    connected = false;
                    let _ = events.send(LinkEvent::Disconnected(e.to_string()));
                }
                error!("Mqtt connection error: {}", e);

                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_interval) => {}
                }
            }
        }
    }

    let _ = events.send(LinkEvent::Closed);
    debug!("Mqtt event loop terminated");
}

struct MqttLink {
    client: AsyncClient,
    cancel: CancellationToken,
}

impl Link for MqttLink {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> BusResult<()> {
        self.client
            .try_publish(topic, QoS::AtMostOnce, retain, payload.to_vec())
            .map_err(|e| BusError::LinkError(e.to_string()))
    }

    fn subscribe(&self, topics: &[String]) -> BusResult<()> {
        if topics.is_empty() {
            return Ok(());
        }

        let filters: Vec<SubscribeFilter> = topics
            .iter()
            .map(|topic| SubscribeFilter::new(topic.clone(), QoS::AtMostOnce))
            .collect();

        self.client
            .try_subscribe_many(filters)
            .map_err(|e| BusError::LinkError(e.to_string()))
    }

    fn unsubscribe(&self, topics: &[String]) -> BusResult<()> {
        for topic in topics {
            self.client
                .try_unsubscribe(topic.clone())
                .map_err(|e| BusError::LinkError(e.to_string()))?;
        }
        Ok(())
    }

    fn disconnect(&self) -> BusResult<()> {
        if let Err(e) = self.client.try_disconnect() {
            // request queue closed or full: stop polling directly
            warn!("Could not request mqtt disconnect: {}", e);
            self.cancel.cancel();
        }
        Ok(())
    }
}

impl Drop for MqttLink {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
