//! In-process broker with retained messages and last will.
//!
//! Used by tests and single-process setups. Delivery is synchronous: a
//! publish reaches every matching session's event queue before it returns.

use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::debug;

use super::{Connector, Link, LinkEvent, LinkOptions};
use crate::bus::error::{BusError, BusResult};
use crate::bus::topic::filter_matches;

struct Session {
    generation: u64,
    events: mpsc::UnboundedSender<LinkEvent>,
    filters: HashSet<String>,
    will_topic: String,
    connected: bool,
}

#[derive(Default)]
struct BrokerState {
    retained: BTreeMap<String, Bytes>,
    sessions: HashMap<String, Session>,
    next_generation: u64,
}

impl BrokerState {
    fn route(&mut self, topic: &str, payload: Bytes, retain: bool) {
        if retain {
            if payload.is_empty() {
                self.retained.remove(topic);
            } else {
                self.retained.insert(topic.to_string(), payload.clone());
            }
        }

        for session in self.sessions.values() {
            if !session.connected {
                continue;
            }

            if session.filters.iter().any(|filter| filter_matches(filter, topic)) {
                let _ = session.events.send(LinkEvent::Message {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                    retain: false,
                });
            }
        }
    }
}

/// Shared broker; clones refer to the same broker.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores a retained message as if some other client had published it.
    pub fn retain(&self, topic: &str, payload: impl Into<Bytes>) {
        self.state.lock().route(topic, payload.into(), true);
    }

    pub fn retained(&self, topic: &str) -> Option<Bytes> {
        self.state.lock().retained.get(topic).cloned()
    }

    pub fn retained_topics(&self) -> Vec<String> {
        self.state.lock().retained.keys().cloned().collect()
    }

    /// Cuts a client's connection without a clean disconnect: the last will
    /// fires and the session loses its subscriptions.
    pub fn drop_connection(&self, client_id: &str) {
        let mut state = self.state.lock();

        let will_topic = match state.sessions.get_mut(client_id) {
            Some(session) if session.connected => {
                session.connected = false;
                session.filters.clear();
                let _ = session
                    .events
                    .send(LinkEvent::Disconnected("connection dropped".to_string()));
                session.will_topic.clone()
            }
            _ => return,
        };

        debug!("Memory broker dropped '{}', firing will", client_id);
        state.route(&will_topic, Bytes::new(), true);
    }

    /// Lets a dropped client reconnect.
    pub fn restore_connection(&self, client_id: &str) {
        let mut state = self.state.lock();
        if let Some(session) = state.sessions.get_mut(client_id) {
            if !session.connected {
                session.connected = true;
                let _ = session.events.send(LinkEvent::Connected);
            }
        }
    }

    pub fn is_connected(&self, client_id: &str) -> bool {
        self.state
            .lock()
            .sessions
            .get(client_id)
            .map(|session| session.connected)
            .unwrap_or(false)
    }
}

impl Connector for MemoryBroker {
    fn connect(
        &self,
        options: &LinkOptions,
    ) -> BusResult<(Arc<dyn Link>, mpsc::UnboundedReceiver<LinkEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock();

        state.next_generation += 1;
        let generation = state.next_generation;

        // session takeover
        if let Some(previous) = state.sessions.remove(&options.client_id) {
            let _ = previous.events.send(LinkEvent::Closed);
        }

        let _ = tx.send(LinkEvent::Connected);
        state.sessions.insert(
            options.client_id.clone(),
            Session {
                generation,
                events: tx,
                filters: HashSet::new(),
                will_topic: options.will_topic.clone(),
                connected: true,
            },
        );

        let link = MemoryLink {
            broker: self.clone(),
            client_id: options.client_id.clone(),
            generation,
        };

        Ok((Arc::new(link), rx))
    }
}

struct MemoryLink {
    broker: MemoryBroker,
    client_id: String,
    generation: u64,
}

impl MemoryLink {
    fn with_session<R>(
        &self,
        f: impl FnOnce(&mut BrokerState) -> BusResult<R>,
    ) -> BusResult<R> {
        let mut state = self.broker.state.lock();
        let live = matches!(
            state.sessions.get(&self.client_id),
            Some(session) if session.generation == self.generation && session.connected
        );
        if !live {
            return Err(BusError::Offline);
        }
        f(&mut *state)
    }
}

impl Link for MemoryLink {
    fn publish(&self, topic: &str, payload: Bytes, retain: bool) -> BusResult<()> {
        self.with_session(|state| {
            state.route(topic, payload, retain);
            Ok(())
        })
    }

    fn subscribe(&self, topics: &[String]) -> BusResult<()> {
        self.with_session(|state| {
            let BrokerState {
                retained, sessions, ..
            } = state;

            let session = sessions
                .get_mut(&self.client_id)
                .ok_or(BusError::Offline)?;

            for filter in topics {
                session.filters.insert(filter.clone());

                for (topic, payload) in retained.iter() {
                    if filter_matches(filter, topic) {
                        let _ = session.events.send(LinkEvent::Message {
                            topic: topic.clone(),
                            payload: payload.clone(),
                            retain: true,
                        });
                    }
                }
            }

            Ok(())
        })
    }

    fn unsubscribe(&self, topics: &[String]) -> BusResult<()> {
        self.with_session(|state| {
            if let Some(session) = state.sessions.get_mut(&self.client_id) {
                for filter in topics {
                    session.filters.remove(filter);
                }
            }
            Ok(())
        })
    }

    fn disconnect(&self) -> BusResult<()> {
        let mut state = self.broker.state.lock();
        let owned = matches!(
            state.sessions.get(&self.client_id),
            Some(session) if session.generation == self.generation
        );
        if !owned {
            return Err(BusError::Offline);
        }

        if let Some(session) = state.sessions.remove(&self.client_id) {
            let _ = session.events.send(LinkEvent::Closed);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(id: &str) -> LinkOptions {
        LinkOptions {
            client_id: id.to_string(),
            will_topic: format!("{}/online", id),
        }
    }

    #[tokio::test]
    async fn retained_messages_reach_late_subscribers() {
        let broker = MemoryBroker::new();
        let (link, mut events) = broker.connect(&options("a")).unwrap();
        assert_eq!(events.recv().await, Some(LinkEvent::Connected));

        link.publish("b/metadata/x", Bytes::from_static(b"1"), true).unwrap();
        link.subscribe(&["b/#".to_string()]).unwrap();

        assert_eq!(
            events.recv().await,
            Some(LinkEvent::Message {
                topic: "b/metadata/x".to_string(),
                payload: Bytes::from_static(b"1"),
                retain: true,
            })
        );
    }

    #[tokio::test]
    async fn empty_retained_deletes() {
        let broker = MemoryBroker::new();
        broker.retain("b/online", vec![1u8]);
        assert!(broker.retained("b/online").is_some());

        broker.retain("b/online", Bytes::new());
        assert!(broker.retained("b/online").is_none());
    }

    #[tokio::test]
    async fn dropped_connection_fires_will() {
        let broker = MemoryBroker::new();
        let (a, _a_events) = broker.connect(&options("a")).unwrap();
        let (b, mut b_events) = broker.connect(&options("b")).unwrap();
        assert_eq!(b_events.recv().await, Some(LinkEvent::Connected));

        a.publish("a/online", Bytes::from_static(&[1]), true).unwrap();
        b.subscribe(&["+/online".to_string()]).unwrap();
        assert!(matches!(b_events.recv().await, Some(LinkEvent::Message { retain: true, .. })));

        broker.drop_connection("a");
        assert!(broker.retained("a/online").is_none());
        assert_eq!(
            b_events.recv().await,
            Some(LinkEvent::Message {
                topic: "a/online".to_string(),
                payload: Bytes::new(),
                retain: false,
            })
        );
        assert!(a.publish("a/x", Bytes::new(), false).is_err());
    }
}
