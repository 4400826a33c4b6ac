use bytes::Bytes;
use std::fmt;
use std::str::FromStr;

use super::error::BusError;

/// First path segment after the instance name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Domain {
    Online,
    Rpc,
    Metadata,
    Components,
    Logger,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Online => "online",
            Domain::Rpc => "rpc",
            Domain::Metadata => "metadata",
            Domain::Components => "components",
            Domain::Logger => "logger",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Domain {
    type Err = BusError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "online" => Ok(Domain::Online),
            "rpc" => Ok(Domain::Rpc),
            "metadata" => Ok(Domain::Metadata),
            "components" => Ok(Domain::Components),
            "logger" => Ok(Domain::Logger),
            other => Err(BusError::MalformedTopic(format!("unknown domain '{}'", other))),
        }
    }
}

/// `instance/domain/args...`
pub fn build_topic(instance_name: &str, domain: Domain, args: &[&str]) -> String {
    let mut topic = format!("{}/{}", instance_name, domain);
    for arg in args {
        topic.push('/');
        topic.push_str(arg);
    }
    topic
}

/// Inbound message decomposed along the topic layout.
#[derive(Debug, Clone, PartialEq)]
pub struct BusMessage {
    pub instance_name: String,
    pub domain: String,
    pub path: String,
    pub payload: Bytes,
    pub retained: bool,
}

impl BusMessage {
    pub fn parse(topic: &str, payload: Bytes, retained: bool) -> Self {
        let mut parts = topic.splitn(3, '/');
        let instance_name = parts.next().unwrap_or_default().to_string();
        let domain = parts.next().unwrap_or_default().to_string();
        let path = parts.next().unwrap_or_default().to_string();

        Self {
            instance_name,
            domain,
            path,
            payload,
            retained,
        }
    }

    pub fn is_domain(&self, domain: Domain) -> bool {
        self.domain == domain.as_str()
    }

    pub fn topic(&self) -> String {
        match (self.domain.is_empty(), self.path.is_empty()) {
            (true, _) => self.instance_name.clone(),
            (false, true) => format!("{}/{}", self.instance_name, self.domain),
            (false, false) => format!("{}/{}/{}", self.instance_name, self.domain, self.path),
        }
    }
}

/// MQTT filter matching (`+` single level, `#` trailing multi level).
pub fn filter_matches(filter: &str, topic: &str) -> bool {
    let mut filter_levels = filter.split('/');
    let mut topic_levels = topic.split('/');

    loop {
        match (filter_levels.next(), topic_levels.next()) {
            (Some("#"), _) => return true,
            (Some("+"), Some(_)) => {}
            (Some(expected), Some(actual)) if expected == actual => {}
            (None, None) => return true,
            _ => return false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builds_topics() {
        assert_eq!(build_topic("core", Domain::Online, &[]), "core/online");
        assert_eq!(
            build_topic("core", Domain::Rpc, &["services", "ping"]),
            "core/rpc/services/ping"
        );
    }

    #[test]
    fn parses_into_three_parts() {
        let message = BusMessage::parse("core/components/lamp/value", Bytes::new(), true);
        assert_eq!(message.instance_name, "core");
        assert_eq!(message.domain, "components");
        assert_eq!(message.path, "lamp/value");
        assert!(message.retained);
        assert!(message.is_domain(Domain::Components));
        assert_eq!(message.topic(), "core/components/lamp/value");
    }

    #[test]
    fn missing_parts_are_empty() {
        let message = BusMessage::parse("core/online", Bytes::new(), false);
        assert_eq!(message.domain, "online");
        assert_eq!(message.path, "");

        let message = BusMessage::parse("lonely", Bytes::new(), false);
        assert_eq!(message.instance_name, "lonely");
        assert_eq!(message.domain, "");
    }

    #[test]
    fn filters() {
        assert!(filter_matches("+/online", "core/online"));
        assert!(!filter_matches("+/online", "core/online/x"));
        assert!(filter_matches("core/#", "core/metadata/plugins/a.b"));
        assert!(filter_matches("core/#", "core"));
        assert!(!filter_matches("core/#", "other/online"));
        assert!(filter_matches("a/b", "a/b"));
        assert!(!filter_matches("a/b", "a/c"));
    }

    #[test]
    fn domain_round_trip() {
        assert_eq!("metadata".parse::<Domain>().unwrap(), Domain::Metadata);
        assert!("bogus".parse::<Domain>().is_err());
    }
}
