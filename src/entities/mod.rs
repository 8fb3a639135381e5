//! Broker entity records: exchanges, queues, bindings, consumers, messages.
//!
//! These are the data carried by the broker's global tables. Runtime state
//! (queue buffers, unacked maps, channel counters) lives in the broker
//! module; the records here are what the snapshot files persist.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::protocol::{BasicProperties, FieldTable};

/// Queue names generated for empty-name declares.
pub const GENERATED_QUEUE_PREFIX: &str = "amq.gen-";
/// The reserved namespace for server-owned entities.
pub const RESERVED_PREFIX: &str = "amq.";

/// Exchange types. Headers is accepted at declare time but never routes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeType {
    Direct,
    Fanout,
    Topic,
    Headers,
}

impl ExchangeType {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "direct" => Some(ExchangeType::Direct),
            "fanout" => Some(ExchangeType::Fanout),
            "topic" => Some(ExchangeType::Topic),
            "headers" => Some(ExchangeType::Headers),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ExchangeType::Direct => "direct",
            ExchangeType::Fanout => "fanout",
            ExchangeType::Topic => "topic",
            ExchangeType::Headers => "headers",
        }
    }
}

/// An exchange. The empty name denotes the default exchange.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Exchange {
    pub name: String,
    pub kind: ExchangeType,
    pub durable: bool,
    pub auto_delete: bool,
    pub internal: bool,
    #[serde(default)]
    pub arguments: FieldTable,
    #[serde(default)]
    pub is_default: bool,
}

impl Exchange {
    /// The built-in exchange set merged in after recovery: the default
    /// nameless direct exchange plus one reserved exchange per type.
    pub fn defaults() -> Vec<Exchange> {
        let builtin = |name: &str, kind| Exchange {
            name: name.to_string(),
            kind,
            durable: true,
            auto_delete: false,
            internal: false,
            arguments: FieldTable::new(),
            is_default: true,
        };
        vec![
            builtin("", ExchangeType::Direct),
            builtin("amq.direct", ExchangeType::Direct),
            builtin("amq.fanout", ExchangeType::Fanout),
            builtin("amq.topic", ExchangeType::Topic),
            builtin("amq.headers", ExchangeType::Headers),
        ]
    }
}

/// A queue record. `exclusive_connection` is set iff `exclusive`, naming the
/// connection allowed to touch the queue.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Queue {
    pub name: String,
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    #[serde(default)]
    pub arguments: FieldTable,
    #[serde(default)]
    pub exclusive_connection: Option<u64>,
}

impl Queue {
    /// Generate a server-assigned queue name.
    pub fn generated_name() -> String {
        format!("{}{}", GENERATED_QUEUE_PREFIX, Uuid::new_v4())
    }
}

/// A binding from an exchange to a queue. `(source, destination,
/// routing_key)` identifies the binding; arguments are carried but only the
/// headers exchange would consult them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Binding {
    pub source: String,
    pub destination: String,
    pub routing_key: String,
    #[serde(default)]
    pub arguments: FieldTable,
}

impl Binding {
    pub fn matches_key(&self, source: &str, destination: &str, routing_key: &str) -> bool {
        self.source == source && self.destination == destination && self.routing_key == routing_key
    }
}

/// A consumer subscription, owned by a channel and referenced by id.
#[derive(Debug, Clone, PartialEq)]
pub struct Consumer {
    pub tag: String,
    pub queue: String,
    pub connection_id: u64,
    pub channel: u16,
    pub no_local: bool,
    pub no_ack: bool,
    pub exclusive: bool,
    pub arguments: FieldTable,
}

impl Consumer {
    /// Generate a server-assigned consumer tag.
    pub fn generated_tag(connection_id: u64, channel: u16, seq: u64) -> String {
        format!("amq.ctag-{}-{}-{}", connection_id, channel, seq)
    }
}

/// A published message as it travels from router to queues to consumers.
/// `content` is `Bytes`, so fanning a message out to several queues clones
/// cheaply.
#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub id: String,
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    pub properties: BasicProperties,
    pub content: Bytes,
    pub timestamp: u64,
    pub redelivered: bool,
    /// The connection that published the message; consulted by no-local
    /// consumers. Transient, absent after recovery.
    pub publisher: Option<u64>,
}

impl Message {
    /// Build a message at publish time. The id defaults to
    /// `properties.message_id` when the publisher supplied one.
    pub fn new(
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
        properties: BasicProperties,
        content: Bytes,
    ) -> Self {
        let id = properties
            .message_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self {
            id,
            exchange,
            routing_key,
            mandatory,
            immediate,
            properties,
            content,
            timestamp: unix_time_millis(),
            redelivered: false,
            publisher: None,
        }
    }

    /// Whether this message qualifies for the durable log when routed to a
    /// durable queue.
    pub fn is_persistent(&self) -> bool {
        self.properties.is_persistent()
    }
}

/// Milliseconds since the unix epoch.
pub fn unix_time_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exchange_type_parse() {
        assert_eq!(ExchangeType::parse("direct"), Some(ExchangeType::Direct));
        assert_eq!(ExchangeType::parse("fanout"), Some(ExchangeType::Fanout));
        assert_eq!(ExchangeType::parse("topic"), Some(ExchangeType::Topic));
        assert_eq!(ExchangeType::parse("headers"), Some(ExchangeType::Headers));
        assert_eq!(ExchangeType::parse("x-custom"), None);
        assert_eq!(ExchangeType::Topic.as_str(), "topic");
    }

    #[test]
    fn test_default_exchange_set() {
        let defaults = Exchange::defaults();
        assert_eq!(defaults.len(), 5);
        assert!(defaults.iter().all(|e| e.durable && e.is_default));
        assert!(defaults.iter().any(|e| e.name.is_empty()));
        assert!(defaults.iter().any(|e| e.name == "amq.topic"));
    }

    #[test]
    fn test_generated_names() {
        let q = Queue::generated_name();
        assert!(q.starts_with(GENERATED_QUEUE_PREFIX));
        assert_ne!(Queue::generated_name(), q);

        assert_eq!(Consumer::generated_tag(3, 1, 7), "amq.ctag-3-1-7");
    }

    #[test]
    fn test_message_id_defaults_to_property() {
        let mut props = BasicProperties::default();
        props.message_id = Some("client-id".into());
        let msg = Message::new("".into(), "q".into(), false, false, props, Bytes::new());
        assert_eq!(msg.id, "client-id");

        let msg =
            Message::new("".into(), "q".into(), false, false, BasicProperties::default(), Bytes::new());
        assert_eq!(msg.id.len(), 36); // uuid v4
    }
}
