//! Message routing: exchange-type dispatch from a published message to the
//! set of destination queues.
//!
//! Duplicate destinations collapse, so a queue reached through several
//! bindings still receives one copy per publish. Headers exchanges are
//! declarable but never match (headers routing is not implemented).

pub mod topic;

pub use topic::{PatternCache, TopicPattern};

use crate::entities::{Binding, Exchange, ExchangeType};

/// Resolve the destination queues for a message published to `exchange`
/// with `routing_key`.
///
/// The default exchange routes to the queue named by the routing key;
/// `queue_exists` supplies that existence check so the router stays
/// independent of the queue table representation.
pub fn route(
    exchange: &Exchange,
    routing_key: &str,
    bindings: &[Binding],
    patterns: &mut PatternCache,
    queue_exists: impl Fn(&str) -> bool,
) -> Vec<String> {
    let mut destinations: Vec<String> = Vec::new();
    let mut push = |dest: &str| {
        if !destinations.iter().any(|d| d == dest) {
            destinations.push(dest.to_string());
        }
    };

    if exchange.name.is_empty() {
        if queue_exists(routing_key) {
            push(routing_key);
        }
        return destinations;
    }

    for binding in bindings.iter().filter(|b| b.source == exchange.name) {
        let matched = match exchange.kind {
            ExchangeType::Direct => binding.routing_key == routing_key,
            ExchangeType::Fanout => true,
            ExchangeType::Topic => patterns.matches(&binding.routing_key, routing_key),
            ExchangeType::Headers => false,
        };
        if matched {
            push(&binding.destination);
        }
    }
    destinations
}
