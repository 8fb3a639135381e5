//! Broker event stream.
//!
//! Observers subscribe through a tokio broadcast channel. Emission is
//! fire-and-forget: a send with no receivers, or with lagging receivers, is
//! ignored so observers can never backpressure the broker.

use tokio::sync::broadcast;

/// Events published by the broker. Delivery is best-effort.
#[derive(Debug, Clone)]
pub enum BrokerEvent {
    BrokerStarted { host: String, port: u16 },
    BrokerStopped,
    BrokerError { message: String },

    ConnectionOpen { connection_id: u64, peer: String },
    ConnectionClose { connection_id: u64 },
    ConnectionError { connection_id: u64, message: String },

    ChannelOpen { connection_id: u64, channel: u16 },
    ChannelClose { connection_id: u64, channel: u16 },
    ChannelFlow { connection_id: u64, channel: u16, active: bool },

    ExchangeCreated { name: String },
    ExchangeDeleted { name: String },

    QueueCreated { name: String },
    QueueDeleted { name: String },
    QueuePurged { name: String, message_count: u32 },

    BindingCreated { source: String, destination: String, routing_key: String },
    BindingDeleted { source: String, destination: String, routing_key: String },

    ConsumerCreated { consumer_tag: String, queue: String },
    ConsumerCancelled { consumer_tag: String, queue: String },

    MessagePublished { exchange: String, routing_key: String },
    MessageRouted { exchange: String, routing_key: String, queues: Vec<String> },
    MessageDelivered { queue: String, consumer_tag: String },
    MessageAcked { queue: String, delivery_tag: u64 },
    MessageNacked { queue: String, delivery_tag: u64 },
    MessageRejected { queue: String, delivery_tag: u64 },
    MessageReturned { exchange: String, routing_key: String },
    MessageExpired { queue: String },
}

/// Fan-out bus for [`BrokerEvent`].
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<BrokerEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Subscribe to the event stream. Slow subscribers lag and lose events
    /// rather than slowing the broker.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.sender.subscribe()
    }

    /// Emit an event. Never blocks, never fails.
    pub fn emit(&self, event: BrokerEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_subscriber_receives_events() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.emit(BrokerEvent::QueueCreated { name: "q1".into() });

        match rx.recv().await.expect("Failed to receive event") {
            BrokerEvent::QueueCreated { name } => assert_eq!(name, "q1"),
            other => panic!("unexpected event: {:?}", other),
        }
    }

    #[test]
    fn test_emit_without_subscribers_is_a_noop() {
        let bus = EventBus::default();
        bus.emit(BrokerEvent::BrokerStopped);
    }
}
