//! Per-channel runtime state.
//!
//! A channel owns its delivery-tag counter, unacked map, consumer tags and
//! the pending-publish slot used while a multi-frame publish is assembled.
//! The states of the assembly are explicit: no pending slot, slot awaiting
//! the content header, slot accumulating body frames.

use bytes::BytesMut;
use std::collections::BTreeMap;
use std::time::Instant;

use crate::entities::Message;
use crate::protocol::ContentHeader;

pub type ConnectionId = u64;

/// Channel lifecycle. `Closing` means a `Channel.Close` has been sent and
/// the peer's `Close-Ok` is awaited; inbound frames are discarded until then.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelLifecycle {
    Open,
    Closing,
}

/// An in-flight publish being assembled from method, header and body frames.
#[derive(Debug)]
pub struct PendingPublish {
    pub exchange: String,
    pub routing_key: String,
    pub mandatory: bool,
    pub immediate: bool,
    /// Set once the content header frame arrives.
    pub header: Option<ContentHeader>,
    pub body: BytesMut,
}

impl PendingPublish {
    pub fn new(exchange: String, routing_key: String, mandatory: bool, immediate: bool) -> Self {
        Self { exchange, routing_key, mandatory, immediate, header: None, body: BytesMut::new() }
    }
}

/// A delivered-but-unacknowledged message.
#[derive(Debug, Clone)]
pub struct UnackedEntry {
    pub delivery_tag: u64,
    pub message: Message,
    pub queue: String,
    /// Empty for deliveries made through `Basic.Get`.
    pub consumer_tag: String,
    pub delivered_at: Instant,
}

#[derive(Debug)]
pub struct ChannelState {
    pub number: u16,
    pub lifecycle: ChannelLifecycle,
    pub flow_active: bool,
    pub prefetch_size: u32,
    pub prefetch_count: u16,
    pub global_qos: bool,
    /// Last assigned delivery tag; tags start at 1.
    pub delivery_tag: u64,
    pub unacked: BTreeMap<u64, UnackedEntry>,
    pub consumer_tags: Vec<String>,
    pub pending: Option<PendingPublish>,
}

impl ChannelState {
    pub fn new(number: u16) -> Self {
        Self {
            number,
            lifecycle: ChannelLifecycle::Open,
            flow_active: true,
            prefetch_size: 0,
            prefetch_count: 0,
            global_qos: false,
            delivery_tag: 0,
            unacked: BTreeMap::new(),
            consumer_tags: Vec::new(),
            pending: None,
        }
    }

    pub fn next_delivery_tag(&mut self) -> u64 {
        self.delivery_tag += 1;
        self.delivery_tag
    }

    /// Whether another delivery may flow to this channel's consumers.
    pub fn can_deliver(&self) -> bool {
        self.lifecycle == ChannelLifecycle::Open
            && self.flow_active
            && (self.prefetch_count == 0
                || (self.unacked.len() as u32) < u32::from(self.prefetch_count))
    }

    /// Remove one unacked entry, or with `multiple` every entry whose tag is
    /// at or below `delivery_tag`, in tag order.
    pub fn take_unacked(&mut self, delivery_tag: u64, multiple: bool) -> Vec<UnackedEntry> {
        if multiple {
            let tags: Vec<u64> =
                self.unacked.range(..=delivery_tag).map(|(tag, _)| *tag).collect();
            tags.into_iter().filter_map(|tag| self.unacked.remove(&tag)).collect()
        } else {
            self.unacked.remove(&delivery_tag).into_iter().collect()
        }
    }

    /// Remove every unacked entry, in tag order.
    pub fn take_all_unacked(&mut self) -> Vec<UnackedEntry> {
        std::mem::take(&mut self.unacked).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::BasicProperties;
    use bytes::Bytes;

    fn entry(tag: u64) -> UnackedEntry {
        UnackedEntry {
            delivery_tag: tag,
            message: Message::new(
                "".into(),
                "q".into(),
                false,
                false,
                BasicProperties::default(),
                Bytes::new(),
            ),
            queue: "q".into(),
            consumer_tag: "ctag".into(),
            delivered_at: Instant::now(),
        }
    }

    #[test]
    fn test_delivery_tags_increase_from_one() {
        let mut channel = ChannelState::new(1);
        assert_eq!(channel.next_delivery_tag(), 1);
        assert_eq!(channel.next_delivery_tag(), 2);
        assert_eq!(channel.next_delivery_tag(), 3);
    }

    #[test]
    fn test_prefetch_gates_delivery() {
        let mut channel = ChannelState::new(1);
        assert!(channel.can_deliver());

        channel.prefetch_count = 2;
        channel.unacked.insert(1, entry(1));
        assert!(channel.can_deliver());
        channel.unacked.insert(2, entry(2));
        assert!(!channel.can_deliver());

        channel.prefetch_count = 0;
        assert!(channel.can_deliver());
    }

    #[test]
    fn test_flow_and_lifecycle_gate_delivery() {
        let mut channel = ChannelState::new(1);
        channel.flow_active = false;
        assert!(!channel.can_deliver());
        channel.flow_active = true;
        channel.lifecycle = ChannelLifecycle::Closing;
        assert!(!channel.can_deliver());
    }

    #[test]
    fn test_take_unacked_multiple() {
        let mut channel = ChannelState::new(1);
        for tag in 1..=4 {
            channel.unacked.insert(tag, entry(tag));
        }

        let taken = channel.take_unacked(3, true);
        let tags: Vec<u64> = taken.iter().map(|e| e.delivery_tag).collect();
        assert_eq!(tags, vec![1, 2, 3]);
        assert_eq!(channel.unacked.len(), 1);

        let taken = channel.take_unacked(4, false);
        assert_eq!(taken.len(), 1);
        assert!(channel.unacked.is_empty());
    }
}
