//! The basic class: publish assembly, routing, consumer dispatch and
//! acknowledgement tracking.
//!
//! Dispatch offers each ready message to the queue's consumers in a fair
//! rotation. A consumer is eligible when its channel is open, flow is
//! active, and the prefetch window has room. Requeues go to the head of the
//! original queue with the redelivered flag set.

use std::collections::VecDeque;
use std::time::Instant;
use tracing::{debug, warn};

use crate::broker::channel::{
    ChannelLifecycle, ConnectionId, PendingPublish, UnackedEntry,
};
use crate::entities::{Consumer, Message, Queue};
use crate::events::BrokerEvent;
use crate::protocol::frame::FRAME_OVERHEAD;
use crate::protocol::{
    AmqpException, ContentHeader, FieldTable, Frame, Method, ACCESS_REFUSED, CHANNEL_ERROR,
    NOT_FOUND, NO_ROUTE, PRECONDITION_FAILED, UNEXPECTED_FRAME,
};

use super::handler::BrokerCore;

/// A queue's runtime state: the record, its message buffer, and its
/// consumers in insertion order. `next_consumer` rotates dispatch so no
/// eligible consumer is starved.
#[derive(Debug)]
pub struct QueueState {
    pub meta: Queue,
    pub messages: VecDeque<Message>,
    pub consumers: Vec<String>,
    pub next_consumer: usize,
    /// Once true, dropping to zero consumers deletes an auto-delete queue.
    pub had_consumers: bool,
}

impl QueueState {
    pub fn new(meta: Queue) -> Self {
        Self {
            meta,
            messages: VecDeque::new(),
            consumers: Vec::new(),
            next_consumer: 0,
            had_consumers: false,
        }
    }

    pub fn message_count(&self) -> u32 {
        self.messages.len() as u32
    }

    pub fn consumer_count(&self) -> u32 {
        self.consumers.len() as u32
    }
}

/// Content header plus body frames for a message, split so every body
/// payload fits the connection's negotiated frame-max.
pub(super) fn content_frames(channel: u16, message: &Message, frame_max: u32) -> Vec<Frame> {
    let mut frames = Vec::with_capacity(2);
    frames.push(Frame::Header {
        channel,
        header: ContentHeader::new(message.content.len() as u64, message.properties.clone()),
    });
    let max_payload = (frame_max as usize).saturating_sub(FRAME_OVERHEAD).max(1);
    let mut offset = 0;
    while offset < message.content.len() {
        let end = (offset + max_payload).min(message.content.len());
        frames.push(Frame::Body { channel, payload: message.content.slice(offset..end) });
        offset = end;
    }
    frames
}

impl BrokerCore {
    // ------------------------------------------------------ publish assembly

    pub(super) fn basic_publish(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;
        match self.exchanges.get(&exchange) {
            None => {
                return Err(AmqpException::channel(
                    NOT_FOUND,
                    format!("no exchange '{}'", exchange),
                ))
            }
            Some(e) if e.internal => {
                return Err(AmqpException::channel(
                    ACCESS_REFUSED,
                    format!("exchange '{}' is internal", exchange),
                ))
            }
            Some(_) => {}
        }
        let chan = self.channel_mut(conn, channel)?;
        chan.pending = Some(PendingPublish::new(exchange, routing_key, mandatory, immediate));
        Ok(())
    }

    pub(super) fn handle_header(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        header: ContentHeader,
    ) -> Result<(), AmqpException> {
        {
            let Some(chan) = self.channel_mut_opt(conn, channel) else {
                return Err(AmqpException::connection(
                    CHANNEL_ERROR,
                    format!("content header on unopened channel {}", channel),
                ));
            };
            if chan.lifecycle == ChannelLifecycle::Closing {
                return Ok(());
            }
            let Some(pending) = chan.pending.as_mut() else {
                return Err(AmqpException::channel(
                    UNEXPECTED_FRAME,
                    "content header without a preceding publish",
                ));
            };
            if pending.header.is_some() {
                return Err(AmqpException::channel(
                    UNEXPECTED_FRAME,
                    "unexpected second content header",
                ));
            }
            let body_size = header.body_size;
            pending.header = Some(header);
            if body_size > 0 {
                return Ok(());
            }
        }
        self.finish_pending(conn, channel)
    }

    pub(super) fn handle_body(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        payload: bytes::Bytes,
    ) -> Result<(), AmqpException> {
        {
            let Some(chan) = self.channel_mut_opt(conn, channel) else {
                return Err(AmqpException::connection(
                    CHANNEL_ERROR,
                    format!("content body on unopened channel {}", channel),
                ));
            };
            if chan.lifecycle == ChannelLifecycle::Closing {
                return Ok(());
            }
            let Some(pending) = chan.pending.as_mut() else {
                return Err(AmqpException::channel(
                    UNEXPECTED_FRAME,
                    "content body without a preceding publish",
                ));
            };
            let Some(header) = pending.header.as_ref() else {
                return Err(AmqpException::channel(
                    UNEXPECTED_FRAME,
                    "content body before content header",
                ));
            };
            let expected = header.body_size;
            pending.body.extend_from_slice(&payload);
            let accumulated = pending.body.len() as u64;
            if accumulated > expected {
                return Err(AmqpException::channel(
                    UNEXPECTED_FRAME,
                    format!("content body overran declared size {}", expected),
                ));
            }
            if accumulated < expected {
                return Ok(());
            }
        }
        self.finish_pending(conn, channel)
    }

    fn finish_pending(&mut self, conn: ConnectionId, channel: u16) -> Result<(), AmqpException> {
        let Some(pending) = self.channel_mut_opt(conn, channel).and_then(|c| c.pending.take())
        else {
            return Ok(());
        };
        let PendingPublish { exchange, routing_key, mandatory, immediate, header, body } = pending;
        let Some(header) = header else {
            return Ok(());
        };
        let mut message = Message::new(
            exchange,
            routing_key,
            mandatory,
            immediate,
            header.properties,
            body.freeze(),
        );
        message.publisher = Some(conn);
        self.events.emit(BrokerEvent::MessagePublished {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
        });
        self.route_message(conn, channel, message)
    }

    /// Route a completed publish to its destination queues, returning it to
    /// the publisher when mandatory and unroutable.
    fn route_message(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        message: Message,
    ) -> Result<(), AmqpException> {
        let destinations = {
            let Some(exchange) = self.exchanges.get(&message.exchange) else {
                return Err(AmqpException::channel(
                    NOT_FOUND,
                    format!("no exchange '{}'", message.exchange),
                ));
            };
            let queues = &self.queues;
            crate::routing::route(
                exchange,
                &message.routing_key,
                &self.bindings,
                &mut self.patterns,
                |name| queues.contains_key(name),
            )
        };

        if destinations.is_empty() {
            if message.mandatory {
                debug!(
                    "returning unroutable mandatory message for exchange '{}' key '{}'",
                    message.exchange, message.routing_key
                );
                let frame_max = self
                    .connections
                    .get(&conn)
                    .map(|h| h.frame_max)
                    .unwrap_or(self.config.frame_max);
                self.send(
                    conn,
                    Frame::method(
                        channel,
                        Method::BasicReturn {
                            reply_code: NO_ROUTE,
                            reply_text: "No route".into(),
                            exchange: message.exchange.clone(),
                            routing_key: message.routing_key.clone(),
                        },
                    ),
                );
                for frame in content_frames(channel, &message, frame_max) {
                    self.send(conn, frame);
                }
                self.events.emit(BrokerEvent::MessageReturned {
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                });
            }
            return Ok(());
        }

        self.events.emit(BrokerEvent::MessageRouted {
            exchange: message.exchange.clone(),
            routing_key: message.routing_key.clone(),
            queues: destinations.clone(),
        });

        for destination in &destinations {
            let durable =
                self.queues.get(destination).map(|q| q.meta.durable).unwrap_or(false);
            if durable && message.is_persistent() {
                self.persist_message(destination, &message)?;
            }
            if let Some(queue) = self.queues.get_mut(destination) {
                queue.messages.push_back(message.clone());
            }
            self.dispatch_queue(destination);
        }
        Ok(())
    }

    // -------------------------------------------------------------- dispatch

    /// Drain a queue into its eligible consumers until either runs out.
    pub(super) fn dispatch_queue(&mut self, queue_name: &str) {
        loop {
            let head_publisher = match self.queues.get(queue_name).and_then(|q| q.messages.front())
            {
                Some(message) => message.publisher,
                None => return,
            };
            let Some((index, tag, consumer_conn, consumer_channel, no_ack)) =
                self.pick_consumer(queue_name, head_publisher)
            else {
                return;
            };

            let (message, durable) = {
                let Some(queue) = self.queues.get_mut(queue_name) else { return };
                queue.next_consumer = (index + 1) % queue.consumers.len().max(1);
                match queue.messages.pop_front() {
                    Some(message) => (message, queue.meta.durable),
                    None => return,
                }
            };
            self.deliver(queue_name, message, durable, tag, consumer_conn, consumer_channel, no_ack);
        }
    }

    /// Find the next eligible consumer in rotation order. `publisher` is the
    /// head message's publishing connection, consulted for no-local
    /// consumers.
    fn pick_consumer(
        &self,
        queue_name: &str,
        publisher: Option<ConnectionId>,
    ) -> Option<(usize, String, ConnectionId, u16, bool)> {
        let queue = self.queues.get(queue_name)?;
        let count = queue.consumers.len();
        for i in 0..count {
            let index = (queue.next_consumer + i) % count;
            let tag = &queue.consumers[index];
            let Some(consumer) = self.consumers.get(tag) else { continue };
            if consumer.no_local && publisher == Some(consumer.connection_id) {
                continue;
            }
            let Some(chan) = self.channel(consumer.connection_id, consumer.channel) else {
                continue;
            };
            if chan.can_deliver() {
                return Some((
                    index,
                    tag.clone(),
                    consumer.connection_id,
                    consumer.channel,
                    consumer.no_ack,
                ));
            }
        }
        None
    }

    #[allow(clippy::too_many_arguments)]
    fn deliver(
        &mut self,
        queue_name: &str,
        message: Message,
        durable: bool,
        consumer_tag: String,
        conn: ConnectionId,
        channel: u16,
        no_ack: bool,
    ) {
        let frame_max =
            self.connections.get(&conn).map(|h| h.frame_max).unwrap_or(self.config.frame_max);
        let delivery_tag = match self.channel_mut_opt(conn, channel) {
            Some(chan) => chan.next_delivery_tag(),
            None => {
                // The consumer's channel vanished between pick and deliver.
                if let Some(queue) = self.queues.get_mut(queue_name) {
                    queue.messages.push_front(message);
                }
                return;
            }
        };

        self.send(
            conn,
            Frame::method(
                channel,
                Method::BasicDeliver {
                    consumer_tag: consumer_tag.clone(),
                    delivery_tag,
                    redelivered: message.redelivered,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                },
            ),
        );
        for frame in content_frames(channel, &message, frame_max) {
            self.send(conn, frame);
        }
        self.events.emit(BrokerEvent::MessageDelivered {
            queue: queue_name.to_string(),
            consumer_tag: consumer_tag.clone(),
        });

        if no_ack {
            if durable && message.is_persistent() {
                self.persist_delete_logged(queue_name, &message.id);
            }
        } else if let Some(chan) = self.channel_mut_opt(conn, channel) {
            chan.unacked.insert(
                delivery_tag,
                UnackedEntry {
                    delivery_tag,
                    message,
                    queue: queue_name.to_string(),
                    consumer_tag,
                    delivered_at: Instant::now(),
                },
            );
        }
    }

    // ------------------------------------------------------------- consumers

    #[allow(clippy::too_many_arguments)]
    pub(super) fn basic_consume(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;
        let Some(state) = self.queues.get(&queue) else {
            return Err(AmqpException::channel(NOT_FOUND, format!("no queue '{}'", queue)));
        };
        self.check_queue_access(state, conn)?;
        if exclusive && !state.consumers.is_empty() {
            return Err(AmqpException::channel(
                ACCESS_REFUSED,
                format!("queue '{}' already has consumers", queue),
            ));
        }
        let has_exclusive_consumer = state
            .consumers
            .iter()
            .filter_map(|tag| self.consumers.get(tag))
            .any(|c| c.exclusive);
        if has_exclusive_consumer {
            return Err(AmqpException::channel(
                ACCESS_REFUSED,
                format!("queue '{}' has an exclusive consumer", queue),
            ));
        }

        let tag = if consumer_tag.is_empty() {
            self.ctag_seq += 1;
            Consumer::generated_tag(conn, channel, self.ctag_seq)
        } else {
            if self.consumers.contains_key(&consumer_tag) {
                return Err(AmqpException::channel(
                    PRECONDITION_FAILED,
                    format!("consumer tag '{}' is already in use", consumer_tag),
                ));
            }
            consumer_tag
        };

        let consumer = Consumer {
            tag: tag.clone(),
            queue: queue.clone(),
            connection_id: conn,
            channel,
            no_local,
            no_ack,
            exclusive,
            arguments,
        };
        self.consumers.insert(tag.clone(), consumer);
        if let Some(state) = self.queues.get_mut(&queue) {
            state.consumers.push(tag.clone());
            state.had_consumers = true;
        }
        if let Some(chan) = self.channel_mut_opt(conn, channel) {
            chan.consumer_tags.push(tag.clone());
        }

        debug!("consumer '{}' registered on queue '{}'", tag, queue);
        if !no_wait {
            self.send(
                conn,
                Frame::method(channel, Method::BasicConsumeOk { consumer_tag: tag.clone() }),
            );
        }
        self.events
            .emit(BrokerEvent::ConsumerCreated { consumer_tag: tag, queue: queue.clone() });
        self.dispatch_queue(&queue);
        Ok(())
    }

    pub(super) fn basic_cancel(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        consumer_tag: String,
        no_wait: bool,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;
        let owned = self
            .consumers
            .get(&consumer_tag)
            .map(|c| c.connection_id == conn && c.channel == channel)
            .unwrap_or(false);
        if owned {
            if let Some(consumer) = self.remove_consumer(&consumer_tag, false) {
                self.maybe_auto_delete_queue(&consumer.queue);
            }
        }
        // Cancelling an unknown consumer still succeeds.
        if !no_wait {
            self.send(conn, Frame::method(channel, Method::BasicCancelOk { consumer_tag }));
        }
        Ok(())
    }

    /// Unregister a consumer everywhere it is indexed. With `notify`, the
    /// server sends `Basic.Cancel` to the owning channel
    /// (consumer_cancel_notify).
    pub(super) fn remove_consumer(&mut self, tag: &str, notify: bool) -> Option<Consumer> {
        let consumer = self.consumers.remove(tag)?;
        if let Some(queue) = self.queues.get_mut(&consumer.queue) {
            if let Some(position) = queue.consumers.iter().position(|t| t == tag) {
                queue.consumers.remove(position);
                if position < queue.next_consumer {
                    queue.next_consumer -= 1;
                }
                if queue.consumers.is_empty() {
                    queue.next_consumer = 0;
                } else {
                    queue.next_consumer %= queue.consumers.len();
                }
            }
        }
        if let Some(chan) = self.channel_mut_opt(consumer.connection_id, consumer.channel) {
            chan.consumer_tags.retain(|t| t != tag);
        }
        if notify {
            self.send(
                consumer.connection_id,
                Frame::method(
                    consumer.channel,
                    Method::BasicCancel { consumer_tag: tag.to_string(), no_wait: true },
                ),
            );
        }
        self.events.emit(BrokerEvent::ConsumerCancelled {
            consumer_tag: tag.to_string(),
            queue: consumer.queue.clone(),
        });
        Some(consumer)
    }

    /// Delete an auto-delete queue whose consumer count returned to zero.
    pub(super) fn maybe_auto_delete_queue(&mut self, name: &str) {
        let should = self
            .queues
            .get(name)
            .map(|q| q.meta.auto_delete && q.had_consumers && q.consumers.is_empty())
            .unwrap_or(false);
        if should {
            debug!("auto-deleting queue '{}'", name);
            self.delete_queue_internal(name);
        }
    }

    /// Remove a queue with its bindings and consumers. Returns the number of
    /// messages dropped with it.
    pub(super) fn delete_queue_internal(&mut self, name: &str) -> u32 {
        let Some(state) = self.queues.remove(name) else {
            return 0;
        };
        let message_count = state.messages.len() as u32;

        for tag in state.consumers.clone() {
            self.remove_consumer(&tag, true);
        }

        let (removed, kept): (Vec<_>, Vec<_>) =
            std::mem::take(&mut self.bindings).into_iter().partition(|b| b.destination == name);
        self.bindings = kept;

        if state.meta.durable {
            if let Err(e) = self.persist_queues() {
                warn!("failed to snapshot queues after deleting '{}': {}", name, e);
            }
            if let Err(e) = self.persist_bindings() {
                warn!("failed to snapshot bindings after deleting '{}': {}", name, e);
            }
        }

        let mut sources: Vec<String> = Vec::new();
        for binding in removed {
            if !binding.source.is_empty() && !sources.contains(&binding.source) {
                sources.push(binding.source.clone());
            }
            self.events.emit(BrokerEvent::BindingDeleted {
                source: binding.source,
                destination: binding.destination,
                routing_key: binding.routing_key,
            });
        }
        for source in sources {
            if let Err(e) = self.maybe_auto_delete_exchange(&source) {
                warn!("failed to auto-delete exchange '{}': {}", source, e);
            }
        }

        self.events.emit(BrokerEvent::QueueDeleted { name: name.to_string() });
        message_count
    }

    // ------------------------------------------------------ acknowledgements

    pub(super) fn basic_qos(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    ) -> Result<(), AmqpException> {
        let chan = self.channel_mut(conn, channel)?;
        chan.prefetch_size = prefetch_size;
        chan.prefetch_count = prefetch_count;
        chan.global_qos = global;
        debug!(
            "qos on connection {} channel {}: prefetch_count={} global={}",
            conn, channel, prefetch_count, global
        );
        self.send(conn, Frame::method(channel, Method::BasicQosOk));
        Ok(())
    }

    pub(super) fn basic_ack(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
    ) -> Result<(), AmqpException> {
        let entries = {
            let chan = self.channel_mut(conn, channel)?;
            let entries = chan.take_unacked(delivery_tag, multiple);
            if entries.is_empty() && !multiple {
                return Err(AmqpException::channel(
                    PRECONDITION_FAILED,
                    format!("unknown delivery tag {}", delivery_tag),
                ));
            }
            entries
        };
        for entry in &entries {
            let durable =
                self.queues.get(&entry.queue).map(|q| q.meta.durable).unwrap_or(false);
            if durable && entry.message.is_persistent() {
                self.persist_delete(&entry.queue, &entry.message.id)?;
            }
            self.events.emit(BrokerEvent::MessageAcked {
                queue: entry.queue.clone(),
                delivery_tag: entry.delivery_tag,
            });
        }
        // Freed prefetch slots may unblock this channel's consumers.
        for queue in self.queues_consumed_by(conn, channel) {
            self.dispatch_queue(&queue);
        }
        Ok(())
    }

    /// Shared by `Basic.Reject` (single) and `Basic.Nack` (multiple).
    pub(super) fn basic_reject(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
        nack: bool,
    ) -> Result<(), AmqpException> {
        let entries = {
            let chan = self.channel_mut(conn, channel)?;
            let entries = chan.take_unacked(delivery_tag, multiple);
            if entries.is_empty() && !multiple {
                return Err(AmqpException::channel(
                    PRECONDITION_FAILED,
                    format!("unknown delivery tag {}", delivery_tag),
                ));
            }
            entries
        };

        for entry in &entries {
            let event = if nack {
                BrokerEvent::MessageNacked {
                    queue: entry.queue.clone(),
                    delivery_tag: entry.delivery_tag,
                }
            } else {
                BrokerEvent::MessageRejected {
                    queue: entry.queue.clone(),
                    delivery_tag: entry.delivery_tag,
                }
            };
            self.events.emit(event);
        }

        if requeue {
            let affected = self.requeue_entries(entries, true);
            for queue in affected {
                self.dispatch_queue(&queue);
            }
        } else {
            for entry in &entries {
                let durable =
                    self.queues.get(&entry.queue).map(|q| q.meta.durable).unwrap_or(false);
                if durable && entry.message.is_persistent() {
                    self.persist_delete(&entry.queue, &entry.message.id)?;
                }
            }
        }

        for queue in self.queues_consumed_by(conn, channel) {
            self.dispatch_queue(&queue);
        }
        Ok(())
    }

    /// `Basic.Recover` / `Basic.RecoverAsync`: requeue everything unacked on
    /// the channel. `requeue=true` goes to the head, `requeue=false` to the
    /// tail.
    pub(super) fn basic_recover(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        requeue: bool,
        sync: bool,
    ) -> Result<(), AmqpException> {
        let entries = self.channel_mut(conn, channel)?.take_all_unacked();
        let affected = self.requeue_entries(entries, requeue);
        for queue in affected {
            self.dispatch_queue(&queue);
        }
        if sync {
            self.send(conn, Frame::method(channel, Method::BasicRecoverOk));
        }
        Ok(())
    }

    pub(super) fn basic_get(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        queue: String,
        no_ack: bool,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;
        let durable = {
            let Some(state) = self.queues.get(&queue) else {
                return Err(AmqpException::channel(NOT_FOUND, format!("no queue '{}'", queue)));
            };
            self.check_queue_access(state, conn)?;
            state.meta.durable
        };

        let popped = self.queues.get_mut(&queue).and_then(|state| {
            state.messages.pop_front().map(|m| (m, state.messages.len() as u32))
        });
        let Some((message, remaining)) = popped else {
            self.send(conn, Frame::method(channel, Method::BasicGetEmpty));
            return Ok(());
        };

        let frame_max =
            self.connections.get(&conn).map(|h| h.frame_max).unwrap_or(self.config.frame_max);
        let delivery_tag = self.channel_mut(conn, channel)?.next_delivery_tag();
        self.send(
            conn,
            Frame::method(
                channel,
                Method::BasicGetOk {
                    delivery_tag,
                    redelivered: message.redelivered,
                    exchange: message.exchange.clone(),
                    routing_key: message.routing_key.clone(),
                    message_count: remaining,
                },
            ),
        );
        for frame in content_frames(channel, &message, frame_max) {
            self.send(conn, frame);
        }
        self.events.emit(BrokerEvent::MessageDelivered {
            queue: queue.clone(),
            consumer_tag: String::new(),
        });

        if no_ack {
            if durable && message.is_persistent() {
                self.persist_delete_logged(&queue, &message.id);
            }
        } else {
            let entry = UnackedEntry {
                delivery_tag,
                message,
                queue: queue.clone(),
                consumer_tag: String::new(),
                delivered_at: Instant::now(),
            };
            self.channel_mut(conn, channel)?.unacked.insert(delivery_tag, entry);
        }
        Ok(())
    }

    // --------------------------------------------------------------- requeue

    /// Push unacked entries back onto their source queues, marking them
    /// redelivered. Entries arrive in tag order; head requeues preserve that
    /// order at the front. Returns the affected queues.
    pub(super) fn requeue_entries(
        &mut self,
        entries: Vec<UnackedEntry>,
        to_head: bool,
    ) -> Vec<String> {
        let mut affected: Vec<String> = Vec::new();
        let mut push = |this: &mut Self, entry: UnackedEntry, affected: &mut Vec<String>| {
            let UnackedEntry { message: mut m, queue, .. } = entry;
            m.redelivered = true;
            if let Some(state) = this.queues.get_mut(&queue) {
                if to_head {
                    state.messages.push_front(m);
                } else {
                    state.messages.push_back(m);
                }
                if !affected.contains(&queue) {
                    affected.push(queue);
                }
            }
            // A vanished queue drops the message.
        };
        if to_head {
            for entry in entries.into_iter().rev() {
                push(self, entry, &mut affected);
            }
        } else {
            for entry in entries {
                push(self, entry, &mut affected);
            }
        }
        affected
    }

    /// Requeue a channel's unacked messages and cancel its consumers. Called
    /// for channel close, channel errors and connection teardown.
    pub(super) fn cleanup_channel(&mut self, conn: ConnectionId, number: u16) {
        let (entries, tags) = match self.channel_mut_opt(conn, number) {
            Some(chan) => {
                chan.pending = None;
                (chan.take_all_unacked(), std::mem::take(&mut chan.consumer_tags))
            }
            None => return,
        };
        for tag in tags {
            if let Some(consumer) = self.remove_consumer(&tag, false) {
                self.maybe_auto_delete_queue(&consumer.queue);
            }
        }
        let affected = self.requeue_entries(entries, true);
        for queue in affected {
            self.dispatch_queue(&queue);
        }
    }

    /// The queues this channel's consumers are subscribed to.
    pub(super) fn queues_consumed_by(&self, conn: ConnectionId, channel: u16) -> Vec<String> {
        let Some(chan) = self.channel(conn, channel) else {
            return Vec::new();
        };
        let mut queues: Vec<String> = Vec::new();
        for tag in &chan.consumer_tags {
            if let Some(consumer) = self.consumers.get(tag) {
                if !queues.contains(&consumer.queue) {
                    queues.push(consumer.queue.clone());
                }
            }
        }
        queues
    }

    fn persist_delete_logged(&mut self, queue: &str, message_id: &str) {
        if let Err(e) = self.persist_delete(queue, message_id) {
            warn!("failed to delete message {} on '{}' from log: {}", message_id, queue, e);
            self.events.emit(BrokerEvent::BrokerError { message: e.text });
        }
    }
}
