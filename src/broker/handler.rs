//! Broker state and per-method dispatch.
//!
//! [`BrokerCore`] owns the entity tables, the connection registry and the
//! persistence handles. All mutation runs through it while the caller holds
//! the broker lock, which serializes the entity graph exactly as the
//! connection drivers expect: a method's reply frames are queued before any
//! further frame is processed.
//!
//! Connection and channel class methods plus the exchange/queue classes live
//! here; the basic class (publish, consume, ack, get) is in
//! [`super::delivery`].

use std::collections::HashMap;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::broker::channel::{ChannelLifecycle, ChannelState, ConnectionId};
use crate::config::BrokerConfig;
use crate::entities::{Binding, Exchange, ExchangeType, Queue, RESERVED_PREFIX};
use crate::events::{BrokerEvent, EventBus};
use crate::protocol::{
    AmqpException, FieldTable, Frame, Method, ACCESS_REFUSED, CHANNEL_ERROR, COMMAND_INVALID,
    INTERNAL_ERROR, NOT_FOUND, PRECONDITION_FAILED, RESOURCE_LOCKED, UNEXPECTED_FRAME,
};
use crate::storage::Persistence;

use super::delivery::QueueState;

/// What the connection driver should do after a frame was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Continue,
    CloseConnection,
}

/// Registry entry for an open connection: negotiated limits, its channels,
/// and the sender feeding the connection's writer task.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub peer: String,
    pub virtual_host: String,
    pub channel_max: u16,
    pub frame_max: u32,
    pub heartbeat: u16,
    pub client_properties: FieldTable,
    pub outbound: mpsc::UnboundedSender<Frame>,
    pub channels: HashMap<u16, ChannelState>,
    /// Set once `Connection.Close` has been sent or received; only
    /// `Close-Ok` is meaningful afterwards.
    pub closing: bool,
}

impl ConnectionHandle {
    /// Queue a frame for the connection's writer. A send to a dying writer
    /// is ignored; teardown will reap the connection.
    pub fn send(&self, frame: Frame) {
        let _ = self.outbound.send(frame);
    }
}

/// The broker's global state. One instance lives behind the broker mutex.
pub struct BrokerCore {
    pub config: BrokerConfig,
    pub exchanges: HashMap<String, Exchange>,
    pub queues: HashMap<String, QueueState>,
    pub bindings: Vec<Binding>,
    pub consumers: HashMap<String, crate::entities::Consumer>,
    pub connections: HashMap<ConnectionId, ConnectionHandle>,
    pub patterns: crate::routing::PatternCache,
    pub persistence: Persistence,
    pub events: EventBus,
    pub ctag_seq: u64,
}

impl BrokerCore {
    pub fn new(config: BrokerConfig, events: EventBus) -> crate::Result<Self> {
        let persistence = Persistence::open(&config.data_dir)?;
        let mut core = Self {
            config,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            consumers: HashMap::new(),
            connections: HashMap::new(),
            patterns: crate::routing::PatternCache::new(),
            persistence,
            events,
            ctag_seq: 0,
        };
        for exchange in Exchange::defaults() {
            core.exchanges.insert(exchange.name.clone(), exchange);
        }
        Ok(core)
    }

    /// Restore durable state from disk, then merge the default exchange set
    /// back in.
    pub fn recover(&mut self) -> crate::Result<()> {
        let state = self.persistence.recover()?;
        for exchange in state.exchanges {
            self.exchanges.insert(exchange.name.clone(), exchange);
        }
        for queue in state.queues {
            self.queues.insert(queue.name.clone(), QueueState::new(queue));
        }
        self.bindings = state.bindings;
        for (queue_name, message) in state.messages {
            if let Some(queue) = self.queues.get_mut(&queue_name) {
                queue.messages.push_back(message);
            }
        }
        for exchange in Exchange::defaults() {
            self.exchanges.insert(exchange.name.clone(), exchange);
        }
        Ok(())
    }

    /// Close every connection and flush persistence. Called from `stop()`.
    pub fn shutdown(&mut self) {
        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            if let Some(handle) = self.connections.get_mut(&id) {
                handle.closing = true;
                handle.send(Frame::method(
                    0,
                    Method::ConnectionClose {
                        reply_code: crate::protocol::CONNECTION_FORCED,
                        reply_text: "broker shutting down".into(),
                        class_id: 0,
                        method_id: 0,
                    },
                ));
            }
            self.connection_closed(id);
        }
        if let Err(e) = self.persistence.close() {
            warn!("failed to flush persistence on shutdown: {}", e);
        }
    }

    // ---------------------------------------------------------------- frames

    /// Handle one inbound frame from `conn`. Protocol failures are converted
    /// into close sequences here; the driver only learns whether to keep the
    /// socket open.
    pub fn handle_frame(&mut self, conn: ConnectionId, frame: Frame) -> FrameOutcome {
        let channel = frame.channel();
        let result = match frame {
            Frame::Method { channel, method } => self.handle_method(conn, channel, method),
            Frame::Header { channel, header } => {
                self.handle_header(conn, channel, header).map(|_| FrameOutcome::Continue)
            }
            Frame::Body { channel, payload } => {
                self.handle_body(conn, channel, payload).map(|_| FrameOutcome::Continue)
            }
            Frame::Heartbeat => Ok(FrameOutcome::Continue),
        };
        match result {
            Ok(outcome) => outcome,
            Err(exception) => self.raise(conn, channel, exception),
        }
    }

    fn handle_method(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        method: Method,
    ) -> Result<FrameOutcome, AmqpException> {
        let (class_id, method_id) = method.class_and_method();

        if let Some(handle) = self.connections.get(&conn) {
            if handle.closing && !matches!(method, Method::ConnectionCloseOk) {
                return Ok(FrameOutcome::Continue);
            }
        }

        if channel == 0 {
            return self.handle_connection_method(conn, method);
        }

        let (closing, mid_publish) = match self.channel(conn, channel) {
            Some(state) => {
                (state.lifecycle == ChannelLifecycle::Closing, state.pending.is_some())
            }
            None => (false, false),
        };
        // A channel being torn down discards everything until Close-Ok.
        if closing {
            if matches!(method, Method::ChannelCloseOk) {
                self.remove_channel(conn, channel);
            }
            return Ok(FrameOutcome::Continue);
        }
        // Mid-publish the only legal frames are content frames (or a close).
        if mid_publish
            && !matches!(method, Method::ChannelClose { .. } | Method::ChannelCloseOk)
        {
            return Err(AmqpException::channel(
                UNEXPECTED_FRAME,
                "expected content header or body frame",
            )
            .with_method(class_id, method_id));
        }

        let result = match method {
            Method::ChannelOpen => self.channel_open(conn, channel),
            Method::ChannelFlow { active } => self.channel_flow(conn, channel, active),
            Method::ChannelClose { reply_code, reply_text, .. } => {
                debug!(
                    "connection {} channel {} closed by client: {} {}",
                    conn, channel, reply_code, reply_text
                );
                self.cleanup_channel(conn, channel);
                self.remove_channel(conn, channel);
                self.send(conn, Frame::method(channel, Method::ChannelCloseOk));
                Ok(())
            }
            Method::ChannelCloseOk => {
                self.remove_channel(conn, channel);
                Ok(())
            }

            Method::ExchangeDeclare {
                exchange,
                kind,
                passive,
                durable,
                auto_delete,
                internal,
                no_wait,
                arguments,
            } => self.exchange_declare(
                conn, channel, exchange, kind, passive, durable, auto_delete, internal, no_wait,
                arguments,
            ),
            Method::ExchangeDelete { exchange, if_unused, no_wait } => {
                self.exchange_delete(conn, channel, exchange, if_unused, no_wait)
            }

            Method::QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => self.queue_declare(
                conn, channel, queue, passive, durable, exclusive, auto_delete, no_wait, arguments,
            ),
            Method::QueueBind { queue, exchange, routing_key, no_wait, arguments } => {
                self.queue_bind(conn, channel, queue, exchange, routing_key, no_wait, arguments)
            }
            Method::QueueUnbind { queue, exchange, routing_key, .. } => {
                self.queue_unbind(conn, channel, queue, exchange, routing_key)
            }
            Method::QueuePurge { queue, no_wait } => {
                self.queue_purge(conn, channel, queue, no_wait)
            }
            Method::QueueDelete { queue, if_unused, if_empty, no_wait } => {
                self.queue_delete(conn, channel, queue, if_unused, if_empty, no_wait)
            }

            Method::BasicQos { prefetch_size, prefetch_count, global } => {
                self.basic_qos(conn, channel, prefetch_size, prefetch_count, global)
            }
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => self.basic_consume(
                conn, channel, queue, consumer_tag, no_local, no_ack, exclusive, no_wait,
                arguments,
            ),
            Method::BasicCancel { consumer_tag, no_wait } => {
                self.basic_cancel(conn, channel, consumer_tag, no_wait)
            }
            Method::BasicPublish { exchange, routing_key, mandatory, immediate } => {
                self.basic_publish(conn, channel, exchange, routing_key, mandatory, immediate)
            }
            Method::BasicGet { queue, no_ack } => self.basic_get(conn, channel, queue, no_ack),
            Method::BasicAck { delivery_tag, multiple } => {
                self.basic_ack(conn, channel, delivery_tag, multiple)
            }
            Method::BasicReject { delivery_tag, requeue } => {
                self.basic_reject(conn, channel, delivery_tag, false, requeue, false)
            }
            Method::BasicNack { delivery_tag, multiple, requeue } => {
                self.basic_reject(conn, channel, delivery_tag, multiple, requeue, true)
            }
            Method::BasicRecover { requeue } => self.basic_recover(conn, channel, requeue, true),
            Method::BasicRecoverAsync { requeue } => {
                self.basic_recover(conn, channel, requeue, false)
            }

            other => Err(AmqpException::connection(
                COMMAND_INVALID,
                format!("unexpected method {:?}", other.class_and_method()),
            )),
        };

        result
            .map(|_| FrameOutcome::Continue)
            .map_err(|e| if e.class_id == 0 { e.with_method(class_id, method_id) } else { e })
    }

    fn handle_connection_method(
        &mut self,
        conn: ConnectionId,
        method: Method,
    ) -> Result<FrameOutcome, AmqpException> {
        match method {
            Method::ConnectionClose { reply_code, reply_text, .. } => {
                info!("connection {} closed by client: {} {}", conn, reply_code, reply_text);
                self.send(conn, Frame::method(0, Method::ConnectionCloseOk));
                Ok(FrameOutcome::CloseConnection)
            }
            Method::ConnectionCloseOk => Ok(FrameOutcome::CloseConnection),
            other => Err(AmqpException::connection(
                COMMAND_INVALID,
                format!("unexpected method on channel 0: {:?}", other.class_and_method()),
            )),
        }
    }

    /// Convert a raised exception into the close sequence it calls for.
    fn raise(&mut self, conn: ConnectionId, channel: u16, exception: AmqpException) -> FrameOutcome {
        warn!(
            "connection {} channel {}: {} (class {} method {})",
            conn, channel, exception, exception.class_id, exception.method_id
        );
        match exception.scope {
            crate::protocol::ExceptionScope::Channel if channel != 0 => {
                self.cleanup_channel(conn, channel);
                if let Some(state) = self.channel_mut_opt(conn, channel) {
                    state.lifecycle = ChannelLifecycle::Closing;
                }
                self.send(
                    conn,
                    Frame::method(
                        channel,
                        Method::ChannelClose {
                            reply_code: exception.code,
                            reply_text: exception.text,
                            class_id: exception.class_id,
                            method_id: exception.method_id,
                        },
                    ),
                );
                FrameOutcome::Continue
            }
            _ => {
                if exception.code == INTERNAL_ERROR {
                    self.events.emit(BrokerEvent::BrokerError { message: exception.text.clone() });
                }
                if let Some(handle) = self.connections.get_mut(&conn) {
                    handle.closing = true;
                    handle.send(Frame::method(
                        0,
                        Method::ConnectionClose {
                            reply_code: exception.code,
                            reply_text: exception.text,
                            class_id: exception.class_id,
                            method_id: exception.method_id,
                        },
                    ));
                    FrameOutcome::Continue
                } else {
                    FrameOutcome::CloseConnection
                }
            }
        }
    }

    // ------------------------------------------------------------- lifecycle

    /// Register a connection that completed its handshake.
    pub fn register_connection(
        &mut self,
        id: ConnectionId,
        peer: String,
        virtual_host: String,
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
        client_properties: FieldTable,
        outbound: mpsc::UnboundedSender<Frame>,
    ) {
        let handle = ConnectionHandle {
            id,
            peer: peer.clone(),
            virtual_host,
            channel_max,
            frame_max,
            heartbeat,
            client_properties,
            outbound,
            channels: HashMap::new(),
            closing: false,
        };
        self.connections.insert(id, handle);
        self.events.emit(BrokerEvent::ConnectionOpen { connection_id: id, peer });
    }

    /// Tear down a connection: requeue its unacked messages, cancel its
    /// consumers, delete its exclusive queues. Idempotent.
    pub fn connection_closed(&mut self, conn: ConnectionId) {
        let Some(handle) = self.connections.remove(&conn) else {
            return;
        };
        let channel_numbers: Vec<u16> = handle.channels.keys().copied().collect();
        // Re-insert briefly so channel cleanup can walk the shared paths.
        self.connections.insert(conn, handle);
        for number in channel_numbers {
            self.cleanup_channel(conn, number);
        }
        self.connections.remove(&conn);

        let exclusive: Vec<String> = self
            .queues
            .values()
            .filter(|q| q.meta.exclusive_connection == Some(conn))
            .map(|q| q.meta.name.clone())
            .collect();
        for name in exclusive {
            debug!("deleting exclusive queue '{}' with its connection {}", name, conn);
            self.delete_queue_internal(&name);
        }

        self.events.emit(BrokerEvent::ConnectionClose { connection_id: conn });
    }

    // -------------------------------------------------------- channel class

    fn channel_open(&mut self, conn: ConnectionId, channel: u16) -> Result<(), AmqpException> {
        let handle = self.handle_mut(conn)?;
        if channel > handle.channel_max {
            return Err(AmqpException::connection(
                CHANNEL_ERROR,
                format!("channel {} exceeds negotiated channel-max {}", channel, handle.channel_max),
            ));
        }
        if handle.channels.contains_key(&channel) {
            return Err(AmqpException::channel(
                CHANNEL_ERROR,
                format!("channel {} is already open", channel),
            ));
        }
        handle.channels.insert(channel, ChannelState::new(channel));
        handle.send(Frame::method(channel, Method::ChannelOpenOk));
        self.events.emit(BrokerEvent::ChannelOpen { connection_id: conn, channel });
        Ok(())
    }

    fn channel_flow(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        active: bool,
    ) -> Result<(), AmqpException> {
        let state = self.channel_mut(conn, channel)?;
        state.flow_active = active;
        self.send(conn, Frame::method(channel, Method::ChannelFlowOk { active }));
        self.events.emit(BrokerEvent::ChannelFlow { connection_id: conn, channel, active });
        if active {
            // Resuming flow unblocks this channel's consumers.
            for queue in self.queues_consumed_by(conn, channel) {
                self.dispatch_queue(&queue);
            }
        }
        Ok(())
    }

    fn remove_channel(&mut self, conn: ConnectionId, channel: u16) {
        if let Some(handle) = self.connections.get_mut(&conn) {
            if handle.channels.remove(&channel).is_some() {
                self.events.emit(BrokerEvent::ChannelClose { connection_id: conn, channel });
            }
        }
    }

    // ------------------------------------------------------- exchange class

    #[allow(clippy::too_many_arguments)]
    fn exchange_declare(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        name: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;

        if let Some(existing) = self.exchanges.get(&name) {
            if passive {
                // Existence check only.
            } else if existing.is_default || name.is_empty() {
                return Err(AmqpException::channel(
                    ACCESS_REFUSED,
                    format!("cannot redeclare reserved exchange '{}'", name),
                ));
            } else {
                let kind = ExchangeType::parse(&kind).ok_or_else(|| {
                    AmqpException::connection(
                        COMMAND_INVALID,
                        format!("unknown exchange type '{}'", kind),
                    )
                })?;
                if existing.kind != kind || existing.durable != durable {
                    return Err(AmqpException::channel(
                        PRECONDITION_FAILED,
                        format!(
                            "exchange '{}' exists as type {} durable={}",
                            name,
                            existing.kind.as_str(),
                            existing.durable
                        ),
                    ));
                }
            }
            if !no_wait {
                self.send(conn, Frame::method(channel, Method::ExchangeDeclareOk));
            }
            return Ok(());
        }

        if passive {
            return Err(AmqpException::channel(
                NOT_FOUND,
                format!("no exchange '{}'", name),
            ));
        }
        if name.is_empty() || name.starts_with(RESERVED_PREFIX) {
            return Err(AmqpException::channel(
                ACCESS_REFUSED,
                format!("exchange name '{}' is reserved", name),
            ));
        }
        let kind = ExchangeType::parse(&kind).ok_or_else(|| {
            AmqpException::connection(COMMAND_INVALID, format!("unknown exchange type '{}'", kind))
        })?;

        let exchange = Exchange {
            name: name.clone(),
            kind,
            durable,
            auto_delete,
            internal,
            arguments,
            is_default: false,
        };
        let snapshot = exchange.durable;
        self.exchanges.insert(name.clone(), exchange);
        if snapshot {
            self.persist_exchanges()?;
        }
        info!("exchange '{}' declared ({})", name, kind.as_str());
        self.events.emit(BrokerEvent::ExchangeCreated { name });
        if !no_wait {
            self.send(conn, Frame::method(channel, Method::ExchangeDeclareOk));
        }
        Ok(())
    }

    fn exchange_delete(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        name: String,
        if_unused: bool,
        no_wait: bool,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;

        if name.is_empty() || self.exchanges.get(&name).map(|e| e.is_default).unwrap_or(false) {
            return Err(AmqpException::channel(
                ACCESS_REFUSED,
                format!("cannot delete default exchange '{}'", name),
            ));
        }
        if let Some(exchange) = self.exchanges.get(&name) {
            if if_unused && self.bindings.iter().any(|b| b.source == name) {
                return Err(AmqpException::channel(
                    PRECONDITION_FAILED,
                    format!("exchange '{}' is in use", name),
                ));
            }
            let was_durable = exchange.durable;
            let removed: Vec<Binding> = {
                let (gone, kept): (Vec<Binding>, Vec<Binding>) =
                    std::mem::take(&mut self.bindings).into_iter().partition(|b| b.source == name);
                self.bindings = kept;
                gone
            };
            self.exchanges.remove(&name);
            if was_durable {
                self.persist_exchanges()?;
                self.persist_bindings()?;
            }
            for binding in removed {
                self.events.emit(BrokerEvent::BindingDeleted {
                    source: binding.source,
                    destination: binding.destination,
                    routing_key: binding.routing_key,
                });
            }
            info!("exchange '{}' deleted", name);
            self.events.emit(BrokerEvent::ExchangeDeleted { name });
        }
        // Deleting a missing exchange succeeds.
        if !no_wait {
            self.send(conn, Frame::method(channel, Method::ExchangeDeleteOk));
        }
        Ok(())
    }

    // ---------------------------------------------------------- queue class

    #[allow(clippy::too_many_arguments)]
    fn queue_declare(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        name: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;

        if !name.is_empty() {
            if let Some(queue) = self.queues.get(&name) {
                self.check_queue_access(queue, conn)?;
                if !passive
                    && (queue.meta.durable != durable
                        || queue.meta.exclusive != exclusive
                        || queue.meta.auto_delete != auto_delete)
                {
                    return Err(AmqpException::channel(
                        PRECONDITION_FAILED,
                        format!("queue '{}' exists with different properties", name),
                    ));
                }
                let (message_count, consumer_count) =
                    (queue.message_count(), queue.consumer_count());
                if !no_wait {
                    self.send(
                        conn,
                        Frame::method(
                            channel,
                            Method::QueueDeclareOk { queue: name, message_count, consumer_count },
                        ),
                    );
                }
                return Ok(());
            }
            if passive {
                return Err(AmqpException::channel(NOT_FOUND, format!("no queue '{}'", name)));
            }
            if name.starts_with(RESERVED_PREFIX) {
                return Err(AmqpException::channel(
                    ACCESS_REFUSED,
                    format!("queue name '{}' is reserved", name),
                ));
            }
        } else if passive {
            return Err(AmqpException::channel(NOT_FOUND, "no queue ''".to_string()));
        }

        let name = if name.is_empty() { Queue::generated_name() } else { name };
        let queue = Queue {
            name: name.clone(),
            durable,
            exclusive,
            auto_delete,
            arguments,
            exclusive_connection: exclusive.then_some(conn),
        };
        self.queues.insert(name.clone(), QueueState::new(queue));

        // Every queue is bound to the default exchange under its own name.
        let binding = Binding {
            source: String::new(),
            destination: name.clone(),
            routing_key: name.clone(),
            arguments: FieldTable::new(),
        };
        self.bindings.push(binding);

        if durable {
            self.persist_queues()?;
            self.persist_bindings()?;
        }
        info!("queue '{}' declared (durable={}, exclusive={})", name, durable, exclusive);
        self.events.emit(BrokerEvent::QueueCreated { name: name.clone() });
        self.events.emit(BrokerEvent::BindingCreated {
            source: String::new(),
            destination: name.clone(),
            routing_key: name.clone(),
        });
        if !no_wait {
            self.send(
                conn,
                Frame::method(
                    channel,
                    Method::QueueDeclareOk { queue: name, message_count: 0, consumer_count: 0 },
                ),
            );
        }
        Ok(())
    }

    fn queue_bind(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;

        if exchange.is_empty() {
            return Err(AmqpException::channel(
                ACCESS_REFUSED,
                "cannot bind to the default exchange",
            ));
        }
        if !self.exchanges.contains_key(&exchange) {
            return Err(AmqpException::channel(NOT_FOUND, format!("no exchange '{}'", exchange)));
        }
        let Some(queue_state) = self.queues.get(&queue) else {
            return Err(AmqpException::channel(NOT_FOUND, format!("no queue '{}'", queue)));
        };
        self.check_queue_access(queue_state, conn)?;

        let exists =
            self.bindings.iter().any(|b| b.matches_key(&exchange, &queue, &routing_key));
        if !exists {
            self.bindings.push(Binding {
                source: exchange.clone(),
                destination: queue.clone(),
                routing_key: routing_key.clone(),
                arguments,
            });
            if self.queues.get(&queue).map(|q| q.meta.durable).unwrap_or(false) {
                self.persist_bindings()?;
            }
            self.events.emit(BrokerEvent::BindingCreated {
                source: exchange,
                destination: queue,
                routing_key,
            });
        }
        if !no_wait {
            self.send(conn, Frame::method(channel, Method::QueueBindOk));
        }
        Ok(())
    }

    fn queue_unbind(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        queue: String,
        exchange: String,
        routing_key: String,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;

        if exchange.is_empty() {
            return Err(AmqpException::channel(
                ACCESS_REFUSED,
                "cannot unbind from the default exchange",
            ));
        }
        let before = self.bindings.len();
        self.bindings.retain(|b| !b.matches_key(&exchange, &queue, &routing_key));
        if self.bindings.len() != before {
            if self.queues.get(&queue).map(|q| q.meta.durable).unwrap_or(false) {
                self.persist_bindings()?;
            }
            self.events.emit(BrokerEvent::BindingDeleted {
                source: exchange.clone(),
                destination: queue,
                routing_key,
            });
            self.maybe_auto_delete_exchange(&exchange)?;
        }
        // Unbinding a non-existent binding succeeds.
        self.send(conn, Frame::method(channel, Method::QueueUnbindOk));
        Ok(())
    }

    fn queue_purge(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        queue: String,
        no_wait: bool,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;

        let Some(state) = self.queues.get(&queue) else {
            return Err(AmqpException::channel(NOT_FOUND, format!("no queue '{}'", queue)));
        };
        self.check_queue_access(state, conn)?;

        let durable = state.meta.durable;
        let purged: Vec<crate::entities::Message> = match self.queues.get_mut(&queue) {
            Some(state) => state.messages.drain(..).collect(),
            None => Vec::new(),
        };
        if durable {
            for message in purged.iter().filter(|m| m.is_persistent()) {
                self.persist_delete(&queue, &message.id)?;
            }
        }
        let message_count = purged.len() as u32;
        info!("queue '{}' purged ({} messages)", queue, message_count);
        self.events.emit(BrokerEvent::QueuePurged { name: queue, message_count });
        if !no_wait {
            self.send(conn, Frame::method(channel, Method::QueuePurgeOk { message_count }));
        }
        Ok(())
    }

    fn queue_delete(
        &mut self,
        conn: ConnectionId,
        channel: u16,
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    ) -> Result<(), AmqpException> {
        self.require_channel(conn, channel)?;

        let message_count = match self.queues.get(&queue) {
            None => 0, // deleting a missing queue succeeds
            Some(state) => {
                self.check_queue_access(state, conn)?;
                if if_unused && state.consumer_count() > 0 {
                    return Err(AmqpException::channel(
                        PRECONDITION_FAILED,
                        format!("queue '{}' has consumers", queue),
                    ));
                }
                if if_empty && state.message_count() > 0 {
                    return Err(AmqpException::channel(
                        PRECONDITION_FAILED,
                        format!("queue '{}' is not empty", queue),
                    ));
                }
                self.delete_queue_internal(&queue)
            }
        };
        if !no_wait {
            self.send(conn, Frame::method(channel, Method::QueueDeleteOk { message_count }));
        }
        Ok(())
    }

    // --------------------------------------------------------------- helpers

    pub(super) fn handle_mut(
        &mut self,
        conn: ConnectionId,
    ) -> Result<&mut ConnectionHandle, AmqpException> {
        self.connections.get_mut(&conn).ok_or_else(|| {
            AmqpException::connection(INTERNAL_ERROR, format!("unknown connection {}", conn))
        })
    }

    pub(super) fn channel(&self, conn: ConnectionId, number: u16) -> Option<&ChannelState> {
        self.connections.get(&conn).and_then(|h| h.channels.get(&number))
    }

    pub(super) fn channel_mut_opt(
        &mut self,
        conn: ConnectionId,
        number: u16,
    ) -> Option<&mut ChannelState> {
        self.connections.get_mut(&conn).and_then(|h| h.channels.get_mut(&number))
    }

    pub(super) fn channel_mut(
        &mut self,
        conn: ConnectionId,
        number: u16,
    ) -> Result<&mut ChannelState, AmqpException> {
        self.channel_mut_opt(conn, number).ok_or_else(|| {
            AmqpException::connection(CHANNEL_ERROR, format!("channel {} is not open", number))
        })
    }

    pub(super) fn require_channel(
        &self,
        conn: ConnectionId,
        number: u16,
    ) -> Result<(), AmqpException> {
        if self.channel(conn, number).is_none() {
            return Err(AmqpException::connection(
                CHANNEL_ERROR,
                format!("channel {} is not open", number),
            ));
        }
        Ok(())
    }

    pub(super) fn send(&self, conn: ConnectionId, frame: Frame) {
        if let Some(handle) = self.connections.get(&conn) {
            handle.send(frame);
        }
    }

    pub(super) fn check_queue_access(
        &self,
        queue: &QueueState,
        conn: ConnectionId,
    ) -> Result<(), AmqpException> {
        if queue.meta.exclusive && queue.meta.exclusive_connection != Some(conn) {
            return Err(AmqpException::channel(
                RESOURCE_LOCKED,
                format!("queue '{}' is exclusive to another connection", queue.meta.name),
            ));
        }
        Ok(())
    }

    /// Remove an exchange that is auto-delete and has lost its last binding.
    pub(super) fn maybe_auto_delete_exchange(
        &mut self,
        name: &str,
    ) -> Result<(), AmqpException> {
        let Some(exchange) = self.exchanges.get(name) else {
            return Ok(());
        };
        if !exchange.auto_delete
            || exchange.is_default
            || self.bindings.iter().any(|b| b.source == name)
        {
            return Ok(());
        }
        let was_durable = exchange.durable;
        self.exchanges.remove(name);
        if was_durable {
            self.persist_exchanges()?;
        }
        debug!("auto-deleted exchange '{}'", name);
        self.events.emit(BrokerEvent::ExchangeDeleted { name: name.to_string() });
        Ok(())
    }

    // ------------------------------------------------- persistence plumbing

    fn internal_error(&self, err: crate::BrokerError) -> AmqpException {
        AmqpException::connection(INTERNAL_ERROR, format!("persistence failure: {}", err))
    }

    pub(super) fn persist_exchanges(&mut self) -> Result<(), AmqpException> {
        self.persistence
            .snapshot_exchanges(self.exchanges.values())
            .map_err(|e| self.internal_error(e))
    }

    pub(super) fn persist_queues(&mut self) -> Result<(), AmqpException> {
        self.persistence
            .snapshot_queues(self.queues.values().map(|q| &q.meta))
            .map_err(|e| self.internal_error(e))
    }

    pub(super) fn persist_bindings(&mut self) -> Result<(), AmqpException> {
        let queues = &self.queues;
        self.persistence
            .snapshot_bindings(self.bindings.iter(), |name| {
                queues.get(name).map(|q| q.meta.durable).unwrap_or(false)
            })
            .map_err(|e| self.internal_error(e))
    }

    pub(super) fn persist_message(
        &mut self,
        queue: &str,
        message: &crate::entities::Message,
    ) -> Result<(), AmqpException> {
        self.persistence
            .append_message(queue, message)
            .map_err(|e| self.internal_error(e))
    }

    pub(super) fn persist_delete(
        &mut self,
        queue: &str,
        message_id: &str,
    ) -> Result<(), AmqpException> {
        self.persistence
            .append_delete(queue, message_id)
            .map_err(|e| self.internal_error(e))
    }
}
