//! Broker lifecycle: recovery, the TCP listener, and the programmatic
//! surface consumed by the CLI and embedding code.

use parking_lot::Mutex;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::channel::ConnectionId;
use crate::broker::connection;
use crate::broker::handler::{BrokerCore, FrameOutcome};
use crate::config::BrokerConfig;
use crate::entities::{Binding, Consumer, Exchange, Queue};
use crate::events::{BrokerEvent, EventBus};
use crate::protocol::{FieldTable, Frame};

/// A read-only view of an open connection.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub peer: String,
    pub virtual_host: String,
    pub channels: usize,
    pub heartbeat: u16,
}

/// A read-only view of a queue with its live counts.
#[derive(Debug, Clone)]
pub struct QueueInfo {
    pub queue: Queue,
    pub message_count: u32,
    pub consumer_count: u32,
}

/// Aggregate entity counts.
#[derive(Debug, Clone, Default)]
pub struct BrokerStatus {
    pub connections: usize,
    pub exchanges: usize,
    pub queues: usize,
    pub bindings: usize,
    pub consumers: usize,
    pub messages: u64,
}

/// The broker: global state behind a coarse lock, a TCP listener, and an
/// event stream.
///
/// `start` completes recovery before binding the listener; `stop` drains
/// connections and flushes persistence. All entity mutation is serialized
/// through the internal lock, which the per-connection drivers take for
/// each inbound frame.
pub struct Broker {
    config: BrokerConfig,
    core: Mutex<BrokerCore>,
    events: EventBus,
    shutdown: broadcast::Sender<()>,
    next_connection_id: AtomicU64,
    listener: Mutex<Option<JoinHandle<()>>>,
    local_addr: Mutex<Option<SocketAddr>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> crate::Result<Arc<Self>> {
        config.validate().map_err(crate::BrokerError::Config)?;
        let events = EventBus::default();
        let core = BrokerCore::new(config.clone(), events.clone())?;
        let (shutdown, _) = broadcast::channel(4);
        Ok(Arc::new(Self {
            config,
            core: Mutex::new(core),
            events,
            shutdown,
            next_connection_id: AtomicU64::new(1),
            listener: Mutex::new(None),
            local_addr: Mutex::new(None),
        }))
    }

    /// Recover durable state, bind the listener, and start accepting.
    /// Returns once the listener is bound.
    pub async fn start(self: &Arc<Self>) -> crate::Result<()> {
        self.core.lock().recover()?;

        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let local = listener.local_addr()?;
        *self.local_addr.lock() = Some(local);
        info!("embermq broker listening on {}", local);
        self.events.emit(BrokerEvent::BrokerStarted {
            host: self.config.host.clone(),
            port: local.port(),
        });

        let broker = Arc::clone(self);
        let mut shutdown_rx = self.shutdown.subscribe();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    accepted = listener.accept() => match accepted {
                        Ok((socket, peer)) => {
                            debug!("accepted connection from {}", peer);
                            if let Err(e) = socket.set_nodelay(true) {
                                warn!("failed to set TCP_NODELAY for {}: {}", peer, e);
                            }
                            let broker = Arc::clone(&broker);
                            tokio::spawn(async move {
                                if let Err(e) =
                                    connection::run_connection(broker, socket, peer).await
                                {
                                    warn!("connection from {} failed: {}", peer, e);
                                }
                            });
                        }
                        Err(e) => {
                            error!("failed to accept connection: {}", e);
                        }
                    },
                    _ = shutdown_rx.recv() => {
                        info!("listener shutting down");
                        break;
                    }
                }
            }
        });
        *self.listener.lock() = Some(handle);
        Ok(())
    }

    /// Stop accepting, close every connection, flush persistence.
    pub async fn stop(&self) {
        let _ = self.shutdown.send(());
        let handle = self.listener.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        self.core.lock().shutdown();
        self.events.emit(BrokerEvent::BrokerStopped);
        info!("broker stopped");
    }

    pub fn config(&self) -> &BrokerConfig {
        &self.config
    }

    /// The bound listener address, once `start` has completed. With port 0
    /// this is where the kernel actually put us.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Subscribe to the broker event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<BrokerEvent> {
        self.events.subscribe()
    }

    // ------------------------------------------------ connection driver API

    pub(crate) fn next_connection_id(&self) -> ConnectionId {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn handle_frame(&self, conn: ConnectionId, frame: Frame) -> FrameOutcome {
        self.core.lock().handle_frame(conn, frame)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn register_connection(
        &self,
        id: ConnectionId,
        peer: String,
        virtual_host: String,
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
        client_properties: FieldTable,
        outbound: mpsc::UnboundedSender<Frame>,
    ) {
        self.core.lock().register_connection(
            id,
            peer,
            virtual_host,
            channel_max,
            frame_max,
            heartbeat,
            client_properties,
            outbound,
        );
    }

    pub(crate) fn connection_closed(&self, conn: ConnectionId) {
        self.core.lock().connection_closed(conn);
    }

    pub(crate) fn emit_connection_error(&self, conn: ConnectionId, message: String) {
        self.events.emit(BrokerEvent::ConnectionError { connection_id: conn, message });
    }

    // ----------------------------------------------------------- enumeration

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.core
            .lock()
            .connections
            .values()
            .map(|h| ConnectionInfo {
                id: h.id,
                peer: h.peer.clone(),
                virtual_host: h.virtual_host.clone(),
                channels: h.channels.len(),
                heartbeat: h.heartbeat,
            })
            .collect()
    }

    pub fn exchanges(&self) -> Vec<Exchange> {
        self.core.lock().exchanges.values().cloned().collect()
    }

    pub fn queues(&self) -> Vec<QueueInfo> {
        self.core
            .lock()
            .queues
            .values()
            .map(|q| QueueInfo {
                queue: q.meta.clone(),
                message_count: q.message_count(),
                consumer_count: q.consumer_count(),
            })
            .collect()
    }

    pub fn bindings(&self) -> Vec<Binding> {
        self.core.lock().bindings.clone()
    }

    pub fn consumers(&self) -> Vec<Consumer> {
        self.core.lock().consumers.values().cloned().collect()
    }

    pub fn status(&self) -> BrokerStatus {
        let core = self.core.lock();
        BrokerStatus {
            connections: core.connections.len(),
            exchanges: core.exchanges.len(),
            queues: core.queues.len(),
            bindings: core.bindings.len(),
            consumers: core.consumers.len(),
            messages: core.queues.values().map(|q| q.messages.len() as u64).sum(),
        }
    }
}
