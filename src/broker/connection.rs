//! Per-connection driver: protocol header check, handshake, frame loop,
//! writer task and heartbeat timer.
//!
//! Each accepted socket runs one driver task. The driver owns the handshake
//! state machine; once the connection reaches `open` it registers with the
//! broker and every subsequent frame flows through the broker core under the
//! broker lock. Outbound frames (replies and deliveries from any
//! connection's activity) are queued on an unbounded channel and drained by
//! a writer task, so the broker never blocks on a slow socket.

use bytes::BufMut;
use futures::{SinkExt, StreamExt};
use std::io::Cursor;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tracing::{debug, info, warn};

use crate::broker::handler::FrameOutcome;
use crate::broker::server::Broker;
use crate::protocol::field_table::{decode_table, FieldTable};
use crate::protocol::{
    methods, Frame, FrameCodec, Method, ACCESS_REFUSED, CLASS_CONNECTION, PROTOCOL_HEADER,
};
use crate::protocol::FieldValue;

const MECHANISMS: &str = "PLAIN AMQPLAIN";
const LOCALES: &str = "en_US";

/// The identity table advertised in `Connection.Start`.
fn server_properties() -> FieldTable {
    let mut capabilities = FieldTable::new();
    capabilities.insert("publisher_confirms".into(), FieldValue::Bool(false));
    capabilities.insert("basic.nack".into(), FieldValue::Bool(true));
    capabilities.insert("consumer_cancel_notify".into(), FieldValue::Bool(true));
    capabilities.insert("per_consumer_qos".into(), FieldValue::Bool(true));
    capabilities.insert("authentication_failure_close".into(), FieldValue::Bool(true));
    capabilities.insert("exchange_exchange_bindings".into(), FieldValue::Bool(false));

    let mut properties = FieldTable::new();
    properties.insert("product".into(), FieldValue::LongString("embermq".into()));
    properties
        .insert("version".into(), FieldValue::LongString(env!("CARGO_PKG_VERSION").into()));
    properties.insert("platform".into(), FieldValue::LongString("Rust".into()));
    properties.insert("capabilities".into(), FieldValue::Table(capabilities));
    properties
}

/// A client value of zero means "no limit from my side": use the server's.
fn negotiate<T: Ord + Copy + From<u8>>(client: T, server: T) -> T {
    if client == T::from(0u8) {
        server
    } else {
        client.min(server)
    }
}

/// Extract credentials from a Start-Ok response. The values are accepted
/// unconditionally afterwards; this parse is the hook point a real
/// credential validator would replace.
fn parse_credentials(mechanism: &str, response: &[u8]) -> Result<(String, String), String> {
    match mechanism {
        "PLAIN" => {
            // authzid NUL user NUL password
            let parts: Vec<&[u8]> = response.split(|b| *b == 0).collect();
            if parts.len() != 3 || parts[1].is_empty() {
                return Err("malformed PLAIN response".into());
            }
            Ok((
                String::from_utf8_lossy(parts[1]).into_owned(),
                String::from_utf8_lossy(parts[2]).into_owned(),
            ))
        }
        "AMQPLAIN" => {
            // A field table body without the length prefix.
            let mut buf = bytes::BytesMut::with_capacity(response.len() + 4);
            buf.put_u32(response.len() as u32);
            buf.put_slice(response);
            let table = decode_table(&mut Cursor::new(buf.as_ref()))
                .map_err(|e| format!("malformed AMQPLAIN table: {}", e))?;
            let login = match table.get("LOGIN") {
                Some(FieldValue::LongString(s)) => s.clone(),
                _ => return Err("AMQPLAIN response missing LOGIN".into()),
            };
            let password = match table.get("PASSWORD") {
                Some(FieldValue::LongString(s)) => s.clone(),
                _ => return Err("AMQPLAIN response missing PASSWORD".into()),
            };
            Ok((login, password))
        }
        other => Err(format!("unsupported mechanism '{}'", other)),
    }
}

/// Read frames until a method arrives, echoing heartbeats. `None` means the
/// peer went away or sent something other than a method frame.
async fn next_method(framed: &mut Framed<TcpStream, FrameCodec>) -> crate::Result<Option<Method>> {
    loop {
        match framed.next().await {
            Some(Ok(Frame::Method { method, .. })) => return Ok(Some(method)),
            Some(Ok(Frame::Heartbeat)) => {
                framed.send(Frame::Heartbeat).await?;
            }
            Some(Ok(_)) => return Ok(None),
            Some(Err(e)) => return Err(e.into()),
            None => return Ok(None),
        }
    }
}

/// Drive one client connection from accept to teardown.
pub(crate) async fn run_connection(
    broker: Arc<Broker>,
    mut socket: TcpStream,
    peer: std::net::SocketAddr,
) -> crate::Result<()> {
    // Every AMQP connection opens with the 8-byte protocol header. On a
    // mismatch the server answers with its own header and hangs up.
    let mut header = [0u8; 8];
    socket.read_exact(&mut header).await?;
    if header != PROTOCOL_HEADER {
        warn!("{} sent an unsupported protocol header {:02x?}", peer, header);
        socket.write_all(&PROTOCOL_HEADER).await?;
        return Ok(());
    }

    let config = broker.config().clone();
    let mut framed = Framed::new(socket, FrameCodec::new(config.frame_max));

    framed
        .send(Frame::method(
            0,
            Method::ConnectionStart {
                version_major: 0,
                version_minor: 9,
                server_properties: server_properties(),
                mechanisms: MECHANISMS.into(),
                locales: LOCALES.into(),
            },
        ))
        .await?;

    let (client_properties, mechanism, response) = match next_method(&mut framed).await? {
        Some(Method::ConnectionStartOk { client_properties, mechanism, response, .. }) => {
            (client_properties, mechanism, response)
        }
        Some(Method::ConnectionClose { .. }) => {
            framed.send(Frame::method(0, Method::ConnectionCloseOk)).await?;
            return Ok(());
        }
        _ => {
            debug!("{} hung up before Start-Ok", peer);
            return Ok(());
        }
    };

    match parse_credentials(&mechanism, &response) {
        Ok((user, _password)) => {
            debug!("{} authenticated as '{}' via {}", peer, user, mechanism);
        }
        Err(reason) => {
            warn!("{} rejected: {}", peer, reason);
            framed
                .send(Frame::method(
                    0,
                    Method::ConnectionClose {
                        reply_code: ACCESS_REFUSED,
                        reply_text: reason,
                        class_id: CLASS_CONNECTION,
                        method_id: methods::CONNECTION_START_OK,
                    },
                ))
                .await?;
            let _ = next_method(&mut framed).await; // best-effort Close-Ok
            return Ok(());
        }
    }

    framed
        .send(Frame::method(
            0,
            Method::ConnectionTune {
                channel_max: config.channel_max,
                frame_max: config.frame_max,
                heartbeat: config.heartbeat,
            },
        ))
        .await?;

    let (channel_max, frame_max, heartbeat) = match next_method(&mut framed).await? {
        Some(Method::ConnectionTuneOk { channel_max, frame_max, heartbeat }) => (
            negotiate(channel_max, config.channel_max),
            negotiate(frame_max, config.frame_max),
            negotiate(heartbeat, config.heartbeat),
        ),
        _ => {
            debug!("{} hung up before Tune-Ok", peer);
            return Ok(());
        }
    };

    let virtual_host = match next_method(&mut framed).await? {
        Some(Method::ConnectionOpen { virtual_host }) => virtual_host,
        Some(Method::ConnectionClose { .. }) => {
            framed.send(Frame::method(0, Method::ConnectionCloseOk)).await?;
            return Ok(());
        }
        _ => {
            debug!("{} hung up before Open", peer);
            return Ok(());
        }
    };

    let conn_id = broker.next_connection_id();
    let (tx, mut rx) = mpsc::unbounded_channel::<Frame>();
    broker.register_connection(
        conn_id,
        peer.to_string(),
        virtual_host.clone(),
        channel_max,
        frame_max,
        heartbeat,
        client_properties,
        tx.clone(),
    );
    framed.send(Frame::method(0, Method::ConnectionOpenOk)).await?;
    info!(
        "connection {} open: peer={} vhost='{}' channel_max={} frame_max={} heartbeat={}s",
        conn_id, peer, virtual_host, channel_max, frame_max, heartbeat
    );

    let (mut sink, mut stream) = framed.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if sink.send(frame).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    // The heartbeat timer doubles as the dead-peer detector: two missed
    // intervals destroy the connection. A zero heartbeat disables both.
    let heartbeat_period = if heartbeat > 0 {
        Duration::from_secs(u64::from(heartbeat))
    } else {
        Duration::from_secs(3600)
    };
    let mut ticker = tokio::time::interval(heartbeat_period);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    ticker.tick().await; // the first tick completes immediately

    let mut last_frame = Instant::now();
    loop {
        tokio::select! {
            inbound = stream.next() => match inbound {
                Some(Ok(frame)) => {
                    last_frame = Instant::now();
                    if matches!(frame, Frame::Heartbeat) {
                        let _ = tx.send(Frame::Heartbeat);
                        continue;
                    }
                    if broker.handle_frame(conn_id, frame) == FrameOutcome::CloseConnection {
                        break;
                    }
                }
                Some(Err(e)) => {
                    warn!("connection {}: unrecoverable framing failure: {}", conn_id, e);
                    broker.emit_connection_error(conn_id, e.to_string());
                    let _ = tx.send(Frame::method(
                        0,
                        Method::ConnectionClose {
                            reply_code: e.reply_code(),
                            reply_text: e.to_string(),
                            class_id: 0,
                            method_id: 0,
                        },
                    ));
                    break;
                }
                None => {
                    debug!("connection {} closed by peer", conn_id);
                    break;
                }
            },
            _ = ticker.tick() => {
                if heartbeat > 0 {
                    if last_frame.elapsed() > heartbeat_period * 2 {
                        warn!("connection {} missed heartbeats, destroying", conn_id);
                        broker.emit_connection_error(conn_id, "heartbeat timeout".into());
                        break;
                    }
                    let _ = tx.send(Frame::Heartbeat);
                }
            }
        }
    }

    drop(tx);
    broker.connection_closed(conn_id);
    let _ = writer.await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_negotiation_prefers_smaller_nonzero() {
        assert_eq!(negotiate(0u16, 2047), 2047);
        assert_eq!(negotiate(100u16, 2047), 100);
        assert_eq!(negotiate(4000u16, 2047), 2047);
        assert_eq!(negotiate(0u32, 131072), 131072);
        assert_eq!(negotiate(65536u32, 131072), 65536);
    }

    #[test]
    fn test_plain_credentials() {
        let (user, password) = parse_credentials("PLAIN", b"\0guest\0secret").unwrap();
        assert_eq!(user, "guest");
        assert_eq!(password, "secret");

        assert!(parse_credentials("PLAIN", b"no separators").is_err());
        assert!(parse_credentials("PLAIN", b"\0\0empty-user").is_err());
    }

    #[test]
    fn test_amqplain_credentials() {
        // AMQPLAIN carries a table body without the length prefix.
        let mut table = FieldTable::new();
        table.insert("LOGIN".into(), FieldValue::LongString("guest".into()));
        table.insert("PASSWORD".into(), FieldValue::LongString("guest".into()));
        let mut buf = bytes::BytesMut::new();
        crate::protocol::field_table::encode_table(&mut buf, &table).unwrap();
        let body = &buf[4..]; // strip the length prefix

        let (user, password) = parse_credentials("AMQPLAIN", body).unwrap();
        assert_eq!(user, "guest");
        assert_eq!(password, "guest");

        assert!(parse_credentials("AMQPLAIN", b"garbage").is_err());
    }

    #[test]
    fn test_unknown_mechanism_is_rejected() {
        assert!(parse_credentials("EXTERNAL", b"").is_err());
    }

    #[test]
    fn test_server_properties_capabilities() {
        let properties = server_properties();
        let Some(FieldValue::Table(capabilities)) = properties.get("capabilities") else {
            panic!("capabilities table missing");
        };
        assert_eq!(capabilities.get("basic.nack"), Some(&FieldValue::Bool(true)));
        assert_eq!(capabilities.get("publisher_confirms"), Some(&FieldValue::Bool(false)));
    }
}
