//! End-to-end tests driving a started broker over real TCP with a minimal
//! AMQP 0-9-1 client built on the crate's own codec.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_util::codec::Framed;

use embermq::protocol::{
    BasicProperties, ContentHeader, FieldTable, Frame, FrameCodec, Method, PROTOCOL_HEADER,
};
use embermq::{Broker, BrokerConfig};

const WAIT: Duration = Duration::from_secs(5);

async fn start_broker(data_dir: &Path) -> Arc<Broker> {
    let config = BrokerConfig {
        host: "127.0.0.1".into(),
        port: 0,
        data_dir: data_dir.to_string_lossy().into_owned(),
        heartbeat: 0,
        ..Default::default()
    };
    let broker = Broker::new(config).expect("Failed to create broker");
    broker.start().await.expect("Failed to start broker");
    broker
}

struct TestClient {
    framed: Framed<TcpStream, FrameCodec>,
}

impl TestClient {
    async fn connect(addr: SocketAddr) -> Self {
        let mut stream = TcpStream::connect(addr).await.expect("Failed to connect");
        stream.write_all(&PROTOCOL_HEADER).await.expect("Failed to send protocol header");

        let mut client = Self { framed: Framed::new(stream, FrameCodec::new(131072)) };

        match client.expect_method().await {
            Method::ConnectionStart { mechanisms, .. } => {
                assert!(mechanisms.contains("PLAIN"));
            }
            other => panic!("expected Connection.Start, got {:?}", other),
        }
        client
            .send_method(
                0,
                Method::ConnectionStartOk {
                    client_properties: FieldTable::new(),
                    mechanism: "PLAIN".into(),
                    response: b"\0guest\0guest".to_vec(),
                    locale: "en_US".into(),
                },
            )
            .await;

        let (channel_max, frame_max, heartbeat) = match client.expect_method().await {
            Method::ConnectionTune { channel_max, frame_max, heartbeat } => {
                (channel_max, frame_max, heartbeat)
            }
            other => panic!("expected Connection.Tune, got {:?}", other),
        };
        client
            .send_method(0, Method::ConnectionTuneOk { channel_max, frame_max, heartbeat })
            .await;
        client.send_method(0, Method::ConnectionOpen { virtual_host: "/".into() }).await;
        match client.expect_method().await {
            Method::ConnectionOpenOk => {}
            other => panic!("expected Connection.Open-Ok, got {:?}", other),
        }
        client
    }

    async fn send(&mut self, frame: Frame) {
        self.framed.send(frame).await.expect("Failed to send frame");
    }

    async fn send_method(&mut self, channel: u16, method: Method) {
        self.send(Frame::method(channel, method)).await;
    }

    async fn recv(&mut self) -> Frame {
        timeout(WAIT, self.framed.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed unexpectedly")
            .expect("Failed to decode frame")
    }

    /// Next method frame, skipping heartbeats.
    async fn expect_method(&mut self) -> Method {
        loop {
            match self.recv().await {
                Frame::Method { method, .. } => return method,
                Frame::Heartbeat => continue,
                other => panic!("expected a method frame, got {:?}", other),
            }
        }
    }

    async fn open_channel(&mut self, channel: u16) {
        self.send_method(channel, Method::ChannelOpen).await;
        match self.expect_method().await {
            Method::ChannelOpenOk => {}
            other => panic!("expected Channel.Open-Ok, got {:?}", other),
        }
    }

    async fn declare_queue(&mut self, channel: u16, name: &str, durable: bool) {
        self.send_method(
            channel,
            Method::QueueDeclare {
                queue: name.into(),
                passive: false,
                durable,
                exclusive: false,
                auto_delete: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
        match self.expect_method().await {
            Method::QueueDeclareOk { .. } => {}
            other => panic!("expected Queue.Declare-Ok, got {:?}", other),
        }
    }

    async fn declare_exchange(&mut self, channel: u16, name: &str, kind: &str) {
        self.send_method(
            channel,
            Method::ExchangeDeclare {
                exchange: name.into(),
                kind: kind.into(),
                passive: false,
                durable: false,
                auto_delete: false,
                internal: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
        match self.expect_method().await {
            Method::ExchangeDeclareOk => {}
            other => panic!("expected Exchange.Declare-Ok, got {:?}", other),
        }
    }

    async fn bind_queue(&mut self, channel: u16, queue: &str, exchange: &str, routing_key: &str) {
        self.send_method(
            channel,
            Method::QueueBind {
                queue: queue.into(),
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
        match self.expect_method().await {
            Method::QueueBindOk => {}
            other => panic!("expected Queue.Bind-Ok, got {:?}", other),
        }
    }

    async fn publish(
        &mut self,
        channel: u16,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: BasicProperties,
    ) {
        self.send_method(
            channel,
            Method::BasicPublish {
                exchange: exchange.into(),
                routing_key: routing_key.into(),
                mandatory: false,
                immediate: false,
            },
        )
        .await;
        self.send(Frame::Header {
            channel,
            header: ContentHeader::new(body.len() as u64, properties),
        })
        .await;
        if !body.is_empty() {
            self.send(Frame::Body { channel, payload: Bytes::copy_from_slice(body) }).await;
        }
    }

    async fn consume(&mut self, channel: u16, queue: &str, no_ack: bool) -> String {
        self.send_method(
            channel,
            Method::BasicConsume {
                queue: queue.into(),
                consumer_tag: String::new(),
                no_local: false,
                no_ack,
                exclusive: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
        match self.expect_method().await {
            Method::BasicConsumeOk { consumer_tag } => consumer_tag,
            other => panic!("expected Basic.Consume-Ok, got {:?}", other),
        }
    }

    /// Read one Basic.Deliver with its content. Returns the method and the
    /// reassembled body.
    async fn next_delivery(&mut self) -> (Method, Bytes) {
        let deliver = self.expect_method().await;
        assert!(
            matches!(deliver, Method::BasicDeliver { .. }),
            "expected Basic.Deliver, got {:?}",
            deliver
        );
        let body = self.read_content().await;
        (deliver, body)
    }

    /// Read a content header and its body frames.
    async fn read_content(&mut self) -> Bytes {
        let body_size = match self.recv().await {
            Frame::Header { header, .. } => header.body_size,
            other => panic!("expected a content header, got {:?}", other),
        };
        let mut body = Vec::new();
        while (body.len() as u64) < body_size {
            match self.recv().await {
                Frame::Body { payload, .. } => body.extend_from_slice(&payload),
                other => panic!("expected a body frame, got {:?}", other),
            }
        }
        Bytes::from(body)
    }

    /// Basic.Get; `Some((get_ok, body))` or `None` on Get-Empty.
    async fn get(&mut self, channel: u16, queue: &str, no_ack: bool) -> Option<(Method, Bytes)> {
        self.send_method(channel, Method::BasicGet { queue: queue.into(), no_ack }).await;
        match self.expect_method().await {
            Method::BasicGetEmpty => None,
            get_ok @ Method::BasicGetOk { .. } => {
                let body = self.read_content().await;
                Some((get_ok, body))
            }
            other => panic!("expected Get-Ok or Get-Empty, got {:?}", other),
        }
    }

    async fn ack(&mut self, channel: u16, delivery_tag: u64) {
        self.send_method(channel, Method::BasicAck { delivery_tag, multiple: false }).await;
    }

    async fn close(mut self) {
        self.send_method(
            0,
            Method::ConnectionClose {
                reply_code: 200,
                reply_text: "bye".into(),
                class_id: 0,
                method_id: 0,
            },
        )
        .await;
        match self.expect_method().await {
            Method::ConnectionCloseOk => {}
            other => panic!("expected Connection.Close-Ok, got {:?}", other),
        }
    }
}

#[tokio::test]
async fn test_default_exchange_loopback() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    client.declare_queue(1, "q1", false).await;
    client.consume(1, "q1", true).await;
    client.publish(1, "", "q1", b"hello", BasicProperties::default()).await;

    let (deliver, body) = client.next_delivery().await;
    match deliver {
        Method::BasicDeliver { exchange, routing_key, .. } => {
            assert_eq!(exchange, "");
            assert_eq!(routing_key, "q1");
        }
        _ => unreachable!(),
    }
    assert_eq!(body, Bytes::from("hello"));

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_fanout_broadcast() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    client.declare_exchange(1, "e", "fanout").await;
    client.declare_queue(1, "a", false).await;
    client.declare_queue(1, "b", false).await;
    client.bind_queue(1, "a", "e", "").await;
    client.bind_queue(1, "b", "e", "").await;

    client.publish(1, "e", "", b"broadcast", BasicProperties::default()).await;

    for queue in ["a", "b"] {
        let (_, body) =
            client.get(1, queue, true).await.unwrap_or_else(|| panic!("'{}' must hold one", queue));
        assert_eq!(body, Bytes::from("broadcast"));
        assert!(client.get(1, queue, true).await.is_none(), "'{}' must be empty", queue);
    }

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_topic_wildcards() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    client.declare_exchange(1, "t", "topic").await;
    client.declare_queue(1, "all", false).await;
    client.declare_queue(1, "stock", false).await;
    client.bind_queue(1, "all", "t", "#").await;
    client.bind_queue(1, "stock", "t", "stock.*").await;

    client.publish(1, "t", "stock.nasdaq", b"nasdaq", BasicProperties::default()).await;
    client.publish(1, "t", "weather.usa", b"weather", BasicProperties::default()).await;

    let (_, first) = client.get(1, "all", true).await.expect("'all' gets both");
    assert_eq!(first, Bytes::from("nasdaq"));
    let (_, second) = client.get(1, "all", true).await.expect("'all' gets both");
    assert_eq!(second, Bytes::from("weather"));
    assert!(client.get(1, "all", true).await.is_none());

    let (_, only) = client.get(1, "stock", true).await.expect("'stock' gets one");
    assert_eq!(only, Bytes::from("nasdaq"));
    assert!(client.get(1, "stock", true).await.is_none());

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_prefetch_one_work_queue() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    client.declare_queue(1, "w", true).await;
    client
        .send_method(1, Method::BasicQos { prefetch_size: 0, prefetch_count: 1, global: false })
        .await;
    assert!(matches!(client.expect_method().await, Method::BasicQosOk));
    client.consume(1, "w", false).await;

    let persistent = BasicProperties { delivery_mode: Some(2), ..Default::default() };
    for body in [b"job1".as_ref(), b"job2".as_ref(), b"job3".as_ref()] {
        client.publish(1, "", "w", body, persistent.clone()).await;
    }

    for expected in [b"job1".as_ref(), b"job2".as_ref(), b"job3".as_ref()] {
        let (deliver, body) = client.next_delivery().await;
        assert_eq!(body, Bytes::copy_from_slice(expected));
        let Method::BasicDeliver { delivery_tag, .. } = deliver else { unreachable!() };
        client.ack(1, delivery_tag).await;
    }

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_nack_with_requeue_redelivers() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    client.declare_queue(1, "r", false).await;
    client.consume(1, "r", false).await;
    client.publish(1, "", "r", b"try-again", BasicProperties::default()).await;

    let (deliver, body) = client.next_delivery().await;
    assert_eq!(body, Bytes::from("try-again"));
    let Method::BasicDeliver { delivery_tag, redelivered, .. } = deliver else { unreachable!() };
    assert!(!redelivered);
    client
        .send_method(1, Method::BasicNack { delivery_tag, multiple: false, requeue: true })
        .await;

    let (deliver, body) = client.next_delivery().await;
    assert_eq!(body, Bytes::from("try-again"));
    let Method::BasicDeliver { delivery_tag, redelivered, .. } = deliver else { unreachable!() };
    assert!(redelivered);
    client.ack(1, delivery_tag).await;

    assert!(client.get(1, "r", true).await.is_none(), "queue must be empty after the ack");

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_durability_across_restart() {
    let dir = tempfile::tempdir().unwrap();

    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();
    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    client.declare_queue(1, "d", true).await;
    let persistent = BasicProperties { delivery_mode: Some(2), ..Default::default() };
    client.publish(1, "", "d", b"keep", persistent).await;
    // The publish has no reply; a synchronous method after it proves the
    // broker processed the content frames.
    client.declare_queue(1, "d", true).await;
    client.close().await;
    broker.stop().await;

    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();
    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    let (_, body) = client.get(1, "d", true).await.expect("durable message must survive");
    assert_eq!(body, Bytes::from("keep"));
    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_mandatory_unroutable_is_returned() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    client.declare_exchange(1, "nowhere", "direct").await;
    client
        .send_method(
            1,
            Method::BasicPublish {
                exchange: "nowhere".into(),
                routing_key: "missing".into(),
                mandatory: true,
                immediate: false,
            },
        )
        .await;
    client
        .send(Frame::Header {
            channel: 1,
            header: ContentHeader::new(4, BasicProperties::default()),
        })
        .await;
    client.send(Frame::Body { channel: 1, payload: Bytes::from("lost") }).await;

    match client.expect_method().await {
        Method::BasicReturn { reply_code, reply_text, exchange, routing_key } => {
            assert_eq!(reply_code, 313);
            assert_eq!(reply_text, "No route");
            assert_eq!(exchange, "nowhere");
            assert_eq!(routing_key, "missing");
        }
        other => panic!("expected Basic.Return, got {:?}", other),
    }
    assert_eq!(client.read_content().await, Bytes::from("lost"));

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_large_body_is_split_into_frames() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut client = TestClient::connect(addr).await;
    client.open_channel(1).await;
    client.declare_queue(1, "big", false).await;

    // Larger than one frame payload (frame_max - 8).
    let body: Vec<u8> = (0..200_000).map(|i| (i % 251) as u8).collect();
    // Publish in legal chunks ourselves.
    client
        .send_method(
            1,
            Method::BasicPublish {
                exchange: String::new(),
                routing_key: "big".into(),
                mandatory: false,
                immediate: false,
            },
        )
        .await;
    client
        .send(Frame::Header {
            channel: 1,
            header: ContentHeader::new(body.len() as u64, BasicProperties::default()),
        })
        .await;
    for chunk in body.chunks(131072 - 8) {
        client.send(Frame::Body { channel: 1, payload: Bytes::copy_from_slice(chunk) }).await;
    }

    let (_, received) = client.get(1, "big", true).await.expect("message must round-trip");
    assert_eq!(received, Bytes::from(body));

    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_heartbeat_echo() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut client = TestClient::connect(addr).await;
    client.send(Frame::Heartbeat).await;
    match client.recv().await {
        Frame::Heartbeat => {}
        other => panic!("expected a heartbeat echo, got {:?}", other),
    }
    client.close().await;
    broker.stop().await;
}

#[tokio::test]
async fn test_bad_protocol_header_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream.write_all(b"HTTP/1.1").await.unwrap();

    // The server answers with its own header and closes the socket.
    let mut response = [0u8; 8];
    timeout(WAIT, stream.read_exact(&mut response))
        .await
        .expect("timed out")
        .expect("Failed to read response header");
    assert_eq!(response, PROTOCOL_HEADER);

    let mut rest = Vec::new();
    let n = timeout(WAIT, stream.read_to_end(&mut rest)).await.expect("timed out").unwrap();
    assert_eq!(n, 0, "socket must be closed after the header");

    broker.stop().await;
}

#[tokio::test]
async fn test_exclusive_queue_locked_across_connections() {
    let dir = tempfile::tempdir().unwrap();
    let broker = start_broker(dir.path()).await;
    let addr = broker.local_addr().unwrap();

    let mut owner = TestClient::connect(addr).await;
    owner.open_channel(1).await;
    owner
        .send_method(
            1,
            Method::QueueDeclare {
                queue: "private".into(),
                passive: false,
                durable: false,
                exclusive: true,
                auto_delete: false,
                no_wait: false,
                arguments: FieldTable::new(),
            },
        )
        .await;
    assert!(matches!(owner.expect_method().await, Method::QueueDeclareOk { .. }));

    let mut intruder = TestClient::connect(addr).await;
    intruder.open_channel(1).await;
    intruder.send_method(1, Method::BasicGet { queue: "private".into(), no_ack: true }).await;
    match intruder.expect_method().await {
        Method::ChannelClose { reply_code, .. } => assert_eq!(reply_code, 405),
        other => panic!("expected Channel.Close 405, got {:?}", other),
    }
    intruder.send_method(1, Method::ChannelCloseOk).await;
    intruder.close().await;

    // The owner's close deletes the exclusive queue.
    owner.close().await;
    let mut probe = TestClient::connect(addr).await;
    probe.open_channel(1).await;
    probe.send_method(1, Method::BasicGet { queue: "private".into(), no_ack: true }).await;
    match probe.expect_method().await {
        Method::ChannelClose { reply_code, .. } => assert_eq!(reply_code, 404),
        other => panic!("expected Channel.Close 404, got {:?}", other),
    }

    broker.stop().await;
}
