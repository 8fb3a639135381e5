//! Per-method argument parsing and encoding.
//!
//! A method frame payload is a u16 class id, a u16 method id, then the
//! method's arguments. Consecutive bit arguments are packed into a single
//! octet in method-defined order; the bit layouts below match what compliant
//! clients expect. Reserved `ticket` fields are decoded and ignored, and
//! reserved strings are encoded empty.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io::Cursor;

use super::field_table::{
    decode_long_string, decode_short_string, decode_table, encode_long_string,
    encode_short_string, encode_table, FieldTable,
};
use super::{
    CodecError, Result, CLASS_BASIC, CLASS_CHANNEL, CLASS_CONNECTION, CLASS_EXCHANGE, CLASS_QUEUE,
};

pub const CONNECTION_START: u16 = 10;
pub const CONNECTION_START_OK: u16 = 11;
pub const CONNECTION_TUNE: u16 = 30;
pub const CONNECTION_TUNE_OK: u16 = 31;
pub const CONNECTION_OPEN: u16 = 40;
pub const CONNECTION_OPEN_OK: u16 = 41;
pub const CONNECTION_CLOSE: u16 = 50;
pub const CONNECTION_CLOSE_OK: u16 = 51;

pub const CHANNEL_OPEN: u16 = 10;
pub const CHANNEL_OPEN_OK: u16 = 11;
pub const CHANNEL_FLOW: u16 = 20;
pub const CHANNEL_FLOW_OK: u16 = 21;
pub const CHANNEL_CLOSE: u16 = 40;
pub const CHANNEL_CLOSE_OK: u16 = 41;

pub const EXCHANGE_DECLARE: u16 = 10;
pub const EXCHANGE_DECLARE_OK: u16 = 11;
pub const EXCHANGE_DELETE: u16 = 20;
pub const EXCHANGE_DELETE_OK: u16 = 21;

pub const QUEUE_DECLARE: u16 = 10;
pub const QUEUE_DECLARE_OK: u16 = 11;
pub const QUEUE_BIND: u16 = 20;
pub const QUEUE_BIND_OK: u16 = 21;
pub const QUEUE_PURGE: u16 = 30;
pub const QUEUE_PURGE_OK: u16 = 31;
pub const QUEUE_DELETE: u16 = 40;
pub const QUEUE_DELETE_OK: u16 = 41;
pub const QUEUE_UNBIND: u16 = 50;
pub const QUEUE_UNBIND_OK: u16 = 51;

pub const BASIC_QOS: u16 = 10;
pub const BASIC_QOS_OK: u16 = 11;
pub const BASIC_CONSUME: u16 = 20;
pub const BASIC_CONSUME_OK: u16 = 21;
pub const BASIC_CANCEL: u16 = 30;
pub const BASIC_CANCEL_OK: u16 = 31;
pub const BASIC_PUBLISH: u16 = 40;
pub const BASIC_RETURN: u16 = 50;
pub const BASIC_DELIVER: u16 = 60;
pub const BASIC_GET: u16 = 70;
pub const BASIC_GET_OK: u16 = 71;
pub const BASIC_GET_EMPTY: u16 = 72;
pub const BASIC_ACK: u16 = 80;
pub const BASIC_REJECT: u16 = 90;
pub const BASIC_RECOVER_ASYNC: u16 = 100;
pub const BASIC_RECOVER: u16 = 110;
pub const BASIC_RECOVER_OK: u16 = 111;
pub const BASIC_NACK: u16 = 120;

/// A decoded AMQP method with its arguments.
#[derive(Debug, Clone, PartialEq)]
pub enum Method {
    ConnectionStart {
        version_major: u8,
        version_minor: u8,
        server_properties: FieldTable,
        mechanisms: String,
        locales: String,
    },
    ConnectionStartOk {
        client_properties: FieldTable,
        mechanism: String,
        response: Vec<u8>,
        locale: String,
    },
    ConnectionTune {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionTuneOk {
        channel_max: u16,
        frame_max: u32,
        heartbeat: u16,
    },
    ConnectionOpen {
        virtual_host: String,
    },
    ConnectionOpenOk,
    ConnectionClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ConnectionCloseOk,

    ChannelOpen,
    ChannelOpenOk,
    ChannelFlow {
        active: bool,
    },
    ChannelFlowOk {
        active: bool,
    },
    ChannelClose {
        reply_code: u16,
        reply_text: String,
        class_id: u16,
        method_id: u16,
    },
    ChannelCloseOk,

    ExchangeDeclare {
        exchange: String,
        kind: String,
        passive: bool,
        durable: bool,
        auto_delete: bool,
        internal: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    ExchangeDeclareOk,
    ExchangeDelete {
        exchange: String,
        if_unused: bool,
        no_wait: bool,
    },
    ExchangeDeleteOk,

    QueueDeclare {
        queue: String,
        passive: bool,
        durable: bool,
        exclusive: bool,
        auto_delete: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueDeclareOk {
        queue: String,
        message_count: u32,
        consumer_count: u32,
    },
    QueueBind {
        queue: String,
        exchange: String,
        routing_key: String,
        no_wait: bool,
        arguments: FieldTable,
    },
    QueueBindOk,
    QueuePurge {
        queue: String,
        no_wait: bool,
    },
    QueuePurgeOk {
        message_count: u32,
    },
    QueueDelete {
        queue: String,
        if_unused: bool,
        if_empty: bool,
        no_wait: bool,
    },
    QueueDeleteOk {
        message_count: u32,
    },
    QueueUnbind {
        queue: String,
        exchange: String,
        routing_key: String,
        arguments: FieldTable,
    },
    QueueUnbindOk,

    BasicQos {
        prefetch_size: u32,
        prefetch_count: u16,
        global: bool,
    },
    BasicQosOk,
    BasicConsume {
        queue: String,
        consumer_tag: String,
        no_local: bool,
        no_ack: bool,
        exclusive: bool,
        no_wait: bool,
        arguments: FieldTable,
    },
    BasicConsumeOk {
        consumer_tag: String,
    },
    BasicCancel {
        consumer_tag: String,
        no_wait: bool,
    },
    BasicCancelOk {
        consumer_tag: String,
    },
    BasicPublish {
        exchange: String,
        routing_key: String,
        mandatory: bool,
        immediate: bool,
    },
    BasicReturn {
        reply_code: u16,
        reply_text: String,
        exchange: String,
        routing_key: String,
    },
    BasicDeliver {
        consumer_tag: String,
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
    },
    BasicGet {
        queue: String,
        no_ack: bool,
    },
    BasicGetOk {
        delivery_tag: u64,
        redelivered: bool,
        exchange: String,
        routing_key: String,
        message_count: u32,
    },
    BasicGetEmpty,
    BasicAck {
        delivery_tag: u64,
        multiple: bool,
    },
    BasicReject {
        delivery_tag: u64,
        requeue: bool,
    },
    BasicRecoverAsync {
        requeue: bool,
    },
    BasicRecover {
        requeue: bool,
    },
    BasicRecoverOk,
    BasicNack {
        delivery_tag: u64,
        multiple: bool,
        requeue: bool,
    },
}

fn need(cursor: &Cursor<&[u8]>, bytes: usize) -> Result<()> {
    if cursor.remaining() < bytes {
        return Err(CodecError::Syntax(format!(
            "truncated method arguments: needed {} bytes, {} available",
            bytes,
            cursor.remaining()
        )));
    }
    Ok(())
}

fn decode_bits(cursor: &mut Cursor<&[u8]>) -> Result<u8> {
    need(cursor, 1)?;
    Ok(cursor.get_u8())
}

impl Method {
    /// The (class id, method id) pair identifying this method on the wire.
    pub fn class_and_method(&self) -> (u16, u16) {
        match self {
            Method::ConnectionStart { .. } => (CLASS_CONNECTION, CONNECTION_START),
            Method::ConnectionStartOk { .. } => (CLASS_CONNECTION, CONNECTION_START_OK),
            Method::ConnectionTune { .. } => (CLASS_CONNECTION, CONNECTION_TUNE),
            Method::ConnectionTuneOk { .. } => (CLASS_CONNECTION, CONNECTION_TUNE_OK),
            Method::ConnectionOpen { .. } => (CLASS_CONNECTION, CONNECTION_OPEN),
            Method::ConnectionOpenOk => (CLASS_CONNECTION, CONNECTION_OPEN_OK),
            Method::ConnectionClose { .. } => (CLASS_CONNECTION, CONNECTION_CLOSE),
            Method::ConnectionCloseOk => (CLASS_CONNECTION, CONNECTION_CLOSE_OK),
            Method::ChannelOpen => (CLASS_CHANNEL, CHANNEL_OPEN),
            Method::ChannelOpenOk => (CLASS_CHANNEL, CHANNEL_OPEN_OK),
            Method::ChannelFlow { .. } => (CLASS_CHANNEL, CHANNEL_FLOW),
            Method::ChannelFlowOk { .. } => (CLASS_CHANNEL, CHANNEL_FLOW_OK),
            Method::ChannelClose { .. } => (CLASS_CHANNEL, CHANNEL_CLOSE),
            Method::ChannelCloseOk => (CLASS_CHANNEL, CHANNEL_CLOSE_OK),
            Method::ExchangeDeclare { .. } => (CLASS_EXCHANGE, EXCHANGE_DECLARE),
            Method::ExchangeDeclareOk => (CLASS_EXCHANGE, EXCHANGE_DECLARE_OK),
            Method::ExchangeDelete { .. } => (CLASS_EXCHANGE, EXCHANGE_DELETE),
            Method::ExchangeDeleteOk => (CLASS_EXCHANGE, EXCHANGE_DELETE_OK),
            Method::QueueDeclare { .. } => (CLASS_QUEUE, QUEUE_DECLARE),
            Method::QueueDeclareOk { .. } => (CLASS_QUEUE, QUEUE_DECLARE_OK),
            Method::QueueBind { .. } => (CLASS_QUEUE, QUEUE_BIND),
            Method::QueueBindOk => (CLASS_QUEUE, QUEUE_BIND_OK),
            Method::QueuePurge { .. } => (CLASS_QUEUE, QUEUE_PURGE),
            Method::QueuePurgeOk { .. } => (CLASS_QUEUE, QUEUE_PURGE_OK),
            Method::QueueDelete { .. } => (CLASS_QUEUE, QUEUE_DELETE),
            Method::QueueDeleteOk { .. } => (CLASS_QUEUE, QUEUE_DELETE_OK),
            Method::QueueUnbind { .. } => (CLASS_QUEUE, QUEUE_UNBIND),
            Method::QueueUnbindOk => (CLASS_QUEUE, QUEUE_UNBIND_OK),
            Method::BasicQos { .. } => (CLASS_BASIC, BASIC_QOS),
            Method::BasicQosOk => (CLASS_BASIC, BASIC_QOS_OK),
            Method::BasicConsume { .. } => (CLASS_BASIC, BASIC_CONSUME),
            Method::BasicConsumeOk { .. } => (CLASS_BASIC, BASIC_CONSUME_OK),
            Method::BasicCancel { .. } => (CLASS_BASIC, BASIC_CANCEL),
            Method::BasicCancelOk { .. } => (CLASS_BASIC, BASIC_CANCEL_OK),
            Method::BasicPublish { .. } => (CLASS_BASIC, BASIC_PUBLISH),
            Method::BasicReturn { .. } => (CLASS_BASIC, BASIC_RETURN),
            Method::BasicDeliver { .. } => (CLASS_BASIC, BASIC_DELIVER),
            Method::BasicGet { .. } => (CLASS_BASIC, BASIC_GET),
            Method::BasicGetOk { .. } => (CLASS_BASIC, BASIC_GET_OK),
            Method::BasicGetEmpty => (CLASS_BASIC, BASIC_GET_EMPTY),
            Method::BasicAck { .. } => (CLASS_BASIC, BASIC_ACK),
            Method::BasicReject { .. } => (CLASS_BASIC, BASIC_REJECT),
            Method::BasicRecoverAsync { .. } => (CLASS_BASIC, BASIC_RECOVER_ASYNC),
            Method::BasicRecover { .. } => (CLASS_BASIC, BASIC_RECOVER),
            Method::BasicRecoverOk => (CLASS_BASIC, BASIC_RECOVER_OK),
            Method::BasicNack { .. } => (CLASS_BASIC, BASIC_NACK),
        }
    }

    /// Decode a method frame payload.
    pub fn decode(payload: &[u8]) -> Result<Method> {
        let mut cursor = Cursor::new(payload);
        need(&cursor, 4)?;
        let class_id = cursor.get_u16();
        let method_id = cursor.get_u16();
        let cursor = &mut cursor;

        match (class_id, method_id) {
            (CLASS_CONNECTION, CONNECTION_START) => {
                need(cursor, 2)?;
                let version_major = cursor.get_u8();
                let version_minor = cursor.get_u8();
                let server_properties = decode_table(cursor)?;
                let mechanisms = decode_long_string(cursor)?;
                let locales = decode_long_string(cursor)?;
                Ok(Method::ConnectionStart {
                    version_major,
                    version_minor,
                    server_properties,
                    mechanisms,
                    locales,
                })
            }
            (CLASS_CONNECTION, CONNECTION_START_OK) => {
                let client_properties = decode_table(cursor)?;
                let mechanism = decode_short_string(cursor)?;
                need(cursor, 4)?;
                let len = cursor.get_u32() as usize;
                need(cursor, len)?;
                let mut response = vec![0u8; len];
                cursor.copy_to_slice(&mut response);
                let locale = decode_short_string(cursor)?;
                Ok(Method::ConnectionStartOk { client_properties, mechanism, response, locale })
            }
            (CLASS_CONNECTION, CONNECTION_TUNE) => {
                need(cursor, 8)?;
                Ok(Method::ConnectionTune {
                    channel_max: cursor.get_u16(),
                    frame_max: cursor.get_u32(),
                    heartbeat: cursor.get_u16(),
                })
            }
            (CLASS_CONNECTION, CONNECTION_TUNE_OK) => {
                need(cursor, 8)?;
                Ok(Method::ConnectionTuneOk {
                    channel_max: cursor.get_u16(),
                    frame_max: cursor.get_u32(),
                    heartbeat: cursor.get_u16(),
                })
            }
            (CLASS_CONNECTION, CONNECTION_OPEN) => {
                let virtual_host = decode_short_string(cursor)?;
                let _capabilities = decode_short_string(cursor)?;
                let _insist = decode_bits(cursor)?;
                Ok(Method::ConnectionOpen { virtual_host })
            }
            (CLASS_CONNECTION, CONNECTION_OPEN_OK) => {
                let _known_hosts = decode_short_string(cursor)?;
                Ok(Method::ConnectionOpenOk)
            }
            (CLASS_CONNECTION, CONNECTION_CLOSE) => {
                need(cursor, 2)?;
                let reply_code = cursor.get_u16();
                let reply_text = decode_short_string(cursor)?;
                need(cursor, 4)?;
                Ok(Method::ConnectionClose {
                    reply_code,
                    reply_text,
                    class_id: cursor.get_u16(),
                    method_id: cursor.get_u16(),
                })
            }
            (CLASS_CONNECTION, CONNECTION_CLOSE_OK) => Ok(Method::ConnectionCloseOk),

            (CLASS_CHANNEL, CHANNEL_OPEN) => {
                let _out_of_band = decode_short_string(cursor)?;
                Ok(Method::ChannelOpen)
            }
            (CLASS_CHANNEL, CHANNEL_OPEN_OK) => {
                let _reserved = decode_long_string(cursor)?;
                Ok(Method::ChannelOpenOk)
            }
            (CLASS_CHANNEL, CHANNEL_FLOW) => {
                let bits = decode_bits(cursor)?;
                Ok(Method::ChannelFlow { active: bits & 0x01 != 0 })
            }
            (CLASS_CHANNEL, CHANNEL_FLOW_OK) => {
                let bits = decode_bits(cursor)?;
                Ok(Method::ChannelFlowOk { active: bits & 0x01 != 0 })
            }
            (CLASS_CHANNEL, CHANNEL_CLOSE) => {
                need(cursor, 2)?;
                let reply_code = cursor.get_u16();
                let reply_text = decode_short_string(cursor)?;
                need(cursor, 4)?;
                Ok(Method::ChannelClose {
                    reply_code,
                    reply_text,
                    class_id: cursor.get_u16(),
                    method_id: cursor.get_u16(),
                })
            }
            (CLASS_CHANNEL, CHANNEL_CLOSE_OK) => Ok(Method::ChannelCloseOk),

            (CLASS_EXCHANGE, EXCHANGE_DECLARE) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let exchange = decode_short_string(cursor)?;
                let kind = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                let arguments = decode_table(cursor)?;
                Ok(Method::ExchangeDeclare {
                    exchange,
                    kind,
                    passive: bits & 0x01 != 0,
                    durable: bits & 0x02 != 0,
                    auto_delete: bits & 0x04 != 0,
                    internal: bits & 0x08 != 0,
                    no_wait: bits & 0x10 != 0,
                    arguments,
                })
            }
            (CLASS_EXCHANGE, EXCHANGE_DECLARE_OK) => Ok(Method::ExchangeDeclareOk),
            (CLASS_EXCHANGE, EXCHANGE_DELETE) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let exchange = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                Ok(Method::ExchangeDelete {
                    exchange,
                    if_unused: bits & 0x01 != 0,
                    no_wait: bits & 0x02 != 0,
                })
            }
            (CLASS_EXCHANGE, EXCHANGE_DELETE_OK) => Ok(Method::ExchangeDeleteOk),

            (CLASS_QUEUE, QUEUE_DECLARE) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let queue = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                let arguments = decode_table(cursor)?;
                Ok(Method::QueueDeclare {
                    queue,
                    passive: bits & 0x01 != 0,
                    durable: bits & 0x02 != 0,
                    exclusive: bits & 0x04 != 0,
                    auto_delete: bits & 0x08 != 0,
                    no_wait: bits & 0x10 != 0,
                    arguments,
                })
            }
            (CLASS_QUEUE, QUEUE_DECLARE_OK) => {
                let queue = decode_short_string(cursor)?;
                need(cursor, 8)?;
                Ok(Method::QueueDeclareOk {
                    queue,
                    message_count: cursor.get_u32(),
                    consumer_count: cursor.get_u32(),
                })
            }
            (CLASS_QUEUE, QUEUE_BIND) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let queue = decode_short_string(cursor)?;
                let exchange = decode_short_string(cursor)?;
                let routing_key = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                let arguments = decode_table(cursor)?;
                Ok(Method::QueueBind {
                    queue,
                    exchange,
                    routing_key,
                    no_wait: bits & 0x01 != 0,
                    arguments,
                })
            }
            (CLASS_QUEUE, QUEUE_BIND_OK) => Ok(Method::QueueBindOk),
            (CLASS_QUEUE, QUEUE_PURGE) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let queue = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                Ok(Method::QueuePurge { queue, no_wait: bits & 0x01 != 0 })
            }
            (CLASS_QUEUE, QUEUE_PURGE_OK) => {
                need(cursor, 4)?;
                Ok(Method::QueuePurgeOk { message_count: cursor.get_u32() })
            }
            (CLASS_QUEUE, QUEUE_DELETE) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let queue = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                Ok(Method::QueueDelete {
                    queue,
                    if_unused: bits & 0x01 != 0,
                    if_empty: bits & 0x02 != 0,
                    no_wait: bits & 0x04 != 0,
                })
            }
            (CLASS_QUEUE, QUEUE_DELETE_OK) => {
                need(cursor, 4)?;
                Ok(Method::QueueDeleteOk { message_count: cursor.get_u32() })
            }
            (CLASS_QUEUE, QUEUE_UNBIND) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let queue = decode_short_string(cursor)?;
                let exchange = decode_short_string(cursor)?;
                let routing_key = decode_short_string(cursor)?;
                let arguments = decode_table(cursor)?;
                Ok(Method::QueueUnbind { queue, exchange, routing_key, arguments })
            }
            (CLASS_QUEUE, QUEUE_UNBIND_OK) => Ok(Method::QueueUnbindOk),

            (CLASS_BASIC, BASIC_QOS) => {
                need(cursor, 6)?;
                let prefetch_size = cursor.get_u32();
                let prefetch_count = cursor.get_u16();
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicQos { prefetch_size, prefetch_count, global: bits & 0x01 != 0 })
            }
            (CLASS_BASIC, BASIC_QOS_OK) => Ok(Method::BasicQosOk),
            (CLASS_BASIC, BASIC_CONSUME) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let queue = decode_short_string(cursor)?;
                let consumer_tag = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                let arguments = decode_table(cursor)?;
                Ok(Method::BasicConsume {
                    queue,
                    consumer_tag,
                    no_local: bits & 0x01 != 0,
                    no_ack: bits & 0x02 != 0,
                    exclusive: bits & 0x04 != 0,
                    no_wait: bits & 0x08 != 0,
                    arguments,
                })
            }
            (CLASS_BASIC, BASIC_CONSUME_OK) => {
                Ok(Method::BasicConsumeOk { consumer_tag: decode_short_string(cursor)? })
            }
            (CLASS_BASIC, BASIC_CANCEL) => {
                let consumer_tag = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicCancel { consumer_tag, no_wait: bits & 0x01 != 0 })
            }
            (CLASS_BASIC, BASIC_CANCEL_OK) => {
                Ok(Method::BasicCancelOk { consumer_tag: decode_short_string(cursor)? })
            }
            (CLASS_BASIC, BASIC_PUBLISH) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let exchange = decode_short_string(cursor)?;
                let routing_key = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicPublish {
                    exchange,
                    routing_key,
                    mandatory: bits & 0x01 != 0,
                    immediate: bits & 0x02 != 0,
                })
            }
            (CLASS_BASIC, BASIC_RETURN) => {
                need(cursor, 2)?;
                let reply_code = cursor.get_u16();
                let reply_text = decode_short_string(cursor)?;
                let exchange = decode_short_string(cursor)?;
                let routing_key = decode_short_string(cursor)?;
                Ok(Method::BasicReturn { reply_code, reply_text, exchange, routing_key })
            }
            (CLASS_BASIC, BASIC_DELIVER) => {
                let consumer_tag = decode_short_string(cursor)?;
                need(cursor, 8)?;
                let delivery_tag = cursor.get_u64();
                let bits = decode_bits(cursor)?;
                let exchange = decode_short_string(cursor)?;
                let routing_key = decode_short_string(cursor)?;
                Ok(Method::BasicDeliver {
                    consumer_tag,
                    delivery_tag,
                    redelivered: bits & 0x01 != 0,
                    exchange,
                    routing_key,
                })
            }
            (CLASS_BASIC, BASIC_GET) => {
                need(cursor, 2)?;
                let _ticket = cursor.get_u16();
                let queue = decode_short_string(cursor)?;
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicGet { queue, no_ack: bits & 0x01 != 0 })
            }
            (CLASS_BASIC, BASIC_GET_OK) => {
                need(cursor, 8)?;
                let delivery_tag = cursor.get_u64();
                let bits = decode_bits(cursor)?;
                let exchange = decode_short_string(cursor)?;
                let routing_key = decode_short_string(cursor)?;
                need(cursor, 4)?;
                Ok(Method::BasicGetOk {
                    delivery_tag,
                    redelivered: bits & 0x01 != 0,
                    exchange,
                    routing_key,
                    message_count: cursor.get_u32(),
                })
            }
            (CLASS_BASIC, BASIC_GET_EMPTY) => {
                let _cluster_id = decode_short_string(cursor)?;
                Ok(Method::BasicGetEmpty)
            }
            (CLASS_BASIC, BASIC_ACK) => {
                need(cursor, 8)?;
                let delivery_tag = cursor.get_u64();
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicAck { delivery_tag, multiple: bits & 0x01 != 0 })
            }
            (CLASS_BASIC, BASIC_REJECT) => {
                need(cursor, 8)?;
                let delivery_tag = cursor.get_u64();
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicReject { delivery_tag, requeue: bits & 0x01 != 0 })
            }
            (CLASS_BASIC, BASIC_RECOVER_ASYNC) => {
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicRecoverAsync { requeue: bits & 0x01 != 0 })
            }
            (CLASS_BASIC, BASIC_RECOVER) => {
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicRecover { requeue: bits & 0x01 != 0 })
            }
            (CLASS_BASIC, BASIC_RECOVER_OK) => Ok(Method::BasicRecoverOk),
            (CLASS_BASIC, BASIC_NACK) => {
                need(cursor, 8)?;
                let delivery_tag = cursor.get_u64();
                let bits = decode_bits(cursor)?;
                Ok(Method::BasicNack {
                    delivery_tag,
                    multiple: bits & 0x01 != 0,
                    requeue: bits & 0x02 != 0,
                })
            }

            (class, method) => Err(CodecError::Syntax(format!(
                "unknown method: class {} method {}",
                class, method
            ))),
        }
    }

    /// Encode the full method frame payload (class id, method id, args).
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        let (class_id, method_id) = self.class_and_method();
        buf.put_u16(class_id);
        buf.put_u16(method_id);

        match self {
            Method::ConnectionStart {
                version_major,
                version_minor,
                server_properties,
                mechanisms,
                locales,
            } => {
                buf.put_u8(*version_major);
                buf.put_u8(*version_minor);
                encode_table(&mut buf, server_properties)?;
                encode_long_string(&mut buf, mechanisms);
                encode_long_string(&mut buf, locales);
            }
            Method::ConnectionStartOk { client_properties, mechanism, response, locale } => {
                encode_table(&mut buf, client_properties)?;
                encode_short_string(&mut buf, mechanism)?;
                buf.put_u32(response.len() as u32);
                buf.put_slice(response);
                encode_short_string(&mut buf, locale)?;
            }
            Method::ConnectionTune { channel_max, frame_max, heartbeat }
            | Method::ConnectionTuneOk { channel_max, frame_max, heartbeat } => {
                buf.put_u16(*channel_max);
                buf.put_u32(*frame_max);
                buf.put_u16(*heartbeat);
            }
            Method::ConnectionOpen { virtual_host } => {
                encode_short_string(&mut buf, virtual_host)?;
                encode_short_string(&mut buf, "")?; // reserved: capabilities
                buf.put_u8(0); // reserved: insist
            }
            Method::ConnectionOpenOk => {
                encode_short_string(&mut buf, "")?; // reserved: known-hosts
            }
            Method::ConnectionClose { reply_code, reply_text, class_id, method_id }
            | Method::ChannelClose { reply_code, reply_text, class_id, method_id } => {
                buf.put_u16(*reply_code);
                encode_short_string(&mut buf, reply_text)?;
                buf.put_u16(*class_id);
                buf.put_u16(*method_id);
            }
            Method::ConnectionCloseOk
            | Method::ChannelCloseOk
            | Method::ExchangeDeclareOk
            | Method::ExchangeDeleteOk
            | Method::QueueBindOk
            | Method::QueueUnbindOk
            | Method::BasicQosOk
            | Method::BasicRecoverOk => {}
            Method::ChannelOpen => {
                encode_short_string(&mut buf, "")?; // reserved: out-of-band
            }
            Method::ChannelOpenOk => {
                encode_long_string(&mut buf, ""); // reserved: channel-id
            }
            Method::ChannelFlow { active } | Method::ChannelFlowOk { active } => {
                buf.put_u8(u8::from(*active));
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
            } => {
                buf.put_u16(0); // ticket
                encode_short_string(&mut buf, exchange)?;
                encode_short_string(&mut buf, kind)?;
                let mut bits = 0u8;
                bits |= u8::from(*passive);
                bits |= u8::from(*durable) << 1;
                bits |= u8::from(*auto_delete) << 2;
                bits |= u8::from(*internal) << 3;
                bits |= u8::from(*no_wait) << 4;
                buf.put_u8(bits);
                encode_table(&mut buf, arguments)?;
            }
            Method::ExchangeDelete { exchange, if_unused, no_wait } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, exchange)?;
                buf.put_u8(u8::from(*if_unused) | u8::from(*no_wait) << 1);
            }
            Method::QueueDeclare {
                queue,
                passive,
                durable,
                exclusive,
                auto_delete,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, queue)?;
                let mut bits = 0u8;
                bits |= u8::from(*passive);
                bits |= u8::from(*durable) << 1;
                bits |= u8::from(*exclusive) << 2;
                bits |= u8::from(*auto_delete) << 3;
                bits |= u8::from(*no_wait) << 4;
                buf.put_u8(bits);
                encode_table(&mut buf, arguments)?;
            }
            Method::QueueDeclareOk { queue, message_count, consumer_count } => {
                encode_short_string(&mut buf, queue)?;
                buf.put_u32(*message_count);
                buf.put_u32(*consumer_count);
            }
            Method::QueueBind { queue, exchange, routing_key, no_wait, arguments } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, queue)?;
                encode_short_string(&mut buf, exchange)?;
                encode_short_string(&mut buf, routing_key)?;
                buf.put_u8(u8::from(*no_wait));
                encode_table(&mut buf, arguments)?;
            }
            Method::QueuePurge { queue, no_wait } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, queue)?;
                buf.put_u8(u8::from(*no_wait));
            }
            Method::QueuePurgeOk { message_count } | Method::QueueDeleteOk { message_count } => {
                buf.put_u32(*message_count);
            }
            Method::QueueDelete { queue, if_unused, if_empty, no_wait } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, queue)?;
                buf.put_u8(
                    u8::from(*if_unused) | u8::from(*if_empty) << 1 | u8::from(*no_wait) << 2,
                );
            }
            Method::QueueUnbind { queue, exchange, routing_key, arguments } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, queue)?;
                encode_short_string(&mut buf, exchange)?;
                encode_short_string(&mut buf, routing_key)?;
                encode_table(&mut buf, arguments)?;
            }
            Method::BasicQos { prefetch_size, prefetch_count, global } => {
                buf.put_u32(*prefetch_size);
                buf.put_u16(*prefetch_count);
                buf.put_u8(u8::from(*global));
            }
            Method::BasicConsume {
                queue,
                consumer_tag,
                no_local,
                no_ack,
                exclusive,
                no_wait,
                arguments,
            } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, queue)?;
                encode_short_string(&mut buf, consumer_tag)?;
                let mut bits = 0u8;
                bits |= u8::from(*no_local);
                bits |= u8::from(*no_ack) << 1;
                bits |= u8::from(*exclusive) << 2;
                bits |= u8::from(*no_wait) << 3;
                buf.put_u8(bits);
                encode_table(&mut buf, arguments)?;
            }
            Method::BasicConsumeOk { consumer_tag } | Method::BasicCancelOk { consumer_tag } => {
                encode_short_string(&mut buf, consumer_tag)?;
            }
            Method::BasicCancel { consumer_tag, no_wait } => {
                encode_short_string(&mut buf, consumer_tag)?;
                buf.put_u8(u8::from(*no_wait));
            }
            Method::BasicPublish { exchange, routing_key, mandatory, immediate } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, exchange)?;
                encode_short_string(&mut buf, routing_key)?;
                buf.put_u8(u8::from(*mandatory) | u8::from(*immediate) << 1);
            }
            Method::BasicReturn { reply_code, reply_text, exchange, routing_key } => {
                buf.put_u16(*reply_code);
                encode_short_string(&mut buf, reply_text)?;
                encode_short_string(&mut buf, exchange)?;
                encode_short_string(&mut buf, routing_key)?;
            }
            Method::BasicDeliver {
                consumer_tag,
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
            } => {
                encode_short_string(&mut buf, consumer_tag)?;
                buf.put_u64(*delivery_tag);
                buf.put_u8(u8::from(*redelivered));
                encode_short_string(&mut buf, exchange)?;
                encode_short_string(&mut buf, routing_key)?;
            }
            Method::BasicGet { queue, no_ack } => {
                buf.put_u16(0);
                encode_short_string(&mut buf, queue)?;
                buf.put_u8(u8::from(*no_ack));
            }
            Method::BasicGetOk {
                delivery_tag,
                redelivered,
                exchange,
                routing_key,
                message_count,
            } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(u8::from(*redelivered));
                encode_short_string(&mut buf, exchange)?;
                encode_short_string(&mut buf, routing_key)?;
                buf.put_u32(*message_count);
            }
            Method::BasicGetEmpty => {
                encode_short_string(&mut buf, "")?; // reserved: cluster-id
            }
            Method::BasicAck { delivery_tag, multiple } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(u8::from(*multiple));
            }
            Method::BasicReject { delivery_tag, requeue } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(u8::from(*requeue));
            }
            Method::BasicRecoverAsync { requeue } | Method::BasicRecover { requeue } => {
                buf.put_u8(u8::from(*requeue));
            }
            Method::BasicNack { delivery_tag, multiple, requeue } => {
                buf.put_u64(*delivery_tag);
                buf.put_u8(u8::from(*multiple) | u8::from(*requeue) << 1);
            }
        }

        Ok(buf.freeze())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(method: Method) {
        let encoded = method.encode().expect("Failed to encode method");
        let decoded = Method::decode(&encoded).expect("Failed to decode method");
        assert_eq!(decoded, method);
    }

    #[test]
    fn test_connection_handshake_methods_roundtrip() {
        let mut props = FieldTable::new();
        props.insert("product".into(), crate::protocol::FieldValue::LongString("test".into()));

        roundtrip(Method::ConnectionStart {
            version_major: 0,
            version_minor: 9,
            server_properties: props.clone(),
            mechanisms: "PLAIN AMQPLAIN".into(),
            locales: "en_US".into(),
        });
        roundtrip(Method::ConnectionStartOk {
            client_properties: props,
            mechanism: "PLAIN".into(),
            response: b"\0guest\0guest".to_vec(),
            locale: "en_US".into(),
        });
        roundtrip(Method::ConnectionTune { channel_max: 2047, frame_max: 131072, heartbeat: 60 });
        roundtrip(Method::ConnectionOpen { virtual_host: "/".into() });
        roundtrip(Method::ConnectionClose {
            reply_code: 320,
            reply_text: "bye".into(),
            class_id: 0,
            method_id: 0,
        });
        roundtrip(Method::ConnectionCloseOk);
    }

    #[test]
    fn test_declare_bit_packing_roundtrip() {
        roundtrip(Method::ExchangeDeclare {
            exchange: "logs".into(),
            kind: "topic".into(),
            passive: false,
            durable: true,
            auto_delete: true,
            internal: false,
            no_wait: false,
            arguments: FieldTable::new(),
        });
        roundtrip(Method::QueueDeclare {
            queue: "work".into(),
            passive: true,
            durable: true,
            exclusive: false,
            auto_delete: true,
            no_wait: false,
            arguments: FieldTable::new(),
        });
        roundtrip(Method::BasicConsume {
            queue: "work".into(),
            consumer_tag: String::new(),
            no_local: false,
            no_ack: true,
            exclusive: true,
            no_wait: false,
            arguments: FieldTable::new(),
        });
    }

    #[test]
    fn test_basic_class_roundtrip() {
        roundtrip(Method::BasicPublish {
            exchange: "".into(),
            routing_key: "q1".into(),
            mandatory: true,
            immediate: false,
        });
        roundtrip(Method::BasicDeliver {
            consumer_tag: "amq.ctag-1-1-1".into(),
            delivery_tag: 42,
            redelivered: true,
            exchange: "e".into(),
            routing_key: "k".into(),
        });
        roundtrip(Method::BasicGetOk {
            delivery_tag: 7,
            redelivered: false,
            exchange: "".into(),
            routing_key: "q".into(),
            message_count: 3,
        });
        roundtrip(Method::BasicAck { delivery_tag: 9, multiple: true });
        roundtrip(Method::BasicNack { delivery_tag: 10, multiple: false, requeue: true });
        roundtrip(Method::BasicReturn {
            reply_code: 313,
            reply_text: "No route".into(),
            exchange: "e".into(),
            routing_key: "nope".into(),
        });
    }

    #[test]
    fn test_unknown_method_is_syntax_error() {
        let mut buf = BytesMut::new();
        buf.put_u16(90); // tx class, unsupported
        buf.put_u16(10);
        let err = Method::decode(&buf).unwrap_err();
        assert!(matches!(err, CodecError::Syntax(_)));
    }
}
