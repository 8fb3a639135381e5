//! Content header frames and the basic-class property bag.
//!
//! A content header carries the class id, the total body size, and a 16-bit
//! property-flags bitmap followed by only those properties whose bit is set,
//! in a fixed order. Encoding writes only present properties; decoding
//! iterates the flag bits.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::{Deserialize, Serialize};
use std::io::Cursor;

use super::field_table::{
    decode_short_string, decode_table, encode_short_string, encode_table, FieldTable,
};
use super::{CodecError, Result, CLASS_BASIC};

const FLAG_CONTENT_TYPE: u16 = 0x8000;
const FLAG_CONTENT_ENCODING: u16 = 0x4000;
const FLAG_HEADERS: u16 = 0x2000;
const FLAG_DELIVERY_MODE: u16 = 0x1000;
const FLAG_PRIORITY: u16 = 0x0800;
const FLAG_CORRELATION_ID: u16 = 0x0400;
const FLAG_REPLY_TO: u16 = 0x0200;
const FLAG_EXPIRATION: u16 = 0x0100;
const FLAG_MESSAGE_ID: u16 = 0x0080;
const FLAG_TIMESTAMP: u16 = 0x0040;
const FLAG_TYPE: u16 = 0x0020;
const FLAG_USER_ID: u16 = 0x0010;
const FLAG_APP_ID: u16 = 0x0008;
const FLAG_CLUSTER_ID: u16 = 0x0004;

/// Persistent delivery mode (`delivery_mode == 2`).
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// The basic-class message properties. All fields are optional; absence is
/// expressed on the wire by a cleared flag bit rather than a sentinel value.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BasicProperties {
    pub content_type: Option<String>,
    pub content_encoding: Option<String>,
    pub headers: Option<FieldTable>,
    pub delivery_mode: Option<u8>,
    pub priority: Option<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub expiration: Option<String>,
    pub message_id: Option<String>,
    pub timestamp: Option<u64>,
    #[serde(rename = "type")]
    pub kind: Option<String>,
    pub user_id: Option<String>,
    pub app_id: Option<String>,
    pub cluster_id: Option<String>,
}

impl BasicProperties {
    /// Whether the message is marked persistent (delivery mode 2).
    pub fn is_persistent(&self) -> bool {
        self.delivery_mode == Some(DELIVERY_MODE_PERSISTENT)
    }

    fn flags(&self) -> u16 {
        let mut flags = 0;
        if self.content_type.is_some() {
            flags |= FLAG_CONTENT_TYPE;
        }
        if self.content_encoding.is_some() {
            flags |= FLAG_CONTENT_ENCODING;
        }
        if self.headers.is_some() {
            flags |= FLAG_HEADERS;
        }
        if self.delivery_mode.is_some() {
            flags |= FLAG_DELIVERY_MODE;
        }
        if self.priority.is_some() {
            flags |= FLAG_PRIORITY;
        }
        if self.correlation_id.is_some() {
            flags |= FLAG_CORRELATION_ID;
        }
        if self.reply_to.is_some() {
            flags |= FLAG_REPLY_TO;
        }
        if self.expiration.is_some() {
            flags |= FLAG_EXPIRATION;
        }
        if self.message_id.is_some() {
            flags |= FLAG_MESSAGE_ID;
        }
        if self.timestamp.is_some() {
            flags |= FLAG_TIMESTAMP;
        }
        if self.kind.is_some() {
            flags |= FLAG_TYPE;
        }
        if self.user_id.is_some() {
            flags |= FLAG_USER_ID;
        }
        if self.app_id.is_some() {
            flags |= FLAG_APP_ID;
        }
        if self.cluster_id.is_some() {
            flags |= FLAG_CLUSTER_ID;
        }
        flags
    }

    /// Encode the flag bitmap and present properties in wire order.
    pub fn encode(&self, buf: &mut BytesMut) -> Result<()> {
        buf.put_u16(self.flags());
        if let Some(v) = &self.content_type {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = &self.content_encoding {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = &self.headers {
            encode_table(buf, v)?;
        }
        if let Some(v) = self.delivery_mode {
            buf.put_u8(v);
        }
        if let Some(v) = self.priority {
            buf.put_u8(v);
        }
        if let Some(v) = &self.correlation_id {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = &self.reply_to {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = &self.expiration {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = &self.message_id {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = self.timestamp {
            buf.put_u64(v);
        }
        if let Some(v) = &self.kind {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = &self.user_id {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = &self.app_id {
            encode_short_string(buf, v)?;
        }
        if let Some(v) = &self.cluster_id {
            encode_short_string(buf, v)?;
        }
        Ok(())
    }

    /// Decode from the flag bitmap onward.
    pub fn decode(cursor: &mut Cursor<&[u8]>) -> Result<Self> {
        if cursor.remaining() < 2 {
            return Err(CodecError::Syntax("truncated property flags".into()));
        }
        let flags = cursor.get_u16();
        let mut props = BasicProperties::default();
        if flags & FLAG_CONTENT_TYPE != 0 {
            props.content_type = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_CONTENT_ENCODING != 0 {
            props.content_encoding = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_HEADERS != 0 {
            props.headers = Some(decode_table(cursor)?);
        }
        if flags & FLAG_DELIVERY_MODE != 0 {
            if cursor.remaining() < 1 {
                return Err(CodecError::Syntax("truncated delivery-mode".into()));
            }
            props.delivery_mode = Some(cursor.get_u8());
        }
        if flags & FLAG_PRIORITY != 0 {
            if cursor.remaining() < 1 {
                return Err(CodecError::Syntax("truncated priority".into()));
            }
            props.priority = Some(cursor.get_u8());
        }
        if flags & FLAG_CORRELATION_ID != 0 {
            props.correlation_id = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_REPLY_TO != 0 {
            props.reply_to = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_EXPIRATION != 0 {
            props.expiration = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_MESSAGE_ID != 0 {
            props.message_id = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_TIMESTAMP != 0 {
            if cursor.remaining() < 8 {
                return Err(CodecError::Syntax("truncated timestamp".into()));
            }
            props.timestamp = Some(cursor.get_u64());
        }
        if flags & FLAG_TYPE != 0 {
            props.kind = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_USER_ID != 0 {
            props.user_id = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_APP_ID != 0 {
            props.app_id = Some(decode_short_string(cursor)?);
        }
        if flags & FLAG_CLUSTER_ID != 0 {
            props.cluster_id = Some(decode_short_string(cursor)?);
        }
        Ok(props)
    }
}

/// A decoded content header frame payload.
#[derive(Debug, Clone, PartialEq)]
pub struct ContentHeader {
    pub class_id: u16,
    pub body_size: u64,
    pub properties: BasicProperties,
}

impl ContentHeader {
    pub fn new(body_size: u64, properties: BasicProperties) -> Self {
        Self { class_id: CLASS_BASIC, body_size, properties }
    }

    /// Encode the full header payload: class, weight (always 0), body size,
    /// flags and properties.
    pub fn encode(&self) -> Result<Bytes> {
        let mut buf = BytesMut::new();
        buf.put_u16(self.class_id);
        buf.put_u16(0); // weight
        buf.put_u64(self.body_size);
        self.properties.encode(&mut buf)?;
        Ok(buf.freeze())
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(payload);
        if cursor.remaining() < 12 {
            return Err(CodecError::Syntax("truncated content header".into()));
        }
        let class_id = cursor.get_u16();
        let _weight = cursor.get_u16();
        let body_size = cursor.get_u64();
        let properties = BasicProperties::decode(&mut cursor)?;
        Ok(Self { class_id, body_size, properties })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::FieldValue;

    #[test]
    fn test_empty_properties_roundtrip() {
        let header = ContentHeader::new(0, BasicProperties::default());
        let encoded = header.encode().expect("Failed to encode header");
        let decoded = ContentHeader::decode(&encoded).expect("Failed to decode header");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_full_properties_roundtrip() {
        let mut headers = FieldTable::new();
        headers.insert("retries".into(), FieldValue::I32(3));

        let props = BasicProperties {
            content_type: Some("application/json".into()),
            content_encoding: Some("utf-8".into()),
            headers: Some(headers),
            delivery_mode: Some(2),
            priority: Some(5),
            correlation_id: Some("corr-1".into()),
            reply_to: Some("reply-q".into()),
            expiration: Some("60000".into()),
            message_id: Some("msg-1".into()),
            timestamp: Some(1_700_000_000),
            kind: Some("event".into()),
            user_id: Some("guest".into()),
            app_id: Some("app".into()),
            cluster_id: Some("c1".into()),
        };
        let header = ContentHeader::new(1024, props);
        let encoded = header.encode().expect("Failed to encode header");
        let decoded = ContentHeader::decode(&encoded).expect("Failed to decode header");
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_sparse_properties_skip_absent_fields() {
        let props = BasicProperties {
            delivery_mode: Some(2),
            message_id: Some("only-these".into()),
            ..Default::default()
        };
        let header = ContentHeader::new(5, props.clone());
        let encoded = header.encode().expect("Failed to encode header");
        let decoded = ContentHeader::decode(&encoded).expect("Failed to decode header");
        assert_eq!(decoded.properties, props);
        assert_eq!(decoded.body_size, 5);
    }

    #[test]
    fn test_persistent_flag() {
        let mut props = BasicProperties::default();
        assert!(!props.is_persistent());
        props.delivery_mode = Some(1);
        assert!(!props.is_persistent());
        props.delivery_mode = Some(2);
        assert!(props.is_persistent());
    }
}
