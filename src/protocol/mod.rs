//! AMQP 0-9-1 wire protocol implementation.
//!
//! The protocol uses a binary format with the following structure:
//! - All integers are encoded in network byte order (big-endian)
//! - Short strings are length-prefixed with a u8 length (max 255 bytes)
//! - Long strings are length-prefixed with a u32 length
//! - Field tables are length-prefixed maps of typed values
//! - Every frame ends with the 0xCE frame-end octet
//!
//! ## Modules
//!
//! - [`frame`] - Frame layer codec (method / header / body / heartbeat)
//! - [`field_table`] - Typed field-value encoding
//! - [`properties`] - Content header properties and flag bitmap
//! - [`methods`] - Per-method argument parsing and encoding

pub mod field_table;
pub mod frame;
pub mod methods;
pub mod properties;

pub use field_table::{FieldTable, FieldValue};
pub use frame::{Frame, FrameCodec, PROTOCOL_HEADER};
pub use methods::Method;
pub use properties::{BasicProperties, ContentHeader};

use std::io;
use thiserror::Error;

/// Frame type octets.
pub const FRAME_METHOD: u8 = 1;
pub const FRAME_HEADER: u8 = 2;
pub const FRAME_BODY: u8 = 3;
pub const FRAME_HEARTBEAT: u8 = 8;
pub const FRAME_END: u8 = 0xCE;

/// Class identifiers.
pub const CLASS_CONNECTION: u16 = 10;
pub const CLASS_CHANNEL: u16 = 20;
pub const CLASS_EXCHANGE: u16 = 40;
pub const CLASS_QUEUE: u16 = 50;
pub const CLASS_BASIC: u16 = 60;

/// AMQP reply codes.
pub const REPLY_SUCCESS: u16 = 200;
pub const CONTENT_TOO_LARGE: u16 = 311;
pub const NO_ROUTE: u16 = 313;
pub const CONNECTION_FORCED: u16 = 320;
pub const INVALID_PATH: u16 = 402;
pub const ACCESS_REFUSED: u16 = 403;
pub const NOT_FOUND: u16 = 404;
pub const RESOURCE_LOCKED: u16 = 405;
pub const PRECONDITION_FAILED: u16 = 406;
pub const FRAME_ERROR: u16 = 501;
pub const SYNTAX_ERROR: u16 = 502;
pub const COMMAND_INVALID: u16 = 503;
pub const CHANNEL_ERROR: u16 = 504;
pub const UNEXPECTED_FRAME: u16 = 505;
pub const NOT_IMPLEMENTED: u16 = 540;
pub const INTERNAL_ERROR: u16 = 541;

/// Wire codec errors.
///
/// `Frame` maps to reply code 501 and `Syntax` to 502 when the violation is
/// reported back to the peer.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
    #[error("frame error: {0}")]
    Frame(String),
    #[error("syntax error: {0}")]
    Syntax(String),
}

impl CodecError {
    /// The AMQP reply code this error maps to.
    pub fn reply_code(&self) -> u16 {
        match self {
            CodecError::Io(_) => INTERNAL_ERROR,
            CodecError::Frame(_) => FRAME_ERROR,
            CodecError::Syntax(_) => SYNTAX_ERROR,
        }
    }
}

pub type Result<T> = std::result::Result<T, CodecError>;

/// Scope of an AMQP exception: whether the offending channel is closed or
/// the whole connection is torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExceptionScope {
    Channel,
    Connection,
}

/// A protocol-level failure reported to the peer as `Channel.Close` or
/// `Connection.Close` with the offending class and method ids.
#[derive(Debug, Clone)]
pub struct AmqpException {
    pub code: u16,
    pub text: String,
    pub class_id: u16,
    pub method_id: u16,
    pub scope: ExceptionScope,
}

impl AmqpException {
    pub fn channel(code: u16, text: impl Into<String>) -> Self {
        Self { code, text: text.into(), class_id: 0, method_id: 0, scope: ExceptionScope::Channel }
    }

    pub fn connection(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
            class_id: 0,
            method_id: 0,
            scope: ExceptionScope::Connection,
        }
    }

    /// Attach the class/method ids of the method that triggered the failure.
    pub fn with_method(mut self, class_id: u16, method_id: u16) -> Self {
        self.class_id = class_id;
        self.method_id = method_id;
        self
    }
}

impl std::fmt::Display for AmqpException {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} {}", self.code, self.text)
    }
}
