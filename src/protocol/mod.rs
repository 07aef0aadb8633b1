//! Pluggable request serialization.
//!
//! A [`Protocol`] turns the payload of a DATA frame into a
//! [`ParsedRequest`] and renders responses and errors back into bytes.
//! Two encodings ship: a colon-delimited text form and MessagePack.

mod msgpack;
mod simple_text;

pub use msgpack::MsgPackProtocol;
pub use simple_text::SimpleTextProtocol;

use thiserror::Error;

use crate::error::ErrorObj;

/// Method name and argument bytes decoded from a DATA payload.
///
/// A parse failure is represented by an empty `method`, never by a panic;
/// the dispatch pipeline maps it to a Parse error for the client.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ParsedRequest {
    pub method: String,
    pub payload: Vec<u8>,
}

impl ParsedRequest {
    /// Whether parsing produced a usable method name.
    #[must_use]
    pub fn is_valid(&self) -> bool { !self.method.is_empty() }
}

/// Failures producing protocol bytes.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A length did not fit the encoding's 32-bit size field.
    #[error("payload of {0} bytes exceeds the protocol size limit")]
    PayloadTooLarge(usize),
    /// The underlying encoder failed.
    #[error("encode failed: {0}")]
    Encode(String),
}

/// Message encoding used on top of DATA frames.
pub trait Protocol: Send + Sync {
    /// Decode method name and payload. Failures yield a request with an
    /// empty method.
    fn parse(&self, data: &[u8]) -> ParsedRequest;

    /// Encode a method call or reply.
    ///
    /// # Errors
    ///
    /// Returns [`ProtocolError::PayloadTooLarge`] when the payload cannot
    /// be represented in the encoding's size field.
    fn serialize(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError>;

    /// Encode an error object for the client.
    fn serialize_error(&self, err: &ErrorObj) -> Vec<u8>;
}
