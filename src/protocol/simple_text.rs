//! Colon-delimited text encoding.
//!
//! Requests look like `"<method>:<payload>"`. Only the first `:` splits;
//! later colons belong to the payload. Method names therefore cannot
//! contain a colon, which is a documented limitation of this encoding.

use crate::error::ErrorObj;
use crate::protocol::{ParsedRequest, Protocol, ProtocolError};

/// Minimal human-readable protocol, mostly useful for demos and tests.
#[derive(Clone, Copy, Debug, Default)]
pub struct SimpleTextProtocol;

impl Protocol for SimpleTextProtocol {
    fn parse(&self, data: &[u8]) -> ParsedRequest {
        let Some(split) = data.iter().position(|&b| b == b':') else {
            return ParsedRequest::default();
        };
        let Ok(method) = std::str::from_utf8(&data[..split]) else {
            return ParsedRequest::default();
        };
        if method.is_empty() {
            return ParsedRequest::default();
        }
        ParsedRequest {
            method: method.to_string(),
            payload: data[split + 1..].to_vec(),
        }
    }

    fn serialize(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        let mut out = Vec::with_capacity(method.len() + 1 + payload.len());
        out.extend_from_slice(method.as_bytes());
        out.push(b':');
        out.extend_from_slice(payload);
        Ok(out)
    }

    fn serialize_error(&self, err: &ErrorObj) -> Vec<u8> {
        format!("error:{}:{}", err.code.as_i32(), err.msg).into_bytes()
    }
}
