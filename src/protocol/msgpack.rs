//! MessagePack encoding.
//!
//! Requests are maps with a `method` string and a `payload` binary.
//! Clients sometimes send the payload as a nested map or a string instead
//! of raw bytes; both are canonicalized to bytes on parse (maps are
//! re-encoded as MessagePack, strings contribute their UTF-8 bytes).

use rmpv::Value;

use crate::error::ErrorObj;
use crate::protocol::{ParsedRequest, Protocol, ProtocolError};

const METHOD_KEY: &str = "method";
const PAYLOAD_KEY: &str = "payload";

/// MessagePack request/response encoding.
#[derive(Clone, Copy, Debug, Default)]
pub struct MsgPackProtocol;

fn check_len(len: usize) -> Result<(), ProtocolError> {
    if u32::try_from(len).is_err() {
        return Err(ProtocolError::PayloadTooLarge(len));
    }
    Ok(())
}

fn encode_value(value: &Value) -> Result<Vec<u8>, ProtocolError> {
    let mut buf = Vec::new();
    rmpv::encode::write_value(&mut buf, value)
        .map_err(|e| ProtocolError::Encode(e.to_string()))?;
    Ok(buf)
}

impl Protocol for MsgPackProtocol {
    fn parse(&self, data: &[u8]) -> ParsedRequest {
        let mut cursor = data;
        let Ok(value) = rmpv::decode::read_value(&mut cursor) else {
            return ParsedRequest::default();
        };
        let Value::Map(entries) = value else {
            return ParsedRequest::default();
        };

        let mut req = ParsedRequest::default();
        for (key, val) in &entries {
            let Some(key) = key.as_str() else { continue };
            match key {
                METHOD_KEY => match val {
                    Value::String(s) => {
                        if let Some(s) = s.as_str() {
                            req.method = s.to_string();
                        }
                    }
                    Value::Binary(b) => {
                        req.method = String::from_utf8_lossy(b).into_owned();
                    }
                    _ => {}
                },
                PAYLOAD_KEY => match val {
                    Value::Binary(b) => req.payload = b.clone(),
                    Value::String(s) => req.payload = s.as_bytes().to_vec(),
                    Value::Map(_) => {
                        if let Ok(bytes) = encode_value(val) {
                            req.payload = bytes;
                        }
                    }
                    _ => {}
                },
                _ => {}
            }
        }
        req
    }

    fn serialize(&self, method: &str, payload: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        check_len(payload.len())?;
        let value = Value::Map(vec![
            (Value::from(METHOD_KEY), Value::from(method)),
            (Value::from(PAYLOAD_KEY), Value::Binary(payload.to_vec())),
        ]);
        encode_value(&value)
    }

    fn serialize_error(&self, err: &ErrorObj) -> Vec<u8> {
        let mut entries = vec![
            (Value::from("code"), Value::from(err.code.as_i32())),
            (Value::from("msg"), Value::from(err.msg.as_str())),
        ];
        if !err.data.is_empty() && check_len(err.data.len()).is_ok() {
            entries.push((Value::from("data"), Value::Binary(err.data.clone())));
        }
        encode_value(&Value::Map(entries)).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RpcErrorCode;

    fn decode(data: &[u8]) -> Value {
        rmpv::decode::read_value(&mut &data[..]).unwrap()
    }

    #[test]
    fn round_trip() {
        let bytes = MsgPackProtocol.serialize("echo", b"42").unwrap();
        let req = MsgPackProtocol.parse(&bytes);
        assert_eq!(req.method, "echo");
        assert_eq!(req.payload, b"42");
    }

    #[test]
    fn string_payload_is_canonicalized_to_bytes() {
        let value = Value::Map(vec![
            (Value::from("method"), Value::from("echo")),
            (Value::from("payload"), Value::from("hello")),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();

        let req = MsgPackProtocol.parse(&buf);
        assert_eq!(req.method, "echo");
        assert_eq!(req.payload, b"hello");
    }

    #[test]
    fn map_payload_is_reencoded_as_msgpack() {
        let nested = Value::Map(vec![(Value::from("x"), Value::from(1))]);
        let value = Value::Map(vec![
            (Value::from("method"), Value::from("set")),
            (Value::from("payload"), nested.clone()),
        ]);
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &value).unwrap();

        let req = MsgPackProtocol.parse(&buf);
        assert_eq!(req.method, "set");
        assert_eq!(decode(&req.payload), nested);
    }

    #[test]
    fn non_map_input_is_a_parse_failure() {
        let mut buf = Vec::new();
        rmpv::encode::write_value(&mut buf, &Value::from("just a string")).unwrap();
        assert!(!MsgPackProtocol.parse(&buf).is_valid());
    }

    #[test]
    fn garbage_input_is_a_parse_failure() {
        assert!(!MsgPackProtocol.parse(&[0xc1, 0xff, 0x00]).is_valid());
    }

    #[test]
    fn errors_carry_code_msg_and_optional_data() {
        let err = ErrorObj::new(RpcErrorCode::RateLimited, "slow down").with_data(vec![1, 2]);
        let Value::Map(entries) = decode(&MsgPackProtocol.serialize_error(&err)) else {
            panic!("expected a map");
        };
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[0].1, Value::from(5));
        assert_eq!(entries[1].1, Value::from("slow down"));
        assert_eq!(entries[2].1, Value::Binary(vec![1, 2]));

        let bare = ErrorObj::new(RpcErrorCode::Parse, "bad bytes");
        let Value::Map(entries) = decode(&MsgPackProtocol.serialize_error(&bare)) else {
            panic!("expected a map");
        };
        assert_eq!(entries.len(), 2);
    }
}
