//! Error taxonomy surfaced to clients.
//!
//! Every failure that reaches a client is carried as an [`ErrorObj`]
//! serialized through the active protocol and sent as an ordinary DATA
//! frame; there is no dedicated error frame type on the wire.

/// Error code accompanying an [`ErrorObj`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(i32)]
pub enum RpcErrorCode {
    /// The protocol could not decode a method name.
    Parse = 1,
    /// A middleware short-circuited or failed.
    Middleware = 2,
    /// No handler registered for the method.
    NotFound = 3,
    /// Inspector or token failure.
    Auth = 4,
    /// Cooperative rate limiting, set by middleware.
    RateLimited = 5,
    /// Handler failure or unexpected state.
    Internal = 99,
}

impl RpcErrorCode {
    /// Numeric wire value of the code.
    #[must_use]
    pub const fn as_i32(self) -> i32 { self as i32 }
}

impl std::fmt::Display for RpcErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Parse => "parse",
            Self::Middleware => "middleware",
            Self::NotFound => "not-found",
            Self::Auth => "auth",
            Self::RateLimited => "rate-limited",
            Self::Internal => "internal",
        };
        f.write_str(name)
    }
}

/// Structured error returned to a client.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ErrorObj {
    pub code: RpcErrorCode,
    pub msg: String,
    /// Optional opaque context bytes; empty when absent.
    pub data: Vec<u8>,
}

impl ErrorObj {
    /// Build an error without context bytes.
    #[must_use]
    pub fn new(code: RpcErrorCode, msg: impl Into<String>) -> Self {
        Self {
            code,
            msg: msg.into(),
            data: Vec::new(),
        }
    }

    /// Attach opaque context bytes.
    #[must_use]
    pub fn with_data(mut self, data: Vec<u8>) -> Self {
        self.data = data;
        self
    }
}

impl std::fmt::Display for ErrorObj {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({}): {}", self.code, self.code.as_i32(), self.msg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_values() {
        assert_eq!(RpcErrorCode::Parse.as_i32(), 1);
        assert_eq!(RpcErrorCode::Middleware.as_i32(), 2);
        assert_eq!(RpcErrorCode::NotFound.as_i32(), 3);
        assert_eq!(RpcErrorCode::Auth.as_i32(), 4);
        assert_eq!(RpcErrorCode::RateLimited.as_i32(), 5);
        assert_eq!(RpcErrorCode::Internal.as_i32(), 99);
    }

    #[test]
    fn display_includes_code_and_message() {
        let err = ErrorObj::new(RpcErrorCode::NotFound, "no such method");
        assert_eq!(err.to_string(), "not-found (3): no such method");
    }
}
