//! Identity extraction at the WebSocket upgrade boundary.

use tokio_tungstenite::tungstenite::handshake::server::Request;

use crate::identity::{token_from_hex, ClientIdentity};

/// The HTTP upgrade request as seen by an inspector.
pub type UpgradeRequest = Request;

/// Decides who is connecting, before the upgrade completes.
///
/// Returning `None` rejects the handshake; the transport answers with an
/// HTTP 400 carrying [`reject_reason`](Self::reject_reason).
pub trait HandshakeInspector: Send + Sync {
    /// Extract the client identity from the upgrade request.
    fn extract(&self, request: &UpgradeRequest) -> Option<ClientIdentity>;

    /// Human-readable reason reported on rejection.
    fn reject_reason(&self) -> String {
        "invalid handshake data".to_string()
    }
}

/// Default inspector reading identity from request headers.
///
/// `x-client-id` is required; `x-device-id` is an optional decimal u64
/// (non-digit prefixes are skipped); `x-session-token` is an optional
/// 32-character hex reconnect token.
#[derive(Clone, Copy, Debug, Default)]
pub struct HeaderInspector;

impl HeaderInspector {
    fn header<'a>(request: &'a UpgradeRequest, name: &str) -> Option<&'a str> {
        request.headers().get(name).and_then(|v| v.to_str().ok())
    }
}

impl HandshakeInspector for HeaderInspector {
    fn extract(&self, request: &UpgradeRequest) -> Option<ClientIdentity> {
        let client_id = Self::header(request, "x-client-id")?;
        if client_id.is_empty() {
            tracing::warn!("missing x-client-id header");
            return None;
        }

        let mut device_id = 0u64;
        if let Some(raw) = Self::header(request, "x-device-id") {
            let digits: String = raw.chars().skip_while(|c| !c.is_ascii_digit()).collect();
            if digits.is_empty() {
                tracing::warn!(raw, "device id contains no numeric part");
                return None;
            }
            device_id = match digits.parse() {
                Ok(id) => id,
                Err(error) => {
                    tracing::warn!(raw, %error, "invalid device id");
                    return None;
                }
            };
        }

        let mut identity = ClientIdentity::new(client_id, device_id);
        if let Some(raw) = Self::header(request, "x-session-token") {
            if !raw.is_empty() {
                match token_from_hex(raw) {
                    Some(token) => identity.session_token = token,
                    None => {
                        tracing::warn!("malformed session token");
                        return None;
                    }
                }
            }
        }
        Some(identity)
    }
}
