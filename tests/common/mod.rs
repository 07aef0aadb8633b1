//! Shared helpers for the integration tests: a server fixture bound to an
//! ephemeral port and a thin frame-level WebSocket client.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use wsrpc::frame::{decode_frame, encode_frame};
use wsrpc::{App, FrameType, ReliableOptions, Transport, WebSocketTransport};

pub const RECV_TIMEOUT: Duration = Duration::from_secs(2);

/// A running application plus the address it listens on.
pub struct ServerFixture {
    pub app: App,
    pub transport: Arc<WebSocketTransport>,
    pub addr: SocketAddr,
}

/// Start an [`App`] with the given reliability options on an ephemeral
/// port.
pub async fn start_server(opts: ReliableOptions) -> ServerFixture {
    let app = App::new(opts.session_ttl_ms);
    let transport = Arc::new(WebSocketTransport::new(app.session_manager(), opts));
    app.set_transport(Arc::clone(&transport) as Arc<dyn Transport>);
    app.run(0).await.expect("server should start");
    let addr = transport.local_addr().expect("listener bound");
    ServerFixture {
        app,
        transport,
        addr,
    }
}

pub type ClientStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A frame-level test client speaking the binary wire protocol.
pub struct Client {
    pub ws: ClientStream,
    /// Token echoed by the server in the upgrade response.
    pub session_token: String,
}

impl Client {
    /// Connect with an identity and optional reconnect token.
    pub async fn connect(addr: SocketAddr, client_id: &str, token: Option<&str>) -> Self {
        let mut request = format!("ws://{addr}/")
            .into_client_request()
            .expect("valid request");
        request.headers_mut().insert(
            "x-client-id",
            HeaderValue::from_str(client_id).expect("valid header"),
        );
        if let Some(token) = token {
            request.headers_mut().insert(
                "x-session-token",
                HeaderValue::from_str(token).expect("valid header"),
            );
        }

        let (ws, response) = tokio_tungstenite::connect_async(request)
            .await
            .expect("handshake should succeed");
        let session_token = response
            .headers()
            .get("x-session-token")
            .and_then(|v| v.to_str().ok())
            .expect("server echoes the session token")
            .to_string();
        Self { ws, session_token }
    }

    /// Send one wire frame.
    pub async fn send_frame(&mut self, frame_type: FrameType, id: u64, payload: &[u8]) {
        self.ws
            .send(Message::Binary(encode_frame(frame_type, id, payload).into()))
            .await
            .expect("send should succeed");
    }

    /// Receive the next binary frame, decoded, within [`RECV_TIMEOUT`].
    pub async fn recv_frame(&mut self) -> (FrameType, u64, Vec<u8>) {
        loop {
            let msg = tokio::time::timeout(RECV_TIMEOUT, self.ws.next())
                .await
                .expect("frame should arrive in time")
                .expect("stream should stay open")
                .expect("read should succeed");
            match msg {
                Message::Binary(data) => {
                    let frame = decode_frame(&data).expect("well-formed frame");
                    return (frame.frame_type, frame.id, frame.payload.to_vec());
                }
                Message::Ping(_) | Message::Pong(_) => continue,
                other => panic!("unexpected message: {other:?}"),
            }
        }
    }

    /// True when no frame arrives within `window`.
    pub async fn expect_silence(&mut self, window: Duration) -> bool {
        tokio::time::timeout(window, self.ws.next()).await.is_err()
    }

    pub async fn close(mut self) {
        let _ = self.ws.close(None).await;
    }
}
