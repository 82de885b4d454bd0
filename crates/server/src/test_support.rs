//! Helpers for tests that need a live shell on an ephemeral port.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ultra_backend::LaunchSpec;
use ultra_protocol::{ClientMessage, ServerMessage};

use crate::relay::RelayChannel;
use crate::routes::router;
use crate::state::AppState;
use crate::supervisor::{SupervisorConfig, SupervisorHandle};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const RECV_TIMEOUT: Duration = Duration::from_secs(10);

pub struct TestServer {
    pub addr: SocketAddr,
    pub state: Arc<AppState>,
}

pub async fn serve(launch: LaunchSpec, setup_pending: bool) -> TestServer {
    let relay = Arc::new(RelayChannel::new());
    let supervisor = SupervisorHandle::spawn(SupervisorConfig::new(launch), relay.clone());
    let state = Arc::new(AppState::new(relay.clone(), supervisor, setup_pending));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let app = router(state.clone());
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    relay.mark_ready();

    TestServer { addr, state }
}

pub async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws"))
        .await
        .unwrap();
    ws
}

pub async fn send(ws: &mut Client, msg: &ClientMessage) {
    let json = serde_json::to_string(msg).unwrap();
    ws.send(Message::Text(json.into())).await.unwrap();
}

/// Read server messages until one matches `pred`.
pub async fn next_matching(
    ws: &mut Client,
    pred: impl Fn(&ServerMessage) -> bool,
) -> ServerMessage {
    tokio::time::timeout(RECV_TIMEOUT, async {
        loop {
            let frame = ws
                .next()
                .await
                .expect("connection closed")
                .expect("websocket error");
            if let Message::Text(text) = frame {
                let msg: ServerMessage = serde_json::from_str(&text).unwrap();
                if pred(&msg) {
                    return msg;
                }
            }
        }
    })
    .await
    .expect("timed out waiting for server message")
}
