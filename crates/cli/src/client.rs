//! HTTP and WebSocket access to a running `ultra-shell`.

use anyhow::{bail, Context};
use futures::SinkExt;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

use ultra_protocol::{ClientMessage, SupervisorSnapshot};

pub type ShellSocket = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Lifecycle actions exposed over HTTP
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Trigger {
    Start,
    Restart,
    Stop,
    SetupComplete,
}

impl Trigger {
    fn path(&self) -> &'static str {
        match self {
            Trigger::Start => "/backend/start",
            Trigger::Restart => "/backend/restart",
            Trigger::Stop => "/backend/stop",
            Trigger::SetupComplete => "/setup/complete",
        }
    }
}

pub struct ShellClient {
    host: String,
    http: reqwest::Client,
}

impl ShellClient {
    /// `server` is `host:port`; a leading scheme and trailing slash are ignored.
    pub fn new(server: &str) -> Self {
        Self {
            host: normalize_host(server),
            http: reqwest::Client::new(),
        }
    }

    pub fn http_url(&self, path: &str) -> String {
        format!("http://{}{}", self.host, path)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/ws", self.host)
    }

    pub async fn snapshot(&self) -> anyhow::Result<SupervisorSnapshot> {
        let response = self
            .http
            .get(self.http_url("/backend"))
            .send()
            .await
            .with_context(|| format!("Could not reach ultra-shell at {}", self.host))?;
        Ok(response.error_for_status()?.json().await?)
    }

    pub async fn trigger(&self, trigger: Trigger) -> anyhow::Result<SupervisorSnapshot> {
        let response = self
            .http
            .post(self.http_url(trigger.path()))
            .send()
            .await
            .with_context(|| format!("Could not reach ultra-shell at {}", self.host))?;

        if response.status().is_success() {
            return Ok(response.json().await?);
        }
        let status = response.status();
        let body: serde_json::Value = response.json().await.unwrap_or_default();
        bail!(
            "{} ({})",
            body["message"].as_str().unwrap_or("request failed"),
            body["code"].as_str().unwrap_or(status.as_str()),
        )
    }

    pub async fn connect(&self) -> anyhow::Result<ShellSocket> {
        let (socket, _) = tokio_tungstenite::connect_async(self.ws_url())
            .await
            .with_context(|| format!("Could not open WebSocket to {}", self.ws_url()))?;
        Ok(socket)
    }
}

pub async fn send_message(socket: &mut ShellSocket, msg: &ClientMessage) -> anyhow::Result<()> {
    let json = serde_json::to_string(msg)?;
    socket.send(Message::Text(json.into())).await?;
    Ok(())
}

fn normalize_host(server: &str) -> String {
    let trimmed = server.trim().trim_end_matches('/');
    ["http://", "https://", "ws://", "wss://"]
        .iter()
        .find_map(|scheme| trimmed.strip_prefix(scheme))
        .unwrap_or(trimmed)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn host_accepts_bare_and_scheme_prefixed_servers() {
        assert_eq!(normalize_host("127.0.0.1:3000"), "127.0.0.1:3000");
        assert_eq!(normalize_host("http://localhost:4100/"), "localhost:4100");
        assert_eq!(normalize_host(" ws://10.0.0.2:3000 "), "10.0.0.2:3000");
    }

    #[test]
    fn urls_are_built_from_host() {
        let client = ShellClient::new("127.0.0.1:3000");
        assert_eq!(client.ws_url(), "ws://127.0.0.1:3000/ws");
        assert_eq!(
            client.http_url(Trigger::Restart.path()),
            "http://127.0.0.1:3000/backend/restart"
        );
    }
}
