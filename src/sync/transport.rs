//! Event-stream transports: a WebSocket channel and an HTTP long-polling
//! fallback, both speaking JSON `{event, data}` frames.

use std::fmt;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::api::events::{InboundEvent, OutboundEvent};
use crate::error::{ChatError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportKind {
    WebSocket,
    Polling,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::WebSocket => f.write_str("websocket"),
            TransportKind::Polling => f.write_str("polling"),
        }
    }
}

/// One live connection to the remote event endpoint.
#[async_trait]
pub trait Transport: Send {
    fn kind(&self) -> TransportKind;

    async fn send(&mut self, event: &OutboundEvent) -> Result<()>;

    /// Next inbound event. `None` once the remote side has closed.
    /// Must be cancellation safe.
    async fn recv(&mut self) -> Option<Result<InboundEvent>>;

    async fn close(&mut self);
}

/// Opens transports of a requested kind.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, kind: TransportKind) -> Result<Box<dyn Transport>>;
}

/// Connector for the real service.
pub struct NetworkConnector {
    http: reqwest::Client,
    base_url: Url,
}

impl NetworkConnector {
    pub fn new(base_url: Url) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url,
        }
    }
}

#[async_trait]
impl Connector for NetworkConnector {
    async fn connect(&self, kind: TransportKind) -> Result<Box<dyn Transport>> {
        match kind {
            TransportKind::WebSocket => {
                let url = crate::utils::websocket_url(&self.base_url)?;
                Ok(Box::new(WebSocketTransport::connect(&url).await?))
            }
            TransportKind::Polling => {
                let url = crate::utils::polling_url(&self.base_url)?;
                Ok(Box::new(PollingTransport::connect(self.http.clone(), url).await?))
            }
        }
    }
}

pub struct WebSocketTransport {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WebSocketTransport {
    pub async fn connect(url: &Url) -> Result<Self> {
        let (ws, _) = connect_async(url.as_str()).await?;
        log::info!("websocket connected to {}", url);
        Ok(Self { ws })
    }
}

#[async_trait]
impl Transport for WebSocketTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::WebSocket
    }

    async fn send(&mut self, event: &OutboundEvent) -> Result<()> {
        let text = serde_json::to_string(event)?;
        self.ws.send(WsMessage::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent>> {
        loop {
            match self.ws.next().await? {
                Ok(WsMessage::Text(text)) => match InboundEvent::decode(&text) {
                    Ok(Some(event)) => return Some(Ok(event)),
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("dropping malformed frame: {}", e);
                        continue;
                    }
                },
                Ok(WsMessage::Close(frame)) => {
                    log::info!("websocket closed by peer: {:?}", frame);
                    return None;
                }
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.ws.close(None).await {
            log::debug!("websocket close: {}", e);
        }
    }
}

#[derive(Deserialize)]
struct Handshake {
    sid: String,
}

/// Long-polling fallback. A background task keeps a GET outstanding and feeds
/// decoded frames into a channel, which keeps `recv` cancellation safe.
pub struct PollingTransport {
    http: reqwest::Client,
    session_url: Url,
    inbound: mpsc::Receiver<Result<InboundEvent>>,
    poller: JoinHandle<()>,
}

impl PollingTransport {
    pub async fn connect(http: reqwest::Client, url: Url) -> Result<Self> {
        let resp = http.post(url.clone()).send().await?;
        if !resp.status().is_success() {
            return Err(ChatError::Status(resp.status().as_u16()));
        }
        let handshake: Handshake = resp.json().await?;

        let mut session_url = url;
        session_url
            .query_pairs_mut()
            .append_pair("sid", &handshake.sid);
        log::info!("polling session {} opened", handshake.sid);

        let (tx, inbound) = mpsc::channel(64);
        let poller = tokio::spawn(poll_loop(http.clone(), session_url.clone(), tx));
        Ok(Self {
            http,
            session_url,
            inbound,
            poller,
        })
    }
}

async fn poll_loop(http: reqwest::Client, url: Url, tx: mpsc::Sender<Result<InboundEvent>>) {
    loop {
        let batch = match fetch_batch(&http, &url).await {
            Ok(batch) => batch,
            Err(e) => {
                let _ = tx.send(Err(e)).await;
                return;
            }
        };
        for raw in batch {
            match InboundEvent::from_value(raw) {
                Ok(Some(event)) => {
                    if tx.send(Ok(event)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => {}
                Err(e) => log::warn!("dropping malformed frame: {}", e),
            }
        }
    }
}

async fn fetch_batch(http: &reqwest::Client, url: &Url) -> Result<Vec<serde_json::Value>> {
    let resp = http.get(url.clone()).send().await?;
    if !resp.status().is_success() {
        return Err(ChatError::Status(resp.status().as_u16()));
    }
    Ok(resp.json().await?)
}

#[async_trait]
impl Transport for PollingTransport {
    fn kind(&self) -> TransportKind {
        TransportKind::Polling
    }

    async fn send(&mut self, event: &OutboundEvent) -> Result<()> {
        let resp = self
            .http
            .post(self.session_url.clone())
            .json(event)
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(ChatError::Status(resp.status().as_u16()));
        }
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<InboundEvent>> {
        self.inbound.recv().await
    }

    async fn close(&mut self) {
        self.poller.abort();
        self.inbound.close();
    }
}

impl Drop for PollingTransport {
    fn drop(&mut self) {
        self.poller.abort();
    }
}
