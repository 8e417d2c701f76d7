//! Socket connections used by the websocket manager

use std::time::Duration;

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::USER_AGENT;
use tracing::{debug, info, warn};
use url::Url;

use crate::error::{ClientError, Result};

/// An open text connection. Dropping `sender` closes it; `receiver` ends
/// when the connection is closed.
pub struct Connection {
    pub sender: mpsc::UnboundedSender<String>,
    pub receiver: mpsc::UnboundedReceiver<String>,
}

/// Opens connections to the sync server
#[async_trait]
pub trait ConnectionProvider: Send + Sync {
    async fn connect(&self, url: &Url, session_id: &str) -> Result<Connection>;
}

/// Websocket connections over tokio-tungstenite
pub struct WebSocketProvider {
    connect_timeout: Duration,
}

impl WebSocketProvider {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Default for WebSocketProvider {
    fn default() -> Self {
        Self::new(Duration::from_millis(5000))
    }
}

#[async_trait]
impl ConnectionProvider for WebSocketProvider {
    async fn connect(&self, url: &Url, session_id: &str) -> Result<Connection> {
        let mut request = url
            .as_str()
            .into_client_request()
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;
        let agent = HeaderValue::from_str(session_id).map_err(|e| ClientError::WebSocket(e.to_string()))?;
        request.headers_mut().insert(USER_AGENT, agent);

        info!("Connecting to {}", url);
        let (stream, _) = tokio::time::timeout(self.connect_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| ClientError::WebSocket(format!("connecting to {url} timed out")))?
            .map_err(|e| ClientError::WebSocket(e.to_string()))?;

        let (mut write, mut read) = stream.split();
        let (sender, mut outgoing) = mpsc::unbounded_channel::<String>();
        let (incoming, receiver) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            while let Some(text) = outgoing.recv().await {
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    warn!("Websocket write failed: {}", e);
                    break;
                }
            }
            if let Err(e) = write.close().await {
                debug!("Websocket close failed: {}", e);
            }
            debug!("Websocket writer ended");
        });

        tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => {
                        if incoming.send(text.to_string()).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(reason)) => {
                        debug!("Websocket closed by server: {:?}", reason);
                        break;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("Websocket read failed: {}", e);
                        break;
                    }
                }
            }
            debug!("Websocket reader ended");
        });

        Ok(Connection { sender, receiver })
    }
}
