use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, AUTHORIZATION};
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use url::Url;

use super::{SignalingConnector, SignalingLink};
use crate::transport::TransportError;

/// Dials the hosted relay over a websocket, one text frame per message.
#[derive(Debug, Clone, Default)]
pub struct WebSocketConnector {
    bearer_token: Option<String>,
}

impl WebSocketConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bearer_token(mut self, token: Option<String>) -> Self {
        self.bearer_token = token;
        self
    }
}

#[async_trait]
impl SignalingConnector for WebSocketConnector {
    async fn connect(&self, endpoint: &Url) -> Result<SignalingLink, TransportError> {
        let mut request = endpoint
            .as_str()
            .into_client_request()
            .map_err(|err| TransportError::Setup(format!("invalid websocket request: {err}")))?;
        if let Some(token) = &self.bearer_token {
            let value = HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|err| TransportError::Setup(format!("invalid bearer token: {err}")))?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws_stream, _) = connect_async(request)
            .await
            .map_err(|err| TransportError::Setup(format!("websocket connect failed: {err}")))?;
        tracing::debug!(target = "signaling", url = %endpoint, "relay websocket connected");
        let (mut ws_write, mut ws_read) = ws_stream.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(err) = ws_write.send(Message::Text(text)).await {
                    tracing::warn!(target = "signaling", error = %err, "relay websocket write failed");
                    break;
                }
            }
            let _ = ws_write.close().await;
        });

        tokio::spawn(async move {
            while let Some(frame) = ws_read.next().await {
                let text = match frame {
                    Ok(Message::Text(text)) => text,
                    Ok(Message::Binary(data)) => match String::from_utf8(data) {
                        Ok(text) => text,
                        Err(_) => {
                            tracing::debug!(target = "signaling", "dropping non-utf8 binary frame");
                            continue;
                        }
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => continue,
                    Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => break,
                    Err(err) => {
                        tracing::warn!(target = "signaling", error = %err, "relay websocket error");
                        let _ = inbound_tx.send(Err(TransportError::Signaling(err.to_string())));
                        break;
                    }
                };
                if inbound_tx.send(Ok(text)).is_err() {
                    break;
                }
            }
        });

        Ok(SignalingLink {
            outbound: outbound_tx,
            inbound: inbound_rx,
        })
    }
}
