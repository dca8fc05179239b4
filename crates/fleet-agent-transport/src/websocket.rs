//! WebSocket session to the manager.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream,
    tungstenite::{
        Error as WsError, Message,
        client::IntoClientRequest,
        http::{HeaderValue, header::USER_AGENT},
    },
};

use crate::channel::{Channel, ChannelError, ConnectionError, Connector};

/// Connector opening WebSocket sessions.
#[derive(Debug, Clone)]
pub struct WsConnector {
    not_approved_status: u16,
}

impl WsConnector {
    /// `not_approved_status` is the handshake status the manager answers
    /// with while the device awaits approval.
    #[must_use]
    pub const fn new(not_approved_status: u16) -> Self {
        Self { not_approved_status }
    }

    fn classify(&self, error: WsError) -> ConnectionError {
        match error {
            WsError::Http(response) => {
                let status = response.status().as_u16();
                if status == self.not_approved_status {
                    ConnectionError::RejectedNotApproved
                } else {
                    ConnectionError::OtherRejection { status }
                }
            }
            other => ConnectionError::LocalTransport(other.to_string()),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(
        &self,
        url: &str,
        user_agent: &str,
    ) -> Result<Box<dyn Channel>, ConnectionError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| ConnectionError::LocalTransport(e.to_string()))?;
        let agent = HeaderValue::from_str(user_agent)
            .map_err(|e| ConnectionError::LocalTransport(e.to_string()))?;
        request.headers_mut().insert(USER_AGENT, agent);

        let (stream, _) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| self.classify(e))?;
        Ok(Box::new(WsChannel { stream }))
    }
}

struct WsChannel {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl Channel for WsChannel {
    async fn send(&mut self, text: String) -> Result<(), ChannelError> {
        self.stream
            .send(Message::Text(text))
            .await
            .map_err(|e| match e {
                WsError::ConnectionClosed | WsError::AlreadyClosed => ChannelError::Closed,
                other => ChannelError::Transport(other.to_string()),
            })
    }

    async fn recv(&mut self) -> Option<Result<String, ChannelError>> {
        loop {
            let msg = match self.stream.next().await? {
                Ok(msg) => msg,
                Err(WsError::ConnectionClosed) => return None,
                Err(e) => return Some(Err(ChannelError::Transport(e.to_string()))),
            };
            match msg {
                Message::Text(text) => return Some(Ok(text)),
                Message::Binary(data) => match String::from_utf8(data) {
                    Ok(text) => return Some(Ok(text)),
                    Err(_) => tracing::warn!("Skipping non-UTF-8 binary frame"),
                },
                Message::Close(frame) => {
                    tracing::debug!(?frame, "Session closed by manager");
                    return None;
                }
                // Pings are answered by the protocol layer.
                _ => {}
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!(error = %e, "Error closing session");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_tungstenite::tungstenite::http::Response;

    #[test]
    fn test_handshake_status_classified() {
        let connector = WsConnector::new(403);

        let not_approved = WsError::Http(Response::builder().status(403).body(None).unwrap());
        assert_eq!(connector.classify(not_approved), ConnectionError::RejectedNotApproved);

        let other = WsError::Http(Response::builder().status(500).body(None).unwrap());
        assert_eq!(
            connector.classify(other),
            ConnectionError::OtherRejection { status: 500 }
        );

        assert!(matches!(
            connector.classify(WsError::ConnectionClosed),
            ConnectionError::LocalTransport(_)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let connector = WsConnector::new(403);
        let result = connector.connect("ws://127.0.0.1:9/dev?token=t", "fleet-agent/test").await;
        assert!(matches!(result, Err(ConnectionError::LocalTransport(_))));
    }
}
