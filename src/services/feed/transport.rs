use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use crate::errors::FeedError;

/// One open duplex text connection.
#[async_trait]
pub trait FeedTransport: Send {
    async fn send(&mut self, text: String) -> Result<(), FeedError>;

    /// Next text frame. `None` once the peer has closed.
    async fn recv(&mut self) -> Option<Result<String, FeedError>>;

    async fn close(&mut self);
}

/// Opens transports; called once per connection attempt.
#[async_trait]
pub trait FeedConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn FeedTransport>, FeedError>;
}

pub struct WsConnector {
    url: String,
}

impl WsConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }
}

#[async_trait]
impl FeedConnector for WsConnector {
    async fn connect(&self) -> Result<Box<dyn FeedTransport>, FeedError> {
        tracing::info!(url = %self.url, "connecting to feed websocket");
        let (stream, _response) = connect_async(self.url.as_str())
            .await
            .map_err(|e| FeedError::Connect(e.to_string()))?;
        Ok(Box::new(WsTransport { stream }))
    }
}

struct WsTransport {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

#[async_trait]
impl FeedTransport for WsTransport {
    async fn send(&mut self, text: String) -> Result<(), FeedError> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Option<Result<String, FeedError>> {
        loop {
            match self.stream.next().await? {
                Ok(Message::Text(text)) => return Some(Ok(text)),
                Ok(Message::Close(frame)) => {
                    tracing::debug!("feed sent close frame: {:?}", frame);
                    return None;
                }
                // pings are answered by tungstenite on the next write
                Ok(_) => continue,
                Err(e) => return Some(Err(e.into())),
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            tracing::debug!("feed close handshake failed: {}", e);
        }
    }
}
