//! Message pipe underneath the subscription channel

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::{Error as WsError, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use tracing::{debug, trace, warn};

use crate::{LinkError, Result};

/// Bidirectional text message transport.
///
/// Owned by exactly one channel session task. `recv` must be cancel safe,
/// as the session polls it under a timeout.
#[async_trait::async_trait]
pub trait Transport: Send + 'static {
    /// Send one text message.
    async fn send(&mut self, text: String) -> Result<()>;

    /// Receive the next text message.
    ///
    /// Returns:
    /// - `Ok(Some(text))` - message received
    /// - `Ok(None)` - peer closed the stream
    /// - `Err(e)` - transport failure
    async fn recv(&mut self) -> Result<Option<String>>;

    /// Close the stream.
    async fn close(&mut self) -> Result<()>;
}

#[async_trait::async_trait]
impl Transport for Box<dyn Transport> {
    async fn send(&mut self, text: String) -> Result<()> {
        (**self).send(text).await
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        (**self).recv().await
    }

    async fn close(&mut self) -> Result<()> {
        (**self).close().await
    }
}

/// WebSocket connection to the X-Plane web API.
pub struct WebSocketTransport {
    url: String,
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl std::fmt::Debug for WebSocketTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketTransport").field("url", &self.url).finish()
    }
}

impl WebSocketTransport {
    pub async fn connect(url: &str) -> Result<Self> {
        let (stream, response) = connect_async(url)
            .await
            .map_err(|e| LinkError::transport_with_source(format!("WebSocket connect to {}", url), Box::new(e)))?;
        debug!(status = %response.status(), "WebSocket connected to {}", url);
        Ok(Self { url: url.to_string(), stream })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait::async_trait]
impl Transport for WebSocketTransport {
    async fn send(&mut self, text: String) -> Result<()> {
        self.stream.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn recv(&mut self) -> Result<Option<String>> {
        loop {
            match self.stream.next().await {
                None => return Ok(None),
                Some(Ok(Message::Text(text))) => return Ok(Some(text)),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => return Ok(Some(text)),
                    Err(e) => warn!(len = e.as_bytes().len(), "Dropping binary frame that is not UTF-8: {}", e.utf8_error()),
                },
                Some(Ok(Message::Close(frame))) => {
                    debug!(?frame, "WebSocket closed by peer");
                    return Ok(None);
                }
                Some(Ok(other)) => trace!("Skipping control frame {:?}", other),
                Some(Err(WsError::ConnectionClosed | WsError::AlreadyClosed)) => return Ok(None),
                Some(Err(e)) => return Err(e.into()),
            }
        }
    }

    async fn close(&mut self) -> Result<()> {
        match self.stream.close(None).await {
            Ok(()) | Err(WsError::ConnectionClosed | WsError::AlreadyClosed) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    #[tokio::test]
    async fn non_utf8_binary_frame_is_skipped() {
        let _ = tracing_subscriber::fmt::try_init();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(socket).await.unwrap();
            ws.send(Message::Binary(vec![0xff, 0xfe, 0xfd])).await.unwrap();
            ws.send(Message::Binary(b"{\"type\":\"result\"}".to_vec())).await.unwrap();
            ws.send(Message::Text("hello".into())).await.unwrap();
            ws.close(None).await.unwrap();
        });

        let mut transport = WebSocketTransport::connect(&format!("ws://{}", addr)).await.unwrap();
        assert_eq!(transport.recv().await.unwrap().as_deref(), Some("{\"type\":\"result\"}"));
        assert_eq!(transport.recv().await.unwrap().as_deref(), Some("hello"));
        assert_eq!(transport.recv().await.unwrap(), None);
        server.await.unwrap();
    }
}
