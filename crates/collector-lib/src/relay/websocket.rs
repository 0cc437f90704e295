//! WebSocket transport

use super::transport::{Connection, Connector, Frame, Liveness};
use super::RelayError;
use async_trait::async_trait;
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::debug;
use url::Url;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Connects over `ws://` or `wss://`
#[derive(Debug, Clone)]
pub struct WebSocketConnector {
    connect_timeout: Duration,
}

impl WebSocketConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

fn redacted(url: &Url) -> String {
    format!("{}://{}{}", url.scheme(), url.host_str().unwrap_or_default(), url.path())
}

#[async_trait]
impl Connector for WebSocketConnector {
    async fn connect(&self, url: &Url, liveness: Arc<Liveness>) -> Result<Box<dyn Connection>, RelayError> {
        let (stream, _) = tokio::time::timeout(self.connect_timeout, connect_async(url.as_str()))
            .await
            .map_err(|_| RelayError::ConnectTimeout {
                endpoint: redacted(url),
            })?
            .map_err(|source| RelayError::Connect {
                endpoint: redacted(url),
                source,
            })?;

        let (sink, mut incoming) = stream.split();

        // Inbound frames carry nothing but pongs of interest
        let reader = tokio::spawn(async move {
            while let Some(message) = incoming.next().await {
                match message {
                    Ok(Message::Pong(_)) => liveness.pong_received(),
                    Ok(Message::Close(frame)) => {
                        debug!(frame = ?frame, "Report endpoint closed the connection");
                        break;
                    }
                    Ok(_) => {}
                    Err(error) => {
                        debug!(error = %error, "Report connection read failed");
                        break;
                    }
                }
            }
        });

        Ok(Box::new(WebSocketConnection { sink, reader }))
    }
}

struct WebSocketConnection {
    sink: WsSink,
    reader: JoinHandle<()>,
}

#[async_trait]
impl Connection for WebSocketConnection {
    async fn send(&mut self, frame: Frame) -> Result<(), RelayError> {
        if self.reader.is_finished() {
            return Err(RelayError::Closed);
        }

        let message = match frame {
            Frame::Report(payload) => Message::Text(payload),
            Frame::Ping => Message::Ping(Vec::new()),
        };
        self.sink.send(message).await.map_err(RelayError::Send)
    }

    async fn close(&mut self) {
        if let Err(error) = self.sink.close().await {
            debug!(error = %error, "Closing report connection failed");
        }
        self.reader.abort();
    }
}

impl Drop for WebSocketConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
