use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpsim_core::{ConnectError, ConnectRequest, Connection, Connector, SendError};
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest as _;
use tokio_tungstenite::tungstenite::handshake::client::Request;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::http::header::{AUTHORIZATION, SEC_WEBSOCKET_PROTOCOL};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use tracing::debug;

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// How long `close` waits for the server's close reply before dropping the reader.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// Opens OCPP-J WebSocket connections, one per virtual client.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self::new(DEFAULT_CONNECT_TIMEOUT)
    }
}

impl WsConnector {
    #[must_use]
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    pub fn connect_timeout(&self) -> Duration {
        self.connect_timeout
    }
}

fn build_request(req: &ConnectRequest) -> Result<Request, ConnectError> {
    let mut request = req
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ConnectError::Transport(e.to_string()))?;

    let protocol = HeaderValue::from_str(&req.subprotocol)
        .map_err(|e| ConnectError::Transport(format!("invalid subprotocol: {e}")))?;
    let authorization = HeaderValue::from_str(&req.authorization)
        .map_err(|e| ConnectError::Transport(format!("invalid authorization header: {e}")))?;

    let headers = request.headers_mut();
    headers.insert(SEC_WEBSOCKET_PROTOCOL, protocol);
    headers.insert(AUTHORIZATION, authorization);
    Ok(request)
}

fn map_connect_error(err: tungstenite::Error) -> ConnectError {
    match err {
        tungstenite::Error::Http(resp) => ConnectError::Rejected {
            status: resp.status().as_u16(),
        },
        other => ConnectError::Transport(other.to_string()),
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn connect(&self, req: &ConnectRequest) -> Result<Box<dyn Connection>, ConnectError> {
        let request = build_request(req)?;

        let (stream, response) = match tokio::time::timeout(
            self.connect_timeout,
            tokio_tungstenite::connect_async(request),
        )
        .await
        {
            Ok(res) => res.map_err(map_connect_error)?,
            Err(_) => return Err(ConnectError::TimedOut(self.connect_timeout)),
        };

        debug!(
            url = %req.url,
            protocol = ?response.headers().get(SEC_WEBSOCKET_PROTOCOL),
            "websocket upgraded"
        );

        let (sink, stream) = stream.split();
        let received = Arc::new(AtomicU64::new(0));
        let reader = tokio::spawn(read_frames(stream, received.clone(), req.url.clone()));

        Ok(Box::new(WsConnection {
            sink,
            received,
            reader: Some(reader),
            closed: false,
        }))
    }
}

/// Inbound frames are counted and logged, never interpreted.
async fn read_frames<S>(mut stream: S, received: Arc<AtomicU64>, url: String)
where
    S: futures::Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => {
                received.fetch_add(1, Ordering::Relaxed);
                debug!(url = %url, frame = %text.as_str(), "received");
            }
            Ok(Message::Binary(bytes)) => {
                received.fetch_add(1, Ordering::Relaxed);
                debug!(url = %url, len = bytes.len(), "received binary frame");
            }
            Ok(Message::Close(frame)) => {
                debug!(url = %url, ?frame, "server closed connection");
                break;
            }
            Ok(_) => {}
            Err(err) => {
                debug!(url = %url, error = %err, "read failed");
                break;
            }
        }
    }
}

pub struct WsConnection {
    sink: WsSink,
    received: Arc<AtomicU64>,
    reader: Option<JoinHandle<()>>,
    closed: bool,
}

#[async_trait]
impl Connection for WsConnection {
    async fn send_text(&mut self, frame: String) -> Result<(), SendError> {
        if self.closed {
            return Err(SendError("connection is closed".to_string()));
        }
        self.sink
            .send(Message::Text(frame.into()))
            .await
            .map_err(|e| SendError(e.to_string()))
    }

    async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        if let Err(err) = self.sink.close().await {
            debug!(error = %err, "close handshake failed");
        }

        if let Some(mut reader) = self.reader.take()
            && tokio::time::timeout(CLOSE_GRACE, &mut reader).await.is_err()
        {
            reader.abort();
        }
    }

    fn messages_received(&self) -> u64 {
        self.received.load(Ordering::Relaxed)
    }
}

impl Drop for WsConnection {
    fn drop(&mut self) {
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
    }
}
