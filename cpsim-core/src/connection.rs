use std::time::Duration;

use async_trait::async_trait;

/// Everything a transport needs to open one charge-point connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectRequest {
    pub url: String,
    pub subprotocol: String,
    pub authorization: String,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConnectError {
    /// The server answered the upgrade with something other than 101.
    #[error("upgrade rejected with http status {status}")]
    Rejected { status: u16 },

    #[error("connect timed out after {0:?}")]
    TimedOut(Duration),

    #[error("connect failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("send failed: {0}")]
pub struct SendError(pub String);

/// Opens persistent connections on behalf of virtual clients.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(&self, req: &ConnectRequest) -> Result<Box<dyn Connection>, ConnectError>;
}

/// One open duplex text-frame connection.
///
/// Inbound frames are consumed by the implementation and only counted; nothing
/// the session does waits on them.
#[async_trait]
pub trait Connection: Send {
    async fn send_text(&mut self, frame: String) -> Result<(), SendError>;

    /// Idempotent. Errors while closing are absorbed by the implementation.
    async fn close(&mut self);

    fn messages_received(&self) -> u64;
}
