#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use cpsim_core::{
    ConnectError, ConnectRequest, Connection, Connector, IdentityProvider, SendError,
    SessionScript, SessionSettings,
};
use parking_lot::Mutex;

pub const SECRET: &str = "fiddlesticks_fishsticks";

#[derive(Debug, Clone, Copy, Default)]
pub enum Behavior {
    #[default]
    Accept,
    Reject(u16),
    /// Accept, then fail the n-th send (1-based) on every connection.
    FailSend(usize),
    /// Accept after a delay.
    SlowConnect(Duration),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub connection: u64,
    pub url: String,
    pub text: String,
}

/// Shared record of everything the fake transport saw.
#[derive(Debug, Default)]
pub struct Wire {
    pub connects: Mutex<Vec<ConnectRequest>>,
    pub frames: Mutex<Vec<Frame>>,
    pub close_calls: AtomicU64,
    pub closed_connections: Mutex<Vec<u64>>,
    next_connection: AtomicU64,
}

impl Wire {
    pub fn frames_for(&self, url: &str) -> Vec<String> {
        self.frames
            .lock()
            .iter()
            .filter(|f| f.url == url)
            .map(|f| f.text.clone())
            .collect()
    }

    pub fn connect_count(&self) -> usize {
        self.connects.lock().len()
    }

    pub fn close_calls(&self) -> u64 {
        self.close_calls.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Default)]
pub struct FakeConnector {
    pub wire: Arc<Wire>,
    pub behavior: Behavior,
}

impl FakeConnector {
    pub fn new(behavior: Behavior) -> Self {
        Self {
            wire: Arc::new(Wire::default()),
            behavior,
        }
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, req: &ConnectRequest) -> Result<Box<dyn Connection>, ConnectError> {
        self.wire.connects.lock().push(req.clone());

        let fail_on = match self.behavior {
            Behavior::Accept => None,
            Behavior::Reject(status) => return Err(ConnectError::Rejected { status }),
            Behavior::FailSend(n) => Some(n),
            Behavior::SlowConnect(delay) => {
                tokio::time::sleep(delay).await;
                None
            }
        };

        let id = self.wire.next_connection.fetch_add(1, Ordering::Relaxed) + 1;
        Ok(Box::new(FakeConnection {
            id,
            url: req.url.clone(),
            wire: self.wire.clone(),
            sent: 0,
            fail_on,
            closed: false,
        }))
    }
}

struct FakeConnection {
    id: u64,
    url: String,
    wire: Arc<Wire>,
    sent: usize,
    fail_on: Option<usize>,
    closed: bool,
}

#[async_trait]
impl Connection for FakeConnection {
    async fn send_text(&mut self, frame: String) -> Result<(), SendError> {
        self.sent += 1;
        if self.fail_on == Some(self.sent) {
            return Err(SendError("connection reset by peer".to_string()));
        }
        self.wire.frames.lock().push(Frame {
            connection: self.id,
            url: self.url.clone(),
            text: frame,
        });
        Ok(())
    }

    async fn close(&mut self) {
        self.wire.close_calls.fetch_add(1, Ordering::Relaxed);
        if !self.closed {
            self.closed = true;
            self.wire.closed_connections.lock().push(self.id);
        }
    }

    fn messages_received(&self) -> u64 {
        // The fake server acknowledges every call it saw.
        self.sent.saturating_sub(usize::from(self.fail_on.is_some_and(|n| n <= self.sent))) as u64
    }
}

pub fn settings() -> Arc<SessionSettings> {
    Arc::new(
        SessionSettings::new("ws://csms.test/ws")
            .unwrap_or_else(|e| panic!("settings: {e}")),
    )
}

pub fn derived_identities() -> IdentityProvider {
    IdentityProvider::derived("cs", 3, SECRET).unwrap_or_else(|e| panic!("identities: {e}"))
}

pub fn script(builder: cpsim_core::ScriptBuilder) -> Arc<SessionScript> {
    Arc::new(builder.build().unwrap_or_else(|e| panic!("script: {e}")))
}

pub fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}
