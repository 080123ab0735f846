use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::Router;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::{SinkExt as _, StreamExt as _};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::oneshot;

pub mod ocpp;

use ocpp::Inbound;

pub const PATH_WS: &str = "/ws";
pub const SUPPORTED_SUBPROTOCOLS: [&str; 2] = ["ocpp1.6", "ocpp2.0.1"];
pub const DEFAULT_SHARED_SECRET: &str = "fiddlesticks_fishsticks";

#[derive(Debug, Clone)]
pub struct CsmsConfig {
    pub shared_secret: String,

    /// When set, only these charge point ids may connect; others get 404.
    pub known_ids: Option<Arc<HashSet<String>>>,
}

impl Default for CsmsConfig {
    fn default() -> Self {
        Self {
            shared_secret: DEFAULT_SHARED_SECRET.to_string(),
            known_ids: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TestServerStats {
    connections_total: Arc<AtomicU64>,
    connections_open: Arc<AtomicU64>,
    rejected_unauthorized: Arc<AtomicU64>,
    rejected_unknown: Arc<AtomicU64>,
    calls_total: Arc<AtomicU64>,
    malformed_total: Arc<AtomicU64>,
    transactions_started: Arc<AtomicU64>,
    calls_by_action: Arc<Mutex<BTreeMap<String, u64>>>,
    connections_by_id: Arc<Mutex<BTreeMap<String, u64>>>,
}

impl TestServerStats {
    fn on_connect(&self, charge_point_id: &str) {
        self.connections_total.fetch_add(1, Ordering::Relaxed);
        self.connections_open.fetch_add(1, Ordering::Relaxed);
        *self
            .connections_by_id
            .lock()
            .entry(charge_point_id.to_string())
            .or_insert(0) += 1;
    }

    fn on_disconnect(&self) {
        self.connections_open.fetch_sub(1, Ordering::Relaxed);
    }

    fn inc_rejected_unauthorized(&self) {
        self.rejected_unauthorized.fetch_add(1, Ordering::Relaxed);
    }

    fn inc_rejected_unknown(&self) {
        self.rejected_unknown.fetch_add(1, Ordering::Relaxed);
    }

    fn on_call(&self, action: &str) {
        self.calls_total.fetch_add(1, Ordering::Relaxed);
        *self
            .calls_by_action
            .lock()
            .entry(action.to_string())
            .or_insert(0) += 1;
    }

    fn inc_malformed(&self) {
        self.malformed_total.fetch_add(1, Ordering::Relaxed);
    }

    fn next_transaction_id(&self) -> u64 {
        self.transactions_started.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn connections_total(&self) -> u64 {
        self.connections_total.load(Ordering::Relaxed)
    }

    pub fn connections_open(&self) -> u64 {
        self.connections_open.load(Ordering::Relaxed)
    }

    pub fn rejected_unauthorized(&self) -> u64 {
        self.rejected_unauthorized.load(Ordering::Relaxed)
    }

    pub fn rejected_unknown(&self) -> u64 {
        self.rejected_unknown.load(Ordering::Relaxed)
    }

    pub fn calls_total(&self) -> u64 {
        self.calls_total.load(Ordering::Relaxed)
    }

    pub fn malformed_total(&self) -> u64 {
        self.malformed_total.load(Ordering::Relaxed)
    }

    pub fn calls_of(&self, action: &str) -> u64 {
        self.calls_by_action.lock().get(action).copied().unwrap_or(0)
    }

    pub fn connections_of(&self, charge_point_id: &str) -> u64 {
        self.connections_by_id
            .lock()
            .get(charge_point_id)
            .copied()
            .unwrap_or(0)
    }
}

#[derive(Clone)]
struct AppState {
    config: Arc<CsmsConfig>,
    stats: TestServerStats,
}

fn is_authorized(headers: &HeaderMap, charge_point_id: &str, secret: &str) -> bool {
    let Some(encoded) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Basic "))
    else {
        return false;
    };

    let Ok(decoded) = STANDARD.decode(encoded.trim()) else {
        return false;
    };
    decoded == format!("{charge_point_id}:{secret}").as_bytes()
}

async fn handle_ws(
    State(state): State<AppState>,
    Path(charge_point_id): Path<String>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if !is_authorized(&headers, &charge_point_id, &state.config.shared_secret) {
        state.stats.inc_rejected_unauthorized();
        return StatusCode::UNAUTHORIZED.into_response();
    }

    if let Some(known) = &state.config.known_ids
        && !known.contains(&charge_point_id)
    {
        state.stats.inc_rejected_unknown();
        return StatusCode::NOT_FOUND.into_response();
    }

    let stats = state.stats.clone();
    ws.protocols(SUPPORTED_SUBPROTOCOLS)
        .on_upgrade(move |socket| serve_charge_point(socket, charge_point_id, stats))
}

async fn serve_charge_point(socket: WebSocket, charge_point_id: String, stats: TestServerStats) {
    stats.on_connect(&charge_point_id);
    let (mut sender, mut receiver) = socket.split();

    while let Some(msg) = receiver.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => continue,
        };

        let reply = match ocpp::classify(text.as_str()) {
            Inbound::Call { call_id, action } => {
                stats.on_call(&action);
                let transaction_id = if action == "StartTransaction" {
                    stats.next_transaction_id()
                } else {
                    0
                };
                ocpp::call_result(&call_id, ocpp::result_payload(&action, transaction_id))
            }
            Inbound::Response => continue,
            Inbound::Malformed { call_id, reason } => {
                stats.inc_malformed();
                ocpp::format_violation(call_id.as_deref(), reason)
            }
        };

        if sender.send(Message::Text(reply.into())).await.is_err() {
            break;
        }
    }

    stats.on_disconnect();
}

pub fn router(config: CsmsConfig, stats: TestServerStats) -> Router {
    Router::new()
        .route(&format!("{PATH_WS}/{{charge_point_id}}"), any(handle_ws))
        .with_state(AppState {
            config: Arc::new(config),
            stats,
        })
}

/// In-process charge-point management system that accepts OCPP-J connections.
pub struct TestServer {
    addr: SocketAddr,
    ws_base_url: String,
    stats: TestServerStats,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    pub async fn start() -> std::io::Result<Self> {
        Self::start_with(CsmsConfig::default()).await
    }

    pub async fn start_with(config: CsmsConfig) -> std::io::Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let stats = TestServerStats::default();
        let app = router(config, stats.clone());

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, app).with_graceful_shutdown(async move {
                let _ = shutdown_rx.await;
            });
            let _ = serve.await;
        });

        Ok(Self {
            addr,
            ws_base_url: format!("ws://{addr}{PATH_WS}"),
            stats,
            shutdown_tx: Some(shutdown_tx),
            task: Some(task),
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Endpoint prefix; append `/<charge point id>`.
    pub fn ws_base_url(&self) -> &str {
        &self.ws_base_url
    }

    pub fn stats(&self) -> &TestServerStats {
        &self.stats
    }

    pub async fn shutdown(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }

        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        if self.shutdown_tx.is_some()
            && let Some(task) = self.task.take()
        {
            task.abort();
        }
    }
}
