use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::SessionSettings;
use crate::connection::{ConnectRequest, Connection, Connector};
use crate::identity::Identity;
use crate::script::{SessionScript, Step};

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    strum::Display,
    strum::EnumString,
    strum::IntoStaticStr,
)]
#[strum(serialize_all = "snake_case")]
pub enum ErrorKind {
    /// Transport failure or a non-101 upgrade response. No steps were attempted.
    ConnectFailure,
    /// A send failed mid-script; the rest of the script was skipped.
    TransmitFailure,
    /// The scheduler withdrew the session (immediate ramp-down or run deadline).
    Cancelled,
    /// The per-session time budget ran out.
    Timeout,
    /// The session task panicked.
    Aborted,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionError {
    pub kind: ErrorKind,
    pub detail: String,
}

impl SessionError {
    pub fn new(kind: ErrorKind, detail: impl Into<String>) -> Self {
        Self {
            kind,
            detail: detail.into(),
        }
    }
}

impl std::fmt::Display for SessionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.detail)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallRecord {
    pub call_id: String,
    pub action: String,
    /// Offset from session start at which the frame was handed to the connection.
    pub sent_at: Duration,
}

#[derive(Debug, Clone)]
pub struct SessionOutcome {
    pub client_index: u64,
    pub charge_point_id: String,
    pub connect_established: bool,
    pub steps_completed: usize,
    pub total_steps: usize,
    pub error: Option<SessionError>,
    pub started_at: SystemTime,
    pub ended_at: SystemTime,
    pub duration: Duration,
    pub connect_latency: Option<Duration>,
    pub calls: Vec<CallRecord>,
    pub messages_received: u64,
}

impl SessionOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none() && self.steps_completed == self.total_steps
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|e| e.kind)
    }

    /// Outcome for a session whose task died before it could report.
    pub fn aborted(
        client_index: u64,
        charge_point_id: String,
        total_steps: usize,
        detail: impl Into<String>,
    ) -> Self {
        let now = SystemTime::now();
        Self {
            client_index,
            charge_point_id,
            connect_established: false,
            steps_completed: 0,
            total_steps,
            error: Some(SessionError::new(ErrorKind::Aborted, detail)),
            started_at: now,
            ended_at: now,
            duration: Duration::ZERO,
            connect_latency: None,
            calls: Vec::new(),
            messages_received: 0,
        }
    }
}

/// State that must survive a timeout or cancellation of the driving future so
/// the connection can still be closed and the outcome reported.
#[derive(Default)]
struct Progress {
    conn: Option<Box<dyn Connection>>,
    connect_established: bool,
    connect_latency: Option<Duration>,
    steps_completed: usize,
    calls: Vec<CallRecord>,
    messages_received: u64,
}

/// One simulated charge point: connect, play the script, close, report.
pub struct VirtualClientSession {
    identity: Identity,
    script: Arc<SessionScript>,
    connector: Arc<dyn Connector>,
    settings: Arc<SessionSettings>,
}

impl VirtualClientSession {
    pub fn new(
        identity: Identity,
        script: Arc<SessionScript>,
        connector: Arc<dyn Connector>,
        settings: Arc<SessionSettings>,
    ) -> Self {
        Self {
            identity,
            script,
            connector,
            settings,
        }
    }

    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    pub fn total_steps(&self) -> usize {
        self.script.len()
    }

    pub async fn execute(self, cancel: CancellationToken) -> SessionOutcome {
        let started_at = SystemTime::now();
        let started = Instant::now();
        let mut progress = Progress::default();

        let result = match self.settings.session_timeout {
            Some(limit) => {
                match tokio::time::timeout(limit, self.drive(&mut progress, &cancel, started))
                    .await
                {
                    Ok(res) => res,
                    Err(_) => Err(SessionError::new(
                        ErrorKind::Timeout,
                        format!("session exceeded {limit:?}"),
                    )),
                }
            }
            None => self.drive(&mut progress, &cancel, started).await,
        };

        if let Some(mut conn) = progress.conn.take() {
            conn.close().await;
            progress.messages_received = conn.messages_received();
        }

        let error = result.err();
        let outcome = SessionOutcome {
            client_index: self.identity.client_index,
            charge_point_id: self.identity.charge_point_id,
            connect_established: progress.connect_established,
            steps_completed: progress.steps_completed,
            total_steps: self.script.len(),
            error,
            started_at,
            ended_at: SystemTime::now(),
            duration: started.elapsed(),
            connect_latency: progress.connect_latency,
            calls: progress.calls,
            messages_received: progress.messages_received,
        };

        match &outcome.error {
            None => debug!(
                client = outcome.client_index,
                id = %outcome.charge_point_id,
                steps = outcome.steps_completed,
                "session finished"
            ),
            Some(err) if err.kind == ErrorKind::Cancelled => debug!(
                client = outcome.client_index,
                id = %outcome.charge_point_id,
                steps = outcome.steps_completed,
                "session cancelled"
            ),
            Some(err) => warn!(
                client = outcome.client_index,
                id = %outcome.charge_point_id,
                steps = outcome.steps_completed,
                kind = %err.kind,
                error = %err.detail,
                "session failed"
            ),
        }

        outcome
    }

    async fn drive(
        &self,
        p: &mut Progress,
        cancel: &CancellationToken,
        started: Instant,
    ) -> Result<(), SessionError> {
        let req = ConnectRequest {
            url: self.settings.url_for(&self.identity.charge_point_id),
            subprotocol: self.settings.subprotocol.clone(),
            authorization: self.identity.authorization_header(),
        };

        let connect_started = Instant::now();
        let conn = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(cancelled("while connecting")),
            res = self.connector.connect(&req) => {
                res.map_err(|e| SessionError::new(ErrorKind::ConnectFailure, e.to_string()))?
            }
        };
        p.connect_latency = Some(connect_started.elapsed());
        p.connect_established = true;
        p.conn = Some(conn);
        debug!(client = self.identity.client_index, url = %req.url, "connected");

        for step in self.script.steps() {
            if cancel.is_cancelled() {
                return Err(cancelled(format!("before step {}", p.steps_completed + 1)));
            }

            let delay = step.delay_before();
            if !delay.is_zero() {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => {
                        return Err(cancelled(format!("waiting for step {}", p.steps_completed + 1)));
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
            }

            match step {
                Step::Send(call) => {
                    let Some(conn) = p.conn.as_mut() else {
                        return Err(SessionError::new(
                            ErrorKind::TransmitFailure,
                            "connection already closed",
                        ));
                    };
                    conn.send_text(call.encode()).await.map_err(|e| {
                        SessionError::new(
                            ErrorKind::TransmitFailure,
                            format!("call {} {}: {e}", call.call_id, call.action),
                        )
                    })?;

                    p.calls.push(CallRecord {
                        call_id: call.call_id.clone(),
                        action: call.action.clone(),
                        sent_at: started.elapsed(),
                    });
                    p.steps_completed += 1;
                    debug!(
                        client = self.identity.client_index,
                        call_id = %call.call_id,
                        action = %call.action,
                        "sent"
                    );
                }
                Step::Close { .. } => {
                    if let Some(mut conn) = p.conn.take() {
                        conn.close().await;
                        p.messages_received = conn.messages_received();
                    }
                    p.steps_completed += 1;
                    break;
                }
            }
        }

        Ok(())
    }
}

fn cancelled(detail: impl Into<String>) -> SessionError {
    SessionError::new(ErrorKind::Cancelled, detail)
}
