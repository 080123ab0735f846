use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::sync::OnceLock;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use hdrhistogram::Histogram;
use parking_lot::Mutex;
use tokio::time::Instant;
use tracing::warn;

use crate::session::{ErrorKind, SessionOutcome};

#[derive(Debug, Clone, PartialEq)]
pub struct DurationSummary {
    pub count: u64,
    pub min_ms: f64,
    pub max_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
}

#[derive(Debug, Clone)]
pub struct RunSummary {
    pub sessions_started: u64,
    pub outcomes_recorded: u64,
    pub connects_succeeded: u64,
    pub scripts_completed: u64,
    pub errors_by_kind: BTreeMap<ErrorKind, u64>,
    pub calls_sent: u64,
    pub calls_by_action: BTreeMap<String, u64>,
    pub messages_received: u64,
    pub connect_latency: Option<DurationSummary>,
    pub session_duration: Option<DurationSummary>,
    pub live_sessions: u64,
    pub peak_live_sessions: u64,
    pub duplicates_rejected: u64,
    pub run_duration: Option<Duration>,
}

impl RunSummary {
    pub fn connect_success_rate(&self) -> f64 {
        ratio(self.connects_succeeded, self.outcomes_recorded)
    }

    pub fn script_completion_rate(&self) -> f64 {
        ratio(self.scripts_completed, self.outcomes_recorded)
    }

    pub fn errors_of(&self, kind: ErrorKind) -> u64 {
        self.errors_by_kind.get(&kind).copied().unwrap_or(0)
    }

    /// Sessions that ended in an error other than a scheduler-initiated cancel.
    pub fn failed_sessions(&self) -> u64 {
        self.errors_by_kind
            .iter()
            .filter(|(kind, _)| **kind != ErrorKind::Cancelled)
            .map(|(_, n)| *n)
            .sum()
    }
}

fn ratio(num: u64, den: u64) -> f64 {
    if den == 0 {
        return 0.0;
    }
    num as f64 / den as f64
}

/// Concurrent sink for session outcomes. Each client index is accepted once.
#[derive(Debug)]
pub struct OutcomeCollector {
    sessions_started: AtomicU64,
    outcomes_recorded: AtomicU64,
    connects_succeeded: AtomicU64,
    scripts_completed: AtomicU64,
    calls_sent: AtomicU64,
    messages_received: AtomicU64,
    duplicates_rejected: AtomicU64,
    live: AtomicU64,
    peak_live: AtomicU64,

    seen: Mutex<SeenIndices>,
    errors_by_kind: DashMap<ErrorKind, u64>,
    calls_by_action: DashMap<String, u64>,

    connect_latency_us: Mutex<Histogram<u64>>,
    session_duration_ms: Mutex<Histogram<u64>>,

    retain_outcomes: bool,
    outcomes: Mutex<Vec<SessionOutcome>>,

    run_started: OnceLock<Instant>,
    run_duration: Mutex<Option<Duration>>,
}

impl Default for OutcomeCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl OutcomeCollector {
    /// Keeps every recorded outcome for later inspection.
    pub fn new() -> Self {
        Self::with_retention(true)
    }

    /// Aggregates only; suited to long runs with many sessions.
    pub fn summary_only() -> Self {
        Self::with_retention(false)
    }

    fn with_retention(retain_outcomes: bool) -> Self {
        Self {
            sessions_started: AtomicU64::new(0),
            outcomes_recorded: AtomicU64::new(0),
            connects_succeeded: AtomicU64::new(0),
            scripts_completed: AtomicU64::new(0),
            calls_sent: AtomicU64::new(0),
            messages_received: AtomicU64::new(0),
            duplicates_rejected: AtomicU64::new(0),
            live: AtomicU64::new(0),
            peak_live: AtomicU64::new(0),
            seen: Mutex::new(SeenIndices::default()),
            errors_by_kind: DashMap::new(),
            calls_by_action: DashMap::new(),
            // 1us .. 1h
            connect_latency_us: Mutex::new(new_histogram(3_600_000_000)),
            // 1ms .. 7d
            session_duration_ms: Mutex::new(new_histogram(604_800_000)),
            retain_outcomes,
            outcomes: Mutex::new(Vec::new()),
            run_started: OnceLock::new(),
            run_duration: Mutex::new(None),
        }
    }

    pub fn mark_run_started(&self) {
        let _ = self.run_started.set(Instant::now());
    }

    pub fn mark_run_finished(&self) {
        if let Some(started) = self.run_started.get() {
            *self.run_duration.lock() = Some(started.elapsed());
        }
    }

    /// Counts a started session and keeps the live gauge raised until the guard drops.
    pub fn enter_session(self: &Arc<Self>) -> ActiveSessionGuard {
        self.sessions_started.fetch_add(1, Ordering::Relaxed);
        let new_live = self.live.fetch_add(1, Ordering::Relaxed).saturating_add(1);

        // CAS loop to keep the max without races.
        let mut cur = self.peak_live.load(Ordering::Relaxed);
        while new_live > cur {
            match self.peak_live.compare_exchange_weak(
                cur,
                new_live,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(observed) => cur = observed,
            }
        }

        ActiveSessionGuard {
            collector: self.clone(),
        }
    }

    /// Returns `false` when an outcome for the same client index was already recorded.
    pub fn record(&self, outcome: SessionOutcome) -> bool {
        if !self.seen.lock().insert(outcome.client_index) {
            self.duplicates_rejected.fetch_add(1, Ordering::Relaxed);
            warn!(
                client = outcome.client_index,
                "duplicate session outcome rejected"
            );
            return false;
        }

        self.outcomes_recorded.fetch_add(1, Ordering::Relaxed);
        if outcome.connect_established {
            self.connects_succeeded.fetch_add(1, Ordering::Relaxed);
        }
        if outcome.is_complete() {
            self.scripts_completed.fetch_add(1, Ordering::Relaxed);
        }
        if let Some(kind) = outcome.error_kind() {
            *self.errors_by_kind.entry(kind).or_insert(0) += 1;
        }

        self.calls_sent
            .fetch_add(outcome.calls.len() as u64, Ordering::Relaxed);
        for call in &outcome.calls {
            if let Some(mut n) = self.calls_by_action.get_mut(call.action.as_str()) {
                *n += 1;
            } else {
                *self.calls_by_action.entry(call.action.clone()).or_insert(0) += 1;
            }
        }
        self.messages_received
            .fetch_add(outcome.messages_received, Ordering::Relaxed);

        if let Some(latency) = outcome.connect_latency {
            self.connect_latency_us
                .lock()
                .saturating_record(latency.as_micros().min(u64::MAX as u128) as u64);
        }
        self.session_duration_ms
            .lock()
            .saturating_record(outcome.duration.as_millis().min(u64::MAX as u128) as u64);

        if self.retain_outcomes {
            self.outcomes.lock().push(outcome);
        }
        true
    }

    pub fn live_sessions(&self) -> u64 {
        self.live.load(Ordering::Relaxed)
    }

    pub fn sessions_started(&self) -> u64 {
        self.sessions_started.load(Ordering::Relaxed)
    }

    pub fn outcomes_recorded(&self) -> u64 {
        self.outcomes_recorded.load(Ordering::Relaxed)
    }

    /// Recorded outcomes ordered by client index. Empty for `summary_only` collectors.
    pub fn outcomes(&self) -> Vec<SessionOutcome> {
        let mut out = self.outcomes.lock().clone();
        out.sort_by_key(|o| o.client_index);
        out
    }

    pub fn summary(&self) -> RunSummary {
        let connect_latency = summarize(&self.connect_latency_us.lock(), 1000.0);
        let session_duration = summarize(&self.session_duration_ms.lock(), 1.0);

        let run_duration = (*self.run_duration.lock())
            .or_else(|| self.run_started.get().map(Instant::elapsed));

        RunSummary {
            sessions_started: self.sessions_started.load(Ordering::Relaxed),
            outcomes_recorded: self.outcomes_recorded.load(Ordering::Relaxed),
            connects_succeeded: self.connects_succeeded.load(Ordering::Relaxed),
            scripts_completed: self.scripts_completed.load(Ordering::Relaxed),
            errors_by_kind: self
                .errors_by_kind
                .iter()
                .map(|e| (*e.key(), *e.value()))
                .collect(),
            calls_sent: self.calls_sent.load(Ordering::Relaxed),
            calls_by_action: self
                .calls_by_action
                .iter()
                .map(|e| (e.key().clone(), *e.value()))
                .collect(),
            messages_received: self.messages_received.load(Ordering::Relaxed),
            connect_latency,
            session_duration,
            live_sessions: self.live.load(Ordering::Relaxed),
            peak_live_sessions: self.peak_live.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            run_duration,
        }
    }
}

/// Client indices already recorded. Indices are handed out from 1 upwards, so
/// everything up to `contiguous` collapses into one counter and only outcomes
/// that arrive ahead of an older, still-running session are kept in `ahead`.
#[derive(Debug, Default)]
struct SeenIndices {
    contiguous: u64,
    ahead: BTreeSet<u64>,
}

impl SeenIndices {
    fn insert(&mut self, index: u64) -> bool {
        if index <= self.contiguous || !self.ahead.insert(index) {
            return false;
        }
        while self.ahead.remove(&(self.contiguous + 1)) {
            self.contiguous += 1;
        }
        true
    }
}

pub struct ActiveSessionGuard {
    collector: Arc<OutcomeCollector>,
}

impl Drop for ActiveSessionGuard {
    fn drop(&mut self) {
        self.collector.live.fetch_sub(1, Ordering::Relaxed);
    }
}

fn new_histogram(high: u64) -> Histogram<u64> {
    Histogram::<u64>::new_with_bounds(1, high, 3)
        .unwrap_or_else(|err| panic!("failed to init histogram: {err}"))
}

fn summarize(h: &Histogram<u64>, per_ms: f64) -> Option<DurationSummary> {
    if h.len() == 0 {
        return None;
    }

    let ms = |v: u64| v as f64 / per_ms;
    Some(DurationSummary {
        count: h.len(),
        min_ms: ms(h.min()),
        max_ms: ms(h.max()),
        mean_ms: h.mean() / per_ms,
        p50_ms: ms(h.value_at_quantile(0.50)),
        p90_ms: ms(h.value_at_quantile(0.90)),
        p95_ms: ms(h.value_at_quantile(0.95)),
        p99_ms: ms(h.value_at_quantile(0.99)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{CallRecord, SessionError};
    use std::time::SystemTime;

    fn outcome(client_index: u64, error: Option<ErrorKind>) -> SessionOutcome {
        let connected = error != Some(ErrorKind::ConnectFailure);
        let now = SystemTime::now();
        SessionOutcome {
            client_index,
            charge_point_id: format!("cs{client_index:03}"),
            connect_established: connected,
            steps_completed: if error.is_none() { 2 } else { 0 },
            total_steps: 2,
            error: error.map(|k| SessionError::new(k, "test")),
            started_at: now,
            ended_at: now,
            duration: Duration::from_millis(20),
            connect_latency: connected.then(|| Duration::from_millis(4)),
            calls: if error.is_none() {
                vec![CallRecord {
                    call_id: "1".to_string(),
                    action: "Heartbeat".to_string(),
                    sent_at: Duration::ZERO,
                }]
            } else {
                Vec::new()
            },
            messages_received: 1,
        }
    }

    #[test]
    fn duplicate_client_index_is_rejected() {
        let c = OutcomeCollector::new();
        assert!(c.record(outcome(1, None)));
        assert!(!c.record(outcome(1, None)));

        let s = c.summary();
        assert_eq!(s.outcomes_recorded, 1);
        assert_eq!(s.duplicates_rejected, 1);
        assert_eq!(c.outcomes().len(), 1);
    }

    #[test]
    fn out_of_order_outcomes_are_compacted() {
        let c = OutcomeCollector::summary_only();
        for idx in [3, 1, 5, 2, 4] {
            assert!(c.record(outcome(idx, None)), "index {idx}");
        }
        assert!(!c.record(outcome(3, None)));
        assert!(!c.record(outcome(5, None)));
        assert!(c.record(outcome(7, None)));
        assert!(!c.record(outcome(7, None)));

        {
            let seen = c.seen.lock();
            assert_eq!(seen.contiguous, 5);
            assert_eq!(seen.ahead.iter().copied().collect::<Vec<_>>(), vec![7]);
        }

        let s = c.summary();
        assert_eq!(s.outcomes_recorded, 6);
        assert_eq!(s.duplicates_rejected, 3);
    }

    #[test]
    fn summary_breaks_down_errors_and_rates() {
        let c = OutcomeCollector::new();
        c.record(outcome(1, None));
        c.record(outcome(2, None));
        c.record(outcome(3, Some(ErrorKind::ConnectFailure)));
        c.record(outcome(4, Some(ErrorKind::Cancelled)));

        let s = c.summary();
        assert_eq!(s.outcomes_recorded, 4);
        assert_eq!(s.connects_succeeded, 3);
        assert_eq!(s.scripts_completed, 2);
        assert_eq!(s.errors_of(ErrorKind::ConnectFailure), 1);
        assert_eq!(s.errors_of(ErrorKind::Cancelled), 1);
        assert_eq!(s.failed_sessions(), 1);
        assert_eq!(s.calls_sent, 2);
        assert_eq!(s.calls_by_action.get("Heartbeat"), Some(&2));
        assert_eq!(s.messages_received, 4);
        assert!((s.connect_success_rate() - 0.75).abs() < 1e-9);
        assert!((s.script_completion_rate() - 0.5).abs() < 1e-9);

        let latency = s.connect_latency.unwrap_or_else(|| panic!("no latency"));
        assert_eq!(latency.count, 3);
        assert!((latency.p50_ms - 4.0).abs() < 0.01, "{latency:?}");
    }

    #[test]
    fn live_gauge_tracks_peak() {
        let c = Arc::new(OutcomeCollector::summary_only());
        let a = c.enter_session();
        let b = c.enter_session();
        assert_eq!(c.live_sessions(), 2);
        drop(a);
        drop(b);
        let _c = c.enter_session();

        let s = c.summary();
        assert_eq!(s.sessions_started, 3);
        assert_eq!(s.live_sessions, 1);
        assert_eq!(s.peak_live_sessions, 2);
    }

    #[test]
    fn summary_only_does_not_keep_outcomes() {
        let c = OutcomeCollector::summary_only();
        c.record(outcome(1, None));
        assert!(c.outcomes().is_empty());
        assert_eq!(c.summary().outcomes_recorded, 1);
    }

    #[test]
    fn empty_summary_has_zero_rates() {
        let s = OutcomeCollector::new().summary();
        assert_eq!(s.connect_success_rate(), 0.0);
        assert!(s.connect_latency.is_none());
        assert!(s.run_duration.is_none());
    }
}
