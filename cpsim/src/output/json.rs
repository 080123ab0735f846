use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::Path;
use std::sync::Arc;

use cpsim_core::runner::{ProgressFn, ProgressUpdate};
use cpsim_core::{DurationSummary, RunSummary};

use super::OutputFormatter;
use crate::profile_yaml::ResolvedProfile;

pub(crate) struct JsonOutput;

impl OutputFormatter for JsonOutput {
    fn print_header(&self, _profile_path: &Path, _profile: &ResolvedProfile) {}

    fn progress(&self) -> Option<ProgressFn> {
        Some(Arc::new(move |u| {
            let line = build_progress_line(&u);
            emit_json_line(&line);
        }))
    }

    fn print_summary(&self, summary: &RunSummary) -> anyhow::Result<()> {
        let line = build_summary_line(summary);
        emit_json_line(&line);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonProgressLine {
    pub kind: &'static str,
    pub tick: u64,
    pub elapsed_secs: f64,
    pub total_secs: f64,
    pub target: u64,

    pub stage: Option<usize>,
    pub stages: Option<usize>,
    pub stage_remaining_secs: Option<f64>,

    pub live_sessions: u64,
    pub sessions_started: u64,
    pub sessions_finished: u64,
    pub scripts_completed: u64,
    pub sessions_failed: u64,
    pub calls_sent: u64,
    pub messages_received: u64,
}

fn build_progress_line(u: &ProgressUpdate) -> JsonProgressLine {
    let c = &u.counters;
    JsonProgressLine {
        kind: "progress",
        tick: u.tick,
        elapsed_secs: u.elapsed.as_secs_f64(),
        total_secs: u.total_duration.as_secs_f64(),
        target: u.target,

        stage: u.stage.as_ref().map(|s| s.stage),
        stages: u.stage.as_ref().map(|s| s.stages),
        stage_remaining_secs: u.stage.as_ref().map(|s| s.stage_remaining.as_secs_f64()),

        live_sessions: c.live_sessions,
        sessions_started: c.sessions_started,
        sessions_finished: c.outcomes_recorded,
        scripts_completed: c.scripts_completed,
        sessions_failed: c.failed_sessions,
        calls_sent: c.calls_sent,
        messages_received: c.messages_received,
    }
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonSummaryLine {
    pub kind: &'static str,
    pub run_duration_secs: Option<f64>,

    pub sessions_started: u64,
    pub sessions_finished: u64,
    pub sessions_failed: u64,
    pub connects_succeeded: u64,
    pub scripts_completed: u64,
    pub connect_success_rate: f64,
    pub script_completion_rate: f64,
    pub errors: BTreeMap<String, u64>,

    pub calls_sent: u64,
    pub calls_by_action: BTreeMap<String, u64>,
    pub messages_received: u64,

    pub peak_live_sessions: u64,
    pub duplicates_rejected: u64,

    pub connect_latency: Option<JsonDurationSummary>,
    pub session_duration: Option<JsonDurationSummary>,
}

#[derive(Debug, Serialize)]
pub(crate) struct JsonDurationSummary {
    pub count: u64,
    pub min_ms: f64,
    pub mean_ms: f64,
    pub p50_ms: f64,
    pub p90_ms: f64,
    pub p95_ms: f64,
    pub p99_ms: f64,
    pub max_ms: f64,
}

impl From<&DurationSummary> for JsonDurationSummary {
    fn from(d: &DurationSummary) -> Self {
        Self {
            count: d.count,
            min_ms: d.min_ms,
            mean_ms: d.mean_ms,
            p50_ms: d.p50_ms,
            p90_ms: d.p90_ms,
            p95_ms: d.p95_ms,
            p99_ms: d.p99_ms,
            max_ms: d.max_ms,
        }
    }
}

fn build_summary_line(summary: &RunSummary) -> JsonSummaryLine {
    let errors = summary
        .errors_by_kind
        .iter()
        .map(|(kind, n)| (kind.to_string(), *n))
        .collect::<BTreeMap<_, _>>();

    JsonSummaryLine {
        kind: "summary",
        run_duration_secs: summary.run_duration.map(|d| d.as_secs_f64()),

        sessions_started: summary.sessions_started,
        sessions_finished: summary.outcomes_recorded,
        sessions_failed: summary.failed_sessions(),
        connects_succeeded: summary.connects_succeeded,
        scripts_completed: summary.scripts_completed,
        connect_success_rate: summary.connect_success_rate(),
        script_completion_rate: summary.script_completion_rate(),
        errors,

        calls_sent: summary.calls_sent,
        calls_by_action: summary.calls_by_action.clone(),
        messages_received: summary.messages_received,

        peak_live_sessions: summary.peak_live_sessions,
        duplicates_rejected: summary.duplicates_rejected,

        connect_latency: summary.connect_latency.as_ref().map(Into::into),
        session_duration: summary.session_duration.as_ref().map(Into::into),
    }
}

fn emit_json_line<T: Serialize>(line: &T) {
    let mut out = std::io::stdout().lock();
    if serde_json::to_writer(&mut out, line).is_ok() {
        let _ = writeln!(out);
    }
}
