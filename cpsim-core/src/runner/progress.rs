use std::time::Duration;

use super::schedule::StageSnapshot;

#[derive(Debug, Clone)]
pub struct StageProgress {
    /// 1-based stage index.
    pub stage: usize,
    pub stages: usize,
    pub stage_elapsed: Duration,
    pub stage_remaining: Duration,
    pub start_target: u64,
    pub end_target: u64,
    pub current_target: u64,
}

impl From<StageSnapshot> for StageProgress {
    fn from(s: StageSnapshot) -> Self {
        Self {
            stage: s.index + 1,
            stages: s.count,
            stage_elapsed: s.stage_elapsed,
            stage_remaining: s.stage_remaining,
            start_target: s.start_target,
            end_target: s.end_target,
            current_target: s.current_target,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct LiveCounters {
    pub live_sessions: u64,
    pub sessions_started: u64,
    pub outcomes_recorded: u64,
    pub scripts_completed: u64,
    /// Errors other than scheduler-initiated cancels.
    pub failed_sessions: u64,
    pub calls_sent: u64,
    pub messages_received: u64,
}

#[derive(Debug, Clone)]
pub struct ProgressUpdate {
    /// Monotonic tick counter (1-based) for progress emissions.
    pub tick: u64,
    pub elapsed: Duration,
    pub total_duration: Duration,
    pub target: u64,
    pub stage: Option<StageProgress>,
    pub counters: LiveCounters,
}

pub type ProgressFn = std::sync::Arc<dyn Fn(ProgressUpdate) + Send + Sync + 'static>;
