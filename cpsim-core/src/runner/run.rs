use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::collector::{OutcomeCollector, RunSummary};
use crate::config::{LoadProfile, RampDown, RunOptions};
use crate::error::Result;
use crate::session::SessionOutcome;

use super::factory::SessionFactory;
use super::progress::{LiveCounters, ProgressFn, ProgressUpdate, StageProgress};
use super::schedule::RampingSchedule;

struct TaskMeta {
    client_index: u64,
    charge_point_id: String,
    total_steps: usize,
}

/// Scheduler-side bookkeeping. Only the run loop touches it.
struct Sessions<F> {
    factory: F,
    collector: Arc<OutcomeCollector>,
    run_token: CancellationToken,
    tasks: JoinSet<SessionOutcome>,
    /// Sessions counted against the target, keyed by client index.
    live: BTreeMap<u64, CancellationToken>,
    meta: HashMap<tokio::task::Id, TaskMeta>,
    next_index: u64,
    max_sessions: Option<u64>,
}

impl<F: SessionFactory> Sessions<F> {
    fn budget_left(&self) -> u64 {
        match self.max_sessions {
            Some(max) => max.saturating_sub(self.next_index - 1),
            None => u64::MAX,
        }
    }

    fn start_one(&mut self) {
        let client_index = self.next_index;
        self.next_index = self.next_index.saturating_add(1);

        let session = self.factory.create(client_index);
        let token = self.run_token.child_token();
        let meta = TaskMeta {
            client_index,
            charge_point_id: session.identity().charge_point_id.clone(),
            total_steps: session.total_steps(),
        };

        let guard = self.collector.enter_session();
        let child = token.clone();
        let handle = self.tasks.spawn(async move {
            let _guard = guard;
            session.execute(child).await
        });

        self.meta.insert(handle.id(), meta);
        self.live.insert(client_index, token);
    }

    fn rebalance(&mut self, target: u64, ramp_down: RampDown) {
        let live = self.live.len() as u64;
        if live < target {
            let starts = (target - live).min(self.budget_left());
            for _ in 0..starts {
                self.start_one();
            }
            return;
        }

        if live > target && ramp_down == RampDown::Immediate {
            let excess = (live - target) as usize;
            let newest: Vec<u64> = self.live.keys().rev().take(excess).copied().collect();
            for idx in newest {
                if let Some(token) = self.live.remove(&idx) {
                    debug!(client = idx, target, "cancelling excess session");
                    token.cancel();
                }
            }
        }
    }

    fn cancel_all(&mut self) {
        for (_, token) in std::mem::take(&mut self.live) {
            token.cancel();
        }
    }

    fn finish(&mut self, joined: std::result::Result<(tokio::task::Id, SessionOutcome), JoinError>) {
        let outcome = match joined {
            Ok((id, outcome)) => {
                self.meta.remove(&id);
                outcome
            }
            Err(err) => {
                let Some(meta) = self.meta.remove(&err.id()) else {
                    warn!(error = %err, "untracked session task failed");
                    return;
                };
                warn!(client = meta.client_index, error = %err, "session task aborted");
                SessionOutcome::aborted(
                    meta.client_index,
                    meta.charge_point_id,
                    meta.total_steps,
                    err.to_string(),
                )
            }
        };

        self.live.remove(&outcome.client_index);
        self.collector.record(outcome);
    }
}

/// Drives a population of virtual clients through `profile` and returns the
/// aggregated outcome once every started session has reported.
pub async fn run_load<F: SessionFactory>(
    profile: Arc<LoadProfile>,
    factory: F,
    collector: Arc<OutcomeCollector>,
    opts: RunOptions,
    progress: Option<ProgressFn>,
) -> Result<RunSummary> {
    profile.validate()?;
    opts.validate()?;

    let schedule = Arc::new(RampingSchedule::new(
        profile.start_clients,
        profile.stages.clone(),
    ));

    let mut sessions = Sessions {
        factory,
        collector: collector.clone(),
        run_token: CancellationToken::new(),
        tasks: JoinSet::new(),
        live: BTreeMap::new(),
        meta: HashMap::new(),
        next_index: 1,
        max_sessions: opts.max_sessions,
    };

    info!(
        stages = profile.stages.len(),
        peak = profile.peak_target(),
        duration = ?schedule.total_duration(),
        ramp_down = %profile.ramp_down,
        "load run started"
    );

    let started = Instant::now();
    collector.mark_run_started();

    let progress_handle = progress.map(|progress| {
        tokio::spawn(emit_progress(
            progress,
            schedule.clone(),
            profile.ramp_down,
            collector.clone(),
            started,
        ))
    });

    let deadline = opts.hard_deadline.map(|d| started + d);
    let deadline_sleep = async move {
        match deadline {
            Some(at) => tokio::time::sleep_until(at).await,
            None => std::future::pending::<()>().await,
        }
    };
    tokio::pin!(deadline_sleep);
    let mut deadline_hit = false;

    let mut interval = tokio::time::interval(opts.tick);
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        let elapsed = started.elapsed();
        if schedule.is_done(elapsed) {
            break;
        }
        let target = schedule.effective_target_at(elapsed, profile.ramp_down);
        sessions.rebalance(target, profile.ramp_down);

        tokio::select! {
            _ = interval.tick() => {}
            Some(joined) = sessions.tasks.join_next_with_id() => sessions.finish(joined),
            _ = &mut deadline_sleep, if !deadline_hit => {
                deadline_hit = true;
                break;
            }
        }
    }

    if deadline_hit {
        warn!(elapsed = ?started.elapsed(), "hard deadline reached; cancelling live sessions");
        sessions.run_token.cancel();
        sessions.cancel_all();
    } else if profile.ramp_down == RampDown::Immediate {
        info!(live = sessions.live.len(), "ramp finished; cancelling live sessions");
        sessions.cancel_all();
    } else {
        info!(live = sessions.live.len(), "ramp finished; draining live sessions");
    }

    while !sessions.tasks.is_empty() {
        tokio::select! {
            joined = sessions.tasks.join_next_with_id() => {
                if let Some(joined) = joined {
                    sessions.finish(joined);
                }
            }
            _ = &mut deadline_sleep, if !deadline_hit => {
                deadline_hit = true;
                warn!(live = sessions.live.len(), "hard deadline reached while draining; cancelling");
                sessions.run_token.cancel();
                sessions.cancel_all();
            }
        }
    }

    if let Some(h) = progress_handle {
        h.abort();
    }

    collector.mark_run_finished();
    let summary = collector.summary();
    info!(
        started = summary.sessions_started,
        recorded = summary.outcomes_recorded,
        completed = summary.scripts_completed,
        failed = summary.failed_sessions(),
        "load run finished"
    );

    Ok(summary)
}

async fn emit_progress(
    progress: ProgressFn,
    schedule: Arc<RampingSchedule>,
    ramp_down: RampDown,
    collector: Arc<OutcomeCollector>,
    started: Instant,
) {
    let mut interval = tokio::time::interval(Duration::from_secs(1));
    interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick completes immediately; skip it so updates start after one second.
    interval.tick().await;

    let mut tick: u64 = 0;
    loop {
        interval.tick().await;
        tick = tick.saturating_add(1);

        let elapsed = started.elapsed();
        let summary = collector.summary();

        progress(ProgressUpdate {
            tick,
            elapsed,
            total_duration: schedule.total_duration(),
            target: schedule.effective_target_at(elapsed, ramp_down),
            stage: schedule.stage_snapshot_at(elapsed).map(StageProgress::from),
            counters: LiveCounters {
                live_sessions: summary.live_sessions,
                sessions_started: summary.sessions_started,
                outcomes_recorded: summary.outcomes_recorded,
                scripts_completed: summary.scripts_completed,
                failed_sessions: summary.failed_sessions(),
                calls_sent: summary.calls_sent,
                messages_received: summary.messages_received,
            },
        });
    }
}
