use std::time::Duration;

use crate::config::{RampDown, Stage};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageSnapshot {
    pub index: usize,
    pub count: usize,
    pub stage_elapsed: Duration,
    pub stage_remaining: Duration,
    pub start_target: u64,
    pub end_target: u64,
    pub current_target: u64,
}

/// Piecewise-linear concurrency target over a list of stages.
#[derive(Debug, Clone)]
pub struct RampingSchedule {
    start: u64,
    stages: Vec<Stage>,
    cumulative_ends: Vec<Duration>,
}

struct Position {
    idx: usize,
    stage_start: Duration,
    stage_end: Duration,
}

impl RampingSchedule {
    pub fn new(start: u64, stages: Vec<Stage>) -> Self {
        let mut cumulative_ends = Vec::with_capacity(stages.len());
        let mut acc = Duration::ZERO;
        for s in &stages {
            acc = acc.saturating_add(s.duration);
            cumulative_ends.push(acc);
        }

        Self {
            start,
            stages,
            cumulative_ends,
        }
    }

    pub fn total_duration(&self) -> Duration {
        self.cumulative_ends
            .last()
            .copied()
            .unwrap_or(Duration::ZERO)
    }

    pub fn is_done(&self, elapsed: Duration) -> bool {
        elapsed >= self.total_duration()
    }

    /// Target concurrency at `elapsed` since the run started.
    pub fn target_at(&self, elapsed: Duration) -> u64 {
        if self.stages.is_empty() || elapsed.is_zero() {
            return self.start;
        }
        if elapsed >= self.total_duration() {
            return self.stages.last().map_or(self.start, |s| s.target);
        }

        let pos = self.locate(elapsed);
        let start_target = self.start_target_of(pos.idx);
        let end_target = self.stages[pos.idx].target;
        let stage_duration = pos.stage_end.saturating_sub(pos.stage_start);
        if stage_duration.is_zero() {
            return end_target;
        }

        // Linear interpolation across the stage.
        let start_i = start_target as i128;
        let delta = end_target as i128 - start_i;
        let num = elapsed.saturating_sub(pos.stage_start).as_nanos() as i128;
        let den = (stage_duration.as_nanos() as i128).max(1);

        let cur = start_i + delta.saturating_mul(num) / den;
        cur.clamp(0, u64::MAX as i128) as u64
    }

    /// Target as seen by the scheduler. Under immediate ramp-down a decreasing
    /// stage drops straight to its end target instead of interpolating.
    pub fn effective_target_at(&self, elapsed: Duration, ramp_down: RampDown) -> u64 {
        let linear = self.target_at(elapsed);
        if ramp_down == RampDown::Graceful
            || self.stages.is_empty()
            || elapsed.is_zero()
            || self.is_done(elapsed)
        {
            return linear;
        }

        let pos = self.locate(elapsed);
        let end_target = self.stages[pos.idx].target;
        if end_target < self.start_target_of(pos.idx) {
            end_target
        } else {
            linear
        }
    }

    pub fn stage_snapshot_at(&self, elapsed: Duration) -> Option<StageSnapshot> {
        if self.stages.is_empty() {
            return None;
        }

        let clamped = elapsed.min(self.total_duration());
        let pos = self.locate(clamped);

        let stage_duration = pos.stage_end.saturating_sub(pos.stage_start);
        let stage_elapsed = clamped.saturating_sub(pos.stage_start);

        Some(StageSnapshot {
            index: pos.idx,
            count: self.stages.len(),
            stage_elapsed,
            stage_remaining: stage_duration.saturating_sub(stage_elapsed),
            start_target: self.start_target_of(pos.idx),
            end_target: self.stages[pos.idx].target,
            current_target: self.target_at(clamped),
        })
    }

    /// Stage containing `elapsed`; the last stage once the ramp is over.
    fn locate(&self, elapsed: Duration) -> Position {
        let idx = if elapsed >= self.total_duration() {
            self.stages.len().saturating_sub(1)
        } else {
            match self
                .cumulative_ends
                .binary_search_by(|end| end.cmp(&elapsed))
            {
                Ok(i) | Err(i) => i,
            }
        };

        Position {
            idx,
            stage_start: if idx == 0 {
                Duration::ZERO
            } else {
                self.cumulative_ends[idx - 1]
            },
            stage_end: self.cumulative_ends[idx],
        }
    }

    fn start_target_of(&self, idx: usize) -> u64 {
        if idx == 0 {
            self.start
        } else {
            self.stages[idx - 1].target
        }
    }
}
