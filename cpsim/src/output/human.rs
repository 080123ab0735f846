use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use cpsim_core::RunSummary;
use cpsim_core::runner::ProgressFn;

mod duration;
mod format;
mod progress;
mod summary;

use duration::format_duration_single;
use format::format_rate;
use progress::HumanProgress;
use summary::render;

use super::OutputFormatter;
use crate::profile_yaml::ResolvedProfile;

pub(crate) struct HumanReadableOutput {
    progress: Arc<HumanProgress>,
}

impl HumanReadableOutput {
    pub(crate) fn new() -> Self {
        Self {
            progress: Arc::new(HumanProgress::new()),
        }
    }
}

impl OutputFormatter for HumanReadableOutput {
    fn print_header(&self, profile_path: &Path, profile: &ResolvedProfile) {
        let load = &profile.load;
        println!("profile: {}", profile_path.display());
        println!(
            "target: {} protocol={}",
            profile.settings.base_url, profile.settings.subprotocol
        );
        println!(
            "load: start={} peak={} stages={} duration={} ramp_down={}",
            load.start_clients,
            load.peak_target(),
            load.stages.len(),
            format_duration_single(load.total_duration()),
            load.ramp_down
        );
        println!("script: {} steps", profile.script.len());
        println!();
    }

    fn progress(&self) -> Option<ProgressFn> {
        let progress = self.progress.clone();
        let prev: Arc<Mutex<(u64, Duration)>> = Arc::new(Mutex::new((0, Duration::ZERO)));

        Some(Arc::new(move |u| {
            let c = &u.counters;
            let calls_per_sec = {
                let mut inner = prev.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
                let (prev_calls, prev_elapsed) = *inner;
                *inner = (c.calls_sent, u.elapsed);

                let dt = u.elapsed.saturating_sub(prev_elapsed).as_secs_f64().max(1e-9);
                (c.calls_sent.saturating_sub(prev_calls) as f64) / dt
            };

            let mut message = format!(
                "live={}/{} started={} done={} failed={} calls/s={}",
                c.live_sessions,
                u.target,
                c.sessions_started,
                c.scripts_completed,
                c.failed_sessions,
                format_rate(calls_per_sec),
            );
            if let Some(stage) = &u.stage {
                message.push_str(&format!(
                    " stage={}/{} stage_remaining={}",
                    stage.stage,
                    stage.stages,
                    format_duration_single(stage.stage_remaining)
                ));
            }

            progress.update(u.total_duration, u.elapsed, message);
        }))
    }

    fn print_summary(&self, summary: &RunSummary) -> anyhow::Result<()> {
        self.progress.finish();
        print!("{}", render(summary));
        Ok(())
    }
}
