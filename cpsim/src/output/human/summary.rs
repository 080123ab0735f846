use std::fmt::Write as _;

use cpsim_core::{DurationSummary, RunSummary};

use super::duration::format_duration_single;
use super::format::{format_millis, format_percent, format_rate};

pub(crate) fn render(summary: &RunSummary) -> String {
    let mut out = String::new();

    if summary.sessions_started == 0 {
        out.push_str("summary: no sessions started\n");
        return out;
    }

    out.push_str("summary\n");

    if let Some(d) = summary.run_duration {
        writeln!(&mut out, "  duration: {}", format_duration_single(d)).ok();
    }
    writeln!(
        &mut out,
        "  sessions: started {} finished {} (peak live {})",
        summary.sessions_started, summary.outcomes_recorded, summary.peak_live_sessions
    )
    .ok();
    writeln!(
        &mut out,
        "  connects: {} ok ({})",
        summary.connects_succeeded,
        format_percent(summary.connect_success_rate())
    )
    .ok();
    writeln!(
        &mut out,
        "  scripts completed: {} ({})",
        summary.scripts_completed,
        format_percent(summary.script_completion_rate())
    )
    .ok();

    if summary.errors_by_kind.is_empty() {
        out.push_str("  errors: none\n");
    } else {
        writeln!(
            &mut out,
            "  errors: {} failed (cancels excluded)",
            summary.failed_sessions()
        )
        .ok();
        for (kind, n) in &summary.errors_by_kind {
            writeln!(&mut out, "    {kind}: {n}").ok();
        }
    }

    if summary.duplicates_rejected > 0 {
        writeln!(
            &mut out,
            "  duplicate outcomes rejected: {}",
            summary.duplicates_rejected
        )
        .ok();
    }

    out.push('\n');
    out.push_str("calls\n");
    write!(&mut out, "  sent: {}", summary.calls_sent).ok();
    if let Some(d) = summary.run_duration {
        let secs = d.as_secs_f64().max(1e-9);
        write!(
            &mut out,
            " ({}/s)",
            format_rate(summary.calls_sent as f64 / secs)
        )
        .ok();
    }
    out.push('\n');
    writeln!(&mut out, "  received frames: {}", summary.messages_received).ok();

    let mut actions: Vec<_> = summary.calls_by_action.iter().collect();
    actions.sort_by(|(a_name, a_count), (b_name, b_count)| {
        b_count.cmp(a_count).then_with(|| a_name.cmp(b_name))
    });
    for (action, n) in actions {
        writeln!(&mut out, "    {action}: {n}").ok();
    }

    out.push('\n');
    render_latency("connect latency", summary.connect_latency.as_ref(), &mut out);
    render_latency("session duration", summary.session_duration.as_ref(), &mut out);

    out
}

fn render_latency(label: &str, d: Option<&DurationSummary>, out: &mut String) {
    match d {
        Some(h) => {
            writeln!(
                out,
                "{label} = p50={} p90={} p99={} mean={} max={} (n={})",
                format_millis(h.p50_ms),
                format_millis(h.p90_ms),
                format_millis(h.p99_ms),
                format_millis(h.mean_ms),
                format_millis(h.max_ms),
                h.count
            )
            .ok();
        }
        None => {
            writeln!(out, "{label}: n/a").ok();
        }
    }
}
