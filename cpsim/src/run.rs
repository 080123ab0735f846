use std::sync::Arc;

use cpsim_core::runner::{ScriptedSessionFactory, run_load};
use cpsim_core::{OutcomeCollector, Step};
use cpsim_ws::WsConnector;
use tracing::info;

use crate::cli::{RunArgs, ValidateArgs};
use crate::exit_codes::ExitCode;
use crate::output;
use crate::profile_yaml::{self, ResolvedProfile};
use crate::run_error::RunError;

pub async fn run(args: RunArgs) -> Result<ExitCode, RunError> {
    let out = output::formatter(args.output);

    let doc = profile_yaml::load_profile(&args.profile).await?;
    let profile = profile_yaml::resolve(doc, &args.overrides)?;
    out.print_header(&args.profile, &profile);

    let ResolvedProfile {
        load,
        options,
        settings,
        identities,
        script,
        connect_timeout,
    } = profile;

    let connector = connect_timeout.map(WsConnector::new).unwrap_or_default();
    info!(
        url = %settings.base_url,
        protocol = %settings.subprotocol,
        connect_timeout = ?connector.connect_timeout(),
        "starting load run"
    );

    let factory = ScriptedSessionFactory::new(
        identities,
        Arc::new(script),
        Arc::new(connector),
        Arc::new(settings),
    );
    let collector = Arc::new(OutcomeCollector::summary_only());

    let summary = run_load(Arc::new(load), factory, collector, options, out.progress()).await?;

    out.print_summary(&summary)
        .map_err(RunError::RuntimeError)?;

    Ok(ExitCode::from_failed_sessions(summary.failed_sessions()))
}

/// Resolves the profile and prints what a run would do, without opening any connection.
pub async fn validate(args: ValidateArgs) -> Result<(), RunError> {
    let doc = profile_yaml::load_profile(&args.profile).await?;
    let profile = profile_yaml::resolve(doc, &args.overrides)?;
    print!("{}", render_plan(&profile));
    Ok(())
}

fn render_plan(profile: &ResolvedProfile) -> String {
    use std::fmt::Write as _;

    let mut out = String::new();
    let load = &profile.load;

    writeln!(
        &mut out,
        "target: {} protocol={}",
        profile.settings.base_url, profile.settings.subprotocol
    )
    .ok();
    writeln!(
        &mut out,
        "load: start={} peak={} duration={:?} ramp_down={}",
        load.start_clients,
        load.peak_target(),
        load.total_duration(),
        load.ramp_down
    )
    .ok();
    for (idx, stage) in load.stages.iter().enumerate() {
        writeln!(
            &mut out,
            "  stage {}: {:?} -> {}",
            idx + 1,
            stage.duration,
            stage.target
        )
        .ok();
    }
    if let Some(d) = profile.options.hard_deadline {
        writeln!(&mut out, "max duration: {d:?}").ok();
    }
    if let Some(n) = profile.options.max_sessions {
        writeln!(&mut out, "max sessions: {n}").ok();
    }
    if let Some(d) = profile.settings.session_timeout {
        writeln!(&mut out, "session timeout: {d:?}").ok();
    }

    let first = profile.identities.identity_for(1);
    writeln!(
        &mut out,
        "first client: {} authorization={}",
        profile.settings.url_for(&first.charge_point_id),
        first.authorization_header()
    )
    .ok();
    if !profile.identities.is_deterministic() {
        out.push_str("  (identities are sampled at random from the pool)\n");
    }

    writeln!(&mut out, "script: {} steps", profile.script.len()).ok();
    for step in profile.script.steps() {
        match step {
            Step::Send(call) => {
                writeln!(&mut out, "  +{:?} {}", call.delay_before, call.encode()).ok();
            }
            Step::Close { delay_before } => {
                writeln!(&mut out, "  +{delay_before:?} close").ok();
            }
        }
    }

    out
}
