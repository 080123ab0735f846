use std::path::Path;
use std::str::FromStr as _;
use std::time::Duration;

use anyhow::Context as _;
use cpsim_core::{
    ChargingSessionTemplate, IdentityProvider, LoadProfile, Payload, PoolSampling, RampDown,
    RunOptions, ScriptBuilder, SessionScript, SessionSettings, SessionTimings, Stage,
};
use serde::Deserialize;

use crate::cli::ProfileOverrides;
use crate::run_error::RunError;

pub(crate) const CHARGING_SESSION_TEMPLATE: &str = "charging-session";

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ProfileYaml {
    #[serde(default)]
    pub target: TargetYaml,

    #[serde(default)]
    pub identity: IdentityYaml,

    pub load: LoadYaml,

    #[serde(default)]
    pub session: SessionYaml,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct TargetYaml {
    /// Endpoint prefix; the charge point id becomes the last path segment.
    pub url: Option<String>,
    pub protocol: Option<String>,
    pub connect_timeout: Option<YamlDuration>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub(crate) enum IdentityMode {
    #[default]
    Derived,
    Pool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct IdentityYaml {
    #[serde(default)]
    pub mode: IdentityMode,

    // derived
    #[serde(default = "default_prefix")]
    pub prefix: String,
    #[serde(default = "default_width")]
    pub width: usize,

    // pool
    #[serde(default)]
    pub ids: Vec<String>,
    pub sampling: Option<String>,

    pub secret: Option<String>,
}

impl Default for IdentityYaml {
    fn default() -> Self {
        Self {
            mode: IdentityMode::Derived,
            prefix: default_prefix(),
            width: default_width(),
            ids: Vec::new(),
            sampling: None,
            secret: None,
        }
    }
}

fn default_prefix() -> String {
    "cs".to_string()
}

fn default_width() -> usize {
    3
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct LoadYaml {
    #[serde(default)]
    pub start_clients: u64,

    /// graceful | immediate
    pub ramp_down: Option<String>,

    #[serde(default)]
    pub stages: Vec<StageYaml>,

    pub max_duration: Option<YamlDuration>,
    pub max_sessions: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct StageYaml {
    pub target: u64,

    #[serde(default)]
    pub duration: YamlDuration,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct SessionYaml {
    pub timeout: Option<YamlDuration>,

    #[serde(default)]
    pub script: ScriptYaml,
}

/// Either the built-in charging-session template (optionally tuned) or an explicit step list.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct ScriptYaml {
    pub template: Option<String>,

    pub first_call_id: Option<u64>,
    pub id_tag: Option<String>,
    pub connector_id: Option<u32>,
    #[serde(default)]
    pub malformed_authorize: bool,
    #[serde(default)]
    pub timings: TimingsYaml,

    pub steps: Option<Vec<StepYaml>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct TimingsYaml {
    #[serde(default)]
    pub after_boot: YamlDuration,
    #[serde(default)]
    pub heartbeat_interval: YamlDuration,
    #[serde(default)]
    pub before_authorize: YamlDuration,
    #[serde(default)]
    pub before_start: YamlDuration,
    #[serde(default)]
    pub meter_interval: YamlDuration,
    #[serde(default)]
    pub before_stop: YamlDuration,
    #[serde(default)]
    pub before_close: YamlDuration,
}

impl From<TimingsYaml> for SessionTimings {
    fn from(t: TimingsYaml) -> Self {
        Self {
            after_boot: t.after_boot.into_inner(),
            heartbeat_interval: t.heartbeat_interval.into_inner(),
            before_authorize: t.before_authorize.into_inner(),
            before_start: t.before_start.into_inner(),
            meter_interval: t.meter_interval.into_inner(),
            before_stop: t.before_stop.into_inner(),
            before_close: t.before_close.into_inner(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub(crate) struct StepYaml {
    pub action: Option<String>,
    pub payload: Option<serde_json::Value>,

    /// Payload text spliced into the frame verbatim.
    pub raw: Option<String>,

    #[serde(default, deserialize_with = "deserialize_call_id")]
    pub call_id: Option<String>,

    #[serde(default)]
    pub delay: YamlDuration,

    #[serde(default)]
    pub close: bool,
}

#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct YamlDuration(Duration);

impl YamlDuration {
    fn into_inner(self) -> Duration {
        self.0
    }
}

impl<'de> Deserialize<'de> for YamlDuration {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        struct V;

        impl serde::de::Visitor<'_> for V {
            type Value = YamlDuration;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("duration as string (e.g. 10s), integer seconds, or float seconds")
            }

            fn visit_u64<E>(self, v: u64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                Ok(YamlDuration(Duration::from_secs(v)))
            }

            fn visit_i64<E>(self, v: i64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if v < 0 {
                    return Err(E::custom("duration must not be negative"));
                }
                Ok(YamlDuration(Duration::from_secs(v as u64)))
            }

            fn visit_f64<E>(self, v: f64) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                if !v.is_finite() || v < 0.0 {
                    return Err(E::custom("duration must be a non-negative, finite number"));
                }
                Duration::try_from_secs_f64(v)
                    .map(YamlDuration)
                    .map_err(E::custom)
            }

            fn visit_str<E>(self, v: &str) -> Result<Self::Value, E>
            where
                E: serde::de::Error,
            {
                let d = humantime::parse_duration(v).map_err(E::custom)?;
                Ok(YamlDuration(d))
            }
        }

        deserializer.deserialize_any(V)
    }
}

fn deserialize_call_id<'de, D>(deserializer: D) -> Result<Option<String>, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let raw = Option::<serde_yaml::Value>::deserialize(deserializer)?;
    match raw {
        None | Some(serde_yaml::Value::Null) => Ok(None),
        Some(serde_yaml::Value::String(s)) => Ok(Some(s)),
        Some(serde_yaml::Value::Number(n)) => Ok(Some(n.to_string())),
        Some(_) => Err(serde::de::Error::custom(
            "callId must be a string or a number",
        )),
    }
}

pub(crate) async fn load_profile(path: &Path) -> Result<ProfileYaml, RunError> {
    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("failed to read profile: {}", path.display()))
        .map_err(RunError::InvalidInput)?;

    serde_yaml::from_slice(&bytes)
        .with_context(|| format!("failed to parse profile YAML: {}", path.display()))
        .map_err(RunError::InvalidInput)
}

/// A profile with CLI overrides applied and every part validated.
#[derive(Debug)]
pub(crate) struct ResolvedProfile {
    pub load: LoadProfile,
    pub options: RunOptions,
    pub settings: SessionSettings,
    pub identities: IdentityProvider,
    pub script: SessionScript,
    pub connect_timeout: Option<Duration>,
}

pub(crate) fn resolve(
    doc: ProfileYaml,
    overrides: &ProfileOverrides,
) -> Result<ResolvedProfile, RunError> {
    let ProfileYaml {
        target,
        identity,
        load,
        session,
    } = doc;

    let url = overrides.url.clone().or(target.url).ok_or_else(|| {
        RunError::invalid_input("target url is required (profile `target.url` or --url)")
    })?;
    let protocol = overrides.protocol.clone().or(target.protocol);
    let session_timeout = overrides
        .session_timeout
        .or(session.timeout.map(YamlDuration::into_inner));

    let mut settings = SessionSettings::new(url)?.with_session_timeout(session_timeout);
    if let Some(protocol) = protocol {
        settings = settings.with_subprotocol(protocol);
    }

    let secret = overrides.secret.clone().or(identity.secret).ok_or_else(|| {
        RunError::invalid_input("shared secret is required (profile `identity.secret` or --secret)")
    })?;
    let identities = match identity.mode {
        IdentityMode::Derived => IdentityProvider::derived(identity.prefix, identity.width, secret),
        IdentityMode::Pool => {
            let sampling = match identity.sampling.as_deref() {
                None => PoolSampling::default(),
                Some(raw) => PoolSampling::from_str(raw).map_err(|_| {
                    RunError::invalid_input(format!(
                        "unknown identity sampling `{raw}` (expected round-robin or random)"
                    ))
                })?,
            };
            IdentityProvider::pool(identity.ids, sampling, secret)
        }
    }
    .map_err(cpsim_core::Error::from)?;

    let ramp_down = match load.ramp_down.as_deref() {
        None => RampDown::default(),
        Some(raw) => RampDown::from_str(raw).map_err(|_| {
            RunError::invalid_input(format!(
                "unknown rampDown `{raw}` (expected graceful or immediate)"
            ))
        })?,
    };
    let stages = load
        .stages
        .into_iter()
        .map(|s| Stage {
            duration: s.duration.into_inner(),
            target: s.target,
        })
        .collect();
    let load_profile = LoadProfile::new(load.start_clients, stages, ramp_down)?;

    let options = RunOptions {
        hard_deadline: overrides
            .max_duration
            .or(load.max_duration.map(YamlDuration::into_inner)),
        max_sessions: overrides.max_sessions.or(load.max_sessions),
        ..RunOptions::default()
    };
    options.validate()?;

    let script = build_script(session.script)?;

    Ok(ResolvedProfile {
        load: load_profile,
        options,
        settings,
        identities,
        script,
        connect_timeout: target.connect_timeout.map(YamlDuration::into_inner),
    })
}

fn build_script(script: ScriptYaml) -> Result<SessionScript, RunError> {
    let Some(steps) = script.steps else {
        return build_template(script);
    };

    if script.template.is_some() {
        return Err(RunError::invalid_input(
            "session.script: `template` and `steps` are mutually exclusive",
        ));
    }

    let mut builder = ScriptBuilder::starting_at(script.first_call_id.unwrap_or(1));
    for (idx, step) in steps.into_iter().enumerate() {
        let delay = step.delay.into_inner();
        if step.close {
            if step.action.is_some() || step.payload.is_some() || step.raw.is_some() {
                return Err(RunError::invalid_input(format!(
                    "session.script.steps[{idx}]: a close step takes only `delay`"
                )));
            }
            builder = builder.close_after(delay);
            continue;
        }

        let payload = match (step.payload, step.raw) {
            (Some(_), Some(_)) => {
                return Err(RunError::invalid_input(format!(
                    "session.script.steps[{idx}]: `payload` and `raw` are mutually exclusive"
                )));
            }
            (Some(value), None) => Payload::Json(value),
            (None, Some(raw)) => Payload::Raw(raw),
            (None, None) => Payload::Json(serde_json::json!({})),
        };

        let action = step.action.unwrap_or_default();
        builder = match step.call_id {
            Some(id) => builder.call_with_id(id, delay, action, payload),
            None => builder.call_after(delay, action, payload),
        };
    }

    builder.build().map_err(|e| cpsim_core::Error::from(e).into())
}

fn build_template(script: ScriptYaml) -> Result<SessionScript, RunError> {
    let name = script
        .template
        .as_deref()
        .unwrap_or(CHARGING_SESSION_TEMPLATE);
    if name != CHARGING_SESSION_TEMPLATE {
        return Err(RunError::invalid_input(format!(
            "unknown script template `{name}` (expected {CHARGING_SESSION_TEMPLATE})"
        )));
    }

    let defaults = ChargingSessionTemplate::default();
    let template = ChargingSessionTemplate {
        first_call_id: script.first_call_id.unwrap_or(defaults.first_call_id),
        timings: script.timings.into(),
        id_tag: script.id_tag.unwrap_or(defaults.id_tag),
        connector_id: script.connector_id.unwrap_or(defaults.connector_id),
        malformed_authorize: script.malformed_authorize,
        issued_at: defaults.issued_at,
    };

    template
        .build()
        .map_err(|e| cpsim_core::Error::from(e).into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::exit_codes::ExitCode;
    use cpsim_core::Step;
    use std::path::PathBuf;

    fn fixture_path(name: &str) -> PathBuf {
        PathBuf::from(env!("CARGO_MANIFEST_DIR"))
            .join("tests")
            .join("fixtures")
            .join("profile_yaml")
            .join(name)
    }

    async fn resolve_fixture(name: &str) -> Result<ResolvedProfile, RunError> {
        let doc = load_profile(&fixture_path(name)).await?;
        resolve(doc, &ProfileOverrides::default())
    }

    #[tokio::test]
    async fn loads_template_profile() {
        let resolved = resolve_fixture("basic.yaml")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(resolved.load.start_clients, 3);
        assert_eq!(resolved.load.stages.len(), 1);
        assert_eq!(resolved.load.ramp_down, RampDown::Graceful);
        assert_eq!(resolved.options.max_sessions, Some(3));
        assert_eq!(resolved.script.len(), 11);
        assert_eq!(resolved.settings.subprotocol, "ocpp1.6");
        assert_eq!(
            resolved.identities.identity_for(7).charge_point_id,
            "cs007"
        );
    }

    #[tokio::test]
    async fn loads_pool_profile_with_custom_steps() {
        let resolved = resolve_fixture("pool.yaml")
            .await
            .unwrap_or_else(|e| panic!("{e}"));

        assert_eq!(resolved.load.ramp_down, RampDown::Immediate);
        assert_eq!(resolved.settings.subprotocol, "ocpp2.0.1");
        assert_eq!(resolved.settings.session_timeout, Some(Duration::from_secs(60)));
        assert_eq!(resolved.options.hard_deadline, Some(Duration::from_secs(120)));
        assert_eq!(resolved.connect_timeout, Some(Duration::from_secs(5)));

        assert_eq!(resolved.identities.identity_for(1).charge_point_id, "cs001");
        assert_eq!(resolved.identities.identity_for(2).charge_point_id, "cs002");
        assert_eq!(resolved.identities.identity_for(3).charge_point_id, "cs001");

        let steps = resolved.script.steps();
        assert_eq!(steps.len(), 3);
        match &steps[0] {
            Step::Send(call) => {
                assert_eq!(call.call_id, "100");
                assert_eq!(call.action, "BootNotification");
            }
            Step::Close { .. } => panic!("expected a call"),
        }
        match &steps[1] {
            Step::Send(call) => {
                assert_eq!(call.call_id, "hb-1");
                assert_eq!(call.delay_before, Duration::from_millis(500));
                assert_eq!(call.encode(), r#"[2,"hb-1","Heartbeat",{}]"#);
            }
            Step::Close { .. } => panic!("expected a call"),
        }
        assert!(matches!(steps[2], Step::Close { .. }));
    }

    #[tokio::test]
    async fn duplicate_call_ids_are_script_errors() {
        let err = match resolve_fixture("duplicate_ids.yaml").await {
            Ok(_) => panic!("expected a script error"),
            Err(err) => err,
        };
        assert_eq!(err.exit_code(), ExitCode::ScriptError);
        assert!(err.to_string().contains("already used"), "{err}");
    }

    #[tokio::test]
    async fn empty_stages_are_invalid_input() {
        let err = match resolve_fixture("invalid_stages.yaml").await {
            Ok(_) => panic!("expected invalid input"),
            Err(err) => err,
        };
        assert_eq!(err.exit_code(), ExitCode::InvalidInput);
    }

    #[tokio::test]
    async fn missing_profile_is_invalid_input() {
        let err = match load_profile(&fixture_path("does_not_exist.yaml")).await {
            Ok(_) => panic!("expected a read error"),
            Err(err) => err,
        };
        assert_eq!(err.exit_code(), ExitCode::InvalidInput);
        assert!(err.to_string().contains("failed to read profile"));
    }

    #[test]
    fn overrides_take_precedence_over_the_profile() {
        let doc: ProfileYaml = serde_yaml::from_str(
            r#"
target:
  url: ws://profile.test/ws
identity:
  secret: from-profile
load:
  stages:
    - duration: 10s
      target: 5
  maxSessions: 50
"#,
        )
        .unwrap_or_else(|e| panic!("{e:#}"));

        let overrides = ProfileOverrides {
            url: Some("ws://cli.test/ocpp".to_string()),
            secret: Some("from-cli".to_string()),
            protocol: Some("ocpp2.0.1".to_string()),
            session_timeout: Some(Duration::from_secs(30)),
            max_duration: Some(Duration::from_secs(90)),
            max_sessions: Some(7),
        };

        let resolved = resolve(doc, &overrides).unwrap_or_else(|e| panic!("{e}"));
        assert_eq!(resolved.settings.url_for("cs001"), "ws://cli.test/ocpp/cs001");
        assert_eq!(resolved.settings.subprotocol, "ocpp2.0.1");
        assert_eq!(resolved.settings.session_timeout, Some(Duration::from_secs(30)));
        assert_eq!(resolved.options.hard_deadline, Some(Duration::from_secs(90)));
        assert_eq!(resolved.options.max_sessions, Some(7));
        assert_eq!(
            resolved.identities.identity_for(1).authorization_header(),
            format!(
                "Basic {}",
                cpsim_core::encode_credential("cs001", "from-cli")
            )
        );
    }

    #[test]
    fn missing_url_and_secret_are_invalid_input() {
        let doc: ProfileYaml = serde_yaml::from_str(
            r#"
load:
  stages:
    - { duration: 1s, target: 1 }
"#,
        )
        .unwrap_or_else(|e| panic!("{e:#}"));

        let err = match resolve(doc.clone(), &ProfileOverrides::default()) {
            Ok(_) => panic!("expected a missing url error"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("--url"), "{err}");

        let overrides = ProfileOverrides {
            url: Some("ws://x.test/ws".to_string()),
            ..ProfileOverrides::default()
        };
        let err = match resolve(doc, &overrides) {
            Ok(_) => panic!("expected a missing secret error"),
            Err(err) => err,
        };
        assert_eq!(err.exit_code(), ExitCode::InvalidInput);
        assert!(err.to_string().contains("--secret"), "{err}");
    }

    #[test]
    fn unknown_template_and_mixed_payloads_are_rejected() {
        let script: ScriptYaml = serde_yaml::from_str("template: firmware-update\n")
            .unwrap_or_else(|e| panic!("{e:#}"));
        assert!(build_script(script).is_err());

        let script: ScriptYaml = serde_yaml::from_str(
            r#"
steps:
  - action: Heartbeat
    payload: {}
    raw: "{}"
"#,
        )
        .unwrap_or_else(|e| panic!("{e:#}"));
        let err = match build_script(script) {
            Ok(_) => panic!("expected mutually exclusive payload error"),
            Err(err) => err,
        };
        assert!(err.to_string().contains("mutually exclusive"), "{err}");
    }

    #[test]
    fn steps_after_close_are_script_errors() {
        let script: ScriptYaml = serde_yaml::from_str(
            r#"
steps:
  - close: true
  - action: Heartbeat
"#,
        )
        .unwrap_or_else(|e| panic!("{e:#}"));

        let err = match build_script(script) {
            Ok(_) => panic!("expected a script error"),
            Err(err) => err,
        };
        assert_eq!(err.exit_code(), ExitCode::ScriptError);
    }

    #[test]
    fn durations_accept_strings_and_numbers() {
        let t: TimingsYaml = serde_yaml::from_str(
            r#"
afterBoot: 2s
heartbeatInterval: 1
meterInterval: 0.5
"#,
        )
        .unwrap_or_else(|e| panic!("{e:#}"));

        let t = SessionTimings::from(t);
        assert_eq!(t.after_boot, Duration::from_secs(2));
        assert_eq!(t.heartbeat_interval, Duration::from_secs(1));
        assert_eq!(t.meter_interval, Duration::from_millis(500));
        assert_eq!(t.before_close, Duration::ZERO);

        let too_large = serde_yaml::from_str::<TimingsYaml>("meterInterval: 1e30");
        assert!(too_large.is_err(), "{too_large:?}");
        assert!(serde_yaml::from_str::<TimingsYaml>("meterInterval: -1.5").is_err());
    }
}
