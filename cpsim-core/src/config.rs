use std::time::Duration;

use crate::error::{Error, Result};

/// Subprotocol tag sent by default when the profile does not name one.
pub const DEFAULT_SUBPROTOCOL: &str = "ocpp1.6";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
    pub duration: Duration,
    pub target: u64,
}

/// What happens to live sessions when the target concurrency drops below them.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, strum::Display, strum::EnumString,
)]
#[strum(serialize_all = "kebab-case")]
pub enum RampDown {
    /// Withhold new starts; excess sessions run their script to the end.
    #[default]
    Graceful,

    /// Cancel the most recently started excess sessions.
    Immediate,
}

#[derive(Debug, Clone)]
pub struct LoadProfile {
    pub start_clients: u64,
    pub stages: Vec<Stage>,
    pub ramp_down: RampDown,
}

impl LoadProfile {
    pub fn new(start_clients: u64, stages: Vec<Stage>, ramp_down: RampDown) -> Result<Self> {
        let profile = Self {
            start_clients,
            stages,
            ramp_down,
        };
        profile.validate()?;
        Ok(profile)
    }

    pub fn validate(&self) -> Result<()> {
        if self.stages.is_empty() || self.stages.iter().any(|st| st.duration.is_zero()) {
            return Err(Error::InvalidStages);
        }
        Ok(())
    }

    pub fn total_duration(&self) -> Duration {
        self.stages
            .iter()
            .fold(Duration::ZERO, |acc, st| acc.saturating_add(st.duration))
    }

    /// Highest concurrency the profile ever asks for.
    pub fn peak_target(&self) -> u64 {
        self.stages
            .iter()
            .map(|st| st.target)
            .max()
            .unwrap_or(0)
            .max(self.start_clients)
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    /// How often the scheduler re-evaluates the target concurrency.
    pub tick: Duration,

    /// Cancels every live session once this much time has passed since the run started.
    pub hard_deadline: Option<Duration>,

    /// Upper bound on client indices handed out over the whole run. Once spent, the
    /// scheduler stops starting sessions even when live count is below target.
    pub max_sessions: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(50),
            hard_deadline: None,
            max_sessions: None,
        }
    }
}

impl RunOptions {
    pub fn validate(&self) -> Result<()> {
        if self.tick.is_zero() {
            return Err(Error::InvalidTick);
        }
        if self.max_sessions == Some(0) {
            return Err(Error::InvalidMaxSessions);
        }
        Ok(())
    }
}

/// Per-session connection settings shared by every virtual client of a run.
#[derive(Debug, Clone)]
pub struct SessionSettings {
    /// Endpoint prefix; the charge point id is appended as the last path segment.
    pub base_url: String,
    pub subprotocol: String,

    /// Upper bound for connect plus the whole script.
    pub session_timeout: Option<Duration>,

    endpoint: url::Url,
}

impl SessionSettings {
    pub fn new(base_url: impl Into<String>) -> Result<Self> {
        let base_url = base_url.into();
        let parsed = url::Url::parse(&base_url).map_err(|_| Error::InvalidUrl(base_url.clone()))?;
        if (parsed.scheme() != "ws" && parsed.scheme() != "wss") || parsed.cannot_be_a_base() {
            return Err(Error::InvalidUrl(base_url));
        }

        Ok(Self {
            base_url,
            subprotocol: DEFAULT_SUBPROTOCOL.to_string(),
            session_timeout: None,
            endpoint: parsed,
        })
    }

    #[must_use]
    pub fn with_subprotocol(mut self, subprotocol: impl Into<String>) -> Self {
        self.subprotocol = subprotocol.into();
        self
    }

    #[must_use]
    pub fn with_session_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.session_timeout = timeout;
        self
    }

    /// Endpoint with the charge point id appended as one percent-encoded path segment.
    pub fn url_for(&self, charge_point_id: &str) -> String {
        let mut url = self.endpoint.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments.pop_if_empty().push(charge_point_id);
        }
        url.into()
    }
}
