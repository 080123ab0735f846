use std::collections::HashSet;
use std::time::{Duration, SystemTime};

use serde_json::{Value, json};

use crate::error::ScriptError;

/// Message type id of an OCPP-J request frame.
pub const CALL_MESSAGE_TYPE: u8 = 2;

#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Json(Value),

    /// Pre-serialized text spliced into the frame as-is, even when it is not valid JSON.
    Raw(String),
}

impl Payload {
    pub fn raw(text: impl Into<String>) -> Self {
        Self::Raw(text.into())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Call {
    pub call_id: String,
    pub action: String,
    pub payload: Payload,
    pub delay_before: Duration,
}

impl Call {
    /// Renders the `[2, callId, action, payload]` text frame.
    pub fn encode(&self) -> String {
        let id = Value::from(self.call_id.as_str());
        let action = Value::from(self.action.as_str());
        match &self.payload {
            Payload::Json(v) => format!("[{CALL_MESSAGE_TYPE},{id},{action},{v}]"),
            Payload::Raw(raw) => format!("[{CALL_MESSAGE_TYPE},{id},{action},{raw}]"),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Step {
    Send(Call),
    Close { delay_before: Duration },
}

impl Step {
    pub fn delay_before(&self) -> Duration {
        match self {
            Self::Send(call) => call.delay_before,
            Self::Close { delay_before } => *delay_before,
        }
    }
}

/// Validated, immutable step sequence for one charge-point lifecycle.
#[derive(Debug, Clone)]
pub struct SessionScript {
    steps: Vec<Step>,
}

impl SessionScript {
    pub fn new(steps: Vec<Step>) -> Result<Self, ScriptError> {
        if steps.is_empty() {
            return Err(ScriptError::Empty);
        }

        let mut seen: HashSet<&str> = HashSet::with_capacity(steps.len());
        let mut closed = false;
        for (index, step) in steps.iter().enumerate() {
            if closed {
                return Err(ScriptError::StepAfterClose { index });
            }

            match step {
                Step::Send(call) => {
                    if call.action.trim().is_empty() {
                        return Err(ScriptError::EmptyAction { index });
                    }
                    if call.call_id.is_empty() {
                        return Err(ScriptError::EmptyCallId { index });
                    }
                    if !seen.insert(call.call_id.as_str()) {
                        return Err(ScriptError::DuplicateCallId {
                            index,
                            call_id: call.call_id.clone(),
                        });
                    }
                }
                Step::Close { .. } => closed = true,
            }
        }

        Ok(Self { steps })
    }

    pub fn builder() -> ScriptBuilder {
        ScriptBuilder::default()
    }

    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn calls(&self) -> impl Iterator<Item = &Call> {
        self.steps.iter().filter_map(|s| match s {
            Step::Send(call) => Some(call),
            Step::Close { .. } => None,
        })
    }

    /// Sum of every step delay; the minimum wall time one session needs.
    pub fn paced_duration(&self) -> Duration {
        self.steps
            .iter()
            .fold(Duration::ZERO, |acc, s| acc.saturating_add(s.delay_before()))
    }
}

/// Assigns increasing numeric call ids to calls that do not carry an explicit one.
#[derive(Debug, Clone)]
pub struct ScriptBuilder {
    next_id: u64,
    steps: Vec<Step>,
}

impl Default for ScriptBuilder {
    fn default() -> Self {
        Self::starting_at(1)
    }
}

impl ScriptBuilder {
    pub fn starting_at(first_call_id: u64) -> Self {
        Self {
            next_id: first_call_id,
            steps: Vec::new(),
        }
    }

    #[must_use]
    pub fn call(self, action: impl Into<String>, payload: impl Into<Payload>) -> Self {
        self.call_after(Duration::ZERO, action, payload)
    }

    #[must_use]
    pub fn call_after(
        mut self,
        delay_before: Duration,
        action: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        let call_id = self.next_id.to_string();
        self.next_id = self.next_id.saturating_add(1);
        self.push_call(call_id, delay_before, action.into(), payload.into());
        self
    }

    /// Adds a call with a caller-chosen id. The id is kept verbatim and does not
    /// advance the automatic counter.
    #[must_use]
    pub fn call_with_id(
        mut self,
        call_id: impl Into<String>,
        delay_before: Duration,
        action: impl Into<String>,
        payload: impl Into<Payload>,
    ) -> Self {
        self.push_call(call_id.into(), delay_before, action.into(), payload.into());
        self
    }

    #[must_use]
    pub fn close_after(mut self, delay_before: Duration) -> Self {
        self.steps.push(Step::Close { delay_before });
        self
    }

    #[must_use]
    pub fn close(self) -> Self {
        self.close_after(Duration::ZERO)
    }

    pub fn build(self) -> Result<SessionScript, ScriptError> {
        SessionScript::new(self.steps)
    }

    fn push_call(
        &mut self,
        call_id: String,
        delay_before: Duration,
        action: String,
        payload: Payload,
    ) {
        self.steps.push(Step::Send(Call {
            call_id,
            action,
            payload,
            delay_before,
        }));
    }
}

/// Pauses between the steps of the charging-session template. All zero by default.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionTimings {
    pub after_boot: Duration,
    pub heartbeat_interval: Duration,
    pub before_authorize: Duration,
    pub before_start: Duration,
    pub meter_interval: Duration,
    pub before_stop: Duration,
    pub before_close: Duration,
}

pub const DEFAULT_ID_TAG: &str = "38748383L7337848H823";

/// Boot, idle heartbeats, authorize, a metered transaction, then disconnect.
#[derive(Debug, Clone)]
pub struct ChargingSessionTemplate {
    pub first_call_id: u64,
    pub timings: SessionTimings,
    pub id_tag: String,
    pub connector_id: u32,

    /// Send Authorize as an unbalanced nested frame to exercise server-side parsing.
    pub malformed_authorize: bool,

    /// Timestamp stamped into transaction and meter payloads.
    pub issued_at: SystemTime,
}

impl Default for ChargingSessionTemplate {
    fn default() -> Self {
        Self {
            first_call_id: 1,
            timings: SessionTimings::default(),
            id_tag: DEFAULT_ID_TAG.to_string(),
            connector_id: 1,
            malformed_authorize: false,
            issued_at: SystemTime::now(),
        }
    }
}

impl ChargingSessionTemplate {
    pub fn build(&self) -> Result<SessionScript, ScriptError> {
        let t = &self.timings;
        let ts = humantime::format_rfc3339_millis(self.issued_at).to_string();
        let id_tag = self.id_tag.as_str();
        let connector_id = self.connector_id;

        let authorize_id = self.first_call_id.saturating_add(5);
        let authorize: Payload = if self.malformed_authorize {
            Payload::raw(format!(
                r#"[2, "{}", "Authorize", {{"idTag": "{id_tag}"}}"#,
                authorize_id.saturating_add(2)
            ))
        } else {
            json!({ "idTag": id_tag }).into()
        };

        let meter_value = json!({
            "connectorId": connector_id,
            "meterValue": [{ "timestamp": ts, "sampledValue": [{ "value": "5" }] }],
        });

        ScriptBuilder::starting_at(self.first_call_id)
            .call(
                "BootNotification",
                json!({ "chargePointModel": "me100", "chargePointVendor": "me" }),
            )
            .call_after(
                t.after_boot,
                "StatusNotification",
                json!({ "connectorId": connector_id, "errorCode": "NoError", "status": "Available" }),
            )
            .call_after(t.heartbeat_interval, "Heartbeat", json!({}))
            .call_after(t.heartbeat_interval, "Heartbeat", json!({}))
            .call_after(t.heartbeat_interval, "Heartbeat", json!({}))
            .call_after(t.before_authorize, "Authorize", authorize)
            .call_after(
                t.before_start,
                "StartTransaction",
                json!({
                    "connectorId": connector_id,
                    "idTag": id_tag,
                    "meterStart": 3,
                    "reservationId": 5,
                    "timestamp": ts,
                }),
            )
            .call_after(t.meter_interval, "MeterValues", meter_value.clone())
            .call_after(t.meter_interval, "MeterValues", meter_value)
            .call_after(
                t.before_stop,
                "StopTransaction",
                json!({
                    "idTag": id_tag,
                    "meterStop": 3,
                    "timestamp": ts,
                    "transactionId": 3,
                }),
            )
            .close_after(t.before_close)
            .build()
    }
}
