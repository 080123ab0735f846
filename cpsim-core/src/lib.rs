#![forbid(unsafe_code)]

mod collector;
mod config;
mod connection;
mod error;
mod identity;
mod script;
mod session;

pub mod runner;

pub use collector::{ActiveSessionGuard, DurationSummary, OutcomeCollector, RunSummary};
pub use config::{DEFAULT_SUBPROTOCOL, LoadProfile, RampDown, RunOptions, SessionSettings, Stage};
pub use connection::{ConnectError, ConnectRequest, Connection, Connector, SendError};
pub use error::{Error, IdentityError, Result, ScriptError};
pub use identity::{Identity, IdentityProvider, PoolSampling, encode_credential};
pub use script::{
    CALL_MESSAGE_TYPE, Call, ChargingSessionTemplate, DEFAULT_ID_TAG, Payload, ScriptBuilder,
    SessionScript, SessionTimings, Step,
};
pub use session::{CallRecord, ErrorKind, SessionError, SessionOutcome, VirtualClientSession};
