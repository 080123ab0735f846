pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("invalid session script: {0}")]
    Script(#[from] ScriptError),

    #[error("invalid identity config: {0}")]
    Identity(#[from] IdentityError),

    #[error("`stages` must be a non-empty array of {{ duration, target }} with positive durations")]
    InvalidStages,

    #[error("`tick` must be a positive duration")]
    InvalidTick,

    #[error("`max_sessions` must be a positive integer")]
    InvalidMaxSessions,

    #[error("invalid target url: `{0}`")]
    InvalidUrl(String),
}

/// Script construction failures. These are fatal to a run: a script that fails
/// validation is never handed to a session.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScriptError {
    #[error("script has no steps")]
    Empty,

    #[error("step {index}: action must not be empty")]
    EmptyAction { index: usize },

    #[error("step {index}: call id must not be empty")]
    EmptyCallId { index: usize },

    #[error("step {index}: call id `{call_id}` is already used by an earlier step")]
    DuplicateCallId { index: usize, call_id: String },

    #[error("step {index}: no steps may follow a close step")]
    StepAfterClose { index: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdentityError {
    #[error("identity pool must contain at least one charge point id")]
    EmptyPool,

    #[error("identity pool entry {0} is empty")]
    EmptyPoolEntry(usize),

    #[error("derived identity width must be positive")]
    ZeroWidth,

    #[error("shared secret must not be empty")]
    EmptySecret,
}
